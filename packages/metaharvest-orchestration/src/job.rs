//! Job model.
//!
//! A job is one persisted unit of distributed work. Its output location is
//! derived once at creation from the storage root and the owning hierarchy
//! and never recomputed; its status follows the remote statement it was
//! submitted as.

use crate::client::{Remote, StatementBody};
use crate::config::{file_scheme_path, FILE_SCHEME};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Harvest,
    Transform,
    Merge,
    Publish,
    Analysis,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Harvest => "harvest",
            JobType::Transform => "transform",
            JobType::Merge => "merge",
            JobType::Publish => "publish",
            JobType::Analysis => "analysis",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "harvest" => Ok(JobType::Harvest),
            "transform" => Ok(JobType::Transform),
            "merge" => Ok(JobType::Merge),
            "publish" => Ok(JobType::Publish),
            "analysis" => Ok(JobType::Analysis),
            _ => Err(PipelineError::parse(format!("invalid job type: {s}"))),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initializing,
    Waiting,
    Running,
    Available,
    Error,
    Gone,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Available => "available",
            JobStatus::Error => "error",
            JobStatus::Gone => "gone",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(JobStatus::Initializing),
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "available" => Ok(JobStatus::Available),
            "error" => Ok(JobStatus::Error),
            "gone" => Ok(JobStatus::Gone),
            _ => Err(PipelineError::parse(format!("invalid job status: {s}"))),
        }
    }

    /// Map a raw remote statement state. The named states pass through
    /// verbatim; cancelled and unknown states fold into `Error`. `Gone` only
    /// ever comes from the 400/404 mapping.
    pub fn from_remote(state: &str) -> Self {
        match state {
            "waiting" => JobStatus::Waiting,
            "running" => JobStatus::Running,
            "available" => JobStatus::Available,
            _ => JobStatus::Error,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The owning hierarchy a job is filed under. Organizations and record
/// groups live outside this control plane; only their identifiers (and the
/// group's publish-set id, needed at publish/cleanup time) travel with the
/// job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGroupRef {
    pub organization_id: i64,
    pub record_group_id: i64,
    pub publish_set_id: String,
}

impl RecordGroupRef {
    pub fn new(organization_id: i64, record_group_id: i64, publish_set_id: impl Into<String>) -> Self {
        Self {
            organization_id,
            record_group_id,
            publish_set_id: publish_set_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub record_group: RecordGroupRef,
    pub job_type: JobType,
    pub name: String,
    pub status: JobStatus,
    pub finished: bool,
    /// Remote statement id, set at submission.
    pub statement_id: Option<i64>,
    /// Absolute URL the statement is polled at.
    pub statement_url: Option<String>,
    /// The code string submitted to the remote session.
    pub remote_code: Option<String>,
    /// `scheme://path` prefix all of this job's output lives under. Fixed at
    /// creation.
    pub output_location: String,
    pub record_count: i64,
    /// Job-type-specific payload (which transformation was applied, which
    /// jobs were merged, ...).
    pub job_details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Derive the canonical output location. Fully determined by the storage
    /// root, owning hierarchy, job type, and job id.
    pub fn derive_output_location(
        storage_root: &str,
        record_group: &RecordGroupRef,
        job_type: JobType,
        job_id: i64,
    ) -> String {
        format!(
            "{}/organizations/{}/record_group/{}/jobs/{}/{}",
            storage_root.trim_end_matches('/'),
            record_group.organization_id,
            record_group.record_group_id,
            job_type.as_str(),
            job_id
        )
    }

    /// Location the remote indexing step writes mapping results under.
    pub fn index_results_location(
        storage_root: &str,
        record_group: &RecordGroupRef,
        job_id: i64,
    ) -> String {
        format!(
            "{}/organizations/{}/record_group/{}/jobs/indexing/{}",
            storage_root.trim_end_matches('/'),
            record_group.organization_id,
            record_group.record_group_id,
            job_id
        )
    }

    pub fn default_name(job_type: JobType) -> String {
        format!("{} @ {}", job_type.as_str(), Utc::now().to_rfc3339())
    }

    /// Output location as a filesystem path, when it uses the local scheme.
    pub fn output_as_filesystem(&self) -> Option<PathBuf> {
        file_scheme_path(&self.output_location)
    }

    pub fn is_local_output(&self) -> bool {
        self.output_location.starts_with(FILE_SCHEME)
    }

    /// Full paths of the part files in this job's output directory.
    pub fn output_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let Some(dir) = self.output_as_filesystem() else {
            return Ok(Vec::new());
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "avro"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// The hash component shared by this job's output part filenames
    /// (`part-r-{n}-{hash}.avro`). Published symlinks embed the same hash,
    /// which is how cleanup finds them.
    pub fn output_filename_hash(&self) -> Option<String> {
        let files = self.output_files().ok()?;
        files.iter().find_map(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(part_file_hash)
                .map(str::to_string)
        })
    }

    /// Fold a remote statement lookup into local state. A vanished statement
    /// (400/404 remotely) is `gone`, not an error, so operators resubmit rather
    /// than debug. `finished` is left untouched.
    pub fn apply_statement_status(&mut self, outcome: &Remote<StatementBody>) {
        match outcome {
            Remote::NotFound => {
                self.status = JobStatus::Gone;
            }
            Remote::Found(body) => {
                self.status = JobStatus::from_remote(&body.state);
                if self.status == JobStatus::Available {
                    self.finished = true;
                }
            }
        }
    }
}

/// Extract the hash from a `part-r-{n}-{hash}.avro` filename.
fn part_file_hash(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("part-r-")?;
    let rest = rest.strip_suffix(".avro")?;
    let (digits, hash) = rest.split_once('-')?;
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) && !hash.is_empty() {
        Some(hash)
    } else {
        None
    }
}
