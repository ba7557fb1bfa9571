//! Cascading cleanup on job deletion.
//!
//! A deleted job leaves side effects in four places: the remote session, the
//! search index, the published symlink directory, and the storage root. Each
//! reclamation step is independently caught: one failing step never aborts
//! the rest, and row deletion always proceeds. Running cleanup twice is a
//! no-op: absence of a target is success.

use crate::client::ComputeSessionClient;
use crate::config::{file_scheme_path, Config};
use crate::error::Result;
use crate::job::{Job, JobStatus, JobType};
use crate::search::{SearchIndexClient, PUBLISHED_INDEX};
use crate::store::MetadataStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    CancelStatement,
    PublishedArtifacts,
    JobIndex,
    OutputFiles,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::CancelStatement => "cancel_statement",
            CleanupStep::PublishedArtifacts => "published_artifacts",
            CleanupStep::JobIndex => "job_index",
            CleanupStep::OutputFiles => "output_files",
        }
    }
}

/// What a cleanup run accomplished. Step failures are data, not errors -
/// they are logged and reported, and never block the job row's deletion.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<(CleanupStep, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: CleanupStep, error: impl std::fmt::Display) {
        warn!(step = step.as_str(), %error, "cleanup step failed");
        self.failures.push((step, error.to_string()));
    }
}

pub struct CleanupCoordinator {
    store: Arc<MetadataStore>,
    client: Arc<ComputeSessionClient>,
    search: Arc<SearchIndexClient>,
    config: Arc<Config>,
}

impl CleanupCoordinator {
    pub fn new(
        store: Arc<MetadataStore>,
        client: Arc<ComputeSessionClient>,
        search: Arc<SearchIndexClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            client,
            search,
            config,
        }
    }

    /// Reclaim all of the job's side effects, best-effort.
    pub async fn run(&self, job: &Job) -> CleanupReport {
        info!(job_id = job.id, job_type = %job.job_type, "reclaiming job side effects");
        let mut report = CleanupReport::default();

        if let Err(e) = self.cancel_remote(job).await {
            report.record(CleanupStep::CancelStatement, e);
        }

        if job.job_type == JobType::Publish {
            if let Err(e) = self.reclaim_published(job).await {
                report.record(CleanupStep::PublishedArtifacts, e);
            }
        }

        if let Err(e) = self.search.delete_job_index(job).await {
            report.record(CleanupStep::JobIndex, e);
        }

        if let Err(e) = self.remove_output_trees(job) {
            report.record(CleanupStep::OutputFiles, e);
        }

        report
    }

    /// Run cleanup, then remove the job row. The row goes away regardless of
    /// which cleanup steps succeeded.
    pub async fn delete_job(&self, job_id: i64) -> Result<CleanupReport> {
        let job = self.store.get_job(job_id).await?;
        let report = self.run(&job).await;
        self.store.delete_job(job_id).await?;
        info!(job_id, clean = report.is_clean(), "job deleted");
        Ok(report)
    }

    /// Step 1: if the statement still looks queued or running remotely,
    /// cancel it.
    async fn cancel_remote(&self, job: &Job) -> Result<()> {
        let Some(url) = job.statement_url.as_deref() else {
            return Ok(());
        };

        let outcome = self.client.statement_status(url).await?;
        let mut probe = job.clone();
        probe.apply_statement_status(&outcome);
        // record what we learned; the row may outlive this run
        self.store
            .update_job_status(probe.id, probe.status, probe.finished)
            .await?;

        if matches!(probe.status, JobStatus::Waiting | JobStatus::Running) {
            info!(job_id = job.id, "cancelling remote statement");
            self.client.cancel_statement(url).await?;
        }
        Ok(())
    }

    /// Step 2 (publish jobs only): remove published symlinks carrying this
    /// job's output filename hash, and purge the group's publish set from
    /// the published index when that index exists.
    async fn reclaim_published(&self, job: &Job) -> Result<()> {
        if let Some(published_dir) = self.config.published_dir() {
            if let Some(hash) = job.output_filename_hash() {
                remove_links_containing(&published_dir, &hash)?;
            } else {
                debug!(job_id = job.id, "no output part files, skipping symlink removal");
            }
        }

        if self.search.index_exists(PUBLISHED_INDEX).await? {
            self.search
                .delete_by_query(
                    PUBLISHED_INDEX,
                    "publish_set_id",
                    &job.record_group.publish_set_id,
                )
                .await?;
        } else {
            debug!("published index absent, skipping record removal");
        }
        Ok(())
    }

    /// Step 4: remove the local output tree and the indexing-results tree.
    fn remove_output_trees(&self, job: &Job) -> Result<()> {
        if let Some(output_dir) = job.output_as_filesystem() {
            remove_tree_if_present(&output_dir)?;
        }

        let indexing_location =
            Job::index_results_location(&self.config.storage_root, &job.record_group, job.id);
        if let Some(indexing_dir) = file_scheme_path(&indexing_location) {
            remove_tree_if_present(&indexing_dir)?;
        }
        Ok(())
    }
}

fn remove_tree_if_present(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        debug!(dir = %dir.display(), "removing output tree");
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Remove every entry in `dir` whose filename contains `needle`. A missing
/// directory means there is nothing to remove.
fn remove_links_containing(dir: &Path, needle: &str) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().contains(needle) {
            debug!(file = %entry.path().display(), "removing published artifact");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
