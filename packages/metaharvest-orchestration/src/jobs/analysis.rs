//! Analysis jobs: ad-hoc transform- or merge-shaped work over arbitrary
//! upstream jobs.
//!
//! Analysis jobs do not belong to any user-created hierarchy. They are filed
//! under the reserved synthetic organization/record-group from the process
//! configuration, so they behave like every other job without forcing users
//! to create a place for them.

use super::{render_location_list, submit_to_session, JobContext, PipelineJob};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobType, RecordGroupRef};
use crate::record::Record;
use crate::store::NewJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The shape of work an analysis job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Apply a transformation to one upstream job.
    Transform {
        input_job_id: i64,
        transformation_id: i64,
    },
    /// Merge the output of one or more upstream jobs.
    Merge { input_job_ids: Vec<i64> },
}

impl AnalysisKind {
    fn input_job_ids(&self) -> Vec<i64> {
        match self {
            AnalysisKind::Transform { input_job_id, .. } => vec![*input_job_id],
            AnalysisKind::Merge { input_job_ids } => input_job_ids.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AnalysisDetails {
    #[serde(flatten)]
    analysis: AnalysisKind,
    index_mapper: String,
}

#[derive(Debug)]
pub struct AnalysisJob {
    job: Job,
}

impl AnalysisJob {
    /// Persist a new analysis job under the reserved hierarchy.
    pub async fn create(
        ctx: &JobContext,
        name: Option<String>,
        kind: AnalysisKind,
        index_mapper: &str,
    ) -> Result<Self> {
        let input_job_ids = kind.input_job_ids();
        if input_job_ids.is_empty() {
            return Err(PipelineError::DependencyMissing {
                job_type: "analysis",
                expected: "at least 1",
                actual: 0,
            });
        }
        if let AnalysisKind::Transform {
            transformation_id, ..
        } = &kind
        {
            ctx.store
                .get_transformation(*transformation_id)
                .await?
                .ok_or_else(|| PipelineError::ArtifactNotFound(transformation_id.to_string()))?;
        }

        let record_group = RecordGroupRef::new(
            ctx.config.analysis.organization_id,
            ctx.config.analysis.record_group_id,
            "",
        );
        let details = AnalysisDetails {
            analysis: kind,
            index_mapper: index_mapper.to_string(),
        };

        let job = ctx
            .store
            .create_job(
                NewJob {
                    record_group,
                    job_type: JobType::Analysis,
                    name: name.unwrap_or_else(|| Job::default_name(JobType::Analysis)),
                    job_details: serde_json::json!({ "analysis": details }),
                },
                &input_job_ids,
                false,
                &ctx.config.storage_root,
            )
            .await?;
        Ok(Self { job })
    }

    pub async fn load(ctx: &JobContext, job_id: i64) -> Result<Self> {
        let job = ctx.store.get_job(job_id).await?;
        if job.job_type != JobType::Analysis {
            return Err(PipelineError::Parse(format!(
                "job {job_id} is a {} job, not analysis",
                job.job_type
            )));
        }
        Ok(Self { job })
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    fn details(&self) -> Result<AnalysisDetails> {
        Ok(serde_json::from_value(
            self.job.job_details["analysis"].clone(),
        )?)
    }
}

#[async_trait]
impl PipelineJob for AnalysisJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()> {
        let details = self.details()?;

        let code = match &details.analysis {
            AnalysisKind::Transform {
                input_job_id,
                transformation_id,
            } => {
                let transformation = ctx
                    .store
                    .get_transformation(*transformation_id)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::ArtifactNotFound(transformation_id.to_string())
                    })?;
                let filepath = transformation.filepath.ok_or_else(|| {
                    PipelineError::ArtifactNotFound(format!(
                        "transformation {} has not been written to disk",
                        transformation.name
                    ))
                })?;
                let input_job = ctx.store.get_job(*input_job_id).await?;

                format!(
                    "from jobs import TransformSpark\n\
                     TransformSpark.spark_function(spark, transform_filepath=\"{}\", \
                     job_input=\"{}\", job_id=\"{}\", index_mapper=\"{}\")",
                    filepath, input_job.output_location, self.job.id, details.index_mapper,
                )
            }
            AnalysisKind::Merge { input_job_ids } => {
                let mut locations = Vec::new();
                for input_id in input_job_ids {
                    locations.push(ctx.store.get_job(*input_id).await?.output_location);
                }

                format!(
                    "from jobs import MergeSpark\n\
                     MergeSpark.spark_function(spark, sc, job_inputs={}, job_id=\"{}\", \
                     index_mapper=\"{}\")",
                    render_location_list(&locations),
                    self.job.id,
                    details.index_mapper,
                )
            }
        };

        submit_to_session(ctx, &mut self.job, code).await
    }

    async fn job_errors(&self, ctx: &JobContext) -> Result<Vec<Record>> {
        ctx.store.error_records(self.job.id).await
    }
}
