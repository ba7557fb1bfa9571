//! Transform jobs: apply a transformation artifact to one upstream job.

use super::{submit_to_session, JobContext, PipelineJob};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobType, RecordGroupRef};
use crate::record::Record;
use crate::store::NewJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct TransformDetails {
    transformation: ArtifactRef,
    index_mapper: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactRef {
    id: i64,
    name: String,
    kind: String,
}

#[derive(Debug)]
pub struct TransformJob {
    job: Job,
}

impl TransformJob {
    /// Persist a new transform job over exactly one upstream job. Input
    /// cardinality and the transformation reference are both validated
    /// before anything is written.
    pub async fn create(
        ctx: &JobContext,
        record_group: RecordGroupRef,
        name: Option<String>,
        input_job_ids: &[i64],
        transformation_id: i64,
        index_mapper: &str,
    ) -> Result<Self> {
        if input_job_ids.len() != 1 {
            return Err(PipelineError::DependencyMissing {
                job_type: "transform",
                expected: "exactly 1",
                actual: input_job_ids.len(),
            });
        }

        let transformation = ctx
            .store
            .get_transformation(transformation_id)
            .await?
            .ok_or_else(|| PipelineError::ArtifactNotFound(transformation_id.to_string()))?;

        let details = TransformDetails {
            transformation: ArtifactRef {
                id: transformation.id,
                name: transformation.name.clone(),
                kind: transformation.kind.as_str().to_string(),
            },
            index_mapper: index_mapper.to_string(),
        };

        let job = ctx
            .store
            .create_job(
                NewJob {
                    record_group,
                    job_type: JobType::Transform,
                    name: name.unwrap_or_else(|| Job::default_name(JobType::Transform)),
                    job_details: serde_json::to_value(&details)?,
                },
                input_job_ids,
                false,
                &ctx.config.storage_root,
            )
            .await?;
        Ok(Self { job })
    }

    pub async fn load(ctx: &JobContext, job_id: i64) -> Result<Self> {
        let job = ctx.store.get_job(job_id).await?;
        if job.job_type != JobType::Transform {
            return Err(PipelineError::Parse(format!(
                "job {job_id} is a {} job, not transform",
                job.job_type
            )));
        }
        Ok(Self { job })
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    fn details(&self) -> Result<TransformDetails> {
        Ok(serde_json::from_value(self.job.job_details.clone())?)
    }
}

#[async_trait]
impl PipelineJob for TransformJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()> {
        let details = self.details()?;

        let transformation = ctx
            .store
            .get_transformation(details.transformation.id)
            .await?
            .ok_or_else(|| {
                PipelineError::ArtifactNotFound(details.transformation.id.to_string())
            })?;
        let filepath = transformation.filepath.ok_or_else(|| {
            PipelineError::ArtifactNotFound(format!(
                "transformation {} has not been written to disk",
                transformation.name
            ))
        })?;

        let input_ids = ctx.store.input_job_ids(self.job.id).await?;
        let input_id = input_ids.first().copied().ok_or({
            PipelineError::DependencyMissing {
                job_type: "transform",
                expected: "exactly 1",
                actual: 0,
            }
        })?;
        let input_job = ctx.store.get_job(input_id).await?;

        let code = format!(
            "from jobs import TransformSpark\n\
             TransformSpark.spark_function(spark, transform_filepath=\"{}\", \
             job_input=\"{}\", job_id=\"{}\", index_mapper=\"{}\")",
            filepath, input_job.output_location, self.job.id, details.index_mapper,
        );

        submit_to_session(ctx, &mut self.job, code).await
    }

    async fn job_errors(&self, ctx: &JobContext) -> Result<Vec<Record>> {
        ctx.store.error_records(self.job.id).await
    }
}
