//! Publish jobs: designate one upstream job's output as the record group's
//! canonical published set.

use super::{submit_to_session, JobContext, PipelineJob};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobType, RecordGroupRef};
use crate::store::NewJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct PublishDetails {
    publish_job_id: i64,
    index_mapper: String,
}

#[derive(Debug)]
pub struct PublishJob {
    job: Job,
}

impl PublishJob {
    /// Persist a new publish job over exactly one upstream job. The publish
    /// link to the owning record group is written in the same transaction as
    /// the job row and its edge.
    pub async fn create(
        ctx: &JobContext,
        record_group: RecordGroupRef,
        name: Option<String>,
        input_job_ids: &[i64],
        index_mapper: &str,
    ) -> Result<Self> {
        if input_job_ids.len() != 1 {
            return Err(PipelineError::DependencyMissing {
                job_type: "publish",
                expected: "exactly 1",
                actual: input_job_ids.len(),
            });
        }

        let details = PublishDetails {
            publish_job_id: input_job_ids[0],
            index_mapper: index_mapper.to_string(),
        };

        let job = ctx
            .store
            .create_job(
                NewJob {
                    record_group,
                    job_type: JobType::Publish,
                    name: name.unwrap_or_else(|| Job::default_name(JobType::Publish)),
                    job_details: serde_json::json!({ "publish": details }),
                },
                input_job_ids,
                true,
                &ctx.config.storage_root,
            )
            .await?;
        Ok(Self { job })
    }

    pub async fn load(ctx: &JobContext, job_id: i64) -> Result<Self> {
        let job = ctx.store.get_job(job_id).await?;
        if job.job_type != JobType::Publish {
            return Err(PipelineError::Parse(format!(
                "job {job_id} is a {} job, not publish",
                job.job_type
            )));
        }
        Ok(Self { job })
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    fn details(&self) -> Result<PublishDetails> {
        Ok(serde_json::from_value(
            self.job.job_details["publish"].clone(),
        )?)
    }
}

#[async_trait]
impl PipelineJob for PublishJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()> {
        let details = self.details()?;
        let input_job = ctx.store.get_job(details.publish_job_id).await?;

        let code = format!(
            "from jobs import PublishSpark\n\
             PublishSpark.spark_function(spark, job_input=\"{}\", job_id=\"{}\", \
             index_mapper=\"{}\")",
            input_job.output_location, self.job.id, details.index_mapper,
        );

        submit_to_session(ctx, &mut self.job, code).await
    }
}
