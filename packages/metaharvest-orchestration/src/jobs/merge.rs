//! Merge jobs: combine the output of one or more upstream jobs.

use super::{render_location_list, submit_to_session, JobContext, PipelineJob};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobType, RecordGroupRef};
use crate::record::Record;
use crate::store::NewJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct MergeDetails {
    input_job_ids: Vec<i64>,
    index_mapper: String,
}

#[derive(Debug)]
pub struct MergeJob {
    job: Job,
}

impl MergeJob {
    /// Persist a new merge job over one or more upstream jobs.
    pub async fn create(
        ctx: &JobContext,
        record_group: RecordGroupRef,
        name: Option<String>,
        input_job_ids: &[i64],
        index_mapper: &str,
    ) -> Result<Self> {
        if input_job_ids.is_empty() {
            return Err(PipelineError::DependencyMissing {
                job_type: "merge",
                expected: "at least 1",
                actual: 0,
            });
        }

        let details = MergeDetails {
            input_job_ids: input_job_ids.to_vec(),
            index_mapper: index_mapper.to_string(),
        };

        let job = ctx
            .store
            .create_job(
                NewJob {
                    record_group,
                    job_type: JobType::Merge,
                    name: name.unwrap_or_else(|| Job::default_name(JobType::Merge)),
                    job_details: serde_json::json!({ "merge": details }),
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
        if job.job_type != JobType::Merge {
            return Err(PipelineError::Parse(format!(
                "job {job_id} is a {} job, not merge",
                job.job_type
            )));
        }
        Ok(Self { job })
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    fn details(&self) -> Result<MergeDetails> {
        Ok(serde_json::from_value(
            self.job.job_details["merge"].clone(),
        )?)
    }
}

#[async_trait]
impl PipelineJob for MergeJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()> {
        let details = self.details()?;

        // upstream output locations, in edge order
        let mut locations = Vec::new();
        for input_id in ctx.store.input_job_ids(self.job.id).await? {
            locations.push(ctx.store.get_job(input_id).await?.output_location);
        }

        let code = format!(
            "from jobs import MergeSpark\n\
             MergeSpark.spark_function(spark, sc, job_inputs={}, job_id=\"{}\", \
             index_mapper=\"{}\")",
            render_location_list(&locations),
            self.job.id,
            details.index_mapper,
        );

        submit_to_session(ctx, &mut self.job, code).await
    }

    async fn job_errors(&self, ctx: &JobContext) -> Result<Vec<Record>> {
        ctx.store.error_records(self.job.id).await
    }
}
