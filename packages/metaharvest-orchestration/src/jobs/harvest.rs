//! Harvest jobs: the root nodes of every pipeline.
//!
//! A harvest pulls records from an OAI-PMH endpoint. Unlike every other
//! variant it takes no upstream job; its parameters are the endpoint
//! definition plus optional per-call overrides.

use super::{submit_to_session, JobContext, PipelineJob};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobType, RecordGroupRef};
use crate::store::NewJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An OAI-PMH harvest source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaiEndpoint {
    pub name: String,
    pub endpoint: String,
    /// OAI verb, e.g. `ListRecords`.
    pub verb: String,
    pub metadata_prefix: String,
    /// One of `setList`, `whiteList`, `blackList`.
    pub scope_type: String,
    pub scope_value: String,
}

/// Per-call overrides applied on top of a stored endpoint definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestOverrides {
    pub verb: Option<String>,
    pub metadata_prefix: Option<String>,
    pub scope_type: Option<String>,
    pub scope_value: Option<String>,
}

impl OaiEndpoint {
    pub fn with_overrides(&self, overrides: &HarvestOverrides) -> OaiEndpoint {
        let mut merged = self.clone();
        if let Some(verb) = &overrides.verb {
            merged.verb = verb.clone();
        }
        if let Some(prefix) = &overrides.metadata_prefix {
            merged.metadata_prefix = prefix.clone();
        }
        if let Some(scope_type) = &overrides.scope_type {
            merged.scope_type = scope_type.clone();
        }
        if let Some(scope_value) = &overrides.scope_value {
            merged.scope_value = scope_value.clone();
        }
        merged
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HarvestDetails {
    endpoint: OaiEndpoint,
    index_mapper: String,
}

#[derive(Debug)]
pub struct HarvestJob {
    job: Job,
}

impl HarvestJob {
    /// Persist a new harvest job. Overrides are folded into the endpoint
    /// before it is stored, so the details record exactly what will run.
    pub async fn create(
        ctx: &JobContext,
        record_group: RecordGroupRef,
        name: Option<String>,
        endpoint: OaiEndpoint,
        overrides: Option<HarvestOverrides>,
        index_mapper: &str,
    ) -> Result<Self> {
        let endpoint = match &overrides {
            Some(overrides) => endpoint.with_overrides(overrides),
            None => endpoint,
        };
        let details = HarvestDetails {
            endpoint,
            index_mapper: index_mapper.to_string(),
        };

        let job = ctx
            .store
            .create_job(
                NewJob {
                    record_group,
                    job_type: JobType::Harvest,
                    name: name.unwrap_or_else(|| Job::default_name(JobType::Harvest)),
                    job_details: serde_json::json!({ "harvest": details }),
                },
                &[],
                false,
                &ctx.config.storage_root,
            )
            .await?;
        Ok(Self { job })
    }

    /// Load an existing harvest job by id.
    pub async fn load(ctx: &JobContext, job_id: i64) -> Result<Self> {
        let job = ctx.store.get_job(job_id).await?;
        if job.job_type != JobType::Harvest {
            return Err(PipelineError::Parse(format!(
                "job {job_id} is a {} job, not harvest",
                job.job_type
            )));
        }
        Ok(Self { job })
    }

    pub fn from_job(job: Job) -> Self {
        Self { job }
    }

    fn details(&self) -> Result<HarvestDetails> {
        Ok(serde_json::from_value(
            self.job.job_details["harvest"].clone(),
        )?)
    }
}

#[async_trait]
impl PipelineJob for HarvestJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()> {
        let details = self.details()?;
        let endpoint = &details.endpoint;

        let code = format!(
            "from jobs import HarvestSpark\n\
             HarvestSpark.spark_function(spark, endpoint=\"{}\", verb=\"{}\", \
             metadataPrefix=\"{}\", scope_type=\"{}\", scope_value=\"{}\", \
             job_id=\"{}\", index_mapper=\"{}\")",
            endpoint.endpoint,
            endpoint.verb,
            endpoint.metadata_prefix,
            endpoint.scope_type,
            endpoint.scope_value,
            self.job.id,
            details.index_mapper,
        );

        submit_to_session(ctx, &mut self.job, code).await
    }
}
