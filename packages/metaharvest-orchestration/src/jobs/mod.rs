//! Polymorphic job builders.
//!
//! Each variant knows how to persist its job row (with edges, before any
//! remote submission) and how to render its remote execution payload: a code
//! string naming the remote entry point, with every parameter passed by
//! value: the remote session is a separate process and never sees live
//! references.

pub mod analysis;
pub mod harvest;
pub mod merge;
pub mod publish;
pub mod transform;

pub use analysis::{AnalysisJob, AnalysisKind};
pub use harvest::{HarvestJob, HarvestOverrides, OaiEndpoint};
pub use merge::MergeJob;
pub use publish::PublishJob;
pub use transform::TransformJob;

use crate::client::ComputeSessionClient;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobStatus, JobType};
use crate::record::Record;
use crate::session::SessionRegistry;
use crate::store::MetadataStore;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared services every builder operates against.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<MetadataStore>,
    pub client: Arc<ComputeSessionClient>,
    pub sessions: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

impl JobContext {
    pub fn new(
        store: Arc<MetadataStore>,
        client: Arc<ComputeSessionClient>,
        sessions: Arc<SessionRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            client,
            sessions,
            config,
        }
    }
}

#[async_trait]
pub trait PipelineJob: Send + Sync + std::fmt::Debug {
    fn job(&self) -> &Job;

    fn job_mut(&mut self) -> &mut Job;

    fn job_type(&self) -> JobType {
        self.job().job_type
    }

    /// Render the remote execution payload and submit it to the active
    /// session.
    async fn prepare_job(&mut self, ctx: &JobContext) -> Result<()>;

    /// What "error" means for this variant. Harvest reports none here;
    /// harvest errors are captured by the remote process itself.
    async fn job_errors(&self, _ctx: &JobContext) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }
}

/// Submit the builder's payload through the single active session.
///
/// Fails with `NoActiveSession` before anything is sent; the job stays
/// `initializing` (not started, not crashed) and is never retried here.
pub async fn start(ctx: &JobContext, builder: &mut dyn PipelineJob) -> Result<()> {
    ctx.sessions.require_active().await?;
    builder.prepare_job(ctx).await
}

/// Issue the statement and record the synchronous submission response. The
/// job is running-or-waiting from here on until a later refresh observes the
/// eventual result.
pub(crate) async fn submit_to_session(
    ctx: &JobContext,
    job: &mut Job,
    code: String,
) -> Result<()> {
    let session = ctx.sessions.require_active().await?;
    let session_id = session.session_id.ok_or(PipelineError::NoActiveSession)?;

    let submitted = ctx.client.submit_statement(session_id, &code).await?;
    info!(
        job_id = job.id,
        statement_id = submitted.id,
        state = %submitted.state,
        "statement submitted"
    );

    job.statement_id = Some(submitted.id);
    job.statement_url = Some(submitted.url.clone());
    job.remote_code = Some(code.clone());
    job.status = JobStatus::from_remote(&submitted.state);

    ctx.store
        .set_submission(job.id, submitted.id, &submitted.url, &code, job.status)
        .await
}

/// Poll the job's remote statement and persist the mapped status. A job that
/// was never submitted has nothing to refresh.
pub async fn refresh_job_status(ctx: &JobContext, job: &mut Job) -> Result<()> {
    let Some(url) = job.statement_url.clone() else {
        return Ok(());
    };
    let outcome = ctx.client.statement_status(&url).await?;
    job.apply_statement_status(&outcome);
    ctx.store
        .update_job_status(job.id, job.status, job.finished)
        .await
}

/// Refresh a batch of jobs concurrently. Every refresh runs to completion;
/// the first error (if any) is surfaced afterwards.
pub async fn refresh_jobs(ctx: &JobContext, jobs: &mut [Job]) -> Result<()> {
    let results = join_all(jobs.iter_mut().map(|job| refresh_job_status(ctx, job))).await;
    for result in results {
        result?;
    }
    Ok(())
}

type Constructor = fn(Job) -> Box<dyn PipelineJob>;

/// Explicit registry mapping the persisted `job_type` discriminator to a
/// builder constructor, used to rehydrate the correct variant from a stored
/// job id.
pub struct JobTypeRegistry {
    constructors: HashMap<JobType, Constructor>,
}

impl JobTypeRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(JobType::Harvest, |job| Box::new(HarvestJob::from_job(job)));
        registry.register(JobType::Transform, |job| {
            Box::new(TransformJob::from_job(job))
        });
        registry.register(JobType::Merge, |job| Box::new(MergeJob::from_job(job)));
        registry.register(JobType::Publish, |job| Box::new(PublishJob::from_job(job)));
        registry.register(JobType::Analysis, |job| {
            Box::new(AnalysisJob::from_job(job))
        });
        registry
    }

    pub fn register(&mut self, job_type: JobType, constructor: Constructor) {
        self.constructors.insert(job_type, constructor);
    }

    /// Load the job row and hand it to the constructor registered for its
    /// type tag.
    pub async fn rehydrate(&self, ctx: &JobContext, job_id: i64) -> Result<Box<dyn PipelineJob>> {
        let job = ctx.store.get_job(job_id).await?;
        let constructor = self.constructors.get(&job.job_type).ok_or_else(|| {
            PipelineError::Parse(format!(
                "no job builder registered for type {}",
                job.job_type
            ))
        })?;
        Ok(constructor(job))
    }
}

/// Render a list of output locations as a payload-embeddable list literal.
pub(crate) fn render_location_list(locations: &[String]) -> String {
    let quoted: Vec<String> = locations
        .iter()
        .map(|location| format!("\"{location}\""))
        .collect();
    format!("[{}]", quoted.join(", "))
}
