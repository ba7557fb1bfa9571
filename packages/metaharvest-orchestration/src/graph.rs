//! Dependency graph over jobs.
//!
//! Edges point from a job to the upstream jobs it consumes. They are
//! append-only and can only reference jobs that already exist at edge
//! creation time, which makes the graph acyclic by construction: no cycle
//! detector needed.

use crate::error::{PipelineError, Result};
use crate::store::MetadataStore;
use dashmap::DashMap;
use std::sync::Arc;

pub struct JobGraph {
    store: Arc<MetadataStore>,
    /// A job's inputs are fixed forever at creation, so they are cached on
    /// first read. Downstream edges keep appearing and are always re-queried.
    inputs_cache: DashMap<i64, Vec<i64>>,
}

impl JobGraph {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            inputs_cache: DashMap::new(),
        }
    }

    /// Append an edge from `job_id` to the upstream `input_job_id`.
    pub async fn add_edge(&self, job_id: i64, input_job_id: i64) -> Result<()> {
        if job_id == input_job_id {
            return Err(PipelineError::InvalidEdge(format!(
                "job {job_id} cannot be its own input"
            )));
        }
        self.store.add_job_input(job_id, input_job_id).await?;

        if let Some(mut cached) = self.inputs_cache.get_mut(&job_id) {
            if !cached.contains(&input_job_id) {
                cached.push(input_job_id);
            }
        }
        Ok(())
    }

    /// Upstream jobs this job consumes.
    pub async fn inputs_of(&self, job_id: i64) -> Result<Vec<i64>> {
        if let Some(cached) = self.inputs_cache.get(&job_id) {
            return Ok(cached.clone());
        }
        let inputs = self.store.input_job_ids(job_id).await?;
        self.inputs_cache.insert(job_id, inputs.clone());
        Ok(inputs)
    }

    /// Downstream jobs that consume this job's output.
    pub async fn outputs_of(&self, job_id: i64) -> Result<Vec<i64>> {
        self.store.downstream_job_ids(job_id).await
    }
}
