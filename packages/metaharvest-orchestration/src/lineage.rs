//! Record lineage resolution.
//!
//! The same stable `record_id` recurs in every job a record passed through.
//! Given one representation, the resolver walks the job graph to produce the
//! full ordered chain: oldest ancestor first, then the record itself, then
//! descendants in discovery order. A job with no matching record simply
//! terminates that branch: the record did not exist at that stage.

use crate::error::Result;
use crate::graph::JobGraph;
use crate::record::Record;
use crate::store::MetadataStore;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct LineageResolver {
    store: Arc<MetadataStore>,
    graph: Arc<JobGraph>,
}

impl LineageResolver {
    pub fn new(store: Arc<MetadataStore>, graph: Arc<JobGraph>) -> Self {
        Self { store, graph }
    }

    /// All stages of the record: ancestors, self, and (optionally)
    /// descendants.
    pub async fn resolve(&self, record: &Record, include_downstream: bool) -> Result<Vec<Record>> {
        let mut stages = self.upstream_chain(record).await?;
        stages.push(record.clone());
        if include_downstream {
            stages.extend(self.downstream_records(record).await?);
        }
        Ok(stages)
    }

    /// Only the nearest upstream representation, without recursing further
    /// and without the record itself. `None` when the record has no upstream
    /// stage: a root record, not an error.
    pub async fn input_record(&self, record: &Record) -> Result<Option<Record>> {
        for input_job in self.graph.inputs_of(record.job_id).await? {
            if let Some(found) = self.store.find_record(input_job, &record.record_id).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Ancestors of the record, oldest first. Worklist walk: each match is
    /// prepended to the chain and its own inputs are visited in turn.
    async fn upstream_chain(&self, record: &Record) -> Result<Vec<Record>> {
        let mut chain: Vec<Record> = Vec::new();
        let mut pending = vec![record.clone()];

        while let Some(current) = pending.pop() {
            for input_job in self.graph.inputs_of(current.job_id).await? {
                if let Some(found) = self
                    .store
                    .find_record(input_job, &current.record_id)
                    .await?
                {
                    chain.insert(0, found.clone());
                    pending.push(found);
                }
            }
        }
        Ok(chain)
    }

    /// Descendants of the record in breadth-first discovery order.
    async fn downstream_records(&self, record: &Record) -> Result<Vec<Record>> {
        let mut found: Vec<Record> = Vec::new();
        let mut queue = VecDeque::from([record.clone()]);

        while let Some(current) = queue.pop_front() {
            for downstream_job in self.graph.outputs_of(current.job_id).await? {
                if let Some(child) = self
                    .store
                    .find_record(downstream_job, &current.record_id)
                    .await?
                {
                    found.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        Ok(found)
    }
}
