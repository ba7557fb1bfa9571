//! Record models.
//!
//! A record belongs to exactly one job. Its `record_id` is the stable
//! identifier that follows the record through the pipeline: the same id
//! recurs in every job along its lineage chain, so uniqueness is scoped to
//! `(job, record_id)`, never global.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub job_id: i64,
    pub record_id: String,
    /// Position within the job's output, when the remote process reports one.
    pub position: Option<i64>,
    /// Record payload; empty when the stage failed for this record.
    pub document: String,
    /// Transform-time error; empty on success.
    pub error: String,
}

impl Record {
    pub fn has_document(&self) -> bool {
        !self.document.is_empty()
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// An index-time failure, kept separate from [`Record::error`]: the record
/// transformed fine but could not be mapped into the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMappingFailure {
    pub id: i64,
    pub job_id: i64,
    pub record_id: String,
    pub mapping_error: String,
}
