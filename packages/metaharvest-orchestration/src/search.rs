//! HTTP client for the search index service.
//!
//! Index names are deterministic: `j{job_id}` for a job's own index, and a
//! single `published` collection for all published records. Absence of an
//! index is an answer, not an error.

use crate::config::SearchConfig;
use crate::error::{PipelineError, Result};
use crate::job::Job;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The collection all published records are indexed into.
pub const PUBLISHED_INDEX: &str = "published";

/// The index a job's mapped records live in.
pub fn job_index_name(job_id: i64) -> String {
    format!("j{job_id}")
}

pub struct SearchIndexClient {
    http: reqwest::Client,
    base_url: String,
}

impl SearchIndexClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Self::from_base_url(format!("http://{}:{}", config.host, config.port))
    }

    pub fn from_base_url(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self.http.head(self.url(index)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(PipelineError::RemoteService {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    /// Delete an index. Returns whether it existed.
    pub async fn delete_index(&self, index: &str) -> Result<bool> {
        let response = self.http.delete(self.url(index)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                debug!(index, "search index deleted");
                Ok(true)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PipelineError::RemoteService {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    /// Delete every document in `index` whose `field` matches `value`.
    pub async fn delete_by_query(&self, index: &str, field: &str, value: &str) -> Result<()> {
        let body = json!({
            "query": {
                "match": { field: value }
            }
        });
        let response = self
            .http
            .post(self.url(&format!("{index}/_delete_by_query")))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::RemoteService {
            status: status.as_u16(),
            body,
        })
    }

    /// Drop a job's own index, when it exists.
    pub async fn delete_job_index(&self, job: &Job) -> Result<bool> {
        let index = job_index_name(job.id);
        if !self.index_exists(&index).await? {
            debug!(index, "search index absent, nothing to delete");
            return Ok(false);
        }
        self.delete_index(&index).await
    }
}
