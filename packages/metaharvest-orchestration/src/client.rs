//! HTTP client for the remote compute session service.
//!
//! One fixed host:port, one synchronous round trip per call, no retries -
//! retry policy belongs to callers. A 404 from the remote is never an error
//! here: it maps to [`Remote::NotFound`] and callers fold it into their own
//! `gone` state.

use crate::config::ComputeConfig;
use crate::error::{PipelineError, Result};
use reqwest::header::{DATE, LOCATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a remote lookup: the resource, or confirmation it is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote<T> {
    Found(T),
    NotFound,
}

impl<T> Remote<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Remote::Found(v) => Some(v),
            Remote::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Remote::NotFound)
    }
}

/// `GET /sessions/{id}` response body.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionBody {
    pub id: i64,
    pub state: String,
    #[serde(rename = "appId", default)]
    pub app_id: Option<String>,
    #[serde(rename = "appInfo", default)]
    pub app_info: Option<AppInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    #[serde(rename = "driverLogUrl", default)]
    pub driver_log_url: Option<String>,
    #[serde(rename = "sparkUiUrl", default)]
    pub spark_ui_url: Option<String>,
}

/// Session body plus the response headers callers persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub body: SessionBody,
    /// `Date` header: the remote service's own timestamp.
    pub server_date: Option<String>,
}

/// Session creation result: confirmed body plus its statement-base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    pub body: SessionBody,
    pub session_url: String,
    pub server_date: Option<String>,
}

/// Statement body as returned by submit/status calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StatementBody {
    pub id: i64,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StatementList {
    #[serde(default)]
    statements: Vec<StatementBody>,
}

/// Submission result: statement body plus the absolute URL it is polled at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSubmitted {
    pub id: i64,
    pub state: String,
    pub url: String,
}

pub struct ComputeSessionClient {
    http: reqwest::Client,
    base_url: String,
    session_config: Value,
}

impl ComputeSessionClient {
    pub fn new(config: &ComputeConfig) -> Result<Self> {
        Self::from_parts(
            format!("http://{}:{}", config.host, config.port),
            config.session_config.clone(),
        )
    }

    pub fn from_parts(base_url: String, session_config: Value) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Absolutize a `Location` header value (the remote answers with a path).
    fn absolutize(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            self.url(location)
        }
    }

    /// Merge caller overrides onto the default session config. Top-level keys
    /// replace defaults; absent overrides leave the default body untouched.
    pub fn merged_session_config(&self, overrides: Option<&Value>) -> Value {
        let mut body = self.session_config.clone();
        if let (Some(base), Some(Value::Object(extra))) = (body.as_object_mut(), overrides) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        body
    }

    /// `POST /sessions`: create a new remote session.
    pub async fn create_session(&self, overrides: Option<&Value>) -> Result<SessionCreated> {
        let body = self.merged_session_config(overrides);
        debug!(body = %body, "creating compute session");

        let response = self
            .http
            .post(self.url("sessions"))
            .json(&body)
            .send()
            .await?;
        let response = expect_success(response).await?;

        let server_date = header_string(&response, DATE);
        let session_url = match header_string(&response, LOCATION) {
            Some(location) => self.absolutize(&location),
            None => {
                return Err(PipelineError::Parse(
                    "session create response missing Location header".to_string(),
                ))
            }
        };
        let body: SessionBody = response.json().await?;

        Ok(SessionCreated {
            body,
            session_url,
            server_date,
        })
    }

    /// `GET /sessions/{id}`: poll session state.
    pub async fn session_status(&self, session_id: i64) -> Result<Remote<SessionSnapshot>> {
        let response = self
            .http
            .get(self.url(&format!("sessions/{session_id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Remote::NotFound);
        }
        let response = expect_success(response).await?;

        let server_date = header_string(&response, DATE);
        let body: SessionBody = response.json().await?;
        Ok(Remote::Found(SessionSnapshot { body, server_date }))
    }

    /// `DELETE /sessions/{id}`: stop a remote session.
    pub async fn stop_session(&self, session_id: i64) -> Result<Remote<()>> {
        let response = self
            .http
            .delete(self.url(&format!("sessions/{session_id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Remote::NotFound);
        }
        expect_success(response).await?;
        Ok(Remote::Found(()))
    }

    /// `GET /sessions/{id}/statements`: list the session's statements.
    pub async fn session_statements(&self, session_id: i64) -> Result<Remote<Vec<StatementBody>>> {
        let response = self
            .http
            .get(self.url(&format!("sessions/{session_id}/statements")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Remote::NotFound);
        }
        let response = expect_success(response).await?;

        let list: StatementList = response.json().await?;
        Ok(Remote::Found(list.statements))
    }

    /// `POST /sessions/{id}/statements`: submit a code statement.
    pub async fn submit_statement(
        &self,
        session_id: i64,
        code: &str,
    ) -> Result<StatementSubmitted> {
        debug!(session_id, code, "submitting statement");

        let response = self
            .http
            .post(self.url(&format!("sessions/{session_id}/statements")))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?;
        let response = expect_success(response).await?;

        let url = match header_string(&response, LOCATION) {
            Some(location) => self.absolutize(&location),
            None => {
                return Err(PipelineError::Parse(
                    "statement submit response missing Location header".to_string(),
                ))
            }
        };
        let body: StatementBody = response.json().await?;

        Ok(StatementSubmitted {
            id: body.id,
            state: body.state,
            url,
        })
    }

    /// `GET <statement-url>`: poll statement state.
    ///
    /// The remote answers 400 (not 404) when the owning session has been
    /// reaped, so both map to [`Remote::NotFound`].
    pub async fn statement_status(&self, statement_url: &str) -> Result<Remote<StatementBody>> {
        let response = self.http.get(statement_url).send().await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
        ) {
            return Ok(Remote::NotFound);
        }
        let response = expect_success(response).await?;

        let body: StatementBody = response.json().await?;
        Ok(Remote::Found(body))
    }

    /// `POST <statement-url>/cancel`: cancel a statement.
    pub async fn cancel_statement(&self, statement_url: &str) -> Result<Remote<()>> {
        let url = format!("{}/cancel", statement_url.trim_end_matches('/'));
        let response = self.http.post(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Remote::NotFound);
        }
        expect_success(response).await?;
        Ok(Remote::Found(()))
    }
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Map any remaining non-2xx response to a `RemoteService` error, carrying
/// whatever body the remote sent.
async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::RemoteService {
        status: status.as_u16(),
        body,
    })
}
