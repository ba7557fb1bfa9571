//! Compute session lifecycle.
//!
//! A session row tracks one remote batch-compute session. At most one row is
//! `active` at steady state; every submission funnels through it. The remote
//! service is the source of truth: refresh re-fetches state idempotently and
//! a 404 means the session is gone for good (a gone session is never
//! resurrected, callers create a new one).

use crate::client::{ComputeSessionClient, Remote, SessionSnapshot};
use crate::error::{PipelineError, Result};
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Idle,
    Busy,
    Gone,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Gone => "gone",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "idle" => Ok(SessionStatus::Idle),
            "busy" => Ok(SessionStatus::Busy),
            "gone" => Ok(SessionStatus::Gone),
            "error" => Ok(SessionStatus::Error),
            _ => Err(PipelineError::parse(format!(
                "invalid session status: {s}"
            ))),
        }
    }

    /// Map a raw remote session state. Anything outside the live set is an
    /// error state as far as the control plane is concerned; `gone` only ever
    /// comes from a 404.
    pub fn from_remote(state: &str) -> Self {
        match state {
            "starting" => SessionStatus::Starting,
            "idle" => SessionStatus::Idle,
            "busy" => SessionStatus::Busy,
            _ => SessionStatus::Error,
        }
    }

    /// A live session accepts statements (or will, once started).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Idle | SessionStatus::Busy
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted state of one remote compute session.
#[derive(Debug, Clone)]
pub struct ComputeSession {
    /// Local surrogate key; 0 until persisted.
    pub id: i64,
    pub name: String,
    /// Remote session id; `None` until the remote confirms creation.
    pub session_id: Option<i64>,
    pub session_url: Option<String>,
    pub status: SessionStatus,
    pub app_id: Option<String>,
    pub driver_log_url: Option<String>,
    pub spark_ui_url: Option<String>,
    /// `Date` header from the most recent remote response.
    pub server_timestamp: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ComputeSession {
    /// A local row awaiting remote creation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            session_id: None,
            session_url: None,
            status: SessionStatus::Starting,
            app_id: None,
            driver_log_url: None,
            spark_ui_url: None,
            server_timestamp: None,
            active: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.session_id.is_some()
    }

    /// Fold a remote status lookup into local state. 404 means gone: the
    /// row is deactivated and never becomes active again. On a hit, `active`
    /// is recomputed from the mapped status and Spark application details are
    /// recorded opportunistically when present.
    pub fn apply_status(&mut self, outcome: &Remote<SessionSnapshot>) {
        match outcome {
            Remote::NotFound => {
                self.status = SessionStatus::Gone;
                self.active = false;
            }
            Remote::Found(snapshot) => {
                self.status = SessionStatus::from_remote(&snapshot.body.state);
                self.active = self.status.is_live();
                if let Some(app_id) = &snapshot.body.app_id {
                    self.app_id = Some(app_id.clone());
                }
                if let Some(info) = &snapshot.body.app_info {
                    if let Some(url) = &info.driver_log_url {
                        self.driver_log_url = Some(url.clone());
                    }
                    if let Some(url) = &info.spark_ui_url {
                        self.spark_ui_url = Some(url.clone());
                    }
                }
                if let Some(date) = &snapshot.server_date {
                    self.server_timestamp = Some(date.clone());
                }
            }
        }
    }
}

/// Single-writer gate over the cluster's one active session.
///
/// All creation goes through [`SessionRegistry::create`] under an internal
/// mutex, so two callers racing `get_active() == None` serialize instead of
/// creating two sessions. `AmbiguousSession` detection remains as the
/// backstop for rows written outside this process.
pub struct SessionRegistry {
    store: Arc<MetadataStore>,
    client: Arc<ComputeSessionClient>,
    create_gate: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(store: Arc<MetadataStore>, client: Arc<ComputeSessionClient>) -> Self {
        Self {
            store,
            client,
            create_gate: Mutex::new(()),
        }
    }

    /// The unique active session, if any. More than one active row is a
    /// consistency anomaly and is surfaced rather than guessed at.
    pub async fn get_active(&self) -> Result<Option<ComputeSession>> {
        let mut sessions = self.store.active_sessions().await?;
        match sessions.len() {
            0 => Ok(None),
            1 => Ok(Some(sessions.remove(0))),
            count => Err(PipelineError::AmbiguousSession { count }),
        }
    }

    /// The unique active session, or `NoActiveSession`.
    pub async fn require_active(&self) -> Result<ComputeSession> {
        self.get_active()
            .await?
            .and_then(|s| if s.is_created() { Some(s) } else { None })
            .ok_or(PipelineError::NoActiveSession)
    }

    /// Create the session against the remote service and persist the row.
    ///
    /// Must be called at most once per row: a session that already carries a
    /// remote id is rejected before any remote call. The row is only written
    /// (with `active = true`) after the remote confirms creation.
    pub async fn create(
        &self,
        session: &mut ComputeSession,
        overrides: Option<&Value>,
    ) -> Result<()> {
        if session.is_created() {
            return Err(PipelineError::SessionAlreadyCreated);
        }

        let _gate = self.create_gate.lock().await;
        self.create_locked(session, overrides).await
    }

    async fn create_locked(
        &self,
        session: &mut ComputeSession,
        overrides: Option<&Value>,
    ) -> Result<()> {
        let created = self.client.create_session(overrides).await?;
        info!(
            session_id = created.body.id,
            state = %created.body.state,
            "compute session created"
        );

        session.name = format!("Compute session {}", created.body.id);
        session.session_id = Some(created.body.id);
        session.session_url = Some(created.session_url.clone());
        session.status = SessionStatus::from_remote(&created.body.state);
        session.server_timestamp = created.server_date.clone();
        session.active = true;

        session.id = self.store.insert_session(session).await?;
        Ok(())
    }

    /// Return the active session, creating one when none exists. The active
    /// check runs under the creation gate, so racing callers converge on the
    /// session the winner created.
    pub async fn ensure_active(&self, overrides: Option<&Value>) -> Result<ComputeSession> {
        let _gate = self.create_gate.lock().await;

        if let Some(session) = self.get_active().await? {
            debug!(session.id, "reusing active compute session");
            return Ok(session);
        }

        let mut session = ComputeSession::new("Compute session");
        self.create_locked(&mut session, overrides).await?;
        Ok(session)
    }

    /// Re-fetch remote state and persist the mapped status.
    pub async fn refresh(&self, session: &mut ComputeSession) -> Result<()> {
        let session_id = session.session_id.ok_or_else(|| {
            PipelineError::Config("cannot refresh a session that was never created".to_string())
        })?;

        let outcome = self.client.session_status(session_id).await?;
        if outcome.is_not_found() {
            warn!(session_id, "remote session not found, marking gone");
        }
        session.apply_status(&outcome);
        self.store.update_session(session).await
    }

    /// Stop the remote session, then refresh to record its final state.
    pub async fn stop(&self, session: &mut ComputeSession) -> Result<()> {
        let session_id = session.session_id.ok_or_else(|| {
            PipelineError::Config("cannot stop a session that was never created".to_string())
        })?;

        self.client.stop_session(session_id).await?;
        self.refresh(session).await
    }
}
