use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote service error: status {status}: {body}")]
    RemoteService { status: u16, body: String },

    #[error("no active compute session")]
    NoActiveSession,

    #[error("{count} compute sessions are marked active, expected at most one")]
    AmbiguousSession { count: usize },

    #[error("compute session was already created against the remote service")]
    SessionAlreadyCreated,

    #[error("{job_type} job requires {expected} input job(s), got {actual}")]
    DependencyMissing {
        job_type: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("transformation artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid graph edge: {0}")]
    InvalidEdge(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}
