//! Process configuration.
//!
//! Every external collaborator the control plane drives is named here: the
//! remote compute session endpoint and its default session body, the storage
//! root all job output is written under, the search index host, and the
//! reserved hierarchy Analysis jobs are filed into.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

/// URI scheme marking output that lives on the local filesystem.
pub const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compute: ComputeConfig,
    /// URI prefix (`file://` or a distributed-storage scheme) under which all
    /// job output, published artifacts, transformations, and stateio
    /// directories are rooted.
    pub storage_root: String,
    pub search: SearchConfig,
    pub analysis: AnalysisHierarchy,
    pub stateio: StateIoConfig,
}

/// Remote compute session endpoint and default session body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub host: String,
    pub port: u16,
    /// Serialized verbatim as the `POST /sessions` body; caller overrides are
    /// merged on top of this at submission time.
    pub session_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub host: String,
    pub port: u16,
}

/// Reserved synthetic organization/record-group used for Analysis jobs.
///
/// The ids are fixed constants outside the externally-assigned (positive)
/// hierarchy, and the display names carry a hash suffix so they cannot
/// collide with user-created names either.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisHierarchy {
    pub organization_id: i64,
    pub record_group_id: i64,
    pub organization_name: String,
    pub record_group_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateIoConfig {
    pub export_dir: String,
    pub import_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compute: ComputeConfig::default(),
            storage_root: "file:///var/lib/metaharvest/data".to_string(),
            search: SearchConfig::default(),
            analysis: AnalysisHierarchy::default(),
            stateio: StateIoConfig::default(),
        }
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8998,
            session_config: json!({
                "kind": "pyspark",
                "jars": [
                    "file:///opt/metaharvest/lib/mysql.jar"
                ],
                "files": [
                    "file:///opt/metaharvest/spark/es.py",
                    "file:///opt/metaharvest/spark/jobs.py",
                    "file:///opt/metaharvest/spark/record_validation.py",
                    "file:///opt/metaharvest/spark/utils.py"
                ],
                "conf": {
                    "spark.ui.port": 4040
                }
            }),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9200,
        }
    }
}

impl Default for AnalysisHierarchy {
    fn default() -> Self {
        Self {
            organization_id: 0,
            record_group_id: 0,
            // suffix is the md5 hash of the base name
            organization_name: "AnalysisOrganizationf8ed4bfcefc4dbf87b588a5de9b7cc95".to_string(),
            record_group_name: "AnalysisRecordGroupf660bb4826bea8b63fd773d27d687cfd".to_string(),
        }
    }
}

impl Default for StateIoConfig {
    fn default() -> Self {
        Self {
            export_dir: "/var/lib/metaharvest/data/stateio/exports".to_string(),
            import_dir: "/var/lib/metaharvest/data/stateio/imports".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(PipelineError::config)
    }

    pub fn compute_base_url(&self) -> String {
        format!("http://{}:{}", self.compute.host, self.compute.port)
    }

    pub fn search_base_url(&self) -> String {
        format!("http://{}:{}", self.search.host, self.search.port)
    }

    /// Local directory holding symlinks to published job output, when the
    /// storage root is on the local filesystem.
    pub fn published_dir(&self) -> Option<PathBuf> {
        file_scheme_path(&self.storage_root).map(|root| root.join("published"))
    }

    /// Local directory transformation payloads are written into for pickup by
    /// the remote session.
    pub fn transformations_dir(&self) -> Option<PathBuf> {
        file_scheme_path(&self.storage_root).map(|root| root.join("transformations"))
    }
}

/// Resolve a `file://` URI to a filesystem path. Returns `None` for any other
/// scheme (distributed storage is reclaimed by the remote cluster, not here).
pub fn file_scheme_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix(FILE_SCHEME)
        .map(|p| PathBuf::from(p.trim_end_matches('/')))
}
