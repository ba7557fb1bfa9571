//! SQLite-backed persistence for sessions, jobs, edges, records, and
//! transformation artifacts.
//!
//! The one structural guarantee callers lean on: job creation is a single
//! transaction covering the row, its derived output location, its input
//! edges, and the optional publish link: a job is never visible without its
//! edges, because lineage resolution and output-location derivation both
//! assume them.

use crate::artifacts::{ArtifactKind, TransformationArtifact};
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobStatus, JobType, RecordGroupRef};
use crate::record::{IndexMappingFailure, Record};
use crate::session::{ComputeSession, SessionStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS compute_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        session_id INTEGER,
        session_url TEXT,
        status TEXT NOT NULL,
        app_id TEXT,
        driver_log_url TEXT,
        spark_ui_url TEXT,
        server_timestamp TEXT,
        active INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        organization_id INTEGER NOT NULL,
        record_group_id INTEGER NOT NULL,
        publish_set_id TEXT NOT NULL DEFAULT '',
        job_type TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        finished INTEGER NOT NULL DEFAULT 0,
        statement_id INTEGER,
        statement_url TEXT,
        remote_code TEXT,
        output_location TEXT NOT NULL DEFAULT '',
        record_count INTEGER NOT NULL DEFAULT 0,
        job_details TEXT NOT NULL DEFAULT 'null',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS job_inputs (
        job_id INTEGER NOT NULL,
        input_job_id INTEGER NOT NULL,
        UNIQUE (job_id, input_job_id)
    )",
    "CREATE TABLE IF NOT EXISTS job_publishes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_group_id INTEGER NOT NULL,
        publish_set_id TEXT NOT NULL,
        job_id INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        record_id TEXT NOT NULL,
        position INTEGER,
        document TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_job_record ON records (job_id, record_id)",
    "CREATE TABLE IF NOT EXISTS index_mapping_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        record_id TEXT NOT NULL,
        mapping_error TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS transformations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        filepath TEXT
    )",
];

/// Parameters for a job row about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub record_group: RecordGroupRef,
    pub job_type: JobType,
    pub name: String,
    pub job_details: serde_json::Value,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if missing) a database at the given sqlite URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. Pinned to a single connection so every
    /// query sees the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sessions
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn insert_session(&self, session: &ComputeSession) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO compute_sessions
                (name, session_id, session_url, status, app_id, driver_log_url,
                 spark_ui_url, server_timestamp, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&session.name)
        .bind(session.session_id)
        .bind(&session.session_url)
        .bind(session.status.as_str())
        .bind(&session.app_id)
        .bind(&session.driver_log_url)
        .bind(&session.spark_ui_url)
        .bind(&session.server_timestamp)
        .bind(session.active)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_session(&self, session: &ComputeSession) -> Result<()> {
        sqlx::query(
            "UPDATE compute_sessions
             SET status = ?1, app_id = ?2, driver_log_url = ?3, spark_ui_url = ?4,
                 server_timestamp = ?5, active = ?6
             WHERE id = ?7",
        )
        .bind(session.status.as_str())
        .bind(&session.app_id)
        .bind(&session.driver_log_url)
        .bind(&session.spark_ui_url)
        .bind(&session.server_timestamp)
        .bind(session.active)
        .bind(session.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<ComputeSession>> {
        let row = sqlx::query("SELECT * FROM compute_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn active_sessions(&self) -> Result<Vec<ComputeSession>> {
        let rows = sqlx::query("SELECT * FROM compute_sessions WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a job row together with its input edges and optional publish
    /// link, atomically. The output location is derived from the assigned id
    /// inside the same transaction and never recomputed afterwards.
    pub async fn create_job(
        &self,
        new: NewJob,
        input_job_ids: &[i64],
        link_publish: bool,
        storage_root: &str,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        for input_id in input_job_ids {
            let exists = sqlx::query("SELECT id FROM jobs WHERE id = ?1")
                .bind(input_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(PipelineError::JobNotFound(*input_id));
            }
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO jobs
                (organization_id, record_group_id, publish_set_id, job_type, name,
                 status, finished, record_count, job_details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8)",
        )
        .bind(new.record_group.organization_id)
        .bind(new.record_group.record_group_id)
        .bind(&new.record_group.publish_set_id)
        .bind(new.job_type.as_str())
        .bind(&new.name)
        .bind(JobStatus::Initializing.as_str())
        .bind(new.job_details.to_string())
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        let job_id = result.last_insert_rowid();

        let output_location =
            Job::derive_output_location(storage_root, &new.record_group, new.job_type, job_id);
        sqlx::query("UPDATE jobs SET output_location = ?1 WHERE id = ?2")
            .bind(&output_location)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        for input_id in input_job_ids {
            sqlx::query("INSERT INTO job_inputs (job_id, input_job_id) VALUES (?1, ?2)")
                .bind(job_id)
                .bind(input_id)
                .execute(&mut *tx)
                .await?;
        }

        if link_publish {
            sqlx::query(
                "INSERT INTO job_publishes (record_group_id, publish_set_id, job_id)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(new.record_group.record_group_id)
            .bind(&new.record_group.publish_set_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(job_id, job_type = %new.job_type, "job created");

        self.get_job(job_id).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PipelineError::JobNotFound(id))?;
        job_from_row(&row)
    }

    pub async fn jobs_for_record_group(&self, record_group_id: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE record_group_id = ?1 ORDER BY id")
            .bind(record_group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Record the synchronous submission response on the job.
    pub async fn set_submission(
        &self,
        job_id: i64,
        statement_id: i64,
        statement_url: &str,
        code: &str,
        status: JobStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET statement_id = ?1, statement_url = ?2, remote_code = ?3, status = ?4
             WHERE id = ?5",
        )
        .bind(statement_id)
        .bind(statement_url)
        .bind(code)
        .bind(status.as_str())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        finished: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?1, finished = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(finished)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count the job's documented records and persist the total.
    pub async fn update_record_count(&self, job_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS record_count FROM records WHERE job_id = ?1 AND document != ''",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("record_count")?;

        sqlx::query("UPDATE jobs SET record_count = ?1 WHERE id = ?2")
            .bind(count)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(count)
    }

    /// Remove the job row and everything hanging off it. Side-effect
    /// reclamation (remote statement, indices, files) happens before this,
    /// in the cleanup coordinator: row deletion always proceeds.
    pub async fn delete_job(&self, job_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_mapping_failures WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_inputs WHERE job_id = ?1 OR input_job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_publishes WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Graph edges and publish links
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn add_job_input(&self, job_id: i64, input_job_id: i64) -> Result<()> {
        let exists = sqlx::query("SELECT id FROM jobs WHERE id = ?1")
            .bind(input_job_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(PipelineError::JobNotFound(input_job_id));
        }
        sqlx::query("INSERT OR IGNORE INTO job_inputs (job_id, input_job_id) VALUES (?1, ?2)")
            .bind(job_id)
            .bind(input_job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn input_job_ids(&self, job_id: i64) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("SELECT input_job_id FROM job_inputs WHERE job_id = ?1 ORDER BY rowid")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|r| r.try_get("input_job_id").map_err(PipelineError::from))
            .collect()
    }

    pub async fn downstream_job_ids(&self, job_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT job_id FROM job_inputs WHERE input_job_id = ?1 ORDER BY rowid")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get("job_id").map_err(PipelineError::from))
            .collect()
    }

    /// The job whose output is the record group's canonical published set.
    pub async fn published_job_id(&self, record_group_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT job_id FROM job_publishes WHERE record_group_id = ?1 ORDER BY id DESC",
        )
        .bind(record_group_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("job_id").map_err(PipelineError::from))
            .transpose()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Records
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn insert_record(
        &self,
        job_id: i64,
        record_id: &str,
        position: Option<i64>,
        document: &str,
        error: &str,
    ) -> Result<Record> {
        let result = sqlx::query(
            "INSERT INTO records (job_id, record_id, position, document, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(job_id)
        .bind(record_id)
        .bind(position)
        .bind(document)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(Record {
            id: result.last_insert_rowid(),
            job_id,
            record_id: record_id.to_string(),
            position,
            document: document.to_string(),
            error: error.to_string(),
        })
    }

    /// First record in the job carrying the given stable record id. Multiple
    /// matches within one job are not expected; the first wins.
    pub async fn find_record(&self, job_id: i64, record_id: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT * FROM records WHERE job_id = ?1 AND record_id = ?2 ORDER BY id LIMIT 1",
        )
        .bind(job_id)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn documented_records(&self, job_id: i64) -> Result<Vec<Record>> {
        let rows =
            sqlx::query("SELECT * FROM records WHERE job_id = ?1 AND document != '' ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn error_records(&self, job_id: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query("SELECT * FROM records WHERE job_id = ?1 AND error != '' ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Index mapping failures
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn insert_index_failure(
        &self,
        job_id: i64,
        record_id: &str,
        mapping_error: &str,
    ) -> Result<IndexMappingFailure> {
        let result = sqlx::query(
            "INSERT INTO index_mapping_failures (job_id, record_id, mapping_error)
             VALUES (?1, ?2, ?3)",
        )
        .bind(job_id)
        .bind(record_id)
        .bind(mapping_error)
        .execute(&self.pool)
        .await?;

        Ok(IndexMappingFailure {
            id: result.last_insert_rowid(),
            job_id,
            record_id: record_id.to_string(),
            mapping_error: mapping_error.to_string(),
        })
    }

    pub async fn index_failures(&self, job_id: i64) -> Result<Vec<IndexMappingFailure>> {
        let rows = sqlx::query("SELECT * FROM index_mapping_failures WHERE job_id = ?1 ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(failure_from_row).collect()
    }

    /// The record an indexing failure stemmed from, when it still exists.
    pub async fn failure_record(&self, failure: &IndexMappingFailure) -> Result<Option<Record>> {
        self.find_record(failure.job_id, &failure.record_id).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transformation artifacts
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn upsert_transformation(
        &self,
        name: &str,
        kind: ArtifactKind,
        payload: &str,
    ) -> Result<TransformationArtifact> {
        sqlx::query(
            "INSERT INTO transformations (name, kind, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, payload = excluded.payload",
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        self.transformation_by_name(name)
            .await?
            .ok_or_else(|| PipelineError::ArtifactNotFound(name.to_string()))
    }

    pub async fn set_transformation_filepath(&self, id: i64, filepath: &str) -> Result<()> {
        sqlx::query("UPDATE transformations SET filepath = ?1 WHERE id = ?2")
            .bind(filepath)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_transformation(&self, id: i64) -> Result<Option<TransformationArtifact>> {
        let row = sqlx::query("SELECT * FROM transformations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| transformation_from_row(&r)).transpose()
    }

    pub async fn transformation_by_name(
        &self,
        name: &str,
    ) -> Result<Option<TransformationArtifact>> {
        let row = sqlx::query("SELECT * FROM transformations WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| transformation_from_row(&r)).transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn session_from_row(row: &SqliteRow) -> Result<ComputeSession> {
    let status: String = row.try_get("status")?;
    Ok(ComputeSession {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        session_id: row.try_get("session_id")?,
        session_url: row.try_get("session_url")?,
        status: SessionStatus::parse(&status)?,
        app_id: row.try_get("app_id")?,
        driver_log_url: row.try_get("driver_log_url")?,
        spark_ui_url: row.try_get("spark_ui_url")?,
        server_timestamp: row.try_get("server_timestamp")?,
        active: row.try_get("active")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let details_raw: String = row.try_get("job_details")?;
    Ok(Job {
        id: row.try_get("id")?,
        record_group: RecordGroupRef {
            organization_id: row.try_get("organization_id")?,
            record_group_id: row.try_get("record_group_id")?,
            publish_set_id: row.try_get("publish_set_id")?,
        },
        job_type: JobType::parse(&job_type)?,
        name: row.try_get("name")?,
        status: JobStatus::parse(&status)?,
        finished: row.try_get("finished")?,
        statement_id: row.try_get("statement_id")?,
        statement_url: row.try_get("statement_url")?,
        remote_code: row.try_get("remote_code")?,
        output_location: row.try_get("output_location")?,
        record_count: row.try_get("record_count")?,
        job_details: serde_json::from_str(&details_raw)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    Ok(Record {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        record_id: row.try_get("record_id")?,
        position: row.try_get("position")?,
        document: row.try_get("document")?,
        error: row.try_get("error")?,
    })
}

fn failure_from_row(row: &SqliteRow) -> Result<IndexMappingFailure> {
    Ok(IndexMappingFailure {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        record_id: row.try_get("record_id")?,
        mapping_error: row.try_get("mapping_error")?,
    })
}

fn transformation_from_row(row: &SqliteRow) -> Result<TransformationArtifact> {
    let kind: String = row.try_get("kind")?;
    Ok(TransformationArtifact {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: ArtifactKind::parse(&kind)?,
        payload: row.try_get("payload")?,
        filepath: row.try_get("filepath")?,
    })
}
