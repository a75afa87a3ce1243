//! Row-level access to the `jobs` table.
//!
//! Functions take a `&Connection` so the job store can compose them inside
//! a transaction (`rusqlite::Transaction` derefs to `Connection`).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::jobs::{format_timestamp, parse_timestamp, ErrorKind, Job, JobError, JobStatus};
use crate::metadata::BookMetadata;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub source_path: String,
    pub content_hash: String,
    pub status: String,
    pub metadata: Option<String>,
    pub attempt: i64,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub not_before_ms: Option<i64>,
    pub kepub_path: Option<String>,
    pub embed_failures: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source_path: row.get("source_path")?,
            content_hash: row.get("content_hash")?,
            status: row.get("status")?,
            metadata: row.get("metadata")?,
            attempt: row.get("attempt")?,
            last_error_kind: row.get("last_error_kind")?,
            last_error_message: row.get("last_error_message")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at_ms: row.get("lease_expires_at_ms")?,
            not_before_ms: row.get("not_before_ms")?,
            kepub_path: row.get("kepub_path")?,
            embed_failures: row.get("embed_failures")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    pub fn from_job(job: &Job) -> Result<Self, DatabaseError> {
        let metadata = job
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::InvalidColumn {
                column: "metadata",
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: job.id.clone(),
            source_path: job.source_path.to_string_lossy().into_owned(),
            content_hash: job.content_hash.clone(),
            status: job.status.as_str().to_string(),
            metadata,
            attempt: i64::from(job.attempt),
            last_error_kind: job.last_error.as_ref().map(|e| e.kind.as_str().to_string()),
            last_error_message: job.last_error.as_ref().map(|e| e.message.clone()),
            lease_owner: job.lease_owner.clone(),
            lease_expires_at_ms: job.lease_expires_at.map(|t| t.timestamp_millis()),
            not_before_ms: job.not_before.map(|t| t.timestamp_millis()),
            kepub_path: job
                .kepub_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            embed_failures: i64::from(job.embed_failures),
            created_at: format_timestamp(job.created_at),
            updated_at: format_timestamp(job.updated_at),
            completed_at: job.completed_at.map(format_timestamp),
        })
    }

    pub fn into_job(self) -> Result<Job, DatabaseError> {
        let invalid = |column: &'static str, reason: String| DatabaseError::InvalidColumn {
            column,
            reason,
        };
        let timestamp = |column: &'static str, value: &str| {
            parse_timestamp(value).ok_or_else(|| invalid(column, format!("bad timestamp '{}'", value)))
        };

        let status: JobStatus = self.status.parse().map_err(|e| invalid("status", e))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<BookMetadata>)
            .transpose()
            .map_err(|e| invalid("metadata", e.to_string()))?;
        let last_error = match (self.last_error_kind, self.last_error_message) {
            (Some(kind), message) => Some(JobError {
                kind: kind
                    .parse::<ErrorKind>()
                    .map_err(|e| invalid("last_error_kind", e))?,
                message: message.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Ok(Job {
            created_at: timestamp("created_at", &self.created_at)?,
            updated_at: timestamp("updated_at", &self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|v| timestamp("completed_at", v))
                .transpose()?,
            id: self.id,
            source_path: PathBuf::from(self.source_path),
            content_hash: self.content_hash,
            status,
            metadata,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            last_error,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at_ms.and_then(DateTime::from_timestamp_millis),
            not_before: self.not_before_ms.and_then(DateTime::from_timestamp_millis),
            kepub_path: self.kepub_path.map(PathBuf::from),
            embed_failures: u32::try_from(self.embed_failures).unwrap_or(0),
        })
    }
}

/// Query filter for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
}

pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, source_path, content_hash, status, metadata, attempt,
         last_error_kind, last_error_message, lease_owner, lease_expires_at_ms, not_before_ms,
         kepub_path, embed_failures, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.id,
            job.source_path,
            job.content_hash,
            job.status,
            job.metadata,
            job.attempt,
            job.last_error_kind,
            job.last_error_message,
            job.lease_owner,
            job.lease_expires_at_ms,
            job.not_before_ms,
            job.kepub_path,
            job.embed_failures,
            job.created_at,
            job.updated_at,
            job.completed_at,
        ],
    )?;
    Ok(())
}

/// Overwrites every pipeline-owned column. When `owner` is given the write
/// only applies while that owner still holds the lease. `keep_lease` decides
/// whether the lease columns are written from the row or cleared.
/// Returns the number of rows changed (0 or 1).
pub fn update(
    conn: &Connection,
    job: &JobRow,
    owner: Option<&str>,
    keep_lease: bool,
) -> Result<usize, DatabaseError> {
    let (lease_owner, lease_expires) = if keep_lease {
        (job.lease_owner.as_deref(), job.lease_expires_at_ms)
    } else {
        (None, None)
    };

    let changed = conn.execute(
        "UPDATE jobs SET source_path=?2, content_hash=?3, status=?4, metadata=?5, attempt=?6,
         last_error_kind=?7, last_error_message=?8, lease_owner=?9, lease_expires_at_ms=?10,
         not_before_ms=?11, kepub_path=?12, embed_failures=?13, updated_at=?14,
         completed_at=?15
         WHERE id=?1 AND (?16 IS NULL OR lease_owner = ?16)",
        params![
            job.id,
            job.source_path,
            job.content_hash,
            job.status,
            job.metadata,
            job.attempt,
            job.last_error_kind,
            job.last_error_message,
            lease_owner,
            lease_expires,
            job.not_before_ms,
            job.kepub_path,
            job.embed_failures,
            job.updated_at,
            job.completed_at,
            owner,
        ],
    )?;
    Ok(changed)
}

/// Refreshes `updated_at` (and the content hash) without touching anything
/// a lease holder owns.
pub fn touch(
    conn: &Connection,
    id: &str,
    content_hash: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET content_hash=?2, updated_at=?3 WHERE id=?1",
        params![id, content_hash, updated_at],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?)
}

pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM jobs WHERE source_path = ?1",
            params![path],
            JobRow::from_row,
        )
        .optional()?)
}

/// All jobs recorded with the given content hash, most recently updated first.
pub fn find_by_hash(conn: &Connection, hash: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM jobs WHERE content_hash = ?1 ORDER BY updated_at DESC")?;
    let rows = stmt
        .query_map(params![hash], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn query(conn: &Connection, filter: &JobFilter) -> Result<Vec<JobRow>, DatabaseError> {
    let status = filter.status.map(|s| s.as_str());
    let limit = filter
        .limit
        .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        .unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE (?1 IS NULL OR status = ?1)
         ORDER BY updated_at ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![status, limit], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ids of jobs eligible for claiming at `now_ms`, oldest `updated_at` first:
/// non-terminal, lease absent or expired, and past any retry backoff.
pub fn claimable_ids(conn: &Connection, now_ms: i64, limit: u32) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM jobs
         WHERE status NOT IN ('done', 'failed', 'removed')
           AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?1)
           AND (not_before_ms IS NULL OR not_before_ms <= ?1)
         ORDER BY updated_at ASC, id ASC
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![now_ms, limit], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Takes the lease on one job if it is still free at `now_ms`. The guard in
/// the WHERE clause makes this a compare-and-set; returns whether it won.
pub fn try_lease(
    conn: &Connection,
    id: &str,
    owner: &str,
    expires_ms: i64,
    now_ms: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET lease_owner = ?2, lease_expires_at_ms = ?3
         WHERE id = ?1
           AND status NOT IN ('done', 'failed', 'removed')
           AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?4)",
        params![id, owner, expires_ms, now_ms],
    )?;
    Ok(changed == 1)
}

pub fn release_lease(conn: &Connection, id: &str, owner: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET lease_owner = NULL, lease_expires_at_ms = NULL
         WHERE id = ?1 AND lease_owner = ?2",
        params![id, owner],
    )?)
}
