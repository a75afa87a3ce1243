//! The job store: sole owner of job records.
//!
//! The watcher proposes changes through [`JobStore::upsert`]; workers take
//! jobs with [`JobStore::claim_next`] and hand them back through
//! [`JobStore::checkpoint`], [`JobStore::commit`] or [`JobStore::release`].
//! Claiming is a compare-and-set on the lease columns inside an immediate
//! SQLite transaction, so it stays exclusive across handles and processes
//! sharing one database file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::TransactionBehavior;
use thiserror::Error;

use super::{content_hash, Job, JobStatus};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};
use crate::watcher::{FileEvent, FileEventKind};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("lease on job {id} is no longer held by this worker")]
    LeaseLost { id: String },
}

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    /// Applies a watcher observation. Returns the affected job, or `None`
    /// when the event concerns nothing trackable (an unknown file was
    /// removed, or the file vanished before it could be hashed).
    pub fn upsert(&self, event: &FileEvent) -> Result<Option<Job>, StoreError> {
        self.upsert_at(event, Utc::now())
    }

    pub fn upsert_at(&self, event: &FileEvent, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        if event.kind == FileEventKind::Removed {
            return self.mark_removed(&event.path, now);
        }

        // Hash outside the lock; a file that is already gone is not an error.
        let hash = match content_hash(&event.path) {
            Ok(hash) => hash,
            Err(e) => {
                log::debug!("Skipping event for unreadable file: {}", e);
                return Ok(None);
            }
        };
        let path = event.path.to_string_lossy().into_owned();
        let renamed_from = match &event.kind {
            FileEventKind::Renamed { from } => Some(from.to_string_lossy().into_owned()),
            _ => None,
        };

        let job = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut found = job_repo::find_by_path(&tx, &path)?;
            if let Some(from) = &renamed_from {
                let from_row = job_repo::find_by_path(&tx, from)?;
                match (&found, from_row) {
                    (None, from_row) => found = from_row,
                    // Renamed over a tracked file: the old name is gone.
                    (Some(_), Some(stale)) => {
                        let mut stale = stale.into_job()?;
                        if !stale.is_leased_at(now) && stale.status != JobStatus::Removed {
                            stale.status = JobStatus::Removed;
                            stale.updated_at = now;
                            job_repo::update(&tx, &JobRow::from_job(&stale)?, None, true)?;
                        }
                    }
                    (Some(_), None) => {}
                }
            }
            if found.is_none() {
                found = job_repo::find_by_hash(&tx, &hash)?
                    .into_iter()
                    .find(|row| !Path::new(&row.source_path).exists());
            }

            let job = match found {
                None => {
                    let job = Job::detected(event.path.clone(), hash.clone(), now);
                    job_repo::insert(&tx, &JobRow::from_job(&job)?)?;
                    log::info!("Tracking new file {}", event.path.display());
                    job
                }
                Some(row) => apply_observation(&tx, row.into_job()?, event, &hash, now)?,
            };

            tx.commit()?;
            Ok(job)
        })?;

        Ok(Some(job))
    }

    fn mark_removed(&self, path: &Path, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let path = path.to_string_lossy().into_owned();
        let job = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(row) = job_repo::find_by_path(&tx, &path)? else {
                return Ok(None);
            };
            let mut job = row.into_job()?;

            // The lease holder discovers the missing file itself.
            if job.is_leased_at(now) || job.status == JobStatus::Removed {
                return Ok(Some(job));
            }

            job.status = JobStatus::Removed;
            job.not_before = None;
            job.updated_at = now;
            job_repo::update(&tx, &JobRow::from_job(&job)?, None, false)?;
            tx.commit()?;
            log::info!("File removed, job {} cancelled", job.id);
            Ok(Some(job))
        })?;
        Ok(job)
    }

    /// Leases up to `limit` eligible jobs for `owner`, oldest first.
    pub fn claim_next(&self, owner: &str, limit: u32, lease: Duration) -> Result<Vec<Job>, StoreError> {
        self.claim_next_at(owner, limit, lease, Utc::now())
    }

    pub fn claim_next_at(
        &self,
        owner: &str,
        limit: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + lease).timestamp_millis();

        let rows = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut claimed = Vec::new();
            for id in job_repo::claimable_ids(&tx, now_ms, limit)? {
                if job_repo::try_lease(&tx, &id, owner, expires_ms, now_ms)? {
                    if let Some(row) = job_repo::find_by_id(&tx, &id)? {
                        claimed.push(row);
                    }
                }
            }
            tx.commit()?;
            Ok(claimed)
        })?;

        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>, _>>()?;
        if !jobs.is_empty() {
            log::debug!("{} claimed {} job(s)", owner, jobs.len());
        }
        Ok(jobs)
    }

    /// Persists intermediate progress and extends the lease.
    pub fn checkpoint(&self, job: &mut Job, lease: Duration) -> Result<(), StoreError> {
        let now = Utc::now();
        job.updated_at = now;
        job.lease_expires_at = Some(now + lease);
        self.write_owned(job, true)
    }

    /// Persists the job's final state for this tick and releases the lease.
    pub fn commit(&self, job: &mut Job) -> Result<(), StoreError> {
        job.updated_at = Utc::now();
        self.write_owned(job, false)?;
        job.lease_owner = None;
        job.lease_expires_at = None;
        Ok(())
    }

    /// Gives the lease back without recording any progress.
    pub fn release(&self, job: &mut Job) -> Result<(), StoreError> {
        let Some(owner) = job.lease_owner.clone() else {
            return Ok(());
        };
        self.db
            .with_conn(|conn| job_repo::release_lease(conn, &job.id, &owner))?;
        job.lease_owner = None;
        job.lease_expires_at = None;
        Ok(())
    }

    fn write_owned(&self, job: &mut Job, keep_lease: bool) -> Result<(), StoreError> {
        let id = job.id.clone();
        let owner = job
            .lease_owner
            .clone()
            .ok_or_else(|| StoreError::LeaseLost { id: id.clone() })?;

        let changed = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let target = job.source_path.to_string_lossy().into_owned();
            let occupant = job_repo::find_by_path(&tx, &target)?.filter(|o| o.id != job.id);
            if let Some(occupant) = occupant {
                if occupant.status == JobStatus::Removed.as_str() {
                    job_repo::delete(&tx, &occupant.id)?;
                } else if let Some(stored) = job_repo::find_by_id(&tx, &job.id)? {
                    // Only identical content is ever adopted, so a live job
                    // already owning the path makes this one its duplicate.
                    log::info!(
                        "Job {} duplicates job {} at {}, retiring it",
                        job.id,
                        occupant.id,
                        target
                    );
                    job.source_path = PathBuf::from(stored.source_path);
                    job.status = JobStatus::Removed;
                    job.not_before = None;
                    job.completed_at = None;
                }
            }
            let changed = job_repo::update(&tx, &JobRow::from_job(job)?, Some(&owner), keep_lease)?;
            tx.commit()?;
            Ok(changed)
        })?;

        if changed == 0 {
            return Err(StoreError::LeaseLost { id });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = self.db.with_conn(|conn| job_repo::find_by_id(conn, id))?;
        Ok(row.map(JobRow::into_job).transpose()?)
    }

    pub fn find_by_path(&self, path: &Path) -> Result<Option<Job>, StoreError> {
        let path = path.to_string_lossy();
        let row = self.db.with_conn(|conn| job_repo::find_by_path(conn, &path))?;
        Ok(row.map(JobRow::into_job).transpose()?)
    }

    pub fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let filter = JobFilter {
            status,
            ..Default::default()
        };
        let rows = self.db.with_conn(|conn| job_repo::query(conn, &filter))?;
        Ok(rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

/// Folds an observation into an existing job.
fn apply_observation(
    conn: &rusqlite::Connection,
    mut job: Job,
    event: &FileEvent,
    hash: &str,
    now: DateTime<Utc>,
) -> Result<Job, DatabaseError> {
    if job.is_leased_at(now) {
        job_repo::touch(conn, &job.id, hash, &crate::jobs::format_timestamp(now))?;
        job.content_hash = hash.to_string();
        job.updated_at = now;
        return Ok(job);
    }

    let same_content = job.content_hash == hash;
    match job.status {
        JobStatus::Removed if same_content => {
            if job.completed_at.is_some() {
                job.status = JobStatus::Done;
            } else {
                job.redetect(hash.to_string());
            }
            log::info!("Removed file reappeared, job {} restored as {}", job.id, job.status);
        }
        _ if same_content => {}
        _ => {
            log::info!("Content changed, re-detecting job {}", job.id);
            job.redetect(hash.to_string());
        }
    }

    if job.source_path != event.path {
        log::debug!(
            "Job {} moved: {} -> {}",
            job.id,
            job.source_path.display(),
            event.path.display()
        );
        job.source_path = event.path.clone();
    }
    job.updated_at = now;
    job_repo::update(conn, &JobRow::from_job(&job)?, None, true)?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap())
    }

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_created_event_inserts_detected_job() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();

        let job = store.upsert(&FileEvent::created(path.clone())).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Detected);
        assert_eq!(job.source_path, path);
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_event_for_vanished_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let result = store
            .upsert(&FileEvent::created(dir.path().join("gone.epub")))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_removed_unknown_path_is_noop() {
        let store = store();
        let result = store
            .upsert(&FileEvent::removed("/nowhere/a.epub".into()))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_removed_cancels_pending_job() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path.clone())).unwrap();

        std::fs::remove_file(&path).unwrap();
        let job = store.upsert(&FileEvent::removed(path)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Removed);
        assert!(store.claim_next("w", 10, Duration::minutes(1)).unwrap().is_empty());
    }

    #[test]
    fn test_removed_while_leased_leaves_job_to_worker() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path.clone())).unwrap();
        let claimed = store.claim_next("w", 1, Duration::minutes(5)).unwrap();

        let job = store.upsert(&FileEvent::removed(path)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Detected);
        assert_eq!(job.lease_owner, claimed[0].lease_owner);
    }

    #[test]
    fn test_rename_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let old = write(&dir, "a.epub", b"one");
        let store = store();
        let job = store.upsert(&FileEvent::created(old.clone())).unwrap().unwrap();

        let new = dir.path().join("b.epub");
        std::fs::rename(&old, &new).unwrap();
        let moved = store
            .upsert(&FileEvent::renamed(old, new.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(moved.id, job.id);
        assert_eq!(moved.source_path, new);
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_move_seen_as_create_matches_by_hash() {
        let dir = TempDir::new().unwrap();
        let old = write(&dir, "a.epub", b"same bytes");
        let store = store();
        let job = store.upsert(&FileEvent::created(old.clone())).unwrap().unwrap();

        let new = dir.path().join("sub.epub");
        std::fs::rename(&old, &new).unwrap();
        let moved = store.upsert(&FileEvent::created(new.clone())).unwrap().unwrap();
        assert_eq!(moved.id, job.id);
        assert_eq!(moved.source_path, new);
    }

    #[test]
    fn test_copy_is_a_distinct_job() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.epub", b"same bytes");
        let b = write(&dir, "b.epub", b"same bytes");
        let store = store();
        let ja = store.upsert(&FileEvent::created(a)).unwrap().unwrap();
        let jb = store.upsert(&FileEvent::created(b)).unwrap().unwrap();
        assert_ne!(ja.id, jb.id);
    }

    #[test]
    fn test_terminal_job_redetected_only_on_content_change() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path.clone())).unwrap();

        let mut job = store.claim_next("w", 1, Duration::minutes(5)).unwrap().remove(0);
        job.advance(JobStatus::Done, Utc::now());
        store.commit(&mut job).unwrap();

        let same = store.upsert(&FileEvent::modified(path.clone())).unwrap().unwrap();
        assert_eq!(same.status, JobStatus::Done);

        std::fs::write(&path, b"two").unwrap();
        let changed = store.upsert(&FileEvent::modified(path)).unwrap().unwrap();
        assert_eq!(changed.status, JobStatus::Detected);
        assert_eq!(changed.attempt, 0);
        assert!(changed.completed_at.is_none());
    }

    #[test]
    fn test_removed_done_job_restored_when_file_returns() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path.clone())).unwrap();
        let mut job = store.claim_next("w", 1, Duration::minutes(5)).unwrap().remove(0);
        job.advance(JobStatus::Done, Utc::now());
        store.commit(&mut job).unwrap();

        std::fs::remove_file(&path).unwrap();
        store.upsert(&FileEvent::removed(path.clone())).unwrap();
        std::fs::write(&path, b"one").unwrap();
        let restored = store.upsert(&FileEvent::created(path)).unwrap().unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.status, JobStatus::Done);
    }

    #[test]
    fn test_claim_respects_limit_and_order() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let t0 = Utc::now();
        for (i, name) in ["a.epub", "b.epub", "c.epub"].iter().enumerate() {
            let path = write(&dir, name, name.as_bytes());
            store
                .upsert_at(&FileEvent::created(path), t0 + Duration::seconds(i as i64))
                .unwrap();
        }

        let now = t0 + Duration::seconds(10);
        let first = store.claim_next_at("w1", 2, Duration::minutes(1), now).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].source_path.ends_with("a.epub"));
        assert!(first[1].source_path.ends_with("b.epub"));

        let second = store.claim_next_at("w2", 5, Duration::minutes(1), now).unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0].source_path.ends_with("c.epub"));
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        let t0 = Utc::now();
        store.upsert_at(&FileEvent::created(path), t0).unwrap();

        let lease = Duration::seconds(30);
        assert_eq!(store.claim_next_at("w1", 1, lease, t0).unwrap().len(), 1);
        assert!(store
            .claim_next_at("w2", 1, lease, t0 + Duration::seconds(10))
            .unwrap()
            .is_empty());
        let reclaimed = store
            .claim_next_at("w2", 1, lease, t0 + Duration::seconds(31))
            .unwrap();
        assert_eq!(reclaimed[0].lease_owner.as_deref(), Some("w2"));
    }

    #[test]
    fn test_commit_after_lease_lost_fails() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        let t0 = Utc::now() - Duration::minutes(10);
        store.upsert_at(&FileEvent::created(path), t0).unwrap();

        let mut stale = store
            .claim_next_at("w1", 1, Duration::seconds(1), t0)
            .unwrap()
            .remove(0);
        // w2 takes over after expiry.
        store.claim_next("w2", 1, Duration::minutes(5)).unwrap();

        stale.advance(JobStatus::MetadataPending, Utc::now());
        assert!(matches!(
            store.commit(&mut stale),
            Err(StoreError::LeaseLost { .. })
        ));
    }

    #[test]
    fn test_release_makes_job_claimable_again() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path)).unwrap();

        let mut job = store.claim_next("w1", 1, Duration::minutes(5)).unwrap().remove(0);
        store.release(&mut job).unwrap();
        assert!(job.lease_owner.is_none());
        assert_eq!(store.claim_next("w2", 1, Duration::minutes(5)).unwrap().len(), 1);
    }

    #[test]
    fn test_moving_onto_a_live_jobs_path_retires_the_duplicate() {
        let dir = TempDir::new().unwrap();
        let kept = write(&dir, "kept.epub", b"same");
        let copy = write(&dir, "copy.epub", b"other");
        let store = store();
        store.upsert(&FileEvent::created(kept.clone())).unwrap();
        store.upsert(&FileEvent::created(copy.clone())).unwrap();

        let mut jobs = store.claim_next("w1", 2, Duration::minutes(5)).unwrap();
        let mut dup = jobs.pop().unwrap();
        let mut owner = jobs.pop().unwrap();
        if dup.source_path != copy {
            std::mem::swap(&mut dup, &mut owner);
        }
        owner.advance(JobStatus::Done, Utc::now());
        store.commit(&mut owner).unwrap();

        // A crashed run left only the kept file; the copy's job adopts it.
        dup.source_path = kept.clone();
        dup.advance(JobStatus::Done, Utc::now());
        store.commit(&mut dup).unwrap();

        assert_eq!(dup.status, JobStatus::Removed);
        let stored = store.get(&dup.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Removed);
        assert_eq!(stored.source_path, copy);
        assert_eq!(store.find_by_path(&kept).unwrap().unwrap().id, owner.id);
    }

    #[test]
    fn test_checkpoint_keeps_lease() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.epub", b"one");
        let store = store();
        store.upsert(&FileEvent::created(path)).unwrap();

        let mut job = store.claim_next("w1", 1, Duration::minutes(5)).unwrap().remove(0);
        job.advance(JobStatus::MetadataPending, Utc::now());
        store.checkpoint(&mut job, Duration::minutes(5)).unwrap();

        let stored = store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::MetadataPending);
        assert_eq!(stored.lease_owner.as_deref(), Some("w1"));
        assert!(store.claim_next("w2", 1, Duration::minutes(5)).unwrap().is_empty());
    }
}
