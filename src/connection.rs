//! Shared handle to the store, key layout and clock.

use crate::{
    Result, WorkhorseError,
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobStatus},
    store::{Keys, MemoryStore, Store},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Converts a timestamp into a sorted-set score (milliseconds since epoch).
pub(crate) fn score_of(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64
}

/// Why and until when workers are paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub since: DateTime<Utc>,
    /// `None` holds until an explicit resume.
    pub until: Option<DateTime<Utc>>,
}

/// Everything the queue components need to talk to persisted state.
///
/// Cloning is cheap; all clones share the same store and clock.
#[derive(Clone)]
pub struct Connection {
    store: Arc<dyn Store>,
    keys: Keys,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("prefix", &self.keys.prefix())
            .finish()
    }
}

impl Connection {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            keys: Keys::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// A connection over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = Keys::new(prefix);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<Job>> {
        match self.store.get(&self.keys.job(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Like [`fetch_job`](Self::fetch_job) but a missing record is `NotFound`.
    pub async fn load_job(&self, job_id: &str) -> Result<Job> {
        self.fetch_job(job_id)
            .await?
            .ok_or_else(|| WorkhorseError::NotFound {
                id: job_id.to_string(),
            })
    }

    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        self.store.set(&self.keys.job(&job.id), &raw).await
    }

    /// Writes a brand new record; an existing record with the same id is a
    /// `DuplicateJobId`.
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        if !self.store.set_if_absent(&self.keys.job(&job.id), &raw).await? {
            return Err(WorkhorseError::DuplicateJobId { id: job.id.clone() });
        }
        Ok(())
    }

    /// Persists a job that just reached a terminal status and registers it
    /// for reclamation according to its result ttl.
    pub async fn save_terminal(&self, job: &Job) -> Result<()> {
        self.save_job(job).await?;
        if job.status == JobStatus::Failed {
            self.store.set_add(&self.keys.failed(), &job.id).await?;
        }
        if let Some(expires_at) = job.expires_at {
            self.store
                .sorted_set_add(&self.keys.expiring(), &job.id, score_of(expires_at))
                .await?;
        }
        debug!(job_id = %job.id, status = %job.status, "Saved terminal job state");
        Ok(())
    }

    /// Ids of every job currently in the failed registry.
    pub async fn failed_job_ids(&self) -> Result<Vec<JobId>> {
        self.store.set_members(&self.keys.failed()).await
    }

    /// Pauses every worker sharing this store, until `until` or until
    /// [`resume`](Self::resume). Workers finish the job in hand first.
    pub async fn suspend(&self, until: Option<DateTime<Utc>>) -> Result<Suspension> {
        let suspension = Suspension {
            since: self.now(),
            until,
        };
        self.store
            .set(&self.keys.suspended(), &serde_json::to_string(&suspension)?)
            .await?;
        info!(until = ?until, "Workers suspended");
        Ok(suspension)
    }

    /// Lifts a suspension. Returns whether one was in place.
    pub async fn resume(&self) -> Result<bool> {
        let resumed = self.store.delete(&self.keys.suspended()).await?;
        if resumed {
            info!("Workers resumed");
        }
        Ok(resumed)
    }

    /// The suspension in force now, if any. A lapsed suspension is cleared.
    pub async fn suspension(&self) -> Result<Option<Suspension>> {
        let Some(raw) = self.store.get(&self.keys.suspended()).await? else {
            return Ok(None);
        };
        let suspension: Suspension = serde_json::from_str(&raw)?;
        if suspension.until.is_some_and(|until| until <= self.now()) {
            self.store.delete(&self.keys.suspended()).await?;
            return Ok(None);
        }
        Ok(Some(suspension))
    }

    pub async fn is_suspended(&self) -> Result<bool> {
        Ok(self.suspension().await?.is_some())
    }

    /// Removes a job record and its bookkeeping entries outside of queues,
    /// the scheduler and the dependency graph.
    pub(crate) async fn purge_record(&self, job_id: &str) -> Result<bool> {
        self.store.set_remove(&self.keys.failed(), job_id).await?;
        self.store
            .sorted_set_remove(&self.keys.expiring(), job_id)
            .await?;
        self.store.sorted_set_remove(&self.keys.ttl(), job_id).await?;
        self.store.delete(&self.keys.job(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, job::FailureInfo};
    use std::time::Duration;

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let conn = Connection::in_memory();
        let job = Job::new("add", "default", conn.now()).with_id("fixed");
        conn.insert_job(&job).await.unwrap();

        let err = conn.insert_job(&job).await.unwrap_err();
        assert!(matches!(err, WorkhorseError::DuplicateJobId { id } if id == "fixed"));
    }

    #[tokio::test]
    async fn test_load_missing_job_is_not_found() {
        let conn = Connection::in_memory();
        let err = conn.load_job("nope").await.unwrap_err();
        assert!(matches!(err, WorkhorseError::NotFound { .. }));
        assert!(conn.fetch_job("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_terminal_registers_failure_and_expiry() {
        let clock = MockClock::new();
        let conn = Connection::in_memory().with_clock(Arc::new(clock.clone()));
        let mut job = Job::new("add", "default", conn.now());
        conn.insert_job(&job).await.unwrap();

        job.mark_running("w", conn.now()).unwrap();
        job.mark_failed(FailureInfo::timeout(Duration::from_secs(1)), conn.now())
            .unwrap();
        conn.save_terminal(&job).await.unwrap();

        assert_eq!(conn.failed_job_ids().await.unwrap(), vec![job.id.clone()]);
        let expiring = conn
            .store()
            .sorted_set_range_by_score(&conn.keys().expiring(), f64::MAX)
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);

        assert!(conn.purge_record(&job.id).await.unwrap());
        assert!(conn.failed_job_ids().await.unwrap().is_empty());
        assert!(conn.fetch_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_isolates_records() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = Connection::new(store.clone()).with_prefix("app-a");
        let b = Connection::new(store).with_prefix("app-b");

        let job = Job::new("add", "default", a.now());
        a.insert_job(&job).await.unwrap();
        assert!(a.fetch_job(&job.id).await.unwrap().is_some());
        assert!(b.fetch_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_suspension_lapses_at_deadline() {
        let clock = MockClock::new();
        let conn = Connection::in_memory().with_clock(Arc::new(clock.clone()));
        assert!(!conn.is_suspended().await.unwrap());

        conn.suspend(Some(clock.now() + chrono::Duration::seconds(30)))
            .await
            .unwrap();
        assert!(conn.is_suspended().await.unwrap());

        clock.advance(chrono::Duration::seconds(30));
        assert!(!conn.is_suspended().await.unwrap());
        assert!(!conn.resume().await.unwrap());

        conn.suspend(None).await.unwrap();
        clock.advance(chrono::Duration::days(30));
        assert!(conn.is_suspended().await.unwrap());
        assert!(conn.resume().await.unwrap());
        assert!(!conn.is_suspended().await.unwrap());
    }
}
