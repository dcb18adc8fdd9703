//! Leases on running jobs.
//!
//! A worker takes a lease when it starts a job and renews it with each
//! heartbeat. The lease record lives at `lease:<id>` and the job id is
//! scored by lease expiry in the `leases` sorted set, so orphans (jobs whose
//! worker stopped heartbeating) are a single range query away. Orphans are
//! only reported; requeueing them is an operator decision.

use crate::{
    Result,
    connection::{Connection, score_of},
    job::JobId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub job_id: JobId,
    pub worker: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaseRegistry {
    conn: Connection,
    duration: Duration,
}

impl LeaseRegistry {
    /// `duration` is how long a lease stays valid after each heartbeat.
    pub fn new(conn: Connection, duration: Duration) -> Self {
        Self { conn, duration }
    }

    pub fn lease_duration(&self) -> Duration {
        self.duration
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn acquire(&self, job_id: &str, worker: &str) -> Result<Lease> {
        let now = self.conn.now();
        let lease = Lease {
            job_id: job_id.to_string(),
            worker: worker.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            expires_at: self.expiry_from(now),
        };
        self.write(&lease).await?;
        debug!(job_id = %job_id, worker = %worker, "Lease acquired");
        Ok(lease)
    }

    /// Extends a held lease. A lease that was released in the meantime is
    /// not recreated.
    pub async fn heartbeat(&self, job_id: &str) -> Result<Option<Lease>> {
        let Some(mut lease) = self.get(job_id).await? else {
            return Ok(None);
        };
        let now = self.conn.now();
        lease.heartbeat_at = now;
        lease.expires_at = self.expiry_from(now);
        self.write(&lease).await?;
        Ok(Some(lease))
    }

    pub async fn release(&self, job_id: &str) -> Result<bool> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        store.sorted_set_remove(&keys.leases(), job_id).await?;
        store.delete(&keys.lease(job_id)).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Lease>> {
        match self.conn.store().get(&self.conn.keys().lease(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Leases that expired at or before now.
    pub async fn orphaned(&self) -> Result<Vec<Lease>> {
        let now = self.conn.now();
        let expired = self
            .conn
            .store()
            .sorted_set_range_by_score(&self.conn.keys().leases(), score_of(now))
            .await?;
        let mut leases = Vec::with_capacity(expired.len());
        for (job_id, _) in expired {
            if let Some(lease) = self.get(&job_id).await? {
                leases.push(lease);
            }
        }
        Ok(leases)
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.conn
            .store()
            .sorted_set_len(&self.conn.keys().leases())
            .await
    }

    async fn write(&self, lease: &Lease) -> Result<()> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        store
            .set(&keys.lease(&lease.job_id), &serde_json::to_string(lease)?)
            .await?;
        store
            .sorted_set_add(&keys.leases(), &lease.job_id, score_of(lease.expires_at))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    fn registry(clock: &MockClock) -> LeaseRegistry {
        let conn = Connection::in_memory().with_clock(Arc::new(clock.clone()));
        LeaseRegistry::new(conn, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_expired_lease_is_orphaned() {
        let clock = MockClock::new();
        let leases = registry(&clock);
        leases.acquire("job-1", "worker-a").await.unwrap();
        assert!(leases.orphaned().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        let orphans = leases.orphaned().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].worker, "worker-a");
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let clock = MockClock::new();
        let leases = registry(&clock);
        leases.acquire("job-1", "worker-a").await.unwrap();

        clock.advance(chrono::Duration::seconds(20));
        leases.heartbeat("job-1").await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(20));
        assert!(leases.orphaned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_removes_lease() {
        let clock = MockClock::new();
        let leases = registry(&clock);
        leases.acquire("job-1", "worker-a").await.unwrap();
        assert_eq!(leases.active_count().await.unwrap(), 1);

        assert!(leases.release("job-1").await.unwrap());
        assert_eq!(leases.active_count().await.unwrap(), 0);
        assert!(leases.heartbeat("job-1").await.unwrap().is_none());
    }
}
