//! Housekeeping passes over time-indexed sets.
//!
//! Two sorted sets drive maintenance:
//!
//! - `ttl` scores queued jobs by the instant they stop being eligible to run.
//!   Expired entries are pulled out of their queue and failed with
//!   `ttl_expired`.
//! - `expiring` scores terminal jobs by the instant their result ttl runs
//!   out. Expired records are deleted.
//!
//! Both passes claim entries with an atomic pop, so concurrent workers never
//! process the same entry twice.

use crate::{
    Result,
    connection::{Connection, score_of},
    job::{FailureInfo, JobStatus},
    queue::Queue,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: u64,
    pub reclaimed: u64,
}

#[derive(Debug, Clone)]
pub struct Maintenance {
    conn: Connection,
}

impl Maintenance {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let report = MaintenanceReport {
            expired: self.expire_queued().await?,
            reclaimed: self.reclaim().await?,
        };
        if report != MaintenanceReport::default() {
            info!(expired = report.expired, reclaimed = report.reclaimed, "Maintenance pass finished");
        }
        Ok(report)
    }

    /// Fails queued jobs whose ttl elapsed before a worker picked them up.
    pub async fn expire_queued(&self) -> Result<u64> {
        let now = self.conn.now();
        let key = self.conn.keys().ttl();
        let due = self
            .conn
            .store()
            .sorted_set_pop_before(&key, score_of(now))
            .await?;

        let mut expired = 0;
        let mut claimed = due.into_iter();
        while let Some((job_id, score)) = claimed.next() {
            match self.expire_one(&job_id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    self.put_back(&key, std::iter::once((job_id, score)).chain(claimed))
                        .await;
                    return Err(err);
                }
            }
        }
        Ok(expired)
    }

    async fn expire_one(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut job) = self.conn.fetch_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        let Some(ttl) = job.ttl else {
            return Ok(false);
        };

        Queue::new(&job.origin, self.conn.clone())
            .remove(&job.id)
            .await?;
        job.mark_failed(FailureInfo::ttl_expired(ttl), now)?;
        self.conn.save_terminal(&job).await?;
        debug!(job_id = %job.id, queue = %job.origin, "Queued job expired");
        Ok(true)
    }

    /// Deletes terminal job records whose result ttl has run out.
    pub async fn reclaim(&self) -> Result<u64> {
        let now = self.conn.now();
        let key = self.conn.keys().expiring();
        let due = self
            .conn
            .store()
            .sorted_set_pop_before(&key, score_of(now))
            .await?;

        let mut reclaimed = 0;
        let mut claimed = due.into_iter();
        while let Some((job_id, score)) = claimed.next() {
            match self.reclaim_one(&job_id, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err) => {
                    self.put_back(&key, std::iter::once((job_id, score)).chain(claimed))
                        .await;
                    return Err(err);
                }
            }
        }
        Ok(reclaimed)
    }

    async fn reclaim_one(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(job) = self.conn.fetch_job(job_id).await? else {
            return Ok(false);
        };
        // Requeued since it was registered for reclamation.
        if !job.status.is_terminal() || job.expires_at.is_none_or(|at| at > now) {
            return Ok(false);
        }
        let purged = self.conn.purge_record(job_id).await?;
        if purged {
            debug!(job_id = %job_id, status = %job.status, "Reclaimed job record");
        }
        Ok(purged)
    }

    /// Returns claimed but unprocessed entries so the next pass sees them.
    async fn put_back(&self, key: &str, entries: impl Iterator<Item = (String, f64)>) {
        for (member, score) in entries {
            if let Err(e) = self.conn.store().sorted_set_add(key, &member, score).await {
                warn!(key = %key, member = %member, error = %e, "Could not return maintenance entry");
            }
        }
    }
}
