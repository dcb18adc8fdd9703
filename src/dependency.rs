//! Job dependency resolution.
//!
//! A deferred job records its outstanding dependencies in the set
//! `deps:<id>` and their count in the counter `deps:<id>:pending`. Each
//! dependency lists the jobs waiting on it in `dependents:<dep>`.
//!
//! Resolving one edge removes the dependency from the dependent's set; only
//! the caller whose `set_remove` actually removed it decrements the
//! counter, so concurrent completions (or a completion racing with
//! registration) decrement each edge exactly once. Whoever brings the
//! counter to zero promotes the job into its origin queue.
//!
//! A dependency that fails never resolves its edge: the dependent stays
//! deferred until it is canceled or deleted.

use crate::{
    Result,
    connection::Connection,
    job::{Job, JobId, JobStatus},
    queue::Queue,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    conn: Connection,
}

impl DependencyResolver {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Registers the edges of a stored, `deferred` job.
    ///
    /// Dependencies that already finished are resolved immediately. Returns
    /// true when that left nothing outstanding and the job was promoted.
    pub async fn register(&self, job: &Job) -> Result<bool> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        let deps: BTreeSet<&JobId> = job.depends_on.iter().collect();
        if deps.is_empty() {
            return self.promote(&job.id).await;
        }

        store
            .set(&keys.pending_dependencies(&job.id), &deps.len().to_string())
            .await?;
        for dep in &deps {
            store.set_add(&keys.dependencies(&job.id), dep).await?;
        }
        for dep in &deps {
            store.set_add(&keys.dependents(dep), &job.id).await?;
        }

        // A dependency may have finished before its dependents entry existed;
        // re-check each one so that completion is not missed.
        let mut promoted = false;
        for dep in deps {
            let finished = matches!(
                self.conn.fetch_job(dep).await?,
                Some(ref d) if d.status == JobStatus::Finished
            );
            if finished && self.resolve_edge(&job.id, dep).await? {
                promoted = true;
            }
        }
        debug!(job_id = %job.id, promoted, "Registered job dependencies");
        Ok(promoted)
    }

    /// Resolves every edge pointing at a job that just finished. Returns the
    /// dependents that were promoted as a result.
    pub async fn on_job_finished(&self, job_id: &str) -> Result<Vec<JobId>> {
        let dependents = self.dependents_of(job_id).await?;
        let mut promoted = Vec::new();
        for dependent in dependents {
            if self.resolve_edge(&dependent, job_id).await? {
                promoted.push(dependent);
            }
        }
        if !promoted.is_empty() {
            info!(job_id = %job_id, promoted = promoted.len(), "Promoted dependent jobs");
        }
        Ok(promoted)
    }

    /// Removes a deferred job from the dependency graph (cancel or delete).
    pub async fn unregister(&self, job: &Job) -> Result<()> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        for dep in &job.depends_on {
            store.set_remove(&keys.dependents(dep), &job.id).await?;
        }
        store.delete(&keys.dependencies(&job.id)).await?;
        store.delete(&keys.pending_dependencies(&job.id)).await?;
        Ok(())
    }

    pub async fn dependents_of(&self, job_id: &str) -> Result<Vec<JobId>> {
        self.conn
            .store()
            .set_members(&self.conn.keys().dependents(job_id))
            .await
    }

    /// Dependencies of `job_id` that have not finished yet.
    pub async fn pending_dependencies(&self, job_id: &str) -> Result<Vec<JobId>> {
        self.conn
            .store()
            .set_members(&self.conn.keys().dependencies(job_id))
            .await
    }

    async fn resolve_edge(&self, dependent: &str, dependency: &str) -> Result<bool> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        if !store
            .set_remove(&keys.dependencies(dependent), dependency)
            .await?
        {
            return Ok(false);
        }
        store
            .set_remove(&keys.dependents(dependency), dependent)
            .await?;

        let remaining = store
            .incr_by(&keys.pending_dependencies(dependent), -1)
            .await?;
        if remaining > 0 {
            return Ok(false);
        }
        store.delete(&keys.pending_dependencies(dependent)).await?;
        self.promote(dependent).await
    }

    async fn promote(&self, job_id: &str) -> Result<bool> {
        let Some(mut job) = self.conn.fetch_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Deferred {
            debug!(job_id = %job_id, status = %job.status, "Skipping promotion of non-deferred job");
            return Ok(false);
        }
        let at_front = job.at_front;
        Queue::new(&job.origin.clone(), self.conn.clone())
            .enqueue_job(&mut job, at_front)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::{Map, json};

    async fn finish(conn: &Connection, job_id: &str) {
        let mut job = conn.load_job(job_id).await.unwrap();
        Queue::new(&job.origin, conn.clone()).remove(job_id).await.unwrap();
        job.mark_running("test", conn.now()).unwrap();
        job.mark_finished(json!(null), conn.now()).unwrap();
        conn.save_terminal(&job).await.unwrap();
        DependencyResolver::new(conn.clone())
            .on_job_finished(job_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dependent_waits_for_all_dependencies() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = queue
            .enqueue_call("a", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let b = queue
            .enqueue_call("b", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let c = queue
            .enqueue_call(
                "c",
                vec![],
                Map::new(),
                &JobOptions::new().depends_on(&a.id).depends_on(&b.id),
            )
            .await
            .unwrap();
        assert_eq!(c.status, JobStatus::Deferred);

        finish(&conn, &b.id).await;
        let c_now = conn.load_job(&c.id).await.unwrap();
        assert_eq!(c_now.status, JobStatus::Deferred);
        assert!(!queue.job_ids().await.unwrap().contains(&c.id));

        finish(&conn, &a.id).await;
        let c_now = conn.load_job(&c.id).await.unwrap();
        assert_eq!(c_now.status, JobStatus::Queued);
        assert_eq!(queue.job_ids().await.unwrap(), vec![c.id.clone()]);
    }

    #[tokio::test]
    async fn test_already_finished_dependency_enqueues_immediately() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = queue
            .enqueue_call("a", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        finish(&conn, &a.id).await;

        let b = queue
            .enqueue_call("b", vec![], Map::new(), &JobOptions::new().depends_on(&a.id))
            .await
            .unwrap();
        assert_eq!(b.status, JobStatus::Queued);
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_keeps_dependent_blocked() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = queue
            .enqueue_call("a", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let b = queue
            .enqueue_call("b", vec![], Map::new(), &JobOptions::new().depends_on(&a.id))
            .await
            .unwrap();

        let mut failed = conn.load_job(&a.id).await.unwrap();
        failed.mark_running("w", conn.now()).unwrap();
        failed
            .mark_failed(
                crate::job::FailureInfo::execution("ValueError", "boom", None),
                conn.now(),
            )
            .unwrap();
        conn.save_terminal(&failed).await.unwrap();

        let resolver = DependencyResolver::new(conn.clone());
        assert_eq!(resolver.pending_dependencies(&b.id).await.unwrap(), vec![a.id.clone()]);
        assert_eq!(resolver.dependents_of(&a.id).await.unwrap(), vec![b.id.clone()]);
        assert_eq!(conn.load_job(&b.id).await.unwrap().status, JobStatus::Deferred);
    }

    #[tokio::test]
    async fn test_edges_resolve_once_under_repeated_notifications() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = queue
            .enqueue_call("a", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let b = queue
            .enqueue_call("b", vec![], Map::new(), &JobOptions::new().depends_on(&a.id))
            .await
            .unwrap();
        finish(&conn, &a.id).await;

        let resolver = DependencyResolver::new(conn.clone());
        assert!(resolver.on_job_finished(&a.id).await.unwrap().is_empty());
        let ids = queue.job_ids().await.unwrap();
        assert_eq!(ids.iter().filter(|id| **id == b.id).count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_clears_edges() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = queue
            .enqueue_call("a", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let b = queue
            .enqueue_call("b", vec![], Map::new(), &JobOptions::new().depends_on(&a.id))
            .await
            .unwrap();

        let resolver = DependencyResolver::new(conn.clone());
        resolver.unregister(&b).await.unwrap();
        assert!(resolver.dependents_of(&a.id).await.unwrap().is_empty());
        assert!(resolver.pending_dependencies(&b.id).await.unwrap().is_empty());
    }
}
