//! Named ready lists.
//!
//! A [`Queue`] is a FIFO list of job ids stored under `queue:<name>`. Job
//! records live separately under `job:<id>`, so a queue entry is only a
//! pointer: workers pop an id and then load the record. Ids whose record has
//! vanished are skipped.
//!
//! # Examples
//!
//! ```rust
//! use serde_json::json;
//! use workhorse::{Connection, JobOptions, Queue};
//!
//! # #[tokio::main]
//! # async fn main() -> workhorse::Result<()> {
//! let conn = Connection::in_memory();
//! let queue = Queue::new("default", conn);
//!
//! let first = queue.enqueue_call("add", vec![json!(1), json!(2)], Default::default(), &JobOptions::new()).await?;
//! let second = queue.enqueue_call("add", vec![json!(3), json!(4)], Default::default(), &JobOptions::new()).await?;
//! assert_eq!(queue.count().await?, 2);
//!
//! let popped = queue.dequeue(None).await?.unwrap();
//! assert_eq!(popped.id, first.id);
//! # let _ = second;
//! # Ok(())
//! # }
//! ```

use crate::{
    Result, WorkhorseError,
    connection::{Connection, score_of},
    dependency::DependencyResolver,
    job::{DEFAULT_TIMEOUT, Job, JobId, JobOptions, JobStatus, ResultTtl},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub name: String,
    pub length: u64,
    /// Age of the longest-waiting job in the list.
    pub oldest_age: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    conn: Connection,
    default_timeout: Duration,
    default_result_ttl: ResultTtl,
}

impl Queue {
    pub fn new(name: &str, conn: Connection) -> Self {
        Self {
            name: name.to_string(),
            conn,
            default_timeout: DEFAULT_TIMEOUT,
            default_result_ttl: ResultTtl::default(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_result_ttl(mut self, result_ttl: ResultTtl) -> Self {
        self.default_result_ttl = result_ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn key(&self) -> String {
        self.conn.keys().queue(&self.name)
    }

    fn unavailable(&self, err: WorkhorseError) -> WorkhorseError {
        match err {
            WorkhorseError::StoreUnavailable { message } => WorkhorseError::QueueUnavailable {
                queue: self.name.clone(),
                message,
            },
            other => other,
        }
    }

    /// Builds a job from a call and places it in this queue.
    ///
    /// Jobs with unfinished dependencies are stored as `deferred` and handed
    /// to the [`DependencyResolver`] instead of being pushed. Every
    /// dependency must exist when the job is submitted.
    pub async fn enqueue_call(
        &self,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        let mut job = self.build_job(func_name, args, kwargs, options)?;

        for dep in &job.depends_on {
            if self.conn.fetch_job(dep).await?.is_none() {
                return Err(WorkhorseError::NotFound { id: dep.clone() });
            }
        }

        self.conn.insert_job(&job).await?;

        if job.status == JobStatus::Deferred {
            self.conn
                .store()
                .set_add(&self.conn.keys().queues(), &self.name)
                .await
                .map_err(|e| self.unavailable(e))?;
            let resolver = DependencyResolver::new(self.conn.clone());
            if resolver.register(&job).await? {
                job = self.conn.load_job(&job.id).await?;
            } else {
                info!(job_id = %job.id, queue = %self.name, deps = job.depends_on.len(), "Job deferred until dependencies finish");
            }
        } else {
            let at_front = job.at_front;
            self.enqueue_job(&mut job, at_front).await?;
        }
        Ok(job)
    }

    /// Applies this queue's defaults to a new job without persisting it.
    pub(crate) fn build_job(
        &self,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        let mut job =
            Job::from_options(func_name, args, kwargs, options, &self.name, self.conn.now())?;
        job.origin = self.name.clone();
        if job.timeout.is_none() {
            job.timeout = Some(self.default_timeout);
        }
        if options.result_ttl.is_none() {
            job.result_ttl = self.default_result_ttl;
        }
        Ok(job)
    }

    /// Pushes an already-stored job into this queue and marks it `queued`.
    pub async fn enqueue_job(&self, job: &mut Job, at_front: bool) -> Result<JobId> {
        let now = self.conn.now();
        job.origin = self.name.clone();
        job.mark_enqueued(now)?;

        let store = self.conn.store();
        let keys = self.conn.keys();
        self.conn.save_job(job).await.map_err(|e| self.unavailable(e))?;
        store
            .set_add(&keys.queues(), &self.name)
            .await
            .map_err(|e| self.unavailable(e))?;
        if let Some(deadline) = job.ttl_deadline() {
            store
                .sorted_set_add(&keys.ttl(), &job.id, score_of(deadline))
                .await
                .map_err(|e| self.unavailable(e))?;
        }

        let length = if at_front {
            store.list_push_front(&self.key(), &job.id).await
        } else {
            store.list_push_back(&self.key(), &job.id).await
        }
        .map_err(|e| self.unavailable(e))?;

        debug!(job_id = %job.id, queue = %self.name, at_front, length, "Job enqueued");
        Ok(job.id.clone())
    }

    /// Pops the next job from this queue. `None` polls once; `Some(timeout)`
    /// waits up to `timeout` for work.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        let names = [self.name.clone()];
        Ok(Self::dequeue_any(&self.conn, &names, timeout)
            .await?
            .map(|(_, job)| job))
    }

    /// Pops from the first non-empty queue in `queue_names`, in order.
    ///
    /// Returns the queue name the job came from. Ids whose record no longer
    /// exists are dropped and the pop is retried.
    pub async fn dequeue_any(
        conn: &Connection,
        queue_names: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, Job)>> {
        let keys: Vec<String> = queue_names.iter().map(|n| conn.keys().queue(n)).collect();
        let deadline = timeout.map(|t| Instant::now() + t);
        let store = conn.store();

        loop {
            let popped = match deadline {
                None => {
                    let mut hit = None;
                    for key in &keys {
                        if let Some(id) = store.list_pop_front(key).await? {
                            hit = Some((key.clone(), id));
                            break;
                        }
                    }
                    hit
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    store.list_pop_front_blocking(&keys, remaining).await?
                }
            };

            let Some((key, job_id)) = popped else {
                return Ok(None);
            };

            match conn.fetch_job(&job_id).await? {
                Some(job) => {
                    let name = conn
                        .keys()
                        .queue_name_from_key(&key)
                        .unwrap_or(job.origin.as_str())
                        .to_string();
                    return Ok(Some((name, job)));
                }
                None => {
                    warn!(job_id = %job_id, key = %key, "Dropping queue entry without a job record");
                }
            }
        }
    }

    /// Removes a job id from the list. Removing an absent id is not an error.
    pub async fn remove(&self, job_id: &str) -> Result<bool> {
        let removed = self.conn.store().list_remove(&self.key(), job_id).await?;
        Ok(removed > 0)
    }

    pub async fn count(&self) -> Result<u64> {
        self.conn.store().list_len(&self.key()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    pub async fn job_ids(&self) -> Result<Vec<JobId>> {
        self.conn.store().list_range(&self.key()).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.job_ids().await? {
            if let Some(job) = self.conn.fetch_job(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Removes every ready job from the queue and deletes their records.
    /// Returns how many jobs were removed.
    pub async fn empty(&self) -> Result<u64> {
        let store = self.conn.store();
        let mut removed = 0;
        while let Some(id) = store.list_pop_front(&self.key()).await? {
            self.conn.purge_record(&id).await?;
            removed += 1;
        }
        info!(queue = %self.name, removed, "Emptied queue");
        Ok(removed)
    }

    pub async fn oldest_age(&self) -> Result<Option<Duration>> {
        let now = self.conn.now();
        let oldest = self
            .jobs()
            .await?
            .into_iter()
            .filter_map(|job| job.enqueued_at)
            .min();
        Ok(oldest.map(|at| (now - at).to_std().unwrap_or_default()))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            name: self.name.clone(),
            length: self.count().await?,
            oldest_age: self.oldest_age().await?,
        })
    }

    /// Every queue name that has received a job, sorted.
    pub async fn all_queue_names(conn: &Connection) -> Result<Vec<String>> {
        let mut names = conn.store().set_members(&conn.keys().queues()).await?;
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, store::MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    async fn call(queue: &Queue, n: i64) -> Result<Job> {
        queue
            .enqueue_call("echo", vec![json!(n)], Map::new(), &JobOptions::new())
            .await
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::new("default", Connection::in_memory());
        let a = call(&queue, 1).await.unwrap();
        let b = call(&queue, 2).await.unwrap();
        let c = call(&queue, 3).await.unwrap();

        for expected in [a, b, c] {
            let job = queue.dequeue(None).await.unwrap().unwrap();
            assert_eq!(job.id, expected.id);
        }
        assert!(queue.dequeue(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_at_front_is_served_first() {
        let queue = Queue::new("default", Connection::in_memory());
        call(&queue, 1).await.unwrap();
        let urgent = queue
            .enqueue_call("echo", vec![], Map::new(), &JobOptions::new().at_front(true))
            .await
            .unwrap();

        let job = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(job.id, urgent.id);
    }

    #[tokio::test]
    async fn test_queue_defaults_apply() {
        let queue = Queue::new("slow", Connection::in_memory())
            .with_default_timeout(Duration::from_secs(600))
            .with_default_result_ttl(ResultTtl::Forever);
        let job = call(&queue, 1).await.unwrap();
        assert_eq!(job.timeout, Some(Duration::from_secs(600)));
        assert_eq!(job.result_ttl, ResultTtl::Forever);
        assert_eq!(job.origin, "slow");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.enqueued_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_job_id() {
        let queue = Queue::new("default", Connection::in_memory());
        let options = JobOptions::new().job_id("report-42");
        queue
            .enqueue_call("echo", vec![], Map::new(), &options)
            .await
            .unwrap();
        let err = queue
            .enqueue_call("echo", vec![], Map::new(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkhorseError::DuplicateJobId { .. }));
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_not_found() {
        let queue = Queue::new("default", Connection::in_memory());
        let err = queue
            .enqueue_call("echo", vec![], Map::new(), &JobOptions::new().depends_on("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkhorseError::NotFound { id } if id == "ghost"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let queue = Queue::new("default", Connection::in_memory());
        let job = call(&queue, 1).await.unwrap();
        assert!(queue.remove(&job.id).await.unwrap());
        assert!(!queue.remove(&job.id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_any_prefers_first_listed_queue() {
        let conn = Connection::in_memory();
        let high = Queue::new("high", conn.clone());
        let low = Queue::new("low", conn.clone());
        call(&low, 1).await.unwrap();
        let urgent = call(&high, 2).await.unwrap();

        let names = vec!["high".to_string(), "low".to_string()];
        let (queue_name, job) = Queue::dequeue_any(&conn, &names, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue_name, "high");
        assert_eq!(job.id, urgent.id);
    }

    #[tokio::test]
    async fn test_dequeue_skips_dangling_ids() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        conn.store()
            .list_push_back(&conn.keys().queue("default"), "missing")
            .await
            .unwrap();
        let real = call(&queue, 1).await.unwrap();

        let job = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(job.id, real.id);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_times_out() {
        let queue = Queue::new("default", Connection::in_memory());
        let job = queue
            .dequeue(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_empty_deletes_records() {
        let conn = Connection::in_memory();
        let queue = Queue::new("default", conn.clone());
        let a = call(&queue, 1).await.unwrap();
        call(&queue, 2).await.unwrap();

        assert_eq!(queue.empty().await.unwrap(), 2);
        assert_eq!(queue.count().await.unwrap(), 0);
        assert!(conn.fetch_job(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_and_queue_names() {
        let clock = MockClock::new();
        let conn = Connection::in_memory().with_clock(Arc::new(clock.clone()));
        let queue = Queue::new("emails", conn.clone());
        call(&queue, 1).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        call(&queue, 2).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.oldest_age, Some(Duration::from_secs(30)));

        Queue::new("reports", conn.clone());
        let names = Queue::all_queue_names(&conn).await.unwrap();
        assert_eq!(names, vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_queue_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let conn = Connection::new(store.clone());
        let queue = Queue::new("default", conn.clone());
        let mut job = Job::new("echo", "default", conn.now());
        conn.insert_job(&job).await.unwrap();

        store.set_available(false);
        let err = queue.enqueue_job(&mut job, false).await.unwrap_err();
        assert!(matches!(err, WorkhorseError::QueueUnavailable { queue, .. } if queue == "default"));
    }
}
