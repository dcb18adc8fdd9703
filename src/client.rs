//! The application-facing entry point.
//!
//! [`Workhorse`] ties a [`Connection`], a [`Registry`] and a
//! [`WorkhorseConfig`] together and exposes submit, schedule, inspect and
//! cancel operations plus the worker and scheduler loops.
//!
//! # Examples
//!
//! ```rust
//! use serde_json::json;
//! use workhorse::{JobContext, JobStatus, Registry, Workhorse};
//!
//! # #[tokio::main]
//! # async fn main() -> workhorse::Result<()> {
//! let mut registry = Registry::new();
//! registry.register("add", |ctx: JobContext| async move {
//!     Ok(json!(ctx.arg::<i64>(0)? + ctx.arg::<i64>(1)?))
//! });
//!
//! let workhorse = Workhorse::in_memory(registry);
//! let job = workhorse.job("add")?.submit(vec![json!(1), json!(2)]).await?;
//!
//! workhorse.worker_loop(&["default"], true).await?;
//! let job = workhorse.get_job(&job.id).await?;
//! assert_eq!(job.status, JobStatus::Finished);
//! assert_eq!(job.result, Some(json!(3)));
//! # Ok(())
//! # }
//! ```

use crate::{
    Result, WorkhorseError,
    config::{StoreBackend, WorkhorseConfig},
    connection::{Connection, Suspension},
    dependency::DependencyResolver,
    job::{Job, JobId, JobOptions, JobStatus},
    lease::{Lease, LeaseRegistry},
    metrics::PrometheusMetricsCollector,
    queue::{Queue, QueueStats},
    registry::Registry,
    scheduler::{Activation, Scheduler},
    stats::StatisticsCollector,
    store::{MemoryStore, Store},
    worker::{WorkSummary, Worker, WorkerPool},
};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{info, warn};

pub struct Workhorse {
    conn: Connection,
    registry: Arc<Registry>,
    config: WorkhorseConfig,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    metrics_collector: Option<Arc<PrometheusMetricsCollector>>,
}

impl std::fmt::Debug for Workhorse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workhorse")
            .field("conn", &self.conn)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Workhorse {
    pub fn new(conn: Connection, registry: Registry) -> Self {
        Self::with_config(conn, registry, WorkhorseConfig::default())
    }

    pub fn with_config(conn: Connection, registry: Registry, config: WorkhorseConfig) -> Self {
        Self {
            conn,
            registry: Arc::new(registry),
            config,
            stats_collector: None,
            metrics_collector: None,
        }
    }

    /// A client over a fresh in-memory store.
    pub fn in_memory(registry: Registry) -> Self {
        Self::new(Connection::in_memory(), registry)
    }

    /// Connects to the store `config` selects and prepares metrics when they
    /// are enabled.
    pub async fn from_config(config: WorkhorseConfig, registry: Registry) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "redis")]
            StoreBackend::Redis => Arc::new(crate::store::RedisStore::connect(&config.store.url).await?),
            #[cfg(not(feature = "redis"))]
            StoreBackend::Redis => {
                return Err(WorkhorseError::Config(
                    "the redis backend requires the `redis` feature".to_string(),
                ));
            }
        };
        let conn = Connection::new(store).with_prefix(&config.store.key_prefix);

        let metrics_collector = if config.metrics.enabled {
            Some(Arc::new(PrometheusMetricsCollector::new(
                config.metrics.to_metrics_config(),
            )?))
        } else {
            None
        };

        info!(backend = ?config.store.backend, prefix = %config.store.key_prefix, "Workhorse client ready");
        Ok(Self {
            conn,
            registry: Arc::new(registry),
            config,
            stats_collector: None,
            metrics_collector,
        })
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_metrics_collector(mut self, metrics_collector: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics_collector = Some(metrics_collector);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &WorkhorseConfig {
        &self.config
    }

    pub fn metrics_collector(&self) -> Option<&Arc<PrometheusMetricsCollector>> {
        self.metrics_collector.as_ref()
    }

    pub fn get_queue(&self, name: &str) -> Queue {
        Queue::new(name, self.conn.clone())
            .with_default_timeout(self.config.queue.default_timeout)
            .with_default_result_ttl(self.config.queue.default_result_ttl)
    }

    pub fn get_scheduler(&self) -> Scheduler {
        Scheduler::new(self.conn.clone())
            .with_queue_name(&self.config.scheduler.queue)
            .with_interval(self.config.scheduler.interval)
            .with_default_timeout(self.config.queue.default_timeout)
            .with_default_result_ttl(self.config.queue.default_result_ttl)
    }

    /// A worker configured from this client. An empty `queues` falls back to
    /// the configured queue list.
    pub fn get_worker<S: AsRef<str>>(&self, queues: &[S]) -> Worker {
        let queues: Vec<String> = if queues.is_empty() {
            self.config.queue.queues.clone()
        } else {
            queues.iter().map(|q| q.as_ref().to_string()).collect()
        };
        let settings = &self.config.worker;
        let mut worker = Worker::new(self.conn.clone(), self.registry.clone(), &queues)
            .with_poll_timeout(settings.poll_timeout)
            .with_heartbeat_interval(settings.heartbeat_interval)
            .with_lease_duration(settings.lease_duration)
            .with_maintenance_interval(settings.maintenance_interval)
            .with_default_timeout(self.config.queue.default_timeout);
        if let Some(stats) = &self.stats_collector {
            worker = worker.with_stats_collector(stats.clone());
        }
        if let Some(metrics) = &self.metrics_collector {
            worker = worker.with_metrics_collector(metrics.clone());
        }
        worker
    }

    /// `worker.pool_size` workers on the same queues.
    pub fn get_worker_pool<S: AsRef<str>>(&self, queues: &[S]) -> WorkerPool {
        let mut pool = WorkerPool::new();
        for _ in 0..self.config.worker.pool_size.max(1) {
            pool.add_worker(self.get_worker(queues));
        }
        pool
    }

    /// A handle for submitting calls to a registered function.
    pub fn job(&self, func_name: &str) -> Result<JobDefinition<'_>> {
        let function = self
            .registry
            .function(func_name)
            .ok_or_else(|| WorkhorseError::UnknownFunction {
                name: func_name.to_string(),
            })?;
        Ok(JobDefinition {
            client: self,
            func_name: func_name.to_string(),
            defaults: function.defaults().clone(),
        })
    }

    fn with_function_defaults(&self, func_name: &str, options: &JobOptions) -> JobOptions {
        match self.registry.function(func_name) {
            Some(function) => options.clone().or(function.defaults()),
            None => options.clone(),
        }
    }

    /// Creates a job and enqueues it, or parks it until its dependencies
    /// finish.
    ///
    /// With `queue.is_async` off the job runs before this returns, and the
    /// returned record carries its outcome.
    pub async fn submit_job(
        &self,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        let options = self.with_function_defaults(func_name, options);
        let queue = self.get_queue(options.queue_name(&self.config.queue.default_queue));
        let job = queue.enqueue_call(func_name, args, kwargs, &options).await?;
        info!(job_id = %job.id, func = %func_name, queue = %job.origin, status = %job.status, "Job submitted");
        if self.config.queue.is_async || job.status != JobStatus::Queued {
            return Ok(job);
        }
        self.get_worker(&[job.origin.as_str()]).perform_now(&job.id).await
    }

    pub async fn schedule_job(
        &self,
        activation: Activation,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        let options = self.with_function_defaults(func_name, options);
        let scheduler = self.get_scheduler();
        match activation {
            Activation::At(at) => scheduler.schedule(at, func_name, args, kwargs, &options).await,
            Activation::After(delay) => {
                let at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| self.conn.now().checked_add_signed(delay))
                    .ok_or_else(|| WorkhorseError::InvalidOptions {
                        message: format!("delay {:?} is out of range", delay),
                    })?;
                scheduler.schedule(at, func_name, args, kwargs, &options).await
            }
            Activation::Cron { pattern, name } => {
                scheduler
                    .cron(&pattern, func_name, args, kwargs, &options, &name)
                    .await
            }
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.conn.load_job(job_id).await
    }

    /// Cancels a job that has not started. Returns false when the job is
    /// already running or has reached a terminal status.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let mut job = self.conn.load_job(job_id).await?;
        match job.status {
            JobStatus::Queued => {
                self.get_queue(&job.origin).remove(job_id).await?;
            }
            JobStatus::Deferred => {
                DependencyResolver::new(self.conn.clone())
                    .unregister(&job)
                    .await?;
            }
            JobStatus::Scheduled => {
                self.get_scheduler().cancel(job_id).await?;
            }
            JobStatus::Running => {
                warn!(job_id = %job_id, "Cannot cancel a running job");
                return Ok(false);
            }
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled => return Ok(false),
        }

        job.mark_canceled(self.conn.now())?;
        self.conn.save_terminal(&job).await?;
        info!(job_id = %job_id, "Job canceled");
        Ok(true)
    }

    /// Puts a failed job, or a running job whose lease expired, back into its
    /// queue.
    pub async fn requeue_job(&self, job_id: &str) -> Result<Job> {
        let mut job = self.conn.load_job(job_id).await?;
        let leases = self.leases();
        if job.status == JobStatus::Running {
            let now = self.conn.now();
            if let Some(lease) = leases.get(job_id).await? {
                if lease.expires_at > now {
                    return Err(WorkhorseError::InvalidOptions {
                        message: format!("job {} is still running on {}", job_id, lease.worker),
                    });
                }
            }
        }
        job.reset_for_requeue()?;

        let store = self.conn.store();
        let keys = self.conn.keys();
        store.set_remove(&keys.failed(), job_id).await?;
        store.sorted_set_remove(&keys.expiring(), job_id).await?;
        leases.release(job_id).await?;

        let (origin, at_front) = (job.origin.clone(), job.at_front);
        self.get_queue(&origin)
            .enqueue_job(&mut job, at_front)
            .await?;
        info!(job_id = %job_id, queue = %job.origin, "Job requeued");
        Ok(job)
    }

    /// Requeues every job in the failed registry. Returns the requeued ids.
    pub async fn requeue_all_failed(&self) -> Result<Vec<JobId>> {
        let mut requeued = Vec::new();
        for job_id in self.conn.failed_job_ids().await? {
            match self.requeue_job(&job_id).await {
                Ok(job) => requeued.push(job.id),
                Err(WorkhorseError::NotFound { .. }) => {
                    self.conn
                        .store()
                        .set_remove(&self.conn.keys().failed(), &job_id)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    pub async fn failed_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for job_id in self.conn.failed_job_ids().await? {
            if let Some(job) = self.conn.fetch_job(&job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Removes a job record and every reference to it.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let job = self.conn.load_job(job_id).await?;
        self.get_queue(&job.origin).remove(job_id).await?;
        self.get_scheduler().cancel(job_id).await?;
        DependencyResolver::new(self.conn.clone())
            .unregister(&job)
            .await?;
        self.leases().release(job_id).await?;
        self.conn.purge_record(job_id).await?;
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    pub async fn empty_queue(&self, name: &str) -> Result<u64> {
        self.get_queue(name).empty().await
    }

    /// Length and oldest-job age per queue. An empty `names` reports every
    /// known queue.
    pub async fn queue_stats<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeMap<String, QueueStats>> {
        let names: Vec<String> = if names.is_empty() {
            Queue::all_queue_names(&self.conn).await?
        } else {
            names.iter().map(|n| n.as_ref().to_string()).collect()
        };

        let mut stats = BTreeMap::new();
        for name in names {
            let queue_stats = self.get_queue(&name).stats().await?;
            if let Some(metrics) = &self.metrics_collector {
                metrics
                    .update_queue_depth(&name, queue_stats.length)
                    .await?;
            }
            stats.insert(name, queue_stats);
        }
        Ok(stats)
    }

    /// Leases whose worker stopped heartbeating. Their jobs stay `running`
    /// until requeued with [`requeue_job`](Self::requeue_job).
    pub async fn orphaned_jobs(&self) -> Result<Vec<Lease>> {
        self.leases().orphaned().await
    }

    /// Exception handler names most recently published by a worker.
    pub async fn exception_handler_names(&self) -> Result<Vec<String>> {
        self.conn
            .store()
            .list_range(&self.conn.keys().exception_handlers())
            .await
    }

    /// Pauses every worker on this store, for `duration` or until
    /// [`resume`](Self::resume).
    pub async fn suspend(&self, duration: Option<Duration>) -> Result<Suspension> {
        let until = match duration {
            Some(duration) => Some(
                chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|duration| self.conn.now().checked_add_signed(duration))
                    .ok_or_else(|| WorkhorseError::InvalidOptions {
                        message: format!("suspension of {:?} is out of range", duration),
                    })?,
            ),
            None => None,
        };
        self.conn.suspend(until).await
    }

    pub async fn resume(&self) -> Result<bool> {
        self.conn.resume().await
    }

    pub async fn suspension(&self) -> Result<Option<Suspension>> {
        self.conn.suspension().await
    }

    pub async fn worker_loop<S: AsRef<str>>(&self, queue_names: &[S], burst: bool) -> Result<WorkSummary> {
        self.get_worker(queue_names).work(burst).await
    }

    /// Runs the scheduler. `interval` overrides the configured tick interval.
    pub async fn scheduler_loop(&self, interval: Option<Duration>, burst: bool) -> Result<()> {
        let mut scheduler = self.get_scheduler();
        if let Some(interval) = interval {
            scheduler = scheduler.with_interval(interval);
        }
        if let Some(metrics) = &self.metrics_collector {
            metrics
                .update_scheduled_jobs("default", scheduler.count().await?)
                .await?;
        }
        scheduler.run(burst).await
    }

    fn leases(&self) -> LeaseRegistry {
        LeaseRegistry::new(self.conn.clone(), self.config.worker.lease_duration)
    }
}

/// Submission handle for one registered function, carrying its defaults.
#[derive(Debug, Clone)]
pub struct JobDefinition<'a> {
    client: &'a Workhorse,
    func_name: String,
    defaults: JobOptions,
}

impl JobDefinition<'_> {
    pub fn name(&self) -> &str {
        &self.func_name
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub async fn submit(&self, args: Vec<Value>) -> Result<Job> {
        self.submit_with(args, Map::new(), &JobOptions::new()).await
    }

    pub async fn submit_with(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        self.client
            .submit_job(&self.func_name, args, kwargs, options)
            .await
    }

    pub async fn schedule(
        &self,
        activation: Activation,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        self.client
            .schedule_job(activation, &self.func_name, args, kwargs, options)
            .await
    }

    /// Registers this function on a cron pattern under the id `cron-<name>`.
    /// Registering the same name again replaces the earlier pattern; distinct
    /// names give one function several schedules.
    pub async fn cron(
        &self,
        pattern: &str,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        let activation = Activation::Cron {
            pattern: pattern.to_string(),
            name: format!("cron-{}", name),
        };
        self.schedule(activation, args, kwargs, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobContext;
    use serde_json::json;

    fn client() -> Workhorse {
        Workhorse::in_memory(registry())
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("add", |ctx: JobContext| async move {
                Ok(json!(ctx.arg::<i64>(0)? + ctx.arg::<i64>(1)?))
            })
            .on_queue("math");
        registry.register("fail", |_ctx: JobContext| async move {
            Err(anyhow::anyhow!("nope"))
        });
        registry
    }

    #[tokio::test]
    async fn test_function_defaults_apply_to_submissions() {
        let workhorse = client();
        let job = workhorse.job("add").unwrap().submit(vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(job.origin, "math");

        let job = workhorse
            .submit_job("add", vec![], Map::new(), &JobOptions::new().queue("other"))
            .await
            .unwrap();
        assert_eq!(job.origin, "other");
        assert!(matches!(workhorse.job("missing"), Err(WorkhorseError::UnknownFunction { .. })));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let workhorse = client();
        let job = workhorse.submit_job("fail", vec![], Map::new(), &JobOptions::new()).await.unwrap();

        assert!(workhorse.cancel_job(&job.id).await.unwrap());
        assert!(!workhorse.cancel_job(&job.id).await.unwrap());
        assert_eq!(workhorse.get_job(&job.id).await.unwrap().status, JobStatus::Canceled);
        assert_eq!(workhorse.get_queue("default").count().await.unwrap(), 0);

        assert!(matches!(
            workhorse.cancel_job("nope").await,
            Err(WorkhorseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_scheduled_job_removes_entry() {
        let workhorse = client();
        let job = workhorse
            .schedule_job(
                Activation::After(Duration::from_secs(60)),
                "fail",
                vec![],
                Map::new(),
                &JobOptions::new(),
            )
            .await
            .unwrap();
        assert!(workhorse.cancel_job(&job.id).await.unwrap());
        assert_eq!(workhorse.get_scheduler().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_failed_job() {
        let workhorse = client();
        let job = workhorse.submit_job("fail", vec![], Map::new(), &JobOptions::new()).await.unwrap();
        workhorse.worker_loop(&["default"], true).await.unwrap();
        assert_eq!(workhorse.failed_jobs().await.unwrap().len(), 1);

        let requeued = workhorse.requeue_all_failed().await.unwrap();
        assert_eq!(requeued, vec![job.id.clone()]);
        let job = workhorse.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.failure.is_none());
        assert!(workhorse.failed_jobs().await.unwrap().is_empty());

        let err = workhorse.requeue_job(&job.id).await.unwrap_err();
        assert!(matches!(err, WorkhorseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_delete_job_removes_everything() {
        let workhorse = client();
        let job = workhorse.submit_job("fail", vec![], Map::new(), &JobOptions::new()).await.unwrap();
        workhorse.delete_job(&job.id).await.unwrap();

        assert!(matches!(workhorse.get_job(&job.id).await, Err(WorkhorseError::NotFound { .. })));
        assert_eq!(workhorse.get_queue("default").count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_stats_for_all_queues() {
        let workhorse = client();
        workhorse.submit_job("add", vec![], Map::new(), &JobOptions::new()).await.unwrap();
        workhorse
            .submit_job("fail", vec![], Map::new(), &JobOptions::new())
            .await
            .unwrap();

        let stats = workhorse.queue_stats::<&str>(&[]).await.unwrap();
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["default", "math"]);
        assert_eq!(stats["math"].length, 1);
        assert!(stats["math"].oldest_age.is_some());
    }

    #[tokio::test]
    async fn test_job_definition_cron_is_keyed_by_name() {
        let workhorse = client();
        let definition = workhorse.job("add").unwrap();
        let args = || vec![json!(1), json!(1)];

        let hourly = definition
            .cron("0 * * * *", "hourly", args(), Map::new(), &JobOptions::new())
            .await
            .unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("label".to_string(), json!("nightly"));
        let daily = definition
            .cron("0 0 * * *", "daily", args(), kwargs, &JobOptions::new())
            .await
            .unwrap();
        assert_eq!(hourly.id, "cron-hourly");
        assert_eq!(daily.id, "cron-daily");
        assert_eq!(daily.kwargs["label"], json!("nightly"));
        assert_eq!(workhorse.get_scheduler().count().await.unwrap(), 2);

        let replaced = definition
            .cron("30 * * * *", "hourly", args(), Map::new(), &JobOptions::new())
            .await
            .unwrap();
        assert_eq!(replaced.meta["cron_string"], json!("30 * * * *"));
        assert_eq!(workhorse.get_scheduler().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_synchronous_mode_runs_on_submit() {
        let mut config = WorkhorseConfig::default();
        config.queue.is_async = false;
        let workhorse = Workhorse::with_config(Connection::in_memory(), registry(), config);

        let parent = workhorse
            .submit_job("add", vec![json!(2), json!(3)], Map::new(), &JobOptions::new())
            .await
            .unwrap();
        assert_eq!(parent.status, JobStatus::Finished);
        assert_eq!(parent.result, Some(json!(5)));
        assert_eq!(workhorse.get_queue("math").count().await.unwrap(), 0);

        let failed = workhorse.submit_job("fail", vec![], Map::new(), &JobOptions::new()).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_suspend_for_a_duration() {
        let workhorse = client();
        let suspension = workhorse.suspend(Some(Duration::from_secs(600))).await.unwrap();
        assert!(suspension.until.is_some());
        assert!(workhorse.suspension().await.unwrap().is_some());

        let job = workhorse.submit_job("fail", vec![], Map::new(), &JobOptions::new()).await.unwrap();
        let summary = workhorse.worker_loop(&["default"], true).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(workhorse.get_job(&job.id).await.unwrap().status, JobStatus::Queued);

        assert!(workhorse.resume().await.unwrap());
        let summary = workhorse.worker_loop(&["default"], true).await.unwrap();
        assert_eq!(summary.failed, 1);
    }
}
