use crate::{
    Result, WorkhorseError,
    connection::Connection,
    dependency::DependencyResolver,
    job::{DEFAULT_QUEUE, DEFAULT_TIMEOUT, FailureInfo, FailureReason, Job, JobStatus},
    lease::LeaseRegistry,
    maintenance::Maintenance,
    metrics::PrometheusMetricsCollector,
    queue::Queue,
    registry::{ExceptionHandler, HandlerOutcome, JobContext, Registry},
    stats::{JobEvent, JobEventType, StatisticsCollector},
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, interval_at, sleep},
};
use tracing::{debug, error, info, warn};

/// What happened to a single claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed(FailureReason),
    /// The job was no longer `queued` when claimed (canceled or already
    /// handled) and was dropped.
    Skipped,
}

/// Counters for one `work` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkSummary {
    pub processed: u64,
    pub finished: u64,
    pub failed: u64,
}

impl WorkSummary {
    fn add(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Finished => {
                self.processed += 1;
                self.finished += 1;
            }
            JobOutcome::Failed(_) => {
                self.processed += 1;
                self.failed += 1;
            }
            JobOutcome::Skipped => {}
        }
    }
}

pub struct Worker {
    name: String,
    conn: Connection,
    registry: Arc<Registry>,
    queues: Vec<String>,
    poll_timeout: Duration,
    heartbeat_interval: Duration,
    lease_duration: Duration,
    default_timeout: Duration,
    maintenance_interval: Duration,
    exception_handlers: Vec<(String, ExceptionHandler)>,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    metrics_collector: Option<Arc<PrometheusMetricsCollector>>,
    /// Jobs that ran but whose outcome could not be written yet.
    unsaved: Mutex<Vec<Job>>,
}

/// Attempts at writing a job outcome before it is parked for the next loop.
const COMPLETION_ATTEMPTS: u32 = 5;
const COMPLETION_BACKOFF: Duration = Duration::from_millis(50);

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("queues", &self.queues)
            .field("exception_handlers", &self.exception_handler_names())
            .finish()
    }
}

impl Worker {
    /// A worker listening on `queues` in priority order. An empty list means
    /// the default queue.
    pub fn new<S: AsRef<str>>(conn: Connection, registry: Arc<Registry>, queues: &[S]) -> Self {
        let mut names: Vec<String> = queues.iter().map(|q| q.as_ref().to_string()).collect();
        if names.is_empty() {
            names.push(DEFAULT_QUEUE.to_string());
        }
        let exception_handlers = registry.exception_handlers();
        Self {
            name: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            conn,
            registry,
            queues: names,
            poll_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            lease_duration: Duration::from_secs(60),
            default_timeout: DEFAULT_TIMEOUT,
            maintenance_interval: Duration::from_secs(60),
            exception_handlers,
            stats_collector: None,
            metrics_collector: None,
            unsaved: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// How long a blocking dequeue waits before checking for shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long a lease survives without a heartbeat before the job counts
    /// as orphaned.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Timeout for jobs that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Appends a handler after the ones inherited from the registry.
    pub fn with_exception_handler<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Job, &FailureInfo) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.exception_handlers.push((name.to_string(), Arc::new(f)));
        self
    }

    /// Drops every exception handler, inherited ones included.
    pub fn without_exception_handlers(mut self) -> Self {
        self.exception_handlers.clear();
        self
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_metrics_collector(mut self, metrics_collector: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics_collector = Some(metrics_collector);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn exception_handler_names(&self) -> Vec<String> {
        self.exception_handlers
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn leases(&self) -> LeaseRegistry {
        LeaseRegistry::new(self.conn.clone(), self.lease_duration)
    }

    /// Rejects zero intervals, which the heartbeat and polling timers cannot
    /// run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("poll timeout", self.poll_timeout),
            ("heartbeat interval", self.heartbeat_interval),
            ("lease duration", self.lease_duration),
            ("maintenance interval", self.maintenance_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(WorkhorseError::InvalidInterval {
                    message: format!("worker {} must be greater than zero", name),
                });
            }
        }
        Ok(())
    }

    /// Outcomes still waiting to be written after a store outage.
    pub fn unsaved_count(&self) -> usize {
        self.unsaved_jobs().len()
    }

    fn unsaved_jobs(&self) -> std::sync::MutexGuard<'_, Vec<Job>> {
        self.unsaved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Burst mode drains every ready job and returns; otherwise the worker
    /// runs until Ctrl-C.
    pub async fn work(&self, burst: bool) -> Result<WorkSummary> {
        if burst {
            return self.work_burst().await;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run(shutdown_rx).await
    }

    async fn work_burst(&self) -> Result<WorkSummary> {
        self.validate()?;
        info!(worker = %self.name, queues = ?self.queues, "Worker started in burst mode");
        let mut summary = WorkSummary::default();
        if self.conn.is_suspended().await? {
            info!(worker = %self.name, "Workers are suspended, leaving burst mode");
            return Ok(summary);
        }
        self.publish_exception_handlers().await?;
        self.flush_unsaved().await?;
        self.run_maintenance().await;

        while let Some((queue_name, job)) = Queue::dequeue_any(&self.conn, &self.queues, None).await? {
            match self.process_job(&queue_name, job).await {
                Ok(outcome) => summary.add(outcome),
                Err(e) => error!(worker = %self.name, error = %e, "Error processing job"),
            }
        }
        self.flush_unsaved().await?;

        info!(
            worker = %self.name,
            processed = summary.processed,
            finished = summary.finished,
            failed = summary.failed,
            "Worker burst finished"
        );
        Ok(summary)
    }

    /// Processes jobs until a message arrives on `shutdown_rx`.
    ///
    /// Shutdown is checked between jobs, so a job that already started runs
    /// to completion. Store errors are logged and retried after the poll
    /// timeout.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<WorkSummary> {
        self.validate()?;
        info!(worker = %self.name, queues = ?self.queues, "Worker started");
        if let Err(e) = self.publish_exception_handlers().await {
            warn!(worker = %self.name, error = %e, "Could not publish exception handlers");
        }

        let mut summary = WorkSummary::default();
        let mut last_maintenance: Option<Instant> = None;
        let mut suspended = false;
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(worker = %self.name, "Worker shutting down");
                break;
            }

            if let Err(e) = self.flush_unsaved().await {
                error!(worker = %self.name, error = %e, "Could not save job outcomes");
                sleep(self.poll_timeout).await;
                continue;
            }

            match self.conn.is_suspended().await {
                Ok(true) => {
                    if !suspended {
                        info!(worker = %self.name, "Workers suspended, waiting for resume");
                        suspended = true;
                    }
                    sleep(self.poll_timeout).await;
                    continue;
                }
                Ok(false) => {
                    if suspended {
                        info!(worker = %self.name, "Workers resumed");
                        suspended = false;
                    }
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Could not read suspension state");
                    sleep(self.poll_timeout).await;
                    continue;
                }
            }

            if last_maintenance.is_none_or(|at| at.elapsed() >= self.maintenance_interval) {
                self.run_maintenance().await;
                last_maintenance = Some(Instant::now());
            }

            match Queue::dequeue_any(&self.conn, &self.queues, Some(self.poll_timeout)).await {
                Ok(Some((queue_name, job))) => match self.process_job(&queue_name, job).await {
                    Ok(outcome) => summary.add(outcome),
                    Err(e) => error!(worker = %self.name, error = %e, "Error processing job"),
                },
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Error dequeuing job");
                    sleep(self.poll_timeout).await;
                }
            }
        }

        Ok(summary)
    }

    /// Runs one job in the calling task, then every dependent its completion
    /// released. The job must be queued; it is taken out of its queue first so
    /// no other worker picks it up.
    pub async fn perform_now(&self, job_id: &str) -> Result<Job> {
        self.validate()?;
        let resolver = DependencyResolver::new(self.conn.clone());
        let mut pending = VecDeque::from([job_id.to_string()]);
        while let Some(id) = pending.pop_front() {
            let job = self.conn.load_job(&id).await?;
            if job.status != JobStatus::Queued {
                continue;
            }
            let queue_name = job.origin.clone();
            if !Queue::new(&queue_name, self.conn.clone()).remove(&id).await? {
                // Another worker claimed it first.
                continue;
            }
            let dependents = resolver.dependents_of(&id).await?;
            self.process_job(&queue_name, job).await?;
            pending.extend(dependents);
        }
        self.conn.load_job(job_id).await
    }

    /// Runs one claimed job through its lifecycle.
    ///
    /// Once the handler has run, its outcome is kept even if the store goes
    /// away: writing it is retried with backoff, and if that fails the job is
    /// parked and written by the next loop iteration.
    pub async fn process_job(&self, queue_name: &str, mut job: Job) -> Result<JobOutcome> {
        self.validate()?;
        if job.status != JobStatus::Queued {
            debug!(job_id = %job.id, status = %job.status, "Skipping job that is no longer queued");
            return Ok(JobOutcome::Skipped);
        }

        let now = self.conn.now();
        if job.is_ttl_expired(now) {
            let failure = FailureInfo::ttl_expired(job.ttl.unwrap_or_default());
            job.mark_failed(failure, now)?;
            warn!(job_id = %job.id, queue = %queue_name, "Job expired before it could run");
            self.record_event(self.event(&job.id, queue_name, JobEventType::Expired))
                .await;
            self.complete(job).await?;
            return Ok(JobOutcome::Failed(FailureReason::TtlExpired));
        }

        job.mark_running(&self.name, now)?;
        self.conn.save_job(&job).await?;
        let leases = self.leases();
        leases.acquire(&job.id, &self.name).await?;
        debug!(job_id = %job.id, call = %job.call_string(), worker = %self.name, "Processing job");
        self.record_event(self.event(&job.id, queue_name, JobEventType::Started))
            .await;

        let started = Instant::now();
        let result = self.execute(&job, &leases).await;
        let processing_time_ms = started.elapsed().as_millis() as u64;
        let now = self.conn.now();

        let outcome = match result {
            Ok(value) => {
                job.mark_finished(value, now)?;
                info!(job_id = %job.id, queue = %queue_name, processing_time_ms, "Job finished");
                self.record_event(
                    self.event(&job.id, queue_name, JobEventType::Finished)
                        .with_processing_time(processing_time_ms),
                )
                .await;
                JobOutcome::Finished
            }
            Err(failure) => {
                self.handle_exception(&job, &failure);
                let event_type = match failure.reason {
                    FailureReason::Timeout => JobEventType::TimedOut,
                    _ => JobEventType::Failed,
                };
                let reason = failure.reason;
                warn!(job_id = %job.id, queue = %queue_name, error_type = %failure.error_type, error = %failure.message, "Job failed");
                let event = self
                    .event(&job.id, queue_name, event_type)
                    .with_processing_time(processing_time_ms)
                    .with_error(failure.message.clone());
                job.mark_failed(failure, now)?;
                self.record_event(event).await;
                JobOutcome::Failed(reason)
            }
        };

        self.complete(job).await?;
        Ok(outcome)
    }

    /// Writes a terminal job, promotes its dependents and releases its lease,
    /// retrying while the store is unavailable. A job that still cannot be
    /// written is parked for [`flush_unsaved`](Self::flush_unsaved).
    async fn complete(&self, job: Job) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.write_outcome(&job).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() && attempt < COMPLETION_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "Could not save job outcome, retrying");
                    sleep(COMPLETION_BACKOFF * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, status = %job.status, error = %e, "Parking job outcome until the store is back");
                    self.unsaved_jobs().push(job);
                    return Err(e);
                }
            }
        }
    }

    /// Every step is idempotent, so a partially written outcome can be
    /// written again from the start.
    async fn write_outcome(&self, job: &Job) -> Result<()> {
        self.conn.save_terminal(job).await?;
        if job.status == JobStatus::Finished {
            let promoted = DependencyResolver::new(self.conn.clone())
                .on_job_finished(&job.id)
                .await?;
            if !promoted.is_empty() {
                debug!(job_id = %job.id, promoted = promoted.len(), "Released dependents");
            }
        }
        self.leases().release(&job.id).await?;
        Ok(())
    }

    /// Writes outcomes parked by earlier store failures.
    pub async fn flush_unsaved(&self) -> Result<()> {
        let parked = std::mem::take(&mut *self.unsaved_jobs());
        let mut remaining = parked.into_iter();
        while let Some(job) = remaining.next() {
            if let Err(e) = self.write_outcome(&job).await {
                let mut unsaved = self.unsaved_jobs();
                unsaved.push(job);
                unsaved.extend(remaining);
                return Err(e);
            }
            info!(job_id = %job.id, status = %job.status, "Saved parked job outcome");
        }
        Ok(())
    }

    fn event(&self, job_id: &str, queue_name: &str, event_type: JobEventType) -> JobEvent {
        JobEvent::at(job_id, queue_name, event_type, self.conn.now())
    }

    /// Runs the handler on its own task, racing it against the job timeout
    /// and renewing the lease on every heartbeat.
    async fn execute(&self, job: &Job, leases: &LeaseRegistry) -> std::result::Result<Value, FailureInfo> {
        let handler = match self.registry.resolve(&job.func_name) {
            Ok(handler) => handler,
            Err(e) => return Err(FailureInfo::execution("UnknownFunction", e.to_string(), None)),
        };

        let limit = job.effective_timeout(self.default_timeout);
        let mut task = tokio::spawn(handler(JobContext::from_job(job)));
        let deadline = sleep(limit);
        tokio::pin!(deadline);
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(FailureInfo::from_handler_error(&err)),
                        Err(join_error) => Err(FailureInfo::execution("Panic", panic_message(join_error), None)),
                    };
                }
                _ = &mut deadline => {
                    task.abort();
                    return Err(FailureInfo::timeout(limit));
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = leases.heartbeat(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Passes a failure through the handler chain in order until one
    /// reports it handled.
    fn handle_exception(&self, job: &Job, failure: &FailureInfo) {
        for (name, handler) in &self.exception_handlers {
            if handler(job, failure) == HandlerOutcome::Handled {
                debug!(job_id = %job.id, handler = %name, "Exception handled");
                break;
            }
        }
    }

    /// Records this worker's handler chain under `exception-handlers`.
    async fn publish_exception_handlers(&self) -> Result<()> {
        let store = self.conn.store();
        let key = self.conn.keys().exception_handlers();
        store.delete(&key).await?;
        for (name, _) in &self.exception_handlers {
            store.list_push_back(&key, name).await?;
        }
        Ok(())
    }

    async fn run_maintenance(&self) {
        match Maintenance::new(self.conn.clone()).run_once().await {
            Ok(report) => debug!(worker = %self.name, expired = report.expired, reclaimed = report.reclaimed, "Maintenance pass"),
            Err(e) => warn!(worker = %self.name, error = %e, "Maintenance pass failed"),
        }

        if let Some(metrics) = &self.metrics_collector {
            for queue_name in &self.queues {
                let depth = Queue::new(queue_name, self.conn.clone()).count().await;
                if let Ok(depth) = depth {
                    if let Err(e) = metrics.update_queue_depth(queue_name, depth).await {
                        warn!(error = %e, "Failed to update queue depth metric");
                    }
                }
            }
        }
    }

    async fn record_event(&self, event: JobEvent) {
        if let Some(metrics) = &self.metrics_collector {
            if let Err(e) = metrics.record_job_event(&event).await {
                warn!("Failed to record metrics event: {}", e);
            }
        }
        if let Some(stats_collector) = &self.stats_collector {
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

/// Several workers sharing one shutdown.
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<Result<WorkSummary>>>,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn add_worker(&mut self, mut worker: Worker) {
        if let Some(stats_collector) = &self.stats_collector {
            worker.stats_collector = Some(Arc::clone(stats_collector));
        }
        self.workers.push(worker);
    }

    /// Spawns every added worker in continuous mode.
    pub fn start(&mut self) {
        info!("Starting worker pool with {} workers", self.workers.len());
        for worker in self.workers.drain(..) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);
            self.handles
                .push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
        }
    }

    /// Signals every worker and waits for them to finish their current job.
    pub async fn shutdown(&mut self) -> Result<WorkSummary> {
        info!("Shutting down worker pool");
        for tx in self.shutdown_tx.drain(..) {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to worker");
            }
        }

        let mut total = WorkSummary::default();
        for handle in self.handles.drain(..) {
            let summary = handle.await.map_err(|e| WorkhorseError::Worker {
                message: format!("Worker task failed: {}", e),
            })??;
            total.processed += summary.processed;
            total.finished += summary.finished;
            total.failed += summary.failed;
        }
        Ok(total)
    }

    /// Starts the pool and shuts it down on Ctrl-C.
    pub async fn run_until_ctrl_c(&mut self) -> Result<WorkSummary> {
        self.start();
        tokio::signal::ctrl_c().await?;
        self.shutdown().await
    }

    pub fn stats_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        self.stats_collector.clone()
    }
}
