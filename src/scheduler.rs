//! Time and cron based scheduling.
//!
//! Scheduled work is a sorted set (`scheduled`) of entry members scored by
//! activation time in milliseconds. Each member is `<sequence>:<job id>`
//! where the zero-padded sequence comes from an atomic counter, so entries
//! due at the same instant fire in the order they were scheduled. The entry
//! details (mode, queue, run count) live at `schedule:<job id>`.
//!
//! A tick claims every due member with one atomic pop, so two schedulers
//! ticking at the same moment never promote the same entry twice.
//!
//! One-shot entries enqueue the scheduled job itself. Interval and cron
//! entries treat the scheduled job as a template: every firing enqueues a
//! fresh run job (with `scheduled_by` and `run` in its meta) and re-inserts
//! the entry for its next activation. When the repeat budget runs out the
//! template is marked finished with the number of runs as its result.

use crate::{
    Result, WorkhorseError,
    connection::{Connection, score_of},
    cron::CronSchedule,
    dependency::DependencyResolver,
    job::{DEFAULT_QUEUE, DEFAULT_TIMEOUT, Job, JobId, JobOptions, JobStatus, ResultTtl, generate_job_id},
    queue::Queue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Meta keys that only make sense on a schedule template.
const TEMPLATE_META_KEYS: [&str; 4] = ["cron_string", "interval", "repeat", "timezone"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScheduleMode {
    Once,
    Interval {
        interval: Duration,
        /// Remaining additional runs; `None` repeats forever.
        repeat: Option<u32>,
    },
    Cron {
        pattern: String,
        timezone: String,
        repeat: Option<u32>,
    },
}

/// When a scheduled job should first run.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    At(DateTime<Utc>),
    After(Duration),
    Cron { pattern: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledEntry {
    pub job_id: JobId,
    pub queue: String,
    pub activation_time: DateTime<Utc>,
    pub mode: ScheduleMode,
    pub member: String,
    /// How many times this entry has fired.
    pub runs: u64,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    conn: Connection,
    queue_name: String,
    interval: Duration,
    default_timeout: Duration,
    default_result_ttl: ResultTtl,
}

impl Scheduler {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            queue_name: DEFAULT_QUEUE.to_string(),
            interval: Duration::from_secs(60),
            default_timeout: DEFAULT_TIMEOUT,
            default_result_ttl: ResultTtl::default(),
        }
    }

    /// Queue used for jobs scheduled without an explicit queue.
    pub fn with_queue_name(mut self, queue_name: &str) -> Self {
        self.queue_name = queue_name.to_string();
        self
    }

    /// How often the run loop checks for due entries.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_result_ttl(mut self, result_ttl: ResultTtl) -> Self {
        self.default_result_ttl = result_ttl;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(WorkhorseError::InvalidInterval {
                message: "scheduler interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    fn queue_for(&self, options: &JobOptions) -> Queue {
        Queue::new(options.queue_name(&self.queue_name), self.conn.clone())
            .with_default_timeout(self.default_timeout)
            .with_default_result_ttl(self.default_result_ttl)
    }

    /// Schedules a job to run at `activation_time`, optionally repeating every
    /// `options.interval` for `options.repeat` additional runs.
    pub async fn schedule(
        &self,
        activation_time: DateTime<Utc>,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
    ) -> Result<Job> {
        if options.repeat.is_some() && options.interval.is_none() {
            return Err(WorkhorseError::InvalidInterval {
                message: "repeat requires an interval".to_string(),
            });
        }
        if options.interval.is_some_and(|i| i.is_zero()) {
            return Err(WorkhorseError::InvalidInterval {
                message: "interval must be greater than zero".to_string(),
            });
        }
        if !options.depends_on.is_empty() {
            return Err(WorkhorseError::InvalidOptions {
                message: "scheduled jobs cannot declare dependencies".to_string(),
            });
        }

        let queue = self.queue_for(options);
        let mut job = queue.build_job(func_name, args, kwargs, options)?;
        job.status = JobStatus::Scheduled;
        let mode = match options.interval {
            Some(interval) => {
                job.meta
                    .insert("interval".to_string(), json!(interval.as_secs_f64()));
                if let Some(repeat) = options.repeat {
                    job.meta.insert("repeat".to_string(), json!(repeat));
                }
                ScheduleMode::Interval {
                    interval,
                    repeat: options.repeat,
                }
            }
            None => ScheduleMode::Once,
        };

        self.conn.insert_job(&job).await?;
        self.store_entry(&job.id, &job.origin, activation_time, mode, 0)
            .await?;
        info!(job_id = %job.id, func = %job.func_name, at = %activation_time, "Job scheduled");
        Ok(job)
    }

    /// Registers a recurring job under `job_id`. Registering the same id
    /// again replaces the previous entry rather than adding a second one.
    pub async fn cron(
        &self,
        pattern: &str,
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
        job_id: &str,
    ) -> Result<Job> {
        let timezone = options.timezone.clone().unwrap_or_else(|| "UTC".to_string());
        let schedule = CronSchedule::with_timezone(pattern, &timezone)?;
        if !options.depends_on.is_empty() {
            return Err(WorkhorseError::InvalidOptions {
                message: "cron jobs cannot declare dependencies".to_string(),
            });
        }

        if let Some(existing) = self.conn.fetch_job(job_id).await? {
            if !existing.meta.contains_key("cron_string") {
                return Err(WorkhorseError::DuplicateJobId {
                    id: job_id.to_string(),
                });
            }
            self.cancel(job_id).await?;
            self.conn.purge_record(job_id).await?;
            debug!(job_id = %job_id, "Replacing existing cron registration");
        }

        let now = self.conn.now();
        let first = schedule
            .next_execution(now)
            .ok_or_else(|| WorkhorseError::InvalidOptions {
                message: format!("cron pattern {} never fires", pattern),
            })?;

        let options = options.clone().job_id(job_id);
        let queue = self.queue_for(&options);
        let mut job = queue.build_job(func_name, args, kwargs, &options)?;
        job.status = JobStatus::Scheduled;
        job.meta.insert("cron_string".to_string(), json!(pattern));
        job.meta.insert("timezone".to_string(), json!(timezone));
        if let Some(repeat) = options.repeat {
            job.meta.insert("repeat".to_string(), json!(repeat));
        }

        self.conn.insert_job(&job).await?;
        let mode = ScheduleMode::Cron {
            pattern: pattern.to_string(),
            timezone,
            repeat: options.repeat,
        };
        self.store_entry(&job.id, &job.origin, first, mode, 0).await?;
        info!(job_id = %job.id, pattern = %pattern, next = %first, "Cron job registered");
        Ok(job)
    }

    /// Removes a job's entry from the schedule. Returns whether one existed.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let Some(entry) = self.entry(job_id).await? else {
            return Ok(false);
        };
        let store = self.conn.store();
        store
            .sorted_set_remove(&self.conn.keys().scheduled(), &entry.member)
            .await?;
        store
            .delete(&self.conn.keys().schedule_entry(job_id))
            .await?;
        debug!(job_id = %job_id, "Schedule entry removed");
        Ok(true)
    }

    pub async fn entry(&self, job_id: &str) -> Result<Option<ScheduledEntry>> {
        match self
            .conn
            .store()
            .get(&self.conn.keys().schedule_entry(job_id))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self) -> Result<u64> {
        self.conn
            .store()
            .sorted_set_len(&self.conn.keys().scheduled())
            .await
    }

    /// Scheduled jobs with their next activation time, soonest first.
    /// `until` limits the result to entries due at or before that instant.
    pub async fn get_jobs(&self, until: Option<DateTime<Utc>>) -> Result<Vec<(Job, DateTime<Utc>)>> {
        let max_score = until.map(score_of).unwrap_or(f64::INFINITY);
        let members = self
            .conn
            .store()
            .sorted_set_range_by_score(&self.conn.keys().scheduled(), max_score)
            .await?;

        let mut jobs = Vec::with_capacity(members.len());
        for (member, _) in members {
            let Some((_, job_id)) = member.split_once(':') else {
                continue;
            };
            let (Some(entry), Some(job)) =
                (self.entry(job_id).await?, self.conn.fetch_job(job_id).await?)
            else {
                continue;
            };
            jobs.push((job, entry.activation_time));
        }
        Ok(jobs)
    }

    /// Promotes every entry due by now. Returns the ids of the jobs enqueued.
    pub async fn tick(&self) -> Result<Vec<JobId>> {
        self.tick_at(self.conn.now()).await
    }

    /// Promotes every entry due at or before `now`.
    ///
    /// If promotion fails part way (the store went away), the claimed but
    /// unprocessed entries are put back so the next tick retries them.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let store = self.conn.store();
        let scheduled = self.conn.keys().scheduled();
        let due = store
            .sorted_set_pop_before(&scheduled, score_of(now))
            .await?;

        let mut enqueued = Vec::new();
        let mut claimed = due.into_iter();
        while let Some((member, score)) = claimed.next() {
            match self.fire(&member, now).await {
                Ok(Some(job_id)) => enqueued.push(job_id),
                Ok(None) => {}
                Err(err) => {
                    for (member, score) in std::iter::once((member, score)).chain(claimed) {
                        if let Err(e) = store.sorted_set_add(&scheduled, &member, score).await {
                            warn!(member = %member, error = %e, "Could not return schedule entry");
                        }
                    }
                    return Err(err);
                }
            }
        }

        if !enqueued.is_empty() {
            debug!(count = enqueued.len(), "Scheduler promoted due jobs");
        }
        Ok(enqueued)
    }

    async fn fire(&self, member: &str, now: DateTime<Utc>) -> Result<Option<JobId>> {
        let Some((_, job_id)) = member.split_once(':') else {
            warn!(member = %member, "Ignoring malformed schedule member");
            return Ok(None);
        };
        let Some(mut entry) = self.entry(job_id).await? else {
            debug!(job_id = %job_id, "Schedule entry vanished before firing");
            return Ok(None);
        };
        if entry.member != member {
            // Superseded by a re-registration.
            return Ok(None);
        }

        let entry_key = self.conn.keys().schedule_entry(job_id);
        let template = match self.conn.fetch_job(job_id).await? {
            Some(job) if job.status == JobStatus::Scheduled => job,
            _ => {
                self.conn.store().delete(&entry_key).await?;
                return Ok(None);
            }
        };
        let queue = Queue::new(&entry.queue, self.conn.clone());

        match entry.mode.clone() {
            ScheduleMode::Once => {
                let mut job = template;
                let at_front = job.at_front;
                queue.enqueue_job(&mut job, at_front).await?;
                self.conn.store().delete(&entry_key).await?;
                info!(job_id = %job.id, queue = %entry.queue, "Scheduled job enqueued");
                Ok(Some(job.id))
            }
            ScheduleMode::Interval { interval, repeat } => {
                let run_id = self.enqueue_run(template, &mut entry, &queue, now).await?;
                match repeat {
                    Some(0) => self.complete(job_id, &entry, now).await?,
                    remaining => {
                        let next = chrono::Duration::from_std(interval)
                            .ok()
                            .and_then(|d| now.checked_add_signed(d))
                            .ok_or_else(|| WorkhorseError::InvalidInterval {
                                message: format!("interval {:?} is out of range", interval),
                            })?;
                        let mode = ScheduleMode::Interval {
                            interval,
                            repeat: remaining.map(|r| r - 1),
                        };
                        self.store_entry(job_id, &entry.queue, next, mode, entry.runs)
                            .await?;
                    }
                }
                Ok(Some(run_id))
            }
            ScheduleMode::Cron {
                pattern,
                timezone,
                repeat,
            } => {
                let run_id = self.enqueue_run(template, &mut entry, &queue, now).await?;
                let next = CronSchedule::with_timezone(&pattern, &timezone)?.next_execution(now);
                match (repeat, next) {
                    (Some(0), _) | (_, None) => self.complete(job_id, &entry, now).await?,
                    (remaining, Some(next)) => {
                        let mode = ScheduleMode::Cron {
                            pattern,
                            timezone,
                            repeat: remaining.map(|r| r - 1),
                        };
                        self.store_entry(job_id, &entry.queue, next, mode, entry.runs)
                            .await?;
                    }
                }
                Ok(Some(run_id))
            }
        }
    }

    /// Enqueues one run of a repeating template.
    async fn enqueue_run(
        &self,
        mut template: Job,
        entry: &mut ScheduledEntry,
        queue: &Queue,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        entry.runs += 1;

        let mut run = template.clone();
        run.id = generate_job_id();
        run.status = JobStatus::Queued;
        run.created_at = now;
        run.enqueued_at = None;
        for key in TEMPLATE_META_KEYS {
            run.meta.remove(key);
        }
        run.meta
            .insert("scheduled_by".to_string(), json!(template.id));
        run.meta.insert("run".to_string(), json!(entry.runs));

        self.conn.insert_job(&run).await?;
        let at_front = run.at_front;
        queue.enqueue_job(&mut run, at_front).await?;

        template.meta.insert("runs".to_string(), json!(entry.runs));
        template
            .meta
            .insert("last_run_id".to_string(), json!(run.id));
        self.conn.save_job(&template).await?;

        info!(job_id = %run.id, template = %template.id, run = entry.runs, "Scheduled run enqueued");
        Ok(run.id)
    }

    /// Retires a repeating template once its repeat budget is spent.
    async fn complete(&self, job_id: &str, entry: &ScheduledEntry, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .store()
            .delete(&self.conn.keys().schedule_entry(job_id))
            .await?;
        let mut template = self.conn.load_job(job_id).await?;
        template.mark_finished(json!({ "runs": entry.runs }), now)?;
        self.conn.save_terminal(&template).await?;
        DependencyResolver::new(self.conn.clone())
            .on_job_finished(job_id)
            .await?;
        info!(job_id = %job_id, runs = entry.runs, "Schedule exhausted");
        Ok(())
    }

    async fn store_entry(
        &self,
        job_id: &str,
        queue: &str,
        activation_time: DateTime<Utc>,
        mode: ScheduleMode,
        runs: u64,
    ) -> Result<ScheduledEntry> {
        let store = self.conn.store();
        let keys = self.conn.keys();
        let sequence = store.incr_by(&keys.schedule_sequence(), 1).await?;
        let entry = ScheduledEntry {
            job_id: job_id.to_string(),
            queue: queue.to_string(),
            activation_time,
            mode,
            member: format!("{:020}:{}", sequence, job_id),
            runs,
        };
        store
            .set(&keys.schedule_entry(job_id), &serde_json::to_string(&entry)?)
            .await?;
        store
            .sorted_set_add(&keys.scheduled(), &entry.member, score_of(activation_time))
            .await?;
        Ok(entry)
    }

    /// Ticks once (burst) or keeps ticking every interval until Ctrl-C.
    pub async fn run(&self, burst: bool) -> Result<()> {
        self.validate()?;
        if burst {
            let enqueued = self.tick().await?;
            info!(enqueued = enqueued.len(), "Scheduler burst finished");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_until(shutdown_rx).await
    }

    /// Ticks every interval until a message arrives on `shutdown_rx`.
    /// Failed ticks are logged and retried on the next interval.
    pub async fn run_until(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        self.validate()?;
        info!(interval = ?self.interval, "Scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed, retrying next interval");
                    }
                }
            }
        }
        Ok(())
    }
}
