//! The job record and its lifecycle.
//!
//! A [`Job`] is created from a function name, JSON arguments and
//! [`JobOptions`], and then moves through [`JobStatus`] states:
//!
//! ```text
//! deferred ──┐
//! scheduled ─┼─> queued ──> running ──> finished
//!            │     │           └──────> failed ──(requeue)──> queued
//!            └─────┴──> canceled
//! ```
//!
//! Status only moves forward, with two operator-driven exceptions: a failed
//! job may be requeued, and a running job whose lease expired may be
//! requeued as an orphan.

use crate::{Result, WorkhorseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

pub type JobId = String;

/// Name of the queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Maximum run time applied when neither the job nor its queue sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// How long finished job records are kept by default.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(500);

/// Generates a fresh job id (32 lowercase hex characters).
pub fn generate_job_id() -> JobId {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Deferred,
    Scheduled,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Deferred => "deferred",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Finished, failed and canceled jobs are never executed again without
    /// an explicit requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Canceled)
                | (Deferred, Queued)
                | (Deferred, Canceled)
                | (Scheduled, Queued)
                | (Scheduled, Finished)
                | (Scheduled, Canceled)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Queued)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WorkhorseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "deferred" => Ok(JobStatus::Deferred),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(WorkhorseError::InvalidOptions {
                message: format!("unknown job status: {}", other),
            }),
        }
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The handler returned an error, panicked, or could not be resolved.
    ExecutionError,
    /// The handler exceeded the job's timeout and was aborted.
    Timeout,
    /// The job sat in its queue longer than its ttl.
    TtlExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub reason: FailureReason,
    pub error_type: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl FailureInfo {
    pub fn execution(error_type: &str, message: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            reason: FailureReason::ExecutionError,
            error_type: error_type.to_string(),
            message: message.into(),
            traceback,
        }
    }

    /// Captures an `anyhow` error chain returned by a handler.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
        Self {
            reason: FailureReason::ExecutionError,
            error_type: "ExecutionError".to_string(),
            message: err.to_string(),
            traceback: Some(chain.join("\ncaused by: ")),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            reason: FailureReason::Timeout,
            error_type: "Timeout".to_string(),
            message: format!("Job exceeded maximum timeout value ({:?})", limit),
            traceback: None,
        }
    }

    pub fn ttl_expired(ttl: Duration) -> Self {
        Self {
            reason: FailureReason::TtlExpired,
            error_type: "TtlExpired".to_string(),
            message: format!("Job was not started within its ttl ({:?})", ttl),
            traceback: None,
        }
    }
}

/// Retention of a job record after it reaches a terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultTtl {
    /// Keep the record until it is deleted explicitly.
    Forever,
    /// Reclaim the record this long after it ends. Zero reclaims it on the
    /// next maintenance pass.
    For(Duration),
}

impl Default for ResultTtl {
    fn default() -> Self {
        ResultTtl::For(DEFAULT_RESULT_TTL)
    }
}

impl ResultTtl {
    pub fn expires_at(&self, ended_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ResultTtl::Forever => None,
            ResultTtl::For(ttl) => chrono::Duration::from_std(*ttl)
                .ok()
                .and_then(|ttl| ended_at.checked_add_signed(ttl)),
        }
    }
}

/// Per-submission options.
///
/// Every field is optional; unset fields fall back to the job definition's
/// defaults and then to the queue's.
///
/// ```rust
/// use std::time::Duration;
/// use workhorse::JobOptions;
///
/// let options = JobOptions::new()
///     .queue("emails")
///     .timeout(Duration::from_secs(30))
///     .depends_on("a1b2c3")
///     .meta("tenant", "acme");
/// assert_eq!(options.queue.as_deref(), Some("emails"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    pub queue: Option<String>,
    pub timeout: Option<Duration>,
    pub result_ttl: Option<ResultTtl>,
    pub ttl: Option<Duration>,
    pub depends_on: Vec<JobId>,
    pub job_id: Option<JobId>,
    pub at_front: bool,
    pub meta: Map<String, Value>,
    pub description: Option<String>,
    /// Re-run interval for scheduled jobs.
    pub interval: Option<Duration>,
    /// Number of additional runs for interval and cron schedules.
    pub repeat: Option<u32>,
    /// Timezone cron patterns are evaluated in.
    pub timezone: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ResultTtl::For(ttl));
        self
    }

    pub fn keep_result_forever(mut self) -> Self {
        self.result_ttl = Some(ResultTtl::Forever);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn depends_on(mut self, job_id: impl Into<JobId>) -> Self {
        self.depends_on.push(job_id.into());
        self
    }

    pub fn job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn at_front(mut self, at_front: bool) -> Self {
        self.at_front = at_front;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }

    /// Fills unset fields from `defaults`. Fields set on `self` win.
    pub fn or(mut self, defaults: &JobOptions) -> Self {
        self.queue = self.queue.or_else(|| defaults.queue.clone());
        self.timeout = self.timeout.or(defaults.timeout);
        self.result_ttl = self.result_ttl.or(defaults.result_ttl);
        self.ttl = self.ttl.or(defaults.ttl);
        if self.depends_on.is_empty() {
            self.depends_on = defaults.depends_on.clone();
        }
        self.job_id = self.job_id.or_else(|| defaults.job_id.clone());
        self.at_front = self.at_front || defaults.at_front;
        for (key, value) in &defaults.meta {
            self.meta.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.description = self.description.or_else(|| defaults.description.clone());
        self.interval = self.interval.or(defaults.interval);
        self.repeat = self.repeat.or(defaults.repeat);
        self.timezone = self.timezone.or_else(|| defaults.timezone.clone());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(WorkhorseError::InvalidOptions {
                    message: "timeout must be greater than zero".to_string(),
                });
            }
        }
        if let Some(id) = &self.job_id {
            if id.is_empty() || id.contains(char::is_whitespace) {
                return Err(WorkhorseError::InvalidOptions {
                    message: format!("invalid job id: {:?}", id),
                });
            }
        }
        if let Some(id) = &self.job_id {
            if self.depends_on.contains(id) {
                return Err(WorkhorseError::InvalidOptions {
                    message: format!("job {} cannot depend on itself", id),
                });
            }
        }
        Ok(())
    }

    /// The queue these options target, treating an empty name as unset.
    pub fn queue_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.queue.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => fallback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Queue the job is (or will be) placed in.
    pub origin: String,
    pub status: JobStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub ttl: Option<Duration>,
    pub result_ttl: ResultTtl,
    pub depends_on: Vec<JobId>,
    pub at_front: bool,
    pub result: Option<Value>,
    pub failure: Option<FailureInfo>,
    pub meta: Map<String, Value>,
    /// Name of the worker that last claimed the job.
    pub worker: Option<String>,
    /// When the record becomes eligible for reclamation.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(func_name: &str, origin: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_job_id(),
            func_name: func_name.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            origin: origin.to_string(),
            status: JobStatus::Queued,
            description: None,
            created_at: now,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            timeout: None,
            ttl: None,
            result_ttl: ResultTtl::default(),
            depends_on: Vec::new(),
            at_front: false,
            result: None,
            failure: None,
            meta: Map::new(),
            worker: None,
            expires_at: None,
        }
    }

    /// Builds a job from fully-merged options. The initial status is
    /// `deferred` when the options carry dependencies, `queued` otherwise;
    /// the scheduler overrides it to `scheduled`.
    pub fn from_options(
        func_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &JobOptions,
        default_queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        options.validate()?;
        if func_name.trim().is_empty() {
            return Err(WorkhorseError::InvalidOptions {
                message: "function name must not be empty".to_string(),
            });
        }

        let mut job = Job::new(func_name, options.queue_name(default_queue), now);
        if let Some(id) = &options.job_id {
            job.id = id.clone();
        }
        job.args = args;
        job.kwargs = kwargs;
        job.description = options.description.clone();
        job.timeout = options.timeout;
        job.ttl = options.ttl;
        job.result_ttl = options.result_ttl.unwrap_or_default();
        job.at_front = options.at_front;
        job.meta = options.meta.clone();

        let mut deps: Vec<JobId> = Vec::new();
        for dep in &options.depends_on {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        job.status = if deps.is_empty() {
            JobStatus::Queued
        } else {
            JobStatus::Deferred
        };
        job.depends_on = deps;
        Ok(job)
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Human-readable call description, e.g. `add(1, 2, scale=3)`.
    pub fn call_string(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        parts.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        format!("{}({})", self.func_name, parts.join(", "))
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WorkhorseError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_enqueued(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Queued {
            self.transition(JobStatus::Queued)?;
        }
        self.enqueued_at = Some(now);
        Ok(())
    }

    pub fn mark_running(&mut self, worker: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        self.worker = Some(worker.to_string());
        Ok(())
    }

    pub fn mark_finished(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Finished)?;
        self.result = Some(result);
        self.failure = None;
        self.ended_at = Some(now);
        self.expires_at = self.result_ttl.expires_at(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: FailureInfo, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.failure = Some(failure);
        self.ended_at = Some(now);
        self.expires_at = self.result_ttl.expires_at(now);
        Ok(())
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Canceled)?;
        self.ended_at = Some(now);
        self.expires_at = self.result_ttl.expires_at(now);
        Ok(())
    }

    /// Clears execution state so a failed or orphaned job can run again.
    pub fn reset_for_requeue(&mut self) -> Result<()> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::Running) {
            return Err(WorkhorseError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.failure = None;
        self.result = None;
        self.started_at = None;
        self.ended_at = None;
        self.expires_at = None;
        self.worker = None;
        Ok(())
    }

    /// When a queued job stops being eligible to run.
    pub fn ttl_deadline(&self) -> Option<DateTime<Utc>> {
        let enqueued_at = self.enqueued_at?;
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        enqueued_at.checked_add_signed(ttl)
    }

    pub fn is_ttl_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.ttl_deadline().is_some_and(|deadline| deadline <= now)
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_job_ids_are_hex_tokens() {
        let id = generate_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_job_id());
    }

    #[test]
    fn test_from_options_defaults() {
        let job = Job::from_options(
            "add",
            vec![json!(1), json!(2)],
            Map::new(),
            &JobOptions::new(),
            DEFAULT_QUEUE,
            now(),
        )
        .unwrap();

        assert_eq!(job.origin, "default");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.result_ttl, ResultTtl::For(DEFAULT_RESULT_TTL));
        assert_eq!(job.call_string(), "add(1, 2)");
    }

    #[test]
    fn test_from_options_with_dependencies_is_deferred() {
        let options = JobOptions::new()
            .depends_on("a")
            .depends_on("b")
            .depends_on("a")
            .queue("");
        let job =
            Job::from_options("report", vec![], Map::new(), &options, "default", now()).unwrap();
        assert_eq!(job.status, JobStatus::Deferred);
        assert_eq!(job.depends_on, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(job.origin, "default");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let options = JobOptions::new().timeout(Duration::ZERO);
        let err = Job::from_options("add", vec![], Map::new(), &options, "default", now())
            .unwrap_err();
        assert!(matches!(err, WorkhorseError::InvalidOptions { .. }));
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let options = JobOptions::new().job_id("x").depends_on("x");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_merge_prefers_call_site() {
        let defaults = JobOptions::new()
            .queue("math")
            .timeout(Duration::from_secs(10))
            .meta("owner", "billing");
        let merged = JobOptions::new()
            .timeout(Duration::from_secs(2))
            .meta("owner", "ops")
            .or(&defaults);

        assert_eq!(merged.queue.as_deref(), Some("math"));
        assert_eq!(merged.timeout, Some(Duration::from_secs(2)));
        assert_eq!(merged.meta["owner"], json!("ops"));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let start = now();
        let mut job = Job::new("add", "default", start);
        job.mark_enqueued(start).unwrap();
        job.mark_running("worker-1", start).unwrap();
        job.mark_finished(json!(3), start + chrono::Duration::seconds(1))
            .unwrap();

        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result, Some(json!(3)));
        assert_eq!(job.duration(), Some(chrono::Duration::seconds(1)));
        assert_eq!(
            job.expires_at,
            Some(start + chrono::Duration::seconds(1) + chrono::Duration::seconds(500))
        );

        let err = job.mark_enqueued(start).unwrap_err();
        assert!(matches!(err, WorkhorseError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_job_can_be_requeued() {
        let start = now();
        let mut job = Job::new("add", "default", start);
        job.mark_running("w", start).unwrap();
        job.mark_failed(FailureInfo::timeout(Duration::from_millis(10)), start)
            .unwrap();
        assert_eq!(job.failure.as_ref().unwrap().reason, FailureReason::Timeout);

        job.reset_for_requeue().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.failure.is_none());
        assert!(job.ended_at.is_none());
    }

    #[test]
    fn test_finished_job_cannot_be_requeued() {
        let start = now();
        let mut job = Job::new("add", "default", start);
        job.mark_running("w", start).unwrap();
        job.mark_finished(json!(null), start).unwrap();
        assert!(job.reset_for_requeue().is_err());
    }

    #[test]
    fn test_ttl_expiry() {
        let start = now();
        let mut job = Job::new("add", "default", start);
        job.ttl = Some(Duration::from_secs(5));
        job.mark_enqueued(start).unwrap();

        assert!(!job.is_ttl_expired(start + chrono::Duration::seconds(4)));
        assert!(job.is_ttl_expired(start + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_result_ttl_forever_never_expires() {
        let start = now();
        let mut job = Job::new("add", "default", start);
        job.result_ttl = ResultTtl::Forever;
        job.mark_canceled(start).unwrap();
        assert_eq!(job.expires_at, None);
    }

    #[test]
    fn test_handler_error_chain_is_captured() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let failure = FailureInfo::from_handler_error(&err);
        assert_eq!(failure.reason, FailureReason::ExecutionError);
        assert_eq!(failure.message, "writing report");
        assert!(failure.traceback.unwrap().contains("disk full"));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Deferred,
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
