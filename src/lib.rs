//! # Workhorse
//!
//! A Redis-backed background job queue for Rust with dependency ordering,
//! interval and cron scheduling, worker leases and Prometheus metrics.
//!
//! ## Features
//!
//! - **Named FIFO queues**: Jobs are pushed onto per-queue lists and popped by workers in order
//! - **Dependencies**: A job can wait on other jobs and is enqueued once all of them finish
//! - **Scheduling**: One-shot, fixed interval (with repeat budgets) and cron with timezones
//! - **Timeouts**: Per-job and worker-level execution limits, enforced by cancelling the handler
//! - **Leases**: Running jobs carry a heartbeated lease so orphans can be detected and requeued
//! - **Result retention**: Finished and failed records expire after a configurable result TTL
//! - **Suspension**: Operators can pause every worker, optionally until a deadline
//! - **Synchronous mode**: With `queue.is_async` off, jobs run in-process at submit time
//! - **Monitoring**: Prometheus metrics and in-memory statistics (metrics enabled by default)
//! - **Pluggable storage**: An in-memory store for tests and a Redis store behind the `redis` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use workhorse::{JobContext, JobOptions, JobStatus, Registry, Workhorse};
//!
//! #[tokio::main]
//! async fn main() -> workhorse::Result<()> {
//!     // Register the functions workers may run
//!     let mut registry = Registry::new();
//!     registry.register("add", |ctx: JobContext| async move {
//!         Ok(json!(ctx.arg::<i64>(0)? + ctx.arg::<i64>(1)?))
//!     });
//!
//!     // An in-memory client; use `Workhorse::from_config` for Redis
//!     let workhorse = Workhorse::in_memory(registry);
//!
//!     let job = workhorse
//!         .submit_job("add", vec![json!(1), json!(2)], Default::default(), &JobOptions::new())
//!         .await?;
//!
//!     // Drain the queue once and stop
//!     workhorse.worker_loop(&["default"], true).await?;
//!
//!     let job = workhorse.get_job(&job.id).await?;
//!     assert_eq!(job.status, JobStatus::Finished);
//!     assert_eq!(job.result, Some(json!(3)));
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] is a record of a function call: the registered function name,
//! JSON positional and keyword arguments, the queue it belongs to and its
//! lifecycle status. Statuses move along
//! `deferred | scheduled -> queued -> running -> finished | failed`, with
//! `canceled` reachable from any state before `running`.
//!
//! ### Queues and Workers
//!
//! A [`Queue`] is a named FIFO list of job ids. A [`Worker`] listens on one or
//! more queues in priority order, runs each job under a timeout and records the
//! outcome. A [`WorkerPool`] runs several workers and shuts them down together.
//!
//! ### Scheduler
//!
//! The [`Scheduler`] keeps jobs in a time-ordered set and promotes them to
//! their queue when they come due. Concurrent schedulers promote each entry
//! exactly once.
//!
//! ### Dependencies
//!
//! Jobs submitted with `depends_on` are `deferred` until every dependency has
//! finished. See [`dependency::DependencyResolver`].
//!
//! ## Feature Flags
//!
//! - `metrics` (default): Prometheus metrics collection
//! - `redis`: The Redis store backend and the `workhorse` binary

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod cron;
pub mod dependency;
pub mod error;
pub mod job;
pub mod lease;
pub mod logging;
pub mod maintenance;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod worker;

pub use client::{JobDefinition, Workhorse};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::WorkhorseConfig;
pub use connection::{Connection, Suspension};
pub use cron::{CronError, CronSchedule};
pub use dependency::DependencyResolver;
pub use error::WorkhorseError;
pub use job::{FailureInfo, FailureReason, Job, JobId, JobOptions, JobStatus, ResultTtl};
pub use lease::{Lease, LeaseRegistry};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metrics::{MetricsConfig, PrometheusMetricsCollector};
pub use queue::{Queue, QueueStats};
pub use registry::{ExceptionHandler, HandlerOutcome, JobContext, JobHandler, Registry};
pub use scheduler::{Activation, ScheduleMode, ScheduledEntry, Scheduler};
pub use stats::{InMemoryStatsCollector, JobStatistics, StatisticsCollector};
pub use store::{MemoryStore, Store};
pub use worker::{JobOutcome, WorkSummary, Worker, WorkerPool};

#[cfg(feature = "redis")]
pub use store::RedisStore;

/// Convenient type alias for Results with [`WorkhorseError`] as the error type.
///
/// This is used throughout the crate for consistent error handling.
pub type Result<T> = std::result::Result<T, WorkhorseError>;
