use crate::{
    clock::{Clock, SystemClock},
    job::JobId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Statistics for job processing over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Jobs that reached an outcome (finished, failed, timed out or expired)
    pub total_processed: u64,
    /// Number of successfully finished jobs
    pub finished: u64,
    /// Number of jobs whose handler returned an error or panicked
    pub failed: u64,
    /// Number of jobs aborted by their timeout
    pub timed_out: u64,
    /// Number of jobs failed because their ttl elapsed in the queue
    pub expired: u64,
    /// Started jobs without an outcome in the window
    pub running: u64,
    /// Average processing time in milliseconds
    pub avg_processing_time_ms: f64,
    /// Minimum processing time in milliseconds
    pub min_processing_time_ms: u64,
    /// Maximum processing time in milliseconds
    pub max_processing_time_ms: u64,
    /// Job throughput per minute
    pub throughput_per_minute: f64,
    /// Error rate ((failed + timed out + expired) / total processed)
    pub error_rate: f64,
    /// Time window these statistics cover
    pub time_window: Duration,
    /// When these statistics were calculated
    pub calculated_at: DateTime<Utc>,
}

impl Default for JobStatistics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            finished: 0,
            failed: 0,
            timed_out: 0,
            expired: 0,
            running: 0,
            avg_processing_time_ms: 0.0,
            min_processing_time_ms: 0,
            max_processing_time_ms: 0,
            throughput_per_minute: 0.0,
            error_rate: 0.0,
            time_window: Duration::from_secs(60),
            calculated_at: Utc::now(),
        }
    }
}

/// Processing statistics for one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queue_name: String,
    pub statistics: JobStatistics,
}

/// Job processing event for statistics collection
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub queue_name: String,
    pub event_type: JobEventType,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// An event stamped with the system time.
    pub fn new(job_id: &str, queue_name: &str, event_type: JobEventType) -> Self {
        Self::at(job_id, queue_name, event_type, Utc::now())
    }

    /// An event stamped with `timestamp`, normally the connection clock's now.
    pub fn at(job_id: &str, queue_name: &str, event_type: JobEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            queue_name: queue_name.to_string(),
            event_type,
            processing_time_ms: None,
            error_message: None,
            timestamp,
        }
    }

    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = Some(processing_time_ms);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventType {
    Started,
    Finished,
    Failed,
    TimedOut,
    Expired,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Started => "started",
            JobEventType::Finished => "finished",
            JobEventType::Failed => "failed",
            JobEventType::TimedOut => "timed_out",
            JobEventType::Expired => "expired",
        }
    }

    fn is_outcome(&self) -> bool {
        !matches!(self, JobEventType::Started)
    }
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    /// Record a job processing event
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    /// Get statistics for a specific queue over a time window
    async fn get_queue_statistics(
        &self,
        queue_name: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    /// Get statistics for every queue that saw events in the window
    async fn get_all_statistics(&self, window: Duration) -> crate::Result<Vec<QueueStatistics>>;

    /// Get overall system statistics
    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;

    /// Clear statistics older than the specified duration
    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64>;
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
    /// Maximum age of events to keep (in seconds)
    pub max_event_age_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_event_age_secs: 3600,
        }
    }
}

/// In-memory statistics collector with time-windowed data.
///
/// Windows are measured against the collector's clock, which should be the
/// same clock the events were stamped with.
pub struct InMemoryStatsCollector {
    events: Arc<RwLock<Vec<JobEvent>>>,
    config: StatsConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryStatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStatsCollector")
            .field("events", &self.read_events().len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new_default()
    }
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new_default() -> Self {
        Self::new(StatsConfig::default())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cutoff(&self, window: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn read_events(&self) -> RwLockReadGuard<'_, Vec<JobEvent>> {
        self.events.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_events(&self) -> RwLockWriteGuard<'_, Vec<JobEvent>> {
        self.events.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn filter_events_by_window(&self, window: Duration) -> Vec<JobEvent> {
        let cutoff = self.cutoff(window);
        self.read_events()
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn calculate_statistics(&self, events: &[JobEvent], window: Duration) -> JobStatistics {
        let count = |kind: JobEventType| events.iter().filter(|e| e.event_type == kind).count() as u64;

        let started = count(JobEventType::Started);
        let finished = count(JobEventType::Finished);
        let failed = count(JobEventType::Failed);
        let timed_out = count(JobEventType::TimedOut);
        let expired = count(JobEventType::Expired);
        let total_processed = events.iter().filter(|e| e.event_type.is_outcome()).count() as u64;

        let processing_times: Vec<u64> =
            events.iter().filter_map(|e| e.processing_time_ms).collect();
        let (avg_processing_time_ms, min_processing_time_ms, max_processing_time_ms) =
            match (processing_times.iter().min(), processing_times.iter().max()) {
                (Some(min), Some(max)) => {
                    let sum: u64 = processing_times.iter().sum();
                    (sum as f64 / processing_times.len() as f64, *min, *max)
                }
                _ => (0.0, 0, 0),
            };

        let error_rate = if total_processed > 0 {
            (failed + timed_out + expired) as f64 / total_processed as f64
        } else {
            0.0
        };

        let throughput_per_minute = if window.as_secs() > 0 {
            total_processed as f64 * 60.0 / window.as_secs() as f64
        } else {
            0.0
        };

        JobStatistics {
            total_processed,
            finished,
            failed,
            timed_out,
            expired,
            running: started.saturating_sub(total_processed - expired),
            avg_processing_time_ms,
            min_processing_time_ms,
            max_processing_time_ms,
            throughput_per_minute,
            error_rate,
            time_window: window,
            calculated_at: self.clock.now(),
        }
    }

    /// Clean up events older than max_event_age_secs
    pub fn cleanup_old_events(&self) -> usize {
        let cutoff = self.cutoff(Duration::from_secs(self.config.max_event_age_secs));
        let mut events = self.write_events();
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
        original_len - events.len()
    }
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self.write_events();
        events.push(event);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }

        Ok(())
    }

    async fn get_queue_statistics(
        &self,
        queue_name: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        let queue_events: Vec<JobEvent> = self
            .filter_events_by_window(window)
            .into_iter()
            .filter(|e| e.queue_name == queue_name)
            .collect();

        Ok(self.calculate_statistics(&queue_events, window))
    }

    async fn get_all_statistics(&self, window: Duration) -> crate::Result<Vec<QueueStatistics>> {
        let mut queue_events: HashMap<String, Vec<JobEvent>> = HashMap::new();
        for event in self.filter_events_by_window(window) {
            queue_events
                .entry(event.queue_name.clone())
                .or_default()
                .push(event);
        }

        let mut results: Vec<QueueStatistics> = queue_events
            .into_iter()
            .map(|(queue_name, events)| QueueStatistics {
                statistics: self.calculate_statistics(&events, window),
                queue_name,
            })
            .collect();
        results.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        Ok(results)
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        let events = self.filter_events_by_window(window);
        Ok(self.calculate_statistics(&events, window))
    }

    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64> {
        let cutoff = self.cutoff(older_than);
        let mut events = self.write_events();
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((original_len - events.len()) as u64)
    }
}
