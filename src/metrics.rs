use crate::{Result, stats::JobEvent};
use std::collections::HashMap;

#[cfg(feature = "metrics")]
use crate::{WorkhorseError, stats::JobEventType};

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Configuration for metrics collection
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Prefix for every metric name
    pub namespace: String,
    /// Constant labels attached to every metric
    pub custom_labels: HashMap<String, String>,
    /// Whether to collect job duration histograms
    pub collect_histograms: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "workhorse".to_string(),
            custom_labels: HashMap::new(),
            collect_histograms: true,
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Add custom labels to all metrics
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }

    pub fn with_histograms(mut self, collect: bool) -> Self {
        self.collect_histograms = collect;
        self
    }
}

/// Prometheus metrics collector for job queue metrics
#[cfg(feature = "metrics")]
pub struct PrometheusMetricsCollector {
    config: MetricsConfig,
    registry: Registry,
    jobs_total: CounterVec,
    jobs_duration: HistogramVec,
    jobs_failed_total: CounterVec,
    queue_depth: GaugeVec,
    scheduled_jobs: GaugeVec,
}

#[cfg(feature = "metrics")]
impl std::fmt::Debug for PrometheusMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsCollector")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(feature = "metrics")]
fn metrics_error(what: &str, e: prometheus::Error) -> WorkhorseError {
    WorkhorseError::Metrics {
        message: format!("Failed to create {} metric: {}", what, e),
    }
}

#[cfg(feature = "metrics")]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new_custom(Some(config.namespace.clone()), Some(config.custom_labels.clone()))
            .map_err(|e| metrics_error("registry", e))?;

        let jobs_total = CounterVec::new(
            Opts::new("jobs_total", "Total number of job events by outcome"),
            &["queue", "status"],
        )
        .map_err(|e| metrics_error("jobs_total", e))?;

        let jobs_duration = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Job processing duration in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
            &["queue"],
        )
        .map_err(|e| metrics_error("job_duration_seconds", e))?;

        let jobs_failed_total = CounterVec::new(
            Opts::new("jobs_failed_total", "Total number of failed jobs by reason"),
            &["queue", "reason"],
        )
        .map_err(|e| metrics_error("jobs_failed_total", e))?;

        let queue_depth = GaugeVec::new(
            Opts::new("queue_depth", "Current number of jobs waiting in a queue"),
            &["queue"],
        )
        .map_err(|e| metrics_error("queue_depth", e))?;

        let scheduled_jobs = GaugeVec::new(
            Opts::new("scheduled_jobs", "Current number of schedule entries"),
            &["scheduler"],
        )
        .map_err(|e| metrics_error("scheduled_jobs", e))?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(|e| metrics_error("jobs_total", e))?;
        registry
            .register(Box::new(jobs_duration.clone()))
            .map_err(|e| metrics_error("job_duration_seconds", e))?;
        registry
            .register(Box::new(jobs_failed_total.clone()))
            .map_err(|e| metrics_error("jobs_failed_total", e))?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(|e| metrics_error("queue_depth", e))?;
        registry
            .register(Box::new(scheduled_jobs.clone()))
            .map_err(|e| metrics_error("scheduled_jobs", e))?;

        Ok(Self {
            config,
            registry,
            jobs_total,
            jobs_duration,
            jobs_failed_total,
            queue_depth,
            scheduled_jobs,
        })
    }

    /// Record a job event as metrics
    pub async fn record_job_event(&self, event: &JobEvent) -> Result<()> {
        let queue = event.queue_name.as_str();
        self.jobs_total
            .with_label_values(&[queue, event.event_type.as_str()])
            .inc();

        match event.event_type {
            JobEventType::Finished => {
                if let (true, Some(duration_ms)) = (self.config.collect_histograms, event.processing_time_ms) {
                    self.jobs_duration
                        .with_label_values(&[queue])
                        .observe(duration_ms as f64 / 1000.0);
                }
            }
            JobEventType::Failed => {
                self.jobs_failed_total
                    .with_label_values(&[queue, "execution_error"])
                    .inc();
            }
            JobEventType::TimedOut => {
                self.jobs_failed_total
                    .with_label_values(&[queue, "timeout"])
                    .inc();
            }
            JobEventType::Expired => {
                self.jobs_failed_total
                    .with_label_values(&[queue, "ttl_expired"])
                    .inc();
            }
            JobEventType::Started => {}
        }

        Ok(())
    }

    pub async fn update_queue_depth(&self, queue_name: &str, depth: u64) -> Result<()> {
        self.queue_depth
            .with_label_values(&[queue_name])
            .set(depth as f64);
        Ok(())
    }

    pub async fn update_scheduled_jobs(&self, scheduler: &str, count: u64) -> Result<()> {
        self.scheduled_jobs
            .with_label_values(&[scheduler])
            .set(count as f64);
        Ok(())
    }

    /// Get metrics as Prometheus text format
    pub fn get_metrics_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| WorkhorseError::Metrics {
                message: format!("Failed to encode metrics: {}", e),
            })?;

        String::from_utf8(buffer).map_err(|e| WorkhorseError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
#[derive(Debug)]
pub struct PrometheusMetricsCollector {
    _config: MetricsConfig,
}

#[cfg(not(feature = "metrics"))]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        Ok(Self { _config: config })
    }

    pub async fn record_job_event(&self, _event: &JobEvent) -> Result<()> {
        Ok(())
    }

    pub async fn update_queue_depth(&self, _queue_name: &str, _depth: u64) -> Result<()> {
        Ok(())
    }

    pub async fn update_scheduled_jobs(&self, _scheduler: &str, _count: u64) -> Result<()> {
        Ok(())
    }

    pub fn get_metrics_text(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}
