//! Structured logging setup and engine counters.
//!
//! With the `observability` feature the counters are mirrored to
//! OpenTelemetry instruments on a [`MetricsProvider`] meter.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target [run_id] message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// `RUST_LOG`, when set, overrides `log_level`.
///
/// ```rust,no_run
/// # use courier::observability::{init_logging, LogFormat, ObservabilityConfig};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// init_logging(&config).ok();
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to `courier::*` targets (e.g. "info", "debug")
    pub log_level: String,
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP gRPC endpoint; without one metrics stay in-process.
    pub metrics_export_endpoint: Option<String>,
    pub metrics_export_interval_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "courier".to_string(),
            service_version: None,
            metrics_export_endpoint: None,
            metrics_export_interval_ms: 60_000,
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,courier={level}")
}

/// Install a global fmt subscriber. Returns an error if one is already set.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of engine counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_dequeued: u64,
    pub messages_dropped: u64,
    pub attempts_created: u64,
    pub dispatch_failures: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub retries_scheduled: u64,
    pub checkpoints_created: u64,
    pub checkpoints_rejected: u64,
    pub restores: u64,
    pub resumes: u64,
    pub cancellations: u64,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    #[cfg(feature = "observability")]
    otel: Option<otel_impl::OtelCounters>,
    messages_dequeued: AtomicU64,
    messages_dropped: AtomicU64,
    attempts_created: AtomicU64,
    dispatch_failures: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    checkpoints_created: AtomicU64,
    checkpoints_rejected: AtomicU64,
    restores: AtomicU64,
    resumes: AtomicU64,
    cancellations: AtomicU64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl EngineMetrics {
            $(
                #[inline]
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "observability")]
                    {
                        if let Some(otel) = &self.otel {
                            otel.$field.add(1, &[]);
                        }
                    }
                }
            )*
        }

        #[cfg(feature = "observability")]
        mod otel_impl {
            use opentelemetry::metrics::{Counter, Meter};
            use std::fmt;

            pub(super) struct OtelCounters {
                $(pub(super) $field: Counter<u64>,)*
            }

            impl OtelCounters {
                pub(super) fn new(meter: &Meter) -> Self {
                    Self {
                        $($field: meter.u64_counter(concat!("courier_", stringify!($field), "_total")).build(),)*
                    }
                }
            }

            impl fmt::Debug for OtelCounters {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str("OtelCounters")
                }
            }
        }
    };
}

counters! {
    record_dequeue => messages_dequeued,
    record_dropped => messages_dropped,
    record_attempt_created => attempts_created,
    record_dispatch_failure => dispatch_failures,
    record_run_succeeded => runs_succeeded,
    record_run_failed => runs_failed,
    record_retry => retries_scheduled,
    record_checkpoint => checkpoints_created,
    record_checkpoint_rejected => checkpoints_rejected,
    record_restore => restores,
    record_resume => resumes,
    record_cancellation => cancellations,
}

impl EngineMetrics {
    /// Counters that also feed the instruments of `meter`.
    #[cfg(feature = "observability")]
    pub fn with_meter(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            otel: Some(otel_impl::OtelCounters::new(meter)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_dequeued: self.messages_dequeued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            attempts_created: self.attempts_created.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            checkpoints_created: self.checkpoints_created.load(Ordering::Relaxed),
            checkpoints_rejected: self.checkpoints_rejected.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// OpenTelemetry meter provider the engine counters export through.
#[cfg(feature = "observability")]
pub struct MetricsProvider {
    meter_provider: opentelemetry_sdk::metrics::SdkMeterProvider,
}

#[cfg(feature = "observability")]
impl MetricsProvider {
    /// Periodic OTLP export when an endpoint is configured, else a manual reader.
    pub fn new(config: &ObservabilityConfig) -> Result<Self, String> {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::metrics::{ManualReader, PeriodicReader, SdkMeterProvider};
        use opentelemetry_sdk::Resource;

        let resource = Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new(
                "service.version",
                config.service_version.clone().unwrap_or_else(|| "unknown".to_string()),
            ),
        ]);
        let meter_provider = match &config.metrics_export_endpoint {
            Some(endpoint) => {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .map_err(|e| format!("Failed to create metrics exporter: {e}"))?;
                let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                    .with_interval(std::time::Duration::from_millis(config.metrics_export_interval_ms))
                    .build();
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            }
            None => SdkMeterProvider::builder()
                .with_reader(ManualReader::builder().build())
                .with_resource(resource)
                .build(),
        };
        Ok(Self { meter_provider })
    }

    pub fn meter(&self) -> opentelemetry::metrics::Meter {
        use opentelemetry::metrics::MeterProvider as _;
        self.meter_provider.meter("courier")
    }

    pub fn shutdown(&self) -> Result<(), String> {
        self.meter_provider
            .shutdown()
            .map_err(|e| format!("Failed to shutdown metrics provider: {e}"))
    }
}
