/*!
Observability for the backup engine.

- Structured logging through `tracing`, plain or JSON
- Prometheus counters and histograms behind the `metrics` feature

The engines call the `record_*` helpers unconditionally; without the
feature they compile to nothing.
*/

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::record::BackupKind;
use crate::{Result, VaultError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<VaultMetrics>> = OnceLock::new();

/// Metrics collection for backup and restore operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct VaultMetrics {
    /// Backups that reached `completed`, by kind
    pub backups_created_total: CounterVec,
    /// Backups that ended `failed`, by kind
    pub backups_failed_total: CounterVec,
    pub backup_duration_seconds: Histogram,
    pub artifact_size_bytes: Histogram,

    /// Restore attempts by terminal outcome (`finalized`, `aborted`, `degraded`, `busy`)
    pub restores_total: CounterVec,
    pub restore_duration_seconds: Histogram,

    pub backups_pruned_total: CounterVec,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(what: &str, e: prometheus::Error) -> VaultError {
    VaultError::validation(format!("failed to set up metric {what}: {e}"))
}

#[cfg(feature = "metrics")]
impl VaultMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str, label: &str| -> Result<CounterVec> {
            let metric =
                CounterVec::new(Opts::new(name, help), &[label]).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(metric.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(metric)
        };
        let histogram = |name: &str, help: &str, buckets: Vec<f64>| -> Result<Histogram> {
            let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
                .map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(metric.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(metric)
        };

        let backups_created_total = counter(
            "divevault_backups_created_total",
            "Backups completed and verified",
            "kind",
        )?;
        let backups_failed_total =
            counter("divevault_backups_failed_total", "Backups that failed", "kind")?;
        let restores_total = counter(
            "divevault_restores_total",
            "Restore attempts by terminal outcome",
            "outcome",
        )?;
        let backups_pruned_total = counter(
            "divevault_backups_pruned_total",
            "Backups removed by retention",
            "kind",
        )?;
        let backup_duration_seconds = histogram(
            "divevault_backup_duration_seconds",
            "Wall time of backup creation",
            prometheus::exponential_buckets(0.5, 2.0, 14).map_err(|e| metric_error("buckets", e))?,
        )?;
        let restore_duration_seconds = histogram(
            "divevault_restore_duration_seconds",
            "Wall time of restore attempts",
            prometheus::exponential_buckets(0.5, 2.0, 14).map_err(|e| metric_error("buckets", e))?,
        )?;
        let artifact_size_bytes = histogram(
            "divevault_artifact_size_bytes",
            "Compressed artifact size",
            prometheus::exponential_buckets(1024.0, 4.0, 12)
                .map_err(|e| metric_error("buckets", e))?,
        )?;

        Ok(Self {
            backups_created_total,
            backups_failed_total,
            backup_duration_seconds,
            artifact_size_bytes,
            restores_total,
            restore_duration_seconds,
            backups_pruned_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// `None` if the collectors could not be registered; the failure is logged once.
    pub fn global() -> Option<&'static VaultMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metric_error("encoder", e))?;

        String::from_utf8(buffer)
            .map_err(|e| VaultError::validation(format!("metrics are not UTF-8: {e}")))
    }
}

/// Prometheus text exposition of every metric, or `None` without the `metrics` feature
pub fn gather_metrics() -> Result<Option<String>> {
    #[cfg(feature = "metrics")]
    {
        VaultMetrics::global()
            .map(VaultMetrics::gather_metrics)
            .transpose()
    }
    #[cfg(not(feature = "metrics"))]
    {
        Ok(None)
    }
}

#[allow(unused_variables)]
pub(crate) fn record_backup(kind: BackupKind, succeeded: bool, elapsed: Duration, size: Option<u64>) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = VaultMetrics::global() {
        let counter = if succeeded {
            &metrics.backups_created_total
        } else {
            &metrics.backups_failed_total
        };
        counter.with_label_values(&[kind.as_str()]).inc();
        metrics.backup_duration_seconds.observe(elapsed.as_secs_f64());
        if let Some(size) = size {
            metrics.artifact_size_bytes.observe(size as f64);
        }
    }
}

#[allow(unused_variables)]
pub(crate) fn record_restore(outcome: &str, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = VaultMetrics::global() {
        metrics.restores_total.with_label_values(&[outcome]).inc();
        metrics.restore_duration_seconds.observe(elapsed.as_secs_f64());
    }
}

#[allow(unused_variables)]
pub(crate) fn record_pruned(kind: BackupKind, count: usize) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = VaultMetrics::global() {
        metrics
            .backups_pruned_total
            .with_label_values(&[kind.as_str()])
            .inc_by(count as f64);
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise the divevault crates log at `info`,
/// or `debug` when `verbose` is set.
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `verbose` - Lower the default level to `debug`
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    VaultMetrics::global();

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,divevault_core={level},divevault_cli={level},divevault_retry={level}"
        ))
    });

    let installed = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    installed.map_err(|e| {
        VaultError::validation(format!("failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("divevault observability initialized");
    Ok(())
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_exported() {
        record_backup(BackupKind::Manual, true, Duration::from_millis(1500), Some(4096));
        record_backup(BackupKind::Automatic, false, Duration::from_millis(10), None);
        record_restore("degraded", Duration::from_secs(3));
        record_pruned(BackupKind::Automatic, 2);

        let text = gather_metrics().unwrap().unwrap();
        assert!(text.contains("divevault_backups_created_total{kind=\"manual\"}"));
        assert!(text.contains("divevault_backups_failed_total{kind=\"automatic\"}"));
        assert!(text.contains("divevault_restores_total{outcome=\"degraded\"}"));
        assert!(text.contains("divevault_backups_pruned_total{kind=\"automatic\"}"));
        assert!(text.contains("divevault_artifact_size_bytes_bucket"));
    }

    #[test]
    fn test_global_is_a_singleton() {
        let a = VaultMetrics::global().unwrap() as *const VaultMetrics;
        let b = VaultMetrics::global().unwrap() as *const VaultMetrics;
        assert_eq!(a, b);
    }
}
