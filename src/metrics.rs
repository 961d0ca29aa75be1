use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    User,
    Repos,
    Topics,
    Labels,
    Blobs,
    Trees,
    Commits,
    Refs,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UploadOutcome {
    Uploaded,
    Skipped,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UploadLabels {
    pub outcome: UploadOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every metric recorded during a publish run.
pub struct Metrics {
    // -- upstream API --
    pub api_calls: Family<EndpointLabels, Counter>,
    pub api_errors: Family<EndpointLabels, Counter>,
    pub rate_limit_remaining: Gauge,

    // -- uploads --
    pub files: Family<UploadLabels, Counter>,
    pub blob_bytes: Counter,
    pub blob_upload_seconds: Histogram,

    // -- pacing --
    pub throttle_waits: Counter,

    // -- run --
    pub publish_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgepublish_api_calls",
            "Upstream API calls by endpoint",
            api_calls.clone(),
        );

        let api_errors = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgepublish_api_errors",
            "Upstream API calls that failed, by endpoint",
            api_errors.clone(),
        );

        let rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "forgepublish_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            rate_limit_remaining.clone(),
        );

        let files = Family::<UploadLabels, Counter>::default();
        registry.register(
            "forgepublish_files",
            "Collected files by upload outcome",
            files.clone(),
        );

        let blob_bytes = Counter::default();
        registry.register(
            "forgepublish_blob_bytes",
            "Total bytes uploaded as blobs",
            blob_bytes.clone(),
        );

        let blob_upload_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "forgepublish_blob_upload_seconds",
            "Blob upload latency in seconds",
            blob_upload_seconds.clone(),
        );

        let throttle_waits = Counter::default();
        registry.register(
            "forgepublish_throttle_waits",
            "Times the publisher slept to stay within the rate limit",
            throttle_waits.clone(),
        );

        let publish_duration_seconds = Histogram::new(exponential_buckets(1.0, 2.0, 12));
        registry.register(
            "forgepublish_publish_duration_seconds",
            "Wall-clock duration of a publish run",
            publish_duration_seconds.clone(),
        );

        Self {
            api_calls,
            api_errors,
            rate_limit_remaining,
            files,
            blob_bytes,
            blob_upload_seconds,
            throttle_waits,
            publish_duration_seconds,
        }
    }

    pub fn record_call(&self, endpoint: Endpoint, ok: bool) {
        let labels = EndpointLabels { endpoint };
        self.api_calls.get_or_create(&labels).inc();
        if !ok {
            self.api_errors.get_or_create(&labels).inc();
        }
    }

    pub fn record_file(&self, outcome: UploadOutcome) {
        self.files.get_or_create(&UploadLabels { outcome }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all publisher metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)
            .context("failed to encode metrics")?;
        Ok(out)
    }

    /// Write a textfile-collector snapshot, replacing the file atomically.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let body = self.encode()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write metrics to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move metrics into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_calls() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_call(Endpoint::Blobs, true);
        registry.metrics.record_call(Endpoint::Blobs, false);
        registry.metrics.record_file(UploadOutcome::Uploaded);

        let text = registry.encode().unwrap();
        assert!(text.contains("forgepublish_api_calls_total{endpoint=\"Blobs\"} 2"));
        assert!(text.contains("forgepublish_api_errors_total{endpoint=\"Blobs\"} 1"));
        assert!(text.contains("forgepublish_files_total{outcome=\"Uploaded\"} 1"));
    }

    #[test]
    fn writes_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publish.prom");
        let registry = MetricsRegistry::new();
        registry.metrics.throttle_waits.inc();

        registry.write_textfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("forgepublish_throttle_waits_total 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
