use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::cache::key::Category;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CategoryLabels {
    pub category: Category,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AttemptOutcome {
    /// Origin answered with a success status and the body was stored.
    Hit,
    /// Origin answered with a non-success status.
    Miss,
    /// Network, timeout or local write failure.
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub origin: String,
    pub outcome: AttemptOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- store --
    pub cache_hits: Family<CategoryLabels, Counter>,
    pub cache_misses: Family<CategoryLabels, Counter>,

    // -- fetch --
    pub upstream_attempts: Family<UpstreamLabels, Counter>,
    pub fetch_errors: Family<CategoryLabels, Counter>,
    pub fetch_duration_seconds: Family<CategoryLabels, Histogram>,
    pub fetched_bytes: Counter,
    pub coalesced_waits: Counter,

    // -- guard --
    pub freeze_active: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "narproxy_cache_hits",
            "Requests served from the local store",
            cache_hits.clone(),
        );

        let cache_misses = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "narproxy_cache_misses",
            "Requests that were not in the local store on arrival",
            cache_misses.clone(),
        );

        let upstream_attempts = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "narproxy_upstream_attempts",
            "Upstream requests by origin and outcome",
            upstream_attempts.clone(),
        );

        let fetch_errors = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "narproxy_fetch_errors",
            "Fetches aborted by a network, deadline or local I/O error",
            fetch_errors.clone(),
        );

        let fetch_duration_seconds =
            Family::<CategoryLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "narproxy_fetch_duration_seconds",
            "Time spent iterating upstream origins for one key",
            fetch_duration_seconds.clone(),
        );

        let fetched_bytes = Counter::default();
        registry.register(
            "narproxy_fetched_bytes",
            "Bytes downloaded from upstream origins and published",
            fetched_bytes.clone(),
        );

        let coalesced_waits = Counter::default();
        registry.register(
            "narproxy_coalesced_waits",
            "Misses satisfied by a concurrent fetch of the same key",
            coalesced_waits.clone(),
        );

        let freeze_active: Gauge = Gauge::default();
        registry.register(
            "narproxy_freeze_active",
            "Open administrative lock connections holding the fetch gate",
            freeze_active.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            upstream_attempts,
            fetch_errors,
            fetch_duration_seconds,
            fetched_bytes,
            coalesced_waits,
            freeze_active,
        }
    }

    pub(crate) fn category(category: Category) -> CategoryLabels {
        CategoryLabels { category }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
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
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
