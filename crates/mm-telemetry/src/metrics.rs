//! Prometheus metrics for the chain sync services.
//!
//! All metrics follow the naming convention: `mm_<component>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // INDEXER METRICS
    // =========================================================================

    /// Blocks committed by the indexer
    pub static ref BLOCKS_PROCESSED: Counter = Counter::new(
        "mm_indexer_blocks_processed_total",
        "Total number of finalised blocks committed to the store"
    ).expect("metric creation failed");

    /// Height of the last committed block
    pub static ref LAST_PROCESSED_HEIGHT: Gauge = Gauge::new(
        "mm_indexer_last_processed_height",
        "Height of the last block committed to the store"
    ).expect("metric creation failed");

    /// Events turned into change sets, by process name
    pub static ref EVENTS_PROCESSED: CounterVec = CounterVec::new(
        Opts::new("mm_indexer_events_processed_total", "ProcessRan events handled"),
        &["process"]
    ).expect("metric creation failed");

    /// Failed attempts that were retried
    pub static ref INDEXER_RETRIES: Counter = Counter::new(
        "mm_indexer_retries_total",
        "Total block processing attempts that failed and were retried"
    ).expect("metric creation failed");

    /// Time from picking a block to committing it
    pub static ref BLOCK_PROCESSING_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "mm_indexer_block_duration_seconds",
            "Time spent handling and committing one block"
        ).buckets(exponential_buckets(0.001, 2.0, 15).unwrap())
    ).expect("metric creation failed");

    /// Attachments deleted after a failed commit
    pub static ref ATTACHMENT_CLEANUPS: Counter = Counter::new(
        "mm_indexer_attachment_cleanups_total",
        "Attachments deleted to compensate a failed block commit"
    ).expect("metric creation failed");

    // =========================================================================
    // CHAIN NODE METRICS
    // =========================================================================

    /// Submission lifecycle transitions
    pub static ref CHAIN_TRANSACTIONS: CounterVec = CounterVec::new(
        Opts::new("mm_chain_transactions_total", "Submitted transactions by outcome"),
        &["outcome"]  // outcome: submitted/in_block/finalised/failed
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BLOCKS_PROCESSED.clone()),
        Box::new(LAST_PROCESSED_HEIGHT.clone()),
        Box::new(EVENTS_PROCESSED.clone()),
        Box::new(INDEXER_RETRIES.clone()),
        Box::new(BLOCK_PROCESSING_DURATION.clone()),
        Box::new(ATTACHMENT_CLEANUPS.clone()),
        Box::new(CHAIN_TRANSACTIONS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_encode() {
        // May already be registered by another test in this process
        let _ = register_metrics();
        BLOCKS_PROCESSED.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("mm_indexer_blocks_processed_total"));
    }

    #[test]
    fn test_counter_vec_labels() {
        EVENTS_PROCESSED.with_label_values(&["demand_create"]).inc();
        assert!(EVENTS_PROCESSED.with_label_values(&["demand_create"]).get() >= 1.0);
    }

    #[test]
    fn test_gauge_set() {
        LAST_PROCESSED_HEIGHT.set(42.0);
        assert_eq!(LAST_PROCESSED_HEIGHT.get(), 42.0);
    }

    #[test]
    fn test_histogram_timer_observes_on_drop() {
        let before = BLOCK_PROCESSING_DURATION.get_sample_count();
        {
            let _timer = HistogramTimer::new(&BLOCK_PROCESSING_DURATION);
        }
        assert!(BLOCK_PROCESSING_DURATION.get_sample_count() > before);
    }
}
