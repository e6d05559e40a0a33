//! Metric names and the exporters behind the [`Metrics`] trait

use ::metrics::Label;

use crate::{MetricLabels, Metrics};

// ----------------
// | METRIC NAMES |
// ----------------

/// One data point per tick, labelled with its `outcome`
pub const TICK_METRIC: &str = "wormscan_tick";
/// Wall time of a tick in milliseconds
pub const TICK_LATENCY_METRIC: &str = "wormscan_tick_latency_ms";
/// High-water mark of the persisted cursor
pub const CURSOR_METRIC: &str = "wormscan_cursor";
/// Distance between the low and high water marks of the cursor
pub const CURSOR_DIFF_METRIC: &str = "wormscan_cursor_diff";
/// Finalized height minus the cursor high-water mark
pub const LAG_METRIC: &str = "wormscan_lag";
/// Messages written to the sink that were new or changed
pub const EVENTS_SUNK_METRIC: &str = "wormscan_events_sunk";
/// Publisher failures, which never block the cursor
pub const PUBLISH_FAILURES_METRIC: &str = "wormscan_publish_failures";
/// Items skipped because they could not be mapped or keyed
pub const SKIPPED_ITEMS_METRIC: &str = "wormscan_skipped_items";
/// Candidates dropped by the correlation stage
pub const UNCORRELATED_METRIC: &str = "wormscan_uncorrelated";
/// Ticks that failed with an invalid range
pub const INVALID_RANGE_METRIC: &str = "wormscan_invalid_range";

// ---------------
// | METRIC TAGS |
// ---------------

pub const SOURCE_ID_TAG: &str = "source_id";
pub const CHAIN_ID_TAG: &str = "chain_id";
pub const COMMITMENT_TAG: &str = "commitment";
pub const OUTCOME_TAG: &str = "outcome";

fn to_labels(labels: &MetricLabels) -> Vec<Label> {
    let mut out = vec![
        Label::new(SOURCE_ID_TAG, labels.source_id.clone()),
        Label::new(CHAIN_ID_TAG, labels.chain_id.to_string()),
        Label::new(COMMITMENT_TAG, labels.commitment.clone()),
    ];
    out.extend(
        labels
            .extra
            .iter()
            .map(|(k, v)| Label::new(*k, v.clone())),
    );
    out
}

/// Forwards to whichever recorder is installed for the `metrics` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsExporter;

impl Metrics for MetricsExporter {
    fn count(&self, name: &'static str, labels: &MetricLabels) {
        ::metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn measure(&self, name: &'static str, value: f64, labels: &MetricLabels) {
        // Gauge so that float values survive
        ::metrics::gauge!(name, to_labels(labels)).set(value);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn count(&self, _name: &'static str, _labels: &MetricLabels) {}

    fn measure(&self, _name: &'static str, _value: f64, _labels: &MetricLabels) {}
}
