//! Metrics for observability.
//!
//! Emits through the `metrics` facade; install any recorder/exporter in the
//! application to collect them. Covered:
//! - Ingestion batches, applied and skipped changes
//! - Resnapshots and transport errors
//! - Mutation outcomes and confirmation latency
//! - Live query emissions and active subscriptions
//! - Collection status
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `collection_` and labelled with the
//! collection id:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one ingested batch.
pub fn record_batch_applied(collection: &str, applied: usize, skipped: usize) {
    counter!("collection_ingest_batches_total", "collection" => collection.to_string()).increment(1);
    counter!("collection_changes_applied_total", "collection" => collection.to_string())
        .increment(applied as u64);
    if skipped > 0 {
        counter!("collection_changes_redelivered_total", "collection" => collection.to_string())
            .increment(skipped as u64);
    }
}

/// Record a fetch round-trip to the shape source.
pub fn record_fetch_latency(collection: &str, live: bool, duration: Duration) {
    let mode = if live { "live" } else { "catchup" };
    histogram!("collection_fetch_duration_seconds", "collection" => collection.to_string(), "mode" => mode)
        .record(duration.as_secs_f64());
}

/// Record a transport error.
pub fn record_transport_error(collection: &str) {
    counter!("collection_transport_errors_total", "collection" => collection.to_string()).increment(1);
}

/// Record a resnapshot triggered by an invalid cursor.
pub fn record_resnapshot(collection: &str) {
    counter!("collection_resnapshots_total", "collection" => collection.to_string()).increment(1);
}

/// Record a mutation reaching a terminal outcome.
///
/// `outcome` is one of `confirmed`, `write_rejected`, `confirmation_timeout`,
/// `cancelled`, `conflict`, `validation`.
pub fn record_mutation(collection: &str, kind: &str, outcome: &str) {
    counter!(
        "collection_mutations_total",
        "collection" => collection.to_string(),
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record time from optimistic apply to txid confirmation.
pub fn record_confirmation_latency(collection: &str, duration: Duration) {
    histogram!("collection_confirmation_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for mutations currently pending or awaiting confirmation.
pub fn set_inflight_mutations(collection: &str, count: usize) {
    gauge!("collection_inflight_mutations", "collection" => collection.to_string()).set(count as f64);
}

/// Record a live query result emission.
pub fn record_query_emit(collection: &str) {
    counter!("collection_live_query_emits_total", "collection" => collection.to_string()).increment(1);
}

/// Gauge for active live queries.
pub fn set_active_queries(collection: &str, count: usize) {
    gauge!("collection_live_queries_active", "collection" => collection.to_string()).set(count as f64);
}

/// Gauge for confirmed rows in the local store.
pub fn set_base_rows(collection: &str, count: usize) {
    gauge!("collection_base_rows", "collection" => collection.to_string()).set(count as f64);
}

/// Gauge for collection status.
pub fn set_collection_status(collection: &str, status: &str) {
    // Encode status as numeric for alerting
    let value = match status {
        "Created" => 0.0,
        "Loading" => 1.0,
        "Ready" => 2.0,
        "Stale" => 3.0,
        "Closed" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("collection_status", "collection" => collection.to_string()).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests check they
    // don't panic on edge-case inputs.

    #[test]
    fn test_record_batch_applied() {
        record_batch_applied("todos", 10, 0);
        record_batch_applied("todos", 0, 5);
        record_batch_applied("todos", 0, 0);
    }

    #[test]
    fn test_record_fetch_latency() {
        record_fetch_latency("todos", true, Duration::from_millis(20));
        record_fetch_latency("todos", false, Duration::ZERO);
    }

    #[test]
    fn test_record_errors_and_resnapshots() {
        record_transport_error("todos");
        record_resnapshot("todos");
    }

    #[test]
    fn test_record_mutation_outcomes() {
        for outcome in ["confirmed", "write_rejected", "confirmation_timeout", "cancelled"] {
            record_mutation("todos", "update", outcome);
        }
        record_confirmation_latency("todos", Duration::from_millis(80));
        set_inflight_mutations("todos", 3);
    }

    #[test]
    fn test_query_metrics() {
        record_query_emit("todos");
        set_active_queries("todos", 0);
        set_active_queries("todos", 12);
        set_base_rows("todos", 100);
    }

    #[test]
    fn test_set_collection_status_all_states() {
        for status in ["Created", "Loading", "Ready", "Stale", "Closed", "Failed"] {
            set_collection_status("todos", status);
        }
        // Unknown state should map to -1
        set_collection_status("todos", "Unknown");
    }
}
