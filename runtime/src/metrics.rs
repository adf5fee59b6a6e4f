//! Prometheus metrics for the store.
//!
//! Counters are recorded through the `metrics` facade and are free when no
//! recorder is installed. [`MetricsExporter::install`] installs a Prometheus
//! recorder and renders the text exposition format on demand:
//!
//! - Dispatches (total, unchanged, duration)
//! - Async operation phases
//! - Persistence writes and rehydration
//!
//! # Example
//!
//! ```rust,no_run
//! use modelstore_runtime::metrics::MetricsExporter;
//!
//! let exporter = MetricsExporter::install()?;
//! // ... dispatch actions ...
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok::<(), modelstore_runtime::metrics::MetricsError>(())
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use modelstore_core::Phase;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Total dispatched actions
pub const DISPATCH_TOTAL: &str = "modelstore_dispatch_total";
/// Dispatches that left the root state untouched
pub const DISPATCH_UNCHANGED: &str = "modelstore_dispatch_unchanged_total";
/// Reducer time per dispatch
pub const DISPATCH_DURATION: &str = "modelstore_dispatch_duration_seconds";
/// Async operation phases, labelled by `phase`
pub const OPERATION_PHASES: &str = "modelstore_operation_phases_total";
/// Envelope writes
pub const PERSIST_WRITES: &str = "modelstore_persist_writes_total";
/// Failed envelope writes
pub const PERSIST_WRITE_FAILURES: &str = "modelstore_persist_write_failures_total";
/// Slices rehydrated from storage
pub const PERSIST_REHYDRATED: &str = "modelstore_persist_rehydrated_slices_total";

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install the Prometheus recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Register metric descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the recorder cannot be installed.
    /// An already installed recorder is not an error; [`render`](Self::render)
    /// then returns `None`.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Ok(Self {
                handle: Some(handle),
            }),
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") {
                    tracing::warn!("Metrics recorder already installed, reusing it");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Render current metrics in Prometheus text format
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(DISPATCH_TOTAL, "Total number of dispatched actions");
    describe_counter!(
        DISPATCH_UNCHANGED,
        "Dispatches that returned the previous root state"
    );
    describe_histogram!(DISPATCH_DURATION, "Time spent reducing one action");
    describe_counter!(
        OPERATION_PHASES,
        "Async operation phase actions dispatched by the executor"
    );
    describe_counter!(PERSIST_WRITES, "Envelopes written to storage");
    describe_counter!(PERSIST_WRITE_FAILURES, "Envelope writes that failed");
    describe_counter!(PERSIST_REHYDRATED, "Slices rehydrated from persisted data");
}

/// Dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record one dispatch
    pub fn record(changed: bool, duration: Duration) {
        counter!(DISPATCH_TOTAL).increment(1);
        if !changed {
            counter!(DISPATCH_UNCHANGED).increment(1);
        }
        histogram!(DISPATCH_DURATION).record(duration.as_secs_f64());
    }
}

/// Async operation metrics recorder.
pub struct OperationMetrics;

impl OperationMetrics {
    /// Record a phase action
    pub fn record_phase(phase: Phase) {
        let label = match phase {
            Phase::Prepare => "prepare",
            Phase::Success => "success",
            Phase::Fail => "fail",
        };
        counter!(OPERATION_PHASES, "phase" => label).increment(1);
    }
}

/// Persistence metrics recorder.
pub struct PersistMetrics;

impl PersistMetrics {
    /// Record a successful write
    pub fn record_write() {
        counter!(PERSIST_WRITES).increment(1);
    }

    /// Record a failed write
    pub fn record_write_failure() {
        counter!(PERSIST_WRITE_FAILURES).increment(1);
    }

    /// Record rehydrated slices
    pub fn record_rehydrated(count: usize) {
        counter!(PERSIST_REHYDRATED).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn exporter_renders_recorded_counters() {
        let exporter = MetricsExporter::install().unwrap();

        DispatchMetrics::record(false, Duration::from_micros(20));
        OperationMetrics::record_phase(Phase::Success);
        PersistMetrics::record_write();

        // Another test may have installed the recorder first.
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains(DISPATCH_TOTAL));
            assert!(rendered.contains(DISPATCH_UNCHANGED));
            assert!(rendered.contains(OPERATION_PHASES));
            assert!(rendered.contains(PERSIST_WRITES));
        }
    }
}
