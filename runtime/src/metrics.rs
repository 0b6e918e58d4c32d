//! Metric names and recorders.
//!
//! Everything goes through the `metrics` facade. Nothing here installs a recorder: without one
//! every call is a no-op, and hosts pick whatever exporter they like.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_runtime::metrics::{describe_metrics, CallMetrics};
//!
//! // Once, after installing a recorder
//! describe_metrics();
//!
//! CallMetrics::record_issued("call");
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::sync::Once;
use std::time::Duration;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

static DESCRIBE: Once = Once::new();

/// Register descriptions for every metric this crate emits.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    DESCRIBE.call_once(register_metrics);
}

fn register_metrics() {
    // Call metrics
    describe_counter!(
        "switchyard_calls_issued_total",
        "Total number of calls, acquires and registrations admitted into a pending table"
    );
    describe_counter!(
        "switchyard_calls_completed_total",
        "Total number of pending entries resolved by a matching reply"
    );
    describe_counter!(
        "switchyard_calls_orphaned_total",
        "Total number of pending entries failed by teardown"
    );
    describe_counter!(
        "switchyard_calls_timed_out_total",
        "Total number of pending entries orphaned by a timer"
    );
    describe_counter!(
        "switchyard_protocol_violations_total",
        "Total number of replies or tokens with no outstanding entry"
    );

    // Reactor metrics
    describe_counter!(
        "switchyard_reactor_invocations_total",
        "Total number of invocations delivered to handlers"
    );
    describe_counter!(
        "switchyard_reactor_handler_failures_total",
        "Total number of handler invocations that returned an error or panicked"
    );
    describe_gauge!("switchyard_reactor_isolates", "Number of live isolates");

    // Lifecycle metrics
    describe_counter!(
        "switchyard_fsm_transitions_total",
        "Total number of committed lifecycle transitions"
    );
    describe_counter!(
        "switchyard_fsm_rejections_total",
        "Total number of rejected lifecycle transitions that left the state unchanged"
    );
    describe_counter!(
        "switchyard_fsm_failures_total",
        "Total number of lifecycle transactions that aborted into the failed state"
    );

    // Driver metrics
    describe_counter!(
        "switchyard_driver_operations_total",
        "Total number of driver operations executed"
    );
    describe_counter!(
        "switchyard_driver_operation_errors_total",
        "Total number of driver operations that failed to run"
    );
    describe_histogram!(
        "switchyard_driver_operation_duration_seconds",
        "Time taken to execute driver operations"
    );
    describe_gauge!(
        "switchyard_driver_backends",
        "Number of live driver backends"
    );
    describe_gauge!(
        "switchyard_violation_log_size",
        "Number of entries held in violation logs"
    );
}

/// Call correlation metrics recorder.
pub struct CallMetrics;

impl CallMetrics {
    /// Record an entry admitted into a pending table.
    pub fn record_issued(kind: &'static str) {
        counter!("switchyard_calls_issued_total", "kind" => kind).increment(1);
    }

    /// Record an entry resolved by its reply.
    pub fn record_completed(kind: &'static str) {
        counter!("switchyard_calls_completed_total", "kind" => kind).increment(1);
    }

    /// Record entries failed by teardown.
    pub fn record_orphaned(count: usize) {
        counter!("switchyard_calls_orphaned_total").increment(count as u64);
    }

    /// Record an entry orphaned by a timer.
    pub fn record_timed_out() {
        counter!("switchyard_calls_timed_out_total").increment(1);
    }

    /// Record a reply with no outstanding entry.
    pub fn record_violation(kind: &'static str) {
        counter!("switchyard_protocol_violations_total", "kind" => kind).increment(1);
    }
}

/// Reactor metrics recorder.
pub struct ReactorMetrics;

impl ReactorMetrics {
    /// Record an invocation delivered to a handler.
    pub fn record_invocation(kind: &'static str) {
        counter!("switchyard_reactor_invocations_total", "kind" => kind).increment(1);
    }

    /// Record a failed handler invocation.
    pub fn record_handler_failure(kind: &'static str) {
        counter!("switchyard_reactor_handler_failures_total", "kind" => kind).increment(1);
    }

    /// Record the live isolate count.
    // Isolate counts stay far below 2^53
    #[allow(clippy::cast_precision_loss)]
    pub fn record_isolates(count: usize) {
        gauge!("switchyard_reactor_isolates").set(count as f64);
    }
}

/// Lifecycle metrics recorder.
pub struct FsmMetrics;

impl FsmMetrics {
    /// Record a committed transition.
    pub fn record_transition(transition: String) {
        counter!("switchyard_fsm_transitions_total", "transition" => transition).increment(1);
    }

    /// Record a rejected transition.
    pub fn record_rejection(transition: String) {
        counter!("switchyard_fsm_rejections_total", "transition" => transition).increment(1);
    }

    /// Record a transaction that moved the machine to failed.
    pub fn record_failure(transition: String) {
        counter!("switchyard_fsm_failures_total", "transition" => transition).increment(1);
    }
}

/// Driver dispatch metrics recorder.
pub struct DriverMetrics;

impl DriverMetrics {
    /// Record an executed operation.
    pub fn record_operation(duration: Duration) {
        counter!("switchyard_driver_operations_total").increment(1);
        histogram!("switchyard_driver_operation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an operation that failed to run.
    pub fn record_error() {
        counter!("switchyard_driver_operation_errors_total").increment(1);
    }

    /// Record the live backend count.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_backends(count: usize) {
        gauge!("switchyard_driver_backends").set(count as f64);
    }
}
