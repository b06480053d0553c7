//! Metrics collection for the orchestrator.
//!
//! Defines counters and gauges for scaling and lifecycle monitoring.
//! Uses the `metrics` facade - no network exporters included.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions.
///
/// Call once at startup to register metric metadata.
pub fn init_metrics() {
    describe_gauge!("runnerd_queue_depth", "Pending work items on the platform");
    describe_gauge!("runnerd_pool_total", "Runners currently in the pool");
    describe_gauge!("runnerd_pool_idle", "Idle runners in the pool");

    describe_counter!("runnerd_scale_up_total", "Runners added by the controller");
    describe_counter!(
        "runnerd_scale_down_total",
        "Runners removed by the controller"
    );

    describe_counter!("runnerd_child_exits_total", "Worker process exits");
    describe_counter!("runnerd_child_crashes_total", "Nonzero worker exits");

    describe_counter!(
        "runnerd_disk_refusals_total",
        "Runner additions refused for low disk space"
    );
    describe_counter!(
        "runnerd_registrations_total",
        "Successful runner registrations"
    );
    describe_counter!(
        "runnerd_deregistrations_total",
        "Successful runner deregistrations"
    );
}

pub fn record_queue_depth(depth: usize) {
    gauge!("runnerd_queue_depth").set(depth as f64);
}

pub fn record_pool_size(total: usize, idle: usize) {
    gauge!("runnerd_pool_total").set(total as f64);
    gauge!("runnerd_pool_idle").set(idle as f64);
}

pub fn record_scale_up(count: usize) {
    counter!("runnerd_scale_up_total").increment(count as u64);
}

pub fn record_scale_down(count: usize) {
    counter!("runnerd_scale_down_total").increment(count as u64);
}

/// Record a worker exit; `clean` means exit status zero.
pub fn record_child_exit(clean: bool) {
    counter!("runnerd_child_exits_total").increment(1);
    if !clean {
        counter!("runnerd_child_crashes_total").increment(1);
    }
}

/// Record an addition refused because the install root is low on space.
pub fn record_disk_refusal() {
    counter!("runnerd_disk_refusals_total").increment(1);
}

pub fn record_registration() {
    counter!("runnerd_registrations_total").increment(1);
}

pub fn record_deregistration() {
    counter!("runnerd_deregistrations_total").increment(1);
}
