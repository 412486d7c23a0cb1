// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

/// Prometheus metrics definitions for the storage layer
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge, TextEncoder,
};

lazy_static! {
    /// Storage operation duration in seconds
    pub static ref STORAGE_OP_DURATION: HistogramVec = register_histogram_vec!(
        "storage_operation_duration_seconds",
        "Storage operation duration in seconds",
        &["operation", "backend"],
        vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Sidecar lock acquisition duration in seconds
    pub static ref STORAGE_LOCK_WAIT: HistogramVec = register_histogram_vec!(
        "storage_lock_wait_duration_seconds",
        "Sidecar lock acquisition duration in seconds",
        &["lock_type"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.500, 1.0]
    ).unwrap();

    /// Tree-walkers currently live (producing or parked)
    pub static ref TREE_WALKERS_ACTIVE: IntGauge = register_int_gauge!(
        "tree_walkers_active",
        "Tree-walkers currently live (producing or parked)"
    ).unwrap();

    /// Error count by taxonomy kind and operation
    pub static ref STORAGE_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "storage_errors_total",
        "Total number of storage errors",
        &["kind", "operation"]
    ).unwrap();
}

/// Record storage operation duration
pub fn record_storage_op(operation: &str, backend: &str, duration: f64) {
    STORAGE_OP_DURATION
        .with_label_values(&[operation, backend])
        .observe(duration);
}

/// Record sidecar lock acquisition duration
pub fn record_lock_wait(lock_type: &str, duration: f64) {
    STORAGE_LOCK_WAIT
        .with_label_values(&[lock_type])
        .observe(duration);
}

pub fn inc_active_walkers() {
    TREE_WALKERS_ACTIVE.inc();
}

pub fn dec_active_walkers() {
    TREE_WALKERS_ACTIVE.dec();
}

/// Increment the error counter for one operation
pub fn increment_error(kind: &str, operation: &str) {
    STORAGE_ERRORS_TOTAL
        .with_label_values(&[kind, operation])
        .inc();
}

/// Gather all metrics for Prometheus exposition
pub fn gather_metrics() -> Vec<u8> {
    use prometheus::Encoder;
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    buffer
}
