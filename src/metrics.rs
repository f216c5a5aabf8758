use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the repeater.
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    pub upstream_connections_active: AtomicUsize,
    pub upstream_reconnects: AtomicUsize,
    pub frames_received: AtomicUsize,
    pub frames_admitted: AtomicUsize,
    pub frames_dropped_duplicate: AtomicUsize,
    pub frames_dropped_parse: AtomicUsize,
    pub sessions_active: AtomicUsize,
    pub sessions_total: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> = Lazy::new(|| Arc::new(RuntimeMetrics::default()));
