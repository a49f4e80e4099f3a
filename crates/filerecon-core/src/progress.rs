/// Trait for reporting sync progress.
///
/// The CLI implements it with indicatif bars; all methods default to no-ops.
pub trait ProgressReporter: Send + Sync {
    fn on_connect_start(&self, _backends: usize) {}
    fn on_backend_connected(&self, _backend: &str) {}
    fn on_backend_failed(&self, _backend: &str, _reason: &str) {}
    fn on_enumerate_complete(&self, _descriptors: usize, _duration_secs: f64) {}
    fn on_compare_start(&self, _pairs: usize) {}
    fn on_compare_progress(&self, _pairs_done: usize, _total_pairs: usize) {}
    fn on_compare_complete(&self, _same_pairs: usize, _duration_secs: f64) {}
    fn on_publish(&self, _logical_files: usize, _descriptors: usize) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
