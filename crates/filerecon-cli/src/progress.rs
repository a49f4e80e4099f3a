use filerecon_core::ProgressReporter;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Connect and enumerate: spinner
/// - Compare: progress bar over cross-backend pairs
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        let mut guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }

    fn spinner(message: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars(TICKS));
        }
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }
}

impl ProgressReporter for CliReporter {
    fn on_connect_start(&self, backends: usize) {
        self.set_bar(Self::spinner(format!("Connecting to {} backends...", backends)));
    }

    fn on_backend_connected(&self, backend: &str) {
        self.with_bar(|pb| pb.println(format!("  \x1b[32m✓\x1b[0m {} connected", backend)));
    }

    fn on_backend_failed(&self, backend: &str, reason: &str) {
        self.with_bar(|pb| pb.println(format!("  \x1b[31m✗\x1b[0m {}: {}", backend, reason)));
    }

    fn on_enumerate_complete(&self, descriptors: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Enumeration complete: {} files in {:.2}s",
            descriptors, duration_secs
        );
    }

    fn on_compare_start(&self, pairs: usize) {
        let pb = ProgressBar::new(pairs as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} Comparing [{bar:30.cyan/dim}] {pos}/{len} pairs ({eta} remaining)",
        ) {
            pb.set_style(style.progress_chars("━╸─").tick_chars(TICKS));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_compare_progress(&self, pairs_done: usize, total_pairs: usize) {
        self.with_bar(|pb| {
            if pb.length() != Some(total_pairs as u64) {
                pb.set_length(total_pairs as u64);
            }
            pb.set_position(pairs_done as u64);
        });
    }

    fn on_compare_complete(&self, same_pairs: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Compare complete: {} matching pairs in {:.2}s",
            same_pairs, duration_secs
        );
    }

    fn on_publish(&self, logical_files: usize, descriptors: usize) {
        eprintln!(
            "  \x1b[32m✓\x1b[0m Registry published: {} logical files from {} descriptors",
            logical_files, descriptors
        );
    }
}
