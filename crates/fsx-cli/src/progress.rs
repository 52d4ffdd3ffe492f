use std::time::Duration;

use fsx_core::Progress;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Renders scan progress as an indicatif spinner, logging the final report.
pub struct ScanReporter {
    bar: ProgressBar,
}

impl ScanReporter {
    pub fn new(msg: &str) -> ScanReporter {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.set_message(msg.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        ScanReporter { bar }
    }

    pub fn update(&self, p: &Progress) {
        if p.is_final() {
            self.bar.finish_and_clear();
            info!("{p}");
        } else {
            self.bar.set_message(p.to_string());
        }
    }
}
