use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use humansize::{format_size, BINARY};

/// Exponentially-smoothed scan rate estimator. Hashers publish per-chunk
/// byte counts into a shared atomic sample; the collector owns the file
/// counter and calls update at regular intervals.
pub struct Progress {
    start: Instant,
    now: Instant,
    dur: Duration,
    files: u64,
    bytes: u64,
    fps: f64,
    bps: f64,
    done: bool,
    pub(crate) sample_files: u64,
}

impl Progress {
    pub(crate) fn new(start: Instant) -> Progress {
        Progress {
            start,
            now: start,
            dur: Duration::ZERO,
            files: 0,
            bytes: 0,
            fps: 0.0,
            bps: 0.0,
            done: false,
            sample_files: 0,
        }
    }

    /// Total files indexed so far.
    pub fn files(&self) -> u64 {
        self.files
    }

    /// Total bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Smoothed files per second.
    pub fn file_rate(&self) -> f64 {
        self.fps
    }

    /// Smoothed bytes per second.
    pub fn byte_rate(&self) -> f64 {
        self.bps
    }

    /// Duration of the operation rounded to the nearest second.
    pub fn duration(&self) -> Duration {
        self.dur
    }

    /// Whether this is the final report of the scan.
    pub fn is_final(&self) -> bool {
        self.done
    }

    pub(crate) fn finish(&mut self, now: Instant, sample_bytes: &AtomicU64) {
        self.done = true;
        self.update(now, sample_bytes);
    }

    /// Folds the pending samples into the totals and rates. Updates less
    /// than half a second apart are rolled back into the sample.
    pub(crate) fn update(&mut self, now: Instant, sample_bytes: &AtomicU64) {
        let sample = sample_bytes.swap(0, Ordering::Relaxed);
        let sec = now.saturating_duration_since(self.now).as_secs_f64();
        if sec < 0.5 {
            sample_bytes.fetch_add(sample, Ordering::Relaxed);
            return;
        }
        let mut alpha = (sec / 10.0).min(1.0);
        if self.start == self.now {
            alpha = 1.0; // First sample
        }
        self.now = now;
        self.dur = round_to_second(now.saturating_duration_since(self.start));
        self.files += self.sample_files;
        self.bytes += sample;
        self.fps = (1.0 - alpha) * self.fps + alpha * (self.sample_files as f64 / sec);
        self.bps = (1.0 - alpha) * self.bps + alpha * (sample as f64 / sec);
        self.sample_files = 0;
    }
}

fn round_to_second(d: Duration) -> Duration {
    Duration::from_secs((d.as_secs_f64() + 0.5) as u64)
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Indexed {} files ({}) in {}s [{:.0} files/sec, {}/sec]",
            self.files,
            format_size(self.bytes, BINARY),
            self.dur.as_secs(),
            self.fps,
            format_size(self.bps.round() as u64, BINARY),
        )
    }
}
