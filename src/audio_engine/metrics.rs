//! Engine counters.
//!
//! Recoverable device conditions never reach the application as errors, so
//! these counters are the only place they show up besides the log.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub(crate) ticks: AtomicU64,
    pub(crate) idle_ticks: AtomicU64,
    pub(crate) deferred_ticks: AtomicU64,
    pub(crate) saturated_ticks: AtomicU64,
    pub(crate) mixed_ticks: AtomicU64,
    pub(crate) short_reads: AtomicU64,
    pub(crate) empty_reads: AtomicU64,
    pub(crate) resample_failures: AtomicU64,
    pub(crate) silence_fills: AtomicU64,
    pub(crate) fill_overflows: AtomicU64,
    pub(crate) playback_xruns: AtomicU64,
    pub(crate) playback_recoveries: AtomicU64,
    pub(crate) suspend_resumes: AtomicU64,
    pub(crate) write_retries: AtomicU64,
    pub(crate) dropped_writes: AtomicU64,
    pub(crate) fatal_errors: AtomicU64,
    pub(crate) capture_chunks: AtomicU64,
    pub(crate) capture_xruns: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Mixer passes, idle ones included.
    pub ticks: u64,
    /// Passes with no playing channel.
    pub idle_ticks: u64,
    /// Passes spent on device recovery instead of mixing.
    pub deferred_ticks: u64,
    /// Passes skipped because the device buffer was full enough.
    pub saturated_ticks: u64,
    pub mixed_ticks: u64,
    /// Channel reads that returned less than a chunk.
    pub short_reads: u64,
    /// Channel reads that returned nothing.
    pub empty_reads: u64,
    pub resample_failures: u64,
    /// Silence top-ups done by the buffer monitor.
    pub silence_fills: u64,
    pub fill_overflows: u64,
    pub playback_xruns: u64,
    pub playback_recoveries: u64,
    pub suspend_resumes: u64,
    pub write_retries: u64,
    /// Mixed chunks cut short because the device would not take them.
    pub dropped_writes: u64,
    pub fatal_errors: u64,
    pub capture_chunks: u64,
    pub capture_xruns: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks: get(&self.ticks),
            idle_ticks: get(&self.idle_ticks),
            deferred_ticks: get(&self.deferred_ticks),
            saturated_ticks: get(&self.saturated_ticks),
            mixed_ticks: get(&self.mixed_ticks),
            short_reads: get(&self.short_reads),
            empty_reads: get(&self.empty_reads),
            resample_failures: get(&self.resample_failures),
            silence_fills: get(&self.silence_fills),
            fill_overflows: get(&self.fill_overflows),
            playback_xruns: get(&self.playback_xruns),
            playback_recoveries: get(&self.playback_recoveries),
            suspend_resumes: get(&self.suspend_resumes),
            write_retries: get(&self.write_retries),
            dropped_writes: get(&self.dropped_writes),
            fatal_errors: get(&self.fatal_errors),
            capture_chunks: get(&self.capture_chunks),
            capture_xruns: get(&self.capture_xruns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());

        bump(&metrics.ticks);
        bump(&metrics.ticks);
        bump(&metrics.playback_xruns);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ticks, 2);
        assert_eq!(snapshot.playback_xruns, 1);
        assert_eq!(snapshot.mixed_ticks, 0);
    }
}
