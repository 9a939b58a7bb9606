//! Engine instrumentation through the `metrics` crate facade.
//!
//! Exposition (Prometheus or otherwise) is wired up by the embedding
//! process; without an installed recorder these calls are no-ops.
//!
//! Naming convention: `lkstream_core_{name}_{unit}`.

use std::time::{Duration, Instant};

/// Storage engine metrics
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn add_records_appended(count: u64) {
        metrics::counter!("lkstream_core_records_appended_total").increment(count);
    }

    pub fn add_bytes_appended(bytes: u64) {
        metrics::counter!("lkstream_core_bytes_appended_total").increment(bytes);
    }

    pub fn add_records_read(count: u64) {
        metrics::counter!("lkstream_core_records_read_total").increment(count);
    }

    pub fn increment_hot_tail_hits() {
        metrics::counter!("lkstream_core_hot_tail_hits_total").increment(1);
    }

    pub fn increment_rotations() {
        metrics::counter!("lkstream_core_segment_rotations_total").increment(1);
    }

    pub fn increment_flushes() {
        metrics::counter!("lkstream_core_flushes_total").increment(1);
    }

    pub fn add_bytes_flushed(bytes: u64) {
        metrics::counter!("lkstream_core_bytes_flushed_total").increment(bytes);
    }

    pub fn record_flush_duration(duration: Duration) {
        metrics::histogram!("lkstream_core_flush_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_append_latency_us(us: u64) {
        metrics::histogram!("lkstream_core_append_latency_us").record(us as f64);
    }

    pub fn set_inflight_bytes(bytes: u64) {
        metrics::gauge!("lkstream_core_inflight_bytes").set(bytes as f64);
    }
}

/// Simple latency timer
pub struct Timer {
    start: Instant,
}

impl Timer {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_compile() {
        // Verify all metric methods compile and don't panic without a
        // recorder installed
        EngineMetrics::add_records_appended(100);
        EngineMetrics::add_bytes_appended(4096);
        EngineMetrics::add_records_read(50);
        EngineMetrics::increment_hot_tail_hits();
        EngineMetrics::increment_rotations();
        EngineMetrics::increment_flushes();
        EngineMetrics::add_bytes_flushed(4096);
        EngineMetrics::record_flush_duration(Duration::from_millis(2));
        EngineMetrics::record_append_latency_us(150);
        EngineMetrics::set_inflight_bytes(1024);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed_us() >= 1000);
        assert!(timer.elapsed() >= Duration::from_millis(1));
    }
}
