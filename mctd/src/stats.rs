//! Daemon throughput counters.
//!
//! Updated from the hot path, so all fields are atomic; a 1 s rollup keeps
//! the messages-per-second gauge current and a periodic summary goes to the
//! internal log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub struct Stats {
    pub messages_total: AtomicU64,
    pub start_time: SystemTime,
    messages_this_sec: AtomicU64,
    messages_per_sec: AtomicU64,
    buffer_overflows: AtomicU64,
    client_send_failures: AtomicU64,
    control_requests: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            messages_total: AtomicU64::new(0),
            start_time: SystemTime::now(),
            messages_this_sec: AtomicU64::new(0),
            messages_per_sec: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            client_send_failures: AtomicU64::new(0),
            control_requests: AtomicU64::new(0),
        }
    }

    pub fn record_message(&self) {
        self.messages_this_sec.fetch_add(1, Ordering::Relaxed);
        self.messages_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per second to refresh the rate gauge.
    pub fn rollup(&self) {
        let per_sec = self.messages_this_sec.swap(0, Ordering::Relaxed);
        self.messages_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn messages_per_sec(&self) -> u64 {
        self.messages_per_sec.load(Ordering::Relaxed)
    }

    pub fn inc_buffer_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_overflows(&self) -> u64 {
        self.buffer_overflows.load(Ordering::Relaxed)
    }

    pub fn inc_client_send_failure(&self) {
        self.client_send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_send_failures(&self) -> u64 {
        self.client_send_failures.load(Ordering::Relaxed)
    }

    pub fn inc_control_request(&self) {
        self.control_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_requests(&self) -> u64 {
        self.control_requests.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_resets_per_second_counter() {
        let stats = Stats::new();
        for _ in 0..5 {
            stats.record_message();
        }
        stats.rollup();
        assert_eq!(stats.messages_per_sec(), 5);
        stats.rollup();
        assert_eq!(stats.messages_per_sec(), 0);
        assert_eq!(stats.messages_total.load(Ordering::Relaxed), 5);
    }
}
