use std::time::{Duration, Instant};

use chrono::Local;
use tracing::warn;

use crate::engine::Interceptor;

// ==========================================
// Periodic traffic report
// ==========================================
// Heartbeat line with the counters that matter, printed to stdout.
// Table pressure is surfaced here as a warning, never a crash.

// pending entries above this are a sign responses stopped coming back
const PENDING_HIGH_WATER: usize = 1024;

pub struct Monitor {
    name: String,
    every: Duration,
    last_report: Instant,
}

impl Monitor {
    pub fn new(name: &str, every: Duration) -> Self {
        Self {
            name: name.to_string(),
            every,
            last_report: Instant::now(),
        }
    }

    /// Print the heartbeat if the interval has elapsed. Returns whether a
    /// report was produced so the caller can piggyback housekeeping on it.
    pub fn check_and_report(&mut self, engine: &Interceptor) -> bool {
        if self.last_report.elapsed() < self.every {
            return false;
        }

        let now_str = Local::now().format("%H:%M:%S").to_string();
        let s = engine.stats();
        let c = engine.correlator_stats();
        println!(
            "[{}] {}: pkts={} skipped={} matched={} rewritten={} failed={} pending={} evicted={} capped={}",
            now_str,
            self.name,
            s.packets,
            s.not_applicable,
            s.matched,
            s.rewritten,
            s.rewrite_failed,
            engine.pending(),
            c.evicted,
            c.capped,
        );

        if engine.pending() > PENDING_HIGH_WATER {
            warn!(
                pending = engine.pending(),
                "correlation table under pressure, responses are not coming back"
            );
        }

        self.last_report = Instant::now();
        true
    }
}
