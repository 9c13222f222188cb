use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::flow_key::FlowKey;

// ==========================================
// Pending-match table (request -> response pairing)
// ==========================================
// A matched outbound request is remembered under its own flow key together
// with the ack number it carried; under non-pipelined HTTP that ack is the
// seq the server will put on its first response byte. The response arrives
// on the reversed flow, so lookups reverse the key before touching the map.
// Entries never leave their flow bucket: two flows that happen to produce
// the same numeric seq stay isolated.

#[derive(Debug)]
pub struct PendingMatch {
    pub expected_seq: u32,
    pub created_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelatorStats {
    pub recorded: u64,
    pub consumed: u64,
    pub evicted: u64,
    pub capped: u64,
}

pub struct Correlator {
    pending: HashMap<FlowKey, VecDeque<PendingMatch>>,
    ttl: Duration,
    max_per_flow: usize,
    op_counter: u64,
    stats: CorrelatorStats,
}

// amortized lazy sweep, same trick as a periodic conntrack GC
const SWEEP_EVERY: u64 = 256;

impl Correlator {
    pub fn new(ttl: Duration, max_per_flow: usize) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
            max_per_flow,
            op_counter: 0,
            stats: CorrelatorStats::default(),
        }
    }

    /// Remember a matched request. Repeated matches on the same flow are
    /// tracked independently, oldest first, up to the per-flow cap.
    pub fn record(&mut self, key: FlowKey, expected_seq: u32) {
        self.tick();
        let entries = self.pending.entry(key).or_default();
        if entries.len() >= self.max_per_flow {
            entries.pop_front();
            self.stats.capped += 1;
            warn!(flow = %key, cap = self.max_per_flow, "per-flow cap hit, dropping oldest pending match");
        }
        entries.push_back(PendingMatch {
            expected_seq,
            created_at: Instant::now(),
        });
        self.stats.recorded += 1;
    }

    /// Destructively pair an inbound response segment with the oldest
    /// pending entry of the reversed flow carrying exactly this seq.
    /// A miss changes nothing.
    pub fn try_consume(&mut self, response_key: FlowKey, response_seq: u32) -> Option<PendingMatch> {
        self.tick();
        let key = response_key.reversed();
        let entries = self.pending.get_mut(&key)?;
        let idx = entries
            .iter()
            .position(|p| p.expected_seq == response_seq)?;
        let hit = entries.remove(idx)?;
        if entries.is_empty() {
            self.pending.remove(&key);
        }
        self.stats.consumed += 1;
        Some(hit)
    }

    /// Drop every entry older than the TTL. Requests whose responses never
    /// came back would otherwise pin table memory forever.
    pub fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        let mut evicted = 0u64;
        self.pending.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|p| now.saturating_duration_since(p.created_at) <= ttl);
            evicted += (before - entries.len()) as u64;
            !entries.is_empty()
        });
        if evicted > 0 {
            self.stats.evicted += evicted;
            debug!(evicted, remaining = self.len(), "evicted expired pending matches");
        }
    }

    fn tick(&mut self) {
        self.op_counter += 1;
        if self.op_counter % SWEEP_EVERY == 0 {
            self.evict_expired(Instant::now());
        }
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn flow(last_octet: u8, src_port: u16) -> FlowKey {
        FlowKey {
            src: Ipv4Addr::new(10, 0, 0, last_octet),
            dst: Ipv4Addr::new(93, 184, 216, 34),
            src_port,
            dst_port: 80,
        }
    }

    fn correlator() -> Correlator {
        Correlator::new(Duration::from_secs(30), 32)
    }

    #[test]
    fn records_and_consumes_on_reversed_flow() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 1000);
        assert_eq!(c.len(), 1);

        // the response naturally carries the reversed endpoints
        let hit = c.try_consume(request.reversed(), 1000).expect("must pair");
        assert_eq!(hit.expected_seq, 1000);
        assert!(c.is_empty());
    }

    #[test]
    fn consumption_is_destructive() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 1000);
        assert!(c.try_consume(request.reversed(), 1000).is_some());
        assert!(c.try_consume(request.reversed(), 1000).is_none());
    }

    #[test]
    fn non_matching_seq_leaves_table_unchanged() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 1000);
        assert!(c.try_consume(request.reversed(), 5000).is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn same_direction_key_does_not_pair() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 1000);
        // an outbound-keyed lookup must not spend the entry
        assert!(c.try_consume(request, 1000).is_none());
    }

    #[test]
    fn flows_are_isolated_even_with_equal_seq() {
        let mut c = correlator();
        let a = flow(2, 51000);
        let b = flow(3, 40000);
        c.record(a, 1000);
        assert!(c.try_consume(b.reversed(), 1000).is_none());
        assert_eq!(c.len(), 1);
        assert!(c.try_consume(a.reversed(), 1000).is_some());
    }

    #[test]
    fn multiple_outstanding_requests_on_one_flow() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 100);
        c.record(request, 200);
        assert!(c.try_consume(request.reversed(), 200).is_some());
        assert!(c.try_consume(request.reversed(), 100).is_some());
        assert!(c.is_empty());
    }

    #[test]
    fn duplicate_seq_consumed_one_at_a_time() {
        let mut c = correlator();
        let request = flow(2, 51000);
        c.record(request, 700);
        c.record(request, 700);
        assert!(c.try_consume(request.reversed(), 700).is_some());
        assert_eq!(c.len(), 1);
        assert!(c.try_consume(request.reversed(), 700).is_some());
        assert!(c.is_empty());
    }

    #[test]
    fn ttl_eviction_forgets_stale_entries() {
        let mut c = Correlator::new(Duration::from_secs(5), 32);
        let request = flow(2, 51000);
        c.record(request, 1000);

        // still fresh just before the deadline
        c.evict_expired(Instant::now() + Duration::from_secs(4));
        assert_eq!(c.len(), 1);

        c.evict_expired(Instant::now() + Duration::from_secs(6));
        assert!(c.is_empty());
        assert!(c.try_consume(request.reversed(), 1000).is_none());
        assert_eq!(c.stats().evicted, 1);
    }

    #[test]
    fn per_flow_cap_drops_oldest() {
        let mut c = Correlator::new(Duration::from_secs(30), 2);
        let request = flow(2, 51000);
        c.record(request, 1);
        c.record(request, 2);
        c.record(request, 3);
        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().capped, 1);
        assert!(c.try_consume(request.reversed(), 1).is_none());
        assert!(c.try_consume(request.reversed(), 2).is_some());
        assert!(c.try_consume(request.reversed(), 3).is_some());
    }
}
