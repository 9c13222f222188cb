use tracing::{info, warn};

use crate::correlator::{Correlator, CorrelatorStats};
use crate::policy::{Matcher, Responder};
use crate::rewriter;
use crate::segment::ParsedSegment;

// ==========================================
// Interception loop core
// ==========================================
// One call per delivered packet, one decision per call. The engine never
// holds a packet and never asks for one to be dropped: traffic outside the
// policy must keep flowing untouched.

/// Verdict rendered for a single packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// Forward the original bytes unmodified.
    Forward,
    /// Forward with the payload replaced by a repacked wire-valid packet.
    Replace(Vec<u8>),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub packets: u64,
    pub not_applicable: u64,
    pub matched: u64,
    pub rewritten: u64,
    pub rewrite_failed: u64,
}

pub struct Interceptor {
    target_port: u16,
    matcher: Box<dyn Matcher>,
    responder: Box<dyn Responder>,
    correlator: Correlator,
    stats: EngineStats,
}

impl Interceptor {
    pub fn new(
        target_port: u16,
        matcher: Box<dyn Matcher>,
        responder: Box<dyn Responder>,
        correlator: Correlator,
    ) -> Self {
        Self {
            target_port,
            matcher,
            responder,
            correlator,
            stats: EngineStats::default(),
        }
    }

    /// Classify one raw packet and render its forward decision.
    pub fn handle(&mut self, buf: &[u8]) -> Decision {
        self.stats.packets += 1;

        let Some(seg) = ParsedSegment::parse(buf) else {
            // not IPv4/TCP or truncated: none of our business
            self.stats.not_applicable += 1;
            return Decision::Forward;
        };

        // Handshake segments and pure ACKs carry no application data. The
        // server acks the request with the same seq its response will use,
        // so consuming here would spend the entry one segment too early.
        if seg.payload().is_empty() {
            return Decision::Forward;
        }

        if seg.dst_port == self.target_port {
            if self.matcher.matches(&seg) {
                info!(flow = %seg.flow_key(), expected_seq = seg.ack, "request matched, recording");
                self.correlator.record(seg.flow_key(), seg.ack);
                self.stats.matched += 1;
            }
            // requests are observed, never altered
            return Decision::Forward;
        }

        if seg.src_port == self.target_port {
            if let Some(hit) = self.correlator.try_consume(seg.flow_key(), seg.seq) {
                let body = self.responder.build(&seg);
                match rewriter::rewrite(&seg, &body) {
                    Ok(bytes) => {
                        info!(
                            flow = %seg.flow_key(),
                            seq = seg.seq,
                            waited_ms = hit.created_at.elapsed().as_millis() as u64,
                            "response rewritten"
                        );
                        self.stats.rewritten += 1;
                        return Decision::Replace(bytes);
                    }
                    Err(err) => {
                        // never emit a half-updated packet
                        warn!(flow = %seg.flow_key(), %err, "rewrite failed, forwarding original");
                        self.stats.rewrite_failed += 1;
                        return Decision::Forward;
                    }
                }
            }
        }

        Decision::Forward
    }

    /// Explicit eviction pass, driven from the loop during quiet periods.
    pub fn sweep(&mut self) {
        self.correlator.evict_expired(std::time::Instant::now());
    }

    pub fn pending(&self) -> usize {
        self.correlator.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.correlator.stats()
    }
}
