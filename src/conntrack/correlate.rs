use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::config::{DuplicateOpenPolicy, FlowsConfig};

use super::event::{flow_rtt_ms, ConnectionEvent, EventKind, FlowRecord, PendingEvent};

/// Result of feeding one event into the [`Correlator`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Opening event stored for a new flow id.
    Pending,
    /// Opening event replaced an earlier opening for the same id.
    Replaced,
    /// Opening event ignored because the id was already pending.
    Retransmit,
    /// Closing event matched a pending opening.
    Matched(FlowRecord),
    /// Closing event without a pending opening.
    Unpaired,
    /// Closing event whose tuples differ from the pending opening.
    Mismatched,
    /// Closing event matched but produced a negative RTT.
    Rejected { rtt_ms: f64 },
}

/// Per-outcome counters since the correlator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub openings: u64,
    pub matched: u64,
    pub unpaired: u64,
    pub replaced: u64,
    pub retransmits: u64,
    pub mismatched: u64,
    pub rejected: u64,
    pub expired: u64,
}

/// Pairs `SYN_RECV` and `ESTABLISHED` events by conntrack flow id.
///
/// Owned by the single task reading the event stream, so the pending map
/// needs no lock.
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<u64, PendingEvent>,
    policy: DuplicateOpenPolicy,
    strict_tuple_match: bool,
    /// Pending entry lifetime in event-clock seconds; 0 disables expiry.
    pending_ttl: f64,
    /// Timestamp of the previous event.
    last_timestamp: Option<f64>,
    last_sweep: Option<f64>,
    stats: CorrelatorStats,
}

impl Correlator {
    /// Creates a correlator from the flow configuration.
    pub fn new(cfg: &FlowsConfig) -> Self {
        Self {
            pending: HashMap::with_capacity(1024),
            policy: cfg.duplicate_open,
            strict_tuple_match: cfg.strict_tuple_match,
            pending_ttl: cfg.pending_ttl.as_secs_f64(),
            last_timestamp: None,
            last_sweep: None,
            stats: CorrelatorStats::default(),
        }
    }

    /// Feeds one event through the state machine.
    pub fn handle(&mut self, event: ConnectionEvent) -> Outcome {
        let timestamp = event.timestamp;

        let outcome = match event.kind {
            EventKind::Opening => self.handle_opening(event),
            EventKind::Closing => self.handle_closing(&event),
        };

        // The event clock is the lower of the last two timestamps, so a
        // single outlier line cannot move it.
        let now = match self.last_timestamp {
            Some(previous) => previous.min(timestamp),
            None => timestamp,
        };
        self.last_timestamp = Some(timestamp);
        self.maybe_expire(now);

        outcome
    }

    fn handle_opening(&mut self, event: ConnectionEvent) -> Outcome {
        self.stats.openings += 1;
        let id = event.id;

        if !self.pending.contains_key(&id) {
            self.pending.insert(id, PendingEvent::from(event));
            return Outcome::Pending;
        }

        match self.policy {
            DuplicateOpenPolicy::Replace => {
                self.stats.replaced += 1;
                self.pending.insert(id, PendingEvent::from(event));
                Outcome::Replaced
            }
            DuplicateOpenPolicy::Keep => {
                self.stats.retransmits += 1;
                Outcome::Retransmit
            }
        }
    }

    fn handle_closing(&mut self, event: &ConnectionEvent) -> Outcome {
        let opening = match self.pending.entry(event.id) {
            Entry::Vacant(_) => {
                self.stats.unpaired += 1;
                return Outcome::Unpaired;
            }
            Entry::Occupied(entry) => {
                if self.strict_tuple_match && !entry.get().same_tuple(event) {
                    self.stats.mismatched += 1;
                    debug!(
                        flow_id = event.id,
                        "closing event tuple differs from pending opening"
                    );
                    return Outcome::Mismatched;
                }
                entry.remove()
            }
        };

        let rtt_ms = flow_rtt_ms(opening.timestamp, event.timestamp);
        if rtt_ms < 0.0 {
            self.stats.rejected += 1;
            debug!(
                flow_id = event.id,
                rtt_ms, "closing event precedes opening, discarding flow"
            );
            return Outcome::Rejected { rtt_ms };
        }

        self.stats.matched += 1;
        Outcome::Matched(FlowRecord {
            flow_id: event.id,
            device_ip: opening.original.src,
            syn_timestamp: opening.timestamp,
            ack_timestamp: event.timestamp,
            lan_rtt: rtt_ms,
        })
    }

    /// Sweeps stale entries at most once per TTL of event time.
    fn maybe_expire(&mut self, now: f64) {
        if self.pending_ttl <= 0.0 {
            return;
        }

        match self.last_sweep {
            // First event, or the clock went backwards: restart the period.
            None => self.last_sweep = Some(now),
            Some(last) if now < last => self.last_sweep = Some(now),
            Some(last) if now - last >= self.pending_ttl => {
                let cutoff = now - self.pending_ttl;
                let expired = self.expire_older_than(cutoff);
                if expired > 0 {
                    debug!(expired, pending = self.pending.len(), "expired stale pending events");
                }
                self.last_sweep = Some(now);
            }
            Some(_) => {}
        }
    }

    /// Drops pending openings with a timestamp strictly before `cutoff`.
    /// Returns how many were dropped.
    pub fn expire_older_than(&mut self, cutoff: f64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.timestamp >= cutoff);
        let expired = before - self.pending.len();
        self.stats.expired += expired as u64;
        expired
    }

    /// Returns true if an opening event is waiting for this flow id.
    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Returns the pending opening for this flow id, if any.
    pub fn pending(&self, id: u64) -> Option<&PendingEvent> {
        self.pending.get(&id)
    }

    /// Number of openings waiting for a closing event.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }
}
