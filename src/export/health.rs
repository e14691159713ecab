use anyhow::Result;
use prometheus::{Counter, Gauge, Opts, Registry};

use crate::conntrack::correlate::CorrelatorStats;

const NAMESPACE: &str = "lanrtt";

/// Prometheus metrics describing the agent's own health.
///
/// All metrics use the "lanrtt" namespace.
pub struct HealthMetrics {
    /// Total lines read from the conntrack event stream.
    pub lines_read: Counter,
    /// Total event lines skipped because they failed to parse.
    pub parse_errors: Counter,
    /// Total flows correlated into the flow store.
    pub flows_correlated: Counter,
    /// Total closing events with no pending opening.
    pub unpaired_closing: Counter,
    /// Total pending openings dropped by expiry.
    pub pending_expired: Counter,
    /// Openings currently waiting for a closing event.
    pub pending_events: Gauge,
    /// Flows currently held in the flow buffer.
    pub flow_buffer_len: Gauge,
}

impl HealthMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let lines_read = Counter::with_opts(
            Opts::new(
                "lines_read_total",
                "Total lines read from the conntrack event stream.",
            )
            .namespace(NAMESPACE),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new(
                "parse_errors_total",
                "Total conntrack event lines that failed to parse.",
            )
            .namespace(NAMESPACE),
        )?;
        let flows_correlated = Counter::with_opts(
            Opts::new(
                "flows_correlated_total",
                "Total SYN_RECV/ESTABLISHED pairs correlated into flows.",
            )
            .namespace(NAMESPACE),
        )?;
        let unpaired_closing = Counter::with_opts(
            Opts::new(
                "unpaired_closing_total",
                "Total ESTABLISHED events without a pending SYN_RECV.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_expired = Counter::with_opts(
            Opts::new(
                "pending_expired_total",
                "Total pending SYN_RECV events dropped by expiry.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_events = Gauge::with_opts(
            Opts::new(
                "pending_events",
                "SYN_RECV events waiting for their ESTABLISHED event.",
            )
            .namespace(NAMESPACE),
        )?;
        let flow_buffer_len = Gauge::with_opts(
            Opts::new("flow_buffer_len", "Flows currently held in the flow buffer.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(flows_correlated.clone()))?;
        registry.register(Box::new(unpaired_closing.clone()))?;
        registry.register(Box::new(pending_expired.clone()))?;
        registry.register(Box::new(pending_events.clone()))?;
        registry.register(Box::new(flow_buffer_len.clone()))?;

        Ok(Self {
            lines_read,
            parse_errors,
            flows_correlated,
            unpaired_closing,
            pending_expired,
            pending_events,
            flow_buffer_len,
        })
    }

    /// Brings the expiry counter up to the correlator's cumulative total.
    pub fn sync_expired(&self, stats: &CorrelatorStats) {
        let seen = self.pending_expired.get() as u64;
        if stats.expired > seen {
            self.pending_expired.inc_by((stats.expired - seen) as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_with_namespace() {
        let registry = Registry::new();
        let health = HealthMetrics::new(&registry).expect("metrics");
        health.lines_read.inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();

        assert!(names.contains(&"lanrtt_lines_read_total".to_string()));
        assert!(names.contains(&"lanrtt_pending_events".to_string()));
        assert!(names.contains(&"lanrtt_flow_buffer_len".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        HealthMetrics::new(&registry).expect("first");
        assert!(HealthMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_sync_expired_is_monotonic() {
        let registry = Registry::new();
        let health = HealthMetrics::new(&registry).expect("metrics");

        let mut stats = CorrelatorStats {
            expired: 3,
            ..Default::default()
        };
        health.sync_expired(&stats);
        health.sync_expired(&stats);
        assert_eq!(health.pending_expired.get(), 3.0);

        stats.expired = 5;
        health.sync_expired(&stats);
        assert_eq!(health.pending_expired.get(), 5.0);
    }
}
