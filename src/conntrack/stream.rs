//! Line-oriented drivers for the conntrack output streams.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::config::{ConntrackConfig, FlowsConfig};
use crate::export::health::HealthMetrics;
use crate::flow::FlowStore;

use super::correlate::{Correlator, Outcome};
use super::parse::LineParser;

/// Parser, correlator and flow store wired together for one event stream.
///
/// Owned by the task reading the event stream. The flow store is the only
/// part shared with other tasks.
pub struct EventPipeline {
    parser: LineParser,
    correlator: Correlator,
    store: Arc<FlowStore>,
    log_events: bool,
    health: Option<Arc<HealthMetrics>>,
}

impl EventPipeline {
    pub fn new(flows: &FlowsConfig, store: Arc<FlowStore>) -> Result<Self> {
        Ok(Self {
            parser: LineParser::new().context("compiling conntrack line grammar")?,
            correlator: Correlator::new(flows),
            store,
            log_events: false,
            health: None,
        })
    }

    /// Builds a pipeline from the full configuration, reporting into
    /// `health`.
    pub fn from_config(
        conntrack: &ConntrackConfig,
        flows: &FlowsConfig,
        store: Arc<FlowStore>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        Ok(Self::new(flows, store)?
            .with_log_events(conntrack.log_events)
            .with_health(health))
    }

    /// Log every parsed event at info level.
    pub fn with_log_events(mut self, log_events: bool) -> Self {
        self.log_events = log_events;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Feeds one raw line through [`EventPipeline::handle_line`]. A line
    /// that is not valid UTF-8 counts as a parse error and is skipped.
    pub fn handle_bytes(&mut self, raw: &[u8]) -> Option<Outcome> {
        match std::str::from_utf8(raw) {
            Ok(line) => self.handle_line(line),
            Err(e) => {
                debug!(
                    error = %e,
                    line = %String::from_utf8_lossy(raw),
                    "skipping non-UTF-8 conntrack line",
                );
                if let Some(health) = &self.health {
                    health.lines_read.inc();
                    health.parse_errors.inc();
                }
                None
            }
        }
    }

    /// Feeds one line through parser and correlator. A matched flow is
    /// recorded in the store and its outcome returned.
    pub fn handle_line(&mut self, line: &str) -> Option<Outcome> {
        if let Some(health) = &self.health {
            health.lines_read.inc();
        }

        let event = match self.parser.parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, line, "skipping unparseable conntrack line");
                if let Some(health) = &self.health {
                    health.parse_errors.inc();
                }
                return None;
            }
        };

        if self.log_events {
            info!(
                flow_id = event.id,
                kind = %event.kind,
                timestamp = event.timestamp,
                original = %event.original,
                reply = %event.reply,
                assured = event.assured,
                "conntrack event",
            );
        }

        let outcome = self.correlator.handle(event);

        if let Outcome::Matched(record) = &outcome {
            debug!(
                flow_id = record.flow_id,
                device = %record.device_ip,
                rtt_ms = record.lan_rtt,
                "flow correlated",
            );
            let buffered = self.store.record(record.clone());
            if let Some(health) = &self.health {
                health.flows_correlated.inc();
                health.flow_buffer_len.set(buffered as f64);
            }
        }

        if let Some(health) = &self.health {
            if outcome == Outcome::Unpaired {
                health.unpaired_closing.inc();
            }
            health.pending_events.set(self.correlator.pending_len() as f64);
            health.sync_expired(&self.correlator.stats());
        }

        Some(outcome)
    }
}

/// Reads event lines until EOF, feeding each through `pipeline`.
/// Returns the number of lines read.
pub async fn drive_events<R>(mut reader: R, pipeline: &mut EventPipeline) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut count = 0u64;

    while read_raw_line(&mut reader, &mut buf)
        .await
        .context("reading conntrack event stream")?
    {
        count += 1;
        pipeline.handle_bytes(&buf);
    }

    let stats = pipeline.correlator().stats();
    debug!(
        lines = count,
        matched = stats.matched,
        unpaired = stats.unpaired,
        pending = pipeline.correlator().pending_len(),
        "conntrack event stream closed",
    );

    Ok(count)
}

/// Logs every diagnostic line verbatim until EOF. Returns the number of
/// lines read.
pub async fn drive_diagnostics<R>(mut reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut count = 0u64;

    while read_raw_line(&mut reader, &mut buf)
        .await
        .context("reading conntrack diagnostic stream")?
    {
        count += 1;
        let line = String::from_utf8_lossy(&buf);
        warn!(target: "conntrack", "{line}");
    }

    Ok(count)
}

/// Reads the next line into `buf` without its line terminator, whatever
/// its encoding. Returns false at EOF.
async fn read_raw_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(true)
}
