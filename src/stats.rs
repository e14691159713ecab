//! Periodic RTT aggregation over the flow store.
//!
//! Every tick computes the mean RTT over all buffered flows and the mean of
//! per-device means over the current window, publishes both to an
//! [`RttSink`], then resets the device window.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::flow::buffer::FlowBuffer;
use crate::flow::window::DeviceFlowWindow;
use crate::flow::FlowStore;

/// Receives aggregation results.
///
/// Gauge values are overwritten on every [`RttSink::publish`]; histogram
/// observations accumulate for the lifetime of the sink.
pub trait RttSink: Send + Sync {
    /// Adds one flow RTT (ms) to the flow distribution.
    fn observe_flow_rtt(&self, rtt_ms: f64);

    /// Adds one per-device mean RTT (ms) to the device distribution.
    fn observe_device_mean(&self, mean_ms: f64);

    /// Sets the gauges for this tick.
    fn publish(&self, summary: &TickSummary);
}

/// Results of one aggregation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickSummary {
    /// Sum of RTTs over all buffered flows.
    pub delay_total: f64,
    /// Buffered flow count.
    pub flow_count: usize,
    /// Mean RTT over buffered flows, 0 when empty.
    pub mean: f64,
    /// Distinct devices seen in the window.
    pub device_count: usize,
    /// Mean of per-device means, 0 when no devices.
    pub aggregated_mean: f64,
}

/// Arithmetic mean, 0 for an empty slice.
pub fn calculate_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean over all buffered flows; every RTT is observed into the sink.
fn flow_stats(buffer: &FlowBuffer, sink: &dyn RttSink) -> (f64, usize, f64) {
    let mut delay_total = 0.0;
    for rtt in buffer.rtts() {
        delay_total += rtt;
        sink.observe_flow_rtt(rtt);
    }

    let flow_count = buffer.len();
    let mean = if flow_count > 0 {
        delay_total / flow_count as f64
    } else {
        0.0
    };

    (delay_total, flow_count, mean)
}

/// Mean of per-device means; every device mean is observed into the sink.
fn device_stats(window: &DeviceFlowWindow, sink: &dyn RttSink) -> (usize, f64) {
    let mut devices_mean = 0.0;
    for (device, samples) in window.iter() {
        let mean = calculate_mean(samples);
        debug!(device, samples = samples.len(), mean, "device window");
        devices_mean += mean;
        sink.observe_device_mean(mean);
    }

    let device_count = window.device_count();
    let aggregated_mean = if device_count > 0 {
        devices_mean / device_count as f64
    } else {
        0.0
    };

    (device_count, aggregated_mean)
}

/// Computes one tick over the store and publishes it to `sink`.
///
/// Runs entirely inside the store's lock and clears the device window.
pub fn aggregate(store: &FlowStore, sink: &dyn RttSink) -> TickSummary {
    store.drain_and_reset(|buffer, window| {
        let (delay_total, flow_count, mean) = flow_stats(buffer, sink);
        let (device_count, aggregated_mean) = device_stats(window, sink);

        let summary = TickSummary {
            delay_total,
            flow_count,
            mean,
            device_count,
            aggregated_mean,
        };
        sink.publish(&summary);
        summary
    })
}

/// Runs [`aggregate`] on a fixed period.
pub struct Aggregator {
    store: Arc<FlowStore>,
    sink: Arc<dyn RttSink>,
    period: Duration,
    verbose: bool,
}

impl Aggregator {
    pub fn new(
        store: Arc<FlowStore>,
        sink: Arc<dyn RttSink>,
        period: Duration,
        verbose: bool,
    ) -> Self {
        Self {
            store,
            sink,
            period,
            verbose,
        }
    }

    /// Computes and publishes one tick.
    pub fn tick(&self) -> TickSummary {
        let summary = aggregate(&self.store, self.sink.as_ref());

        if self.verbose {
            info!(
                delay_total = summary.delay_total,
                flow_count = summary.flow_count,
                mean_rtt_ms = summary.mean,
                "all flows",
            );
            info!(
                device_count = summary.device_count,
                aggregated_mean_rtt_ms = summary.aggregated_mean,
                "aggregated per device",
            );
        }

        summary
    }

    /// Ticks every period until `cancel` fires. The first tick runs
    /// immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(period = ?self.period, "aggregator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("aggregator stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::{RttSink, TickSummary};

    /// Sink that keeps every call for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub flow_rtts: Mutex<Vec<f64>>,
        pub device_means: Mutex<Vec<f64>>,
        pub published: Mutex<Vec<TickSummary>>,
    }

    impl RttSink for RecordingSink {
        fn observe_flow_rtt(&self, rtt_ms: f64) {
            self.flow_rtts.lock().push(rtt_ms);
        }

        fn observe_device_mean(&self, mean_ms: f64) {
            self.device_means.lock().push(mean_ms);
        }

        fn publish(&self, summary: &TickSummary) {
            self.published.lock().push(*summary);
        }
    }
}
