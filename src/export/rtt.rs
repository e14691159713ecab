use anyhow::Result;
use prometheus::{Gauge, Histogram, HistogramOpts, Opts, Registry};

use crate::stats::{RttSink, TickSummary};

/// Histogram layout shared by both RTT distributions (ms): 5, 15, ... 195.
const BUCKET_START: f64 = 5.0;
const BUCKET_WIDTH: f64 = 10.0;
const BUCKET_COUNT: usize = 20;

/// The published RTT metrics.
///
/// Names carry no namespace so existing dashboards keep working.
pub struct RttMetrics {
    pub mean: Gauge,
    pub flows_histogram: Histogram,
    pub aggregated_mean: Gauge,
    pub aggregated_histogram: Histogram,
    pub unique_devices: Gauge,
}

impl RttMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let buckets = prometheus::linear_buckets(BUCKET_START, BUCKET_WIDTH, BUCKET_COUNT)?;

        let mean = Gauge::with_opts(Opts::new(
            "lanRtt_mean_value",
            "Mean LAN round-trip time over buffered flows in milliseconds.",
        ))?;
        let flows_histogram = Histogram::with_opts(
            HistogramOpts::new(
                "lanRtt_flows_histo_value",
                "Distribution of individual flow LAN round-trip times in milliseconds.",
            )
            .buckets(buckets.clone()),
        )?;
        let aggregated_mean = Gauge::with_opts(Opts::new(
            "lanRtt_aggregated_device_flows_mean_value",
            "Mean of per-device mean LAN round-trip times in milliseconds.",
        ))?;
        let aggregated_histogram = Histogram::with_opts(
            HistogramOpts::new(
                "lanRtt_aggregated_device_flows_histo_value",
                "Distribution of per-device mean LAN round-trip times in milliseconds.",
            )
            .buckets(buckets),
        )?;
        let unique_devices = Gauge::with_opts(Opts::new(
            "lanRtt_unique_device_flows_value",
            "Distinct devices with a correlated flow in the last window.",
        ))?;

        registry.register(Box::new(mean.clone()))?;
        registry.register(Box::new(flows_histogram.clone()))?;
        registry.register(Box::new(aggregated_mean.clone()))?;
        registry.register(Box::new(aggregated_histogram.clone()))?;
        registry.register(Box::new(unique_devices.clone()))?;

        Ok(Self {
            mean,
            flows_histogram,
            aggregated_mean,
            aggregated_histogram,
            unique_devices,
        })
    }
}

impl RttSink for RttMetrics {
    fn observe_flow_rtt(&self, rtt_ms: f64) {
        self.flows_histogram.observe(rtt_ms);
    }

    fn observe_device_mean(&self, mean_ms: f64) {
        self.aggregated_histogram.observe(mean_ms);
    }

    fn publish(&self, summary: &TickSummary) {
        self.mean.set(summary.mean);
        self.aggregated_mean.set(summary.aggregated_mean);
        self.unique_devices.set(summary.device_count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_sets_gauges() {
        let registry = Registry::new();
        let metrics = RttMetrics::new(&registry).expect("metrics");

        metrics.publish(&TickSummary {
            delay_total: 60.0,
            flow_count: 3,
            mean: 20.0,
            device_count: 2,
            aggregated_mean: 17.5,
        });

        assert_eq!(metrics.mean.get(), 20.0);
        assert_eq!(metrics.aggregated_mean.get(), 17.5);
        assert_eq!(metrics.unique_devices.get(), 2.0);
    }

    #[test]
    fn test_histograms_accumulate() {
        let registry = Registry::new();
        let metrics = RttMetrics::new(&registry).expect("metrics");

        metrics.observe_flow_rtt(4.0);
        metrics.observe_flow_rtt(12.0);
        metrics.observe_flow_rtt(500.0);
        metrics.observe_device_mean(8.0);

        assert_eq!(metrics.flows_histogram.get_sample_count(), 3);
        assert_eq!(metrics.flows_histogram.get_sample_sum(), 516.0);
        assert_eq!(metrics.aggregated_histogram.get_sample_count(), 1);
    }

    #[test]
    fn test_linear_bucket_layout() {
        let registry = Registry::new();
        let metrics = RttMetrics::new(&registry).expect("metrics");
        metrics.observe_flow_rtt(1.0);

        let families = registry.gather();
        let family = families
            .iter()
            .find(|mf| mf.get_name() == "lanRtt_flows_histo_value")
            .expect("flow histogram registered");
        let histogram = family.get_metric()[0].get_histogram();
        let bounds: Vec<f64> = histogram
            .get_bucket()
            .iter()
            .map(|b| b.get_upper_bound())
            .collect();

        assert_eq!(bounds.len(), 20);
        assert_eq!(bounds[0], 5.0);
        assert_eq!(bounds[1], 15.0);
        assert_eq!(bounds[19], 195.0);
    }
}
