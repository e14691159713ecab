use std::collections::HashMap;

/// Per-device RTT samples accumulated since the last aggregation tick.
#[derive(Debug, Clone, Default)]
pub struct DeviceFlowWindow {
    samples: HashMap<String, Vec<f64>>,
}

impl DeviceFlowWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one RTT sample for a device.
    pub fn record(&mut self, device_ip: &str, lan_rtt: f64) {
        match self.samples.get_mut(device_ip) {
            Some(samples) => samples.push(lan_rtt),
            None => {
                self.samples.insert(device_ip.to_string(), vec![lan_rtt]);
            }
        }
    }

    /// Iterates `(device, samples)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.samples.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Samples recorded for one device.
    pub fn samples(&self, device_ip: &str) -> Option<&[f64]> {
        self.samples.get(device_ip).map(Vec::as_slice)
    }

    /// Number of distinct devices in the window.
    pub fn device_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Removes every device, keeping allocated map capacity.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
