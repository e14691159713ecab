pub mod buffer;
pub mod window;

use parking_lot::Mutex;

use crate::conntrack::event::FlowRecord;

use self::buffer::FlowBuffer;
use self::window::DeviceFlowWindow;

/// State guarded by the store's single lock.
#[derive(Debug)]
struct Inner {
    buffer: FlowBuffer,
    window: DeviceFlowWindow,
}

/// Shared flow history plus the per-device aggregation window.
///
/// The correlator task writes through [`FlowStore::record`] and the
/// aggregator reads through [`FlowStore::drain_and_reset`]. Both take the
/// same lock, so every tick sees whole records and a window consistent with
/// the buffer.
#[derive(Debug)]
pub struct FlowStore {
    inner: Mutex<Inner>,
}

impl FlowStore {
    /// Creates a store whose buffer holds at most `capacity` flows.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: FlowBuffer::new(capacity),
                window: DeviceFlowWindow::new(),
            }),
        }
    }

    /// Appends a flow (evicting the oldest at capacity) and records its RTT
    /// in the device window, atomically. Returns the buffer length after
    /// the append.
    pub fn record(&self, record: FlowRecord) -> usize {
        let mut inner = self.inner.lock();
        inner.window.record(&record.device_ip, record.lan_rtt);
        inner.buffer.push(record);
        inner.buffer.len()
    }

    /// Runs `f` over the buffer and window under the lock, then clears the
    /// window before releasing it. The buffer is left untouched.
    pub fn drain_and_reset<R>(&self, f: impl FnOnce(&FlowBuffer, &DeviceFlowWindow) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&inner.buffer, &inner.window);
        inner.window.clear();
        result
    }

    /// Number of buffered flows.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Number of devices in the current window.
    pub fn window_devices(&self) -> usize {
        self.inner.lock().window.device_count()
    }

    /// Copies the buffered flows, oldest first.
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.inner.lock().buffer.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn record(flow_id: u64, device: &str, lan_rtt: f64) -> FlowRecord {
        FlowRecord {
            flow_id,
            device_ip: device.to_string(),
            syn_timestamp: 1.0,
            ack_timestamp: 1.0 + lan_rtt / 1000.0,
            lan_rtt,
        }
    }

    #[test]
    fn test_record_updates_buffer_and_window() {
        let store = FlowStore::new(10);
        store.record(record(1, "10.0.0.1", 5.0));
        store.record(record(2, "10.0.0.1", 15.0));
        store.record(record(3, "10.0.0.2", 20.0));

        assert_eq!(store.len(), 3);
        assert_eq!(store.window_devices(), 2);
    }

    #[test]
    fn test_drain_and_reset_clears_window_only() {
        let store = FlowStore::new(10);
        store.record(record(1, "10.0.0.1", 5.0));

        let (flows, devices) = store.drain_and_reset(|buf, win| (buf.len(), win.device_count()));
        assert_eq!((flows, devices), (1, 1));

        assert_eq!(store.len(), 1);
        assert_eq!(store.window_devices(), 0);
    }

    #[test]
    fn test_record_returns_buffer_len() {
        let store = FlowStore::new(2);
        assert_eq!(store.record(record(1, "10.0.0.1", 1.0)), 1);
        assert_eq!(store.record(record(2, "10.0.0.1", 1.0)), 2);
        // At capacity the length stays put.
        assert_eq!(store.record(record(3, "10.0.0.2", 1.0)), 2);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let store = FlowStore::new(2);
        for id in 1..=3 {
            store.record(record(id, "10.0.0.1", id as f64));
        }
        let ids: Vec<u64> = store.snapshot().iter().map(|r| r.flow_id).collect();
        assert_eq!(ids, vec![2, 3]);
        // The window still holds every sample since the last tick.
        let samples = store.drain_and_reset(|_, win| win.samples("10.0.0.1").map(<[f64]>::len));
        assert_eq!(samples, Some(3));
    }

    #[test]
    fn test_concurrent_record_and_drain() {
        let store = Arc::new(FlowStore::new(100));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    store.record(record(t * 1000 + i, "10.0.0.1", 1.0));
                }
            }));
        }

        let mut drained = 0usize;
        for _ in 0..50 {
            drained += store.drain_and_reset(|_, win| {
                win.samples("10.0.0.1").map(<[f64]>::len).unwrap_or(0)
            });
        }

        for h in handles {
            h.join().expect("thread panicked");
        }
        drained += store.drain_and_reset(|_, win| {
            win.samples("10.0.0.1").map(<[f64]>::len).unwrap_or(0)
        });

        assert_eq!(drained, 1000);
        assert_eq!(store.len(), 100);
    }
}
