use std::collections::VecDeque;

use crate::conntrack::event::FlowRecord;

/// Bounded, insertion-ordered history of correlated flows.
///
/// When full, pushing a record evicts the oldest one first.
#[derive(Debug, Clone)]
pub struct FlowBuffer {
    records: VecDeque<FlowRecord>,
    capacity: usize,
}

impl FlowBuffer {
    /// Creates an empty buffer holding at most `capacity` records.
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a record, returning the evicted record if the buffer was full.
    pub fn push(&mut self, record: FlowRecord) -> Option<FlowRecord> {
        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    /// Iterates records from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &FlowRecord> {
        self.records.iter()
    }

    /// Iterates round-trip times from oldest to newest.
    pub fn rtts(&self) -> impl Iterator<Item = f64> + '_ {
        self.records.iter().map(|r| r.lan_rtt)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flow_id: u64, lan_rtt: f64) -> FlowRecord {
        FlowRecord {
            flow_id,
            device_ip: "10.0.0.1".to_string(),
            syn_timestamp: 0.0,
            ack_timestamp: lan_rtt / 1000.0,
            lan_rtt,
        }
    }

    #[test]
    fn test_push_below_capacity() {
        let mut buf = FlowBuffer::new(3);
        assert!(buf.push(record(1, 1.0)).is_none());
        assert!(buf.push(record(2, 2.0)).is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_push_over_capacity_evicts_oldest() {
        let mut buf = FlowBuffer::new(3);
        for id in 1..=3 {
            buf.push(record(id, id as f64));
        }

        let evicted = buf.push(record(4, 4.0)).expect("oldest evicted");
        assert_eq!(evicted.flow_id, 1);
        assert_eq!(buf.len(), 3);

        let ids: Vec<u64> = buf.iter().map(|r| r.flow_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buf = FlowBuffer::new(5);
        for id in 0..100 {
            buf.push(record(id, 1.0));
            assert!(buf.len() <= 5);
        }
        let ids: Vec<u64> = buf.iter().map(|r| r.flow_id).collect();
        assert_eq!(ids, vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut buf = FlowBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(record(1, 1.0));
        buf.push(record(2, 2.0));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.rtts().collect::<Vec<_>>(), vec![2.0]);
    }
}
