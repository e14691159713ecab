use std::fmt;

/// EventKind identifies the conntrack TCP state carried by an event line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `SYN_RECV`: the handshake has been seen but not completed.
    Opening,
    /// `ESTABLISHED`: the handshake has completed.
    Closing,
}

impl EventKind {
    /// Returns the conntrack state token for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "SYN_RECV",
            Self::Closing => "ESTABLISHED",
        }
    }

    /// Convert from a conntrack state token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "SYN_RECV" => Some(Self::Opening),
            "ESTABLISHED" => Some(Self::Closing),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One direction of a tracked connection as printed by conntrack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoints {
    pub src: String,
    pub dst: String,
    pub sport: u16,
    pub dport: u16,
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}:{}", self.src, self.sport, self.dst, self.dport)
    }
}

/// A single parsed conntrack event line.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    /// Kernel timestamp in seconds with microsecond fraction.
    pub timestamp: f64,
    pub kind: EventKind,
    /// Original direction (the LAN device is the source).
    pub original: Endpoints,
    /// Reply direction.
    pub reply: Endpoints,
    /// Whether conntrack flagged the entry `[ASSURED]`.
    pub assured: bool,
    /// Conntrack flow identifier.
    pub id: u64,
}

/// The opening half of a flow, waiting for its closing event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub timestamp: f64,
    pub original: Endpoints,
    pub reply: Endpoints,
}

impl PendingEvent {
    /// Returns true if both direction tuples match the given event.
    pub fn same_tuple(&self, event: &ConnectionEvent) -> bool {
        self.original == event.original && self.reply == event.reply
    }
}

impl From<ConnectionEvent> for PendingEvent {
    fn from(event: ConnectionEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            original: event.original,
            reply: event.reply,
        }
    }
}

/// A correlated flow: one opening event matched with its closing event.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub flow_id: u64,
    /// Original source address of the opening event.
    pub device_ip: String,
    pub syn_timestamp: f64,
    pub ack_timestamp: f64,
    /// Round-trip time in milliseconds.
    pub lan_rtt: f64,
}

/// Round-trip time in milliseconds between two event timestamps (seconds).
pub fn flow_rtt_ms(syn_timestamp: f64, ack_timestamp: f64) -> f64 {
    (ack_timestamp - syn_timestamp) * 1000.0
}
