//! Line grammar for `conntrack -E -o timestamp,id` output.
//!
//! A relevant line looks like:
//!
//! ```text
//! [1702972533.997256]	 [UPDATE] tcp      6 60 SYN_RECV src=10.152.11.29 dst=61.170.79.234 sport=58765 dport=443 src=61.170.79.234 dst=31.205.218.180 sport=443 dport=58765 id=2857185344
//! ```
//!
//! Only `SYN_RECV` and `ESTABLISHED` lines carry events. Every other state is
//! irrelevant and yields `Ok(None)`. A line naming one of the two states but
//! not fitting the grammar, or fitting it with unparseable values, is a
//! [`ParseError`].

use regex::{Captures, Regex};
use thiserror::Error;

use super::event::{ConnectionEvent, Endpoints, EventKind};

/// Number of capture groups a full match must populate: timestamp seconds,
/// timestamp fraction, state, two 4-field endpoint groups and the id.
pub const REQUIRED_FIELDS: usize = 12;

const EVENT_PATTERN: &str = concat!(
    r"^\[([^\]\s.]+)\.([^\]\s]+) *\]",
    r".*\b(SYN_RECV|ESTABLISHED)",
    r" src=([^ ]+) dst=([^ ]+) sport=([^ ]+) dport=([^ ]+)",
    r" src=([^ ]+) dst=([^ ]+) sport=([^ ]+) dport=([^ ]+)",
    r" (\[ASSURED\] )?id=([0-9]+)\s*$",
);

const RELEVANT_PATTERN: &str = r"^\[[^\]]*\].*\b(SYN_RECV|ESTABLISHED)\b";

/// Errors for lines that name a tracked state but cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed timestamp: {raw}")]
    MalformedTimestamp { raw: String },

    #[error("invalid {field} port: {raw}")]
    InvalidPort { field: &'static str, raw: String },

    #[error("invalid flow id: {raw}")]
    InvalidId { raw: String },

    #[error("{state} line captured {captured} of 12 fields")]
    IncompleteFields { state: &'static str, captured: usize },
}

/// Compiled conntrack line grammar.
#[derive(Debug, Clone)]
pub struct LineParser {
    event: Regex,
    relevant: Regex,
}

impl LineParser {
    /// Compiles the grammar.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            event: Regex::new(EVENT_PATTERN)?,
            relevant: Regex::new(RELEVANT_PATTERN)?,
        })
    }

    /// Parses one line.
    ///
    /// Returns `Ok(None)` for lines that carry no opening/closing event.
    pub fn parse_line(&self, line: &str) -> Result<Option<ConnectionEvent>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);

        match self.event.captures(line) {
            Some(caps) => decode(&caps).map(Some),
            None => match self.relevant.captures(line) {
                Some(caps) => {
                    let state = EventKind::from_token(&caps[1])
                        .map(EventKind::as_str)
                        .unwrap_or("unknown");
                    Err(ParseError::IncompleteFields {
                        state,
                        captured: count_fields(line),
                    })
                }
                None => Ok(None),
            },
        }
    }

    /// Parses every line of a text block, keeping only lines that carry an
    /// event or an error, in input order.
    pub fn parse_block(&self, block: &str) -> Vec<Result<ConnectionEvent, ParseError>> {
        block
            .lines()
            .filter_map(|line| self.parse_line(line).transpose())
            .collect()
    }
}

fn decode(caps: &Captures<'_>) -> Result<ConnectionEvent, ParseError> {
    // Group 12 ([ASSURED]) is optional; the remaining groups are required.
    let captured = (1..caps.len())
        .filter(|&i| i != 12 && caps.get(i).is_some())
        .count();
    if captured < REQUIRED_FIELDS {
        return Err(ParseError::IncompleteFields {
            state: caps
                .get(3)
                .and_then(|m| EventKind::from_token(m.as_str()))
                .map(EventKind::as_str)
                .unwrap_or("unknown"),
            captured,
        });
    }

    let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

    let timestamp = parse_timestamp(group(1), group(2))?;
    let kind = EventKind::from_token(group(3)).ok_or(ParseError::IncompleteFields {
        state: "unknown",
        captured,
    })?;

    let original = Endpoints {
        src: group(4).to_string(),
        dst: group(5).to_string(),
        sport: parse_port("original sport", group(6))?,
        dport: parse_port("original dport", group(7))?,
    };
    let reply = Endpoints {
        src: group(8).to_string(),
        dst: group(9).to_string(),
        sport: parse_port("reply sport", group(10))?,
        dport: parse_port("reply dport", group(11))?,
    };

    let raw_id = group(13);
    let id = raw_id.parse::<u64>().map_err(|_| ParseError::InvalidId {
        raw: raw_id.to_string(),
    })?;

    Ok(ConnectionEvent {
        timestamp,
        kind,
        original,
        reply,
        assured: caps.get(12).is_some(),
        id,
    })
}

/// Joins the integer and fractional timestamp parts into seconds.
pub fn parse_timestamp(secs: &str, frac: &str) -> Result<f64, ParseError> {
    let malformed = || ParseError::MalformedTimestamp {
        raw: format!("{secs}.{frac}"),
    };

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(secs) || !all_digits(frac) {
        return Err(malformed());
    }

    let value: f64 = format!("{secs}.{frac}").parse().map_err(|_| malformed())?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(malformed())
    }
}

fn parse_port(field: &'static str, raw: &str) -> Result<u16, ParseError> {
    raw.parse::<u16>().map_err(|_| ParseError::InvalidPort {
        field,
        raw: raw.to_string(),
    })
}

/// Counts the fields present on a line that failed the full grammar:
/// the bracketed timestamp (two parts), the state token and every
/// `key=value` token.
fn count_fields(line: &str) -> usize {
    let kv = line
        .split_whitespace()
        .filter(|token| token.contains('=') && !token.ends_with('='))
        .count();
    kv + 3
}

#[cfg(test)]
mod tests {
    use super::*;

    const ESTABLISHED: &str = "[1702972533.340676]\t [UPDATE] tcp      6 432000 ESTABLISHED src=10.152.4.231 dst=173.222.210.216 sport=51679 dport=443 src=173.222.210.216 dst=31.205.218.167 sport=443 dport=51679 [ASSURED] id=2858042624";
    const SYN_RECV: &str = "[1702972533.997256]\t [UPDATE] tcp      6 60 SYN_RECV src=10.152.11.29 dst=61.170.79.234 sport=58765 dport=443 src=61.170.79.234 dst=31.205.218.180 sport=443 dport=58765 id=2857185344";
    const FIN_WAIT: &str = "[1702972533.785766]\t [UPDATE] tcp      6 120 FIN_WAIT src=10.152.10.141 dst=104.91.71.86 sport=62689 dport=443 src=104.91.71.86 dst=31.205.218.184 sport=443 dport=62689 [ASSURED] id=3451258432";

    fn parser() -> LineParser {
        LineParser::new().expect("grammar compiles")
    }

    #[test]
    fn test_parse_established_with_assured() {
        let event = parser()
            .parse_line(ESTABLISHED)
            .expect("no error")
            .expect("event");

        assert_eq!(event.kind, EventKind::Closing);
        assert!((event.timestamp - 1702972533.340676).abs() < 1e-6);
        assert_eq!(event.original.src, "10.152.4.231");
        assert_eq!(event.original.dst, "173.222.210.216");
        assert_eq!(event.original.sport, 51679);
        assert_eq!(event.original.dport, 443);
        assert_eq!(event.reply.src, "173.222.210.216");
        assert_eq!(event.reply.dst, "31.205.218.167");
        assert_eq!(event.reply.sport, 443);
        assert_eq!(event.reply.dport, 51679);
        assert!(event.assured);
        assert_eq!(event.id, 2858042624);
    }

    #[test]
    fn test_parse_syn_recv_without_assured() {
        let event = parser()
            .parse_line(SYN_RECV)
            .expect("no error")
            .expect("event");

        assert_eq!(event.kind, EventKind::Opening);
        assert!(!event.assured);
        assert_eq!(event.id, 2857185344);
        assert_eq!(event.original.src, "10.152.11.29");
    }

    #[test]
    fn test_parse_minimal_preamble() {
        let line = "[100.000000] SYN_RECV src=10.0.0.5 dst=8.8.8.8 sport=1111 dport=80 src=8.8.8.8 dst=31.1.1.1 sport=80 dport=1111 id=42";
        let event = parser().parse_line(line).expect("no error").expect("event");
        assert_eq!(event.id, 42);
        assert!((event.timestamp - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_other_states_are_ignored() {
        assert_eq!(parser().parse_line(FIN_WAIT), Ok(None));
        assert_eq!(parser().parse_line(""), Ok(None));
        assert_eq!(
            parser().parse_line("conntrack v1.4.6 (conntrack-tools): 12 flow events"),
            Ok(None)
        );
    }

    #[test]
    fn test_truncated_tracked_state_is_error() {
        let line = "[1702972533.349065]\t [UPDATE] tcp      120 ESTABLISHED src=10.152.4.231 dst=173.222.210.216 sport=51679 dport=443 src=173.222.210.216 dst=31.205.218.167";
        let err = parser().parse_line(line).expect_err("truncated");
        assert_eq!(
            err,
            ParseError::IncompleteFields {
                state: "ESTABLISHED",
                captured: 9,
            }
        );
    }

    #[test]
    fn test_non_numeric_timestamp_is_error() {
        let line = "[17029x2533.34o676] SYN_RECV src=10.0.0.5 dst=8.8.8.8 sport=1111 dport=80 src=8.8.8.8 dst=31.1.1.1 sport=80 dport=1111 id=42";
        let err = parser().parse_line(line).expect_err("bad timestamp");
        assert!(matches!(err, ParseError::MalformedTimestamp { .. }));
    }

    #[test]
    fn test_invalid_port_is_error() {
        let line = "[1.5] SYN_RECV src=10.0.0.5 dst=8.8.8.8 sport=99999 dport=80 src=8.8.8.8 dst=31.1.1.1 sport=80 dport=1111 id=42";
        let err = parser().parse_line(line).expect_err("bad port");
        assert_eq!(
            err,
            ParseError::InvalidPort {
                field: "original sport",
                raw: "99999".to_string(),
            }
        );
    }

    #[test]
    fn test_overflowing_id_is_error() {
        let line = "[1.5] SYN_RECV src=10.0.0.5 dst=8.8.8.8 sport=1 dport=80 src=8.8.8.8 dst=31.1.1.1 sport=80 dport=1 id=99999999999999999999999";
        let err = parser().parse_line(line).expect_err("bad id");
        assert!(matches!(err, ParseError::InvalidId { .. }));
    }

    #[test]
    fn test_parse_block_keeps_order_and_skips_noise() {
        let block = format!("{SYN_RECV}\n{FIN_WAIT}\n{ESTABLISHED}\n");
        let results = parser().parse_block(&block);

        assert_eq!(results.len(), 2);
        let kinds: Vec<EventKind> = results
            .iter()
            .map(|r| r.as_ref().expect("valid").kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Opening, EventKind::Closing]);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("5", "020"), Ok(5.02));
        assert!(parse_timestamp("", "1").is_err());
        assert!(parse_timestamp("inf", "0").is_err());
    }
}
