//! Conntrack event ingestion: line grammar, SYN_RECV/ESTABLISHED
//! correlation, stream drivers and the `conntrack -E` poller.

pub mod correlate;
pub mod event;
pub mod parse;
pub mod poller;
pub mod stream;
