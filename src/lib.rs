//! LAN round-trip time estimation from conntrack `SYN_RECV`/`ESTABLISHED`
//! event pairs, exported as Prometheus metrics.

pub mod agent;
pub mod config;
pub mod conntrack;
pub mod export;
pub mod flow;
pub mod pidfile;
pub mod stats;
