//! Packet capture using libpcap.
//!
//! Live sniffing on an interface or replay of a capture file, filtered down
//! to TCP traffic of the monitored host addresses.

pub mod engine;
