//! Flow identity, the concurrent flow table and per-flow records.
//!
//! A flow is one bidirectional TCP connection, always keyed with the
//! monitored host's endpoint first so both directions land on the same
//! record.

pub mod record;
pub mod table;
pub mod timer;

use ahash::AHashSet;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub use record::{FlowRecord, FlowState, TcpKey};
pub use table::FlowTable;
pub use timer::{ExpiryTimer, TimerHandle, TimerService};

/// Canonical flow key: `(local, remote)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.local, self.remote)
    }
}

/// Which way a segment travelled relative to the monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the monitored host.
    Outbound,
    /// Sent by the peer.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// The monitored host's IPv4 addresses. Fixed for the life of the engine.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    addrs: AHashSet<Ipv4Addr>,
}

impl HostSet {
    pub fn new<I: IntoIterator<Item = Ipv4Addr>>(addrs: I) -> Self {
        HostSet {
            addrs: addrs.into_iter().collect(),
        }
    }

    #[inline]
    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Orient a segment's endpoints. This is the only place that decides
/// which side is local.
///
/// A segment whose source is not a host address is treated as inbound,
/// which also covers traffic the capture filter let through for
/// configured extra addresses.
pub fn classify(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    hosts: &HostSet,
) -> (FlowKey, Direction) {
    if hosts.contains(src.ip()) {
        (
            FlowKey {
                local: src,
                remote: dst,
            },
            Direction::Outbound,
        )
    } else {
        (
            FlowKey {
                local: dst,
                remote: src,
            },
            Direction::Inbound,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    #[test]
    fn both_directions_share_a_key() {
        let hosts = HostSet::new([Ipv4Addr::new(10, 0, 0, 1)]);
        let (out_key, out_dir) = classify(ep(1, 5000), ep(2, 443), &hosts);
        let (in_key, in_dir) = classify(ep(2, 443), ep(1, 5000), &hosts);
        assert_eq!(out_key, in_key);
        assert_eq!(out_dir, Direction::Outbound);
        assert_eq!(in_dir, Direction::Inbound);
        assert_eq!(out_key.local, ep(1, 5000));
    }

    #[test]
    fn key_displays_local_first() {
        let key = FlowKey {
            local: ep(1, 5000),
            remote: ep(2, 443),
        };
        assert_eq!(key.to_string(), "10.0.0.1:5000-10.0.0.2:443");
    }

    #[test]
    fn unknown_source_is_inbound() {
        let hosts = HostSet::default();
        let (key, dir) = classify(ep(7, 80), ep(8, 9000), &hosts);
        assert_eq!(dir, Direction::Inbound);
        assert_eq!(key.local, ep(8, 9000));
    }
}
