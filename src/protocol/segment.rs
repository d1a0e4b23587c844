//! The owned, decoded view of one TCP segment that the dispatcher consumes.
//!
//! Building a segment is where decode anomalies are absorbed: unsupported
//! families yield `None`, and an unparseable option area simply drops the
//! timestamp so lifecycle tracking still sees the packet.

use std::net::Ipv4Addr;

use super::tcp::TcpTimestamp;
use super::ParsedPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    pub ack: bool,
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: SegmentFlags,
    pub timestamp: Option<TcpTimestamp>,
    pub payload_len: usize,
    /// Capture time in nanoseconds since the Unix epoch.
    pub captured_ns: u64,
}

impl TcpSegment {
    /// Extract the segment from a decoded frame. Returns `None` for
    /// anything that is not TCP over IPv4.
    pub fn from_packet(packet: &ParsedPacket<'_>, captured_ns: u64) -> Option<Self> {
        let ip = packet.ipv4.as_ref()?;
        let tcp = packet.tcp.as_ref()?;

        let timestamp = match tcp.timestamps() {
            Ok(ts) => ts,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring TCP options");
                None
            }
        };

        Some(TcpSegment {
            src: ip.src_addr(),
            dst: ip.dst_addr(),
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            seq: tcp.sequence_number(),
            ack: tcp.ack_number(),
            flags: SegmentFlags {
                ack: tcp.ack(),
                fin: tcp.fin(),
            },
            timestamp,
            payload_len: packet.tcp_payload_len(),
            captured_ns,
        })
    }

    /// A FIN carrying an ACK: the start of a graceful close.
    #[inline]
    pub fn is_fin_ack(&self) -> bool {
        self.flags.fin && self.flags.ack
    }
}
