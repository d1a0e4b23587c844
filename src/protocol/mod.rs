//! Zero-copy decoding of the frames this monitor cares about:
//! Ethernet (with 802.1Q / 802.1ad tags), IPv4 and TCP.
//!
//! Anything else (IPv6, UDP, ARP...) decodes to a packet with the
//! corresponding layer left empty so callers can skip it cheaply.

pub mod ipv4;
pub mod link;
pub mod segment;
pub mod tcp;

use std::fmt;

pub use segment::{SegmentFlags, TcpSegment};

/// EtherType values the decoder distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    VlanTagged,
    ServiceTagged,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            0x8100 => EtherType::VlanTagged,
            0x88A8 => EtherType::ServiceTagged,
            other => EtherType::Unknown(other),
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::Ipv4 => write!(f, "IPv4"),
            EtherType::Ipv6 => write!(f, "IPv6"),
            EtherType::Arp => write!(f, "ARP"),
            EtherType::VlanTagged => write!(f, "802.1Q"),
            EtherType::ServiceTagged => write!(f, "802.1ad"),
            EtherType::Unknown(v) => write!(f, "Unknown(0x{:04x})", v),
        }
    }
}

/// IP protocol numbers. Only TCP is decoded further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            6 => IpProtocol::Tcp,
            other => IpProtocol::Other(other),
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Other(v) => write!(f, "Proto({})", v),
        }
    }
}

/// Errors from protocol parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes to parse the header
    TooShort { expected: usize, actual: usize },
    /// Invalid header values
    InvalidHeader(String),
    /// A TCP option whose length field runs past the option area
    MalformedOption { kind: u8 },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "packet too short: need {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
            ParseError::MalformedOption { kind } => {
                write!(f, "malformed TCP option (kind {})", kind)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// A decoded frame, borrowing the capture buffer.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub link: link::LinkFrame<'a>,
    /// Present only for non-fragmented-at-offset IPv4.
    pub ipv4: Option<ipv4::Ipv4Header<'a>>,
    pub tcp: Option<tcp::TcpHeader<'a>>,
}

impl<'a> ParsedPacket<'a> {
    /// TCP payload length derived from the IP total length, so Ethernet
    /// trailer padding is never counted as data.
    pub fn tcp_payload_len(&self) -> usize {
        match (&self.ipv4, &self.tcp) {
            (Some(ip), Some(tcp)) => (ip.total_length() as usize)
                .saturating_sub(ip.header_len())
                .saturating_sub(tcp.header_len()),
            _ => 0,
        }
    }
}

/// Parse a complete frame from raw bytes.
///
/// Errors are returned only when a layer we committed to decoding is
/// truncated or invalid; unsupported layers just end decoding early.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    let link = link::LinkFrame::parse(data)?;

    if link.ether_type() != EtherType::Ipv4 {
        return Ok(ParsedPacket {
            link,
            ipv4: None,
            tcp: None,
        });
    }

    let ip = ipv4::Ipv4Header::parse(link.payload())?;
    // Non-initial fragments carry no TCP header.
    if ip.fragment_offset() != 0 {
        return Ok(ParsedPacket {
            link,
            ipv4: Some(ip),
            tcp: None,
        });
    }

    let tcp = match ip.protocol() {
        IpProtocol::Tcp => Some(tcp::TcpHeader::parse(ip.payload())?),
        IpProtocol::Other(_) => None,
    };

    Ok(ParsedPacket {
        link,
        ipv4: Some(ip),
        tcp,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Frame builders shared by decoder, dispatcher and pipeline tests.

    use std::net::Ipv4Addr;

    pub struct FrameSpec {
        pub src: (Ipv4Addr, u16),
        pub dst: (Ipv4Addr, u16),
        pub seq: u32,
        pub ack: u32,
        pub flags: u8,
        pub timestamps: Option<(u32, u32)>,
        pub payload_len: usize,
    }

    impl FrameSpec {
        pub fn new(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> Self {
            FrameSpec {
                src,
                dst,
                seq: 0,
                ack: 0,
                flags: super::tcp::flags::ACK,
                timestamps: None,
                payload_len: 0,
            }
        }
    }

    /// Build an Ethernet + IPv4 + TCP frame.
    pub fn build_frame(spec: &FrameSpec) -> Vec<u8> {
        let options: Vec<u8> = match spec.timestamps {
            Some((tsval, tsecr)) => {
                let mut o = vec![1, 1, 8, 10];
                o.extend_from_slice(&tsval.to_be_bytes());
                o.extend_from_slice(&tsecr.to_be_bytes());
                o
            }
            None => Vec::new(),
        };
        let tcp_len = 20 + options.len();
        let total_len = 20 + tcp_len + spec.payload_len;

        let mut pkt = Vec::with_capacity(14 + total_len);
        pkt.extend_from_slice(&[0xff; 6]);
        pkt.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        pkt.extend_from_slice(&[0x08, 0x00]);

        pkt.push(0x45);
        pkt.push(0);
        pkt.extend_from_slice(&(total_len as u16).to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, 6, 0, 0]);
        pkt.extend_from_slice(&spec.src.0.octets());
        pkt.extend_from_slice(&spec.dst.0.octets());

        pkt.extend_from_slice(&spec.src.1.to_be_bytes());
        pkt.extend_from_slice(&spec.dst.1.to_be_bytes());
        pkt.extend_from_slice(&spec.seq.to_be_bytes());
        pkt.extend_from_slice(&spec.ack.to_be_bytes());
        pkt.push(((tcp_len / 4) as u8) << 4);
        pkt.push(spec.flags);
        pkt.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
        pkt.extend_from_slice(&options);

        pkt.extend(std::iter::repeat(0xab).take(spec.payload_len));
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_frame, FrameSpec};
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parse_tcp_frame_with_timestamps() {
        let mut spec = FrameSpec::new(
            (Ipv4Addr::new(10, 0, 0, 1), 40000),
            (Ipv4Addr::new(10, 0, 0, 2), 443),
        );
        spec.timestamps = Some((100, 7));
        spec.payload_len = 32;
        let frame = build_frame(&spec);

        let parsed = parse_packet(&frame).unwrap();
        let tcp = parsed.tcp.as_ref().unwrap();
        assert_eq!(tcp.src_port(), 40000);
        assert_eq!(parsed.tcp_payload_len(), 32);
        assert_eq!(tcp.timestamps().unwrap().map(|t| t.value), Some(100));
    }

    #[test]
    fn ethernet_padding_is_not_payload() {
        let spec = FrameSpec::new(
            (Ipv4Addr::new(10, 0, 0, 1), 40000),
            (Ipv4Addr::new(10, 0, 0, 2), 443),
        );
        let mut frame = build_frame(&spec);
        frame.extend_from_slice(&[0u8; 6]);
        let parsed = parse_packet(&frame).unwrap();
        assert_eq!(parsed.tcp_payload_len(), 0);
    }

    #[test]
    fn ipv6_frames_are_left_undecoded() {
        let mut frame = vec![0u8; 54];
        frame[12] = 0x86;
        frame[13] = 0xDD;
        let parsed = parse_packet(&frame).unwrap();
        assert!(parsed.ipv4.is_none());
        assert!(parsed.tcp.is_none());
    }

    #[test]
    fn truncated_tcp_is_an_error() {
        let spec = FrameSpec::new(
            (Ipv4Addr::new(10, 0, 0, 1), 1),
            (Ipv4Addr::new(10, 0, 0, 2), 2),
        );
        let frame = build_frame(&spec);
        assert!(parse_packet(&frame[..44]).is_err());
    }
}
