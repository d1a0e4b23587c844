//! Minimal packet key extraction for shard routing.
//!
//! The capture thread hashes the canonical TCP 4-tuple straight from the
//! raw bytes, without a full parse, so both directions of a connection land
//! on the same worker.

use std::hash::{Hash, Hasher};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const IPPROTO_TCP: u8 = 6;
const MAX_VLAN_TAGS: usize = 2;

/// Compute the shard index for a raw Ethernet frame.
#[inline]
pub fn shard_for_packet(data: &[u8], num_shards: usize) -> usize {
    if num_shards <= 1 {
        return 0;
    }
    (fast_flow_hash(data) as usize) % num_shards
}

/// Hash of the direction-independent 4-tuple. Anything that is not
/// TCP over IPv4 falls back to a byte hash; those packets are dropped by the
/// worker anyway.
#[inline]
fn fast_flow_hash(data: &[u8]) -> u64 {
    if data.len() < 14 {
        return byte_hash(data);
    }

    let mut ether_type = u16::from_be_bytes([data[12], data[13]]);
    let mut ip_offset: usize = 14;

    for _ in 0..MAX_VLAN_TAGS {
        if ether_type != ETHERTYPE_VLAN && ether_type != ETHERTYPE_QINQ {
            break;
        }
        if data.len() < ip_offset + 4 {
            return byte_hash(data);
        }
        ether_type = u16::from_be_bytes([data[ip_offset + 2], data[ip_offset + 3]]);
        ip_offset += 4;
    }

    if ether_type == ETHERTYPE_IPV4 {
        hash_ipv4_tcp(data, ip_offset)
    } else {
        byte_hash(data)
    }
}

#[inline]
fn hash_ipv4_tcp(data: &[u8], offset: usize) -> u64 {
    if data.len() < offset + 20 || data[offset + 9] != IPPROTO_TCP {
        return byte_hash(data);
    }

    let ihl = (data[offset] & 0x0F) as usize * 4;
    let src_ip = &data[offset + 12..offset + 16];
    let dst_ip = &data[offset + 16..offset + 20];

    let tcp = offset + ihl;
    let (src_port, dst_port) = if data.len() >= tcp + 4 {
        (
            u16::from_be_bytes([data[tcp], data[tcp + 1]]),
            u16::from_be_bytes([data[tcp + 2], data[tcp + 3]]),
        )
    } else {
        (0, 0)
    };

    // Hash (min, max) so both directions map to the same shard.
    let mut hasher = ahash::AHasher::default();
    if (src_ip, src_port) <= (dst_ip, dst_port) {
        src_ip.hash(&mut hasher);
        src_port.hash(&mut hasher);
        dst_ip.hash(&mut hasher);
        dst_port.hash(&mut hasher);
    } else {
        dst_ip.hash(&mut hasher);
        dst_port.hash(&mut hasher);
        src_ip.hash(&mut hasher);
        src_port.hash(&mut hasher);
    }
    hasher.finish()
}

#[inline]
fn byte_hash(data: &[u8]) -> u64 {
    let mut hasher = ahash::AHasher::default();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::{build_frame, FrameSpec};
    use std::net::Ipv4Addr;

    fn frame(src: ([u8; 4], u16), dst: ([u8; 4], u16)) -> Vec<u8> {
        build_frame(&FrameSpec::new(
            (Ipv4Addr::from(src.0), src.1),
            (Ipv4Addr::from(dst.0), dst.1),
        ))
    }

    /// Insert an 802.1Q tag after the MAC addresses.
    fn tagged(mut frame: Vec<u8>, vlan: u16) -> Vec<u8> {
        let mut tag = vec![0x81, 0x00];
        tag.extend_from_slice(&vlan.to_be_bytes());
        frame.splice(12..12, tag);
        frame
    }

    #[test]
    fn same_flow_same_shard() {
        let ab = frame(([10, 0, 0, 1], 12345), ([10, 0, 0, 2], 80));
        let ba = frame(([10, 0, 0, 2], 80), ([10, 0, 0, 1], 12345));
        assert_eq!(
            shard_for_packet(&ab, 4),
            shard_for_packet(&ba, 4),
            "both directions of a flow must map to the same shard"
        );
    }

    #[test]
    fn vlan_tag_does_not_change_shard() {
        let plain = frame(([10, 0, 0, 1], 12345), ([10, 0, 0, 2], 80));
        let reverse = tagged(frame(([10, 0, 0, 2], 80), ([10, 0, 0, 1], 12345)), 42);
        assert_eq!(shard_for_packet(&plain, 16), shard_for_packet(&reverse, 16));
    }

    #[test]
    fn results_stay_in_range() {
        let a = frame(([10, 0, 0, 1], 12345), ([10, 0, 0, 2], 80));
        let b = frame(([10, 0, 0, 3], 54321), ([10, 0, 0, 4], 443));
        assert!(shard_for_packet(&a, 1024) < 1024);
        assert!(shard_for_packet(&b, 1024) < 1024);
        assert_eq!(shard_for_packet(&a, 1), 0);
    }

    #[test]
    fn short_packet_no_panic() {
        assert!(shard_for_packet(&[0x08, 0x00], 4) < 4);
        assert!(shard_for_packet(&[0u8; 20], 4) < 4);
    }
}
