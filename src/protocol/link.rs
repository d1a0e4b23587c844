//! Ethernet II framing with stacked VLAN tags.
//!
//! Layout:
//!   - Destination MAC: 6 bytes
//!   - Source MAC:      6 bytes
//!   - EtherType / TPID: 2 bytes
//!   - [TCI: 2 bytes, EtherType: 2 bytes] repeated per VLAN tag
//!   - Payload

use super::{EtherType, ParseError};
use std::fmt;

/// Ethernet header length without tags.
pub const ETH_HEADER_LEN: usize = 14;

/// Length added by each 802.1Q / 802.1ad tag.
pub const VLAN_TAG_LEN: usize = 4;

/// More than two tags (QinQ) is not something we expect on a monitored host.
const MAX_VLAN_TAGS: usize = 2;

/// A link-layer frame with VLAN tags already peeled off.
#[derive(Debug)]
pub struct LinkFrame<'a> {
    data: &'a [u8],
    ether_type: EtherType,
    /// Innermost VLAN ID, if the frame was tagged.
    vlan_id: Option<u16>,
    header_len: usize,
}

impl<'a> LinkFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < ETH_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: ETH_HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut ether_type = EtherType::from(u16::from_be_bytes([data[12], data[13]]));
        let mut header_len = ETH_HEADER_LEN;
        let mut vlan_id = None;
        let mut tags = 0;

        while matches!(ether_type, EtherType::VlanTagged | EtherType::ServiceTagged) {
            if tags == MAX_VLAN_TAGS {
                return Err(ParseError::InvalidHeader(format!(
                    "more than {} VLAN tags",
                    MAX_VLAN_TAGS
                )));
            }
            let end = header_len + VLAN_TAG_LEN;
            if data.len() < end {
                return Err(ParseError::TooShort {
                    expected: end,
                    actual: data.len(),
                });
            }
            let tci = u16::from_be_bytes([data[header_len], data[header_len + 1]]);
            vlan_id = Some(tci & 0x0FFF);
            ether_type = EtherType::from(u16::from_be_bytes([
                data[header_len + 2],
                data[header_len + 3],
            ]));
            header_len = end;
            tags += 1;
        }

        Ok(LinkFrame {
            data,
            ether_type,
            vlan_id,
            header_len,
        })
    }

    /// EtherType of the encapsulated payload (after any VLAN tags).
    #[inline]
    pub fn ether_type(&self) -> EtherType {
        self.ether_type
    }

    #[inline]
    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan_id
    }

    #[inline]
    pub fn src_mac(&self) -> &'a [u8] {
        &self.data[6..12]
    }

    #[inline]
    pub fn dst_mac(&self) -> &'a [u8] {
        &self.data[0..6]
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

/// Format a MAC address as xx:xx:xx:xx:xx:xx
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

impl<'a> fmt::Display for LinkFrame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}]",
            format_mac(self.src_mac()),
            format_mac(self.dst_mac()),
            self.ether_type
        )?;
        if let Some(id) = self.vlan_id {
            write!(f, " vlan={}", id)?;
        }
        Ok(())
    }
}
