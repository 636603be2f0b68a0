//! Packet decoding: L2 Ethernet/VLAN, L3 IPv4/IPv6, L4 TCP/UDP.
//!
//! The decoder never panics on malformed input; every failure mode maps to
//! one variant of [`DecodeError`], which the worker turns into the matching
//! basic event from the catalog instead of dropping the packet silently.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod transport;

use std::net::IpAddr;
use thiserror::Error;

use ethernet::EtherType;
use transport::TransportInfo;

/// Datalink type reported by the capture collaborator for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datalink {
    /// BSD loopback / null encapsulation: 4-byte address family header.
    NullLoopback,
    /// Standard Ethernet (DLT_EN10MB).
    Ethernet,
    /// Anything this decoder does not understand.
    Unknown,
}

/// Every way packet decoding can fail, one-to-one with a basic event name.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown datalink layer")]
    UnknownDatalinkLayer,
    #[error("unknown l3 protocol")]
    UnknownL3Protocol,
    #[error("ethernet frame too short")]
    EthernetTooShort,
    #[error("unknown ethertype")]
    EthernetUnknown,
    #[error("ipv4 packet too short")]
    Ip4TooShort,
    #[error("ipv4 size smaller than header")]
    Ip4SizeSmallerThanHeader,
    #[error("ipv4 l4 payload detection failed")]
    Ip4L4DetectionFailed,
    #[error("ipv6 packet too short")]
    Ip6TooShort,
    #[error("ipv6 size smaller than header")]
    Ip6SizeSmallerThanHeader,
    #[error("ipv6 l4 payload detection failed")]
    Ip6L4DetectionFailed,
    #[error("tcp packet too short")]
    TcpTooShort,
    #[error("udp packet too short")]
    UdpTooShort,
}

/// L3 address family of a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Type {
    Ipv4,
    Ipv6,
}

/// Result of decoding one packet down through L4, the input to flow
/// resolution (§4.2–§4.3).
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub l3_type: L3Type,
    pub l4_protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub transport: TransportInfo,
}

/// Decode one captured frame given its datalink type.
///
/// Drops ARP silently (no error, no packet) per §4.1; everything else that
/// cannot be classified down to L4 surfaces a [`DecodeError`].
pub fn decode_packet(datalink: Datalink, data: &[u8]) -> Result<Option<DecodedPacket>, DecodeError> {
    match datalink {
        Datalink::NullLoopback => {
            if data.len() < 4 {
                return Err(DecodeError::EthernetTooShort);
            }
            let family = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let payload = &data[4..];
            decode_l3(guess_null_family(family), payload)
        }
        Datalink::Ethernet => {
            let (ethertype, offset) = ethernet::parse_ethernet_header(data)
                .map_err(|_| DecodeError::EthernetTooShort)?;
            match ethertype {
                EtherType::Arp => Ok(None),
                EtherType::Ipv4 => decode_l3(EtherType::Ipv4, &data[offset..]),
                EtherType::Ipv6 => decode_l3(EtherType::Ipv6, &data[offset..]),
                EtherType::Other(_) => Err(DecodeError::EthernetUnknown),
            }
        }
        Datalink::Unknown => Err(DecodeError::UnknownDatalinkLayer),
    }
}

fn map_transport_error(err: transport::TransportError) -> DecodeError {
    match err {
        transport::TransportError::TcpTooShort => DecodeError::TcpTooShort,
        transport::TransportError::UdpTooShort => DecodeError::UdpTooShort,
    }
}

fn guess_null_family(family: u32) -> EtherType {
    if family == 2 {
        EtherType::Ipv4
    } else {
        EtherType::Ipv6
    }
}

fn decode_l3(kind: EtherType, data: &[u8]) -> Result<Option<DecodedPacket>, DecodeError> {
    match kind {
        EtherType::Ipv4 => {
            let info = ipv4::parse_ipv4(data).map_err(|e| e.into_decode_error())?;
            let l4_data = &data[info.header_length..];
            let transport = transport::parse_transport(info.protocol, l4_data)
                .map_err(map_transport_error)?;
            Ok(Some(DecodedPacket {
                l3_type: L3Type::Ipv4,
                l4_protocol: info.protocol,
                src_ip: IpAddr::V4(info.src_ip),
                dst_ip: IpAddr::V4(info.dst_ip),
                transport,
            }))
        }
        EtherType::Ipv6 => {
            let info = ipv6::parse_ipv6(data).map_err(|e| e.into_decode_error())?;
            let l4_data = &data[ipv6::IPV6_HEADER_LEN..];
            let transport = transport::parse_transport(info.next_header, l4_data)
                .map_err(map_transport_error)?;
            Ok(Some(DecodedPacket {
                l3_type: L3Type::Ipv6,
                l4_protocol: info.next_header,
                src_ip: IpAddr::V6(info.src_ip),
                dst_ip: IpAddr::V6(info.dst_ip),
                transport,
            }))
        }
        _ => Err(DecodeError::UnknownL3Protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_arp_silently() {
        let mut data = vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x08, 0x06,
        ];
        data.extend_from_slice(&[0u8; 28]);
        assert!(matches!(decode_packet(Datalink::Ethernet, &data), Ok(None)));
    }

    #[test]
    fn too_short_ethernet_frame_errors() {
        let data = vec![0xff, 0xff, 0xff];
        assert_eq!(
            decode_packet(Datalink::Ethernet, &data),
            Err(DecodeError::EthernetTooShort)
        );
    }

    #[test]
    fn unknown_datalink_errors() {
        assert_eq!(
            decode_packet(Datalink::Unknown, &[0u8; 64]),
            Err(DecodeError::UnknownDatalinkLayer)
        );
    }
}
