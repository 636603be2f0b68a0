//! Event catalog and JSON assembly (§4.6, §6).

pub mod base64;
pub mod framing;
pub mod socket;

use serde_json::{json, Map, Value};

use crate::decode::L3Type;
use crate::dpi::DetectedProtocol;
use crate::flow::FlowEntry;

/// `packet_event_id` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEventKind {
    Packet = 1,
    PacketFlow = 2,
}

/// `flow_event_id` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEventKind {
    New = 1,
    End = 2,
    Idle = 3,
    Guessed = 4,
    Detected = 5,
    NotDetected = 6,
}

impl FlowEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            FlowEventKind::New => "new",
            FlowEventKind::End => "end",
            FlowEventKind::Idle => "idle",
            FlowEventKind::Guessed => "guessed",
            FlowEventKind::Detected => "detected",
            FlowEventKind::NotDetected => "not-detected",
        }
    }
}

/// `basic_event_id` catalog (§6), names kept stable for numbering even
/// where a variant (`NonIpPacket`) is never actually emitted (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BasicEventKind {
    UnknownDatalinkLayer = 1,
    UnknownL3Protocol = 2,
    NonIpPacket = 3,
    EthernetPacketTooShort = 4,
    EthernetPacketUnknown = 5,
    Ip4PacketTooShort = 6,
    Ip4SizeSmallerThanHeader = 7,
    Ip4L4PayloadDetectionFailed = 8,
    Ip6PacketTooShort = 9,
    Ip6SizeSmallerThanHeader = 10,
    Ip6L4PayloadDetectionFailed = 11,
    TcpPacketTooShort = 12,
    UdpPacketTooShort = 13,
    CaptureSizeSmallerThanPacketSize = 14,
    MaxFlowToTrack = 15,
    FlowMemoryAllocationFailed = 16,
    NdpiFlowMemoryAllocationFailed = 17,
    NdpiIdMemoryAllocationFailed = 18,
}

impl BasicEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            BasicEventKind::UnknownDatalinkLayer => "UNKNOWN_DATALINK_LAYER",
            BasicEventKind::UnknownL3Protocol => "UNKNOWN_L3_PROTOCOL",
            BasicEventKind::NonIpPacket => "NON_IP_PACKET",
            BasicEventKind::EthernetPacketTooShort => "ETHERNET_PACKET_TOO_SHORT",
            BasicEventKind::EthernetPacketUnknown => "ETHERNET_PACKET_UNKNOWN",
            BasicEventKind::Ip4PacketTooShort => "IP4_PACKET_TOO_SHORT",
            BasicEventKind::Ip4SizeSmallerThanHeader => "IP4_SIZE_SMALLER_THAN_HEADER",
            BasicEventKind::Ip4L4PayloadDetectionFailed => "IP4_L4_PAYLOAD_DETECTION_FAILED",
            BasicEventKind::Ip6PacketTooShort => "IP6_PACKET_TOO_SHORT",
            BasicEventKind::Ip6SizeSmallerThanHeader => "IP6_SIZE_SMALLER_THAN_HEADER",
            BasicEventKind::Ip6L4PayloadDetectionFailed => "IP6_L4_PAYLOAD_DETECTION_FAILED",
            BasicEventKind::TcpPacketTooShort => "TCP_PACKET_TOO_SHORT",
            BasicEventKind::UdpPacketTooShort => "UDP_PACKET_TOO_SHORT",
            BasicEventKind::CaptureSizeSmallerThanPacketSize => {
                "CAPTURE_SIZE_SMALLER_THAN_PACKET_SIZE"
            }
            BasicEventKind::MaxFlowToTrack => "MAX_FLOW_TO_TRACK",
            BasicEventKind::FlowMemoryAllocationFailed => "FLOW_MEMORY_ALLOCATION_FAILED",
            BasicEventKind::NdpiFlowMemoryAllocationFailed => {
                "NDPI_FLOW_MEMORY_ALLOCATION_FAILED"
            }
            BasicEventKind::NdpiIdMemoryAllocationFailed => "NDPI_ID_MEMORY_ALLOCATION_FAILED",
        }
    }
}

fn l3_proto_name(l3: L3Type) -> &'static str {
    match l3 {
        L3Type::Ipv4 => "ip4",
        L3Type::Ipv6 => "ip6",
    }
}

fn l4_proto_name(protocol: u8) -> Value {
    match protocol {
        6 => json!("tcp"),
        17 => json!("udp"),
        1 => json!("icmp"),
        58 => json!("icmp6"),
        other => json!(other),
    }
}

fn protocol_pair_json(p: Option<DetectedProtocol>) -> Value {
    match p {
        Some(p) => json!({ "master": p.master, "app": p.app, "name": p.name() }),
        None => Value::Null,
    }
}

/// Build a raw `packet` event (decode failure path, §4.1/§4.6).
pub fn build_packet_event(
    thread_id: u32,
    packet_id: u64,
    pkt_ts: u64,
    pkt_len: u32,
    pkt_caplen: u32,
    raw: &[u8],
) -> String {
    let mut map = Map::new();
    map.insert("packet_event_id".into(), json!(PacketEventKind::Packet as u8));
    map.insert("packet_event_name".into(), json!("packet"));
    base_packet_fields(&mut map, thread_id, packet_id, pkt_ts, pkt_len, pkt_caplen, raw);
    Value::Object(map).to_string()
}

/// Build a `packet-flow` event (§4.4 step 4), capped upstream at
/// `MAX_PACKETS_PER_FLOW_TO_SEND`.
pub fn build_packet_flow_event(
    thread_id: u32,
    packet_id: u64,
    pkt_ts: u64,
    pkt_len: u32,
    pkt_caplen: u32,
    raw: &[u8],
    flow_id: u32,
    flow_packet_id: u32,
    max_packets: u32,
) -> String {
    let mut map = Map::new();
    map.insert("packet_event_id".into(), json!(PacketEventKind::PacketFlow as u8));
    map.insert("packet_event_name".into(), json!("packet-flow"));
    base_packet_fields(&mut map, thread_id, packet_id, pkt_ts, pkt_len, pkt_caplen, raw);
    map.insert("flow_id".into(), json!(flow_id));
    map.insert("flow_packet_id".into(), json!(flow_packet_id));
    map.insert("max_packets".into(), json!(max_packets));
    Value::Object(map).to_string()
}

fn base_packet_fields(
    map: &mut Map<String, Value>,
    thread_id: u32,
    packet_id: u64,
    pkt_ts: u64,
    pkt_len: u32,
    pkt_caplen: u32,
    raw: &[u8],
) {
    map.insert("thread_id".into(), json!(thread_id));
    map.insert("packet_id".into(), json!(packet_id));
    map.insert("pkt_ts".into(), json!(pkt_ts));
    map.insert("pkt_len".into(), json!(pkt_len));
    map.insert("pkt_caplen".into(), json!(pkt_caplen));

    match base64::encode_packet(raw) {
        Some(encoded) => {
            map.insert("pkt_oversize".into(), json!(false));
            map.insert("pkt".into(), json!(encoded));
        }
        None => {
            map.insert("pkt_oversize".into(), json!(true));
        }
    }
}

/// Build a flow event (`new`/`end`/`idle`/`guessed`/`detected`/`not-detected`),
/// carrying the full flow description (§4.6).
pub fn build_flow_event(
    thread_id: u32,
    packet_id: u64,
    kind: FlowEventKind,
    entry: &FlowEntry,
) -> String {
    let mut map = Map::new();
    map.insert("thread_id".into(), json!(thread_id));
    map.insert("packet_id".into(), json!(packet_id));
    map.insert("flow_event_id".into(), json!(kind as u8));
    map.insert("flow_event_name".into(), json!(kind.name()));

    map.insert("flow_id".into(), json!(entry.flow_id));
    map.insert("first_seen".into(), json!(entry.first_seen));
    map.insert("last_seen".into(), json!(entry.last_seen));
    map.insert("packets_processed".into(), json!(entry.packets_processed));
    map.insert("total_l4_data_len".into(), json!(entry.total_l4_data_len));
    map.insert("min_l4_data_len".into(), json!(entry.min_l4_data_len));
    map.insert("max_l4_data_len".into(), json!(entry.max_l4_data_len));
    map.insert("flow_avg_l4_data_len".into(), json!(entry.avg_l4_data_len()));
    map.insert("midstream".into(), json!(entry.is_midstream_flow));

    map.insert("l3_proto".into(), json!(l3_proto_name(entry.l3_type)));
    map.insert("src_ip".into(), json!(entry.tuple.src_ip.to_string()));
    map.insert("dest_ip".into(), json!(entry.tuple.dst_ip.to_string()));
    if entry.tuple.src_port != 0 {
        map.insert("src_port".into(), json!(entry.tuple.src_port));
    }
    if entry.tuple.dst_port != 0 {
        map.insert("dst_port".into(), json!(entry.tuple.dst_port));
    }
    map.insert("l4_proto".into(), l4_proto_name(entry.tuple.l4_protocol));

    map.insert("detected".into(), protocol_pair_json(entry.detected));
    map.insert("guessed".into(), protocol_pair_json(entry.guessed));

    Value::Object(map).to_string()
}

/// Build a basic diagnostic event, with an optional typed key/value tail
/// (§4.6 "printf-style").
pub fn build_basic_event(
    thread_id: u32,
    packet_id: u64,
    kind: BasicEventKind,
    extra: &[(&str, Value)],
) -> String {
    let mut map = Map::new();
    map.insert("thread_id".into(), json!(thread_id));
    map.insert("packet_id".into(), json!(packet_id));
    map.insert("basic_event_id".into(), json!(kind as u8));
    map.insert("basic_event_name".into(), json!(kind.name()));
    for (key, value) in extra {
        map.insert((*key).to_string(), value.clone());
    }
    Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn basic_event_names_are_stable() {
        assert_eq!(BasicEventKind::MaxFlowToTrack.name(), "MAX_FLOW_TO_TRACK");
        assert_eq!(BasicEventKind::NonIpPacket.name(), "NON_IP_PACKET");
    }

    #[test]
    fn packet_event_is_valid_json() {
        let json = build_packet_event(0, 1, 1000, 64, 64, &[1, 2, 3]);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["packet_event_name"], "packet");
        assert_eq!(parsed["pkt_oversize"], false);
    }

    #[test]
    fn flow_event_omits_zero_ports() {
        let entry = FlowEntry::new(
            1,
            L3Type::Ipv4,
            crate::flow::FlowTuple {
                l4_protocol: 1,
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                src_port: 0,
                dst_port: 0,
            },
            1000,
            64,
        );
        let json = build_flow_event(0, 1, FlowEventKind::New, &entry);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.get("src_port").is_none());
        assert!(parsed.get("dst_port").is_none());
    }

    #[test]
    fn flow_avg_l4_data_len_is_integer_division() {
        let mut entry = FlowEntry::new(
            1,
            L3Type::Ipv4,
            crate::flow::FlowTuple {
                l4_protocol: 6,
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                src_port: 1111,
                dst_port: 80,
            },
            1000,
            10,
        );
        entry.packets_processed = 3;
        entry.total_l4_data_len = 10;
        assert_eq!(entry.avg_l4_data_len(), 3);
    }
}
