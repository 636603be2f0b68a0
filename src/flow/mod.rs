//! Flow identity, entry lifecycle, and the per-worker sharded flow table
//! (§3, §4.3–§4.5).

pub mod table;

use std::net::IpAddr;

use crate::decode::L3Type;
use crate::dpi::{DetectedProtocol, FlowDpiState};

pub const MAX_ACTIVE_FLOWS: usize = 2048;
pub const MAX_IDLE_FLOWS: usize = 64;
pub const IDLE_SCAN_PERIOD_MS: u64 = 10_000;
pub const MAX_IDLE_TIME_MS: u64 = 300_000;
pub const MAX_PACKETS_PER_FLOW_TO_SEND: u32 = 15;

/// The canonical (forward-direction) 5-tuple identity of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowTuple {
    pub l4_protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowTuple {
    pub fn swapped(&self) -> FlowTuple {
        FlowTuple {
            l4_protocol: self.l4_protocol,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// `(hashval, l4_protocol, tuple)` total order used as the shard container's
/// key, per the Design Notes' "ordered container with in-place comparator".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderedFlowKey {
    pub hashval: u64,
    pub tuple: FlowTuple,
}

/// Compute the DPI library's canonical 64-bit flow hash (§4.3): a sum over
/// address words and protocol/port fields, with no attempt at avalanche —
/// collisions are fine, the shard container's comparator breaks ties.
pub fn compute_hashval(tuple: &FlowTuple) -> u64 {
    let mut h: u64 = addr_words_sum(tuple.src_ip).wrapping_add(addr_words_sum(tuple.dst_ip));
    h = h
        .wrapping_add(tuple.l4_protocol as u64)
        .wrapping_add(tuple.src_port as u64)
        .wrapping_add(tuple.dst_port as u64);
    h
}

fn addr_words_sum(ip: IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u64,
        IpAddr::V6(v6) => {
            let oct = v6.octets();
            let hi = u64::from_be_bytes(oct[0..8].try_into().unwrap());
            let lo = u64::from_be_bytes(oct[8..16].try_into().unwrap());
            hi.wrapping_add(lo)
        }
    }
}

pub fn shard_index(hashval: u64) -> usize {
    (hashval as usize) % MAX_ACTIVE_FLOWS
}

/// Per-flow state, owned exclusively by the worker whose shard holds it
/// (§3 "Flow entry").
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub flow_id: u32,
    pub l3_type: L3Type,
    pub tuple: FlowTuple,

    pub packets_processed: u32,
    pub total_l4_data_len: u64,
    pub min_l4_data_len: u32,
    pub max_l4_data_len: u32,

    pub first_seen: u64,
    pub last_seen: u64,

    pub is_midstream_flow: bool,
    pub flow_fin_ack_seen: bool,
    pub flow_ack_seen: bool,

    pub dpi: FlowDpiState,
    pub detected: Option<DetectedProtocol>,
    pub guessed: Option<DetectedProtocol>,
    pub detection_completed: bool,
}

impl FlowEntry {
    pub fn new(flow_id: u32, l3_type: L3Type, tuple: FlowTuple, time_ms: u64, l4_len: u32) -> Self {
        FlowEntry {
            flow_id,
            l3_type,
            tuple,
            packets_processed: 0,
            total_l4_data_len: 0,
            min_l4_data_len: l4_len,
            max_l4_data_len: l4_len,
            first_seen: time_ms,
            last_seen: time_ms,
            is_midstream_flow: false,
            flow_fin_ack_seen: false,
            flow_ack_seen: false,
            dpi: FlowDpiState::new(),
            detected: None,
            guessed: None,
            detection_completed: false,
        }
    }

    /// `flow_avg_l4_data_len` per §4.6; integer division, zero while empty.
    pub fn avg_l4_data_len(&self) -> u64 {
        if self.packets_processed == 0 {
            0
        } else {
            self.total_l4_data_len / self.packets_processed as u64
        }
    }

    pub fn is_idle_candidate(&self, last_time: u64) -> bool {
        (self.flow_fin_ack_seen && self.flow_ack_seen)
            || self.last_seen + MAX_IDLE_TIME_MS < last_time
    }
}
