//! DPI collaborator (§1, GLOSSARY).
//!
//! Spec treats protocol classification as an external library exposing
//! `feed`/`give_up`/`l4_locate` and a JSON projection of its verdict. No
//! crates.io crate provides that exact shape, so this module defines the
//! seam as a trait and ships one heuristic implementation behind it —
//! accuracy is explicitly out of scope (§1 Non-goals), this exists so the
//! pipeline is fully exercised end to end.

use std::collections::HashMap;

use crate::decode::DecodedPacket;

/// Saturation point for `num_processed_pkts` (nDPId.c): once reached, a
/// flow is considered fully classified (or unclassifiable) and is no
/// longer fed to the engine.
pub const NUM_PROCESSED_PKTS_GIVE_UP: u32 = 0xFE;
/// One past give-up: DPI is saturated, no further work happens at all.
pub const NUM_PROCESSED_PKTS_SATURATED: u32 = 0xFF;

/// Master/application protocol pair, mirrors the DPI library's detected
/// protocol struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedProtocol {
    pub master: u16,
    pub app: u16,
}

impl DetectedProtocol {
    pub fn is_known(&self) -> bool {
        self.master != 0 || self.app != 0
    }

    pub fn name(&self) -> &'static str {
        protocol_name(self.app != 0 && self.app != self.master, self.master, self.app)
    }
}

fn protocol_name(prefer_app: bool, master: u16, app: u16) -> &'static str {
    let code = if prefer_app { app } else { master };
    match code {
        0 => "Unknown",
        1 => "HTTP",
        2 => "TLS",
        3 => "DNS",
        4 => "SSH",
        _ => "Generic",
    }
}

/// Per-flow opaque DPI bookkeeping. Stands in for the DPI library's opaque
/// flow handle plus its two per-endpoint handles.
#[derive(Debug, Clone)]
pub struct FlowDpiState {
    pub num_processed_pkts: u32,
    src_seen_bytes: Vec<u8>,
    dst_seen_bytes: Vec<u8>,
}

impl FlowDpiState {
    pub fn new() -> Self {
        FlowDpiState {
            num_processed_pkts: 0,
            src_seen_bytes: Vec::new(),
            dst_seen_bytes: Vec::new(),
        }
    }
}

impl Default for FlowDpiState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of `l4_locate`: which L4 protocol governs this packet's payload,
/// generalized here over the already-decoded transport info.
pub struct L4Location {
    pub protocol: u8,
    pub payload_len: u32,
}

/// The DPI collaborator contract (§1 GLOSSARY "DPI collaborator").
pub trait DpiEngine {
    /// Locate the L4 payload, given an already-decoded packet. Exists as a
    /// seam: a real nDPI binding performs fragmentation-aware extension
    /// header walking here; this implementation simply trusts the decoder.
    fn l4_locate(&self, packet: &DecodedPacket) -> Option<L4Location>;

    /// Initialize per-flow DPI state for a newly created flow.
    fn new_flow_state(&self) -> FlowDpiState {
        FlowDpiState::new()
    }

    /// Feed one packet's payload to the engine for a flow already under
    /// detection. Returns `Some` once a verdict is reached.
    fn feed(
        &self,
        state: &mut FlowDpiState,
        direction_changed: bool,
        payload: &[u8],
    ) -> Option<DetectedProtocol>;

    /// Called once a flow's `num_processed_pkts` saturates without a
    /// verdict; makes a best-effort guess from whatever was observed.
    fn give_up(&self, state: &FlowDpiState) -> Option<DetectedProtocol>;
}

/// Signature/port heuristic classifier: sniffs a TLS ClientHello SNI, an
/// HTTP request line, falls back to well-known ports.
pub struct BuiltinDpiEngine {
    well_known_ports: HashMap<u16, DetectedProtocol>,
}

impl BuiltinDpiEngine {
    pub fn new() -> Self {
        let mut well_known_ports = HashMap::new();
        well_known_ports.insert(80, DetectedProtocol { master: 1, app: 1 });
        well_known_ports.insert(443, DetectedProtocol { master: 2, app: 2 });
        well_known_ports.insert(53, DetectedProtocol { master: 3, app: 3 });
        well_known_ports.insert(22, DetectedProtocol { master: 4, app: 4 });
        BuiltinDpiEngine { well_known_ports }
    }

    fn sniff_http(payload: &[u8]) -> bool {
        const METHODS: [&[u8]; 5] = [b"GET ", b"POST ", b"HEAD ", b"PUT ", b"HTTP/"];
        METHODS.iter().any(|m| payload.starts_with(m))
    }

    fn sniff_tls_client_hello(payload: &[u8]) -> bool {
        payload.len() > 5 && payload[0] == 0x16 && payload[1] == 0x03
    }

    pub fn classify_ports(&self, src_port: u16, dst_port: u16) -> Option<DetectedProtocol> {
        self.well_known_ports
            .get(&src_port)
            .or_else(|| self.well_known_ports.get(&dst_port))
            .copied()
    }
}

impl Default for BuiltinDpiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DpiEngine for BuiltinDpiEngine {
    fn l4_locate(&self, packet: &DecodedPacket) -> Option<L4Location> {
        Some(L4Location {
            protocol: packet.l4_protocol,
            payload_len: packet.transport.payload_len,
        })
    }

    fn feed(
        &self,
        state: &mut FlowDpiState,
        direction_changed: bool,
        payload: &[u8],
    ) -> Option<DetectedProtocol> {
        state.num_processed_pkts = state.num_processed_pkts.saturating_add(1);

        let buf = if direction_changed {
            &mut state.dst_seen_bytes
        } else {
            &mut state.src_seen_bytes
        };
        if buf.len() < 64 {
            buf.extend_from_slice(&payload[..payload.len().min(64 - buf.len())]);
        }

        if Self::sniff_tls_client_hello(payload) {
            return Some(DetectedProtocol { master: 2, app: 2 });
        }
        if Self::sniff_http(payload) {
            return Some(DetectedProtocol { master: 1, app: 1 });
        }
        None
    }

    fn give_up(&self, state: &FlowDpiState) -> Option<DetectedProtocol> {
        if Self::sniff_tls_client_hello(&state.src_seen_bytes)
            || Self::sniff_tls_client_hello(&state.dst_seen_bytes)
        {
            return Some(DetectedProtocol { master: 2, app: 2 });
        }
        if Self::sniff_http(&state.src_seen_bytes) || Self::sniff_http(&state.dst_seen_bytes) {
            return Some(DetectedProtocol { master: 1, app: 1 });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_http_request_line() {
        let engine = BuiltinDpiEngine::new();
        let mut state = FlowDpiState::new();
        let verdict = engine.feed(&mut state, false, b"GET / HTTP/1.1\r\n");
        assert_eq!(verdict, Some(DetectedProtocol { master: 1, app: 1 }));
    }

    #[test]
    fn detects_tls_client_hello() {
        let engine = BuiltinDpiEngine::new();
        let mut state = FlowDpiState::new();
        let payload = [0x16, 0x03, 0x01, 0x00, 0x05, 0x01];
        let verdict = engine.feed(&mut state, false, &payload);
        assert_eq!(verdict, Some(DetectedProtocol { master: 2, app: 2 }));
    }

    #[test]
    fn give_up_falls_back_to_accumulated_bytes() {
        let engine = BuiltinDpiEngine::new();
        let mut state = FlowDpiState::new();
        engine.feed(&mut state, false, b"GE");
        let verdict = engine.give_up(&state);
        assert!(verdict.is_none());
    }

    #[test]
    fn num_processed_pkts_saturates() {
        let engine = BuiltinDpiEngine::new();
        let mut state = FlowDpiState::new();
        for _ in 0..300 {
            engine.feed(&mut state, false, b"\x00");
        }
        assert_eq!(state.num_processed_pkts, u32::MAX.min(300));
    }
}
