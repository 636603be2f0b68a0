//! Per-worker `Workflow`: flow table, DPI engine, collector socket, and the
//! packet-processing pipeline (§2, §3 "Workflow", §4.4, §5).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, trace};

use crate::decode::{self, Datalink, DecodeError, DecodedPacket, L3Type};
use crate::dpi::{DpiEngine, NUM_PROCESSED_PKTS_GIVE_UP, NUM_PROCESSED_PKTS_SATURATED};
use crate::events::socket::CollectorSocket;
use crate::events::{self, BasicEventKind, FlowEventKind};
use crate::flow::table::{FlowTable, InsertError};
use crate::flow::{FlowTuple, MAX_PACKETS_PER_FLOW_TO_SEND};

/// The only cross-worker mutable state besides the shutdown flag (§5).
#[derive(Default)]
pub struct GlobalFlowId(AtomicU32);

impl GlobalFlowId {
    pub fn new() -> Self {
        GlobalFlowId(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-worker packet/flow counters, reported at shutdown (§5 "Resource
/// discipline").
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStatsSnapshot {
    pub packets_captured: u64,
    pub packets_processed: u64,
    pub packets_owned: u64,
    pub total_l4_data_len: u64,
    pub detected_flow_protocols: u64,
    pub idle_flows_evicted: u64,
}

#[derive(Default)]
struct WorkerStats {
    packets_captured: AtomicU64,
    packets_processed: AtomicU64,
    packets_owned: AtomicU64,
    total_l4_data_len: AtomicU64,
    detected_flow_protocols: AtomicU64,
    idle_flows_evicted: AtomicU64,
}

impl WorkerStats {
    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_owned: self.packets_owned.load(Ordering::Relaxed),
            total_l4_data_len: self.total_l4_data_len.load(Ordering::Relaxed),
            detected_flow_protocols: self.detected_flow_protocols.load(Ordering::Relaxed),
            idle_flows_evicted: self.idle_flows_evicted.load(Ordering::Relaxed),
        }
    }
}

/// One worker's complete state bundle (GLOSSARY "Workflow"). Owned
/// exclusively by the thread that runs it; the only things it shares with
/// the rest of the process are `global_flow_id` and `shutdown`.
pub struct Workflow<E: DpiEngine> {
    pub index: u32,
    worker_count: u32,
    table: FlowTable,
    dpi: E,
    socket: CollectorSocket,
    stats: WorkerStats,
    global_flow_id: Arc<GlobalFlowId>,
    last_time: u64,
}

impl<E: DpiEngine> Workflow<E> {
    pub fn new(
        index: u32,
        worker_count: u32,
        dpi: E,
        collector_socket_path: &std::path::Path,
        global_flow_id: Arc<GlobalFlowId>,
    ) -> Self {
        Workflow {
            index,
            worker_count,
            table: FlowTable::new(),
            dpi,
            socket: CollectorSocket::new(collector_socket_path),
            stats: WorkerStats::default(),
            global_flow_id,
            last_time: 0,
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Process one captured frame. `time_ms` is the packet timestamp in
    /// milliseconds (`TICK_RESOLUTION_HZ = 1000`).
    pub fn handle_packet(
        &mut self,
        datalink: Datalink,
        time_ms: u64,
        caplen: u32,
        len: u32,
        raw: &[u8],
    ) {
        self.stats.packets_captured.fetch_add(1, Ordering::Relaxed);
        self.last_time = time_ms;
        let packet_id = self.stats.packets_captured.load(Ordering::Relaxed);

        if caplen < len {
            self.emit_packet(packet_id, time_ms, len, caplen, raw);
            self.emit_basic(packet_id, BasicEventKind::CaptureSizeSmallerThanPacketSize);
        }

        let decoded = match decode::decode_packet(datalink, raw) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return, // ARP, silently dropped (§4.1)
            Err(err) => {
                self.emit_packet(packet_id, time_ms, len, caplen, raw);
                self.emit_basic(packet_id, decode_error_to_basic_event(err));
                return;
            }
        };

        let owner = crate::shard::thread_index(
            decoded.src_ip,
            decoded.dst_ip,
            decoded.transport.src_port,
            decoded.transport.dst_port,
            decoded.l4_protocol,
            self.worker_count,
        );
        if owner != self.index {
            return; // owned by another worker, dropped cheaply (§4.2)
        }

        self.stats.packets_owned.fetch_add(1, Ordering::Relaxed);
        self.process_owned_packet(packet_id, time_ms, len, caplen, raw, &decoded);
        self.maybe_sweep_idle(time_ms);
    }

    fn process_owned_packet(
        &mut self,
        packet_id: u64,
        time_ms: u64,
        len: u32,
        caplen: u32,
        raw: &[u8],
        decoded: &DecodedPacket,
    ) {
        let l3_type = match decoded.l3_type {
            crate::decode::L3Type::Ipv4 => L3Type::Ipv4,
            crate::decode::L3Type::Ipv6 => L3Type::Ipv6,
        };
        let tuple = FlowTuple {
            l4_protocol: decoded.l4_protocol,
            src_ip: decoded.src_ip,
            dst_ip: decoded.dst_ip,
            src_port: decoded.transport.src_port,
            dst_port: decoded.transport.dst_port,
        };
        let l4_len = decoded.transport.payload_len;

        let global_flow_id = &self.global_flow_id;
        let resolved = match self
            .table
            .find_or_insert(l3_type, tuple, time_ms, l4_len, || global_flow_id.next())
        {
            Ok(resolved) => resolved,
            Err(InsertError::TableFull) => {
                self.emit_basic(packet_id, BasicEventKind::MaxFlowToTrack);
                return;
            }
        };

        let is_new_flow = resolved.is_new_flow;
        let direction_changed = resolved.direction_changed;
        let entry = resolved.entry;

        // §4.4 steps 1-3.
        entry.packets_processed += 1;
        entry.total_l4_data_len += l4_len as u64;
        if is_new_flow {
            entry.min_l4_data_len = l4_len;
            entry.max_l4_data_len = l4_len;
            entry.is_midstream_flow = decoded
                .transport
                .tcp_flags
                .map(|f| !f.syn)
                .unwrap_or(false);
        } else {
            entry.min_l4_data_len = entry.min_l4_data_len.min(l4_len);
            entry.max_l4_data_len = entry.max_l4_data_len.max(l4_len);
        }
        entry.last_seen = time_ms;
        if let Some(flags) = decoded.transport.tcp_flags {
            entry.flow_ack_seen = entry.flow_ack_seen || flags.ack;
        }

        let flow_id = entry.flow_id;

        // step 4: packet-flow event, capped at MAX_PACKETS_PER_FLOW_TO_SEND.
        if entry.packets_processed <= MAX_PACKETS_PER_FLOW_TO_SEND {
            let json = events::build_packet_flow_event(
                self.index,
                packet_id,
                time_ms,
                len,
                caplen,
                raw,
                flow_id,
                entry.packets_processed,
                MAX_PACKETS_PER_FLOW_TO_SEND,
            );
            self.send(&json);
        }

        // step 5.
        if is_new_flow {
            let json = events::build_flow_event(self.index, packet_id, FlowEventKind::New, entry);
            self.send(&json);
        }

        // step 6: FIN+ACK terminates DPI feeding for this flow.
        if let Some(flags) = decoded.transport.tcp_flags {
            if flags.is_fin_ack() && !entry.flow_fin_ack_seen {
                entry.flow_fin_ack_seen = true;
                let json = events::build_flow_event(self.index, packet_id, FlowEventKind::End, entry);
                self.send(&json);
                return;
            }
        }

        // step 7: DPI saturated, nothing more to do.
        if entry.dpi.num_processed_pkts == NUM_PROCESSED_PKTS_SATURATED {
            return;
        }

        // step 8: give up / re-announce detection at the saturation edge.
        if entry.dpi.num_processed_pkts == NUM_PROCESSED_PKTS_GIVE_UP {
            if entry.detection_completed {
                let json =
                    events::build_flow_event(self.index, packet_id, FlowEventKind::Detected, entry);
                self.send(&json);
            } else {
                let guess = self.dpi.give_up(&entry.dpi);
                entry.guessed = guess;
                let kind = if guess.is_some() {
                    FlowEventKind::Guessed
                } else {
                    FlowEventKind::NotDetected
                };
                let json = events::build_flow_event(self.index, packet_id, kind, entry);
                self.send(&json);
            }
        }

        // step 9: feed DPI.
        if !entry.detection_completed {
            let payload_start = raw.len().saturating_sub(l4_len as usize);
            let payload = &raw[payload_start..];
            if let Some(protocol) = self.dpi.feed(&mut entry.dpi, direction_changed, payload) {
                if protocol.is_known() && !entry.detection_completed {
                    entry.detected = Some(protocol);
                    entry.detection_completed = true;
                    self.stats.detected_flow_protocols.fetch_add(1, Ordering::Relaxed);
                    let json = events::build_flow_event(
                        self.index,
                        packet_id,
                        FlowEventKind::Detected,
                        entry,
                    );
                    self.send(&json);
                }
            }
        }

        self.stats.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_l4_data_len
            .fetch_add(l4_len as u64, Ordering::Relaxed);
    }

    fn maybe_sweep_idle(&mut self, time_ms: u64) {
        if !self.table.should_sweep(time_ms, crate::flow::IDLE_SCAN_PERIOD_MS) {
            return;
        }
        let evicted = self.table.sweep_idle(time_ms);
        self.stats
            .idle_flows_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for entry in &evicted {
            let packet_id = self.stats.packets_captured.load(Ordering::Relaxed);
            let json = events::build_flow_event(self.index, packet_id, FlowEventKind::Idle, entry);
            self.send(&json);
        }
    }

    fn emit_packet(&mut self, packet_id: u64, time_ms: u64, len: u32, caplen: u32, raw: &[u8]) {
        let json = events::build_packet_event(self.index, packet_id, time_ms, len, caplen, raw);
        self.send(&json);
    }

    fn emit_basic(&mut self, packet_id: u64, kind: BasicEventKind) {
        let json = events::build_basic_event(self.index, packet_id, kind, &[]);
        self.send(&json);
    }

    fn send(&mut self, json: &str) {
        let framed = crate::events::framing::frame(json);
        if !self.socket.send_frame(&framed) {
            trace!(worker = self.index, "event dropped, collector unavailable");
        }
    }

    pub fn log_shutdown_summary(&self) {
        let s = self.stats();
        info!(
            worker = self.index,
            packets_captured = s.packets_captured,
            packets_owned = s.packets_owned,
            packets_processed = s.packets_processed,
            detected_flow_protocols = s.detected_flow_protocols,
            idle_flows_evicted = s.idle_flows_evicted,
            active_flows = self.table.active_flows(),
            "worker shutting down"
        );
    }
}

fn decode_error_to_basic_event(err: DecodeError) -> BasicEventKind {
    match err {
        DecodeError::UnknownDatalinkLayer => BasicEventKind::UnknownDatalinkLayer,
        DecodeError::UnknownL3Protocol => BasicEventKind::UnknownL3Protocol,
        DecodeError::EthernetTooShort => BasicEventKind::EthernetPacketTooShort,
        DecodeError::EthernetUnknown => BasicEventKind::EthernetPacketUnknown,
        DecodeError::Ip4TooShort => BasicEventKind::Ip4PacketTooShort,
        DecodeError::Ip4SizeSmallerThanHeader => BasicEventKind::Ip4SizeSmallerThanHeader,
        DecodeError::Ip4L4DetectionFailed => BasicEventKind::Ip4L4PayloadDetectionFailed,
        DecodeError::Ip6TooShort => BasicEventKind::Ip6PacketTooShort,
        DecodeError::Ip6SizeSmallerThanHeader => BasicEventKind::Ip6SizeSmallerThanHeader,
        DecodeError::Ip6L4DetectionFailed => BasicEventKind::Ip6L4PayloadDetectionFailed,
        DecodeError::TcpTooShort => BasicEventKind::TcpPacketTooShort,
        DecodeError::UdpTooShort => BasicEventKind::UdpPacketTooShort,
    }
}

/// Process-wide shutdown flag, written only by the signal handler on the
/// main thread and polled by workers between captured packets (§5).
pub fn new_shutdown_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
