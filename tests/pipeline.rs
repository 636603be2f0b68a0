//! End-to-end scenarios driving the decode → flow → event pipeline with
//! synthetic packets, no real NIC involved (§8 "Concrete end-to-end
//! scenarios").

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use netsentinel_probe::decode::Datalink;
use netsentinel_probe::dpi::BuiltinDpiEngine;
use netsentinel_probe::events::framing::parse_frame;
use netsentinel_probe::worker::{GlobalFlowId, Workflow};

fn eth_ipv4_tcp(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 6]); // dst mac
    frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // src mac
    frame.extend_from_slice(&[0x08, 0x00]); // IPv4

    let total_len = 20 + 20 + payload.len();
    let mut ip = vec![
        0x45, 0x00,
        (total_len >> 8) as u8, total_len as u8,
        0x00, 0x01,
        0x40, 0x00,
        0x40, 0x06, // TTL, TCP
        0x00, 0x00,
        10, 0, 0, 1,
        10, 0, 0, 2,
    ];
    let mut tcp = vec![
        (src_port >> 8) as u8, src_port as u8,
        (dst_port >> 8) as u8, dst_port as u8,
        0, 0, 0, 1,
        0, 0, 0, 0,
        0x50, flags,
        0xff, 0xff,
        0, 0,
        0, 0,
    ];
    tcp.extend_from_slice(payload);
    ip.extend_from_slice(&tcp);
    frame.extend_from_slice(&ip);
    frame
}

const SYN: u8 = 0x02;
const SYN_ACK: u8 = 0x12;
const ACK: u8 = 0x10;
const FIN_ACK: u8 = 0x11;

fn collect_event_names(listener: UnixListener) -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);

        let mut names = Vec::new();
        let mut offset = 0;
        while let Some((json, consumed)) = parse_frame(&buf[offset..]) {
            let value: serde_json::Value = serde_json::from_slice(json).expect("valid json");
            if let Some(name) = value.get("flow_event_name") {
                names.push(name.as_str().unwrap().to_string());
            } else if let Some(name) = value.get("packet_event_name") {
                names.push(name.as_str().unwrap().to_string());
            } else if let Some(name) = value.get("basic_event_name") {
                names.push(format!("basic:{}", name.as_str().unwrap()));
            }
            offset += consumed;
        }
        let _ = tx.send(names);
    });
    rx
}

#[test]
fn tcp_handshake_then_fin_ack_emits_new_then_end() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("collector.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();
    let rx = collect_event_names(listener);

    let global_flow_id = Arc::new(GlobalFlowId::new());
    let mut workflow = Workflow::new(0, 1, BuiltinDpiEngine::new(), &sock_path, global_flow_id);

    let syn = eth_ipv4_tcp(11111, 443, SYN, &[]);
    workflow.handle_packet(Datalink::Ethernet, 1_000, syn.len() as u32, syn.len() as u32, &syn);

    let syn_ack = eth_ipv4_tcp(443, 11111, SYN_ACK, &[]);
    workflow.handle_packet(Datalink::Ethernet, 1_001, syn_ack.len() as u32, syn_ack.len() as u32, &syn_ack);

    let data = eth_ipv4_tcp(11111, 443, ACK, b"GET / HTTP/1.1\r\n");
    workflow.handle_packet(Datalink::Ethernet, 1_002, data.len() as u32, data.len() as u32, &data);

    let fin = eth_ipv4_tcp(11111, 443, FIN_ACK, &[]);
    workflow.handle_packet(Datalink::Ethernet, 1_003, fin.len() as u32, fin.len() as u32, &fin);

    drop(workflow);

    let names = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert!(names.contains(&"new".to_string()));
    assert!(names.contains(&"end".to_string()));
    assert_eq!(names.iter().filter(|n| *n == "new").count(), 1);
}

#[test]
fn off_shard_packet_produces_no_events() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("collector.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();
    let rx = collect_event_names(listener);

    let global_flow_id = Arc::new(GlobalFlowId::new());
    // worker_count = 4 but this worker is index 0; with high enough
    // worker_count most packets route elsewhere. We assert the worker
    // only ever emits events for packets it actually owns.
    let mut workflow = Workflow::new(1, 4, BuiltinDpiEngine::new(), &sock_path, global_flow_id);

    for port in 0..16u16 {
        let pkt = eth_ipv4_tcp(20000 + port, 80, SYN, &[]);
        workflow.handle_packet(Datalink::Ethernet, 1000 + port as u64, pkt.len() as u32, pkt.len() as u32, &pkt);
    }

    drop(workflow);
    let names = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    // Not every SYN is owned by worker 1; the ones that are should still
    // produce a "new" event, but not all 16.
    let new_count = names.iter().filter(|n| *n == "new").count();
    assert!(new_count < 16);
}

#[test]
fn truncated_capture_emits_packet_event_before_basic_event() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("collector.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();
    let rx = collect_event_names(listener);

    let global_flow_id = Arc::new(GlobalFlowId::new());
    let mut workflow = Workflow::new(0, 1, BuiltinDpiEngine::new(), &sock_path, global_flow_id);

    let syn = eth_ipv4_tcp(11111, 443, SYN, &[]);
    let full_len = syn.len() as u32;
    // caplen < len: the capture library reports more on the wire than it
    // actually captured, but the bytes handed to us are still decodable.
    workflow.handle_packet(Datalink::Ethernet, 1_000, full_len - 4, full_len, &syn);

    drop(workflow);
    let names = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(
        names,
        vec![
            "packet".to_string(),
            "basic:CAPTURE_SIZE_SMALLER_THAN_PACKET_SIZE".to_string(),
            "packet-flow".to_string(),
            "new".to_string(),
        ]
    );
}

#[test]
fn malformed_ethernet_frame_emits_packet_event_and_no_flow() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("collector.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();
    let rx = collect_event_names(listener);

    let global_flow_id = Arc::new(GlobalFlowId::new());
    let mut workflow = Workflow::new(0, 1, BuiltinDpiEngine::new(), &sock_path, global_flow_id);

    let short = vec![0xff, 0xff, 0xff];
    workflow.handle_packet(Datalink::Ethernet, 1000, short.len() as u32, short.len() as u32, &short);

    drop(workflow);
    let names = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(names, vec!["packet".to_string()]);
}
