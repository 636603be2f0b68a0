//! Entry point: CLI/config, logging, worker spawn, signal-driven shutdown
//! (§2, §5, §6).

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use pcap::Capture;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netsentinel_probe::config::{Args, Config};
use netsentinel_probe::decode::Datalink;
use netsentinel_probe::dpi::BuiltinDpiEngine;
use netsentinel_probe::worker::{new_shutdown_flag, GlobalFlowId, Workflow};

/// Wraps the two capture-source flavors `pcap` exposes behind one handle,
/// since a live interface and an offline file use distinct marker types.
enum CaptureSource {
    Live(Capture<pcap::Active>),
    Offline(Capture<pcap::Offline>),
}

impl CaptureSource {
    fn open(interface: &str, snaplen: i32, promiscuous: bool) -> Result<Self> {
        if Path::new(interface).is_file() {
            let cap = Capture::from_file(interface)
                .with_context(|| format!("opening capture file {interface}"))?;
            Ok(CaptureSource::Offline(cap))
        } else {
            let cap = Capture::from_device(interface)
                .with_context(|| format!("opening interface {interface}"))?
                .promisc(promiscuous)
                .snaplen(snaplen)
                .timeout(250)
                .open()
                .with_context(|| format!("activating interface {interface}"))?;
            Ok(CaptureSource::Live(cap))
        }
    }

    fn datalink(&self) -> Datalink {
        let linktype = match self {
            CaptureSource::Live(c) => c.get_datalink(),
            CaptureSource::Offline(c) => c.get_datalink(),
        };
        match linktype.0 {
            0 => Datalink::NullLoopback,
            1 => Datalink::Ethernet,
            _ => Datalink::Unknown,
        }
    }

    fn next_packet(&mut self) -> Result<Option<(u64, u32, u32, Vec<u8>)>, pcap::Error> {
        let packet = match self {
            CaptureSource::Live(c) => c.next_packet(),
            CaptureSource::Offline(c) => c.next_packet(),
        };
        match packet {
            Ok(p) => {
                let ts_ms = (p.header.ts.tv_sec as u64) * 1000
                    + (p.header.ts.tv_usec as u64) / 1000;
                Ok(Some((ts_ms, p.header.len, p.header.caplen, p.data.to_vec())))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn setup_logging(log_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_stderr {
        subscriber.with_writer(std::io::stderr).init();
    } else {
        subscriber.init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log_stderr);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?.apply_args(&args),
        None => Config::default().apply_args(&args),
    };
    config.validate()?;

    let interface = args
        .interface
        .clone()
        .unwrap_or_else(|| default_capture_device().unwrap_or_else(|| "any".to_string()));

    let shutdown = new_shutdown_flag();
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    let global_flow_id = Arc::new(GlobalFlowId::new());
    let worker_count = config.worker_count;
    let mut handles = Vec::with_capacity(worker_count as usize);

    for index in 0..worker_count {
        let interface = interface.clone();
        let collector_socket = config.collector_socket.clone();
        let shutdown = Arc::clone(&shutdown);
        let global_flow_id = Arc::clone(&global_flow_id);
        let snaplen = config.snaplen;
        let promiscuous = config.promiscuous;

        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                run_worker(
                    index,
                    worker_count,
                    &interface,
                    snaplen,
                    promiscuous,
                    &collector_socket,
                    global_flow_id,
                    shutdown,
                )
            })
            .context("spawning worker thread")?;
        handles.push(handle);
    }

    for handle in handles {
        if let Err(e) = handle.join() {
            error!(?e, "worker thread panicked");
        }
    }

    info!("all workers exited, shutting down");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    index: u32,
    worker_count: u32,
    interface: &str,
    snaplen: i32,
    promiscuous: bool,
    collector_socket: &Path,
    global_flow_id: Arc<GlobalFlowId>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut source = match CaptureSource::open(interface, snaplen, promiscuous) {
        Ok(source) => source,
        Err(e) => {
            error!(worker = index, error = %e, "failed to open capture source");
            return;
        }
    };
    let datalink = source.datalink();

    let mut workflow = Workflow::new(
        index,
        worker_count,
        BuiltinDpiEngine::new(),
        collector_socket,
        global_flow_id,
    );

    while !shutdown.load(Ordering::SeqCst) {
        match source.next_packet() {
            Ok(Some((ts_ms, len, caplen, data))) => {
                workflow.handle_packet(datalink, ts_ms, caplen, len, &data);
            }
            Ok(None) => continue,
            Err(e) => {
                error!(worker = index, error = %e, "capture error, worker exiting");
                break;
            }
        }
    }

    workflow.log_shutdown_summary();
}

fn default_capture_device() -> Option<String> {
    pcap::Device::lookup().ok().flatten().map(|d| d.name)
}
