//! AF_UNIX stream socket client with transparent reconnect (§4.7).
//!
//! One socket per worker, connect-only, read direction shut down right
//! after connect. Sends are best-effort: a failure marks the socket for
//! reconnect on the next attempt and the event that failed to send is
//! dropped, never buffered.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

/// Atomics shaped after an output-sink stats struct, generalized from a
/// Redis stream to a length-framed Unix socket.
#[derive(Debug, Default)]
pub struct SocketStats {
    pub events_sent: AtomicU64,
    pub events_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl SocketStats {
    pub fn snapshot(&self) -> SocketStatsSnapshot {
        SocketStatsSnapshot {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SocketStatsSnapshot {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub reconnects: u64,
    pub bytes_sent: u64,
}

/// A worker's connection to the collector. `send` never blocks the capture
/// pipeline: a disconnected socket just drops the event and tries to
/// reconnect on the *next* call.
pub struct CollectorSocket {
    path: PathBuf,
    stream: Option<UnixStream>,
    stats: SocketStats,
}

impl CollectorSocket {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CollectorSocket {
            path: path.as_ref().to_path_buf(),
            stream: None,
            stats: SocketStats::default(),
        }
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }

    fn connect(&mut self) -> bool {
        match UnixStream::connect(&self.path) {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set collector socket non-blocking");
                    return false;
                }
                let _ = stream.shutdown(std::net::Shutdown::Read);
                self.stream = Some(stream);
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                let handshake = super::framing::frame(r#"{"init_complete":true}"#);
                if !self.send_raw(&handshake) {
                    self.stream = None;
                    return false;
                }
                true
            }
            Err(e) => {
                debug!(error = %e, path = %self.path.display(), "collector socket connect failed");
                false
            }
        }
    }

    /// Send one already-framed event. Returns `true` if the bytes were
    /// handed to the kernel; `false` means the event was dropped.
    pub fn send_frame(&mut self, frame: &[u8]) -> bool {
        if self.stream.is_none() && !self.connect() {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if self.send_raw(frame) {
            self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
            true
        } else {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match stream.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    debug!("lost connection to collector");
                } else {
                    debug!(error = %e, "collector socket send failed");
                }
                self.stream = None;
                false
            }
        }
    }
}
