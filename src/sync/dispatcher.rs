//! Delivery dispatcher
//!
//! Governs how server-chosen values reach binding storage. In poll mode the
//! barrier is the only delivery path. In signal mode a background listener
//! owns the read half of the socket and forwards every decoded message onto
//! a single-consumer channel; value batches are staged, never applied from
//! the listener thread, so an application read can never race an apply. The
//! hybrid mode stays synchronous but drains already-buffered socket data on
//! each operation.

use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::binding::TunableValue;
use crate::client::session::Session;
use crate::utils::error::Result;
use crate::utils::wire::Message;

/// Delivery discipline for server-chosen values, fixed at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// The application drives everything; no background activity.
    Poll,
    /// The server may push batches unsolicited; a background listener
    /// stages them for an explicit apply step.
    Signal,
    /// Poll correctness plus an opportunistic drain of buffered socket
    /// data on each operation.
    PollHybrid,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Poll => write!(f, "poll"),
            UpdateMode::Signal => write!(f, "signal"),
            UpdateMode::PollHybrid => write!(f, "poll-hybrid"),
        }
    }
}

/// Value batches received asynchronously but not yet applied
///
/// Only the application side touches this, under the session lock; the
/// listener hands batches over through the inbox channel.
#[derive(Default)]
pub(crate) struct PendingUpdates {
    batches: VecDeque<Vec<(String, TunableValue)>>,
}

impl PendingUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, batch: Vec<(String, TunableValue)>) {
        self.batches.push_back(batch);
    }

    /// Total number of staged (variable, value) pairs.
    pub fn value_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn take_all(&mut self) -> Vec<Vec<(String, TunableValue)>> {
        self.batches.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }
}

/// Apply every staged batch into binding storage. This is the single apply
/// path for asynchronously delivered values; unknown names are skipped.
/// Returns the number of values applied.
pub(crate) fn apply_staged(session: &mut Session) -> Result<usize> {
    if session.pending.is_empty() {
        return Ok(0);
    }
    let batches = session.pending.take_all();
    let mut applied = 0usize;
    for batch in batches {
        for (name, value) in batch {
            let result = session.bindings.apply(&name, value);
            match result {
                Ok(true) => applied += 1,
                Ok(false) => debug!("ignoring pushed value for unregistered variable {}", name),
                Err(e) => return session.check_fatal(Err(e)),
            }
        }
    }
    if applied > 0 {
        debug!("applied {} staged values", applied);
    }
    Ok(applied)
}

/// Handle to a signal-mode listener thread
pub(crate) struct Listener {
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl Listener {
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait for the listener to exit. The caller shuts the socket down
    /// first, which unblocks the read.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the signal-mode listener. It owns the read half of the socket,
/// decodes frames, and forwards every message onto the inbox channel. On
/// socket death or a decode failure it sets the failure flag and exits;
/// the session observes this as a disconnected inbox.
pub(crate) fn spawn_listener(
    session_id: u32,
    stream: TcpStream,
    leftover: Vec<u8>,
    inbox: mpsc::Sender<Message>,
) -> Listener {
    let failed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed);

    let thread = thread::Builder::new()
        .name(format!("tuning-listener-{}", session_id))
        .spawn(move || listener_loop(session_id, stream, leftover, inbox, flag))
        .expect("failed to spawn listener thread");

    Listener {
        thread: Some(thread),
        failed,
    }
}

fn listener_loop(
    session_id: u32,
    stream: TcpStream,
    leftover: Vec<u8>,
    inbox: mpsc::Sender<Message>,
    failed: Arc<AtomicBool>,
) {
    // The barrier may block for as long as the server paces it; the
    // listener read must never time out underneath it.
    stream.set_read_timeout(None).ok();
    let mut stream = stream;
    let mut rbuf = leftover;
    let mut chunk = [0u8; 4096];

    loop {
        loop {
            match Message::decode_frame(&rbuf) {
                Ok(Some((msg, n))) => {
                    rbuf.drain(..n);
                    if inbox.send(msg).is_err() {
                        // Session is gone; nothing left to deliver to.
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("session {}: listener decode error: {}", session_id, e);
                    failed.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("session {}: server closed the connection", session_id);
                failed.store(true, Ordering::Relaxed);
                return;
            }
            Ok(n) => rbuf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("session {}: listener socket error: {}", session_id, e);
                failed.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}
