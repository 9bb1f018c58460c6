//! Process-wide session registry
//!
//! Owns every live session and keys them by opaque handle; applications
//! never hold a session reference. The registry lock covers only table
//! lookup and insert/remove, so opening or closing one session never
//! contends with another session blocked in a barrier. Each operation locks
//! its session for its full duration, which serializes all use of one
//! socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::binding::{MetricValue, TunableCell, TunableType, TunableValue};
use crate::client::session::{Session, SessionState};
use crate::config::SessionOptions;
use crate::sync::UpdateMode;
use crate::utils::error::{Result, UsageError};

/// Opaque handle to a session
///
/// The default handle resolves to the most recently opened live session,
/// the convenience default for single-session applications. Real handles
/// start at 1 and are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub const MOST_RECENT: SessionHandle = SessionHandle(0);

    pub fn id(self) -> u32 {
        self.0
    }

    pub(crate) fn from_id(id: u32) -> Self {
        SessionHandle(id)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide collection of tuning sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Arc<Mutex<Session>>>>,
    next_id: AtomicU32,
    /// Id of the most recently opened session, 0 when none is live.
    most_recent: AtomicU32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            most_recent: AtomicU32::new(0),
        }
    }

    /// Open a session: connect, handshake, and in signal mode start the
    /// background listener. On failure no handle becomes valid.
    pub fn startup(&self, options: SessionOptions) -> Result<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle::from_id(id);
        let session = Session::open(handle, &options)?;
        self.sessions
            .write()
            .insert(id, Arc::new(Mutex::new(session)));
        self.most_recent.store(id, Ordering::Relaxed);
        Ok(handle)
    }

    /// Close a session and release its bindings. Idempotent: closing an
    /// unknown or already-closed handle is a no-op. Never touches other
    /// sessions.
    pub fn end(&self, handle: SessionHandle) -> Result<()> {
        let slot = match self.resolve(handle) {
            Ok(slot) => slot,
            Err(_) => return Ok(()),
        };
        let id = {
            let mut session = slot.lock();
            session.end()?;
            session.handle().id()
        };
        self.sessions.write().remove(&id);
        let _ = self
            .most_recent
            .compare_exchange(id, 0, Ordering::Relaxed, Ordering::Relaxed);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Server-assigned client id from the handshake.
    pub fn client_id(&self, handle: SessionHandle) -> Result<u32> {
        self.with_session(handle, |session| session.client_id())
    }

    pub fn session_state(&self, handle: SessionHandle) -> Result<SessionState> {
        Ok(self.resolve(handle)?.lock().state())
    }

    pub fn update_mode(&self, handle: SessionHandle) -> Result<UpdateMode> {
        Ok(self.resolve(handle)?.lock().mode())
    }

    /// Register a tunable variable and receive its storage cell.
    pub fn add_variable(
        &self,
        handle: SessionHandle,
        bundle: &str,
        name: &str,
        ty: TunableType,
    ) -> Result<TunableCell> {
        self.with_session(handle, |session| session.add_variable(bundle, name, ty))
    }

    /// Push one variable's current value to the server, no reply awaited.
    pub fn set_variable(&self, handle: SessionHandle, cell: &TunableCell) -> Result<()> {
        self.with_session(handle, |session| session.set_variable(cell))
    }

    /// Push every binding's current value in a single batch.
    pub fn set_all(&self, handle: SessionHandle) -> Result<()> {
        self.with_session(handle, |session| session.set_all())
    }

    /// Blocking barrier: block until the server has supplied a value for
    /// every registered variable, then return with storage updated.
    pub fn request_all(&self, handle: SessionHandle) -> Result<()> {
        self.with_session(handle, |session| session.request_all())
    }

    /// Report a performance measurement, fire-and-forget.
    pub fn performance_update(
        &self,
        handle: SessionHandle,
        metric: impl Into<MetricValue>,
    ) -> Result<()> {
        let metric = metric.into();
        self.with_session(handle, |session| session.performance_update(metric))
    }

    /// Has the server's search converged?
    pub fn check_convergence(&self, handle: SessionHandle) -> Result<bool> {
        self.with_session(handle, |session| session.check_convergence())
    }

    /// Snapshot of the best configuration the server has seen; live
    /// bindings are not touched.
    pub fn best_configuration(
        &self,
        handle: SessionHandle,
    ) -> Result<HashMap<String, TunableValue>> {
        self.with_session(handle, |session| session.best_configuration())
    }

    /// Look up a server-side configuration string.
    pub fn server_config(&self, handle: SessionHandle, key: &str) -> Result<Option<String>> {
        self.with_session(handle, |session| session.server_config(key))
    }

    /// Number of asynchronously received values staged but not applied.
    pub fn pending_updates(&self, handle: SessionHandle) -> Result<usize> {
        self.with_session(handle, |session| Ok(session.pending_update_count()))
    }

    /// Apply staged values into binding storage; returns how many applied.
    pub fn apply_pending(&self, handle: SessionHandle) -> Result<usize> {
        self.with_session(handle, |session| session.apply_pending())
    }

    fn resolve(&self, handle: SessionHandle) -> Result<Arc<Mutex<Session>>> {
        let id = if handle.0 == 0 {
            self.most_recent.load(Ordering::Relaxed)
        } else {
            handle.0
        };
        if id == 0 {
            return Err(UsageError::UnknownHandle(handle.0).into());
        }
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| UsageError::UnknownHandle(id).into())
    }

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let slot = self.resolve(handle)?;
        let mut session = slot.lock();
        // Dispatcher entry step: stage anything already buffered
        session.drain_ready()?;
        f(&mut session)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddress;
    use crate::utils::error::{ConnectionError, ProtocolError, TuningError};
    use crate::utils::wire::Message;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn init_logging() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// Server side of one scripted connection
    struct Peer {
        stream: TcpStream,
        rbuf: Vec<u8>,
    }

    impl Peer {
        fn read_msg(&mut self) -> Message {
            self.read_msg_opt().expect("peer closed mid-script")
        }

        fn read_msg_opt(&mut self) -> Option<Message> {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some((msg, n)) = Message::decode_frame(&self.rbuf).unwrap() {
                    self.rbuf.drain(..n);
                    return Some(msg);
                }
                match self.stream.read(&mut chunk) {
                    Ok(0) => return None,
                    Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                    Err(_) => return None,
                }
            }
        }

        fn write_msg(&mut self, msg: &Message) {
            self.stream.write_all(&msg.encode()).unwrap();
            self.stream.flush().unwrap();
        }

        /// Accept the handshake and assign a client id.
        fn accept_setup(&mut self, client_id: u32) {
            match self.read_msg() {
                Message::Setup { .. } => self.write_msg(&Message::Ack { code: client_id }),
                other => panic!("expected SETUP, got {}", other.kind()),
            }
        }

        /// Acknowledge one variable registration.
        fn ack_register(&mut self) {
            match self.read_msg() {
                Message::RegisterVar { .. } => self.write_msg(&Message::Ack { code: 0 }),
                other => panic!("expected REGISTER_VAR, got {}", other.kind()),
            }
        }

        /// Expect an end-of-session notice (or the client just closing).
        fn expect_end(&mut self) {
            match self.read_msg_opt() {
                Some(Message::End) | None => {}
                Some(other) => panic!("expected END, got {}", other.kind()),
            }
        }
    }

    /// Spawn a one-connection scripted server.
    fn serve<F>(script: F) -> (ServerAddress, JoinHandle<()>)
    where
        F: FnOnce(Peer) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(Peer {
                stream,
                rbuf: Vec::new(),
            });
        });
        (
            ServerAddress {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            handle,
        )
    }

    fn options_for(address: &ServerAddress, mode: UpdateMode) -> SessionOptions {
        SessionOptions::new(address.host.clone(), address.port)
            .update_mode(mode)
            .read_timeout(Some(Duration::from_secs(5)))
    }

    #[test]
    fn test_barrier_applies_full_batch() {
        // Scenario A: register p1:int and p2:double, request_all, server
        // assigns (p1, 7) and (p2, 3.5).
        init_logging();
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            peer.ack_register();
            // Barrier: delta push of the two zero values, then the request
            match peer.read_msg() {
                Message::SetAll { values } => assert_eq!(values.len(), 2),
                other => panic!("expected SET_ALL, got {}", other.kind()),
            }
            match peer.read_msg() {
                Message::RequestAll => {}
                other => panic!("expected REQUEST_ALL, got {}", other.kind()),
            }
            peer.write_msg(&Message::ValuePush {
                values: vec![
                    ("p1".to_string(), TunableValue::Int(7)),
                    ("p2".to_string(), TunableValue::Double(3.5)),
                ],
            });
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        assert_eq!(registry.client_id(handle).unwrap(), 1);

        let p1 = registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();
        let p2 = registry
            .add_variable(handle, "app", "p2", TunableType::Double)
            .unwrap();

        registry.request_all(handle).unwrap();
        assert_eq!(p1.get_i64(), Some(7));
        assert_eq!(p2.get_f64(), Some(3.5));

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_barrier_incomplete_update() {
        // Scenario B: the server only covers p1. The call fails, p1 is
        // updated, p2 keeps its prior value, the session stays active.
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            peer.ack_register();
            let _ = peer.read_msg(); // SET_ALL
            let _ = peer.read_msg(); // REQUEST_ALL
            peer.write_msg(&Message::ValuePush {
                values: vec![("p1".to_string(), TunableValue::Int(7))],
            });
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        let p1 = registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();
        let p2 = registry
            .add_variable(handle, "app", "p2", TunableType::Double)
            .unwrap();
        p2.set_f64(1.25).unwrap();

        match registry.request_all(handle) {
            Err(TuningError::IncompleteUpdate { missing }) => {
                assert_eq!(missing, vec!["p2".to_string()]);
            }
            other => panic!("expected IncompleteUpdate, got {:?}", other.err()),
        }
        assert_eq!(p1.get_i64(), Some(7));
        assert_eq!(p2.get_f64(), Some(1.25));
        assert_eq!(
            registry.session_state(handle).unwrap(),
            SessionState::Active
        );

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_sessions_are_independent() {
        // Scenario C: closing session A leaves session B's staged state and
        // connection untouched.
        let (addr_a, server_a) = serve(|mut peer| {
            peer.accept_setup(10);
            peer.expect_end();
        });
        let (addr_b, server_b) = serve(|mut peer| {
            peer.accept_setup(20);
            peer.ack_register();
            peer.write_msg(&Message::ValuePush {
                values: vec![("knob".to_string(), TunableValue::Int(5))],
            });
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let session_a = registry
            .startup(options_for(&addr_a, UpdateMode::Poll))
            .unwrap();
        let session_b = registry
            .startup(options_for(&addr_b, UpdateMode::PollHybrid))
            .unwrap();

        let knob = registry
            .add_variable(session_b, "app", "knob", TunableType::Int)
            .unwrap();

        // Wait until the hybrid drain has staged the server's push
        let mut staged = 0;
        for _ in 0..50 {
            staged = registry.pending_updates(session_b).unwrap();
            if staged > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(staged, 1);

        registry.end(session_a).unwrap();
        server_a.join().unwrap();
        assert_eq!(registry.session_count(), 1);

        // B's staged value survives A's close and applies normally
        assert_eq!(registry.pending_updates(session_b).unwrap(), 1);
        assert_eq!(registry.apply_pending(session_b).unwrap(), 1);
        assert_eq!(knob.get_i64(), Some(5));
        assert_eq!(registry.client_id(session_b).unwrap(), 20);

        registry.end(session_b).unwrap();
        server_b.join().unwrap();
    }

    #[test]
    fn test_metric_kind_is_pinned() {
        // Scenario D: an int report followed by a double report. The second
        // fails locally; the first was already delivered and the session
        // stays active.
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            match peer.read_msg() {
                Message::PerfUpdate {
                    metric: MetricValue::Int(12),
                } => {}
                other => panic!("expected int PERF_UPDATE, got {}", other.kind()),
            }
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();

        registry.performance_update(handle, 12i64).unwrap();
        match registry.performance_update(handle, 3.5) {
            Err(TuningError::Protocol(ProtocolError::TypeMismatch { .. })) => {}
            other => panic!("expected TypeMismatch, got {:?}", other.err()),
        }
        assert_eq!(
            registry.session_state(handle).unwrap(),
            SessionState::Active
        );

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_duplicate_variable_rejected_locally() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();
        match registry.add_variable(handle, "app", "p1", TunableType::Int) {
            Err(TuningError::Usage(UsageError::DuplicateVariable { .. })) => {}
            other => panic!("expected DuplicateVariable, got {:?}", other.err()),
        }

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_binding_set_seals_on_first_barrier() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            let _ = peer.read_msg(); // SET_ALL
            let _ = peer.read_msg(); // REQUEST_ALL
            peer.write_msg(&Message::ValuePush {
                values: vec![("p1".to_string(), TunableValue::Int(1))],
            });
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();
        registry.request_all(handle).unwrap();

        match registry.add_variable(handle, "app", "late", TunableType::Int) {
            Err(TuningError::Usage(UsageError::BindingsSealed)) => {}
            other => panic!("expected BindingsSealed, got {:?}", other.err()),
        }

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_signal_mode_stages_until_applied() {
        init_logging();
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            // Unsolicited push after registration
            peer.write_msg(&Message::ValuePush {
                values: vec![("p1".to_string(), TunableValue::Int(9))],
            });
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Signal))
            .unwrap();
        let p1 = registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();

        let mut staged = 0;
        for _ in 0..50 {
            staged = registry.pending_updates(handle).unwrap();
            if staged > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(staged, 1);
        // Staged, not applied: storage still holds the old value
        assert_eq!(p1.get_i64(), Some(0));

        assert_eq!(registry.apply_pending(handle).unwrap(), 1);
        assert_eq!(p1.get_i64(), Some(9));

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_queries_do_not_touch_bindings() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            match peer.read_msg() {
                Message::ConvergedQuery => peer.write_msg(&Message::Ack { code: 1 }),
                other => panic!("expected CONVERGED_QUERY, got {}", other.kind()),
            }
            match peer.read_msg() {
                Message::BestConfigQuery => peer.write_msg(&Message::ValuePush {
                    values: vec![("p1".to_string(), TunableValue::Int(99))],
                }),
                other => panic!("expected BEST_CONFIG_QUERY, got {}", other.kind()),
            }
            match peer.read_msg() {
                Message::CfgQuery { key } => {
                    assert_eq!(key, "codegen_path");
                    peer.write_msg(&Message::CfgValue {
                        value: Some("/opt/tuner/lib".to_string()),
                    });
                }
                other => panic!("expected CFG_QUERY, got {}", other.kind()),
            }
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        let p1 = registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();

        assert!(registry.check_convergence(handle).unwrap());

        let best = registry.best_configuration(handle).unwrap();
        assert_eq!(best.get("p1"), Some(&TunableValue::Int(99)));
        // The snapshot never touches live storage
        assert_eq!(p1.get_i64(), Some(0));

        assert_eq!(
            registry.server_config(handle, "codegen_path").unwrap(),
            Some("/opt/tuner/lib".to_string())
        );

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_set_variable_and_set_all_wire_traffic() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            peer.ack_register();
            match peer.read_msg() {
                Message::SetVar { name, value } => {
                    assert_eq!(name, "p1");
                    assert_eq!(value, TunableValue::Int(42));
                }
                other => panic!("expected SET_VAR, got {}", other.kind()),
            }
            match peer.read_msg() {
                Message::SetAll { values } => {
                    // Registration order
                    assert_eq!(values[0], ("p1".to_string(), TunableValue::Int(42)));
                    assert_eq!(values[1], ("p2".to_string(), TunableValue::Str("x".into())));
                }
                other => panic!("expected SET_ALL, got {}", other.kind()),
            }
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        let p1 = registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();
        let p2 = registry
            .add_variable(handle, "app", "p2", TunableType::Str)
            .unwrap();

        p1.set_i64(42).unwrap();
        p2.set_string("x").unwrap();
        registry.set_variable(handle, &p1).unwrap();
        registry.set_all(handle).unwrap();

        registry.end(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_handshake_rejection() {
        let (address, server) = serve(|mut peer| {
            match peer.read_msg() {
                Message::Setup { .. } => peer.write_msg(&Message::Nack {
                    reason: "unknown application".to_string(),
                }),
                other => panic!("expected SETUP, got {}", other.kind()),
            }
        });

        let registry = SessionRegistry::new();
        match registry.startup(options_for(&address, UpdateMode::Poll)) {
            Err(TuningError::Connection(ConnectionError::HandshakeRejected(reason))) => {
                assert_eq!(reason, "unknown application");
            }
            other => panic!("expected HandshakeRejected, got {:?}", other.err()),
        }
        assert_eq!(registry.session_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_server_death_fails_session_not_process() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(1);
            peer.ack_register();
            let _ = peer.read_msg(); // SET_ALL
            let _ = peer.read_msg(); // REQUEST_ALL
                                     // Drop without replying: the barrier must unblock with an error
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();
        registry
            .add_variable(handle, "app", "p1", TunableType::Int)
            .unwrap();

        match registry.request_all(handle) {
            Err(TuningError::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other.err()),
        }
        server.join().unwrap();

        // Failure is sticky and reported on the next operation
        assert_eq!(
            registry.session_state(handle).unwrap(),
            SessionState::Failed
        );
        match registry.client_id(handle) {
            Err(TuningError::Usage(UsageError::SessionNotActive(state))) => {
                assert_eq!(state, SessionState::Failed);
            }
            other => panic!("expected SessionNotActive, got {:?}", other.err()),
        }

        // end() still cleans up without error
        registry.end(handle).unwrap();
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_concurrent_startup_and_end() {
        // The handle table is process-wide mutable state; opening and
        // closing sessions from several threads must not interfere.
        let registry = Arc::new(SessionRegistry::new());

        let workers: Vec<JoinHandle<()>> = (0..4)
            .map(|client_id| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let (address, server) = serve(move |mut peer| {
                        peer.accept_setup(client_id);
                        peer.expect_end();
                    });
                    let handle = registry
                        .startup(options_for(&address, UpdateMode::Poll))
                        .unwrap();
                    assert_eq!(registry.client_id(handle).unwrap(), client_id);
                    registry.end(handle).unwrap();
                    server.join().unwrap();
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_most_recent_default_handle() {
        let (address, server) = serve(|mut peer| {
            peer.accept_setup(3);
            peer.expect_end();
        });

        let registry = SessionRegistry::new();
        let handle = registry
            .startup(options_for(&address, UpdateMode::Poll))
            .unwrap();

        // The default handle resolves to the session just opened
        assert_eq!(
            registry.client_id(SessionHandle::MOST_RECENT).unwrap(),
            registry.client_id(handle).unwrap()
        );

        registry.end(SessionHandle::MOST_RECENT).unwrap();
        server.join().unwrap();

        // Ending twice is a no-op, and the default no longer resolves
        registry.end(SessionHandle::MOST_RECENT).unwrap();
        assert!(matches!(
            registry.client_id(SessionHandle::MOST_RECENT),
            Err(TuningError::Usage(UsageError::UnknownHandle(0)))
        ));
    }
}
