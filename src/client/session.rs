//! Tuning session: lifecycle state machine and protocol operations
//!
//! A session is one socket to one tuning server plus its binding table,
//! update mode, and staged pending values. All operations on a session are
//! serialized by the registry; nothing here is called concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::binding::{BindingTable, MetricValue, TunableCell, TunableType, TunableValue};
use crate::client::connection::ServerConnection;
use crate::client::registry::SessionHandle;
use crate::config::{ServerAddress, SessionOptions};
use crate::sync::barrier;
use crate::sync::dispatcher::{self, spawn_listener, Listener, PendingUpdates, UpdateMode};
use crate::utils::error::{ConnectionError, ProtocolError, Result, TuningError, UsageError};
use crate::utils::wire::Message;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
    /// Terminal: a network or protocol failure. The handle stays known to
    /// the registry so the failure is reported on the next operation.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unconnected => write!(f, "unconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// How the session talks to its socket
enum Transport {
    /// Poll modes: the session reads its own socket.
    Direct(ServerConnection),
    /// Signal mode: the listener owns the read half; the session keeps the
    /// write half and receives inbound messages through the inbox.
    Split {
        writer: ServerConnection,
        inbox: mpsc::Receiver<Message>,
        listener: Listener,
    },
}

impl Transport {
    fn shutdown(&mut self) {
        match self {
            Transport::Direct(conn) => conn.shutdown(),
            Transport::Split {
                writer, listener, ..
            } => {
                // Closing the socket unblocks the listener's read
                writer.shutdown();
                listener.join();
            }
        }
    }
}

pub(crate) struct Session {
    handle: SessionHandle,
    address: ServerAddress,
    mode: UpdateMode,
    state: SessionState,
    client_id: u32,
    transport: Option<Transport>,
    pub(crate) bindings: BindingTable,
    pub(crate) pending: PendingUpdates,
    metric_kind: Option<TunableType>,
}

impl Session {
    /// Connect and handshake. The session only materializes in the Active
    /// state; on any failure the socket is dropped and no handle becomes
    /// valid.
    pub fn open(handle: SessionHandle, options: &SessionOptions) -> Result<Self> {
        let description = options.description.resolve()?;

        debug!("session {}: connecting to {}", handle, options.address);
        let mut conn = ServerConnection::connect(
            &options.address,
            options.connect_timeout,
            options.read_timeout,
            options.write_timeout,
        )?;

        debug!("session {}: handshaking", handle);
        conn.send(&Message::Setup { description })?;
        let client_id = match conn.recv()? {
            Message::Ack { code } => code,
            Message::Nack { reason } => {
                return Err(ConnectionError::HandshakeRejected(reason).into())
            }
            other => {
                return Err(ProtocolError::UnexpectedResponse {
                    expected: "ACK".to_string(),
                    actual: other.kind().to_string(),
                }
                .into())
            }
        };

        let transport = if options.mode == UpdateMode::Signal {
            let (read_stream, leftover) = conn.split_reader()?;
            let (tx, rx) = mpsc::channel();
            let listener = spawn_listener(handle.id(), read_stream, leftover, tx);
            Transport::Split {
                writer: conn,
                inbox: rx,
                listener,
            }
        } else {
            Transport::Direct(conn)
        };

        info!(
            "session {}: active against {} (client id {}, {} mode)",
            handle, options.address, client_id, options.mode
        );

        Ok(Self {
            handle,
            address: options.address.clone(),
            mode: options.mode,
            state: SessionState::Active,
            client_id,
            transport: Some(transport),
            bindings: BindingTable::new(),
            pending: PendingUpdates::new(),
            metric_kind: None,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn client_id(&self) -> Result<u32> {
        self.ensure_active()?;
        Ok(self.client_id)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(UsageError::SessionNotActive(self.state).into());
        }
        Ok(())
    }

    /// Move to Failed and drop the socket. Closing/Closed sessions stay as
    /// they are.
    fn fail(&mut self) {
        if matches!(
            self.state,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        ) {
            return;
        }
        warn!("session {}: failed, socket dropped", self.handle);
        self.state = SessionState::Failed;
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
    }

    /// Route fatal errors (connection, inbound protocol) into the Failed
    /// state. Usage errors, rejections and incomplete updates pass through
    /// untouched.
    pub(crate) fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail();
            }
        }
        result
    }

    pub(crate) fn send(&mut self, msg: &Message) -> Result<()> {
        let result = match self.transport.as_mut() {
            Some(Transport::Direct(conn)) => conn.send(msg),
            Some(Transport::Split { writer, .. }) => writer.send(msg),
            None => Err(ConnectionError::Closed),
        }
        .map_err(TuningError::from);
        self.check_fatal(result)
    }

    /// Blocking receive of the next inbound message.
    pub(crate) fn recv_message(&mut self) -> Result<Message> {
        let result = match self.transport.as_mut() {
            Some(Transport::Direct(conn)) => conn.recv(),
            Some(Transport::Split { inbox, .. }) => inbox
                .recv()
                .map_err(|_| TuningError::Connection(ConnectionError::Closed)),
            None => Err(ConnectionError::Closed.into()),
        };
        self.check_fatal(result)
    }

    /// Dispatcher entry step: stage whatever the socket already holds
    /// without blocking. No-op in pure poll mode.
    pub(crate) fn drain_ready(&mut self) -> Result<()> {
        let result = self.drain_ready_inner();
        self.check_fatal(result)
    }

    fn drain_ready_inner(&mut self) -> Result<()> {
        match self.mode {
            UpdateMode::Poll => Ok(()),
            UpdateMode::PollHybrid => loop {
                let msg = {
                    let conn = match self.transport.as_mut() {
                        Some(Transport::Direct(conn)) => conn,
                        _ => return Ok(()),
                    };
                    conn.try_recv()?
                };
                match msg {
                    Some(Message::ValuePush { values }) => {
                        debug!(
                            "session {}: staged {} buffered values",
                            self.handle,
                            values.len()
                        );
                        self.pending.stage(values);
                    }
                    Some(other) => {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: "VALUE_PUSH".to_string(),
                            actual: other.kind().to_string(),
                        }
                        .into())
                    }
                    None => return Ok(()),
                }
            },
            UpdateMode::Signal => loop {
                let msg = match self.transport.as_mut() {
                    Some(Transport::Split { inbox, .. }) => match inbox.try_recv() {
                        Ok(msg) => msg,
                        Err(mpsc::TryRecvError::Empty) => return Ok(()),
                        Err(mpsc::TryRecvError::Disconnected) => {
                            return Err(ConnectionError::Closed.into())
                        }
                    },
                    _ => return Ok(()),
                };
                match msg {
                    Message::ValuePush { values } => self.pending.stage(values),
                    other => {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: "VALUE_PUSH".to_string(),
                            actual: other.kind().to_string(),
                        }
                        .into())
                    }
                }
            },
        }
    }

    /// Wait for an ACK/NACK, staging value batches that arrive in between.
    pub(crate) fn await_ack(&mut self, expected: &'static str) -> Result<u32> {
        loop {
            match self.recv_message()? {
                Message::Ack { code } => return Ok(code),
                Message::Nack { reason } => return Err(TuningError::Rejected { reason }),
                Message::ValuePush { values } => {
                    debug!(
                        "session {}: staging {} values received while awaiting {}",
                        self.handle,
                        values.len(),
                        expected
                    );
                    self.pending.stage(values);
                }
                other => {
                    let err = Err(ProtocolError::UnexpectedResponse {
                        expected: expected.to_string(),
                        actual: other.kind().to_string(),
                    }
                    .into());
                    return self.check_fatal(err);
                }
            }
        }
    }

    /// Wait for a value batch; the first one to arrive after the request is
    /// the reply.
    pub(crate) fn await_value_push(&mut self) -> Result<Vec<(String, TunableValue)>> {
        loop {
            match self.recv_message()? {
                Message::ValuePush { values } => return Ok(values),
                Message::Nack { reason } => return Err(TuningError::Rejected { reason }),
                other => {
                    let err = Err(ProtocolError::UnexpectedResponse {
                        expected: "VALUE_PUSH".to_string(),
                        actual: other.kind().to_string(),
                    }
                    .into());
                    return self.check_fatal(err);
                }
            }
        }
    }

    /// Register a tunable variable. The key is checked locally before the
    /// server exchange, so a duplicate never reaches the wire.
    pub fn add_variable(
        &mut self,
        bundle: &str,
        name: &str,
        ty: TunableType,
    ) -> Result<TunableCell> {
        self.ensure_active()?;
        self.bindings.check_can_register(bundle, name)?;
        self.send(&Message::RegisterVar {
            bundle: bundle.to_string(),
            name: name.to_string(),
            vtype: ty,
        })?;
        self.await_ack("ACK")?;
        debug!("session {}: registered {}.{} ({})", self.handle, bundle, name, ty);
        Ok(self.bindings.register(bundle, name, ty))
    }

    /// One-way push of a single variable's current value.
    pub fn set_variable(&mut self, cell: &TunableCell) -> Result<()> {
        self.ensure_active()?;
        let (name, value) = match self.bindings.find_cell(cell) {
            Some(binding) => (binding.name().to_string(), binding.cell().value()),
            None => return Err(UsageError::UnknownVariable(cell.name().to_string()).into()),
        };
        self.send(&Message::SetVar {
            name: name.clone(),
            value: value.clone(),
        })?;
        self.bindings.mark_sent(&name, &value);
        Ok(())
    }

    /// One-way batched push of every binding's current value, registration
    /// order.
    pub fn set_all(&mut self) -> Result<()> {
        self.ensure_active()?;
        let values = self.bindings.all_values();
        self.send(&Message::SetAll {
            values: values.clone(),
        })?;
        for (name, value) in &values {
            self.bindings.mark_sent(name, value);
        }
        Ok(())
    }

    /// Blocking barrier: push local state and wait for a complete fresh
    /// assignment.
    pub fn request_all(&mut self) -> Result<()> {
        barrier::request_all(self)
    }

    /// Fire-and-forget performance report. The first report fixes the
    /// session's metric kind; a later report of the other kind is rejected
    /// here, before anything is sent, and the session stays active.
    pub fn performance_update(&mut self, metric: MetricValue) -> Result<()> {
        self.ensure_active()?;
        if let Some(kind) = self.metric_kind {
            if kind != metric.kind() {
                return Err(ProtocolError::TypeMismatch {
                    variable: "performance metric".to_string(),
                    expected: kind,
                    actual: metric.kind(),
                }
                .into());
            }
        } else {
            self.metric_kind = Some(metric.kind());
        }
        self.bindings.seal();
        self.send(&Message::PerfUpdate { metric })?;
        debug!("session {}: performance reported", self.handle);
        Ok(())
    }

    /// Synchronous convergence query; does not touch binding storage.
    pub fn check_convergence(&mut self) -> Result<bool> {
        self.ensure_active()?;
        self.send(&Message::ConvergedQuery)?;
        Ok(self.await_ack("ACK")? != 0)
    }

    /// Snapshot of the server's best known configuration; live bindings are
    /// left untouched.
    pub fn best_configuration(&mut self) -> Result<HashMap<String, TunableValue>> {
        self.ensure_active()?;
        self.send(&Message::BestConfigQuery)?;
        Ok(self.await_value_push()?.into_iter().collect())
    }

    /// Look up a server-side configuration string.
    pub fn server_config(&mut self, key: &str) -> Result<Option<String>> {
        self.ensure_active()?;
        self.send(&Message::CfgQuery {
            key: key.to_string(),
        })?;
        loop {
            match self.recv_message()? {
                Message::CfgValue { value } => return Ok(value),
                Message::Nack { reason } => return Err(TuningError::Rejected { reason }),
                Message::ValuePush { values } => self.pending.stage(values),
                other => {
                    let err = Err(ProtocolError::UnexpectedResponse {
                        expected: "CFG_VALUE".to_string(),
                        actual: other.kind().to_string(),
                    }
                    .into());
                    return self.check_fatal(err);
                }
            }
        }
    }

    /// Number of staged (variable, value) pairs awaiting an apply.
    pub fn pending_update_count(&self) -> usize {
        self.pending.value_count()
    }

    /// Drain the staged batches into binding storage.
    pub fn apply_pending(&mut self) -> Result<usize> {
        self.ensure_active()?;
        dispatcher::apply_staged(self)
    }

    /// Close the session: best-effort END notice, socket and listener torn
    /// down, bindings released. Idempotent.
    pub fn end(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Failed => {
                self.state = SessionState::Closed;
                return Ok(());
            }
            _ => {}
        }
        self.state = SessionState::Closing;

        let best_effort = match self.transport.as_mut() {
            Some(Transport::Direct(conn)) => conn.send(&Message::End),
            // Skip the notice when the listener already saw the socket die
            Some(Transport::Split {
                writer, listener, ..
            }) if !listener.failed() => writer.send(&Message::End),
            _ => Ok(()),
        };
        if let Err(e) = best_effort {
            debug!("session {}: END notice not delivered: {}", self.handle, e);
        }

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.bindings = BindingTable::new();
        self.pending.clear();
        self.state = SessionState::Closed;
        info!("session {}: closed ({})", self.handle, self.address);
        Ok(())
    }
}
