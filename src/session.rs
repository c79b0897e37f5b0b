use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::close_code::{classify, CloseCode, CloseOutcome};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::format::{peek_tag, RelayMessage, MAX_INBOUND_MESSAGE_SIZE, TAG_LEN};
use crate::transport::{NetworkStream, SshRelayTarget};

/// Sequence counters of a session. They survive reconnects, and they are all measured in payload
///  bytes.
///
/// The writer side owns `bytes_sent` and `last_ack_sent`, the reader side owns `bytes_received`
///  and `last_ack_received` (which is also updated by the reconnect handshake). Either side may
///  read all of them.
#[derive(Debug, Default)]
pub struct SessionState {
    last_ack_received: AtomicU64,
    last_ack_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl SessionState {
    pub fn last_ack_received(&self) -> u64 {
        self.last_ack_received.load(Ordering::Acquire)
    }

    pub fn last_ack_sent(&self) -> u64 {
        self.last_ack_sent.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// The reader and the reconnect handshake can race, so this never moves the ack backwards
    pub(crate) fn advance_last_ack_received(&self, ack: u64) {
        self.last_ack_received.fetch_max(ack, Ordering::AcqRel);
    }

    /// ACKs are flushed both by writes and by the reader's flow control
    pub(crate) fn advance_last_ack_sent(&self, ack: u64) {
        self.last_ack_sent.fetch_max(ack, Ordering::AcqRel);
    }

    pub(crate) fn add_bytes_received(&self, delta: u64) {
        debug_assert!(delta > 0);
        self.bytes_received.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn add_bytes_sent(&self, delta: u64) {
        debug_assert!(delta > 0);
        self.bytes_sent.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AR: {} AS: {} TR: {} TX: {}",
               self.last_ack_received(),
               self.last_ack_sent(),
               self.bytes_received(),
               self.bytes_sent(),
        )
    }
}

/// Retransmits data the relay has not acknowledged yet. This is invoked exactly once after each
///  successful (re)connect handshake, before the new connection is handed out to readers and
///  writers.
#[async_trait]
pub trait ResendUnacknowledged: Send + Sync {
    async fn resend(&self, connection: &dyn NetworkStream, last_ack_received: u64) -> Result<(), RelayError>;
}

pub struct NoResend;

#[async_trait]
impl ResendUnacknowledged for NoResend {
    async fn resend(&self, _connection: &dyn NetworkStream, _last_ack_received: u64) -> Result<(), RelayError> {
        Ok(())
    }
}

/// An I/O operation on a connection. It may be run several times if the connection is lost and
///  re-established in between.
#[async_trait]
pub trait IoAction: Send {
    async fn run(&mut self, connection: &dyn NetworkStream) -> Result<usize, RelayError>;
}

/// A relay session spans a series of connections, resuming the session with a reconnect whenever
///  the relay drops the current connection.
pub struct RelaySession {
    target: Arc<dyn SshRelayTarget>,
    config: RelayConfig,
    /// the active connection; the lock also serializes connect and reconnect handshakes
    connection: Mutex<Option<Arc<dyn NetworkStream>>>,
    sid: OnceLock<String>,
    closed: AtomicBool,
    state: SessionState,
}

impl RelaySession {
    pub fn new(target: Arc<dyn SshRelayTarget>, config: RelayConfig) -> RelaySession {
        RelaySession {
            target,
            config,
            connection: Mutex::new(None),
            sid: OnceLock::new(),
            closed: AtomicBool::new(false),
            state: SessionState::default(),
        }
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.get().map(|s| s.as_str())
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn target(&self) -> &Arc<dyn SshRelayTarget> {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn get_connection(&self, resend: &dyn ResendUnacknowledged) -> Result<Arc<dyn NetworkStream>, RelayError> {
        let mut connection = self.connection.lock().await;

        if self.is_closed() {
            return Err(RelayError::ClientClosed);
        }
        if let Some(connection) = connection.as_ref() {
            return Ok(connection.clone());
        }

        // the connection is published only after the handshake completed, so a handshake that
        //  fails or is cancelled leaves the session disconnected
        let new_connection = match self.sid.get() {
            None => self.handshake_connect(resend).await?,
            Some(sid) => self.handshake_reconnect(sid, resend).await?,
        };
        *connection = Some(new_connection.clone());
        Ok(new_connection)
    }

    async fn handshake_connect(&self, resend: &dyn ResendUnacknowledged) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!("{}: establishing new connection", self);

        let connection = self.target.connect().await?;
        let mut buf = vec![0u8; MAX_INBOUND_MESSAGE_SIZE];
        loop {
            let bytes_read = self.read_handshake_message(connection.as_ref(), &mut buf).await?;
            let message = &buf[..bytes_read];

            let decoded = RelayMessage::deser(message)?;
            if let Some(decoded) = &decoded {
                debug_assert_eq!(decoded.serialized_len(), bytes_read);
            }

            match decoded {
                Some(RelayMessage::ConnectSuccessSid { sid }) => {
                    resend.resend(connection.as_ref(), self.state.last_ack_received()).await?;

                    // only one handshake can be in progress, and it is the only place that sets the sid
                    let first_sid = self.sid.set(sid).is_ok();
                    debug_assert!(first_sid, "the sid of a session is assigned only once");
                    debug!("{}: received CONNECT_SUCCESS_SID, connected", self);
                    return Ok(connection);
                }
                _ => {
                    let tag = peek_tag(message)?;
                    debug!("{}: ignoring message with tag {} while connecting", self, tag);
                }
            }
        }
    }

    async fn handshake_reconnect(&self, sid: &str, resend: &dyn ResendUnacknowledged) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!("{}: attempting reconnect with ack={}", self, self.state.bytes_received());

        let connection = self.target.reconnect(sid, self.state.bytes_received()).await?;
        let mut buf = vec![0u8; MAX_INBOUND_MESSAGE_SIZE];
        loop {
            let bytes_read = self.read_handshake_message(connection.as_ref(), &mut buf).await?;
            let message = &buf[..bytes_read];

            let decoded = RelayMessage::deser(message)?;
            if let Some(decoded) = &decoded {
                debug_assert_eq!(decoded.serialized_len(), bytes_read);
            }

            match decoded {
                Some(RelayMessage::ReconnectSuccessAck { ack }) => {
                    if ack > self.state.bytes_sent() {
                        return Err(RelayError::protocol_violation(format!(
                            "The server acknowledged {} bytes on reconnect, but only {} were sent", ack, self.state.bytes_sent())));
                    }
                    if ack < self.state.last_ack_received() {
                        return Err(RelayError::protocol_violation(format!(
                            "The server acknowledged {} bytes on reconnect after having acknowledged {} before", ack, self.state.last_ack_received())));
                    }
                    self.state.advance_last_ack_received(ack);

                    resend.resend(connection.as_ref(), ack).await?;

                    debug!("{}: received RECONNECT_SUCCESS_ACK, reconnected", self);
                    return Ok(connection);
                }
                Some(RelayMessage::ConnectSuccessSid { .. }) => {
                    return Err(RelayError::protocol_violation(
                        "The server sent an unexpected CONNECT_SUCCESS_SID message in response to a reconnect"));
                }
                _ => {
                    let tag = peek_tag(message)?;
                    debug!("{}: ignoring message with tag {} while reconnecting", self, tag);
                }
            }
        }
    }

    async fn read_handshake_message(&self, connection: &dyn NetworkStream, buf: &mut [u8]) -> Result<usize, RelayError> {
        let bytes_read = connection.read(buf).await?;
        if bytes_read == 0 {
            return Err(RelayError::server_closed(CloseCode::Normal, "The connection was closed by the server"));
        }
        if bytes_read < TAG_LEN {
            return Err(RelayError::protocol_violation("The server sent an incomplete message"));
        }
        Ok(bytes_read)
    }

    /// Runs `action` on a connected transport, connecting or reconnecting first if necessary.
    ///
    /// If the relay closes the connection with a code that does not have a specific meaning, the
    ///  session reconnects and runs the action again, up to [RelayConfig::max_reconnects] times.
    ///  A normal close is returned as `Ok(0)` unless `treat_normal_close_as_error` is set.
    pub async fn perform_io(&self, action: &mut (dyn IoAction + '_), resend: &dyn ResendUnacknowledged, treat_normal_close_as_error: bool) -> Result<usize, RelayError> {
        let mut attempt = 0;
        loop {
            let (result, used_connection) = match self.get_connection(resend).await {
                Ok(connection) => (action.run(connection.as_ref()).await, Some(connection)),
                Err(e) => (Err(e), None),
            };

            let (code, reason) = match result {
                Err(RelayError::ServerClosed { code, reason }) => (code, reason),
                Err(RelayError::ClientClosed) if !self.is_closed() && used_connection.is_some() => {
                    // the other side discarded the connection while this action was using it
                    if attempt >= self.config.max_reconnects {
                        return Err(RelayError::ClientClosed);
                    }
                    attempt += 1;
                    debug!("{}: connection was replaced while in use, retrying", self);
                    continue;
                }
                other => return other,
            };

            match classify(code) {
                CloseOutcome::Normal => {
                    debug!("{}: connection closed by the server: {} {}", self, code, reason);
                    return if treat_normal_close_as_error {
                        Err(RelayError::server_closed(code, reason))
                    }
                    else {
                        Ok(0)
                    };
                }
                CloseOutcome::Denied => {
                    error!("{}: connection closed by the server: {} {}", self, code, reason);
                    return Err(RelayError::Denied(format!("The server denied access: {}", reason)));
                }
                CloseOutcome::ReconnectFailed => {
                    error!("{}: connection closed by the server: {} {}", self, code, reason);
                    return Err(RelayError::ReconnectFailed(format!(
                        "The server closed the connection unexpectedly and reestablishing the connection failed: {}", reason)));
                }
                CloseOutcome::ConnectFailed => {
                    error!("{}: connection closed by the server: {} {}", self, code, reason);
                    return Err(RelayError::ConnectFailed(format!("The server could not connect to the backend: {}", reason)));
                }
                CloseOutcome::BackendNotFound => {
                    error!("{}: connection closed by the server: {} {}", self, code, reason);
                    return Err(RelayError::BackendNotFound("The backend could not be found".to_string()));
                }
                CloseOutcome::Retry => {
                    if attempt >= self.config.max_reconnects {
                        error!("{}: connection closed by the server: {} {} - failed to reconnect after {} attempts", self, code, reason, attempt);
                        return Err(RelayError::server_closed(code, reason));
                    }
                    attempt += 1;

                    debug!("{}: connection closed by the server: {} {} - attempting to reconnect", self, code, reason);
                    if let Some(used_connection) = used_connection {
                        self.discard(&used_connection).await;
                    }
                }
            }
        }
    }

    /// Drops `failed` if it is still the active connection. The other side (reader or writer) may
    ///  have replaced it in the meantime, and the replacement must stay.
    async fn discard(&self, failed: &Arc<dyn NetworkStream>) {
        let mut connection = self.connection.lock().await;
        let is_active = connection.as_ref()
            .map(|c| Arc::ptr_eq(c, failed))
            .unwrap_or(false);

        if is_active {
            if let Some(c) = connection.take() {
                self.close_quietly(c.as_ref()).await;
            }
            debug!("{}: disconnected", self);
        }
        else {
            trace!("{}: failed connection was replaced already", self);
        }
    }

    /// Closes and drops the active connection, if any. The session keeps its SID and counters, so
    ///  the next I/O operation reconnects.
    pub async fn disconnect(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(c) = connection.take() {
            self.close_quietly(c.as_ref()).await;
        }
        debug!("{}: disconnected", self);
    }

    async fn close_quietly(&self, connection: &dyn NetworkStream) {
        if let Err(e) = connection.close().await {
            error!("{}: error closing connection: {}", self, e);
        }
    }

    /// Closes the session for good: subsequent I/O fails with [RelayError::ClientClosed]
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.disconnect().await;
    }
}

impl Display for RelaySession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.sid() {
            Some(sid) => write!(f, "[RelaySession {} {}]", sid.chars().take(10).collect::<String>(), self.state),
            None => write!(f, "[RelaySession (unknown) {}]", self.state),
        }
    }
}
