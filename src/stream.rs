use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::format::{RelayMessage, ACK_MESSAGE_LEN, DATA_HEADER_LEN, MAX_DATA_PAYLOAD_LEN, MAX_INBOUND_MESSAGE_SIZE, TAG_LEN};
use crate::session::{IoAction, NoResend, RelaySession, ResendUnacknowledged};
use crate::transport::{NetworkStream, SshRelayTarget};
use crate::util::safe_converter::SafeCast;

pub const MAX_WRITE_SIZE: usize = MAX_DATA_PAYLOAD_LEN;

/// A read buffer must be able to hold the biggest possible DATA payload
pub const MIN_READ_SIZE: usize = MAX_DATA_PAYLOAD_LEN;

/// A DATA message that was sent but not acknowledged by the relay yet
#[derive(Debug, Clone)]
struct UnackedWrite {
    /// the complete encoded message, ready to be retransmitted as-is
    data: Bytes,
    sequence_number: u64,
    expected_ack: u64,
}

/// A reliable byte stream on top of a relay session. Data that was written is kept until the
///  relay acknowledges it, and retransmitted after a reconnect.
///
/// There can be one reader and one writer at any given time, and they can operate concurrently.
pub struct RelayStream {
    session: RelaySession,
    /// ordered by sequence number
    unacknowledged: Mutex<VecDeque<UnackedWrite>>,
    /// serializes caller writes with the reader's ACK flushes, keeping the sent ACKs in order
    write_lock: Mutex<()>,
    /// a flow-control ACK that failed after its DATA was delivered; reported by subsequent reads
    read_failure: Mutex<Option<RelayError>>,
}

impl RelayStream {
    pub fn new(target: Arc<dyn SshRelayTarget>) -> RelayStream {
        RelayStream::create(target, RelayConfig::new())
    }

    pub fn with_config(target: Arc<dyn SshRelayTarget>, config: RelayConfig) -> anyhow::Result<RelayStream> {
        config.validate()?;
        Ok(RelayStream::create(target, config))
    }

    fn create(target: Arc<dyn SshRelayTarget>, config: RelayConfig) -> RelayStream {
        RelayStream {
            session: RelaySession::new(target, config),
            unacknowledged: Default::default(),
            write_lock: Default::default(),
            read_failure: Default::default(),
        }
    }

    pub fn sid(&self) -> Option<&str> {
        self.session.sid()
    }

    pub fn session(&self) -> &RelaySession {
        &self.session
    }

    /// Sends `data` as a single DATA message, preceded by an ACK if there is received data that
    ///  was not acknowledged yet. An empty `data` only flushes the pending ACK.
    pub async fn write(&self, data: &[u8]) -> Result<(), RelayError> {
        if data.len() > MAX_WRITE_SIZE {
            return Err(RelayError::invalid_argument(format!("Write buffer too large ({}), must be at most {}", data.len(), MAX_WRITE_SIZE)));
        }

        let _write_guard = self.write_lock.lock().await;

        let mut action = WriteAction {
            stream: self,
            data,
            enqueued: false,
        };
        self.session.perform_io(&mut action, self, true).await?;
        Ok(())
    }

    /// Reads the payload of the next DATA message into `buf`, returning its length. `Ok(0)` means
    ///  the relay ended the stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < MIN_READ_SIZE {
            return Err(RelayError::invalid_argument(format!("Read buffer too small ({}), must be at least {}", buf.len(), MIN_READ_SIZE)));
        }
        if let Some(e) = self.read_failure.lock().await.clone() {
            return Err(e);
        }

        let mut action = ReadAction {
            stream: self,
            buffer: buf,
            message: vec![0u8; MAX_INBOUND_MESSAGE_SIZE],
        };
        self.session.perform_io(&mut action, self, false).await
    }

    /// Closes the stream for good. Pending and subsequent operations fail with
    ///  [RelayError::ClientClosed].
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Establishes a connection to check that the relay accepts the session, then closes the
    ///  stream.
    pub async fn probe(&self, timeout: Duration) -> Result<(), RelayError> {
        let probe = async {
            self.session.perform_io(&mut ProbeAction, &NoResend, true).await?;
            self.close().await;
            Ok(())
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{}: probe timed out after {:?}", self, timeout);
                Err(RelayError::Timeout("The server did not respond within the allotted time".to_string()))
            }
        }
    }

    async fn on_ack(&self, ack: u64) -> Result<(), RelayError> {
        let state = self.session.state();
        if ack == 0 {
            return Err(RelayError::protocol_violation("The server sent an invalid zero-ack"));
        }
        if ack > state.bytes_sent() {
            return Err(RelayError::protocol_violation(format!("The server sent a mismatched ack: {} with {} bytes sent", ack, state.bytes_sent())));
        }
        if ack < state.last_ack_received() {
            return Err(RelayError::protocol_violation(format!("The server sent ack {} after ack {}", ack, state.last_ack_received())));
        }

        state.advance_last_ack_received(ack);

        let mut unacknowledged = self.unacknowledged.lock().await;
        while unacknowledged.front().map(|w| w.expected_ack <= ack).unwrap_or(false) {
            unacknowledged.pop_front();
        }

        trace!("{}: received ACK #{}", self, ack);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn expected_ack(&self) -> u64 {
        self.unacknowledged.lock().await
            .back()
            .map(|w| w.expected_ack)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) async fn unacknowledged_count(&self) -> usize {
        self.unacknowledged.lock().await.len()
    }
}

#[async_trait]
impl ResendUnacknowledged for RelayStream {
    async fn resend(&self, connection: &dyn NetworkStream, last_ack_received: u64) -> Result<(), RelayError> {
        let mut unacknowledged = self.unacknowledged.lock().await;

        // entries stay queued until they are acknowledged, so that they survive another reconnect
        unacknowledged.retain(|w| w.expected_ack > last_ack_received);
        for write in unacknowledged.iter() {
            trace!("{}: resending DATA #{}", self, write.sequence_number);
            connection.write(&write.data).await?;
        }
        Ok(())
    }
}

impl Display for RelayStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.session)
    }
}

struct WriteAction<'a> {
    stream: &'a RelayStream,
    data: &'a [u8],
    /// Set once the DATA message is queued. If the connection breaks after that, the message is
    ///  retransmitted by the reconnect, so a retry must not send it again.
    enqueued: bool,
}

#[async_trait]
impl IoAction for WriteAction<'_> {
    async fn run(&mut self, connection: &dyn NetworkStream) -> Result<usize, RelayError> {
        let state = self.stream.session.state();

        let bytes_to_ack = state.bytes_received();
        if state.last_ack_sent() < bytes_to_ack {
            let mut buf = BytesMut::with_capacity(ACK_MESSAGE_LEN);
            RelayMessage::Ack { ack: bytes_to_ack }.ser(&mut buf)?;

            trace!("{}: sending ACK #{}", self.stream, bytes_to_ack);
            connection.write(&buf).await?;
            state.advance_last_ack_sent(bytes_to_ack);
        }

        if self.data.is_empty() || self.enqueued {
            return Ok(0);
        }

        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.data.len());
        RelayMessage::Data { payload: self.data }.ser(&mut buf)?;
        let message = buf.freeze();

        let sequence_number = state.bytes_sent();
        let payload_len: u64 = self.data.len().safe_cast();
        state.add_bytes_sent(payload_len);
        self.stream.unacknowledged.lock().await.push_back(UnackedWrite {
            data: message.clone(),
            sequence_number,
            expected_ack: sequence_number + payload_len,
        });
        self.enqueued = true;

        trace!("{}: sending DATA #{}", self.stream, sequence_number);
        connection.write(&message).await?;
        Ok(0)
    }
}

struct ReadAction<'a> {
    stream: &'a RelayStream,
    buffer: &'a mut [u8],
    message: Vec<u8>,
}

#[async_trait]
impl IoAction for ReadAction<'_> {
    async fn run(&mut self, connection: &dyn NetworkStream) -> Result<usize, RelayError> {
        let state = self.stream.session.state();

        loop {
            let bytes_read = connection.read(&mut self.message).await?;
            if bytes_read == 0 {
                return Ok(0);
            }
            if bytes_read < TAG_LEN {
                return Err(RelayError::protocol_violation("The server sent an incomplete message"));
            }

            match RelayMessage::deser(&self.message[..bytes_read])? {
                Some(RelayMessage::Data { payload }) => {
                    debug_assert_eq!(DATA_HEADER_LEN + payload.len(), bytes_read);

                    let data_len = payload.len();
                    self.buffer[..data_len].copy_from_slice(payload);
                    state.add_bytes_received(data_len.safe_cast());
                    trace!("{}: received DATA message ({} bytes)", self.stream, data_len);

                    if state.bytes_received() - state.last_ack_sent() > self.stream.session.config().max_read_data_per_ack {
                        // the data is consumed already, so the failure is reported by the next read
                        if let Err(e) = self.stream.write(&[]).await {
                            error!("{}: sending ACK failed: {}", self.stream, e);
                            *self.stream.read_failure.lock().await = Some(e);
                        }
                    }
                    return Ok(data_len);
                }
                Some(RelayMessage::Ack { ack }) => {
                    self.stream.on_ack(ack).await?;
                }
                Some(RelayMessage::LongClose { code, reason }) => {
                    debug!("{}: ignoring LONG_CLOSE {} {}", self.stream, code, reason);
                }
                other => {
                    debug!("{}: ignoring unexpected message {:?}", self.stream, other);
                }
            }
        }
    }
}

struct ProbeAction;

#[async_trait]
impl IoAction for ProbeAction {
    async fn run(&mut self, _connection: &dyn NetworkStream) -> Result<usize, RelayError> {
        Ok(0)
    }
}
