use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::error::RelayError;

/// A message-oriented connection to the relay. Every `read` returns exactly one complete
///  message, every `write` sends exactly one.
///
/// This is an abstraction over the WebSocket, introduced to facilitate replacing the I/O part for
///  testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkStream: Send + Sync + 'static {
    /// Reads the next message into `buf` and returns its length.
    ///
    /// `Ok(0)` means the relay closed the connection normally. Any other close is reported as
    ///  [RelayError::ServerClosed].
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayError>;

    async fn write(&self, buf: &[u8]) -> Result<(), RelayError>;

    async fn close(&self) -> Result<(), RelayError>;
}

/// Opens connections to one specific relay endpoint, either for a new session or to resume an
///  existing one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SshRelayTarget: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError>;

    /// `ack` is the number of bytes received from the relay so far, i.e. the point to resume from
    async fn reconnect(&self, sid: &str, ack: u64) -> Result<Arc<dyn NetworkStream>, RelayError>;

    fn is_mutual_tls_enabled(&self) -> bool;
}
