use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, trace};

use crate::close_code::CloseCode;
use crate::error::RelayError;
use crate::transport::NetworkStream;

/// Opens a WebSocket connection. A proxy or the relay refusing the upgrade with 403 or 407 is
///  reported as [RelayError::ConnectionDenied].
pub async fn connect(request: Request) -> Result<WebSocketStream, RelayError> {
    let uri = request.uri().clone();
    trace!("opening WebSocket connection to {}", uri);

    match tokio_tungstenite::connect_async(request).await {
        Ok((ws_stream, response)) => {
            debug!("WebSocket connection to {} established: {}", uri, response.status());
            Ok(WebSocketStream::new(ws_stream))
        }
        Err(tungstenite::Error::Http(response))
        if response.status() == StatusCode::FORBIDDEN || response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            Err(RelayError::ConnectionDenied(format!("{} refused the WebSocket upgrade: {}", uri, response.status())))
        }
        Err(e) => Err(RelayError::Transport(format!("WebSocket connection to {} failed: {}", uri, e))),
    }
}

/// A [NetworkStream] on top of a WebSocket, with one relay message per binary frame.
///
/// The halves are locked separately, so a read and a write can be in progress at the same time.
pub struct WebSocketStream<S = MaybeTlsStream<TcpStream>> {
    sink: Mutex<SplitSink<tokio_tungstenite::WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<tokio_tungstenite::WebSocketStream<S>>>,
    closed_by_client: AtomicBool,
    /// Set when the server closed the connection. The first read after a normal close reports
    ///  end of stream, everything after that fails.
    closed_by_server: std::sync::Mutex<Option<(CloseCode, String)>>,
}

impl<S> WebSocketStream<S>
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    pub fn new(ws_stream: tokio_tungstenite::WebSocketStream<S>) -> WebSocketStream<S> {
        let (sink, stream) = ws_stream.split();
        WebSocketStream {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed_by_client: AtomicBool::new(false),
            closed_by_server: std::sync::Mutex::new(None),
        }
    }

    fn check_open(&self) -> Result<(), RelayError> {
        if self.closed_by_client.load(Ordering::Acquire) {
            return Err(RelayError::ClientClosed);
        }
        if let Some((code, reason)) = self.server_close() {
            return Err(RelayError::server_closed(code, reason));
        }
        Ok(())
    }

    fn server_close(&self) -> Option<(CloseCode, String)> {
        match self.closed_by_server.lock() {
            Ok(closed) => closed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn on_server_close(&self, code: CloseCode, reason: String) -> Result<usize, RelayError> {
        debug!("WebSocket closed by server: {} {}", code, reason);
        match self.closed_by_server.lock() {
            Ok(mut closed) => *closed = Some((code, reason.clone())),
            Err(poisoned) => *poisoned.into_inner() = Some((code, reason.clone())),
        }

        if code == CloseCode::Normal {
            Ok(0)
        }
        else {
            Err(RelayError::server_closed(code, reason))
        }
    }

    fn map_error(&self, e: tungstenite::Error) -> RelayError {
        if self.closed_by_client.load(Ordering::Acquire) {
            return RelayError::ClientClosed;
        }

        let aborted = match &e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
            tungstenite::Error::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => true,
            tungstenite::Error::Io(io) => matches!(io.kind(),
                ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof),
            _ => false,
        };

        if aborted {
            // an aborted connection looks like a normal close, except that it is never end-of-stream
            let reason = format!("The connection was aborted: {}", e);
            let _ = self.on_server_close(CloseCode::Normal, reason.clone());
            RelayError::server_closed(CloseCode::Normal, reason)
        }
        else {
            RelayError::Transport(e.to_string())
        }
    }

    fn copy_frame(frame: &[u8], buf: &mut [u8]) -> Result<usize, RelayError> {
        if frame.len() > buf.len() {
            return Err(RelayError::protocol_violation(format!("Received a message of {} bytes, which exceeds the buffer size of {}", frame.len(), buf.len())));
        }
        buf[..frame.len()].copy_from_slice(frame);
        Ok(frame.len())
    }
}

#[async_trait]
impl<S> NetworkStream for WebSocketStream<S>
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        self.check_open()?;

        let mut stream = self.stream.lock().await;
        loop {
            let next = stream.next().await;
            if self.closed_by_client.load(Ordering::Acquire) {
                return Err(RelayError::ClientClosed);
            }

            match next {
                Some(Ok(Message::Binary(data))) => return Self::copy_frame(&data, buf),
                Some(Ok(Message::Text(text))) => return Self::copy_frame(text.as_bytes(), buf),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) if frame.code != WsCloseCode::Status => (CloseCode::from(u16::from(frame.code)), frame.reason.to_string()),
                        _ => (CloseCode::Normal, String::new()),
                    };
                    return self.on_server_close(code, reason);
                }
                Some(Err(e)) => return Err(self.map_error(e)),
                None => return self.on_server_close(CloseCode::Normal, "The connection was closed by the server".to_string()),
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), RelayError> {
        self.check_open()?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(buf.to_vec())).await
            .map_err(|e| self.map_error(e))
    }

    async fn close(&self) -> Result<(), RelayError> {
        if self.closed_by_client.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        let close_frame = CloseFrame {
            code: WsCloseCode::Normal,
            reason: "".into(),
        };
        match sink.send(Message::Close(Some(close_frame))).await {
            Ok(()) => Ok(()),
            // the server closed the connection first
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(tungstenite::Error::Protocol(tungstenite::error::ProtocolError::SendAfterClosing)) => Ok(()),
            Err(e) => Err(RelayError::Transport(e.to_string())),
        }
    }
}
