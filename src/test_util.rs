//! In-memory stand-ins for the relay connection, for tests that need a scripted conversation
//!  rather than individual mock expectations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};

use crate::close_code::CloseCode;
use crate::error::RelayError;
use crate::format::RelayMessage;
use crate::transport::{NetworkStream, SshRelayTarget};

#[derive(Debug)]
pub enum ScriptedRead {
    Message(Vec<u8>),
    /// the relay closes the connection; NORMAL is reported as a zero-length read
    Close(CloseCode, String),
}

/// A message as written by the client, decoded for easy assertions
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Written {
    Ack(u64),
    Data(Vec<u8>),
    Other(Vec<u8>),
}

impl Written {
    pub fn decode(raw: &[u8]) -> Written {
        match RelayMessage::deser(raw) {
            Ok(Some(RelayMessage::Ack { ack })) => Written::Ack(ack),
            Ok(Some(RelayMessage::Data { payload })) => Written::Data(payload.to_vec()),
            _ => Written::Other(raw.to_vec()),
        }
    }
}

pub fn encode(message: &RelayMessage) -> Vec<u8> {
    let mut buf = BytesMut::new();
    message.ser(&mut buf).unwrap();
    buf.to_vec()
}

/// A write that is held back until the test releases it
pub struct HeldWrite {
    /// fires once the write is waiting
    pub arrived: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
}

/// A connection whose reads are fed by the test. A read with nothing scripted waits for the next
///  scripted message, like a real connection would.
pub struct ScriptedStream {
    sender: mpsc::UnboundedSender<ScriptedRead>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedRead>>,
    server_closed: Mutex<Option<(CloseCode, String)>>,
    written: Mutex<Vec<Vec<u8>>>,
    write_failures: Mutex<VecDeque<RelayError>>,
    held_writes: Mutex<VecDeque<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    closed: AtomicBool,
}

impl ScriptedStream {
    pub fn new() -> Arc<ScriptedStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(ScriptedStream {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            server_closed: Default::default(),
            written: Default::default(),
            write_failures: Default::default(),
            held_writes: Default::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, message: RelayMessage) -> &Self {
        self.push_raw(encode(&message))
    }

    pub fn push_raw(&self, raw: Vec<u8>) -> &Self {
        self.sender.send(ScriptedRead::Message(raw)).unwrap();
        self
    }

    pub fn push_close(&self, code: CloseCode) -> &Self {
        self.sender.send(ScriptedRead::Close(code, format!("closed with {}", code))).unwrap();
        self
    }

    /// The next write fails with the given error instead of being recorded
    pub fn fail_next_write(&self, error: RelayError) {
        self.write_failures.lock().unwrap().push_back(error);
    }

    /// The next write waits until the returned [HeldWrite] is released
    pub fn hold_next_write(&self) -> HeldWrite {
        let (arrived_sender, arrived) = oneshot::channel();
        let (release, release_receiver) = oneshot::channel();
        self.held_writes.lock().unwrap().push_back((arrived_sender, release_receiver));
        HeldWrite { arrived, release }
    }

    pub fn written_raw(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<Written> {
        self.written.lock().unwrap().iter()
            .map(|raw| Written::decode(raw))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ClientClosed);
        }
        if let Some((code, reason)) = self.server_closed.lock().unwrap().clone() {
            return Err(RelayError::server_closed(code, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkStream for ScriptedStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        self.check_open()?;

        let next = self.receiver.lock().await.recv().await;
        match next {
            Some(ScriptedRead::Message(raw)) => {
                assert!(raw.len() <= buf.len(), "scripted message does not fit the read buffer");
                buf[..raw.len()].copy_from_slice(&raw);
                Ok(raw.len())
            }
            Some(ScriptedRead::Close(CloseCode::Normal, reason)) => {
                *self.server_closed.lock().unwrap() = Some((CloseCode::Normal, reason));
                Ok(0)
            }
            Some(ScriptedRead::Close(code, reason)) => {
                *self.server_closed.lock().unwrap() = Some((code, reason.clone()));
                Err(RelayError::server_closed(code, reason))
            }
            None => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), RelayError> {
        self.check_open()?;

        let held = self.held_writes.lock().unwrap().pop_front();
        if let Some((arrived, release)) = held {
            let _ = arrived.send(());
            let _ = release.await;
        }

        if let Some(e) = self.write_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.written.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Hands out pre-scripted connections, in order, to both `connect` and `reconnect`
pub struct ScriptedTarget {
    connections: Mutex<VecDeque<Arc<ScriptedStream>>>,
    connect_calls: AtomicUsize,
    reconnect_calls: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTarget {
    pub fn new(connections: Vec<Arc<ScriptedStream>>) -> Arc<ScriptedTarget> {
        Arc::new(ScriptedTarget {
            connections: Mutex::new(connections.into()),
            connect_calls: AtomicUsize::new(0),
            reconnect_calls: Default::default(),
        })
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Acquire)
    }

    pub fn reconnect_calls(&self) -> Vec<(String, u64)> {
        self.reconnect_calls.lock().unwrap().clone()
    }

    fn next_connection(&self) -> Result<Arc<dyn NetworkStream>, RelayError> {
        match self.connections.lock().unwrap().pop_front() {
            Some(connection) => Ok(connection),
            None => Err(RelayError::Transport("no more scripted connections".to_string())),
        }
    }
}

#[async_trait]
impl SshRelayTarget for ScriptedTarget {
    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError> {
        self.connect_calls.fetch_add(1, Ordering::AcqRel);
        self.next_connection()
    }

    async fn reconnect(&self, sid: &str, ack: u64) -> Result<Arc<dyn NetworkStream>, RelayError> {
        self.reconnect_calls.lock().unwrap().push((sid.to_string(), ack));
        self.next_connection()
    }

    fn is_mutual_tls_enabled(&self) -> bool {
        false
    }
}
