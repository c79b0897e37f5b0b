//! Encoding and decoding of SSH Relay messages.
//!
//! All numbers are in network byte order (BE), and every message starts with a 2-byte tag:
//!
//! ```ascii
//! CONNECT_SUCCESS_SID     0: tag (u16)  2: sid length (u32)     6: sid (ASCII)
//! RECONNECT_SUCCESS_ACK   0: tag (u16)  2: ack (u64)
//! ACK                     0: tag (u16)  2: ack (u64)
//! DATA                    0: tag (u16)  2: payload length (u32) 6: payload
//! LONG_CLOSE              0: tag (u16)  2: close code (u32)     6: reason length (u32)  10: reason (UTF-8)
//! ```
//!
//! Arrays (sid, payload, reason) are limited to 16K by the protocol. DATA messages are the
//!  largest messages.

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::close_code::CloseCode;
use crate::error::RelayError;
use crate::util::buf_ext::{split_checked, BufExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const MAX_ARRAY_LENGTH: usize = 16 * 1024;

pub const TAG_LEN: usize = size_of::<u16>();

pub const DATA_HEADER_LEN: usize = TAG_LEN + size_of::<u32>();
pub const MAX_DATA_PAYLOAD_LEN: usize = MAX_ARRAY_LENGTH;

pub const ACK_MESSAGE_LEN: usize = TAG_LEN + size_of::<u64>();

pub const LONG_CLOSE_HEADER_LEN: usize = TAG_LEN + size_of::<u32>() + size_of::<u32>();

pub const MAX_MESSAGE_SIZE: usize = DATA_HEADER_LEN + MAX_ARRAY_LENGTH;
/// LONG_CLOSE has the biggest header, so this is the largest message the relay can send
pub const MAX_INBOUND_MESSAGE_SIZE: usize = LONG_CLOSE_HEADER_LEN + MAX_ARRAY_LENGTH;
pub const MIN_MESSAGE_SIZE: usize = 7;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MessageTag {
    ConnectSuccessSid = 1,
    ReconnectSuccessAck = 2,
    Deprecated = 3,
    Data = 4,
    LongClose = 5,
    Ack = 7,
}

/// Reads the raw tag without interpreting it, so that unknown tags can be logged and skipped.
pub fn peek_tag(buf: &[u8]) -> Result<u16, RelayError> {
    let mut buf = buf;
    buf.get_u16_checked()
}

/// A single relay message. Array fields borrow from the buffer they were decoded from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RelayMessage<'a> {
    ConnectSuccessSid { sid: String },
    ReconnectSuccessAck { ack: u64 },
    Ack { ack: u64 },
    Data { payload: &'a [u8] },
    LongClose { code: CloseCode, reason: String },
}

impl<'a> RelayMessage<'a> {
    pub fn tag(&self) -> MessageTag {
        match self {
            RelayMessage::ConnectSuccessSid { .. } => MessageTag::ConnectSuccessSid,
            RelayMessage::ReconnectSuccessAck { .. } => MessageTag::ReconnectSuccessAck,
            RelayMessage::Ack { .. } => MessageTag::Ack,
            RelayMessage::Data { .. } => MessageTag::Data,
            RelayMessage::LongClose { .. } => MessageTag::LongClose,
        }
    }

    /// Number of bytes this message occupies on the wire
    pub fn serialized_len(&self) -> usize {
        match self {
            RelayMessage::ConnectSuccessSid { sid } => DATA_HEADER_LEN + sid.len(),
            RelayMessage::ReconnectSuccessAck { .. } | RelayMessage::Ack { .. } => ACK_MESSAGE_LEN,
            RelayMessage::Data { payload } => DATA_HEADER_LEN + payload.len(),
            RelayMessage::LongClose { reason, .. } => LONG_CLOSE_HEADER_LEN + reason.len(),
        }
    }

    /// Appends the encoded message to `buf`. Fails without touching `buf` if a field is outside
    ///  the protocol's limits.
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), RelayError> {
        self.check_limits()?;

        buf.reserve(self.serialized_len());
        buf.put_u16(self.tag().into());
        match self {
            RelayMessage::ConnectSuccessSid { sid } => {
                buf.put_u32(sid.len().prechecked_cast());
                buf.put_slice(sid.as_bytes());
            }
            RelayMessage::ReconnectSuccessAck { ack } | RelayMessage::Ack { ack } => {
                buf.put_u64(*ack);
            }
            RelayMessage::Data { payload } => {
                buf.put_u32(payload.len().prechecked_cast());
                buf.put_slice(payload);
            }
            RelayMessage::LongClose { code, reason } => {
                buf.put_u32((*code).into());
                buf.put_u32(reason.len().prechecked_cast());
                buf.put_slice(reason.as_bytes());
            }
        }
        Ok(())
    }

    fn check_limits(&self) -> Result<(), RelayError> {
        match self {
            RelayMessage::ConnectSuccessSid { sid } => {
                if sid.is_empty() {
                    return Err(RelayError::invalid_argument("SID must not be empty"));
                }
                if !sid.is_ascii() {
                    return Err(RelayError::invalid_argument("SID must be ASCII"));
                }
                if sid.len() > MAX_ARRAY_LENGTH {
                    return Err(RelayError::invalid_argument(format!("SID must not exceed {} bytes", MAX_ARRAY_LENGTH)));
                }
            }
            RelayMessage::Data { payload } => {
                if payload.is_empty() {
                    return Err(RelayError::invalid_argument("At least 1 byte must be sent at once"));
                }
                if payload.len() > MAX_DATA_PAYLOAD_LEN {
                    return Err(RelayError::invalid_argument(format!("At most {} bytes can be sent at once", MAX_DATA_PAYLOAD_LEN)));
                }
            }
            RelayMessage::LongClose { reason, .. } => {
                if reason.len() > MAX_ARRAY_LENGTH {
                    return Err(RelayError::invalid_argument(format!("Reason must not exceed {} bytes", MAX_ARRAY_LENGTH)));
                }
            }
            RelayMessage::ReconnectSuccessAck { .. } | RelayMessage::Ack { .. } => {}
        }
        Ok(())
    }

    /// Decodes the message at the start of `buf`. Returns `None` for tags this client does not
    ///  know, which callers are expected to skip.
    ///
    /// A decoded message occupies exactly [RelayMessage::serialized_len] bytes; anything after
    ///  that is not looked at.
    pub fn deser(buf: &'a [u8]) -> Result<Option<RelayMessage<'a>>, RelayError> {
        let mut buf = buf;
        let raw_tag = buf.get_u16_checked()?;
        let tag = match MessageTag::try_from(raw_tag) {
            Ok(tag) => tag,
            Err(_) => return Ok(None),
        };

        let message = match tag {
            MessageTag::ConnectSuccessSid => {
                let len = Self::deser_array_len(&mut buf)?;
                let sid = split_checked(&mut buf, len)?;
                if !sid.is_ascii() {
                    return Err(RelayError::protocol_violation("The server sent a non-ASCII SID"));
                }
                RelayMessage::ConnectSuccessSid {
                    sid: String::from_utf8_lossy(sid).into_owned(),
                }
            }
            MessageTag::ReconnectSuccessAck => RelayMessage::ReconnectSuccessAck {
                ack: buf.get_u64_checked()?,
            },
            MessageTag::Ack => RelayMessage::Ack {
                ack: buf.get_u64_checked()?,
            },
            MessageTag::Data => {
                let len = Self::deser_array_len(&mut buf)?;
                if len == 0 {
                    return Err(RelayError::protocol_violation("The server sent an empty DATA message"));
                }
                RelayMessage::Data {
                    payload: split_checked(&mut buf, len)?,
                }
            }
            MessageTag::LongClose => {
                let code = CloseCode::from(buf.get_u32_checked()?);
                let len = Self::deser_array_len(&mut buf)?;
                let reason = split_checked(&mut buf, len)?;
                RelayMessage::LongClose {
                    code,
                    reason: String::from_utf8_lossy(reason).into_owned(),
                }
            }
            MessageTag::Deprecated => return Ok(None),
        };
        Ok(Some(message))
    }

    fn deser_array_len(buf: &mut &[u8]) -> Result<usize, RelayError> {
        let len: usize = buf.get_u32_checked()?.safe_cast();
        if len > MAX_ARRAY_LENGTH {
            return Err(RelayError::protocol_violation(format!("The server sent an array of {} bytes, exceeding the maximum of {}", len, MAX_ARRAY_LENGTH)));
        }
        Ok(len)
    }
}
