use std::fmt::{Display, Formatter};

use num_enum::{FromPrimitive, IntoPrimitive};

/// WebSocket close codes used by the relay. Values are defined by the relay service; codes
///  this client does not know are kept as [CloseCode::Other].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum CloseCode {
    Normal = 1000,
    ErrorUnknown = 4000,
    SidUnknown = 4001,
    SidInUse = 4002,
    FailedToConnectToBackend = 4003,
    ReauthenticationRequired = 4004,
    BadAck = 4005,
    InvalidAck = 4006,
    InvalidWebsocketOpcode = 4007,
    InvalidTag = 4008,
    DestinationWriteFailed = 4009,
    DestinationReadFailed = 4010,
    InvalidData = 4013,
    NotAuthorized = 4033,
    LookupFailed = 4047,
    LookupFailedReconnect = 4051,
    FailedToRewind = 4074,
    #[num_enum(catch_all)]
    Other(u32),
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let raw: u32 = (*self).into();
        match self {
            CloseCode::Other(_) => write!(f, "{}", raw),
            known => write!(f, "{:?} ({})", known, raw),
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        CloseCode::from(u32::from(value))
    }
}

/// What the session does when the relay closes the connection with a given code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseOutcome {
    /// Regular end of the stream, or the backend closed its side
    Normal,
    Denied,
    ReconnectFailed,
    ConnectFailed,
    BackendNotFound,
    /// Disconnect and try again with a reconnect
    Retry,
}

pub fn classify(code: CloseCode) -> CloseOutcome {
    match code {
        // DESTINATION_*_FAILED means the backend closed the connection rather than the relay
        CloseCode::Normal
        | CloseCode::DestinationReadFailed
        | CloseCode::DestinationWriteFailed => CloseOutcome::Normal,

        CloseCode::NotAuthorized => CloseOutcome::Denied,

        CloseCode::FailedToRewind
        | CloseCode::SidUnknown
        | CloseCode::SidInUse => CloseOutcome::ReconnectFailed,

        CloseCode::FailedToConnectToBackend => CloseOutcome::ConnectFailed,

        CloseCode::LookupFailed
        | CloseCode::LookupFailedReconnect => CloseOutcome::BackendNotFound,

        _ => CloseOutcome::Retry,
    }
}
