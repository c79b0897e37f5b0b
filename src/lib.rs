pub mod close_code;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod session;
pub mod stream;
pub mod transport;
pub mod util;
pub mod websocket;

#[cfg(test)] mod test_util;

pub use close_code::CloseCode;
pub use config::RelayConfig;
pub use error::RelayError;
pub use stream::RelayStream;
pub use transport::{NetworkStream, SshRelayTarget};
