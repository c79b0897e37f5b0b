use anyhow::bail;

use crate::format::MAX_DATA_PAYLOAD_LEN;
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// When the relay closes the connection with a code that does not have a specific meaning,
    ///  the session disconnects and resumes the session on a new connection. This is the number
    ///  of times it does that for a single operation before giving up and reporting the close.
    pub max_reconnects: u32,

    /// The reader triggers an ACK once it has received more than this number of bytes since the
    ///  last ACK was sent. Writes carry pending ACKs anyway, so this matters only for
    ///  mostly-downstream traffic.
    ///
    /// The relay stops sending once it has too much unacknowledged data in flight, so this must
    ///  be well below the relay's limit.
    pub max_read_data_per_ack: u64,
}

impl RelayConfig {
    pub fn new() -> RelayConfig {
        RelayConfig {
            max_reconnects: 2,
            max_read_data_per_ack: 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_read_data_per_ack < MAX_DATA_PAYLOAD_LEN.safe_cast() {
            bail!("max_read_data_per_ack must be at least the size of a single DATA message ({} bytes)", MAX_DATA_PAYLOAD_LEN);
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::new()
    }
}
