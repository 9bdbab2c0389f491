//! Application callback interface (`spec.md` §1, §6). The local IPC
//! front-end that would implement this is out of scope; the engine only
//! sees this abstract trait.

use crate::codes::S3tpErrorCode;
use async_trait::async_trait;

/// A control notification pushed to the application side, independent of
/// any particular port's data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// A previously blocked resource (queue slot, channel) is available
    /// again; the caller may retry the operation that failed.
    Available,
    Error(S3tpErrorCode),
}

#[async_trait]
pub trait ApplicationCallback: Send + Sync {
    async fn on_connected(&self, port: u8);

    async fn on_disconnected(&self, port: u8);

    async fn on_message(&self, port: u8, bytes: Vec<u8>);

    async fn send_control_message(&self, msg: ControlMessage);
}
