//! External collaborator interfaces the core consumes/supplies (`spec.md`
//! §1, §6). The physical link driver itself is out of scope; this module
//! only defines the narrow capability traits following the teacher crate's
//! use of `async-trait` at similar boundaries (e.g. `nyx-transport`'s
//! transport adapters).

use async_trait::async_trait;

/// Consumed by the engine to push frames onto the physical link and query
/// channel/link liveness.
#[async_trait]
pub trait LinkInterface: Send + Sync {
    /// Send a raw wire frame on `channel`. Returns `false` if the link
    /// rejected the send (e.g. channel blacklisted at the driver level).
    async fn send_frame(&self, channel: u8, bytes: &[u8]) -> bool;

    fn is_channel_up(&self, channel: u8) -> bool;

    async fn start(&self);

    async fn stop(&self);
}

/// Supplied by the engine's `Rx` to the link driver.
#[async_trait]
pub trait LinkCallback: Send + Sync {
    async fn handle_frame(&self, arq: bool, channel: u8, data: &[u8]);

    async fn handle_buffer_empty(&self, channel: u8);

    async fn handle_link_status(&self, link_up: bool);
}
