//! Command channel abstraction.
//!
//! Callers above the session layer (bulk refresh, control execution) talk to
//! a broker through this trait instead of a concrete [`Session`]. Correlation
//! of a request with its reply lives behind [`CommandChannel::request`], so a
//! request-id based scheme can replace the command-type matching without
//! touching callers.
//!
//! [`Session`]: crate::Session

use std::time::Duration;

use wlink_core::Partition;

use crate::protocol::Envelope;

#[trait_variant::make(CommandChannel: Send)]
pub trait LocalCommandChannel {
    /// Partition this channel talks to.
    fn partition(&self) -> Partition;

    /// Fire-and-forget send. Returns `false` if the frame was dropped
    /// because the channel is not connected and open.
    fn send_command(&self, envelope: &Envelope) -> bool;

    /// Send `envelope` and wait up to `timeout` for the next envelope whose
    /// command is `response_command`.
    ///
    /// Returns `None` on timeout or if the send was refused.
    async fn request(
        &self,
        envelope: &Envelope,
        response_command: &str,
        timeout: Duration,
    ) -> Option<Envelope>;
}
