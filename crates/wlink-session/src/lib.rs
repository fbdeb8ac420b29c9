//! # wlink-session - Broker Sessions
//!
//! WebSocket sessions against the device broker: envelope codec, login and
//! heartbeat cycle, reconnect handling, and command-type response correlation.
//!
//! Depends on [`wlink_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Protocol
//! - [`Envelope`] - `{cmd, data}` wire message with builders for each request
//! - [`classify()`] - Sort an inbound envelope into push kinds
//!
//! ### Sessions
//! - [`Session`] - One socket's connect / login / heartbeat / reconnect cycle
//! - [`SessionPair`] - Sandbox and production sessions with client ref counting
//! - [`SessionEvent`] - Pushes and lifecycle changes reported to the owner
//!
//! ### Correlation
//! - [`ResponseBus`] - Single-slot broadcast of inbound envelopes
//! - [`CommandChannel`] - Send/request seam used by the layers above

pub mod bus;
pub mod channel;
pub mod pair;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use bus::{PendingResponse, ResponseBus};
pub use channel::{CommandChannel, LocalCommandChannel};
pub use pair::SessionPair;
pub use protocol::{
    classify, cmd, BrokerMessage, DeviceNotification, Envelope, LoginResponse, OnlineStatus,
    NORMAL_CLOSURE,
};
pub use session::{Session, SessionEvent, SessionState, SessionTiming};
