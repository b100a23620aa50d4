//! Mesh links to remote participants.
//!
//! [`PeerManager`] owns one entry per remote participant and runs the
//! `absent -> negotiating -> connected -> closed` state machine. The
//! underlying WebRTC-style stack sits behind [`PeerTransport`] /
//! [`PeerLink`]; its errors are triaged once by [`classify`].

mod election;
mod error;
mod loopback;
mod manager;
mod transport;
mod types;

#[cfg(test)]
mod tests;

pub use election::should_initiate;
pub use error::{classify, LinkError, LinkErrorKind, Severity};
pub use loopback::LoopbackNetwork;
pub use manager::PeerManager;
pub use transport::{LinkEvent, LinkEventSender, LinkNotice, LinkParams, PeerLink, PeerTransport};
pub use types::{CloseReason, EnsureOutcome, IceConnectionState, PeerInfo, PeerState, Role};
