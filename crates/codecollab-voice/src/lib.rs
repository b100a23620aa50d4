//! Peer-to-peer voice chat for CodeCollab rooms.
//!
//! Every participant keeps one direct link to every other participant
//! (a mesh). Links are negotiated through per-participant mailboxes in a
//! shared realtime key-value store, so no dedicated signaling server is
//! needed. The pieces:
//!
//! - [`media`]: microphone capture, muting and speech-activity metering.
//! - [`signaling`]: mailbox-based delivery of offers, answers and candidates.
//! - [`peer`]: per-peer link lifecycle, initiator election and error triage.
//! - [`heartbeat`]: liveness records consumed by room membership.
//! - [`session`]: the driver that ties the above together for one room.

pub mod error;
pub mod heartbeat;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod realtime;
pub mod session;
pub mod signaling;
pub mod speaking;
pub mod store;

pub use error::VoiceError;
pub use heartbeat::{read_heartbeats, stale_participants, Heartbeat};
pub use media::{
    AudioAnalyser, AudioConstraints, AudioTrack, LevelMeter, LocalMedia, MediaDevices, MediaError,
    MediaStream, SyntheticDevices, SyntheticMicrophone,
};
pub use peer::{
    classify, should_initiate, CloseReason, EnsureOutcome, IceConnectionState, LinkError,
    LinkErrorKind, LinkEvent, LinkEventSender, LinkNotice, LinkParams, LoopbackNetwork, PeerInfo,
    PeerLink, PeerManager, PeerState, PeerTransport, Role, Severity,
};
pub use protocol::{SignalEnvelope, SignalKind, SignalPayload};
pub use realtime::{
    ClientFrame, RealtimeConfig, RealtimeEvent, RealtimeStore, ReplyStatus, ServerFrame, StoreOp,
};
pub use session::{FrameSource, SessionConfig, VoiceEvent, VoiceHandle, VoiceSession};
pub use signaling::{MailboxChannel, SignalingChannel, SignalingError};
pub use speaking::SpeakingState;
pub use store::{ChildEvent, KvStore, MemoryStore, StoreError, StoreSubscription};
