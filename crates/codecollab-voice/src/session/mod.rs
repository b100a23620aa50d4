//! One participant's voice session in one room.
//!
//! [`VoiceSession::start`] acquires the microphone, subscribes to the
//! mailbox, starts the heartbeat and spawns a driver task that owns all
//! voice state. The returned [`VoiceHandle`] talks to that task.

mod client;
mod driver;
mod types;


pub use client::{VoiceHandle, VoiceSession};
pub(crate) use types::emit;
pub use types::{FrameSource, SessionConfig, VoiceEvent};
