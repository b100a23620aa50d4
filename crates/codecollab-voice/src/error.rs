//! Top-level error type for the voice subsystem.

use codecollab_common::CodeCollabError;

use crate::media::MediaError;
use crate::peer::LinkError;
use crate::signaling::SignalingError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("voice session has shut down")]
    SessionClosed,
}

impl From<VoiceError> for CodeCollabError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Store(e) => CodeCollabError::Store(e.to_string()),
            other => CodeCollabError::Voice(other.to_string()),
        }
    }
}
