//! Link error triage.

use super::types::IceConnectionState;

/// Structured cause of a link error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// A description was applied in the wrong signaling state (renegotiation race).
    InvalidState,
    /// A signal reached a link that was already destroyed.
    SignalAfterDestroy,
    /// A recoverable ICE hiccup (candidate or consent failure).
    IceTransient,
    IceFailed,
    NegotiationFailed,
    ConnectionFailed,
    MediaFailed,
    Other,
}

impl LinkErrorKind {
    /// Map a stack error message to a kind. Adapters call this once at
    /// the boundary; nothing else matches on message text.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("invalidstateerror")
            || msg.contains("wrong state")
            || msg.contains("in state stable")
            || msg.contains("have-local-offer")
        {
            LinkErrorKind::InvalidState
        } else if msg.contains("destroyed") || msg.contains("after destroy") {
            LinkErrorKind::SignalAfterDestroy
        } else if msg.contains("ice connection failed") || msg.contains("ice failed") {
            LinkErrorKind::IceFailed
        } else if has_word(&msg, &["ice", "stun", "turn"]) {
            LinkErrorKind::IceTransient
        } else if msg.contains("connection failed") {
            LinkErrorKind::ConnectionFailed
        } else if msg.contains("sdp") || msg.contains("negotiat") {
            LinkErrorKind::NegotiationFailed
        } else if msg.contains("track") || msg.contains("media") {
            LinkErrorKind::MediaFailed
        } else {
            LinkErrorKind::Other
        }
    }
}

fn has_word(msg: &str, words: &[&str]) -> bool {
    msg.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| words.contains(&w))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
}

impl LinkError {
    pub fn new(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build from a bare message string.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: LinkErrorKind::from_message(&message),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and keep the link.
    Benign,
    /// Tear the link down.
    Fatal,
}

/// Decide whether `err` ends the link, given the link's current ICE state.
pub fn classify(err: &LinkError, ice: IceConnectionState) -> Severity {
    match err.kind {
        LinkErrorKind::InvalidState | LinkErrorKind::SignalAfterDestroy => Severity::Benign,
        LinkErrorKind::IceTransient if ice.is_healthy() => Severity::Benign,
        _ => Severity::Fatal,
    }
}
