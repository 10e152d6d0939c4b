//! Voice channel modules.
//!
//! - `port`: injected media access and local peer endpoint.
//! - `signaling`: HTTP offer/answer exchange with the voice backend.
//!
//! Voice negotiation is driven by the transport session: it acquires media
//! through the [`port::MediaPort`], posts the local offer to the configured
//! endpoint, applies the answer, and opens the turn-taking side channel.
//! Failures reset voice state to disconnected and are never retried
//! automatically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Media access and local peer endpoint abstraction.
pub mod port;
/// Offer/answer signaling client.
pub mod signaling;

/// Lifecycle of the optional audio channel, independent of the message
/// channel's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors produced by voice negotiation and the audio side channel.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The user or platform denied media access.
    #[error("media access denied: {0}")]
    MediaAccess(String),

    /// No voice offer endpoint was configured for this session.
    #[error("voice is not configured for this session")]
    NotConfigured,

    /// The signaling request could not be sent or read.
    #[error("signaling request failed: {0}")]
    Signaling(#[from] reqwest::Error),

    /// The offer endpoint answered with a non-success status.
    #[error("offer endpoint returned {status}: {body}")]
    SignalingStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The peer negotiation itself failed after signaling.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Turn-taking and transcript events carried by the voice side channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum TurnFrame {
    #[serde(rename = "user-stopped-speaking")]
    UserStoppedSpeaking,
    #[serde(rename = "bot-started-speaking")]
    BotStartedSpeaking,
    #[serde(rename = "user_transcription")]
    UserTranscription(TranscriptionData),
}

/// Transcript payload carried by a side-channel transcription event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptionData {
    pub content: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}
