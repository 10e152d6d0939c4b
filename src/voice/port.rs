//! Injected media access and local peer endpoint.
//!
//! The SDK never touches audio devices or codecs directly. A host embeds it
//! with a [`MediaPort`] implementation that acquires the microphone, builds
//! the local peer endpoint, and completes negotiation once the remote
//! answer arrives. Tests use a scripted port.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::voice::{TurnFrame, VoiceError};

/// One side of the offer/answer exchange, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "offer".to_string(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "answer".to_string(),
        }
    }
}

/// Opaque handle to the negotiated remote audio stream.
///
/// Presentation collaborators attach playback to it; the SDK only tracks
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStream {
    id: String,
}

impl AudioStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Live audio link returned once negotiation completes.
#[derive(Debug)]
pub struct VoiceLink {
    /// Remote audio stream handle.
    pub audio: AudioStream,
    /// Side data channel carrying turn-taking and transcript events.
    pub turn_events: mpsc::UnboundedReceiver<TurnFrame>,
}

/// Local peer endpoint prepared by the media port.
pub trait MediaEndpoint: Send {
    /// Local offer produced when the endpoint was opened.
    fn local_offer(&self) -> SessionDescription;

    /// Applies the remote answer and opens the side data channel.
    fn accept_answer(
        &mut self,
        answer: SessionDescription,
    ) -> BoxFuture<'_, Result<VoiceLink, VoiceError>>;

    /// Tears down local media tracks and the peer connection. Must be safe
    /// to call more than once.
    fn close(&mut self);
}

/// Host-provided media integration.
pub trait MediaPort: Send + Sync + 'static {
    /// Requests media access and prepares a local peer endpoint.
    ///
    /// Permission denial surfaces as [`VoiceError::MediaAccess`].
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn MediaEndpoint>, VoiceError>>;
}
