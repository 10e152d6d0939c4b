use serde::{Deserialize, Serialize};

/// Frames sent by the client over the message channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Plain chat message typed by the user.
    Chat {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        id: String,
    },
    /// Structured UI action bridged back into the conversation.
    #[serde(rename = "c1_action")]
    Action {
        prompt: ActionPrompt,
        #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(rename = "responseId")]
        response_id: String,
    },
}

/// Prompt payload carried by an action bridge frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionPrompt {
    pub content: String,
}

/// Frames received from the chat backend over the message channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Channel handshake acknowledgement, optionally carrying a
    /// backend-assigned thread id.
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    /// Complete (non-streamed) assistant response.
    Response {
        content: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_over: Option<bool>,
    },
    /// Assistant response produced during a voice exchange. Voice-over is
    /// implied; otherwise identical to `response`.
    VoiceResponse { content: String, id: String },
    /// Transcription of the user's speech.
    UserTranscription {
        content: String,
        #[serde(rename = "final", default)]
        is_final: bool,
    },
    /// Streaming chunk of an in-progress assistant response.
    #[serde(rename = "c1_token")]
    C1Token { id: String, content: String },
    /// Terminal marker ending the stream for one message id.
    ChatDone { id: String },
    /// The backend entered its slow secondary content-generation phase.
    EnhancementStarted,
    /// Backend-reported error.
    Error { code: String, message: String },
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
