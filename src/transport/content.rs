//! Message content model and rich-content extraction.
//!
//! Response payloads may wrap a structured rich-content block between
//! `<content>` markers inside an HTML-entity-encoded string. Decoding
//! happens before marker extraction, and an unterminated marker is treated
//! as a partial block rather than a parse failure so that streamed payloads
//! render progressively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opening marker of an embedded rich-content block.
pub const CONTENT_OPEN: &str = "<content>";
/// Closing marker of an embedded rich-content block.
pub const CONTENT_CLOSE: &str = "</content>";

/// Author of a committed message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Committed message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text with no embedded rich-content block.
    Plain { text: String },
    /// Structured payload handled opaquely by the SDK and rendered only by
    /// presentation collaborators.
    Rich { payload: String },
}

impl MessageContent {
    /// Returns the textual body regardless of content kind.
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Plain { text } => text,
            MessageContent::Rich { payload } => payload,
        }
    }
}

/// One committed conversation message. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Builds a locally authored user message with a fresh id.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: MessageContent::Plain { text: text.into() },
            timestamp: Utc::now(),
        }
    }

    /// Builds an assistant message from an already-parsed body.
    pub fn assistant(id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of decoding one raw payload string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedContent {
    /// No marker present; the full decoded string is plain text.
    Plain(String),
    /// A rich-content block was found. `complete` is false when the closing
    /// marker has not arrived yet (mid-stream).
    Rich { payload: String, complete: bool },
}

impl ParsedContent {
    /// Collapses into a committed message body. Partial blocks keep the
    /// extracted inner text.
    pub fn into_message_content(self) -> MessageContent {
        match self {
            ParsedContent::Plain(text) => MessageContent::Plain { text },
            ParsedContent::Rich { payload, .. } => MessageContent::Rich { payload },
        }
    }
}

/// Decodes HTML entities, then extracts an embedded rich-content block.
pub fn parse_content(raw: &str) -> ParsedContent {
    let decoded = html_escape::decode_html_entities(raw);

    let Some(start) = decoded.find(CONTENT_OPEN) else {
        return ParsedContent::Plain(decoded.into_owned());
    };

    let inner = &decoded[start + CONTENT_OPEN.len()..];
    match inner.find(CONTENT_CLOSE) {
        Some(end) => ParsedContent::Rich {
            payload: inner[..end].to_string(),
            complete: true,
        },
        None => ParsedContent::Rich {
            payload: inner.to_string(),
            complete: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_without_marker_falls_back() {
        assert_eq!(
            parse_content("just a reply"),
            ParsedContent::Plain("just a reply".to_string())
        );
    }

    #[test]
    fn entities_are_decoded_before_fallback() {
        assert_eq!(
            parse_content("a &amp; b"),
            ParsedContent::Plain("a & b".to_string())
        );
    }

    #[test]
    fn complete_block_is_extracted() {
        assert_eq!(
            parse_content("&lt;content&gt;{\"card\":1}&lt;/content&gt;"),
            ParsedContent::Rich {
                payload: "{\"card\":1}".to_string(),
                complete: true,
            }
        );
    }

    #[test]
    fn unterminated_block_yields_partial_extraction() {
        assert_eq!(
            parse_content("&lt;content&gt;partial"),
            ParsedContent::Rich {
                payload: "partial".to_string(),
                complete: false,
            }
        );
    }

    #[test]
    fn text_before_marker_is_discarded_from_payload() {
        assert_eq!(
            parse_content("preamble&lt;content&gt;inner&lt;/content&gt;"),
            ParsedContent::Rich {
                payload: "inner".to_string(),
                complete: true,
            }
        );
    }

    #[test]
    fn parsed_content_collapses_partial_into_rich_body() {
        let content = parse_content("&lt;content&gt;half").into_message_content();
        assert_eq!(
            content,
            MessageContent::Rich {
                payload: "half".to_string()
            }
        );
    }
}
