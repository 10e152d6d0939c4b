//! Realtime message-channel modules.
//!
//! - `client`: websocket transport, outbound queue, and reconnect handling.
//! - `proto`: wire frames shared with the chat backend.
//! - `content`: message content model and rich-content extraction.
//! - `aggregate`: reassembly of streamed partial responses into messages.

/// Streaming-response aggregation keyed by message id.
pub mod aggregate;
/// Websocket connection, command sender, and transport events.
pub mod client;
/// Message content model and rich-content marker parsing.
pub mod content;
/// Message-channel wire frames.
pub mod proto;
