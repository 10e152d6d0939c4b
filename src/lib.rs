//! Client-side session SDK for the ChatKit realtime conversational backend.
//!
//! The crate is organized by transport surface:
//! - `transport`: realtime message-channel client, wire protocol, and
//!   streaming-response aggregation.
//! - `voice`: offer/answer voice negotiation and the turn-taking side
//!   channel, behind an injected media port.
//! - `controller`: observable session state bound to one transport session.
//! - `threads`: multi-thread conversation state with debounced persistence.
//! - `retry`: bounded reconnect policy shared by transport workers.

/// Observable session controller bound to one transport session.
pub mod controller;
/// Reconnect policy and attempt tracking.
pub mod retry;
/// Conversation thread store, storage port, and persisted record.
pub mod threads;
/// Realtime message-channel client, protocol types, and stream aggregation.
pub mod transport;
/// Voice negotiation, media port, and turn-taking events.
pub mod voice;
