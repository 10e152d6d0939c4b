//! Reassembly of streamed partial responses into committed messages.
//!
//! The aggregator tracks at most one open stream per transport session,
//! keyed by message id. It is order-tolerant: duplicate terminal markers
//! and terminals without an open session are ignored, and a chunk for a
//! different id supersedes the open session instead of erroring, which
//! tolerates backend restarts mid-response.

use crate::transport::content::{parse_content, Message};

/// Streaming state transitions produced by one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// First chunk for a message id opened a stream.
    Started { message_id: String },
    /// A chunk was appended to the open stream.
    Chunk {
        message_id: String,
        delta: String,
        total: String,
    },
    /// The open stream was finalized into a committed message.
    Finalized { message: Message },
    /// Stream state for the id was cleared.
    Done { message_id: String },
}

#[derive(Debug)]
struct OpenStream {
    message_id: String,
    buffer: String,
}

/// Accumulates partial token frames into complete messages.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    open: Option<OpenStream>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the currently open stream, if any.
    pub fn open_message_id(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.message_id.as_str())
    }

    /// Applies one streaming chunk and returns the resulting updates.
    ///
    /// A chunk for a different id than the open stream silently discards
    /// the previous partial buffer and starts a new stream.
    pub fn apply_chunk(&mut self, message_id: &str, delta: &str) -> Vec<StreamUpdate> {
        let mut updates = Vec::with_capacity(2);

        let matches_open = self
            .open
            .as_ref()
            .is_some_and(|open| open.message_id == message_id);

        if !matches_open {
            if let Some(superseded) = self.open.take() {
                tracing::debug!(
                    event = "stream_superseded",
                    superseded_id = %superseded.message_id,
                    new_id = %message_id,
                );
            }
            self.open = Some(OpenStream {
                message_id: message_id.to_string(),
                buffer: String::new(),
            });
            updates.push(StreamUpdate::Started {
                message_id: message_id.to_string(),
            });
        }

        let open = self.open.as_mut().expect("stream opened above");
        open.buffer.push_str(delta);
        updates.push(StreamUpdate::Chunk {
            message_id: message_id.to_string(),
            delta: delta.to_string(),
            total: open.buffer.clone(),
        });

        updates
    }

    /// Finalizes the open stream for `message_id`.
    ///
    /// Returns no updates when no stream is open for that id, so duplicate
    /// terminal markers are harmless.
    pub fn finish(&mut self, message_id: &str) -> Vec<StreamUpdate> {
        let matches_open = self
            .open
            .as_ref()
            .is_some_and(|open| open.message_id == message_id);
        if !matches_open {
            return Vec::new();
        }

        let open = self.open.take().expect("checked above");
        let content = parse_content(&open.buffer).into_message_content();
        let message = Message::assistant(open.message_id.clone(), content);

        vec![
            StreamUpdate::Finalized { message },
            StreamUpdate::Done {
                message_id: open.message_id,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::content::MessageContent;

    fn finalized_message(updates: &[StreamUpdate]) -> &Message {
        updates
            .iter()
            .find_map(|update| match update {
                StreamUpdate::Finalized { message } => Some(message),
                _ => None,
            })
            .expect("finalized update")
    }

    #[test]
    fn chunks_then_terminal_produce_one_message() {
        let mut aggregator = StreamAggregator::new();

        let first = aggregator.apply_chunk("m-1", "hel");
        assert_eq!(
            first[0],
            StreamUpdate::Started {
                message_id: "m-1".to_string()
            }
        );
        assert_eq!(
            first[1],
            StreamUpdate::Chunk {
                message_id: "m-1".to_string(),
                delta: "hel".to_string(),
                total: "hel".to_string(),
            }
        );

        let second = aggregator.apply_chunk("m-1", "lo");
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0],
            StreamUpdate::Chunk {
                message_id: "m-1".to_string(),
                delta: "lo".to_string(),
                total: "hello".to_string(),
            }
        );

        let done = aggregator.finish("m-1");
        assert_eq!(done.len(), 2);
        let message = finalized_message(&done);
        assert_eq!(message.id, "m-1");
        assert_eq!(
            message.content,
            MessageContent::Plain {
                text: "hello".to_string()
            }
        );
        assert_eq!(
            done[1],
            StreamUpdate::Done {
                message_id: "m-1".to_string()
            }
        );
        assert!(aggregator.open_message_id().is_none());
    }

    #[test]
    fn finalize_applies_content_decoding() {
        let mut aggregator = StreamAggregator::new();
        aggregator.apply_chunk("m-2", "&lt;content&gt;{\"a\":");
        aggregator.apply_chunk("m-2", "1}&lt;/content&gt;");

        let done = aggregator.finish("m-2");
        assert_eq!(
            finalized_message(&done).content,
            MessageContent::Rich {
                payload: "{\"a\":1}".to_string()
            }
        );
    }

    #[test]
    fn new_id_supersedes_open_stream_without_error() {
        let mut aggregator = StreamAggregator::new();
        aggregator.apply_chunk("m-old", "discarded partial");

        let updates = aggregator.apply_chunk("m-new", "fresh");
        assert_eq!(
            updates[0],
            StreamUpdate::Started {
                message_id: "m-new".to_string()
            }
        );
        // The superseded buffer is never delivered as a finalized message.
        assert!(updates
            .iter()
            .all(|update| !matches!(update, StreamUpdate::Finalized { .. })));
        assert_eq!(aggregator.open_message_id(), Some("m-new"));

        // A late terminal for the superseded id is ignored.
        assert!(aggregator.finish("m-old").is_empty());

        let done = aggregator.finish("m-new");
        assert_eq!(finalized_message(&done).content.text(), "fresh");
    }

    #[test]
    fn duplicate_terminal_is_a_no_op() {
        let mut aggregator = StreamAggregator::new();
        aggregator.apply_chunk("m-3", "body");
        assert_eq!(aggregator.finish("m-3").len(), 2);
        assert!(aggregator.finish("m-3").is_empty());
    }

    #[test]
    fn terminal_without_open_stream_is_tolerated() {
        let mut aggregator = StreamAggregator::new();
        assert!(aggregator.finish("never-started").is_empty());
    }
}
