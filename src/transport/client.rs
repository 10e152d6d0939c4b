//! Low-level message-channel client and session commands.
//!
//! The session owns one websocket connection and at most one negotiated
//! audio channel. A background worker owns the socket, drains an outbound
//! queue, reassembles streamed responses, and handles bounded reconnects on
//! unexpected closes. Consumers subscribe to one typed event stream.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use uuid::Uuid;

use crate::retry::{ReconnectPolicy, ReconnectTracker};
use crate::transport::aggregate::{StreamAggregator, StreamUpdate};
use crate::transport::content::{parse_content, Message};
use crate::transport::proto::{ActionPrompt, ClientFrame, ServerFrame};
use crate::voice::port::{AudioStream, MediaEndpoint, MediaPort, VoiceLink};
use crate::voice::signaling::SignalingClient;
use crate::voice::{TurnFrame, VoiceError, VoiceState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Recoverable failures surfaced through the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Channel-level failure; the reconnect policy may recover it.
    Transport(String),
    /// Voice negotiation failure; voice state has been reset.
    Voice(String),
    /// Error frame reported by the backend.
    Backend { code: String, message: String },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(message) => write!(f, "transport error: {message}"),
            SessionError::Voice(message) => write!(f, "voice error: {message}"),
            SessionError::Backend { code, message } => {
                write!(f, "backend error {code}: {message}")
            }
        }
    }
}

/// Typed events emitted by one transport session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    VoiceStateChanged(VoiceState),
    /// The backend assigned a thread id during the channel handshake.
    ThreadAssigned(String),
    MessageReceived {
        message: Message,
        voice_over: bool,
    },
    StreamingStarted {
        message_id: String,
    },
    StreamingChunk {
        message_id: String,
        delta: String,
        total: String,
    },
    StreamingDone {
        message_id: String,
    },
    /// The backend entered its slow secondary content-generation phase.
    EnhancementStarted,
    /// Transcription of the user's speech, from either channel.
    UserTranscription {
        content: String,
        is_final: bool,
    },
    /// Side-channel turn-taking: the user stopped speaking.
    UserStoppedSpeaking,
    /// Side-channel turn-taking: the assistant started speaking.
    BotStartedSpeaking,
    /// The negotiated remote audio stream became available.
    AudioStream(AudioStream),
    Error(SessionError),
}

/// Errors returned synchronously by session commands.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// A command required an open channel and none was open.
    #[error("message channel is not connected")]
    NotConnected,

    /// Outbound command queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,
}

/// Endpoint and policy configuration for one transport session.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Websocket endpoint for the message channel.
    pub channel_url: String,
    /// HTTP endpoint for the voice offer/answer exchange, when voice is
    /// available at all.
    pub voice_offer_url: Option<String>,
    /// Api key sent as an `x-api-key` header on both channels.
    pub api_key: Option<SecretString>,
    /// Reconnect policy for unexpected closes of the message channel.
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(channel_url: impl Into<String>) -> Self {
        Self {
            channel_url: channel_url.into(),
            voice_offer_url: None,
            api_key: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_voice_offer_url(mut self, url: impl Into<String>) -> Self {
        self.voice_offer_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// True when both channel endpoints match. Session identity is bound to
    /// this pair.
    pub fn same_endpoints(&self, other: &Self) -> bool {
        self.channel_url == other.channel_url && self.voice_offer_url == other.voice_offer_url
    }
}

enum WorkerCommand {
    Frame(ClientFrame),
    Shutdown,
}

enum VoicePhase {
    Idle,
    Negotiating { cancel: bool },
    Connected { endpoint: Box<dyn MediaEndpoint> },
}

/// One client session owning the message channel and the optional audio
/// channel. Never shared across controllers except by explicit reuse.
pub struct TransportSession {
    config: TransportConfig,
    media: Arc<dyn MediaPort>,
    events: broadcast::Sender<TransportEvent>,
    conn_state: Arc<Mutex<ConnectionState>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WorkerCommand>>>,
    voice: Arc<Mutex<VoicePhase>>,
}

impl TransportSession {
    pub fn new(config: TransportConfig, media: Arc<dyn MediaPort>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            media,
            events,
            conn_state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outbound: Mutex::new(None),
            voice: Arc::new(Mutex::new(VoicePhase::Idle)),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Subscribes to the session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.conn_state.lock().expect("connection state lock")
    }

    pub fn voice_state(&self) -> VoiceState {
        match &*self.voice.lock().expect("voice lock") {
            VoicePhase::Idle => VoiceState::Disconnected,
            VoicePhase::Negotiating { .. } => VoiceState::Connecting,
            VoicePhase::Connected { .. } => VoiceState::Connected,
        }
    }

    /// Opens the message channel. No-op while a worker is already
    /// connecting or connected. Must be called within a tokio runtime.
    pub fn connect(&self) {
        let mut outbound = self.outbound.lock().expect("outbound lock");
        if outbound.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *outbound = Some(tx);
        set_connection_state(&self.conn_state, &self.events, ConnectionState::Connecting);

        let ctx = WorkerContext {
            url: self.config.channel_url.clone(),
            api_key: self.config.api_key.clone(),
            policy: self.config.reconnect.clone(),
            events: self.events.clone(),
            conn_state: Arc::clone(&self.conn_state),
        };
        tokio::spawn(channel_worker(ctx, rx));
    }

    /// Closes both channels and suppresses further reconnection.
    ///
    /// A disconnect requested while the socket is still opening is deferred
    /// until it opens, then the close is issued.
    pub fn disconnect(&self) {
        self.disconnect_voice();

        let taken = self.outbound.lock().expect("outbound lock").take();
        match taken {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.send(WorkerCommand::Shutdown);
            }
            _ => {
                set_connection_state(
                    &self.conn_state,
                    &self.events,
                    ConnectionState::Disconnected,
                );
            }
        }
    }

    /// Sends a chat message on the open channel.
    ///
    /// Returns the locally generated message id synchronously.
    pub fn send(
        &self,
        text: impl Into<String>,
        thread_id: Option<&str>,
    ) -> Result<String, TransportError> {
        let id = Uuid::new_v4().to_string();
        let frame = ClientFrame::Chat {
            message: text.into(),
            thread_id: thread_id.map(str::to_string),
            id: id.clone(),
        };
        self.enqueue(frame)?;
        Ok(id)
    }

    /// Sends a structured UI action on the open channel.
    ///
    /// Returns the locally generated response id synchronously.
    pub fn send_action(
        &self,
        content: impl Into<String>,
        thread_id: Option<&str>,
    ) -> Result<String, TransportError> {
        let response_id = Uuid::new_v4().to_string();
        let frame = ClientFrame::Action {
            prompt: ActionPrompt {
                content: content.into(),
            },
            thread_id: thread_id.map(str::to_string),
            response_id: response_id.clone(),
        };
        self.enqueue(frame)?;
        Ok(response_id)
    }

    fn enqueue(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outbound = self.outbound.lock().expect("outbound lock");
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(WorkerCommand::Frame(frame))
            .map_err(|_| TransportError::SendQueueClosed)
    }

    /// Negotiates the audio channel: media access, offer/answer exchange,
    /// and the turn-taking side channel.
    ///
    /// Any failure emits an error event and resets voice state to
    /// disconnected; voice is never left connecting indefinitely and is
    /// never retried automatically.
    pub async fn connect_voice(&self) -> Result<(), VoiceError> {
        {
            let mut phase = self.voice.lock().expect("voice lock");
            match *phase {
                VoicePhase::Negotiating { .. } | VoicePhase::Connected { .. } => return Ok(()),
                VoicePhase::Idle => *phase = VoicePhase::Negotiating { cancel: false },
            }
        }
        self.emit(TransportEvent::VoiceStateChanged(VoiceState::Connecting));

        let result = self.negotiate().await;

        let mut phase = self.voice.lock().expect("voice lock");
        let cancel_requested = matches!(*phase, VoicePhase::Negotiating { cancel: true });
        match result {
            Ok((mut endpoint, link)) => {
                if cancel_requested {
                    // Teardown was requested mid-negotiation and deferred
                    // until the in-flight exchange settled.
                    endpoint.close();
                    *phase = VoicePhase::Idle;
                    drop(phase);
                    self.emit(TransportEvent::VoiceStateChanged(VoiceState::Disconnected));
                    return Ok(());
                }

                spawn_turn_pump(self.events.clone(), link.turn_events);
                *phase = VoicePhase::Connected { endpoint };
                drop(phase);
                self.emit(TransportEvent::AudioStream(link.audio));
                self.emit(TransportEvent::VoiceStateChanged(VoiceState::Connected));
                Ok(())
            }
            Err(err) => {
                *phase = VoicePhase::Idle;
                drop(phase);
                self.emit(TransportEvent::Error(SessionError::Voice(err.to_string())));
                self.emit(TransportEvent::VoiceStateChanged(VoiceState::Disconnected));
                Err(err)
            }
        }
    }

    /// Tears down the audio channel. Safe to call repeatedly.
    ///
    /// Requested mid-negotiation, teardown is deferred until the in-flight
    /// negotiation settles so media resources are never left dangling.
    pub fn disconnect_voice(&self) {
        let mut phase = self.voice.lock().expect("voice lock");
        match &mut *phase {
            VoicePhase::Idle => {}
            VoicePhase::Negotiating { cancel } => *cancel = true,
            VoicePhase::Connected { endpoint } => {
                endpoint.close();
                *phase = VoicePhase::Idle;
                drop(phase);
                self.emit(TransportEvent::VoiceStateChanged(VoiceState::Disconnected));
            }
        }
    }

    async fn negotiate(&self) -> Result<(Box<dyn MediaEndpoint>, VoiceLink), VoiceError> {
        let offer_url = self
            .config
            .voice_offer_url
            .clone()
            .ok_or(VoiceError::NotConfigured)?;
        let signaling = SignalingClient::new(offer_url, self.config.api_key.clone())?;

        let mut endpoint = self.media.open().await?;
        let offer = endpoint.local_offer();
        let answer = match signaling.exchange(&offer).await {
            Ok(answer) => answer,
            Err(err) => {
                endpoint.close();
                return Err(err);
            }
        };
        match endpoint.accept_answer(answer).await {
            Ok(link) => Ok((endpoint, link)),
            Err(err) => {
                endpoint.close();
                Err(err)
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn spawn_turn_pump(
    events: broadcast::Sender<TransportEvent>,
    mut turn_events: mpsc::UnboundedReceiver<TurnFrame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = turn_events.recv().await {
            let event = match frame {
                TurnFrame::UserStoppedSpeaking => TransportEvent::UserStoppedSpeaking,
                TurnFrame::BotStartedSpeaking => TransportEvent::BotStartedSpeaking,
                TurnFrame::UserTranscription(data) => TransportEvent::UserTranscription {
                    content: data.content,
                    is_final: data.is_final,
                },
            };
            let _ = events.send(event);
        }
    });
}

fn set_connection_state(
    conn_state: &Arc<Mutex<ConnectionState>>,
    events: &broadcast::Sender<TransportEvent>,
    next: ConnectionState,
) {
    let mut state = conn_state.lock().expect("connection state lock");
    if *state == next {
        return;
    }
    *state = next;
    drop(state);
    let _ = events.send(TransportEvent::StateChanged(next));
}

struct WorkerContext {
    url: String,
    api_key: Option<SecretString>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<TransportEvent>,
    conn_state: Arc<Mutex<ConnectionState>>,
}

enum SessionOutcome {
    Shutdown,
    Reconnect,
}

async fn channel_worker(ctx: WorkerContext, mut outbound_rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut tracker = ctx.policy.tracker();
    let mut aggregator = StreamAggregator::new();
    let mut pending = VecDeque::new();

    loop {
        set_connection_state(&ctx.conn_state, &ctx.events, ConnectionState::Connecting);

        match run_channel_session(&ctx, &mut outbound_rx, &mut aggregator, &mut pending, &mut tracker)
            .await
        {
            Ok(SessionOutcome::Shutdown) => {
                set_connection_state(
                    &ctx.conn_state,
                    &ctx.events,
                    ConnectionState::Disconnected,
                );
                return;
            }
            Ok(SessionOutcome::Reconnect) => {
                set_connection_state(&ctx.conn_state, &ctx.events, ConnectionState::Error);
                let _ = ctx.events.send(TransportEvent::Error(SessionError::Transport(
                    "message channel closed unexpectedly".to_string(),
                )));
            }
            Err(err) => {
                set_connection_state(&ctx.conn_state, &ctx.events, ConnectionState::Error);
                let _ = ctx
                    .events
                    .send(TransportEvent::Error(SessionError::Transport(err.to_string())));
            }
        }

        match tracker.next_delay() {
            Some(delay) => {
                if !collect_commands_during_delay(delay, &mut outbound_rx, &mut pending).await {
                    set_connection_state(
                        &ctx.conn_state,
                        &ctx.events,
                        ConnectionState::Disconnected,
                    );
                    return;
                }
            }
            // Exhausted: stop silently, the last error event is the only
            // surface. The session stays in the error state until the
            // caller reconnects explicitly.
            None => return,
        }
    }
}

async fn run_channel_session(
    ctx: &WorkerContext,
    outbound_rx: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    aggregator: &mut StreamAggregator,
    pending: &mut VecDeque<ClientFrame>,
    tracker: &mut ReconnectTracker,
) -> Result<SessionOutcome, TransportError> {
    let mut request = ctx.url.clone().into_client_request()?;
    if let Some(api_key) = &ctx.api_key {
        let header = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header);
    }

    let (mut socket, _) = connect_async(request).await?;

    tracker.reset();
    set_connection_state(&ctx.conn_state, &ctx.events, ConnectionState::Connected);

    while let Some(frame) = pending.pop_front() {
        if send_client_frame(&mut socket, &frame).await.is_err() {
            pending.push_front(frame);
            return Ok(SessionOutcome::Reconnect);
        }
    }

    loop {
        tokio::select! {
            maybe_command = outbound_rx.recv() => {
                match maybe_command {
                    Some(WorkerCommand::Frame(frame)) => {
                        if send_client_frame(&mut socket, &frame).await.is_err() {
                            pending.push_front(frame);
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(WorkerCommand::Shutdown) | None => {
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::Shutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        apply_frame_text(ctx, aggregator, &text);
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => return Ok(SessionOutcome::Reconnect),
                    Some(Ok(_)) => {
                        tracing::warn!(event = "non_text_frame_dropped");
                    }
                    Some(Err(err)) => return Err(TransportError::WebSocket(err)),
                    None => return Ok(SessionOutcome::Reconnect),
                }
            }
        }
    }
}

/// Parses and applies one inbound text frame.
///
/// Malformed frames are logged and dropped; they never end the session.
fn apply_frame_text(ctx: &WorkerContext, aggregator: &mut StreamAggregator, text: &str) {
    let frame = match ServerFrame::from_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(event = "protocol_frame_dropped", error = %err);
            return;
        }
    };

    match frame {
        ServerFrame::ConnectionAck { thread_id } => {
            if let Some(thread_id) = thread_id {
                let _ = ctx.events.send(TransportEvent::ThreadAssigned(thread_id));
            }
        }
        ServerFrame::Response {
            content,
            id,
            voice_over,
        } => {
            let message = Message::assistant(id, parse_content(&content).into_message_content());
            let _ = ctx.events.send(TransportEvent::MessageReceived {
                message,
                voice_over: voice_over.unwrap_or(false),
            });
        }
        ServerFrame::VoiceResponse { content, id } => {
            let message = Message::assistant(id, parse_content(&content).into_message_content());
            let _ = ctx.events.send(TransportEvent::MessageReceived {
                message,
                voice_over: true,
            });
        }
        ServerFrame::UserTranscription { content, is_final } => {
            let _ = ctx
                .events
                .send(TransportEvent::UserTranscription { content, is_final });
        }
        ServerFrame::C1Token { id, content } => {
            for update in aggregator.apply_chunk(&id, &content) {
                let _ = ctx.events.send(stream_update_event(update));
            }
        }
        ServerFrame::ChatDone { id } => {
            for update in aggregator.finish(&id) {
                let _ = ctx.events.send(stream_update_event(update));
            }
        }
        ServerFrame::EnhancementStarted => {
            let _ = ctx.events.send(TransportEvent::EnhancementStarted);
        }
        ServerFrame::Error { code, message } => {
            let _ = ctx
                .events
                .send(TransportEvent::Error(SessionError::Backend { code, message }));
        }
    }
}

fn stream_update_event(update: StreamUpdate) -> TransportEvent {
    match update {
        StreamUpdate::Started { message_id } => TransportEvent::StreamingStarted { message_id },
        StreamUpdate::Chunk {
            message_id,
            delta,
            total,
        } => TransportEvent::StreamingChunk {
            message_id,
            delta,
            total,
        },
        StreamUpdate::Finalized { message } => TransportEvent::MessageReceived {
            message,
            voice_over: false,
        },
        StreamUpdate::Done { message_id } => TransportEvent::StreamingDone { message_id },
    }
}

async fn send_client_frame<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    frame: &ClientFrame,
) -> Result<(), TransportError>
where
    tokio_tungstenite::WebSocketStream<S>:
        futures_util::Sink<WsMessage, Error = WsError> + Unpin,
{
    let text = frame.to_text()?;
    socket.send(WsMessage::Text(text)).await?;
    Ok(())
}

async fn collect_commands_during_delay(
    delay: std::time::Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    pending: &mut VecDeque<ClientFrame>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_command = outbound_rx.recv() => {
                match maybe_command {
                    Some(WorkerCommand::Frame(frame)) => pending.push_back(frame),
                    Some(WorkerCommand::Shutdown) | None => return false,
                }
            }
        }
    }
}
