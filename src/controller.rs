//! Observable session state bound to one transport session.
//!
//! The controller is the sole subscriber of the transport event stream. It
//! folds events into a [`SessionSnapshot`] exposed through a
//! snapshot/subscribe interface, and offers the imperative command API
//! consumed by presentation collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::transport::client::{
    ConnectionState, SessionError, TransportConfig, TransportError, TransportEvent,
    TransportSession,
};
use crate::transport::content::Message;
use crate::voice::port::{AudioStream, MediaPort};
use crate::voice::{VoiceError, VoiceState};

/// Default hysteresis window applied around voice turn-taking.
pub const DEFAULT_VOICE_LOADING_WINDOW: Duration = Duration::from_millis(200);

/// Controller-level configuration.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Transport endpoints and reconnect policy.
    pub transport: TransportConfig,
    /// Whether voice commands are available at all. `start_voice` is a
    /// no-op when disabled.
    pub voice_enabled: bool,
    /// Smoothing window before clearing the voice-loading flag once the
    /// assistant starts speaking. UX detail, not a correctness property.
    pub voice_loading_window: Duration,
}

impl ControllerConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            voice_enabled: true,
            voice_loading_window: DEFAULT_VOICE_LOADING_WINDOW,
        }
    }

    pub fn with_voice_enabled(mut self, enabled: bool) -> Self {
        self.voice_enabled = enabled;
        self
    }

    pub fn with_voice_loading_window(mut self, window: Duration) -> Self {
        self.voice_loading_window = window;
        self
    }
}

/// Observable state mirrored to presentation collaborators.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub voice_state: VoiceState,
    /// Ordered message list of the active conversation.
    pub messages: Vec<Message>,
    /// True between a local send and the first corresponding server event.
    pub is_loading: bool,
    /// Hysteresis-smoothed voice turn-taking indicator.
    pub is_voice_loading: bool,
    /// True while the slow secondary content phase is pending.
    pub is_enhancing: bool,
    pub streaming_content: String,
    pub streaming_message_id: Option<String>,
    pub is_streaming_active: bool,
    pub audio_stream: Option<AudioStream>,
    /// Last thread id announced by the backend during the handshake.
    pub backend_thread_id: Option<String>,
    /// Last surfaced recoverable error.
    pub last_error: Option<SessionError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            voice_state: VoiceState::Disconnected,
            messages: Vec::new(),
            is_loading: false,
            is_voice_loading: false,
            is_enhancing: false,
            streaming_content: String::new(),
            streaming_message_id: None,
            is_streaming_active: false,
            audio_stream: None,
            backend_thread_id: None,
            last_error: None,
        }
    }
}

/// Binds one transport session to observable state and commands.
pub struct ClientSessionController {
    config: ControllerConfig,
    transport: Arc<TransportSession>,
    state: Arc<watch::Sender<SessionSnapshot>>,
    pump: JoinHandle<()>,
    thread_id: Mutex<Option<String>>,
}

impl ClientSessionController {
    /// Creates a controller with a fresh transport session.
    pub fn new(config: ControllerConfig, media: Arc<dyn MediaPort>) -> Self {
        Self::bind(config, media, None)
    }

    /// Creates a controller, reusing the previous controller's transport
    /// session when the endpoint pair is unchanged.
    ///
    /// A changed endpoint tears the previous session down (disconnect and
    /// stop its event pump) before constructing a new one, so repeated
    /// construction never leaks duplicate sockets.
    pub fn bind(
        config: ControllerConfig,
        media: Arc<dyn MediaPort>,
        prev: Option<ClientSessionController>,
    ) -> Self {
        let transport = match prev {
            Some(prev) if prev.config.transport.same_endpoints(&config.transport) => {
                prev.pump.abort();
                Arc::clone(&prev.transport)
            }
            Some(prev) => {
                prev.teardown();
                Arc::new(TransportSession::new(config.transport.clone(), media))
            }
            None => Arc::new(TransportSession::new(config.transport.clone(), media)),
        };

        // A reused transport may already be live; the first snapshot must
        // reflect its state, not a blank default.
        let state = Arc::new(
            watch::channel(SessionSnapshot {
                connection_state: transport.connection_state(),
                voice_state: transport.voice_state(),
                ..SessionSnapshot::default()
            })
            .0,
        );
        let pump = spawn_event_pump(
            transport.subscribe(),
            Arc::clone(&state),
            config.voice_loading_window,
        );

        Self {
            config,
            transport,
            state,
            pump,
            thread_id: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Underlying transport session.
    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Disconnects and stops the event pump.
    pub fn teardown(self) {
        self.pump.abort();
        self.transport.disconnect();
    }

    /// Sends a chat message.
    ///
    /// Blank or whitespace-only input is a no-op and returns `Ok(None)`.
    /// Otherwise an optimistic user message is appended before delegating;
    /// on failure the loading flag resets but the optimistic message stays,
    /// since history must never silently erase user input.
    pub fn send_text(&self, text: &str) -> Result<Option<String>, TransportError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let optimistic = Message::user(text);
        self.state.send_modify(|snapshot| {
            snapshot.messages.push(optimistic);
            snapshot.is_loading = true;
        });

        let thread_id = self.current_thread();
        match self.transport.send(text, thread_id.as_deref()) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                self.state.send_modify(|snapshot| snapshot.is_loading = false);
                Err(err)
            }
        }
    }

    /// Sends a structured UI action, optionally appending a user-facing
    /// paraphrase to the message list. Same optimistic/loading contract as
    /// [`Self::send_text`].
    pub fn send_action(
        &self,
        content: &str,
        paraphrase: Option<&str>,
    ) -> Result<Option<String>, TransportError> {
        if content.trim().is_empty() {
            return Ok(None);
        }

        let optimistic = paraphrase
            .filter(|text| !text.trim().is_empty())
            .map(Message::user);
        self.state.send_modify(|snapshot| {
            if let Some(message) = optimistic {
                snapshot.messages.push(message);
            }
            snapshot.is_loading = true;
        });

        let thread_id = self.current_thread();
        match self.transport.send_action(content, thread_id.as_deref()) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                self.state.send_modify(|snapshot| snapshot.is_loading = false);
                Err(err)
            }
        }
    }

    /// Starts voice. No-op when voice is disabled by configuration.
    pub async fn start_voice(&self) -> Result<(), VoiceError> {
        if !self.config.voice_enabled {
            return Ok(());
        }
        self.transport.connect_voice().await
    }

    pub fn stop_voice(&self) {
        self.transport.disconnect_voice();
    }

    /// Sets the backend-visible thread id attached to outgoing frames.
    pub fn set_thread(&self, thread_id: Option<String>) {
        *self.thread_id.lock().expect("thread id lock") = thread_id;
    }

    /// Thread id currently attached to outgoing frames.
    pub fn current_thread(&self) -> Option<String> {
        self.thread_id.lock().expect("thread id lock").clone()
    }

    /// Replaces the mirrored message list, e.g. when switching threads.
    pub fn replace_messages(&self, messages: Vec<Message>) {
        self.state.send_modify(|snapshot| snapshot.messages = messages);
    }

    /// Clears the mirrored message list.
    pub fn clear_messages(&self) {
        self.state.send_modify(|snapshot| snapshot.messages.clear());
    }
}

fn spawn_event_pump(
    mut events: broadcast::Receiver<TransportEvent>,
    state: Arc<watch::Sender<SessionSnapshot>>,
    voice_loading_window: Duration,
) -> JoinHandle<()> {
    let hysteresis = Arc::new(AtomicU64::new(0));
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => apply_event(&state, &hysteresis, voice_loading_window, event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(event = "controller_events_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn apply_event(
    state: &Arc<watch::Sender<SessionSnapshot>>,
    hysteresis: &Arc<AtomicU64>,
    voice_loading_window: Duration,
    event: TransportEvent,
) {
    match event {
        TransportEvent::StateChanged(connection_state) => {
            state.send_modify(|snapshot| snapshot.connection_state = connection_state);
        }
        TransportEvent::VoiceStateChanged(voice_state) => {
            state.send_modify(|snapshot| {
                snapshot.voice_state = voice_state;
                if voice_state == VoiceState::Disconnected {
                    snapshot.audio_stream = None;
                    snapshot.is_voice_loading = false;
                }
            });
        }
        TransportEvent::ThreadAssigned(thread_id) => {
            state.send_modify(|snapshot| snapshot.backend_thread_id = Some(thread_id));
        }
        TransportEvent::MessageReceived { message, .. } => {
            state.send_modify(|snapshot| {
                snapshot.is_loading = false;
                snapshot.is_enhancing = false;
                // The transport cannot guarantee exactly-once delivery.
                if !snapshot.messages.iter().any(|known| known.id == message.id) {
                    snapshot.messages.push(message);
                }
            });
        }
        TransportEvent::StreamingStarted { message_id } => {
            state.send_modify(|snapshot| {
                snapshot.is_loading = false;
                snapshot.is_streaming_active = true;
                snapshot.streaming_message_id = Some(message_id);
                snapshot.streaming_content.clear();
            });
        }
        TransportEvent::StreamingChunk { total, .. } => {
            state.send_modify(|snapshot| snapshot.streaming_content = total);
        }
        TransportEvent::StreamingDone { .. } => {
            state.send_modify(|snapshot| {
                snapshot.is_streaming_active = false;
                snapshot.streaming_message_id = None;
                snapshot.streaming_content.clear();
            });
        }
        TransportEvent::EnhancementStarted => {
            state.send_modify(|snapshot| snapshot.is_enhancing = true);
        }
        TransportEvent::UserTranscription { content, is_final } => {
            if is_final {
                state.send_modify(|snapshot| snapshot.messages.push(Message::user(content)));
            }
        }
        TransportEvent::UserStoppedSpeaking => {
            hysteresis.fetch_add(1, Ordering::SeqCst);
            state.send_modify(|snapshot| snapshot.is_voice_loading = true);
        }
        TransportEvent::BotStartedSpeaking => {
            let generation = hysteresis.load(Ordering::SeqCst);
            let state = Arc::clone(state);
            let hysteresis = Arc::clone(hysteresis);
            tokio::spawn(async move {
                tokio::time::sleep(voice_loading_window).await;
                // Skip when the user started another turn inside the window.
                if hysteresis.load(Ordering::SeqCst) == generation {
                    state.send_modify(|snapshot| snapshot.is_voice_loading = false);
                }
            });
        }
        TransportEvent::AudioStream(stream) => {
            state.send_modify(|snapshot| snapshot.audio_stream = Some(stream));
        }
        TransportEvent::Error(error) => {
            state.send_modify(|snapshot| {
                snapshot.is_loading = false;
                snapshot.last_error = Some(error);
            });
        }
    }
}
