//! Multi-thread conversation state with debounced persistence.
//!
//! The store wraps one controller and multiplexes it across persisted
//! conversation threads. Only the active thread's messages are mirrored
//! into the controller; the rest live in the store's map and in the
//! durable record behind the storage port.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::controller::{ClientSessionController, SessionSnapshot};
use crate::threads::storage::StoragePort;
use crate::threads::StoreError;
use crate::transport::content::Message;

/// Namespaced key of the persisted thread record.
pub const STORAGE_KEY: &str = "chatkit.threads.v1";
/// Schema version written into every record.
pub const SCHEMA_VERSION: u32 = 1;
/// Default debounce applied to message-count flushes.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

const DEFAULT_THREAD_TITLE: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 40;

/// Thread metadata as listed to collaborators and persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadMeta {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message: Option<String>,
}

/// One persisted thread: metadata plus its ordered message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedThread {
    pub meta: ThreadMeta,
    pub messages: Vec<Message>,
}

/// Durable snapshot of all threads plus the active id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadStorageRecord {
    pub version: u32,
    pub threads: Vec<PersistedThread>,
    pub active_thread_id: Option<String>,
}

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub storage_key: String,
    pub flush_debounce: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            storage_key: STORAGE_KEY.to_string(),
            flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
        }
    }
}

#[derive(Debug)]
struct ThreadEntry {
    meta: ThreadMeta,
    messages: Vec<Message>,
}

#[derive(Debug)]
struct StoreInner {
    threads: Vec<ThreadEntry>,
    active: Option<String>,
    /// Reentrancy guard: set while a switch is rewiring the controller.
    switching: bool,
    /// Backend ids adopted this session. The controller keeps reporting an
    /// assignment after adoption, so each id is adopted at most once;
    /// deleting the adopted thread must not bring it back.
    adopted: HashSet<String>,
}

impl StoreInner {
    fn entry(&self, thread_id: &str) -> Option<&ThreadEntry> {
        self.threads.iter().find(|entry| entry.meta.id == thread_id)
    }

    fn entry_mut(&mut self, thread_id: &str) -> Option<&mut ThreadEntry> {
        self.threads
            .iter_mut()
            .find(|entry| entry.meta.id == thread_id)
    }

    fn record(&self) -> ThreadStorageRecord {
        ThreadStorageRecord {
            version: SCHEMA_VERSION,
            threads: self
                .threads
                .iter()
                .map(|entry| PersistedThread {
                    meta: entry.meta.clone(),
                    messages: entry.messages.clone(),
                })
                .collect(),
            active_thread_id: self.active.clone(),
        }
    }

    /// Copies the controller's current messages into the active entry.
    fn capture_active(&mut self, messages: &[Message]) {
        let Some(active) = self.active.clone() else {
            return;
        };
        if let Some(entry) = self.entry_mut(&active) {
            if entry.messages.len() != messages.len() {
                entry.messages = messages.to_vec();
                touch_meta(&mut entry.meta, messages);
            }
        }
    }
}

/// Multiplexes one controller across persisted conversation threads.
pub struct ThreadStore {
    controller: Arc<ClientSessionController>,
    inner: Arc<Mutex<StoreInner>>,
    storage: Arc<dyn StoragePort>,
    options: StoreOptions,
    flush_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    watcher: JoinHandle<()>,
}

impl ThreadStore {
    /// Creates a store with default options, loading any persisted record.
    pub fn new(
        controller: ClientSessionController,
        storage: Arc<dyn StoragePort>,
    ) -> Result<Self, StoreError> {
        Self::with_options(controller, storage, StoreOptions::default())
    }

    pub fn with_options(
        controller: ClientSessionController,
        storage: Arc<dyn StoragePort>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let controller = Arc::new(controller);

        let mut inner = StoreInner {
            threads: Vec::new(),
            active: None,
            switching: false,
            adopted: HashSet::new(),
        };
        if let Some(raw) = storage.get(&options.storage_key) {
            let record: ThreadStorageRecord = serde_json::from_str(&raw)?;
            if record.version != SCHEMA_VERSION {
                return Err(StoreError::UnsupportedVersion(record.version));
            }
            inner.threads = record
                .threads
                .into_iter()
                .map(|thread| ThreadEntry {
                    meta: thread.meta,
                    messages: thread.messages,
                })
                .collect();
            // The active id must reference an existing thread or be null.
            inner.active = record
                .active_thread_id
                .filter(|id| inner.threads.iter().any(|entry| &entry.meta.id == id));
        }

        if let Some(active) = inner.active.clone() {
            let messages = inner
                .entry(&active)
                .map(|entry| entry.messages.clone())
                .unwrap_or_default();
            controller.replace_messages(messages);
            controller.set_thread(Some(active));
        }

        let inner = Arc::new(Mutex::new(inner));
        let flush_task = Arc::new(Mutex::new(None));
        let watcher = spawn_snapshot_watcher(
            Arc::clone(&controller),
            Arc::clone(&inner),
            Arc::clone(&storage),
            options.clone(),
            Arc::clone(&flush_task),
        );

        Ok(Self {
            controller,
            inner,
            storage,
            options,
            flush_task,
            watcher,
        })
    }

    /// Wrapped controller.
    pub fn controller(&self) -> &ClientSessionController {
        &self.controller
    }

    /// Threads in registration order.
    pub fn threads(&self) -> Vec<ThreadMeta> {
        self.inner
            .lock()
            .expect("store lock")
            .threads
            .iter()
            .map(|entry| entry.meta.clone())
            .collect()
    }

    pub fn active_thread_id(&self) -> Option<String> {
        self.inner.lock().expect("store lock").active.clone()
    }

    /// Current durable record, as it would be persisted.
    pub fn record(&self) -> ThreadStorageRecord {
        self.inner.lock().expect("store lock").record()
    }

    /// Allocates a thread, registers it, persists, and switches to it.
    ///
    /// When an initial message is given it seeds the thread title and is
    /// sent through the controller (kept optimistically if the channel is
    /// down).
    pub fn create_thread(&self, initial_message: Option<&str>) -> ThreadMeta {
        let now = Utc::now();
        let meta = ThreadMeta {
            id: Uuid::new_v4().to_string(),
            title: initial_message
                .map(derive_title)
                .unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string()),
            created_at: now,
            updated_at: now,
            message_count: 0,
            last_message: None,
        };

        {
            let mut inner = self.inner.lock().expect("store lock");
            inner.switching = true;
            inner.capture_active(&self.controller.snapshot().messages);
            inner.threads.push(ThreadEntry {
                meta: meta.clone(),
                messages: Vec::new(),
            });
            inner.active = Some(meta.id.clone());
        }

        self.controller.clear_messages();
        self.controller.set_thread(Some(meta.id.clone()));
        self.flush();
        self.inner.lock().expect("store lock").switching = false;

        if let Some(text) = initial_message {
            let _ = self.controller.send_text(text);
        }

        meta
    }

    /// Switches the controller to another thread.
    ///
    /// No-op while a switch is already in progress and when the target is
    /// already active (no message-list clear, no persistence write).
    pub fn switch_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let incoming = {
            let mut inner = self.inner.lock().expect("store lock");
            if inner.switching {
                return Ok(());
            }
            if inner.active.as_deref() == Some(thread_id) {
                return Ok(());
            }
            let Some(entry) = inner.entry(thread_id) else {
                return Err(StoreError::UnknownThread(thread_id.to_string()));
            };
            let incoming = entry.messages.clone();
            inner.switching = true;
            inner.capture_active(&self.controller.snapshot().messages);
            inner.active = Some(thread_id.to_string());
            incoming
        };

        self.controller.replace_messages(incoming);
        self.controller.set_thread(Some(thread_id.to_string()));
        self.flush();
        self.inner.lock().expect("store lock").switching = false;
        Ok(())
    }

    /// Deletes a thread.
    ///
    /// Deleting the active thread clears the controller and leaves no
    /// active selection; no replacement thread is chosen implicitly.
    pub fn delete_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let was_active = {
            let mut inner = self.inner.lock().expect("store lock");
            let Some(index) = inner
                .threads
                .iter()
                .position(|entry| entry.meta.id == thread_id)
            else {
                return Err(StoreError::UnknownThread(thread_id.to_string()));
            };
            inner.threads.remove(index);
            let was_active = inner.active.as_deref() == Some(thread_id);
            if was_active {
                inner.active = None;
            }
            was_active
        };

        if was_active {
            self.controller.clear_messages();
            self.controller.set_thread(None);
        }
        self.flush();
        Ok(())
    }

    /// Adopts a backend-assigned thread id.
    ///
    /// An id already registered is matched exactly and never duplicated.
    /// An unknown id on a fresh session (no active thread) registers the
    /// in-flight conversation under it.
    pub fn adopt_backend_thread(&self, thread_id: &str) {
        let adopted = {
            let mut inner = self.inner.lock().expect("store lock");
            if inner.entry(thread_id).is_some()
                || inner.active.is_some()
                || inner.adopted.contains(thread_id)
            {
                false
            } else {
                let messages = self.controller.snapshot().messages;
                let now = Utc::now();
                let mut meta = ThreadMeta {
                    id: thread_id.to_string(),
                    title: messages
                        .first()
                        .map(|message| derive_title(message.content.text()))
                        .unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string()),
                    created_at: now,
                    updated_at: now,
                    message_count: 0,
                    last_message: None,
                };
                touch_meta(&mut meta, &messages);
                inner.threads.push(ThreadEntry { meta, messages });
                inner.active = Some(thread_id.to_string());
                inner.adopted.insert(thread_id.to_string());
                true
            }
        };

        if adopted {
            self.controller.set_thread(Some(thread_id.to_string()));
            self.flush();
        }
    }

    /// Writes the current record through the storage port immediately.
    pub fn flush(&self) {
        if let Some(handle) = self.flush_task.lock().expect("flush lock").take() {
            handle.abort();
        }
        flush_record(&self.inner, &self.storage, &self.options.storage_key);
    }
}

impl Drop for ThreadStore {
    fn drop(&mut self) {
        self.watcher.abort();
        let pending = self.flush_task.lock().expect("flush lock").take();
        if let Some(handle) = pending {
            handle.abort();
            // A debounced write was still pending; do not lose it.
            flush_record(&self.inner, &self.storage, &self.options.storage_key);
        }
    }
}

fn spawn_snapshot_watcher(
    controller: Arc<ClientSessionController>,
    inner: Arc<Mutex<StoreInner>>,
    storage: Arc<dyn StoragePort>,
    options: StoreOptions,
    flush_task: Arc<Mutex<Option<JoinHandle<()>>>>,
) -> JoinHandle<()> {
    let mut updates = controller.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            observe_snapshot(&controller, &inner, &storage, &options, &flush_task, snapshot);
        }
    })
}

fn observe_snapshot(
    controller: &Arc<ClientSessionController>,
    inner: &Arc<Mutex<StoreInner>>,
    storage: &Arc<dyn StoragePort>,
    options: &StoreOptions,
    flush_task: &Arc<Mutex<Option<JoinHandle<()>>>>,
    snapshot: SessionSnapshot,
) {
    let mut changed = false;
    {
        let mut guard = inner.lock().expect("store lock");
        if guard.switching {
            return;
        }

        // Adoption: backend-assigned id on a fresh session.
        if let Some(backend_id) = &snapshot.backend_thread_id {
            if guard.entry(backend_id).is_none()
                && guard.active.is_none()
                && !guard.adopted.contains(backend_id)
            {
                let now = Utc::now();
                let mut meta = ThreadMeta {
                    id: backend_id.clone(),
                    title: snapshot
                        .messages
                        .first()
                        .map(|message| derive_title(message.content.text()))
                        .unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string()),
                    created_at: now,
                    updated_at: now,
                    message_count: 0,
                    last_message: None,
                };
                touch_meta(&mut meta, &snapshot.messages);
                guard.threads.push(ThreadEntry {
                    meta,
                    messages: snapshot.messages.clone(),
                });
                guard.active = Some(backend_id.clone());
                guard.adopted.insert(backend_id.clone());
                controller.set_thread(Some(backend_id.clone()));
                changed = true;
            }
        }

        // Mirror the active thread on message-count changes.
        if let Some(active) = guard.active.clone() {
            if let Some(entry) = guard.entry_mut(&active) {
                if entry.messages.len() != snapshot.messages.len() {
                    entry.messages = snapshot.messages.clone();
                    touch_meta(&mut entry.meta, &snapshot.messages);
                    changed = true;
                }
            }
        }
    }

    if changed {
        schedule_flush(inner, storage, options, flush_task);
    }
}

/// Debounced flush: rapid updates coalesce into one write.
fn schedule_flush(
    inner: &Arc<Mutex<StoreInner>>,
    storage: &Arc<dyn StoragePort>,
    options: &StoreOptions,
    flush_task: &Arc<Mutex<Option<JoinHandle<()>>>>,
) {
    let mut slot = flush_task.lock().expect("flush lock");
    if let Some(handle) = slot.take() {
        handle.abort();
    }

    let inner = Arc::clone(inner);
    let storage = Arc::clone(storage);
    let key = options.storage_key.clone();
    let delay = options.flush_debounce;
    *slot = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        flush_record(&inner, &storage, &key);
    }));
}

fn flush_record(inner: &Arc<Mutex<StoreInner>>, storage: &Arc<dyn StoragePort>, key: &str) {
    let record = inner.lock().expect("store lock").record();
    match serde_json::to_string(&record) {
        Ok(raw) => {
            if let Err(err) = storage.set(key, raw) {
                tracing::warn!(event = "thread_flush_failed", error = %err);
            }
        }
        Err(err) => {
            tracing::warn!(event = "thread_record_encode_failed", error = %err);
        }
    }
}

fn touch_meta(meta: &mut ThreadMeta, messages: &[Message]) {
    meta.message_count = messages.len();
    meta.updated_at = Utc::now();
    meta.last_message = messages
        .last()
        .map(|message| message.content.text().to_string());
}

fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DEFAULT_THREAD_TITLE.to_string();
    }
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Timelike};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    use super::*;
    use crate::controller::{ClientSessionController, ControllerConfig};
    use crate::threads::storage::MemoryStorage;
    use crate::transport::client::TransportConfig;
    use crate::transport::content::{MessageContent, Role};
    use crate::voice::port::{MediaEndpoint, MediaPort};
    use crate::voice::VoiceError;

    struct NeverOpenedPort;

    impl MediaPort for NeverOpenedPort {
        fn open(&self) -> BoxFuture<'_, Result<Box<dyn MediaEndpoint>, VoiceError>> {
            async { panic!("media port must not be opened") }.boxed()
        }
    }

    /// Memory storage that counts writes, for debounce assertions.
    #[derive(Default)]
    struct CountingStorage {
        backing: MemoryStorage,
        writes: AtomicUsize,
    }

    impl CountingStorage {
        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl StoragePort for CountingStorage {
        fn get(&self, key: &str) -> Option<String> {
            self.backing.get(key)
        }

        fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.backing.set(key, value)
        }

        fn remove(&self, key: &str) {
            self.backing.remove(key);
        }
    }

    fn storage_port(storage: &Arc<CountingStorage>) -> Arc<dyn StoragePort> {
        storage.clone() as Arc<dyn StoragePort>
    }

    fn new_controller() -> ClientSessionController {
        let config = ControllerConfig::new(TransportConfig::new("ws://localhost:9/ws"));
        ClientSessionController::new(config, Arc::new(NeverOpenedPort))
    }

    fn fast_options() -> StoreOptions {
        StoreOptions {
            storage_key: STORAGE_KEY.to_string(),
            flush_debounce: Duration::from_millis(20),
        }
    }

    fn message(id: &str, role: Role, text: &str) -> Message {
        Message {
            id: id.to_string(),
            role,
            content: MessageContent::Plain {
                text: text.to_string(),
            },
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn record_round_trip_preserves_threads_and_timestamps() {
        let rich = Message {
            id: "m-rich".to_string(),
            role: Role::Assistant,
            content: MessageContent::Rich {
                payload: "{\"card\":{\"title\":\"hi\"}}".to_string(),
            },
            timestamp: Utc
                .with_ymd_and_hms(2024, 5, 2, 9, 30, 7)
                .unwrap()
                .with_nanosecond(123_456_789)
                .unwrap(),
        };

        let record = ThreadStorageRecord {
            version: SCHEMA_VERSION,
            threads: vec![
                PersistedThread {
                    meta: ThreadMeta {
                        id: "t-1".to_string(),
                        title: "first".to_string(),
                        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
                        updated_at: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 7).unwrap(),
                        message_count: 3,
                        last_message: Some("hi".to_string()),
                    },
                    messages: vec![
                        message("m-1", Role::User, "hello"),
                        message("m-2", Role::Assistant, "hi there"),
                        rich,
                    ],
                },
                PersistedThread {
                    meta: ThreadMeta {
                        id: "t-2".to_string(),
                        title: "second".to_string(),
                        created_at: Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap(),
                        updated_at: Utc.with_ymd_and_hms(2024, 5, 3, 10, 5, 0).unwrap(),
                        message_count: 2,
                        last_message: Some("bye".to_string()),
                    },
                    messages: vec![
                        message("m-4", Role::User, "question"),
                        message("m-5", Role::Assistant, "bye"),
                    ],
                },
            ],
            active_thread_id: Some("t-2".to_string()),
        };

        let raw = serde_json::to_string(&record).expect("serialize");
        let reloaded: ThreadStorageRecord = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(reloaded, record);
    }

    #[tokio::test]
    async fn create_thread_registers_persists_and_switches() {
        let storage = Arc::new(CountingStorage::default());
        let store =
            ThreadStore::with_options(new_controller(), storage_port(&storage), fast_options())
                .expect("store");

        let meta = store.create_thread(None);
        assert_eq!(store.active_thread_id(), Some(meta.id.clone()));
        assert_eq!(store.threads().len(), 1);
        assert_eq!(store.controller().current_thread(), Some(meta.id));
        assert!(storage.writes() >= 1);
        assert!(storage.get(STORAGE_KEY).is_some());
    }

    #[tokio::test]
    async fn switch_to_active_thread_is_a_no_op() {
        let storage = Arc::new(CountingStorage::default());
        let store =
            ThreadStore::with_options(new_controller(), storage_port(&storage), fast_options())
                .expect("store");

        let meta = store.create_thread(None);
        store
            .controller()
            .replace_messages(vec![message("m-1", Role::User, "kept")]);
        // Let the mirror's debounced flush land first.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let writes_before = storage.writes();
        store.switch_thread(&meta.id).expect("switch");

        // No message-list clear and no persistence write.
        assert_eq!(store.controller().snapshot().messages.len(), 1);
        assert_eq!(storage.writes(), writes_before);
    }

    #[tokio::test]
    async fn switch_thread_swaps_message_lists() {
        let storage = Arc::new(CountingStorage::default());
        let store =
            ThreadStore::with_options(new_controller(), storage_port(&storage), fast_options())
                .expect("store");

        let first = store.create_thread(None);
        store
            .controller()
            .replace_messages(vec![message("m-1", Role::User, "in first")]);
        // Let the watcher mirror the first thread before switching away.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = store.create_thread(None);
        assert!(store.controller().snapshot().messages.is_empty());
        store
            .controller()
            .replace_messages(vec![message("m-2", Role::User, "in second")]);
        tokio::time::sleep(Duration::from_millis(60)).await;

        store.switch_thread(&first.id).expect("switch back");
        let messages = store.controller().snapshot().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.text(), "in first");

        store.switch_thread(&second.id).expect("switch forward");
        let messages = store.controller().snapshot().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.text(), "in second");
    }

    #[tokio::test]
    async fn switch_to_unknown_thread_fails() {
        let store = ThreadStore::with_options(
            new_controller(),
            Arc::new(MemoryStorage::new()),
            fast_options(),
        )
        .expect("store");

        assert!(matches!(
            store.switch_thread("missing"),
            Err(StoreError::UnknownThread(_))
        ));
    }

    #[tokio::test]
    async fn deleting_the_active_thread_clears_without_reselection() {
        let store = ThreadStore::with_options(
            new_controller(),
            Arc::new(MemoryStorage::new()),
            fast_options(),
        )
        .expect("store");

        let keep = store.create_thread(None);
        let doomed = store.create_thread(None);
        store
            .controller()
            .replace_messages(vec![message("m-1", Role::User, "doomed")]);
        tokio::time::sleep(Duration::from_millis(60)).await;

        store.delete_thread(&doomed.id).expect("delete");

        assert_eq!(store.active_thread_id(), None);
        assert!(store.controller().snapshot().messages.is_empty());
        assert_eq!(store.controller().current_thread(), None);
        // The other thread is still registered but not auto-selected.
        let threads = store.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, keep.id);
    }

    #[tokio::test]
    async fn message_updates_flush_once_after_the_debounce_window() {
        let storage = Arc::new(CountingStorage::default());
        let store =
            ThreadStore::with_options(new_controller(), storage_port(&storage), fast_options())
                .expect("store");

        store.create_thread(None);
        let writes_before = storage.writes();

        // Rapid updates inside one debounce window.
        for index in 0..4 {
            let mut messages = Vec::new();
            for n in 0..=index {
                messages.push(message(&format!("m-{n}"), Role::User, "tick"));
            }
            store.controller().replace_messages(messages);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(storage.writes(), writes_before + 1);
    }

    #[tokio::test]
    async fn reload_reproduces_threads_messages_and_active_id() {
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());

        let first_record = {
            let store = ThreadStore::with_options(
                new_controller(),
                Arc::clone(&storage),
                fast_options(),
            )
            .expect("store");

            store.create_thread(None);
            store
                .controller()
                .replace_messages(vec![
                    message("m-1", Role::User, "hello"),
                    message("m-2", Role::Assistant, "hi"),
                ]);
            tokio::time::sleep(Duration::from_millis(60)).await;

            let second = store.create_thread(None);
            store.controller().replace_messages(vec![
                message("m-3", Role::User, "another"),
                Message {
                    id: "m-4".to_string(),
                    role: Role::Assistant,
                    content: MessageContent::Rich {
                        payload: "{\"list\":[1,2]}".to_string(),
                    },
                    timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
                },
                message("m-5", Role::Assistant, "done"),
            ]);
            tokio::time::sleep(Duration::from_millis(60)).await;
            store.flush();

            assert_eq!(store.active_thread_id(), Some(second.id));
            store.record()
        };

        let reloaded = ThreadStore::with_options(
            new_controller(),
            Arc::clone(&storage),
            fast_options(),
        )
        .expect("reload");

        assert_eq!(reloaded.record(), first_record);
        // The active thread's messages are mirrored into the controller.
        let mirrored = reloaded.controller().snapshot().messages;
        assert_eq!(mirrored.len(), 3);
        assert_eq!(mirrored[1].content.text(), "{\"list\":[1,2]}");
    }

    #[tokio::test]
    async fn unsupported_schema_version_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(
                STORAGE_KEY,
                "{\"version\":99,\"threads\":[],\"active_thread_id\":null}".to_string(),
            )
            .expect("seed");

        let result = ThreadStore::with_options(new_controller(), storage, fast_options());
        assert!(matches!(result, Err(StoreError::UnsupportedVersion(99))));
    }

    #[tokio::test]
    async fn backend_assigned_id_is_adopted_without_duplicates() {
        let store = ThreadStore::with_options(
            new_controller(),
            Arc::new(MemoryStorage::new()),
            fast_options(),
        )
        .expect("store");

        store
            .controller()
            .replace_messages(vec![message("m-1", Role::User, "first message")]);
        store.adopt_backend_thread("srv-thread-1");

        assert_eq!(store.active_thread_id(), Some("srv-thread-1".to_string()));
        assert_eq!(store.threads().len(), 1);
        assert_eq!(store.threads()[0].message_count, 1);
        assert_eq!(
            store.controller().current_thread(),
            Some("srv-thread-1".to_string())
        );

        // Exact match: adopting the same id again never duplicates.
        store.adopt_backend_thread("srv-thread-1");
        assert_eq!(store.threads().len(), 1);
    }

    #[tokio::test]
    async fn deleted_backend_thread_is_not_re_adopted() {
        let store = ThreadStore::with_options(
            new_controller(),
            Arc::new(MemoryStorage::new()),
            fast_options(),
        )
        .expect("store");

        store
            .controller()
            .replace_messages(vec![message("m-1", Role::User, "first message")]);
        store.adopt_backend_thread("srv-1");
        assert_eq!(store.active_thread_id(), Some("srv-1".to_string()));

        store.delete_thread("srv-1").expect("delete");
        assert_eq!(store.active_thread_id(), None);

        // The controller keeps reporting the assignment after deletion; a
        // later snapshot update must not resurrect the deleted thread.
        let snapshot = SessionSnapshot {
            backend_thread_id: Some("srv-1".to_string()),
            ..SessionSnapshot::default()
        };
        observe_snapshot(
            &store.controller,
            &store.inner,
            &store.storage,
            &store.options,
            &store.flush_task,
            snapshot,
        );

        assert_eq!(store.active_thread_id(), None);
        assert!(store.threads().is_empty());
        assert_eq!(store.controller().current_thread(), None);
    }
}
