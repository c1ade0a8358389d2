//! Inbound merge window.
//!
//! Messages from the same sender in the same conversation that arrive within
//! the window are flushed as one batch, so a burst of pastes and captions
//! becomes a single agent turn.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        sync::mpsc,
        task::{AbortHandle, JoinHandle},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    config::DingTalkAccountConfig,
    message::{BotMessage, MediaRef},
};

/// How far past the window an entry may live before the sweep drops it.
pub const STALE_GRACE: Duration = Duration::from_secs(10);

/// Period of the stale-entry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeConfig {
    pub window: Duration,
    pub max_messages: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2_000),
            max_messages: 5,
        }
    }
}

impl From<&DingTalkAccountConfig> for MergeConfig {
    fn from(config: &DingTalkAccountConfig) -> Self {
        Self {
            window: config.merge_window(),
            max_messages: config.merge_max_messages.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub account_id: String,
    pub sender_id: String,
    pub conversation_id: String,
}

impl MergeKey {
    #[must_use]
    pub fn for_message(account_id: &str, message: &BotMessage) -> Self {
        Self {
            account_id: account_id.to_string(),
            sender_id: message.sender_id().to_string(),
            conversation_id: message.conversation_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub content: String,
    pub event: BotMessage,
    pub received_at: Instant,
}

/// Everything one key accumulated during its window, in arrival order.
#[derive(Debug, Clone)]
pub struct MergedBatch {
    pub key: MergeKey,
    pub messages: Vec<BufferedMessage>,
}

impl MergedBatch {
    /// The first event; its envelope metadata stands for the whole batch.
    #[must_use]
    pub fn carrier(&self) -> Option<&BotMessage> {
        self.messages.first().map(|m| &m.event)
    }

    /// The most recent event, whose session webhook lives the longest.
    #[must_use]
    pub fn latest(&self) -> Option<&BotMessage> {
        self.messages.last().map(|m| &m.event)
    }

    /// Non-empty message contents joined by a blank line.
    #[must_use]
    pub fn merged_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Media across all events, deduplicated by download code. The first
    /// occurrence of a code wins.
    #[must_use]
    pub fn media(&self) -> Vec<MediaRef> {
        let mut seen = HashSet::new();
        self.messages
            .iter()
            .flat_map(|m| m.event.media())
            .filter(|media| seen.insert(media.download_code.clone()))
            .collect()
    }

    #[must_use]
    pub fn message_ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.event.msg_id.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Result of [`MergeBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Held in an open window holding `count` messages.
    Buffered { count: usize },
    /// The window reached its cap and was flushed with `count` messages.
    Flushed { count: usize },
}

struct MergeEntry {
    messages: Vec<BufferedMessage>,
    started_at: Instant,
    generation: u64,
    timer: AbortHandle,
}

struct Inner {
    config: MergeConfig,
    entries: Mutex<HashMap<MergeKey, MergeEntry>>,
    flushed: mpsc::UnboundedSender<MergedBatch>,
    shutdown: CancellationToken,
    generations: AtomicU64,
}

/// Per-key merge windows. Flushed batches are delivered on the receiver
/// returned by [`MergeBuffer::new`].
#[derive(Clone)]
pub struct MergeBuffer {
    inner: Arc<Inner>,
}

impl MergeBuffer {
    pub fn new(
        config: MergeConfig,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<MergedBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                flushed: tx,
                shutdown,
                generations: AtomicU64::new(0),
            }),
        };
        (buffer, rx)
    }

    /// Add `event` to the window for `key`, opening one if needed.
    pub fn push(&self, key: MergeKey, event: BotMessage) -> PushOutcome {
        let message = BufferedMessage {
            content: event.body(),
            event,
            received_at: Instant::now(),
        };

        let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = match entries.get_mut(&key) {
            Some(entry) => {
                entry.messages.push(message);
                entry.messages.len()
            },
            None => {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                let timer = self.spawn_window_timer(key.clone(), generation);
                entries.insert(key.clone(), MergeEntry {
                    messages: vec![message],
                    started_at: Instant::now(),
                    generation,
                    timer,
                });
                1
            },
        };

        if count >= self.inner.config.max_messages {
            if let Some(entry) = entries.remove(&key) {
                entry.timer.abort();
                debug!(
                    account_id = %key.account_id,
                    conversation_id = %key.conversation_id,
                    count,
                    "merge window full, flushing early"
                );
                self.emit(key, entry.messages);
            }
            PushOutcome::Flushed { count }
        } else {
            PushOutcome::Buffered { count }
        }
    }

    fn spawn_window_timer(&self, key: MergeKey, generation: u64) -> AbortHandle {
        let buffer = self.clone();
        let window = self.inner.config.window;
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    buffer.flush_window(key, generation);
                }
            }
        })
        .abort_handle()
    }

    fn flush_window(&self, key: MergeKey, generation: u64) {
        let entry = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some(entry) if entry.generation == generation => entries.remove(&key),
                _ => None,
            }
        };
        if let Some(entry) = entry
            && !entry.messages.is_empty()
        {
            self.emit(key, entry.messages);
        }
    }

    fn emit(&self, key: MergeKey, messages: Vec<BufferedMessage>) {
        let count = messages.len();
        if self
            .inner
            .flushed
            .send(MergedBatch { key, messages })
            .is_err()
        {
            warn!(count, "merge batch dropped, no consumer");
        }
    }

    /// Drop entries open longer than the window plus [`STALE_GRACE`]. Their
    /// timers were lost; the messages are discarded.
    pub fn sweep_stale(&self) -> usize {
        let limit = self.inner.config.window + STALE_GRACE;
        let now = Instant::now();
        let stale: Vec<(MergeKey, MergeEntry)> = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<MergeKey> = entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.started_at) > limit)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        for (key, entry) in &stale {
            entry.timer.abort();
            warn!(
                account_id = %key.account_id,
                sender_id = %key.sender_id,
                conversation_id = %key.conversation_id,
                dropped = entry.messages.len(),
                "removed stale merge entry"
            );
        }
        stale.len()
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `period` until shutdown.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = buffer.inner.shutdown.cancelled() => {
                        buffer.clear();
                        debug!("merge buffer sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        buffer.sweep_stale();
                    }
                }
            }
        })
    }

    /// Number of keys with an open window.
    pub fn open_entries(&self) -> usize {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// Abort every window without flushing.
    pub fn clear(&self) {
        let drained: Vec<MergeEntry> = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
        }
    }

    #[cfg(test)]
    fn lose_timer(&self, key: &MergeKey) {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            entry.timer.abort();
        }
    }
}
