//! Local bookkeeping for live cards and the periodic TTL sweep.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

/// A card the bot has delivered and may still update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInstance {
    pub card_id: String,
    pub conversation_id: String,
    pub created_at: Instant,
    pub last_updated_at: Instant,
}

struct CardEntry {
    instance: CardInstance,
    /// Cancelled when the card leaves the registry; stops its pending timers.
    cancel: CancellationToken,
}

/// Live cards keyed by card id.
///
/// Entries are evicted once they have not been updated for `ttl`, or
/// immediately when the platform reports the card gone.
pub struct CardRegistry {
    cards: Mutex<HashMap<String, CardEntry>>,
    ttl: Duration,
    shutdown: CancellationToken,
}

impl CardRegistry {
    pub fn new(ttl: Duration, shutdown: CancellationToken) -> Self {
        Self {
            cards: Mutex::new(HashMap::new()),
            ttl,
            shutdown,
        }
    }

    /// Track a newly created card. Card ids are never reused, so a second
    /// registration of the same id keeps the original entry.
    pub fn register(&self, card_id: &str, conversation_id: &str) -> CardInstance {
        let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = cards.get(card_id) {
            warn!(card_id, "card already registered, keeping existing entry");
            return existing.instance.clone();
        }
        let now = Instant::now();
        let instance = CardInstance {
            card_id: card_id.to_string(),
            conversation_id: conversation_id.to_string(),
            created_at: now,
            last_updated_at: now,
        };
        cards.insert(card_id.to_string(), CardEntry {
            instance: instance.clone(),
            cancel: self.shutdown.child_token(),
        });
        debug!(card_id, conversation_id, "card registered");
        instance
    }

    /// Record a successful update. Returns `false` for unknown cards.
    pub fn touch(&self, card_id: &str) -> bool {
        let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        match cards.get_mut(card_id) {
            Some(entry) => {
                entry.instance.last_updated_at = Instant::now();
                true
            },
            None => false,
        }
    }

    pub fn get(&self, card_id: &str) -> Option<CardInstance> {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.get(card_id).map(|entry| entry.instance.clone())
    }

    pub fn contains(&self, card_id: &str) -> bool {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.contains_key(card_id)
    }

    /// Token cancelled when `card_id` is removed or the registry shuts down.
    pub fn cancel_token(&self, card_id: &str) -> Option<CancellationToken> {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.get(card_id).map(|entry| entry.cancel.clone())
    }

    /// Forget a card and cancel its pending timers. Removing an unknown id
    /// is a no-op.
    pub fn remove(&self, card_id: &str) -> bool {
        let removed = {
            let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
            cards.remove(card_id)
        };
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(card_id, "card removed");
                true
            },
            None => false,
        }
    }

    /// Drop every card whose last update is older than the TTL.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<CardEntry> = {
            let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = cards
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.instance.last_updated_at) > self.ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| cards.remove(id)).collect()
        };
        for entry in &expired {
            entry.cancel.cancel();
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "evicted expired cards");
        }
        expired.len()
    }

    /// Token cancelled when the owning account stops.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn len(&self) -> usize {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`evict_expired`](Self::evict_expired) every `period` until the
    /// registry's shutdown token fires.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => {
                        debug!("card registry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.evict_expired();
                    }
                }
            }
        })
    }
}
