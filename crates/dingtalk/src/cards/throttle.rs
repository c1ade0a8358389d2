//! Per-card update throttle.
//!
//! Each card gets at most one network update per interval. Requests that
//! arrive too early are parked in a single pending slot; a newer request
//! replaces the parked one, so the update that eventually goes out always
//! carries the latest content. After a successful update an inactivity timer
//! is armed; when it fires the card stops being tracked as streaming.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Mutex as AsyncMutex, oneshot},
        task::AbortHandle,
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{cards::registry::CardRegistry, error::Result};

/// Performs the network update of a card's content.
#[async_trait]
pub trait CardUpdater: Send + Sync {
    async fn update_card(&self, card_id: &str, content: &str, finalize: bool) -> Result<()>;
}

/// What happened to one update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The content went out in a network update.
    Sent,
    /// A newer request replaced this one before its slot fired.
    Superseded,
    /// The card was removed or the throttle shut down before the slot fired.
    Cancelled,
}

/// Throttle state of one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing pending. `last_sent` is when the previous update went out.
    Idle { last_sent: Option<Instant> },
    /// An update is parked until `due`.
    Scheduled { last_sent: Option<Instant>, due: Instant },
}

/// Side effect the caller must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Send the request right away.
    SendNow,
    /// Park the request and arm a timer.
    Arm { delay: Duration },
    /// Replace the parked request and re-arm the timer for the same slot.
    Rearm { delay: Duration },
}

impl SlotState {
    /// Apply an update request arriving at `now`.
    #[must_use]
    pub fn on_request(self, now: Instant, interval: Duration) -> (Self, Transition) {
        match self {
            Self::Idle { last_sent } => {
                let due = last_sent.map(|at| at + interval);
                match due {
                    Some(due) if due > now => (
                        Self::Scheduled { last_sent, due },
                        Transition::Arm { delay: due - now },
                    ),
                    _ => (
                        Self::Idle {
                            last_sent: Some(now),
                        },
                        Transition::SendNow,
                    ),
                }
            },
            Self::Scheduled { last_sent, due } => (
                Self::Scheduled { last_sent, due },
                Transition::Rearm {
                    delay: due.saturating_duration_since(now),
                },
            ),
        }
    }

    /// The scheduled slot fired at `now`; the parked update goes out.
    #[must_use]
    pub fn on_fire(self, now: Instant) -> Self {
        Self::Idle {
            last_sent: Some(now),
        }
    }
}

struct PendingUpdate {
    content: String,
    finalize: bool,
    reply: oneshot::Sender<Result<UpdateOutcome>>,
}

struct Slot {
    state: SlotState,
    /// Bumped by every request; timers armed under an older value are stale.
    generation: u64,
    pending: Option<PendingUpdate>,
    timer: Option<AbortHandle>,
    inactivity: Option<AbortHandle>,
    /// Serializes network updates so they land in slot order.
    send_lock: Arc<AsyncMutex<()>>,
}

impl Slot {
    fn new(last_sent: Option<Instant>) -> Self {
        Self {
            state: SlotState::Idle { last_sent },
            generation: 0,
            pending: None,
            timer: None,
            inactivity: None,
            send_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    fn abort_timers(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        if let Some(handle) = self.inactivity.take() {
            handle.abort();
        }
    }
}

enum Action {
    Send {
        content: String,
        send_lock: Arc<AsyncMutex<()>>,
    },
    Wait(oneshot::Receiver<Result<UpdateOutcome>>),
}

struct Inner {
    updater: Arc<dyn CardUpdater>,
    registry: Arc<CardRegistry>,
    interval: Duration,
    inactivity: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Shared handle to the throttle. Cheap to clone.
#[derive(Clone)]
pub struct CardThrottle {
    inner: Arc<Inner>,
}

impl CardThrottle {
    pub fn new(
        updater: Arc<dyn CardUpdater>,
        registry: Arc<CardRegistry>,
        interval: Duration,
        inactivity: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                updater,
                registry,
                interval,
                inactivity,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Request an update of `card_id` to `content`.
    ///
    /// Resolves once the request was sent, superseded by a newer one, or
    /// cancelled. Network errors are returned to the caller whose content
    /// was being sent; 403/404/410 additionally evict the card. Cards missing
    /// from the registry (evicted or never registered) are not updated.
    pub async fn update(
        &self,
        card_id: &str,
        content: impl Into<String>,
        finalize: bool,
    ) -> Result<UpdateOutcome> {
        if !self.inner.registry.contains(card_id) {
            debug!(card_id, "card not registered, skipping update");
            return Ok(UpdateOutcome::Cancelled);
        }
        let content = content.into();
        let now = Instant::now();

        let action = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(card_id.to_string()).or_insert_with(|| {
                Slot::new(
                    self.inner
                        .registry
                        .get(card_id)
                        .map(|card| card.last_updated_at),
                )
            });
            if let Some(handle) = slot.inactivity.take() {
                handle.abort();
            }
            slot.generation += 1;

            let (state, transition) = slot.state.on_request(now, self.inner.interval);
            slot.state = state;
            match transition {
                Transition::SendNow => Action::Send {
                    content,
                    send_lock: Arc::clone(&slot.send_lock),
                },
                Transition::Arm { delay } | Transition::Rearm { delay } => {
                    if let Some(handle) = slot.timer.take() {
                        handle.abort();
                    }
                    let (reply, rx) = oneshot::channel();
                    let mut finalize = finalize;
                    if let Some(previous) = slot.pending.take() {
                        finalize |= previous.finalize;
                        let _ = previous.reply.send(Ok(UpdateOutcome::Superseded));
                    }
                    slot.pending = Some(PendingUpdate {
                        content,
                        finalize,
                        reply,
                    });
                    slot.timer = Some(self.spawn_slot_timer(card_id, delay, slot.generation));
                    debug!(card_id, delay_ms = delay.as_millis() as u64, "card update scheduled");
                    Action::Wait(rx)
                },
            }
        };

        match action {
            Action::Send { content, send_lock } => {
                self.execute(card_id, &content, finalize, &send_lock).await?;
                Ok(UpdateOutcome::Sent)
            },
            Action::Wait(rx) => rx.await.unwrap_or(Ok(UpdateOutcome::Cancelled)),
        }
    }

    /// Whether `card_id` is still streaming (has a live throttle slot).
    pub fn is_active(&self, card_id: &str) -> bool {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(card_id)
    }

    pub fn active_count(&self) -> usize {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }

    /// Abort every timer and drop every pending update.
    pub fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for mut slot in drained {
            slot.abort_timers();
        }
    }

    fn cancel_token(&self, card_id: &str) -> CancellationToken {
        self.inner
            .registry
            .cancel_token(card_id)
            .unwrap_or_else(|| self.inner.registry.shutdown_token().child_token())
    }

    fn spawn_slot_timer(&self, card_id: &str, delay: Duration, generation: u64) -> AbortHandle {
        let throttle = self.clone();
        let card_id = card_id.to_string();
        let cancel = self.cancel_token(&card_id);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    throttle.drop_slot(&card_id);
                }
                _ = tokio::time::sleep(delay) => {
                    throttle.fire(&card_id, generation).await;
                }
            }
        })
        .abort_handle()
    }

    fn spawn_inactivity_timer(&self, card_id: &str, generation: u64) -> AbortHandle {
        let throttle = self.clone();
        let card_id = card_id.to_string();
        let cancel = self.cancel_token(&card_id);
        let wait = self.inner.inactivity;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    throttle.drop_slot(&card_id);
                }
                _ = tokio::time::sleep(wait) => {
                    let mut slots = throttle.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
                    let idle = slots
                        .get(&card_id)
                        .is_some_and(|slot| slot.generation == generation && slot.pending.is_none());
                    if idle {
                        slots.remove(&card_id);
                        debug!(card_id = %card_id, "card stream finalized after inactivity");
                    }
                }
            }
        })
        .abort_handle()
    }

    async fn fire(&self, card_id: &str, generation: u64) {
        let (pending, send_lock) = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            let Some(slot) = slots.get_mut(card_id) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            let Some(pending) = slot.pending.take() else {
                return;
            };
            slot.timer = None;
            slot.state = slot.state.on_fire(Instant::now());
            (pending, Arc::clone(&slot.send_lock))
        };

        let result = self
            .execute(card_id, &pending.content, pending.finalize, &send_lock)
            .await
            .map(|()| UpdateOutcome::Sent);
        let _ = pending.reply.send(result);
    }

    /// Network update shared by the immediate and the scheduled path.
    async fn execute(
        &self,
        card_id: &str,
        content: &str,
        finalize: bool,
        send_lock: &AsyncMutex<()>,
    ) -> Result<()> {
        let _guard = send_lock.lock().await;
        match self.inner.updater.update_card(card_id, content, finalize).await {
            Ok(()) => {
                self.inner.registry.touch(card_id);
                let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
                let settled = slots
                    .get(card_id)
                    .is_some_and(|slot| slot.pending.is_none());
                if settled && finalize {
                    if let Some(mut slot) = slots.remove(card_id) {
                        slot.abort_timers();
                    }
                } else if settled && let Some(slot) = slots.get_mut(card_id) {
                    if let Some(handle) = slot.inactivity.take() {
                        handle.abort();
                    }
                    slot.inactivity = Some(self.spawn_inactivity_timer(card_id, slot.generation));
                }
                Ok(())
            },
            Err(err) => {
                if err.is_terminal_card_status() {
                    warn!(card_id, error = %err, "card no longer updatable, evicting");
                    self.inner.registry.remove(card_id);
                    self.drop_slot(card_id);
                }
                Err(err)
            },
        }
    }

    fn drop_slot(&self, card_id: &str) {
        let removed = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(card_id)
        };
        if let Some(mut slot) = removed {
            slot.abort_timers();
        }
    }
}
