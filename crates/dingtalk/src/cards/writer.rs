//! Reply text streamed into one card.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    cards::{
        client::{CardClient, CardTarget},
        registry::CardRegistry,
        throttle::{CardThrottle, UpdateOutcome},
    },
    error::Result,
};

#[derive(Debug, Default)]
struct WriterState {
    content: String,
    finalized: bool,
}

/// Owns the latest reply content of a card and feeds it to the throttle.
///
/// Background updates read the content when they run rather than when they
/// are queued, and are skipped once the card is finalized, so a late partial
/// update can never overwrite the final text.
#[derive(Clone)]
pub struct CardWriter {
    card_id: String,
    throttle: CardThrottle,
    state: Arc<Mutex<WriterState>>,
}

impl CardWriter {
    pub fn new(card_id: impl Into<String>, throttle: CardThrottle) -> Self {
        Self {
            card_id: card_id.into(),
            throttle,
            state: Arc::new(Mutex::new(WriterState::default())),
        }
    }

    /// Create a card showing `initial`, deliver it to `target` and register
    /// it so the throttle and the sweeper track it.
    pub async fn open(
        cards: &CardClient,
        target: &CardTarget,
        initial: &str,
        registry: &CardRegistry,
        throttle: CardThrottle,
    ) -> Result<Self> {
        let card_id = cards.create_card(target, initial).await?;
        registry.register(&card_id, target.conversation_id());
        Ok(Self::new(card_id, throttle))
    }

    #[must_use]
    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    #[must_use]
    pub fn content(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .content
            .clone()
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).finalized
    }

    /// Replace the content and push it without waiting for the network.
    pub fn push(&self, content: impl Into<String>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finalized {
                return;
            }
            state.content = content.into();
        }
        let writer = self.clone();
        tokio::spawn(async move {
            let content = {
                let state = writer.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.finalized {
                    return;
                }
                state.content.clone()
            };
            if let Err(e) = writer.throttle.update(&writer.card_id, content, false).await {
                debug!(card_id = %writer.card_id, error = %e, "partial card update failed");
            }
        });
    }

    /// Send the final content and close the card's stream. `None` keeps the
    /// content accumulated so far.
    pub async fn finalize(&self, content: Option<String>) -> Result<UpdateOutcome> {
        let content = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(content) = content {
                state.content = content;
            }
            state.finalized = true;
            state.content.clone()
        };
        self.throttle.update(&self.card_id, content, true).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::cards::throttle::tests::setup, std::time::Duration};

    #[tokio::test(start_paused = true)]
    async fn partial_pushes_coalesce_into_final() {
        let (throttle, updater, registry, _shutdown) = setup();
        registry.register("card-1", "cid-1");
        let writer = CardWriter::new("card-1", throttle);

        writer.push("one");
        writer.push("one two");
        tokio::task::yield_now().await;
        let outcome = writer.finalize(Some("one two three".into())).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Sent);

        let calls = updater.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, "one two three");
        assert!(calls[0].finalize);
    }

    #[tokio::test(start_paused = true)]
    async fn late_partial_push_is_dropped_after_finalize() {
        let (throttle, updater, registry, _shutdown) = setup();
        registry.register("card-1", "cid-1");
        let writer = CardWriter::new("card-1", throttle);

        writer.push("draft");
        // Finalize before the spawned partial update got a chance to run.
        writer.finalize(Some("final".into())).await.unwrap();
        writer.push("stale");
        tokio::time::sleep(Duration::from_secs(2)).await;

        let calls = updater.calls();
        assert!(calls.iter().all(|call| call.content == "final"));
        assert!(calls.iter().any(|call| call.finalize));
        assert_eq!(writer.content(), "final");
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_without_content_keeps_accumulated_text() {
        let (throttle, updater, registry, _shutdown) = setup();
        registry.register("card-1", "cid-1");
        let writer = CardWriter::new("card-1", throttle);
        writer.push("kept");
        writer.finalize(None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let last = updater.calls().pop().unwrap();
        assert_eq!(last.content, "kept");
        assert!(last.finalize);
        assert!(writer.is_finalized());
    }
}
