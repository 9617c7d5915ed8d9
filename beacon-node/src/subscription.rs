//! A chain event stream that survives dropped connections, filters
//! duplicates and honors re-orgs.

use std::{collections::BTreeSet, sync::Arc};

use futures::{stream::BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::{
    chain::{ChainEvent, ChainView, EventId},
    config::BackoffPolicy,
    retry::with_backoff,
    NodeError,
};

/// Remembers which events were already handed out.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: BTreeSet<EventId>,
    horizon_blocks: u64,
}

impl Deduplicator {
    /// Remember identities of the last `horizon_blocks` blocks.
    pub fn new(horizon_blocks: u64) -> Self {
        Self {
            seen: BTreeSet::new(),
            horizon_blocks,
        }
    }

    /// Whether `event` should be processed. A removed event forgets its
    /// identity and is never processed itself.
    pub fn admit(&mut self, event: &ChainEvent) -> bool {
        let id = event.id();
        if event.removed {
            self.seen.remove(&id);
            return false;
        }
        if !self.seen.insert(id) {
            return false;
        }
        let floor = id.block.saturating_sub(self.horizon_blocks);
        if self.seen.first().is_some_and(|oldest| oldest.block < floor) {
            self.seen = self.seen.split_off(&EventId {
                block: floor,
                log_index: 0,
            });
        }
        true
    }

    /// Number of remembered identities.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// A restartable, deduplicated stream of chain events.
///
/// When the underlying stream ends, the subscription reconnects with
/// backoff from the block of the last event it handed out, so nothing in
/// between is lost; the overlap is filtered out.
pub struct EventSubscription {
    chain: Arc<dyn ChainView>,
    policy: BackoffPolicy,
    next_block: u64,
    stream: Option<BoxStream<'static, ChainEvent>>,
    dedup: Deduplicator,
}

impl EventSubscription {
    /// Subscribe lazily from `from_block`.
    pub fn new(
        chain: Arc<dyn ChainView>,
        policy: BackoffPolicy,
        from_block: u64,
        horizon_blocks: u64,
    ) -> Self {
        Self {
            chain,
            policy,
            next_block: from_block,
            stream: None,
            dedup: Deduplicator::new(horizon_blocks),
        }
    }

    /// The next event not seen before. Fails only when reconnecting ran out
    /// of attempts.
    pub async fn next(&mut self) -> Result<ChainEvent, NodeError> {
        loop {
            if self.stream.is_none() {
                let chain = self.chain.clone();
                let from = self.next_block;
                let stream = with_backoff(&self.policy, "events", || {
                    let chain = chain.clone();
                    async move { chain.events(from).await }
                })
                .await?;
                debug!(from, "subscribed to chain events");
                self.stream = Some(stream);
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(event) => {
                    if event.removed {
                        debug!(id = ?event.id(), "event removed by re-org");
                    }
                    if self.dedup.admit(&event) {
                        self.next_block = self.next_block.max(event.block);
                        return Ok(event);
                    }
                }
                None => {
                    warn!(from = self.next_block, "event stream ended, resubscribing");
                    self.stream = None;
                }
            }
        }
    }
}
