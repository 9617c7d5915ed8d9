//! The block-tick driver of every session deadline.
//!
//! Sessions register their deadlines and wait on the returned [`Timer`].
//! The supervisor follows the chain's block stream and fires each timer
//! once its block is reached, so all members time out in the same block
//! window regardless of wall-clock drift.

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use beacon_core::{Deadline, SessionId};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::{chain::ChainView, config::BackoffPolicy, retry::with_backoff, NodeError};

struct Pending {
    session: SessionId,
    deadline: Deadline,
    fire: oneshot::Sender<u64>,
}

struct Inner {
    block: watch::Sender<u64>,
    pending: Mutex<BTreeMap<u64, Vec<Pending>>>,
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Resolves with the block height at which its deadline elapsed.
#[derive(Debug)]
pub struct Timer {
    fired: oneshot::Receiver<u64>,
}

impl Future for Timer {
    type Output = Result<u64, NodeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.fired)
            .poll(cx)
            .map(|fired| fired.map_err(|_| NodeError::Cancelled))
    }
}

impl Supervisor {
    /// A supervisor that has seen `block` last.
    pub fn new(block: u64) -> Self {
        let (block, _) = watch::channel(block);
        Self {
            inner: Arc::new(Inner {
                block,
                pending: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// The latest block seen.
    pub fn current_block(&self) -> u64 {
        *self.inner.block.borrow()
    }

    /// Receives every new block height.
    pub fn blocks(&self) -> watch::Receiver<u64> {
        self.inner.block.subscribe()
    }

    /// Fire a timer when `deadline` elapses. A deadline that already
    /// elapsed fires right away.
    pub fn schedule(&self, session: SessionId, deadline: Deadline) -> Timer {
        let (fire, fired) = oneshot::channel();
        let mut pending = self.inner.pending.lock();
        let current = self.current_block();
        if deadline.is_elapsed(current) {
            let _ = fire.send(current);
        } else {
            pending.entry(deadline.at_block).or_default().push(Pending {
                session,
                deadline,
                fire,
            });
        }
        Timer { fired }
    }

    /// Forget every deadline of `session`.
    pub fn cancel_session(&self, session: &SessionId) {
        let mut pending = self.inner.pending.lock();
        for entries in pending.values_mut() {
            entries.retain(|entry| entry.session != *session);
        }
        pending.retain(|_, entries| !entries.is_empty());
    }

    /// Deadlines not fired yet.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().values().map(Vec::len).sum()
    }

    /// A new block was observed. Heights that do not advance are ignored.
    /// Returns how many deadlines fired.
    pub fn tick(&self, block: u64) -> usize {
        let mut pending = self.inner.pending.lock();
        if !self.inner.block.send_if_modified(|current| {
            if block > *current {
                *current = block;
                true
            } else {
                false
            }
        }) {
            return 0;
        }

        let later = pending.split_off(&(block + 1));
        let due = std::mem::replace(&mut *pending, later);
        drop(pending);

        let mut fired = 0;
        for entry in due.into_values().flatten() {
            trace!(session = %entry.session, kind = ?entry.deadline.kind, block, "deadline elapsed");
            // A dropped timer belongs to a session that already moved on.
            if entry.fire.send(block).is_ok() {
                fired += 1;
            }
        }
        fired
    }

    /// Follow the chain's block stream until `shutdown` is set, resubscribing
    /// whenever the stream ends.
    pub async fn run(
        self,
        chain: Arc<dyn ChainView>,
        policy: BackoffPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NodeError> {
        loop {
            let mut blocks = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                blocks = with_backoff(&policy, "blocks", || chain.blocks()) => blocks?,
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    block = blocks.next() => match block {
                        Some(block) => {
                            let fired = self.tick(block);
                            if fired > 0 {
                                debug!(block, fired, "deadlines elapsed");
                            }
                        }
                        None => {
                            warn!("block stream ended, resubscribing");
                            break;
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::DeadlineKind;

    use super::*;

    fn session(byte: u8) -> SessionId {
        SessionId::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn timers_fire_at_their_block() {
        let supervisor = Supervisor::new(10);
        let early = supervisor.schedule(session(1), Deadline::new(DeadlineKind::DkgRound(1), 12));
        let late = supervisor.schedule(session(1), Deadline::new(DeadlineKind::DkgRound(2), 15));
        assert_eq!(supervisor.pending(), 2);

        assert_eq!(supervisor.tick(11), 0);
        assert_eq!(supervisor.tick(13), 1);
        assert_eq!(early.await, Ok(13));
        assert_eq!(supervisor.tick(15), 1);
        assert_eq!(late.await, Ok(15));
        assert_eq!(supervisor.pending(), 0);
    }

    #[tokio::test]
    async fn elapsed_deadlines_fire_immediately() {
        let supervisor = Supervisor::new(20);
        let timer = supervisor.schedule(session(1), Deadline::new(DeadlineKind::ResultSigning, 20));
        assert_eq!(timer.await, Ok(20));
    }

    #[tokio::test]
    async fn stale_heights_are_ignored() {
        let supervisor = Supervisor::new(20);
        let _timer = supervisor.schedule(session(1), Deadline::new(DeadlineKind::DkgTimeout, 21));
        assert_eq!(supervisor.tick(19), 0);
        assert_eq!(supervisor.current_block(), 20);
        assert_eq!(supervisor.pending(), 1);
    }

    #[tokio::test]
    async fn cancelled_sessions_never_fire() {
        let supervisor = Supervisor::new(0);
        let timer = supervisor.schedule(session(1), Deadline::new(DeadlineKind::DkgRound(1), 5));
        let _other = supervisor.schedule(session(2), Deadline::new(DeadlineKind::DkgRound(1), 5));
        supervisor.cancel_session(&session(1));
        assert_eq!(supervisor.pending(), 1);
        assert_eq!(timer.await, Err(NodeError::Cancelled));
    }
}
