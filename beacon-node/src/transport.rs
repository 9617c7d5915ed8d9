//! The session-scoped message transport.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use beacon_core::{MemberIndex, SessionId};
use futures::{stream::BoxStream, Stream};

use crate::NodeError;

/// A message as delivered to a session.
///
/// The transport authenticates `sender`; a session never trusts an index
/// carried inside the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The session the message belongs to.
    pub session: SessionId,
    /// The authenticated sender.
    pub sender: MemberIndex,
    /// `None` for broadcasts.
    pub recipient: Option<MemberIndex>,
    /// The encoded [`SessionMessage`](crate::wire::SessionMessage).
    pub payload: Vec<u8>,
}

/// Delivery of session messages among group members.
///
/// Delivery is at least once and unordered across senders. Messages sent
/// before the recipient subscribed are still delivered to it.
#[async_trait]
pub trait RoundTransport: Send + Sync {
    /// Send `payload` to every other member of the session.
    async fn broadcast(
        &self,
        session: SessionId,
        sender: MemberIndex,
        payload: Vec<u8>,
    ) -> Result<(), NodeError>;

    /// Send `payload` to `recipient` only.
    async fn send_to(
        &self,
        session: SessionId,
        sender: MemberIndex,
        recipient: MemberIndex,
        payload: Vec<u8>,
    ) -> Result<(), NodeError>;

    /// Receive the messages of `session` addressed to `member`.
    fn subscribe(&self, session: SessionId, member: MemberIndex) -> Result<Subscription, NodeError>;
}

/// The inbound messages of one session. Dropping it unsubscribes.
pub struct Subscription {
    inbound: BoxStream<'static, Envelope>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a stream; `on_drop` releases the transport-side registration.
    pub fn new(
        inbound: BoxStream<'static, Envelope>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            inbound,
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.as_mut().poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
