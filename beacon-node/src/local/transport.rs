use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use beacon_core::{MemberIndex, SessionId};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    transport::{Envelope, RoundTransport, Subscription},
    NodeError,
};

/// Rewrites or drops envelopes in flight.
pub trait TransportFault: Send {
    /// The envelope to deliver instead, or `None` to drop it.
    fn intercept(&mut self, envelope: Envelope) -> Option<Envelope>;
}

impl<F> TransportFault for F
where
    F: FnMut(Envelope) -> Option<Envelope> + Send,
{
    fn intercept(&mut self, envelope: Envelope) -> Option<Envelope> {
        self(envelope)
    }
}

#[derive(Default)]
struct Mailboxes {
    /// Every envelope sent per session, replayed to late subscribers.
    history: HashMap<SessionId, Vec<Envelope>>,
    subscribers: HashMap<(SessionId, MemberIndex), mpsc::UnboundedSender<Envelope>>,
    fault: Option<Box<dyn TransportFault>>,
}

fn addressed_to(envelope: &Envelope, member: MemberIndex) -> bool {
    match envelope.recipient {
        Some(recipient) => recipient == member,
        None => envelope.sender != member,
    }
}

/// Routes session messages between the nodes of one process.
#[derive(Clone, Default)]
pub struct LocalTransport {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl LocalTransport {
    /// An empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass every envelope sent from now on through `fault`.
    pub fn set_fault(&self, fault: impl TransportFault + 'static) {
        self.mailboxes.lock().fault = Some(Box::new(fault));
    }

    /// Deliver envelopes unchanged again.
    pub fn clear_fault(&self) {
        self.mailboxes.lock().fault = None;
    }

    fn deliver(&self, envelope: Envelope) {
        let mut mailboxes = self.mailboxes.lock();
        let envelope = match mailboxes.fault.as_mut() {
            Some(fault) => match fault.intercept(envelope) {
                Some(envelope) => envelope,
                None => return,
            },
            None => envelope,
        };
        trace!(session = %envelope.session, sender = %envelope.sender, "delivering");
        for ((session, member), inbox) in &mailboxes.subscribers {
            if *session == envelope.session && addressed_to(&envelope, *member) {
                // A closed inbox belongs to a subscription being dropped.
                let _ = inbox.send(envelope.clone());
            }
        }
        mailboxes
            .history
            .entry(envelope.session)
            .or_default()
            .push(envelope);
    }
}

#[async_trait]
impl RoundTransport for LocalTransport {
    async fn broadcast(
        &self,
        session: SessionId,
        sender: MemberIndex,
        payload: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.deliver(Envelope {
            session,
            sender,
            recipient: None,
            payload,
        });
        Ok(())
    }

    async fn send_to(
        &self,
        session: SessionId,
        sender: MemberIndex,
        recipient: MemberIndex,
        payload: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.deliver(Envelope {
            session,
            sender,
            recipient: Some(recipient),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, session: SessionId, member: MemberIndex) -> Result<Subscription, NodeError> {
        let (inbox, inbound) = mpsc::unbounded_channel();
        {
            let mut mailboxes = self.mailboxes.lock();
            let key = (session, member);
            if mailboxes
                .subscribers
                .get(&key)
                .is_some_and(|existing| !existing.is_closed())
            {
                return Err(NodeError::Transport(format!(
                    "member {member} already subscribed to session {session}"
                )));
            }
            for envelope in mailboxes.history.get(&session).into_iter().flatten() {
                if addressed_to(envelope, member) {
                    let _ = inbox.send(envelope.clone());
                }
            }
            mailboxes.subscribers.insert(key, inbox);
        }

        let inbound = stream::unfold(inbound, |mut inbound| async move {
            inbound.recv().await.map(|envelope| (envelope, inbound))
        })
        .boxed();
        let mailboxes = self.mailboxes.clone();
        Ok(Subscription::new(inbound, move || {
            mailboxes.lock().subscribers.remove(&(session, member));
        }))
    }
}
