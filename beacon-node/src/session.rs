//! Session tasks and what they share.
//!
//! Every DKG and every signing request runs as its own task. Tasks talk to
//! the outside world only through the transport, the transaction queue and
//! the routed chain events they are handed; they publish their progress on
//! the [`StatusBoard`].

pub(crate) mod dkg;
pub(crate) mod signing;

use std::{collections::HashMap, sync::Arc};

use beacon_core::{
    keys::dkg::DkgState, operator::OperatorKey, signing::SigningState, GroupId, GroupState,
    MemberIndex, ResultHash, Seed, SessionId,
};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::{
    chain::ChainView,
    config::NodeConfig,
    metrics::Metrics,
    submitter::TransactionQueue,
    supervisor::{Supervisor, Timer},
    transport::{Envelope, RoundTransport},
    wire::SessionMessage,
    NodeError,
};

/// Where a DKG stands once its key was computed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PublicationPhase {
    /// Collecting signatures over result candidates.
    CollectingSignatures,
    /// Waiting for a submission, the local one included once its slot
    /// opens at `slot_opens_at`.
    AwaitingSubmission {
        /// `None` if the local member is not eligible to submit.
        slot_opens_at: Option<u64>,
    },
    /// A consistent result was submitted; its challenge period runs.
    ChallengePeriod {
        /// The submitted result.
        result_hash: ResultHash,
        /// The block the period closes at.
        closes_at_block: u64,
    },
}

/// The state of a session as reported to the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// Running DKG rounds.
    Dkg {
        /// 0 for the first attempt.
        attempt: u32,
        /// The DKG state machine's state.
        state: DkgState,
    },
    /// Collecting announcements before a retried DKG attempt.
    Announcing {
        /// The attempt about to start.
        attempt: u32,
    },
    /// Agreeing on, submitting and approving the DKG result.
    Publication(PublicationPhase),
    /// Threshold signing.
    Signing(SigningState),
    /// Finished successfully.
    Completed,
    /// Finished without success.
    Failed(String),
    /// Cancelled before finishing.
    Cancelled,
}

/// What a node knows about one group it is a member of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    /// Known once the DKG computed the group key.
    pub group_id: Option<GroupId>,
    /// Lifecycle state.
    pub state: GroupState,
    /// The local member's index.
    pub member_index: MemberIndex,
    /// Whether the node holds a key share usable for signing.
    pub has_key_share: bool,
}

/// Latest status of every session and group, readable by the handle.
#[derive(Debug, Default)]
pub(crate) struct StatusBoard {
    sessions: RwLock<HashMap<SessionId, SessionStatus>>,
    groups: RwLock<HashMap<Seed, GroupStatus>>,
}

impl StatusBoard {
    pub(crate) fn set_session(&self, session: SessionId, status: SessionStatus) {
        self.sessions.write().insert(session, status);
    }

    pub(crate) fn session(&self, session: &SessionId) -> Option<SessionStatus> {
        self.sessions.read().get(session).cloned()
    }

    pub(crate) fn set_group(&self, seed: Seed, status: GroupStatus) {
        self.groups.write().insert(seed, status);
    }

    pub(crate) fn group(&self, seed: &Seed) -> Option<GroupStatus> {
        self.groups.read().get(seed).cloned()
    }

    pub(crate) fn groups(&self) -> Vec<(Seed, GroupStatus)> {
        self.groups
            .read()
            .iter()
            .map(|(seed, status)| (*seed, status.clone()))
            .collect()
    }
}

/// Everything a session task needs from its node.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) operator: Arc<OperatorKey>,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) transport: Arc<dyn RoundTransport>,
    pub(crate) queue: TransactionQueue,
    pub(crate) supervisor: Supervisor,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) board: Arc<StatusBoard>,
    pub(crate) config: Arc<NodeConfig>,
}

impl SessionContext {
    /// Encode and broadcast `message`.
    pub(crate) async fn broadcast(
        &self,
        session: SessionId,
        sender: MemberIndex,
        message: &SessionMessage,
    ) -> Result<(), NodeError> {
        self.transport
            .broadcast(session, sender, message.serialize()?)
            .await
    }

    /// Encode and send `message` to `recipient`.
    pub(crate) async fn send_to(
        &self,
        session: SessionId,
        sender: MemberIndex,
        recipient: MemberIndex,
        message: &SessionMessage,
    ) -> Result<(), NodeError> {
        self.transport
            .send_to(session, sender, recipient, message.serialize()?)
            .await
    }
}

/// Decode an inbound envelope. Undecodable payloads are logged and
/// dropped.
pub(crate) fn decode(envelope: &Envelope, metrics: &Metrics) -> Option<SessionMessage> {
    match SessionMessage::deserialize(&envelope.payload) {
        Ok(message) => Some(message),
        Err(error) => {
            metrics.verification_failures();
            warn!(sender = %envelope.sender, %error, "dropping undecodable message");
            None
        }
    }
}

/// Wait for an optional timer; never resolves without one.
pub(crate) async fn elapsed(timer: &mut Option<Timer>) -> Result<u64, NodeError> {
    match timer {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}
