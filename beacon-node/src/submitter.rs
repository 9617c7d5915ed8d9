//! The single writer in front of the chain's mutating calls.
//!
//! Every transaction of the node is funneled through one worker task, so
//! transactions are signed and sent strictly one after another and nonces
//! never race. Sessions only see an async `submit`.

use std::sync::Arc;

use beacon_core::{
    inactivity::InactivityClaim, result::DkgResult, GroupId, MemberIndex, OperatorId, Seed,
    Signature,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    chain::{ChainView, TxHash},
    config::BackoffPolicy,
    retry::with_backoff,
    NodeError,
};

/// A transaction the node wants mined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    /// Submit a DKG result.
    SubmitDkgResult(DkgResult),
    /// Approve the submitted DKG result.
    ApproveDkgResult(DkgResult),
    /// Challenge the submitted DKG result.
    ChallengeDkgResult(DkgResult),
    /// Submit a relay entry.
    SubmitRelayEntry {
        /// The signing group.
        group_id: GroupId,
        /// The aggregated signature.
        entry: Signature,
        /// The group's operators.
        members: Vec<OperatorId>,
    },
    /// Report a timed out DKG.
    NotifyDkgTimeout(Seed),
    /// Report inactive members.
    NotifyOperatorInactivity {
        /// The group-signed claim.
        claim: InactivityClaim,
        /// The member sending it.
        submitter: MemberIndex,
    },
}

impl Transaction {
    fn name(&self) -> &'static str {
        match self {
            Transaction::SubmitDkgResult(_) => "submit_dkg_result",
            Transaction::ApproveDkgResult(_) => "approve_dkg_result",
            Transaction::ChallengeDkgResult(_) => "challenge_dkg_result",
            Transaction::SubmitRelayEntry { .. } => "submit_relay_entry",
            Transaction::NotifyDkgTimeout(_) => "notify_dkg_timeout",
            Transaction::NotifyOperatorInactivity { .. } => "notify_operator_inactivity",
        }
    }
}

struct Request {
    transaction: Transaction,
    reply: oneshot::Sender<Result<TxHash, NodeError>>,
}

/// Handle to the transaction worker. Cheap to clone.
#[derive(Clone, Debug)]
pub struct TransactionQueue {
    requests: mpsc::Sender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("transaction", &self.transaction.name())
            .finish()
    }
}

impl TransactionQueue {
    /// Spawn the worker. It stops once every handle is dropped.
    pub fn spawn(
        chain: Arc<dyn ChainView>,
        policy: BackoffPolicy,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (requests, inbox) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(chain, policy, inbox));
        (Self { requests }, worker)
    }

    /// Queue `transaction` and wait until it was mined or failed.
    ///
    /// A transaction that lost the race against another member's fails
    /// with [`NodeError::SubmissionConflict`].
    pub async fn submit(&self, transaction: Transaction) -> Result<TxHash, NodeError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { transaction, reply })
            .await
            .map_err(|_| NodeError::Cancelled)?;
        response.await.map_err(|_| NodeError::Cancelled)?
    }
}

async fn run_worker(
    chain: Arc<dyn ChainView>,
    policy: BackoffPolicy,
    mut inbox: mpsc::Receiver<Request>,
) {
    while let Some(Request { transaction, reply }) = inbox.recv().await {
        let name = transaction.name();
        debug!(transaction = name, "sending transaction");
        let result = send(chain.as_ref(), &policy, &transaction).await;
        match &result {
            Ok(tx) => info!(transaction = name, %tx, "transaction mined"),
            Err(NodeError::SubmissionConflict) => {
                debug!(transaction = name, "transaction lost the race")
            }
            Err(error) => warn!(transaction = name, %error, "transaction failed"),
        }
        // The requester may have been cancelled meanwhile.
        let _ = reply.send(result);
    }
}

async fn send(
    chain: &dyn ChainView,
    policy: &BackoffPolicy,
    transaction: &Transaction,
) -> Result<TxHash, NodeError> {
    let name = transaction.name();
    with_backoff(policy, name, || async move {
        match transaction {
            Transaction::SubmitDkgResult(result) => chain.submit_dkg_result(result).await,
            Transaction::ApproveDkgResult(result) => chain.approve_dkg_result(result).await,
            Transaction::ChallengeDkgResult(result) => chain.challenge_dkg_result(result).await,
            Transaction::SubmitRelayEntry {
                group_id,
                entry,
                members,
            } => chain.submit_relay_entry(group_id, entry, members).await,
            Transaction::NotifyDkgTimeout(seed) => chain.notify_dkg_timeout(seed).await,
            Transaction::NotifyOperatorInactivity { claim, submitter } => {
                chain.notify_operator_inactivity(claim, *submitter).await
            }
        }
    })
    .await
}
