//! The node's view of the chain: reads, the mutating calls, and the event
//! and block streams.

use async_trait::async_trait;
use beacon_core::{
    inactivity::InactivityClaim, result::DkgResult, selection::PoolSnapshot, ChainParameters,
    GroupId, GroupPublicKey, MemberIndex, OperatorId, ResultHash, Seed, Signature,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::ChainError;

/// Hash of a mined transaction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl std::fmt::Debug for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TxHash").field(&hex::encode(self.0)).finish()
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Where the chain is in creating the next group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCreationState {
    /// No group creation requested.
    Idle,
    /// A new group was requested; the seed is not known yet.
    AwaitingSeed,
    /// The DKG for `seed` runs since `start_block`; a result is expected.
    AwaitingResult {
        /// The selection seed.
        seed: Seed,
        /// The block the DKG started at.
        start_block: u64,
    },
    /// A result was submitted and its challenge period runs.
    Challenge {
        /// The selection seed.
        seed: Seed,
        /// The hash of the submitted result.
        result_hash: ResultHash,
    },
}

/// What happened on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEventKind {
    /// A DKG started with `seed`.
    DkgStarted {
        /// The selection seed.
        seed: Seed,
    },
    /// A DKG result was submitted.
    DkgResultSubmitted {
        /// The selection seed.
        seed: Seed,
        /// The hash of the submitted result.
        result_hash: ResultHash,
        /// The result as submitted.
        result: DkgResult,
    },
    /// A challenge against the submitted result verified.
    DkgResultChallenged {
        /// The selection seed.
        seed: Seed,
        /// The hash of the challenged result.
        result_hash: ResultHash,
    },
    /// The submitted result was approved.
    DkgResultApproved {
        /// The selection seed.
        seed: Seed,
        /// The hash of the approved result.
        result_hash: ResultHash,
    },
    /// The DKG for `seed` was reported timed out.
    DkgTimedOut {
        /// The selection seed.
        seed: Seed,
    },
    /// A group was registered after approval.
    GroupRegistered {
        /// The selection seed the group was formed with.
        seed: Seed,
        /// The new group.
        group_id: GroupId,
        /// Its public key.
        group_public_key: GroupPublicKey,
    },
    /// `group_id` is asked to sign the next relay entry.
    RelayEntryRequested {
        /// The signing group.
        group_id: GroupId,
        /// The entry to sign.
        previous_entry: Vec<u8>,
    },
    /// The relay entry was submitted.
    RelayEntrySubmitted {
        /// The signing group.
        group_id: GroupId,
        /// The new entry.
        entry: Vec<u8>,
    },
    /// The relay entry request hit its hard timeout.
    RelayEntryTimedOut {
        /// The group that failed to sign.
        group_id: GroupId,
    },
}

/// An event log entry. The same entry may be delivered more than once, and
/// a re-org re-delivers it with `removed` set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    /// The block the entry was mined in.
    pub block: u64,
    /// Position of the entry within its block.
    pub log_index: u32,
    /// Set when a re-org dropped the entry.
    pub removed: bool,
    /// The payload.
    pub kind: ChainEventKind,
}

/// The identity of an event log entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    /// The block the entry was mined in.
    pub block: u64,
    /// Position of the entry within its block.
    pub log_index: u32,
}

impl ChainEvent {
    /// The identity used for deduplication.
    pub fn id(&self) -> EventId {
        EventId {
            block: self.block,
            log_index: self.log_index,
        }
    }
}

/// Read access to chain state plus the mutating calls the node makes.
///
/// Every call may be slow or fail; callers wrap them with
/// [`with_backoff`](crate::retry::with_backoff). Mutating calls go through
/// the [`TransactionQueue`](crate::submitter::TransactionQueue) only.
#[async_trait]
pub trait ChainView: Send + Sync {
    /// The latest block height.
    async fn current_block(&self) -> Result<u64, ChainError>;

    /// The group creation state.
    async fn group_creation_state(&self) -> Result<GroupCreationState, ChainError>;

    /// The sortition pool as of the selection of `seed`.
    async fn pool_snapshot(&self, seed: &Seed) -> Result<PoolSnapshot, ChainError>;

    /// Group and timing parameters in force.
    async fn chain_parameters(&self) -> Result<ChainParameters, ChainError>;

    /// The next nonce of inactivity claims against `group_id`.
    async fn inactivity_nonce(&self, group_id: &GroupId) -> Result<u64, ChainError>;

    /// Submit a DKG result.
    async fn submit_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError>;

    /// Approve the submitted DKG result after its challenge period.
    async fn approve_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError>;

    /// Challenge the submitted DKG result as inconsistent.
    async fn challenge_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError>;

    /// Submit a relay entry signed by `group_id`.
    async fn submit_relay_entry(
        &self,
        group_id: &GroupId,
        entry: &Signature,
        group_members: &[OperatorId],
    ) -> Result<TxHash, ChainError>;

    /// Report that the DKG for `seed` timed out.
    async fn notify_dkg_timeout(&self, seed: &Seed) -> Result<TxHash, ChainError>;

    /// Report inactive members of a group.
    async fn notify_operator_inactivity(
        &self,
        claim: &InactivityClaim,
        submitter: MemberIndex,
    ) -> Result<TxHash, ChainError>;

    /// Events from `from_block` on, followed by the live tail. The stream
    /// ends when the connection drops.
    async fn events(&self, from_block: u64) -> Result<BoxStream<'static, ChainEvent>, ChainError>;

    /// New block heights as they are mined. The stream ends when the
    /// connection drops.
    async fn blocks(&self) -> Result<BoxStream<'static, u64>, ChainError>;
}
