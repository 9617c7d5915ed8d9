use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use beacon_core::{
    inactivity::InactivityClaim,
    result::{validate_result, ChallengePeriod, ChallengeProof, DkgResult},
    selection::{select_group, PoolSnapshot},
    ChainParameters, GroupId, GroupPublicKey, MemberIndex, OperatorId, Seed,
    SelectionError, SessionClock, Signature,
};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::{
    chain::{ChainEvent, ChainEventKind, ChainView, GroupCreationState, TxHash},
    ChainError,
};

type Tamper = Box<dyn FnMut(DkgResult) -> DkgResult + Send>;

/// A result as the chain accepted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// The selection seed.
    pub seed: Seed,
    /// The stored result, after any tampering.
    pub result: DkgResult,
    /// The block it was mined in.
    pub block: u64,
    /// The operator that sent it.
    pub submitter: OperatorId,
}

/// A challenge that verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeRecord {
    /// The selection seed.
    pub seed: Seed,
    /// Why the result was invalid.
    pub proof: ChallengeProof,
    /// The operator that filed it.
    pub challenger: OperatorId,
    /// The block it was mined in.
    pub block: u64,
}

/// An accepted relay entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEntryRecord {
    /// The signing group.
    pub group_id: GroupId,
    /// The entry that was signed.
    pub previous_entry: Vec<u8>,
    /// The group signature over it.
    pub entry: Signature,
    /// The operator that sent it.
    pub submitter: OperatorId,
}

struct RegisteredGroup {
    public_key: GroupPublicKey,
    members: Vec<OperatorId>,
}

struct PendingSubmission {
    seed: Seed,
    members: Vec<OperatorId>,
    result: DkgResult,
    period: ChallengePeriod,
}

struct ChainState {
    block: u64,
    params: ChainParameters,
    pool: PoolSnapshot,
    creation: GroupCreationState,
    selected: BTreeMap<Seed, Vec<OperatorId>>,
    pending: Option<PendingSubmission>,
    closed: BTreeSet<Seed>,
    groups: BTreeMap<GroupId, RegisteredGroup>,
    relay_requests: BTreeMap<GroupId, Vec<u8>>,
    nonces: BTreeMap<GroupId, u64>,
    history: Vec<ChainEvent>,
    submissions: Vec<SubmissionRecord>,
    challenges: Vec<ChallengeRecord>,
    relay_entries: Vec<RelayEntryRecord>,
    claims: Vec<(InactivityClaim, MemberIndex)>,
    tamper: Option<Tamper>,
    silenced: BTreeSet<OperatorId>,
    failures: u32,
    transactions: u64,
}

impl ChainState {
    fn emit(&mut self, events: &broadcast::Sender<ChainEvent>, kind: ChainEventKind) {
        let log_index = self
            .history
            .iter()
            .rev()
            .take_while(|event| event.block == self.block)
            .count() as u32;
        let event = ChainEvent {
            block: self.block,
            log_index,
            removed: false,
            kind,
        };
        self.history.push(event.clone());
        // Nobody may be subscribed yet; history replays it.
        let _ = events.send(event);
    }

    fn tx_hash(&mut self, operator: &OperatorId, name: &str) -> TxHash {
        self.transactions += 1;
        let mut hasher = Sha256::new();
        hasher.update(operator.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(self.transactions.to_be_bytes());
        TxHash(hasher.finalize().into())
    }

    fn check_available(&mut self) -> Result<(), ChainError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ChainError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn member_index(members: &[OperatorId], operator: &OperatorId) -> Option<MemberIndex> {
        members
            .iter()
            .position(|member| member == operator)
            .and_then(|position| MemberIndex::from_position(position).ok())
    }
}

/// An in-memory chain shared by every node of a test network.
#[derive(Clone)]
pub struct LocalChain {
    state: Arc<Mutex<ChainState>>,
    events: broadcast::Sender<ChainEvent>,
    blocks: watch::Sender<u64>,
}

impl LocalChain {
    /// A chain at block 0 with the given parameters and operator pool.
    pub fn new(params: ChainParameters, pool: PoolSnapshot) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (blocks, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ChainState {
                block: 0,
                params,
                pool,
                creation: GroupCreationState::Idle,
                selected: BTreeMap::new(),
                pending: None,
                closed: BTreeSet::new(),
                groups: BTreeMap::new(),
                relay_requests: BTreeMap::new(),
                nonces: BTreeMap::new(),
                history: Vec::new(),
                submissions: Vec::new(),
                challenges: Vec::new(),
                relay_entries: Vec::new(),
                claims: Vec::new(),
                tamper: None,
                silenced: BTreeSet::new(),
                failures: 0,
                transactions: 0,
            })),
            events,
            blocks,
        }
    }

    /// The chain as seen by `operator`, who signs its transactions.
    pub fn client(&self, operator: OperatorId) -> Arc<dyn ChainView> {
        Arc::new(LocalChainClient {
            chain: self.clone(),
            operator,
        })
    }

    /// Mine a block. Returns its height.
    pub fn mine(&self) -> u64 {
        let block = {
            let mut state = self.state.lock();
            state.block += 1;
            state.block
        };
        self.blocks.send_replace(block);
        block
    }

    /// The latest block.
    pub fn block(&self) -> u64 {
        self.state.lock().block
    }

    /// Start a DKG for `seed` in the current block. Returns the start block.
    pub fn request_group(&self, seed: Seed) -> Result<u64, SelectionError> {
        let mut state = self.state.lock();
        let members = select_group(&seed, &state.pool, *state.params.group().group_size())?;
        state.selected.insert(seed, members);
        let start_block = state.block;
        state.creation = GroupCreationState::AwaitingResult { seed, start_block };
        state.emit(&self.events, ChainEventKind::DkgStarted { seed });
        Ok(start_block)
    }

    /// Replace the group creation parameters. Refused while a group is
    /// being created; nodes read the new values when the next DKG starts.
    pub fn update_parameters(&self, params: ChainParameters) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        if state.creation != GroupCreationState::Idle {
            return Err(ChainError::Rejected(
                "parameters are locked during group creation".into(),
            ));
        }
        debug!(?params, "group creation parameters updated");
        state.params = params;
        Ok(())
    }

    /// Ask `group_id` to sign `previous_entry`.
    pub fn request_relay_entry(&self, group_id: GroupId, previous_entry: Vec<u8>) {
        let mut state = self.state.lock();
        state.relay_requests.insert(group_id, previous_entry.clone());
        state.emit(
            &self.events,
            ChainEventKind::RelayEntryRequested {
                group_id,
                previous_entry,
            },
        );
    }

    /// Report the pending relay entry of `group_id` as timed out.
    pub fn report_relay_entry_timeout(&self, group_id: GroupId) {
        let mut state = self.state.lock();
        if state.relay_requests.remove(&group_id).is_some() {
            state.groups.remove(&group_id);
            state.emit(&self.events, ChainEventKind::RelayEntryTimedOut { group_id });
        }
    }

    /// The operators selected for `seed`.
    pub fn selected_members(&self, seed: &Seed) -> Option<Vec<OperatorId>> {
        self.state.lock().selected.get(seed).cloned()
    }

    /// The group creation state.
    pub fn creation_state(&self) -> GroupCreationState {
        self.state.lock().creation
    }

    /// Every result the chain accepted, in order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Every challenge that verified.
    pub fn challenges(&self) -> Vec<ChallengeRecord> {
        self.state.lock().challenges.clone()
    }

    /// Registered groups and their keys.
    pub fn registered_groups(&self) -> Vec<(GroupId, GroupPublicKey)> {
        self.state
            .lock()
            .groups
            .iter()
            .map(|(id, group)| (*id, group.public_key))
            .collect()
    }

    /// Every accepted relay entry.
    pub fn relay_entries(&self) -> Vec<RelayEntryRecord> {
        self.state.lock().relay_entries.clone()
    }

    /// Every accepted inactivity claim with the member that sent it.
    pub fn inactivity_claims(&self) -> Vec<(InactivityClaim, MemberIndex)> {
        self.state.lock().claims.clone()
    }

    /// Rewrite the next submitted result before storing it.
    pub fn tamper_submissions(&self, tamper: impl FnMut(DkgResult) -> DkgResult + Send + 'static) {
        self.state.lock().tamper = Some(Box::new(tamper));
    }

    /// Report transactions of `operator` as mined without applying them.
    pub fn drop_transactions_from(&self, operator: OperatorId) {
        self.state.lock().silenced.insert(operator);
    }

    /// Fail the next `count` calls of any client as unavailable.
    pub fn fail_next_calls(&self, count: u32) {
        self.state.lock().failures = count;
    }

    /// Re-deliver the latest event as removed by a re-org, then as mined
    /// again.
    pub fn reorg_last_event(&self) {
        let state = self.state.lock();
        if let Some(event) = state.history.last() {
            let removed = ChainEvent {
                removed: true,
                ..event.clone()
            };
            let _ = self.events.send(removed);
            let _ = self.events.send(event.clone());
        }
    }
}

struct LocalChainClient {
    chain: LocalChain,
    operator: OperatorId,
}

impl LocalChainClient {
    /// Lock the state for a call, failing it if a failure is injected.
    fn call(&self) -> Result<parking_lot::MutexGuard<'_, ChainState>, ChainError> {
        let mut state = self.chain.state.lock();
        state.check_available()?;
        Ok(state)
    }

    /// Lock the state for a transaction. `Ok(Err(hash))` means the sender is
    /// silenced: the transaction is reported mined and nothing else happens.
    fn transact(
        &self,
        name: &str,
    ) -> Result<Result<parking_lot::MutexGuard<'_, ChainState>, TxHash>, ChainError> {
        let mut state = self.call()?;
        if state.silenced.contains(&self.operator) {
            debug!(operator = %self.operator, name, "dropping transaction");
            return Ok(Err(state.tx_hash(&self.operator, name)));
        }
        Ok(Ok(state))
    }
}

#[async_trait]
impl ChainView for LocalChainClient {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.call()?.block)
    }

    async fn group_creation_state(&self) -> Result<GroupCreationState, ChainError> {
        Ok(self.call()?.creation)
    }

    async fn pool_snapshot(&self, _seed: &Seed) -> Result<PoolSnapshot, ChainError> {
        Ok(self.call()?.pool.clone())
    }

    async fn chain_parameters(&self) -> Result<ChainParameters, ChainError> {
        Ok(self.call()?.params)
    }

    async fn inactivity_nonce(&self, group_id: &GroupId) -> Result<u64, ChainError> {
        Ok(self.call()?.nonces.get(group_id).copied().unwrap_or(0))
    }

    async fn submit_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("submit_dkg_result")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        let (seed, start_block) = match state.creation {
            GroupCreationState::AwaitingResult { seed, start_block } => (seed, start_block),
            GroupCreationState::Challenge { .. } => return Err(ChainError::AlreadySubmitted),
            _ => return Err(ChainError::Rejected("no DKG awaits a result".into())),
        };
        let members = state.selected.get(&seed).cloned().unwrap_or_default();
        let submitter_index = *result.submitter_index();
        if members.get(submitter_index.position()) != Some(&self.operator) {
            return Err(ChainError::Rejected("submitter index is not the sender".into()));
        }
        let clock = SessionClock::new(
            start_block,
            *state.params.group().group_size(),
            *state.params.timings(),
        );
        if state.block < clock.submission_start_block() {
            return Err(ChainError::Rejected("submission has not started".into()));
        }

        let result = match state.tamper.take() {
            Some(mut tamper) => tamper(result.clone()),
            None => result.clone(),
        };
        let result_hash = result
            .hash(&seed)
            .map_err(|error| ChainError::Rejected(error.to_string()))?;
        let period = ChallengePeriod::open(
            result_hash,
            submitter_index,
            state.block,
            state.params.timings().challenge_period_blocks,
        );
        let block = state.block;
        state.submissions.push(SubmissionRecord {
            seed,
            result: result.clone(),
            block,
            submitter: self.operator,
        });
        state.pending = Some(PendingSubmission {
            seed,
            members,
            result: result.clone(),
            period,
        });
        state.creation = GroupCreationState::Challenge { seed, result_hash };
        state.emit(
            &self.chain.events,
            ChainEventKind::DkgResultSubmitted {
                seed,
                result_hash,
                result,
            },
        );
        Ok(state.tx_hash(&self.operator, "submit_dkg_result"))
    }

    async fn approve_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("approve_dkg_result")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        let Some(pending) = state.pending.as_ref() else {
            return Err(ChainError::AlreadySubmitted);
        };
        let seed = pending.seed;
        let result_hash = *pending.period.result_hash();
        if result.hash(&seed).ok() != Some(result_hash) {
            return Err(ChainError::Rejected("not the submitted result".into()));
        }
        let Some(approver) = ChainState::member_index(&pending.members, &self.operator) else {
            return Err(ChainError::Rejected("sender is not a member".into()));
        };
        let approval_precedence = state.params.timings().approval_precedence_blocks;
        if !pending
            .period
            .may_approve(approver, state.block, approval_precedence)
        {
            return Err(ChainError::Rejected("approval not allowed yet".into()));
        }

        let Some(pending) = state.pending.take() else {
            return Err(ChainError::AlreadySubmitted);
        };
        let public_key = *pending.result.group_public_key();
        let group_id = public_key
            .group_id()
            .map_err(|error| ChainError::Rejected(error.to_string()))?;
        state.groups.insert(
            group_id,
            RegisteredGroup {
                public_key,
                members: pending.members,
            },
        );
        state.closed.insert(seed);
        state.creation = GroupCreationState::Idle;
        state.emit(
            &self.chain.events,
            ChainEventKind::DkgResultApproved { seed, result_hash },
        );
        state.emit(
            &self.chain.events,
            ChainEventKind::GroupRegistered {
                seed,
                group_id,
                group_public_key: public_key,
            },
        );
        Ok(state.tx_hash(&self.operator, "approve_dkg_result"))
    }

    async fn challenge_dkg_result(&self, result: &DkgResult) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("challenge_dkg_result")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        let Some(pending) = state.pending.as_ref() else {
            return Err(ChainError::AlreadySubmitted);
        };
        let seed = pending.seed;
        let result_hash = *pending.period.result_hash();
        if result.hash(&seed).ok() != Some(result_hash) {
            return Err(ChainError::Rejected("not the submitted result".into()));
        }
        if !pending.period.is_open(state.block) {
            return Err(ChainError::Rejected("challenge period closed".into()));
        }
        let proof = match validate_result(
            &seed,
            &pending.members,
            state.params.group(),
            &pending.result,
        ) {
            Ok(_) => return Err(ChainError::Rejected("result is valid".into())),
            Err(proof) => proof,
        };

        let block = state.block;
        state.challenges.push(ChallengeRecord {
            seed,
            proof,
            challenger: self.operator,
            block,
        });
        state.pending = None;
        state.closed.insert(seed);
        state.creation = GroupCreationState::Idle;
        state.emit(
            &self.chain.events,
            ChainEventKind::DkgResultChallenged { seed, result_hash },
        );
        Ok(state.tx_hash(&self.operator, "challenge_dkg_result"))
    }

    async fn submit_relay_entry(
        &self,
        group_id: &GroupId,
        entry: &Signature,
        group_members: &[OperatorId],
    ) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("submit_relay_entry")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        let Some(previous_entry) = state.relay_requests.get(group_id).cloned() else {
            return Err(ChainError::AlreadySubmitted);
        };
        let Some(group) = state.groups.get(group_id) else {
            return Err(ChainError::Rejected("unknown group".into()));
        };
        if group.members != group_members {
            return Err(ChainError::Rejected("member list mismatch".into()));
        }
        group
            .public_key
            .verify(&previous_entry, entry)
            .map_err(|error| ChainError::Rejected(error.to_string()))?;

        state.relay_requests.remove(group_id);
        state.relay_entries.push(RelayEntryRecord {
            group_id: *group_id,
            previous_entry,
            entry: *entry,
            submitter: self.operator,
        });
        let bytes = entry
            .serialize()
            .map_err(|error| ChainError::Rejected(error.to_string()))?;
        state.emit(
            &self.chain.events,
            ChainEventKind::RelayEntrySubmitted {
                group_id: *group_id,
                entry: bytes,
            },
        );
        Ok(state.tx_hash(&self.operator, "submit_relay_entry"))
    }

    async fn notify_dkg_timeout(&self, seed: &Seed) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("notify_dkg_timeout")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        if state.closed.contains(seed) {
            return Err(ChainError::AlreadySubmitted);
        }
        let start_block = match state.creation {
            GroupCreationState::AwaitingResult {
                seed: awaited,
                start_block,
            } if awaited == *seed => start_block,
            _ => return Err(ChainError::Rejected("no DKG awaits a result".into())),
        };
        let clock = SessionClock::new(
            start_block,
            *state.params.group().group_size(),
            *state.params.timings(),
        );
        if !clock.dkg_timeout().is_elapsed(state.block) {
            return Err(ChainError::Rejected("DKG has not timed out".into()));
        }

        state.closed.insert(*seed);
        state.creation = GroupCreationState::Idle;
        state.emit(&self.chain.events, ChainEventKind::DkgTimedOut { seed: *seed });
        Ok(state.tx_hash(&self.operator, "notify_dkg_timeout"))
    }

    async fn notify_operator_inactivity(
        &self,
        claim: &InactivityClaim,
        submitter: MemberIndex,
    ) -> Result<TxHash, ChainError> {
        let mut state = match self.transact("notify_operator_inactivity")? {
            Ok(state) => state,
            Err(tx) => return Ok(tx),
        };
        let group_id = *claim.group_id();
        let Some(group) = state.groups.get(&group_id) else {
            return Err(ChainError::Rejected("unknown group".into()));
        };
        if group.members.get(submitter.position()) != Some(&self.operator) {
            return Err(ChainError::Rejected("submitter index is not the sender".into()));
        }
        claim
            .verify(&group.public_key)
            .map_err(|error| ChainError::Rejected(error.to_string()))?;
        let nonce = state.nonces.get(&group_id).copied().unwrap_or(0);
        if *claim.nonce() != nonce {
            return Err(ChainError::AlreadySubmitted);
        }

        state.nonces.insert(group_id, nonce + 1);
        state.claims.push((claim.clone(), submitter));
        Ok(state.tx_hash(&self.operator, "notify_operator_inactivity"))
    }

    async fn events(&self, from_block: u64) -> Result<BoxStream<'static, ChainEvent>, ChainError> {
        let state = self.call()?;
        // Subscribe before copying history so nothing falls in between.
        let live = self.chain.events.subscribe();
        let history = state
            .history
            .iter()
            .filter(|event| event.block >= from_block)
            .cloned()
            .collect::<Vec<_>>();
        drop(state);

        let live = stream::unfold(live, |mut live| async move {
            loop {
                match live.recv().await {
                    Ok(event) => return Some((event, live)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::iter(history).chain(live).boxed())
    }

    async fn blocks(&self) -> Result<BoxStream<'static, u64>, ChainError> {
        let current = self.call()?.block;
        let heights = self.chain.blocks.subscribe();
        let heights = stream::unfold(heights, |mut heights| async move {
            heights.changed().await.ok()?;
            let block = *heights.borrow_and_update();
            Some((block, heights))
        });
        Ok(stream::iter([current]).chain(heights).boxed())
    }
}
