//! The DKG session task: key generation rounds, result arbitration and
//! on-chain publication of one group.

use std::collections::BTreeSet;

use beacon_core::{
    keys::dkg::{Dkg, DkgFailure, DkgOutcome, Message, Outgoing, Transition},
    result::{
        validate_result, ChallengePeriod, ChallengeProof, DkgResult, ResultArbiter,
        ResultContent, SignedResult, SubmissionPrecedence,
    },
    ChainParameters, Deadline, DeadlineKind, Error, Group, GroupPublicKey, GroupState, KeyPackage,
    MemberIndex, OperatorId, PublicKeyPackage, ResultHash, Seed, SessionClock, SessionId,
};
use futures::StreamExt;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{decode, elapsed, PublicationPhase, SessionContext, SessionStatus};
use crate::{
    cancel::CancelToken,
    chain::{ChainEvent, ChainEventKind, GroupCreationState},
    retry::with_backoff,
    submitter::Transaction,
    transport::Subscription,
    wire::SessionMessage,
    NodeError,
};

/// Key material of an approved group.
#[derive(Debug)]
pub(crate) struct GroupKeys {
    pub(crate) key_package: Option<KeyPackage>,
    pub(crate) public_key_package: PublicKeyPackage,
}

/// How a DKG session ended.
#[derive(Debug)]
pub(crate) struct DkgReport {
    pub(crate) seed: Seed,
    pub(crate) index: MemberIndex,
    pub(crate) group: Group,
    /// `Ok(None)` if the group was approved but the local member holds no
    /// usable share of it.
    pub(crate) outcome: Result<Option<GroupKeys>, NodeError>,
}

/// A DKG attempt that computed a key.
struct Computed {
    attempt: u32,
    session: SessionId,
    clock: SessionClock,
    outcome: DkgOutcome,
    inbound: Subscription,
    early: Vec<(MemberIndex, SignedResult)>,
}

enum Attempt {
    Computed(Box<Computed>),
    Failed(DkgFailure),
}

/// Who announced itself for a retried attempt.
struct Announced {
    inbound: Subscription,
    present: BTreeSet<MemberIndex>,
    /// Round messages of members that started before the local deadline fired.
    early: Vec<(MemberIndex, Message)>,
}

/// The DKG of the local member in the group selected by `seed`.
pub(crate) struct DkgTask {
    pub(crate) ctx: SessionContext,
    pub(crate) seed: Seed,
    pub(crate) start_block: u64,
    pub(crate) members: Vec<OperatorId>,
    pub(crate) index: MemberIndex,
    pub(crate) params: ChainParameters,
    /// Result events of this seed, routed by the node.
    pub(crate) events: mpsc::Receiver<ChainEvent>,
    pub(crate) cancel: CancelToken,
}

impl DkgTask {
    /// The id under which the session's status is reported: the id of its
    /// first attempt.
    pub(crate) fn status_id(seed: &Seed) -> SessionId {
        SessionId::dkg(seed, 0)
    }

    fn report(&self, status: SessionStatus) {
        self.ctx.board.set_session(Self::status_id(&self.seed), status);
    }

    pub(crate) async fn run(mut self) -> DkgReport {
        let mut group = Group::new(self.members.clone(), self.start_block);
        let outcome = self.execute(&mut group).await;

        match &outcome {
            Ok(_) => {
                self.ctx.metrics.dkg_completed();
                self.report(SessionStatus::Completed);
            }
            Err(error) => {
                if !group.state().is_final() {
                    // Only legal transitions are attempted; a group that is
                    // already final stays as it is.
                    let _ = group.terminate();
                }
                self.ctx.metrics.dkg_failed();
                match error {
                    NodeError::Cancelled => self.report(SessionStatus::Cancelled),
                    error => self.report(SessionStatus::Failed(error.to_string())),
                }
            }
        }

        DkgReport {
            seed: self.seed,
            index: self.index,
            group,
            outcome,
        }
    }

    async fn execute(&mut self, group: &mut Group) -> Result<Option<GroupKeys>, NodeError> {
        group.start_dkg()?;
        let max_attempts = self.ctx.config.session.max_dkg_attempts.max(1);
        let group_size = *self.params.group().group_size();
        let honest_threshold = usize::from(*self.params.group().honest_threshold());

        let mut clock = SessionClock::new(self.start_block, group_size, *self.params.timings());
        let mut session = SessionId::dkg(&self.seed, 0);
        let mut span = info_span!("dkg", %session, member = %self.index, attempt = 0u32);
        let mut inbound = self.ctx.transport.subscribe(session, self.index)?;
        let mut excluded = BTreeSet::new();
        let mut early = Vec::new();

        for attempt in 0..max_attempts {
            let result = self
                .attempt(attempt, session, clock, &excluded, inbound, early)
                .instrument(span.clone())
                .await?;
            let failure = match result {
                Attempt::Computed(computed) => {
                    return self.publish(*computed, group).instrument(span).await;
                }
                Attempt::Failed(failure) => failure,
            };
            span.in_scope(|| warn!(?failure, "DKG attempt failed"));
            if attempt + 1 == max_attempts {
                return Err(NodeError::DkgFailed(failure));
            }

            // The next attempt runs on the chain's schedule with the members
            // that announced themselves for it.
            let next = attempt + 1;
            session = SessionId::dkg(&self.seed, next);
            span = info_span!("dkg", %session, member = %self.index, attempt = next);
            self.wait_for(session, clock.retry_deadline())
                .instrument(span.clone())
                .await?;
            self.check_still_awaiting().await?;
            let announced = self
                .announce(next, session, clock.announcement_deadline())
                .instrument(span.clone())
                .await?;
            if announced.present.len() < honest_threshold {
                return Err(NodeError::DkgFailed(DkgFailure::QuorumNotReached {
                    round: 0,
                    qualified: announced.present.len(),
                    required: honest_threshold,
                }));
            }
            excluded = MemberIndex::all(group_size)
                .filter(|member| !announced.present.contains(member))
                .collect();
            span.in_scope(|| info!(?excluded, "retrying DKG"));
            inbound = announced.inbound;
            early = announced.early;
            clock = clock.next_attempt();
        }
        Err(NodeError::Protocol(Error::InvalidState("DKG attempts exhausted")))
    }

    /// Announce the local member for `attempt` and gather the other
    /// announcements until `deadline`.
    async fn announce(
        &mut self,
        attempt: u32,
        session: SessionId,
        deadline: Deadline,
    ) -> Result<Announced, NodeError> {
        let mut inbound = self.ctx.transport.subscribe(session, self.index)?;
        self.report(SessionStatus::Announcing { attempt });
        self.ctx
            .broadcast(session, self.index, &SessionMessage::Announcement)
            .await?;

        let group_size = *self.params.group().group_size();
        let mut present = BTreeSet::from([self.index]);
        let mut early = Vec::new();
        let mut cancel = self.cancel.clone();
        let mut deadline = self.ctx.supervisor.schedule(session, deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = &mut deadline => {
                    let block = fired?;
                    debug!(block, present = present.len(), "announcements closed");
                    break;
                }
                envelope = inbound.next() => {
                    let envelope = envelope
                        .ok_or_else(|| NodeError::Transport("subscription closed".into()))?;
                    match decode(&envelope, &self.ctx.metrics) {
                        Some(SessionMessage::Announcement) if envelope.sender.get() <= group_size => {
                            present.insert(envelope.sender);
                        }
                        Some(SessionMessage::Dkg(message)) => early.push((envelope.sender, message)),
                        Some(_) => debug!(sender = %envelope.sender, "ignoring message before the rounds"),
                        None => {}
                    }
                }
            }
        }
        Ok(Announced {
            inbound,
            present,
            early,
        })
    }

    /// Fail with [`NodeError::SeedUnavailable`] unless the chain still waits
    /// for a result of this seed.
    async fn check_still_awaiting(&self) -> Result<(), NodeError> {
        let chain = self.ctx.chain.clone();
        let state = with_backoff(&self.ctx.config.retry, "group_creation_state", || {
            chain.group_creation_state()
        })
        .await?;
        match state {
            GroupCreationState::AwaitingResult { seed, .. } if seed == self.seed => Ok(()),
            _ => Err(NodeError::SeedUnavailable),
        }
    }

    async fn wait_for(&mut self, session: SessionId, deadline: Deadline) -> Result<u64, NodeError> {
        let timer = self.ctx.supervisor.schedule(session, deadline);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
            fired = timer => fired,
        }
    }

    async fn send(&self, session: SessionId, outgoing: Vec<Outgoing>) -> Result<(), NodeError> {
        for out in outgoing {
            match out {
                Outgoing::Broadcast(message) => {
                    self.ctx
                        .broadcast(session, self.index, &SessionMessage::Dkg(message))
                        .await?
                }
                Outgoing::Direct(recipient, message) => {
                    self.ctx
                        .send_to(session, self.index, recipient, &SessionMessage::Dkg(message))
                        .await?
                }
            }
        }
        Ok(())
    }

    /// Run the three key generation rounds of one attempt.
    async fn attempt(
        &mut self,
        attempt: u32,
        session: SessionId,
        clock: SessionClock,
        excluded: &BTreeSet<MemberIndex>,
        mut inbound: Subscription,
        buffered: Vec<(MemberIndex, Message)>,
    ) -> Result<Attempt, NodeError> {
        let mut dkg = Dkg::new(self.index, *self.params.group(), excluded.clone())?;
        let mut early = Vec::new();

        let outgoing = dkg.start(&mut OsRng)?;
        for (sender, message) in buffered {
            self.receive(&mut dkg, sender, message);
        }
        self.report(SessionStatus::Dkg {
            attempt,
            state: dkg.state(),
        });
        self.send(session, outgoing).await?;

        let mut cancel = self.cancel.clone();
        for round in 1..=3u8 {
            let mut deadline = self.ctx.supervisor.schedule(session, clock.round_deadline(round));
            let mut timed_out = false;
            while !dkg.is_round_complete() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                    fired = &mut deadline => {
                        let block = fired?;
                        debug!(round, block, "round deadline elapsed");
                        timed_out = true;
                        break;
                    }
                    envelope = inbound.next() => {
                        let envelope = envelope
                            .ok_or_else(|| NodeError::Transport("subscription closed".into()))?;
                        let Some(message) = decode(&envelope, &self.ctx.metrics) else {
                            continue;
                        };
                        match message {
                            SessionMessage::Dkg(message) => {
                                self.receive(&mut dkg, envelope.sender, message)
                            }
                            SessionMessage::Result(candidate) => {
                                early.push((envelope.sender, candidate))
                            }
                            SessionMessage::Partial(_)
                            | SessionMessage::Announcement
                            | SessionMessage::ClaimProposal(_) => {
                                debug!(sender = %envelope.sender, "ignoring message outside the rounds")
                            }
                        }
                    }
                }
            }
            if timed_out {
                self.ctx.metrics.rounds_timed_out();
            } else {
                self.ctx.metrics.rounds_completed();
            }

            let invalid_before = dkg.invalid_shares().len();
            let transition = dkg.advance()?;
            for dealer in dkg.invalid_shares().iter().skip(invalid_before) {
                self.ctx.metrics.verification_failures();
                warn!(%dealer, "share failed verification");
            }
            match transition {
                Transition::Continue(outgoing) => {
                    debug!(round, state = dkg.state().name(), "round closed");
                    self.report(SessionStatus::Dkg {
                        attempt,
                        state: dkg.state(),
                    });
                    self.send(session, outgoing).await?;
                }
                Transition::Completed(outcome) => {
                    info!(misbehaved = ?outcome.misbehaved(), "group key computed");
                    return Ok(Attempt::Computed(Box::new(Computed {
                        attempt,
                        session,
                        clock,
                        outcome: *outcome,
                        inbound,
                        early,
                    })));
                }
                Transition::Failed(failure) => {
                    self.ctx.metrics.rounds_failed();
                    self.report(SessionStatus::Dkg {
                        attempt,
                        state: dkg.state(),
                    });
                    return Ok(Attempt::Failed(failure));
                }
            }
        }
        Err(NodeError::Protocol(Error::InvalidState(dkg.state().name())))
    }

    fn receive(&self, dkg: &mut Dkg, sender: MemberIndex, message: Message) {
        match dkg.receive(sender, message) {
            Ok(()) => {}
            Err(error @ Error::LateMessage { .. }) => debug!(%sender, %error, "late message"),
            Err(error) => {
                self.ctx.metrics.verification_failures();
                warn!(%sender, %error, "rejected DKG message");
            }
        }
    }

    fn collect(&self, arbiter: &mut ResultArbiter, sender: MemberIndex, candidate: SignedResult) {
        if let Err(error) = arbiter.collect_candidate(sender, candidate) {
            self.ctx.metrics.verification_failures();
            warn!(%sender, %error, "rejected result candidate");
        }
    }

    /// Agree on the result, submit it in precedence order and follow it
    /// through its challenge period.
    async fn publish(
        &mut self,
        computed: Computed,
        group: &mut Group,
    ) -> Result<Option<GroupKeys>, NodeError> {
        let Computed {
            attempt,
            session,
            clock,
            outcome,
            mut inbound,
            early,
        } = computed;
        let params = *self.params.group();
        let timings = *self.params.timings();
        let (group_public_key, misbehaved, public_key_package, key_package) =
            outcome.into_parts();

        let mut arbiter = ResultArbiter::new(self.seed, self.members.clone(), params)?;
        let content = ResultContent::new(group_public_key, misbehaved.clone(), &self.members);
        let local_hash = content.hash(&self.seed)?;
        if !misbehaved.contains(&self.index) {
            let signed = SignedResult::sign(&self.seed, content, &self.ctx.operator)?;
            arbiter.collect_candidate(self.index, signed.clone())?;
            self.ctx
                .broadcast(session, self.index, &SessionMessage::Result(signed))
                .await?;
        }
        for (sender, candidate) in early {
            self.collect(&mut arbiter, sender, candidate);
        }

        self.report(SessionStatus::Publication(
            PublicationPhase::CollectingSignatures,
        ));
        let expected = MemberIndex::all(*params.group_size())
            .filter(|member| !misbehaved.contains(member))
            .collect::<BTreeSet<_>>();
        let mut cancel = self.cancel.clone();
        let mut deadline = self
            .ctx
            .supervisor
            .schedule(session, clock.result_signing_deadline());
        while !expected.is_subset(&arbiter.signers()) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = &mut deadline => {
                    let block = fired?;
                    debug!(block, signers = arbiter.signers().len(), "result signing closed");
                    break;
                }
                envelope = inbound.next() => {
                    let envelope = envelope
                        .ok_or_else(|| NodeError::Transport("subscription closed".into()))?;
                    if let Some(SessionMessage::Result(candidate)) = decode(&envelope, &self.ctx.metrics) {
                        self.collect(&mut arbiter, envelope.sender, candidate);
                    }
                }
            }
        }

        let canonical = match arbiter.finalize(self.index) {
            Ok(result) => Some(result),
            Err(Error::NoCanonicalResult) => {
                warn!(buckets = arbiter.bucket_count(), "no result reached the quorum");
                None
            }
            Err(error) => return Err(error.into()),
        };
        let canonical_hash = match &canonical {
            Some(result) => {
                group.result_computed(*result.group_public_key())?;
                Some(result.hash(&self.seed)?)
            }
            None => None,
        };
        if canonical_hash.is_some_and(|hash| hash != local_hash) {
            warn!("canonical result differs from the local DKG outcome");
        }

        let precedence = canonical.as_ref().map(|result| {
            SubmissionPrecedence::new(
                &self.seed.for_attempt(attempt),
                *params.group_size(),
                result.misbehaved_members(),
                clock.submission_start_block(),
                timings.submission_window_blocks,
            )
        });
        let slot_opens_at = precedence
            .as_ref()
            .and_then(|precedence| precedence.eligible_from(self.index));
        self.report(SessionStatus::Publication(
            PublicationPhase::AwaitingSubmission { slot_opens_at },
        ));

        let mut slot = slot_opens_at.map(|at| {
            self.ctx
                .supervisor
                .schedule(session, Deadline::new(DeadlineKind::SubmissionSlot, at))
        });
        let mut timeout = Some(self.ctx.supervisor.schedule(session, clock.dkg_timeout()));
        let mut approval = None;
        let mut submitted: Option<(ChallengePeriod, DkgResult)> = None;
        let mut proof: Option<ChallengeProof> = None;
        // The latest result on chain and its key, whether or not it validated.
        let mut on_chain: Option<(ResultHash, GroupPublicKey)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = elapsed(&mut slot) => {
                    slot = None;
                    let block = fired?;
                    if let (None, Some(result)) = (&submitted, &canonical) {
                        info!(block, "submission slot open, submitting result");
                        self.submit(Transaction::SubmitDkgResult(result.clone())).await?;
                    }
                }
                fired = elapsed(&mut timeout) => {
                    timeout = None;
                    let block = fired?;
                    if submitted.is_none() {
                        warn!(block, "no result submitted before the DKG timeout");
                        self.submit(Transaction::NotifyDkgTimeout(self.seed)).await?;
                        return Err(NodeError::DkgTimedOut);
                    }
                }
                fired = elapsed(&mut approval) => {
                    approval = None;
                    let block = fired?;
                    if let Some((period, result)) = &submitted {
                        if period.may_approve(self.index, block, timings.approval_precedence_blocks) {
                            info!(block, "challenge period over, approving result");
                            self.submit(Transaction::ApproveDkgResult(result.clone())).await?;
                        }
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(NodeError::Cancelled);
                    };
                    match event.kind {
                        ChainEventKind::DkgResultSubmitted { result_hash, result, .. } => {
                            if submitted.as_ref().is_some_and(|(period, _)| *period.result_hash() == result_hash) {
                                continue;
                            }
                            slot = None;
                            on_chain = Some((result_hash, *result.group_public_key()));
                            match validate_result(&self.seed, &self.members, &params, &result) {
                                Ok(hash) => {
                                    if group.group_public_key().is_none() {
                                        group.result_computed(*result.group_public_key())?;
                                    }
                                    let period = ChallengePeriod::open(
                                        hash,
                                        *result.submitter_index(),
                                        event.block,
                                        timings.challenge_period_blocks,
                                    );
                                    let approve_at = if *result.submitter_index() == self.index {
                                        *period.closes_at_block()
                                    } else {
                                        period.closes_at_block() + timings.approval_precedence_blocks
                                    };
                                    info!(
                                        submitter = %result.submitter_index(),
                                        closes_at = period.closes_at_block(),
                                        "result submitted"
                                    );
                                    approval = Some(self.ctx.supervisor.schedule(
                                        session,
                                        Deadline::new(DeadlineKind::ApprovalPrecedence, approve_at),
                                    ));
                                    self.report(SessionStatus::Publication(
                                        PublicationPhase::ChallengePeriod {
                                            result_hash: hash,
                                            closes_at_block: *period.closes_at_block(),
                                        },
                                    ));
                                    submitted = Some((period, result));
                                }
                                Err(inconsistency) => {
                                    warn!(?inconsistency, "submitted result is inconsistent, challenging");
                                    if group.group_public_key().is_none() {
                                        group.result_computed(*result.group_public_key())?;
                                    }
                                    proof = Some(inconsistency);
                                    if self.submit(Transaction::ChallengeDkgResult(result)).await? {
                                        self.ctx.metrics.challenges_filed();
                                    }
                                }
                            }
                        }
                        ChainEventKind::DkgResultChallenged { result_hash, .. } => {
                            if *group.state() == GroupState::ResultPendingSubmission {
                                group.challenge()?;
                            }
                            error!(%result_hash, "challenge verified, group terminated; members of the result risk slashing");
                            return Err(NodeError::ChallengeVerified(proof));
                        }
                        ChainEventKind::DkgResultApproved { result_hash, .. } => {
                            let approved_key = match on_chain {
                                Some((hash, key)) if hash == result_hash => key,
                                _ => {
                                    warn!(%result_hash, "approved result was never seen submitted");
                                    (*group.group_public_key())
                                        .ok_or(NodeError::Protocol(Error::InvalidState("no group key")))?
                                }
                            };
                            group.activate(approved_key, event.block, timings.group_lifetime_blocks)?;
                            info!(%result_hash, block = event.block, "group active");
                            return Ok(self.keys_for(
                                result_hash,
                                local_hash,
                                key_package,
                                public_key_package,
                            ));
                        }
                        ChainEventKind::DkgTimedOut { .. } => return Err(NodeError::DkgTimedOut),
                        _ => {}
                    }
                }
                envelope = inbound.next() => {
                    let Some(envelope) = envelope else {
                        return Err(NodeError::Transport("subscription closed".into()));
                    };
                    if let Some(SessionMessage::Result(candidate)) = decode(&envelope, &self.ctx.metrics) {
                        self.collect(&mut arbiter, envelope.sender, candidate);
                    }
                }
            }
        }
    }

    /// Queue a transaction. Returns whether it was mined; losing the race
    /// against another member is not an error.
    async fn submit(&self, transaction: Transaction) -> Result<bool, NodeError> {
        let counts_as_submission = matches!(transaction, Transaction::SubmitDkgResult(_));
        match self.ctx.queue.submit(transaction).await {
            Ok(_) => {
                if counts_as_submission {
                    self.ctx.metrics.results_submitted();
                }
                Ok(true)
            }
            Err(NodeError::SubmissionConflict) => {
                debug!("another member's transaction was mined first");
                Ok(false)
            }
            Err(NodeError::ChainRejected(reason)) => {
                warn!(%reason, "transaction rejected");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// The key material to keep for the approved result.
    fn keys_for(
        &self,
        approved: ResultHash,
        local: ResultHash,
        key_package: Option<KeyPackage>,
        public_key_package: PublicKeyPackage,
    ) -> Option<GroupKeys> {
        if approved != local {
            warn!("approved result differs from the local DKG outcome, holding no key share");
            return None;
        }
        Some(GroupKeys {
            key_package,
            public_key_package,
        })
    }
}

impl Drop for DkgTask {
    fn drop(&mut self) {
        for attempt in 0..self.ctx.config.session.max_dkg_attempts.max(1) {
            self.ctx
                .supervisor
                .cancel_session(&SessionId::dkg(&self.seed, attempt));
        }
    }
}
