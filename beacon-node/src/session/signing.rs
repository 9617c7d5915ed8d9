//! Threshold signing sessions: relay entries and inactivity claims.

use std::collections::{BTreeMap, BTreeSet};

use beacon_core::{
    clock::{claim_proposal_deadline, relay_entry_deadlines},
    inactivity::{submission_delay_blocks, InactivityClaim},
    signing::{SigningFailure, SigningKind, TimeoutKind},
    Deadline, DeadlineKind, GroupId, KeyPackage, MemberIndex, OperatorId, ProtocolTimings,
    PublicKeyPackage, SessionId, Signature, SigningSession,
};
use futures::StreamExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{decode, SessionContext, SessionStatus};
use crate::{
    cancel::CancelToken, submitter::Transaction, transport::Subscription, wire::SessionMessage,
    NodeError,
};

/// How a signing session ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SigningEnd {
    /// The group signature was aggregated and handed to the chain.
    Signed(Signature),
    /// The soft timeout elapsed first.
    SoftTimeout {
        /// Members to accuse of inactivity. For a relay entry this is the set
        /// the group converged on, otherwise the locally missing signers.
        accused: BTreeSet<MemberIndex>,
    },
}

#[derive(Debug)]
pub(crate) struct SigningReport {
    pub(crate) group_id: GroupId,
    pub(crate) kind: SigningKind,
    pub(crate) result: Result<SigningEnd, NodeError>,
}

/// One member's part in a threshold signature of its group.
pub(crate) struct SigningTask {
    pub(crate) ctx: SessionContext,
    pub(crate) group_id: GroupId,
    pub(crate) members: Vec<OperatorId>,
    pub(crate) index: MemberIndex,
    pub(crate) kind: SigningKind,
    pub(crate) requested_at_block: u64,
    pub(crate) key_package: Option<KeyPackage>,
    pub(crate) public_key_package: PublicKeyPackage,
    pub(crate) timings: ProtocolTimings,
    pub(crate) cancel: CancelToken,
}

impl SigningTask {
    /// The session signing `kind` for `group_id`.
    pub(crate) fn session_id(group_id: &GroupId, kind: &SigningKind) -> SessionId {
        SessionId::signing(group_id, &kind.message(group_id))
    }

    pub(crate) async fn run(mut self) -> SigningReport {
        let session = Self::session_id(&self.group_id, &self.kind);
        let what = match self.kind {
            SigningKind::RelayEntry { .. } => "relay_entry",
            SigningKind::InactivityClaim { .. } => "inactivity_claim",
        };
        let span = info_span!("signing", %session, group = %self.group_id, member = %self.index, what);
        let result = self.execute(session).instrument(span).await;

        let status = match &result {
            Ok(SigningEnd::Signed(_)) => SessionStatus::Completed,
            Ok(SigningEnd::SoftTimeout { .. }) => SessionStatus::Failed("soft timeout".into()),
            Err(NodeError::Cancelled) => SessionStatus::Cancelled,
            Err(error) => SessionStatus::Failed(error.to_string()),
        };
        self.ctx.board.set_session(session, status);

        SigningReport {
            group_id: self.group_id,
            kind: self.kind,
            result,
        }
    }

    async fn execute(&mut self, session: SessionId) -> Result<SigningEnd, NodeError> {
        let mut inbound = self.ctx.transport.subscribe(session, self.index)?;
        let mut signing = SigningSession::new(
            self.group_id,
            self.kind.clone(),
            self.key_package.clone(),
            self.public_key_package.clone(),
        );
        if let Some(partial) = signing.start()? {
            self.ctx
                .broadcast(session, self.index, &SessionMessage::Partial(partial))
                .await?;
        }
        self.ctx
            .board
            .set_session(session, SessionStatus::Signing(signing.state().clone()));

        let (soft, _) = relay_entry_deadlines(self.requested_at_block, &self.timings);
        let mut soft = self.ctx.supervisor.schedule(session, soft);
        let mut cancel = self.cancel.clone();

        let signature = loop {
            if let Some(signature) = signing.try_aggregate()? {
                break signature;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = &mut soft => {
                    let block = fired?;
                    self.ctx.metrics.signing_timeouts();
                    let Some(SigningFailure::Timeout { missing, .. }) = signing.on_timeout(TimeoutKind::Soft) else {
                        continue;
                    };
                    warn!(block, ?missing, "soft timeout before enough partial signatures");
                    self.ctx
                        .board
                        .set_session(session, SessionStatus::Signing(signing.state().clone()));
                    let accused = match self.kind {
                        SigningKind::RelayEntry { .. } => {
                            self.agree_on_accused(session, missing, &mut inbound).await?
                        }
                        SigningKind::InactivityClaim { .. } => missing,
                    };
                    return Ok(SigningEnd::SoftTimeout { accused });
                }
                envelope = inbound.next() => {
                    let envelope = envelope
                        .ok_or_else(|| NodeError::Transport("subscription closed".into()))?;
                    match decode(&envelope, &self.ctx.metrics) {
                        Some(SessionMessage::Partial(partial)) => {
                            if let Err(error) = signing.receive(envelope.sender, partial) {
                                self.ctx.metrics.verification_failures();
                                warn!(sender = %envelope.sender, %error, "rejected partial signature");
                            }
                        }
                        Some(_) => debug!(sender = %envelope.sender, "ignoring non-signing message"),
                        None => {}
                    }
                }
            }
        };

        self.ctx.metrics.signatures_completed();
        self.ctx
            .board
            .set_session(session, SessionStatus::Signing(signing.state().clone()));
        info!(signers = signing.partials().len(), "group signature aggregated");

        let signers = signing.partials().keys().copied().collect::<BTreeSet<_>>();
        let delay = submission_delay_blocks(
            self.index,
            &signers,
            self.timings.inactivity_claim_delay_step_blocks,
        );
        if delay > 0 {
            let at = self.ctx.supervisor.current_block() + delay;
            let timer = self
                .ctx
                .supervisor
                .schedule(session, Deadline::new(DeadlineKind::SignatureSubmission, at));
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = timer => { fired?; }
            }
        }

        let transaction = match &self.kind {
            SigningKind::RelayEntry { .. } => Transaction::SubmitRelayEntry {
                group_id: self.group_id,
                entry: signature,
                members: self.members.clone(),
            },
            SigningKind::InactivityClaim { nonce, accused } => Transaction::NotifyOperatorInactivity {
                claim: InactivityClaim::new(self.group_id, *nonce, accused.clone(), signature),
                submitter: self.index,
            },
        };
        match self.ctx.queue.submit(transaction).await {
            Ok(tx) => info!(%tx, "signature submitted"),
            Err(NodeError::SubmissionConflict) => debug!("another member submitted first"),
            Err(NodeError::ChainRejected(reason)) => warn!(%reason, "submission rejected"),
            Err(error) => return Err(error),
        }
        Ok(SigningEnd::Signed(signature))
    }

    /// Exchange views of who failed to sign and adopt the proposal of the
    /// lowest-indexed proposer heard before the window closes. Members that
    /// hear the same proposals start the same claim session.
    async fn agree_on_accused(
        &mut self,
        session: SessionId,
        missing: BTreeSet<MemberIndex>,
        inbound: &mut Subscription,
    ) -> Result<BTreeSet<MemberIndex>, NodeError> {
        let mut proposals = BTreeMap::new();
        if !missing.is_empty() {
            self.ctx
                .broadcast(session, self.index, &SessionMessage::ClaimProposal(missing.clone()))
                .await?;
            proposals.insert(self.index, missing);
        }

        let deadline = claim_proposal_deadline(self.requested_at_block, &self.timings);
        let mut deadline = self.ctx.supervisor.schedule(session, deadline);
        let mut cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                fired = &mut deadline => {
                    fired?;
                    break;
                }
                envelope = inbound.next() => {
                    let envelope = envelope
                        .ok_or_else(|| NodeError::Transport("subscription closed".into()))?;
                    match decode(&envelope, &self.ctx.metrics) {
                        Some(SessionMessage::ClaimProposal(accused)) => {
                            if is_plausible_claim(self.members.len(), envelope.sender, &accused) {
                                proposals.insert(envelope.sender, accused);
                            } else {
                                self.ctx.metrics.verification_failures();
                                warn!(sender = %envelope.sender, ?accused, "rejected claim proposal");
                            }
                        }
                        Some(_) => debug!(sender = %envelope.sender, "ignoring late signing message"),
                        None => {}
                    }
                }
            }
        }

        let adopted = proposals.into_iter().next();
        if let Some((proposer, accused)) = &adopted {
            info!(%proposer, ?accused, "adopted inactivity claim proposal");
        }
        Ok(adopted.map(|(_, accused)| accused).unwrap_or_default())
    }
}

/// A proposal accuses group members other than its sender.
fn is_plausible_claim(
    group_size: usize,
    sender: MemberIndex,
    accused: &BTreeSet<MemberIndex>,
) -> bool {
    usize::from(sender.get()) <= group_size
        && !accused.is_empty()
        && !accused.contains(&sender)
        && accused
            .iter()
            .all(|member| usize::from(member.get()) <= group_size)
}

#[cfg(test)]
mod tests {
    use beacon_core::tests::helpers::{index, indices};

    use super::*;

    #[test]
    fn claim_proposals_must_accuse_other_members() {
        assert!(is_plausible_claim(5, index(1), &indices(&[3, 4, 5])));
        assert!(!is_plausible_claim(5, index(3), &indices(&[3, 4])));
        assert!(!is_plausible_claim(5, index(1), &BTreeSet::new()));
        assert!(!is_plausible_claim(5, index(1), &indices(&[2, 6])));
        assert!(!is_plausible_claim(5, index(6), &indices(&[2])));
    }
}
