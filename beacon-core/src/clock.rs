//! Block-height deadlines. The chain is the only clock every member shares,
//! so every protocol deadline is a block number.

use serde::{Deserialize, Serialize};

use crate::ProtocolTimings;

/// What a deadline guards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadlineKind {
    /// A DKG round (1, 2 or 3) closes.
    DkgRound(u8),
    /// Collection of DKG result signatures ends.
    ResultSigning,
    /// A submitter precedence slot opens for the local member.
    SubmissionSlot,
    /// The post-submission challenge period closes.
    ChallengePeriod,
    /// Only the submitter may approve until this block.
    ApprovalPrecedence,
    /// The DKG as a whole timed out.
    DkgTimeout,
    /// A failed DKG attempt is retried and members announce themselves.
    DkgRetry,
    /// Announcements for a retried attempt close and its rounds begin.
    DkgAnnouncement,
    /// A relay entry soft timeout.
    RelayEntrySoftTimeout,
    /// A relay entry hard timeout.
    RelayEntryHardTimeout,
    /// Proposals of whom to accuse after a soft timeout close.
    ClaimProposals,
    /// A signer's turn to submit an aggregated signature.
    SignatureSubmission,
    /// A group reaches the end of its lifetime.
    GroupExpiry,
}

/// A point in chain time at which a session must act.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deadline {
    /// What elapses.
    pub kind: DeadlineKind,
    /// The first block at which it has elapsed.
    pub at_block: u64,
}

impl Deadline {
    /// A deadline of `kind` at `at_block`.
    pub fn new(kind: DeadlineKind, at_block: u64) -> Self {
        Self { kind, at_block }
    }

    /// Whether the deadline has elapsed at `block`.
    pub fn is_elapsed(&self, block: u64) -> bool {
        block >= self.at_block
    }
}

/// Derives a DKG session's deadlines from its start block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClock {
    start_block: u64,
    group_size: u16,
    timings: ProtocolTimings,
}

impl SessionClock {
    /// A clock for a session starting at `start_block`.
    pub fn new(start_block: u64, group_size: u16, timings: ProtocolTimings) -> Self {
        Self {
            start_block,
            group_size,
            timings,
        }
    }

    /// The block the session started at.
    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// The timings in force.
    pub fn timings(&self) -> &ProtocolTimings {
        &self.timings
    }

    /// When DKG round `round` (1-based) closes.
    pub fn round_deadline(&self, round: u8) -> Deadline {
        Deadline::new(
            DeadlineKind::DkgRound(round),
            self.start_block + u64::from(round) * self.timings.round_blocks(),
        )
    }

    /// When result signature collection ends and submission may begin.
    pub fn result_signing_deadline(&self) -> Deadline {
        Deadline::new(
            DeadlineKind::ResultSigning,
            self.round_deadline(3).at_block + self.timings.result_signing_blocks,
        )
    }

    /// The block submitter precedence slot 0 opens at.
    pub fn submission_start_block(&self) -> u64 {
        self.result_signing_deadline().at_block
    }

    /// When the DKG as a whole times out: every precedence slot had its
    /// window and nobody submitted.
    pub fn dkg_timeout(&self) -> Deadline {
        Deadline::new(
            DeadlineKind::DkgTimeout,
            self.submission_start_block()
                + u64::from(self.group_size) * self.timings.submission_window_blocks,
        )
    }

    /// Blocks from session start to the DKG timeout.
    pub fn protocol_blocks(&self) -> u64 {
        self.dkg_timeout().at_block - self.start_block
    }

    /// When the attempt after this one starts. It waits out this attempt's
    /// whole window, so every member starts it at the same block no matter
    /// when it saw this one fail.
    pub fn retry_deadline(&self) -> Deadline {
        Deadline::new(
            DeadlineKind::DkgRetry,
            self.dkg_timeout().at_block + self.timings.dkg_retry_delay_blocks,
        )
    }

    /// When announcements for the next attempt close.
    pub fn announcement_deadline(&self) -> Deadline {
        Deadline::new(
            DeadlineKind::DkgAnnouncement,
            self.retry_deadline().at_block + self.timings.round_blocks(),
        )
    }

    /// The clock of the next attempt, whose rounds start once announcements
    /// close.
    pub fn next_attempt(&self) -> SessionClock {
        SessionClock::new(
            self.announcement_deadline().at_block,
            self.group_size,
            self.timings,
        )
    }
}

/// Deadlines of a relay entry request observed at `requested_at_block`.
pub fn relay_entry_deadlines(requested_at_block: u64, timings: &ProtocolTimings) -> (Deadline, Deadline) {
    (
        Deadline::new(
            DeadlineKind::RelayEntrySoftTimeout,
            requested_at_block + timings.relay_entry_soft_timeout_blocks,
        ),
        Deadline::new(
            DeadlineKind::RelayEntryHardTimeout,
            requested_at_block + timings.relay_entry_hard_timeout_blocks,
        ),
    )
}

/// When members stop collecting inactivity claim proposals for a relay entry
/// requested at `requested_at_block`. The window leaves the claim time to be
/// signed before the hard timeout.
pub fn claim_proposal_deadline(requested_at_block: u64, timings: &ProtocolTimings) -> Deadline {
    Deadline::new(
        DeadlineKind::ClaimProposals,
        requested_at_block + timings.relay_entry_soft_timeout_blocks + timings.round_delay_blocks + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_close_back_to_back() {
        let timings = ProtocolTimings {
            round_delay_blocks: 1,
            round_active_blocks: 4,
            result_signing_blocks: 3,
            submission_window_blocks: 2,
            ..ProtocolTimings::default()
        };
        let clock = SessionClock::new(100, 5, timings);

        assert_eq!(clock.round_deadline(1).at_block, 105);
        assert_eq!(clock.round_deadline(2).at_block, 110);
        assert_eq!(clock.round_deadline(3).at_block, 115);
        assert_eq!(clock.result_signing_deadline().at_block, 118);
        assert_eq!(clock.dkg_timeout().at_block, 128);
        assert_eq!(clock.protocol_blocks(), 28);
    }

    #[test]
    fn retries_follow_the_previous_window() {
        let timings = ProtocolTimings {
            round_delay_blocks: 1,
            round_active_blocks: 4,
            result_signing_blocks: 3,
            submission_window_blocks: 2,
            dkg_retry_delay_blocks: 6,
            ..ProtocolTimings::default()
        };
        let clock = SessionClock::new(100, 5, timings);

        assert_eq!(clock.retry_deadline().at_block, 134);
        assert_eq!(clock.announcement_deadline().at_block, 139);
        let next = clock.next_attempt();
        assert_eq!(next.start_block(), 139);
        assert_eq!(next.round_deadline(1).at_block, 144);
        assert_eq!(next.next_attempt().start_block(), 139 + 28 + 6 + 5);
    }

    #[test]
    fn claim_proposals_close_between_the_timeouts() {
        let timings = ProtocolTimings::default();
        let (soft, hard) = relay_entry_deadlines(40, &timings);
        let proposals = claim_proposal_deadline(40, &timings);

        assert_eq!(soft.at_block, 60);
        assert_eq!(proposals.at_block, 62);
        assert!(proposals.at_block < hard.at_block);
    }

    #[test]
    fn deadline_elapses_at_its_block() {
        let deadline = Deadline::new(DeadlineKind::ChallengePeriod, 10);
        assert!(!deadline.is_elapsed(9));
        assert!(deadline.is_elapsed(10));
    }
}
