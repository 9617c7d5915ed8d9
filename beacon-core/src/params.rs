//! Chain-governed group and timing parameters

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Group creation parameters, as published by the chain.
///
/// - `honest_threshold` is the number of distinct partial signatures needed
///   to produce a threshold signature. The DKG polynomials have degree
///   `honest_threshold - 1`.
/// - `group_quorum` is the number of matching DKG result signatures that
///   make a result canonical; it must exceed the dishonest threshold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupParameters {
    group_size: u16,
    honest_threshold: u16,
    group_quorum: u16,
}

impl GroupParameters {
    /// Create and validate a parameter set.
    pub fn new(group_size: u16, honest_threshold: u16, group_quorum: u16) -> Result<Self, Error> {
        let params = Self {
            group_size,
            honest_threshold,
            group_quorum,
        };
        params.validate()?;
        Ok(params)
    }

    /// Create a parameter set with the smallest admissible quorum,
    /// `dishonest_threshold + 1`.
    pub fn with_default_quorum(group_size: u16, honest_threshold: u16) -> Result<Self, Error> {
        let dishonest = group_size.saturating_sub(honest_threshold);
        Self::new(group_size, honest_threshold, dishonest + 1)
    }

    /// Check the parameter invariants. Parameters arriving through serde are
    /// not validated until this is called.
    pub fn validate(&self) -> Result<(), Error> {
        if self.group_size == 0 {
            return Err(Error::InvalidGroupSize);
        }
        if self.honest_threshold == 0 || self.honest_threshold > self.group_size {
            return Err(Error::InvalidHonestThreshold);
        }
        if self.group_quorum <= self.dishonest_threshold() || self.group_quorum > self.group_size {
            return Err(Error::InvalidGroupQuorum);
        }
        Ok(())
    }

    /// How many members may misbehave while the group can still sign.
    pub fn dishonest_threshold(&self) -> u16 {
        self.group_size - self.honest_threshold
    }

    /// Check that `index` is a valid 1-based member index of the group.
    pub(crate) fn check_index(&self, index: u16) -> Result<(), Error> {
        if index == 0 || index > self.group_size {
            Err(Error::InvalidMemberIndex(index))
        } else {
            Ok(())
        }
    }
}

/// Protocol timings, all expressed in blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTimings {
    /// Blocks to wait before a round starts accepting messages.
    pub round_delay_blocks: u64,
    /// Blocks during which a round accepts messages.
    pub round_active_blocks: u64,
    /// Blocks for collecting DKG result signatures.
    pub result_signing_blocks: u64,
    /// Length of one submitter precedence slot.
    pub submission_window_blocks: u64,
    /// Length of the post-submission challenge period.
    pub challenge_period_blocks: u64,
    /// Blocks after the challenge period during which only the submitter
    /// may approve the result.
    pub approval_precedence_blocks: u64,
    /// Relay entry soft timeout.
    pub relay_entry_soft_timeout_blocks: u64,
    /// Relay entry hard timeout.
    pub relay_entry_hard_timeout_blocks: u64,
    /// Lifetime of an active group.
    pub group_lifetime_blocks: u64,
    /// Delay between a failed DKG attempt and its retry.
    pub dkg_retry_delay_blocks: u64,
    /// Delay step between inactivity claim submitters.
    pub inactivity_claim_delay_step_blocks: u64,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            round_delay_blocks: 1,
            round_active_blocks: 5,
            result_signing_blocks: 6,
            submission_window_blocks: 6,
            challenge_period_blocks: 10,
            approval_precedence_blocks: 5,
            relay_entry_soft_timeout_blocks: 20,
            relay_entry_hard_timeout_blocks: 60,
            group_lifetime_blocks: 10_000,
            dkg_retry_delay_blocks: 5,
            inactivity_claim_delay_step_blocks: 2,
        }
    }
}

impl ProtocolTimings {
    /// The length of one DKG round, delay included.
    pub fn round_blocks(&self) -> u64 {
        self.round_delay_blocks + self.round_active_blocks
    }
}

/// Everything a session needs from the chain's governance state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct ChainParameters {
    group: GroupParameters,
    timings: ProtocolTimings,
}

impl ChainParameters {
    /// Bundle validated group parameters with timings.
    pub fn new(group: GroupParameters, timings: ProtocolTimings) -> Result<Self, Error> {
        group.validate()?;
        Ok(Self { group, timings })
    }
}
