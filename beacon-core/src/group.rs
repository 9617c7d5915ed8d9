//! Group lifecycle.

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::{Error, GroupId, GroupPublicKey, MemberIndex, OperatorId};

/// Lifecycle states of a group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupState {
    /// Members were selected; DKG has not started.
    Forming,
    /// DKG is running.
    DkgInProgress,
    /// A result was computed and awaits submission or approval.
    ResultPendingSubmission,
    /// A challenge against the submitted result was filed.
    Challenged,
    /// The result was approved; the group can sign.
    Active,
    /// The group outlived its lifetime.
    Expired,
    /// The group was discarded: failed DKG, verified challenge, or hard timeout.
    Terminated,
}

impl GroupState {
    /// A short, stable name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            GroupState::Forming => "Forming",
            GroupState::DkgInProgress => "DkgInProgress",
            GroupState::ResultPendingSubmission => "ResultPendingSubmission",
            GroupState::Challenged => "Challenged",
            GroupState::Active => "Active",
            GroupState::Expired => "Expired",
            GroupState::Terminated => "Terminated",
        }
    }

    /// Whether the group can never change state again.
    pub fn is_final(&self) -> bool {
        matches!(self, GroupState::Expired | GroupState::Terminated)
    }

    fn can_transition_to(&self, to: GroupState) -> bool {
        use GroupState::*;
        matches!(
            (self, to),
            (Forming, DkgInProgress)
                | (Forming, Terminated)
                | (DkgInProgress, ResultPendingSubmission)
                | (DkgInProgress, Terminated)
                | (ResultPendingSubmission, Active)
                | (ResultPendingSubmission, Challenged)
                | (ResultPendingSubmission, Terminated)
                | (Challenged, ResultPendingSubmission)
                | (Challenged, Terminated)
                | (Active, Expired)
                | (Active, Terminated)
        )
    }
}

/// A group of operators selected for one DKG.
///
/// The member list is fixed at formation. The group public key is recorded
/// once, on the transition into [`GroupState::ResultPendingSubmission`], and
/// pinned to the approved result's key on activation.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct Group {
    members: Vec<OperatorId>,
    group_public_key: Option<GroupPublicKey>,
    group_id: Option<GroupId>,
    state: GroupState,
    created_at_block: u64,
    expires_at_block: Option<u64>,
}

impl Group {
    /// A newly selected group.
    pub fn new(members: Vec<OperatorId>, created_at_block: u64) -> Self {
        Self {
            members,
            group_public_key: None,
            group_id: None,
            state: GroupState::Forming,
            created_at_block,
            expires_at_block: None,
        }
    }

    /// Number of seats.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The operator at `index`.
    pub fn operator(&self, index: MemberIndex) -> Option<&OperatorId> {
        self.members.get(index.position())
    }

    /// The indices held by `operator`.
    pub fn indices_of(&self, operator: &OperatorId) -> Vec<MemberIndex> {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, member)| *member == operator)
            .filter_map(|(position, _)| MemberIndex::from_position(position).ok())
            .collect()
    }

    fn transition(&mut self, to: GroupState) -> Result<(), Error> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// DKG started.
    pub fn start_dkg(&mut self) -> Result<(), Error> {
        self.transition(GroupState::DkgInProgress)
    }

    /// DKG computed a result: record the group key.
    pub fn result_computed(&mut self, group_public_key: GroupPublicKey) -> Result<(), Error> {
        if self.group_public_key.is_some() {
            return Err(Error::GroupKeyAlreadySet);
        }
        self.transition(GroupState::ResultPendingSubmission)?;
        self.group_id = Some(group_public_key.group_id()?);
        self.group_public_key = Some(group_public_key);
        Ok(())
    }

    /// A challenge against the submitted result was filed.
    pub fn challenge(&mut self) -> Result<(), Error> {
        self.transition(GroupState::Challenged)
    }

    /// The chain rejected a challenge; the result stands.
    pub fn challenge_rejected(&mut self) -> Result<(), Error> {
        self.transition(GroupState::ResultPendingSubmission)
    }

    /// The chain approved the result with `group_public_key` at `block`.
    /// The approved key replaces the one computed locally, should they differ.
    pub fn activate(
        &mut self,
        group_public_key: GroupPublicKey,
        block: u64,
        lifetime_blocks: u64,
    ) -> Result<(), Error> {
        let group_id = group_public_key.group_id()?;
        self.transition(GroupState::Active)?;
        self.group_id = Some(group_id);
        self.group_public_key = Some(group_public_key);
        self.expires_at_block = Some(block + lifetime_blocks);
        Ok(())
    }

    /// Expire the group if its lifetime ended by `block`. Returns whether it
    /// expired now.
    pub fn expire_if_due(&mut self, block: u64) -> Result<bool, Error> {
        match self.expires_at_block {
            Some(expiry) if self.state == GroupState::Active && block >= expiry => {
                self.transition(GroupState::Expired)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Discard the group. Terminating an already terminated group is a no-op.
    pub fn terminate(&mut self) -> Result<(), Error> {
        if self.state == GroupState::Terminated {
            return Ok(());
        }
        self.transition(GroupState::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_with_dealer;
    use crate::GroupParameters;
    use rand::SeedableRng;

    fn operators(n: u8) -> Vec<OperatorId> {
        (1..=n).map(|i| OperatorId::from_bytes([i; 20])).collect()
    }

    fn group_key() -> GroupPublicKey {
        key_from(1)
    }

    fn key_from(seed: u64) -> GroupPublicKey {
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(seed);
        let params = GroupParameters::with_default_quorum(3, 2).unwrap();
        let (_, public) = generate_with_dealer(&params, &mut rng).unwrap();
        *public.group_public_key()
    }

    #[test]
    fn happy_path_reaches_expiry() {
        let mut group = Group::new(operators(3), 10);
        group.start_dkg().unwrap();
        group.result_computed(group_key()).unwrap();
        group.activate(group_key(), 50, 100).unwrap();
        assert!(!group.expire_if_due(149).unwrap());
        assert!(group.expire_if_due(150).unwrap());
        assert_eq!(*group.state(), GroupState::Expired);
    }

    #[test]
    fn group_key_is_set_exactly_once() {
        let mut group = Group::new(operators(3), 10);
        group.start_dkg().unwrap();
        group.result_computed(group_key()).unwrap();
        assert_eq!(group.result_computed(group_key()), Err(Error::GroupKeyAlreadySet));
    }

    #[test]
    fn challenged_group_never_activates() {
        let mut group = Group::new(operators(3), 10);
        group.start_dkg().unwrap();
        group.result_computed(group_key()).unwrap();
        group.challenge().unwrap();
        group.terminate().unwrap();
        assert!(group.activate(key_from(2), 60, 100).is_err());
        assert_eq!(*group.state(), GroupState::Terminated);
        assert_eq!(*group.group_public_key(), Some(group_key()));
    }

    #[test]
    fn activation_adopts_the_approved_key() {
        let mut group = Group::new(operators(3), 10);
        group.start_dkg().unwrap();
        group.result_computed(group_key()).unwrap();

        let approved = key_from(2);
        assert_ne!(approved, group_key());
        group.activate(approved, 40, 100).unwrap();
        assert_eq!(*group.group_public_key(), Some(approved));
        assert_eq!(*group.group_id(), Some(approved.group_id().unwrap()));
    }

    #[test]
    fn indices_follow_member_order() {
        let group = Group::new(operators(4), 0);
        let third = OperatorId::from_bytes([3; 20]);
        assert_eq!(group.indices_of(&third), vec![MemberIndex::new(3).unwrap()]);
        assert_eq!(group.operator(MemberIndex::new(3).unwrap()), Some(&third));
    }
}
