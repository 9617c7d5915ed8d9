//! Helper functions for testing

use std::collections::{BTreeMap, BTreeSet};

use ark_ff::One;
use rand_core::{CryptoRng, RngCore};

use crate::{
    keys::{
        dkg::{Dkg, DkgFailure, DkgOutcome, Message, Outgoing, Transition},
        SigningShare,
    },
    operator::OperatorKey,
    selection::{PoolMember, PoolSnapshot},
    Error, GroupParameters, MemberIndex, OperatorId,
};

/// Shorthand for a member index known to be valid.
pub fn index(value: u16) -> MemberIndex {
    MemberIndex::new(value).expect("member indices in tests are non-zero")
}

/// A set of member indices.
pub fn indices(values: &[u16]) -> BTreeSet<MemberIndex> {
    values.iter().map(|value| index(*value)).collect()
}

/// `count` fresh operator keys.
pub fn operator_keys<R: RngCore + CryptoRng>(count: usize, rng: &mut R) -> Vec<OperatorKey> {
    (0..count).map(|_| OperatorKey::random(rng)).collect()
}

/// The identities of `keys`, in order.
pub fn operator_ids(keys: &[OperatorKey]) -> Vec<OperatorId> {
    keys.iter().map(OperatorKey::operator_id).collect()
}

/// A pool in which every operator has the same weight.
pub fn uniform_pool(operators: &[OperatorId], weight: u64) -> PoolSnapshot {
    PoolSnapshot::new(
        operators
            .iter()
            .map(|operator| PoolMember::new(*operator, weight))
            .collect(),
    )
}

/// A share that fails verification against the commitments of its dealer.
pub fn corrupt_share(share: &SigningShare) -> SigningShare {
    SigningShare(share.0 + ark_bls12_381::Fr::one())
}

/// Controls delivery in [`run_dkg`].
pub trait FaultInjector {
    /// Members that never send anything.
    fn is_silent(&self, _member: MemberIndex) -> bool {
        false
    }

    /// Rewrite or drop (`None`) a message from `sender` on its way to
    /// `recipient`.
    fn intercept(
        &mut self,
        _sender: MemberIndex,
        _recipient: MemberIndex,
        message: Message,
    ) -> Option<Message> {
        Some(message)
    }
}

/// Delivers everything unchanged.
pub struct Honest;

impl FaultInjector for Honest {}

/// Members in the set never send anything.
pub struct Silent(pub BTreeSet<MemberIndex>);

impl FaultInjector for Silent {
    fn is_silent(&self, member: MemberIndex) -> bool {
        self.0.contains(&member)
    }
}

/// `dealer` sends an invalid share to `victim` and withholds its
/// justification in round 3.
pub struct InvalidShare {
    /// The faulty dealer.
    pub dealer: MemberIndex,
    /// The recipient of the bad share.
    pub victim: MemberIndex,
}

impl FaultInjector for InvalidShare {
    fn intercept(
        &mut self,
        sender: MemberIndex,
        recipient: MemberIndex,
        message: Message,
    ) -> Option<Message> {
        match message {
            Message::Share(share) if sender == self.dealer && recipient == self.victim => {
                Some(Message::Share(corrupt_share(&share)))
            }
            Message::Justifications(_) if sender == self.dealer => None,
            message => Some(message),
        }
    }
}

/// `dealer` broadcasts its commitments but never sends its shares to
/// `victims`.
pub struct WithheldShare {
    /// The faulty dealer.
    pub dealer: MemberIndex,
    /// Members that never receive the dealer's share.
    pub victims: BTreeSet<MemberIndex>,
    /// Whether the dealer answers the resulting accusations.
    pub justifies: bool,
}

impl FaultInjector for WithheldShare {
    fn intercept(
        &mut self,
        sender: MemberIndex,
        recipient: MemberIndex,
        message: Message,
    ) -> Option<Message> {
        if sender != self.dealer {
            return Some(message);
        }
        match message {
            Message::Share(_) if self.victims.contains(&recipient) => None,
            Message::Justifications(_) if !self.justifies => None,
            message => Some(message),
        }
    }
}

/// `accuser` broadcasts an accusation against `accused` although the share
/// it received was valid.
pub struct FalseAccusation {
    /// The lying member.
    pub accuser: MemberIndex,
    /// The honest dealer it accuses.
    pub accused: MemberIndex,
}

impl FaultInjector for FalseAccusation {
    fn intercept(
        &mut self,
        sender: MemberIndex,
        _recipient: MemberIndex,
        message: Message,
    ) -> Option<Message> {
        match message {
            Message::Accusations(mut accused) if sender == self.accuser => {
                accused.insert(self.accused);
                Some(Message::Accusations(accused))
            }
            message => Some(message),
        }
    }
}

/// How one member's DKG ended.
pub type DkgRun = Result<DkgOutcome, DkgFailure>;

/// Run a complete DKG among the members of `params` in lock step, closing
/// every round once all messages were delivered.
///
/// Silent members are not run at all. Members listed in `excluded` are
/// excluded up front, as a retry does.
pub fn run_dkg<F: FaultInjector, R: RngCore + CryptoRng>(
    params: &GroupParameters,
    excluded: &BTreeSet<MemberIndex>,
    faults: &mut F,
    rng: &mut R,
) -> Result<BTreeMap<MemberIndex, DkgRun>, Error> {
    let mut members = BTreeMap::new();
    let mut outbox = Vec::new();
    for member in MemberIndex::all(*params.group_size()) {
        if faults.is_silent(member) || excluded.contains(&member) {
            continue;
        }
        let mut dkg = Dkg::new(member, *params, excluded.clone())?;
        outbox.extend(dkg.start(rng)?.into_iter().map(|out| (member, out)));
        members.insert(member, dkg);
    }

    let mut runs = BTreeMap::new();
    for _round in 1..=3 {
        for (sender, outgoing) in outbox.drain(..) {
            let deliveries = match outgoing {
                Outgoing::Broadcast(message) => members
                    .keys()
                    .filter(|recipient| **recipient != sender)
                    .map(|recipient| (*recipient, message.clone()))
                    .collect::<Vec<_>>(),
                Outgoing::Direct(recipient, message) => vec![(recipient, message)],
            };
            for (recipient, message) in deliveries {
                if runs.contains_key(&recipient) {
                    continue;
                }
                let Some(message) = faults.intercept(sender, recipient, message) else {
                    continue;
                };
                if let Some(dkg) = members.get_mut(&recipient) {
                    dkg.receive(sender, message)?;
                }
            }
        }

        for (member, dkg) in members.iter_mut() {
            if runs.contains_key(member) {
                continue;
            }
            match dkg.advance()? {
                Transition::Continue(out) => {
                    outbox.extend(out.into_iter().map(|out| (*member, out)));
                }
                Transition::Completed(outcome) => {
                    runs.insert(*member, Ok(*outcome));
                }
                Transition::Failed(failure) => {
                    runs.insert(*member, Err(failure));
                }
            }
        }
    }

    Ok(runs)
}
