//! Distributed Key Generation: the state machine of one group member.
//!
//! Every member runs Feldman's Verifiable Secret Sharing as a dealer in
//! parallel, and derives its long-lived share as the sum of the shares
//! received from the dealers that end up qualified. Disputes are resolved in
//! an extra round instead of aborting:
//!
//! 1. **Share distribution.** Each member samples a polynomial of degree
//!    `honest_threshold - 1`, broadcasts commitments to its coefficients and
//!    sends `f_i(j)` to every member `j`.
//! 2. **Verification.** Each member checks the shares it received against the
//!    dealers' commitments and broadcasts the set of dealers it accuses. The
//!    broadcast is mandatory even when the set is empty.
//! 3. **Complaint resolution.** Accused members broadcast the shares they sent
//!    to their accusers. A revealed share that verifies disqualifies the
//!    accuser; an invalid or missing one disqualifies the accused.
//!
//! Members that stay silent in a round are disqualified at the round's close.
//! A dealer that broadcasts commitments but withholds a share is accused as if
//! the share were invalid.
//! Every disqualification depends on broadcast data only, so all honest
//! members compute the same set of misbehaved members.
//!
//! The state machine performs no I/O: it returns the messages to send and is
//! told when a round closes, either because [`Dkg::is_round_complete`] or
//! because the caller's block deadline elapsed.

use std::collections::{BTreeMap, BTreeSet};

use ark_bls12_381::Fr;
use ark_ff::Zero;
use derive_getters::Getters;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{Error, GroupParameters, MemberIndex};

use super::{
    Commitments, GroupPublicKey, KeyPackage, PublicKeyPackage, SecretPolynomial, SigningShare,
};

/// A DKG protocol message. The sender is authenticated by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Round 1, broadcast: commitments to the sender's polynomial.
    Commitments(Commitments),
    /// Round 1, direct: the sender's polynomial evaluated at the recipient.
    Share(SigningShare),
    /// Round 2, broadcast: dealers whose shares failed verification.
    Accusations(BTreeSet<MemberIndex>),
    /// Round 3, broadcast: the shares the sender dealt to its accusers.
    Justifications(BTreeMap<MemberIndex, SigningShare>),
}

impl Message {
    /// The round this message belongs to.
    pub fn round(&self) -> u8 {
        match self {
            Message::Commitments(_) | Message::Share(_) => 1,
            Message::Accusations(_) => 2,
            Message::Justifications(_) => 3,
        }
    }
}

/// A message the caller must deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    /// Deliver to every other member of the session.
    Broadcast(Message),
    /// Deliver to one member only.
    Direct(MemberIndex, Message),
}

/// Whether a finished session succeeded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    /// The result was approved on chain.
    Success,
    /// The session failed or its result was rejected.
    Failed,
}

/// States of a member's DKG session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgState {
    /// Created, waiting for the caller to start round 1.
    AwaitingSeed,
    /// Round 1.
    Round1ShareDistribution,
    /// Round 2.
    Round2Verification,
    /// Round 3.
    Round3ComplaintResolution,
    /// The result content is known; signing and publication are up to the caller.
    ResultComputed,
    /// The result was submitted on chain.
    Submitted,
    /// The session is over.
    Terminal(Terminal),
}

impl DkgState {
    /// A short, stable name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            DkgState::AwaitingSeed => "AwaitingSeed",
            DkgState::Round1ShareDistribution => "Round1ShareDistribution",
            DkgState::Round2Verification => "Round2Verification",
            DkgState::Round3ComplaintResolution => "Round3ComplaintResolution",
            DkgState::ResultComputed => "ResultComputed",
            DkgState::Submitted => "Submitted",
            DkgState::Terminal(Terminal::Success) => "Terminal(Success)",
            DkgState::Terminal(Terminal::Failed) => "Terminal(Failed)",
        }
    }

    /// The protocol round accepting messages in this state, 0 before round 1
    /// and 4 after round 3.
    fn round(&self) -> u8 {
        match self {
            DkgState::AwaitingSeed => 0,
            DkgState::Round1ShareDistribution => 1,
            DkgState::Round2Verification => 2,
            DkgState::Round3ComplaintResolution => 3,
            _ => 4,
        }
    }
}

/// Why a DKG session failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgFailure {
    /// Too few members were still qualified when a round closed.
    QuorumNotReached {
        /// The round that closed, 0 for the announcements of a retry.
        round: u8,
        /// Members still qualified.
        qualified: usize,
        /// `honest_threshold`.
        required: usize,
    },
}

/// What a successful DKG produced for the local member.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
pub struct DkgOutcome {
    /// The group public key.
    group_public_key: GroupPublicKey,
    /// Members excluded from the key, including those excluded up front.
    misbehaved: BTreeSet<MemberIndex>,
    /// Public key shares of every qualified member.
    public_key_package: PublicKeyPackage,
    /// The local member's key material; `None` if the local member itself
    /// was disqualified during complaint resolution.
    key_package: Option<KeyPackage>,
}

impl DkgOutcome {
    /// Take the key package out of the outcome.
    pub fn into_parts(
        self,
    ) -> (
        GroupPublicKey,
        BTreeSet<MemberIndex>,
        PublicKeyPackage,
        Option<KeyPackage>,
    ) {
        (
            self.group_public_key,
            self.misbehaved,
            self.public_key_package,
            self.key_package,
        )
    }
}

/// The result of closing a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The next round started; deliver these messages.
    Continue(Vec<Outgoing>),
    /// Round 3 closed and the key was derived.
    Completed(Box<DkgOutcome>),
    /// The session failed; no key material was emitted.
    Failed(DkgFailure),
}

/// One member's DKG session.
#[derive(Debug)]
pub struct Dkg {
    index: MemberIndex,
    params: GroupParameters,
    state: DkgState,
    polynomial: Option<SecretPolynomial>,
    commitments: BTreeMap<MemberIndex, Commitments>,
    shares: BTreeMap<MemberIndex, SigningShare>,
    accusations: BTreeMap<MemberIndex, BTreeSet<MemberIndex>>,
    justifications: BTreeMap<MemberIndex, BTreeMap<MemberIndex, SigningShare>>,
    misbehaved: BTreeSet<MemberIndex>,
    inactive: BTreeSet<MemberIndex>,
    invalid_shares: BTreeSet<MemberIndex>,
}

impl Dkg {
    /// Create the session of member `index`. Members in `excluded` do not
    /// take part in this attempt and count as misbehaved.
    pub fn new(
        index: MemberIndex,
        params: GroupParameters,
        excluded: BTreeSet<MemberIndex>,
    ) -> Result<Self, Error> {
        params.validate()?;
        params.check_index(index.get())?;
        for member in &excluded {
            params.check_index(member.get())?;
        }
        if excluded.contains(&index) {
            return Err(Error::InvalidMemberIndex(index.get()));
        }
        Ok(Self {
            index,
            params,
            state: DkgState::AwaitingSeed,
            polynomial: None,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            accusations: BTreeMap::new(),
            justifications: BTreeMap::new(),
            misbehaved: excluded,
            inactive: BTreeSet::new(),
            invalid_shares: BTreeSet::new(),
        })
    }

    /// The local member.
    pub fn index(&self) -> MemberIndex {
        self.index
    }

    /// The current state.
    pub fn state(&self) -> DkgState {
        self.state
    }

    /// The members disqualified so far.
    pub fn misbehaved(&self) -> &BTreeSet<MemberIndex> {
        &self.misbehaved
    }

    /// Members that broadcast no commitments in round 1.
    pub fn inactive(&self) -> &BTreeSet<MemberIndex> {
        &self.inactive
    }

    /// Dealers whose shares to the local member were missing or failed
    /// verification.
    pub fn invalid_shares(&self) -> &BTreeSet<MemberIndex> {
        &self.invalid_shares
    }

    /// Members still qualified, the local member included.
    pub fn qualified(&self) -> BTreeSet<MemberIndex> {
        MemberIndex::all(*self.params.group_size())
            .filter(|member| !self.misbehaved.contains(member))
            .collect()
    }

    fn peers(&self) -> BTreeSet<MemberIndex> {
        let mut peers = self.qualified();
        peers.remove(&self.index);
        peers
    }

    /// Start round 1: sample the polynomial and emit commitments and shares.
    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Outgoing>, Error> {
        if self.state != DkgState::AwaitingSeed {
            return Err(Error::InvalidState(self.state.name()));
        }

        let polynomial = SecretPolynomial::random(*self.params.honest_threshold(), rng);
        let commitments = polynomial.commit();

        let mut outgoing = vec![Outgoing::Broadcast(Message::Commitments(commitments.clone()))];
        for peer in self.peers() {
            outgoing.push(Outgoing::Direct(peer, Message::Share(polynomial.evaluate(peer))));
        }

        self.shares.insert(self.index, polynomial.evaluate(self.index));
        self.commitments.insert(self.index, commitments);
        self.polynomial = Some(polynomial);
        self.state = DkgState::Round1ShareDistribution;
        Ok(outgoing)
    }

    /// Accept a message from `sender`. Messages for rounds that have not
    /// started yet are buffered; duplicates are ignored.
    pub fn receive(&mut self, sender: MemberIndex, message: Message) -> Result<(), Error> {
        self.params.check_index(sender.get())?;
        if sender == self.index || self.inactive.contains(&sender) {
            return Err(Error::UnexpectedMessage { sender });
        }
        if message.round() < self.state.round() {
            return Err(Error::LateMessage { sender });
        }

        match message {
            Message::Commitments(commitments) => {
                commitments.validate(&self.params)?;
                self.commitments.entry(sender).or_insert(commitments);
            }
            Message::Share(share) => {
                self.shares.entry(sender).or_insert(share);
            }
            Message::Accusations(accused) => {
                self.accusations.entry(sender).or_insert(accused);
            }
            Message::Justifications(revealed) => {
                self.justifications.entry(sender).or_insert(revealed);
            }
        }
        Ok(())
    }

    /// Whether every message the current round expects has arrived, so the
    /// round can close before its deadline.
    pub fn is_round_complete(&self) -> bool {
        let peers = self.peers();
        match self.state {
            DkgState::Round1ShareDistribution => peers
                .iter()
                .all(|peer| self.commitments.contains_key(peer) && self.shares.contains_key(peer)),
            DkgState::Round2Verification => peers
                .iter()
                .all(|peer| self.accusations.contains_key(peer)),
            DkgState::Round3ComplaintResolution => self
                .accused()
                .iter()
                .filter(|accused| **accused != self.index)
                .all(|accused| self.justifications.contains_key(accused)),
            _ => false,
        }
    }

    /// Close the current round, either because it is complete or because its
    /// deadline elapsed.
    pub fn advance(&mut self) -> Result<Transition, Error> {
        let transition = match self.state {
            DkgState::Round1ShareDistribution => self.close_round1(),
            DkgState::Round2Verification => self.close_round2(),
            DkgState::Round3ComplaintResolution => self.close_round3()?,
            state => return Err(Error::InvalidState(state.name())),
        };
        if let Transition::Failed(_) = transition {
            self.polynomial = None;
            self.state = DkgState::Terminal(Terminal::Failed);
        }
        Ok(transition)
    }

    /// Record that the result was submitted on chain.
    pub fn mark_submitted(&mut self) -> Result<(), Error> {
        if self.state != DkgState::ResultComputed {
            return Err(Error::InvalidState(self.state.name()));
        }
        self.state = DkgState::Submitted;
        Ok(())
    }

    /// Finish the session once the chain approved or rejected the result, or
    /// once publication gave up.
    pub fn finish(&mut self, outcome: Terminal) {
        self.polynomial = None;
        self.state = DkgState::Terminal(outcome);
    }

    fn quorum(&self, round: u8) -> Option<DkgFailure> {
        let qualified = self.qualified().len();
        let required = usize::from(*self.params.honest_threshold());
        (qualified < required).then_some(DkgFailure::QuorumNotReached {
            round,
            qualified,
            required,
        })
    }

    fn close_round1(&mut self) -> Transition {
        for peer in self.peers() {
            let Some(commitments) = self.commitments.get(&peer) else {
                self.inactive.insert(peer);
                self.misbehaved.insert(peer);
                continue;
            };
            // Only the recipient sees a direct share. A missing one is accused
            // like an invalid one, so the dealer must reveal it in round 3.
            match self.shares.get(&peer) {
                Some(share) if commitments.verify_share(self.index, share) => {}
                _ => {
                    self.invalid_shares.insert(peer);
                }
            }
        }
        if let Some(failure) = self.quorum(1) {
            return Transition::Failed(failure);
        }

        self.state = DkgState::Round2Verification;
        self.accusations
            .insert(self.index, self.invalid_shares.clone());
        Transition::Continue(vec![Outgoing::Broadcast(Message::Accusations(
            self.invalid_shares.clone(),
        ))])
    }

    fn close_round2(&mut self) -> Transition {
        for peer in self.peers() {
            if !self.accusations.contains_key(&peer) {
                self.misbehaved.insert(peer);
            }
        }
        if let Some(failure) = self.quorum(2) {
            return Transition::Failed(failure);
        }

        self.state = DkgState::Round3ComplaintResolution;
        let accusers = self.accusers_of(self.index);
        if accusers.is_empty() {
            return Transition::Continue(Vec::new());
        }

        let revealed = match &self.polynomial {
            Some(polynomial) => accusers
                .iter()
                .map(|accuser| (*accuser, polynomial.evaluate(*accuser)))
                .collect::<BTreeMap<_, _>>(),
            None => BTreeMap::new(),
        };
        self.justifications.insert(self.index, revealed.clone());
        Transition::Continue(vec![Outgoing::Broadcast(Message::Justifications(revealed))])
    }

    fn close_round3(&mut self) -> Result<Transition, Error> {
        let qualified = self.qualified();
        let mut disqualified = BTreeSet::new();

        for (accuser, accused_set) in &self.accusations {
            if !qualified.contains(accuser) {
                continue;
            }
            for accused in accused_set {
                if accused == accuser || !qualified.contains(accused) {
                    continue;
                }
                let revealed = self
                    .justifications
                    .get(accused)
                    .and_then(|revealed| revealed.get(accuser));
                let valid = match (revealed, self.commitments.get(accused)) {
                    (Some(share), Some(commitments)) => commitments.verify_share(*accuser, share),
                    _ => false,
                };
                if valid {
                    disqualified.insert(*accuser);
                } else {
                    disqualified.insert(*accused);
                }
            }
        }

        self.misbehaved.extend(disqualified);
        self.polynomial = None;
        if let Some(failure) = self.quorum(3) {
            return Ok(Transition::Failed(failure));
        }

        let qualified = self.qualified();
        let public_key_package = PublicKeyPackage::from_commitments(
            &self.commitments,
            &qualified,
            *self.params.honest_threshold(),
        )?;
        let group_public_key = *public_key_package.group_public_key();

        let key_package = if qualified.contains(&self.index) {
            let mut secret = Fr::zero();
            for dealer in &qualified {
                let share = self
                    .shares
                    .get(dealer)
                    .ok_or(Error::InvalidShare { sender: *dealer })?;
                secret += share.0;
            }
            Some(KeyPackage::new(
                self.index,
                SigningShare(secret),
                group_public_key,
                *self.params.honest_threshold(),
            ))
        } else {
            None
        };
        self.shares.values_mut().for_each(Zeroize::zeroize);
        self.shares.clear();

        self.state = DkgState::ResultComputed;
        Ok(Transition::Completed(Box::new(DkgOutcome {
            group_public_key,
            misbehaved: self.misbehaved.clone(),
            public_key_package,
            key_package,
        })))
    }

    /// Members accused by a qualified accuser.
    fn accused(&self) -> BTreeSet<MemberIndex> {
        let qualified = self.qualified();
        self.accusations
            .iter()
            .filter(|(accuser, _)| qualified.contains(accuser))
            .flat_map(|(accuser, accused)| accused.iter().filter(move |a| *a != accuser))
            .filter(|accused| qualified.contains(accused))
            .copied()
            .collect()
    }

    fn accusers_of(&self, member: MemberIndex) -> BTreeSet<MemberIndex> {
        let qualified = self.qualified();
        self.accusations
            .iter()
            .filter(|(accuser, accused)| {
                qualified.contains(accuser) && **accuser != member && accused.contains(&member)
            })
            .map(|(accuser, _)| *accuser)
            .collect()
    }
}
