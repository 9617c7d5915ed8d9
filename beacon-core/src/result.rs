//! DKG results: the content members vote on, the arbiter that reconciles
//! gossiped candidates into one canonical result, submitter precedence, the
//! challenge period, and the checks a challenger runs against a published
//! result.

use std::collections::{BTreeMap, BTreeSet};

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    operator::{OperatorKey, OperatorPublicKey, OperatorSignature},
    Error, GroupParameters, GroupPublicKey, MemberIndex, OperatorId, ResultHash, Seed,
};

/// SHA-256 over the operator identifiers of the members that are not
/// misbehaved, in index order.
pub fn members_hash(members: &[OperatorId], misbehaved: &BTreeSet<MemberIndex>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (position, operator) in members.iter().enumerate() {
        let excluded = MemberIndex::from_position(position)
            .map(|index| misbehaved.contains(&index))
            .unwrap_or(true);
        if !excluded {
            hasher.update(operator.as_bytes());
        }
    }
    hasher.finalize().into()
}

/// The tuple members must agree on for a result to be canonical.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct ResultContent {
    pub(crate) group_public_key: GroupPublicKey,
    pub(crate) misbehaved_members: BTreeSet<MemberIndex>,
    pub(crate) members_hash: [u8; 32],
}

impl ResultContent {
    /// Build the content from a DKG outcome and the group's member list.
    pub fn new(
        group_public_key: GroupPublicKey,
        misbehaved_members: BTreeSet<MemberIndex>,
        members: &[OperatorId],
    ) -> Self {
        let members_hash = members_hash(members, &misbehaved_members);
        Self {
            group_public_key,
            misbehaved_members,
            members_hash,
        }
    }

    /// The digest members sign, bound to the session seed.
    pub fn hash(&self, seed: &Seed) -> Result<ResultHash, Error> {
        let mut hasher = Sha256::new();
        hasher.update(b"beacon-dkg-result");
        hasher.update(seed.as_bytes());
        hasher.update(self.group_public_key.serialize()?);
        hasher.update((self.misbehaved_members.len() as u32).to_be_bytes());
        for member in &self.misbehaved_members {
            hasher.update(member.get().to_be_bytes());
        }
        hasher.update(self.members_hash);
        Ok(ResultHash(hasher.finalize().into()))
    }
}

/// One member's support for a result: its operator key and signature over
/// the result hash.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct ResultSignature {
    public_key: OperatorPublicKey,
    signature: OperatorSignature,
}

impl ResultSignature {
    /// Check the signature and that the key belongs to `expected`.
    pub fn verify(&self, hash: &ResultHash, expected: &OperatorId) -> Result<(), Error> {
        if self.public_key.operator_id() != *expected {
            return Err(Error::InvalidSignature);
        }
        self.public_key.verify(hash.as_bytes(), &self.signature)
    }
}

/// The message a member gossips in the result signing round.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct SignedResult {
    content: ResultContent,
    signature: ResultSignature,
}

impl SignedResult {
    /// Sign `content` with the local operator key.
    pub fn sign(seed: &Seed, content: ResultContent, key: &OperatorKey) -> Result<Self, Error> {
        let hash = content.hash(seed)?;
        let signature = ResultSignature {
            public_key: key.public_key(),
            signature: key.sign(hash.as_bytes()),
        };
        Ok(Self { content, signature })
    }
}

/// A result as submitted on chain.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct DkgResult {
    content: ResultContent,
    signatures: BTreeMap<MemberIndex, ResultSignature>,
    submitter_index: MemberIndex,
}

impl DkgResult {
    /// Assemble a result. Prefer [`ResultArbiter::finalize`], which only
    /// assembles canonical results.
    pub fn new(
        content: ResultContent,
        signatures: BTreeMap<MemberIndex, ResultSignature>,
        submitter_index: MemberIndex,
    ) -> Self {
        Self {
            content,
            signatures,
            submitter_index,
        }
    }

    /// The group public key.
    pub fn group_public_key(&self) -> &GroupPublicKey {
        &self.content.group_public_key
    }

    /// Indices excluded from the group key.
    pub fn misbehaved_members(&self) -> &BTreeSet<MemberIndex> {
        &self.content.misbehaved_members
    }

    /// The result hash.
    pub fn hash(&self, seed: &Seed) -> Result<ResultHash, Error> {
        self.content.hash(seed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Bucket {
    content: ResultContent,
    signatures: BTreeMap<MemberIndex, ResultSignature>,
}

/// Reconciles candidate results gossiped by the members of one DKG session.
///
/// Candidates are bucketed by result hash. Each member supports at most one
/// bucket: collecting the same candidate again is a no-op, and a member
/// supporting two different results is rejected as equivocating.
#[derive(Clone, Debug)]
pub struct ResultArbiter {
    seed: Seed,
    members: Vec<OperatorId>,
    params: GroupParameters,
    buckets: BTreeMap<ResultHash, Bucket>,
    support: BTreeMap<MemberIndex, ResultHash>,
    equivocators: BTreeSet<MemberIndex>,
}

impl ResultArbiter {
    /// An arbiter for the group `members` selected with `seed`.
    pub fn new(seed: Seed, members: Vec<OperatorId>, params: GroupParameters) -> Result<Self, Error> {
        params.validate()?;
        if members.len() != usize::from(*params.group_size()) {
            return Err(Error::InvalidGroupSize);
        }
        Ok(Self {
            seed,
            members,
            params,
            buckets: BTreeMap::new(),
            support: BTreeMap::new(),
            equivocators: BTreeSet::new(),
        })
    }

    /// Members caught supporting two different results.
    pub fn equivocators(&self) -> &BTreeSet<MemberIndex> {
        &self.equivocators
    }

    /// Number of distinct buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Distinct members supporting `hash`.
    pub fn support(&self, hash: &ResultHash) -> usize {
        self.buckets
            .get(hash)
            .map(|bucket| bucket.signatures.len())
            .unwrap_or(0)
    }

    /// Members that have supported some result.
    pub fn signers(&self) -> BTreeSet<MemberIndex> {
        self.support.keys().copied().collect()
    }

    /// Record `signer`'s support for a candidate.
    pub fn collect_candidate(
        &mut self,
        signer: MemberIndex,
        candidate: SignedResult,
    ) -> Result<ResultHash, Error> {
        self.params.check_index(signer.get())?;
        let hash = candidate.content.hash(&self.seed)?;

        let operator = self
            .members
            .get(signer.position())
            .ok_or(Error::InvalidMemberIndex(signer.get()))?;
        candidate
            .signature
            .verify(&hash, operator)
            .map_err(|_| Error::InvalidResultSignature { signer })?;
        if candidate.content.misbehaved_members.contains(&signer) {
            return Err(Error::InvalidResultSignature { signer });
        }

        match self.support.get(&signer) {
            Some(supported) if *supported == hash => return Ok(hash),
            Some(_) => {
                self.equivocators.insert(signer);
                return Err(Error::ConflictingSupport { signer });
            }
            None => {}
        }

        self.support.insert(signer, hash);
        self.buckets
            .entry(hash)
            .or_insert_with(|| Bucket {
                content: candidate.content,
                signatures: BTreeMap::new(),
            })
            .signatures
            .insert(signer, candidate.signature);
        Ok(hash)
    }

    /// The bucket with the most support, if it reached the group quorum and
    /// no other bucket ties with it.
    fn canonical(&self) -> Option<(&ResultHash, &Bucket)> {
        let quorum = usize::from(*self.params.group_quorum());
        let mut ranked = self
            .buckets
            .iter()
            .filter(|(hash, bucket)| {
                bucket.signatures.len() >= quorum && !self.has_equivocating_support(hash)
            })
            .collect::<Vec<_>>();
        ranked.sort_by_key(|(_, bucket)| std::cmp::Reverse(bucket.signatures.len()));
        match ranked.as_slice() {
            [] => None,
            [only] => Some(*only),
            [first, second, ..] if first.1.signatures.len() > second.1.signatures.len() => {
                Some(*first)
            }
            _ => None,
        }
    }

    fn has_equivocating_support(&self, hash: &ResultHash) -> bool {
        self.buckets
            .get(hash)
            .map(|bucket| {
                bucket.signatures.len()
                    - bucket
                        .signatures
                        .keys()
                        .filter(|signer| self.equivocators.contains(signer))
                        .count()
                    < usize::from(*self.params.group_quorum())
            })
            .unwrap_or(true)
    }

    /// The hash of the canonical result, once one exists.
    pub fn canonical_hash(&self) -> Option<ResultHash> {
        self.canonical().map(|(hash, _)| *hash)
    }

    /// Assemble the canonical result for submission by `submitter`.
    pub fn finalize(&self, submitter: MemberIndex) -> Result<DkgResult, Error> {
        self.params.check_index(submitter.get())?;
        let (_, bucket) = self.canonical().ok_or(Error::NoCanonicalResult)?;
        Ok(DkgResult {
            content: bucket.content.clone(),
            signatures: bucket.signatures.clone(),
            submitter_index: submitter,
        })
    }
}

/// The rotating order in which members may submit a result.
///
/// Slot `k` opens `k` windows after submission starts. Once a member's slot
/// opened it stays eligible, so if the member in slot `k` never submits,
/// the member in slot `k + 1` may do so exactly one window later.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct SubmissionPrecedence {
    order: Vec<MemberIndex>,
    start_block: u64,
    window_blocks: u64,
}

impl SubmissionPrecedence {
    /// Order the members that are not misbehaved by index, rotated by an
    /// offset derived from `seed`.
    pub fn new(
        seed: &Seed,
        group_size: u16,
        misbehaved: &BTreeSet<MemberIndex>,
        start_block: u64,
        window_blocks: u64,
    ) -> Self {
        let mut order = MemberIndex::all(group_size)
            .filter(|member| !misbehaved.contains(member))
            .collect::<Vec<_>>();
        if !order.is_empty() {
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&seed.as_bytes()[..8]);
            let offset = (u64::from_be_bytes(offset) % order.len() as u64) as usize;
            order.rotate_left(offset);
        }
        Self {
            order,
            start_block,
            window_blocks: window_blocks.max(1),
        }
    }

    /// The slot of `member`, if it may submit at all.
    pub fn slot_of(&self, member: MemberIndex) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == member)
    }

    /// The member holding `slot`.
    pub fn member_at(&self, slot: usize) -> Option<MemberIndex> {
        self.order.get(slot).copied()
    }

    /// The first block at which `member` may submit.
    pub fn eligible_from(&self, member: MemberIndex) -> Option<u64> {
        self.slot_of(member)
            .map(|slot| self.start_block + slot as u64 * self.window_blocks)
    }

    /// The latest slot open at `block`.
    pub fn current_slot(&self, block: u64) -> Option<usize> {
        if block < self.start_block || self.order.is_empty() {
            return None;
        }
        let slot = ((block - self.start_block) / self.window_blocks) as usize;
        Some(slot.min(self.order.len() - 1))
    }

    /// Whether `member` may submit at `block`.
    pub fn is_eligible(&self, member: MemberIndex, block: u64) -> bool {
        self.eligible_from(member)
            .map(|from| block >= from)
            .unwrap_or(false)
    }
}

/// The window after a submission during which the result can be challenged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct ChallengePeriod {
    result_hash: ResultHash,
    submitter_index: MemberIndex,
    opens_at_block: u64,
    closes_at_block: u64,
}

impl ChallengePeriod {
    /// Open a challenge period for a result submitted at `submitted_at_block`.
    pub fn open(
        result_hash: ResultHash,
        submitter_index: MemberIndex,
        submitted_at_block: u64,
        challenge_period_blocks: u64,
    ) -> Self {
        Self {
            result_hash,
            submitter_index,
            opens_at_block: submitted_at_block,
            closes_at_block: submitted_at_block + challenge_period_blocks,
        }
    }

    /// Whether a challenge can still be filed at `block`.
    pub fn is_open(&self, block: u64) -> bool {
        block < self.closes_at_block
    }

    /// Whether `member` may approve at `block`: the submitter right after the
    /// period closes, everybody else after the approval precedence window.
    pub fn may_approve(&self, member: MemberIndex, block: u64, approval_precedence_blocks: u64) -> bool {
        if self.is_open(block) {
            return false;
        }
        member == self.submitter_index || block >= self.closes_at_block + approval_precedence_blocks
    }
}

/// Why a published result is invalid. Any of these is grounds for a
/// challenge and is what a challenger presents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeProof {
    /// Fewer matching signatures than the group quorum.
    InsufficientSupport {
        /// Valid signatures.
        have: usize,
        /// The group quorum.
        need: usize,
    },
    /// A signature does not verify or was made with a foreign key.
    InvalidSignature(MemberIndex),
    /// A misbehaved member signed.
    MisbehavedSigner(MemberIndex),
    /// A member index outside the group.
    InvalidMemberIndex(u16),
    /// The members hash does not match the selected group.
    MembersHashMismatch,
    /// The submitter is not a member, or is misbehaved.
    InvalidSubmitter(MemberIndex),
    /// The group public key is the point at infinity.
    IdentityGroupKey,
    /// Too many members are excluded for the group to sign.
    TooManyMisbehaved,
}

/// Check a published result against the selected group. Returns the result
/// hash when it is consistent.
pub fn validate_result(
    seed: &Seed,
    members: &[OperatorId],
    params: &GroupParameters,
    result: &DkgResult,
) -> Result<ResultHash, ChallengeProof> {
    let content = &result.content;
    if content.group_public_key.is_identity() {
        return Err(ChallengeProof::IdentityGroupKey);
    }
    for member in &content.misbehaved_members {
        if params.check_index(member.get()).is_err() {
            return Err(ChallengeProof::InvalidMemberIndex(member.get()));
        }
    }
    let remaining = usize::from(*params.group_size()) - content.misbehaved_members.len();
    if remaining < usize::from(*params.honest_threshold()) {
        return Err(ChallengeProof::TooManyMisbehaved);
    }
    if members_hash(members, &content.misbehaved_members) != content.members_hash {
        return Err(ChallengeProof::MembersHashMismatch);
    }
    let submitter = result.submitter_index;
    if params.check_index(submitter.get()).is_err() || content.misbehaved_members.contains(&submitter)
    {
        return Err(ChallengeProof::InvalidSubmitter(submitter));
    }

    let hash = content
        .hash(seed)
        .map_err(|_| ChallengeProof::IdentityGroupKey)?;
    for (signer, signature) in &result.signatures {
        let operator = members
            .get(signer.position())
            .ok_or(ChallengeProof::InvalidMemberIndex(signer.get()))?;
        if content.misbehaved_members.contains(signer) {
            return Err(ChallengeProof::MisbehavedSigner(*signer));
        }
        signature
            .verify(&hash, operator)
            .map_err(|_| ChallengeProof::InvalidSignature(*signer))?;
    }
    let need = usize::from(*params.group_quorum());
    if result.signatures.len() < need {
        return Err(ChallengeProof::InsufficientSupport {
            have: result.signatures.len(),
            need,
        });
    }
    Ok(hash)
}
