//! Result arbitration test functions.

use std::collections::{BTreeMap, BTreeSet};

use ark_ff::Zero;
use rand_core::{CryptoRng, RngCore};

use crate::{
    keys::generate_with_dealer,
    operator::OperatorKey,
    result::{
        validate_result, ChallengePeriod, ChallengeProof, DkgResult, ResultArbiter, ResultContent,
        SignedResult, SubmissionPrecedence,
    },
    Error, GroupParameters, GroupPublicKey, MemberIndex, OperatorId, ResultHash, Seed,
};

use super::helpers::{index, indices, operator_ids, operator_keys};

struct Fixture {
    seed: Seed,
    params: GroupParameters,
    keys: Vec<OperatorKey>,
    members: Vec<OperatorId>,
    group_public_key: GroupPublicKey,
}

impl Fixture {
    fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let params = GroupParameters::with_default_quorum(5, 3).expect("5 of 3 is valid");
        let keys = operator_keys(5, rng);
        let members = operator_ids(&keys);
        let (_, public) = generate_with_dealer(&params, rng).unwrap();
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self {
            seed: Seed::from_bytes(seed),
            params,
            keys,
            members,
            group_public_key: *public.group_public_key(),
        }
    }

    fn content(&self, misbehaved: BTreeSet<MemberIndex>) -> ResultContent {
        ResultContent::new(self.group_public_key, misbehaved, &self.members)
    }

    /// `member` signs `content`.
    fn signed(&self, member: u16, content: &ResultContent) -> SignedResult {
        SignedResult::sign(
            &self.seed,
            content.clone(),
            &self.keys[index(member).position()],
        )
        .unwrap()
    }

    fn arbiter(&self) -> ResultArbiter {
        ResultArbiter::new(self.seed, self.members.clone(), self.params).unwrap()
    }
}

/// Collecting the same candidate again changes nothing.
pub fn check_arbiter_idempotence<R: RngCore + CryptoRng>(mut rng: R) {
    let fixture = Fixture::new(&mut rng);
    let content = fixture.content(BTreeSet::new());
    let mut arbiter = fixture.arbiter();

    let candidate = fixture.signed(1, &content);
    let hash = arbiter.collect_candidate(index(1), candidate.clone()).unwrap();
    for _ in 0..3 {
        assert_eq!(
            arbiter.collect_candidate(index(1), candidate.clone()),
            Ok(hash)
        );
    }
    assert_eq!(arbiter.bucket_count(), 1);
    assert_eq!(arbiter.support(&hash), 1);
    assert_eq!(hash, content.hash(&fixture.seed).unwrap());
}

/// A member supporting two different results is rejected and its support
/// no longer helps any result reach quorum.
pub fn check_arbiter_equivocation<R: RngCore + CryptoRng>(mut rng: R) {
    let fixture = Fixture::new(&mut rng);
    let honest = fixture.content(BTreeSet::new());
    let other = fixture.content(indices(&[5]));
    let mut arbiter = fixture.arbiter();

    for member in 1..=3 {
        arbiter
            .collect_candidate(index(member), fixture.signed(member, &honest))
            .unwrap();
    }
    assert_eq!(
        arbiter.collect_candidate(index(3), fixture.signed(3, &other)),
        Err(Error::ConflictingSupport { signer: index(3) })
    );
    assert_eq!(arbiter.equivocators(), &indices(&[3]));
    assert_eq!(arbiter.canonical_hash(), None);

    arbiter
        .collect_candidate(index(4), fixture.signed(4, &honest))
        .unwrap();
    assert_eq!(
        arbiter.canonical_hash(),
        Some(honest.hash(&fixture.seed).unwrap())
    );
}

/// No result is canonical before it reaches the group quorum; the canonical
/// result then passes validation.
pub fn check_finalize_needs_quorum<R: RngCore + CryptoRng>(mut rng: R) {
    let fixture = Fixture::new(&mut rng);
    let content = fixture.content(indices(&[4]));
    let rival = fixture.content(BTreeSet::new());
    let mut arbiter = fixture.arbiter();

    arbiter
        .collect_candidate(index(1), fixture.signed(1, &content))
        .unwrap();
    arbiter
        .collect_candidate(index(2), fixture.signed(2, &content))
        .unwrap();
    arbiter
        .collect_candidate(index(4), fixture.signed(4, &rival))
        .unwrap();
    assert_eq!(arbiter.finalize(index(1)), Err(Error::NoCanonicalResult));

    arbiter
        .collect_candidate(index(5), fixture.signed(5, &content))
        .unwrap();
    let result = arbiter.finalize(index(2)).unwrap();
    assert_eq!(result.misbehaved_members(), &indices(&[4]));
    assert_eq!(result.signatures().len(), 3);
    assert_eq!(*result.submitter_index(), index(2));

    let hash = validate_result(&fixture.seed, &fixture.members, &fixture.params, &result).unwrap();
    assert_eq!(hash, result.hash(&fixture.seed).unwrap());
}

/// Signatures made with a key that does not belong to the claimed member, or
/// by a member the result lists as misbehaved, are rejected.
pub fn check_foreign_signatures<R: RngCore + CryptoRng>(mut rng: R) {
    let fixture = Fixture::new(&mut rng);
    let content = fixture.content(indices(&[2]));
    let mut arbiter = fixture.arbiter();

    assert_eq!(
        arbiter.collect_candidate(index(3), fixture.signed(1, &content)),
        Err(Error::InvalidResultSignature { signer: index(3) })
    );
    assert_eq!(
        arbiter.collect_candidate(index(2), fixture.signed(2, &content)),
        Err(Error::InvalidResultSignature { signer: index(2) })
    );
    assert_eq!(
        arbiter.collect_candidate(index(6), fixture.signed(1, &content)),
        Err(Error::InvalidMemberIndex(6))
    );
    assert!(arbiter.signers().is_empty());
}

/// Each inconsistency of a published result is detected.
pub fn check_validation_grounds<R: RngCore + CryptoRng>(mut rng: R) {
    let fixture = Fixture::new(&mut rng);
    let content = fixture.content(indices(&[5]));
    let hash = content.hash(&fixture.seed).unwrap();
    let signatures = (1..=4)
        .map(|member| {
            (
                index(member),
                fixture.signed(member, &content).signature().clone(),
            )
        })
        .collect::<BTreeMap<_, _>>();
    let validate = |result: &DkgResult| {
        validate_result(&fixture.seed, &fixture.members, &fixture.params, result)
    };

    let valid = DkgResult::new(content.clone(), signatures.clone(), index(1));
    assert_eq!(validate(&valid), Ok(hash));

    let few = signatures
        .clone()
        .into_iter()
        .take(2)
        .collect::<BTreeMap<_, _>>();
    assert_eq!(
        validate(&DkgResult::new(content.clone(), few, index(1))),
        Err(ChallengeProof::InsufficientSupport { have: 2, need: 3 })
    );

    assert_eq!(
        validate(&DkgResult::new(content.clone(), signatures.clone(), index(5))),
        Err(ChallengeProof::InvalidSubmitter(index(5)))
    );

    let mut swapped = signatures.clone();
    let first = swapped[&index(1)].clone();
    swapped.insert(index(2), first);
    assert_eq!(
        validate(&DkgResult::new(content.clone(), swapped, index(1))),
        Err(ChallengeProof::InvalidSignature(index(2)))
    );

    let mut with_misbehaved = signatures.clone();
    with_misbehaved.insert(
        index(5),
        fixture.signed(5, &content).signature().clone(),
    );
    assert_eq!(
        validate(&DkgResult::new(content.clone(), with_misbehaved, index(1))),
        Err(ChallengeProof::MisbehavedSigner(index(5)))
    );

    let mut forged = content.clone();
    forged.misbehaved_members = indices(&[4]);
    assert_eq!(
        validate(&DkgResult::new(forged, signatures.clone(), index(1))),
        Err(ChallengeProof::MembersHashMismatch)
    );

    let mut forged = content.clone();
    forged.group_public_key = GroupPublicKey(ark_bls12_381::G2Projective::zero());
    assert_eq!(
        validate(&DkgResult::new(forged, signatures.clone(), index(1))),
        Err(ChallengeProof::IdentityGroupKey)
    );

    let forged = fixture.content(indices(&[3, 4, 5]));
    assert_eq!(
        validate(&DkgResult::new(forged, signatures, index(1))),
        Err(ChallengeProof::TooManyMisbehaved)
    );
}

/// If the member at slot `k` never submits, slot `k + 1` becomes eligible
/// exactly one window later, and eligibility never lapses.
pub fn check_precedence_liveness() {
    let seed = Seed::from_bytes([9; 32]);
    let precedence = SubmissionPrecedence::new(&seed, 5, &indices(&[3]), 100, 6);
    assert_eq!(precedence.order().len(), 4);
    assert_eq!(precedence.slot_of(index(3)), None);
    assert!(!precedence.is_eligible(index(3), 10_000));

    let first = precedence.member_at(0).unwrap();
    let second = precedence.member_at(1).unwrap();
    assert!(!precedence.is_eligible(first, 99));
    assert!(precedence.is_eligible(first, 100));
    assert!(!precedence.is_eligible(second, 105));
    assert!(precedence.is_eligible(second, 106));
    assert!(precedence.is_eligible(first, 1_000));
    assert_eq!(precedence.current_slot(99), None);
    assert_eq!(precedence.current_slot(106), Some(1));
    assert_eq!(precedence.current_slot(10_000), Some(3));

    // The order is a rotation of index order.
    let order = precedence.order();
    let start = order
        .iter()
        .position(|member| *member == index(1))
        .unwrap();
    let rotated = order[start..]
        .iter()
        .chain(order[..start].iter())
        .copied()
        .collect::<Vec<_>>();
    assert_eq!(rotated, vec![index(1), index(2), index(4), index(5)]);

    // Every member derives the same order from the seed.
    assert_eq!(
        &SubmissionPrecedence::new(&seed, 5, &indices(&[3]), 100, 6),
        &precedence
    );
}

/// The submitter approves first; everyone else after the precedence window.
pub fn check_challenge_period() {
    let period = ChallengePeriod::open(ResultHash::from_bytes([1; 32]), index(2), 50, 10);
    assert_eq!(*period.closes_at_block(), 60);
    assert!(period.is_open(59));
    assert!(!period.is_open(60));
    assert!(!period.may_approve(index(2), 59, 5));
    assert!(period.may_approve(index(2), 60, 5));
    assert!(!period.may_approve(index(1), 64, 5));
    assert!(period.may_approve(index(1), 65, 5));
}
