//! Threshold BLS signing over BLS12-381: partial signatures, order-independent
//! aggregation, and the signing session state machine.
//!
//! Signatures live in G1 and keys in G2. BLS signing is deterministic, so
//! every set of `honest_threshold` valid partial signatures interpolates to
//! the same group signature.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug},
};

use ark_bls12_381::{g1, Bls12_381, G1Projective, G2Affine};
use ark_ec::{
    hashing::{curve_maps::wb::WBMap, map_to_curve_hasher::MapToCurveBasedHasher, HashToCurve},
    pairing::Pairing,
    AffineRepr, CurveGroup,
};
use ark_ff::{fields::field_hashers::DefaultFieldHasher, Zero};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{
    inactivity,
    keys::{lagrange_coefficient, GroupPublicKey, KeyPackage, PublicKeyPackage},
    serialization::{ark_compressed, from_compressed, to_compressed},
    Error, GroupId, MemberIndex,
};

/// Domain separation tag of the hash to G1.
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

type G1Hasher =
    MapToCurveBasedHasher<G1Projective, DefaultFieldHasher<Sha256, 128>, WBMap<g1::Config>>;

/// Hash a message to a point of G1.
pub(crate) fn hash_to_curve(message: &[u8]) -> Result<G1Projective, Error> {
    let hasher = G1Hasher::new(DST).map_err(|_| Error::HashToCurve)?;
    let point = hasher.hash(message).map_err(|_| Error::HashToCurve)?;
    Ok(point.into_group())
}

/// `e(signature, g2) == e(H(m), public_key)`
fn pairing_check(
    signature: &G1Projective,
    message: &[u8],
    public_key: &ark_bls12_381::G2Projective,
) -> Result<(), Error> {
    let hashed = hash_to_curve(message)?;
    let lhs = Bls12_381::pairing(signature.into_affine(), G2Affine::generator());
    let rhs = Bls12_381::pairing(hashed.into_affine(), public_key.into_affine());
    if lhs == rhs {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// A BLS signature: a point of G1.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "ark_compressed")] pub(crate) G1Projective);

impl Signature {
    /// Deserialize from compressed bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        from_compressed(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedElement)
    }

    /// Serialize to compressed bytes
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        to_compressed(&self.0)
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&self.serialize().map(hex::encode).unwrap_or_default())
            .finish()
    }
}

impl GroupPublicKey {
    /// Verify a group signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        pairing_check(&signature.0, message, &self.0)
    }
}

/// One member's share of a group signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct PartialSignature {
    /// The signer.
    index: MemberIndex,
    /// `H(m)^{s_i}`.
    share: Signature,
}

/// Compute the local member's partial signature over `message`.
pub fn sign(key_package: &KeyPackage, message: &[u8]) -> Result<PartialSignature, Error> {
    let hashed = hash_to_curve(message)?;
    Ok(PartialSignature {
        index: *key_package.index(),
        share: Signature(hashed * key_package.signing_share().0),
    })
}

/// Verify a partial signature against the signer's public key share.
pub fn verify_partial(
    public_key_package: &PublicKeyPackage,
    partial: &PartialSignature,
    message: &[u8],
) -> Result<(), Error> {
    let public_key_share = public_key_package
        .public_key_share(partial.index)
        .ok_or(Error::InvalidPartialSignature {
            signer: partial.index,
        })?;
    pairing_check(&partial.share.0, message, &public_key_share.0).map_err(|_| {
        Error::InvalidPartialSignature {
            signer: partial.index,
        }
    })
}

/// Combine verified partial signatures into the group signature.
///
/// The lowest `honest_threshold` signer indices are interpolated, so the
/// choice of subset never depends on arrival order. Any other valid subset
/// yields the same point.
pub fn aggregate(
    partials: &BTreeMap<MemberIndex, PartialSignature>,
    public_key_package: &PublicKeyPackage,
) -> Result<Signature, Error> {
    let need = usize::from(*public_key_package.honest_threshold());
    if partials.len() < need {
        return Err(Error::NotEnoughShares {
            have: partials.len(),
            need,
        });
    }

    let signers = partials.keys().take(need).copied().collect::<BTreeSet<_>>();
    let mut signature = G1Projective::zero();
    for signer in &signers {
        let partial = partials
            .get(signer)
            .ok_or(Error::InvalidPartialSignature { signer: *signer })?;
        if partial.index != *signer {
            return Err(Error::InvalidPartialSignature { signer: *signer });
        }
        signature += partial.share.0 * lagrange_coefficient(*signer, &signers)?;
    }

    Ok(Signature(signature))
}

/// What a signing session signs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningKind {
    /// The next beacon output: a signature over the previous entry.
    RelayEntry {
        /// The previous relay entry.
        previous_entry: Vec<u8>,
    },
    /// An attestation that `accused` members failed to take part.
    InactivityClaim {
        /// Replay protection, incremented by the chain per group.
        nonce: u64,
        /// Accused member indices.
        accused: BTreeSet<MemberIndex>,
    },
}

impl SigningKind {
    /// The bytes the group signs.
    pub fn message(&self, group_id: &GroupId) -> Vec<u8> {
        match self {
            SigningKind::RelayEntry { previous_entry } => previous_entry.clone(),
            SigningKind::InactivityClaim { nonce, accused } => {
                inactivity::claim_digest(group_id, *nonce, accused).to_vec()
            }
        }
    }
}

/// Which relay entry timeout elapsed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Members that did not contribute get reported as inactive.
    Soft,
    /// The group is terminated.
    Hard,
}

/// Why a signing session failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningFailure {
    /// The session timed out before `honest_threshold` partial signatures
    /// were collected.
    Timeout {
        /// Soft or hard.
        kind: TimeoutKind,
        /// Qualified members without a valid partial signature.
        missing: BTreeSet<MemberIndex>,
    },
}

/// States of a signing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningState {
    /// Collecting partial signatures.
    PartialSignatureBroadcast,
    /// Enough partial signatures arrived; combining them.
    Aggregation,
    /// Finished with a group signature.
    Completed(Signature),
    /// Finished without a group signature.
    Failed(SigningFailure),
}

/// A threshold signing session of one member.
#[derive(Debug)]
pub struct SigningSession {
    group_id: GroupId,
    kind: SigningKind,
    message: Vec<u8>,
    key_package: Option<KeyPackage>,
    public_key_package: PublicKeyPackage,
    partials: BTreeMap<MemberIndex, PartialSignature>,
    invalid: BTreeSet<MemberIndex>,
    state: SigningState,
}

impl SigningSession {
    /// Create a session. Members without a key share still collect and
    /// aggregate partial signatures.
    pub fn new(
        group_id: GroupId,
        kind: SigningKind,
        key_package: Option<KeyPackage>,
        public_key_package: PublicKeyPackage,
    ) -> Self {
        let message = kind.message(&group_id);
        Self {
            group_id,
            kind,
            message,
            key_package,
            public_key_package,
            partials: BTreeMap::new(),
            invalid: BTreeSet::new(),
            state: SigningState::PartialSignatureBroadcast,
        }
    }

    /// The group being asked to sign.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// What is being signed.
    pub fn kind(&self) -> &SigningKind {
        &self.kind
    }

    /// The signed bytes.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// The current state.
    pub fn state(&self) -> &SigningState {
        &self.state
    }

    /// Valid partial signatures collected so far.
    pub fn partials(&self) -> &BTreeMap<MemberIndex, PartialSignature> {
        &self.partials
    }

    /// Members whose partial signatures failed verification.
    pub fn invalid(&self) -> &BTreeSet<MemberIndex> {
        &self.invalid
    }

    /// Produce the local partial signature, to be broadcast.
    pub fn start(&mut self) -> Result<Option<PartialSignature>, Error> {
        if self.state != SigningState::PartialSignatureBroadcast {
            return Err(Error::InvalidState("signing session already finished"));
        }
        let Some(key_package) = &self.key_package else {
            return Ok(None);
        };
        let partial = sign(key_package, &self.message)?;
        self.partials.insert(partial.index, partial);
        Ok(Some(partial))
    }

    /// Accept a partial signature from `sender`, verifying it first.
    /// Invalid partial signatures are recorded against the sender.
    pub fn receive(&mut self, sender: MemberIndex, partial: PartialSignature) -> Result<(), Error> {
        if self.state != SigningState::PartialSignatureBroadcast {
            return Err(Error::LateMessage { sender });
        }
        if partial.index != sender {
            return Err(Error::UnexpectedMessage { sender });
        }
        if self.partials.contains_key(&sender) || self.invalid.contains(&sender) {
            return Ok(());
        }
        if let Err(error) = verify_partial(&self.public_key_package, &partial, &self.message) {
            self.invalid.insert(sender);
            return Err(error);
        }
        self.partials.insert(sender, partial);
        Ok(())
    }

    /// Whether enough valid partial signatures arrived to aggregate.
    pub fn is_ready(&self) -> bool {
        self.partials.len() >= usize::from(*self.public_key_package.honest_threshold())
    }

    /// Aggregate once ready. Returns `None` while more partial signatures
    /// are needed.
    pub fn try_aggregate(&mut self) -> Result<Option<Signature>, Error> {
        match &self.state {
            SigningState::Completed(signature) => return Ok(Some(*signature)),
            SigningState::Failed(_) => return Ok(None),
            _ => {}
        }
        if !self.is_ready() {
            return Ok(None);
        }

        self.state = SigningState::Aggregation;
        let signature = aggregate(&self.partials, &self.public_key_package)?;
        self.public_key_package
            .group_public_key()
            .verify(&self.message, &signature)?;
        self.state = SigningState::Completed(signature);
        Ok(Some(signature))
    }

    /// The session deadline elapsed. Has no effect on a finished session.
    pub fn on_timeout(&mut self, kind: TimeoutKind) -> Option<SigningFailure> {
        if matches!(
            self.state,
            SigningState::Completed(_) | SigningState::Failed(_)
        ) {
            return None;
        }
        let missing = self
            .public_key_package
            .public_key_shares()
            .keys()
            .filter(|member| !self.partials.contains_key(member))
            .copied()
            .collect();
        let failure = SigningFailure::Timeout { kind, missing };
        self.state = SigningState::Failed(failure.clone());
        Some(failure)
    }
}
