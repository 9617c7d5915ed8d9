//! Threshold BLS keys, verifiable secret sharing, key shares
#![allow(clippy::type_complexity)]

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug},
    iter,
};

use ark_bls12_381::{Fr, G2Projective};
use ark_ec::Group as _;
use ark_ff::{Field, One, UniformRand, Zero};
use derive_getters::Getters;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{DefaultIsZeroes, Zeroize};

use crate::{
    serialization::{ark_compressed, from_compressed, to_compressed},
    Error, GroupId, GroupParameters, MemberIndex,
};

pub mod dkg;

/// The scalar a member index evaluates polynomials at.
pub(crate) fn index_scalar(index: MemberIndex) -> Fr {
    Fr::from(u64::from(index.get()))
}

/// Generates the lagrange coefficient at zero for `index` over the
/// interpolation set `indices`.
pub(crate) fn lagrange_coefficient(
    index: MemberIndex,
    indices: &BTreeSet<MemberIndex>,
) -> Result<Fr, Error> {
    let x_i = index_scalar(index);
    let mut num = Fr::one();
    let mut den = Fr::one();

    for other in indices {
        if *other == index {
            continue;
        }
        let x_j = index_scalar(*other);
        num *= x_j;
        den *= x_j - x_i;
    }

    let den = den.inverse().ok_or(Error::DuplicatedShares)?;
    Ok(num * den)
}

/// A single polynomial coefficient, zeroized with its [`SecretPolynomial`].
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct Coefficient(Fr);

impl DefaultIsZeroes for Coefficient {}

/// A dealer's secret polynomial `f(x) = a_0 + a_1 x + ... + a_{t-1} x^{t-1}`.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct SecretPolynomial {
    coefficients: Vec<Coefficient>,
}

impl SecretPolynomial {
    /// Sample a polynomial of degree `honest_threshold - 1`.
    pub(crate) fn random<R: RngCore + CryptoRng>(honest_threshold: u16, rng: &mut R) -> Self {
        let coefficients = iter::repeat_with(|| Coefficient(Fr::rand(rng)))
            .take(usize::from(honest_threshold))
            .collect();
        Self { coefficients }
    }

    /// Sample a polynomial with a fixed constant term.
    pub(crate) fn with_secret<R: RngCore + CryptoRng>(
        secret: Fr,
        honest_threshold: u16,
        rng: &mut R,
    ) -> Self {
        let mut polynomial = Self::random(honest_threshold, rng);
        if let Some(first) = polynomial.coefficients.first_mut() {
            *first = Coefficient(secret);
        }
        polynomial
    }

    /// Evaluate the polynomial at `index` with Horner's rule.
    pub(crate) fn evaluate(&self, index: MemberIndex) -> SigningShare {
        let x = index_scalar(index);
        let value = self
            .coefficients
            .iter()
            .rev()
            .fold(Fr::zero(), |acc, coefficient| acc * x + coefficient.0);
        SigningShare(value)
    }

    /// The public commitments `g2^{a_k}` to every coefficient.
    pub(crate) fn commit(&self) -> Commitments {
        Commitments(
            self.coefficients
                .iter()
                .map(|coefficient| CoefficientCommitment(G2Projective::generator() * coefficient.0))
                .collect(),
        )
    }
}

impl Debug for SecretPolynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPolynomial")
            .field("degree", &self.coefficients.len().saturating_sub(1))
            .field("coefficients", &"<redacted>")
            .finish()
    }
}

impl Zeroize for SecretPolynomial {
    fn zeroize(&mut self) {
        self.coefficients.zeroize();
    }
}

impl Drop for SecretPolynomial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// A secret scalar value: either a share a dealer sent to one member, or a
/// member's long-lived share of the group secret.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningShare(#[serde(with = "ark_compressed")] pub(crate) Fr);

impl SigningShare {
    /// Deserialize from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        from_compressed(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedScalar)
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        to_compressed(&self.0)
    }

    /// The public key share matching this secret share.
    pub fn public_key_share(&self) -> PublicKeyShare {
        PublicKeyShare(G2Projective::generator() * self.0)
    }
}

impl Debug for SigningShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningShare").field(&"<redacted>").finish()
    }
}

// Implements [`Zeroize`] by overwriting a value with the [`Default::default()`] value
impl DefaultIsZeroes for SigningShare {}

/// A public G2 element that verifies a single member's partial signatures.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyShare(#[serde(with = "ark_compressed")] pub(crate) G2Projective);

impl PublicKeyShare {
    /// Serialize to compressed bytes
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        to_compressed(&self.0)
    }
}

impl Debug for PublicKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKeyShare")
            .field(&self.serialize().map(hex::encode).unwrap_or_default())
            .finish()
    }
}

/// The group public key, `g2^s` for the never-reconstructed group secret `s`.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupPublicKey(#[serde(with = "ark_compressed")] pub(crate) G2Projective);

impl GroupPublicKey {
    /// Deserialize from compressed bytes, rejecting the point at infinity.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let point: G2Projective = from_compressed(bytes)?;
        if point.is_zero() {
            return Err(Error::InvalidIdentityElement);
        }
        Ok(Self(point))
    }

    /// Serialize to compressed bytes
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        to_compressed(&self.0)
    }

    /// Whether this is the point at infinity, which no honest DKG produces.
    pub fn is_identity(&self) -> bool {
        self.0.is_zero()
    }

    /// The group identifier: SHA-256 over the compressed key.
    pub fn group_id(&self) -> Result<GroupId, Error> {
        Ok(GroupId(Sha256::digest(self.serialize()?).into()))
    }
}

impl Debug for GroupPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupPublicKey")
            .field(&self.serialize().map(hex::encode).unwrap_or_default())
            .finish()
    }
}

/// A commitment to a single polynomial coefficient.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoefficientCommitment(#[serde(with = "ark_compressed")] pub(crate) G2Projective);

impl Debug for CoefficientCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CoefficientCommitment")
            .field(&to_compressed(&self.0).map(hex::encode).unwrap_or_default())
            .finish()
    }
}

/// The Feldman commitments `[g2^{a_0}, ..., g2^{a_{t-1}}]` a dealer
/// broadcasts in round 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitments(pub(crate) Vec<CoefficientCommitment>);

impl Commitments {
    /// The number of committed coefficients.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no coefficient is committed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Commitment to the dealer's secret, `g2^{a_0}`.
    pub(crate) fn constant(&self) -> G2Projective {
        self.0
            .first()
            .map(|commitment| commitment.0)
            .unwrap_or_else(G2Projective::zero)
    }

    /// Evaluates the right-hand side of the VSS verification equation,
    /// `Σ_k C_k · index^k`, which is `g2^{f(index)}` for an honest dealer.
    pub(crate) fn evaluate(&self, index: MemberIndex) -> G2Projective {
        let x = index_scalar(index);
        self.0
            .iter()
            .rev()
            .fold(G2Projective::zero(), |acc, commitment| acc * x + commitment.0)
    }

    /// Check a share the dealer of these commitments sent to `index`.
    pub fn verify_share(&self, index: MemberIndex, share: &SigningShare) -> bool {
        G2Projective::generator() * share.0 == self.evaluate(index)
    }

    /// Check the commitment vector has the shape the group expects.
    pub(crate) fn validate(&self, params: &GroupParameters) -> Result<(), Error> {
        if self.0.len() != usize::from(*params.honest_threshold()) {
            return Err(Error::IncorrectNumberOfCommitments);
        }
        Ok(())
    }
}

/// The long-lived key material of one member, kept in process memory only.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
pub struct KeyPackage {
    /// The member this key package belongs to.
    index: MemberIndex,
    /// The member's share of the group secret.
    signing_share: SigningShare,
    /// `g2^{signing_share}`.
    public_key_share: PublicKeyShare,
    /// The group public key.
    group_public_key: GroupPublicKey,
    /// Partial signatures needed for a threshold signature.
    honest_threshold: u16,
}

impl KeyPackage {
    pub(crate) fn new(
        index: MemberIndex,
        signing_share: SigningShare,
        group_public_key: GroupPublicKey,
        honest_threshold: u16,
    ) -> Self {
        Self {
            index,
            public_key_share: signing_share.public_key_share(),
            signing_share,
            group_public_key,
            honest_threshold,
        }
    }
}

impl Zeroize for KeyPackage {
    fn zeroize(&mut self) {
        self.signing_share.zeroize();
    }
}

impl Drop for KeyPackage {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Public data of a group: the group key and the public key share of every
/// qualified member, computable by anyone from the broadcast commitments.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct PublicKeyPackage {
    public_key_shares: BTreeMap<MemberIndex, PublicKeyShare>,
    group_public_key: GroupPublicKey,
    honest_threshold: u16,
}

impl PublicKeyPackage {
    /// Derive the public key package from the commitments of the qualified
    /// dealers. Only qualified members receive a public key share.
    pub(crate) fn from_commitments(
        commitments: &BTreeMap<MemberIndex, Commitments>,
        qualified: &BTreeSet<MemberIndex>,
        honest_threshold: u16,
    ) -> Result<Self, Error> {
        let dealers = commitments
            .iter()
            .filter(|(dealer, _)| qualified.contains(dealer))
            .map(|(_, commitments)| commitments)
            .collect::<Vec<_>>();

        let group_public_key = dealers
            .iter()
            .fold(G2Projective::zero(), |acc, commitments| {
                acc + commitments.constant()
            });
        if group_public_key.is_zero() {
            return Err(Error::InvalidIdentityElement);
        }

        let public_key_shares = qualified
            .iter()
            .map(|index| {
                let share = dealers
                    .iter()
                    .fold(G2Projective::zero(), |acc, commitments| {
                        acc + commitments.evaluate(*index)
                    });
                (*index, PublicKeyShare(share))
            })
            .collect();

        Ok(Self {
            public_key_shares,
            group_public_key: GroupPublicKey(group_public_key),
            honest_threshold,
        })
    }

    /// The public key share of `index`, if that member is qualified.
    pub fn public_key_share(&self, index: MemberIndex) -> Option<&PublicKeyShare> {
        self.public_key_shares.get(&index)
    }
}

/// Split a fresh random secret among `group_size` members with a trusted
/// dealer.
///
/// Groups on the network are formed with [`dkg`]; a dealer is useful for
/// tests and benchmarks of the signing path.
pub fn generate_with_dealer<R: RngCore + CryptoRng>(
    params: &GroupParameters,
    rng: &mut R,
) -> Result<(BTreeMap<MemberIndex, KeyPackage>, PublicKeyPackage), Error> {
    params.validate()?;
    let secret = Fr::rand(rng);
    let polynomial = SecretPolynomial::with_secret(secret, *params.honest_threshold(), rng);

    let commitments = polynomial.commit();
    let group_public_key = GroupPublicKey(commitments.constant());
    let members = MemberIndex::all(*params.group_size()).collect::<Vec<_>>();
    let public = PublicKeyPackage {
        public_key_shares: members
            .iter()
            .map(|index| (*index, PublicKeyShare(commitments.evaluate(*index))))
            .collect(),
        group_public_key,
        honest_threshold: *params.honest_threshold(),
    };

    let key_packages = members
        .iter()
        .map(|index| {
            (
                *index,
                KeyPackage::new(
                    *index,
                    polynomial.evaluate(*index),
                    public.group_public_key,
                    *params.honest_threshold(),
                ),
            )
        })
        .collect();

    Ok((key_packages, public))
}
