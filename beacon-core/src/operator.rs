//! Operator identities: secp256k1 ECDSA keys that sign DKG results.

use std::fmt::{self, Debug};

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as EcdsaSignature, SigningKey, VerifyingKey,
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, OperatorId};

/// The private key of an operator. Zeroized on drop by `k256`.
#[derive(Clone)]
pub struct OperatorKey(SigningKey);

impl OperatorKey {
    /// Generate a fresh operator key.
    pub fn random<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(SigningKey::random(rng))
    }

    /// Load a key from its 32-byte scalar encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedOperatorKey)
    }

    /// The matching public key.
    pub fn public_key(&self) -> OperatorPublicKey {
        OperatorPublicKey(*self.0.verifying_key())
    }

    /// The on-chain identity of this operator.
    pub fn operator_id(&self) -> OperatorId {
        self.public_key().operator_id()
    }

    /// Sign `message`, hashing it with SHA-256.
    pub fn sign(&self, message: &[u8]) -> OperatorSignature {
        let signature: EcdsaSignature = self.0.sign(message);
        OperatorSignature(signature.to_bytes().to_vec())
    }
}

impl Debug for OperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperatorKey").field(&"<redacted>").finish()
    }
}

/// An operator's public key, in compressed SEC1 form on the wire.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct OperatorPublicKey(VerifyingKey);

impl OperatorPublicKey {
    /// Decode a SEC1 encoded key.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, Error> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedOperatorKey)
    }

    /// The compressed SEC1 encoding.
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// The first 20 bytes of SHA-256 over the compressed key.
    pub fn operator_id(&self) -> OperatorId {
        let digest = Sha256::digest(self.to_sec1_bytes());
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        OperatorId(id)
    }

    /// Verify an operator signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &OperatorSignature) -> Result<(), Error> {
        let signature = EcdsaSignature::from_slice(&signature.0)
            .map_err(|_| Error::MalformedOperatorSignature)?;
        self.0
            .verify(message, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl Debug for OperatorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperatorPublicKey")
            .field(&hex::encode(self.to_sec1_bytes()))
            .finish()
    }
}

impl Serialize for OperatorPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serdect::slice::serialize_hex_lower_or_bin(&self.to_sec1_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for OperatorPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = serdect::slice::deserialize_hex_or_bin_vec(deserializer)?;
        Self::from_sec1_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A 64-byte compact ECDSA signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorSignature(
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub(crate) Vec<u8>,
);

impl OperatorSignature {
    /// The raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wrap raw bytes, without checking them.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Debug for OperatorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperatorSignature")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn signature_verifies_only_for_signed_message() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let key = OperatorKey::random(&mut rng);
        let signature = key.sign(b"result hash");

        assert!(key.public_key().verify(b"result hash", &signature).is_ok());
        assert_eq!(
            key.public_key().verify(b"other hash", &signature),
            Err(Error::InvalidSignature)
        );
    }

    #[test]
    fn public_key_roundtrips_through_sec1() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let key = OperatorKey::random(&mut rng);
        let decoded = OperatorPublicKey::from_sec1_bytes(&key.public_key().to_sec1_bytes()).unwrap();
        assert_eq!(decoded.operator_id(), key.operator_id());
    }
}
