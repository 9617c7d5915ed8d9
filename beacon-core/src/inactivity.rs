//! Inactivity claims: group-signed attestations that members failed to take
//! part in a signing session.

use std::collections::BTreeSet;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{signing::Signature, Error, GroupId, GroupPublicKey, MemberIndex};

/// The digest a group signs to accuse `accused` of inactivity.
pub(crate) fn claim_digest(group_id: &GroupId, nonce: u64, accused: &BTreeSet<MemberIndex>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"beacon-inactivity-claim");
    hasher.update(group_id.as_bytes());
    hasher.update(nonce.to_be_bytes());
    for member in accused {
        hasher.update(member.get().to_be_bytes());
    }
    hasher.finalize().into()
}

/// A threshold-signed claim, ready for `NotifyOperatorInactivity`.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct InactivityClaim {
    group_id: GroupId,
    nonce: u64,
    accused_indices: BTreeSet<MemberIndex>,
    claim_signature: Signature,
}

impl InactivityClaim {
    /// Bundle a claim with the group signature over its digest.
    pub fn new(
        group_id: GroupId,
        nonce: u64,
        accused_indices: BTreeSet<MemberIndex>,
        claim_signature: Signature,
    ) -> Self {
        Self {
            group_id,
            nonce,
            accused_indices,
            claim_signature,
        }
    }

    /// The signed digest.
    pub fn digest(&self) -> [u8; 32] {
        claim_digest(&self.group_id, self.nonce, &self.accused_indices)
    }

    /// Check the claim signature against the group key.
    pub fn verify(&self, group_public_key: &GroupPublicKey) -> Result<(), Error> {
        group_public_key.verify(&self.digest(), &self.claim_signature)
    }
}

/// Blocks `member` waits before submitting a claim, so that signers submit
/// one after another in index order instead of racing.
pub fn submission_delay_blocks(
    member: MemberIndex,
    signers: &BTreeSet<MemberIndex>,
    step_blocks: u64,
) -> u64 {
    let position = signers.iter().take_while(|signer| **signer < member).count();
    position as u64 * step_blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(values: &[u16]) -> BTreeSet<MemberIndex> {
        values.iter().map(|v| MemberIndex::new(*v).unwrap()).collect()
    }

    #[test]
    fn submission_delay_follows_index_order() {
        let signers = indices(&[1, 3, 4]);
        let step = 2;
        assert_eq!(submission_delay_blocks(MemberIndex::new(1).unwrap(), &signers, step), 0);
        assert_eq!(submission_delay_blocks(MemberIndex::new(3).unwrap(), &signers, step), 2);
        assert_eq!(submission_delay_blocks(MemberIndex::new(4).unwrap(), &signers, step), 4);
    }

    #[test]
    fn digest_binds_accused_set_and_nonce() {
        let group = GroupId::from_bytes([7; 32]);
        let a = claim_digest(&group, 1, &indices(&[2]));
        assert_ne!(a, claim_digest(&group, 2, &indices(&[2])));
        assert_ne!(a, claim_digest(&group, 1, &indices(&[3])));
        assert_eq!(a, claim_digest(&group, 1, &indices(&[2])));
    }
}
