//! Deterministic group selection from a sortition pool snapshot.
//!
//! Every member and every outside observer derives the same ordered member
//! list from the same public inputs, so selection is a pure function of the
//! seed and the snapshot: a ChaCha20 stream keyed by the seed drives weighted
//! sampling without replacement.

use std::collections::BTreeSet;

use derive_getters::Getters;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{OperatorId, Seed, SelectionError};

/// An operator registered in the sortition pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct PoolMember {
    operator: OperatorId,
    weight: u64,
}

impl PoolMember {
    /// An operator and its pool weight. Zero weight makes it ineligible.
    pub fn new(operator: OperatorId, weight: u64) -> Self {
        Self { operator, weight }
    }
}

/// The pool as the chain reported it at selection time. Order matters:
/// it is the chain's canonical order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    members: Vec<PoolMember>,
}

impl PoolSnapshot {
    /// Wrap the chain's pool listing.
    pub fn new(members: Vec<PoolMember>) -> Self {
        Self { members }
    }

    /// All registered operators.
    pub fn members(&self) -> &[PoolMember] {
        &self.members
    }

    /// Operators with non-zero weight.
    pub fn eligible(&self) -> impl Iterator<Item = &PoolMember> {
        self.members.iter().filter(|member| member.weight > 0)
    }
}

fn selection_rng(seed: &Seed) -> ChaCha20Rng {
    let mut hasher = Sha256::new();
    hasher.update(b"beacon-group-selection");
    hasher.update(seed.as_bytes());
    ChaCha20Rng::from_seed(hasher.finalize().into())
}

/// Select an ordered group of `group_size` operators.
///
/// Position `i` in the returned list is member index `i + 1`.
pub fn select_group(
    seed: &Seed,
    pool: &PoolSnapshot,
    group_size: u16,
) -> Result<Vec<OperatorId>, SelectionError> {
    if group_size == 0 {
        return Err(SelectionError::ZeroGroupSize);
    }

    let mut seen = BTreeSet::new();
    if !pool.members.iter().all(|member| seen.insert(member.operator)) {
        return Err(SelectionError::DuplicateOperator);
    }

    let mut candidates = pool.eligible().copied().collect::<Vec<_>>();
    let required = usize::from(group_size);
    if candidates.len() < required {
        return Err(SelectionError::InsufficientPoolSize {
            available: candidates.len(),
            required,
        });
    }

    let mut rng = selection_rng(seed);
    let mut selected = Vec::with_capacity(required);
    while selected.len() < required {
        let total: u128 = candidates
            .iter()
            .map(|member| u128::from(member.weight))
            .sum();
        let mut ticket = rng.gen_range(0..total);
        let position = candidates
            .iter()
            .position(|member| {
                let weight = u128::from(member.weight);
                if ticket < weight {
                    true
                } else {
                    ticket -= weight;
                    false
                }
            })
            .unwrap_or(candidates.len() - 1);
        selected.push(candidates.remove(position).operator);
    }

    Ok(selected)
}
