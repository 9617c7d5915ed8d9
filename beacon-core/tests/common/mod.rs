//! Shared code for `beacon-core` integration tests.
//!
//! This module uses the legacy directory structure,
//! to avoid compiling an empty "common" test binary:
//! <https://doc.rust-lang.org/book/ch11-03-test-organization.html#submodules-in-integration-tests>

use beacon_core::{
    selection::{PoolMember, PoolSnapshot},
    OperatorId,
};

/// A pool of operators `1..=weights.len()` with the given weights.
pub fn pool(weights: &[u64]) -> PoolSnapshot {
    PoolSnapshot::new(
        weights
            .iter()
            .enumerate()
            .map(|(position, weight)| {
                let mut id = [0u8; 20];
                id[..8].copy_from_slice(&(position as u64 + 1).to_be_bytes());
                PoolMember::new(OperatorId::from_bytes(id), *weight)
            })
            .collect(),
    )
}
