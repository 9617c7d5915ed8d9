//! Group selection test functions.

use std::collections::BTreeSet;

use rand_core::{CryptoRng, RngCore};

use crate::{
    selection::{select_group, PoolMember, PoolSnapshot},
    OperatorId, Seed, SelectionError,
};

fn operators(count: u8) -> Vec<OperatorId> {
    (1..=count).map(|i| OperatorId::from_bytes([i; 20])).collect()
}

fn weighted_pool<R: RngCore + CryptoRng>(count: u8, rng: &mut R) -> PoolSnapshot {
    PoolSnapshot::new(
        operators(count)
            .into_iter()
            .map(|operator| PoolMember::new(operator, 1 + rng.next_u64() % 1_000))
            .collect(),
    )
}

/// Identical inputs yield identical ordered groups of distinct operators;
/// another seed yields another group.
pub fn check_selection_determinism<R: RngCore + CryptoRng>(mut rng: R) {
    let pool = weighted_pool(40, &mut rng);
    let seed = Seed::from_bytes([42; 32]);

    let first = select_group(&seed, &pool, 16).unwrap();
    let second = select_group(&seed, &pool, 16).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 16);
    assert_eq!(first.iter().collect::<BTreeSet<_>>().len(), 16);

    let other = select_group(&Seed::from_bytes([43; 32]), &pool, 16).unwrap();
    assert_ne!(first, other);

    // The whole pool is a permutation of the pool.
    let everyone = select_group(&seed, &pool, 40).unwrap();
    assert_eq!(
        everyone.into_iter().collect::<BTreeSet<_>>(),
        operators(40).into_iter().collect::<BTreeSet<_>>()
    );
}

/// Selection refuses pools it cannot fill and malformed pools.
pub fn check_selection_errors() {
    let seed = Seed::from_bytes([1; 32]);
    let pool = PoolSnapshot::new(
        operators(3)
            .into_iter()
            .map(|operator| PoolMember::new(operator, 10))
            .collect(),
    );

    assert_eq!(
        select_group(&seed, &pool, 4),
        Err(SelectionError::InsufficientPoolSize {
            available: 3,
            required: 4,
        })
    );
    assert_eq!(
        select_group(&seed, &pool, 0),
        Err(SelectionError::ZeroGroupSize)
    );

    let duplicated = PoolSnapshot::new(vec![
        PoolMember::new(OperatorId::from_bytes([1; 20]), 10),
        PoolMember::new(OperatorId::from_bytes([1; 20]), 20),
    ]);
    assert_eq!(
        select_group(&seed, &duplicated, 1),
        Err(SelectionError::DuplicateOperator)
    );
}

/// Operators with zero weight are never selected and do not count toward
/// the pool size.
pub fn check_zero_weight_never_selected<R: RngCore + CryptoRng>(mut rng: R) {
    let mut members = weighted_pool(10, &mut rng).members().to_vec();
    let idle = OperatorId::from_bytes([99; 20]);
    members.push(PoolMember::new(idle, 0));
    let pool = PoolSnapshot::new(members);

    for byte in 0..32u8 {
        let group = select_group(&Seed::from_bytes([byte; 32]), &pool, 10).unwrap();
        assert!(!group.contains(&idle));
    }
    assert_eq!(
        select_group(&Seed::from_bytes([0; 32]), &pool, 11),
        Err(SelectionError::InsufficientPoolSize {
            available: 10,
            required: 11,
        })
    );
}
