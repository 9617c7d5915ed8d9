use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use beacon_core::{
    keys::generate_with_dealer,
    selection::select_group,
    signing::{aggregate, sign},
    GroupParameters, MemberIndex, PartialSignature, Seed,
};

mod common;

proptest! {
    #[test]
    fn selection_is_a_pure_function(
        seed in any::<[u8; 32]>(),
        weights in prop::collection::vec(1u64..10_000, 1..48),
        size in 1u16..48,
    ) {
        let pool = common::pool(&weights);
        let seed = Seed::from_bytes(seed);
        let first = select_group(&seed, &pool, size);
        let second = select_group(&seed, &pool, size);
        prop_assert_eq!(&first, &second);
        match first {
            Ok(group) => {
                prop_assert_eq!(group.len(), usize::from(size));
                let mut distinct = group.clone();
                distinct.sort();
                distinct.dedup();
                prop_assert_eq!(distinct.len(), group.len());
            }
            Err(_) => prop_assert!(usize::from(size) > weights.len()),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn aggregation_ignores_subset_composition(
        key_seed in any::<u64>(),
        subset in prop::sample::subsequence((1u16..=7).collect::<Vec<_>>(), 4..=7),
        message in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(key_seed);
        let params = GroupParameters::with_default_quorum(7, 4).unwrap();
        let (key_packages, public) = generate_with_dealer(&params, &mut rng).unwrap();

        let partials = key_packages
            .values()
            .map(|key_package| {
                let partial = sign(key_package, &message).unwrap();
                (*partial.index(), partial)
            })
            .collect::<BTreeMap<MemberIndex, PartialSignature>>();
        let lowest = partials
            .clone()
            .into_iter()
            .take(4)
            .collect::<BTreeMap<_, _>>();
        let reference = aggregate(&lowest, &public).unwrap();

        // Highest indices first, to make sure order never matters.
        let chosen = subset
            .iter()
            .rev()
            .map(|member| {
                let member = MemberIndex::new(*member).unwrap();
                (member, partials[&member])
            })
            .collect::<BTreeMap<_, _>>();
        let signature = aggregate(&chosen, &public).unwrap();
        prop_assert_eq!(signature, reference);
        prop_assert!(public.group_public_key().verify(&message, &signature).is_ok());
    }
}
