use beacon_core::{
    keys::generate_with_dealer, ChainParameters, GroupParameters, MemberIndex, PublicKeyPackage,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[test]
fn public_key_package_survives_json() {
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let params = GroupParameters::with_default_quorum(4, 3).unwrap();
    let (_, public) = generate_with_dealer(&params, &mut rng).unwrap();

    let json = serde_json::to_string(&public).unwrap();
    let decoded: PublicKeyPackage = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, public);
    assert!(decoded
        .public_key_share(MemberIndex::new(4).unwrap())
        .is_some());
}

#[test]
fn member_index_zero_is_rejected_on_the_wire() {
    assert!(serde_json::from_str::<MemberIndex>("0").is_err());
    assert_eq!(
        serde_json::from_str::<MemberIndex>("3").unwrap(),
        MemberIndex::new(3).unwrap()
    );
}

#[test]
fn chain_parameters_fill_missing_timings() {
    let json = r#"{
        "group": { "group_size": 64, "honest_threshold": 33, "group_quorum": 40 },
        "timings": { "submission_window_blocks": 8 }
    }"#;
    let params: ChainParameters = serde_json::from_str(json).unwrap();
    assert_eq!(*params.group().group_quorum(), 40);
    assert_eq!(params.timings().submission_window_blocks, 8);
    assert_eq!(params.timings().round_active_blocks, 5);
}
