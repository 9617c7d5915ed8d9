//! Threshold signing test functions.

use std::collections::BTreeMap;

use itertools::Itertools;
use rand_core::{CryptoRng, RngCore};

use crate::{
    inactivity::InactivityClaim,
    keys::generate_with_dealer,
    signing::{
        aggregate, sign, SigningFailure, SigningKind, SigningSession, SigningState, TimeoutKind,
    },
    Error, GroupParameters, MemberIndex, PartialSignature,
};

use super::helpers::{index, indices};

fn params() -> GroupParameters {
    GroupParameters::with_default_quorum(5, 3).expect("5 of 3 is valid")
}

/// Every member runs a session; each of them aggregates a signature that
/// verifies under the group key.
pub fn check_sign_with_dealer<R: RngCore + CryptoRng>(mut rng: R) {
    let (key_packages, public) = generate_with_dealer(&params(), &mut rng).unwrap();
    let group_id = public.group_public_key().group_id().unwrap();
    let kind = SigningKind::RelayEntry {
        previous_entry: b"genesis".to_vec(),
    };

    let mut sessions = key_packages
        .iter()
        .map(|(member, key_package)| {
            (
                *member,
                SigningSession::new(
                    group_id,
                    kind.clone(),
                    Some(key_package.clone()),
                    public.clone(),
                ),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let partials = sessions
        .values_mut()
        .filter_map(|session| session.start().unwrap())
        .collect::<Vec<_>>();
    for (member, session) in sessions.iter_mut() {
        for partial in &partials {
            if partial.index() != member {
                session.receive(*partial.index(), *partial).unwrap();
            }
        }
    }

    let mut signatures = Vec::new();
    for session in sessions.values_mut() {
        assert!(session.is_ready());
        let signature = session.try_aggregate().unwrap().unwrap();
        assert!(matches!(session.state(), SigningState::Completed(_)));
        public
            .group_public_key()
            .verify(b"genesis", &signature)
            .unwrap();
        signatures.push(signature);
    }
    assert!(signatures.iter().all(|signature| *signature == signatures[0]));
}

/// Every subset of `honest_threshold` partial signatures aggregates to the
/// same signature.
pub fn check_aggregation_order_independence<R: RngCore + CryptoRng>(mut rng: R) {
    let (key_packages, public) = generate_with_dealer(&params(), &mut rng).unwrap();
    let message = b"relay entry";
    let partials = key_packages
        .values()
        .map(|key_package| sign(key_package, message).unwrap())
        .collect::<Vec<_>>();

    let mut signatures = Vec::new();
    for subset in partials.iter().combinations(3) {
        let subset = subset
            .into_iter()
            .map(|partial| (*partial.index(), *partial))
            .collect::<BTreeMap<MemberIndex, PartialSignature>>();
        signatures.push(aggregate(&subset, &public).unwrap());
    }
    assert_eq!(signatures.len(), 10);
    assert!(signatures.iter().all(|signature| *signature == signatures[0]));

    // Supersets aggregate the same way.
    let all = partials
        .iter()
        .map(|partial| (*partial.index(), *partial))
        .collect::<BTreeMap<_, _>>();
    assert_eq!(aggregate(&all, &public).unwrap(), signatures[0]);

    let too_few = all.into_iter().take(2).collect::<BTreeMap<_, _>>();
    assert_eq!(
        aggregate(&too_few, &public),
        Err(Error::NotEnoughShares { have: 2, need: 3 })
    );
}

/// A partial signature made with the wrong share is recorded against its
/// sender and does not count.
pub fn check_invalid_partial_recorded<R: RngCore + CryptoRng>(mut rng: R) {
    let (key_packages, public) = generate_with_dealer(&params(), &mut rng).unwrap();
    let (other_packages, _) = generate_with_dealer(&params(), &mut rng).unwrap();
    let group_id = public.group_public_key().group_id().unwrap();
    let kind = SigningKind::RelayEntry {
        previous_entry: vec![7; 48],
    };
    let mut session = SigningSession::new(
        group_id,
        kind.clone(),
        key_packages.get(&index(1)).cloned(),
        public.clone(),
    );
    session.start().unwrap();

    let message = kind.message(&group_id);
    let forged = sign(&other_packages[&index(2)], &message).unwrap();
    assert_eq!(
        session.receive(index(2), forged),
        Err(Error::InvalidPartialSignature { signer: index(2) })
    );
    assert_eq!(session.invalid(), &indices(&[2]));
    assert!(!session.is_ready());

    let honest = sign(&key_packages[&index(3)], &message).unwrap();
    session.receive(index(3), honest).unwrap();
    assert_eq!(session.try_aggregate().unwrap(), None);

    let honest = sign(&key_packages[&index(4)], &message).unwrap();
    assert_eq!(
        session.receive(index(5), honest),
        Err(Error::UnexpectedMessage { sender: index(5) })
    );
    session.receive(index(4), honest).unwrap();
    assert!(session.try_aggregate().unwrap().is_some());
}

/// A timeout reports the members that did not contribute, and has no
/// effect once the session completed.
pub fn check_timeout_lists_missing<R: RngCore + CryptoRng>(mut rng: R) {
    let (key_packages, public) = generate_with_dealer(&params(), &mut rng).unwrap();
    let group_id = public.group_public_key().group_id().unwrap();
    let kind = SigningKind::RelayEntry {
        previous_entry: vec![1, 2, 3],
    };
    let mut session = SigningSession::new(
        group_id,
        kind.clone(),
        key_packages.get(&index(1)).cloned(),
        public.clone(),
    );
    session.start().unwrap();
    let partial = sign(&key_packages[&index(2)], &kind.message(&group_id)).unwrap();
    session.receive(index(2), partial).unwrap();

    assert_eq!(
        session.on_timeout(TimeoutKind::Soft),
        Some(SigningFailure::Timeout {
            kind: TimeoutKind::Soft,
            missing: indices(&[3, 4, 5]),
        })
    );
    assert_eq!(
        session.receive(index(3), partial),
        Err(Error::LateMessage { sender: index(3) })
    );
    assert_eq!(session.on_timeout(TimeoutKind::Hard), None);

    // A member without a key share only aggregates.
    let mut observer = SigningSession::new(group_id, kind, None, public);
    assert_eq!(observer.start().unwrap(), None);
}

/// A group-signed inactivity claim verifies under the group key and binds
/// its accused set.
pub fn check_inactivity_claim<R: RngCore + CryptoRng>(mut rng: R) {
    let (key_packages, public) = generate_with_dealer(&params(), &mut rng).unwrap();
    let group_id = public.group_public_key().group_id().unwrap();
    let accused = indices(&[4, 5]);
    let kind = SigningKind::InactivityClaim {
        nonce: 3,
        accused: accused.clone(),
    };
    let message = kind.message(&group_id);

    let partials = [1, 2, 3]
        .iter()
        .map(|member| {
            let partial = sign(&key_packages[&index(*member)], &message).unwrap();
            (index(*member), partial)
        })
        .collect::<BTreeMap<_, _>>();
    let signature = aggregate(&partials, &public).unwrap();

    let claim = InactivityClaim::new(group_id, 3, accused, signature);
    claim.verify(public.group_public_key()).unwrap();

    let tampered = InactivityClaim::new(group_id, 3, indices(&[5]), signature);
    assert_eq!(
        tampered.verify(public.group_public_key()),
        Err(Error::InvalidSignature)
    );
}
