//! DKG test functions.

use std::collections::{BTreeMap, BTreeSet};

use rand_core::{CryptoRng, RngCore};

use crate::{
    keys::dkg::{Dkg, DkgFailure, DkgState, Message, Outgoing, Terminal, Transition},
    signing::{aggregate, sign},
    Error, GroupParameters, KeyPackage, MemberIndex,
};

use super::helpers::{
    index, indices, run_dkg, DkgRun, FalseAccusation, Honest, InvalidShare, Silent,
    WithheldShare,
};

fn params() -> GroupParameters {
    GroupParameters::with_default_quorum(5, 3).expect("5 of 3 is valid")
}

/// Sign with the key packages of the given members and check the group
/// signature against the group key every member derived.
fn check_group_can_sign(key_packages: &[KeyPackage], run: &DkgRun) {
    let outcome = run.as_ref().expect("member completed the DKG");
    let message = b"beacon entry";
    let partials = key_packages
        .iter()
        .map(|key_package| {
            let partial = sign(key_package, message).unwrap();
            (*partial.index(), partial)
        })
        .collect::<BTreeMap<_, _>>();
    let signature = aggregate(&partials, outcome.public_key_package()).unwrap();
    outcome
        .group_public_key()
        .verify(message, &signature)
        .unwrap();
}

/// Every member completes with the same key and nobody misbehaved.
pub fn check_dkg_all_honest<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let runs = run_dkg(&params, &BTreeSet::new(), &mut Honest, &mut rng).unwrap();
    assert_eq!(runs.len(), 5);

    let keys = runs
        .values()
        .map(|run| *run.as_ref().unwrap().group_public_key())
        .collect::<Vec<_>>();
    assert!(keys.iter().all(|key| *key == keys[0]));
    for run in runs.values() {
        let outcome = run.as_ref().unwrap();
        assert!(outcome.misbehaved().is_empty());
        assert!(outcome.key_package().is_some());
        assert_eq!(outcome.public_key_package().public_key_shares().len(), 5);
    }

    let signers = runs
        .values()
        .skip(2)
        .filter_map(|run| run.as_ref().unwrap().key_package().clone())
        .collect::<Vec<_>>();
    check_group_can_sign(&signers, &runs[&index(1)]);
}

/// A dealer sending an invalid share and not justifying it ends up in every
/// honest member's misbehaved set; the remaining members can still sign.
pub fn check_dkg_invalid_share<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let mut faults = InvalidShare {
        dealer: index(2),
        victim: index(4),
    };
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();

    let honest = indices(&[1, 3, 4, 5]);
    let expected = *runs[&index(1)].as_ref().unwrap().group_public_key();
    for member in &honest {
        let outcome = runs[member].as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &indices(&[2]));
        assert!(outcome.public_key_package().public_key_share(index(2)).is_none());
        assert_eq!(*outcome.group_public_key(), expected);
    }

    // The faulty dealer believes its own reveal and blames the victim.
    let faulty = runs[&index(2)].as_ref().unwrap();
    assert_eq!(faulty.misbehaved(), &indices(&[4]));
    assert_ne!(*faulty.group_public_key(), expected);

    let signers = [3, 4, 5]
        .iter()
        .filter_map(|member| runs[&index(*member)].as_ref().unwrap().key_package().clone())
        .collect::<Vec<_>>();
    check_group_can_sign(&signers, &runs[&index(1)]);
}

/// A dealer withholding its share from some members is accused by them, so
/// every member settles the dispute on broadcast data and derives the same
/// key.
pub fn check_dkg_withheld_share<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();

    // Unanswered accusations disqualify the dealer everywhere.
    let mut faults = WithheldShare {
        dealer: index(5),
        victims: indices(&[1, 2]),
        justifies: false,
    };
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();
    let expected = *runs[&index(3)].as_ref().unwrap().group_public_key();
    for member in indices(&[1, 2, 3, 4]) {
        let outcome = runs[&member].as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &indices(&[5]));
        assert_eq!(*outcome.group_public_key(), expected);
        assert!(outcome.key_package().is_some());
    }
    let signers = [1, 2, 4]
        .iter()
        .filter_map(|member| runs[&index(*member)].as_ref().unwrap().key_package().clone())
        .collect::<Vec<_>>();
    check_group_can_sign(&signers, &runs[&index(3)]);

    // A public reveal that verifies settles the accusations against the
    // accusers, the same way for every member.
    let mut faults = WithheldShare {
        dealer: index(5),
        victims: indices(&[1, 2]),
        justifies: true,
    };
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();
    let expected = *runs[&index(3)].as_ref().unwrap().group_public_key();
    for run in runs.values() {
        let outcome = run.as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &indices(&[1, 2]));
        assert_eq!(*outcome.group_public_key(), expected);
    }
    let signers = [3, 4, 5]
        .iter()
        .filter_map(|member| runs[&index(*member)].as_ref().unwrap().key_package().clone())
        .collect::<Vec<_>>();
    assert_eq!(signers.len(), 3);
    check_group_can_sign(&signers, &runs[&index(3)]);
}

/// An accusation answered with a valid reveal disqualifies the accuser.
pub fn check_dkg_false_accusation<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let mut faults = FalseAccusation {
        accuser: index(4),
        accused: index(2),
    };
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();

    for member in indices(&[1, 2, 3, 5]) {
        let outcome = runs[&member].as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &indices(&[4]));
    }
}

/// Members that stay silent in round 1 are marked inactive and excluded.
pub fn check_dkg_silent_members<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let mut faults = Silent(indices(&[5]));
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();

    assert_eq!(runs.len(), 4);
    for run in runs.values() {
        let outcome = run.as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &indices(&[5]));
        assert!(outcome.key_package().is_some());
    }
}

/// If fewer than `honest_threshold` members respond, the session fails and
/// no key material is emitted.
pub fn check_dkg_fails_without_quorum<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let mut faults = Silent(indices(&[3, 4, 5]));
    let runs = run_dkg(&params, &BTreeSet::new(), &mut faults, &mut rng).unwrap();

    assert_eq!(runs.len(), 2);
    for run in runs.values() {
        assert_eq!(
            run,
            &Err(DkgFailure::QuorumNotReached {
                round: 1,
                qualified: 2,
                required: 3,
            })
        );
    }

    let mut dkg = Dkg::new(index(1), params, BTreeSet::new()).unwrap();
    dkg.start(&mut rng).unwrap();
    assert!(matches!(dkg.advance().unwrap(), Transition::Failed(_)));
    assert_eq!(dkg.state(), DkgState::Terminal(Terminal::Failed));
    assert_eq!(dkg.advance(), Err(Error::InvalidState("Terminal(Failed)")));
}

/// Messages for a future round are buffered, messages for a closed round are
/// rejected, duplicates are ignored.
pub fn check_dkg_message_ordering<R: RngCore + CryptoRng>(mut rng: R) {
    let params = GroupParameters::with_default_quorum(2, 2).unwrap();
    let mut first = Dkg::new(index(1), params, BTreeSet::new()).unwrap();
    let mut second = Dkg::new(index(2), params, BTreeSet::new()).unwrap();
    let from_first = first.start(&mut rng).unwrap();
    let from_second = second.start(&mut rng).unwrap();

    // Round 2 traffic before round 1 closed.
    first
        .receive(index(2), Message::Accusations(BTreeSet::new()))
        .unwrap();
    assert!(!first.is_round_complete());

    let deliver = |dkg: &mut Dkg, sender: MemberIndex, outgoing: &[Outgoing]| {
        for out in outgoing {
            let message = match out {
                Outgoing::Broadcast(message) | Outgoing::Direct(_, message) => message.clone(),
            };
            dkg.receive(sender, message.clone()).unwrap();
            // At-least-once delivery.
            dkg.receive(sender, message).unwrap();
        }
    };
    deliver(&mut first, index(2), &from_second);
    deliver(&mut second, index(1), &from_first);
    assert!(first.is_round_complete());

    let Transition::Continue(_) = first.advance().unwrap() else {
        panic!("round 1 should close");
    };
    assert_eq!(first.state(), DkgState::Round2Verification);
    // The buffered accusations already complete round 2.
    assert!(first.is_round_complete());

    let late = from_second
        .iter()
        .find_map(|out| match out {
            Outgoing::Broadcast(message) => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        first.receive(index(2), late),
        Err(Error::LateMessage { sender: index(2) })
    );
    assert_eq!(
        first.receive(index(1), Message::Accusations(BTreeSet::new())),
        Err(Error::UnexpectedMessage { sender: index(1) })
    );
}

/// Members excluded up front are misbehaved from the start and their
/// messages are never awaited.
pub fn check_dkg_with_excluded_members<R: RngCore + CryptoRng>(mut rng: R) {
    let params = params();
    let excluded = indices(&[3]);
    let runs = run_dkg(&params, &excluded, &mut Honest, &mut rng).unwrap();

    assert_eq!(runs.len(), 4);
    for run in runs.values() {
        let outcome = run.as_ref().unwrap();
        assert_eq!(outcome.misbehaved(), &excluded);
    }

    assert_eq!(
        Dkg::new(index(3), params, excluded).unwrap_err(),
        Error::InvalidMemberIndex(3)
    );
}
