//! Test modules

pub mod arbiter;
pub mod dkg;
pub mod helpers;
pub mod selection;
pub mod signing;

#[cfg(test)]
mod run {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    #[test]
    fn dkg_all_honest() {
        super::dkg::check_dkg_all_honest(rng(1));
    }

    #[test]
    fn dkg_invalid_share_disqualifies_dealer() {
        super::dkg::check_dkg_invalid_share(rng(2));
    }

    #[test]
    fn dkg_withheld_share_is_settled_in_public() {
        super::dkg::check_dkg_withheld_share(rng(8));
    }

    #[test]
    fn dkg_false_accusation_disqualifies_accuser() {
        super::dkg::check_dkg_false_accusation(rng(3));
    }

    #[test]
    fn dkg_silent_members_are_excluded() {
        super::dkg::check_dkg_silent_members(rng(4));
    }

    #[test]
    fn dkg_fails_without_quorum() {
        super::dkg::check_dkg_fails_without_quorum(rng(5));
    }

    #[test]
    fn dkg_buffers_early_and_rejects_late_messages() {
        super::dkg::check_dkg_message_ordering(rng(6));
    }

    #[test]
    fn dkg_excluded_members_never_take_part() {
        super::dkg::check_dkg_with_excluded_members(rng(7));
    }

    #[test]
    fn sign_with_dealer() {
        super::signing::check_sign_with_dealer(rng(10));
    }

    #[test]
    fn aggregation_is_order_independent() {
        super::signing::check_aggregation_order_independence(rng(11));
    }

    #[test]
    fn invalid_partial_is_recorded() {
        super::signing::check_invalid_partial_recorded(rng(12));
    }

    #[test]
    fn timeout_lists_missing_signers() {
        super::signing::check_timeout_lists_missing(rng(13));
    }

    #[test]
    fn inactivity_claim_verifies() {
        super::signing::check_inactivity_claim(rng(14));
    }

    #[test]
    fn arbiter_is_idempotent() {
        super::arbiter::check_arbiter_idempotence(rng(20));
    }

    #[test]
    fn arbiter_rejects_equivocation() {
        super::arbiter::check_arbiter_equivocation(rng(21));
    }

    #[test]
    fn arbiter_needs_quorum() {
        super::arbiter::check_finalize_needs_quorum(rng(22));
    }

    #[test]
    fn arbiter_rejects_foreign_signers() {
        super::arbiter::check_foreign_signatures(rng(23));
    }

    #[test]
    fn validation_detects_inconsistencies() {
        super::arbiter::check_validation_grounds(rng(24));
    }

    #[test]
    fn precedence_advances_one_window_per_slot() {
        super::arbiter::check_precedence_liveness();
    }

    #[test]
    fn challenge_period_orders_approvals() {
        super::arbiter::check_challenge_period();
    }

    #[test]
    fn selection_is_deterministic() {
        super::selection::check_selection_determinism(rng(30));
    }

    #[test]
    fn selection_rejects_bad_pools() {
        super::selection::check_selection_errors();
    }

    #[test]
    fn selection_skips_zero_weight() {
        super::selection::check_zero_weight_never_selected(rng(31));
    }
}
