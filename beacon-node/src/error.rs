//! Node error types

use beacon_core::{keys::dkg::DkgFailure, result::ChallengeProof, SelectionError};
use thiserror::Error;

/// A failure reported by a [`ChainView`](crate::chain::ChainView) call.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The chain could not be reached. Worth retrying.
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    /// The same kind of transaction was already mined for this state.
    #[error("transaction already submitted")]
    AlreadySubmitted,
    /// The chain refused the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// An error surfaced by the node runtime.
///
/// Round timeouts never show up here: sessions handle them as state
/// transitions.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Group selection failed; no session is started for this seed.
    #[error("group selection failed: {0}")]
    Selection(#[from] SelectionError),
    /// The chain does not expose the requested seed for group creation.
    #[error("seed is not available for group creation")]
    SeedUnavailable,
    /// A chain call kept failing after every retry.
    #[error("chain unavailable after {attempts} attempts of {operation}: {reason}")]
    ChainUnavailable {
        /// The failing call.
        operation: &'static str,
        /// How often it was tried.
        attempts: u32,
        /// The last failure.
        reason: String,
    },
    /// Another member got its transaction mined first.
    #[error("another submission was mined first")]
    SubmissionConflict,
    /// The chain refused a transaction for a reason other than a conflict.
    #[error("chain rejected transaction: {0}")]
    ChainRejected(String),
    /// A challenge against the group's result verified. The group is
    /// terminated and its members risk slashing.
    #[error("challenge verified against the published result: {0:?}")]
    ChallengeVerified(Option<ChallengeProof>),
    /// Every DKG attempt failed to keep enough members qualified.
    #[error("DKG failed: {0:?}")]
    DkgFailed(DkgFailure),
    /// No result was submitted before the DKG timed out.
    #[error("DKG timed out without a submitted result")]
    DkgTimedOut,
    /// The session was cancelled.
    #[error("session cancelled")]
    Cancelled,
    /// The protocol core rejected an operation.
    #[error("protocol error: {0}")]
    Protocol(#[from] beacon_core::Error),
    /// The transport failed or a payload could not be decoded.
    #[error("transport error: {0}")]
    Transport(String),
    /// Configuration could not be loaded or logging not installed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<postcard::Error> for NodeError {
    fn from(error: postcard::Error) -> Self {
        NodeError::Transport(error.to_string())
    }
}
