//! Beacon protocol error types

use thiserror::Error;

use crate::MemberIndex;

/// An error raised by the sans-IO protocol core.
///
/// Round timeouts are not errors: they are state transitions of the session
/// state machines and never surface through this type.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// group_size is invalid
    #[error("group size must be at least 1")]
    InvalidGroupSize,
    /// honest_threshold is invalid
    #[error("honest threshold must be at least 1 and not larger than the group size")]
    InvalidHonestThreshold,
    /// group_quorum is invalid
    #[error("group quorum must exceed the dishonest threshold and not exceed the group size")]
    InvalidGroupQuorum,
    /// A member index of zero, or one outside the group.
    #[error("Member index {0} is out of range.")]
    InvalidMemberIndex(u16),
    /// The encoding of a group element was malformed.
    #[error("Malformed group element encoding.")]
    MalformedElement,
    /// The encoding of a scalar was malformed.
    #[error("Malformed scalar encoding.")]
    MalformedScalar,
    /// The encoding of an operator key was malformed.
    #[error("Malformed operator key encoding.")]
    MalformedOperatorKey,
    /// The encoding of an operator signature was malformed.
    #[error("Malformed operator signature encoding.")]
    MalformedOperatorSignature,
    /// This element MUST NOT be the identity.
    #[error("Invalid for this element to be the identity.")]
    InvalidIdentityElement,
    /// A message could not be mapped to the curve.
    #[error("Message could not be hashed to the curve.")]
    HashToCurve,
    /// Threshold signature verification failed.
    #[error("Invalid signature.")]
    InvalidSignature,
    /// A DKG share did not verify against its dealer's commitments.
    #[error("Invalid share from member {sender}.")]
    InvalidShare {
        /// The dealer of the share.
        sender: MemberIndex,
    },
    /// A partial signature did not verify against the signer's public key share.
    #[error("Invalid partial signature from member {signer}.")]
    InvalidPartialSignature {
        /// The member that produced the partial signature.
        signer: MemberIndex,
    },
    /// A DKG result signature did not verify or was produced by a foreign key.
    #[error("Invalid result signature from member {signer}.")]
    InvalidResultSignature {
        /// The claimed signer.
        signer: MemberIndex,
    },
    /// A member signed two different results in the same session.
    #[error("Member {signer} supports conflicting results.")]
    ConflictingSupport {
        /// The equivocating member.
        signer: MemberIndex,
    },
    /// Commitment vector has the wrong number of coefficients.
    #[error("Commitments must have honest_threshold elements.")]
    IncorrectNumberOfCommitments,
    /// Not enough shares were provided to aggregate.
    #[error("Not enough partial signatures: have {have}, need {need}.")]
    NotEnoughShares {
        /// Valid partial signatures available.
        have: usize,
        /// Partial signatures required.
        need: usize,
    },
    /// Duplicated shares provided
    #[error("Duplicated shares provided.")]
    DuplicatedShares,
    /// A message arrived for a round that has already been closed.
    #[error("Message from member {sender} arrived after its round closed.")]
    LateMessage {
        /// The sender of the late message.
        sender: MemberIndex,
    },
    /// A message arrived that the current state does not accept.
    #[error("Unexpected message from member {sender}.")]
    UnexpectedMessage {
        /// The sender of the message.
        sender: MemberIndex,
    },
    /// The state machine was driven out of order.
    #[error("Operation is not valid in state {0}.")]
    InvalidState(&'static str),
    /// A group state transition that is not allowed.
    #[error("Group cannot transition from {from} to {to}.")]
    InvalidTransition {
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },
    /// The group public key was already set.
    #[error("Group public key is already set.")]
    GroupKeyAlreadySet,
    /// No candidate result collected enough support.
    #[error("No result reached the group quorum.")]
    NoCanonicalResult,
    /// The local member holds no key share for this group.
    #[error("Member holds no key share.")]
    MissingKeyShare,
    /// Error in scalar Field.
    #[error("Error serializing value.")]
    SerializationError,
    /// Error deserializing value.
    #[error("Error deserializing value.")]
    DeserializationError,
}

/// A failure of deterministic group selection.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SelectionError {
    /// The pool has fewer eligible operators than seats to fill.
    #[error("Pool has {available} eligible operators, {required} required.")]
    InsufficientPoolSize {
        /// Operators with non-zero weight.
        available: usize,
        /// The requested group size.
        required: usize,
    },
    /// A group of no members was requested.
    #[error("Group size must be at least 1.")]
    ZeroGroupSize,
    /// The same operator appears twice in the pool snapshot.
    #[error("Operator appears more than once in the pool.")]
    DuplicateOperator,
}
