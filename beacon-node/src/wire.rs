//! Session message encoding.

use std::collections::BTreeSet;

use beacon_core::{keys::dkg::Message, result::SignedResult, MemberIndex, PartialSignature};
use serde::{Deserialize, Serialize};

use crate::NodeError;

/// Everything members exchange over a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// A DKG round message.
    Dkg(Message),
    /// A signed DKG result candidate.
    Result(SignedResult),
    /// A partial signature of a signing session.
    Partial(PartialSignature),
    /// The sender takes part in a retried DKG attempt.
    Announcement,
    /// The members the sender would accuse after a relay entry soft timeout.
    ClaimProposal(BTreeSet<MemberIndex>),
}

impl SessionMessage {
    /// Serialize the message into bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, NodeError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize a message from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, NodeError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
