#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
#![doc = document_features::document_features!()]

pub mod clock;
mod error;
pub mod group;
mod identifier;
pub mod inactivity;
pub mod keys;
pub mod operator;
mod params;
pub mod result;
pub mod selection;
pub(crate) mod serialization;
pub mod signing;

#[cfg(any(test, feature = "test-impl"))]
pub mod tests;

pub use clock::{Deadline, DeadlineKind, SessionClock};
pub use error::{Error, SelectionError};
pub use group::{Group, GroupState};
pub use identifier::{GroupId, MemberIndex, OperatorId, ResultHash, SessionId, Seed};
pub use keys::{GroupPublicKey, KeyPackage, PublicKeyPackage};
pub use params::{ChainParameters, GroupParameters, ProtocolTimings};
pub use signing::{PartialSignature, Signature, SigningSession};
