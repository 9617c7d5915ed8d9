//! In-process implementations of the chain and the transport.
//!
//! [`LocalChain`] keeps the on-chain half of the protocol in memory: group
//! creation state, result submission with its challenge period, relay entry
//! requests and inactivity claims. [`LocalTransport`] routes session
//! messages between nodes of the same process. Both carry fault hooks for
//! driving nodes through misbehavior, and both back the end-to-end tests.

mod chain;
mod transport;

pub use chain::{ChallengeRecord, LocalChain, RelayEntryRecord, SubmissionRecord};
pub use transport::{LocalTransport, TransportFault};
