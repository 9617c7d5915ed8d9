#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod cancel;
pub mod chain;
pub mod config;
mod error;
pub mod local;
pub mod logging;
pub mod metrics;
mod node;
pub mod retry;
mod session;
pub mod submitter;
pub mod subscription;
pub mod supervisor;
pub mod transport;
pub mod wire;

pub use chain::{ChainEvent, ChainEventKind, ChainView, GroupCreationState, TxHash};
pub use config::NodeConfig;
pub use error::{ChainError, NodeError};
pub use metrics::MetricsSnapshot;
pub use node::{Node, NodeHandle};
pub use session::{GroupStatus, PublicationPhase, SessionStatus};
pub use transport::{Envelope, RoundTransport, Subscription};
