//! Session counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        /// Monotonic counters shared by every session of a node.
        #[derive(Debug, Default)]
        pub struct Metrics {
            $($(#[$meta])* $name: AtomicU64,)*
        }

        /// A point-in-time copy of [`Metrics`].
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct MetricsSnapshot {
            $($(#[$meta])* pub $name: u64,)*
        }

        impl Metrics {
            $(
                $(#[$meta])*
                pub fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Read every counter.
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    /// Rounds that closed with every expected message.
    rounds_completed,
    /// Rounds that closed because their deadline elapsed.
    rounds_timed_out,
    /// Rounds after which the session failed.
    rounds_failed,
    /// DKG sessions whose group was approved.
    dkg_completed,
    /// DKG sessions that ended without an approved group.
    dkg_failed,
    /// DKG results this node submitted.
    results_submitted,
    /// Challenges this node filed.
    challenges_filed,
    /// Threshold signatures aggregated.
    signatures_completed,
    /// Signing sessions that hit a timeout.
    signing_timeouts,
    /// Shares, partial signatures and result signatures that failed
    /// verification.
    verification_failures,
);
