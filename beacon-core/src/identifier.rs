//! Member, operator, group and session identifiers

use core::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// The 1-based position of a member in its group's ordered member list.
///
/// The index doubles as the x-coordinate at which every dealer's secret
/// polynomial is evaluated, so it MUST NOT be zero: f(0) is the secret.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct MemberIndex(u16);

impl MemberIndex {
    /// Create a new index, rejecting zero.
    pub fn new(index: u16) -> Result<Self, Error> {
        if index == 0 {
            Err(Error::InvalidMemberIndex(index))
        } else {
            Ok(Self(index))
        }
    }

    /// Create the index of the member at `position` (0-based) in a member list.
    pub fn from_position(position: usize) -> Result<Self, Error> {
        let index = u16::try_from(position + 1).map_err(|_| Error::InvalidMemberIndex(0))?;
        Self::new(index)
    }

    /// The 0-based position of this member in the member list.
    pub fn position(&self) -> usize {
        usize::from(self.0 - 1)
    }

    /// The raw index value.
    pub fn get(&self) -> u16 {
        self.0
    }

    /// Iterate over all indices of a group of `group_size` members.
    pub fn all(group_size: u16) -> impl Iterator<Item = MemberIndex> {
        (1..=group_size).map(MemberIndex)
    }
}

impl TryFrom<u16> for MemberIndex {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MemberIndex> for u16 {
    fn from(index: MemberIndex) -> Self {
        index.0
    }
}

impl Debug for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemberIndex").field(&self.0).finish()
    }
}

impl Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hash_identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) [u8; $len]);

        impl $name {
            /// Wrap raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&hex::encode(self.0))
                    .finish()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serdect::array::serialize_hex_lower_or_bin(&self.0, serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let mut bytes = [0u8; $len];
                serdect::array::deserialize_hex_or_bin(&mut bytes[..], deserializer)?;
                Ok(Self(bytes))
            }
        }
    };
}

hash_identifier!(
    /// An on-chain operator identity: the first 20 bytes of SHA-256 over the
    /// operator's compressed secp256k1 public key.
    OperatorId,
    20
);

hash_identifier!(
    /// The identifier of a group, derived from its group public key.
    GroupId,
    32
);

hash_identifier!(
    /// A seed for group selection, taken from the chain.
    Seed,
    32
);

hash_identifier!(
    /// The scope of one protocol session on the transport.
    SessionId,
    32
);

hash_identifier!(
    /// The digest members sign to support a DKG result.
    ResultHash,
    32
);

impl Seed {
    /// The seed that a relay entry hands to the next group selection.
    pub fn from_entry(entry: &[u8]) -> Self {
        Self(Sha256::digest(entry).into())
    }

    /// The seed of a DKG retry attempt, so that a retry reshuffles submitter
    /// precedence and never reuses a transcript.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        if attempt == 0 {
            return *self;
        }
        let mut hasher = Sha256::new();
        hasher.update(b"beacon-dkg-attempt");
        hasher.update(self.0);
        hasher.update(attempt.to_be_bytes());
        Self(hasher.finalize().into())
    }
}

impl SessionId {
    /// The session of DKG attempt `attempt` for `seed`.
    pub fn dkg(seed: &Seed, attempt: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"beacon-session-dkg");
        hasher.update(seed.0);
        hasher.update(attempt.to_be_bytes());
        Self(hasher.finalize().into())
    }

    /// The session of a signing request of `group` over `message`.
    pub fn signing(group: &GroupId, message: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"beacon-session-signing");
        hasher.update(group.0);
        hasher.update(message);
        Self(hasher.finalize().into())
    }
}
