//! String-backed identifiers shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Content hash of a job specification.
    JobId
);
string_id!(
    /// Ledger account of an owner, provider or arbitrator.
    Address
);
string_id!(
    /// Ledger transaction identifier.
    TxId
);
string_id!(
    /// Unique identifier of a ledger event (`<tx>:<index>`).
    EventId
);
string_id!(
    /// Content-addressed reference: hex SHA-256 of the bytes it names.
    ContentRef
);

impl ContentRef {
    /// Derive the reference for a blob.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Whether `bytes` hash to this reference.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        *self == Self::of(bytes)
    }
}

impl JobId {
    /// Short prefix for terminal output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(10);
        &self.0[..end]
    }
}

impl EventId {
    pub fn new(tx: &TxId, index: usize) -> Self {
        Self(format!("{tx}:{index}"))
    }
}
