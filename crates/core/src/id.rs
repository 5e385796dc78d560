//! Unique identifiers for registry and history records.
//!
//! Rules, events, decisions and feedback are numbered by the store, so a
//! lower id always means an earlier insert. Lineages get a ULID when their
//! root rule is created.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! store_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw numeric value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

store_id!(
    /// Unique identifier for a Rule
    RuleId
);
store_id!(
    /// Unique identifier for an Event
    EventId
);
store_id!(
    /// Unique identifier for a Decision
    DecisionId
);
store_id!(
    /// Unique identifier for a Feedback item
    FeedbackId
);

/// Identifier shared by a root rule and every rule cloned from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageId(Ulid);

impl LineageId {
    /// Generate a new LineageId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LineageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LineageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LineageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}
