//! # Typed Identifiers
//!
//! Zero-cost wrappers that keep stream sequence numbers, lease terms,
//! opportunity ids and instance ids from being mixed up in function
//! signatures.
//!
//! ```rust
//! use types::{SequenceId, Term};
//!
//! let seq = SequenceId::new(41).next();
//! assert_eq!(seq.inner(), 42);
//! assert_eq!(seq.to_string(), "42");
//! assert!(Term::new(3) > Term::new(2));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! define_typed_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[inline(always)]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            #[inline(always)]
            pub const fn inner(&self) -> u64 {
                self.0
            }

            #[inline(always)]
            pub fn next(&self) -> Self {
                Self(self.0.saturating_add(1))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_typed_id!(
    /// Position of a message within one stream, strictly increasing per stream
    SequenceId
);

define_typed_id!(
    /// Leader lease generation, incremented whenever a new holder acquires the lease
    Term
);

define_string_id!(
    /// Producer-assigned, globally unique opportunity id
    OpportunityId
);

define_string_id!(
    /// Identity of one running service instance (consumer name, lease holder, `routedBy`)
    InstanceId
);

impl InstanceId {
    /// Random instance id with a readable role prefix, e.g. `coordinator-3f2a9c1e`
    pub fn generate(role: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", role, &suffix[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_order_and_parse() {
        let a = SequenceId::new(7);
        assert!(a < a.next());
        assert_eq!("7".parse::<SequenceId>().unwrap(), a);
        assert!("x".parse::<SequenceId>().is_err());
    }

    #[test]
    fn generated_instance_ids_are_prefixed_and_unique() {
        let a = InstanceId::generate("coordinator");
        let b = InstanceId::generate("coordinator");
        assert!(a.as_str().starts_with("coordinator-"));
        assert_ne!(a, b);
    }
}
