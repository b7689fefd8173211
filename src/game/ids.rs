//! Strongly-typed identifiers
//!
//! Maps, templates, characters and accounts are all keyed by integers, but
//! the id types are never interchangeable.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Wrap a raw value
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Raw value
            pub const fn raw(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identifies a map
    MapId,
    u16
);

define_id!(
    /// Identifies a character template
    CharacterTemplateId,
    u16
);

define_id!(
    /// Identifies a character (user-controlled or NPC)
    CharacterId,
    u32
);

define_id!(
    /// Identifies an account
    AccountId,
    u32
);

/// First id handed out to NPCs. Persisted user characters live below it.
pub const NPC_ID_START: u32 = 0x4000_0000;

/// Allocates character ids for NPCs; shared by every map of a world
#[derive(Debug)]
pub struct CharacterIdAllocator {
    next: AtomicU32,
}

impl CharacterIdAllocator {
    /// Create an allocator starting at [`NPC_ID_START`]
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(NPC_ID_START),
        }
    }

    /// Next unused NPC id
    pub fn allocate(&self) -> CharacterId {
        CharacterId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CharacterIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_equality_by_value() {
        assert_eq!(MapId::new(4), MapId::from(4));
        assert_ne!(CharacterId::new(1), CharacterId::new(2));

        let set: HashSet<AccountId> = [AccountId::new(1), AccountId::new(1)].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_id_serde_transparent() {
        let json = serde_json::to_string(&CharacterId::new(42)).unwrap();
        assert_eq!(json, "42");
        let id: MapId = serde_json::from_str("7").unwrap();
        assert_eq!(id, MapId::new(7));
    }

    #[test]
    fn test_allocator_unique() {
        let alloc = CharacterIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert!(a.raw() >= NPC_ID_START);
    }
}
