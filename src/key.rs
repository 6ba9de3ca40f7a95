// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{SeqNo, UserKey, ValueType};
use std::cmp::Reverse;

/// Key of a single item version inside the tree.
///
/// Consists of the user key plus the sequence number that stamps the version
/// and the value type. Two versions of the same user key are distinct
/// internal keys.
#[derive(Clone, Eq)]
pub struct InternalKey {
    /// User key
    pub user_key: UserKey,

    /// Sequence number of this version
    pub seqno: SeqNo,

    /// Value or tombstone
    pub value_type: ValueType,
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.user_key == other.user_key && self.seqno == other.seqno
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key,
            self.seqno,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
            },
        )
    }
}

impl InternalKey {
    /// Creates a new internal key.
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            seqno,
            value_type,
        }
    }

    /// Returns `true` if the key denotes a deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type.is_tombstone()
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by sequence number
// This is one of the most important functions
// Otherwise queries will not match expected behaviour
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno)).cmp(&(&other.user_key, Reverse(other.seqno)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn internal_key_order() {
        let a = InternalKey::new("a", 5, ValueType::Value);
        let a_old = InternalKey::new("a", 1, ValueType::Value);
        let b = InternalKey::new("b", 0, ValueType::Tombstone);

        // Newer version of the same user key sorts first
        assert!(a < a_old);
        assert!(a_old < b);
    }
}
