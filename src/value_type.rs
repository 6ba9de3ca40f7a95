// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl ValueType {
    /// Returns `true` if the type is a tombstone.
    #[must_use]
    pub fn is_tombstone(self) -> bool {
        self == Self::Tombstone
    }
}
