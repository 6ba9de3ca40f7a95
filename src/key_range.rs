// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::UserKey;

/// An inclusive range of user keys `[min, max]`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyRange((UserKey, UserKey));

impl std::ops::Deref for KeyRange {
    type Target = (UserKey, UserKey);

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl KeyRange {
    /// Creates a new key range.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `min > max`.
    #[must_use]
    pub fn new(range: (UserKey, UserKey)) -> Self {
        debug_assert!(range.0 <= range.1, "invalid key range");
        Self(range)
    }

    /// Returns the lower bound.
    #[must_use]
    pub fn min(&self) -> &UserKey {
        &self.0 .0
    }

    /// Returns the upper bound.
    #[must_use]
    pub fn max(&self) -> &UserKey {
        &self.0 .1
    }

    /// Returns `true` if the key is contained in the range.
    pub(crate) fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let key = key.as_ref();
        let (start, end) = &self.0;
        key >= &**start && key <= &**end
    }

    /// Returns `true` if the ranges share at least one key.
    ///
    /// Bounds are inclusive on both sides: two tables that share a boundary
    /// user key *do* overlap, which is what clean-cut expansion relies on.
    #[must_use]
    pub fn overlaps_with(&self, other: &Self) -> bool {
        let (start1, end1) = &self.0;
        let (start2, end2) = &other.0;
        end1 >= start2 && start1 <= end2
    }

    /// Returns the union of both ranges.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let min = self.min().min(other.min()).clone();
        let max = self.max().max(other.max()).clone();
        Self((min, max))
    }

    /// Aggregates the tight bounding range of an iterator of ranges.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is empty; an empty set of ranges has no
    /// meaningful bounding range.
    #[must_use]
    pub fn aggregate<'a>(mut iter: impl Iterator<Item = &'a Self>) -> Self {
        let first = iter.next().expect("cannot aggregate empty iterator");
        iter.fold(first.clone(), |acc, range| acc.merge(range))
    }
}
