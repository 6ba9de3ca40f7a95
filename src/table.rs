// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key_range::KeyRange, InternalKey, Level};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Unique table (file) identifier
pub type TableId = u64;

/// Role of a table inside the tree
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableKind {
    /// A regular table storing key-value data
    Data,

    /// A composite table whose entries reference key ranges in other tables
    /// instead of storing data directly, deferring physical rewrites
    Map,

    /// A composite table that links to another table 1:1 (e.g. after a
    /// virtual split), also storing no data of its own
    Link,
}

impl TableKind {
    /// Returns `true` for indirection (map/link) tables.
    #[must_use]
    pub fn is_composite(self) -> bool {
        !matches!(self, Self::Data)
    }
}

/// Metadata of one on-disk table (sorted run file)
///
/// The picker never owns tables; the version snapshot and the running
/// compaction registry share them through `Arc`. The only mutable part is the
/// `being_compacted` flag, which is flipped while the caller holds its
/// process-wide lock. The atomic is *not* the synchronization mechanism, the
/// external lock is; `Relaxed` ordering documents that.
#[derive(Debug)]
pub struct Table {
    /// Table ID
    pub id: TableId,

    /// Level the table lives on
    pub level: u8,

    /// Smallest internal key in the table
    pub smallest: InternalKey,

    /// Largest internal key in the table
    pub largest: InternalKey,

    /// Size on disk in bytes
    pub file_size: u64,

    /// Size metric adjusted for tombstone density, used for scoring
    pub compensated_file_size: u64,

    /// Data or composite table
    pub kind: TableKind,

    /// Externally flagged for compaction (e.g. expired by TTL)
    pub marked_for_compaction: bool,

    /// Excluded from garbage-collection-style picking (already virtual)
    pub skip_composite: bool,

    /// Resident encoded element index for composite tables
    ///
    /// In a full engine this would be read through the table cache; the
    /// picker only needs the element index, so it is carried in metadata.
    pub map_content: Option<Arc<[u8]>>,

    being_compacted: AtomicBool,
}

impl Table {
    /// Creates the metadata for a regular data table.
    ///
    /// # Panics
    ///
    /// Panics if `compensated_file_size` is zero or the key range is inverted.
    #[must_use]
    pub fn new(
        id: TableId,
        level: u8,
        smallest: InternalKey,
        largest: InternalKey,
        file_size: u64,
        compensated_file_size: u64,
    ) -> Self {
        assert!(compensated_file_size > 0, "table cannot be empty");
        assert!(smallest <= largest, "inverted table key range");

        Self {
            id,
            level,
            smallest,
            largest,
            file_size,
            compensated_file_size,
            kind: TableKind::Data,
            marked_for_compaction: false,
            skip_composite: false,
            map_content: None,
            being_compacted: AtomicBool::new(false),
        }
    }

    /// Returns the table's user key range.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new((
            self.smallest.user_key.clone(),
            self.largest.user_key.clone(),
        ))
    }

    /// Returns `true` if the table is part of a running compaction.
    #[must_use]
    pub fn is_being_compacted(&self) -> bool {
        self.being_compacted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_being_compacted(&self, busy: bool) {
        self.being_compacted.store(busy, Ordering::Relaxed);
    }

    /// Returns `true` for indirection (map/link) tables.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.kind.is_composite()
    }
}

/// Uniform unit of comparison for picking
///
/// For level 0, a sorted run is a single table; for any other level, the
/// whole level forms one sorted run and the fields are level-wide aggregates.
#[derive(Clone, Debug)]
pub struct SortedRun {
    /// Level of the run
    pub level: u8,

    /// Backing table; `Some` exactly for level 0 runs
    pub table: Option<Arc<Table>>,

    /// Size in bytes (aggregate for level > 0)
    pub size: u64,

    /// Compensated size in bytes (aggregate for level > 0)
    pub compensated_file_size: u64,

    /// Whether any part of the run is being compacted
    pub being_compacted: bool,

    /// Excluded from garbage-collection-style picking
    pub skip_composite: bool,
}

impl SortedRun {
    /// Creates a sorted run for a single level-0 table.
    ///
    /// # Panics
    ///
    /// Panics if the table is not on level 0.
    #[must_use]
    pub fn from_table(table: Arc<Table>) -> Self {
        assert_eq!(0, table.level, "single-table runs only exist on level 0");
        assert!(table.compensated_file_size > 0);

        Self {
            level: 0,
            size: table.file_size,
            compensated_file_size: table.compensated_file_size,
            being_compacted: table.is_being_compacted(),
            skip_composite: table.skip_composite,
            table: Some(table),
        }
    }

    /// Creates a sorted run aggregating a whole non-zero level.
    ///
    /// # Panics
    ///
    /// Panics if the level is 0 or empty.
    #[must_use]
    pub fn from_level(level: u8, tables: &Level) -> Self {
        assert!(level > 0, "level 0 runs wrap a single table");
        assert!(!tables.is_empty(), "cannot aggregate an empty level");

        Self {
            level,
            table: None,
            size: tables.size(),
            compensated_file_size: tables.compensated_size(),
            being_compacted: tables.iter().any(|t| t.is_being_compacted()),
            skip_composite: tables.iter().all(|t| t.skip_composite),
        }
    }
}

impl std::fmt::Display for SortedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(table) => write!(
                f,
                "file({}[{}] {}B{})",
                table.id,
                self.level,
                self.size,
                if self.being_compacted { " busy" } else { "" },
            ),
            None => write!(
                f,
                "level({} {}B{})",
                self.level,
                self.size,
                if self.being_compacted { " busy" } else { "" },
            ),
        }
    }
}
