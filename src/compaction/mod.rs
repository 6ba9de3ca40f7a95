// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Contains the compaction job descriptor and picking strategies

pub(crate) mod gc;
pub(crate) mod leveled;
pub(crate) mod null;
pub(crate) mod picker;
pub(crate) mod registry;

pub use gc::{fix_input_range, get_q, read_map_element, MapElement};
pub use leveled::LeveledPicker;
pub use null::NullPicker;
pub use picker::{find_intra_l0_compaction, CompactRangeOutcome, CompactionPicker};
pub use registry::CompactionRegistry;

use crate::{
    key_range::KeyRange, CompressionOptions, CompressionType, InternalKey, SeqNo, Table, TableId,
    Version,
};
use enum_dispatch::enum_dispatch;
use std::sync::Arc;

/// Why a compaction was picked
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompactionReason {
    /// L0 accumulated too many tables
    L0Files,

    /// A level outgrew its target size
    MaxLevelSize,

    /// Small L0 tables are merged in place to curb read amplification
    IntraL0,

    /// Tables were externally flagged (e.g. expired by TTL)
    FilesMarkedForCompaction,

    /// Explicit range- or file-driven request
    Manual,

    /// Fragmented composite (map/link) tables are materialized
    GarbageCollection,
}

impl CompactionReason {
    /// Maps a marked-flag bit pattern onto a reason, falling back to
    /// `default` for unknown bits.
    #[must_use]
    pub fn from_marked(marked: u8, default: Self) -> Self {
        match marked {
            1 => Self::FilesMarkedForCompaction,
            2 => Self::GarbageCollection,
            _ => default,
        }
    }
}

/// Composite table filter for range compactions
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeparationType {
    /// Data and composite tables may both be selected
    Any,

    /// Only regular data tables may be selected
    ForbidComposite,

    /// Only composite (map/link) tables may be selected
    RequireComposite,
}

impl SeparationType {
    fn admits(self, table: &Table) -> bool {
        match self {
            Self::Any => true,
            Self::ForbidComposite => !table.is_composite(),
            Self::RequireComposite => table.is_composite(),
        }
    }
}

/// An ordered list of input tables, all on the same level
#[derive(Clone, Debug, Default)]
pub struct CompactionInputs {
    /// Level the tables live on
    pub level: u8,

    /// Tables, ordered by key (L0: by recency)
    pub tables: Vec<Arc<Table>>,
}

impl CompactionInputs {
    /// Creates an empty input list for a level.
    #[must_use]
    pub fn new(level: u8) -> Self {
        Self {
            level,
            tables: Vec::new(),
        }
    }

    /// Adds a table.
    ///
    /// # Panics
    ///
    /// Panics if the table is not on this input list's level.
    pub fn push(&mut self, table: Arc<Table>) {
        assert_eq!(self.level, table.level, "input table on wrong level");
        self.tables.push(table);
    }

    /// Returns `true` if there are no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns the number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns an iterator over the table IDs.
    pub fn ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.iter().map(|t| t.id)
    }

    /// Sum of table sizes in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.tables.iter().map(|t| t.file_size).sum()
    }

    /// Aggregated user key range.
    ///
    /// # Panics
    ///
    /// Panics if the input list is empty.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        KeyRange::aggregate(self.tables.iter().map(|t| t.key_range()).collect::<Vec<_>>().iter())
    }
}

/// A fully populated compaction job descriptor
///
/// Produced by a picker; owned by the caller until the merge has finished or
/// failed, at which point [`CompactionPicker::release_compaction_files`] must
/// be called exactly once.
#[derive(Debug)]
pub struct Compaction {
    pub(crate) id: u64,
    pub(crate) inputs: Vec<CompactionInputs>,
    pub(crate) output_level: u8,
    pub(crate) output_path_id: u32,
    pub(crate) max_output_table_size: u64,
    pub(crate) grandparents: Vec<Arc<Table>>,
    pub(crate) max_grandparent_overlap_bytes: u64,
    pub(crate) compression: CompressionType,
    pub(crate) compression_opts: CompressionOptions,
    pub(crate) reason: CompactionReason,
    pub(crate) is_manual: bool,
    pub(crate) is_trivial_move: bool,
    pub(crate) input_ranges: Vec<KeyRange>,
    pub(crate) smallest_snapshot: Option<SeqNo>,
}

impl Compaction {
    /// Job ID, unique per picker instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Per-level input lists, ordered by level.
    #[must_use]
    pub fn inputs(&self) -> &[CompactionInputs] {
        &self.inputs
    }

    /// Level of the first (non-empty) input list.
    ///
    /// # Panics
    ///
    /// Panics if the job has no inputs, which a picker never produces.
    #[must_use]
    pub fn start_level(&self) -> u8 {
        self.inputs.first().expect("job has inputs").level
    }

    /// Level the merged output goes to.
    #[must_use]
    pub fn output_level(&self) -> u8 {
        self.output_level
    }

    /// Storage path the output tables are written to.
    #[must_use]
    pub fn output_path_id(&self) -> u32 {
        self.output_path_id
    }

    /// Target size of a single output table.
    #[must_use]
    pub fn max_output_table_size(&self) -> u64 {
        self.max_output_table_size
    }

    /// Tables at the grandparent level (output level + 1) overlapping this
    /// job; once an output table overlaps more than
    /// [`Compaction::max_grandparent_overlap_bytes`] of them, the consumer
    /// must start a new output table.
    #[must_use]
    pub fn grandparents(&self) -> &[Arc<Table>] {
        &self.grandparents
    }

    /// Grandparent overlap limit in bytes.
    #[must_use]
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.max_grandparent_overlap_bytes
    }

    /// Compression codec for the output tables.
    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Codec parameters for the output tables.
    #[must_use]
    pub fn compression_opts(&self) -> CompressionOptions {
        self.compression_opts
    }

    /// Why this job was picked.
    #[must_use]
    pub fn reason(&self) -> CompactionReason {
        self.reason
    }

    /// `true` for explicitly requested (range- or file-driven) jobs.
    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.is_manual
    }

    /// `true` if the job can be completed by re-linking tables into the
    /// output level without rewriting any data.
    #[must_use]
    pub fn is_trivial_move(&self) -> bool {
        self.is_trivial_move
    }

    /// Normalized disjoint key ranges to materialize; only set for
    /// composite (map/link) jobs.
    #[must_use]
    pub fn input_ranges(&self) -> &[KeyRange] {
        &self.input_ranges
    }

    /// Smallest snapshot sequence number passed through from the caller.
    #[must_use]
    pub fn smallest_snapshot(&self) -> Option<SeqNo> {
        self.smallest_snapshot
    }

    /// Iterates over all input tables of all levels.
    pub fn input_tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.inputs.iter().flat_map(|i| i.tables.iter())
    }

    /// Number of input tables across all levels.
    #[must_use]
    pub fn num_input_tables(&self) -> usize {
        self.inputs.iter().map(CompactionInputs::len).sum()
    }

    /// Aggregated user key range over all inputs.
    ///
    /// # Panics
    ///
    /// Panics if the job has no inputs, which a picker never produces.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        let ranges: Vec<_> = self.input_tables().map(|t| t.key_range()).collect();
        KeyRange::aggregate(ranges.iter())
    }

    /// Tight internal key range over all inputs.
    ///
    /// # Panics
    ///
    /// Panics if the job has no inputs, which a picker never produces.
    #[must_use]
    pub fn internal_key_range(&self) -> (InternalKey, InternalKey) {
        picker::key_range_of(&self.inputs)
    }
}

/// Trait for a compaction picking strategy
///
/// The strategy receives an immutable snapshot of the LSM-tree and emits a
/// registered job descriptor, or `None` if there is nothing to do right now.
#[enum_dispatch]
pub trait CompactionStrategy {
    /// Gets the strategy name.
    fn name(&self) -> &'static str;

    /// Picks the next compaction, registers it, and returns it.
    ///
    /// `None` means "no work right now"; the scheduler should retry later.
    /// The caller must hold its process-wide lock.
    fn pick_compaction(&mut self, version: &Version, snapshots: &[SeqNo]) -> Option<Compaction>;

    /// Cheap readiness probe; `true` if [`CompactionStrategy::pick_compaction`]
    /// is worth calling.
    fn needs_compaction(&self, version: &Version) -> bool;

    /// Access to the shared picking core (registry, manual APIs).
    fn inner(&self) -> &CompactionPicker;

    /// Mutable access to the shared picking core.
    fn inner_mut(&mut self) -> &mut CompactionPicker;
}

/// May be a [`LeveledPicker`] or a [`NullPicker`].
#[enum_dispatch(CompactionStrategy)]
pub enum AnyPicker {
    /// Automatic leveled compaction, see [`LeveledPicker`]
    Leveled(LeveledPicker),

    /// Background compaction disabled, see [`NullPicker`]
    Null(NullPicker),
}
