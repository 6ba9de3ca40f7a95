// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key_range::KeyRange, Config, Table, TableId};
use std::sync::Arc;

/// Level of an LSM-tree
#[derive(Clone, Debug, Default)]
pub struct Level {
    /// List of tables
    #[doc(hidden)]
    pub tables: Vec<Arc<Table>>,
}

impl std::ops::Deref for Level {
    type Target = Vec<Arc<Table>>;

    fn deref(&self) -> &Self::Target {
        &self.tables
    }
}

impl Level {
    /// Returns `true` if the level contains no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns the number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns the level size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.tables.iter().map(|x| x.file_size).sum()
    }

    /// Returns the level's compensated size in bytes.
    #[must_use]
    pub fn compensated_size(&self) -> u64 {
        self.tables.iter().map(|x| x.compensated_file_size).sum()
    }

    /// Returns an iterator over the level's table IDs.
    pub fn ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.iter().map(|x| x.id)
    }

    /// Returns an iterator over tables whose user key range overlaps the
    /// input range (inclusive bounds on both sides).
    pub fn overlapping_tables<'a>(
        &'a self,
        key_range: &'a KeyRange,
    ) -> impl Iterator<Item = &'a Arc<Table>> {
        self.tables
            .iter()
            .filter(|x| x.key_range().overlaps_with(key_range))
    }

    /// Returns tables overlapping the optionally half-open bounds.
    ///
    /// `None` bounds are unbounded on that side.
    pub(crate) fn overlapping_tables_in_bounds(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<Table>> {
        self.tables
            .iter()
            .filter(|x| {
                let past_begin = begin.map_or(true, |b| &*x.largest.user_key >= b);
                let before_end = end.map_or(true, |e| &*x.smallest.user_key <= e);
                past_begin && before_end
            })
            .cloned()
            .collect()
    }

    fn sort_by_key_range(&mut self) {
        self.tables
            .sort_by(|a, b| a.smallest.cmp(&b.smallest).then(a.id.cmp(&b.id)));
    }

    /// Sorts the level from newest to oldest.
    fn sort_by_seqno(&mut self) {
        self.tables
            .sort_by(|a, b| b.largest.seqno.cmp(&a.largest.seqno).then(b.id.cmp(&a.id)));
    }
}

/// Per-level compaction score
///
/// A score of 1.0 or above means the level is due for compaction; the higher
/// the score, the more urgent it is.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LevelScore {
    /// Level
    pub level: u8,

    /// Urgency, >= 1.0 means due
    pub score: f64,
}

/// Immutable snapshot of the tree's on-disk state
///
/// This is what the picker reasons about. The scheduler materializes one of
/// these under its lock and must not mutate it for the duration of a picking
/// call.
#[derive(Clone, Debug)]
pub struct Version {
    levels: Vec<Level>,
    scores: Vec<LevelScore>,
}

impl Version {
    /// Creates an empty version with the given number of levels.
    ///
    /// # Panics
    ///
    /// Panics if `level_count` is 0.
    #[must_use]
    pub fn new(level_count: u8) -> Self {
        assert!(level_count > 0);

        Self {
            levels: (0..level_count).map(|_| Level::default()).collect(),
            scores: Vec::new(),
        }
    }

    /// Returns the number of levels.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn level_count(&self) -> u8 {
        self.levels.len() as u8
    }

    /// First level that receives compaction output from L0.
    #[must_use]
    pub fn base_level(&self) -> u8 {
        1
    }

    /// Returns the given level.
    ///
    /// # Panics
    ///
    /// Panics if the level does not exist.
    #[must_use]
    pub fn level(&self, n: u8) -> &Level {
        self.levels.get(usize::from(n)).expect("level out of range")
    }

    /// Returns level 0.
    #[must_use]
    pub fn l0(&self) -> &Level {
        self.level(0)
    }

    /// Returns an iterator over all levels.
    pub fn iter_levels(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    /// Inserts a table into its level, keeping L0 ordered by recency and
    /// deeper levels ordered by key range.
    ///
    /// # Panics
    ///
    /// Panics if the table's level does not exist in this version.
    pub fn insert(&mut self, table: Arc<Table>) {
        let idx = usize::from(table.level);
        let level = self.levels.get_mut(idx).expect("level out of range");

        level.tables.push(table);

        if idx == 0 {
            level.sort_by_seqno();
        } else {
            level.sort_by_key_range();
        }
    }

    /// Returns tables on `level` overlapping the key range, ordered by key.
    #[must_use]
    pub fn overlapping_tables(&self, level: u8, key_range: &KeyRange) -> Vec<Arc<Table>> {
        let mut tables: Vec<_> = self
            .level(level)
            .overlapping_tables(key_range)
            .cloned()
            .collect();

        tables.sort_by(|a, b| a.smallest.cmp(&b.smallest).then(a.id.cmp(&b.id)));
        tables
    }

    /// Returns tables on `level` within optionally unbounded user key bounds,
    /// ordered by key.
    #[must_use]
    pub fn overlapping_tables_in_bounds(
        &self,
        level: u8,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<Table>> {
        let mut tables = self
            .level(level)
            .overlapping_tables_in_bounds(begin, end);

        tables.sort_by(|a, b| a.smallest.cmp(&b.smallest).then(a.id.cmp(&b.id)));
        tables
    }

    /// Finds a table by ID, anywhere in the version.
    #[must_use]
    pub fn table(&self, id: TableId) -> Option<&Arc<Table>> {
        self.levels
            .iter()
            .flat_map(|level| level.tables.iter())
            .find(|t| t.id == id)
    }

    /// Returns all tables flagged for compaction by an external policy
    /// (e.g. TTL expiry), ordered by level.
    #[must_use]
    pub fn tables_marked_for_compaction(&self) -> Vec<Arc<Table>> {
        self.levels
            .iter()
            .flat_map(|level| level.tables.iter())
            .filter(|t| t.marked_for_compaction)
            .cloned()
            .collect()
    }

    /// Computes per-level compaction scores.
    ///
    /// L0 is scored by file count against the compaction trigger; deeper
    /// levels are scored by compensated bytes against the level target.
    /// Bytes already being compacted do not count towards the score, so a
    /// level is not re-selected for work that is already in flight.
    ///
    /// The scoring policy lives on the snapshot, not in the picker, so it can
    /// be swapped without touching the picking algorithms.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute_compaction_scores(&mut self, config: &Config) {
        let mut scores = Vec::with_capacity(self.levels.len());

        let l0_count = self
            .l0()
            .iter()
            .filter(|t| !t.is_being_compacted())
            .count();

        scores.push(LevelScore {
            level: 0,
            score: l0_count as f64 / config.l0_compaction_trigger.max(1) as f64,
        });

        for (idx, level) in self.levels.iter().enumerate().skip(1) {
            #[allow(clippy::cast_possible_truncation)]
            let n = idx as u8;

            // The bottommost level has nowhere to push data to
            if n >= config.max_output_level() {
                break;
            }

            let bytes: u64 = level
                .iter()
                .filter(|t| !t.is_being_compacted())
                .map(|t| t.compensated_file_size)
                .sum();

            scores.push(LevelScore {
                level: n,
                score: bytes as f64 / config.level_target_bytes(n) as f64,
            });
        }

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        self.scores = scores;
    }

    /// Returns the per-level scores, most urgent first.
    ///
    /// Empty until [`Version::compute_compaction_scores`] has run.
    #[must_use]
    pub fn scores(&self) -> &[LevelScore] {
        &self.scores
    }
}
