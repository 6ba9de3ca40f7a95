// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    picker::{find_intra_l0_compaction, CompactionPicker},
    Compaction, CompactionInputs, CompactionReason, CompactionStrategy,
};
use crate::{Config, HashMap, SeqNo, UserKey, Version};
use std::sync::Arc;

/// Levelled compaction strategy (LCS)
///
/// When a level reaches its urgency threshold, a clean-cut slice of it is
/// merged into the next level. Work rotates through each level by a cursor
/// over the key space so the whole level gets compacted eventually, not just
/// its hottest prefix.
///
/// When no level is due, falls back to intra-L0 merging, externally marked
/// tables, and composite garbage collection, in that order.
///
/// LCS minimizes space amplification at the cost of more write amplification.
pub struct LeveledPicker {
    inner: CompactionPicker,

    /// Upper bound of the previously compacted slice, per level
    cursors: HashMap<u8, UserKey>,
}

impl LeveledPicker {
    /// Creates a new levelled strategy.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: CompactionPicker::new(config),
            cursors: HashMap::default(),
        }
    }

    fn pick_l0(&mut self, version: &Version, snapshots: &[SeqNo]) -> Option<Compaction> {
        // Two overlapping L0 jobs would interleave sequence numbers, so L0
        // admits only one job at a time
        if self.inner.registry().is_level0_compaction_in_progress() {
            return None;
        }

        let tables: Vec<_> = version.l0().tables.clone();

        if tables.is_empty() || tables.iter().any(|t| t.is_being_compacted()) {
            return None;
        }

        let mut inputs = CompactionInputs { level: 0, tables };

        let output_level = version.base_level();

        if self
            .inner
            .files_range_overlap_with_compaction(std::slice::from_ref(&inputs), output_level)
        {
            return None;
        }

        let other = self.inner.setup_other_inputs(version, &mut inputs, output_level)?;

        let mut input_list = vec![inputs];
        if !other.output.is_empty() {
            input_list.push(other.output);
        }

        let compaction = self.inner.build_compaction(
            version,
            input_list,
            output_level,
            0,
            CompactionReason::L0Files,
            false,
            other.grandparents,
            Vec::new(),
            Some(snapshots),
            true,
        );

        self.inner.register_compaction(&compaction);
        Some(compaction)
    }

    fn pick_level(
        &mut self,
        version: &Version,
        level: u8,
        snapshots: &[SeqNo],
    ) -> Option<Compaction> {
        let tables = version.level(level);

        let cursor = self.cursors.get(&level);

        // Rotate through the level: first table past the cursor, wrapping
        // around to the front once the end is reached
        let seed = tables
            .iter()
            .find(|t| {
                !t.is_being_compacted()
                    && cursor.map_or(true, |c| t.smallest.user_key > *c)
            })
            .or_else(|| tables.iter().find(|t| !t.is_being_compacted()))?
            .clone();

        let output_level = level.checked_add(1)?;

        if output_level > self.inner.max_output_level() {
            return None;
        }

        let mut inputs = CompactionInputs::new(level);
        inputs.push(seed);

        if !self.inner.expand_inputs_to_clean_cut(version, &mut inputs, None) {
            return None;
        }

        if self
            .inner
            .files_range_overlap_with_compaction(std::slice::from_ref(&inputs), output_level)
        {
            return None;
        }

        let other = self.inner.setup_other_inputs(version, &mut inputs, output_level)?;

        let next_cursor = inputs
            .tables
            .last()
            .map(|t| t.largest.user_key.clone())?;

        let mut input_list = vec![inputs];
        if !other.output.is_empty() {
            input_list.push(other.output);
        }

        let compaction = self.inner.build_compaction(
            version,
            input_list,
            output_level,
            0,
            CompactionReason::MaxLevelSize,
            false,
            other.grandparents,
            Vec::new(),
            Some(snapshots),
            true,
        );

        self.inner.register_compaction(&compaction);
        self.cursors.insert(level, next_cursor);

        Some(compaction)
    }

    fn pick_intra_l0(&mut self, version: &Version, snapshots: &[SeqNo]) -> Option<Compaction> {
        let inputs = find_intra_l0_compaction(
            &version.l0().tables,
            self.inner.config().intra_l0_min_tables,
            self.inner.config().intra_l0_max_bytes,
        )?;

        if self
            .inner
            .files_range_overlap_with_compaction(std::slice::from_ref(&inputs), 0)
        {
            return None;
        }

        let compaction = self.inner.build_compaction(
            version,
            vec![inputs],
            0,
            0,
            CompactionReason::IntraL0,
            false,
            Vec::new(),
            Vec::new(),
            Some(snapshots),
            true,
        );

        self.inner.register_compaction(&compaction);
        Some(compaction)
    }

    fn pick_marked(&mut self, version: &Version, snapshots: &[SeqNo]) -> Option<Compaction> {
        let (mut inputs, output_level) = self.inner.pick_files_marked_for_compaction(version)?;

        let other = self
            .inner
            .setup_other_inputs(version, &mut inputs, output_level)?;

        let mut input_list = vec![inputs];
        if !other.output.is_empty() && other.output.level != input_list.first()?.level {
            input_list.push(other.output);
        }

        let compaction = self.inner.build_compaction(
            version,
            input_list,
            output_level,
            0,
            CompactionReason::FilesMarkedForCompaction,
            false,
            other.grandparents,
            Vec::new(),
            Some(snapshots),
            true,
        );

        self.inner.register_compaction(&compaction);
        Some(compaction)
    }
}

impl CompactionStrategy for LeveledPicker {
    fn name(&self) -> &'static str {
        "LeveledPicker"
    }

    fn pick_compaction(&mut self, version: &Version, snapshots: &[SeqNo]) -> Option<Compaction> {
        // Most urgent level first; a level that cannot produce a job right
        // now (conflicts) does not block the next one
        let due: Vec<u8> = version
            .scores()
            .iter()
            .filter(|s| s.score >= 1.0)
            .map(|s| s.level)
            .collect();

        for level in due {
            let picked = if level == 0 {
                self.pick_l0(version, snapshots)
            } else {
                self.pick_level(version, level, snapshots)
            };

            if picked.is_some() {
                return picked;
            }
        }

        if let Some(c) = self.pick_intra_l0(version, snapshots) {
            return Some(c);
        }

        if let Some(c) = self.pick_marked(version, snapshots) {
            return Some(c);
        }

        self.inner.pick_garbage_collection(version, snapshots)
    }

    fn needs_compaction(&self, version: &Version) -> bool {
        if version.scores().iter().any(|s| s.score >= 1.0) {
            return true;
        }

        if version
            .tables_marked_for_compaction()
            .iter()
            .any(|t| !t.is_being_compacted())
        {
            return true;
        }

        version.iter_levels().any(|level| {
            level
                .iter()
                .any(|t| t.is_composite() && !t.skip_composite && !t.is_being_compacted())
        })
    }

    fn inner(&self) -> &CompactionPicker {
        &self.inner
    }

    fn inner_mut(&mut self) -> &mut CompactionPicker {
        &mut self.inner
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{InternalKey, Table, TableId, ValueType};
    use test_log::test;

    fn table(id: TableId, level: u8, min: &str, max: &str, size: u64) -> Arc<Table> {
        Arc::new(Table::new(
            id,
            level,
            InternalKey::new(min, id, ValueType::Value),
            InternalKey::new(max, id, ValueType::Value),
            size,
            size,
        ))
    }

    fn config() -> Arc<Config> {
        // L1 target = 64 * 4 = 256 bytes
        Arc::new(
            Config::default()
                .level_count(4)
                .l0_compaction_trigger(4)
                .target_table_size(64)
                .level_fanout(10),
        )
    }

    #[test]
    fn leveled_empty_tree() {
        let mut version = Version::new(4);
        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());

        assert!(!picker.needs_compaction(&version));
        assert!(picker.pick_compaction(&version, &[]).is_none());
    }

    #[test]
    fn leveled_l0_trigger() {
        let mut version = Version::new(4);

        for id in 0..4 {
            version.insert(table(id, 0, "a", "z", 64));
        }

        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());
        assert!(picker.needs_compaction(&version));

        let compaction = picker
            .pick_compaction(&version, &[])
            .expect("L0 is at trigger");

        assert_eq!(CompactionReason::L0Files, compaction.reason());
        assert_eq!(0, compaction.start_level());
        assert_eq!(1, compaction.output_level());
        assert_eq!(4, compaction.num_input_tables());

        // Overlapping L0 tables must be merged, never moved
        assert!(!compaction.is_trivial_move());

        // A second L0 job must not start while the first is running
        version.compute_compaction_scores(&config());
        assert!(picker.pick_compaction(&version, &[]).is_none());

        picker.inner_mut().release_compaction_files(&compaction, true);
        assert!(picker.inner().registry().is_empty());
    }

    #[test]
    fn leveled_oversized_level() {
        let mut version = Version::new(4);

        // 512 bytes on L1 vs 256 target => score 2.0
        version.insert(table(1, 1, "a", "c", 256));
        version.insert(table(2, 1, "d", "f", 256));
        version.insert(table(10, 2, "b", "e", 64));

        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());

        let compaction = picker
            .pick_compaction(&version, &[])
            .expect("L1 is oversized");

        assert_eq!(CompactionReason::MaxLevelSize, compaction.reason());
        assert_eq!(1, compaction.start_level());
        assert_eq!(2, compaction.output_level());

        // Overlapping L2 table must be part of the job
        assert!(compaction.input_tables().any(|t| t.id == 10));
        assert!(!compaction.is_trivial_move());
    }

    #[test]
    fn leveled_cursor_rotates_through_level() {
        let mut version = Version::new(4);

        version.insert(table(1, 1, "a", "c", 512));
        version.insert(table(2, 1, "d", "f", 512));

        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());

        let first = picker.pick_compaction(&version, &[]).expect("L1 oversized");
        let first_ids: Vec<TableId> = first.input_tables().map(|t| t.id).collect();
        assert_eq!(vec![1], first_ids);

        picker.inner_mut().release_compaction_files(&first, true);
        version.compute_compaction_scores(&config());

        let second = picker.pick_compaction(&version, &[]).expect("still oversized");
        let second_ids: Vec<TableId> = second.input_tables().map(|t| t.id).collect();
        assert_eq!(vec![2], second_ids, "cursor must move past the first slice");
    }

    #[test]
    fn leveled_intra_l0_fallback() {
        let mut version = Version::new(4);

        // 3 tables: below the L0 trigger of 4, but enough for intra-L0
        for id in 0..3 {
            version.insert(table(id, 0, "a", "z", 8));
        }

        version.compute_compaction_scores(&config());

        let cfg = Arc::new(
            Config::default()
                .level_count(4)
                .l0_compaction_trigger(4)
                .target_table_size(64)
                .intra_l0(3, 1_000),
        );

        let mut picker = LeveledPicker::new(cfg);

        let compaction = picker
            .pick_compaction(&version, &[])
            .expect("intra-L0 fallback");

        assert_eq!(CompactionReason::IntraL0, compaction.reason());
        assert_eq!(0, compaction.start_level());
        assert_eq!(0, compaction.output_level());
        assert_eq!(3, compaction.num_input_tables());
    }

    #[test]
    fn leveled_marked_fallback() {
        let mut version = Version::new(4);

        let mut t = Table::new(
            7,
            1,
            InternalKey::new("a", 1, ValueType::Value),
            InternalKey::new("c", 1, ValueType::Value),
            10,
            10,
        );
        t.marked_for_compaction = true;
        version.insert(Arc::new(t));

        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());
        assert!(picker.needs_compaction(&version));

        let compaction = picker
            .pick_compaction(&version, &[])
            .expect("marked table");

        assert_eq!(
            CompactionReason::FilesMarkedForCompaction,
            compaction.reason(),
        );
        assert_eq!(1, compaction.start_level());
        assert_eq!(2, compaction.output_level());
    }

    #[test]
    fn leveled_records_smallest_snapshot() {
        let mut version = Version::new(4);

        for id in 0..4 {
            version.insert(table(id, 0, "a", "z", 64));
        }

        version.compute_compaction_scores(&config());

        let mut picker = LeveledPicker::new(config());

        let compaction = picker
            .pick_compaction(&version, &[400, 250, 300])
            .expect("L0 is at trigger");

        assert_eq!(Some(250), compaction.smallest_snapshot());
    }
}
