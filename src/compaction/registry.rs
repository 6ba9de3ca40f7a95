// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Compaction;
use crate::{key_range::KeyRange, HashMap, HashSet, Table};
use std::sync::Arc;

/// One registered, in-flight compaction
#[derive(Debug)]
struct RunningCompaction {
    tables: Vec<Arc<Table>>,
    start_level: u8,
    output_level: u8,
    key_range: KeyRange,
}

/// Keeps track of all compactions that are running
///
/// Registering a job marks all its input tables as `being_compacted`; no
/// other job may include those tables until the job is released. If a
/// compaction fails, releasing it makes its tables eligible again.
///
/// Protected by the caller's lock, like everything else in the picker.
#[derive(Debug, Default)]
pub struct CompactionRegistry {
    running: HashMap<u64, RunningCompaction>,

    /// IDs of running compactions that touch level 0
    level0: HashSet<u64>,
}

impl CompactionRegistry {
    /// Returns `true` if no compaction is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Number of running compactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// Is there currently a compaction involving level 0 taking place?
    #[must_use]
    pub fn is_level0_compaction_in_progress(&self) -> bool {
        !self.level0.is_empty()
    }

    /// Returns `true` if the job ID is registered.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.running.contains_key(&id)
    }

    /// Returns `true` if the key range overlaps a running compaction that
    /// outputs into `level`.
    #[must_use]
    pub fn range_overlaps(&self, key_range: &KeyRange, level: u8) -> bool {
        self.running
            .values()
            .filter(|c| c.output_level == level || c.start_level == level)
            .any(|c| c.key_range.overlaps_with(key_range))
    }

    pub(crate) fn insert(&mut self, compaction: &Compaction) {
        debug_assert!(
            !compaction.input_tables().any(|t| t.is_being_compacted()),
            "registering a compaction with double-booked tables",
        );

        let tables: Vec<_> = compaction.input_tables().cloned().collect();

        for table in &tables {
            table.set_being_compacted(true);
        }

        if compaction.start_level() == 0 || compaction.output_level() == 0 {
            self.level0.insert(compaction.id());
        }

        self.running.insert(
            compaction.id(),
            RunningCompaction {
                start_level: compaction.start_level(),
                output_level: compaction.output_level(),
                key_range: compaction.key_range(),
                tables,
            },
        );
    }

    /// Removes a job and clears the `being_compacted` flags of its inputs.
    ///
    /// Returns `false` if the job was not registered (e.g. released twice).
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.level0.remove(&id);

        if let Some(running) = self.running.remove(&id) {
            for table in &running.tables {
                table.set_being_compacted(false);
            }
            true
        } else {
            false
        }
    }
}
