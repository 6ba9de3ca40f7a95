// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{registry::CompactionRegistry, Compaction, CompactionInputs, CompactionReason};
use crate::{
    compression::{compression_for_level, compression_options_for_level},
    key_range::KeyRange,
    Config, Error, HashMap, HashSet, InternalKey, SeqNo, Table, TableId, Version,
};
use std::sync::Arc;

/// Computes the tight internal key range over one or more input lists.
///
/// # Panics
///
/// Panics if any input list is empty; callers must never ask for the range
/// of nothing, that is a broken picking invariant.
#[must_use]
#[allow(clippy::expect_used)]
pub fn key_range_of(inputs: &[CompactionInputs]) -> (InternalKey, InternalKey) {
    assert!(
        inputs.iter().all(|i| !i.is_empty()),
        "key range of empty input list",
    );

    let mut iter = inputs.iter().flat_map(|i| i.tables.iter());
    let first = iter.next().expect("key range of empty input set");

    let mut smallest = first.smallest.clone();
    let mut largest = first.largest.clone();

    for table in iter {
        if table.smallest < smallest {
            smallest = table.smallest.clone();
        }
        if table.largest > largest {
            largest = table.largest.clone();
        }
    }

    (smallest, largest)
}

fn user_range_of(inputs: &[CompactionInputs]) -> KeyRange {
    let ranges: Vec<_> = inputs
        .iter()
        .flat_map(|i| i.tables.iter())
        .map(|t| t.key_range())
        .collect();

    KeyRange::aggregate(ranges.iter())
}

/// Finds the longest contiguous run of at least `min_tables` level-0 tables
/// (ordered newest to oldest) whose aggregate size stays within `max_bytes`,
/// to be merged into a single larger L0 table without promoting a level.
///
/// This cheaply bounds L0-file-count-driven read amplification when a real
/// L0 -> base level compaction is not possible right now.
#[must_use]
pub fn find_intra_l0_compaction(
    tables: &[Arc<Table>],
    min_tables: usize,
    max_bytes: u64,
) -> Option<CompactionInputs> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;

    while start < tables.len() {
        let mut size = 0u64;
        let mut end = start;

        for table in tables.iter().skip(start) {
            debug_assert_eq!(0, table.level);

            if table.is_being_compacted() || size + table.file_size > max_bytes {
                break;
            }

            size += table.file_size;
            end += 1;
        }

        if end - start >= min_tables && best.map_or(true, |(s, e)| (end - start) > (e - s)) {
            best = Some((start, end));
        }

        start = (start + 1).max(end);
    }

    let (start, end) = best?;

    let run = tables.get(start..end)?;

    Some(CompactionInputs {
        level: 0,
        tables: run.to_vec(),
    })
}

/// Result of a manual range compaction request
///
/// "Nothing to do" and "conflicts with a running job" are control flow, not
/// errors, hence this struct instead of a `Result`.
#[derive(Debug, Default)]
pub struct CompactRangeOutcome {
    /// The registered job, if one could be built
    pub compaction: Option<Compaction>,

    /// First key *not* covered by the job; `None` means the requested range
    /// is fully covered. The caller re-invokes with this as the new start to
    /// compact the remainder.
    pub compaction_end: Option<InternalKey>,

    /// The request intersected a running compaction and was declined without
    /// touching the registry; the caller should retry once that job finishes
    pub manual_conflict: bool,
}

impl CompactRangeOutcome {
    fn nothing() -> Self {
        Self::default()
    }

    fn conflict() -> Self {
        Self {
            manual_conflict: true,
            ..Self::default()
        }
    }
}

pub(crate) struct OtherInputs {
    pub output: CompactionInputs,
    pub grandparents: Vec<Arc<Table>>,
}

/// Shared picking core
///
/// Owns the running-compaction registry and the algorithms common to every
/// strategy: range math, clean-cut expansion, input sanitization and the
/// manual/administrative picking entry points.
///
/// Not internally thread-safe; the caller holds a process-wide lock around
/// every `&mut self` call.
pub struct CompactionPicker {
    config: Arc<Config>,
    registry: CompactionRegistry,
    next_job_id: u64,
}

impl CompactionPicker {
    /// Creates a picking core with an empty registry.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registry: CompactionRegistry::default(),
            next_job_id: 0,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the running-compaction registry.
    #[must_use]
    pub fn registry(&self) -> &CompactionRegistry {
        &self.registry
    }

    /// The maximum allowed output level.
    #[must_use]
    pub fn max_output_level(&self) -> u8 {
        self.config.max_output_level()
    }

    /// Returns `true` if any of the given tables is part of a running
    /// compaction.
    #[must_use]
    pub fn are_tables_in_compaction(&self, tables: &[Arc<Table>]) -> bool {
        tables.iter().any(|t| t.is_being_compacted())
    }

    /// Returns `true` if any table overlapping `[smallest, largest]` on
    /// `level` is part of a running compaction.
    #[must_use]
    pub fn is_range_in_compaction(
        &self,
        version: &Version,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: u8,
    ) -> bool {
        let range = KeyRange::new((smallest.user_key.clone(), largest.user_key.clone()));

        version
            .overlapping_tables(level, &range)
            .iter()
            .any(|t| t.is_being_compacted())
    }

    /// Returns `true` if the key range overlaps a running compaction
    /// reading from or writing into `level`.
    #[must_use]
    pub fn range_overlap_with_compaction(&self, key_range: &KeyRange, level: u8) -> bool {
        self.registry.range_overlaps(key_range, level)
    }

    /// Returns `true` if the key range covered by `inputs` overlaps a
    /// running compaction touching `output_level`.
    #[must_use]
    pub fn files_range_overlap_with_compaction(
        &self,
        inputs: &[CompactionInputs],
        output_level: u8,
    ) -> bool {
        let non_empty: Vec<_> = inputs.iter().filter(|i| !i.is_empty()).cloned().collect();

        if non_empty.is_empty() {
            return false;
        }

        self.registry
            .range_overlaps(&user_range_of(&non_empty), output_level)
    }

    /// Grows `inputs` on its own level until the selection is a *clean cut*:
    /// no user key has versions both inside and outside the selection.
    ///
    /// Without this, a point lookup could find a stale version of a key on a
    /// shallower level after a newer version was compacted past it.
    ///
    /// Returns `false` if the expansion would have to include a table that is
    /// already being compacted; the candidate must then be abandoned or
    /// retried later, never compacted as a partial cut. In that case
    /// `next_smallest` (if provided) receives the smallest key of the
    /// conflicting tail.
    pub fn expand_inputs_to_clean_cut(
        &self,
        version: &Version,
        inputs: &mut CompactionInputs,
        next_smallest: Option<&mut Option<InternalKey>>,
    ) -> bool {
        if inputs.is_empty() {
            return true;
        }

        // A table pulled in by one iteration widens the range, which can pull
        // in another boundary-sharing table, so iterate to a fixed point.
        loop {
            let range = inputs.key_range();
            let overlap = version.overlapping_tables(inputs.level, &range);

            debug_assert!(overlap.len() >= inputs.len());

            let stable = overlap.len() == inputs.len();
            inputs.tables = overlap;

            if stable {
                break;
            }
        }

        let conflict = inputs
            .tables
            .iter()
            .filter(|t| t.is_being_compacted())
            .map(|t| t.smallest.clone())
            .min();

        if let Some(conflict) = conflict {
            log::trace!(
                "clean cut on L{} requires busy table, declining candidate",
                inputs.level,
            );

            if let Some(out) = next_smallest {
                *out = Some(conflict);
            }

            return false;
        }

        true
    }

    /// Computes the overlapping output-level inputs for a clean-cut input
    /// set, re-expanding the start level while that does not change the
    /// output-level file set, and finally collects the grandparent tables.
    ///
    /// Returns `None` if the output level overlap intersects a running
    /// compaction.
    pub(crate) fn setup_other_inputs(
        &self,
        version: &Version,
        inputs: &mut CompactionInputs,
        output_level: u8,
    ) -> Option<OtherInputs> {
        debug_assert!(!inputs.is_empty());

        let mut output = CompactionInputs::new(output_level);

        if output_level != inputs.level {
            output.tables = version.overlapping_tables(output_level, &inputs.key_range());

            if !self.expand_inputs_to_clean_cut(version, &mut output, None) {
                log::trace!("output level L{output_level} overlap is busy, declining candidate");
                return None;
            }

            // See if the start level selection can be grown without pulling
            // more tables into the output level; that reduces write
            // amplification for free. Iterate until a fixed point.
            if !output.is_empty() {
                loop {
                    let combined = inputs.key_range().merge(&output.key_range());
                    let expanded = version.overlapping_tables(inputs.level, &combined);

                    if expanded.len() <= inputs.len() {
                        break;
                    }

                    let expanded_bytes =
                        expanded.iter().map(|t| t.file_size).sum::<u64>() + output.size();

                    if expanded_bytes >= self.config.max_compaction_bytes {
                        break;
                    }

                    let mut candidate = CompactionInputs {
                        level: inputs.level,
                        tables: expanded,
                    };

                    if !self.expand_inputs_to_clean_cut(version, &mut candidate, None) {
                        break;
                    }

                    let output_check =
                        version.overlapping_tables(output_level, &candidate.key_range());

                    if output_check.len() != output.len() {
                        break;
                    }

                    log::debug!(
                        "expanding L{} inputs from {} to {} tables without changing L{output_level}",
                        inputs.level,
                        inputs.len(),
                        candidate.len(),
                    );

                    *inputs = candidate;
                }
            }
        }

        let grandparents = self.get_grandparents(version, inputs, &output);

        Some(OtherInputs {
            output,
            grandparents,
        })
    }

    /// Collects the tables at the grandparent level (output level + 1)
    /// overlapping the given job inputs.
    ///
    /// The job consumer cuts output tables against these to bound how much a
    /// single output table will overlap the next level down, which bounds the
    /// cost of the *next* compaction.
    #[must_use]
    pub fn get_grandparents(
        &self,
        version: &Version,
        inputs: &CompactionInputs,
        output: &CompactionInputs,
    ) -> Vec<Arc<Table>> {
        let Some(gp_level) = output.level.checked_add(1) else {
            return Vec::new();
        };

        if gp_level >= version.level_count() || inputs.is_empty() {
            return Vec::new();
        }

        let range = if output.is_empty() {
            inputs.key_range()
        } else {
            inputs.key_range().merge(&output.key_range())
        };

        version.overlapping_tables(gp_level, &range)
    }

    /// Converts a set of table IDs into per-level input lists, ordered by
    /// level.
    ///
    /// # Errors
    ///
    /// Fails if the set is empty or contains an ID unknown to the version.
    pub fn compaction_inputs_from_table_ids(
        &self,
        version: &Version,
        ids: &HashSet<TableId>,
    ) -> crate::Result<Vec<CompactionInputs>> {
        if ids.is_empty() {
            return Err(Error::EmptyInputSet);
        }

        let mut per_level: HashMap<u8, Vec<Arc<Table>>> = HashMap::default();

        for &id in ids {
            let table = version.table(id).ok_or(Error::UnknownTable(id))?;
            per_level.entry(table.level).or_default().push(table.clone());
        }

        let mut levels: Vec<u8> = per_level.keys().copied().collect();
        levels.sort_unstable();

        Ok(levels
            .into_iter()
            .filter_map(|level| {
                let mut tables = per_level.remove(&level)?;
                tables.sort_by(|a, b| a.smallest.cmp(&b.smallest).then(a.id.cmp(&b.id)));
                Some(CompactionInputs { level, tables })
            })
            .collect())
    }

    /// Validates and, where possible, repairs a caller-supplied set of table
    /// IDs into a self-consistent compaction: same-level groups are expanded
    /// to clean cuts (IDs may be *added* to the set), cross-level groups must
    /// already be mutually consistent.
    ///
    /// Applying this to an already-valid set is a no-op.
    ///
    /// # Errors
    ///
    /// Fails when IDs are unknown, a table is already being compacted, an
    /// input sits below the output level, or the output level's overlap is
    /// not already included (fixing that would change the caller's explicit
    /// selection).
    pub fn sanitize_compaction_input_files(
        &self,
        input_files: &mut HashSet<TableId>,
        version: &Version,
        output_level: u8,
    ) -> crate::Result<()> {
        if output_level > self.max_output_level() {
            return Err(Error::InvalidOutputLevel {
                requested: output_level,
                max: self.max_output_level(),
            });
        }

        if input_files.is_empty() {
            return Err(Error::EmptyInputSet);
        }

        for &id in input_files.iter() {
            let table = version.table(id).ok_or(Error::UnknownTable(id))?;

            if table.is_being_compacted() {
                return Err(Error::TableBeingCompacted(id));
            }

            if table.level > output_level {
                return Err(Error::InputLevelBelowOutput {
                    table: id,
                    level: table.level,
                    output_level,
                });
            }
        }

        self.sanitize_compaction_input_files_for_all_levels(input_files, version, output_level)
    }

    /// Same-level clean-cut repair plus cross-level consistency check; helper
    /// to [`CompactionPicker::sanitize_compaction_input_files`].
    fn sanitize_compaction_input_files_for_all_levels(
        &self,
        input_files: &mut HashSet<TableId>,
        version: &Version,
        output_level: u8,
    ) -> crate::Result<()> {
        let mut groups = self.compaction_inputs_from_table_ids(version, input_files)?;

        for group in &mut groups {
            if !self.expand_inputs_to_clean_cut(version, group, None) {
                let conflict = group
                    .tables
                    .iter()
                    .find(|t| t.is_being_compacted())
                    .map_or(0, |t| t.id);

                return Err(Error::TableBeingCompacted(conflict));
            }

            input_files.extend(group.ids());
        }

        let upper: Vec<_> = groups
            .iter()
            .filter(|g| g.level < output_level && !g.is_empty())
            .cloned()
            .collect();

        if !upper.is_empty() {
            let range = user_range_of(&upper);

            for table in version.overlapping_tables(output_level, &range) {
                if !input_files.contains(&table.id) {
                    return Err(Error::InconsistentOverlap {
                        table: table.id,
                        level: output_level,
                    });
                }
            }
        }

        Ok(())
    }

    /// Builds a manual job directly from an already-sanitized input list.
    ///
    /// The lock must not have been released between sanitizing and this call.
    /// Returns `None` if any input has become part of a running compaction or
    /// the covered range collides with one.
    pub fn compact_files(
        &mut self,
        version: &Version,
        inputs: Vec<CompactionInputs>,
        output_level: u8,
        output_path_id: u32,
    ) -> Option<Compaction> {
        if inputs.iter().all(CompactionInputs::is_empty) {
            return None;
        }

        if inputs.iter().flat_map(|i| i.tables.iter()).any(|t| t.is_being_compacted()) {
            log::trace!("compact_files: input table became busy, declining");
            return None;
        }

        if self.files_range_overlap_with_compaction(&inputs, output_level) {
            log::trace!("compact_files: range collides with running compaction, declining");
            return None;
        }

        let grandparents = {
            let combined = CompactionInputs {
                level: output_level,
                tables: inputs.iter().flat_map(|i| i.tables.iter()).cloned().collect(),
            };
            let empty = CompactionInputs::new(output_level);
            self.get_grandparents(version, &combined, &empty)
        };

        let compaction = self.build_compaction(
            version,
            inputs,
            output_level,
            output_path_id,
            CompactionReason::Manual,
            true,
            grandparents,
            Vec::new(),
            None,
            true,
        );

        self.register_compaction(&compaction);
        Some(compaction)
    }

    /// Builds a manual job for the key range `[begin, end]` (either side may
    /// be unbounded) from `input_level` into `output_level`.
    ///
    /// If only a prefix of the range can be covered (size cap, or a suffix is
    /// being compacted), the outcome's `compaction_end` is set to the first
    /// uncovered key so the caller can re-invoke for the remainder.
    pub fn compact_range(
        &mut self,
        version: &Version,
        input_level: u8,
        output_level: u8,
        output_path_id: u32,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> CompactRangeOutcome {
        if output_level > self.max_output_level() || output_level < input_level {
            return CompactRangeOutcome::nothing();
        }

        let mut inputs = CompactionInputs::new(input_level);
        inputs.tables = version.overlapping_tables_in_bounds(
            input_level,
            begin.map(|k| &*k.user_key),
            end.map(|k| &*k.user_key),
        );

        if inputs.is_empty() {
            return CompactRangeOutcome::nothing();
        }

        // L0 tables overlap arbitrarily, so partial coverage by key makes no
        // sense there; the whole overlap set goes or nothing does.
        if input_level == 0 && inputs.tables.iter().any(|t| t.is_being_compacted()) {
            return CompactRangeOutcome::conflict();
        }

        let mut compaction_end: Option<InternalKey> = None;

        // Cap the job size; the remainder is signaled back via compaction_end
        if input_level > 0 {
            let cap = self.config.max_compaction_bytes;
            let mut total = 0u64;
            let mut keep = 0usize;

            for table in &inputs.tables {
                if keep > 0 && total + table.file_size > cap {
                    break;
                }
                total += table.file_size;
                keep += 1;
            }

            if keep < inputs.tables.len() {
                compaction_end = inputs.tables.get(keep).map(|t| t.smallest.clone());
                inputs.tables.truncate(keep);
            }
        }

        loop {
            // Truncate at the first busy table; everything before it is
            // still compactable (partial coverage)
            if let Some(pos) = inputs.tables.iter().position(|t| t.is_being_compacted()) {
                if pos == 0 {
                    return CompactRangeOutcome::conflict();
                }

                compaction_end = inputs.tables.get(pos).map(|t| t.smallest.clone());
                inputs.tables.truncate(pos);
            }

            let mut next_smallest = None;

            if self.expand_inputs_to_clean_cut(version, &mut inputs, Some(&mut next_smallest)) {
                break;
            }

            // The clean cut pulled a busy table back in; cut strictly before
            // it and try again
            let Some(boundary) = next_smallest else {
                return CompactRangeOutcome::conflict();
            };

            let before = inputs.tables.len();
            inputs.tables.retain(|t| t.smallest < boundary);

            if inputs.tables.len() == before {
                // Boundary user key is shared with the busy neighbor; the
                // tail table cannot be cleanly cut either, drop it as well
                if let Some(dropped) = inputs.tables.pop() {
                    compaction_end = Some(dropped.smallest.clone());
                }
            } else {
                compaction_end = Some(boundary);
            }

            if inputs.tables.is_empty() {
                return CompactRangeOutcome::conflict();
            }
        }

        if self.files_range_overlap_with_compaction(std::slice::from_ref(&inputs), output_level) {
            return CompactRangeOutcome::conflict();
        }

        let Some(other) = self.setup_other_inputs(version, &mut inputs, output_level) else {
            return CompactRangeOutcome::conflict();
        };

        let mut input_list = vec![inputs];
        if !other.output.is_empty() {
            input_list.push(other.output);
        }

        let compaction = self.build_compaction(
            version,
            input_list,
            output_level,
            output_path_id,
            CompactionReason::Manual,
            true,
            other.grandparents,
            Vec::new(),
            None,
            true,
        );

        self.register_compaction(&compaction);

        CompactRangeOutcome {
            compaction: Some(compaction),
            compaction_end,
            manual_conflict: false,
        }
    }

    /// Seeds a job from the snapshot's marked-for-compaction list (e.g. TTL
    /// expired tables). Returns the clean-cut seed inputs plus output level.
    #[must_use]
    pub fn pick_files_marked_for_compaction(
        &self,
        version: &Version,
    ) -> Option<(CompactionInputs, u8)> {
        for table in version.tables_marked_for_compaction() {
            if table.is_being_compacted() {
                continue;
            }

            let level = table.level;
            let output_level = level
                .saturating_add(1)
                .min(self.max_output_level())
                .max(level);

            let mut inputs = CompactionInputs::new(level);
            inputs.push(table);

            if !self.expand_inputs_to_clean_cut(version, &mut inputs, None) {
                continue;
            }

            if self.files_range_overlap_with_compaction(
                std::slice::from_ref(&inputs),
                output_level,
            ) {
                continue;
            }

            return Some((inputs, output_level));
        }

        None
    }

    /// Registers a job: records it and marks all its input tables as
    /// `being_compacted` so no other job can select them.
    pub fn register_compaction(&mut self, compaction: &Compaction) {
        log::debug!(
            "registering compaction {}: L{} -> L{}, {} tables, {:?}",
            compaction.id(),
            compaction.start_level(),
            compaction.output_level(),
            compaction.num_input_tables(),
            compaction.reason(),
        );

        self.registry.insert(compaction);
    }

    /// Removes a job from the registry, clearing its `being_compacted` flags.
    pub fn unregister_compaction(&mut self, compaction: &Compaction) {
        self.registry.remove(compaction.id());
    }

    /// Frees up the tables that participated in a compaction.
    ///
    /// Terminal call on both success and failure; must be called exactly once
    /// per registered job. Omitting it leaks permanently "busy" tables.
    pub fn release_compaction_files(&mut self, compaction: &Compaction, success: bool) {
        if !success {
            log::warn!(
                "compaction {} failed, its inputs become eligible again",
                compaction.id(),
            );
        }

        if !self.registry.remove(compaction.id()) {
            log::warn!("released compaction {} twice", compaction.id());
        }
    }

    pub(crate) fn next_job_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// Assembles the final job descriptor. Inputs must be sorted by level.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_compaction(
        &mut self,
        version: &Version,
        inputs: Vec<CompactionInputs>,
        output_level: u8,
        output_path_id: u32,
        reason: CompactionReason,
        is_manual: bool,
        grandparents: Vec<Arc<Table>>,
        input_ranges: Vec<KeyRange>,
        snapshots: Option<&[SeqNo]>,
        enable_compression: bool,
    ) -> Compaction {
        debug_assert!(inputs.iter().any(|i| !i.is_empty()));

        let id = self.next_job_id();
        let config = &self.config;

        let start_level = inputs.first().map_or(output_level, |i| i.level);

        let gp_overlap_bytes: u64 = grandparents.iter().map(|t| t.file_size).sum();

        // Only a single table can be re-linked without rewriting
        let single_table = inputs.iter().map(CompactionInputs::len).sum::<usize>() == 1;
        let no_output_overlap = !inputs
            .iter()
            .any(|i| i.level == output_level && !i.is_empty());

        let is_trivial_move = single_table
            && no_output_overlap
            && output_level != start_level
            && input_ranges.is_empty()
            && gp_overlap_bytes <= config.max_grandparent_overlap_bytes;

        let compression =
            compression_for_level(config, version.base_level(), output_level, enable_compression);
        let compression_opts =
            compression_options_for_level(config, output_level, enable_compression);

        Compaction {
            id,
            inputs,
            output_level,
            output_path_id,
            max_output_table_size: config.target_table_size,
            grandparents,
            max_grandparent_overlap_bytes: config.max_grandparent_overlap_bytes,
            compression,
            compression_opts,
            reason,
            is_manual,
            is_trivial_move,
            input_ranges,
            smallest_snapshot: snapshots.and_then(|s| s.iter().min().copied()),
        }
    }
}
