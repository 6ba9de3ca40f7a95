// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Composite (map/link) table garbage collection and range materialization

use super::{
    picker::{CompactRangeOutcome, CompactionPicker},
    Compaction, CompactionInputs, CompactionReason, SeparationType,
};
use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key_range::KeyRange,
    InternalKey, SeqNo, SortedRun, Table, TableId, UserKey, Version,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;
use varint_rs::{VarintReader, VarintWriter};

/// One entry of a composite (map) table's element index
///
/// Describes a user key range and the physical tables its data lives in.
/// An element referencing more than one table, or holding less than
/// [`crate::Config::gc_small_element_bytes`] of data, counts as fragmented.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapElement {
    /// Smallest user key of the element
    pub smallest: UserKey,

    /// Largest user key of the element
    pub largest: UserKey,

    /// Bytes of user data the element references
    pub total_size: u64,

    /// Physical tables the element links to
    pub links: Vec<TableId>,
}

impl MapElement {
    /// User key range of the element.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new((self.smallest.clone(), self.largest.clone()))
    }

    /// A fragmented element is worth rewriting: its data is either spread
    /// over multiple physical tables or small enough that indirection costs
    /// more than it saves.
    #[must_use]
    pub fn is_fragmented(&self, small_element_bytes: u64) -> bool {
        self.links.len() > 1 || self.total_size < small_element_bytes
    }
}

impl Encode for MapElement {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK because keys are u16 length max
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16_varint(self.smallest.len() as u16)?;
        writer.write_all(&self.smallest)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16_varint(self.largest.len() as u16)?;
        writer.write_all(&self.largest)?;

        writer.write_u64::<LittleEndian>(self.total_size)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.links.len() as u32)?;

        for id in &self.links {
            writer.write_u64_varint(*id)?;
        }

        Ok(())
    }
}

impl Decode for MapElement {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_len = reader.read_u16_varint()?;
        let mut smallest = vec![0; key_len.into()];
        reader.read_exact(&mut smallest)?;

        let key_len = reader.read_u16_varint()?;
        let mut largest = vec![0; key_len.into()];
        reader.read_exact(&mut largest)?;

        let total_size = reader.read_u64::<LittleEndian>()?;

        let link_count = reader.read_u32_varint()?;
        let mut links = Vec::with_capacity(link_count as usize);

        for _ in 0..link_count {
            links.push(reader.read_u64_varint()?);
        }

        Ok(Self {
            smallest: smallest.into(),
            largest: largest.into(),
            total_size,
            links,
        })
    }
}

/// Reads the next element from a composite table's element index.
///
/// Returns `None` at the end of the index. A torn or corrupt element also
/// returns `None` after logging; the scan stops there because nothing after a
/// corrupt record can be trusted.
pub fn read_map_element<R: Read>(reader: &mut R) -> Option<MapElement> {
    let mut first = [0u8; 1];

    // Probe one byte to tell clean EOF apart from a torn record
    match reader.read(&mut first) {
        Ok(0) => return None,
        Ok(_) => {}
        Err(e) => {
            log::warn!("failed to read map element: {e}");
            return None;
        }
    }

    let mut chained = first.as_slice().chain(reader);

    match MapElement::decode_from(&mut chained) {
        Ok(element) => Some(element),
        Err(e) => {
            log::warn!("corrupt map element, stopping scan: {e}");
            None
        }
    }
}

/// Computes the per-range size quota for splitting work into `groups`
/// balanced chunks.
///
/// `sizes` must be sorted in descending order. The quota is the maximum over
/// all prefixes of `prefix_sum(k) / (k + groups)`: large elements get their
/// own chunk while the remainder is spread evenly.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn get_q(sizes: &[f64], groups: usize) -> f64 {
    debug_assert!(sizes.windows(2).all(|w| w.first() >= w.last()));

    let mut q = 0.0f64;
    let mut prefix = 0.0f64;

    for (k, size) in sizes.iter().enumerate() {
        prefix += size;

        let candidate = prefix / (k + 1 + groups) as f64;

        if candidate > q {
            q = candidate;
        }
    }

    q
}

/// Normalizes a list of key ranges in place: optionally sorts by lower
/// bound, optionally merges overlapping neighbors into one.
pub fn fix_input_range(ranges: &mut Vec<KeyRange>, sort: bool, merge: bool) {
    if sort {
        ranges.sort_by(|a, b| a.min().cmp(b.min()).then(a.max().cmp(b.max())));
    }

    if merge {
        let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());

        for range in ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.overlaps_with(&range) {
                    *last = last.merge(&range);
                    continue;
                }
            }
            merged.push(range);
        }

        *ranges = merged;
    }
}

/// Scans a composite table's element index, returning the total element
/// count and the fragmented subset.
fn scan_elements(table: &Table, small_element_bytes: u64) -> (usize, Vec<MapElement>) {
    let Some(content) = &table.map_content else {
        return (0, Vec::new());
    };

    let mut reader: &[u8] = content;

    let mut total = 0;
    let mut fragmented = Vec::new();

    while let Some(element) = read_map_element(&mut reader) {
        total += 1;

        if element.is_fragmented(small_element_bytes) {
            fragmented.push(element);
        }
    }

    (total, fragmented)
}

impl CompactionPicker {
    /// Picks a garbage collection job: finds the first composite table whose
    /// element index is fragmented beyond
    /// [`crate::Config::gc_fragmentation_ratio`] and schedules it for
    /// same-level materialization, rewriting only the fragmented ranges.
    ///
    /// Returns `None` when no composite table is worth collecting right now.
    #[allow(clippy::cast_precision_loss)]
    pub fn pick_garbage_collection(
        &mut self,
        version: &Version,
        snapshots: &[SeqNo],
    ) -> Option<Compaction> {
        let mut runs: Vec<SortedRun> = version
            .l0()
            .iter()
            .map(|t| SortedRun::from_table(t.clone()))
            .collect();

        for level in 1..version.level_count() {
            let tables = version.level(level);

            if !tables.is_empty() {
                runs.push(SortedRun::from_level(level, tables));
            }
        }

        for run in runs {
            if run.skip_composite || run.being_compacted {
                continue;
            }

            log::trace!("garbage collection probing {run}");

            let candidates: Vec<Arc<Table>> = match &run.table {
                Some(table) => vec![table.clone()],
                None => version.level(run.level).tables.clone(),
            };

            for table in candidates {
                if let Some(compaction) = self.try_collect_table(version, &table, snapshots) {
                    return Some(compaction);
                }
            }
        }

        None
    }

    #[allow(clippy::cast_precision_loss)]
    fn try_collect_table(
        &mut self,
        version: &Version,
        table: &Arc<Table>,
        snapshots: &[SeqNo],
    ) -> Option<Compaction> {
        if !table.is_composite() || table.skip_composite || table.is_being_compacted() {
            return None;
        }

        let (total, fragmented) = scan_elements(table, self.config().gc_small_element_bytes);

        if total == 0 {
            return None;
        }

        let ratio = fragmented.len() as f64 / total as f64;

        if ratio < self.config().gc_fragmentation_ratio {
            return None;
        }

        let level = table.level;

        let mut inputs = CompactionInputs::new(level);
        inputs.push(table.clone());

        if !self.expand_inputs_to_clean_cut(version, &mut inputs, None) {
            return None;
        }

        if inputs.tables.iter().any(|t| t.is_being_compacted()) {
            return None;
        }

        if self.files_range_overlap_with_compaction(std::slice::from_ref(&inputs), level) {
            return None;
        }

        log::debug!(
            "garbage collecting table {} on L{level}: {}/{total} elements fragmented",
            table.id,
            fragmented.len(),
        );

        let mut input_ranges: Vec<KeyRange> =
            fragmented.iter().map(MapElement::key_range).collect();

        fix_input_range(&mut input_ranges, true, true);

        let compaction = self.build_compaction(
            version,
            vec![inputs],
            level,
            0,
            CompactionReason::GarbageCollection,
            false,
            Vec::new(),
            input_ranges,
            Some(snapshots),
            true,
        );

        self.register_compaction(&compaction);
        Some(compaction)
    }

    /// Builds a manual same-level materialization job over `[begin, end]`,
    /// selecting only tables admitted by `separation`.
    ///
    /// For composite inputs, the covered element ranges are split into
    /// balanced, disjoint chunks so the consumer can parallelize the rewrite.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn pick_range_compaction(
        &mut self,
        version: &Version,
        level: u8,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
        separation: SeparationType,
        snapshots: &[SeqNo],
    ) -> CompactRangeOutcome {
        let candidates: Vec<Arc<Table>> = version
            .overlapping_tables_in_bounds(
                level,
                begin.map(|k| &*k.user_key),
                end.map(|k| &*k.user_key),
            )
            .into_iter()
            .filter(|t| separation.admits(t))
            .collect();

        if candidates.is_empty() {
            return CompactRangeOutcome::default();
        }

        if candidates.iter().any(|t| t.is_being_compacted()) {
            return CompactRangeOutcome {
                manual_conflict: true,
                ..CompactRangeOutcome::default()
            };
        }

        let mut inputs = CompactionInputs {
            level,
            tables: candidates,
        };

        // Clean-cut expansion may pull in tables the separation filter would
        // have skipped; correctness beats selection here
        if !self.expand_inputs_to_clean_cut(version, &mut inputs, None) {
            return CompactRangeOutcome {
                manual_conflict: true,
                ..CompactRangeOutcome::default()
            };
        }

        if self.files_range_overlap_with_compaction(std::slice::from_ref(&inputs), level) {
            return CompactRangeOutcome {
                manual_conflict: true,
                ..CompactRangeOutcome::default()
            };
        }

        let input_ranges = self.balanced_element_ranges(&inputs, begin, end);

        let grandparents = {
            let empty = CompactionInputs::new(level);
            self.get_grandparents(version, &inputs, &empty)
        };

        let compaction = self.build_compaction(
            version,
            vec![inputs],
            level,
            0,
            CompactionReason::Manual,
            true,
            grandparents,
            input_ranges,
            Some(snapshots),
            true,
        );

        self.register_compaction(&compaction);

        CompactRangeOutcome {
            compaction: Some(compaction),
            compaction_end: None,
            manual_conflict: false,
        }
    }

    /// Splits the composite elements covered by `[begin, end]` into balanced
    /// disjoint chunks using the quota from [`get_q`].
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn balanced_element_ranges(
        &self,
        inputs: &CompactionInputs,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<KeyRange> {
        let mut elements: Vec<MapElement> = Vec::new();

        for table in &inputs.tables {
            let Some(content) = &table.map_content else {
                continue;
            };

            let mut reader: &[u8] = content;

            while let Some(element) = read_map_element(&mut reader) {
                let past_begin = begin.map_or(true, |b| *element.largest >= *b.user_key);
                let before_end = end.map_or(true, |e| *element.smallest <= *e.user_key);

                if past_begin && before_end {
                    elements.push(element);
                }
            }
        }

        if elements.is_empty() {
            return Vec::new();
        }

        let total_size: u64 = elements.iter().map(|e| e.total_size).sum();

        let groups = (total_size / self.config().max_compaction_bytes.max(1)).max(1) as usize;

        let mut sizes: Vec<f64> = elements.iter().map(|e| e.total_size as f64).collect();
        sizes.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let q = get_q(&sizes, groups);

        elements.sort_by(|a, b| a.smallest.cmp(&b.smallest));

        let mut ranges = Vec::new();
        let mut chunk: Option<KeyRange> = None;
        let mut chunk_size = 0.0f64;

        for element in &elements {
            let range = element.key_range();

            chunk = Some(match chunk {
                Some(c) => c.merge(&range),
                None => range,
            });
            chunk_size += element.total_size as f64;

            if chunk_size >= q {
                if let Some(c) = chunk.take() {
                    ranges.push(c);
                }
                chunk_size = 0.0;
            }
        }

        if let Some(c) = chunk {
            ranges.push(c);
        }

        fix_input_range(&mut ranges, true, true);

        ranges
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{Config, TableKind, ValueType};
    use test_log::test;

    fn element(min: &str, max: &str, total_size: u64, links: &[TableId]) -> MapElement {
        MapElement {
            smallest: min.into(),
            largest: max.into(),
            total_size,
            links: links.to_vec(),
        }
    }

    fn encode_elements(elements: &[MapElement]) -> Vec<u8> {
        let mut buf = Vec::new();
        for e in elements {
            e.encode_into(&mut buf).expect("vec write cannot fail");
        }
        buf
    }

    fn composite_table(id: TableId, level: u8, elements: &[MapElement]) -> Arc<Table> {
        let min = elements.first().expect("non-empty").smallest.clone();
        let max = elements.last().expect("non-empty").largest.clone();

        let mut table = Table::new(
            id,
            level,
            InternalKey::new(min, id, ValueType::Value),
            InternalKey::new(max, id, ValueType::Value),
            1_000,
            1_000,
        );
        table.kind = TableKind::Map;
        table.map_content = Some(encode_elements(elements).into());

        Arc::new(table)
    }

    #[test]
    fn map_element_roundtrip() {
        let before = element("abc", "xyz", 123_456, &[7, 8, 9]);

        let buf = before.encode_into_vec();
        let after = MapElement::decode_from(&mut buf.as_slice()).expect("valid encoding");

        assert_eq!(before, after);
    }

    #[test]
    fn read_map_element_stops_at_clean_eof() {
        let buf = encode_elements(&[
            element("a", "b", 10, &[1]),
            element("c", "d", 20, &[2]),
        ]);

        let mut reader: &[u8] = &buf;

        assert!(read_map_element(&mut reader).is_some());
        assert!(read_map_element(&mut reader).is_some());
        assert!(read_map_element(&mut reader).is_none());
    }

    #[test]
    fn read_map_element_stops_at_torn_record() {
        let mut buf = encode_elements(&[element("a", "b", 10, &[1])]);
        buf.truncate(buf.len() - 1);

        let mut reader: &[u8] = &buf;
        assert!(read_map_element(&mut reader).is_none());
    }

    #[test]
    fn get_q_prefers_heavy_prefix() {
        // k=1: 10/2=5, k=2: 14/3, k=3: 16/4
        let q = get_q(&[10.0, 4.0, 2.0], 1);
        assert!((q - 5.0).abs() < f64::EPSILON);

        assert!((get_q(&[], 1)).abs() < f64::EPSILON);
    }

    #[test]
    fn fix_input_range_sorts_and_merges() {
        let range = |min: &str, max: &str| KeyRange::new((min.into(), max.into()));

        let mut ranges = vec![range("g", "i"), range("a", "c"), range("b", "d")];

        fix_input_range(&mut ranges, true, true);

        assert_eq!(vec![range("a", "d"), range("g", "i")], ranges);
    }

    #[test]
    fn gc_picks_fragmented_composite() {
        let config = Config {
            gc_small_element_bytes: 100,
            gc_fragmentation_ratio: 0.5,
            ..Config::default()
        };

        let mut version = Version::new(3);

        // 2 of 3 elements fragmented (small or multi-link)
        version.insert(composite_table(
            1,
            2,
            &[
                element("a", "c", 10, &[100]),
                element("d", "f", 500, &[101, 102]),
                element("g", "i", 500, &[103]),
            ],
        ));

        let mut picker = CompactionPicker::new(Arc::new(config));

        let compaction = picker
            .pick_garbage_collection(&version, &[])
            .expect("fragmented composite qualifies");

        assert_eq!(CompactionReason::GarbageCollection, compaction.reason());
        assert_eq!(2, compaction.output_level());
        assert_eq!(2, compaction.input_ranges().len());
        assert!(version.table(1).expect("exists").is_being_compacted());

        // Nothing else to collect while the job is running
        assert!(picker.pick_garbage_collection(&version, &[]).is_none());

        picker.release_compaction_files(&compaction, true);
        assert!(!version.table(1).expect("exists").is_being_compacted());
    }

    #[test]
    fn gc_skips_healthy_composite() {
        let config = Config {
            gc_small_element_bytes: 100,
            gc_fragmentation_ratio: 0.5,
            ..Config::default()
        };

        let mut version = Version::new(3);

        version.insert(composite_table(
            1,
            2,
            &[
                element("a", "c", 500, &[100]),
                element("d", "f", 500, &[101]),
            ],
        ));

        let mut picker = CompactionPicker::new(Arc::new(config));

        assert!(picker.pick_garbage_collection(&version, &[]).is_none());
    }

    #[test]
    fn range_compaction_respects_separation() {
        let mut version = Version::new(3);

        version.insert(composite_table(1, 2, &[element("a", "c", 10, &[100])]));

        let mut picker = CompactionPicker::new(Arc::new(Config::default()));

        // Only data tables admitted, and there are none
        let outcome = picker.pick_range_compaction(
            &version,
            2,
            None,
            None,
            SeparationType::ForbidComposite,
            &[],
        );
        assert!(outcome.compaction.is_none());
        assert!(!outcome.manual_conflict);

        let outcome = picker.pick_range_compaction(
            &version,
            2,
            None,
            None,
            SeparationType::RequireComposite,
            &[],
        );

        let compaction = outcome.compaction.expect("composite admitted");
        assert_eq!(CompactionReason::Manual, compaction.reason());
        assert!(compaction.is_manual());
        assert_eq!(1, compaction.input_ranges().len());
    }
}
