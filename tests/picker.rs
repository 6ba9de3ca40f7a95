// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use lsm_compaction::{
    coding::Encode,
    compaction::MapElement,
    AnyPicker, Compaction, CompactionReason, CompactionStrategy, Config, InternalKey,
    LeveledPicker, NullPicker, Table, TableKind, ValueType, Version,
};
use rand::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use test_log::test;

fn table(id: u64, level: u8, min: &str, max: &str, size: u64) -> Arc<Table> {
    Arc::new(Table::new(
        id,
        level,
        InternalKey::new(min, id, ValueType::Value),
        InternalKey::new(max, id, ValueType::Value),
        size,
        size,
    ))
}

#[test]
fn leveled_lifecycle() {
    let config = Arc::new(
        Config::default()
            .level_count(4)
            .l0_compaction_trigger(4)
            .target_table_size(64),
    );

    let mut version = Version::new(4);

    for id in 0..4 {
        version.insert(table(id, 0, "a", "z", 64));
    }

    version.compute_compaction_scores(&config);

    let mut picker: AnyPicker = LeveledPicker::new(config.clone()).into();
    assert_eq!("LeveledPicker", picker.name());
    assert!(picker.needs_compaction(&version));

    let compaction = picker
        .pick_compaction(&version, &[])
        .expect("L0 is at trigger");

    assert_eq!(CompactionReason::L0Files, compaction.reason());
    assert!(version
        .l0()
        .iter()
        .all(|t| t.is_being_compacted()));

    // While the job runs, there is nothing else to pick
    version.compute_compaction_scores(&config);
    assert!(picker.pick_compaction(&version, &[]).is_none());

    picker
        .inner_mut()
        .release_compaction_files(&compaction, true);

    assert!(picker.inner().registry().is_empty());
    assert!(version.l0().iter().all(|t| !t.is_being_compacted()));

    // Eligible again after release
    version.compute_compaction_scores(&config);
    assert!(picker.pick_compaction(&version, &[]).is_some());
}

#[test]
fn manual_compaction_with_disabled_background() {
    let config = Arc::new(Config::default());

    let mut version = Version::new(4);
    version.insert(table(1, 1, "a", "c", 100));
    version.insert(table(2, 1, "d", "f", 100));

    version.compute_compaction_scores(&config);

    let mut picker: AnyPicker = NullPicker::new(config).into();

    assert!(!picker.needs_compaction(&version));
    assert!(picker.pick_compaction(&version, &[]).is_none());

    // Background compaction is off, but manual requests still go through
    let outcome = picker
        .inner_mut()
        .compact_range(&version, 1, 2, 0, None, None);

    assert!(!outcome.manual_conflict);
    assert!(outcome.compaction_end.is_none());

    let compaction = outcome.compaction.expect("range is compactable");
    assert_eq!(CompactionReason::Manual, compaction.reason());
    assert!(compaction.is_manual());
    assert_eq!(2, compaction.num_input_tables());

    picker
        .inner_mut()
        .release_compaction_files(&compaction, true);
    assert!(picker.inner().registry().is_empty());
}

#[test]
fn manual_conflict_leaves_registry_untouched() {
    let config = Arc::new(Config::default());

    let mut version = Version::new(4);
    version.insert(table(1, 1, "a", "z", 100));

    let mut picker: AnyPicker = NullPicker::new(config).into();

    let first = picker
        .inner_mut()
        .compact_range(&version, 1, 2, 0, None, None)
        .compaction
        .expect("nothing running yet");

    let before = picker.inner().registry().len();

    let second = picker
        .inner_mut()
        .compact_range(&version, 1, 2, 0, None, None);

    assert!(second.compaction.is_none());
    assert!(second.manual_conflict);
    assert_eq!(before, picker.inner().registry().len());

    picker.inner_mut().release_compaction_files(&first, true);
}

#[test]
fn garbage_collection_through_strategy() {
    let config = Arc::new(Config {
        gc_small_element_bytes: 100,
        gc_fragmentation_ratio: 0.5,
        ..Config::default()
    });

    let elements = [
        MapElement {
            smallest: "a".into(),
            largest: "c".into(),
            total_size: 10,
            links: vec![100],
        },
        MapElement {
            smallest: "d".into(),
            largest: "f".into(),
            total_size: 10,
            links: vec![101, 102],
        },
    ];

    let mut buf = Vec::new();
    for e in &elements {
        e.encode_into(&mut buf).expect("vec write cannot fail");
    }

    let mut composite = Table::new(
        9,
        2,
        InternalKey::new("a", 9, ValueType::Value),
        InternalKey::new("f", 9, ValueType::Value),
        1_000,
        1_000,
    );
    composite.kind = TableKind::Map;
    composite.map_content = Some(buf.into());

    let mut version = Version::new(4);
    version.insert(Arc::new(composite));
    version.compute_compaction_scores(&config);

    let mut picker: AnyPicker = LeveledPicker::new(config).into();
    assert!(picker.needs_compaction(&version), "composite is collectable");

    let compaction = picker
        .pick_compaction(&version, &[])
        .expect("fragmented composite");

    assert_eq!(CompactionReason::GarbageCollection, compaction.reason());
    assert_eq!(2, compaction.start_level());
    assert_eq!(2, compaction.output_level());
    assert!(!compaction.input_ranges().is_empty());

    picker
        .inner_mut()
        .release_compaction_files(&compaction, true);
}

#[test]
fn random_workload_never_double_books() {
    let mut rng = rand::rng();

    let config = Arc::new(
        Config::default()
            .level_count(5)
            .l0_compaction_trigger(2)
            .target_table_size(10),
    );

    let mut version = Version::new(5);
    let mut id = 0u64;

    for level in 0..4u8 {
        for _ in 0..rng.random_range(2..10usize) {
            let a: u8 = rng.random_range(b'a'..=b'y');
            let b: u8 = rng.random_range(a..=b'z');

            version.insert(Arc::new(Table::new(
                id,
                level,
                InternalKey::new(vec![a], id, ValueType::Value),
                InternalKey::new(vec![b], id, ValueType::Value),
                rng.random_range(1..1_000),
                rng.random_range(1..1_000),
            )));

            id += 1;
        }
    }

    let mut picker = LeveledPicker::new(config.clone());
    let mut outstanding: Vec<Compaction> = Vec::new();

    for _ in 0..200 {
        version.compute_compaction_scores(&config);

        if rng.random_bool(0.6) {
            if let Some(c) = picker.pick_compaction(&version, &[]) {
                outstanding.push(c);
            }
        } else if !outstanding.is_empty() {
            let idx = rng.random_range(0..outstanding.len());
            let c = outstanding.swap_remove(idx);
            picker
                .inner_mut()
                .release_compaction_files(&c, rng.random_bool(0.9));
        }

        // The busy tables must be exactly the union of the outstanding jobs'
        // inputs, and no table may be claimed by two jobs
        let mut expected = BTreeSet::new();

        for c in &outstanding {
            for t in c.input_tables() {
                assert!(expected.insert(t.id), "table {} claimed by two jobs", t.id);
            }
        }

        let actual: BTreeSet<u64> = version
            .iter_levels()
            .flat_map(|l| l.iter())
            .filter(|t| t.is_being_compacted())
            .map(|t| t.id)
            .collect();

        assert_eq!(expected, actual);
    }

    for c in &outstanding {
        picker.inner_mut().release_compaction_files(c, true);
    }

    assert!(picker.inner().registry().is_empty());
}
