// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction picking for log-structured merge trees (LSM-trees/LSMTs).
//!
//! ##### NOTE
//!
//! > This crate only decides *what* to compact, it does not perform any I/O.
//! > It is meant to be embedded into a storage engine that owns the
//! > table files, the manifest and the background worker threads.
//!
//! ##### About
//!
//! An LSM-tree accumulates sorted runs of key-value data on disk.
//! Left alone, read amplification and space usage degrade over time, so runs
//! are periodically merged ("compacted") into fewer, larger runs.
//!
//! This crate implements the *picker* side of that process: given an immutable
//! snapshot of the tree ([`Version`]) and the set of currently running
//! compactions, it either returns "no work" or a fully populated job
//! descriptor ([`Compaction`]) whose input set is guaranteed to be internally
//! consistent:
//!
//! - inputs are expanded to a *clean cut*, so no user key's versions are ever
//!   split between a compacted and a non-compacted table
//! - inputs never intersect a running compaction
//! - grandparent overlap is computed so the job consumer can bound output
//!   table sizes, which bounds the cost of the *next* compaction
//!
//! The caller must hold its own lock around every mutating call; this is made
//! explicit by `&mut self` receivers. The actual merge I/O happens elsewhere,
//! unlocked, which is why per-table `being_compacted` flags (maintained by the
//! running-compaction registry) are the real mutual exclusion mechanism.

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

#[doc(hidden)]
pub type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

pub mod compaction;

#[doc(hidden)]
pub mod coding;

mod compression;
mod config;
mod error;
mod key;
mod key_range;
mod slice;
mod table;
mod value_type;
mod version;

/// Sequence number, a monotonically increasing counter stamped onto every write
pub type SeqNo = u64;

/// User defined key (byte array)
pub type UserKey = Slice;

pub use {
    compaction::{
        AnyPicker, CompactRangeOutcome, Compaction, CompactionInputs, CompactionPicker,
        CompactionReason, CompactionRegistry, CompactionStrategy, LeveledPicker, NullPicker,
        SeparationType,
    },
    compression::{
        compression_for_level, compression_options_for_level, CompressionOptions, CompressionType,
    },
    config::Config,
    error::{Error, Result},
    key::InternalKey,
    key_range::KeyRange,
    slice::Slice,
    table::{SortedRun, Table, TableId, TableKind},
    value_type::ValueType,
    version::{Level, Version},
};
