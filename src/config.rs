// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{CompressionOptions, CompressionType};

/// Compaction picker configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of levels of the LSM tree (depth of the tree)
    ///
    /// Default = 7
    pub level_count: u8,

    /// Overrides the maximum allowed output level
    ///
    /// Defaults to the last level.
    pub max_output_level_override: Option<u8>,

    /// When the number of tables in L0 reaches this threshold,
    /// the L0 score reaches 1.0 and L0 becomes a compaction candidate
    ///
    /// Default = 4
    ///
    /// Same as `level0_file_num_compaction_trigger` in `RocksDB`.
    pub l0_compaction_trigger: usize,

    /// The target table size of compaction output
    ///
    /// Default = 64 MiB
    ///
    /// Same as `target_file_size_base` in `RocksDB`.
    pub target_table_size: u64,

    /// Size ratio between levels of the LSM tree (a.k.a. fanout, growth rate)
    ///
    /// Default = 10
    pub level_fanout: u8,

    /// Upper bound of bytes a single compaction may read
    ///
    /// Bounds input-side expansion and caps manual range compactions; a
    /// range request that exceeds this is split across multiple invocations.
    ///
    /// Default = 25 * `target_table_size`
    pub max_compaction_bytes: u64,

    /// Grandparent overlap limit
    ///
    /// An output table is cut once it overlaps this many bytes in the level
    /// below the output level, bounding the cost of the *next* compaction.
    ///
    /// Default = 10 * `target_table_size`
    pub max_grandparent_overlap_bytes: u64,

    /// Minimum number of contiguous L0 tables to trigger an intra-L0
    /// compaction
    ///
    /// Default = 4
    pub intra_l0_min_tables: usize,

    /// Maximum aggregate size of an intra-L0 compaction
    ///
    /// Default = 128 MiB
    pub intra_l0_max_bytes: u64,

    /// Composite element size below which a map element counts as fragmented
    ///
    /// Default = 1 MiB
    pub gc_small_element_bytes: u64,

    /// Minimum fraction of fragmented elements for a composite table to be
    /// worth garbage collecting
    ///
    /// Default = 0.5
    pub gc_fragmentation_ratio: f64,

    /// Compression type per output level, relative to the base level;
    /// the last entry repeats for deeper levels
    pub compression_per_level: Vec<CompressionType>,

    /// Compression override for the bottommost level
    pub bottommost_compression: Option<CompressionType>,

    /// Codec parameters for compaction output
    pub compression_opts: CompressionOptions,
}

impl Default for Config {
    fn default() -> Self {
        let target_table_size = /* 64 MiB */ 64 * 1_024 * 1_024;

        Self {
            level_count: 7,
            max_output_level_override: None,
            l0_compaction_trigger: 4,
            target_table_size,
            level_fanout: 10,
            max_compaction_bytes: 25 * target_table_size,
            max_grandparent_overlap_bytes: 10 * target_table_size,
            intra_l0_min_tables: 4,
            intra_l0_max_bytes: /* 128 MiB */ 128 * 1_024 * 1_024,
            gc_small_element_bytes: /* 1 MiB */ 1_024 * 1_024,
            gc_fragmentation_ratio: 0.5,
            compression_per_level: vec![
                CompressionType::None,
                CompressionType::None,
                CompressionType::Lz4,
            ],
            bottommost_compression: None,
            compression_opts: CompressionOptions::default(),
        }
    }
}

impl Config {
    /// Sets the number of levels.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn level_count(mut self, n: u8) -> Self {
        assert!(n > 0);
        self.level_count = n;
        self
    }

    /// Sets the L0 compaction trigger.
    #[must_use]
    pub fn l0_compaction_trigger(mut self, n: usize) -> Self {
        self.l0_compaction_trigger = n;
        self
    }

    /// Sets the target table size.
    #[must_use]
    pub fn target_table_size(mut self, bytes: u64) -> Self {
        self.target_table_size = bytes;
        self
    }

    /// Sets the level fanout.
    #[must_use]
    pub fn level_fanout(mut self, n: u8) -> Self {
        self.level_fanout = n;
        self
    }

    /// Sets the compaction size cap.
    #[must_use]
    pub fn max_compaction_bytes(mut self, bytes: u64) -> Self {
        self.max_compaction_bytes = bytes;
        self
    }

    /// Sets the grandparent overlap limit.
    #[must_use]
    pub fn max_grandparent_overlap_bytes(mut self, bytes: u64) -> Self {
        self.max_grandparent_overlap_bytes = bytes;
        self
    }

    /// Sets the intra-L0 thresholds.
    #[must_use]
    pub fn intra_l0(mut self, min_tables: usize, max_bytes: u64) -> Self {
        self.intra_l0_min_tables = min_tables;
        self.intra_l0_max_bytes = max_bytes;
        self
    }

    /// Sets the per-level compression table.
    #[must_use]
    pub fn compression_per_level(mut self, table: Vec<CompressionType>) -> Self {
        self.compression_per_level = table;
        self
    }

    /// Sets the bottommost compression override.
    #[must_use]
    pub fn bottommost_compression(mut self, c: Option<CompressionType>) -> Self {
        self.bottommost_compression = c;
        self
    }

    /// Sets the maximum output level override.
    #[must_use]
    pub fn max_output_level_override(mut self, level: Option<u8>) -> Self {
        self.max_output_level_override = level;
        self
    }

    /// Returns the maximum allowed output level.
    #[must_use]
    pub fn max_output_level(&self) -> u8 {
        self.max_output_level_override
            .unwrap_or(self.level_count - 1)
            .min(self.level_count - 1)
    }

    /// Byte size at which L1 is considered full.
    #[must_use]
    pub fn level_base_bytes(&self) -> u64 {
        self.target_table_size * self.l0_compaction_trigger as u64
    }

    /// Calculates the level target size.
    ///
    /// L1 = `level_base_bytes`
    ///
    /// L2 = `level_base_bytes * fanout`
    ///
    /// L3 = `level_base_bytes * fanout * fanout`
    /// ...
    ///
    /// # Panics
    ///
    /// Panics if `level` is 0; L0 is scored by file count, not by size.
    #[must_use]
    pub fn level_target_bytes(&self, level: u8) -> u64 {
        assert!(level >= 1, "level target size does not apply to L0");

        let power = u64::from(self.level_fanout).pow(u32::from(level) - 1);

        power * self.level_base_bytes()
    }
}
