// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::TableId;

/// Represents errors that can occur while validating compaction inputs
///
/// "No compaction available right now" and "conflicts with a running
/// compaction" are *not* errors; those are signaled through return values
/// (`Option`, [`crate::CompactRangeOutcome`]). Errors are reserved for
/// administrative requests that cannot be reconciled into a valid job.
#[derive(Debug)]
pub enum Error {
    /// A table ID was passed that does not exist in the given version
    UnknownTable(TableId),

    /// A table was explicitly requested that is part of a running compaction
    TableBeingCompacted(TableId),

    /// The requested output level exceeds the maximum allowed output level
    InvalidOutputLevel {
        /// Requested output level
        requested: u8,

        /// Maximum allowed output level
        max: u8,
    },

    /// An input table sits on a level below the requested output level
    InputLevelBelowOutput {
        /// Table in question
        table: TableId,

        /// Level the table lives on
        level: u8,

        /// Requested output level
        output_level: u8,
    },

    /// The set of input files is empty
    EmptyInputSet,

    /// The output level does not cover the key range of the upper-level
    /// inputs; the missing table would have to be added, changing the
    /// caller's explicit file selection
    InconsistentOverlap {
        /// Table that overlaps the inputs but was not selected
        table: TableId,

        /// Level the table lives on
        level: u8,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactionError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Compaction picker result
pub type Result<T> = std::result::Result<T, Error>;
