// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Config;

/// Compression algorithm to use for compaction output
///
/// The picker only *selects* the codec; running it is the job consumer's
/// responsibility.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    Lz4,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",
                Self::Lz4 => "lz4",
            }
        )
    }
}

/// Codec parameters for compaction output
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompressionOptions {
    /// Codec effort level
    pub level: u8,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self { level: 1 }
    }
}

/// Looks up the compression type for a compaction output level.
///
/// `enable_compression = false` forces an uncompressed output regardless of
/// configuration, e.g. for a one-off first-time bulk load.
#[must_use]
pub fn compression_for_level(
    config: &Config,
    base_level: u8,
    level: u8,
    enable_compression: bool,
) -> CompressionType {
    if !enable_compression {
        return CompressionType::None;
    }

    if let Some(c) = config.bottommost_compression {
        if level >= config.max_output_level() {
            return c;
        }
    }

    if config.compression_per_level.is_empty() {
        return CompressionType::default();
    }

    // Levels below the base level cannot receive compaction output, so the
    // per-level table is addressed relative to the base level.
    let idx = if level == 0 {
        0
    } else {
        usize::from(level.saturating_sub(base_level).saturating_add(1))
    };

    let idx = idx.min(config.compression_per_level.len() - 1);

    config
        .compression_per_level
        .get(idx)
        .copied()
        .unwrap_or_default()
}

/// Looks up the codec parameters for a compaction output level.
#[must_use]
pub fn compression_options_for_level(
    config: &Config,
    _level: u8,
    enable_compression: bool,
) -> CompressionOptions {
    if enable_compression {
        config.compression_opts
    } else {
        CompressionOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_per_level_lookup() {
        let config = Config::default().compression_per_level(vec![
            CompressionType::None,
            CompressionType::None,
            CompressionType::Lz4,
        ]);

        assert_eq!(CompressionType::None, compression_for_level(&config, 1, 0, true));
        assert_eq!(CompressionType::None, compression_for_level(&config, 1, 1, true));
        assert_eq!(CompressionType::Lz4, compression_for_level(&config, 1, 2, true));

        // Table is clamped for deep levels
        assert_eq!(CompressionType::Lz4, compression_for_level(&config, 1, 6, true));
    }

    #[test]
    fn compression_disabled_overrides() {
        let config = Config::default()
            .compression_per_level(vec![CompressionType::Lz4])
            .bottommost_compression(Some(CompressionType::Lz4));

        assert_eq!(CompressionType::None, compression_for_level(&config, 1, 6, false));
    }

    #[test]
    fn compression_bottommost() {
        let config = Config::default()
            .compression_per_level(vec![CompressionType::None])
            .bottommost_compression(Some(CompressionType::Lz4));

        let bottom = config.max_output_level();
        assert_eq!(CompressionType::Lz4, compression_for_level(&config, 1, bottom, true));
        assert_eq!(
            CompressionType::None,
            compression_for_level(&config, 1, bottom - 1, true)
        );
    }
}
