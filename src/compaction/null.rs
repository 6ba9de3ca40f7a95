// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{picker::CompactionPicker, Compaction, CompactionStrategy};
use crate::{Config, SeqNo, Version};
use std::sync::Arc;

/// Disables automatic background compactions
///
/// Manual requests through [`CompactionStrategy::inner_mut`] still work; only
/// the scheduler-driven picking is turned off. Useful for bulk ingestion and
/// for tests that need a frozen tree shape.
pub struct NullPicker {
    inner: CompactionPicker,
}

impl NullPicker {
    /// Creates a new non-strategy.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: CompactionPicker::new(config),
        }
    }
}

impl CompactionStrategy for NullPicker {
    fn name(&self) -> &'static str {
        "NullPicker"
    }

    fn pick_compaction(&mut self, _: &Version, _: &[SeqNo]) -> Option<Compaction> {
        None
    }

    fn needs_compaction(&self, _: &Version) -> bool {
        false
    }

    fn inner(&self) -> &CompactionPicker {
        &self.inner
    }

    fn inner_mut(&mut self) -> &mut CompactionPicker {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InternalKey, Table, ValueType};
    use test_log::test;

    #[test]
    fn null_never_picks() {
        let mut version = Version::new(3);

        for id in 0..10 {
            version.insert(Arc::new(Table::new(
                id,
                0,
                InternalKey::new("a", id, ValueType::Value),
                InternalKey::new("z", id, ValueType::Value),
                1_000,
                1_000,
            )));
        }

        let config = Arc::new(Config::default());
        version.compute_compaction_scores(&config);

        let mut picker = NullPicker::new(config);

        assert!(!picker.needs_compaction(&version));
        assert!(picker.pick_compaction(&version, &[]).is_none());
    }
}
