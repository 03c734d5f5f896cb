use std::collections::BTreeSet;

use tracing::{error, info, warn};

use super::{CodeMemory, apply_patch};
use crate::error::Result;
use crate::symbols::SymbolTable;

/// Source of the user's opt-in feature switches.
pub trait FeatureFlags {
    fn has_feature(&self, name: &str) -> bool;
}

impl FeatureFlags for BTreeSet<String> {
    fn has_feature(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Bytes written over a resolved hook site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePatch {
    pub symbol: &'static str,
    pub bytes: &'static [u8],
}

/// Patches applied together once every listed feature is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePatchGroup {
    pub name: &'static str,
    pub features: &'static [&'static str],
    pub patches: &'static [FeaturePatch],
}

/// Applies feature patch groups at most once each.
#[derive(Debug)]
pub struct FeaturePatcher {
    groups: &'static [FeaturePatchGroup],
    applied: BTreeSet<&'static str>,
}

impl FeaturePatcher {
    pub fn new(groups: &'static [FeaturePatchGroup]) -> Self {
        Self {
            groups,
            applied: BTreeSet::new(),
        }
    }

    pub fn is_applied(&self, group: &str) -> bool {
        self.applied.contains(group)
    }

    /// Apply every enabled group that is not applied yet. Returns the number of groups applied.
    ///
    /// Nothing is written after a critical resolution failure. Groups whose hook sites were
    /// not resolved are skipped and retried on the next call.
    pub fn enable<M: CodeMemory + ?Sized>(
        &mut self,
        symbols: &SymbolTable,
        flags: &dyn FeatureFlags,
        memory: &M,
    ) -> Result<usize> {
        if symbols.failures().critical_failed {
            warn!("Critical symbols are missing, feature patches disabled");
            return Ok(0);
        }

        let mut count = 0;
        for group in self.groups {
            if self.applied.contains(group.name)
                || !group.features.iter().all(|f| flags.has_feature(f))
            {
                continue;
            }

            let sites: Option<Vec<(u64, &[u8])>> = group
                .patches
                .iter()
                .map(|p| symbols.get(p.symbol).map(|address| (address, p.bytes)))
                .collect();
            let Some(sites) = sites else {
                error!("{}: hook sites not available", group.name);
                continue;
            };

            for (address, bytes) in sites {
                apply_patch(memory, address, bytes)?;
            }
            self.applied.insert(group.name);
            info!("Enabled {}", group.name);
            count += 1;
        }
        Ok(count)
    }
}
