use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::mapping::FailurePolicy;

/// Failure state accumulated while resolving a table.
///
/// Flags only ever go from `false` to `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureFlags {
    pub init_failed: bool,
    pub critical_failed: bool,
}

impl FailureFlags {
    pub fn record(&mut self, policy: FailurePolicy) {
        match policy {
            FailurePolicy::AllowFail => {}
            FailurePolicy::Report => self.init_failed = true,
            FailurePolicy::Critical => {
                self.init_failed = true;
                self.critical_failed = true;
            }
        }
    }
}

/// Slot contents of a [`SymbolTable`] at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot(BTreeMap<&'static str, u64>);

/// Named addresses resolved from the host image.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolTable {
    symbols: BTreeMap<&'static str, u64>,
    failures: FailureFlags,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `address` under `name`, returning the address it replaced.
    pub fn insert(&mut self, name: &'static str, address: u64) -> Option<u64> {
        let previous = self.symbols.insert(name, address);
        if let Some(previous) = previous.filter(|&p| p != address) {
            debug!("{}: {:#x} replaced by {:#x}", name, previous, address);
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.symbols.iter().map(|(&name, &address)| (name, address))
    }

    pub fn failures(&self) -> FailureFlags {
        self.failures
    }

    pub fn record_failure(&mut self, policy: FailurePolicy) {
        self.failures.record(policy);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.symbols.clone())
    }

    /// Put the slots back to `snapshot`. Failure flags are kept.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.symbols = snapshot.0;
    }
}
