//! Two-phase driver over a mapping table.
//!
//! The load phase runs while the image initializes and maps the [`Phase::Load`] entries. The
//! post-startup phase runs once the host is up, maps the deferred entries and, unless a
//! critical symbol is missing, installs hooks. It runs at most once.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::image::ImageLayout;
use crate::mapping::{Mapping, Phase};
use crate::memory::ReadMemory;
use crate::patch::{CodeMemory, CommitSummary, HookManager, HookPlan, ThreadControl};
use crate::resolver::{PhaseSummary, SymbolResolver};
use crate::symbols::{FailureFlags, SymbolTable};

pub struct Engine<'a, R: ReadMemory> {
    memory: &'a R,
    layout: ImageLayout,
    table: &'static [Mapping],
    symbols: SymbolTable,
    summaries: Vec<PhaseSummary>,
    post_startup_done: bool,
}

impl<'a, R: ReadMemory> Engine<'a, R> {
    pub fn new(memory: &'a R, layout: ImageLayout, table: &'static [Mapping]) -> Self {
        Self {
            memory,
            layout,
            table,
            symbols: SymbolTable::new(),
            summaries: Vec::new(),
            post_startup_done: false,
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn failures(&self) -> FailureFlags {
        self.symbols.failures()
    }

    /// One summary per phase run so far, in order.
    pub fn summaries(&self) -> &[PhaseSummary] {
        &self.summaries
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn is_post_startup_done(&self) -> bool {
        self.post_startup_done
    }

    fn map_phase(&mut self, phase: Phase) -> Result<&PhaseSummary> {
        let summary = SymbolResolver::new(self.memory, self.layout, &mut self.symbols)
            .map_phase(self.table, phase)?;
        self.summaries.push(summary);
        Ok(&self.summaries[self.summaries.len() - 1])
    }

    /// Map the load-phase entries. Returns `false` when a critical symbol is missing.
    pub fn run_load_phase(&mut self) -> Result<bool> {
        let start = Instant::now();
        let unmapped = self.map_phase(Phase::Load)?.unmapped.len();
        debug!(
            "Load phase took {} ms ({} unmapped)",
            start.elapsed().as_millis(),
            unmapped
        );
        Ok(!self.failures().critical_failed)
    }

    /// Run the load phase again over a reloaded image.
    ///
    /// Symbols found again are overwritten. Symbols that are not found keep their previous
    /// address, and failure flags stay raised. The post-startup latch is untouched.
    pub fn reload(&mut self, memory: &'a R, layout: ImageLayout) -> Result<bool> {
        info!(
            "Reloading image at {:#x} (was {:#x})",
            layout.base_address(),
            self.layout.base_address()
        );
        self.memory = memory;
        self.layout = layout;
        self.run_load_phase()
    }

    /// Map the deferred entries and hand the symbols to `install`.
    ///
    /// `install` is skipped after a critical failure. Later calls do nothing and return the
    /// critical state of the first one.
    pub fn run_post_startup<F>(&mut self, install: F) -> Result<bool>
    where
        F: FnOnce(&SymbolTable) -> Result<()>,
    {
        if self.post_startup_done {
            return Ok(!self.failures().critical_failed);
        }

        let start = Instant::now();
        self.map_phase(Phase::PostStartup)?;
        self.post_startup_done = true;

        let ok = !self.failures().critical_failed;
        if ok {
            install(&self.symbols)?;
        } else {
            warn!("Critical symbols are missing, hooks will not be installed");
        }

        info!(
            "Post-startup phase took {} ms, {} symbols resolved",
            start.elapsed().as_millis(),
            self.symbols.len()
        );
        Ok(ok)
    }

    /// [`Engine::run_post_startup`] installing `plan` through `hooks`.
    pub fn run_post_startup_with_hooks<M, T>(
        &mut self,
        hooks: &mut HookManager<M, T>,
        plan: &HookPlan,
    ) -> Result<bool>
    where
        M: CodeMemory,
        T: ThreadControl,
    {
        self.run_post_startup(|symbols| hooks.install_plan(symbols, plan).map(|_| ()))
    }

    /// Remove every hook installed through `hooks`.
    pub fn shutdown<M, T>(&self, hooks: &mut HookManager<M, T>) -> Result<CommitSummary>
    where
        M: CodeMemory,
        T: ThreadControl,
    {
        hooks.detach_all()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::Error;
    use crate::image::AddressRange;
    use crate::mapping::{FailurePolicy, Target};
    use crate::memory::MemoryBuffer;
    use crate::patch::mock::{EventLog, MockCodeMemory, MockThreads};
    use crate::pattern::PatternError;

    const BASE: u64 = 0x1_4000_0000;
    const CODE: u64 = BASE + 0x1000;
    const HIT: u64 = CODE + 0x100;

    const PROLOGUE: [u8; 15] = [
        0x48, 0x89, 0x5C, 0x24, 0x08, 0x48, 0x89, 0x74, 0x24, 0x10, 0x57, 0x48, 0x83, 0xEC,
        0x20,
    ];

    static TABLE: &[Mapping] = &[
        Mapping::new("anchor", "CC CC CC ").target(Target::absolute(0).store("anchor")),
        Mapping::new("hit", "48 89 5C 24 08 48 89 74 24 10 57 48 83 EC 20 ")
            .target(Target::absolute(0).store("hit"))
            .phase(Phase::PostStartup),
    ];

    static TABLE_MISSING_CRITICAL: &[Mapping] = &[
        Mapping::new("anchor", "0F 0B 0F 0B ")
            .target(Target::absolute(0).store("anchor"))
            .policy(FailurePolicy::Critical),
        Mapping::new("hit", "48 89 5C 24 08 48 89 74 24 10 57 48 83 EC 20 ")
            .target(Target::absolute(0).store("hit"))
            .phase(Phase::PostStartup),
    ];

    static TABLE_MALFORMED: &[Mapping] = &[Mapping::new("bad", "4").target(Target::absolute(0))];

    fn layout() -> ImageLayout {
        ImageLayout::new(
            AddressRange::new(BASE, 0x2000),
            AddressRange::new(CODE, 0x1000),
        )
        .unwrap()
    }

    fn image() -> MemoryBuffer {
        MemoryBuffer::zeroed(BASE, 0x2000)
            .with(CODE + 0x20, &[0xCC, 0xCC, 0xCC])
            .with(HIT, &PROLOGUE)
    }

    fn hooks() -> HookManager<MockCodeMemory, MockThreads> {
        let log = EventLog::default();
        let memory = MockCodeMemory::with_log(CODE, 0x1000, log.clone());
        memory.load(HIT, &PROLOGUE);
        HookManager::new(memory, MockThreads::new(log))
    }

    #[test]
    fn test_phases_map_their_own_entries() {
        let memory = image();
        let mut engine = Engine::new(&memory, layout(), TABLE);

        assert!(engine.run_load_phase().unwrap());
        assert_eq!(engine.symbols().get("anchor"), Some(CODE + 0x20));
        assert!(!engine.symbols().contains("hit"));

        let installs = Cell::new(0);
        let ok = engine
            .run_post_startup(|symbols| {
                assert_eq!(symbols.get("hit"), Some(HIT));
                installs.set(installs.get() + 1);
                Ok(())
            })
            .unwrap();
        assert!(ok);
        assert!(engine.is_post_startup_done());
        assert_eq!(engine.summaries().len(), 2);
        assert_eq!(engine.summaries()[1].phase, Phase::PostStartup);
        assert_eq!(engine.summaries()[1].mapped, 1);

        assert!(engine
            .run_post_startup(|_| {
                installs.set(installs.get() + 1);
                Ok(())
            })
            .unwrap());
        assert_eq!(installs.get(), 1);
    }

    #[test]
    fn test_critical_failure_gates_installation() {
        let memory = image();
        let mut engine = Engine::new(&memory, layout(), TABLE_MISSING_CRITICAL);

        assert!(!engine.run_load_phase().unwrap());
        let ok = engine
            .run_post_startup(|_| panic!("hooks must not be installed"))
            .unwrap();
        assert!(!ok);
        assert_eq!(engine.symbols().get("hit"), Some(HIT));
        assert!(engine.failures().critical_failed);
        assert_eq!(engine.summaries()[0].unmapped, vec!["anchor"]);
        assert!(!engine.run_post_startup(|_| Ok(())).unwrap());
    }

    #[test]
    fn test_hooks_installed_and_removed() {
        let memory = image();
        let mut engine = Engine::new(&memory, layout(), TABLE);
        let mut hooks = hooks();
        let plan = HookPlan::new().hook("hit", 0x7FF0_0000_1000, PROLOGUE.len());

        assert!(engine.run_load_phase().unwrap());
        assert!(engine.run_post_startup_with_hooks(&mut hooks, &plan).unwrap());
        assert!(hooks.is_installed("hit"));
        assert_ne!(hooks.memory().bytes(HIT, PROLOGUE.len()), PROLOGUE);

        assert_eq!(engine.shutdown(&mut hooks).unwrap().detached, 1);
        assert_eq!(hooks.memory().bytes(HIT, PROLOGUE.len()), PROLOGUE);
    }

    #[test]
    fn test_reload_remaps_load_entries() {
        let memory = image();
        let mut engine = Engine::new(&memory, layout(), TABLE);
        assert!(engine.run_load_phase().unwrap());
        assert!(engine.run_post_startup(|_| Ok(())).unwrap());

        let moved = MemoryBuffer::zeroed(BASE, 0x2000).with(CODE + 0x40, &[0xCC, 0xCC, 0xCC]);
        assert!(engine.reload(&moved, layout()).unwrap());
        assert_eq!(engine.symbols().get("anchor"), Some(CODE + 0x40));
        assert_eq!(engine.symbols().get("hit"), Some(HIT));
        assert_eq!(engine.summaries().len(), 3);
        assert_eq!(engine.summaries()[2].phase, Phase::Load);
        assert!(engine.is_post_startup_done());
    }

    #[test]
    fn test_malformed_table_is_an_error() {
        let memory = image();
        let mut engine = Engine::new(&memory, layout(), TABLE_MALFORMED);
        assert!(matches!(
            engine.run_load_phase(),
            Err(Error::Pattern(PatternError::InvalidLength(1)))
        ));
    }
}
