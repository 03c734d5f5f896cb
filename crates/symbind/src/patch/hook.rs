//! Function hooks installed in transactions.
//!
//! A hook overwrites the first `prologue_len` bytes of a function with an absolute jump to the
//! detour:
//!
//! ```text
//! target:      FF 25 00 00 00 00 <detour:u64>  CC ...      ; jmp [rip+0]
//! trampoline:  <original prologue bytes>  FF 25 00 00 00 00 <target+prologue_len:u64>
//! ```
//!
//! Calling the trampoline runs the original function. A commit suspends every other thread,
//! writes all patches, moves threads whose instruction pointer is inside a rewritten range and
//! resumes them. A failed write rolls back the writes already applied.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{CodeMemory, apply_patch};
use crate::error::{Error, Result};
use crate::symbols::SymbolTable;

pub const JUMP_ABS_LEN: usize = 14;
const JUMP_ABS_PREFIX: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
const INT3: u8 = 0xCC;

/// `jmp [rip+0]` followed by the 64-bit destination.
pub fn encode_jump(destination: u64) -> [u8; JUMP_ABS_LEN] {
    let mut jump = [0u8; JUMP_ABS_LEN];
    jump[..JUMP_ABS_PREFIX.len()].copy_from_slice(&JUMP_ABS_PREFIX);
    jump[JUMP_ABS_PREFIX.len()..].copy_from_slice(&destination.to_le_bytes());
    jump
}

/// Suspension and instruction pointer access for the other threads of the process.
pub trait ThreadControl {
    type Thread;

    /// Suspend every thread except the calling one.
    fn suspend_others(&self) -> Result<Vec<Self::Thread>>;

    fn instruction_pointer(&self, thread: &Self::Thread) -> Result<u64>;

    fn set_instruction_pointer(&self, thread: &Self::Thread, ip: u64) -> Result<()>;

    fn resume(&self, thread: Self::Thread);
}

/// Resumes the suspended threads when dropped.
struct SuspendedThreads<'t, T: ThreadControl> {
    control: &'t T,
    threads: Vec<T::Thread>,
}

impl<'t, T: ThreadControl> SuspendedThreads<'t, T> {
    fn suspend(control: &'t T) -> Result<Self> {
        let threads = control.suspend_others()?;
        debug!("Suspended {} threads", threads.len());
        Ok(Self { control, threads })
    }
}

impl<T: ThreadControl> Drop for SuspendedThreads<'_, T> {
    fn drop(&mut self) {
        for thread in self.threads.drain(..) {
            self.control.resume(thread);
        }
    }
}

/// One function to hook.
///
/// `prologue_len` must cover whole instructions, be at least [`JUMP_ABS_LEN`] bytes and
/// contain no position-dependent instructions, since the bytes are replayed verbatim from the
/// trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRequest {
    pub name: &'static str,
    pub target: u64,
    pub detour: u64,
    pub prologue_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedHook {
    symbol: &'static str,
    detour: u64,
    prologue_len: usize,
}

/// Hooks to install once the deferred symbols are resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookPlan {
    hooks: Vec<PlannedHook>,
    unwrap_after_install: Vec<&'static str>,
}

impl HookPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(mut self, symbol: &'static str, detour: u64, prologue_len: usize) -> Self {
        self.hooks.push(PlannedHook {
            symbol,
            detour,
            prologue_len,
        });
        self
    }

    /// Remove the hook on `symbol` again in a follow-up transaction after installation.
    pub fn unwrap_after_install(mut self, symbol: &'static str) -> Self {
        self.unwrap_after_install.push(symbol);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Requests for every planned hook whose symbol was resolved.
    pub fn requests(&self, symbols: &SymbolTable) -> Vec<HookRequest> {
        self.hooks
            .iter()
            .filter_map(|hook| match symbols.get(hook.symbol) {
                Some(target) => Some(HookRequest {
                    name: hook.symbol,
                    target,
                    detour: hook.detour,
                    prologue_len: hook.prologue_len,
                }),
                None => {
                    debug!("Skipping hook '{}': symbol not resolved", hook.symbol);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub attached: usize,
    pub detached: usize,
}

#[derive(Debug)]
struct InstalledHook {
    request: HookRequest,
    trampoline: u64,
    original: Vec<u8>,
}

pub struct HookManager<M, T> {
    memory: M,
    threads: T,
    installed: BTreeMap<&'static str, InstalledHook>,
}

impl<M: CodeMemory, T: ThreadControl> HookManager<M, T> {
    pub fn new(memory: M, threads: T) -> Self {
        Self {
            memory,
            threads,
            installed: BTreeMap::new(),
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn threads(&self) -> &T {
        &self.threads
    }

    pub fn transaction(&mut self) -> HookTransaction<'_, M, T> {
        HookTransaction {
            manager: self,
            operations: Vec::new(),
        }
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    /// Trampoline that runs the original function behind the hook `name`.
    pub fn original(&self, name: &str) -> Option<u64> {
        self.installed.get(name).map(|hook| hook.trampoline)
    }

    pub fn installed(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.installed.keys().copied()
    }

    /// Attach every resolvable hook of `plan` in one transaction, then detach the hooks the
    /// plan unwraps in a second one.
    pub fn install_plan(
        &mut self,
        symbols: &SymbolTable,
        plan: &HookPlan,
    ) -> Result<CommitSummary> {
        let requests = plan.requests(symbols);
        let mut summary = CommitSummary::default();

        if !requests.is_empty() {
            summary = requests
                .into_iter()
                .fold(self.transaction(), HookTransaction::attach)
                .commit()?;
        }

        let unwrap: Vec<&'static str> = plan
            .unwrap_after_install
            .iter()
            .copied()
            .filter(|name| self.is_installed(name))
            .collect();
        if !unwrap.is_empty() {
            summary.detached += unwrap
                .into_iter()
                .fold(self.transaction(), HookTransaction::detach)
                .commit()?
                .detached;
        }

        info!(
            "Hooks: {} attached, {} unwrapped",
            summary.attached, summary.detached
        );
        Ok(summary)
    }

    /// Remove every installed hook.
    pub fn detach_all(&mut self) -> Result<CommitSummary> {
        let names: Vec<&'static str> = self.installed().collect();
        if names.is_empty() {
            return Ok(CommitSummary::default());
        }
        names
            .into_iter()
            .fold(self.transaction(), HookTransaction::detach)
            .commit()
    }
}

#[derive(Debug)]
enum Operation {
    Attach(HookRequest),
    Detach(&'static str),
}

#[derive(Debug)]
enum Change {
    Attach(HookRequest),
    Detach,
}

/// A write prepared before any thread is suspended.
#[derive(Debug)]
struct PreparedWrite {
    name: &'static str,
    address: u64,
    trampoline: u64,
    patch: Vec<u8>,
    undo: Vec<u8>,
    change: Change,
}

impl PreparedWrite {
    fn len(&self) -> usize {
        self.patch.len()
    }

    /// Where a thread stopped at `ip` must continue once this write is applied.
    fn relocate(&self, ip: u64) -> Option<u64> {
        let len = self.len() as u64;
        match self.change {
            Change::Attach(_) => {
                let offset = ip.checked_sub(self.address).filter(|&o| o < len)?;
                Some(self.trampoline + offset)
            }
            Change::Detach => {
                let offset = ip
                    .checked_sub(self.trampoline)
                    .filter(|&o| o < len + JUMP_ABS_LEN as u64)?;
                Some(self.address + offset.min(len))
            }
        }
    }
}

/// Pending attach/detach operations, applied atomically by [`HookTransaction::commit`].
pub struct HookTransaction<'h, M, T> {
    manager: &'h mut HookManager<M, T>,
    operations: Vec<Operation>,
}

impl<M: CodeMemory, T: ThreadControl> HookTransaction<'_, M, T> {
    pub fn attach(mut self, request: HookRequest) -> Self {
        self.operations.push(Operation::Attach(request));
        self
    }

    pub fn detach(mut self, name: &'static str) -> Self {
        self.operations.push(Operation::Detach(name));
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Discard the pending operations.
    pub fn abort(self) {
        debug!(
            "Hook transaction aborted ({} operations)",
            self.operations.len()
        );
    }

    pub fn commit(mut self) -> Result<CommitSummary> {
        let mut prepared = Vec::with_capacity(self.operations.len());
        let mut seen = BTreeSet::new();
        for operation in &self.operations {
            match self.prepare(operation, &mut seen) {
                Ok(write) => prepared.push(write),
                Err(e) => {
                    self.release_trampolines(&prepared);
                    return Err(e);
                }
            }
        }

        let memory = &self.manager.memory;
        let suspended = match SuspendedThreads::suspend(&self.manager.threads) {
            Ok(suspended) => suspended,
            Err(e) => {
                self.release_trampolines(&prepared);
                return Err(e);
            }
        };

        let mut applied = 0;
        let mut failure = None;
        for write in &prepared {
            if let Err(e) = apply_patch(memory, write.address, &write.patch) {
                failure = Some(Error::hook(write.name, e.to_string()));
                break;
            }
            applied += 1;
        }

        if let Some(e) = failure {
            for write in prepared[..applied].iter().rev() {
                if let Err(undo) = apply_patch(memory, write.address, &write.undo) {
                    error!("Failed to roll back hook '{}': {}", write.name, undo);
                }
            }
            drop(suspended);
            self.release_trampolines(&prepared);
            return Err(e);
        }

        relocate_threads(suspended.control, &suspended.threads, &prepared);
        drop(suspended);

        let mut summary = CommitSummary::default();
        for write in prepared {
            match write.change {
                Change::Attach(request) => {
                    debug!(
                        "Attached '{}' at {:#x} -> {:#x}",
                        write.name, request.target, request.detour
                    );
                    self.manager.installed.insert(
                        write.name,
                        InstalledHook {
                            request,
                            trampoline: write.trampoline,
                            original: write.undo,
                        },
                    );
                    summary.attached += 1;
                }
                Change::Detach => {
                    debug!("Detached '{}' at {:#x}", write.name, write.address);
                    self.manager.installed.remove(write.name);
                    if let Err(e) = self.manager.memory.free_executable(write.trampoline) {
                        warn!("Failed to free trampoline of '{}': {}", write.name, e);
                    }
                    summary.detached += 1;
                }
            }
        }
        Ok(summary)
    }

    fn prepare(
        &self,
        operation: &Operation,
        seen: &mut BTreeSet<&'static str>,
    ) -> Result<PreparedWrite> {
        let name = match *operation {
            Operation::Attach(request) => request.name,
            Operation::Detach(name) => name,
        };
        if !seen.insert(name) {
            return Err(Error::hook(name, "appears twice in one transaction"));
        }

        match *operation {
            Operation::Attach(request) => self.prepare_attach(request),
            Operation::Detach(name) => {
                let hook = self
                    .manager
                    .installed
                    .get(name)
                    .ok_or_else(|| Error::hook(name, "not installed"))?;
                Ok(PreparedWrite {
                    name,
                    address: hook.request.target,
                    trampoline: hook.trampoline,
                    patch: hook.original.clone(),
                    undo: hook_bytes(&hook.request).to_vec(),
                    change: Change::Detach,
                })
            }
        }
    }

    fn prepare_attach(&self, request: HookRequest) -> Result<PreparedWrite> {
        let name = request.name;
        if self.manager.installed.contains_key(name) {
            return Err(Error::hook(name, "already installed"));
        }
        if request.target == 0 || request.detour == 0 {
            return Err(Error::hook(name, "null target or detour"));
        }
        if request.prologue_len < JUMP_ABS_LEN {
            return Err(Error::hook(
                name,
                format!(
                    "prologue of {} bytes cannot hold a {}-byte jump",
                    request.prologue_len, JUMP_ABS_LEN
                ),
            ));
        }

        let memory = &self.manager.memory;
        let mut original = vec![0u8; request.prologue_len];
        memory.read(request.target, &mut original)?;

        let trampoline = memory.allocate_executable(request.prologue_len + JUMP_ABS_LEN)?;
        let mut code = original.clone();
        code.extend_from_slice(&encode_jump(request.target + request.prologue_len as u64));
        if let Err(e) = memory.write(trampoline, &code) {
            let _ = memory.free_executable(trampoline);
            return Err(e);
        }

        Ok(PreparedWrite {
            name,
            address: request.target,
            trampoline,
            patch: hook_bytes(&request),
            undo: original,
            change: Change::Attach(request),
        })
    }

    fn release_trampolines(&self, prepared: &[PreparedWrite]) {
        for write in prepared {
            if matches!(write.change, Change::Attach(_)) {
                if let Err(e) = self.manager.memory.free_executable(write.trampoline) {
                    warn!("Failed to free trampoline of '{}': {}", write.name, e);
                }
            }
        }
    }
}

fn hook_bytes(request: &HookRequest) -> Vec<u8> {
    let mut bytes = encode_jump(request.detour).to_vec();
    bytes.resize(request.prologue_len, INT3);
    bytes
}

fn relocate_threads<T: ThreadControl>(
    control: &T,
    threads: &[T::Thread],
    writes: &[PreparedWrite],
) {
    for thread in threads {
        let ip = match control.instruction_pointer(thread) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Could not read a suspended thread's context: {}", e);
                continue;
            }
        };
        if let Some(moved) = writes.iter().find_map(|w| w.relocate(ip)) {
            debug!("Moving thread from {:#x} to {:#x}", ip, moved);
            if let Err(e) = control.set_instruction_pointer(thread, moved) {
                error!("Failed to move thread from {:#x}: {}", ip, e);
            }
        }
    }
}
