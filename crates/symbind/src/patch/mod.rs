//! Writing to code pages.
//!
//! Every write goes through a [`WriteGuard`], which makes the covered pages writable and
//! restores their previous protection when it is released or dropped.

mod feature;
mod hook;
#[cfg(test)]
pub(crate) mod mock;
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
mod process;

pub use feature::{FeatureFlags, FeaturePatch, FeaturePatchGroup, FeaturePatcher};
pub use hook::{
    CommitSummary, HookManager, HookPlan, HookRequest, HookTransaction, JUMP_ABS_LEN,
    ThreadControl, encode_jump,
};
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub use process::{LocalProcess, LocalThread};

use tracing::{debug, error};

use crate::error::{Error, Result};

/// Page protection constant, using the Win32 `PAGE_*` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageProtection(pub u32);

impl PageProtection {
    pub const NO_ACCESS: Self = Self(0x01);
    pub const READ_ONLY: Self = Self(0x02);
    pub const READ_WRITE: Self = Self(0x04);
    pub const EXECUTE: Self = Self(0x10);
    pub const EXECUTE_READ: Self = Self(0x20);
    pub const EXECUTE_READ_WRITE: Self = Self(0x40);

    pub fn is_writable(self) -> bool {
        self == Self::READ_WRITE || self == Self::EXECUTE_READ_WRITE
    }
}

/// Writable access to the code of a process.
pub trait CodeMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Raw copy. Callers make the pages writable first.
    fn write(&self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Change the protection of `[address, address + len)` and return the previous one.
    fn protect(&self, address: u64, len: usize, protection: PageProtection)
    -> Result<PageProtection>;

    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<()>;

    /// Allocate `len` bytes of readable, writable and executable memory.
    fn allocate_executable(&self, len: usize) -> Result<u64>;

    fn free_executable(&self, address: u64) -> Result<()>;
}

impl<M: CodeMemory + ?Sized> CodeMemory for &M {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        (**self).write(address, bytes)
    }

    fn protect(
        &self,
        address: u64,
        len: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        (**self).protect(address, len, protection)
    }

    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<()> {
        (**self).flush_instruction_cache(address, len)
    }

    fn allocate_executable(&self, len: usize) -> Result<u64> {
        (**self).allocate_executable(len)
    }

    fn free_executable(&self, address: u64) -> Result<()> {
        (**self).free_executable(address)
    }
}

/// Scoped write permission over a code range.
pub struct WriteGuard<'m, M: CodeMemory + ?Sized> {
    memory: &'m M,
    address: u64,
    len: usize,
    previous: PageProtection,
    released: bool,
}

impl<'m, M: CodeMemory + ?Sized> WriteGuard<'m, M> {
    pub fn acquire(memory: &'m M, address: u64, len: usize) -> Result<Self> {
        let previous = memory.protect(address, len, PageProtection::EXECUTE_READ_WRITE)?;
        Ok(Self {
            memory,
            address,
            len,
            previous,
            released: false,
        })
    }

    /// Write `bytes` at `offset` from the start of the guarded range.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.len {
            return Err(Error::ProtectFailed {
                address: self.address + offset as u64,
                message: format!("write of {} bytes exceeds the guarded range", bytes.len()),
            });
        }
        self.memory.write(self.address + offset as u64, bytes)
    }

    /// Restore the previous protection, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.memory
            .protect(self.address, self.len, self.previous)
            .map(|_| ())
    }
}

impl<M: CodeMemory + ?Sized> Drop for WriteGuard<'_, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.memory.protect(self.address, self.len, self.previous) {
            error!(
                "Failed to restore protection at {:#x} (+{:#x}): {}",
                self.address, self.len, e
            );
        }
    }
}

/// Overwrite code at `address` with `bytes`.
pub fn apply_patch<M: CodeMemory + ?Sized>(memory: &M, address: u64, bytes: &[u8]) -> Result<()> {
    let guard = WriteGuard::acquire(memory, address, bytes.len())?;
    guard.write(0, bytes)?;
    memory.flush_instruction_cache(address, bytes.len())?;
    guard.release()?;
    debug!("Patched {} bytes at {:#x}", bytes.len(), address);
    Ok(())
}
