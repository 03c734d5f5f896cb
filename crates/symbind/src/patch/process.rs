//! [`CodeMemory`] and [`ThreadControl`] for the current process.

use std::ffi::c_void;

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{
    CONTEXT, CONTEXT_CONTROL_AMD64, FlushInstructionCache, GetThreadContext, SetThreadContext,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread,
    SuspendThread, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};
use tracing::warn;

use super::{CodeMemory, PageProtection, ThreadControl};
use crate::error::{Error, Result};

/// The process this library is loaded into.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcess;

/// A suspended thread of the current process.
#[derive(Debug)]
pub struct LocalThread {
    id: u32,
    handle: HANDLE,
}

impl CodeMemory for LocalProcess {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        // SAFETY: callers only pass resolved addresses inside mapped code.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        // SAFETY: the destination was made writable by a WriteGuard or is our own allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn protect(
        &self,
        address: u64,
        len: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let mut previous = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtect(
                address as *const c_void,
                len,
                PAGE_PROTECTION_FLAGS(protection.0),
                &mut previous,
            )
        }
        .map_err(|e| Error::ProtectFailed {
            address,
            message: e.to_string(),
        })?;
        Ok(PageProtection(previous.0))
    }

    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<()> {
        unsafe {
            FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as *const c_void),
                len,
            )
        }?;
        Ok(())
    }

    fn allocate_executable(&self, len: usize) -> Result<u64> {
        let address = unsafe {
            VirtualAlloc(
                None,
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(Error::ProtectFailed {
                address: 0,
                message: format!("VirtualAlloc of {} bytes failed", len),
            });
        }
        Ok(address as u64)
    }

    fn free_executable(&self, address: u64) -> Result<()> {
        unsafe { VirtualFree(address as *mut c_void, 0, MEM_RELEASE) }?;
        Ok(())
    }
}

impl ThreadControl for LocalProcess {
    type Thread = LocalThread;

    fn suspend_others(&self) -> Result<Vec<LocalThread>> {
        let process_id = unsafe { GetCurrentProcessId() };
        let current = unsafe { GetCurrentThreadId() };
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
            .map_err(|e| Error::ThreadControl(format!("CreateToolhelp32Snapshot: {}", e)))?;

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut threads = Vec::new();
        let mut next = unsafe { Thread32First(snapshot, &mut entry) };
        while next.is_ok() {
            if entry.th32OwnerProcessID == process_id && entry.th32ThreadID != current {
                let access = THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT;
                match unsafe { OpenThread(access, false, entry.th32ThreadID) } {
                    Ok(handle) => {
                        if unsafe { SuspendThread(handle) } == u32::MAX {
                            warn!("Failed to suspend thread {}", entry.th32ThreadID);
                            let _ = unsafe { CloseHandle(handle) };
                        } else {
                            threads.push(LocalThread {
                                id: entry.th32ThreadID,
                                handle,
                            });
                        }
                    }
                    Err(e) => warn!("Failed to open thread {}: {}", entry.th32ThreadID, e),
                }
            }
            next = unsafe { Thread32Next(snapshot, &mut entry) };
        }

        let _ = unsafe { CloseHandle(snapshot) };
        Ok(threads)
    }

    fn instruction_pointer(&self, thread: &LocalThread) -> Result<u64> {
        let context = thread_context(thread)?;
        Ok(context.Rip)
    }

    fn set_instruction_pointer(&self, thread: &LocalThread, ip: u64) -> Result<()> {
        let mut context = thread_context(thread)?;
        context.Rip = ip;
        unsafe { SetThreadContext(thread.handle, &context) }
            .map_err(|e| Error::ThreadControl(format!("SetThreadContext({}): {}", thread.id, e)))
    }

    fn resume(&self, thread: LocalThread) {
        unsafe {
            if ResumeThread(thread.handle) == u32::MAX {
                warn!("Failed to resume thread {}", thread.id);
            }
            let _ = CloseHandle(thread.handle);
        }
    }
}

fn thread_context(thread: &LocalThread) -> Result<CONTEXT> {
    let mut context = CONTEXT {
        ContextFlags: CONTEXT_CONTROL_AMD64,
        ..Default::default()
    };
    unsafe { GetThreadContext(thread.handle, &mut context) }
        .map_err(|e| Error::ThreadControl(format!("GetThreadContext({}): {}", thread.id, e)))?;
    Ok(context)
}
