//! In-memory doubles for [`CodeMemory`] and [`ThreadControl`] that record what they were asked
//! to do.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use super::{CodeMemory, PageProtection, ThreadControl};
use crate::error::{Error, Result};
use crate::memory::{MemoryBuffer, ReadMemory};

const PAGE_SIZE: u64 = 0x1000;
const ARENA_SIZE: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Protect(u64, usize, PageProtection),
    Write(u64, usize),
    Flush(u64, usize),
    Suspend(u32),
    Resume(u32),
    SetIp(u32, u64),
}

pub type EventLog = Rc<RefCell<Vec<MockEvent>>>;

/// A code region at `base` followed by a page of executable arena for allocations.
pub struct MockCodeMemory {
    code_end: u64,
    memory: RefCell<MemoryBuffer>,
    pages: RefCell<BTreeMap<u64, PageProtection>>,
    next_alloc: Cell<u64>,
    fail_write: Cell<Option<u64>>,
    freed: RefCell<Vec<u64>>,
    log: EventLog,
}

impl MockCodeMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self::with_log(base, size, EventLog::default())
    }

    /// `base` and `size` must be page aligned.
    pub fn with_log(base: u64, size: usize, log: EventLog) -> Self {
        let code_end = base + size as u64;
        let mut pages = BTreeMap::new();
        for page in (base..code_end).step_by(PAGE_SIZE as usize) {
            pages.insert(page, PageProtection::EXECUTE_READ);
        }
        for page in (code_end..code_end + ARENA_SIZE as u64).step_by(PAGE_SIZE as usize) {
            pages.insert(page, PageProtection::EXECUTE_READ_WRITE);
        }

        Self {
            code_end,
            memory: RefCell::new(MemoryBuffer::zeroed(base, size + ARENA_SIZE)),
            pages: RefCell::new(pages),
            next_alloc: Cell::new(code_end),
            fail_write: Cell::new(None),
            freed: RefCell::new(Vec::new()),
            log,
        }
    }

    /// Place bytes without going through protection checks.
    pub fn load(&self, address: u64, bytes: &[u8]) {
        self.memory.borrow_mut().write(address, bytes);
    }

    pub fn bytes(&self, address: u64, len: usize) -> Vec<u8> {
        self.memory
            .borrow()
            .bytes(address, len)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn protection(&self, address: u64) -> PageProtection {
        self.pages
            .borrow()
            .get(&(address & !(PAGE_SIZE - 1)))
            .copied()
            .unwrap_or(PageProtection::NO_ACCESS)
    }

    /// Make every write covering `address` fail.
    pub fn fail_writes_at(&self, address: u64) {
        self.fail_write.set(Some(address));
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.log.borrow().clone()
    }

    pub fn freed(&self) -> Vec<u64> {
        self.freed.borrow().clone()
    }

    pub fn arena_base(&self) -> u64 {
        self.code_end
    }

    fn pages_of(address: u64, len: usize) -> impl Iterator<Item = u64> {
        let first = address & !(PAGE_SIZE - 1);
        let end = address + len.max(1) as u64;
        (first..end).step_by(PAGE_SIZE as usize)
    }
}

impl CodeMemory for MockCodeMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let memory = self.memory.borrow();
        buf.copy_from_slice(memory.bytes(address, buf.len())?);
        Ok(())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let end = address + bytes.len() as u64;
        if self.fail_write.get().is_some_and(|a| a >= address && a < end) {
            return Err(Error::ProtectFailed {
                address,
                message: "injected write fault".to_string(),
            });
        }
        if Self::pages_of(address, bytes.len()).any(|p| !self.protection(p).is_writable()) {
            return Err(Error::ProtectFailed {
                address,
                message: "page is not writable".to_string(),
            });
        }
        if !self.memory.borrow().contains(address) {
            return Err(Error::MemoryReadFailed {
                address,
                size: bytes.len(),
            });
        }

        self.memory.borrow_mut().write(address, bytes);
        self.log
            .borrow_mut()
            .push(MockEvent::Write(address, bytes.len()));
        Ok(())
    }

    fn protect(
        &self,
        address: u64,
        len: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let previous = self.protection(address);
        if previous == PageProtection::NO_ACCESS {
            return Err(Error::ProtectFailed {
                address,
                message: "address is not mapped".to_string(),
            });
        }
        let mut pages = self.pages.borrow_mut();
        for page in Self::pages_of(address, len) {
            pages.insert(page, protection);
        }
        self.log
            .borrow_mut()
            .push(MockEvent::Protect(address, len, protection));
        Ok(previous)
    }

    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<()> {
        self.log.borrow_mut().push(MockEvent::Flush(address, len));
        Ok(())
    }

    fn allocate_executable(&self, len: usize) -> Result<u64> {
        let address = self.next_alloc.get();
        let next = address + (len as u64).next_multiple_of(0x10);
        if next > self.code_end + ARENA_SIZE as u64 {
            return Err(Error::ThreadControl("mock arena exhausted".to_string()));
        }
        self.next_alloc.set(next);
        Ok(address)
    }

    fn free_executable(&self, address: u64) -> Result<()> {
        self.freed.borrow_mut().push(address);
        Ok(())
    }
}

/// Threads identified by id, each with an instruction pointer.
pub struct MockThreads {
    threads: RefCell<BTreeMap<u32, u64>>,
    fail_suspend: Cell<bool>,
    log: EventLog,
}

impl MockThreads {
    pub fn new(log: EventLog) -> Self {
        Self {
            threads: RefCell::new(BTreeMap::new()),
            fail_suspend: Cell::new(false),
            log,
        }
    }

    pub fn with_thread(self, id: u32, ip: u64) -> Self {
        self.threads.borrow_mut().insert(id, ip);
        self
    }

    pub fn ip(&self, id: u32) -> u64 {
        self.threads.borrow()[&id]
    }

    pub fn set_ip(&self, id: u32, ip: u64) {
        self.threads.borrow_mut().insert(id, ip);
    }

    pub fn fail_suspend(&self) {
        self.fail_suspend.set(true);
    }
}

impl ThreadControl for MockThreads {
    type Thread = u32;

    fn suspend_others(&self) -> Result<Vec<u32>> {
        if self.fail_suspend.get() {
            return Err(Error::ThreadControl("injected suspend fault".to_string()));
        }
        let ids: Vec<u32> = self.threads.borrow().keys().copied().collect();
        self.log
            .borrow_mut()
            .extend(ids.iter().map(|&id| MockEvent::Suspend(id)));
        Ok(ids)
    }

    fn instruction_pointer(&self, thread: &u32) -> Result<u64> {
        self.threads
            .borrow()
            .get(thread)
            .copied()
            .ok_or_else(|| Error::ThreadControl(format!("unknown thread {}", thread)))
    }

    fn set_instruction_pointer(&self, thread: &u32, ip: u64) -> Result<()> {
        self.threads.borrow_mut().insert(*thread, ip);
        self.log.borrow_mut().push(MockEvent::SetIp(*thread, ip));
        Ok(())
    }

    fn resume(&self, thread: u32) {
        self.log.borrow_mut().push(MockEvent::Resume(thread));
    }
}
