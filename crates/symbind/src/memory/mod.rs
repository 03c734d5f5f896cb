mod buffer;
mod local;

pub use buffer::MemoryBuffer;
pub use local::LocalMemory;

use crate::error::{Error, Result};

/// Upper bound for NUL-terminated string reads.
pub const MAX_C_STRING_LEN: usize = 0x400;

/// Read-only, zero-copy view of host memory.
///
/// Implementors only provide [`ReadMemory::slice_from`]; everything else is derived from it.
pub trait ReadMemory {
    /// Every contiguous readable byte from `address` to the end of its region.
    fn slice_from(&self, address: u64) -> Option<&[u8]>;

    /// Borrow `size` bytes at `address`.
    fn bytes(&self, address: u64, size: usize) -> Result<&[u8]> {
        self.slice_from(address)
            .and_then(|s| s.get(..size))
            .ok_or(Error::MemoryReadFailed { address, size })
    }

    fn read_u8(&self, address: u64) -> Result<u8> {
        Ok(self.bytes(address, 1)?[0])
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        let b = self.bytes(address, 4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let b = self.bytes(address, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Bytes of the NUL-terminated string at `address`, terminator excluded.
    fn read_c_str(&self, address: u64) -> Result<&[u8]> {
        let region = self.slice_from(address).ok_or(Error::MemoryReadFailed {
            address,
            size: 1,
        })?;
        let window = &region[..region.len().min(MAX_C_STRING_LEN)];
        let len = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::MemoryReadFailed {
                address,
                size: window.len() + 1,
            })?;
        Ok(&window[..len])
    }
}

impl<T: ReadMemory + ?Sized> ReadMemory for &T {
    fn slice_from(&self, address: u64) -> Option<&[u8]> {
        (**self).slice_from(address)
    }
}
