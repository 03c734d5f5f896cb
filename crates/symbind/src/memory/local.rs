use std::marker::PhantomData;

use super::ReadMemory;

/// Read-only view of the loaded host image inside the current process.
///
/// Reads never leave `[base, base + size)`.
#[derive(Debug, Clone, Copy)]
pub struct LocalMemory<'a> {
    base: u64,
    size: usize,
    _image: PhantomData<&'a [u8]>,
}

impl<'a> LocalMemory<'a> {
    /// # Safety
    ///
    /// `[base, base + size)` must be mapped and readable for `'a`, which is what the host
    /// loader guarantees for a validated module image.
    pub unsafe fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            _image: PhantomData,
        }
    }

    /// Wrap a slice that is already known to be valid, e.g. a mapped file.
    pub fn from_slice(image: &'a [u8]) -> Self {
        Self {
            base: image.as_ptr() as u64,
            size: image.len(),
            _image: PhantomData,
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl ReadMemory for LocalMemory<'_> {
    fn slice_from(&self, address: u64) -> Option<&[u8]> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        if offset > self.size {
            return None;
        }
        // SAFETY: the range lies inside the image the constructor vouched for.
        Some(unsafe { std::slice::from_raw_parts(address as *const u8, self.size - offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_memory_reads_backing_slice() {
        let backing = [0xE8u8, 0x10, 0x00, 0x00, 0x00, 0x00];
        let memory = LocalMemory::from_slice(&backing);
        let base = memory.base_address();

        assert_eq!(memory.read_u8(base).unwrap(), 0xE8);
        assert_eq!(memory.read_i32(base + 1).unwrap(), 0x10);
        assert!(memory.bytes(base + 4, 3).is_err());
        assert!(memory.slice_from(base + 7).is_none());
        assert!(memory.slice_from(base.wrapping_sub(1)).is_none());
    }
}
