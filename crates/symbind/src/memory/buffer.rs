use super::ReadMemory;

/// An owned copy of a memory region placed at a fixed base address.
///
/// Used for images loaded from disk and as the test double for host memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    base: u64,
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn zeroed(base: u64, size: usize) -> Self {
        Self::new(base, vec![0; size])
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.data.len() as u64
    }

    /// Copy `bytes` to `address`.
    ///
    /// # Panics
    ///
    /// Panics if the destination is outside the buffer.
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        let start = (address - self.base) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Builder-style variant of [`MemoryBuffer::write`].
    pub fn with(mut self, address: u64, bytes: &[u8]) -> Self {
        self.write(address, bytes);
        self
    }
}

impl ReadMemory for MemoryBuffer {
    fn slice_from(&self, address: u64) -> Option<&[u8]> {
        let offset = address.checked_sub(self.base)?;
        self.data.get(usize::try_from(offset).ok()?..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_from_bounds() {
        let memory = MemoryBuffer::zeroed(0x400000, 0x100);
        assert_eq!(memory.slice_from(0x400000).map(<[u8]>::len), Some(0x100));
        assert_eq!(memory.slice_from(0x4000F0).map(<[u8]>::len), Some(0x10));
        assert_eq!(memory.slice_from(0x400100).map(<[u8]>::len), Some(0));
        assert!(memory.slice_from(0x400101).is_none());
        assert!(memory.slice_from(0x3FFFFF).is_none());
    }

    #[test]
    fn test_builder_write() {
        let memory = MemoryBuffer::zeroed(0x10, 8).with(0x12, &[1, 2, 3]);
        assert_eq!(memory.as_slice(), &[0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(memory.contains(0x17));
        assert!(!memory.contains(0x18));
    }
}
