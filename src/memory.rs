/// Byte reader over an image (addressed by file offset) or a live process
/// (addressed by virtual address). Reads never fault; they report how many
/// bytes were copied.
pub trait Memory: Send + Sync {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.read(addr, dst) == dst.len()
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_fully(addr, &mut buf)
            .then(|| u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_fully(addr, &mut buf)
            .then(|| u64::from_le_bytes(buf))
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

/// Owned bytes mapped at `base`. Used for image bytes that were read up front
/// and for stack snapshots.
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    base: u64,
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Some(start) = addr.checked_sub(self.base) else {
            return 0;
        };
        let Ok(start) = usize::try_from(start) else {
            return 0;
        };
        if start >= self.data.len() {
            return 0;
        }
        let len = dst.len().min(self.data.len() - start);
        dst[..len].copy_from_slice(&self.data[start..start + len]);
        len
    }
}

/// Reads `size` bytes at `addr`. Short reads fail the whole request.
///
/// Section sizes come straight from the image headers, so the last byte must
/// be readable before anything is allocated.
pub(crate) fn read_section(memory: &dyn Memory, addr: u64, size: u64) -> Option<Vec<u8>> {
    if size == 0 {
        return Some(Vec::new());
    }
    let last = addr.checked_add(size - 1)?;
    if !memory.read_fully(last, &mut [0u8]) {
        return None;
    }
    let size = usize::try_from(size).ok()?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).ok()?;
    buf.resize(size, 0);
    memory.read_fully(addr, &mut buf).then_some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_report_copied_bytes() {
        let memory = MemoryBuffer::new(0x1000, vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 4];
        assert_eq!(memory.read(0x1003, &mut buf), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert!(!memory.read_fully(0x1003, &mut buf));
        assert_eq!(memory.read(0xfff, &mut buf), 0);
        assert_eq!(memory.read(0x2000, &mut buf), 0);
    }

    #[test]
    fn word_reads_are_little_endian() {
        let memory = MemoryBuffer::new(0, vec![0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]);
        assert_eq!(memory.read_u32(0), Some(0x1234_5678));
        assert_eq!(memory.read_u64(0), Some(0x1234_5678));
        assert_eq!(memory.read_u64(1), None);
    }

    #[test]
    fn section_reads_need_every_byte() {
        let memory = MemoryBuffer::new(0, vec![0; 16]);
        assert_eq!(read_section(&memory, 8, 8).map(|v| v.len()), Some(8));
        assert!(read_section(&memory, 8, 9).is_none());
        assert_eq!(read_section(&memory, 8, 0), Some(Vec::new()));
    }

    #[test]
    fn oversized_sections_fail_without_allocating() {
        let memory = MemoryBuffer::new(0, vec![0; 16]);
        assert!(read_section(&memory, 0, 1 << 63).is_none());
        assert!(read_section(&memory, 0, u64::MAX).is_none());
        assert!(read_section(&memory, u64::MAX, 2).is_none());
    }
}
