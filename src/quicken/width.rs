use crate::memory::Memory;

/// Address width of an image. Decoders and the stepper are monomorphised per
/// width so the hot loops never branch on it.
pub trait AddressWidth: Copy + Send + Sync + 'static {
    const SIZE: u8;

    fn wrap(addr: u64) -> u64;

    fn read_word(memory: &dyn Memory, addr: u64) -> Option<u64>;

    fn offset(base: u64, offset: i64) -> u64 {
        Self::wrap(base.wrapping_add(offset as u64))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Addr32;

#[derive(Debug, Clone, Copy)]
pub struct Addr64;

impl AddressWidth for Addr32 {
    const SIZE: u8 = 4;

    fn wrap(addr: u64) -> u64 {
        addr & 0xffff_ffff
    }

    fn read_word(memory: &dyn Memory, addr: u64) -> Option<u64> {
        memory.read_u32(addr).map(u64::from)
    }
}

impl AddressWidth for Addr64 {
    const SIZE: u8 = 8;

    fn wrap(addr: u64) -> u64 {
        addr
    }

    fn read_word(memory: &dyn Memory, addr: u64) -> Option<u64> {
        memory.read_u64(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;

    #[test]
    fn offsets_wrap_at_width() {
        assert_eq!(Addr32::offset(0xffff_fffc, 8), 4);
        assert_eq!(Addr32::offset(0x10, -0x20), 0xffff_fff0);
        assert_eq!(Addr64::offset(0x10, -0x8), 0x8);
    }

    #[test]
    fn words_have_width_size() {
        let memory = MemoryBuffer::new(0, (1u8..=8).collect());
        assert_eq!(Addr32::read_word(&memory, 0), Some(0x0403_0201));
        assert_eq!(Addr64::read_word(&memory, 0), Some(0x0807_0605_0403_0201));
        assert_eq!(Addr64::read_word(&memory, 4), None);
        assert_eq!(Addr32::read_word(&memory, 4), Some(0x0807_0605));
    }
}
