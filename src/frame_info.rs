/// Location of one raw CFI section inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    /// File offset of the section.
    pub offset: u64,
    /// `section vaddr - offset`.
    pub section_bias: i64,
    pub size: u64,
}

impl FrameInfo {
    pub fn new(offset: u64, section_bias: i64, size: u64) -> Self {
        Self {
            offset,
            section_bias,
            size,
        }
    }

    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    /// Virtual address of the section start.
    pub fn vaddr(&self) -> u64 {
        self.offset.wrapping_add(self.section_bias as u64)
    }

    /// File offset of an address inside (or next to) this section.
    pub fn vaddr_to_offset(&self, vaddr: u64) -> u64 {
        vaddr.wrapping_sub(self.section_bias as u64)
    }
}

/// The raw unwind sources an image can carry. `Gnu*` are the sections found in
/// the `.gnu_debugdata` mini debug info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfiSource {
    ArmExidx,
    EhFrameHdr,
    EhFrame,
    DebugFrame,
    GnuEhFrameHdr,
    GnuEhFrame,
    GnuDebugFrame,
}

impl CfiSource {
    pub const ALL: [CfiSource; 7] = [
        CfiSource::ArmExidx,
        CfiSource::EhFrameHdr,
        CfiSource::EhFrame,
        CfiSource::DebugFrame,
        CfiSource::GnuEhFrameHdr,
        CfiSource::GnuEhFrame,
        CfiSource::GnuDebugFrame,
    ];

    /// Cheapest and most specific format first.
    pub const DEFAULT_PRIORITY: [CfiSource; 7] = Self::ALL;

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

/// The seven CFI slots of one image.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfos([FrameInfo; 7]);

impl FrameInfos {
    pub fn get(&self, source: CfiSource) -> FrameInfo {
        self.0[source.slot()]
    }

    pub fn set(&mut self, source: CfiSource, info: FrameInfo) {
        self.0[source.slot()] = info;
    }

    pub fn present(&self) -> impl Iterator<Item = CfiSource> + '_ {
        CfiSource::ALL
            .into_iter()
            .filter(|source| self.get(*source).is_present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_converts_between_offset_and_vaddr() {
        let info = FrameInfo::new(0x800, 0x1000, 0x40);
        assert_eq!(info.vaddr(), 0x1800);
        assert_eq!(info.vaddr_to_offset(0x1810), 0x810);

        let info = FrameInfo::new(0x800, -0x100, 0x40);
        assert_eq!(info.vaddr(), 0x700);
        assert_eq!(info.vaddr_to_offset(0x700), 0x800);
    }

    #[test]
    fn only_sized_slots_are_present() {
        let mut infos = FrameInfos::default();
        infos.set(CfiSource::DebugFrame, FrameInfo::new(0x10, 0, 0x20));
        infos.set(CfiSource::EhFrame, FrameInfo::new(0x10, 0, 0));
        assert_eq!(infos.present().collect::<Vec<_>>(), vec![CfiSource::DebugFrame]);
    }
}
