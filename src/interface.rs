use crate::arch::{Arch, Regs};
use crate::error::{LastError, QutErrorCode};
use crate::frame_info::{CfiSource, FrameInfo, FrameInfos};
use crate::generator::{generate, DecodeContext, Generated};
use crate::memory::Memory;
use crate::quicken::stepper::execute;
use crate::quicken::{Addr32, Addr64, AddressWidth, QutSections};
use core::fmt::{Debug, Formatter};
use log::{trace, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Unwind state of one loaded image: where its CFI lives, and the quicken
/// table compiled from it on first use.
pub struct QuickenInterface {
    memory: Arc<dyn Memory>,
    load_bias: u64,
    arch: Arch,
    infos: FrameInfos,
    priority: Vec<CfiSource>,
    generated: OnceLock<Generated>,
    last_error: LastError,
    bad_entries: AtomicUsize,
}

impl Debug for QuickenInterface {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QuickenInterface")
            .field("arch", &self.arch)
            .field("load_bias", &self.load_bias)
            .field("infos", &self.infos)
            .field("generated", &self.generated.get().is_some())
            .finish()
    }
}

impl QuickenInterface {
    /// `memory` reads the image file, addressed by file offset.
    pub fn new(memory: Arc<dyn Memory>, load_bias: u64, arch: Arch) -> Self {
        Self {
            memory,
            load_bias,
            arch,
            infos: FrameInfos::default(),
            priority: CfiSource::DEFAULT_PRIORITY.to_vec(),
            generated: OnceLock::new(),
            last_error: LastError::default(),
            bad_entries: AtomicUsize::new(0),
        }
    }

    fn set_info(&mut self, source: CfiSource, offset: u64, section_bias: i64, size: u64) {
        if self.generated.get().is_some() {
            warn!("{:?} set after the quicken table was generated, ignoring", source);
            return;
        }
        self.infos.set(source, FrameInfo::new(offset, section_bias, size));
    }

    pub fn set_arm_exidx_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::ArmExidx, offset, section_bias, size);
    }

    pub fn set_eh_frame_hdr_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::EhFrameHdr, offset, section_bias, size);
    }

    pub fn set_eh_frame_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::EhFrame, offset, section_bias, size);
    }

    pub fn set_debug_frame_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::DebugFrame, offset, section_bias, size);
    }

    pub fn set_gnu_eh_frame_hdr_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::GnuEhFrameHdr, offset, section_bias, size);
    }

    pub fn set_gnu_eh_frame_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::GnuEhFrame, offset, section_bias, size);
    }

    pub fn set_gnu_debug_frame_info(&mut self, offset: u64, section_bias: i64, size: u64) {
        self.set_info(CfiSource::GnuDebugFrame, offset, section_bias, size);
    }

    /// Order in which sources are tried. Sources left out are never used.
    pub fn set_source_priority(&mut self, priority: &[CfiSource]) {
        if self.generated.get().is_some() {
            warn!("source priority set after the quicken table was generated, ignoring");
            return;
        }
        self.priority = priority.to_vec();
    }

    pub fn source_priority(&self) -> &[CfiSource] {
        &self.priority
    }

    pub fn frame_info(&self, source: CfiSource) -> FrameInfo {
        self.infos.get(source)
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn memory(&self) -> &dyn Memory {
        self.memory.as_ref()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Compiles the table if nobody has yet. Returns whether a usable table
    /// exists.
    pub fn generate_quicken_table(&self) -> bool {
        if self.arch.is_64bit() {
            self.generate_quicken_table_for::<Addr64>()
        } else {
            self.generate_quicken_table_for::<Addr32>()
        }
    }

    pub fn generate_quicken_table_for<W: AddressWidth>(&self) -> bool {
        if W::SIZE != self.arch.address_size() {
            warn!("{}-byte table requested for {:?}", W::SIZE, self.arch);
            self.last_error.set(QutErrorCode::ArchMismatch);
            return false;
        }
        self.generated::<W>().sections.is_some()
    }

    fn generated<W: AddressWidth>(&self) -> &Generated {
        self.generated.get_or_init(|| {
            let ctx = DecodeContext {
                arch: self.arch,
                infos: &self.infos,
                memory: self.memory.as_ref(),
            };
            let generated = generate::<W>(&ctx, &self.priority);
            self.bad_entries
                .fetch_add(generated.bad_entries, Ordering::Relaxed);
            if !generated.last_error.is_none() {
                self.last_error.set(generated.last_error);
            }
            generated
        })
    }

    /// The compiled table, if generation already ran and succeeded.
    pub fn sections(&self) -> Option<Arc<QutSections>> {
        self.generated.get()?.sections.clone()
    }

    /// Source the table was compiled from.
    pub fn source(&self) -> Option<CfiSource> {
        self.generated.get()?.source
    }

    /// Program offset for `pc`. Never generates the table.
    pub fn find_entry(&self, pc: u64) -> Option<u32> {
        self.generated.get()?.sections.as_ref()?.find_entry(pc)
    }

    /// Replaces `regs` with the caller's registers. `pc` is image relative,
    /// `process_memory` reads the live stack. Returns whether the stack is
    /// finished.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Result<bool, QutErrorCode> {
        self.step_frame(pc, regs, process_memory, false)
    }

    /// [`step`](Self::step), except the innermost frame may return without
    /// moving sp.
    pub(crate) fn step_frame(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        innermost: bool,
    ) -> Result<bool, QutErrorCode> {
        let result = if self.arch.is_64bit() {
            self.step_with::<Addr64>(pc, regs, process_memory, innermost)
        } else {
            self.step_with::<Addr32>(pc, regs, process_memory, innermost)
        };
        if let Err(code) = result {
            trace!("step at {:#x} failed: {}", pc, code);
            self.last_error.set(code);
        }
        result
    }

    fn step_with<W: AddressWidth>(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        innermost: bool,
    ) -> Result<bool, QutErrorCode> {
        if regs.arch() != self.arch {
            return Err(QutErrorCode::ArchMismatch);
        }
        let generated = self.generated::<W>();
        let Some(sections) = generated.sections.as_ref() else {
            return Err(QutErrorCode::NoUnwindInfo);
        };
        let program = sections
            .find_entry(pc)
            .ok_or(QutErrorCode::EntryNotFound)?;
        execute::<W>(sections, program, regs, process_memory, innermost)
    }

    pub fn last_error_code(&self) -> QutErrorCode {
        self.last_error.get()
    }

    pub fn bad_entries(&self) -> usize {
        self.bad_entries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;
    use gimli::Arm;
    use std::thread;

    /// Counts reads so tests can tell how often the image was parsed.
    struct CountingMemory {
        inner: MemoryBuffer,
        reads: AtomicUsize,
    }

    impl Memory for CountingMemory {
        fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read(addr, dst)
        }
    }

    /// Two functions at 0x1000 and 0x1100: the first pops {r4, lr}, the
    /// second can't unwind.
    fn exidx_image() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x100];
        for (index, (function, word)) in [(0x1000u32, 0x80a8_b0b0u32), (0x1100, 1)]
            .into_iter()
            .enumerate()
        {
            let place = 0x100 + 8 * index as u32;
            bytes.extend_from_slice(&(function.wrapping_sub(place) & 0x7fff_ffff).to_le_bytes());
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn arm_interface(memory: Arc<dyn Memory>) -> QuickenInterface {
        let mut interface = QuickenInterface::new(memory, 0, Arch::Arm);
        interface.set_arm_exidx_info(0x100, 0, 16);
        interface
    }

    fn counting() -> Arc<CountingMemory> {
        Arc::new(CountingMemory {
            inner: MemoryBuffer::new(0, exidx_image()),
            reads: AtomicUsize::new(0),
        })
    }

    #[test]
    fn find_entry_does_not_generate() {
        let interface = arm_interface(Arc::new(MemoryBuffer::new(0, exidx_image())));
        assert_eq!(interface.find_entry(0x1000), None);
        assert!(interface.sections().is_none());
        assert!(interface.generate_quicken_table());
        assert!(interface.find_entry(0x1000).is_some());
        assert!(interface.find_entry(0x1100).is_some());
        assert_eq!(interface.find_entry(0xfff), None);
        assert_eq!(interface.source(), Some(CfiSource::ArmExidx));
    }

    #[test]
    fn generation_is_idempotent() {
        let memory = counting();
        let interface = arm_interface(memory.clone());
        assert!(interface.generate_quicken_table());
        let reads = memory.reads.load(Ordering::Relaxed);
        let first = interface.sections().unwrap();

        assert!(interface.generate_quicken_table());
        assert!(Arc::ptr_eq(&first, &interface.sections().unwrap()));
        assert_eq!(memory.reads.load(Ordering::Relaxed), reads);
        assert_eq!(interface.bad_entries(), 0);
    }

    #[test]
    fn concurrent_generation_builds_once() {
        let single = counting();
        assert!(arm_interface(single.clone()).generate_quicken_table());
        let expected = single.reads.load(Ordering::Relaxed);

        let memory = counting();
        let interface = Arc::new(arm_interface(memory.clone()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interface = interface.clone();
                thread::spawn(move || {
                    assert!(interface.generate_quicken_table());
                    interface.sections().unwrap()
                })
            })
            .collect();
        let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(tables.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(memory.reads.load(Ordering::Relaxed), expected);
    }

    #[test]
    fn oversized_debug_frame_is_a_read_error() {
        let mut interface =
            QuickenInterface::new(Arc::new(MemoryBuffer::new(0, exidx_image())), 0, Arch::Arm);
        interface.set_debug_frame_info(0, 0, 1 << 63);
        assert!(!interface.generate_quicken_table());
        assert_eq!(interface.last_error_code(), QutErrorCode::BadMemoryRead);
    }

    #[test]
    fn setters_after_generation_are_ignored() {
        let mut interface = arm_interface(Arc::new(MemoryBuffer::new(0, exidx_image())));
        assert!(interface.generate_quicken_table());
        interface.set_debug_frame_info(0x10, 0, 0x10);
        assert!(!interface.frame_info(CfiSource::DebugFrame).is_present());
        interface.set_source_priority(&[CfiSource::DebugFrame]);
        assert_eq!(interface.source_priority(), &CfiSource::DEFAULT_PRIORITY);
    }

    #[test]
    fn step_reports_and_records_errors() {
        let interface = arm_interface(Arc::new(MemoryBuffer::new(0, exidx_image())));
        let stack = MemoryBuffer::new(
            0x8000,
            [0x44u32, 0x2345].iter().flat_map(|w| w.to_le_bytes()).collect(),
        );

        let mut regs = Regs::new(Arch::Arm);
        regs.set_pc(0x1010);
        regs.set_sp(0x8000);
        assert_eq!(interface.step(0x1010, &mut regs, &stack), Ok(false));
        assert_eq!(regs.pc(), 0x2345);
        assert_eq!(regs.sp(), 0x8008);
        assert_eq!(regs.get(Arm::R4), Some(0x44));

        let mut regs = Regs::new(Arch::Arm);
        regs.set_sp(0x8000);
        assert_eq!(interface.step(0x1180, &mut regs, &stack), Ok(true));

        assert_eq!(
            interface.step(0x800, &mut regs, &stack),
            Err(QutErrorCode::EntryNotFound)
        );
        assert_eq!(interface.last_error_code(), QutErrorCode::EntryNotFound);

        let mut regs = Regs::new(Arch::Arm64);
        assert_eq!(
            interface.step(0x1010, &mut regs, &stack),
            Err(QutErrorCode::ArchMismatch)
        );
    }

    #[test]
    fn wrong_width_is_an_arch_mismatch() {
        let interface = arm_interface(Arc::new(MemoryBuffer::new(0, exidx_image())));
        assert!(!interface.generate_quicken_table_for::<Addr64>());
        assert_eq!(interface.last_error_code(), QutErrorCode::ArchMismatch);
        assert!(interface.sections().is_none());
    }

    #[test]
    fn exidx_is_skipped_off_arm() {
        let mut interface =
            QuickenInterface::new(Arc::new(MemoryBuffer::new(0, exidx_image())), 0, Arch::Arm64);
        interface.set_arm_exidx_info(0x100, 0, 16);
        assert!(!interface.generate_quicken_table());
        assert_eq!(interface.last_error_code(), QutErrorCode::ArchMismatch);
    }
}
