//! Frame pointer chain walking, for images without usable unwind info.
//!
//! Both supported ABIs keep a two word frame record at fp: the caller's fp,
//! then the return address.

use crate::arch::{Arch, Regs};
use crate::error::QutErrorCode;
use crate::memory::Memory;
use log::trace;

const WORD: u64 = 8;

pub struct FramePointerWalker<'a> {
    memory: &'a dyn Memory,
    fp: u64,
    done: bool,
    error: QutErrorCode,
}

impl<'a> FramePointerWalker<'a> {
    /// Fails for architectures without a standard frame record layout.
    pub fn new(regs: &Regs, memory: &'a dyn Memory) -> Result<Self, QutErrorCode> {
        match regs.arch() {
            Arch::Arm64 | Arch::X86_64 => Ok(Self {
                memory,
                fp: regs.fp(),
                done: false,
                error: QutErrorCode::None,
            }),
            _ => Err(QutErrorCode::ArchMismatch),
        }
    }

    pub fn error(&self) -> QutErrorCode {
        self.error
    }

    fn stop(&mut self, error: QutErrorCode) -> Option<u64> {
        self.done = true;
        self.error = error;
        None
    }
}

impl Iterator for FramePointerWalker<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.fp == 0 {
            return self.stop(self.error);
        }
        let (Some(caller_fp), Some(ra)) = (
            self.memory.read_u64(self.fp),
            self.memory.read_u64(self.fp.wrapping_add(WORD)),
        ) else {
            trace!("frame record at {:#x} unreadable", self.fp);
            return self.stop(QutErrorCode::BadMemoryRead);
        };
        if ra == 0 {
            return self.stop(QutErrorCode::None);
        }
        if caller_fp != 0 && caller_fp <= self.fp {
            // still report this frame, the next record is bogus
            self.done = true;
            self.error = QutErrorCode::StackCorrupted;
            return Some(ra);
        }
        self.fp = caller_fp;
        Some(ra)
    }
}

/// Frame pointer counterpart of [`quicken_unwind`](crate::quicken_unwind).
pub fn fp_unwind(
    arch: Arch,
    regs: &Regs,
    process_memory: &dyn Memory,
    backtrace: &mut [u64],
) -> (usize, QutErrorCode) {
    if regs.arch() != arch {
        return (0, QutErrorCode::ArchMismatch);
    }
    let mut walker = match FramePointerWalker::new(regs, process_memory) {
        Ok(walker) => walker,
        Err(code) => return (0, code),
    };
    let mut frames = 0;
    for (slot, pc) in backtrace.iter_mut().zip(&mut walker) {
        *slot = pc;
        frames += 1;
    }
    (frames, walker.error())
}
