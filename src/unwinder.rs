use crate::arch::{Arch, MachineState, Regs};
use crate::error::QutErrorCode;
use crate::maps::QuickenMaps;
use crate::memory::Memory;
use core::fmt::{Debug, Formatter};
use log::trace;

/// Walks a stack through the quicken tables of `maps`, yielding each
/// recovered return address. The sampled pc itself is not yielded.
pub struct Unwinder<'a> {
    maps: &'a QuickenMaps,
    process_memory: &'a dyn Memory,
    regs: Regs,
    innermost: bool,
    done: bool,
    error: QutErrorCode,
}

impl Debug for Unwinder<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Unwinder")
            .field("regs", &self.regs)
            .field("done", &self.done)
            .field("error", &self.error)
            .finish()
    }
}

impl<'a> Unwinder<'a> {
    pub fn new(maps: &'a QuickenMaps, regs: Regs, process_memory: &'a dyn Memory) -> Self {
        Self {
            maps,
            process_memory,
            regs,
            innermost: true,
            done: false,
            error: QutErrorCode::None,
        }
    }

    pub fn from_machine_state(
        maps: &'a QuickenMaps,
        arch: Arch,
        machine: &MachineState,
        process_memory: &'a dyn Memory,
    ) -> Self {
        Self::new(maps, Regs::from_machine_state(arch, machine), process_memory)
    }

    /// Registers of the last recovered frame.
    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    /// Why the walk stopped, `None` if it reached the end of the stack.
    pub fn error(&self) -> QutErrorCode {
        self.error
    }

    fn stop(&mut self, error: QutErrorCode) -> Option<u64> {
        self.done = true;
        self.error = error;
        None
    }
}

impl Iterator for Unwinder<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let arch = self.regs.arch();
        let pc = self.regs.pc();
        // return addresses point past the call, look up the call itself
        let lookup_pc = if self.innermost {
            pc
        } else {
            arch.caller_lookup_pc(pc)
        };
        let Some(map) = self.maps.find(lookup_pc) else {
            trace!("no map for pc {:#x}", lookup_pc);
            return self.stop(QutErrorCode::InvalidMap);
        };

        let rel_pc = map.rel_pc(lookup_pc);
        let innermost = self.innermost;
        self.innermost = false;
        match map
            .interface
            .step_frame(rel_pc, &mut self.regs, self.process_memory, innermost)
        {
            Ok(false) => Some(self.regs.pc()),
            Ok(true) => self.stop(QutErrorCode::None),
            Err(code) => self.stop(code),
        }
    }
}

/// Fills `backtrace` with the return addresses of the stack described by
/// `regs`. Returns the number of frames written and why the walk ended;
/// running out of room is not an error.
pub fn quicken_unwind(
    maps: &QuickenMaps,
    arch: Arch,
    regs: &Regs,
    process_memory: &dyn Memory,
    backtrace: &mut [u64],
) -> (usize, QutErrorCode) {
    if regs.arch() != arch {
        return (0, QutErrorCode::ArchMismatch);
    }

    let mut unwinder = Unwinder::new(maps, regs.clone(), process_memory);
    let mut frames = 0;
    for (slot, pc) in backtrace.iter_mut().zip(&mut unwinder) {
        *slot = pc;
        frames += 1;
    }
    (frames, unwinder.error())
}
