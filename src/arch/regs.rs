use super::Arch;
use gimli::Register;

/// Slots indexed by DWARF register number, large enough for AArch64 plus its
/// synthetic pc slot.
pub const REG_SLOTS: usize = 33;

/// Register snapshot of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regs {
    arch: Arch,
    values: [u64; REG_SLOTS],
}

/// The handful of registers a sampler captures for a thread.
#[derive(Debug, Clone, Copy)]
pub struct MachineState {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub lr: u64,
}

impl MachineState {
    pub fn new(pc: u64, sp: u64, fp: u64, lr: u64) -> Self {
        Self { pc, sp, fp, lr }
    }
}

impl Regs {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            values: [0; REG_SLOTS],
        }
    }

    pub fn from_machine_state(arch: Arch, machine: &MachineState) -> Self {
        let info = arch.info();
        let mut regs = Self::new(arch);
        regs.set_pc(machine.pc);
        regs.set_sp(machine.sp);
        regs.set(info.frame_pointer, machine.fp);
        // x86 keeps the return address on the stack, its column is pc
        if info.return_address != info.pc {
            regs.set(info.return_address, machine.lr);
        }
        regs
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn get(&self, reg: Register) -> Option<u64> {
        self.values.get(reg.0 as usize).copied()
    }

    /// Returns false for registers outside the snapshot.
    pub fn set(&mut self, reg: Register, val: u64) -> bool {
        let val = self.arch.wrap_address(val);
        match self.values.get_mut(reg.0 as usize) {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    pub fn pc(&self) -> u64 {
        self.values[self.arch.info().pc.0 as usize]
    }

    pub fn set_pc(&mut self, val: u64) {
        self.set(self.arch.info().pc, val);
    }

    pub fn sp(&self) -> u64 {
        self.values[self.arch.info().sp.0 as usize]
    }

    pub fn set_sp(&mut self, val: u64) {
        self.set(self.arch.info().sp, val);
    }

    pub fn fp(&self) -> u64 {
        self.values[self.arch.info().frame_pointer.0 as usize]
    }
}
