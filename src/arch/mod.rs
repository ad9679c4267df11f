//! Per-architecture register roles. Everything that differs between ISAs in
//! the stepper (which register is pc, where the return address lives, which
//! registers are callee-saved) is read from an [`ArchInfo`] table.

mod regs;

use gimli::{AArch64, Arm, Register, X86_64, X86};

pub use regs::{MachineState, Regs, REG_SLOTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Arm,
    Arm64,
    X86,
    X86_64,
}

/// AArch64 has no DWARF column for pc, keep it in the first free slot.
pub const AARCH64_PC: Register = Register(32);

#[derive(Debug)]
pub struct ArchInfo {
    pub arch: Arch,
    pub address_size: u8,
    pub sp: Register,
    pub pc: Register,
    /// DWARF return address column.
    pub return_address: Register,
    pub frame_pointer: Register,
    /// Registers whose caller values are compiled into quicken programs.
    pub tracked: &'static [Register],
}

static ARM: ArchInfo = ArchInfo {
    arch: Arch::Arm,
    address_size: 4,
    sp: Arm::R13,
    pc: Arm::R15,
    return_address: Arm::R14,
    frame_pointer: Arm::R11,
    tracked: &[
        Arm::R4,
        Arm::R5,
        Arm::R6,
        Arm::R7,
        Arm::R8,
        Arm::R9,
        Arm::R10,
        Arm::R11,
        Arm::R14,
    ],
};

static ARM64: ArchInfo = ArchInfo {
    arch: Arch::Arm64,
    address_size: 8,
    sp: AArch64::SP,
    pc: AARCH64_PC,
    return_address: AArch64::X30,
    frame_pointer: AArch64::X29,
    tracked: &[
        AArch64::X19,
        AArch64::X20,
        AArch64::X21,
        AArch64::X22,
        AArch64::X23,
        AArch64::X24,
        AArch64::X25,
        AArch64::X26,
        AArch64::X27,
        AArch64::X28,
        AArch64::X29,
        AArch64::X30,
    ],
};

static X86_INFO: ArchInfo = ArchInfo {
    arch: Arch::X86,
    address_size: 4,
    sp: X86::ESP,
    pc: X86::RA,
    return_address: X86::RA,
    frame_pointer: X86::EBP,
    tracked: &[X86::EBX, X86::EBP, X86::ESI, X86::EDI, X86::RA],
};

static X86_64_INFO: ArchInfo = ArchInfo {
    arch: Arch::X86_64,
    address_size: 8,
    sp: X86_64::RSP,
    pc: X86_64::RA,
    return_address: X86_64::RA,
    frame_pointer: X86_64::RBP,
    tracked: &[
        X86_64::RBX,
        X86_64::RBP,
        X86_64::R12,
        X86_64::R13,
        X86_64::R14,
        X86_64::R15,
        X86_64::RA,
    ],
};

impl Arch {
    pub fn info(self) -> &'static ArchInfo {
        match self {
            Arch::Arm => &ARM,
            Arch::Arm64 => &ARM64,
            Arch::X86 => &X86_INFO,
            Arch::X86_64 => &X86_64_INFO,
        }
    }

    pub fn address_size(self) -> u8 {
        self.info().address_size
    }

    pub fn is_64bit(self) -> bool {
        self.address_size() == 8
    }

    /// Moves a return address back into the call instruction so that lookups
    /// don't land in the next function when the call was the last instruction.
    pub fn caller_lookup_pc(self, return_address: u64) -> u64 {
        match self {
            // thumb bit
            Arch::Arm => (return_address & !1).saturating_sub(1),
            _ => return_address.saturating_sub(1),
        }
    }

    /// Truncates a computed address to the architecture's width.
    pub fn wrap_address(self, addr: u64) -> u64 {
        if self.is_64bit() {
            addr
        } else {
            addr & 0xffff_ffff
        }
    }
}
