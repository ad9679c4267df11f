use super::instructions::QutInstruction;
use super::table::QutSections;
use super::width::AddressWidth;
use crate::arch::Regs;
use crate::error::QutErrorCode;
use crate::memory::Memory;
use log::trace;

/// Runs the program at `program` against `regs`, replacing them with the
/// caller's registers. Returns whether unwinding is finished.
///
/// `SetVspFromReg` and loads see registers already updated by the program
/// (EHABI pops are sequential), `CopyReg` reads the frame's original values
/// (DWARF rules all refer to the current frame).
///
/// The caller's sp must be above ours. Only the `innermost` frame may leave it
/// unchanged, a leaf that returns through lr without touching the stack.
pub(crate) fn execute<W: AddressWidth>(
    sections: &QutSections,
    program: u32,
    regs: &mut Regs,
    memory: &dyn Memory,
    innermost: bool,
) -> Result<bool, QutErrorCode> {
    let info = regs.arch().info();
    let sp = regs.sp();
    let mut caller = regs.clone();
    let mut vsp = sp;
    let mut pc_reg = info.return_address;

    for instruction in sections.program(program) {
        match instruction? {
            QutInstruction::SetVspFromReg(reg) => {
                vsp = caller.get(reg).ok_or(QutErrorCode::InvalidProgram)?;
            }
            QutInstruction::AddVsp(n) => vsp = W::offset(vsp, n),
            QutInstruction::LoadReg(reg, n) => {
                let addr = W::offset(vsp, n);
                let value = W::read_word(memory, addr).ok_or_else(|| {
                    trace!("failed to read {:?} at {:#x}", reg, addr);
                    QutErrorCode::BadMemoryRead
                })?;
                set(&mut caller, reg, value)?;
            }
            QutInstruction::CopyReg { dst, src } => {
                let value = regs.get(src).ok_or(QutErrorCode::InvalidProgram)?;
                set(&mut caller, dst, value)?;
            }
            QutInstruction::ValOffset(reg, n) => set(&mut caller, reg, W::offset(vsp, n))?,
            QutInstruction::SetPcFromReg(reg) => pc_reg = reg,
            QutInstruction::End => break,
            QutInstruction::NoCaller => {
                trace!("no caller at sp {:#x}", sp);
                return Ok(true);
            }
        }
    }

    let pc = caller.get(pc_reg).ok_or(QutErrorCode::InvalidProgram)?;
    caller.set_pc(pc);
    caller.set_sp(vsp);
    if pc == 0 {
        *regs = caller;
        return Ok(true);
    }
    let leaf = innermost && vsp == sp && pc != regs.pc();
    if vsp <= sp && !leaf {
        trace!("sp went from {:#x} to {:#x}", sp, vsp);
        return Err(QutErrorCode::StackCorrupted);
    }
    *regs = caller;
    Ok(false)
}

fn set(regs: &mut Regs, reg: gimli::Register, value: u64) -> Result<(), QutErrorCode> {
    if regs.set(reg, value) {
        Ok(())
    } else {
        Err(QutErrorCode::InvalidProgram)
    }
}
