//! Quicken bytecode.
//!
//! A program recovers one caller frame. It runs over a copy of the current
//! registers and a virtual stack pointer `vsp` that starts at the current sp:
//!
//! ```text
//! op    operands        effect
//! 0x01  reg             vsp = reg
//! 0x02  sleb            vsp += n
//! 0x03  reg sleb        reg = *(vsp + n)
//! 0x04  dst src         dst = src
//! 0x05  reg sleb        reg = vsp + n
//! 0x06  reg             caller pc = reg
//! 0x07                  end, caller sp = vsp
//! 0x08                  no caller, unwinding is finished
//! ```
//!
//! Registers are DWARF register numbers. The encoding is private to the
//! compiled table and never persisted.

use crate::error::QutErrorCode;
use gimli::{EndianSlice, LittleEndian, Reader, Register};

const OP_SET_VSP_FROM_REG: u8 = 0x01;
const OP_ADD_VSP: u8 = 0x02;
const OP_LOAD_REG: u8 = 0x03;
const OP_COPY_REG: u8 = 0x04;
const OP_VAL_OFFSET: u8 = 0x05;
const OP_SET_PC_FROM_REG: u8 = 0x06;
const OP_END: u8 = 0x07;
const OP_NO_CALLER: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QutInstruction {
    SetVspFromReg(Register),
    AddVsp(i64),
    LoadReg(Register, i64),
    CopyReg { dst: Register, src: Register },
    ValOffset(Register, i64),
    SetPcFromReg(Register),
    End,
    NoCaller,
}

impl QutInstruction {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QutInstruction::End | QutInstruction::NoCaller)
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), QutErrorCode> {
        match *self {
            QutInstruction::SetVspFromReg(reg) => {
                out.push(OP_SET_VSP_FROM_REG);
                out.push(reg_byte(reg)?);
            }
            QutInstruction::AddVsp(n) => {
                out.push(OP_ADD_VSP);
                write_sleb128(out, n)?;
            }
            QutInstruction::LoadReg(reg, n) => {
                out.push(OP_LOAD_REG);
                out.push(reg_byte(reg)?);
                write_sleb128(out, n)?;
            }
            QutInstruction::CopyReg { dst, src } => {
                out.push(OP_COPY_REG);
                out.push(reg_byte(dst)?);
                out.push(reg_byte(src)?);
            }
            QutInstruction::ValOffset(reg, n) => {
                out.push(OP_VAL_OFFSET);
                out.push(reg_byte(reg)?);
                write_sleb128(out, n)?;
            }
            QutInstruction::SetPcFromReg(reg) => {
                out.push(OP_SET_PC_FROM_REG);
                out.push(reg_byte(reg)?);
            }
            QutInstruction::End => out.push(OP_END),
            QutInstruction::NoCaller => out.push(OP_NO_CALLER),
        }
        Ok(())
    }
}

fn reg_byte(reg: Register) -> Result<u8, QutErrorCode> {
    u8::try_from(reg.0).map_err(|_| QutErrorCode::UnsupportedEncoding)
}

fn write_sleb128(out: &mut Vec<u8>, value: i64) -> Result<(), QutErrorCode> {
    gimli::leb128::write::signed(out, value)
        .map(drop)
        .map_err(|_| QutErrorCode::UnsupportedEncoding)
}

/// Instruction list for one frame, closed by `End` or `NoCaller`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QutProgram {
    instructions: Vec<QutInstruction>,
}

impl QutProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame without a caller.
    pub fn no_caller() -> Self {
        Self {
            instructions: vec![QutInstruction::NoCaller],
        }
    }

    pub fn push(&mut self, instruction: QutInstruction) {
        self.instructions.push(instruction);
    }

    pub fn instructions(&self) -> &[QutInstruction] {
        &self.instructions
    }

    /// Encodes the program, appending `End` when it isn't terminated yet.
    pub fn encode(&self) -> Result<Vec<u8>, QutErrorCode> {
        let mut out = Vec::with_capacity(self.instructions.len() * 3 + 1);
        for instruction in &self.instructions {
            instruction.encode(&mut out)?;
        }
        if !self.instructions.last().map_or(false, QutInstruction::is_terminal) {
            QutInstruction::End.encode(&mut out)?;
        }
        Ok(out)
    }
}

/// Decodes instructions from the shared bytecode blob until a terminal one.
pub struct ProgramIter<'a> {
    reader: EndianSlice<'a, LittleEndian>,
    done: bool,
}

impl<'a> ProgramIter<'a> {
    pub fn new(bytecode: &'a [u8], offset: u32) -> Self {
        let bytes = bytecode.get(offset as usize..).unwrap_or(&[]);
        Self {
            reader: EndianSlice::new(bytes, LittleEndian),
            done: false,
        }
    }

    fn decode(&mut self) -> Option<QutInstruction> {
        let op = self.reader.read_u8().ok()?;
        let instruction = match op {
            OP_SET_VSP_FROM_REG => QutInstruction::SetVspFromReg(self.read_reg()?),
            OP_ADD_VSP => QutInstruction::AddVsp(self.read_sleb()?),
            OP_LOAD_REG => {
                let reg = self.read_reg()?;
                QutInstruction::LoadReg(reg, self.read_sleb()?)
            }
            OP_COPY_REG => QutInstruction::CopyReg {
                dst: self.read_reg()?,
                src: self.read_reg()?,
            },
            OP_VAL_OFFSET => {
                let reg = self.read_reg()?;
                QutInstruction::ValOffset(reg, self.read_sleb()?)
            }
            OP_SET_PC_FROM_REG => QutInstruction::SetPcFromReg(self.read_reg()?),
            OP_END => QutInstruction::End,
            OP_NO_CALLER => QutInstruction::NoCaller,
            _ => return None,
        };
        Some(instruction)
    }

    fn read_reg(&mut self) -> Option<Register> {
        self.reader.read_u8().ok().map(|r| Register(r as u16))
    }

    fn read_sleb(&mut self) -> Option<i64> {
        gimli::leb128::read::signed(&mut self.reader).ok()
    }
}

impl Iterator for ProgramIter<'_> {
    type Item = Result<QutInstruction, QutErrorCode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decode() {
            Some(instruction) => {
                self.done = instruction.is_terminal();
                Some(Ok(instruction))
            }
            None => {
                self.done = true;
                Some(Err(QutErrorCode::InvalidProgram))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::{Arm, X86_64};

    fn decode_all(bytes: &[u8]) -> Vec<Result<QutInstruction, QutErrorCode>> {
        ProgramIter::new(bytes, 0).collect()
    }

    #[test]
    fn ehabi_style_program() {
        let mut program = QutProgram::new();
        program.push(QutInstruction::LoadReg(Arm::R7, 0));
        program.push(QutInstruction::LoadReg(Arm::R14, 4));
        program.push(QutInstruction::AddVsp(8));
        program.push(QutInstruction::SetPcFromReg(Arm::R14));
        let bytes = program.encode().unwrap();
        assert_eq!(bytes, vec![0x03, 7, 0, 0x03, 14, 4, 0x02, 8, 0x06, 14, 0x07]);

        let decoded: Vec<_> = decode_all(&bytes).into_iter().map(Result::unwrap).collect();
        assert_eq!(&decoded[..4], program.instructions());
        assert_eq!(decoded[4], QutInstruction::End);
    }

    #[test]
    fn large_and_negative_offsets() {
        let mut program = QutProgram::new();
        program.push(QutInstruction::SetVspFromReg(X86_64::RBP));
        program.push(QutInstruction::AddVsp(0x1234_5678));
        program.push(QutInstruction::LoadReg(X86_64::RBP, -16));
        program.push(QutInstruction::CopyReg {
            dst: X86_64::RBX,
            src: X86_64::R12,
        });
        program.push(QutInstruction::ValOffset(X86_64::R13, -64));
        let bytes = program.encode().unwrap();
        let decoded: Vec<_> = decode_all(&bytes).into_iter().map(Result::unwrap).collect();
        assert_eq!(&decoded[..5], program.instructions());
    }

    #[test]
    fn offsets_are_sleb128() {
        let mut program = QutProgram::new();
        program.push(QutInstruction::AddVsp(-8));
        program.push(QutInstruction::AddVsp(64));
        program.push(QutInstruction::LoadReg(Arm::R4, -129));
        let bytes = program.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x02, 0x78, 0x02, 0xc0, 0x00, 0x03, 4, 0xff, 0x7e, 0x07]
        );
    }

    #[test]
    fn decoding_stops_at_terminal() {
        let bytes = [OP_NO_CALLER, OP_ADD_VSP, 4, OP_END];
        assert_eq!(decode_all(&bytes), vec![Ok(QutInstruction::NoCaller)]);
        assert_eq!(
            ProgramIter::new(&bytes, 1).collect::<Vec<_>>(),
            vec![Ok(QutInstruction::AddVsp(4)), Ok(QutInstruction::End)]
        );
    }

    #[test]
    fn garbage_is_an_invalid_program() {
        assert_eq!(decode_all(&[0xff]), vec![Err(QutErrorCode::InvalidProgram)]);
        assert_eq!(decode_all(&[OP_LOAD_REG, 3]), vec![Err(QutErrorCode::InvalidProgram)]);
        assert_eq!(
            ProgramIter::new(&[OP_END], 10).collect::<Vec<_>>(),
            vec![Err(QutErrorCode::InvalidProgram)]
        );
    }

    #[test]
    fn wide_registers_are_unsupported() {
        let mut program = QutProgram::new();
        program.push(QutInstruction::SetVspFromReg(Register(300)));
        assert_eq!(program.encode(), Err(QutErrorCode::UnsupportedEncoding));
    }
}
