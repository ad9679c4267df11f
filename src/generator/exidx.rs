//! ARM EHABI (`.ARM.exidx` / `.ARM.extab`) to quicken.
//!
//! Source: Exception Handling ABI for the Arm Architecture, §6 (index table
//! entries) and §9.3 (frame unwinding instructions).

use super::{CfiDecoder, DecodeContext};
use crate::error::QutErrorCode;
use crate::frame_info::{CfiSource, FrameInfo};
use crate::memory::Memory;
use crate::quicken::{Addr32, AddressWidth, QutInstruction, QutProgram, TableBuilder};
use bit_field::BitField;
use gimli::{Arm, EndianSlice, LittleEndian, Reader, Register};
use log::{trace, warn};

const EXIDX_CANTUNWIND: u32 = 0x1;
const EXIDX_ENTRY_SIZE: u64 = 8;

/// One decoded EHABI unwind instruction. VFP pops only move vsp since the
/// quicken registers don't carry floating point state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhabiOp {
    VspAdd(i64),
    VspSet(Register),
    /// Pop core registers, bit n is rn.
    Pop(u16),
    Finish,
    RefuseToUnwind,
}

/// Decodes an opcode byte stream up to `Finish`, refuse-to-unwind or its end.
pub fn decode_ehabi(bytes: &[u8]) -> Result<Vec<EhabiOp>, QutErrorCode> {
    let mut reader = EndianSlice::new(bytes, LittleEndian);
    let mut ops = Vec::new();
    while !reader.is_empty() {
        let op = decode_op(&mut reader)?;
        ops.push(op);
        if matches!(op, EhabiOp::Finish | EhabiOp::RefuseToUnwind) {
            break;
        }
    }
    Ok(ops)
}

fn decode_op(reader: &mut EndianSlice<'_, LittleEndian>) -> Result<EhabiOp, QutErrorCode> {
    let mut next = || reader.read_u8().map_err(|_| QutErrorCode::MalformedSection);
    let op = next()?;
    let short = |op: u8| ((op.get_bits(0..6) as i64) << 2) + 4;

    let decoded = match op.get_bits(6..8) {
        0b00 => EhabiOp::VspAdd(short(op)),
        0b01 => EhabiOp::VspAdd(-short(op)),
        _ => match op.get_bits(4..8) {
            0b1000 => {
                let low = next()?;
                let mut mask = 0u16;
                mask.set_bits(12..16, op.get_bits(0..4) as u16);
                mask.set_bits(4..12, low as u16);
                if mask == 0 {
                    EhabiOp::RefuseToUnwind
                } else {
                    EhabiOp::Pop(mask)
                }
            }
            0b1001 => match op.get_bits(0..4) {
                // reserved for register to register moves
                13 | 15 => return Err(QutErrorCode::UnsupportedEncoding),
                n => EhabiOp::VspSet(Register(n as u16)),
            },
            0b1010 => {
                let mut mask = 0u16;
                for reg in 4..=4 + op.get_bits(0..3) as usize {
                    mask.set_bit(reg, true);
                }
                if op.get_bit(3) {
                    mask.set_bit(14, true);
                }
                EhabiOp::Pop(mask)
            }
            0b1011 => match op {
                0xb0 => EhabiOp::Finish,
                0xb1 => {
                    let mask = next()?;
                    if mask == 0 || mask.get_bits(4..8) != 0 {
                        return Err(QutErrorCode::UnsupportedEncoding);
                    }
                    EhabiOp::Pop(mask as u16)
                }
                0xb2 => {
                    let value = gimli::leb128::read::unsigned(reader)
                        .map_err(|_| QutErrorCode::MalformedSection)?;
                    if value > u32::MAX as u64 {
                        return Err(QutErrorCode::MalformedSection);
                    }
                    EhabiOp::VspAdd(0x204 + ((value as i64) << 2))
                }
                // FSTMFDX: pop d[ssss]..d[ssss+cccc], plus the format word
                0xb3 => {
                    let regs = next()?;
                    EhabiOp::VspAdd(8 * (regs.get_bits(0..4) as i64 + 1) + 4)
                }
                0xb4..=0xb7 => return Err(QutErrorCode::UnsupportedEncoding),
                _ => EhabiOp::VspAdd(8 * (op.get_bits(0..3) as i64 + 1) + 4),
            },
            0b1100 => match op {
                // VPUSH d16+ / d0+
                0xc8 | 0xc9 => {
                    let regs = next()?;
                    EhabiOp::VspAdd(8 * (regs.get_bits(0..4) as i64 + 1))
                }
                // iWMMXt and spare
                _ => return Err(QutErrorCode::UnsupportedEncoding),
            },
            0b1101 if !op.get_bit(3) => EhabiOp::VspAdd(8 * (op.get_bits(0..3) as i64 + 1)),
            _ => return Err(QutErrorCode::UnsupportedEncoding),
        },
    };
    Ok(decoded)
}

/// Lowers EHABI ops to a quicken program. Pops are folded into loads at a
/// pending vsp offset so one `AddVsp` covers the whole sequence.
fn compile(ops: &[EhabiOp]) -> QutProgram {
    let mut program = QutProgram::new();
    let mut pending = 0i64;
    let mut pc_popped = false;

    for op in ops {
        match *op {
            EhabiOp::VspAdd(n) => pending += n,
            EhabiOp::VspSet(reg) => {
                pending = 0;
                program.push(QutInstruction::SetVspFromReg(reg));
            }
            EhabiOp::Pop(mask) => {
                for reg in 0..16 {
                    if mask.get_bit(reg) {
                        program.push(QutInstruction::LoadReg(Register(reg as u16), pending));
                        pending += 4;
                    }
                }
                if mask.get_bit(13) {
                    pending = 0;
                    program.push(QutInstruction::SetVspFromReg(Arm::R13));
                }
                pc_popped |= mask.get_bit(15);
            }
            EhabiOp::Finish => break,
            EhabiOp::RefuseToUnwind => return QutProgram::no_caller(),
        }
    }

    if pending != 0 {
        program.push(QutInstruction::AddVsp(pending));
    }
    let pc = if pc_popped { Arm::R15 } else { Arm::R14 };
    program.push(QutInstruction::SetPcFromReg(pc));
    program
}

/// Resolves a prel31 field relative to `place`.
fn prel31(word: u32, place: u64) -> u64 {
    let mut offset = word;
    offset.set_bit(31, word.get_bit(30));
    Addr32::offset(place, offset as i32 as i64)
}

/// Opcode bytes of an `.ARM.extab` entry at file offset `offset`.
fn extab_opcodes(memory: &dyn Memory, offset: u64) -> Result<Vec<u8>, QutErrorCode> {
    let read = |offset: u64| memory.read_u32(offset).ok_or(QutErrorCode::BadMemoryRead);
    let header = read(offset)?;

    let (mut bytes, extra_words, words_at) = if header.get_bit(31) {
        if header.get_bits(28..31) != 0 {
            return Err(QutErrorCode::MalformedSection);
        }
        match header.get_bits(24..28) {
            0 => (header.to_be_bytes()[1..].to_vec(), 0, offset + 4),
            1 | 2 => (header.to_be_bytes()[2..].to_vec(), header.get_bits(16..24), offset + 4),
            personality => {
                trace!("unknown compact personality {}", personality);
                return Err(QutErrorCode::UnsupportedEncoding);
            }
        }
    } else {
        // generic personality routine, its data starts with the opcode words
        let data = read(offset + 4)?;
        (data.to_be_bytes()[1..].to_vec(), data.get_bits(24..32), offset + 8)
    };

    for word in 0..extra_words as u64 {
        bytes.extend_from_slice(&read(words_at + 4 * word)?.to_be_bytes());
    }
    Ok(bytes)
}

fn entry_program(
    memory: &dyn Memory,
    info: &FrameInfo,
    entry_vaddr: u64,
    word: u32,
) -> Result<QutProgram, QutErrorCode> {
    if word == EXIDX_CANTUNWIND {
        return Ok(QutProgram::no_caller());
    }
    let bytes = if word.get_bit(31) {
        if word.get_bits(24..31) != 0 {
            return Err(QutErrorCode::UnsupportedEncoding);
        }
        word.to_be_bytes()[1..].to_vec()
    } else {
        let extab = prel31(word, entry_vaddr + 4);
        // .ARM.extab shares the segment, and so the bias, of .ARM.exidx
        extab_opcodes(memory, info.vaddr_to_offset(extab))?
    };
    Ok(compile(&decode_ehabi(&bytes)?))
}

pub(crate) struct ExidxDecoder;

impl CfiDecoder for ExidxDecoder {
    fn source(&self) -> CfiSource {
        CfiSource::ArmExidx
    }

    fn decode(
        &self,
        ctx: &DecodeContext<'_>,
        builder: &mut TableBuilder,
    ) -> Result<(), QutErrorCode> {
        let info = ctx.infos.get(CfiSource::ArmExidx);
        let total = info.size / EXIDX_ENTRY_SIZE;
        if info.size % EXIDX_ENTRY_SIZE != 0 {
            builder.bad_entry(QutErrorCode::MalformedSection);
        }

        let mut starts: Vec<(u64, Option<QutProgram>)> = Vec::new();
        // end of the last read entry when the index is cut short
        let mut limit = u64::MAX;
        for index in 0..total {
            let offset = info.offset + index * EXIDX_ENTRY_SIZE;
            let entry_vaddr = Addr32::offset(info.vaddr(), (index * EXIDX_ENTRY_SIZE) as i64);
            let function = ctx.memory.read_u32(offset);
            let (Some(function), Some(word)) = (function, ctx.memory.read_u32(offset + 4)) else {
                if index == 0 {
                    return Err(QutErrorCode::BadMemoryRead);
                }
                warn!("exidx truncated at entry {} of {}", index, total);
                builder.add_bad_entries((total - index) as usize, QutErrorCode::MalformedSection);
                match function {
                    Some(function) => limit = prel31(function, entry_vaddr),
                    None => {
                        // nothing bounds the previous entry
                        if let Some((start, Some(_))) = starts.pop() {
                            trace!("dropping unbounded exidx entry {:#x}", start);
                            builder.bad_entry(QutErrorCode::MalformedSection);
                        }
                    }
                }
                break;
            };

            let start = prel31(function, entry_vaddr);
            let program = match entry_program(ctx.memory, &info, entry_vaddr, word) {
                Ok(program) => Some(program),
                Err(code) => {
                    trace!("exidx entry {:#x}: {}", start, code);
                    builder.bad_entry(code);
                    None
                }
            };
            starts.push((start, program));
        }

        for (index, (start, program)) in starts.iter().enumerate() {
            // a complete index's last entry runs to the end of the image
            let end = starts.get(index + 1).map_or(limit, |next| next.0);
            let Some(program) = program else {
                continue;
            };
            if end < *start {
                builder.bad_entry(QutErrorCode::MalformedSection);
                continue;
            }
            builder.add(*start, end, program);
        }
        Ok(())
    }
}
