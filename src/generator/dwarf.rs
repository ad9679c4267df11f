//! DWARF CFI (`.eh_frame`, `.eh_frame_hdr`, `.debug_frame`) to quicken.
//!
//! gimli evaluates every FDE into its unwind table; each row becomes one
//! quicken entry whose program recomputes the CFA and reloads the tracked
//! registers relative to it.

use super::{CfiDecoder, DecodeContext};
use crate::arch::{ArchInfo, REG_SLOTS};
use crate::error::QutErrorCode;
use crate::frame_info::CfiSource;
use crate::memory::read_section;
use crate::quicken::{AddressWidth, QutInstruction, QutProgram, TableBuilder};
use gimli::{
    BaseAddresses, CfaRule, CieOrFde, DebugFrame, EhFrame, EhFrameHdr,
    FrameDescriptionEntry, LittleEndian, Reader, Register, RegisterRule, UnwindContext,
    UnwindSection, UnwindTableRow,
};
use log::{debug, trace};
use std::marker::PhantomData;

fn check_register(reg: Register) -> Result<Register, QutErrorCode> {
    if (reg.0 as usize) < REG_SLOTS {
        Ok(reg)
    } else {
        Err(QutErrorCode::UnsupportedEncoding)
    }
}

/// Lowers one unwind table row.
fn compile_row<R: Reader>(
    info: &ArchInfo,
    row: &UnwindTableRow<R>,
) -> Result<QutProgram, QutErrorCode> {
    let mut program = QutProgram::new();

    match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            if *register != info.sp {
                program.push(QutInstruction::SetVspFromReg(check_register(*register)?));
            }
            if *offset != 0 {
                program.push(QutInstruction::AddVsp(*offset));
            }
        }
        _ => return Err(QutErrorCode::UnsupportedEncoding),
    }

    // Registers without a rule keep their value, which on ARM and AArch64 is
    // also how a leaf returns through lr.
    for (reg, rule) in row.registers() {
        let reg = *reg;
        if reg == info.return_address && matches!(rule, RegisterRule::Undefined) {
            return Ok(QutProgram::no_caller());
        }
        if reg == info.sp || !info.tracked.contains(&reg) {
            continue;
        }
        match rule {
            RegisterRule::Undefined | RegisterRule::SameValue => {}
            RegisterRule::Offset(offset) => program.push(QutInstruction::LoadReg(reg, *offset)),
            RegisterRule::ValOffset(offset) => {
                program.push(QutInstruction::ValOffset(reg, *offset))
            }
            RegisterRule::Register(src) => program.push(QutInstruction::CopyReg {
                dst: reg,
                src: check_register(*src)?,
            }),
            _ => return Err(QutErrorCode::UnsupportedEncoding),
        }
    }

    Ok(program)
}

/// Adds one entry per row of `fde`. Failures only cost the rows involved.
fn compile_fde<W, R, S>(
    info: &ArchInfo,
    section: &S,
    bases: &BaseAddresses,
    unwind: &mut UnwindContext<R>,
    fde: &FrameDescriptionEntry<R>,
    builder: &mut TableBuilder,
) where
    W: AddressWidth,
    R: Reader,
    S: UnwindSection<R>,
{
    let mut table = match fde.rows(section, bases, unwind) {
        Ok(table) => table,
        Err(e) => {
            trace!("fde at {:#x}: {}", fde.initial_address(), e);
            builder.bad_entry(e.into());
            return;
        }
    };

    loop {
        match table.next_row() {
            Ok(Some(row)) => match compile_row(info, row) {
                Ok(program) => builder.add(
                    W::wrap(row.start_address()),
                    W::wrap(row.end_address()),
                    &program,
                ),
                Err(code) => {
                    trace!("row at {:#x}: {}", row.start_address(), code);
                    builder.bad_entry(code);
                }
            },
            Ok(None) => break,
            Err(e) => {
                trace!("fde at {:#x}: {}", fde.initial_address(), e);
                builder.bad_entry(e.into());
                break;
            }
        }
    }
}

/// Walks every CIE/FDE of `section` in order.
fn walk_section<W, R, S>(
    info: &ArchInfo,
    section: &S,
    bases: &BaseAddresses,
    builder: &mut TableBuilder,
) -> Result<(), QutErrorCode>
where
    W: AddressWidth,
    R: Reader,
    S: UnwindSection<R>,
{
    let mut unwind = UnwindContext::new();
    let mut entries = section.entries(bases);
    let mut seen = 0usize;

    loop {
        match entries.next() {
            Ok(Some(CieOrFde::Cie(_))) => seen += 1,
            Ok(Some(CieOrFde::Fde(partial))) => {
                seen += 1;
                match partial.parse(|section, bases, offset| section.cie_from_offset(bases, offset))
                {
                    Ok(fde) => {
                        compile_fde::<W, _, _>(info, section, bases, &mut unwind, &fde, builder)
                    }
                    Err(e) => builder.bad_entry(e.into()),
                }
            }
            Ok(None) => break,
            Err(e) if seen == 0 => return Err(e.into()),
            Err(e) => {
                // entry lengths can't be trusted past this point
                debug!("stopping after {} entries: {}", seen, e);
                builder.bad_entry(e.into());
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    EhFrame,
    DebugFrame,
}

/// Linear walk over a whole `.eh_frame` or `.debug_frame`.
pub(crate) struct DwarfDecoder<W> {
    source: CfiSource,
    kind: SectionKind,
    _width: PhantomData<W>,
}

impl<W: AddressWidth> DwarfDecoder<W> {
    pub fn eh_frame(source: CfiSource) -> Self {
        Self {
            source,
            kind: SectionKind::EhFrame,
            _width: PhantomData,
        }
    }

    pub fn debug_frame(source: CfiSource) -> Self {
        Self {
            source,
            kind: SectionKind::DebugFrame,
            _width: PhantomData,
        }
    }
}

impl<W: AddressWidth> CfiDecoder for DwarfDecoder<W> {
    fn source(&self) -> CfiSource {
        self.source
    }

    fn decode(
        &self,
        ctx: &DecodeContext<'_>,
        builder: &mut TableBuilder,
    ) -> Result<(), QutErrorCode> {
        let frame_info = ctx.infos.get(self.source);
        let bytes = read_section(ctx.memory, frame_info.offset, frame_info.size)
            .ok_or(QutErrorCode::BadMemoryRead)?;
        let info = ctx.arch.info();

        match self.kind {
            SectionKind::EhFrame => {
                let bases = BaseAddresses::default().set_eh_frame(frame_info.vaddr());
                let mut section = EhFrame::new(&bytes, LittleEndian);
                section.set_address_size(W::SIZE);
                walk_section::<W, _, _>(info, &section, &bases, builder)
            }
            SectionKind::DebugFrame => {
                let bases = BaseAddresses::default();
                let mut section = DebugFrame::new(&bytes, LittleEndian);
                section.set_address_size(W::SIZE);
                walk_section::<W, _, _>(info, &section, &bases, builder)
            }
        }
    }
}

/// Follows the `.eh_frame_hdr` binary search table into `.eh_frame`, so only
/// FDEs the linker indexed are compiled.
pub(crate) struct EhFrameHdrDecoder<W> {
    hdr: CfiSource,
    eh_frame: CfiSource,
    _width: PhantomData<W>,
}

impl<W: AddressWidth> EhFrameHdrDecoder<W> {
    pub fn new(hdr: CfiSource, eh_frame: CfiSource) -> Self {
        Self {
            hdr,
            eh_frame,
            _width: PhantomData,
        }
    }
}

impl<W: AddressWidth> CfiDecoder for EhFrameHdrDecoder<W> {
    fn source(&self) -> CfiSource {
        self.hdr
    }

    fn decode(
        &self,
        ctx: &DecodeContext<'_>,
        builder: &mut TableBuilder,
    ) -> Result<(), QutErrorCode> {
        let hdr_info = ctx.infos.get(self.hdr);
        let eh_info = ctx.infos.get(self.eh_frame);
        let hdr_bytes = read_section(ctx.memory, hdr_info.offset, hdr_info.size)
            .ok_or(QutErrorCode::BadMemoryRead)?;
        let eh_bytes = read_section(ctx.memory, eh_info.offset, eh_info.size)
            .ok_or(QutErrorCode::BadMemoryRead)?;
        let info = ctx.arch.info();

        let bases = BaseAddresses::default()
            .set_eh_frame_hdr(hdr_info.vaddr())
            .set_eh_frame(eh_info.vaddr());
        let hdr = EhFrameHdr::new(&hdr_bytes, LittleEndian).parse(&bases, W::SIZE)?;
        let table = hdr.table().ok_or(QutErrorCode::MalformedSection)?;
        let mut eh_frame = EhFrame::new(&eh_bytes, LittleEndian);
        eh_frame.set_address_size(W::SIZE);

        let mut unwind = UnwindContext::new();
        let mut iter = table.iter(&bases);
        let mut seen = 0usize;
        loop {
            let (_, fde_ptr) = match iter.next() {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) if seen == 0 => return Err(e.into()),
                Err(e) => {
                    debug!("eh_frame_hdr table unreadable after {} entries: {}", seen, e);
                    builder.bad_entry(e.into());
                    break;
                }
            };
            seen += 1;

            let fde = table.pointer_to_offset(fde_ptr).and_then(|offset| {
                eh_frame.fde_from_offset(&bases, offset, |section, bases, offset| {
                    section.cie_from_offset(bases, offset)
                })
            });
            match fde {
                Ok(fde) => {
                    compile_fde::<W, _, _>(info, &eh_frame, &bases, &mut unwind, &fde, builder)
                }
                Err(e) => {
                    trace!("eh_frame_hdr entry {}: {}", seen, e);
                    builder.bad_entry(e.into());
                }
            }
        }
        Ok(())
    }
}
