use super::instructions::{ProgramIter, QutProgram};
use crate::error::QutErrorCode;
use log::trace;
use std::collections::HashMap;

/// One compiled address range `[start, end)` and the offset of its program in
/// the shared bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QutEntry {
    pub start: u64,
    pub end: u64,
    pub program: u32,
}

impl QutEntry {
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// The compiled quicken table of one image. Sorted, non-overlapping, never
/// modified after [`TableBuilder::build`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct QutSections {
    entries: Vec<QutEntry>,
    bytecode: Vec<u8>,
}

impl QutSections {
    pub fn find_entry(&self, pc: u64) -> Option<u32> {
        let idx = self.entries.partition_point(|entry| entry.start <= pc);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        entry.contains(pc).then_some(entry.program)
    }

    pub fn program(&self, offset: u32) -> ProgramIter<'_> {
        ProgramIter::new(&self.bytecode, offset)
    }

    pub fn entries(&self) -> &[QutEntry] {
        &self.entries
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects compiled entries from a decoder, keeping per-entry failures as
/// diagnostics instead of aborting.
#[derive(Debug, Default)]
pub struct TableBuilder {
    entries: Vec<QutEntry>,
    bytecode: Vec<u8>,
    programs: HashMap<Vec<u8>, u32>,
    bad_entries: usize,
    last_error: QutErrorCode,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: u64, end: u64, program: &QutProgram) {
        if end <= start {
            trace!("dropping empty range {:#x}..{:#x}", start, end);
            return;
        }
        let bytes = match program.encode() {
            Ok(bytes) => bytes,
            Err(code) => return self.bad_entry(code),
        };
        let offset = match self.programs.get(&bytes) {
            Some(offset) => *offset,
            None => {
                let Ok(offset) = u32::try_from(self.bytecode.len()) else {
                    return self.bad_entry(QutErrorCode::UnsupportedEncoding);
                };
                self.bytecode.extend_from_slice(&bytes);
                self.programs.insert(bytes, offset);
                offset
            }
        };
        self.entries.push(QutEntry {
            start,
            end,
            program: offset,
        });
    }

    pub fn bad_entry(&mut self, code: QutErrorCode) {
        self.add_bad_entries(1, code);
    }

    pub fn add_bad_entries(&mut self, count: usize, code: QutErrorCode) {
        self.bad_entries += count;
        self.last_error = code;
    }

    pub fn bad_entries(&self) -> usize {
        self.bad_entries
    }

    pub fn last_error(&self) -> QutErrorCode {
        self.last_error
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts entries, drops the ones hidden by an earlier range, clips partial
    /// overlaps and merges neighbours running the same program.
    pub fn build(mut self) -> (QutSections, usize, QutErrorCode) {
        self.entries.sort_by_key(|entry| entry.start);

        let mut entries: Vec<QutEntry> = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries {
            if let Some(prev) = entries.last_mut() {
                if entry.start < prev.end {
                    if entry.end <= prev.end {
                        trace!("dropping overlapped range {:#x}..{:#x}", entry.start, entry.end);
                        self.bad_entries += 1;
                        self.last_error = QutErrorCode::MalformedSection;
                        continue;
                    }
                    entry.start = prev.end;
                }
                if entry.start == prev.end && entry.program == prev.program {
                    prev.end = entry.end;
                    continue;
                }
            }
            entries.push(entry);
        }

        let sections = QutSections {
            entries,
            bytecode: self.bytecode,
        };
        (sections, self.bad_entries, self.last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quicken::instructions::QutInstruction;
    use gimli::Arm;

    fn pop(offset: i64) -> QutProgram {
        let mut program = QutProgram::new();
        program.push(QutInstruction::LoadReg(Arm::R14, offset));
        program.push(QutInstruction::AddVsp(offset + 4));
        program
    }

    fn sections(ranges: &[(u64, u64, i64)]) -> (QutSections, usize, QutErrorCode) {
        let mut builder = TableBuilder::new();
        for (start, end, offset) in ranges {
            builder.add(*start, *end, &pop(*offset));
        }
        builder.build()
    }

    #[test]
    fn finds_entries_in_half_open_ranges() {
        let (table, bad, _) = sections(&[(0x300, 0x400, 8), (0x100, 0x200, 0), (0x200, 0x300, 4)]);
        assert_eq!(bad, 0);
        assert_eq!(table.len(), 3);

        assert_eq!(table.find_entry(0xff), None);
        let first = table.find_entry(0x100).unwrap();
        assert_eq!(table.find_entry(0x1ff), Some(first));
        let second = table.find_entry(0x200).unwrap();
        assert_ne!(first, second);
        assert!(table.find_entry(0x3ff).is_some());
        assert_eq!(table.find_entry(0x400), None);
    }

    #[test]
    fn gaps_are_misses() {
        let (table, _, _) = sections(&[(0x100, 0x180, 0), (0x200, 0x300, 4)]);
        assert_eq!(table.find_entry(0x180), None);
        assert_eq!(table.find_entry(0x1ff), None);
        assert!(table.find_entry(0x200).is_some());
    }

    #[test]
    fn identical_programs_share_bytecode_and_merge() {
        let (table, _, _) = sections(&[(0x100, 0x200, 0), (0x200, 0x300, 0), (0x400, 0x500, 0)]);
        assert_eq!(
            table.entries(),
            &[
                QutEntry {
                    start: 0x100,
                    end: 0x300,
                    program: 0
                },
                QutEntry {
                    start: 0x400,
                    end: 0x500,
                    program: 0
                },
            ]
        );
        assert_eq!(table.bytecode().len(), pop(0).encode().unwrap().len());
    }

    #[test]
    fn zero_width_and_overlapping_ranges() {
        let (table, bad, code) =
            sections(&[(0x100, 0x100, 0), (0x100, 0x200, 0), (0x120, 0x180, 4), (0x180, 0x280, 8)]);
        assert_eq!(bad, 1);
        assert_eq!(code, QutErrorCode::MalformedSection);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries()[1].start, 0x200);
        assert_eq!(table.entries()[1].end, 0x280);
        for pair in table.entries().windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn unencodable_programs_count_as_bad() {
        let mut builder = TableBuilder::new();
        let mut program = QutProgram::new();
        program.push(QutInstruction::SetVspFromReg(gimli::Register(400)));
        builder.add(0, 4, &program);
        let (table, bad, code) = builder.build();
        assert!(table.is_empty());
        assert_eq!(bad, 1);
        assert_eq!(code, QutErrorCode::UnsupportedEncoding);
    }
}
