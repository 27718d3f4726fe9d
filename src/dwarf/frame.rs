//! CFI Unwinder
//!
//! Parses `.debug_frame` into Common Information Entries and Frame
//! Description Entries, and replays their instruction streams to find the
//! Canonical Frame Address at a given program counter.
//!
//! Only version 1 CIEs without augmentation are accepted; GCC emits this
//! form for embedded ARM targets regardless of the `.debug_info` version.
//! Only the CFA rule is tracked. Register rules are decoded far enough to
//! skip them; the ones that would change how the CFA is computed report
//! [`FrameError::NotImplemented`] when replayed before the target address.

use crate::coproc::Coprocessor;
use gimli::{EndianSlice, Reader, RunTimeEndian};
use std::collections::HashMap;
use thiserror::Error;

/// CIE identifier in `.debug_frame`
pub const CIE_ID: u32 = 0xffff_ffff;

/// The only supported CIE version
pub const SUPPORTED_CIE_VERSION: u8 = 1;

/// Errors from parsing or replaying call frame information
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// CIE version other than 1
    #[error("unsupported CIE version {0}")]
    UnsupportedCieVersion(u8),

    /// CIE carries an augmentation string
    #[error("unsupported CIE augmentation {0:?}")]
    Augmentation(String),

    /// 64-bit DWARF frame entry
    #[error("64-bit call frame entries are not supported")]
    Dwarf64,

    /// No FDE covers the address
    #[error("no frame description covers 0x{0:08x}")]
    NoFde(u32),

    /// A CFA instruction the unwinder does not implement was needed
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// An FDE points at an offset that holds no CIE
    #[error("FDE references unknown CIE at offset 0x{0:x}")]
    UnknownCie(usize),

    /// The CFA base register could not be read
    #[error("register r{0} unavailable")]
    RegisterUnavailable(u16),

    /// An entry ended early
    #[error("truncated call frame entry")]
    Truncated,
}

impl From<gimli::Error> for FrameError {
    fn from(_: gimli::Error) -> Self {
        FrameError::Truncated
    }
}

/// A Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    /// Offset in `.debug_frame`
    pub offset: usize,
    /// Multiplier for advance instructions
    pub code_align: u32,
    /// Multiplier for factored offsets
    pub data_align: i64,
    /// Return address register
    pub return_register: u16,
    /// Initial instructions
    pub instructions: Vec<u8>,
}

/// A Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    /// Offset in `.debug_frame`
    pub offset: usize,
    /// Offset of the owning CIE
    pub cie: usize,
    /// First covered address
    pub start: u32,
    /// Number of covered bytes
    pub length: u32,
    /// Instructions
    pub instructions: Vec<u8>,
}

impl Fde {
    /// Check whether `pc` is covered
    pub fn contains(&self, pc: u32) -> bool {
        pc >= self.start && (pc - self.start) < self.length
    }
}

/// CFA rule in effect at some location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRow {
    /// First address the row applies to
    pub location: u32,
    /// Register the CFA is computed from
    pub cfa_register: u16,
    /// Offset added to the register
    pub cfa_offset: i64,
}

/// Parsed `.debug_frame`
#[derive(Debug, Clone, Default)]
pub struct FrameSection {
    cies: HashMap<usize, Cie>,
    fdes: Vec<Fde>,
    endian: RunTimeEndian,
}

impl FrameSection {
    /// Parse a `.debug_frame` section
    pub fn parse(data: &[u8], endian: RunTimeEndian) -> Result<Self, FrameError> {
        let mut reader = EndianSlice::new(data, endian);
        let mut cies = HashMap::new();
        let mut fdes = Vec::new();

        while !reader.is_empty() {
            let offset = data.len() - reader.len();
            let length = reader.read_u32()?;
            if length == 0xffff_ffff {
                return Err(FrameError::Dwarf64);
            }
            if length == 0 {
                continue;
            }
            let mut body = reader.split(length as usize)?;
            let id = body.read_u32()?;

            if id == CIE_ID {
                cies.insert(offset, parse_cie(offset, &mut body)?);
            } else {
                fdes.push(Fde {
                    offset,
                    cie: id as usize,
                    start: body.read_u32()?,
                    length: body.read_u32()?,
                    instructions: body.slice().to_vec(),
                });
            }
        }

        if let Some(orphan) = fdes.iter().find(|fde| !cies.contains_key(&fde.cie)) {
            return Err(FrameError::UnknownCie(orphan.cie));
        }
        fdes.sort_by_key(|fde| fde.start);

        tracing::debug!("Parsed {} CIEs and {} FDEs", cies.len(), fdes.len());
        Ok(Self { cies, fdes, endian })
    }

    /// Number of frame description entries
    pub fn fde_count(&self) -> usize {
        self.fdes.len()
    }

    /// The FDE covering `pc`
    pub fn fde_for(&self, pc: u32) -> Option<&Fde> {
        let idx = self.fdes.partition_point(|fde| fde.start <= pc);
        self.fdes[..idx].iter().rev().find(|fde| fde.contains(pc))
    }

    /// The CFA rule in effect at `pc`
    pub fn unwind(&self, pc: u32) -> Result<FrameRow, FrameError> {
        let fde = self.fde_for(pc).ok_or(FrameError::NoFde(pc))?;
        let cie = self
            .cies
            .get(&fde.cie)
            .ok_or(FrameError::UnknownCie(fde.cie))?;

        let mut table = FrameTable::new(fde.start);
        if table.replay(&cie.instructions, cie, pc, self.endian)? == Replay::Finished {
            table.initial = table.current;
            table.replay(&fde.instructions, cie, pc, self.endian)?;
        }

        tracing::trace!("CFA rule at 0x{:08x}: {:?}", pc, table.current);
        Ok(table.current)
    }

    /// Compute the CFA at `pc` from the current register values
    pub fn cfa(&self, coproc: &dyn Coprocessor, pc: u32) -> Result<u32, FrameError> {
        let row = self.unwind(pc)?;
        let base = coproc
            .register(row.cfa_register)
            .ok_or(FrameError::RegisterUnavailable(row.cfa_register))?;
        Ok((base as i64).wrapping_add(row.cfa_offset) as u32)
    }
}

fn parse_cie(offset: usize, body: &mut EndianSlice<'_, RunTimeEndian>) -> Result<Cie, FrameError> {
    let version = body.read_u8()?;
    if version != SUPPORTED_CIE_VERSION {
        return Err(FrameError::UnsupportedCieVersion(version));
    }
    let augmentation = body.read_null_terminated_slice()?;
    if !augmentation.is_empty() {
        return Err(FrameError::Augmentation(
            String::from_utf8_lossy(augmentation.slice()).into_owned(),
        ));
    }

    Ok(Cie {
        offset,
        code_align: body.read_uleb128()? as u32,
        data_align: body.read_sleb128()?,
        return_register: body.read_u8()? as u16,
        instructions: body.slice().to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Every instruction was applied
    Finished,
    /// An advance would have passed the target address
    Reached,
}

/// Current and remembered rows of the frame table
struct FrameTable {
    current: FrameRow,
    initial: FrameRow,
    remembered: Option<FrameRow>,
}

impl FrameTable {
    fn new(start: u32) -> Self {
        let row = FrameRow {
            location: start,
            cfa_register: 0,
            cfa_offset: 0,
        };
        Self {
            current: row,
            initial: row,
            remembered: None,
        }
    }

    /// Move to a new location unless that passes `target`
    fn advance(&mut self, location: u32, target: u32) -> Replay {
        if location > target {
            return Replay::Reached;
        }
        self.current.location = location;
        Replay::Finished
    }

    fn replay(
        &mut self,
        instructions: &[u8],
        cie: &Cie,
        target: u32,
        endian: RunTimeEndian,
    ) -> Result<Replay, FrameError> {
        let mut r = EndianSlice::new(instructions, endian);
        let factored = |value: i64| value.wrapping_mul(cie.data_align);

        while !r.is_empty() {
            let opcode = r.read_u8()?;
            let operand = opcode & 0x3f;

            let state = match opcode >> 6 {
                // DW_CFA_advance_loc
                0x1 => {
                    let delta = operand as u32 * cie.code_align;
                    self.advance(self.current.location.wrapping_add(delta), target)
                }
                // DW_CFA_offset
                0x2 => {
                    r.read_uleb128()?;
                    Replay::Finished
                }
                // DW_CFA_restore
                0x3 => Replay::Finished,
                _ => self.extended(opcode, &mut r, cie, target, &factored)?,
            };

            if state == Replay::Reached {
                return Ok(Replay::Reached);
            }
        }

        Ok(Replay::Finished)
    }

    fn extended(
        &mut self,
        opcode: u8,
        r: &mut EndianSlice<'_, RunTimeEndian>,
        cie: &Cie,
        target: u32,
        factored: &dyn Fn(i64) -> i64,
    ) -> Result<Replay, FrameError> {
        let location = self.current.location;
        let state = match opcode {
            0x00 => Replay::Finished,
            // DW_CFA_set_loc
            0x01 => {
                let address = r.read_u32()?;
                self.advance(address, target)
            }
            // DW_CFA_advance_loc1/2/4
            0x02 => {
                let delta = r.read_u8()? as u32 * cie.code_align;
                self.advance(location.wrapping_add(delta), target)
            }
            0x03 => {
                let delta = r.read_u16()? as u32 * cie.code_align;
                self.advance(location.wrapping_add(delta), target)
            }
            0x04 => {
                let delta = r.read_u32()?.wrapping_mul(cie.code_align);
                self.advance(location.wrapping_add(delta), target)
            }
            // DW_CFA_offset_extended
            0x05 => {
                r.read_uleb128()?;
                r.read_uleb128()?;
                Replay::Finished
            }
            // DW_CFA_restore_extended, DW_CFA_undefined, DW_CFA_same_value
            0x06..=0x08 => {
                r.read_uleb128()?;
                Replay::Finished
            }
            0x09 => return Err(FrameError::NotImplemented("DW_CFA_register")),
            // DW_CFA_remember_state
            0x0a => {
                self.remembered = Some(self.current);
                Replay::Finished
            }
            // DW_CFA_restore_state
            0x0b => {
                let restored = self.remembered.take().unwrap_or(self.initial);
                self.current.cfa_register = restored.cfa_register;
                self.current.cfa_offset = restored.cfa_offset;
                Replay::Finished
            }
            // DW_CFA_def_cfa
            0x0c => {
                self.current.cfa_register = r.read_uleb128()? as u16;
                self.current.cfa_offset = r.read_uleb128()? as i64;
                Replay::Finished
            }
            // DW_CFA_def_cfa_register
            0x0d => {
                self.current.cfa_register = r.read_uleb128()? as u16;
                Replay::Finished
            }
            // DW_CFA_def_cfa_offset
            0x0e => {
                self.current.cfa_offset = r.read_uleb128()? as i64;
                Replay::Finished
            }
            0x0f => return Err(FrameError::NotImplemented("DW_CFA_def_cfa_expression")),
            0x10 => return Err(FrameError::NotImplemented("DW_CFA_expression")),
            // DW_CFA_offset_extended_sf
            0x11 => {
                r.read_uleb128()?;
                r.read_sleb128()?;
                Replay::Finished
            }
            // DW_CFA_def_cfa_sf
            0x12 => {
                self.current.cfa_register = r.read_uleb128()? as u16;
                self.current.cfa_offset = factored(r.read_sleb128()?);
                Replay::Finished
            }
            // DW_CFA_def_cfa_offset_sf
            0x13 => {
                self.current.cfa_offset = factored(r.read_sleb128()?);
                Replay::Finished
            }
            0x14 => return Err(FrameError::NotImplemented("DW_CFA_val_offset")),
            0x15 => return Err(FrameError::NotImplemented("DW_CFA_val_offset_sf")),
            0x16 => return Err(FrameError::NotImplemented("DW_CFA_val_expression")),
            // DW_CFA_GNU_args_size
            0x2e => {
                r.read_uleb128()?;
                Replay::Finished
            }
            0x2f => {
                return Err(FrameError::NotImplemented(
                    "DW_CFA_GNU_negative_offset_extended",
                ))
            }
            _ => return Err(FrameError::NotImplemented("unknown CFA instruction")),
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coproc::MockCoprocessor;
    use mockall::predicate::eq;

    fn entry(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn cie(instructions: &[u8]) -> Vec<u8> {
        // id, version 1, empty augmentation, code_align 1, data_align -4, ra r14
        let mut body = vec![0xff, 0xff, 0xff, 0xff, 0x01, 0x00, 0x01, 0x7c, 0x0e];
        body.extend_from_slice(instructions);
        entry(&body)
    }

    fn fde(cie: u32, start: u32, length: u32, instructions: &[u8]) -> Vec<u8> {
        let mut body = cie.to_le_bytes().to_vec();
        body.extend_from_slice(&start.to_le_bytes());
        body.extend_from_slice(&length.to_le_bytes());
        body.extend_from_slice(instructions);
        entry(&body)
    }

    fn sample_section() -> FrameSection {
        let mut data = cie(&[]);
        // def_cfa(r13, 0); advance_loc(4); def_cfa_offset(8)
        data.extend(fde(0, 0x1000, 0x20, &[0x0c, 0x0d, 0x00, 0x44, 0x0e, 0x08]));
        FrameSection::parse(&data, RunTimeEndian::Little).unwrap()
    }

    #[test]
    fn test_cfa_after_advance() {
        let frames = sample_section();
        let mut coproc = MockCoprocessor::new();
        coproc
            .expect_register()
            .with(eq(13))
            .return_const(Some(0x2000_0ff0u32));

        assert_eq!(frames.cfa(&coproc, 0x1008).unwrap(), 0x2000_0ff8);
        assert_eq!(frames.cfa(&coproc, 0x1004).unwrap(), 0x2000_0ff8);
        assert_eq!(frames.cfa(&coproc, 0x1002).unwrap(), 0x2000_0ff0);
    }

    #[test]
    fn test_rows_before_and_after_advance() {
        let frames = sample_section();
        let before = frames.unwind(0x1000).unwrap();
        assert_eq!((before.cfa_register, before.cfa_offset), (13, 0));
        let after = frames.unwind(0x101f).unwrap();
        assert_eq!((after.cfa_register, after.cfa_offset, after.location), (13, 8, 0x1004));
    }

    #[test]
    fn test_no_fde_outside_ranges() {
        let frames = sample_section();
        assert_eq!(frames.unwind(0x1020), Err(FrameError::NoFde(0x1020)));
        assert_eq!(frames.unwind(0x0fff), Err(FrameError::NoFde(0x0fff)));
    }

    #[test]
    fn test_cie_initial_instructions_apply() {
        let mut data = cie(&[0x0c, 0x0d, 0x00]);
        data.extend(fde(0, 0x2000, 0x10, &[0x42, 0x0e, 0x10]));
        let frames = FrameSection::parse(&data, RunTimeEndian::Little).unwrap();
        assert_eq!(frames.unwind(0x2000).unwrap().cfa_register, 13);
        assert_eq!(frames.unwind(0x2002).unwrap().cfa_offset, 16);
    }

    #[test]
    fn test_remember_and_restore_state() {
        let mut data = cie(&[0x0c, 0x0d, 0x00]);
        // offset 8, remember, offset 24 @+2, restore @+4
        let instructions = [0x0e, 0x08, 0x0a, 0x42, 0x0e, 0x18, 0x42, 0x0b];
        data.extend(fde(0, 0x3000, 0x10, &instructions));
        let frames = FrameSection::parse(&data, RunTimeEndian::Little).unwrap();
        assert_eq!(frames.unwind(0x3000).unwrap().cfa_offset, 8);
        assert_eq!(frames.unwind(0x3002).unwrap().cfa_offset, 24);
        assert_eq!(frames.unwind(0x3004).unwrap().cfa_offset, 8);
    }

    #[test]
    fn test_factored_offsets() {
        let mut data = cie(&[]);
        // def_cfa_sf(r7, -2) => offset 8 with data_align -4
        data.extend(fde(0, 0x4000, 0x10, &[0x12, 0x07, 0x7e]));
        let frames = FrameSection::parse(&data, RunTimeEndian::Little).unwrap();
        let row = frames.unwind(0x4000).unwrap();
        assert_eq!((row.cfa_register, row.cfa_offset), (7, 8));
    }

    #[test]
    fn test_register_rules_are_skipped() {
        let mut data = cie(&[0x0c, 0x0d, 0x00]);
        // DW_CFA_offset r14 factored 1; offset_extended r4 2; def_cfa_offset 8
        data.extend(fde(0, 0x5000, 0x10, &[0x8e, 0x01, 0x05, 0x04, 0x02, 0x0e, 0x08]));
        let frames = FrameSection::parse(&data, RunTimeEndian::Little).unwrap();
        assert_eq!(frames.unwind(0x5000).unwrap().cfa_offset, 8);
    }

    #[test]
    fn test_unimplemented_only_matters_before_target() {
        let mut data = cie(&[0x0c, 0x0d, 0x00]);
        // advance 4, then DW_CFA_def_cfa_expression
        data.extend(fde(0, 0x6000, 0x10, &[0x44, 0x0f, 0x01, 0x7d]));
        let frames = FrameSection::parse(&data, RunTimeEndian::Little).unwrap();
        assert!(frames.unwind(0x6000).is_ok());
        assert_eq!(
            frames.unwind(0x6004),
            Err(FrameError::NotImplemented("DW_CFA_def_cfa_expression"))
        );
    }

    #[test]
    fn test_rejects_cie_version_3() {
        let body = [0xff, 0xff, 0xff, 0xff, 0x03, 0x00, 0x01, 0x7c, 0x0e];
        let err = FrameSection::parse(&entry(&body), RunTimeEndian::Little).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedCieVersion(3));
    }

    #[test]
    fn test_rejects_augmentation() {
        let body = [0xff, 0xff, 0xff, 0xff, 0x01, b'z', b'R', 0x00, 0x01, 0x7c, 0x0e];
        let err = FrameSection::parse(&entry(&body), RunTimeEndian::Little).unwrap_err();
        assert_eq!(err, FrameError::Augmentation("zR".to_string()));
    }

    #[test]
    fn test_rejects_unknown_cie() {
        let data = fde(0x40, 0x1000, 0x10, &[]);
        let err = FrameSection::parse(&data, RunTimeEndian::Little).unwrap_err();
        assert_eq!(err, FrameError::UnknownCie(0x40));
    }

    #[test]
    fn test_rejects_dwarf64_and_truncation() {
        let data = [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        assert_eq!(
            FrameSection::parse(&data, RunTimeEndian::Little).unwrap_err(),
            FrameError::Dwarf64
        );
        let data = [0x10, 0, 0, 0, 0xff];
        assert_eq!(
            FrameSection::parse(&data, RunTimeEndian::Little).unwrap_err(),
            FrameError::Truncated
        );
    }

    #[test]
    fn test_missing_register_is_reported() {
        let frames = sample_section();
        let mut coproc = MockCoprocessor::new();
        coproc.expect_register().return_const(None::<u32>);
        assert_eq!(
            frames.cfa(&coproc, 0x1000),
            Err(FrameError::RegisterUnavailable(13))
        );
    }
}
