//! Builders for hand-assembled DWARF sections
//!
//! Each entry gets its own abbreviation, which keeps the encoder trivial:
//! the abbreviation table and `.debug_info` are written in one walk.

use super::{sleb, uleb};
use gimli::{DwAt, DwTag};
use std::collections::HashMap;

/// An attribute value and the form it is written with
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Data1(u8),
    Data4(u32),
    Addr(u32),
    /// `DW_FORM_ref4` to a labelled entry
    Ref(&'static str),
    Flag,
    Expr(Vec<u8>),
    SecOffset(u32),
}

impl Value {
    fn form(&self) -> u16 {
        match self {
            Value::Str(_) => 0x08,
            Value::Data1(_) => 0x0b,
            Value::Data4(_) => 0x06,
            Value::Addr(_) => 0x01,
            Value::Ref(_) => 0x13,
            Value::Flag => 0x19,
            Value::Expr(_) => 0x18,
            Value::SecOffset(_) => 0x17,
        }
    }
}

/// A debugging information entry and its children
#[derive(Debug, Clone)]
pub struct Die {
    tag: DwTag,
    label: Option<&'static str>,
    attrs: Vec<(DwAt, Value)>,
    children: Vec<Die>,
}

impl Die {
    pub fn new(tag: DwTag) -> Self {
        Self {
            tag,
            label: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn attr(mut self, name: DwAt, value: Value) -> Self {
        self.attrs.push((name, value));
        self
    }

    pub fn name(self, name: &str) -> Self {
        self.attr(gimli::DW_AT_name, Value::Str(name.to_string()))
    }

    pub fn type_ref(self, label: &'static str) -> Self {
        self.attr(gimli::DW_AT_type, Value::Ref(label))
    }

    /// `DW_AT_low_pc` plus a `DW_AT_high_pc` length
    pub fn code(self, low: u32, length: u32) -> Self {
        self.attr(gimli::DW_AT_low_pc, Value::Addr(low))
            .attr(gimli::DW_AT_high_pc, Value::Data4(length))
    }

    pub fn location(self, expr: Vec<u8>) -> Self {
        self.attr(gimli::DW_AT_location, Value::Expr(expr))
    }

    pub fn child(mut self, child: Die) -> Self {
        self.children.push(child);
        self
    }
}

/// Assembled `.debug_info` and `.debug_abbrev` for one unit
pub struct Unit {
    pub info: Vec<u8>,
    pub abbrev: Vec<u8>,
    /// Section offsets of labelled entries
    pub labels: HashMap<&'static str, u32>,
}

const UNIT_HEADER_SIZE: u32 = 11;

/// Assemble a DWARF 4 compile unit rooted at `root`
pub fn assemble_unit(root: &Die) -> Unit {
    let mut writer = UnitWriter::default();
    writer.emit(root);
    writer.abbrev.push(0);

    for (position, label) in &writer.fixups {
        let offset = writer.labels[label];
        writer.body[*position..*position + 4].copy_from_slice(&offset.to_le_bytes());
    }

    let mut info = Vec::new();
    info.extend_from_slice(&(7 + writer.body.len() as u32).to_le_bytes());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.push(4);
    info.extend_from_slice(&writer.body);

    Unit {
        info,
        abbrev: writer.abbrev,
        labels: writer.labels,
    }
}

#[derive(Default)]
struct UnitWriter {
    abbrev: Vec<u8>,
    body: Vec<u8>,
    code: u64,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<(usize, &'static str)>,
}

impl UnitWriter {
    fn emit(&mut self, die: &Die) {
        self.code += 1;
        uleb(&mut self.abbrev, self.code);
        uleb(&mut self.abbrev, die.tag.0 as u64);
        self.abbrev.push(u8::from(!die.children.is_empty()));
        for (name, value) in &die.attrs {
            uleb(&mut self.abbrev, name.0 as u64);
            uleb(&mut self.abbrev, value.form() as u64);
        }
        self.abbrev.extend_from_slice(&[0, 0]);

        if let Some(label) = die.label {
            self.labels
                .insert(label, UNIT_HEADER_SIZE + self.body.len() as u32);
        }
        uleb(&mut self.body, self.code);
        for (_, value) in &die.attrs {
            match value {
                Value::Str(s) => {
                    self.body.extend_from_slice(s.as_bytes());
                    self.body.push(0);
                }
                Value::Data1(v) => self.body.push(*v),
                Value::Data4(v) | Value::Addr(v) | Value::SecOffset(v) => {
                    self.body.extend_from_slice(&v.to_le_bytes())
                }
                Value::Ref(label) => {
                    self.fixups.push((self.body.len(), label));
                    self.body.extend_from_slice(&[0; 4]);
                }
                Value::Flag => {}
                Value::Expr(bytes) => {
                    uleb(&mut self.body, bytes.len() as u64);
                    self.body.extend_from_slice(bytes);
                }
            }
        }

        if !die.children.is_empty() {
            for child in &die.children {
                self.emit(child);
            }
            self.body.push(0);
        }
    }
}

/// A version 4 line program for one file: `(address, line)` rows, then an
/// end of sequence at `end`
pub fn line_program(file: &str, rows: &[(u32, u32)], end: u32) -> Vec<u8> {
    let mut header = vec![
        1,  // minimum_instruction_length
        1,  // maximum_operations_per_instruction
        1,  // default_is_stmt
        0xfb, // line_base -5
        14, // line_range
        13, // opcode_base
    ];
    header.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
    header.push(0); // no include directories
    header.extend_from_slice(file.as_bytes());
    header.extend_from_slice(&[0, 0, 0, 0]);
    header.push(0);

    let mut program = Vec::new();
    let mut address = 0u32;
    let mut line = 1i64;
    for (i, (row_address, row_line)) in rows.iter().enumerate() {
        if i == 0 {
            program.extend_from_slice(&[0x00, 5, 0x02]);
            program.extend_from_slice(&row_address.to_le_bytes());
        } else {
            program.push(0x02);
            uleb(&mut program, (row_address - address) as u64);
        }
        program.push(0x03);
        sleb(&mut program, *row_line as i64 - line);
        program.push(0x01);
        address = *row_address;
        line = *row_line as i64;
    }
    program.push(0x02);
    uleb(&mut program, (end - address) as u64);
    program.extend_from_slice(&[0x00, 0x01, 0x01]);

    let mut out = Vec::new();
    let unit_length = 2 + 4 + header.len() + program.len();
    out.extend_from_slice(&(unit_length as u32).to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&program);
    out
}

fn frame_entry(out: &mut Vec<u8>, body: &[u8]) {
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
}

/// A version 1 CIE: code align 1, data align -4, return address r14
pub fn cie(out: &mut Vec<u8>, version: u8, instructions: &[u8]) {
    let mut body = vec![0xff, 0xff, 0xff, 0xff, version, 0x00, 0x01, 0x7c, 0x0e];
    body.extend_from_slice(instructions);
    frame_entry(out, &body);
}

pub fn fde(out: &mut Vec<u8>, cie: u32, start: u32, length: u32, instructions: &[u8]) {
    let mut body = cie.to_le_bytes().to_vec();
    body.extend_from_slice(&start.to_le_bytes());
    body.extend_from_slice(&length.to_le_bytes());
    body.extend_from_slice(instructions);
    frame_entry(out, &body);
}

/// One `.debug_loc` entry
pub fn loc_entry(out: &mut Vec<u8>, start: u32, end: u32, expr: &[u8]) {
    out.extend_from_slice(&start.to_le_bytes());
    out.extend_from_slice(&end.to_le_bytes());
    out.extend_from_slice(&(expr.len() as u16).to_le_bytes());
    out.extend_from_slice(expr);
}

/// End of a `.debug_loc` or `.debug_ranges` list
pub fn list_end(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0; 8]);
}

/// One `.debug_ranges` pair
pub fn range_pair(out: &mut Vec<u8>, start: u32, end: u32) {
    out.extend_from_slice(&start.to_le_bytes());
    out.extend_from_slice(&end.to_le_bytes());
}
