//! Location-List Evaluator
//!
//! DWARF location expressions are decoded once with gimli into an owned
//! [`Op`] list and evaluated by a small 32-bit stack machine against a
//! [`Coprocessor`]. An expression resolves to a memory address, a direct
//! value (register-resident or computed), or a list of pieces for values
//! split across registers and memory.
//!
//! A `.debug_loc` list is a set of `[start, end)` ranges, each with its own
//! expression; [`Location::evaluate`] picks the one covering the current
//! program counter.

use super::frame::{FrameError, FrameSection};
use crate::coproc::Coprocessor;
use gimli::{EndianSlice, Reader, RunTimeEndian};
use thiserror::Error;

/// Location-list entry value that selects a new base address
pub const BASE_ADDRESS_SELECTION: u32 = 0xffff_ffff;

/// Upper bound on executed operations, guards against branch loops
pub const MAX_STEPS: usize = 4096;

const ENCODING: gimli::Encoding = gimli::Encoding {
    format: gimli::Format::Dwarf32,
    version: 4,
    address_size: 4,
};

/// Errors from decoding or evaluating a location expression
///
/// These never abort a build; the affected entity becomes "not locatable".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocError {
    /// The expression uses an operation this evaluator does not support
    #[error("unsupported operation {0}")]
    Unsupported(String),

    /// An operation needed more stack entries than were present
    #[error("expression stack underflow")]
    StackUnderflow,

    /// `DW_OP_fbreg` without a frame base
    #[error("no frame base for DW_OP_fbreg")]
    NoFrameBase,

    /// `DW_OP_call_frame_cfa` without call frame information
    #[error("no call frame information for DW_OP_call_frame_cfa")]
    NoFrameSection,

    /// The coprocessor could not report a register
    #[error("register r{0} unavailable")]
    RegisterUnavailable(u16),

    /// The coprocessor could not read memory
    #[error("memory at 0x{0:08x} unavailable")]
    MemoryUnavailable(u32),

    /// No location-list entry covers the program counter
    #[error("no location for pc 0x{0:08x}")]
    NoEntryForAddress(u32),

    /// Malformed expression or list bytes
    #[error("malformed location: {0}")]
    Decode(String),

    /// The unwinder failed
    #[error("unwinding failed: {0}")]
    Frame(#[from] FrameError),

    /// `DW_OP_div` or `DW_OP_mod` by zero
    #[error("division by zero")]
    DivideByZero,

    /// A branch target is not an operation boundary, or the step limit hit
    #[error("bad branch target")]
    BadBranch,
}

impl From<gimli::Error> for LocError {
    fn from(e: gimli::Error) -> Self {
        LocError::Decode(e.to_string())
    }
}

/// A decoded expression operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push a constant (`DW_OP_addr`, `DW_OP_lit*`, `DW_OP_const*`)
    Const(u32),
    /// The value lives in a register (`DW_OP_reg*`)
    Register(u16),
    /// Push register + offset (`DW_OP_breg*`)
    RegisterOffset { register: u16, offset: i32 },
    /// Push frame base + offset (`DW_OP_fbreg`)
    FrameOffset(i32),
    /// Push the CFA (`DW_OP_call_frame_cfa`)
    CallFrameCfa,
    /// Replace the top with the memory it points at
    Deref { size: u8 },
    /// Copy the entry `n` below the top (`DW_OP_dup`, `DW_OP_over`, `DW_OP_pick`)
    Pick(u8),
    Drop,
    Swap,
    Rot,
    Abs,
    And,
    Div,
    Minus,
    Mod,
    Mul,
    Neg,
    Not,
    Or,
    Plus,
    PlusConstant(u32),
    Shl,
    Shr,
    Shra,
    Xor,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Ne,
    /// Branch by a byte offset if the popped value is non-zero
    Bra(i16),
    /// Branch by a byte offset
    Skip(i16),
    Nop,
    /// Terminate a piece of `size` bytes
    Piece { size: u32 },
    /// The top of the stack is the value, not its address
    StackValue,
    /// A literal value (`DW_OP_implicit_value`), first four bytes
    ImplicitValue(u32),
}

/// Where one piece of a split value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceLocation {
    /// In memory at an address
    Address(u32),
    /// A value (register content or computed)
    Value(u32),
    /// Optimized away
    Empty,
}

/// One piece of a value split across locations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    /// Size of the piece in bytes
    pub size: u32,
    /// Location of the piece
    pub location: PieceLocation,
}

/// Outcome of evaluating a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocResult {
    /// The variable lives in memory at this address
    Address(u32),
    /// The variable's value, with no backing memory
    Value(u32),
    /// The variable is split into pieces
    Pieces(Vec<Piece>),
}

/// Evaluation context
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    /// Register and memory access
    pub coproc: &'a dyn Coprocessor,
    /// Program counter, used to select location-list entries
    pub pc: u32,
    /// Call frame information for `DW_OP_call_frame_cfa`
    pub frame: Option<&'a FrameSection>,
    /// Frame base of the enclosing function for `DW_OP_fbreg`
    pub frame_base: Option<&'a Location>,
}

impl<'a> EvalEnv<'a> {
    /// Context with no frame information
    pub fn new(coproc: &'a dyn Coprocessor, pc: u32) -> Self {
        Self {
            coproc,
            pc,
            frame: None,
            frame_base: None,
        }
    }

    /// Attach call frame information
    pub fn with_frame(mut self, frame: Option<&'a FrameSection>) -> Self {
        self.frame = frame;
        self
    }

    /// Attach the enclosing function's frame base
    pub fn with_frame_base(mut self, frame_base: Option<&'a Location>) -> Self {
        self.frame_base = frame_base;
        self
    }

    fn register(&self, register: u16) -> Result<u32, LocError> {
        self.coproc
            .register(register)
            .ok_or(LocError::RegisterUnavailable(register))
    }

    fn peek(&self, address: u32) -> Result<u32, LocError> {
        self.coproc
            .peek(address)
            .ok_or(LocError::MemoryUnavailable(address))
    }

    /// Frame base value; evaluated without a frame base of its own
    fn frame_base(&self) -> Result<u32, LocError> {
        let location = self.frame_base.ok_or(LocError::NoFrameBase)?;
        let env = EvalEnv {
            frame_base: None,
            ..*self
        };
        match location.evaluate(&env)? {
            LocResult::Address(address) => Ok(address),
            LocResult::Value(value) => Ok(value),
            LocResult::Pieces(_) => Err(LocError::Unsupported("split frame base".to_string())),
        }
    }
}

/// A decoded expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocExpr {
    /// Operations with their byte offset in the original expression
    ops: Vec<(usize, Op)>,
    /// Length of the encoded expression
    len: usize,
}

impl LocExpr {
    /// Decode an expression from its encoded bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, LocError> {
        let mut reader = EndianSlice::new(bytes, RunTimeEndian::Little);
        let mut ops = Vec::new();

        while !reader.is_empty() {
            let offset = bytes.len() - reader.len();
            let op = gimli::Operation::parse(&mut reader, ENCODING)?;
            ops.push((offset, convert_op(op)?));
        }

        Ok(Self {
            ops,
            len: bytes.len(),
        })
    }

    /// Build an expression from operations, assigning one byte per operation
    pub fn from_ops(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops: Vec<(usize, Op)> = ops.into_iter().enumerate().collect();
        let len = ops.len();
        Self { ops, len }
    }

    /// Decoded operations
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter().map(|(_, op)| op)
    }

    /// Whether the expression has no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Constant offset when the expression is a lone `DW_OP_plus_uconst`
    pub fn as_member_offset(&self) -> Option<u32> {
        match self.ops.as_slice() {
            [(_, Op::PlusConstant(offset))] => Some(*offset),
            [(_, Op::Const(offset)), (_, Op::Plus)] => Some(*offset),
            _ => None,
        }
    }

    /// Evaluate against an empty stack
    pub fn evaluate(&self, env: &EvalEnv<'_>) -> Result<LocResult, LocError> {
        self.run(env, Vec::new())
    }

    /// Evaluate with `base` pre-pushed, as for member locations
    pub fn evaluate_with_base(&self, env: &EvalEnv<'_>, base: u32) -> Result<LocResult, LocError> {
        self.run(env, vec![base])
    }

    fn run(&self, env: &EvalEnv<'_>, mut stack: Vec<u32>) -> Result<LocResult, LocError> {
        let mut pieces = Vec::new();
        // Set by DW_OP_reg* and DW_OP_stack_value until the next piece
        let mut value: Option<u32> = None;
        let mut index = 0;
        let mut steps = 0;

        while let Some((_, op)) = self.ops.get(index) {
            steps += 1;
            if steps > MAX_STEPS {
                return Err(LocError::BadBranch);
            }
            index += 1;

            match *op {
                Op::Const(v) => stack.push(v),
                Op::Register(register) => value = Some(env.register(register)?),
                Op::RegisterOffset { register, offset } => {
                    stack.push(env.register(register)?.wrapping_add(offset as u32))
                }
                Op::FrameOffset(offset) => {
                    stack.push(env.frame_base()?.wrapping_add(offset as u32))
                }
                Op::CallFrameCfa => {
                    let frame = env.frame.ok_or(LocError::NoFrameSection)?;
                    stack.push(frame.cfa(env.coproc, env.pc)?);
                }
                Op::Deref { size } => {
                    let address = pop(&mut stack)?;
                    stack.push(mask(env.peek(address)?, size as u32));
                }
                Op::Pick(n) => {
                    let n = n as usize;
                    if n >= stack.len() {
                        return Err(LocError::StackUnderflow);
                    }
                    stack.push(stack[stack.len() - 1 - n]);
                }
                Op::Drop => {
                    pop(&mut stack)?;
                }
                Op::Swap => {
                    let a = pop(&mut stack)?;
                    let b = pop(&mut stack)?;
                    stack.push(a);
                    stack.push(b);
                }
                Op::Rot => {
                    let a = pop(&mut stack)?;
                    let b = pop(&mut stack)?;
                    let c = pop(&mut stack)?;
                    stack.push(a);
                    stack.push(c);
                    stack.push(b);
                }
                Op::Abs => {
                    let a = pop(&mut stack)? as i32;
                    stack.push(a.wrapping_abs() as u32);
                }
                Op::Neg => {
                    let a = pop(&mut stack)? as i32;
                    stack.push(a.wrapping_neg() as u32);
                }
                Op::Not => {
                    let a = pop(&mut stack)?;
                    stack.push(!a);
                }
                Op::PlusConstant(c) => {
                    let a = pop(&mut stack)?;
                    stack.push(a.wrapping_add(c));
                }
                Op::And
                | Op::Div
                | Op::Minus
                | Op::Mod
                | Op::Mul
                | Op::Or
                | Op::Plus
                | Op::Shl
                | Op::Shr
                | Op::Shra
                | Op::Xor
                | Op::Eq
                | Op::Ge
                | Op::Gt
                | Op::Le
                | Op::Lt
                | Op::Ne => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(binary(*op, lhs, rhs)?);
                }
                Op::Bra(target) => {
                    if pop(&mut stack)? != 0 {
                        index = self.branch(index, target)?;
                    }
                }
                Op::Skip(target) => index = self.branch(index, target)?,
                Op::Nop => {}
                Op::Piece { size } => {
                    let location = match (value.take(), stack.pop()) {
                        (Some(v), _) => PieceLocation::Value(v),
                        (None, Some(address)) => PieceLocation::Address(address),
                        (None, None) => PieceLocation::Empty,
                    };
                    pieces.push(Piece { size, location });
                }
                Op::StackValue => value = Some(pop(&mut stack)?),
                Op::ImplicitValue(v) => value = Some(v),
            }
        }

        if !pieces.is_empty() {
            return Ok(LocResult::Pieces(pieces));
        }
        if let Some(value) = value {
            return Ok(LocResult::Value(value));
        }
        stack
            .pop()
            .map(LocResult::Address)
            .ok_or(LocError::StackUnderflow)
    }

    /// Index of the operation `target` bytes after the one ending at `next`
    fn branch(&self, next: usize, target: i16) -> Result<usize, LocError> {
        let end = self
            .ops
            .get(next)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.len);
        let destination = end as i64 + target as i64;
        if destination == self.len as i64 {
            return Ok(self.ops.len());
        }
        self.ops
            .iter()
            .position(|(offset, _)| *offset as i64 == destination)
            .ok_or(LocError::BadBranch)
    }
}

fn pop(stack: &mut Vec<u32>) -> Result<u32, LocError> {
    stack.pop().ok_or(LocError::StackUnderflow)
}

fn mask(value: u32, size: u32) -> u32 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        _ => value,
    }
}

fn binary(op: Op, lhs: u32, rhs: u32) -> Result<u32, LocError> {
    let (sl, sr) = (lhs as i32, rhs as i32);
    Ok(match op {
        Op::And => lhs & rhs,
        Op::Or => lhs | rhs,
        Op::Xor => lhs ^ rhs,
        Op::Plus => lhs.wrapping_add(rhs),
        Op::Minus => lhs.wrapping_sub(rhs),
        Op::Mul => lhs.wrapping_mul(rhs),
        Op::Div => {
            if rhs == 0 {
                return Err(LocError::DivideByZero);
            }
            sl.wrapping_div(sr) as u32
        }
        Op::Mod => {
            if rhs == 0 {
                return Err(LocError::DivideByZero);
            }
            lhs % rhs
        }
        Op::Shl => lhs.checked_shl(rhs).unwrap_or(0),
        Op::Shr => lhs.checked_shr(rhs).unwrap_or(0),
        Op::Shra => sl.checked_shr(rhs).unwrap_or(if sl < 0 { -1 } else { 0 }) as u32,
        Op::Eq => (sl == sr) as u32,
        Op::Ge => (sl >= sr) as u32,
        Op::Gt => (sl > sr) as u32,
        Op::Le => (sl <= sr) as u32,
        Op::Lt => (sl < sr) as u32,
        Op::Ne => (sl != sr) as u32,
        _ => return Err(LocError::Unsupported(format!("{:?}", op))),
    })
}

fn convert_op(op: gimli::Operation<EndianSlice<'_, RunTimeEndian>>) -> Result<Op, LocError> {
    use gimli::Operation as G;

    Ok(match op {
        G::Address { address } => Op::Const(address as u32),
        G::UnsignedConstant { value } => Op::Const(value as u32),
        G::SignedConstant { value } => Op::Const(value as u32),
        G::Register { register } => Op::Register(register.0),
        G::RegisterOffset {
            register, offset, ..
        } => Op::RegisterOffset {
            register: register.0,
            offset: offset as i32,
        },
        G::FrameOffset { offset } => Op::FrameOffset(offset as i32),
        G::CallFrameCFA => Op::CallFrameCfa,
        G::Deref { size, space, .. } => {
            if space {
                return Err(LocError::Unsupported("DW_OP_xderef".to_string()));
            }
            Op::Deref { size }
        }
        G::Pick { index } => Op::Pick(index),
        G::Drop => Op::Drop,
        G::Swap => Op::Swap,
        G::Rot => Op::Rot,
        G::Abs => Op::Abs,
        G::And => Op::And,
        G::Div => Op::Div,
        G::Minus => Op::Minus,
        G::Mod => Op::Mod,
        G::Mul => Op::Mul,
        G::Neg => Op::Neg,
        G::Not => Op::Not,
        G::Or => Op::Or,
        G::Plus => Op::Plus,
        G::PlusConstant { value } => Op::PlusConstant(value as u32),
        G::Shl => Op::Shl,
        G::Shr => Op::Shr,
        G::Shra => Op::Shra,
        G::Xor => Op::Xor,
        G::Eq => Op::Eq,
        G::Ge => Op::Ge,
        G::Gt => Op::Gt,
        G::Le => Op::Le,
        G::Lt => Op::Lt,
        G::Ne => Op::Ne,
        G::Bra { target } => Op::Bra(target),
        G::Skip { target } => Op::Skip(target),
        G::Nop => Op::Nop,
        G::Piece {
            size_in_bits,
            bit_offset: None,
        } if size_in_bits % 8 == 0 => Op::Piece {
            size: (size_in_bits / 8) as u32,
        },
        G::StackValue => Op::StackValue,
        G::ImplicitValue { data } => {
            let bytes = data.slice();
            let mut word = [0u8; 4];
            for (dst, src) in word.iter_mut().zip(bytes) {
                *dst = *src;
            }
            Op::ImplicitValue(u32::from_le_bytes(word))
        }
        other => return Err(LocError::Unsupported(format!("{:?}", other))),
    })
}

/// A location: one expression, or a list selected by program counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Valid everywhere the owner is in scope
    Expr(LocExpr),
    /// Valid over the listed ranges only
    List(Vec<LocListEntry>),
}

impl Location {
    /// Evaluate at `env.pc`
    pub fn evaluate(&self, env: &EvalEnv<'_>) -> Result<LocResult, LocError> {
        match self {
            Location::Expr(expr) => expr.evaluate(env),
            Location::List(entries) => entries
                .iter()
                .find(|entry| entry.contains(env.pc))
                .ok_or(LocError::NoEntryForAddress(env.pc))?
                .expr
                .evaluate(env),
        }
    }
}

/// One decoded location-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocListEntry {
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
    /// Expression valid over the range
    pub expr: LocExpr,
}

impl LocListEntry {
    /// Check whether `pc` lies in `[start, end)`
    pub fn contains(&self, pc: u32) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// One undecoded location-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLocEntry {
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
    /// Encoded expression
    pub expr: Vec<u8>,
}

/// The `.debug_loc` section
#[derive(Debug, Clone, Copy)]
pub struct LocSection<'a> {
    data: &'a [u8],
    endian: RunTimeEndian,
}

impl<'a> LocSection<'a> {
    /// Wrap raw section data
    pub fn new(data: &'a [u8], endian: RunTimeEndian) -> Self {
        Self { data, endian }
    }

    /// Read the list at `offset`; `base` is the owning unit's base address
    ///
    /// Empty ranges are dropped. A [`BASE_ADDRESS_SELECTION`] entry
    /// changes the base for the entries that follow.
    pub fn decode(&self, offset: usize, base: u32) -> Result<Vec<RawLocEntry>, LocError> {
        let mut reader = EndianSlice::new(self.data, self.endian);
        reader.skip(offset)?;

        let mut base = base;
        let mut entries = Vec::new();
        loop {
            let start = reader.read_u32()?;
            let end = reader.read_u32()?;
            if start == 0 && end == 0 {
                break;
            }
            if start == BASE_ADDRESS_SELECTION {
                base = end;
                continue;
            }
            let len = reader.read_u16()? as usize;
            let expr = reader.split(len)?.slice().to_vec();
            if end > start {
                entries.push(RawLocEntry {
                    start: base.wrapping_add(start),
                    end: base.wrapping_add(end),
                    expr,
                });
            }
        }
        Ok(entries)
    }

    /// Read and decode the list at `offset` into a [`Location`]
    pub fn location(&self, offset: usize, base: u32) -> Result<Location, LocError> {
        let entries = self
            .decode(offset, base)?
            .into_iter()
            .map(|raw| {
                Ok(LocListEntry {
                    start: raw.start,
                    end: raw.end,
                    expr: LocExpr::decode(&raw.expr)?,
                })
            })
            .collect::<Result<Vec<_>, LocError>>()?;
        Ok(Location::List(entries))
    }
}
