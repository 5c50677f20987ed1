use core::fmt;

use crate::instruction::Instruction;
use crate::op::{IncludeKind, Op};

/// Reasons a byte sequence is not a valid top-level instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOp { offset: usize, byte: u8 },
    UnknownIncludeKind { offset: usize, byte: u8 },
    Truncated { offset: usize, op: Op },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOp { offset, byte } => {
                write!(f, "unknown opcode {byte:#04x} at offset {offset}")
            }
            Self::UnknownIncludeKind { offset, byte } => {
                write!(f, "unknown include kind {byte} at offset {offset}")
            }
            Self::Truncated { offset, op } => {
                write!(f, "truncated {op:?} at offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes a top-level bytecode slice into [`Instruction`]s.
///
/// Bytecode may come from a persisted unit, so every read is bounds
/// checked and malformed input is reported as a [`DecodeError`]. The
/// [`Iterator`] impl stops at the first error.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Start decoding at `offset`.
    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, pos: offset }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Move to an absolute byte offset (the target of a taken jump).
    #[inline(always)]
    pub fn set_offset(&mut self, offset: usize) {
        self.pos = offset;
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `Ok(None)` at end-of-stream.
    pub fn decode_next(&mut self) -> Result<Option<Instruction>, DecodeError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let start = self.pos;
        let byte = self.bytes[start];
        let op = Op::try_from(byte)
            .map_err(|byte| DecodeError::UnknownOp { offset: start, byte })?;
        if start + op.encoded_len() > self.bytes.len() {
            return Err(DecodeError::Truncated { offset: start, op });
        }
        self.pos += 1;

        let insn = match op {
            Op::Nop => Instruction::Nop,
            Op::DefCls => Instruction::DefCls {
                class_id: self.read_u16(),
            },
            Op::DefFunc => Instruction::DefFunc {
                func_id: self.read_u16(),
            },
            Op::DefCns => Instruction::DefCns {
                name: self.read_u16(),
                value: self.read_u16(),
            },
            Op::SetGlobal => Instruction::SetGlobal {
                name: self.read_u16(),
                value: self.read_u16(),
            },
            Op::Incl => {
                let kind_byte = self.read_u8();
                let kind = IncludeKind::try_from(kind_byte).map_err(|byte| {
                    DecodeError::UnknownIncludeKind {
                        offset: start,
                        byte,
                    }
                })?;
                Instruction::Incl {
                    kind,
                    name: self.read_u16(),
                }
            }
            Op::Jump => Instruction::Jump {
                offset: self.read_i16(),
            },
            Op::JumpIfDefined => Instruction::JumpIfDefined {
                name: self.read_u16(),
                offset: self.read_i16(),
            },
            Op::JumpIfUndefined => Instruction::JumpIfUndefined {
                name: self.read_u16(),
                offset: self.read_i16(),
            },
            Op::RetC => Instruction::RetC {
                value: self.read_u16(),
            },
            Op::Fatal => Instruction::Fatal {
                msg: self.read_u16(),
            },
        };
        Ok(Some(insn))
    }

    // ── raw reads (length checked by decode_next) ──────────────────

    #[inline(always)]
    fn read_u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    #[inline(always)]
    fn read_u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        v
    }

    #[inline(always)]
    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        self.decode_next().ok().flatten()
    }
}

/// Resolve a relative jump taken at `base` (the offset just past the jump).
pub fn jump_target(base: usize, offset: i16) -> Option<usize> {
    base.checked_add_signed(offset as isize)
}
