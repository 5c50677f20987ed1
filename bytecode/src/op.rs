/// Top-level opcodes.
///
/// These are the instructions a unit's synthetic top-level function is made
/// of. Name operands index the owning unit's literal table, value operands
/// index its constant pool, and template operands index its class or
/// function template lists. All indices are 16-bit. Jump offsets are signed
/// 16-bit and relative to the end of the jump instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,

    /// Define a class from one of the unit's class templates.
    /// Operands: `class_id:u16`
    DefCls,

    /// Bind one of the unit's functions to its name.
    /// Operands: `func_id:u16`
    DefFunc,

    /// Define a constant.
    /// Operands: `name:u16`, `value:u16`
    DefCns,

    /// Assign a global variable.
    /// Operands: `name:u16`, `value:u16`
    SetGlobal,

    /// Include another unit and run its top level.
    /// Operands: `kind:u8`, `name:u16`
    Incl,

    /// Unconditional relative jump.
    /// Operands: `offset:i16`
    Jump,

    /// Jump if the named constant is defined.
    /// Operands: `name:u16`, `offset:i16`
    JumpIfDefined,

    /// Jump if the named constant is not defined.
    /// Operands: `name:u16`, `offset:i16`
    JumpIfUndefined,

    /// Return a constant pool value from the top level.
    /// Operands: `value:u16`
    RetC,

    /// Raise a fatal error with a literal message.
    /// Operands: `msg:u16`
    Fatal,
}

impl Op {
    pub const COUNT: usize = Op::Fatal as usize + 1;

    /// Encoded size in bytes, opcode included.
    pub const fn encoded_len(self) -> usize {
        match self {
            Op::Nop => 1,
            Op::DefCls | Op::DefFunc | Op::Jump | Op::RetC | Op::Fatal => 3,
            Op::Incl => 4,
            Op::DefCns | Op::SetGlobal | Op::JumpIfDefined | Op::JumpIfUndefined => 5,
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// How an `Incl` instruction resolves its target name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IncludeKind {
    /// Resolved against the document root, local to the includer.
    Module = 0,
    /// Resolved relative to the including unit's directory.
    Relative = 1,
    /// Resolved against the document root.
    DocRoot = 2,
}

impl IncludeKind {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            IncludeKind::Module => "mod",
            IncludeKind::Relative => "src",
            IncludeKind::DocRoot => "doc",
        }
    }
}

impl TryFrom<u8> for IncludeKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(IncludeKind::Module),
            1 => Ok(IncludeKind::Relative),
            2 => Ok(IncludeKind::DocRoot),
            other => Err(other),
        }
    }
}
