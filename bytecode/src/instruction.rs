use core::fmt;

use crate::op::IncludeKind;

/// A decoded top-level instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    DefCls {
        class_id: u16,
    },
    DefFunc {
        func_id: u16,
    },
    DefCns {
        name: u16,
        value: u16,
    },
    SetGlobal {
        name: u16,
        value: u16,
    },
    Incl {
        kind: IncludeKind,
        name: u16,
    },
    Jump {
        offset: i16,
    },
    JumpIfDefined {
        name: u16,
        offset: i16,
    },
    JumpIfUndefined {
        name: u16,
        offset: i16,
    },
    RetC {
        value: u16,
    },
    Fatal {
        msg: u16,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => write!(f, "Nop"),
            Self::DefCls { class_id } => write!(f, "DefCls #{class_id}"),
            Self::DefFunc { func_id } => write!(f, "DefFunc #{func_id}"),
            Self::DefCns { name, value } => write!(f, "DefCns s{name}, #{value}"),
            Self::SetGlobal { name, value } => {
                write!(f, "SetGlobal s{name}, #{value}")
            }
            Self::Incl { kind, name } => {
                write!(f, "Incl {} s{name}", kind.mnemonic())
            }
            Self::Jump { offset } => write!(f, "Jump {offset:+}"),
            Self::JumpIfDefined { name, offset } => {
                write!(f, "JumpIfDefined s{name} {offset:+}")
            }
            Self::JumpIfUndefined { name, offset } => {
                write!(f, "JumpIfUndefined s{name} {offset:+}")
            }
            Self::RetC { value } => write!(f, "RetC #{value}"),
            Self::Fatal { msg } => write!(f, "Fatal s{msg}"),
        }
    }
}
