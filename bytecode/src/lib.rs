mod builder;
mod decoder;
mod instruction;
mod op;
mod source_loc;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError, jump_target};
pub use instruction::Instruction;
pub use op::{IncludeKind, Op};
pub use source_loc::{
    SourceLoc, SourceLocTableBuilder, decode_unsigned_vlq, encode_unsigned_vlq,
    source_loc_entries, source_loc_lookup,
};
