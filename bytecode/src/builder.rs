use crate::op::{IncludeKind, Op};

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`] and the conditional jump emitters.
/// Resolve it with [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction.
    base: usize,
}

/// Builds a top-level bytecode sequence.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    /// Emit a jump-family op followed by a placeholder offset.
    fn emit_jump_placeholder(&mut self) -> Label {
        let offset_pos = self.buf.len();
        self.emit_i16(0);
        Label {
            offset_pos,
            base: self.buf.len(),
        }
    }

    pub fn nop(&mut self) {
        self.emit_op(Op::Nop);
    }

    /// `DefCls <class_id:u16>`
    pub fn def_cls(&mut self, class_id: u16) {
        self.emit_op(Op::DefCls);
        self.emit_u16(class_id);
    }

    /// `DefFunc <func_id:u16>`
    pub fn def_func(&mut self, func_id: u16) {
        self.emit_op(Op::DefFunc);
        self.emit_u16(func_id);
    }

    /// `DefCns <name:u16> <value:u16>`
    pub fn def_cns(&mut self, name: u16, value: u16) {
        self.emit_op(Op::DefCns);
        self.emit_u16(name);
        self.emit_u16(value);
    }

    /// `SetGlobal <name:u16> <value:u16>`
    pub fn set_global(&mut self, name: u16, value: u16) {
        self.emit_op(Op::SetGlobal);
        self.emit_u16(name);
        self.emit_u16(value);
    }

    /// `Incl <kind:u8> <name:u16>`
    pub fn incl(&mut self, kind: IncludeKind, name: u16) {
        self.emit_op(Op::Incl);
        self.emit_u8(kind as u8);
        self.emit_u16(name);
    }

    /// `RetC <value:u16>`
    pub fn ret_c(&mut self, value: u16) {
        self.emit_op(Op::RetC);
        self.emit_u16(value);
    }

    /// `Fatal <msg:u16>`
    pub fn fatal(&mut self, msg: u16) {
        self.emit_op(Op::Fatal);
        self.emit_u16(msg);
    }

    /// Emit a forward `Jump` with a placeholder offset.
    pub fn jump(&mut self) -> Label {
        self.emit_op(Op::Jump);
        self.emit_jump_placeholder()
    }

    /// Emit a forward `JumpIfDefined` with a placeholder offset.
    pub fn jump_if_defined(&mut self, name: u16) -> Label {
        self.emit_op(Op::JumpIfDefined);
        self.emit_u16(name);
        self.emit_jump_placeholder()
    }

    /// Emit a forward `JumpIfUndefined` with a placeholder offset.
    pub fn jump_if_undefined(&mut self, name: u16) -> Label {
        self.emit_op(Op::JumpIfUndefined);
        self.emit_u16(name);
        self.emit_jump_placeholder()
    }

    /// Patch a forward jump so it lands at the current offset.
    ///
    /// # Panics
    /// If the distance does not fit the i16 offset.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = jump_offset(label.base, target);
        self.buf[label.offset_pos..label.offset_pos + 2]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit a backward `Jump` to `target`.
    ///
    /// # Panics
    /// If the distance does not fit the i16 offset.
    pub fn jump_back(&mut self, target: usize) {
        let offset = jump_offset(self.buf.len() + Op::Jump.encoded_len(), target);
        self.emit_op(Op::Jump);
        self.emit_i16(offset);
    }
}

fn jump_offset(base: usize, target: usize) -> i16 {
    let distance = target as isize - base as isize;
    assert!(
        (i16::MIN as isize..=i16::MAX as isize).contains(&distance),
        "jump of {distance} bytes out of range"
    );
    distance as i16
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
