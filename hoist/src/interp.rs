//! Default [`Engine`]: runs a unit's top-level bytecode.

use std::sync::Arc;

use bytecode::{BytecodeDecoder, Instruction, SourceLoc, jump_target, source_loc_entries};
use log::trace;

use crate::activation::{Activation, Frame};
use crate::error::{MergeError, MergeErrorKind};
use crate::runtime::Engine;
use crate::unit::Unit;
use crate::value::Value;

/// Straight-line interpreter for top-level code.
#[derive(Debug, Clone, Copy)]
pub struct TopLevelInterpreter {
    max_steps: usize,
}

impl Default for TopLevelInterpreter {
    fn default() -> Self {
        Self { max_steps: 1 << 20 }
    }
}

impl TopLevelInterpreter {
    /// An interpreter that gives up after `max_steps` instructions.
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    fn run(&self, act: &mut Activation, unit: &Arc<Unit>) -> Result<Value, MergeError> {
        let main = unit.top_function();
        let (base, past) = (main.base() as usize, main.past() as usize);
        let lines = source_loc_entries(unit.source_locations()).unwrap_or_default();
        let mut decoder = BytecodeDecoder::at(unit.bytecode(), base);

        for _ in 0..self.max_steps {
            let pc = decoder.offset();
            if pc >= past {
                return Ok(Value::Null);
            }
            let line = line_at(&lines, pc as u32);
            if let Some(line) = line {
                act.set_line(line);
            }
            let insn = match decoder.decode_next() {
                Ok(Some(insn)) => insn,
                Ok(None) => return Ok(Value::Null),
                Err(err) => return Err(act.error(corrupt(unit, err))),
            };
            trace!("{}:{pc}: {insn}", unit.path());

            match insn {
                Instruction::Nop => {}
                Instruction::DefCls { class_id } => {
                    let template = unit
                        .class_template(class_id as u32)
                        .ok_or_else(|| act.error(corrupt(unit, format!("no class #{class_id}"))))?;
                    act.def_class(template, true)?;
                }
                Instruction::DefFunc { func_id } => {
                    let func = unit
                        .function(func_id as u32)
                        .ok_or_else(|| act.error(corrupt(unit, format!("no function #{func_id}"))))?;
                    act.define_function(func)?;
                }
                Instruction::DefCns { name, value } => {
                    let name = literal(act, unit, name)?;
                    let value = constant(act, unit, value)?;
                    act.define_constant(&name, value);
                }
                Instruction::SetGlobal { name, value } => {
                    let name = literal(act, unit, name)?;
                    let value = constant(act, unit, value)?;
                    act.set_global(&name, value);
                }
                Instruction::Incl { kind, name } => {
                    let name = literal(act, unit, name)?;
                    act.include_by_name(unit, kind, &name)?;
                }
                Instruction::Jump { offset } => {
                    jump(act, unit, &mut decoder, offset, base..=past)?;
                }
                Instruction::JumpIfDefined { name, offset } => {
                    let name = literal(act, unit, name)?;
                    if act.constant(&name).is_some() {
                        jump(act, unit, &mut decoder, offset, base..=past)?;
                    }
                }
                Instruction::JumpIfUndefined { name, offset } => {
                    let name = literal(act, unit, name)?;
                    if act.constant(&name).is_none() {
                        jump(act, unit, &mut decoder, offset, base..=past)?;
                    }
                }
                Instruction::RetC { value } => return constant(act, unit, value),
                Instruction::Fatal { msg } => {
                    let message = literal(act, unit, msg)?;
                    return Err(act.error(MergeError::new(MergeErrorKind::Fatal { message, line })));
                }
            }
        }
        Err(act.error(MergeError::engine(format!(
            "{}: top level exceeded {} steps",
            unit.path(),
            self.max_steps
        ))))
    }
}

impl Engine for TopLevelInterpreter {
    fn invoke_top(&self, act: &mut Activation, unit: &Arc<Unit>) -> Result<Value, MergeError> {
        act.push_frame(Frame {
            function: Arc::from("<main>"),
            path: unit.path().clone(),
            line: unit.top_function().line(),
        });
        let result = self.run(act, unit);
        act.pop_frame();
        result
    }
}

fn line_at(lines: &[(u32, SourceLoc)], pc: u32) -> Option<u32> {
    let ix = lines.partition_point(|(start, _)| *start <= pc);
    ix.checked_sub(1).map(|ix| lines[ix].1.line0)
}

fn corrupt(unit: &Unit, what: impl std::fmt::Display) -> MergeError {
    MergeError::engine(format!("{}: {what}", unit.path()))
}

fn literal(act: &Activation, unit: &Unit, id: u16) -> Result<Arc<str>, MergeError> {
    unit.literal(id as u32)
        .cloned()
        .ok_or_else(|| act.error(corrupt(unit, format!("no literal s{id}"))))
}

fn constant(act: &Activation, unit: &Unit, id: u16) -> Result<Value, MergeError> {
    unit.constant(id as u32)
        .cloned()
        .ok_or_else(|| act.error(corrupt(unit, format!("no constant #{id}"))))
}

fn jump(
    act: &Activation,
    unit: &Unit,
    decoder: &mut BytecodeDecoder<'_>,
    offset: i16,
    bounds: std::ops::RangeInclusive<usize>,
) -> Result<(), MergeError> {
    match jump_target(decoder.offset(), offset) {
        Some(target) if bounds.contains(&target) => {
            decoder.set_offset(target);
            Ok(())
        }
        _ => Err(act.error(corrupt(
            unit,
            format!("jump {offset:+} from {} leaves the top level", decoder.offset()),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytecode::SourceLoc;

    use super::TopLevelInterpreter;
    use crate::emitter::{ClassDecl, DeclContext};
    use crate::error::MergeErrorKind;
    use crate::func::FuncAttrs;
    use crate::runtime::{Runtime, RuntimeCreateInfo};
    use crate::unit::Unit;
    use crate::value::Value;

    /// `if (!defined("LEGACY")) { class Modern {} }` followed by a
    /// conditional function and `return 5`.
    fn conditional_unit(rt: &Runtime) -> Arc<Unit> {
        let mut e = rt.new_emitter("/cond.php");
        let legacy = e.add_literal("LEGACY") as u16;
        let five = e.add_constant(Value::Int(5)) as u16;
        let id = e.new_class_template(ClassDecl::new("Modern"), DeclContext::Conditional) as u16;
        let skip = e.bytecode().jump_if_defined(legacy);
        e.bytecode().def_cls(id);
        e.bytecode().def_func(1);
        e.bytecode().bind(skip);
        e.bytecode().ret_c(five);
        e.new_function("helper", FuncAttrs::empty(), 3);
        e.bytecode().ret_c(five);
        Arc::new(e.finish())
    }

    #[test]
    fn conditional_declarations_follow_control_flow() {
        let rt = Runtime::default();
        let unit = conditional_unit(&rt);
        assert!(!unit.is_merge_only());

        let mut plain = rt.activate();
        assert_eq!(plain.include(&unit).unwrap(), Value::Int(5));
        assert!(plain.lookup_class("Modern").is_some());
        assert!(plain.lookup_func("helper").is_some());

        let mut legacy = rt.activate();
        legacy.define_constant("LEGACY", Value::Bool(true));
        assert_eq!(legacy.include(&unit).unwrap(), Value::Int(5));
        assert!(legacy.lookup_class("Modern").is_none());
        assert!(legacy.lookup_func("helper").is_none());
    }

    #[test]
    fn constants_and_globals_are_assigned() {
        let rt = Runtime::default();
        let mut e = rt.new_emitter("/setup.php");
        let name = e.add_literal("MODE") as u16;
        let global = e.add_literal("counter") as u16;
        let dev = e.add_constant(Value::str("dev")) as u16;
        let zero = e.add_constant(Value::Int(0)) as u16;
        e.bytecode().def_cns(name, dev);
        e.bytecode().set_global(global, zero);
        let unit = Arc::new(e.finish());

        let mut act = rt.activate();
        assert_eq!(act.include(&unit).unwrap(), Value::Null);
        assert_eq!(act.constant("MODE"), Some(Value::str("dev")));
        assert_eq!(act.global("counter"), Some(Value::Int(0)));
    }

    #[test]
    fn fatal_reports_line_and_frame() {
        let rt = Runtime::default();
        let mut e = rt.new_emitter("/broken.php");
        let msg = e.add_literal("boom") as u16;
        e.record_source_loc(SourceLoc::line(4));
        e.bytecode().fatal(msg);
        let unit = Arc::new(e.finish());
        assert_eq!(unit.compile_time_fatal(), Some((Arc::from("boom"), 4)));

        let mut act = rt.activate();
        let err = act.include(&unit).unwrap_err();
        assert_eq!(
            err.kind,
            MergeErrorKind::Fatal { message: "boom".into(), line: Some(4) }
        );
        let frame = err.backtrace.last().unwrap();
        assert_eq!((&*frame.function, &*frame.path, frame.line), ("<main>", "/broken.php", 4));
        assert!(act.frames().is_empty(), "frame popped after failure");
    }

    #[test]
    fn runaway_top_level_is_stopped() {
        let engine = Arc::new(TopLevelInterpreter::new(100));
        let rt = Runtime::new(RuntimeCreateInfo::default().with_engine(engine));
        let mut e = rt.new_emitter("/loop.php");
        e.bytecode().nop();
        e.bytecode().jump_back(0);
        let unit = Arc::new(e.finish());

        let err = rt.activate().include(&unit).unwrap_err();
        assert!(matches!(err.kind, MergeErrorKind::Engine(_)), "{err}");
        assert!(err.to_string().contains("exceeded 100 steps"), "{err}");
    }
}
