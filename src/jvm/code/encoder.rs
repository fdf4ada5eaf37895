//! Re-encoding an [`InstructionGraph`] into bytes
//!
//! Instruction sizes depend on addresses (switch padding) and on whether jumps fit in a signed
//! 16-bit offset, while addresses depend on instruction sizes. Layout is therefore computed to a
//! fixed point:
//!
//!   - `goto` and `jsr` whose offset does not fit are switched to `goto_w` and `jsr_w`
//!
//!   - conditional branches have no wide form, so an oversized one is rewritten in the graph into
//!     the inverted branch hopping over a `goto_w`:
//!
//! ```text,ignore,no_run
//!                           ifnot* L1
//!     if* L2                goto_w L2
//! L1: ...         =>    L1: ...
//!     ...                   ...
//! L2: ...               L2: ...
//! ```
//!
//! ### Termination
//!
//! Both rewrites only ever make instructions longer, and neither is ever undone: the set of
//! widened jumps grows monotonically and each conditional branch is rewritten at most once (the
//! inverted branch jumps a small fixed distance, so it never needs rewriting itself). Since the
//! number of jumps is finite, the layout loop stops once an iteration widens nothing.

use super::opcodes::*;
use super::{InstrId, InstructionGraph, Literal, MemberKind, Operand};
use crate::jvm::class_file::{
    Attribute, AttributeLike, CodeAttribute, ConstantIndex, ConstantPool, ExceptionHandler,
    LineNumberEntry, LineNumberTable, LocalVariableEntry, LocalVariableTable, Serialize,
};
use crate::jvm::{BaseType, ConsistencyError, Error, ParseDescriptor, Result};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

/// Range of relative jump offsets supported by `goto` and `if*` branch instructions
pub const SIGNED_16BIT_JUMP_RANGE: RangeInclusive<i64> =
    RangeInclusive::new(i16::MIN as i64, i16::MAX as i64);

/// Encode a graph as a `Code` attribute body, updating instruction addresses and lengths
pub fn encode_code(graph: &mut InstructionGraph, pool: &mut ConstantPool) -> Result<Vec<u8>> {
    let attribute = encode_code_attribute(graph, pool)?;
    let mut bytes = vec![];
    attribute.serialize(&mut bytes)?;
    Ok(bytes)
}

pub fn encode_code_attribute(
    graph: &mut InstructionGraph,
    pool: &mut ConstantPool,
) -> Result<CodeAttribute> {
    graph.validate()?;
    let indices = intern_constants(graph, pool)?;
    let widened = layout(graph, &indices, &SIGNED_16BIT_JUMP_RANGE)?;

    let mut code: Vec<u8> = vec![];
    for id in graph.iter().collect::<Vec<_>>() {
        write_instruction(graph, id, &indices, widened.contains(&id), &mut code)?;
        check_written(graph, id, code.len())?;
    }
    if code.len() > u16::MAX as usize {
        return Err(Error::MethodCodeOverflow(code.len()));
    }

    let end_of = |id: InstrId| graph.get(id).address + graph.get(id).length;
    let mut exception_table = vec![];
    for handler in &graph.handlers {
        let catch_type = match &handler.catch_type {
            None => 0,
            Some(class) => pool.put_class(class)?.0,
        };
        exception_table.push(ExceptionHandler {
            start_pc: graph.get(handler.start).address as u16,
            end_pc: end_of(handler.end) as u16,
            handler_pc: graph.get(handler.catcher).address as u16,
            catch_type,
        });
    }

    let mut attributes: Vec<Attribute> = vec![];
    if let Some(variables) = &graph.local_variables {
        let mut entries = vec![];
        for var in variables {
            let start_pc = graph.get(var.start).address;
            entries.push(LocalVariableEntry {
                start_pc: start_pc as u16,
                length: (end_of(var.end) - start_pc) as u16,
                name_index: pool.put_utf8(&var.name)?,
                descriptor_index: pool.put_utf8(&var.descriptor)?,
                index: var.slot,
            });
        }
        attributes.push(LocalVariableTable(entries).to_attribute(pool)?);
    }
    if let Some(lines) = &graph.line_numbers {
        let entries = lines
            .iter()
            .map(|line| LineNumberEntry {
                start_pc: graph.get(line.start).address as u16,
                line_number: line.line,
            })
            .collect();
        attributes.push(LineNumberTable(entries).to_attribute(pool)?);
    }
    attributes.extend(graph.other_attributes.iter().cloned());

    debug!(
        "Encoded {} instructions into {} bytes ({} wide jumps)",
        graph.len(),
        code.len(),
        widened.len()
    );
    Ok(CodeAttribute {
        max_stack: graph.max_stack,
        max_locals: graph.max_locals,
        code,
        exception_table,
        attributes,
    })
}

/// Check that an instruction was written exactly where the layout put it
fn check_written(graph: &InstructionGraph, id: InstrId, written: usize) -> Result<()> {
    let instr = graph.get(id);
    let expected = instr.address + instr.length;
    if written as u32 != expected {
        return Err(Error::Consistency(ConsistencyError::LayoutMismatch {
            instr: id,
            expected,
            found: written as u32,
        }));
    }
    Ok(())
}

/// Make sure every constant pool entry the code refers to exists
fn intern_constants(
    graph: &InstructionGraph,
    pool: &mut ConstantPool,
) -> Result<HashMap<InstrId, u16>> {
    let mut indices = HashMap::new();
    for id in graph.iter() {
        let instr = graph.get(id);
        let index: Option<ConstantIndex> = match &instr.operand {
            Operand::Literal(literal) => match literal_form(literal) {
                LiteralForm::Pooled => pool.put_literal(literal)?,
                _ => None,
            },
            Operand::Field(reference) => Some(pool.put_member(MemberKind::Field, reference)?),
            Operand::Method {
                reference,
                interface,
            } => {
                let kind = if *interface {
                    MemberKind::InterfaceMethod
                } else {
                    MemberKind::Method
                };
                Some(pool.put_member(kind, reference)?)
            }
            Operand::Class(class) => Some(pool.put_class(class)?),
            Operand::MultiArray { class, dimensions } => match array_form(class, *dimensions) {
                ArrayForm::Primitive(_) => None,
                ArrayForm::Reference(element) => Some(pool.put_class(element)?),
                ArrayForm::Multi => Some(pool.put_class(class)?),
            },
            Operand::InvokeDynamic {
                bootstrap_method,
                name,
                descriptor,
            } => Some(pool.put_invoke_dynamic(*bootstrap_method, name, descriptor)?),
            _ => None,
        };
        if let Some(index) = index {
            indices.insert(id, index.0);
        }
    }
    Ok(indices)
}

/// How a literal gets pushed
#[derive(Copy, Clone, PartialEq, Debug)]
enum LiteralForm {
    /// Single byte opcode (`aconst_null`, `iconst_<n>`, ...)
    Short(u8),
    BiPush(i8),
    SiPush(i16),
    /// `ldc`, `ldc_w` or `ldc2_w` (the index is filled in once known)
    Pooled,
}

fn literal_form(literal: &Literal) -> LiteralForm {
    match literal {
        Literal::Null => LiteralForm::Short(ACONST_NULL),
        Literal::Int(i @ -1..=5) => LiteralForm::Short((ICONST_0 as i32 + i) as u8),
        Literal::Int(i) => match (i8::try_from(*i), i16::try_from(*i)) {
            (Ok(byte), _) => LiteralForm::BiPush(byte),
            (_, Ok(short)) => LiteralForm::SiPush(short),
            _ => LiteralForm::Pooled,
        },
        Literal::Long(l @ 0..=1) => LiteralForm::Short(LCONST_0 + *l as u8),
        Literal::Float(f) if [0.0f32, 1.0, 2.0].iter().any(|c| c.to_bits() == f.to_bits()) => {
            LiteralForm::Short(FCONST_0 + *f as u8)
        }
        Literal::Double(d) if [0.0f64, 1.0].iter().any(|c| c.to_bits() == d.to_bits()) => {
            LiteralForm::Short(DCONST_0 + *d as u8)
        }
        _ => LiteralForm::Pooled,
    }
}

/// How an array allocation gets encoded
enum ArrayForm<'a> {
    /// `newarray` with the `atype` code
    Primitive(u8),
    /// `anewarray` with the element class
    Reference(&'a str),
    Multi,
}

fn array_form(class: &str, dimensions: u8) -> ArrayForm<'_> {
    if dimensions != 1 {
        return ArrayForm::Multi;
    }
    let element = class.strip_prefix('[').unwrap_or(class);
    if element.len() == 1 {
        if let Ok(base) = BaseType::parse(element) {
            return ArrayForm::Primitive(base.array_type_code());
        }
    }
    match element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) {
        Some(name) => ArrayForm::Reference(name),
        None => ArrayForm::Reference(element),
    }
}

/// Bytes of padding after a switch opcode at `address`
fn switch_padding(address: u32) -> u32 {
    3 - address % 4
}

fn instruction_size(
    graph: &InstructionGraph,
    id: InstrId,
    address: u32,
    indices: &HashMap<InstrId, u16>,
    wide_jump: bool,
) -> u32 {
    let instr = graph.get(id);
    let op = instr.opcode;
    match &instr.operand {
        Operand::Literal(literal) => match literal_form(literal) {
            LiteralForm::Short(_) => 1,
            LiteralForm::BiPush(_) => 2,
            LiteralForm::SiPush(_) => 3,
            LiteralForm::Pooled => match indices.get(&id) {
                Some(index) if op == LDC && *index < 256 => 2,
                _ => 3,
            },
        },
        Operand::Local(slot) if op == RET => {
            if *slot < 256 {
                2
            } else {
                4
            }
        }
        Operand::Local(slot) => match slot {
            0..=3 => 1,
            4..=255 => 2,
            _ => 4,
        },
        Operand::Increment { slot, increment } => {
            if *slot < 256 && i8::try_from(*increment).is_ok() {
                3
            } else {
                6
            }
        }
        Operand::TableSwitch { .. } => {
            1 + switch_padding(address) + 12 + 4 * (graph.successors(id).len() as u32 - 1)
        }
        Operand::LookupSwitch { values } => {
            1 + switch_padding(address) + 8 + 8 * values.len() as u32
        }
        Operand::Method { .. } if op == INVOKEINTERFACE => 5,
        Operand::InvokeDynamic { .. } => 5,
        Operand::Field(_) | Operand::Method { .. } | Operand::Class(_) => 3,
        Operand::MultiArray { class, dimensions } => match array_form(class, *dimensions) {
            ArrayForm::Primitive(_) => 2,
            ArrayForm::Reference(_) => 3,
            ArrayForm::Multi => 4,
        },
        Operand::None if op == GOTO || op == JSR => {
            if wide_jump {
                5
            } else {
                3
            }
        }
        Operand::None if is_conditional_branch(op) => 3,
        Operand::None => 1,
    }
}

/// Assign addresses and lengths, widening jumps until everything fits
///
/// Returns the `goto`/`jsr` instructions that need their wide form. `small_jump_range` should
/// always be `SIGNED_16BIT_JUMP_RANGE` outside of unit tests.
fn layout(
    graph: &mut InstructionGraph,
    indices: &HashMap<InstrId, u16>,
    small_jump_range: &RangeInclusive<i64>,
) -> Result<HashSet<InstrId>> {
    let mut widened: HashSet<InstrId> = HashSet::new();
    loop {
        let mut address: u32 = 0;
        for id in graph.iter().collect::<Vec<_>>() {
            let length = instruction_size(graph, id, address, indices, widened.contains(&id));
            let instr = graph.get_mut(id);
            instr.address = address;
            instr.length = length;
            address += length;
        }

        let mut oversized_branches = vec![];
        let mut changed = false;
        for id in graph.iter() {
            let instr = graph.get(id);
            let op = instr.opcode;
            if !(op == GOTO || op == JSR || is_conditional_branch(op)) || widened.contains(&id) {
                continue;
            }
            let target = graph.get(graph.successors(id)[0]).address;
            let offset = target as i64 - instr.address as i64;
            if small_jump_range.contains(&offset) {
                continue;
            }
            if op == GOTO || op == JSR {
                trace!("widening {} (offset {})", id, offset);
                widened.insert(id);
            } else {
                oversized_branches.push(id);
            }
            changed = true;
        }

        for branch in oversized_branches {
            let far_target = graph.successors(branch)[0];
            let next = graph.next(branch).ok_or(Error::Consistency(
                ConsistencyError::FallsOffEnd(branch),
            ))?;
            let inverted = invert_condition(graph.get(branch).opcode).ok_or(Error::Consistency(
                ConsistencyError::UnexpectedOpcode {
                    instr: branch,
                    opcode: graph.get(branch).opcode,
                },
            ))?;
            trace!("inverting {} around a wide goto", branch);
            graph.replace(branch, inverted, Operand::None);
            graph.set_successors(branch, vec![next]);
            let goto = graph.append_after(branch, GOTO, Operand::None);
            graph.set_successors(goto, vec![far_target]);
            widened.insert(goto);
        }

        if !changed {
            return Ok(widened);
        }
    }
}

fn write_instruction(
    graph: &InstructionGraph,
    id: InstrId,
    indices: &HashMap<InstrId, u16>,
    wide_jump: bool,
    code: &mut Vec<u8>,
) -> Result<()> {
    let instr = graph.get(id);
    let op = instr.opcode;
    let address = instr.address;
    let index = indices.get(&id).copied().unwrap_or(0);
    let offset_to = |target: InstrId| graph.get(target).address as i64 - address as i64;

    match &instr.operand {
        Operand::Literal(literal) => match literal_form(literal) {
            LiteralForm::Short(short) => code.push(short),
            LiteralForm::BiPush(byte) => {
                code.push(BIPUSH);
                code.push(byte as u8);
            }
            LiteralForm::SiPush(short) => {
                code.push(SIPUSH);
                code.extend(short.to_be_bytes());
            }
            LiteralForm::Pooled if op == LDC && index < 256 => {
                code.push(LDC);
                code.push(index as u8);
            }
            LiteralForm::Pooled => {
                code.push(if op == LDC { LDC_W } else { LDC2_W });
                code.extend(index.to_be_bytes());
            }
        },
        Operand::Local(slot) if op == RET => {
            if *slot < 256 {
                code.extend([RET, *slot as u8]);
            } else {
                code.extend([WIDE, RET]);
                code.extend(slot.to_be_bytes());
            }
        }
        Operand::Local(slot) => {
            let (base, short_base) = if is_load(op) {
                (op - ILOAD, ILOAD_0)
            } else {
                (op - ISTORE, ISTORE_0)
            };
            match slot {
                0..=3 => code.push(short_base + base * 4 + *slot as u8),
                4..=255 => code.extend([op, *slot as u8]),
                _ => {
                    code.extend([WIDE, op]);
                    code.extend(slot.to_be_bytes());
                }
            }
        }
        Operand::Increment { slot, increment } => match i8::try_from(*increment) {
            Ok(small) if *slot < 256 => code.extend([IINC, *slot as u8, small as u8]),
            _ => {
                code.extend([WIDE, IINC]);
                code.extend(slot.to_be_bytes());
                code.extend(increment.to_be_bytes());
            }
        },
        Operand::TableSwitch { low } => {
            let succs = graph.successors(id);
            let (default, cases) = succs.split_last().ok_or(Error::Consistency(
                ConsistencyError::SuccessorCountMismatch {
                    instr: id,
                    opcode: op,
                    expected: 1,
                    found: 0,
                },
            ))?;
            code.push(TABLESWITCH);
            code.extend(std::iter::repeat(0).take(switch_padding(address) as usize));
            code.extend((offset_to(*default) as i32).to_be_bytes());
            code.extend(low.to_be_bytes());
            code.extend((low + cases.len() as i32 - 1).to_be_bytes());
            for case in cases {
                code.extend((offset_to(*case) as i32).to_be_bytes());
            }
        }
        Operand::LookupSwitch { values } => {
            let succs = graph.successors(id);
            code.push(LOOKUPSWITCH);
            code.extend(std::iter::repeat(0).take(switch_padding(address) as usize));
            code.extend((offset_to(succs[values.len()]) as i32).to_be_bytes());
            code.extend((values.len() as i32).to_be_bytes());
            for (value, target) in values.iter().zip(succs) {
                code.extend(value.to_be_bytes());
                code.extend((offset_to(*target) as i32).to_be_bytes());
            }
        }
        Operand::Method { reference, .. } if op == INVOKEINTERFACE => {
            let count = reference.method_descriptor()?.parameter_length(true);
            code.push(op);
            code.extend(index.to_be_bytes());
            code.extend([count as u8, 0]);
        }
        Operand::InvokeDynamic { .. } => {
            code.push(op);
            code.extend(index.to_be_bytes());
            code.extend([0, 0]);
        }
        Operand::Field(_) | Operand::Method { .. } | Operand::Class(_) => {
            code.push(op);
            code.extend(index.to_be_bytes());
        }
        Operand::MultiArray { class, dimensions } => match array_form(class, *dimensions) {
            ArrayForm::Primitive(atype) => code.extend([NEWARRAY, atype]),
            ArrayForm::Reference(_) => {
                code.push(ANEWARRAY);
                code.extend(index.to_be_bytes());
            }
            ArrayForm::Multi => {
                code.push(MULTIANEWARRAY);
                code.extend(index.to_be_bytes());
                code.push(*dimensions);
            }
        },
        Operand::None if op == GOTO || op == JSR || is_conditional_branch(op) => {
            let offset = offset_to(graph.successors(id)[0]);
            if wide_jump {
                code.push(if op == GOTO { GOTO_W } else { JSR_W });
                code.extend((offset as i32).to_be_bytes());
            } else {
                code.push(op);
                code.extend((offset as i16).to_be_bytes());
            }
        }
        Operand::None => code.push(op),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::decode_code;

    fn reencode(graph: &mut InstructionGraph) -> InstructionGraph {
        let mut pool = ConstantPool::new();
        let bytes = encode_code(graph, &mut pool).unwrap();
        decode_code(&bytes, &pool).unwrap()
    }

    fn opcodes(graph: &InstructionGraph) -> Vec<u8> {
        graph.iter().map(|id| graph.get(id).opcode).collect()
    }

    #[test]
    fn stale_layout_is_reported() {
        let mut graph = InstructionGraph::new(0, 0);
        let nop = graph.push(NOP, Operand::None);
        graph.get_mut(nop).length = 3;
        check_written(&graph, nop, 3).unwrap();
        assert!(matches!(
            check_written(&graph, nop, 1),
            Err(Error::Consistency(ConsistencyError::LayoutMismatch {
                expected: 3,
                found: 1,
                ..
            }))
        ));
    }

    #[test]
    fn picks_short_literal_forms() {
        let mut graph = InstructionGraph::new(8, 0);
        for literal in [
            Literal::Int(-1),
            Literal::Int(100),
            Literal::Int(1000),
            Literal::Int(100_000),
            Literal::Float(2.0),
            Literal::Float(-0.0),
            Literal::Null,
        ] {
            graph.push(LDC, Operand::Literal(literal));
        }
        graph.push(LDC2_W, Operand::Literal(Literal::Double(1.0)));
        graph.push(RETURN, Operand::None);

        let mut pool = ConstantPool::new();
        let attribute = encode_code_attribute(&mut graph, &mut pool).unwrap();
        assert_eq!(
            attribute.code,
            vec![
                ICONST_M1, BIPUSH, 100, SIPUSH, 0x03, 0xe8, LDC, 1, FCONST_2, LDC, 2, ACONST_NULL,
                DCONST_1, RETURN
            ]
        );
        assert_eq!(pool.loadable(1, false).unwrap(), Literal::Int(100_000));
        assert_eq!(pool.loadable(2, false).unwrap(), Literal::Float(-0.0));
    }

    #[test]
    fn local_forms() {
        let mut graph = InstructionGraph::new(2, 400);
        graph.push(ILOAD, Operand::Local(2));
        graph.push(ISTORE, Operand::Local(200));
        graph.push(DLOAD, Operand::Local(300));
        graph.push(DSTORE, Operand::Local(0));
        graph.push(IINC, Operand::Increment { slot: 1, increment: 500 });
        graph.push(RETURN, Operand::None);
        let mut pool = ConstantPool::new();
        let attribute = encode_code_attribute(&mut graph, &mut pool).unwrap();
        assert_eq!(
            attribute.code,
            vec![
                ILOAD_2, ISTORE, 200, WIDE, DLOAD, 0x01, 0x2c, DSTORE_0, WIDE, IINC, 0, 1, 0x01,
                0xf4, RETURN
            ]
        );
    }

    #[test]
    fn oversized_conditional_branch_is_inverted() {
        let mut graph = InstructionGraph::new(1, 1);
        graph.push(ILOAD, Operand::Local(0));
        let branch = graph.push(IFEQ, Operand::None);
        for _ in 0..40_000 {
            graph.push(NOP, Operand::None);
        }
        let ret = graph.push(RETURN, Operand::None);
        graph.set_successors(branch, vec![ret]);

        let decoded = reencode(&mut graph);
        let ops = opcodes(&decoded);
        assert_eq!(&ops[..3], &[ILOAD, IFNE, GOTO]);
        let ids: Vec<InstrId> = decoded.iter().collect();
        assert_eq!(decoded.get(ids[2]).length, 5);
        assert_eq!(decoded.successors(ids[1]), &[ids[3]]);
        assert_eq!(decoded.successors(ids[2]), &[*ids.last().unwrap()]);
    }

    #[test]
    fn oversized_backward_goto_is_widened() {
        let mut graph = InstructionGraph::new(0, 0);
        let head = graph.push(NOP, Operand::None);
        for _ in 0..40_000 {
            graph.push(NOP, Operand::None);
        }
        let back = graph.push(GOTO, Operand::None);
        graph.set_successors(back, vec![head]);

        let decoded = reencode(&mut graph);
        let last = decoded.last().unwrap();
        assert_eq!(decoded.get(last).opcode, GOTO);
        assert_eq!(decoded.get(last).length, 5);
        assert_eq!(decoded.successors(last), &[decoded.first().unwrap()]);
    }

    #[test]
    fn switch_padding_follows_address() {
        let mut graph = InstructionGraph::new(1, 1);
        graph.push(ILOAD, Operand::Local(0));
        let switch = graph.push(LOOKUPSWITCH, Operand::LookupSwitch { values: vec![1, 7] });
        let a = graph.push(RETURN, Operand::None);
        let b = graph.push(RETURN, Operand::None);
        graph.set_successors(switch, vec![a, b, a]);

        let decoded = reencode(&mut graph);
        let ids: Vec<InstrId> = decoded.iter().collect();
        // iload_0 at 0, switch at 1 with 2 padding bytes, 8 bytes header, 2 pairs
        assert_eq!(decoded.get(ids[1]).length, 1 + 2 + 8 + 16);
        assert_eq!(decoded.successors(ids[1]), &[ids[2], ids[3], ids[2]]);
        assert_eq!(
            decoded.get(ids[1]).operand,
            Operand::LookupSwitch { values: vec![1, 7] }
        );
    }

    #[test]
    fn too_long_code() {
        let mut graph = InstructionGraph::new(0, 0);
        for _ in 0..70_000 {
            graph.push(NOP, Operand::None);
        }
        graph.push(RETURN, Operand::None);
        let mut pool = ConstantPool::new();
        assert!(matches!(
            encode_code(&mut graph, &mut pool),
            Err(Error::MethodCodeOverflow(70_001))
        ));
    }
}
