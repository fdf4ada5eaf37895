//! Bytecode decoding into an [`InstructionGraph`]
//!
//! Decoding happens in two passes. The first reads instructions sequentially by address,
//! canonicalizing as it goes:
//!
//!   - `*load_<n>`, `*store_<n>` and `wide` forms become the plain `*load`/`*store`/`iinc`/`ret`
//!     with the slot as operand
//!   - every constant push (`aconst_null`, `iconst_<n>`, `fconst_<n>`, `bipush`, `sipush`,
//!     `ldc_w`) becomes `ldc` and `lconst_<n>`/`dconst_<n>` become `ldc2_w`, with the literal as
//!     operand
//!   - `goto_w`/`jsr_w` become `goto`/`jsr`
//!   - `newarray` and `anewarray` become a one dimensional `multianewarray`
//!
//! The second pass resolves jump offsets into instruction ids, then anchors the exception table
//! and the debug tables to instructions.

use super::opcodes::*;
use super::{
    Handler, InstrId, InstructionGraph, LineNumber, LocalVariable, Literal, MemberKind, Operand,
    Reference,
};
use crate::jvm::class_file::{
    AttributeLike, CodeAttribute, ConstantPool, Deserialize, LineNumberTable, LocalVariableTable,
};
use crate::jvm::{
    read_error, BaseType, Error, FormatError, MethodDescriptor, ParseDescriptor, RenderDescriptor,
    Result,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::Cursor;

/// Decode a `Code` attribute body
pub fn decode_code(bytes: &[u8], pool: &ConstantPool) -> Result<InstructionGraph> {
    decode_code_attribute(&CodeAttribute::read(bytes)?, pool)
}

/// Attributes whose contents are tied to addresses we do not re-anchor
const ADDRESS_DEPENDENT_ATTRIBUTES: [&str; 2] = ["StackMapTable", "LocalVariableTypeTable"];

pub fn decode_code_attribute(code: &CodeAttribute, pool: &ConstantPool) -> Result<InstructionGraph> {
    let mut graph = InstructionGraph::new(code.max_stack, code.max_locals);

    // First pass: decode instructions and remember raw jump targets
    let mut by_address: HashMap<u32, InstrId> = HashMap::new();
    let mut pending_targets: Vec<(InstrId, Vec<i64>)> = vec![];
    let mut reader = Cursor::new(code.code.as_slice());
    while (reader.position() as usize) < code.code.len() {
        let decoded = decode_instruction(&mut reader, code.max_locals, pool)?;
        let id = graph.push(decoded.opcode, decoded.operand);
        let instr = graph.get_mut(id);
        instr.address = decoded.address;
        instr.length = reader.position() as u32 - decoded.address;
        by_address.insert(decoded.address, id);
        if !decoded.targets.is_empty() {
            pending_targets.push((id, decoded.targets));
        }
    }

    // Second pass: resolve jumps
    let resolve = |from: InstrId, target: i64| -> Result<InstrId> {
        u32::try_from(target)
            .ok()
            .and_then(|target| by_address.get(&target).copied())
            .ok_or(Error::Format(FormatError::InvalidJumpTarget {
                offset: graph.get(from).address,
                target,
            }))
    };
    let mut resolved: Vec<(InstrId, Vec<InstrId>)> = vec![];
    for (id, targets) in pending_targets {
        let mut succs = targets
            .into_iter()
            .map(|target| resolve(id, target))
            .collect::<Result<Vec<InstrId>>>()?;
        if graph.get(id).opcode == JSR {
            let entry = graph.get(succs[0]);
            if entry.opcode != ASTORE {
                return Err(Error::Format(FormatError::NonStandardSubroutine {
                    offset: entry.address,
                }));
            }
            succs.extend(graph.next(id));
        }
        resolved.push((id, succs));
    }
    for (id, succs) in resolved {
        graph.set_successors(id, succs);
    }

    // Exception table
    let code_length = code.code.len() as u32;
    let ending_at: HashMap<u32, InstrId> = graph
        .iter()
        .map(|id| (graph.get(id).address + graph.get(id).length, id))
        .collect();
    let last_before = |end: u32| -> Option<InstrId> { ending_at.get(&end).copied() };
    for (index, entry) in code.exception_table.iter().enumerate() {
        let invalid = || Error::Format(FormatError::InvalidHandler { index });
        if entry.start_pc >= entry.end_pc {
            return Err(invalid());
        }
        let start = *by_address
            .get(&(entry.start_pc as u32))
            .ok_or_else(invalid)?;
        let end = last_before(entry.end_pc as u32).ok_or_else(invalid)?;
        let catcher = *by_address
            .get(&(entry.handler_pc as u32))
            .ok_or_else(invalid)?;
        let catch_type = if entry.catch_type == 0 {
            None
        } else {
            Some(pool.class_name(entry.catch_type)?.to_owned())
        };
        graph.handlers.push(Handler {
            start,
            end,
            catcher,
            catch_type,
        });
    }

    // Sub-attributes
    for attribute in &code.attributes {
        let name = pool.utf8(attribute.name_index.0)?;
        if name == LocalVariableTable::NAME {
            let decoded = LocalVariableTable::from_attribute(attribute).and_then(|table| {
                table
                    .0
                    .iter()
                    .map(|entry| -> Result<LocalVariable> {
                        let malformed = || {
                            Error::Format(FormatError::MalformedAttribute {
                                name: LocalVariableTable::NAME,
                            })
                        };
                        let start = *by_address
                            .get(&(entry.start_pc as u32))
                            .ok_or_else(malformed)?;
                        let end = last_before(entry.start_pc as u32 + entry.length as u32)
                            .filter(|_| entry.length > 0)
                            .ok_or_else(malformed)?;
                        Ok(LocalVariable {
                            start,
                            end,
                            name: pool.utf8(entry.name_index.0)?.to_owned(),
                            descriptor: pool.utf8(entry.descriptor_index.0)?.to_owned(),
                            slot: entry.index,
                        })
                    })
                    .collect::<Result<Vec<LocalVariable>>>()
            });
            match decoded {
                Ok(variables) => graph
                    .local_variables
                    .get_or_insert_with(Vec::new)
                    .extend(variables),
                Err(err) => warn!("Dropping local variable table: {}", err),
            }
        } else if name == LineNumberTable::NAME {
            let decoded = LineNumberTable::from_attribute(attribute).and_then(|table| {
                table
                    .0
                    .iter()
                    .map(|entry| -> Result<LineNumber> {
                        let start = *by_address.get(&(entry.start_pc as u32)).ok_or(
                            Error::Format(FormatError::MalformedAttribute {
                                name: LineNumberTable::NAME,
                            }),
                        )?;
                        Ok(LineNumber {
                            start,
                            line: entry.line_number,
                        })
                    })
                    .collect::<Result<Vec<LineNumber>>>()
            });
            match decoded {
                Ok(lines) => graph.line_numbers.get_or_insert_with(Vec::new).extend(lines),
                Err(err) => warn!("Dropping line number table: {}", err),
            }
        } else if ADDRESS_DEPENDENT_ATTRIBUTES.contains(&name) {
            debug!("Dropping {} attribute", name);
        } else {
            graph.other_attributes.push(attribute.clone());
        }
    }

    debug!(
        "Decoded {} instructions and {} handlers from {} bytes",
        graph.arena_len(),
        graph.handlers.len(),
        code_length
    );
    Ok(graph)
}

/// Fields that a `Code` attribute may write to, even if it cannot be decoded into a graph
///
/// Only the sequential reading of instructions is needed, so code failing jump, subroutine, or
/// handler resolution is still scanned precisely. Code that cannot even be read sequentially
/// may write any field in the pool.
pub fn written_fields(code: &CodeAttribute, pool: &ConstantPool) -> Vec<Reference> {
    let mut fields = vec![];
    let mut reader = Cursor::new(code.code.as_slice());
    while (reader.position() as usize) < code.code.len() {
        match decode_instruction(&mut reader, code.max_locals, pool) {
            Ok(DecodedInstruction {
                opcode: PUTSTATIC | PUTFIELD,
                operand: Operand::Field(field),
                ..
            }) => fields.push(field),
            Ok(_) => (),
            Err(err) => {
                debug!("Assuming every field is written: {}", err);
                return pool.field_references().collect();
            }
        }
    }
    fields
}

struct DecodedInstruction {
    opcode: u8,
    operand: Operand,
    address: u32,
    /// Absolute jump targets, in successor order
    targets: Vec<i64>,
}

fn read<T: Deserialize>(reader: &mut Cursor<&[u8]>) -> Result<T> {
    T::deserialize(reader).map_err(read_error)
}

fn decode_instruction(
    reader: &mut Cursor<&[u8]>,
    max_locals: u16,
    pool: &ConstantPool,
) -> Result<DecodedInstruction> {
    let address = reader.position() as u32;
    let opcode: u8 = read(reader)?;

    let check_slot = |slot: u16, size: u16| -> Result<u16> {
        if slot as u32 + size as u32 > max_locals as u32 {
            Err(Error::Format(FormatError::InvalidLocalSlot {
                offset: address,
                slot,
                max_locals,
            }))
        } else {
            Ok(slot)
        }
    };
    let member_error =
        |reason| Error::Format(FormatError::InvalidMemberReference { offset: address, reason });
    let ldc = |literal| (LDC, Operand::Literal(literal));
    let ldc2 = |literal| (LDC2_W, Operand::Literal(literal));

    let mut targets = vec![];
    let (canonical, operand) = match opcode {
        NOP => (NOP, Operand::None),
        ACONST_NULL => ldc(Literal::Null),
        ICONST_M1..=ICONST_5 => ldc(Literal::Int(opcode as i32 - ICONST_0 as i32)),
        LCONST_0 | LCONST_1 => ldc2(Literal::Long((opcode - LCONST_0) as i64)),
        FCONST_0..=FCONST_2 => ldc(Literal::Float((opcode - FCONST_0) as f32)),
        DCONST_0 | DCONST_1 => ldc2(Literal::Double((opcode - DCONST_0) as f64)),
        BIPUSH => ldc(Literal::Int(read::<i8>(reader)? as i32)),
        SIPUSH => ldc(Literal::Int(read::<i16>(reader)? as i32)),
        LDC => (LDC, Operand::Literal(pool.loadable(read::<u8>(reader)? as u16, false)?)),
        LDC_W => (LDC, Operand::Literal(pool.loadable(read(reader)?, false)?)),
        LDC2_W => (LDC2_W, Operand::Literal(pool.loadable(read(reader)?, true)?)),

        ILOAD..=ALOAD | ISTORE..=ASTORE => {
            let slot = read::<u8>(reader)? as u16;
            let size = if is_wide_local_access(opcode) { 2 } else { 1 };
            (opcode, Operand::Local(check_slot(slot, size)?))
        }
        ILOAD_0..=ALOAD_3 => {
            let base = ILOAD + (opcode - ILOAD_0) / 4;
            let slot = ((opcode - ILOAD_0) % 4) as u16;
            let size = if is_wide_local_access(base) { 2 } else { 1 };
            (base, Operand::Local(check_slot(slot, size)?))
        }
        ISTORE_0..=ASTORE_3 => {
            let base = ISTORE + (opcode - ISTORE_0) / 4;
            let slot = ((opcode - ISTORE_0) % 4) as u16;
            let size = if is_wide_local_access(base) { 2 } else { 1 };
            (base, Operand::Local(check_slot(slot, size)?))
        }
        IINC => {
            let slot = read::<u8>(reader)? as u16;
            let increment = read::<i8>(reader)? as i16;
            (
                IINC,
                Operand::Increment {
                    slot: check_slot(slot, 1)?,
                    increment,
                },
            )
        }
        RET => (RET, Operand::Local(check_slot(read::<u8>(reader)? as u16, 1)?)),
        WIDE => {
            let widened: u8 = read(reader)?;
            if !is_wide_eligible(widened) {
                return Err(Error::Format(FormatError::InvalidWideOpcode {
                    offset: address,
                    opcode: widened,
                }));
            }
            let slot: u16 = read(reader)?;
            if widened == IINC {
                let increment: i16 = read(reader)?;
                (
                    IINC,
                    Operand::Increment {
                        slot: check_slot(slot, 1)?,
                        increment,
                    },
                )
            } else {
                let size = if is_wide_local_access(widened) { 2 } else { 1 };
                (widened, Operand::Local(check_slot(slot, size)?))
            }
        }

        IFEQ..=JSR | IFNULL | IFNONNULL => {
            let offset: i16 = read(reader)?;
            targets.push(address as i64 + offset as i64);
            (opcode, Operand::None)
        }
        GOTO_W | JSR_W => {
            let offset: i32 = read(reader)?;
            targets.push(address as i64 + offset as i64);
            (if opcode == GOTO_W { GOTO } else { JSR }, Operand::None)
        }
        TABLESWITCH | LOOKUPSWITCH => {
            let inconsistent = |reason| {
                Error::Format(FormatError::InconsistentSwitch {
                    offset: address,
                    reason,
                })
            };
            for _ in 0..(3 - address % 4) {
                let _: u8 = read(reader)?;
            }
            let default = address as i64 + read::<i32>(reader)? as i64;
            let remaining = reader.get_ref().len() as i64 - reader.position() as i64;
            if opcode == TABLESWITCH {
                let low: i32 = read(reader)?;
                let high: i32 = read(reader)?;
                if high < low {
                    return Err(inconsistent("high bound is below low bound"));
                }
                let count = high as i64 - low as i64 + 1;
                if count * 4 > remaining - 8 {
                    return Err(Error::Format(FormatError::Truncated));
                }
                for _ in 0..count {
                    targets.push(address as i64 + read::<i32>(reader)? as i64);
                }
                targets.push(default);
                (TABLESWITCH, Operand::TableSwitch { low })
            } else {
                let npairs: i32 = read(reader)?;
                if npairs < 0 {
                    return Err(inconsistent("negative number of pairs"));
                }
                if npairs as i64 * 8 > remaining - 4 {
                    return Err(Error::Format(FormatError::Truncated));
                }
                let mut values = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key: i32 = read(reader)?;
                    if values.last().map_or(false, |last| *last >= key) {
                        return Err(inconsistent("keys are not sorted in increasing order"));
                    }
                    values.push(key);
                    targets.push(address as i64 + read::<i32>(reader)? as i64);
                }
                targets.push(default);
                (LOOKUPSWITCH, Operand::LookupSwitch { values })
            }
        }

        GETSTATIC..=PUTFIELD => match pool.member(read(reader)?)? {
            (MemberKind::Field, reference) => (opcode, Operand::Field(reference)),
            _ => return Err(member_error("field instruction with a method reference")),
        },
        INVOKEVIRTUAL..=INVOKEINTERFACE => {
            let (kind, reference) = pool.member(read(reader)?)?;
            let interface = match (opcode, kind) {
                (_, MemberKind::Field) => {
                    return Err(member_error("invoke instruction with a field reference"))
                }
                (INVOKEVIRTUAL, MemberKind::InterfaceMethod) => {
                    return Err(member_error("invokevirtual with an interface method"))
                }
                (INVOKEINTERFACE, MemberKind::Method) => {
                    return Err(member_error("invokeinterface with a class method"))
                }
                (_, kind) => kind == MemberKind::InterfaceMethod,
            };
            if reference.name == "<clinit>" {
                return Err(member_error("class initializers cannot be invoked"));
            }
            if reference.name == "<init>" && opcode != INVOKESPECIAL {
                return Err(member_error("constructors are only invoked by invokespecial"));
            }
            let descriptor = MethodDescriptor::parse_checked(&reference.descriptor)?;
            if opcode == INVOKEINTERFACE {
                let count: u8 = read(reader)?;
                let zero: u8 = read(reader)?;
                if count as usize != descriptor.parameter_length(true) || zero != 0 {
                    return Err(member_error("invokeinterface count does not match"));
                }
            }
            (opcode, Operand::Method { reference, interface })
        }
        INVOKEDYNAMIC => {
            let (bootstrap_method, name, descriptor) = pool.invoke_dynamic(read(reader)?)?;
            MethodDescriptor::parse_checked(descriptor)?;
            let padding: u16 = read(reader)?;
            if padding != 0 {
                return Err(member_error("invokedynamic padding is not zero"));
            }
            (
                INVOKEDYNAMIC,
                Operand::InvokeDynamic {
                    bootstrap_method,
                    name: name.to_owned(),
                    descriptor: descriptor.to_owned(),
                },
            )
        }

        NEW | CHECKCAST | INSTANCEOF => {
            let class = pool.class_name(read(reader)?)?;
            if opcode == NEW && class.starts_with('[') {
                return Err(Error::Format(FormatError::InvalidArrayType {
                    offset: address,
                    descriptor: class.to_owned(),
                }));
            }
            (opcode, Operand::Class(class.to_owned()))
        }
        NEWARRAY => {
            let code: u8 = read(reader)?;
            let element = BaseType::from_array_type_code(code).ok_or_else(|| {
                Error::Format(FormatError::InvalidArrayType {
                    offset: address,
                    descriptor: format!("atype {}", code),
                })
            })?;
            let class = format!("[{}", element.render());
            (MULTIANEWARRAY, Operand::MultiArray { class, dimensions: 1 })
        }
        ANEWARRAY => {
            let element = pool.class_name(read(reader)?)?;
            let class = if element.starts_with('[') {
                format!("[{}", element)
            } else {
                format!("[L{};", element)
            };
            if array_dimensions(&class) > 255 {
                return Err(Error::Format(FormatError::InvalidArrayType {
                    offset: address,
                    descriptor: class,
                }));
            }
            (MULTIANEWARRAY, Operand::MultiArray { class, dimensions: 1 })
        }
        MULTIANEWARRAY => {
            let class = pool.class_name(read(reader)?)?.to_owned();
            let dimensions: u8 = read(reader)?;
            if dimensions == 0 || dimensions as usize > array_dimensions(&class) {
                return Err(Error::Format(FormatError::InvalidArrayType {
                    offset: address,
                    descriptor: class,
                }));
            }
            (MULTIANEWARRAY, Operand::MultiArray { class, dimensions })
        }

        IALOAD..=SALOAD | IASTORE..=LXOR | I2L..=DCMPG | IRETURN..=RETURN | ARRAYLENGTH
        | ATHROW | MONITORENTER | MONITOREXIT => (opcode, Operand::None),

        _ => {
            return Err(Error::Format(FormatError::InvalidOpcode {
                offset: address,
                opcode,
            }))
        }
    };

    Ok(DecodedInstruction {
        opcode: canonical,
        operand,
        address,
        targets,
    })
}

fn array_dimensions(descriptor: &str) -> usize {
    descriptor.chars().take_while(|c| *c == '[').count()
}
