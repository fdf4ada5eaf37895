use super::opcodes::*;
use crate::jvm::{
    ConsistencyError, Error, FieldType, MethodDescriptor, ParseDescriptor, Result,
};
use crate::util::Width;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Index of an instruction in its graph's arena
///
/// Ids stay valid for the lifetime of the graph: removing an instruction leaves a tombstone
/// behind instead of shifting the arena.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Constant value pushed by `ldc`/`ldc2_w` (and the value of a known stack slot or local)
///
/// Floating point literals compare by their bit patterns, so `NaN` equals itself and `0.0` is
/// distinct from `-0.0`. This is the notion of identity needed when deciding whether two paths
/// produce "the same" constant.
#[derive(Clone, Debug)]
pub enum Literal {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// Class literal, using the internal name (or array descriptor)
    Class(String),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Literal) -> bool {
        match (self, other) {
            (Literal::Null, Literal::Null) => true,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Long(a), Literal::Long(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Double(a), Literal::Double(b)) => a.to_bits() == b.to_bits(),
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Class(a), Literal::Class(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::Null => (),
            Literal::Int(i) => i.hash(state),
            Literal::Long(l) => l.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
            Literal::Double(d) => d.to_bits().hash(state),
            Literal::String(s) | Literal::Class(s) => s.hash(state),
        }
    }
}

impl Width for Literal {
    fn width(&self) -> usize {
        match self {
            Literal::Long(_) | Literal::Double(_) => 2,
            _ => 1,
        }
    }
}

impl Literal {
    /// Is this a reference that is definitely not `null`?
    pub fn is_non_null_reference(&self) -> bool {
        matches!(self, Literal::String(_) | Literal::Class(_))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Long(l) => write!(f, "{}L", l),
            Literal::Float(x) => write!(f, "{:?}F", x),
            Literal::Double(x) => write!(f, "{:?}D", x),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Class(c) => write!(f, "{}.class", c),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// Symbolic field or method reference
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Reference {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl Reference {
    pub fn new(class: &str, name: &str, descriptor: &str) -> Reference {
        Reference {
            class: class.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }

    pub fn field_type(&self) -> Result<FieldType> {
        FieldType::parse_checked(&self.descriptor)
    }

    pub fn method_descriptor(&self) -> Result<MethodDescriptor> {
        MethodDescriptor::parse_checked(&self.descriptor)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
    }
}

/// Operand attached to a canonical instruction
#[derive(Clone, PartialEq, Debug)]
pub enum Operand {
    None,

    /// `ldc`, `ldc2_w`
    Literal(Literal),

    /// Loads, stores, `ret`
    Local(u16),

    /// `iinc`
    Increment { slot: u16, increment: i16 },

    /// `getstatic`, `putstatic`, `getfield`, `putfield`
    Field(Reference),

    /// `invokevirtual`, `invokespecial`, `invokestatic`, `invokeinterface`
    ///
    /// `interface` is whether the pool entry is an `InterfaceMethodref`, which is allowed for
    /// `invokestatic` and `invokespecial` too.
    Method { reference: Reference, interface: bool },

    /// `new`, `checkcast`, `instanceof`
    Class(String),

    /// `multianewarray` (also the canonical form of `newarray` and `anewarray`)
    MultiArray { class: String, dimensions: u8 },

    /// `tableswitch` (the case count is the number of successors, minus the default)
    TableSwitch { low: i32 },

    /// `lookupswitch` keys, in ascending order
    LookupSwitch { values: Vec<i32> },

    /// `invokedynamic`
    InvokeDynamic {
        bootstrap_method: u16,
        name: String,
        descriptor: String,
    },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Literal(literal) => write!(f, " {}", literal),
            Operand::Local(slot) => write!(f, " {}", slot),
            Operand::Increment { slot, increment } => write!(f, " {} {}", slot, increment),
            Operand::Field(reference) => write!(f, " {}", reference),
            Operand::Method { reference, .. } => write!(f, " {}", reference),
            Operand::Class(class) => write!(f, " {}", class),
            Operand::MultiArray { class, dimensions } => write!(f, " {} {}", class, dimensions),
            Operand::TableSwitch { low } => write!(f, " low={}", low),
            Operand::LookupSwitch { values } => write!(f, " {:?}", values),
            Operand::InvokeDynamic {
                bootstrap_method,
                name,
                descriptor,
            } => write!(f, " #{}:{}{}", bootstrap_method, name, descriptor),
        }
    }
}

/// Instruction node in an [`InstructionGraph`](super::InstructionGraph)
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Canonical opcode
    pub opcode: u8,

    pub operand: Operand,

    /// Address as of the last decode or encode (stale after edits)
    pub address: u32,

    /// Encoded length as of the last decode or encode, including switch padding
    pub length: u32,

    /// Explicit control flow targets (see [`InstructionGraph::successors`](super::InstructionGraph::successors))
    pub(crate) succs: Vec<InstrId>,

    /// Instructions listing this one in their `succs`
    pub(crate) jump_preds: Vec<InstrId>,

    /// Neighbours in address order
    pub(crate) prev: Option<InstrId>,
    pub(crate) next: Option<InstrId>,

    pub(crate) always_jumps: bool,
    pub(crate) removed: bool,
}

impl Instruction {
    pub(crate) fn new(opcode: u8, operand: Operand) -> Instruction {
        Instruction {
            opcode,
            operand,
            address: 0,
            length: 0,
            succs: vec![],
            jump_preds: vec![],
            prev: None,
            next: None,
            always_jumps: always_jumps(opcode),
            removed: false,
        }
    }

    /// Does control never continue with the next instruction in address order?
    pub fn always_jumps(&self) -> bool {
        self.always_jumps
    }

    /// Can executing this instruction leave the method normally?
    pub fn may_return(&self) -> bool {
        may_return(self.opcode)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn mnemonic(&self) -> &'static str {
        mnemonic(self.opcode).unwrap_or("???")
    }

    /// Local slot read or written (including by `iinc` and `ret`)
    pub fn local_slot(&self) -> Option<u16> {
        match self.operand {
            Operand::Local(slot) | Operand::Increment { slot, .. } => Some(slot),
            _ => None,
        }
    }

    /// Number of slots a load/store touches
    pub fn local_size(&self) -> usize {
        if is_wide_local_access(self.opcode) {
            2
        } else {
            1
        }
    }

    pub fn literal(&self) -> Option<&Literal> {
        match &self.operand {
            Operand::Literal(literal) => Some(literal),
            _ => None,
        }
    }

    fn unexpected(&self, id: InstrId) -> Error {
        Error::Consistency(ConsistencyError::UnexpectedOpcode {
            instr: id,
            opcode: self.opcode,
        })
    }

    /// Stack widths of the values this instruction consumes, topmost first
    ///
    /// Stack shuffling instructions (`dup*`, `swap`) have no fixed operand list and are rejected,
    /// as are `jsr`/`ret` whose stack effect depends on the path taken.
    pub fn operand_widths(&self, id: InstrId) -> Result<Vec<usize>> {
        let op = self.opcode;
        let widths = match op {
            NOP | LDC | LDC2_W | GOTO | RETURN | GETSTATIC | NEW | IINC => vec![],
            _ if is_load(op) => vec![],
            _ if is_store(op) => vec![self.local_size()],
            IALOAD..=SALOAD => vec![1, 1],
            LASTORE | DASTORE => vec![2, 1, 1],
            IASTORE..=SASTORE => vec![1, 1, 1],
            POP => vec![1],
            POP2 => vec![2],
            IADD..=DREM => {
                let w = arithmetic_width(op - IADD);
                vec![w, w]
            }
            INEG..=DNEG => vec![arithmetic_width(op - INEG)],
            ISHL..=LUSHR => vec![1, if (op - ISHL) % 2 == 0 { 1 } else { 2 }],
            IAND..=LXOR => {
                let w = if (op - IAND) % 2 == 0 { 1 } else { 2 };
                vec![w, w]
            }
            I2L | I2F | I2D | F2I | F2L | F2D | I2B | I2C | I2S => vec![1],
            L2I | L2F | L2D | D2I | D2L | D2F => vec![2],
            LCMP | DCMPL | DCMPG => vec![2, 2],
            FCMPL | FCMPG => vec![1, 1],
            _ if is_unary_if(op) => vec![1],
            _ if is_binary_if(op) => vec![1, 1],
            TABLESWITCH | LOOKUPSWITCH => vec![1],
            IRETURN | FRETURN | ARETURN => vec![1],
            LRETURN | DRETURN => vec![2],
            GETFIELD => vec![1],
            PUTSTATIC | PUTFIELD => {
                let field = match &self.operand {
                    Operand::Field(field) => field.field_type()?,
                    _ => return Err(self.unexpected(id)),
                };
                let mut widths = vec![field.width()];
                if op == PUTFIELD {
                    widths.push(1);
                }
                widths
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE | INVOKEDYNAMIC => {
                let (descriptor, has_receiver) = match &self.operand {
                    Operand::Method { reference, .. } => {
                        (reference.method_descriptor()?, op != INVOKESTATIC)
                    }
                    Operand::InvokeDynamic { descriptor, .. } => {
                        (MethodDescriptor::parse_checked(descriptor)?, false)
                    }
                    _ => return Err(self.unexpected(id)),
                };
                let mut widths: Vec<usize> =
                    descriptor.parameters.iter().rev().map(Width::width).collect();
                if has_receiver {
                    widths.push(1);
                }
                widths
            }
            ARRAYLENGTH | ATHROW | CHECKCAST | INSTANCEOF | MONITORENTER | MONITOREXIT => {
                vec![1]
            }
            MULTIANEWARRAY => match &self.operand {
                Operand::MultiArray { dimensions, .. } => vec![1; *dimensions as usize],
                _ => return Err(self.unexpected(id)),
            },
            _ => return Err(self.unexpected(id)),
        };
        Ok(widths)
    }

    /// Stack width of the value this instruction pushes (zero if none)
    ///
    /// Same restrictions as [`Instruction::operand_widths`].
    pub fn result_width(&self, id: InstrId) -> Result<usize> {
        let op = self.opcode;
        let width = match op {
            LDC | LDC2_W => match &self.operand {
                Operand::Literal(literal) => literal.width(),
                _ => return Err(self.unexpected(id)),
            },
            _ if is_load(op) => self.local_size(),
            LALOAD | DALOAD => 2,
            IALOAD..=SALOAD => 1,
            IADD..=DREM => arithmetic_width(op - IADD),
            INEG..=DNEG => arithmetic_width(op - INEG),
            ISHL..=LUSHR => {
                if (op - ISHL) % 2 == 0 {
                    1
                } else {
                    2
                }
            }
            IAND..=LXOR => {
                if (op - IAND) % 2 == 0 {
                    1
                } else {
                    2
                }
            }
            I2L | I2D | F2L | F2D | L2D | D2L => 2,
            I2F | L2I | L2F | F2I | D2I | D2F | I2B | I2C | I2S => 1,
            LCMP..=DCMPG => 1,
            GETSTATIC | GETFIELD => match &self.operand {
                Operand::Field(field) => field.field_type()?.width(),
                _ => return Err(self.unexpected(id)),
            },
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                match &self.operand {
                    Operand::Method { reference, .. } => {
                        reference.method_descriptor()?.return_width()
                    }
                    _ => return Err(self.unexpected(id)),
                }
            }
            INVOKEDYNAMIC => match &self.operand {
                Operand::InvokeDynamic { descriptor, .. } => {
                    MethodDescriptor::parse_checked(descriptor)?.return_width()
                }
                _ => return Err(self.unexpected(id)),
            },
            NEW | ARRAYLENGTH | CHECKCAST | INSTANCEOF | MULTIANEWARRAY => 1,
            POP..=SWAP | JSR | RET => return Err(self.unexpected(id)),
            _ => 0,
        };
        Ok(width)
    }
}

/// Arithmetic opcodes cycle through `int`, `long`, `float`, `double`
fn arithmetic_width(offset: u8) -> usize {
    if offset % 2 == 0 {
        1
    } else {
        2
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}{}", self.address, self.mnemonic(), self.operand)?;
        if !self.succs.is_empty() {
            f.write_str(" ->")?;
            for succ in &self.succs {
                write!(f, " {}", succ)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn insn(opcode: u8, operand: Operand) -> Instruction {
        Instruction::new(opcode, operand)
    }

    #[test]
    fn literal_identity_is_bitwise() {
        assert_eq!(Literal::Float(f32::NAN), Literal::Float(f32::NAN));
        assert_ne!(Literal::Double(0.0), Literal::Double(-0.0));
        assert_ne!(Literal::Int(1), Literal::Long(1));
        assert_eq!(Literal::Long(3).width(), 2);
    }

    #[test]
    fn operand_widths_of_invokes() {
        let call = insn(
            INVOKEVIRTUAL,
            Operand::Method {
                reference: Reference::new("Foo", "bar", "(IJLjava/lang/String;)D"),
                interface: false,
            },
        );
        let id = InstrId(0);
        assert_eq!(call.operand_widths(id).unwrap(), vec![1, 2, 1, 1]);
        assert_eq!(call.result_width(id).unwrap(), 2);

        let call = insn(
            INVOKESTATIC,
            Operand::Method {
                reference: Reference::new("Foo", "baz", "(D)V"),
                interface: false,
            },
        );
        assert_eq!(call.operand_widths(id).unwrap(), vec![2]);
        assert_eq!(call.result_width(id).unwrap(), 0);
    }

    #[test]
    fn operand_widths_of_arithmetic() {
        let id = InstrId(0);
        assert_eq!(insn(LADD, Operand::None).operand_widths(id).unwrap(), vec![2, 2]);
        assert_eq!(insn(LSHL, Operand::None).operand_widths(id).unwrap(), vec![1, 2]);
        assert_eq!(insn(LSHL, Operand::None).result_width(id).unwrap(), 2);
        assert_eq!(insn(DCMPG, Operand::None).result_width(id).unwrap(), 1);
        assert_eq!(insn(L2I, Operand::None).operand_widths(id).unwrap(), vec![2]);
        assert_eq!(insn(LASTORE, Operand::None).operand_widths(id).unwrap(), vec![2, 1, 1]);
        assert!(insn(DUP_X1, Operand::None).operand_widths(id).is_err());
        assert!(insn(JSR, Operand::None).result_width(id).is_err());
    }
}
