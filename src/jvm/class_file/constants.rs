use super::{Deserialize, Serialize};
use crate::jvm::code::{Literal, MemberKind, Reference};
use crate::jvm::{read_error, Error, FormatError, Result};
use crate::util::{Offset, OffsetVec, Width};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ConstantIndex(pub u16);

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for ConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        u16::deserialize(reader).map(ConstantIndex)
    }
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Class or an interface
    Class(ConstantIndex),

    /// Field
    FieldRef {
        class: ConstantIndex,
        name_and_type: ConstantIndex,
    },

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ConstantIndex,
        name_and_type: ConstantIndex,
        is_interface: bool,
    },

    /// Constant object of type `java.lang.String`
    String(ConstantIndex),

    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),

    /// Name and a type (eg. for a field or a method)
    NameAndType {
        name: ConstantIndex,
        descriptor: ConstantIndex,
    },

    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (the encoding of the null character
    /// `\u{0000}` and the encoding of supplementary characters is different).
    Utf8(String),

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle { handle_kind: u8, member: ConstantIndex },

    /// Method type
    MethodType { descriptor: ConstantIndex },

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_method: u16,
        name_and_type: ConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        bootstrap_method: u16,
        name_and_type: ConstantIndex,
    },

    Module(ConstantIndex),
    Package(ConstantIndex),
}

impl Constant {
    /// Human readable kind, used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Class(_) => "Class",
            Constant::FieldRef { .. } => "Fieldref",
            Constant::MethodRef {
                is_interface: false,
                ..
            } => "Methodref",
            Constant::MethodRef {
                is_interface: true, ..
            } => "InterfaceMethodref",
            Constant::String(_) => "String",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::Utf8(_) => "Utf8",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType { .. } => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
            Constant::Module(_) => "Module",
            Constant::Package(_) => "Package",
        }
    }

    /// Read one entry, starting at its tag byte
    fn read<R: ReadBytesExt>(reader: &mut R, index: u16) -> Result<Constant> {
        let tag = u8::deserialize(reader).map_err(read_error)?;
        let constant = match tag {
            1 => {
                let len = u16::deserialize(reader).map_err(read_error)?;
                let mut bytes = vec![0; len as usize];
                reader.read_exact(&mut bytes).map_err(read_error)?;
                let string = decode_modified_utf8(&bytes)
                    .ok_or(Error::Format(FormatError::InvalidUtf8 { index }))?;
                Constant::Utf8(string)
            }
            3 => Constant::Integer(i32::deserialize(reader).map_err(read_error)?),
            4 => Constant::Float(f32::deserialize(reader).map_err(read_error)?),
            5 => Constant::Long(i64::deserialize(reader).map_err(read_error)?),
            6 => Constant::Double(f64::deserialize(reader).map_err(read_error)?),
            7 => Constant::Class(read_index(reader)?),
            8 => Constant::String(read_index(reader)?),
            9 => Constant::FieldRef {
                class: read_index(reader)?,
                name_and_type: read_index(reader)?,
            },
            10 | 11 => Constant::MethodRef {
                class: read_index(reader)?,
                name_and_type: read_index(reader)?,
                is_interface: tag == 11,
            },
            12 => Constant::NameAndType {
                name: read_index(reader)?,
                descriptor: read_index(reader)?,
            },
            15 => Constant::MethodHandle {
                handle_kind: u8::deserialize(reader).map_err(read_error)?,
                member: read_index(reader)?,
            },
            16 => Constant::MethodType {
                descriptor: read_index(reader)?,
            },
            17 | 18 => {
                let bootstrap_method = u16::deserialize(reader).map_err(read_error)?;
                let name_and_type = read_index(reader)?;
                if tag == 17 {
                    Constant::Dynamic {
                        bootstrap_method,
                        name_and_type,
                    }
                } else {
                    Constant::InvokeDynamic {
                        bootstrap_method,
                        name_and_type,
                    }
                }
            }
            19 => Constant::Module(read_index(reader)?),
            20 => Constant::Package(read_index(reader)?),
            tag => return Err(Error::Format(FormatError::InvalidConstantTag { tag })),
        };
        Ok(constant)
    }
}

fn read_index<R: ReadBytesExt>(reader: &mut R) -> Result<ConstantIndex> {
    ConstantIndex::deserialize(reader).map_err(read_error)
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(float) => {
                4u8.serialize(writer)?;
                float.serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(double) => {
                6u8.serialize(writer)?;
                double.serialize(writer)?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(bytes) => {
                8u8.serialize(writer)?;
                bytes.serialize(writer)?;
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if !is_interface { 10u8 } else { 11u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                15u8.serialize(writer)?;
                handle_kind.serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            } => {
                17u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::Module(name) => {
                19u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Package(name) => {
                20u8.serialize(writer)?;
                name.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`. Quoting
/// the JVM specification:
///
/// > All 8-byte constants take up two entries in the constant_pool table of the class file. If a
/// > CONSTANT_Long_info or CONSTANT_Double_info structure is the item in the constant_pool table
/// > at index n, then the next usable item in the pool is located at index n+2.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Constant pool of the class whose methods are being processed
///
/// This plays two roles. While decoding, it resolves operand indices into literals, member
/// references and names (checking entry kinds along the way). While encoding, it interns whatever
/// the rewritten code needs, reusing existing entries whenever possible. The pool is append only,
/// so indices handed out earlier stay valid.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    constants: OffsetVec<Constant>,

    utf8s: HashMap<String, ConstantIndex>,
    classes: HashMap<ConstantIndex, ConstantIndex>,
    strings: HashMap<ConstantIndex, ConstantIndex>,
    integers: HashMap<i32, ConstantIndex>,
    floats: HashMap<u32, ConstantIndex>,
    longs: HashMap<i64, ConstantIndex>,
    doubles: HashMap<u64, ConstantIndex>,
    name_and_types: HashMap<(ConstantIndex, ConstantIndex), ConstantIndex>,
    fieldrefs: HashMap<(ConstantIndex, ConstantIndex), ConstantIndex>,
    methodrefs: HashMap<(ConstantIndex, ConstantIndex, bool), ConstantIndex>,
    invoke_dynamics: HashMap<(u16, ConstantIndex), ConstantIndex>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        ConstantPool::new()
    }
}

impl ConstantPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantPool {
        ConstantPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            utf8s: HashMap::new(),
            classes: HashMap::new(),
            strings: HashMap::new(),
            integers: HashMap::new(),
            floats: HashMap::new(),
            longs: HashMap::new(),
            doubles: HashMap::new(),
            name_and_types: HashMap::new(),
            fieldrefs: HashMap::new(),
            methodrefs: HashMap::new(),
            invoke_dynamics: HashMap::new(),
        }
    }

    /// Build a pool from entries in index order (the first one lands at index 1)
    pub fn from_constants(constants: impl IntoIterator<Item = Constant>) -> Result<ConstantPool> {
        let mut pool = ConstantPool::new();
        for constant in constants {
            pool.push_constant(constant)?;
        }
        Ok(pool)
    }

    /// Read a pool in class file layout (`u16` count followed by the entries)
    pub fn read<R: ReadBytesExt>(reader: &mut R) -> Result<ConstantPool> {
        let count = u16::deserialize(reader).map_err(read_error)?;
        let mut pool = ConstantPool::new();
        while pool.constants.offset_len().0 < count as usize {
            let index = pool.constants.offset_len().0 as u16;
            let constant = Constant::read(reader, index)?;
            pool.push_constant(constant)?;
        }
        Ok(pool)
    }

    /// Number of indices used, including the unusable zeroth one (the class file `count`)
    pub fn count(&self) -> usize {
        self.constants.offset_len().0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstantIndex, &Constant)> + '_ {
        self.constants
            .iter()
            .map(|(offset, _, constant)| (ConstantIndex(offset.0 as u16), constant))
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the largest valid index is 65535, indexing starts at 1, and some constants take two
    /// spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex> {
        let offset = self.constants.offset_len().0;
        if offset + constant.width() > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow { offset });
        }
        let index = ConstantIndex(offset as u16);

        // Remember entries so that later interning reuses them
        match &constant {
            Constant::Utf8(string) => {
                self.utf8s.entry(string.clone()).or_insert(index);
            }
            Constant::Class(name) => {
                self.classes.entry(*name).or_insert(index);
            }
            Constant::String(utf8) => {
                self.strings.entry(*utf8).or_insert(index);
            }
            Constant::Integer(integer) => {
                self.integers.entry(*integer).or_insert(index);
            }
            Constant::Float(float) => {
                self.floats.entry(float.to_bits()).or_insert(index);
            }
            Constant::Long(long) => {
                self.longs.entry(*long).or_insert(index);
            }
            Constant::Double(double) => {
                self.doubles.entry(double.to_bits()).or_insert(index);
            }
            Constant::NameAndType { name, descriptor } => {
                self.name_and_types
                    .entry((*name, *descriptor))
                    .or_insert(index);
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                self.fieldrefs
                    .entry((*class, *name_and_type))
                    .or_insert(index);
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                self.methodrefs
                    .entry((*class, *name_and_type, *is_interface))
                    .or_insert(index);
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                self.invoke_dynamics
                    .entry((*bootstrap_method, *name_and_type))
                    .or_insert(index);
            }
            _ => (),
        }

        self.constants.push(constant);
        Ok(index)
    }

    /// Look up an entry
    pub fn get(&self, index: u16) -> Result<&Constant> {
        self.constants
            .get_offset(Offset(index as usize))
            .ok_or(Error::Format(FormatError::MissingConstant { index }))
    }

    fn mismatch<T>(index: u16, expected: &'static str, found: &Constant) -> Result<T> {
        Err(Error::Format(FormatError::ConstantTypeMismatch {
            index,
            expected,
            found: found.kind_name(),
        }))
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(string) => Ok(string),
            other => Self::mismatch(index, "Utf8", other),
        }
    }

    /// Name in a `Class` entry (an internal name, or a descriptor for array classes)
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(name.0),
            other => Self::mismatch(index, "Class", other),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(name.0)?, self.utf8(descriptor.0)?))
            }
            other => Self::mismatch(index, "NameAndType", other),
        }
    }

    /// Literal loaded by `ldc`/`ldc_w` (`wide == false`) or `ldc2_w` (`wide == true`)
    pub fn loadable(&self, index: u16, wide: bool) -> Result<Literal> {
        let literal = match (self.get(index)?, wide) {
            (Constant::Integer(integer), false) => Literal::Int(*integer),
            (Constant::Float(float), false) => Literal::Float(*float),
            (Constant::String(utf8), false) => Literal::String(self.utf8(utf8.0)?.to_owned()),
            (Constant::Class(_), false) => Literal::Class(self.class_name(index)?.to_owned()),
            (Constant::Long(long), true) => Literal::Long(*long),
            (Constant::Double(double), true) => Literal::Double(*double),
            (other, false) => return Self::mismatch(index, "Integer, Float, String or Class", other),
            (other, true) => return Self::mismatch(index, "Long or Double", other),
        };
        Ok(literal)
    }

    /// Field, method, or interface method reference
    pub fn member(&self, index: u16) -> Result<(MemberKind, Reference)> {
        let (kind, class, name_and_type) = match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            } => (MemberKind::Field, class, name_and_type),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface: false,
            } => (MemberKind::Method, class, name_and_type),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface: true,
            } => (MemberKind::InterfaceMethod, class, name_and_type),
            other => return Self::mismatch(index, "Fieldref or Methodref", other),
        };
        let (name, descriptor) = self.name_and_type(name_and_type.0)?;
        let reference = Reference::new(self.class_name(class.0)?, name, descriptor);
        Ok((kind, reference))
    }

    /// Every well-formed field reference in the pool
    pub fn field_references(&self) -> impl Iterator<Item = Reference> + '_ {
        self.iter().filter_map(move |(index, constant)| match constant {
            Constant::FieldRef { .. } => self.member(index.0).ok().map(|(_, field)| field),
            _ => None,
        })
    }

    /// Bootstrap method index, name, and descriptor of an `InvokeDynamic` entry
    pub fn invoke_dynamic(&self, index: u16) -> Result<(u16, &str, &str)> {
        match self.get(index)? {
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(name_and_type.0)?;
                Ok((*bootstrap_method, name, descriptor))
            }
            other => Self::mismatch(index, "InvokeDynamic", other),
        }
    }

    /// Get or insert a utf8 constant
    pub fn put_utf8(&mut self, utf8: &str) -> Result<ConstantIndex> {
        match self.utf8s.get(utf8) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Utf8(utf8.to_owned())),
        }
    }

    /// Get or insert a class constant
    pub fn put_class(&mut self, name: &str) -> Result<ConstantIndex> {
        let name = self.put_utf8(name)?;
        match self.classes.get(&name) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Class(name)),
        }
    }

    /// Get or insert a name & type constant
    pub fn put_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<ConstantIndex> {
        let name = self.put_utf8(name)?;
        let descriptor = self.put_utf8(descriptor)?;
        match self.name_and_types.get(&(name, descriptor)) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::NameAndType { name, descriptor }),
        }
    }

    /// Get or insert the entry `ldc`/`ldc2_w` needs to push a literal
    ///
    /// `null` has no pool representation, so it produces `None`.
    pub fn put_literal(&mut self, literal: &Literal) -> Result<Option<ConstantIndex>> {
        let index = match literal {
            Literal::Null => return Ok(None),
            Literal::Int(integer) => match self.integers.get(integer) {
                Some(idx) => *idx,
                None => self.push_constant(Constant::Integer(*integer))?,
            },
            Literal::Float(float) => match self.floats.get(&float.to_bits()) {
                Some(idx) => *idx,
                None => self.push_constant(Constant::Float(*float))?,
            },
            Literal::Long(long) => match self.longs.get(long) {
                Some(idx) => *idx,
                None => self.push_constant(Constant::Long(*long))?,
            },
            Literal::Double(double) => match self.doubles.get(&double.to_bits()) {
                Some(idx) => *idx,
                None => self.push_constant(Constant::Double(*double))?,
            },
            Literal::String(string) => {
                let utf8 = self.put_utf8(string)?;
                match self.strings.get(&utf8) {
                    Some(idx) => *idx,
                    None => self.push_constant(Constant::String(utf8))?,
                }
            }
            Literal::Class(name) => self.put_class(name)?,
        };
        Ok(Some(index))
    }

    /// Get or insert a field/method reference
    pub fn put_member(&mut self, kind: MemberKind, reference: &Reference) -> Result<ConstantIndex> {
        let class = self.put_class(&reference.class)?;
        let name_and_type = self.put_name_and_type(&reference.name, &reference.descriptor)?;
        match kind {
            MemberKind::Field => match self.fieldrefs.get(&(class, name_and_type)) {
                Some(idx) => Ok(*idx),
                None => self.push_constant(Constant::FieldRef {
                    class,
                    name_and_type,
                }),
            },
            MemberKind::Method | MemberKind::InterfaceMethod => {
                let is_interface = kind == MemberKind::InterfaceMethod;
                match self.methodrefs.get(&(class, name_and_type, is_interface)) {
                    Some(idx) => Ok(*idx),
                    None => self.push_constant(Constant::MethodRef {
                        class,
                        name_and_type,
                        is_interface,
                    }),
                }
            }
        }
    }

    /// Get or insert an invoke dynamic constant
    pub fn put_invoke_dynamic(
        &mut self,
        bootstrap_method: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<ConstantIndex> {
        let name_and_type = self.put_name_and_type(name, descriptor)?;
        match self.invoke_dynamics.get(&(bootstrap_method, name_and_type)) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            }),
        }
    }
}

impl Serialize for ConstantPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.count() as u16).serialize(writer)?;
        for (_, constant) in self.iter() {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u0000` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for unit in string.encode_utf16() {
        let code = unit as u32;
        if code != 0 && code < 0x80 {
            buffer.push(code as u8);
        } else if code < 0x800 {
            buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
            buffer.push((code & 0x3F) as u8 | 0b1000_0000);
        } else {
            buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
            buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
            buffer.push((code & 0x3F) as u8 | 0b1000_0000);
        }
    }
    buffer
}

/// Inverse of [`encode_modified_utf8`]
///
/// Returns `None` for malformed byte sequences and for unpaired surrogates (which Rust strings
/// cannot represent).
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    while let Some(byte) = iter.next() {
        let unit = match byte {
            0x01..=0x7F => byte as u16,
            0xC0..=0xDF => {
                let b2 = continuation(iter.next())?;
                ((byte as u16 & 0x1F) << 6) | b2
            }
            0xE0..=0xEF => {
                let b2 = continuation(iter.next())?;
                let b3 = continuation(iter.next())?;
                ((byte as u16 & 0x0F) << 12) | (b2 << 6) | b3
            }
            _ => return None,
        };
        units.push(unit);
    }
    String::from_utf16(&units).ok()
}

fn continuation(byte: Option<u8>) -> Option<u16> {
    match byte {
        Some(b @ 0x80..=0xBF) => Some(b as u16 & 0x3F),
        _ => None,
    }
}

#[cfg(test)]
mod encode_modified_utf8_tests {
    use super::*;

    #[test]
    fn containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(decode_modified_utf8(&[97, 192, 128, 97]).unwrap(), "a\x00a");
    }

    #[test]
    fn simple_ascii() {
        assert_eq!(encode_modified_utf8("foo"), vec![102, 111, 111]);
        assert_eq!(decode_modified_utf8(b"hel10_World").unwrap(), "hel10_World");
    }

    #[test]
    fn supplementary_characters() {
        let encoded = vec![
            237, 160, 128, 237, 176, 128, 237, 172, 191, 237, 191, 191, 237, 175, 191, 237, 191,
            191,
        ];
        assert_eq!(
            encode_modified_utf8("\u{10000}\u{dffff}\u{10FFFF}"),
            encoded
        );
        assert_eq!(
            decode_modified_utf8(&encoded).unwrap(),
            "\u{10000}\u{dffff}\u{10FFFF}"
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(decode_modified_utf8(&[0xC0]).is_none());
        assert!(decode_modified_utf8(&[0xE0, 0x80, 0x41]).is_none());
        assert!(decode_modified_utf8(&[0xF0, 0x90, 0x80, 0x80]).is_none());
        // Lone high surrogate
        assert!(decode_modified_utf8(&[237, 160, 128]).is_none());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_pool() -> ConstantPool {
        ConstantPool::from_constants(vec![
            Constant::Utf8("java/lang/String".to_owned()), // 1
            Constant::Class(ConstantIndex(1)),             // 2
            Constant::Long(7),                             // 3 (and 4)
            Constant::Utf8("length".to_owned()),           // 5
            Constant::Utf8("()I".to_owned()),              // 6
            Constant::NameAndType {
                name: ConstantIndex(5),
                descriptor: ConstantIndex(6),
            }, // 7
            Constant::MethodRef {
                class: ConstantIndex(2),
                name_and_type: ConstantIndex(7),
                is_interface: false,
            }, // 8
            Constant::String(ConstantIndex(5)), // 9
        ])
        .unwrap()
    }

    #[test]
    fn resolves_entries() {
        let pool = sample_pool();
        assert_eq!(pool.count(), 10);
        assert_eq!(pool.class_name(2).unwrap(), "java/lang/String");
        assert_eq!(pool.loadable(3, true).unwrap(), Literal::Long(7));
        assert_eq!(
            pool.loadable(9, false).unwrap(),
            Literal::String("length".to_owned())
        );
        let (kind, reference) = pool.member(8).unwrap();
        assert_eq!(kind, MemberKind::Method);
        assert_eq!(reference, Reference::new("java/lang/String", "length", "()I"));
    }

    #[test]
    fn rejects_wrong_kinds() {
        let pool = sample_pool();
        assert!(matches!(
            pool.loadable(3, false),
            Err(Error::Format(FormatError::ConstantTypeMismatch { index: 3, .. }))
        ));
        assert!(matches!(
            pool.loadable(9, true),
            Err(Error::Format(FormatError::ConstantTypeMismatch { index: 9, .. }))
        ));
        assert!(matches!(
            pool.get(4),
            Err(Error::Format(FormatError::MissingConstant { index: 4 }))
        ));
        assert!(matches!(
            pool.member(2),
            Err(Error::Format(FormatError::ConstantTypeMismatch { .. }))
        ));
    }

    #[test]
    fn interning_reuses_entries() {
        let mut pool = sample_pool();
        let before = pool.count();
        assert_eq!(pool.put_class("java/lang/String").unwrap(), ConstantIndex(2));
        assert_eq!(
            pool.put_literal(&Literal::Long(7)).unwrap(),
            Some(ConstantIndex(3))
        );
        assert_eq!(
            pool.put_member(
                MemberKind::Method,
                &Reference::new("java/lang/String", "length", "()I")
            )
            .unwrap(),
            ConstantIndex(8)
        );
        assert_eq!(pool.count(), before);

        let fresh = pool.put_literal(&Literal::Int(100_000)).unwrap().unwrap();
        assert_eq!(fresh, ConstantIndex(before as u16));
        assert_eq!(pool.put_literal(&Literal::Null).unwrap(), None);
    }

    #[test]
    fn read_back_serialized_pool() {
        let pool = sample_pool();
        let mut bytes = vec![];
        pool.serialize(&mut bytes).unwrap();
        let read = ConstantPool::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(read.count(), pool.count());
        assert_eq!(read.loadable(3, true).unwrap(), Literal::Long(7));
        assert_eq!(read.member(8).unwrap(), pool.member(8).unwrap());
    }

    #[test]
    fn truncated_pool() {
        let bytes = [0u8, 3, 1, 0, 5, b'a'];
        assert!(matches!(
            ConstantPool::read(&mut &bytes[..]),
            Err(Error::Format(FormatError::Truncated))
        ));
    }
}
