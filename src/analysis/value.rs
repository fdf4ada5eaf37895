use crate::jvm::code::{InstrId, Literal};
use std::fmt;

/// Handle to an abstract value in a [`ValueTable`]
///
/// The two smallest ids are shared `unknown` values (one per stack width). They never change,
/// so they carry no dependents and are never copied.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ValueId(u32);

impl ValueId {
    pub const UNKNOWN: ValueId = ValueId(0);
    pub const UNKNOWN_WIDE: ValueId = ValueId(1);

    /// Shared `unknown` value of a given width
    pub fn unknown(width: usize) -> ValueId {
        if width == 2 {
            ValueId::UNKNOWN_WIDE
        } else {
            ValueId::UNKNOWN
        }
    }

    fn is_shared_unknown(self) -> bool {
        self.0 < 2
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// What is known about a value
#[derive(Clone, PartialEq, Debug)]
pub enum ConstValue {
    Unknown,

    /// The value is always this literal
    Known(Literal),

    /// The value is always the one the parameter in this local slot had on entry to the method
    Parameter(u16),

    /// Return address pushed by a `jsr` into the subroutine starting at the given entry
    ReturnAddress(InstrId),
}

impl ConstValue {
    pub fn is_unknown(&self) -> bool {
        matches!(self, ConstValue::Unknown)
    }
}

/// Something to revisit when a value stops being known
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Dependent {
    /// Another value computed from (or merged with) this one
    Value(ValueId),

    /// The instruction whose entry state holds this value
    Instruction(InstrId),

    /// The constant or branch fact recorded for an instruction
    Fact(InstrId),
}

struct ValueNode {
    value: ConstValue,
    width: u8,
    dependents: Vec<Dependent>,
}

/// Every abstract value created while analysing one method, with the dependency edges along
/// which invalidation spreads
///
/// Values only ever move from known to unknown, and each one does so at most once.
pub struct ValueTable {
    nodes: Vec<ValueNode>,
}

impl ValueTable {
    pub fn new() -> ValueTable {
        let unknown = |width| ValueNode {
            value: ConstValue::Unknown,
            width,
            dependents: vec![],
        };
        ValueTable {
            nodes: vec![unknown(1), unknown(2)],
        }
    }

    /// Number of values created so far (including the shared unknowns)
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Has nothing beyond the shared unknowns been created?
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 2
    }

    fn alloc(&mut self, value: ConstValue, width: usize) -> ValueId {
        let id = ValueId(self.nodes.len() as u32);
        self.nodes.push(ValueNode {
            value,
            width: width as u8,
            dependents: vec![],
        });
        id
    }

    /// Fresh value holding a literal
    pub fn known(&mut self, literal: Literal) -> ValueId {
        let width = crate::util::Width::width(&literal);
        self.alloc(ConstValue::Known(literal), width)
    }

    /// Fresh value standing for a parameter on entry to the method
    pub fn parameter(&mut self, slot: u16, width: usize) -> ValueId {
        self.alloc(ConstValue::Parameter(slot), width)
    }

    pub fn return_address(&mut self, entry: InstrId) -> ValueId {
        self.alloc(ConstValue::ReturnAddress(entry), 1)
    }

    /// Fresh value computed from some inputs
    ///
    /// An unknown result is just the shared unknown. A known one is invalidated along with any
    /// of its inputs.
    pub fn derived(&mut self, value: ConstValue, width: usize, inputs: &[ValueId]) -> ValueId {
        if value.is_unknown() {
            return ValueId::unknown(width);
        }
        let id = self.alloc(value, width);
        for input in inputs {
            self.add_dependent(*input, Dependent::Value(id));
        }
        id
    }

    /// Private copy of a value for the entry state of `owner`
    ///
    /// The copy follows the original into `unknown`, and can also be invalidated on its own
    /// (when a merge into `owner` disagrees) without affecting the original.
    pub fn copy(&mut self, id: ValueId, owner: InstrId) -> ValueId {
        if self.is_unknown(id) {
            return ValueId::unknown(self.width(id));
        }
        let node = &self.nodes[id.0 as usize];
        let (value, width) = (node.value.clone(), node.width as usize);
        let copy = self.alloc(value, width);
        self.add_dependent(id, Dependent::Value(copy));
        self.add_dependent(copy, Dependent::Instruction(owner));
        copy
    }

    pub fn get(&self, id: ValueId) -> &ConstValue {
        &self.nodes[id.0 as usize].value
    }

    pub fn literal(&self, id: ValueId) -> Option<&Literal> {
        match self.get(id) {
            ConstValue::Known(literal) => Some(literal),
            _ => None,
        }
    }

    pub fn width(&self, id: ValueId) -> usize {
        self.nodes[id.0 as usize].width as usize
    }

    pub fn is_unknown(&self, id: ValueId) -> bool {
        self.get(id).is_unknown()
    }

    /// Revisit `dependent` if `id` ever becomes unknown
    ///
    /// Values that are already unknown will never change, so nothing is recorded for them.
    pub fn add_dependent(&mut self, id: ValueId, dependent: Dependent) {
        if id.is_shared_unknown() {
            return;
        }
        let node = &mut self.nodes[id.0 as usize];
        if !node.value.is_unknown() && !node.dependents.contains(&dependent) {
            node.dependents.push(dependent);
        }
    }

    /// Withdraw a value, returning what depended on it
    ///
    /// Returns nothing if the value was already unknown, so every dependent fires at most once.
    pub fn invalidate(&mut self, id: ValueId) -> Vec<Dependent> {
        let node = &mut self.nodes[id.0 as usize];
        if node.value.is_unknown() {
            return vec![];
        }
        node.value = ConstValue::Unknown;
        std::mem::take(&mut node.dependents)
    }
}

impl Default for ValueTable {
    fn default() -> ValueTable {
        ValueTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalidation_fires_once() {
        let mut values = ValueTable::new();
        let two = values.known(Literal::Int(2));
        let three = values.known(Literal::Int(3));
        let sum = values.derived(ConstValue::Known(Literal::Int(5)), 1, &[two, three]);
        let copy = values.copy(sum, InstrId(4));

        assert_eq!(values.invalidate(three), vec![Dependent::Value(sum)]);
        assert!(values.invalidate(three).is_empty());
        assert_eq!(values.invalidate(sum), vec![Dependent::Value(copy)]);
        assert_eq!(
            values.invalidate(copy),
            vec![Dependent::Instruction(InstrId(4))]
        );
        assert_eq!(values.literal(two), Some(&Literal::Int(2)));
    }

    #[test]
    fn parameters_follow_their_copies() {
        let mut values = ValueTable::new();
        let parameter = values.parameter(1, 2);
        let copy = values.copy(parameter, InstrId(3));
        assert_ne!(copy, parameter);
        assert_eq!(values.get(copy), &ConstValue::Parameter(1));
        assert_eq!(values.width(copy), 2);
        assert_eq!(values.literal(copy), None);

        assert_eq!(values.invalidate(parameter), vec![Dependent::Value(copy)]);
        assert_eq!(
            values.invalidate(copy),
            vec![Dependent::Instruction(InstrId(3))]
        );
        assert!(values.is_unknown(copy));
    }

    #[test]
    fn unknowns_are_shared() {
        let mut values = ValueTable::new();
        let unknown = values.derived(ConstValue::Unknown, 2, &[]);
        assert_eq!(unknown, ValueId::UNKNOWN_WIDE);
        assert_eq!(values.copy(unknown, InstrId(0)), ValueId::UNKNOWN_WIDE);
        values.add_dependent(unknown, Dependent::Fact(InstrId(0)));
        assert!(values.invalidate(unknown).is_empty());
        assert_eq!(values.len(), 2);
    }
}
