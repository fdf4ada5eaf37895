use super::value::{Dependent, ValueId, ValueTable};
use crate::jvm::code::InstrId;
use crate::jvm::{ConsistencyError, Error, Result};

/// Abstract operand stack and locals on entry to one instruction
///
/// Both are measured in slots. A `long` or `double` occupies its value in the lower slot and
/// `None` in the upper one. `None` in a local also marks a slot that holds nothing usable
/// (never written, clobbered half of a wide value, or disagreeing kinds of value on different
/// paths).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackLocalInfo {
    pub locals: Vec<Option<ValueId>>,
    pub stack: Vec<Option<ValueId>>,
}

/// Result of merging a new incoming state into an existing one
#[derive(Default, Debug)]
pub struct MergeOutcome {
    /// Some slot became unusable, so the instruction must be processed again
    pub changed: bool,

    /// Values of the existing state that disagree with the incoming state
    pub invalidated: Vec<ValueId>,
}

impl StackLocalInfo {
    pub fn new(max_locals: usize) -> StackLocalInfo {
        StackLocalInfo {
            locals: vec![None; max_locals],
            stack: vec![],
        }
    }

    /// Copy of this state, with private copies of the known values, to live at `owner`
    pub fn copy_for(&self, owner: InstrId, values: &mut ValueTable) -> StackLocalInfo {
        let mut copy_slot = |slot: &Option<ValueId>| slot.map(|id| values.copy(id, owner));
        StackLocalInfo {
            locals: self.locals.iter().map(&mut copy_slot).collect(),
            stack: self.stack.iter().map(&mut copy_slot).collect(),
        }
    }

    pub fn push(&mut self, id: ValueId, width: usize) {
        self.stack.push(Some(id));
        if width == 2 {
            self.stack.push(None);
        }
    }

    /// Pop a value of the given width
    ///
    /// Popping a wide value off two narrow ones (or the reverse) only happens in unverifiable
    /// code, and yields an unknown value.
    pub fn pop(&mut self, width: usize, instr: InstrId) -> Result<ValueId> {
        let underflow = || Error::Consistency(ConsistencyError::StackUnderflow(instr));
        if width == 2 {
            let upper = self.stack.pop().ok_or_else(underflow)?;
            let lower = self.stack.pop().ok_or_else(underflow)?;
            Ok(match (lower, upper) {
                (Some(id), None) => id,
                _ => ValueId::UNKNOWN_WIDE,
            })
        } else {
            Ok(self.stack.pop().ok_or_else(underflow)?.unwrap_or(ValueId::UNKNOWN))
        }
    }

    /// Pop raw slots (for the stack shuffling instructions), topmost last
    pub fn pop_slots(&mut self, count: usize, instr: InstrId) -> Result<Vec<Option<ValueId>>> {
        if self.stack.len() < count {
            return Err(Error::Consistency(ConsistencyError::StackUnderflow(instr)));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    pub fn push_slots(&mut self, slots: &[Option<ValueId>]) {
        self.stack.extend_from_slice(slots);
    }

    /// Read a local, which must hold a usable value
    pub fn load(&self, slot: u16, width: usize, instr: InstrId) -> Result<ValueId> {
        let unusable = || Error::Consistency(ConsistencyError::UnusableLocal { instr, slot });
        let index = slot as usize;
        let id = self.locals.get(index).copied().flatten().ok_or_else(unusable)?;
        if width == 2 && index + 1 >= self.locals.len() {
            return Err(unusable());
        }
        Ok(id)
    }

    /// Write a local, clobbering the wide value whose upper half it may overwrite
    pub fn store(
        &mut self,
        slot: u16,
        id: ValueId,
        width: usize,
        values: &ValueTable,
        instr: InstrId,
    ) -> Result<()> {
        let index = slot as usize;
        if index + width > self.locals.len() {
            return Err(Error::Consistency(ConsistencyError::UnusableLocal { instr, slot }));
        }
        if index > 0 {
            if let Some(below) = self.locals[index - 1] {
                if values.width(below) == 2 {
                    self.locals[index - 1] = None;
                }
            }
        }
        self.locals[index] = Some(id);
        if width == 2 {
            self.locals[index + 1] = None;
        }
        Ok(())
    }

    /// Merge a state flowing in from another predecessor
    ///
    /// Slot by slot: equal known values stay known, with the incoming value recorded as a
    /// dependency so that its later withdrawal reaches this state too. Anything else withdraws
    /// the existing value. Slots only ever go from usable to unusable.
    pub fn merge(
        &mut self,
        incoming: &StackLocalInfo,
        values: &mut ValueTable,
        instr: InstrId,
    ) -> Result<MergeOutcome> {
        if self.stack.len() != incoming.stack.len() {
            return Err(Error::Consistency(ConsistencyError::StackHeightMismatch {
                instr,
                expected: self.stack.len(),
                found: incoming.stack.len(),
            }));
        }

        let mut outcome = MergeOutcome::default();
        let slots = self
            .locals
            .iter_mut()
            .zip(&incoming.locals)
            .chain(self.stack.iter_mut().zip(&incoming.stack));
        for (existing, incoming) in slots {
            let (current, other) = match (*existing, *incoming) {
                (Some(current), Some(other)) => (current, other),
                (Some(_), None) => {
                    *existing = None;
                    outcome.changed = true;
                    continue;
                }
                (None, _) => continue,
            };
            if current == other || values.is_unknown(current) {
                continue;
            }
            let agree =
                values.get(current) == values.get(other) && values.width(current) == values.width(other);
            if agree {
                values.add_dependent(other, Dependent::Value(current));
            } else {
                outcome.invalidated.push(current);
            }
        }
        Ok(outcome)
    }
}
