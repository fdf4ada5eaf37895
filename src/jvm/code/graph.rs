use super::opcodes::*;
use super::{InstrId, Instruction, Operand};
use crate::jvm::class_file::Attribute;
use crate::jvm::{ConsistencyError, Error, Result};
use log::trace;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Exception handler, anchored to instructions rather than addresses
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Handler {
    /// First protected instruction
    pub start: InstrId,

    /// Last protected instruction (inclusive)
    pub end: InstrId,

    /// Where control resumes when a matching exception is thrown
    pub catcher: InstrId,

    /// Internal name of the caught class (`None` catches everything)
    pub catch_type: Option<String>,
}

/// `LocalVariableTable` row
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LocalVariable {
    /// First instruction where the variable is in scope
    pub start: InstrId,

    /// Last instruction where the variable is in scope (inclusive)
    pub end: InstrId,

    pub name: String,
    pub descriptor: String,
    pub slot: u16,
}

/// `LineNumberTable` row
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LineNumber {
    pub start: InstrId,
    pub line: u16,
}

/// Control flow graph of a method body
///
/// Instructions live in an arena and are chained in address order. Control flow is explicit only
/// where it departs from address order: an instruction falls through to the next one unless it
/// [always jumps](Instruction::always_jumps), and lists its other targets as successors.
///
///   - conditional branches have one successor (the branch target)
///   - `goto` has one successor
///   - switches have one successor per case followed by the default
///   - `jsr` has the subroutine entry and the resume point (the latter is dropped if the
///     subroutine provably never returns)
///   - returns, `athrow`, and `ret` have none
///
/// Exception edges are not successors: they are implied by the `handlers`.
#[derive(Clone)]
pub struct InstructionGraph {
    pub max_stack: u16,
    pub max_locals: u16,
    instrs: Vec<Instruction>,
    first: Option<InstrId>,
    last: Option<InstrId>,

    /// Exception handlers, in priority order
    pub handlers: Vec<Handler>,

    /// Debug table of local variable names (`None` if the method had none)
    pub local_variables: Option<Vec<LocalVariable>>,

    /// Debug table of line numbers (`None` if the method had none)
    pub line_numbers: Option<Vec<LineNumber>>,

    /// Other `Code` sub-attributes, carried through untouched
    pub other_attributes: Vec<Attribute>,
}

impl InstructionGraph {
    pub fn new(max_stack: u16, max_locals: u16) -> InstructionGraph {
        InstructionGraph {
            max_stack,
            max_locals,
            instrs: vec![],
            first: None,
            last: None,
            handlers: vec![],
            local_variables: None,
            line_numbers: None,
            other_attributes: vec![],
        }
    }

    /// Add an instruction at the end of the address order
    pub fn push(&mut self, opcode: u8, operand: Operand) -> InstrId {
        let id = self.alloc(Instruction::new(opcode, operand));
        self.instrs[id.index()].prev = self.last;
        match self.last {
            Some(last) => self.instrs[last.index()].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        id
    }

    fn alloc(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr);
        id
    }

    pub fn get(&self, id: InstrId) -> &Instruction {
        &self.instrs[id.index()]
    }

    pub fn get_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.instrs[id.index()]
    }

    /// Size of the arena, including removed instructions (ids are all below this)
    pub fn arena_len(&self) -> usize {
        self.instrs.len()
    }

    /// Number of live instructions
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn first(&self) -> Option<InstrId> {
        self.first
    }

    pub fn last(&self) -> Option<InstrId> {
        self.last
    }

    pub fn next(&self, id: InstrId) -> Option<InstrId> {
        self.get(id).next
    }

    pub fn prev(&self, id: InstrId) -> Option<InstrId> {
        self.get(id).prev
    }

    /// Live instructions in address order
    pub fn iter(&self) -> InstrIter<'_> {
        InstrIter {
            graph: self,
            cursor: self.first,
        }
    }

    /// Position of every live instruction in address order
    pub fn positions(&self) -> HashMap<InstrId, usize> {
        self.iter().enumerate().map(|(pos, id)| (id, pos)).collect()
    }

    /// Explicit successors (see the type level docs for their shape)
    pub fn successors(&self, id: InstrId) -> &[InstrId] {
        &self.get(id).succs
    }

    /// All normal control flow successors: explicit ones followed by the fallthrough
    pub fn flow_successors(&self, id: InstrId) -> Vec<InstrId> {
        let instr = self.get(id);
        let mut succs = instr.succs.clone();
        if !instr.always_jumps {
            succs.extend(instr.next);
        }
        succs
    }

    /// Normal control flow predecessors: instructions jumping here, then the fallthrough one
    pub fn predecessors(&self, id: InstrId) -> Vec<InstrId> {
        let instr = self.get(id);
        let mut preds = instr.jump_preds.clone();
        if let Some(prev) = instr.prev {
            if !self.get(prev).always_jumps {
                preds.push(prev);
            }
        }
        preds
    }

    /// Instructions listing `id` as an explicit successor
    pub fn jump_predecessors(&self, id: InstrId) -> &[InstrId] {
        &self.get(id).jump_preds
    }

    /// Is control entering here other than by falling through?
    pub fn is_jump_target(&self, id: InstrId) -> bool {
        !self.get(id).jump_preds.is_empty() || self.handlers.iter().any(|h| h.catcher == id)
    }

    /// Replace the explicit successors of an instruction
    pub fn set_successors(&mut self, id: InstrId, succs: Vec<InstrId>) {
        let old = std::mem::take(&mut self.instrs[id.index()].succs);
        for succ in old {
            let preds = &mut self.instrs[succ.index()].jump_preds;
            if let Some(pos) = preds.iter().position(|p| *p == id) {
                preds.remove(pos);
            }
        }
        for succ in &succs {
            self.instrs[succ.index()].jump_preds.push(id);
        }
        self.instrs[id.index()].succs = succs;
    }

    /// Change what an instruction does, dropping its explicit successors
    pub fn replace(&mut self, id: InstrId, opcode: u8, operand: Operand) {
        trace!("replace {} with {}", self.get(id), mnemonic(opcode).unwrap_or("???"));
        self.set_successors(id, vec![]);
        let instr = self.get_mut(id);
        instr.opcode = opcode;
        instr.operand = operand;
        instr.always_jumps = always_jumps(opcode);
    }

    /// Insert a new instruction just before `before`, which takes over all of the ways control
    /// could enter `before` (jumps, handler catchers, the start of protected ranges)
    pub fn insert_before(&mut self, before: InstrId, opcode: u8, operand: Operand) -> InstrId {
        let id = self.alloc(Instruction::new(opcode, operand));
        let prev = self.get(before).prev;
        self.link_between(prev, id, Some(before));

        let jumpers = self.get(before).jump_preds.clone();
        for jumper in jumpers {
            let succs: Vec<InstrId> = self
                .successors(jumper)
                .iter()
                .map(|succ| if *succ == before { id } else { *succ })
                .collect();
            self.set_successors(jumper, succs);
        }
        for handler in &mut self.handlers {
            if handler.start == before {
                handler.start = id;
            }
            if handler.catcher == before {
                handler.catcher = id;
            }
        }
        for line in self.line_numbers.iter_mut().flatten() {
            if line.start == before {
                line.start = id;
            }
        }
        trace!("inserted {} before {}", id, before);
        id
    }

    /// Insert a new instruction just after `after`
    ///
    /// Nothing is redirected: the new instruction is only reachable by falling through from
    /// `after`. If `after` ends a protected range or a variable scope, the new instruction is
    /// left outside of it.
    pub fn append_after(&mut self, after: InstrId, opcode: u8, operand: Operand) -> InstrId {
        let id = self.alloc(Instruction::new(opcode, operand));
        let next = self.get(after).next;
        self.link_between(Some(after), id, next);
        trace!("appended {} after {}", id, after);
        id
    }

    fn link_between(&mut self, prev: Option<InstrId>, id: InstrId, next: Option<InstrId>) {
        self.instrs[id.index()].prev = prev;
        self.instrs[id.index()].next = next;
        match prev {
            Some(prev) => self.instrs[prev.index()].next = Some(id),
            None => self.first = Some(id),
        }
        match next {
            Some(next) => self.instrs[next.index()].prev = Some(id),
            None => self.last = Some(id),
        }
    }

    /// Remove one instruction (see [`InstructionGraph::remove_all`])
    pub fn remove(&mut self, id: InstrId) -> Result<()> {
        self.remove_all(&HashSet::from([id]))
    }

    /// Remove a set of instructions at once
    ///
    /// Jumps from surviving instructions into the set are redirected to the next survivor in
    /// address order. Handler ranges and variable scopes shrink to the survivors they still
    /// cover (and are dropped if they cover none), handler catchers and line numbers move to the
    /// next survivor.
    ///
    /// A surviving jump with no survivor to go to is an error, except for the resume edge of a
    /// `jsr`, which is dropped (it means the subroutine never returns).
    pub fn remove_all(&mut self, removed: &HashSet<InstrId>) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        for id in removed {
            if self.get(*id).removed {
                return Err(Error::Consistency(ConsistencyError::RemovedInstruction(*id)));
            }
        }

        // Next survivor after every removed instruction, computed back to front
        let mut next_survivor: HashMap<InstrId, Option<InstrId>> = HashMap::new();
        let mut survivor = None;
        let mut cursor = self.last;
        while let Some(id) = cursor {
            if removed.contains(&id) {
                next_survivor.insert(id, survivor);
            } else {
                survivor = Some(id);
            }
            cursor = self.get(id).prev;
        }

        // Redirect surviving jumps
        let mut jumpers: Vec<InstrId> = removed
            .iter()
            .flat_map(|id| self.get(*id).jump_preds.iter().copied())
            .filter(|jumper| !removed.contains(jumper))
            .collect();
        jumpers.sort();
        jumpers.dedup();
        for jumper in jumpers {
            let is_jsr = self.get(jumper).opcode == JSR;
            let mut succs = vec![];
            for (idx, succ) in self.successors(jumper).iter().enumerate() {
                if !removed.contains(succ) {
                    succs.push(*succ);
                    continue;
                }
                match next_survivor[succ] {
                    Some(target) => succs.push(target),
                    None if is_jsr && idx == 1 => (),
                    None => {
                        return Err(Error::Consistency(ConsistencyError::DanglingJump {
                            from: jumper,
                            to: *succ,
                        }))
                    }
                }
            }
            self.set_successors(jumper, succs);
        }

        // Shrink handler ranges
        let positions = self.positions();
        let in_range = |start: InstrId, end: InstrId, id: InstrId| {
            positions[&start] <= positions[&id] && positions[&id] <= positions[&end]
        };
        let survivors: Vec<InstrId> = self.iter().filter(|id| !removed.contains(id)).collect();
        let shrink = |start: InstrId, end: InstrId| -> Option<(InstrId, InstrId)> {
            let mut covered = survivors.iter().filter(|id| in_range(start, end, **id));
            let first = *covered.next()?;
            let last = covered.last().copied().unwrap_or(first);
            Some((first, last))
        };
        let handlers = std::mem::take(&mut self.handlers);
        for handler in handlers {
            let range = shrink(handler.start, handler.end);
            let catcher = if removed.contains(&handler.catcher) {
                next_survivor[&handler.catcher]
            } else {
                Some(handler.catcher)
            };
            match (range, catcher) {
                (Some((start, end)), Some(catcher)) => self.handlers.push(Handler {
                    start,
                    end,
                    catcher,
                    ..handler
                }),
                _ => trace!("dropped handler for {:?}", handler.catch_type),
            }
        }

        if let Some(variables) = self.local_variables.take() {
            let variables = variables
                .into_iter()
                .filter_map(|var| {
                    let (start, end) = shrink(var.start, var.end)?;
                    Some(LocalVariable { start, end, ..var })
                })
                .collect();
            self.local_variables = Some(variables);
        }

        if let Some(lines) = self.line_numbers.take() {
            // Entries already on a survivor win over ones moved onto it
            let mut taken: HashSet<InstrId> = lines
                .iter()
                .filter(|line| !removed.contains(&line.start))
                .map(|line| line.start)
                .collect();
            let lines = lines
                .into_iter()
                .filter_map(|line| {
                    if !removed.contains(&line.start) {
                        return Some(line);
                    }
                    let start = next_survivor[&line.start]?;
                    if taken.insert(start) {
                        Some(LineNumber { start, ..line })
                    } else {
                        None
                    }
                })
                .collect();
            self.line_numbers = Some(lines);
        }

        // Unlink
        for id in removed {
            self.set_successors(*id, vec![]);
        }
        for id in removed {
            let (prev, next) = (self.get(*id).prev, self.get(*id).next);
            match prev {
                Some(prev) => self.instrs[prev.index()].next = next,
                None => self.first = next,
            }
            match next {
                Some(next) => self.instrs[next.index()].prev = prev,
                None => self.last = prev,
            }
            let instr = self.get_mut(*id);
            instr.prev = None;
            instr.next = None;
            instr.jump_preds.clear();
            instr.removed = true;
            trace!("removed {}", id);
        }
        Ok(())
    }

    /// Check the structural invariants every stage relies on
    pub fn validate(&self) -> Result<()> {
        for id in self.iter() {
            let instr = self.get(id);
            for succ in &instr.succs {
                if self.get(*succ).removed {
                    return Err(Error::Consistency(ConsistencyError::DanglingJump {
                        from: id,
                        to: *succ,
                    }));
                }
            }

            let found = instr.succs.len();
            let expected = match (&instr.operand, instr.opcode) {
                (_, op) if is_conditional_branch(op) || op == GOTO => Some(1),
                (_, JSR) if found == 1 || found == 2 => None,
                (_, JSR) => Some(2),
                (Operand::LookupSwitch { values }, LOOKUPSWITCH) => Some(values.len() + 1),
                (_, TABLESWITCH) if found >= 1 => None,
                (_, TABLESWITCH) => Some(1),
                _ => Some(0),
            };
            if let Some(expected) = expected {
                if expected != found {
                    return Err(Error::Consistency(
                        ConsistencyError::SuccessorCountMismatch {
                            instr: id,
                            opcode: instr.opcode,
                            expected,
                            found,
                        },
                    ));
                }
            }

            if !instr.always_jumps && instr.next.is_none() {
                return Err(Error::Consistency(ConsistencyError::FallsOffEnd(id)));
            }
        }

        let positions = self.positions();
        for (index, handler) in self.handlers.iter().enumerate() {
            for id in [handler.start, handler.end, handler.catcher] {
                if !positions.contains_key(&id) {
                    return Err(Error::Consistency(ConsistencyError::RemovedInstruction(id)));
                }
            }
            if positions[&handler.start] > positions[&handler.end] {
                return Err(Error::Consistency(ConsistencyError::EmptyHandlerRange {
                    index,
                }));
            }
        }
        Ok(())
    }

    /// Handlers whose protected range includes an instruction
    pub fn handlers_covering<'a>(
        &'a self,
        id: InstrId,
        positions: &'a HashMap<InstrId, usize>,
    ) -> impl Iterator<Item = &'a Handler> + 'a {
        let pos = positions.get(&id).copied();
        self.handlers.iter().filter(move |handler| {
            pos.map_or(false, |pos| {
                positions[&handler.start] <= pos && pos <= positions[&handler.end]
            })
        })
    }
}

/// Iterator over live instructions in address order
pub struct InstrIter<'a> {
    graph: &'a InstructionGraph,
    cursor: Option<InstrId>,
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = InstrId;

    fn next(&mut self) -> Option<InstrId> {
        let id = self.cursor?;
        self.cursor = self.graph.get(id).next;
        Some(id)
    }
}

impl fmt::Debug for InstructionGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "max_stack = {}, max_locals = {}",
            self.max_stack, self.max_locals
        )?;
        for id in self.iter() {
            writeln!(f, "  {:>5} {}", id.to_string(), self.get(id))?;
        }
        for handler in &self.handlers {
            writeln!(
                f,
                "  catch {} [{}, {}] -> {}",
                handler.catch_type.as_deref().unwrap_or("any"),
                handler.start,
                handler.end,
                handler.catcher
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::Literal;

    fn ldc(value: i32) -> Operand {
        Operand::Literal(Literal::Int(value))
    }

    /// `0: iload 0; 1: ifeq 4; 2: iconst 1; 3: ireturn; 4: iconst 2; 5: ireturn`
    fn diamond() -> (InstructionGraph, Vec<InstrId>) {
        let mut graph = InstructionGraph::new(1, 1);
        let ids = vec![
            graph.push(ILOAD, Operand::Local(0)),
            graph.push(IFEQ, Operand::None),
            graph.push(LDC, ldc(1)),
            graph.push(IRETURN, Operand::None),
            graph.push(LDC, ldc(2)),
            graph.push(IRETURN, Operand::None),
        ];
        graph.set_successors(ids[1], vec![ids[4]]);
        (graph, ids)
    }

    #[test]
    fn predecessors_include_fallthrough() {
        let (graph, ids) = diamond();
        graph.validate().unwrap();
        assert_eq!(graph.predecessors(ids[4]), vec![ids[1]]);
        assert_eq!(graph.predecessors(ids[2]), vec![ids[1]]);
        assert_eq!(graph.flow_successors(ids[1]), vec![ids[4], ids[2]]);
        assert!(graph.flow_successors(ids[3]).is_empty());
    }

    #[test]
    fn remove_redirects_jumps() {
        let (mut graph, ids) = diamond();
        graph.remove(ids[4]).unwrap();
        assert_eq!(graph.successors(ids[1]), &[ids[5]]);
        assert_eq!(graph.len(), 5);
        assert!(graph.get(ids[4]).is_removed());
        graph.validate().unwrap();
    }

    #[test]
    fn remove_without_survivor_is_dangling() {
        let (mut graph, ids) = diamond();
        let err = graph
            .remove_all(&HashSet::from([ids[4], ids[5]]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyError::DanglingJump { .. })
        ));
    }

    #[test]
    fn insert_before_takes_over_entries() {
        let (mut graph, ids) = diamond();
        graph.handlers.push(Handler {
            start: ids[4],
            end: ids[5],
            catcher: ids[4],
            catch_type: None,
        });
        let nop = graph.insert_before(ids[4], NOP, Operand::None);
        assert_eq!(graph.successors(ids[1]), &[nop]);
        assert_eq!(graph.handlers[0].start, nop);
        assert_eq!(graph.handlers[0].catcher, nop);
        assert_eq!(graph.next(ids[3]), Some(nop));
        assert_eq!(graph.next(nop), Some(ids[4]));
    }

    #[test]
    fn handlers_shrink_and_drop() {
        let (mut graph, ids) = diamond();
        graph.handlers.push(Handler {
            start: ids[2],
            end: ids[3],
            catcher: ids[4],
            catch_type: Some("java/lang/Exception".to_owned()),
        });
        graph.handlers.push(Handler {
            start: ids[0],
            end: ids[0],
            catcher: ids[4],
            catch_type: None,
        });
        graph.remove(ids[2]).unwrap();
        assert_eq!(graph.handlers.len(), 2);
        assert_eq!(graph.handlers[0].start, ids[3]);

        graph.remove(ids[3]).unwrap();
        assert_eq!(graph.handlers.len(), 1);
        assert_eq!(graph.handlers[0].start, ids[0]);
    }

    #[test]
    fn falls_off_end() {
        let mut graph = InstructionGraph::new(1, 0);
        let id = graph.push(LDC, ldc(1));
        assert!(matches!(
            graph.validate(),
            Err(Error::Consistency(ConsistencyError::FallsOffEnd(found))) if found == id
        ));
    }
}
