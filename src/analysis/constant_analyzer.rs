//! Worklist constant propagation over an [`InstructionGraph`]
//!
//! Every instruction gets an entry [`StackLocalInfo`] the first time control can reach it.
//! Processing an instruction interprets it on that state and merges the result into the
//! successors it can actually reach: a branch whose operands are known only flows to the side
//! it takes.
//!
//! Assumptions are withdrawn lazily. Each known value records what was derived from it (other
//! values, successor states, facts about instructions), and withdrawing it goes through the
//! same worklist as the instructions. The final facts do not depend on the order in which the
//! worklist is drained, which [`WorklistOrder`] makes testable.

use super::fields::IdentifierService;
use super::pure_methods;
use super::state::StackLocalInfo;
use super::value::{ConstValue, Dependent, ValueId, ValueTable};
use super::MethodContext;
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{InstrId, InstructionGraph, Literal, Operand, Reference, Subroutines};
use crate::jvm::{ConsistencyError, Error, FormatError, Result};
use crate::util::Width;
use bitflags::bitflags;
use std::collections::{BTreeSet, HashMap, VecDeque};

bitflags! {
    /// What the analysis proved about one instruction
    #[derive(Default)]
    pub struct FactFlags: u8 {
        /// Control can reach the instruction
        const REACHABLE = 1;

        /// The instruction always pushes the same value, and can be replaced by pushing it
        const CONSTANT = 2;

        /// The branch always goes to the same successor
        const CONSTANT_FLOW = 4;

        /// The instruction always pushes the value a parameter had on entry
        const PARAMETER = 8;
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct ConstantFact {
    pub flags: FactFlags,

    /// Value pushed (set along with `CONSTANT`)
    pub value: Option<Literal>,

    /// Only successor ever taken (set along with `CONSTANT_FLOW`)
    pub target: Option<InstrId>,

    /// Local slot of the parameter whose entry value is pushed (set along with `PARAMETER`)
    pub parameter: Option<u16>,
}

impl ConstantFact {
    const UNREACHED: ConstantFact = ConstantFact {
        flags: FactFlags::empty(),
        value: None,
        target: None,
        parameter: None,
    };

    fn clear_constant(&mut self) {
        self.flags
            .remove(FactFlags::CONSTANT | FactFlags::CONSTANT_FLOW | FactFlags::PARAMETER);
        self.value = None;
        self.target = None;
        self.parameter = None;
    }
}

/// Facts about every instruction of one method
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ConstantAnalysis {
    facts: Vec<ConstantFact>,
}

impl ConstantAnalysis {
    /// Facts about an instruction (instructions added after the analysis were never reached)
    pub fn fact(&self, id: InstrId) -> &ConstantFact {
        self.facts.get(id.index()).unwrap_or(&ConstantFact::UNREACHED)
    }

    pub fn facts(&self) -> &[ConstantFact] {
        &self.facts
    }

    pub fn is_reachable(&self, id: InstrId) -> bool {
        self.fact(id).flags.contains(FactFlags::REACHABLE)
    }

    /// Value the instruction can be replaced with
    pub fn constant(&self, id: InstrId) -> Option<&Literal> {
        let fact = self.fact(id);
        if fact.flags.contains(FactFlags::CONSTANT) {
            fact.value.as_ref()
        } else {
            None
        }
    }

    /// Successor a branch or switch always takes
    pub fn resolved_target(&self, id: InstrId) -> Option<InstrId> {
        let fact = self.fact(id);
        if fact.flags.contains(FactFlags::CONSTANT_FLOW) {
            fact.target
        } else {
            None
        }
    }

    /// Local slot of the parameter whose value on entry the instruction always pushes
    ///
    /// Such an instruction is not constant, but computes nothing new either (`x + 0`, `x * 1`,
    /// a load of a parameter that may have been stored elsewhere in between, ...).
    pub fn parameter(&self, id: InstrId) -> Option<u16> {
        let fact = self.fact(id);
        if fact.flags.contains(FactFlags::PARAMETER) {
            fact.parameter
        } else {
            None
        }
    }

    pub fn count(&self, flag: FactFlags) -> usize {
        self.facts.iter().filter(|fact| fact.flags.contains(flag)).count()
    }
}

/// Order in which pending work is picked
///
/// The results are the same for every order. Only the amount of work differs.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WorklistOrder {
    /// Oldest item first
    Fifo,

    /// Newest item first
    Lifo,

    /// Pseudo-random, from a seed
    Seeded(u64),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum WorkItem {
    Process(InstrId),
    Invalidate(ValueId),
}

struct Worklist {
    order: WorklistOrder,
    rng: u64,
    items: VecDeque<WorkItem>,
    queued: Vec<bool>,
}

impl Worklist {
    fn new(order: WorklistOrder, instructions: usize) -> Worklist {
        let rng = match order {
            WorklistOrder::Seeded(seed) => seed | 1,
            _ => 1,
        };
        Worklist {
            order,
            rng,
            items: VecDeque::new(),
            queued: vec![false; instructions],
        }
    }

    fn push(&mut self, item: WorkItem) {
        if let WorkItem::Process(id) = item {
            if std::mem::replace(&mut self.queued[id.index()], true) {
                return;
            }
        }
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<WorkItem> {
        let item = match self.order {
            WorklistOrder::Fifo => self.items.pop_front(),
            WorklistOrder::Lifo => self.items.pop_back(),
            WorklistOrder::Seeded(_) => {
                if self.items.is_empty() {
                    return None;
                }
                // xorshift64
                self.rng ^= self.rng << 13;
                self.rng ^= self.rng >> 7;
                self.rng ^= self.rng << 17;
                let index = (self.rng % self.items.len() as u64) as usize;
                self.items.swap_remove_back(index)
            }
        }?;
        if let WorkItem::Process(id) = item {
            self.queued[id.index()] = false;
        }
        Some(item)
    }
}

/// Where control goes after an instruction
enum Flow {
    /// Every normal successor
    Normal,

    /// Only this successor
    Only(InstrId),

    /// Nowhere (or already taken care of)
    Stop,
}

/// Propagates constants through method bodies
pub struct ConstantAnalyzer<'a> {
    service: &'a mut dyn IdentifierService,
    order: WorklistOrder,
    interpret_pure_methods: bool,
}

impl<'a> ConstantAnalyzer<'a> {
    pub fn new(service: &'a mut dyn IdentifierService) -> ConstantAnalyzer<'a> {
        ConstantAnalyzer {
            service,
            order: WorklistOrder::Fifo,
            interpret_pure_methods: true,
        }
    }

    pub fn with_order(mut self, order: WorklistOrder) -> ConstantAnalyzer<'a> {
        self.order = order;
        self
    }

    /// Fold calls to known side-effect free library methods
    pub fn with_pure_methods(mut self, interpret: bool) -> ConstantAnalyzer<'a> {
        self.interpret_pure_methods = interpret;
        self
    }

    /// Run the analysis to a fixpoint
    pub fn analyze(
        &mut self,
        graph: &InstructionGraph,
        context: &MethodContext,
    ) -> Result<ConstantAnalysis> {
        let arena_len = graph.arena_len();
        let mut run = MethodRun {
            graph,
            method: context.reference(),
            service: &mut *self.service,
            interpret_pure_methods: self.interpret_pure_methods,
            subroutines: Subroutines::find(graph)?,
            positions: graph.positions(),
            values: ValueTable::new(),
            states: vec![None; arena_len],
            facts: vec![ConstantFact::default(); arena_len],
            field_listeners: HashMap::new(),
            worklist: Worklist::new(self.order, arena_len),
        };

        if let Some(first) = graph.first() {
            let entry = entry_state(graph, context, &mut run.values)?;
            run.merge_into(first, &entry)?;
            run.drain()?;
        }

        let analysis = ConstantAnalysis { facts: run.facts };
        log::debug!(
            "{}: {} of {} instructions reachable, {} constant, {} branches decided ({} values)",
            run.method,
            analysis.count(FactFlags::REACHABLE),
            graph.len(),
            analysis.count(FactFlags::CONSTANT),
            analysis.count(FactFlags::CONSTANT_FLOW),
            run.values.len(),
        );
        Ok(analysis)
    }
}

/// State on entry to the method: receiver and parameters stand for themselves, other locals
/// are unusable
fn entry_state(
    graph: &InstructionGraph,
    context: &MethodContext,
    values: &mut ValueTable,
) -> Result<StackLocalInfo> {
    let mut state = StackLocalInfo::new(graph.max_locals as usize);
    let mut slot = 0;
    let receiver = if context.is_static { None } else { Some(1) };
    let widths = receiver
        .into_iter()
        .chain(context.descriptor.parameters.iter().map(Width::width));
    for width in widths {
        if slot + width > state.locals.len() {
            return Err(Error::Format(FormatError::InvalidLocalSlot {
                offset: 0,
                slot: slot as u16,
                max_locals: graph.max_locals,
            }));
        }
        state.locals[slot] = Some(values.parameter(slot as u16, width));
        slot += width;
    }
    Ok(state)
}

/// Analysis state for one method
struct MethodRun<'g, 's> {
    graph: &'g InstructionGraph,
    method: Reference,
    service: &'s mut dyn IdentifierService,
    interpret_pure_methods: bool,
    subroutines: Subroutines,
    positions: HashMap<InstrId, usize>,
    values: ValueTable,
    states: Vec<Option<StackLocalInfo>>,
    facts: Vec<ConstantFact>,

    /// Values read from fields assumed constant, to withdraw if a write turns up
    field_listeners: HashMap<Reference, Vec<ValueId>>,

    worklist: Worklist,
}

impl<'g, 's> MethodRun<'g, 's> {
    fn drain(&mut self) -> Result<()> {
        while let Some(item) = self.worklist.pop() {
            match item {
                WorkItem::Process(id) => self.process(id)?,
                WorkItem::Invalidate(value) => {
                    log::trace!("withdraw {}", value);
                    for dependent in self.values.invalidate(value) {
                        match dependent {
                            Dependent::Value(value) => {
                                self.worklist.push(WorkItem::Invalidate(value))
                            }
                            Dependent::Instruction(id) => {
                                self.worklist.push(WorkItem::Process(id))
                            }
                            Dependent::Fact(id) => {
                                self.facts[id.index()].clear_constant();
                                self.worklist.push(WorkItem::Process(id));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge a state into the entry state of `target`, queueing whatever has to be redone
    fn merge_into(&mut self, target: InstrId, incoming: &StackLocalInfo) -> Result<()> {
        match &mut self.states[target.index()] {
            Some(existing) => {
                let outcome = existing.merge(incoming, &mut self.values, target)?;
                if outcome.changed {
                    self.worklist.push(WorkItem::Process(target));
                }
                for value in outcome.invalidated {
                    self.worklist.push(WorkItem::Invalidate(value));
                }
            }
            slot @ None => {
                *slot = Some(incoming.copy_for(target, &mut self.values));
                self.facts[target.index()].flags.insert(FactFlags::REACHABLE);
                self.worklist.push(WorkItem::Process(target));
            }
        }
        Ok(())
    }

    /// Record that an instruction always pushes `value`
    fn set_constant(&mut self, id: InstrId, value: ValueId) {
        let fact = &mut self.facts[id.index()];
        match self.values.get(value) {
            ConstValue::Known(literal) => {
                fact.flags.insert(FactFlags::CONSTANT);
                fact.value = Some(literal.clone());
            }
            ConstValue::Parameter(slot) => {
                fact.flags.insert(FactFlags::PARAMETER);
                fact.parameter = Some(*slot);
            }
            _ => return,
        }
        self.values.add_dependent(value, Dependent::Fact(id));
    }

    /// Record that a branch always goes to `target`, for as long as `inputs` stay known
    fn set_constant_flow(&mut self, id: InstrId, target: InstrId, inputs: &[ValueId]) {
        let fact = &mut self.facts[id.index()];
        fact.flags.insert(FactFlags::CONSTANT_FLOW);
        fact.target = Some(target);
        for input in inputs {
            self.values.add_dependent(*input, Dependent::Fact(id));
        }
    }

    fn process(&mut self, id: InstrId) -> Result<()> {
        let mut state = match &self.states[id.index()] {
            Some(state) => state.clone(),
            None => return Ok(()),
        };
        let graph = self.graph;
        let instr = graph.get(id);
        log::trace!("process {} {}", id, instr);
        self.facts[id.index()].clear_constant();

        // Exceptions can be thrown before the instruction has any effect
        let covering: Vec<(InstrId, Option<String>)> = graph
            .handlers_covering(id, &self.positions)
            .map(|handler| (handler.catcher, handler.catch_type.clone()))
            .collect();
        for (catcher, catch_type) in covering {
            if let Some(class) = &catch_type {
                self.service.mark_class_reachable(class);
            }
            let thrown = StackLocalInfo {
                locals: state.locals.clone(),
                stack: vec![Some(ValueId::UNKNOWN)],
            };
            self.merge_into(catcher, &thrown)?;
        }

        let op = instr.opcode;
        let flow = match op {
            NOP => Flow::Normal,
            LDC | LDC2_W => {
                let literal = instr.literal().ok_or_else(|| unexpected(id, op))?;
                if let Literal::Class(class) = literal {
                    self.service.mark_class_reachable(class);
                }
                let width = literal.width();
                let value = self.values.known(literal.clone());
                state.push(value, width);
                Flow::Normal
            }
            _ if is_load(op) => {
                let slot = instr.local_slot().ok_or_else(|| unexpected(id, op))?;
                let width = instr.local_size();
                let value = state.load(slot, width, id)?;
                self.set_constant(id, value);
                state.push(value, width);
                Flow::Normal
            }
            _ if is_store(op) => {
                let slot = instr.local_slot().ok_or_else(|| unexpected(id, op))?;
                let width = instr.local_size();
                let value = state.pop(width, id)?;
                state.store(slot, value, width, &self.values, id)?;
                Flow::Normal
            }
            IINC => {
                let (slot, increment) = match instr.operand {
                    Operand::Increment { slot, increment } => (slot, increment),
                    _ => return Err(unexpected(id, op)),
                };
                let value = state.load(slot, 1, id)?;
                let result = match self.values.literal(value) {
                    Some(Literal::Int(i)) => {
                        ConstValue::Known(Literal::Int(i.wrapping_add(increment as i32)))
                    }
                    _ => ConstValue::Unknown,
                };
                let result = self.values.derived(result, 1, &[value]);
                state.store(slot, result, 1, &self.values, id)?;
                Flow::Normal
            }
            POP | POP2 => {
                state.pop_slots(if op == POP { 1 } else { 2 }, id)?;
                Flow::Normal
            }
            DUP | DUP_X1 | DUP_X2 | DUP2 | DUP2_X1 | DUP2_X2 => {
                let (count, depth) = match op {
                    DUP => (1, 0),
                    DUP_X1 => (1, 1),
                    DUP_X2 => (1, 2),
                    DUP2 => (2, 0),
                    DUP2_X1 => (2, 1),
                    _ => (2, 2),
                };
                let slots = state.pop_slots(count + depth, id)?;
                state.push_slots(&slots[depth..]);
                state.push_slots(&slots);
                Flow::Normal
            }
            SWAP => {
                let slots = state.pop_slots(2, id)?;
                state.push_slots(&[slots[1], slots[0]]);
                Flow::Normal
            }
            GOTO => Flow::Normal,
            JSR => {
                self.enter_subroutine(id, &state)?;
                Flow::Stop
            }
            RET => {
                self.leave_subroutine(id, &state)?;
                Flow::Stop
            }
            _ if is_conditional_branch(op) => {
                let inputs = self.pop_operands(id, &mut state)?;
                let target = *graph.successors(id).first().ok_or_else(|| unexpected(id, op))?;
                match self.decide_branch(op, &inputs) {
                    Some(taken) => {
                        let resolved = if taken {
                            Some(target)
                        } else {
                            graph.next(id)
                        };
                        match resolved {
                            Some(resolved) => {
                                self.set_constant_flow(id, resolved, &inputs);
                                Flow::Only(resolved)
                            }
                            None => Flow::Normal,
                        }
                    }
                    None => Flow::Normal,
                }
            }
            TABLESWITCH | LOOKUPSWITCH => {
                let key = state.pop(1, id)?;
                let succs = graph.successors(id);
                let chosen = match (self.values.literal(key), &instr.operand) {
                    (Some(Literal::Int(key)), Operand::TableSwitch { low }) => {
                        let cases = succs.len().saturating_sub(1) as i64;
                        let index = *key as i64 - *low as i64;
                        Some(if (0..cases).contains(&index) {
                            index as usize
                        } else {
                            succs.len() - 1
                        })
                    }
                    (Some(Literal::Int(key)), Operand::LookupSwitch { values }) => Some(
                        values
                            .iter()
                            .position(|value| value == key)
                            .unwrap_or(succs.len() - 1),
                    ),
                    _ => None,
                };
                match chosen.and_then(|index| succs.get(index).copied()) {
                    Some(target) => {
                        self.set_constant_flow(id, target, &[key]);
                        Flow::Only(target)
                    }
                    None => Flow::Normal,
                }
            }
            _ if is_return(op) || op == ATHROW => {
                self.pop_operands(id, &mut state)?;
                Flow::Stop
            }
            GETSTATIC | GETFIELD => {
                let field = field_reference(instr, id)?;
                if op == GETFIELD {
                    state.pop(1, id)?;
                }
                self.service.mark_field_reachable(field);
                let width = field.field_type()?.width();
                let value = match self.service.field_constant(field) {
                    Some(literal) => {
                        let value = self.values.known(literal);
                        self.field_listeners
                            .entry(field.clone())
                            .or_default()
                            .push(value);
                        self.service.field_read_as_constant(field, &self.method);
                        if op == GETSTATIC {
                            self.set_constant(id, value);
                        }
                        value
                    }
                    None => ValueId::unknown(width),
                };
                state.push(value, width);
                Flow::Normal
            }
            PUTSTATIC | PUTFIELD => {
                self.pop_operands(id, &mut state)?;
                let field = field_reference(instr, id)?;
                self.service.mark_field_reachable(field);
                self.service.mark_field_not_constant(field);
                for value in self.field_listeners.remove(field).into_iter().flatten() {
                    self.worklist.push(WorkItem::Invalidate(value));
                }
                Flow::Normal
            }
            _ if is_invoke(op) => {
                let inputs = self.pop_operands(id, &mut state)?;
                let width = instr.result_width(id)?;
                let mut result = ValueId::unknown(width);
                if let Operand::Method { reference, .. } = &instr.operand {
                    self.service.mark_method_reachable(reference);
                    if let Some(folded) = self.fold_call(reference, &inputs) {
                        result = self.values.derived(ConstValue::Known(folded), width, &inputs);
                        self.set_constant(id, result);
                    }
                }
                if width > 0 {
                    state.push(result, width);
                }
                Flow::Normal
            }
            CHECKCAST => {
                // A successful cast leaves the value as it was
                if let Operand::Class(class) = &instr.operand {
                    self.service.mark_class_reachable(class);
                }
                let value = state.pop(1, id)?;
                state.push(value, 1);
                Flow::Normal
            }
            NEW | INSTANCEOF | MULTIANEWARRAY => {
                match &instr.operand {
                    Operand::Class(class) | Operand::MultiArray { class, .. } => {
                        self.service.mark_class_reachable(class)
                    }
                    _ => return Err(unexpected(id, op)),
                }
                self.pop_operands(id, &mut state)?;
                state.push(ValueId::UNKNOWN, 1);
                Flow::Normal
            }
            _ => {
                // Arithmetic, conversions, comparisons, array accesses, monitors
                let inputs = self.pop_operands(id, &mut state)?;
                let width = instr.result_width(id)?;
                let literals: Option<Vec<&Literal>> =
                    inputs.iter().map(|input| self.values.literal(*input)).collect();
                let folded = literals.and_then(|literals| fold(op, &literals));
                if width > 0 {
                    let result = match folded {
                        Some(literal) => {
                            let result =
                                self.values.derived(ConstValue::Known(literal), width, &inputs);
                            self.set_constant(id, result);
                            result
                        }
                        None => match self.identity_operand(op, &inputs) {
                            Some(operand) => {
                                let value = self.values.get(operand).clone();
                                let result = self.values.derived(value, width, &inputs);
                                self.set_constant(id, result);
                                result
                            }
                            None => ValueId::unknown(width),
                        },
                    };
                    state.push(result, width);
                }
                Flow::Normal
            }
        };

        match flow {
            Flow::Normal => {
                for succ in graph.flow_successors(id) {
                    self.merge_into(succ, &state)?;
                }
            }
            Flow::Only(succ) => self.merge_into(succ, &state)?,
            Flow::Stop => (),
        }
        Ok(())
    }

    /// Pop the operands of an instruction, returning them in push order
    fn pop_operands(&mut self, id: InstrId, state: &mut StackLocalInfo) -> Result<Vec<ValueId>> {
        let widths = self.graph.get(id).operand_widths(id)?;
        let mut inputs = widths
            .into_iter()
            .map(|width| state.pop(width, id))
            .collect::<Result<Vec<_>>>()?;
        inputs.reverse();
        Ok(inputs)
    }

    /// Direction of a conditional branch, if the operands decide it
    fn decide_branch(&self, op: u8, inputs: &[ValueId]) -> Option<bool> {
        let values: Vec<&ConstValue> = inputs.iter().map(|input| self.values.get(*input)).collect();
        let literal = |index: usize| match values.get(index) {
            Some(ConstValue::Known(literal)) => Some(literal),
            _ => None,
        };
        let is_null = |literal: &Literal| match literal {
            Literal::Null => Some(true),
            _ if literal.is_non_null_reference() => Some(false),
            _ => None,
        };
        match op {
            IFNULL => is_null(literal(0)?),
            IFNONNULL => is_null(literal(0)?).map(|null| !null),
            IF_ACMPEQ | IF_ACMPNE => {
                let equal = match (is_null(literal(0)?)?, is_null(literal(1)?)?) {
                    (true, true) => true,
                    (false, false) => return None,
                    _ => false,
                };
                Some(equal == (op == IF_ACMPEQ))
            }
            _ if is_unary_if(op) => match literal(0)? {
                Literal::Int(value) => Some(compare(op - IFEQ, *value, 0)),
                _ => None,
            },
            _ => match (literal(0)?, literal(1)?) {
                (Literal::Int(a), Literal::Int(b)) => Some(compare(op - IF_ICMPEQ, *a, *b)),
                _ => None,
            },
        }
    }

    /// Operand that an integer operation leaves as it was, because the other one is neutral
    fn identity_operand(&self, op: u8, inputs: &[ValueId]) -> Option<ValueId> {
        let (left, right) = match inputs {
            [left, right] => (*left, *right),
            _ => return None,
        };
        let is = |input: ValueId, expected: i64| match self.values.literal(input) {
            Some(Literal::Int(value)) => *value as i64 == expected,
            Some(Literal::Long(value)) => *value == expected,
            _ => false,
        };
        let either = |neutral: i64| {
            if is(right, neutral) {
                Some(left)
            } else if is(left, neutral) {
                Some(right)
            } else {
                None
            }
        };
        match op {
            IADD | LADD | IOR | LOR | IXOR | LXOR => either(0),
            IMUL | LMUL => either(1),
            ISUB | LSUB | ISHL | LSHL | ISHR | LSHR | IUSHR | LUSHR => is(right, 0).then(|| left),
            IDIV | LDIV => is(right, 1).then(|| left),
            _ => None,
        }
    }

    fn fold_call(&self, method: &Reference, inputs: &[ValueId]) -> Option<Literal> {
        if !self.interpret_pure_methods {
            return None;
        }
        let args = inputs
            .iter()
            .map(|input| self.values.literal(*input).cloned())
            .collect::<Option<Vec<Literal>>>()?;
        pure_methods::interpret(method, &args)
    }

    /// Flow into a subroutine, and back out of it if its `ret` has been reached already
    fn enter_subroutine(&mut self, jsr: InstrId, state: &StackLocalInfo) -> Result<()> {
        let entry = *self
            .graph
            .successors(jsr)
            .first()
            .ok_or_else(|| unexpected(jsr, JSR))?;
        let mut inner = state.clone();
        let address = self.values.return_address(entry);
        inner.push(address, 1);
        self.merge_into(entry, &inner)?;

        let ret = self.subroutines.by_entry(entry).and_then(|sub| sub.ret);
        if let Some(ret) = ret {
            if let Some(ret_state) = self.states[ret.index()].clone() {
                self.return_to(jsr, entry, &ret_state)?;
            }
        }
        Ok(())
    }

    /// Flow from a `ret` back to every call site reached so far
    fn leave_subroutine(&mut self, ret: InstrId, state: &StackLocalInfo) -> Result<()> {
        let not_a_subroutine = || Error::Consistency(ConsistencyError::RetWithoutSubroutine(ret));
        let slot = self.graph.get(ret).local_slot().ok_or_else(not_a_subroutine)?;
        let address = state.load(slot, 1, ret)?;
        let sub = self.subroutines.by_ret(ret).ok_or_else(not_a_subroutine)?;
        match self.values.get(address) {
            ConstValue::ReturnAddress(entry) if *entry == sub.entry => (),
            _ => return Err(not_a_subroutine()),
        }
        let (entry, callers) = (sub.entry, sub.callers.clone());
        for caller in callers {
            self.return_to(caller, entry, state)?;
        }
        Ok(())
    }

    /// Merge the state after returning from a subroutine into the resume point of `caller`
    ///
    /// Locals the subroutine writes come from the `ret`, the others from the call site.
    fn return_to(&mut self, caller: InstrId, entry: InstrId, ret_state: &StackLocalInfo) -> Result<()> {
        let resume = match self.graph.successors(caller).get(1) {
            Some(resume) => *resume,
            None => return Ok(()),
        };
        let call_state = match &self.states[caller.index()] {
            Some(state) => state,
            None => return Ok(()),
        };
        let sub = match self.subroutines.by_entry(entry) {
            Some(sub) => sub,
            None => return Ok(()),
        };
        let touched: &BTreeSet<u16> = &sub.touched;
        let mut locals: Vec<Option<ValueId>> = call_state
            .locals
            .iter()
            .zip(&ret_state.locals)
            .enumerate()
            .map(|(slot, (call, ret))| {
                if touched.contains(&(slot as u16)) {
                    *ret
                } else {
                    *call
                }
            })
            .collect();
        if let Some(local) = locals.get_mut(sub.return_slot as usize) {
            *local = None;
        }
        // A wide value is only usable if both of its halves came through together
        for slot in 0..locals.len() {
            if let Some(value) = locals[slot] {
                let upper = locals.get(slot + 1).copied();
                if self.values.width(value) == 2 && upper != Some(None) {
                    locals[slot] = None;
                }
            }
        }
        let after = StackLocalInfo {
            locals,
            stack: ret_state.stack.clone(),
        };
        self.merge_into(resume, &after)
    }
}

fn unexpected(instr: InstrId, opcode: u8) -> Error {
    Error::Consistency(ConsistencyError::UnexpectedOpcode { instr, opcode })
}

fn field_reference(instr: &crate::jvm::code::Instruction, id: InstrId) -> Result<&Reference> {
    match &instr.operand {
        Operand::Field(field) => Ok(field),
        _ => Err(unexpected(id, instr.opcode)),
    }
}

/// Evaluate a comparison, numbered like the `if<cond>` opcodes (`eq`, `ne`, `lt`, `ge`, `gt`,
/// `le`)
fn compare<T: PartialOrd>(condition: u8, a: T, b: T) -> bool {
    match condition {
        0 => a == b,
        1 => a != b,
        2 => a < b,
        3 => a >= b,
        4 => a > b,
        _ => a <= b,
    }
}

fn ordering<T: PartialOrd>(a: T, b: T, nan: i32) -> Literal {
    Literal::Int(match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => nan,
    })
}

/// Result of an arithmetic, conversion, or comparison opcode on known operands (in push order)
///
/// Returns `None` for anything that could throw, and for opcodes that are not pure.
fn fold(op: u8, args: &[&Literal]) -> Option<Literal> {
    use Literal::*;
    let result = match (op, args) {
        (IADD, [Int(a), Int(b)]) => Int(a.wrapping_add(*b)),
        (LADD, [Long(a), Long(b)]) => Long(a.wrapping_add(*b)),
        (FADD, [Float(a), Float(b)]) => Float(a + b),
        (DADD, [Double(a), Double(b)]) => Double(a + b),
        (ISUB, [Int(a), Int(b)]) => Int(a.wrapping_sub(*b)),
        (LSUB, [Long(a), Long(b)]) => Long(a.wrapping_sub(*b)),
        (FSUB, [Float(a), Float(b)]) => Float(a - b),
        (DSUB, [Double(a), Double(b)]) => Double(a - b),
        (IMUL, [Int(a), Int(b)]) => Int(a.wrapping_mul(*b)),
        (LMUL, [Long(a), Long(b)]) => Long(a.wrapping_mul(*b)),
        (FMUL, [Float(a), Float(b)]) => Float(a * b),
        (DMUL, [Double(a), Double(b)]) => Double(a * b),
        (IDIV, [Int(_), Int(0)]) | (IREM, [Int(_), Int(0)]) => return None,
        (LDIV, [Long(_), Long(0)]) | (LREM, [Long(_), Long(0)]) => return None,
        (IDIV, [Int(a), Int(b)]) => Int(a.wrapping_div(*b)),
        (LDIV, [Long(a), Long(b)]) => Long(a.wrapping_div(*b)),
        (FDIV, [Float(a), Float(b)]) => Float(a / b),
        (DDIV, [Double(a), Double(b)]) => Double(a / b),
        (IREM, [Int(a), Int(b)]) => Int(a.wrapping_rem(*b)),
        (LREM, [Long(a), Long(b)]) => Long(a.wrapping_rem(*b)),
        (FREM, [Float(a), Float(b)]) => Float(a % b),
        (DREM, [Double(a), Double(b)]) => Double(a % b),
        (INEG, [Int(a)]) => Int(a.wrapping_neg()),
        (LNEG, [Long(a)]) => Long(a.wrapping_neg()),
        (FNEG, [Float(a)]) => Float(-a),
        (DNEG, [Double(a)]) => Double(-a),
        (ISHL, [Int(a), Int(b)]) => Int(a.wrapping_shl(*b as u32)),
        (LSHL, [Long(a), Int(b)]) => Long(a.wrapping_shl(*b as u32)),
        (ISHR, [Int(a), Int(b)]) => Int(a.wrapping_shr(*b as u32)),
        (LSHR, [Long(a), Int(b)]) => Long(a.wrapping_shr(*b as u32)),
        (IUSHR, [Int(a), Int(b)]) => Int((*a as u32).wrapping_shr(*b as u32) as i32),
        (LUSHR, [Long(a), Int(b)]) => Long((*a as u64).wrapping_shr(*b as u32) as i64),
        (IAND, [Int(a), Int(b)]) => Int(a & b),
        (LAND, [Long(a), Long(b)]) => Long(a & b),
        (IOR, [Int(a), Int(b)]) => Int(a | b),
        (LOR, [Long(a), Long(b)]) => Long(a | b),
        (IXOR, [Int(a), Int(b)]) => Int(a ^ b),
        (LXOR, [Long(a), Long(b)]) => Long(a ^ b),
        (I2L, [Int(a)]) => Long(*a as i64),
        (I2F, [Int(a)]) => Float(*a as f32),
        (I2D, [Int(a)]) => Double(*a as f64),
        (L2I, [Long(a)]) => Int(*a as i32),
        (L2F, [Long(a)]) => Float(*a as f32),
        (L2D, [Long(a)]) => Double(*a as f64),
        (F2I, [Float(a)]) => Int(*a as i32),
        (F2L, [Float(a)]) => Long(*a as i64),
        (F2D, [Float(a)]) => Double(*a as f64),
        (D2I, [Double(a)]) => Int(*a as i32),
        (D2L, [Double(a)]) => Long(*a as i64),
        (D2F, [Double(a)]) => Float(*a as f32),
        (I2B, [Int(a)]) => Int(*a as i8 as i32),
        (I2C, [Int(a)]) => Int(*a as u16 as i32),
        (I2S, [Int(a)]) => Int(*a as i16 as i32),
        (LCMP, [Long(a), Long(b)]) => ordering(a, b, 0),
        (FCMPL, [Float(a), Float(b)]) => ordering(a, b, -1),
        (FCMPG, [Float(a), Float(b)]) => ordering(a, b, 1),
        (DCMPL, [Double(a), Double(b)]) => ordering(a, b, -1),
        (DCMPG, [Double(a), Double(b)]) => ordering(a, b, 1),
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::fields::FieldTable;
    use crate::jvm::code::Handler;

    fn ldc(value: i32) -> Operand {
        Operand::Literal(Literal::Int(value))
    }

    fn context(descriptor: &str, is_static: bool) -> MethodContext {
        MethodContext::new("Test", "run", descriptor, is_static).unwrap()
    }

    fn analyze(graph: &InstructionGraph, context: &MethodContext) -> ConstantAnalysis {
        let mut fields = FieldTable::new();
        ConstantAnalyzer::new(&mut fields)
            .analyze(graph, context)
            .unwrap()
    }

    #[test]
    fn folds_arithmetic_through_locals() {
        // 2 + 3 stored, loaded, and returned
        let mut graph = InstructionGraph::new(2, 1);
        let ids = vec![
            graph.push(LDC, ldc(2)),
            graph.push(LDC, ldc(3)),
            graph.push(IADD, Operand::None),
            graph.push(ISTORE, Operand::Local(0)),
            graph.push(ILOAD, Operand::Local(0)),
            graph.push(IRETURN, Operand::None),
        ];
        let analysis = analyze(&graph, &context("()I", true));
        assert_eq!(analysis.constant(ids[2]), Some(&Literal::Int(5)));
        assert_eq!(analysis.constant(ids[4]), Some(&Literal::Int(5)));
        assert_eq!(analysis.constant(ids[0]), None);
        assert!(analysis.is_reachable(ids[5]));
    }

    #[test]
    fn parameters_are_unknown() {
        let mut graph = InstructionGraph::new(2, 1);
        let ids = vec![
            graph.push(ILOAD, Operand::Local(0)),
            graph.push(LDC, ldc(0)),
            graph.push(IADD, Operand::None),
            graph.push(IRETURN, Operand::None),
        ];
        let analysis = analyze(&graph, &context("(I)I", true));
        assert_eq!(analysis.constant(ids[0]), None);
        assert_eq!(analysis.constant(ids[2]), None);
        assert_eq!(analysis.count(FactFlags::REACHABLE), 4);
    }

    #[test]
    fn division_by_zero_is_not_constant() {
        assert_eq!(fold(IDIV, &[&Literal::Int(1), &Literal::Int(0)]), None);
        assert_eq!(
            fold(IDIV, &[&Literal::Int(i32::MIN), &Literal::Int(-1)]),
            Some(Literal::Int(i32::MIN))
        );
        assert_eq!(
            fold(FCMPL, &[&Literal::Float(f32::NAN), &Literal::Float(1.0)]),
            Some(Literal::Int(-1))
        );
        assert_eq!(
            fold(DCMPG, &[&Literal::Double(f64::NAN), &Literal::Double(1.0)]),
            Some(Literal::Int(1))
        );
        assert_eq!(
            fold(IUSHR, &[&Literal::Int(-1), &Literal::Int(28)]),
            Some(Literal::Int(15))
        );
        assert_eq!(
            fold(LSHL, &[&Literal::Long(1), &Literal::Int(65)]),
            Some(Literal::Long(2))
        );
        assert_eq!(fold(I2C, &[&Literal::Int(-1)]), Some(Literal::Int(0xffff)));
    }

    /// `if (1 != 0) return 1; else return 2;` with the else branch protected by a handler
    fn decided_branch() -> (InstructionGraph, Vec<InstrId>) {
        let mut graph = InstructionGraph::new(1, 0);
        let ids = vec![
            graph.push(LDC, ldc(1)),
            graph.push(IFEQ, Operand::None),
            graph.push(LDC, ldc(1)),
            graph.push(IRETURN, Operand::None),
            graph.push(LDC, ldc(2)),
            graph.push(IRETURN, Operand::None),
            graph.push(ATHROW, Operand::None),
        ];
        graph.set_successors(ids[1], vec![ids[4]]);
        (graph, ids)
    }

    #[test]
    fn branches_on_known_values_are_decided() {
        let (graph, ids) = decided_branch();
        let analysis = analyze(&graph, &context("()I", true));
        assert_eq!(analysis.resolved_target(ids[1]), Some(ids[2]));
        assert!(analysis.is_reachable(ids[3]));
        assert!(!analysis.is_reachable(ids[4]));
        assert!(!analysis.is_reachable(ids[6]));
    }

    #[test]
    fn catchers_are_reached_through_exceptions() {
        let (mut graph, ids) = decided_branch();
        graph.handlers.push(Handler {
            start: ids[2],
            end: ids[3],
            catcher: ids[6],
            catch_type: Some("java/lang/Throwable".to_owned()),
        });
        let mut fields = FieldTable::new();
        let analysis = ConstantAnalyzer::new(&mut fields)
            .analyze(&graph, &context("()I", true))
            .unwrap();
        assert!(analysis.is_reachable(ids[6]));
        assert!(!analysis.is_reachable(ids[4]));
        assert_eq!(
            fields.reachable_classes().collect::<Vec<_>>(),
            vec!["java/lang/Throwable"]
        );
    }

    /// A static field read as a constant, then written later in the same method
    #[test]
    fn field_writes_withdraw_constants() {
        let field = Reference::new("Test", "LIMIT", "I");
        let mut graph = InstructionGraph::new(2, 0);
        let ids = vec![
            graph.push(GETSTATIC, Operand::Field(field.clone())),
            graph.push(IFEQ, Operand::None),
            graph.push(LDC, ldc(1)),
            graph.push(PUTSTATIC, Operand::Field(field.clone())),
            graph.push(RETURN, Operand::None),
        ];
        graph.set_successors(ids[1], vec![ids[4]]);

        for order in [WorklistOrder::Fifo, WorklistOrder::Lifo, WorklistOrder::Seeded(7)] {
            let mut fields = FieldTable::new();
            fields.declare(field.clone(), Literal::Int(0));
            let analysis = ConstantAnalyzer::new(&mut fields)
                .with_order(order)
                .analyze(&graph, &context("()V", true))
                .unwrap();

            // Reading 0 skips the write, so the field stays constant
            assert_eq!(analysis.resolved_target(ids[1]), Some(ids[4]));
            assert!(!analysis.is_reachable(ids[3]));
            assert!(fields.is_constant(&field));
        }

        let mut fields = FieldTable::new();
        fields.declare(field.clone(), Literal::Int(3));
        let analysis = ConstantAnalyzer::new(&mut fields)
            .analyze(&graph, &context("()V", true))
            .unwrap();

        // Reading 3 reaches the write, which withdraws the read
        assert!(analysis.is_reachable(ids[3]));
        assert_eq!(analysis.constant(ids[0]), None);
        assert_eq!(analysis.resolved_target(ids[1]), None);
        assert!(!fields.is_constant(&field));
    }

    #[test]
    fn switch_on_known_key() {
        let mut graph = InstructionGraph::new(1, 0);
        let ids = vec![
            graph.push(LDC, ldc(11)),
            graph.push(TABLESWITCH, Operand::TableSwitch { low: 10 }),
            graph.push(RETURN, Operand::None),
            graph.push(RETURN, Operand::None),
            graph.push(RETURN, Operand::None),
        ];
        graph.set_successors(ids[1], vec![ids[2], ids[3], ids[4]]);
        let analysis = analyze(&graph, &context("()V", true));
        assert_eq!(analysis.resolved_target(ids[1]), Some(ids[3]));
        assert!(!analysis.is_reachable(ids[2]));
        assert!(!analysis.is_reachable(ids[4]));
    }

    #[test]
    fn reading_unset_local_fails() {
        let mut graph = InstructionGraph::new(1, 2);
        graph.push(ILOAD, Operand::Local(1));
        graph.push(IRETURN, Operand::None);
        let mut fields = FieldTable::new();
        let err = ConstantAnalyzer::new(&mut fields)
            .analyze(&graph, &context("(I)I", true))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyError::UnusableLocal { slot: 1, .. })
        ));
    }

    #[test]
    fn pure_calls_fold_unless_disabled() {
        let mut graph = InstructionGraph::new(2, 0);
        let ids = vec![
            graph.push(LDC, Operand::Literal(Literal::String("four".to_owned()))),
            graph.push(
                INVOKEVIRTUAL,
                Operand::Method {
                    reference: Reference::new("java/lang/String", "length", "()I"),
                    interface: false,
                },
            ),
            graph.push(IRETURN, Operand::None),
        ];
        let analysis = analyze(&graph, &context("()I", true));
        assert_eq!(analysis.constant(ids[1]), Some(&Literal::Int(4)));

        let mut fields = FieldTable::new();
        let analysis = ConstantAnalyzer::new(&mut fields)
            .with_pure_methods(false)
            .analyze(&graph, &context("()I", true))
            .unwrap();
        assert_eq!(analysis.constant(ids[1]), None);
        assert!(fields.is_method_reachable(&Reference::new("java/lang/String", "length", "()I")));
    }
}
