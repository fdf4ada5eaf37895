//! Reassigning local variable slots
//!
//! Every instruction accessing a local (and every parameter) starts out as its own variable.
//! Each read is merged with all the writes whose value it may see, found by searching backwards
//! from the read. The merged variables are then what gets a slot:
//!
//!   - a store no read ever sees is dead and becomes a pop
//!   - variables conflict if they are live at the same time, or if one is written while the
//!     other is live
//!   - parameters keep their slots, the rest get the lowest slot free of conflicts, picking
//!     the most constrained variables first
//!
//! ### Subroutines
//!
//! Searching backwards from a `jsr` resume point, the slots written by the subroutine come from
//! its `ret`, and the other slots come from the `jsr` itself. For liveness, `ret` flows to the
//! resume point of every caller.

use super::union_find::UnionFind;
use crate::analysis::MethodContext;
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{InstrId, InstructionGraph, LocalVariable, Operand, Subroutines};
use crate::jvm::{Error, Result};
use crate::util::Width;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap, HashSet};

/// What slot reassignment did to a method
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct LocalStats {
    pub slots_before: u16,
    pub slots_after: u16,

    /// Stores and increments removed because nothing reads them
    pub dead_stores: usize,

    /// Distinct variables slots were assigned to (parameters included)
    pub variables: usize,
}

pub struct LocalOptimizer {
    rebuild_local_variable_table: bool,
}

impl LocalOptimizer {
    pub fn new(rebuild_local_variable_table: bool) -> LocalOptimizer {
        LocalOptimizer {
            rebuild_local_variable_table,
        }
    }

    pub fn optimize(
        &self,
        graph: &mut InstructionGraph,
        context: &MethodContext,
    ) -> Result<LocalStats> {
        let mut stats = LocalStats {
            slots_before: graph.max_locals,
            ..LocalStats::default()
        };

        let subroutines = Subroutines::find(graph)?;
        let variables = Variables::collect(graph, &subroutines, context);
        let dead = variables.dead_stores(graph, &subroutines);
        for id in &dead {
            let instr = graph.get(*id);
            trace!("dead store {}", instr);
            match instr.opcode {
                IINC => graph.remove(*id)?,
                _ if instr.local_size() == 2 => graph.replace(*id, POP2, Operand::None),
                _ => graph.replace(*id, POP, Operand::None),
            }
        }
        stats.dead_stores = dead.len();

        let subroutines = if dead.is_empty() {
            subroutines
        } else {
            Subroutines::find(graph)?
        };
        let mut variables = Variables::collect(graph, &subroutines, context);
        let flow = Flow::new(graph, &subroutines);
        let liveness = variables.liveness(graph, &flow);
        let conflicts = variables.conflicts(graph, &liveness);
        let (order, sizes) = variables.variable_sizes();
        let slots = variables.color(&order, &sizes, &conflicts);

        let mut max_locals = context.parameter_slots();
        for (var, slot) in &slots {
            max_locals = max_locals.max(slot + sizes[var]);
        }
        let max_locals =
            u16::try_from(max_locals).map_err(|_| Error::MethodLocalsOverflow(max_locals))?;

        let old_table = graph.local_variables.take();
        if let (Some(old), true) = (&old_table, self.rebuild_local_variable_table) {
            let table = variables.rebuild_table(graph, old, &liveness, &slots);
            graph.local_variables = Some(table);
        }
        variables.rewrite(graph, &slots);

        graph.max_locals = max_locals;
        stats.slots_after = max_locals;
        stats.variables = slots.len();
        debug!(
            "{} locals: {} slots -> {} slots, {} dead stores",
            context.method_name, stats.slots_before, stats.slots_after, stats.dead_stores
        );
        Ok(stats)
    }
}

fn reads_local(opcode: u8) -> bool {
    is_load(opcode) || opcode == IINC || opcode == RET
}

fn writes_local(opcode: u8) -> bool {
    is_store(opcode) || opcode == IINC
}

/// Control flow as seen by locals
struct Flow<'g> {
    graph: &'g InstructionGraph,
    subroutines: &'g Subroutines,

    /// Instructions protected by the handlers catching at an instruction
    thrown_from: HashMap<InstrId, Vec<InstrId>>,

    /// Catchers of the handlers protecting an instruction
    catchers: HashMap<InstrId, Vec<InstrId>>,
}

impl<'g> Flow<'g> {
    fn new(graph: &'g InstructionGraph, subroutines: &'g Subroutines) -> Flow<'g> {
        let positions = graph.positions();
        let mut thrown_from: HashMap<InstrId, Vec<InstrId>> = HashMap::new();
        let mut catchers: HashMap<InstrId, Vec<InstrId>> = HashMap::new();
        for id in graph.iter() {
            for handler in graph.handlers_covering(id, &positions) {
                thrown_from.entry(handler.catcher).or_default().push(id);
                catchers.entry(id).or_default().push(handler.catcher);
            }
        }
        Flow {
            graph,
            subroutines,
            thrown_from,
            catchers,
        }
    }

    /// Instructions whose execution may be followed by `id`, as far as `slot` is concerned
    fn predecessors(&self, id: InstrId, slot: u16) -> Vec<InstrId> {
        let mut preds = vec![];
        for pred in self.graph.predecessors(id) {
            let succs = self.graph.successors(pred);
            let resumes_here = self.graph.get(pred).opcode == JSR
                && succs.get(1) == Some(&id)
                && succs.first() != Some(&id);
            let subroutine = succs
                .first()
                .and_then(|entry| self.subroutines.by_entry(*entry))
                .filter(|_| resumes_here);
            match subroutine {
                Some(sub) if sub.touched.contains(&slot) || sub.return_slot == slot => {
                    preds.extend(sub.ret)
                }
                _ => preds.push(pred),
            }
        }
        preds.extend(self.thrown_from.get(&id).into_iter().flatten().copied());
        preds
    }

    /// Normal successors, with `ret` going back to every caller
    fn successors(&self, id: InstrId) -> Vec<InstrId> {
        let mut succs = self.graph.flow_successors(id);
        if let Some(sub) = self.subroutines.by_ret(id) {
            for caller in &sub.callers {
                succs.extend(self.graph.successors(*caller).get(1));
            }
        }
        succs
    }

    fn catchers(&self, id: InstrId) -> &[InstrId] {
        self.catchers.get(&id).map_or(&[], Vec::as_slice)
    }
}

/// Which variables are live on entry to and on exit from every instruction
struct Liveness {
    live_in: HashMap<InstrId, BTreeSet<usize>>,
    live_out: HashMap<InstrId, BTreeSet<usize>>,
}

/// Parameters and local accesses, grouped into variables
struct Variables {
    /// Slot and size of every parameter, receiver first
    parameters: Vec<(u16, usize)>,

    /// Instructions accessing locals, numbered after the parameters
    accesses: Vec<InstrId>,
    by_instr: HashMap<InstrId, usize>,

    /// Size of every parameter and access
    sizes: Vec<usize>,

    sets: UnionFind,

    /// Writes seen by at least one read
    read: Vec<bool>,
}

impl Variables {
    fn collect(
        graph: &InstructionGraph,
        subroutines: &Subroutines,
        context: &MethodContext,
    ) -> Variables {
        let mut parameters = vec![];
        let mut slot = 0;
        if !context.is_static {
            parameters.push((0, 1));
            slot = 1;
        }
        for parameter in &context.descriptor.parameters {
            parameters.push((slot, parameter.width()));
            slot += parameter.width() as u16;
        }

        let mut variables = Variables {
            sizes: parameters.iter().map(|(_, size)| *size).collect(),
            parameters,
            accesses: vec![],
            by_instr: HashMap::new(),
            sets: UnionFind::new(),
            read: vec![],
        };
        for _ in 0..variables.parameters.len() {
            variables.sets.add();
        }
        for id in graph.iter() {
            let instr = graph.get(id);
            if instr.local_slot().is_some() {
                variables.by_instr.insert(id, variables.sets.add());
                variables.accesses.push(id);
                variables.sizes.push(instr.local_size());
            }
        }
        variables.read = vec![false; variables.sizes.len()];

        let flow = Flow::new(graph, subroutines);
        for id in variables.accesses.clone() {
            let instr = graph.get(id);
            if let (true, Some(slot)) = (reads_local(instr.opcode), instr.local_slot()) {
                variables.join_reaching_writes(graph, &flow, id, slot);
            }
        }
        variables
    }

    /// Merge a read with every write whose value it may see
    fn join_reaching_writes(
        &mut self,
        graph: &InstructionGraph,
        flow: &Flow,
        read: InstrId,
        slot: u16,
    ) {
        let reader = self.by_instr[&read];
        let mut visited: HashSet<InstrId> = HashSet::new();
        let mut pending = vec![read];
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            if Some(id) == graph.first() {
                if let Some(parameter) = self.parameters.iter().position(|(s, _)| *s == slot) {
                    self.sets.union(reader, parameter);
                }
            }
            for pred in flow.predecessors(id, slot) {
                let instr = graph.get(pred);
                if writes_local(instr.opcode) && instr.local_slot() == Some(slot) {
                    let writer = self.by_instr[&pred];
                    self.sets.union(reader, writer);
                    self.read[writer] = true;
                } else {
                    pending.push(pred);
                }
            }
        }
    }

    /// Writes no read ever sees (return addresses stored by subroutines excepted)
    fn dead_stores(&self, graph: &InstructionGraph, subroutines: &Subroutines) -> Vec<InstrId> {
        self.accesses
            .iter()
            .copied()
            .filter(|id| {
                writes_local(graph.get(*id).opcode)
                    && !self.read[self.by_instr[id]]
                    && subroutines.by_entry(*id).is_none()
            })
            .collect()
    }

    fn variable(&mut self, id: InstrId) -> usize {
        let element = self.by_instr[&id];
        self.sets.find(element)
    }

    /// Variables in order of first appearance (parameters first), and the size of each: the
    /// widest of its accesses
    fn variable_sizes(&mut self) -> (Vec<usize>, HashMap<usize, usize>) {
        let mut order: Vec<usize> = vec![];
        let mut sizes: HashMap<usize, usize> = HashMap::new();
        for element in 0..self.sizes.len() {
            let var = self.sets.find(element);
            let size = sizes.entry(var).or_insert_with(|| {
                order.push(var);
                0
            });
            *size = (*size).max(self.sizes[element]);
        }
        (order, sizes)
    }

    fn liveness(&mut self, graph: &InstructionGraph, flow: &Flow) -> Liveness {
        let order: Vec<InstrId> = graph.iter().collect();
        let mut uses: HashMap<InstrId, usize> = HashMap::new();
        let mut defs: HashMap<InstrId, usize> = HashMap::new();
        for id in &order {
            let opcode = graph.get(*id).opcode;
            if self.by_instr.contains_key(id) {
                let var = self.variable(*id);
                if reads_local(opcode) {
                    uses.insert(*id, var);
                }
                if writes_local(opcode) {
                    defs.insert(*id, var);
                }
            }
        }

        let mut liveness = Liveness {
            live_in: order.iter().map(|id| (*id, BTreeSet::new())).collect(),
            live_out: order.iter().map(|id| (*id, BTreeSet::new())).collect(),
        };
        let mut changed = true;
        while changed {
            changed = false;
            for id in order.iter().rev() {
                let mut live_out = BTreeSet::new();
                for succ in flow.successors(*id) {
                    live_out.extend(liveness.live_in[&succ].iter().copied());
                }
                let mut live_in = live_out.clone();
                if let Some(def) = defs.get(id) {
                    live_in.remove(def);
                }
                live_in.extend(uses.get(id).copied());
                for catcher in flow.catchers(*id) {
                    live_in.extend(liveness.live_in[catcher].iter().copied());
                }
                if live_in != liveness.live_in[id] {
                    changed = true;
                    liveness.live_in.insert(*id, live_in);
                }
                liveness.live_out.insert(*id, live_out);
            }
        }
        liveness
    }

    /// Pairs of variables that may not share a slot
    fn conflicts(
        &mut self,
        graph: &InstructionGraph,
        liveness: &Liveness,
    ) -> HashMap<usize, BTreeSet<usize>> {
        let mut conflicts: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        let mut add_all = |live: &BTreeSet<usize>| {
            for a in live {
                for b in live {
                    if a != b {
                        conflicts.entry(*a).or_default().insert(*b);
                    }
                }
            }
        };

        if let Some(first) = graph.first() {
            let mut on_entry = liveness.live_in[&first].clone();
            for parameter in 0..self.parameters.len() {
                on_entry.insert(self.sets.find(parameter));
            }
            add_all(&on_entry);
        }
        for id in graph.iter() {
            add_all(&liveness.live_in[&id]);
            let mut live = liveness.live_out[&id].clone();
            if self.by_instr.contains_key(&id) && writes_local(graph.get(id).opcode) {
                live.insert(self.variable(id));
            }
            add_all(&live);
        }
        conflicts
    }

    /// Assign a slot to every variable
    fn color(
        &mut self,
        variables: &[usize],
        sizes: &HashMap<usize, usize>,
        conflicts: &HashMap<usize, BTreeSet<usize>>,
    ) -> Vec<(usize, usize)> {
        let no_conflicts = BTreeSet::new();
        let conflicts_of = |var: &usize| conflicts.get(var).unwrap_or(&no_conflicts);

        let mut slots: HashMap<usize, usize> = HashMap::new();
        for (parameter, (slot, _)) in self.parameters.iter().enumerate() {
            let var = self.sets.find(parameter);
            slots.entry(var).or_insert(*slot as usize);
        }

        // Least constrained first (by conflicts with variables not picked yet, then by first
        // appearance), so that the most constrained are assigned first
        let remaining: Vec<usize> = variables
            .iter()
            .copied()
            .filter(|var| !slots.contains_key(var))
            .collect();
        let position: HashMap<usize, usize> = remaining
            .iter()
            .enumerate()
            .map(|(index, var)| (*var, index))
            .collect();
        let mut pending: HashMap<usize, usize> = remaining
            .iter()
            .map(|var| {
                let count = conflicts_of(var)
                    .iter()
                    .filter(|other| position.contains_key(other))
                    .count();
                (*var, count)
            })
            .collect();
        let mut queue: BTreeSet<(usize, usize)> = remaining
            .iter()
            .map(|var| (pending[var], position[var]))
            .collect();
        let mut picked: Vec<usize> = vec![];
        while let Some(&(count, index)) = queue.iter().next() {
            queue.remove(&(count, index));
            let var = remaining[index];
            pending.remove(&var);
            for other in conflicts_of(&var) {
                if let Some(count) = pending.get_mut(other) {
                    queue.remove(&(*count, position[other]));
                    *count -= 1;
                    queue.insert((*count, position[other]));
                }
            }
            picked.push(var);
        }

        for var in picked.into_iter().rev() {
            let size = sizes[&var];
            let taken: Vec<(usize, usize)> = conflicts_of(&var)
                .iter()
                .filter_map(|other| Some((*slots.get(other)?, sizes[other])))
                .collect();
            let mut slot = 0;
            loop {
                let candidate = slot;
                let overlap = taken.iter().find(|(start, len)| {
                    candidate < start + len && *start < candidate + size
                });
                match overlap {
                    Some((start, len)) => slot = start + len,
                    None => break,
                }
            }
            trace!("variable {} goes in slot {}", var, slot);
            slots.insert(var, slot);
        }

        let mut slots: Vec<(usize, usize)> = slots.into_iter().collect();
        slots.sort_unstable();
        slots
    }

    /// Point every access at its variable's slot
    fn rewrite(&mut self, graph: &mut InstructionGraph, slots: &[(usize, usize)]) {
        let slots: HashMap<usize, usize> = slots.iter().copied().collect();
        for id in self.accesses.clone() {
            let var = self.variable(id);
            let new_slot = match slots.get(&var) {
                Some(slot) => *slot as u16,
                None => continue,
            };
            match &mut graph.get_mut(id).operand {
                Operand::Local(slot) | Operand::Increment { slot, .. } => *slot = new_slot,
                _ => (),
            }
        }
    }

    /// New `LocalVariableTable`, naming variables after the old entries covering their accesses
    fn rebuild_table(
        &mut self,
        graph: &InstructionGraph,
        old: &[LocalVariable],
        liveness: &Liveness,
        slots: &[(usize, usize)],
    ) -> Vec<LocalVariable> {
        let positions = graph.positions();
        let covers = |entry: &LocalVariable, id: InstrId| {
            positions[&entry.start] <= positions[&id] && positions[&id] <= positions[&entry.end]
        };
        let named = |slot: u16, at: &[InstrId]| {
            old.iter()
                .find(|entry| entry.slot == slot && at.iter().any(|id| covers(entry, *id)))
        };

        // Names, and where each variable is accessed
        let mut names: HashMap<usize, &LocalVariable> = HashMap::new();
        let mut accessed: HashSet<(usize, InstrId)> = HashSet::new();
        if let Some(first) = graph.first() {
            for (parameter, (slot, _)) in self.parameters.iter().enumerate() {
                let var = self.sets.find(parameter);
                accessed.insert((var, first));
                if let Some(entry) = named(*slot, &[first]) {
                    names.entry(var).or_insert(entry);
                }
            }
        }
        for id in self.accesses.clone() {
            let var = self.variable(id);
            accessed.insert((var, id));
            let instr = graph.get(id);
            let slot = match instr.local_slot() {
                Some(slot) => slot,
                None => continue,
            };
            // A variable's scope usually starts right after the store initializing it
            let mut at = vec![id];
            if is_store(instr.opcode) {
                at.extend(graph.next(id));
            }
            if let Some(entry) = named(slot, &at) {
                names.entry(var).or_insert(entry);
            }
        }

        let mut table = vec![];
        for (var, slot) in slots {
            let entry = match names.get(var) {
                Some(entry) => *entry,
                None => continue,
            };
            let mut run: Option<(InstrId, InstrId)> = None;
            for id in graph.iter() {
                let present = liveness.live_in[&id].contains(var) || accessed.contains(&(*var, id));
                match (present, run) {
                    (true, Some((start, _))) => run = Some((start, id)),
                    (true, None) => run = Some((id, id)),
                    (false, Some((start, end))) => {
                        table.push(renamed(entry, start, end, *slot));
                        run = None;
                    }
                    (false, None) => (),
                }
            }
            if let Some((start, end)) = run {
                table.push(renamed(entry, start, end, *slot));
            }
        }
        table.sort_by_key(|var| (positions[&var.start], var.slot));
        table
    }
}

fn renamed(entry: &LocalVariable, start: InstrId, end: InstrId, slot: usize) -> LocalVariable {
    LocalVariable {
        start,
        end,
        name: entry.name.clone(),
        descriptor: entry.descriptor.clone(),
        slot: slot as u16,
    }
}
