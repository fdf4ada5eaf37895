//! Rewriting a method body according to a [`ConstantAnalysis`]
//!
//! In order:
//!
//!   1. branches and switches always going the same way become pops of their operands followed
//!      by a `goto`
//!   2. unreachable instructions are removed
//!   3. instructions always pushing the same value become pops of their operands followed by
//!      a constant push
//!   4. clean up: `nop` and `goto` to the next instruction are removed, and a conditional branch
//!      to the next instruction becomes a pop of its operands
//!
//! The pops introduced here are left for [`super::remove_pops`] to cancel.

use super::remove_pop::{pop_opcodes, replace_with};
use crate::analysis::ConstantAnalysis;
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{InstrId, InstructionGraph, Literal, Operand};
use crate::jvm::Result;
use crate::util::Width;
use log::{debug, trace};
use std::collections::HashSet;

/// What a transformation changed
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct TransformStats {
    /// Instructions removed (unreachable code, `nop`, redundant `goto`)
    pub removed: usize,

    /// Instructions replaced by a constant push
    pub substituted: usize,

    /// Branches and switches replaced by a `goto` or by pops
    pub branches_resolved: usize,

    /// Changes made by the pop peephole
    pub pops_removed: usize,
}

impl TransformStats {
    pub fn is_empty(&self) -> bool {
        *self == TransformStats::default()
    }
}

impl std::ops::AddAssign for TransformStats {
    fn add_assign(&mut self, other: TransformStats) {
        self.removed += other.removed;
        self.substituted += other.substituted;
        self.branches_resolved += other.branches_resolved;
        self.pops_removed += other.pops_removed;
    }
}

/// Apply the facts of an analysis of exactly this graph
pub fn apply_constant_facts(
    graph: &mut InstructionGraph,
    analysis: &ConstantAnalysis,
) -> Result<TransformStats> {
    let mut stats = TransformStats::default();
    let live: Vec<InstrId> = graph.iter().collect();
    let unreachable: HashSet<InstrId> = live
        .iter()
        .copied()
        .filter(|id| !analysis.is_reachable(*id))
        .collect();

    for id in live {
        if unreachable.contains(&id) {
            continue;
        }
        if graph.get(id).opcode == JSR {
            // The subroutine never returns to this call
            let succs = graph.successors(id).to_vec();
            if let [entry, resume] = succs[..] {
                if unreachable.contains(&resume) {
                    graph.set_successors(id, vec![entry]);
                }
            }
        } else if let Some(target) = analysis.resolved_target(id) {
            resolve_branch(graph, id, target)?;
            stats.branches_resolved += 1;
        }
    }

    if !unreachable.is_empty() {
        trace!("removing {} unreachable instructions", unreachable.len());
        graph.remove_all(&unreachable)?;
        stats.removed += unreachable.len();
    }

    for id in graph.iter().collect::<Vec<_>>() {
        let literal = match analysis.constant(id) {
            Some(literal) => literal,
            None => continue,
        };
        if matches!(graph.get(id).opcode, LDC | LDC2_W) {
            continue;
        }
        substitute(graph, id, literal.clone())?;
        stats.substituted += 1;
    }

    clean_up(graph, &mut stats)?;
    debug!(
        "removed {}, substituted {}, resolved {} branches",
        stats.removed, stats.substituted, stats.branches_resolved
    );
    Ok(stats)
}

/// Replace a branch by pops of its operands and a `goto` to the successor it always takes
fn resolve_branch(graph: &mut InstructionGraph, id: InstrId, target: InstrId) -> Result<()> {
    trace!("{} always goes to {}", graph.get(id), target);
    let widths = graph.get(id).operand_widths(id)?;
    let mut opcodes = pop_opcodes(&widths);
    opcodes.push(GOTO);
    if let Some(goto) = replace_with(graph, id, &opcodes)? {
        graph.set_successors(goto, vec![target]);
    }
    Ok(())
}

/// Replace an instruction by pops of its operands and a push of `literal`
fn substitute(graph: &mut InstructionGraph, id: InstrId, literal: Literal) -> Result<()> {
    trace!("{} always pushes {}", graph.get(id), literal);
    let widths = graph.get(id).operand_widths(id)?;
    for opcode in pop_opcodes(&widths) {
        graph.insert_before(id, opcode, Operand::None);
    }
    let opcode = if literal.width() == 2 { LDC2_W } else { LDC };
    graph.replace(id, opcode, Operand::Literal(literal));
    Ok(())
}

fn clean_up(graph: &mut InstructionGraph, stats: &mut TransformStats) -> Result<()> {
    loop {
        let mut changed = false;
        for id in graph.iter().collect::<Vec<_>>() {
            if graph.get(id).is_removed() {
                continue;
            }
            let op = graph.get(id).opcode;
            let jumps_to_next = match graph.next(id) {
                Some(next) => graph.successors(id) == [next],
                None => false,
            };
            if op == NOP || (op == GOTO && jumps_to_next) {
                graph.remove(id)?;
                stats.removed += 1;
            } else if is_conditional_branch(op) && jumps_to_next {
                let widths = graph.get(id).operand_widths(id)?;
                replace_with(graph, id, &pop_opcodes(&widths))?;
                stats.branches_resolved += 1;
            } else {
                continue;
            }
            changed = true;
        }
        if !changed {
            return Ok(());
        }
    }
}
