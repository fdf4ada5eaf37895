//! Peephole pass cancelling values that are pushed only to be discarded
//!
//! Constant substitution leaves behind sequences such as `ldc 2; ldc 3; pop2; ldc 5`, and dead
//! stores become pops of whatever was about to be stored. A `pop` or `pop2` is cancelled against
//! the instruction right before it when that instruction has no other effect than producing the
//! popped value:
//!
//!   - constant pushes and loads disappear along with the pop
//!   - `dup` + `pop` and `dup2` + `pop2` disappear, `dup_x1` + `pop` is a `swap`
//!   - arithmetic, conversions and comparisons that cannot throw become pops of their operands
//!   - two consecutive `pop` become one `pop2`
//!
//! The pop must only be reachable by falling through from the producer.

use crate::jvm::code::opcodes::*;
use crate::jvm::code::{InstrId, InstructionGraph, Literal, Operand};
use crate::jvm::Result;
use log::debug;
use std::collections::HashSet;

/// Cancel pops until none can be cancelled, returning the number of changes
pub fn remove_pops(graph: &mut InstructionGraph) -> Result<usize> {
    let mut total = 0;
    loop {
        let pops: Vec<InstrId> = graph
            .iter()
            .filter(|id| matches!(graph.get(*id).opcode, POP | POP2))
            .collect();
        let mut changed = 0;
        for pop in pops {
            if !graph.get(pop).is_removed() && cancel(graph, pop)? {
                changed += 1;
            }
        }
        if changed == 0 {
            break;
        }
        total += changed;
    }
    debug!("cancelled {} pops", total);
    Ok(total)
}

/// Try to cancel one pop against the instruction before it
fn cancel(graph: &mut InstructionGraph, pop: InstrId) -> Result<bool> {
    let producer = match graph.prev(pop) {
        Some(prev) => prev,
        None => return Ok(false),
    };
    let falls_through =
        !graph.get(producer).always_jumps() && graph.successors(producer).is_empty();
    if !falls_through || graph.is_jump_target(pop) {
        return Ok(false);
    }

    let popped = if graph.get(pop).opcode == POP2 { 2 } else { 1 };
    let instr = graph.get(producer);
    let op = instr.opcode;
    match op {
        // Loading a class may fail
        LDC | LDC2_W if !matches!(instr.operand, Operand::Literal(Literal::Class(_))) => {
            let pushed = instr.result_width(producer)?;
            cancel_push(graph, producer, pushed, pop, popped)
        }
        _ if is_load(op) => {
            let pushed = instr.local_size();
            cancel_push(graph, producer, pushed, pop, popped)
        }
        DUP | DUP2 if (op == DUP) == (popped == 1) => {
            graph.remove_all(&HashSet::from([producer, pop]))?;
            Ok(true)
        }
        DUP_X1 if popped == 1 => {
            graph.replace(producer, SWAP, Operand::None);
            graph.remove(pop)?;
            Ok(true)
        }
        POP if popped == 1 => {
            graph.replace(producer, POP2, Operand::None);
            graph.remove(pop)?;
            Ok(true)
        }
        _ if cannot_throw(op) && instr.result_width(producer)? == popped => {
            let widths = instr.operand_widths(producer)?;
            graph.remove(pop)?;
            replace_with(graph, producer, &pop_opcodes(&widths))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn cancel_push(
    graph: &mut InstructionGraph,
    producer: InstrId,
    pushed: usize,
    pop: InstrId,
    popped: usize,
) -> Result<bool> {
    match (pushed, popped) {
        (1, 1) | (2, 2) => graph.remove_all(&HashSet::from([producer, pop]))?,
        (1, 2) => {
            graph.remove(producer)?;
            graph.replace(pop, POP, Operand::None);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Arithmetic, conversions and comparisons, except for integer division and remainder
fn cannot_throw(opcode: u8) -> bool {
    match opcode {
        IDIV | LDIV | IREM | LREM => false,
        IADD..=DREM | INEG..=LXOR | I2L..=DCMPG => true,
        _ => false,
    }
}

/// `pop`/`pop2` sequence discarding values of the given widths (topmost first)
pub(super) fn pop_opcodes(widths: &[usize]) -> Vec<u8> {
    let mut opcodes = vec![];
    let mut remaining = widths.iter().peekable();
    while let Some(width) = remaining.next() {
        if *width == 1 && remaining.peek() == Some(&&1) {
            remaining.next();
            opcodes.push(POP2);
        } else if *width == 1 {
            opcodes.push(POP);
        } else {
            opcodes.push(POP2);
        }
    }
    opcodes
}

/// Turn an instruction into a sequence of operand-less instructions, returning the last one
///
/// An empty sequence removes the instruction and returns `None`.
pub(super) fn replace_with(
    graph: &mut InstructionGraph,
    id: InstrId,
    opcodes: &[u8],
) -> Result<Option<InstrId>> {
    let (first, rest) = match opcodes.split_first() {
        Some(split) => split,
        None => {
            graph.remove(id)?;
            return Ok(None);
        }
    };
    graph.replace(id, *first, Operand::None);
    let mut last = id;
    for opcode in rest {
        last = graph.append_after(last, *opcode, Operand::None);
    }
    Ok(Some(last))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::Reference;

    fn opcodes(graph: &InstructionGraph) -> Vec<u8> {
        graph.iter().map(|id| graph.get(id).opcode).collect()
    }

    fn ldc(value: i32) -> Operand {
        Operand::Literal(Literal::Int(value))
    }

    #[test]
    fn pop_operand_sequences() {
        assert_eq!(pop_opcodes(&[1]), vec![POP]);
        assert_eq!(pop_opcodes(&[1, 1, 1]), vec![POP2, POP]);
        assert_eq!(pop_opcodes(&[1, 2, 2]), vec![POP, POP2, POP2]);
        assert!(pop_opcodes(&[]).is_empty());
    }

    #[test]
    fn substituted_operands_cancel_out() {
        // ldc 2; ldc 3; pop2; ldc 5; ireturn
        let mut graph = InstructionGraph::new(2, 0);
        graph.push(LDC, ldc(2));
        graph.push(LDC, ldc(3));
        graph.push(POP2, Operand::None);
        let five = graph.push(LDC, ldc(5));
        let ret = graph.push(IRETURN, Operand::None);
        assert_eq!(remove_pops(&mut graph).unwrap(), 2);
        assert_eq!(graph.iter().collect::<Vec<_>>(), vec![five, ret]);
    }

    #[test]
    fn arithmetic_becomes_pops_of_operands() {
        // lload 0; lload 2; ladd; pop2; return
        let mut graph = InstructionGraph::new(4, 4);
        graph.push(LLOAD, Operand::Local(0));
        graph.push(LLOAD, Operand::Local(2));
        graph.push(LADD, Operand::None);
        graph.push(POP2, Operand::None);
        graph.push(RETURN, Operand::None);
        remove_pops(&mut graph).unwrap();
        assert_eq!(opcodes(&graph), vec![RETURN]);
    }

    #[test]
    fn effects_are_kept() {
        // Division may throw, calls and jump targets are left alone
        let mut graph = InstructionGraph::new(2, 2);
        graph.push(ILOAD, Operand::Local(0));
        graph.push(ILOAD, Operand::Local(1));
        graph.push(IDIV, Operand::None);
        graph.push(POP, Operand::None);
        graph.push(
            INVOKESTATIC,
            Operand::Method {
                reference: Reference::new("Foo", "bar", "()I"),
                interface: false,
            },
        );
        graph.push(POP, Operand::None);
        let goto = graph.push(GOTO, Operand::None);
        let load = graph.push(ILOAD, Operand::Local(0));
        let target = graph.push(POP, Operand::None);
        graph.push(RETURN, Operand::None);
        graph.set_successors(goto, vec![target]);
        let before = opcodes(&graph);
        assert_eq!(remove_pops(&mut graph).unwrap(), 0);
        assert_eq!(opcodes(&graph), before);
        assert!(!graph.get(load).is_removed());
    }

    #[test]
    fn class_literals_are_kept() {
        let mut graph = InstructionGraph::new(1, 0);
        graph.push(LDC, Operand::Literal(Literal::Class("Foo".to_owned())));
        graph.push(POP, Operand::None);
        graph.push(RETURN, Operand::None);
        assert_eq!(remove_pops(&mut graph).unwrap(), 0);
        assert_eq!(opcodes(&graph), vec![LDC, POP, RETURN]);
    }

    #[test]
    fn stack_shuffles() {
        // dup_x1; pop is a swap, pop; pop is a pop2
        let mut graph = InstructionGraph::new(3, 2);
        graph.push(ILOAD, Operand::Local(0));
        graph.push(ILOAD, Operand::Local(1));
        graph.push(DUP_X1, Operand::None);
        graph.push(POP, Operand::None);
        graph.push(
            INVOKESTATIC,
            Operand::Method {
                reference: Reference::new("Foo", "sink", "(II)V"),
                interface: false,
            },
        );
        graph.push(ILOAD, Operand::Local(0));
        graph.push(
            INVOKESTATIC,
            Operand::Method {
                reference: Reference::new("Foo", "pair", "(I)J"),
                interface: false,
            },
        );
        graph.push(L2I, Operand::None);
        graph.push(DUP, Operand::None);
        graph.push(POP, Operand::None);
        graph.push(IRETURN, Operand::None);
        assert_eq!(remove_pops(&mut graph).unwrap(), 2);
        assert_eq!(
            opcodes(&graph),
            vec![ILOAD, ILOAD, SWAP, INVOKESTATIC, ILOAD, INVOKESTATIC, L2I, IRETURN]
        );
    }
}
