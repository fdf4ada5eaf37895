mod common;

use common::{context, init_logging};
use jvmfold::jvm::code::opcodes::*;
use jvmfold::jvm::code::{InstrId, InstructionGraph, Literal, Operand, Reference};
use jvmfold::optimize::LocalOptimizer;

fn sink() -> Operand {
    Operand::Method {
        reference: Reference::new("Sink", "accept", "(I)V"),
        interface: false,
    }
}

fn slot(graph: &InstructionGraph, id: InstrId) -> u16 {
    graph.get(id).local_slot().unwrap()
}

/// Three variables with overlapping live ranges: A overlaps B, B overlaps C, A and C are
/// disjoint
///
/// ```text
/// A  |-------|
/// B      |--------|
/// C             |--------|
/// ```
#[test]
fn interleaved_live_ranges() {
    init_logging();
    let ldc = |value: i32| Operand::Literal(Literal::Int(value));
    let mut graph = InstructionGraph::new(1, 3);
    graph.push(LDC, ldc(1));
    let a_store = graph.push(ISTORE, Operand::Local(0));
    graph.push(LDC, ldc(2));
    let b_store = graph.push(ISTORE, Operand::Local(1));
    let a_load = graph.push(ILOAD, Operand::Local(0));
    graph.push(INVOKESTATIC, sink());
    graph.push(LDC, ldc(3));
    let c_store = graph.push(ISTORE, Operand::Local(2));
    let b_load = graph.push(ILOAD, Operand::Local(1));
    graph.push(INVOKESTATIC, sink());
    let c_load = graph.push(ILOAD, Operand::Local(2));
    graph.push(INVOKESTATIC, sink());
    graph.push(RETURN, Operand::None);

    let stats = LocalOptimizer::new(true)
        .optimize(&mut graph, &context("run", "()V", true))
        .unwrap();
    let (a, b, c) = (slot(&graph, a_store), slot(&graph, b_store), slot(&graph, c_store));
    assert_eq!(slot(&graph, a_load), a);
    assert_eq!(slot(&graph, b_load), b);
    assert_eq!(slot(&graph, c_load), c);

    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_eq!(a, c);
    assert_eq!(stats.slots_after, 2);
    assert_eq!(graph.max_locals, 2);
}

/// A value live across a loop conflicts with everything stored inside the loop
#[test]
fn values_live_across_loops() {
    init_logging();
    let ldc = |value: i32| Operand::Literal(Literal::Int(value));
    let mut graph = InstructionGraph::new(2, 3);
    graph.push(LDC, ldc(100));
    let total_store = graph.push(ISTORE, Operand::Local(2));
    let head = graph.push(ILOAD, Operand::Local(0));
    let exit = graph.push(IFLE, Operand::None);
    graph.push(ILOAD, Operand::Local(0));
    let temp_store = graph.push(ISTORE, Operand::Local(1));
    let temp_load = graph.push(ILOAD, Operand::Local(1));
    graph.push(INVOKESTATIC, sink());
    graph.push(IINC, Operand::Increment { slot: 0, increment: -1 });
    let back = graph.push(GOTO, Operand::None);
    let total_load = graph.push(ILOAD, Operand::Local(2));
    graph.push(IRETURN, Operand::None);
    graph.set_successors(exit, vec![total_load]);
    graph.set_successors(back, vec![head]);

    LocalOptimizer::new(true)
        .optimize(&mut graph, &context("run", "(I)I", true))
        .unwrap();
    let (total, temp) = (slot(&graph, total_store), slot(&graph, temp_store));
    assert_eq!(slot(&graph, total_load), total);
    assert_eq!(slot(&graph, temp_load), temp);
    assert_eq!(slot(&graph, head), 0);
    assert_ne!(total, 0);
    assert_ne!(temp, 0);
    assert_ne!(total, temp);
    assert_eq!(graph.max_locals, 3);
}
