mod common;

use common::{code_body, context, ids, init_logging, KNOWN_LOCAL_LOOP};
use jvmfold::analysis::{
    ConstantAnalysis, ConstantAnalyzer, FactFlags, FieldTable, MethodContext, WorklistOrder,
};
use jvmfold::jvm::class_file::ConstantPool;
use jvmfold::jvm::code::opcodes::*;
use jvmfold::jvm::code::{decode_code, InstructionGraph, Literal, Operand, Subroutines};

fn analyze(graph: &InstructionGraph, context: &MethodContext, order: WorklistOrder) -> ConstantAnalysis {
    let mut fields = FieldTable::new();
    ConstantAnalyzer::new(&mut fields)
        .with_order(order)
        .analyze(graph, context)
        .unwrap()
}

fn decode(max_stack: u16, max_locals: u16, code: &[u8]) -> InstructionGraph {
    init_logging();
    decode_code(&code_body(max_stack, max_locals, code, &[]), &ConstantPool::new()).unwrap()
}

#[test]
fn two_plus_three_is_five() {
    // iconst_2; iconst_3; iadd; istore_0; iload_0; ireturn
    let graph = decode(2, 1, &[0x05, 0x06, 0x60, 0x3b, 0x1a, 0xac]);
    let ids = ids(&graph);
    let analysis = analyze(&graph, &context("run", "()I", true), WorklistOrder::Fifo);
    assert_eq!(analysis.constant(ids[2]), Some(&Literal::Int(5)));
    assert_eq!(analysis.constant(ids[4]), Some(&Literal::Int(5)));
    assert_eq!(analysis.count(FactFlags::REACHABLE), 6);
}

#[test]
fn parameter_plus_zero_is_the_parameter() {
    // iload_0; iconst_0; iadd; ireturn
    let graph = decode(2, 1, &[0x1a, 0x03, 0x60, 0xac]);
    let ids = ids(&graph);
    let analysis = analyze(&graph, &context("run", "(I)I", true), WorklistOrder::Fifo);
    assert_eq!(analysis.constant(ids[0]), None);
    assert_eq!(analysis.constant(ids[2]), None);
    assert_eq!(analysis.count(FactFlags::CONSTANT), 0);
    assert_eq!(analysis.parameter(ids[0]), Some(0));
    assert_eq!(analysis.parameter(ids[2]), Some(0));
    assert_eq!(analysis.parameter(ids[1]), None);
}

#[test]
fn parameter_survives_merge_with_itself() {
    // `static int run(long p, int x) { if (x != 0) x = x + 0; return x; }`
    //
    // iload_2; ifeq 8; iload_2; iconst_0; iadd; istore_2; 8: iload_2; ireturn
    let code = [0x1c, 0x99, 0x00, 0x07, 0x1c, 0x03, 0x60, 0x3d, 0x1c, 0xac];
    let graph = decode(2, 3, &code);
    let ids = ids(&graph);
    let context = context("run", "(JI)I", true);
    for order in [WorklistOrder::Fifo, WorklistOrder::Lifo, WorklistOrder::Seeded(5)] {
        let analysis = analyze(&graph, &context, order);
        assert_eq!(analysis.parameter(ids[4]), Some(2), "{:?}", order);
        assert_eq!(analysis.parameter(ids[6]), Some(2), "{:?}", order);
        assert_eq!(analysis.constant(ids[6]), None, "{:?}", order);
    }
}

#[test]
fn parameter_is_lost_when_paths_disagree() {
    // iload_0; ifeq 7; iinc 0 1; 7: iload_0; ireturn
    let graph = decode(1, 1, &[0x1a, 0x99, 0x00, 0x06, 0x84, 0x00, 0x01, 0x1a, 0xac]);
    let ids = ids(&graph);
    let analysis = analyze(&graph, &context("run", "(I)I", true), WorklistOrder::Fifo);
    assert_eq!(analysis.parameter(ids[0]), Some(0));
    assert_eq!(analysis.parameter(ids[3]), None);
    assert_eq!(analysis.constant(ids[3]), None);
    assert_eq!(analysis.count(FactFlags::PARAMETER), 1);
}

#[test]
fn facts_do_not_depend_on_worklist_order() {
    let graph = decode(2, 2, &KNOWN_LOCAL_LOOP);
    let ids = ids(&graph);
    let context = context("run", "()I", true);
    let reference = analyze(&graph, &context, WorklistOrder::Fifo);

    // `k` is known everywhere, `i` nowhere
    assert_eq!(reference.constant(ids[8]), Some(&Literal::Int(5)));
    assert_eq!(reference.resolved_target(ids[9]), Some(ids[10]));
    assert_eq!(reference.constant(ids[11]), Some(&Literal::Int(5)));
    assert_eq!(reference.constant(ids[4]), None);
    assert_eq!(reference.constant(ids[13]), None);

    let mut orders = vec![WorklistOrder::Lifo];
    orders.extend((1..=8).map(WorklistOrder::Seeded));
    for order in orders {
        assert_eq!(analyze(&graph, &context, order), reference, "{:?}", order);
    }
}

/// Two call sites sharing a subroutine that overwrites local 1
fn shared_subroutine() -> (InstructionGraph, Vec<jvmfold::jvm::code::InstrId>) {
    let ldc = |value: i32| Operand::Literal(Literal::Int(value));
    let mut graph = InstructionGraph::new(2, 4);
    let ids = vec![
        graph.push(LDC, ldc(10)),
        graph.push(ISTORE, Operand::Local(0)),
        graph.push(LDC, ldc(1)),
        graph.push(ISTORE, Operand::Local(1)),
        graph.push(JSR, Operand::None),
        graph.push(ILOAD, Operand::Local(0)),
        graph.push(ILOAD, Operand::Local(1)),
        graph.push(IADD, Operand::None),
        graph.push(ISTORE, Operand::Local(2)),
        graph.push(LDC, ldc(20)),
        graph.push(ISTORE, Operand::Local(0)),
        graph.push(LDC, ldc(2)),
        graph.push(ISTORE, Operand::Local(1)),
        graph.push(JSR, Operand::None),
        graph.push(ILOAD, Operand::Local(0)),
        graph.push(ILOAD, Operand::Local(1)),
        graph.push(IADD, Operand::None),
        graph.push(IRETURN, Operand::None),
        graph.push(ASTORE, Operand::Local(3)),
        graph.push(LDC, ldc(7)),
        graph.push(ISTORE, Operand::Local(1)),
        graph.push(RET, Operand::Local(3)),
    ];
    graph.set_successors(ids[4], vec![ids[18], ids[5]]);
    graph.set_successors(ids[13], vec![ids[18], ids[14]]);
    graph.validate().unwrap();
    (graph, ids)
}

#[test]
fn subroutine_with_two_call_sites() {
    init_logging();
    let (graph, ids) = shared_subroutine();
    let subroutines = Subroutines::find(&graph).unwrap();
    let subroutine = subroutines.by_entry(ids[18]).unwrap();
    assert_eq!(subroutines.iter().count(), 1);
    assert_eq!(subroutine.ret, Some(ids[21]));
    assert_eq!(subroutine.callers.len(), 2);

    let context = context("run", "()I", true);
    for order in [WorklistOrder::Fifo, WorklistOrder::Lifo, WorklistOrder::Seeded(3)] {
        let analysis = analyze(&graph, &context, order);

        // Untouched by the subroutine: each call site's own value
        assert_eq!(analysis.constant(ids[5]), Some(&Literal::Int(10)));
        assert_eq!(analysis.constant(ids[14]), Some(&Literal::Int(20)));

        // Overwritten by the subroutine at both resume points
        assert_eq!(analysis.constant(ids[6]), Some(&Literal::Int(7)));
        assert_eq!(analysis.constant(ids[15]), Some(&Literal::Int(7)));
        assert_eq!(analysis.constant(ids[7]), Some(&Literal::Int(17)));
        assert_eq!(analysis.constant(ids[16]), Some(&Literal::Int(27)));
    }
}

#[test]
fn subroutine_locals_are_reassigned_consistently() {
    init_logging();
    let (mut graph, ids) = shared_subroutine();
    let context = context("run", "()I", true);
    let stats = jvmfold::optimize::LocalOptimizer::new(true)
        .optimize(&mut graph, &context)
        .unwrap();
    graph.validate().unwrap();

    // The return address is read from where it was stored
    assert_eq!(graph.get(ids[18]).local_slot(), graph.get(ids[21]).local_slot());

    // Both resume points read local 1 from the subroutine's store
    let written = graph.get(ids[20]).local_slot();
    assert_eq!(graph.get(ids[6]).local_slot(), written);
    assert_eq!(graph.get(ids[15]).local_slot(), written);
    assert!(stats.dead_stores >= 2);
    assert!(graph.max_locals <= 4);
}
