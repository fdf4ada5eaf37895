mod common;

use common::{code_body, init_logging, shape, COUNTING_LOOP, KNOWN_LOCAL_LOOP};
use jvmfold::jvm::class_file::ConstantPool;
use jvmfold::jvm::code::opcodes::*;
use jvmfold::jvm::code::{decode_code, encode_code};

fn round_trip(body: &[u8]) {
    init_logging();
    let mut pool = ConstantPool::new();
    let mut graph = decode_code(body, &pool).unwrap();
    let original = shape(&graph);
    let handlers = graph.handlers.len();

    let encoded = encode_code(&mut graph, &mut pool).unwrap();
    let mut again = decode_code(&encoded, &pool).unwrap();
    assert_eq!(shape(&again), original);
    assert_eq!(again.handlers.len(), handlers);
    assert_eq!(again.max_stack, graph.max_stack);
    assert_eq!(again.max_locals, graph.max_locals);

    // Layout is stable once canonical
    assert_eq!(encode_code(&mut again, &mut pool).unwrap(), encoded);
}

#[test]
fn loop_with_handler() {
    round_trip(&code_body(2, 2, &COUNTING_LOOP, &[[7, 10, 15, 0]]));
}

#[test]
fn loop_with_branches() {
    round_trip(&code_body(2, 2, &KNOWN_LOCAL_LOOP, &[]));
}

#[test]
fn canonical_forms_are_decoded() {
    init_logging();
    let pool = ConstantPool::new();
    let graph = decode_code(&code_body(2, 2, &COUNTING_LOOP, &[[7, 10, 15, 0]]), &pool).unwrap();
    let opcodes: Vec<u8> = graph.iter().map(|id| graph.get(id).opcode).collect();
    assert_eq!(
        opcodes,
        vec![LDC, ISTORE, ILOAD, ILOAD, IF_ICMPGE, IINC, GOTO, ILOAD, IRETURN, POP, LDC, IRETURN]
    );
    let handler = &graph.handlers[0];
    assert_eq!(graph.get(handler.start).opcode, IINC);
    assert_eq!(handler.start, handler.end);
    assert_eq!(graph.get(handler.catcher).address, 15);
}
