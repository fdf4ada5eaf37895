mod common;

use common::{code_body, context, init_logging, COUNTING_LOOP, KNOWN_LOCAL_LOOP};
use jvmfold::analysis::FieldTable;
use jvmfold::jvm::class_file::{CodeAttribute, ConstantPool};
use jvmfold::jvm::code::opcodes::*;
use jvmfold::jvm::code::{decode_code_attribute, MemberKind, Reference};
use jvmfold::optimize::{MethodBody, MethodStats, Optimizer, Settings};

fn optimize(method: &mut MethodBody, pool: &mut ConstantPool) -> MethodStats {
    let mut fields = FieldTable::new();
    Optimizer::new(Settings::new(), &mut fields)
        .optimize_method(method, pool)
        .unwrap()
}

fn opcodes(code: &CodeAttribute, pool: &ConstantPool) -> Vec<u8> {
    let graph = decode_code_attribute(code, pool).unwrap();
    graph.iter().map(|id| graph.get(id).opcode).collect()
}

#[test]
fn known_local_is_folded_away() {
    init_logging();
    let mut pool = ConstantPool::new();
    let code = CodeAttribute::read(&code_body(2, 2, &KNOWN_LOCAL_LOOP, &[])).unwrap();
    let mut method = MethodBody::new(context("run", "()I", true), code);

    let stats = optimize(&mut method, &mut pool);
    assert_eq!(stats.transform.branches_resolved, 1);
    assert_eq!(stats.transform.substituted, 2);
    assert_eq!(stats.locals.map(|locals| locals.dead_stores), Some(1));
    assert_eq!(method.code.max_locals, 1);
    assert_eq!(
        opcodes(&method.code, &pool),
        vec![LDC, ISTORE, ILOAD, LDC, IF_ICMPGE, IINC, GOTO, LDC, ILOAD, IADD, IRETURN]
    );
}

#[test]
fn optimizing_twice_changes_nothing() {
    init_logging();
    let mut pool = ConstantPool::new();
    let code = CodeAttribute::read(&code_body(2, 2, &KNOWN_LOCAL_LOOP, &[])).unwrap();
    let mut method = MethodBody::new(context("run", "()I", true), code);

    optimize(&mut method, &mut pool);
    let once = method.code.clone();
    let stats = optimize(&mut method, &mut pool);
    assert!(stats.transform.is_empty(), "{:?}", stats.transform);
    assert_eq!(stats.locals.map(|locals| locals.dead_stores), Some(0));
    assert_eq!(method.code, once);
}

#[test]
fn catcher_reached_only_by_exceptions_is_kept() {
    init_logging();
    let mut pool = ConstantPool::new();
    let callee = pool
        .put_member(MemberKind::Method, &Reference::new("Other", "work", "()V"))
        .unwrap();
    let [high, low] = callee.0.to_be_bytes();
    let code = [
        0xb8, high, low, // 0: invokestatic Other.work()V
        0xb1, // 3: return
        0x57, // 4: pop
        0xb1, // 5: return
    ];
    let code = CodeAttribute::read(&code_body(1, 0, &code, &[[0, 3, 4, 0]])).unwrap();
    let mut method = MethodBody::new(context("run", "()V", true), code);

    let stats = optimize(&mut method, &mut pool);
    assert_eq!(stats.transform.removed, 0);
    assert_eq!(method.code.exception_table.len(), 1);
    assert_eq!(method.code.exception_table[0].handler_pc, 4);
    assert_eq!(opcodes(&method.code, &pool), vec![INVOKESTATIC, RETURN, POP, RETURN]);
}

#[test]
fn unknown_loops_are_kept() {
    init_logging();
    let mut pool = ConstantPool::new();
    let code = CodeAttribute::read(&code_body(2, 2, &COUNTING_LOOP, &[[7, 10, 15, 0]])).unwrap();
    let before = opcodes(&code, &pool);
    let mut method = MethodBody::new(context("count", "(I)I", true), code);

    let stats = optimize(&mut method, &mut pool);
    assert!(stats.transform.is_empty(), "{:?}", stats.transform);
    assert_eq!(method.code.max_locals, 2);
    assert_eq!(opcodes(&method.code, &pool), before);
}
