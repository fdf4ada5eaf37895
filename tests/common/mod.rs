#![allow(dead_code)]

use byteorder::{BigEndian, WriteBytesExt};
use jvmfold::analysis::MethodContext;
use jvmfold::jvm::code::{InstrId, InstructionGraph, Operand};

/// Assemble a `Code` attribute body from raw code and `[start, end, handler, catch type]` rows
pub fn code_body(max_stack: u16, max_locals: u16, code: &[u8], handlers: &[[u16; 4]]) -> Vec<u8> {
    let mut bytes = vec![];
    bytes.write_u16::<BigEndian>(max_stack).unwrap();
    bytes.write_u16::<BigEndian>(max_locals).unwrap();
    bytes.write_u32::<BigEndian>(code.len() as u32).unwrap();
    bytes.extend_from_slice(code);
    bytes.write_u16::<BigEndian>(handlers.len() as u16).unwrap();
    for row in handlers {
        for field in row {
            bytes.write_u16::<BigEndian>(*field).unwrap();
        }
    }
    bytes.write_u16::<BigEndian>(0).unwrap();
    bytes
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn context(name: &str, descriptor: &str, is_static: bool) -> MethodContext {
    MethodContext::new("Test", name, descriptor, is_static).unwrap()
}

/// Live instruction ids, in address order
pub fn ids(graph: &InstructionGraph) -> Vec<InstrId> {
    graph.iter().collect()
}

/// Opcode, operand and successor positions of every instruction
pub fn shape(graph: &InstructionGraph) -> Vec<(u8, Operand, Vec<usize>)> {
    let positions = graph.positions();
    graph
        .iter()
        .map(|id| {
            let instr = graph.get(id);
            let succs = graph
                .successors(id)
                .iter()
                .map(|succ| positions[succ])
                .collect();
            (instr.opcode, instr.operand.clone(), succs)
        })
        .collect()
}

/// `static int count(int n) { int i = 0; while (i < n) i++; return i; }` with a handler
/// around the increment
pub const COUNTING_LOOP: [u8; 18] = [
    0x03, // 0: iconst_0
    0x3c, // 1: istore_1
    0x1b, // 2: iload_1
    0x1a, // 3: iload_0
    0xa2, 0x00, 0x09, // 4: if_icmpge 13
    0x84, 0x01, 0x01, // 7: iinc 1 1
    0xa7, 0xff, 0xf8, // 10: goto 2
    0x1b, // 13: iload_1
    0xac, // 14: ireturn
    0x57, // 15: pop
    0x02, // 16: iconst_m1
    0xac, // 17: ireturn
];

/// `static int run() { int k = 5; for (int i = 0; i < 10; i++) { if (k == 0) continue; } return k + i; }`
pub const KNOWN_LOCAL_LOOP: [u8; 24] = [
    0x08, // 0: iconst_5
    0x3b, // 1: istore_0
    0x03, // 2: iconst_0
    0x3c, // 3: istore_1
    0x1b, // 4: iload_1
    0x10, 0x0a, // 5: bipush 10
    0xa2, 0x00, 0x0d, // 7: if_icmpge 20
    0x84, 0x01, 0x01, // 10: iinc 1 1
    0x1a, // 13: iload_0
    0x99, 0xff, 0xf6, // 14: ifeq 4
    0xa7, 0xff, 0xf3, // 17: goto 4
    0x1a, // 20: iload_0
    0x1b, // 21: iload_1
    0x60, // 22: iadd
    0xac, // 23: ireturn
];
