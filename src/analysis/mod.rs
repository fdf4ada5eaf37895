//! Dataflow analyses over decoded method bodies
//!
//! The main one is the [`ConstantAnalyzer`], which finds unreachable code, instructions that
//! always push the same value, and branches that always go the same way.

mod constant_analyzer;
mod fields;
pub mod pure_methods;
mod state;
mod value;

pub use constant_analyzer::*;
pub use fields::*;
pub use state::*;
pub use value::*;

use crate::jvm::class_graph::MemberResolver;
use crate::jvm::code::{opcodes, InstructionGraph, MemberKind, Operand, Reference};
use crate::jvm::{MethodDescriptor, ParseDescriptor, Result};

/// What an analysis needs to know about a method beyond its code
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MethodContext {
    /// Internal name of the declaring class
    pub class_name: String,
    pub method_name: String,
    pub descriptor: MethodDescriptor,
    pub is_static: bool,
}

impl MethodContext {
    pub fn new(
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> Result<MethodContext> {
        Ok(MethodContext {
            class_name: class_name.to_owned(),
            method_name: method_name.to_owned(),
            descriptor: MethodDescriptor::parse_checked(descriptor)?,
            is_static,
        })
    }

    /// Reference naming this method
    pub fn reference(&self) -> Reference {
        use crate::jvm::RenderDescriptor;
        Reference::new(&self.class_name, &self.method_name, &self.descriptor.render())
    }

    /// Local slots taken by the receiver and the parameters
    pub fn parameter_slots(&self) -> usize {
        self.descriptor.parameter_length(!self.is_static)
    }
}

/// Point every field and method reference at the class that declares the member
///
/// References the resolver knows nothing about are left alone. Returns the number of
/// instructions changed.
pub fn canonicalize_references(
    graph: &mut InstructionGraph,
    resolver: &dyn MemberResolver,
) -> usize {
    let ids: Vec<_> = graph.iter().collect();
    let mut changed = 0;
    for id in ids {
        let instr = graph.get_mut(id);
        let (kind, reference) = match &mut instr.operand {
            Operand::Field(reference) => (MemberKind::Field, reference),
            Operand::Method {
                reference,
                interface,
            } => {
                // `invokespecial` binds to the class it names
                if instr.opcode == opcodes::INVOKESPECIAL || reference.name == "<init>" {
                    continue;
                }
                let kind = if *interface {
                    MemberKind::InterfaceMethod
                } else {
                    MemberKind::Method
                };
                (kind, reference)
            }
            _ => continue,
        };
        if let Some(declaring) = resolver.declaring_class(kind, reference) {
            if declaring != reference.class {
                log::trace!("{} is declared in {}", reference, declaring);
                reference.class = declaring;
                changed += 1;
            }
        }
    }
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_graph::{ClassData, ClassGraph, ClassGraphArenas, MemberData};

    #[test]
    fn method_context_slots() {
        let context = MethodContext::new("Foo", "bar", "(JI)V", false).unwrap();
        assert_eq!(context.parameter_slots(), 4);
        assert_eq!(context.reference(), Reference::new("Foo", "bar", "(JI)V"));
        assert!(MethodContext::new("Foo", "bar", "(Q)V", true).is_err());
    }

    #[test]
    fn references_move_to_declaring_class() {
        let arenas = ClassGraphArenas::new();
        let classes = ClassGraph::new(&arenas);
        let base = classes.add_class(ClassData::new("Base", None, false));
        classes.add_class(ClassData::new("Derived", Some(base), false));
        classes.add_member(MemberData::new(base, MemberKind::Field, "count", "I", true));
        classes.add_member(MemberData::new(base, MemberKind::Method, "<init>", "()V", false));

        let mut graph = InstructionGraph::new(1, 1);
        let get = graph.push(
            opcodes::GETSTATIC,
            Operand::Field(Reference::new("Derived", "count", "I")),
        );
        let missing = graph.push(
            opcodes::GETSTATIC,
            Operand::Field(Reference::new("Derived", "other", "I")),
        );
        let init = graph.push(
            opcodes::INVOKESPECIAL,
            Operand::Method {
                reference: Reference::new("Derived", "<init>", "()V"),
                interface: false,
            },
        );
        assert_eq!(canonicalize_references(&mut graph, &classes), 1);
        let class_of = |id| match &graph.get(id).operand {
            Operand::Field(reference) | Operand::Method { reference, .. } => {
                reference.class.clone()
            }
            _ => unreachable!(),
        };
        assert_eq!(class_of(get), "Base");
        assert_eq!(class_of(missing), "Derived");
        assert_eq!(class_of(init), "Derived");
    }
}
