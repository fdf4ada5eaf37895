use crate::jvm::code::{MemberKind, Reference};
use elsa::map::FrozenMap;
use elsa::FrozenVec;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Debug;
use typed_arena::Arena;

/// Answers "which class actually declares this member?"
///
/// Member references in bytecode name the class through which the member was accessed, which
/// may be a subclass of (or a class implementing an interface of) the declaring class.
pub trait MemberResolver {
    /// Declaring class of the member, or `None` if it cannot be found
    fn declaring_class(&self, kind: MemberKind, reference: &Reference) -> Option<String>;
}

pub struct ClassGraphArenas<'g> {
    class_arena: Arena<ClassData<'g>>,
    member_arena: Arena<MemberData<'g>>,
}

impl<'g> ClassGraphArenas<'g> {
    pub fn new() -> Self {
        ClassGraphArenas {
            class_arena: Arena::new(),
            member_arena: Arena::new(),
        }
    }
}

impl<'g> Default for ClassGraphArenas<'g> {
    fn default() -> Self {
        ClassGraphArenas::new()
    }
}

/// Tracks the relationships between classes/interfaces and the members on those classes
///
/// The graph is scoped to one run of the optimizer and handed to the passes that need it, so
/// tests can build small hierarchies of their own.
pub struct ClassGraph<'g> {
    arenas: &'g ClassGraphArenas<'g>,
    classes: FrozenMap<&'g str, &'g ClassData<'g>>,
}

impl<'g> ClassGraph<'g> {
    /// New empty graph
    pub fn new(arenas: &'g ClassGraphArenas<'g>) -> Self {
        ClassGraph {
            arenas,
            classes: FrozenMap::new(),
        }
    }

    pub fn lookup_class(&self, name: &str) -> Option<&ClassData<'g>> {
        self.classes.get(name)
    }

    /// Add a new class to the class graph
    pub fn add_class(&self, data: ClassData<'g>) -> &'g ClassData<'g> {
        let data = &*self.arenas.class_arena.alloc(data);
        self.classes.insert(&data.name, data);
        data
    }

    /// Add a field or method to the class graph and to its class
    pub fn add_member(&self, member: MemberData<'g>) -> &'g MemberData<'g> {
        let class = member.class;
        let existing = class.members.iter().find(|m| {
            m.kind == member.kind && m.name == member.name && m.descriptor == member.descriptor
        });
        if let Some(m) = existing {
            m
        } else {
            let data = &*self.arenas.member_arena.alloc(member);
            data.class.members.push(data);
            data
        }
    }

    /// Search a class, then its superinterfaces, then its superclass (JVMS 5.4.3.2)
    fn resolve_field<'a>(
        class: &'a ClassData<'g>,
        name: &str,
        descriptor: &str,
    ) -> Option<&'a ClassData<'g>> {
        let mut visited: HashSet<&'a str> = HashSet::new();
        let mut next_class = Some(class);
        while let Some(class) = next_class {
            if class.declares(MemberKind::Field, name, descriptor) {
                return Some(class);
            }
            if let Some(found) = Self::search_interfaces(
                class,
                MemberKind::Field,
                name,
                descriptor,
                &mut visited,
            ) {
                return Some(found);
            }
            next_class = class.superclass;
        }
        None
    }

    /// Search the superclass chain, then all superinterfaces (JVMS 5.4.3.3 and 5.4.3.4)
    fn resolve_method<'a>(
        class: &'a ClassData<'g>,
        name: &str,
        descriptor: &str,
    ) -> Option<&'a ClassData<'g>> {
        let mut next_class = Some(class);
        while let Some(class) = next_class {
            if class.declares(MemberKind::Method, name, descriptor) {
                return Some(class);
            }
            next_class = class.superclass;
        }

        let mut visited: HashSet<&'a str> = HashSet::new();
        let mut next_class = Some(class);
        while let Some(class) = next_class {
            if let Some(found) = Self::search_interfaces(
                class,
                MemberKind::Method,
                name,
                descriptor,
                &mut visited,
            ) {
                return Some(found);
            }
            next_class = class.superclass;
        }
        None
    }

    fn search_interfaces<'a>(
        class: &'a ClassData<'g>,
        kind: MemberKind,
        name: &str,
        descriptor: &str,
        visited: &mut HashSet<&'a str>,
    ) -> Option<&'a ClassData<'g>> {
        let mut to_visit: Vec<&'a ClassData<'g>> = class.interfaces.iter().collect();
        while let Some(interface) = to_visit.pop() {
            if !visited.insert(&interface.name) {
                continue;
            }
            if interface.declares(kind, name, descriptor) {
                return Some(interface);
            }
            to_visit.extend(interface.interfaces.iter());
        }
        None
    }
}

impl<'g> MemberResolver for ClassGraph<'g> {
    fn declaring_class(&self, kind: MemberKind, reference: &Reference) -> Option<String> {
        let class = self.lookup_class(&reference.class)?;
        let found = match kind {
            MemberKind::Field => Self::resolve_field(class, &reference.name, &reference.descriptor),
            MemberKind::Method | MemberKind::InterfaceMethod => {
                Self::resolve_method(class, &reference.name, &reference.descriptor)
            }
        };
        found.map(|class| class.name.clone())
    }
}

pub struct ClassData<'g> {
    /// Name of the class
    pub name: String,

    /// Superclass is only ever missing for `java/lang/Object` itself (or for classes whose
    /// superclass is outside of the graph)
    pub superclass: Option<&'g ClassData<'g>>,

    /// Interfaces implemented (or super-interfaces)
    pub interfaces: FrozenVec<&'g ClassData<'g>>,

    /// Is this an interface?
    pub is_interface: bool,

    /// Fields and methods
    pub members: FrozenVec<&'g MemberData<'g>>,
}

impl<'g> ClassData<'g> {
    pub fn new(
        name: &str,
        superclass: Option<&'g ClassData<'g>>,
        is_interface: bool,
    ) -> ClassData<'g> {
        ClassData {
            name: name.to_owned(),
            superclass,
            interfaces: FrozenVec::new(),
            is_interface,
            members: FrozenVec::new(),
        }
    }

    fn declares(&self, kind: MemberKind, name: &str, descriptor: &str) -> bool {
        let is_field = kind == MemberKind::Field;
        self.members.iter().any(|m| {
            (m.kind == MemberKind::Field) == is_field
                && m.name == name
                && m.descriptor == descriptor
        })
    }
}

impl<'g> PartialEq for ClassData<'g> {
    fn eq(&self, other: &ClassData<'g>) -> bool {
        self.name == other.name
    }
}

impl<'g> Eq for ClassData<'g> {}

impl<'g> Debug for ClassData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub struct MemberData<'g> {
    /// Class
    ///
    /// Note: this is a pointer back to the class (so don't derive `Debug`)
    pub class: &'g ClassData<'g>,

    /// `Field` or `Method` (interface methods are recorded as `Method`)
    pub kind: MemberKind,

    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
}

impl<'g> MemberData<'g> {
    pub fn new(
        class: &'g ClassData<'g>,
        kind: MemberKind,
        name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> MemberData<'g> {
        MemberData {
            class,
            kind,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            is_static,
        }
    }
}

impl<'g> Debug for MemberData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}.{}:{}",
            self.class.name, self.name, self.descriptor,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_inherited_members() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let object = graph.add_class(ClassData::new("java/lang/Object", None, false));
        let constants = graph.add_class(ClassData::new("Constants", None, true));
        let base = graph.add_class(ClassData::new("Base", Some(object), false));
        let derived = graph.add_class(ClassData::new("Derived", Some(base), false));
        derived.interfaces.push(constants);

        graph.add_member(MemberData::new(object, MemberKind::Method, "hashCode", "()I", false));
        graph.add_member(MemberData::new(base, MemberKind::Field, "count", "I", false));
        graph.add_member(MemberData::new(constants, MemberKind::Field, "MAX", "I", true));
        graph.add_member(MemberData::new(constants, MemberKind::Method, "run", "()V", false));

        let declaring = |kind, name: &str, descriptor: &str| {
            graph.declaring_class(kind, &Reference::new("Derived", name, descriptor))
        };
        assert_eq!(declaring(MemberKind::Field, "count", "I").as_deref(), Some("Base"));
        assert_eq!(declaring(MemberKind::Field, "MAX", "I").as_deref(), Some("Constants"));
        assert_eq!(
            declaring(MemberKind::Method, "hashCode", "()I").as_deref(),
            Some("java/lang/Object")
        );
        assert_eq!(declaring(MemberKind::Method, "run", "()V").as_deref(), Some("Constants"));
        assert_eq!(declaring(MemberKind::Field, "count", "J"), None);
        assert_eq!(
            graph.declaring_class(MemberKind::Field, &Reference::new("Missing", "x", "I")),
            None
        );
    }

    #[test]
    fn duplicate_members_are_shared() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let class = graph.add_class(ClassData::new("A", None, false));
        let first = graph.add_member(MemberData::new(class, MemberKind::Field, "x", "I", true));
        let second = graph.add_member(MemberData::new(class, MemberKind::Field, "x", "I", true));
        assert!(std::ptr::eq(first, second));
        assert_eq!(class.members.len(), 1);
    }
}
