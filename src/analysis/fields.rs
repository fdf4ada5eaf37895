use crate::jvm::code::{Literal, Reference};
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Outside knowledge about identifiers, and the sink for what the analysis learns about them
///
/// Notifications are idempotent and may arrive in any order, since methods are analysed in no
/// particular order. Only [`IdentifierService::field_constant`] and
/// [`IdentifierService::mark_field_not_constant`] affect the analysis itself.
pub trait IdentifierService {
    /// Value a field always holds, as far as is known right now
    fn field_constant(&self, field: &Reference) -> Option<Literal>;

    /// The field is written somewhere, so it must not be treated as a constant any more
    fn mark_field_not_constant(&mut self, field: &Reference);

    /// `method` relied on `field` being constant
    fn field_read_as_constant(&mut self, _field: &Reference, _method: &Reference) {}

    fn mark_field_reachable(&mut self, _field: &Reference) {}

    fn mark_method_reachable(&mut self, _method: &Reference) {}

    fn mark_class_reachable(&mut self, _class: &str) {}

    /// Methods that read some field as constant before it was marked non-constant
    ///
    /// Each method is returned once per invalidation, and must be analysed again.
    fn take_stale_readers(&mut self) -> Vec<Reference> {
        vec![]
    }
}

#[derive(Debug)]
struct FieldState {
    constant: Option<Literal>,
    readers: HashSet<Reference>,
}

/// In-memory [`IdentifierService`] for a fixed set of fields
///
/// Fields only count as constant once they are [declared](FieldTable::declare) with the value
/// they start out with.
#[derive(Debug, Default)]
pub struct FieldTable {
    fields: HashMap<Reference, FieldState>,
    stale: Vec<Reference>,
    reachable_fields: HashSet<Reference>,
    reachable_methods: HashSet<Reference>,
    reachable_classes: BTreeSet<String>,
}

impl FieldTable {
    pub fn new() -> FieldTable {
        FieldTable::default()
    }

    /// Treat a field as holding `initial` until some write to it is found
    pub fn declare(&mut self, field: Reference, initial: Literal) {
        self.fields.insert(
            field,
            FieldState {
                constant: Some(initial),
                readers: HashSet::new(),
            },
        );
    }

    pub fn is_constant(&self, field: &Reference) -> bool {
        self.fields
            .get(field)
            .map_or(false, |state| state.constant.is_some())
    }

    pub fn is_field_reachable(&self, field: &Reference) -> bool {
        self.reachable_fields.contains(field)
    }

    pub fn is_method_reachable(&self, method: &Reference) -> bool {
        self.reachable_methods.contains(method)
    }

    pub fn reachable_classes(&self) -> impl Iterator<Item = &str> {
        self.reachable_classes.iter().map(String::as_str)
    }
}

impl IdentifierService for FieldTable {
    fn field_constant(&self, field: &Reference) -> Option<Literal> {
        self.fields.get(field)?.constant.clone()
    }

    fn mark_field_not_constant(&mut self, field: &Reference) {
        let state = match self.fields.get_mut(field) {
            Some(state) if state.constant.is_some() => state,
            _ => return,
        };
        debug!("field {} is not constant", field);
        state.constant = None;
        for reader in state.readers.drain() {
            if !self.stale.contains(&reader) {
                self.stale.push(reader);
            }
        }
    }

    fn field_read_as_constant(&mut self, field: &Reference, method: &Reference) {
        if let Some(state) = self.fields.get_mut(field) {
            if state.constant.is_some() {
                state.readers.insert(method.clone());
            }
        }
    }

    fn mark_field_reachable(&mut self, field: &Reference) {
        self.reachable_fields.insert(field.clone());
    }

    fn mark_method_reachable(&mut self, method: &Reference) {
        self.reachable_methods.insert(method.clone());
    }

    fn mark_class_reachable(&mut self, class: &str) {
        if !self.reachable_classes.contains(class) {
            self.reachable_classes.insert(class.to_owned());
        }
    }

    fn take_stale_readers(&mut self) -> Vec<Reference> {
        std::mem::take(&mut self.stale)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalidation_reports_readers_once() {
        let field = Reference::new("Config", "LIMIT", "I");
        let reader = Reference::new("Main", "run", "()V");
        let mut table = FieldTable::new();
        table.declare(field.clone(), Literal::Int(10));

        assert_eq!(table.field_constant(&field), Some(Literal::Int(10)));
        table.field_read_as_constant(&field, &reader);
        table.field_read_as_constant(&field, &reader);
        assert!(table.take_stale_readers().is_empty());

        table.mark_field_not_constant(&field);
        table.mark_field_not_constant(&field);
        assert!(!table.is_constant(&field));
        assert_eq!(table.field_constant(&field), None);
        assert_eq!(table.take_stale_readers(), vec![reader.clone()]);
        assert!(table.take_stale_readers().is_empty());

        // Reads after the invalidation are not recorded
        table.field_read_as_constant(&field, &reader);
        table.mark_field_not_constant(&field);
        assert!(table.take_stale_readers().is_empty());
    }

    #[test]
    fn undeclared_fields_are_not_constant() {
        let mut table = FieldTable::new();
        let field = Reference::new("Config", "count", "I");
        table.mark_field_not_constant(&field);
        assert_eq!(table.field_constant(&field), None);
        table.mark_class_reachable("java/lang/Exception");
        table.mark_class_reachable("java/lang/Exception");
        assert_eq!(
            table.reachable_classes().collect::<Vec<_>>(),
            vec!["java/lang/Exception"]
        );
    }
}
