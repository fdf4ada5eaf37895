//! Static structure of `jsr`/`ret` subroutines
//!
//! A subroutine is identified by its entry instruction, which must be an `astore` of the return
//! address. Its body is everything reachable from the entry along normal control flow, stopping
//! at returns and at any later store into the return address slot. The body ends in at most one
//! `ret` reading that slot.

use super::opcodes::*;
use super::{InstrId, InstructionGraph};
use crate::jvm::{ConsistencyError, Error, FormatError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Clone, Debug)]
pub struct Subroutine {
    /// `astore` at the start of the subroutine
    pub entry: InstrId,

    /// Slot holding the return address
    pub return_slot: u16,

    /// `jsr` instructions calling this subroutine
    pub callers: Vec<InstrId>,

    /// The `ret` closing the subroutine (`None` if it never returns)
    pub ret: Option<InstrId>,

    pub body: HashSet<InstrId>,

    /// Local slots written somewhere in the body (including nested subroutines)
    pub touched: BTreeSet<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct Subroutines {
    by_entry: HashMap<InstrId, Subroutine>,
    by_ret: HashMap<InstrId, InstrId>,
}

impl Subroutines {
    pub fn is_empty(&self) -> bool {
        self.by_entry.is_empty()
    }

    pub fn by_entry(&self, entry: InstrId) -> Option<&Subroutine> {
        self.by_entry.get(&entry)
    }

    /// Subroutine closed by a `ret`
    pub fn by_ret(&self, ret: InstrId) -> Option<&Subroutine> {
        self.by_ret.get(&ret).and_then(|entry| self.by_entry.get(entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subroutine> {
        self.by_entry.values()
    }

    /// Find every subroutine called from a live `jsr`
    pub fn find(graph: &InstructionGraph) -> Result<Subroutines> {
        let mut callers: HashMap<InstrId, Vec<InstrId>> = HashMap::new();
        for id in graph.iter() {
            if graph.get(id).opcode == JSR {
                if let Some(entry) = graph.successors(id).first() {
                    callers.entry(*entry).or_default().push(id);
                }
            }
        }

        let mut subroutines = Subroutines::default();
        for (entry, callers) in callers {
            let entry_instr = graph.get(entry);
            let return_slot = match (entry_instr.opcode, entry_instr.local_slot()) {
                (ASTORE, Some(slot)) => slot,
                _ => {
                    return Err(Error::Format(FormatError::NonStandardSubroutine {
                        offset: entry_instr.address,
                    }))
                }
            };

            let mut body = HashSet::from([entry]);
            let mut touched = BTreeSet::from([return_slot]);
            let mut ret = None;
            let mut stack = graph.flow_successors(entry);
            while let Some(id) = stack.pop() {
                let instr = graph.get(id);
                if is_store(instr.opcode) && instr.local_slot() == Some(return_slot) {
                    continue;
                }
                if !body.insert(id) {
                    continue;
                }
                if is_store(instr.opcode) || instr.opcode == IINC {
                    if let Some(slot) = instr.local_slot() {
                        touched.insert(slot);
                        if instr.local_size() == 2 {
                            touched.insert(slot + 1);
                        }
                    }
                }
                if instr.opcode == RET && instr.local_slot() == Some(return_slot) {
                    if let Some(first) = ret {
                        return Err(Error::Consistency(ConsistencyError::MultipleRets {
                            entry,
                            first,
                            second: id,
                        }));
                    }
                    ret = Some(id);
                }
                stack.extend(graph.flow_successors(id));
            }

            if let Some(ret) = ret {
                subroutines.by_ret.insert(ret, entry);
            }
            subroutines.by_entry.insert(
                entry,
                Subroutine {
                    entry,
                    return_slot,
                    callers,
                    ret,
                    body,
                    touched,
                },
            );
        }
        Ok(subroutines)
    }
}
