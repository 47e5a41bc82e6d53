use std::collections::HashSet;

use crate::api::spec_dto::SpecEntryDto;
use crate::domain::node::WorkerId;

/// Tokens a worker may list to claim every node type it is not beaten to.
const WILDCARD_TOKENS: [&str; 2] = ["*", "ALL"];

#[derive(Debug, Clone)]
struct SpecEntry {
    worker: WorkerId,
    types: HashSet<String>,
}

impl SpecEntry {
    fn is_wildcard(&self) -> bool {
        WILDCARD_TOKENS.iter().any(|token| self.types.contains(*token))
    }
}

/// Which node types each worker prefers to own.
///
/// Entries keep their insertion order and resolution scans them in that
/// order, so the table is a priority list, not a set. The table is fixed at
/// startup and identical on every worker of a group; ownership must resolve
/// to the same rank no matter which worker asks.
#[derive(Debug, Clone, Default)]
pub struct SpecializationTable {
    entries: Vec<SpecEntry>,
}

impl SpecializationTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Adds (or replaces, keeping table position) the type set of `worker`.
    pub fn add_worker<I, S>(&mut self, worker: WorkerId, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: HashSet<String> = types.into_iter().map(Into::into).collect();

        match self.entries.iter_mut().find(|entry| entry.worker == worker) {
            Some(entry) => entry.types = types,
            None => self.entries.push(SpecEntry { worker, types }),
        }
    }

    pub fn from_dto(dto: &[SpecEntryDto]) -> Self {
        let mut table = Self::new();
        for entry in dto {
            table.add_worker(WorkerId(entry.worker), entry.types.iter().cloned());
        }
        table
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.entries.iter().map(|entry| entry.worker)
    }

    /// Resolves which worker should own a node of type `class_type`.
    ///
    /// The first entry naming the type exactly wins; if none does, the first
    /// entry carrying a wildcard token wins. `None` means no entry claims
    /// the type and the caller falls back to its own rank.
    pub fn resolve_owner(&self, class_type: &str) -> Option<WorkerId> {
        for entry in &self.entries {
            if entry.types.contains(class_type) {
                return Some(entry.worker);
            }
        }

        for entry in &self.entries {
            if entry.is_wildcard() {
                return Some(entry.worker);
            }
        }

        None
    }
}
