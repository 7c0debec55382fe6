/*!
 * Static Symbol Table
 * Agent helpers that are not exported from any shared object
 */

use crate::core::types::Address;
use ahash::HashMap;
use parking_lot::RwLock;
use std::sync::OnceLock;

/// Name to address map consulted after dynamic lookup fails
pub struct SymbolTable {
    entries: RwLock<HashMap<String, Address>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::default()),
        }
    }

    /// Table pre-populated with the agent's own helpers
    pub fn with_agent_helpers() -> Self {
        let table = Self::new();
        table.register("ta_waitpid", crate::process::ta_waitpid as usize);
        table.register("ta_kill_death", crate::process::ta_kill_death as usize);
        table.register("ta_system", crate::process::ta_system as usize);
        table.register("signal_registrar", crate::process::signal_registrar as usize);
        table
    }

    /// Add or replace an entry
    pub fn register(&self, name: impl Into<String>, addr: Address) {
        let name = name.into();
        tracing::debug!(symbol = %name, "static symbol registered");
        self.entries.write().insert(name, addr);
    }

    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.entries.read().get(name).copied()
    }

    /// Reverse lookup, used to name registered handlers
    pub fn name_of(&self, addr: Address) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(name, _)| name.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide table
pub fn static_table() -> &'static SymbolTable {
    static TABLE: OnceLock<SymbolTable> = OnceLock::new();
    TABLE.get_or_init(SymbolTable::with_agent_helpers)
}
