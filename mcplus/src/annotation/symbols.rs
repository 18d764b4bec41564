use std::collections::HashMap;

use mcinst::Symbol;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Interned {
    ids: HashMap<Symbol, u32>,
    symbols: Vec<Symbol>,
}

/// Symbols referenced from inline annotation payloads (labels, landing pads).
///
/// A slot stores `id + 1`, so that a zero payload reads as "no symbol".
#[derive(Debug, Default)]
pub struct SymbolTable {
    table: RwLock<Interned>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, symbol: &Symbol) -> u32 {
        if let Some(id) = self.table.read().ids.get(symbol) {
            return *id;
        }

        let mut table = self.table.upgradable_read();
        if let Some(id) = table.ids.get(symbol) {
            return *id;
        }
        table.with_upgraded(|table| {
            let id = table.symbols.len() as u32;
            table.symbols.push(symbol.clone());
            table.ids.insert(symbol.clone(), id);
            id
        })
    }

    pub fn get(&self, id: u32) -> Option<Symbol> {
        self.table.read().symbols.get(id as usize).cloned()
    }

    /// Payload encoding of an optional symbol.
    pub fn to_payload(&self, symbol: Option<&Symbol>) -> i64 {
        symbol.map_or(0, |symbol| self.intern(symbol) as i64 + 1)
    }

    pub fn from_payload(&self, payload: i64) -> Option<Symbol> {
        match payload {
            0 => None,
            id => u32::try_from(id - 1).ok().and_then(|id| self.get(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
