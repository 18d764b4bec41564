use std::collections::HashMap;

use bit_set::BitSet;
use log::debug;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use strum::IntoEnumIterator;

use crate::{
    annotation::{
        AnnotationIndex, BuiltinAnnotation, FIRST_GENERIC_INDEX, MAX_ANNOTATIONS, SlotKind,
    },
    utils::error::{McPlusError, McResult},
};

#[derive(Debug, Default)]
struct RegistryTable {
    by_name: HashMap<String, AnnotationIndex>,
    /// Name of each index, in index order.
    names: Vec<String>,
    /// Generic indices claimed for inline payloads.
    inline: BitSet,
    /// Generic indices claimed for boxed records.
    boxed: BitSet,
}

impl RegistryTable {
    fn kind(&self, index: AnnotationIndex) -> Option<SlotKind> {
        if index < FIRST_GENERIC_INDEX {
            Some(SlotKind::Inline)
        } else if self.boxed.contains(index as usize) {
            Some(SlotKind::Boxed)
        } else if self.inline.contains(index as usize) {
            Some(SlotKind::Inline)
        } else {
            None
        }
    }

    fn push(&mut self, name: &str) -> McResult<AnnotationIndex> {
        if self.names.len() >= MAX_ANNOTATIONS {
            return Err(McPlusError::AnnotationIndexExhausted {
                name: name.to_owned(),
                max: MAX_ANNOTATIONS,
            });
        }
        let index = self.names.len() as AnnotationIndex;
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), index);
        Ok(index)
    }
}

/// Bidirectional map between annotation names and indices.
///
/// The built-in annotations occupy the first indices, in declaration order.
/// Generic names are appended on first use and keep their index for the
/// lifetime of the registry.
///
/// # Concurrency
/// Lookups only take the shared lock. Registration goes through an
/// upgradable read lock and re-checks the name before upgrading, so two
/// threads racing on the same new name end up with the same index.
#[derive(Debug)]
pub struct AnnotationRegistry {
    table: RwLock<RegistryTable>,
}

impl Default for AnnotationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationRegistry {
    pub fn new() -> Self {
        let mut table = RegistryTable::default();
        for builtin in BuiltinAnnotation::iter() {
            table.names.push(builtin.name().to_owned());
            table.by_name.insert(builtin.name().to_owned(), builtin.index());
        }
        debug_assert_eq!(table.names.len(), FIRST_GENERIC_INDEX as usize);

        Self {
            table: RwLock::new(table),
        }
    }

    pub fn index_of(&self, name: &str) -> Option<AnnotationIndex> {
        self.table.read().by_name.get(name).copied()
    }

    /// Index of `name`, registering it if it was never seen.
    pub fn index_or_create(&self, name: &str) -> McResult<AnnotationIndex> {
        if let Some(index) = self.index_of(name) {
            return Ok(index);
        }

        let mut table = self.table.upgradable_read();
        // Another thread may have registered it in between
        if let Some(index) = table.by_name.get(name) {
            return Ok(*index);
        }

        table.with_upgraded(|table| {
            let index = table.push(name)?;
            debug!("Registered annotation '{}' with index {}", name, index);
            Ok(index)
        })
    }

    pub fn name_of(&self, index: AnnotationIndex) -> Option<MappedRwLockReadGuard<'_, str>> {
        RwLockReadGuard::try_map(self.table.read(), |table| {
            table.names.get(index as usize).map(String::as_str)
        })
        .ok()
    }

    pub fn is_builtin(index: AnnotationIndex) -> bool {
        index < FIRST_GENERIC_INDEX
    }

    /// Number of registered indices, built-ins included.
    pub fn len(&self) -> usize {
        self.table.read().names.len()
    }

    pub fn generic_count(&self) -> usize {
        self.len() - FIRST_GENERIC_INDEX as usize
    }

    /// Payload kind of `index`, `None` while a generic index was never
    /// written.
    pub fn slot_kind(&self, index: AnnotationIndex) -> Option<SlotKind> {
        self.table.read().kind(index)
    }

    pub fn is_boxed(&self, index: AnnotationIndex) -> bool {
        self.slot_kind(index) == Some(SlotKind::Boxed)
    }

    /// Bind `index` to `kind` on its first use. Writing an index with the
    /// other kind afterwards is an error.
    pub(crate) fn claim_kind(&self, index: AnnotationIndex, kind: SlotKind) -> McResult<()> {
        let mismatch = |stored: SlotKind| McPlusError::PayloadTypeMismatch {
            stored: stored.describe(),
            requested: kind.describe(),
        };

        match self.slot_kind(index) {
            Some(stored) if stored == kind => return Ok(()),
            Some(stored) => return Err(mismatch(stored)),
            None => {}
        }

        let table = self.table.upgradable_read();
        if let Some(stored) = table.kind(index) {
            return if stored == kind { Ok(()) } else { Err(mismatch(stored)) };
        }
        let mut table = RwLockUpgradableReadGuard::upgrade(table);
        match kind {
            SlotKind::Inline => table.inline.insert(index as usize),
            SlotKind::Boxed => table.boxed.insert(index as usize),
        };
        Ok(())
    }
}
