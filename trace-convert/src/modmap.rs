//! Module-index to mapped-address resolution.

use crate::decode::ModuleMapper;
use crate::error::ConvertError;

/// Mapper over an explicit module table.
///
/// Each module is a (base, length) extent; resolution is base plus offset
/// with a bounds check. The table is built before conversion and shared
/// read-only across workers.
#[derive(Debug, Default)]
pub struct InMemoryMapper {
    modules: hashbrown::HashMap<u32, (u64, u64)>,
}

impl InMemoryMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, modidx: u32, base: u64, len: u64) {
        self.modules.insert(modidx, (base, len));
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleMapper for InMemoryMapper {
    fn resolve(&self, modidx: u32, modoffs: u64) -> Result<u64, ConvertError> {
        match self.modules.get(&modidx) {
            Some(&(base, len)) if modoffs < len => Ok(base + modoffs),
            _ => Err(ConvertError::UnmappedModule { modidx, modoffs }),
        }
    }
}
