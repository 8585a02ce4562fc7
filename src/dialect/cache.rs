//! Process-wide cache of compiled modules
//!
//! Bytecode is immutable once written, so every engine in the process can
//! load the same buffer.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;

/// Module bytecode plus the name it registers under
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub name: String,
    pub bytecode: Arc<[u8]>,
}

/// Compiled modules keyed by name and source fingerprint
#[derive(Debug, Default)]
pub struct ModuleCache {
    entries: RwLock<HashMap<String, CompiledModule>>,
}

static GLOBAL: Lazy<ModuleCache> = Lazy::new(ModuleCache::default);

impl ModuleCache {
    pub fn global() -> &'static ModuleCache {
        &GLOBAL
    }

    pub fn get(&self, key: &str) -> Option<CompiledModule> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, module: CompiledModule) {
        self.entries.write().insert(key.into(), module);
    }

    /// Return the cached module, compiling and storing it on a miss
    ///
    /// Compile failures are not cached.
    pub fn get_or_compile(
        &self,
        key: &str,
        name: &str,
        compile: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<CompiledModule> {
        if let Some(module) = self.get(key) {
            debug!(module = name, "module cache hit");
            return Ok(module);
        }
        let module = CompiledModule {
            name: name.to_string(),
            bytecode: compile()?.into(),
        };
        // Another thread may have raced us; either copy is equivalent
        self.insert(key, module.clone());
        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn remove(&self, key: &str) -> Option<CompiledModule> {
        self.entries.write().remove(key)
    }
}
