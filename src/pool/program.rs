//! Process-wide shared program
//!
//! The transpiler bundle is compiled to bytecode once per process and
//! shared, read-only, by every pool instance. Setup is idempotent per
//! transpiler; teardown is explicit.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::{Engine, EvalFlags};
use crate::dialect::Transpiler;
use crate::error::{Error, Result};

/// Key used when no transpiler is configured
pub const PLAIN_KEY: &str = "javascript";

/// Immutable program every instance of a pool is built from
#[derive(Debug)]
pub struct SharedProgram {
    key: String,
    transpiler: Option<Transpiler>,
}

impl SharedProgram {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Transpiler with its precompiled bytecode attached
    pub fn transpiler(&self) -> Option<&Transpiler> {
        self.transpiler.as_ref()
    }
}

static PROGRAMS: Lazy<Mutex<HashMap<String, Arc<SharedProgram>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Build the shared program for `transpiler`, or return the existing one
///
/// Compiling the bundle happens at most once per process; a failure is
/// fatal and nothing is stored.
pub fn setup(transpiler: Option<&Transpiler>, memory_limit: usize) -> Result<Arc<SharedProgram>> {
    let key = transpiler.map_or_else(|| PLAIN_KEY.to_string(), Transpiler::key);

    let mut programs = PROGRAMS.lock();
    if let Some(program) = programs.get(&key) {
        return Ok(program.clone());
    }

    let transpiler = match transpiler {
        Some(transpiler) if transpiler.bytecode().is_some() => Some(transpiler.clone()),
        Some(transpiler) => {
            let engine = Engine::create(memory_limit)?;
            let bytecode = engine
                .compile(
                    transpiler.source(),
                    &EvalFlags::default().filename(transpiler.name()),
                )
                .map_err(|err| {
                    Error::EngineInit(format!("{} transpiler failed to compile: {}", transpiler.name(), err))
                })?;
            engine.close();
            Some(transpiler.clone().with_bytecode(bytecode.into()))
        }
        None => None,
    };

    debug!(key = %key, "shared program ready");
    let program = Arc::new(SharedProgram {
        key: key.clone(),
        transpiler,
    });
    programs.insert(key, program.clone());
    Ok(program)
}

/// Drop the shared program if no one but the registry and the caller holds it
pub fn release(program: &Arc<SharedProgram>) {
    let mut programs = PROGRAMS.lock();
    // The registry's reference plus the caller's
    if Arc::strong_count(program) <= 2 && programs.remove(program.key()).is_some() {
        debug!(key = %program.key(), "shared program released");
    }
}

/// Remove a shared program unconditionally
///
/// Instances already built from it keep working; new pools compile again.
pub fn teardown(key: &str) -> bool {
    PROGRAMS.lock().remove(key).is_some()
}

/// Whether a shared program exists for `key`
pub fn is_ready(key: &str) -> bool {
    PROGRAMS.lock().contains_key(key)
}
