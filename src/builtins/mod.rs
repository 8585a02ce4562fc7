//! Host built-ins
//!
//! Every engine gets `print`, `console`, `scriptArgs` and the importable
//! `os` and `std` modules (also reachable as `qjs:os` and `qjs:std`).
//! Output, input, the working directory and the environment snapshot live
//! in a per-engine [`HostState`], so concurrent engines never share them.

pub mod os;
pub mod print;
pub mod stdlib;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use rquickjs::{Array, Object};

use crate::context::Scope;
use crate::error::Result;

/// Global the module sources read their natives from; removed after install
const HOST_GLOBAL: &str = "__taskjs_host";

/// Alias modules re-exporting the standard ones
const OS_ALIAS: &str = "export * from 'os';\nexport { default } from 'os';\n";
const STD_ALIAS: &str = "export * from 'std';\nexport { default } from 'std';\n";

/// Per-engine state shared with native functions
#[derive(Debug, Default)]
pub struct HostState {
    /// Buffered standard output
    pub stdout: Vec<u8>,
    /// Buffered standard error
    pub stderr: Vec<u8>,
    /// Pending standard input
    pub stdin: Vec<u8>,
    /// Virtual working directory
    pub cwd: PathBuf,
    /// Snapshot of the injected environment
    pub env: HashMap<String, String>,
    /// Names of modules loaded through the host
    pub modules: HashSet<String>,
}

impl HostState {
    /// Create host state rooted at `cwd`
    pub fn new(cwd: PathBuf) -> Self {
        HostState {
            cwd,
            ..Default::default()
        }
    }

    /// Clear all I/O buffers
    pub fn reset_io(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
        self.stdin.clear();
    }
}

/// Shared handle to [`HostState`]
pub type Host = Rc<RefCell<HostState>>;

/// Install globals and standard modules into a context
///
/// Standard modules go through [`Scope::load_module`], so they are drained
/// and recorded like any other host-loaded module.
pub(crate) fn install(scope: &Scope<'_>) -> Result<()> {
    let ctx = scope.ctx();
    let host = scope.host();
    let globals = ctx.globals();

    print::install(ctx, &globals, host)?;
    globals.set("scriptArgs", Array::new(ctx.clone())?)?;

    let natives = Object::new(ctx.clone())?;
    natives.set("os", os::natives(ctx, host)?)?;
    natives.set("std", stdlib::natives(ctx, host)?)?;
    globals.set(HOST_GLOBAL, natives)?;

    for (name, source) in [
        ("os", os::SOURCE),
        ("std", stdlib::SOURCE),
        ("qjs:os", OS_ALIAS),
        ("qjs:std", STD_ALIAS),
    ] {
        let val = scope.load_module(source, name, None, false)?;
        scope.check(val)?;
    }

    globals.remove(HOST_GLOBAL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::context::{Engine, EvalFlags};

    #[test]
    fn test_host_global_is_removed() {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        engine.with(|scope| {
            let val = scope
                .eval("typeof globalThis.__taskjs_host", &EvalFlags::default())
                .unwrap();
            assert_eq!(val.to_rust_string().as_deref(), Some("undefined"));
        });
    }

    #[test]
    fn test_script_args_default_empty() {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        engine.with(|scope| {
            let val = scope
                .eval("JSON.stringify(scriptArgs)", &EvalFlags::default())
                .unwrap();
            assert_eq!(val.to_rust_string().as_deref(), Some("[]"));
        });
    }

    #[test]
    fn test_standard_modules_registered() {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        for name in ["os", "std", "qjs:os", "qjs:std"] {
            assert!(engine.has_module(name), "missing {}", name);
        }
    }

    #[test]
    fn test_qjs_alias_matches_module() {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        engine.with(|scope| {
            let flags = EvalFlags::default().await_promise();
            let val = scope
                .eval(
                    "(async()=>(await import('qjs:os')).getcwd === (await import('os')).getcwd)()",
                    &flags,
                )
                .unwrap();
            assert_eq!(val.as_bool(), Some(true));
        });
    }
}
