//! Engine binding
//!
//! An [`Engine`] owns exactly one QuickJS runtime and one context, plus the
//! host state its built-ins write to. It is not `Send`: an engine lives and
//! dies on the thread that created it.
//!
//! All evaluation happens inside [`Engine::with`], which hands out a
//! [`Scope`] bound to the context. Values produced in a scope borrow its
//! lifetime, so they cannot escape the engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use rquickjs::context::EvalOptions;
use rquickjs::convert::Coerced;
use rquickjs::{Array, Context, Ctx, Exception, FromJs, Module, Object, Promise, Runtime, Value};
use tracing::debug;

use crate::builtins::{self, Host, HostState};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::util::detect_module;
use crate::value::Val;

/// Module name used when a module is evaluated without a filename
pub const DEFAULT_MODULE_NAME: &str = "<input>";

/// Evaluation flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalFlags {
    /// Force module evaluation regardless of source shape
    pub module: bool,
    /// Evaluate a classic script in strict mode
    pub strict: bool,
    /// Register the module without executing it (implies `module`)
    pub compile_only: bool,
    /// Drain the job queue and return the settled value of a promise
    pub await_promise: bool,
    /// Module name; defaults to [`DEFAULT_MODULE_NAME`]
    pub filename: Option<String>,
}

impl EvalFlags {
    pub fn module(mut self) -> Self {
        self.module = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn compile_only(mut self) -> Self {
        self.compile_only = true;
        self
    }

    pub fn await_promise(mut self) -> Self {
        self.await_promise = true;
        self
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    fn module_name(&self) -> &str {
        self.filename.as_deref().unwrap_or(DEFAULT_MODULE_NAME)
    }
}

/// One runtime, one context and the host state behind them
///
/// Field order matters: the context is dropped before the runtime.
pub struct Engine {
    context: Context,
    runtime: Runtime,
    host: Host,
    memory_limit: usize,
}

impl Engine {
    /// Create a runtime and context with a fixed memory limit
    ///
    /// The engine has no built-ins until [`Engine::prepare`] runs.
    pub fn create(memory_limit: usize) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| Error::EngineInit(e.to_string()))?;
        runtime.set_memory_limit(memory_limit);
        let context = Context::full(&runtime).map_err(|e| Error::EngineInit(e.to_string()))?;

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        debug!(memory_limit, "engine created");

        Ok(Engine {
            context,
            runtime,
            host: Rc::new(RefCell::new(HostState::new(cwd))),
            memory_limit,
        })
    }

    /// Create and prepare an engine from configuration
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let engine = Engine::create(config.memory_limit)?;
        if let Some(size) = config.max_stack_size {
            engine.runtime.set_max_stack_size(size);
        }
        engine.prepare()?;
        Ok(engine)
    }

    /// Install host built-ins and the standard modules
    pub fn prepare(&self) -> Result<()> {
        self.with(|scope| match builtins::install(&scope) {
            Ok(()) => Ok(()),
            Err(Error::Engine(rquickjs::Error::Exception)) => {
                Err(Error::EngineInit(scope.exception_to_error().to_string()))
            }
            Err(err) => Err(Error::EngineInit(err.to_string())),
        })
    }

    /// Replace `process` with `{ env: { ...env } }`
    ///
    /// Injection is wholesale: variables from a previous call do not survive.
    pub fn inject_environment(&self, env: &HashMap<String, String>) -> Result<()> {
        self.context.with(|ctx| -> rquickjs::Result<()> {
            let vars = Object::new(ctx.clone())?;
            for (key, value) in env {
                vars.set(key.as_str(), value.as_str())?;
            }
            let process = Object::new(ctx.clone())?;
            process.set("env", vars)?;
            ctx.globals().set("process", process)
        })?;
        self.host.borrow_mut().env = env.clone();
        Ok(())
    }

    /// Enter the context
    pub fn with<R>(&self, f: impl for<'js> FnOnce(Scope<'js>) -> R) -> R {
        self.context
            .with(|ctx| f(Scope::new(ctx, self.host.clone())))
    }

    /// Compile source as a module and serialize its bytecode
    ///
    /// Compilation happens in a scratch context on the same runtime, so
    /// nothing is registered in this engine's context.
    pub fn compile(&self, code: &str, flags: &EvalFlags) -> Result<Vec<u8>> {
        let scratch = Context::full(&self.runtime).map_err(|e| Error::EngineInit(e.to_string()))?;
        let name = flags.module_name();
        scratch.with(|ctx| {
            let module = match Module::declare(ctx.clone(), name, code) {
                Ok(module) => module,
                Err(rquickjs::Error::Exception) => {
                    return Err(Scope::new(ctx, self.host.clone()).exception_to_error());
                }
                Err(err) => return Err(err.into()),
            };
            let bytes = module
                .write_le()
                .map_err(|e| Error::Serialization(e.to_string()))?;
            debug!(module = name, bytes = bytes.len(), "module compiled");
            Ok(bytes)
        })
    }

    /// Install an interrupt handler; returning `true` aborts the running script
    pub fn set_interrupt_handler(&self, handler: Option<Box<dyn FnMut() -> bool + 'static>>) {
        self.runtime.set_interrupt_handler(handler);
    }

    /// Run a garbage collection cycle
    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }

    /// Memory limit fixed at creation
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn take_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut self.host.borrow_mut().stdout)
    }

    pub fn take_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut self.host.borrow_mut().stderr)
    }

    pub fn set_stdin(&self, input: Vec<u8>) {
        self.host.borrow_mut().stdin = input;
    }

    /// Append to the buffered error stream
    pub fn write_stderr(&self, bytes: &[u8]) {
        self.host.borrow_mut().stderr.extend_from_slice(bytes);
    }

    /// Append to the buffered output stream
    pub fn write_stdout(&self, bytes: &[u8]) {
        self.host.borrow_mut().stdout.extend_from_slice(bytes);
    }

    pub fn reset_io(&self) {
        self.host.borrow_mut().reset_io();
    }

    /// Virtual working directory
    pub fn cwd(&self) -> PathBuf {
        self.host.borrow().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: PathBuf) {
        self.host.borrow_mut().cwd = cwd;
    }

    /// Whether a module with this name was loaded through the host
    pub fn has_module(&self, name: &str) -> bool {
        self.host.borrow().modules.contains(name)
    }

    /// Drop the context, then the runtime
    pub fn close(self) {
        let Engine {
            context, runtime, ..
        } = self;
        drop(context);
        drop(runtime);
        debug!("engine closed");
    }
}

/// Evaluation scope bound to an engine's context
pub struct Scope<'js> {
    ctx: Ctx<'js>,
    host: Host,
}

impl<'js> Scope<'js> {
    fn new(ctx: Ctx<'js>, host: Host) -> Self {
        Scope { ctx, host }
    }

    /// The underlying context
    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub(crate) fn host(&self) -> &Host {
        &self.host
    }

    /// Evaluate source text
    ///
    /// Thrown values come back as an exception-tagged [`Val`]; only
    /// host-level failures are `Err`.
    pub fn eval(&self, code: &str, flags: &EvalFlags) -> Result<Val<'js>> {
        if flags.module || flags.compile_only || detect_module(code) {
            return self.eval_module(code, flags);
        }

        let mut options = EvalOptions::default();
        options.strict = flags.strict;
        let value = match self.ctx.eval_with_options::<Value<'js>, _>(code, options) {
            Ok(value) => value,
            Err(err) => return self.caught(err),
        };

        if flags.await_promise {
            self.settle(value)
        } else {
            Ok(Val::from_value(value))
        }
    }

    fn eval_module(&self, code: &str, flags: &EvalFlags) -> Result<Val<'js>> {
        let name = flags.module_name();
        let declared = match Module::declare(self.ctx.clone(), name, code) {
            Ok(module) => module,
            Err(err) => return self.caught(err),
        };
        if flags.compile_only {
            return Ok(Val::declared(declared));
        }

        let (module, promise) = match declared.eval() {
            Ok(pair) => pair,
            Err(err) => return self.caught(err),
        };
        if flags.await_promise {
            let settled = self.settle_promise(&promise)?;
            if settled.is_exception() {
                return Ok(settled);
            }
        }
        Ok(Val::evaluated(module))
    }

    /// Drain the job queue, then read the settled state if `value` is a promise
    fn settle(&self, value: Value<'js>) -> Result<Val<'js>> {
        match value.as_promise() {
            Some(promise) => self.settle_promise(promise),
            None => {
                self.drain_jobs();
                Ok(Val::from_value(value))
            }
        }
    }

    fn settle_promise(&self, promise: &Promise<'js>) -> Result<Val<'js>> {
        self.drain_jobs();
        match promise.result::<Value<'js>>() {
            Some(Ok(value)) => Ok(Val::from_value(value)),
            Some(Err(err)) => self.caught(err),
            None => Err(Error::Script(
                "promise never settled: job queue drained while still pending".to_string(),
            )),
        }
    }

    /// Run pending jobs until the queue is empty
    pub fn drain_jobs(&self) {
        while self.ctx.execute_pending_job() {}
    }

    fn caught(&self, err: rquickjs::Error) -> Result<Val<'js>> {
        match err {
            rquickjs::Error::Exception => Ok(Val::exception()),
            other => Err(other.into()),
        }
    }

    /// Load a module by name
    ///
    /// With `cached` bytecode the source is not parsed. Otherwise the source
    /// must look like a module. Unless `load_only` is set the module body is
    /// executed and awaited.
    pub fn load_module(
        &self,
        code: &str,
        name: &str,
        cached: Option<&[u8]>,
        load_only: bool,
    ) -> Result<Val<'js>> {
        let declared = match cached {
            // SAFETY: bytecode only ever comes from `Engine::compile` on this
            // build of the engine.
            Some(bytes) => unsafe { Module::load(self.ctx.clone(), bytes) },
            None if !detect_module(code) => {
                Err(Exception::throw_syntax(&self.ctx, &format!("not a module: {}", name)))
            }
            None => Module::declare(self.ctx.clone(), name, code),
        };
        let declared = match declared {
            Ok(module) => module,
            Err(err) => return self.caught(err),
        };

        let val = if load_only {
            Val::declared(declared)
        } else {
            let (module, promise) = match declared.eval() {
                Ok(pair) => pair,
                Err(err) => return self.caught(err),
            };
            let settled = self.settle_promise(&promise)?;
            if settled.is_exception() {
                return Ok(settled);
            }
            Val::evaluated(module)
        };

        self.host.borrow_mut().modules.insert(name.to_string());
        debug!(module = name, cached = cached.is_some(), load_only, "module loaded");
        Ok(val)
    }

    /// Take the pending exception and convert it into an error
    ///
    /// `SyntaxError` becomes [`Error::Compile`], anything else
    /// [`Error::Script`].
    pub fn exception_to_error(&self) -> Error {
        let thrown = self.ctx.catch();
        let name = thrown
            .as_object()
            .and_then(|obj| obj.get::<_, Option<String>>("name").ok().flatten());

        let message = match Coerced::<String>::from_js(&self.ctx, thrown.clone()) {
            Ok(Coerced(message)) => message,
            Err(_) => {
                // toString itself threw
                let _ = self.ctx.catch();
                "uncaught exception".to_string()
            }
        };

        if let Some(stack) = thrown
            .as_object()
            .and_then(|obj| obj.get::<_, Option<String>>("stack").ok().flatten())
        {
            debug!(%message, %stack, "script exception");
        }

        match name.as_deref() {
            Some("SyntaxError") => Error::Compile(message),
            _ => Error::Script(message),
        }
    }

    /// Convert an exception-tagged value into an error
    pub fn check(&self, val: Val<'js>) -> Result<Val<'js>> {
        if val.is_exception() {
            Err(self.exception_to_error())
        } else {
            Ok(val)
        }
    }

    /// Replace the `scriptArgs` global
    pub fn set_script_args(&self, args: &[String]) -> Result<()> {
        let array = Array::new(self.ctx.clone())?;
        for (i, arg) in args.iter().enumerate() {
            array.set(i, arg.as_str())?;
        }
        self.ctx.globals().set("scriptArgs", array)?;
        Ok(())
    }

    /// Whether a module with this name was loaded through the host
    pub fn has_module(&self, name: &str) -> bool {
        self.host.borrow().modules.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::value::Tag;

    fn prepared() -> Engine {
        let engine = Engine::create(8 * 1024 * 1024).unwrap();
        engine.prepare().unwrap();
        engine
    }

    #[test]
    fn test_create_applies_memory_limit() {
        let engine = Engine::create(4 * 1024 * 1024).unwrap();
        assert_eq!(engine.memory_limit(), 4 * 1024 * 1024);
        engine.close();
    }

    #[test]
    fn test_eval_constant() {
        let engine = prepared();
        let n = engine.with(|scope| scope.eval("6 * 7", &EvalFlags::default()).unwrap().as_i32());
        assert_eq!(n, Some(42));
    }

    #[test]
    fn test_eval_strict_flag() {
        let engine = prepared();
        engine.with(|scope| {
            let sloppy = scope
                .eval("undeclared_a = 1; undeclared_a", &EvalFlags::default())
                .unwrap();
            assert_eq!(sloppy.as_i32(), Some(1));

            let strict = scope
                .eval("undeclared_b = 1", &EvalFlags::default().strict())
                .unwrap();
            assert!(strict.is_exception());
            let err = scope.exception_to_error();
            assert!(err.to_string().starts_with("ReferenceError"), "{}", err);
        });
    }

    #[test]
    fn test_await_promise_resolves() {
        let engine = prepared();
        let n = engine.with(|scope| {
            let val = scope
                .eval("(async () => { await null; return 5; })()", &EvalFlags::default().await_promise())
                .unwrap();
            val.as_i32()
        });
        assert_eq!(n, Some(5));
    }

    #[test]
    fn test_await_promise_rejection_is_exception() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope
                .eval("Promise.reject(new TypeError('nope'))", &EvalFlags::default().await_promise())
                .unwrap();
            assert_eq!(val.tag(), Tag::Exception);
            let err = scope.exception_to_error();
            assert_eq!(err.kind(), ErrorKind::Script);
            assert_eq!(err.to_string(), "TypeError: nope");
        });
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope.eval("let = ;", &EvalFlags::default()).unwrap();
            let err = scope.check(val).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Compile);
            assert!(err.to_string().starts_with("SyntaxError"));
        });
    }

    #[test]
    fn test_thrown_non_error_value() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope.eval("throw 42", &EvalFlags::default()).unwrap();
            let err = scope.check(val).unwrap_err();
            assert_eq!(err.to_string(), "42");
        });
    }

    #[test]
    fn test_engine_usable_after_exception() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope.eval("throw new Error('first')", &EvalFlags::default()).unwrap();
            assert!(scope.check(val).is_err());
            let val = scope.eval("'second'", &EvalFlags::default()).unwrap();
            assert_eq!(val.to_rust_string().as_deref(), Some("second"));
        });
    }

    #[test]
    fn test_module_autodetect() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope
                .eval("export const x = 1;", &EvalFlags::default().await_promise())
                .unwrap();
            assert_eq!(val.tag(), Tag::Module);
            assert_eq!(val.to_json(scope.ctx()).unwrap(), "undefined");
        });
    }

    #[test]
    fn test_compile_only_does_not_execute() {
        let engine = prepared();
        engine.with(|scope| {
            let flags = EvalFlags::default().compile_only().filename("side_effect");
            let val = scope.eval("globalThis.ran = true;", &flags).unwrap();
            assert_eq!(val.tag(), Tag::Module);
            let ran = scope.eval("typeof ran", &EvalFlags::default()).unwrap();
            assert_eq!(ran.to_rust_string().as_deref(), Some("undefined"));
        });
    }

    #[test]
    fn test_load_module_rejects_non_module() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope.load_module("1 + 1", "plain", None, false).unwrap();
            let err = scope.check(val).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Compile);
            assert!(err.to_string().contains("not a module: plain"), "{}", err);
        });
        assert!(!engine.has_module("plain"));
    }

    #[test]
    fn test_load_module_executes_by_default() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope
                .load_module("export const v = 3; globalThis.counter = (globalThis.counter ?? 0) + 1;", "m", None, false)
                .unwrap();
            let ns = val.module_namespace().unwrap();
            assert_eq!(ns.get::<_, i32>("v").unwrap(), 3);
            let counter = scope.eval("counter", &EvalFlags::default()).unwrap();
            assert_eq!(counter.as_i32(), Some(1));
        });
        assert!(engine.has_module("m"));
    }

    #[test]
    fn test_loaded_module_runs_once_across_imports() {
        let engine = prepared();
        engine.with(|scope| {
            let val = scope
                .load_module("export const v = 1; globalThis.count = (globalThis.count ?? 0) + 1;", "once", None, false)
                .unwrap();
            scope.check(val).unwrap();
        });
        for _ in 0..2 {
            let count = engine.with(|scope| {
                let val = scope
                    .eval("(async()=>{ await import('once'); return count; })()", &EvalFlags::default().await_promise())
                    .unwrap();
                scope.check(val).unwrap().as_i32()
            });
            assert_eq!(count, Some(1));
        }
    }

    #[test]
    fn test_load_module_load_only_defers_body() {
        let engine = prepared();
        engine.with(|scope| {
            scope
                .load_module("export const v = 1; globalThis.touched = true;", "lazy", None, true)
                .unwrap();
            let before = scope.eval("typeof touched", &EvalFlags::default()).unwrap();
            assert_eq!(before.to_rust_string().as_deref(), Some("undefined"));

            let after = scope
                .eval("(async()=>{ await import('lazy'); return touched; })()", &EvalFlags::default().await_promise())
                .unwrap();
            assert_eq!(after.as_bool(), Some(true));
        });
    }

    #[test]
    fn test_compile_then_load_bytecode() {
        let engine = prepared();
        let bytes = engine
            .compile("export function twice(x) { return x * 2; }", &EvalFlags::default().filename("twice"))
            .unwrap();
        assert!(!bytes.is_empty());
        // The scratch compile registers nothing
        assert!(!engine.has_module("twice"));

        engine.with(|scope| {
            let val = scope.load_module("", "twice", Some(&bytes), false).unwrap();
            let val = scope.check(val).unwrap();
            assert_eq!(val.tag(), Tag::Module);
            let n = scope
                .eval("(async()=>(await import('twice')).twice(21))()", &EvalFlags::default().await_promise())
                .unwrap();
            assert_eq!(n.as_i32(), Some(42));
        });
    }

    #[test]
    fn test_compile_syntax_error() {
        let engine = prepared();
        let err = engine.compile("export const = 1", &EvalFlags::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compile);
    }

    #[test]
    fn test_inject_environment_replaces_wholesale() {
        let engine = prepared();
        engine
            .inject_environment(&HashMap::from([("A".to_string(), "1".to_string())]))
            .unwrap();
        engine
            .inject_environment(&HashMap::from([("B".to_string(), "2".to_string())]))
            .unwrap();
        let json = engine.with(|scope| {
            let val = scope.eval("process.env", &EvalFlags::default()).unwrap();
            val.to_json(scope.ctx()).unwrap()
        });
        assert_eq!(json, r#"{"B":"2"}"#);
    }

    #[test]
    fn test_set_script_args() {
        let engine = prepared();
        let json = engine.with(|scope| {
            scope
                .set_script_args(&["argv0".to_string(), "file.js".to_string()])
                .unwrap();
            let val = scope.eval("scriptArgs", &EvalFlags::default()).unwrap();
            val.to_json(scope.ctx()).unwrap()
        });
        assert_eq!(json, r#"["argv0","file.js"]"#);
    }

    #[test]
    fn test_interrupt_handler_aborts() {
        let engine = prepared();
        engine.set_interrupt_handler(Some(Box::new(|| true)));
        engine.with(|scope| {
            let val = scope.eval("for (;;) {}", &EvalFlags::default()).unwrap();
            assert!(val.is_exception());
            let _ = scope.exception_to_error();
        });
        engine.set_interrupt_handler(None);
    }
}
