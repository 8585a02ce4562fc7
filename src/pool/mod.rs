//! Sandboxed pool
//!
//! A [`Pool`] hands out warmed [`WorkerInstance`]s built from one shared,
//! precompiled program. Instances are isolated from each other and from the
//! caller: each runs on its own thread with its own engine, heap and I/O
//! buffers. `get`/`put` are safe to call from many threads at once.

pub mod program;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::EngineConfig;
use crate::dialect::Transpiler;
use crate::error::{Error, Result};
use crate::interpreter::{EvalFileOptions, EvalOptions, Job, Source, Streams};
use crate::util::to_slash;

pub use program::SharedProgram;
pub use worker::{CallOutput, Entry, InstanceState, SandboxOutput, WorkerInstance};

struct PoolShared {
    program: Arc<SharedProgram>,
    config: EngineConfig,
    idle: Mutex<Vec<WorkerInstance>>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

/// Pool of isolated worker instances
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool; the Civet bundle comes from the configuration
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let transpiler = config.transpiler()?;
        Pool::build(config, transpiler.as_ref())
    }

    pub fn with_transpiler(config: &EngineConfig, transpiler: &Transpiler) -> Result<Self> {
        Pool::build(config, Some(transpiler))
    }

    fn build(config: &EngineConfig, transpiler: Option<&Transpiler>) -> Result<Self> {
        let program = program::setup(transpiler, config.memory_limit)?;
        Ok(Pool {
            shared: Arc::new(PoolShared {
                program,
                config: config.clone(),
                idle: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Take an idle instance, or start and warm up a new one
    pub fn get(&self) -> Result<WorkerInstance> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let idle = shared.idle.lock().pop();
        let mut instance = match idle {
            Some(instance) => instance,
            None => {
                let mut instance = WorkerInstance::spawn(shared.program.clone(), &shared.config)?;
                if let Err(err) = instance.warmup() {
                    instance.close();
                    return Err(err);
                }
                shared.created.fetch_add(1, Ordering::Relaxed);
                instance
            }
        };
        instance.transition(InstanceState::InUse)?;
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(instance)
    }

    /// Return an instance
    ///
    /// Poisoned or broken instances, instances beyond `pool_max_idle` and
    /// anything returned after `close` are shut down instead.
    pub fn put(&self, mut instance: WorkerInstance) {
        let shared = &self.shared;
        shared.outstanding.fetch_sub(1, Ordering::AcqRel);

        let reusable = !shared.closed.load(Ordering::Acquire)
            && !instance.is_poisoned()
            && !instance.is_broken()
            && instance.transition(InstanceState::Idle).is_ok();
        if reusable {
            let mut idle = shared.idle.lock();
            if idle.len() < shared.config.pool_max_idle {
                idle.push(instance);
                return;
            }
        }
        debug!(instance = instance.id(), "closing instance on put");
        instance.close();
    }

    /// Instances started over the pool's lifetime
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }

    /// Instances waiting in the idle set
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn program(&self) -> &Arc<SharedProgram> {
        &self.shared.program
    }

    /// Evaluate an inline script on a pooled instance
    pub fn eval(&self, options: EvalOptions<'_>) -> Result<String> {
        let (job, mut streams) = options.split()?;
        self.dispatch(job, &mut streams, None)
    }

    /// Evaluate an inline script, abandoning the instance after `timeout`
    pub fn eval_with_timeout(&self, options: EvalOptions<'_>, timeout: Duration) -> Result<String> {
        let (job, mut streams) = options.split()?;
        self.dispatch(job, &mut streams, Some(timeout))
    }

    /// Evaluate a script file on a pooled instance
    pub fn eval_file(&self, options: EvalFileOptions<'_>) -> Result<String> {
        let (job, mut streams) = options.split()?;
        self.dispatch(job, &mut streams, None)
    }

    fn dispatch(&self, job: Job, streams: &mut Streams<'_>, timeout: Option<Duration>) -> Result<String> {
        let mut instance = self.get()?;
        let output = run_on(&mut instance, job, timeout);
        self.put(instance);

        let output = output?;
        streams.flush(&output.stdout, &output.stderr)?;
        output.result()
    }

    /// Close idle instances and release the shared program
    ///
    /// Fails if instances are still checked out; those are closed when they
    /// come back through [`Pool::put`].
    pub fn close(self) -> Result<()> {
        let shared = &self.shared;
        shared.closed.store(true, Ordering::Release);

        let idle: Vec<WorkerInstance> = shared.idle.lock().drain(..).collect();
        for instance in idle {
            instance.close();
        }
        program::release(&shared.program);

        match shared.outstanding.load(Ordering::Acquire) {
            0 => Ok(()),
            n => Err(Error::Configuration(format!(
                "pool closed with {} instance(s) still checked out",
                n
            ))),
        }
    }
}

fn run_on(instance: &mut WorkerInstance, job: Job, timeout: Option<Duration>) -> Result<SandboxOutput> {
    let Job {
        source,
        dialect,
        dir,
        env,
        stdin,
    } = job;

    if let Some(env) = &env {
        instance.set_env(env)?;
    }
    instance.set_stdin(stdin);

    match source {
        Source::Script(script) => {
            if let Some(dir) = &dir {
                instance.set_config(worker::EVAL_DIR, to_slash(dir));
            }
            match timeout {
                Some(limit) => instance.eval_with_timeout(&script, dialect, limit),
                None => instance.eval(&script, dialect),
            }
        }
        Source::File { path, argv0, args } => {
            if let Some(dir) = &dir {
                instance.set_config(worker::EVAL_FILE_DIR, to_slash(dir));
            }
            instance.set_config(worker::EVAL_FILE_ARGV0, argv0);
            instance.eval_file(&to_slash(&path), &args, dialect)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dialect::Dialect;
    use crate::dialect::testing::pipe_transpiler;
    use crate::error::ErrorKind;

    fn config(max_idle: usize) -> EngineConfig {
        EngineConfig {
            memory_limit: 64 * 1024 * 1024,
            pool_max_idle: max_idle,
            ..Default::default()
        }
    }

    #[test]
    fn test_sequential_reuse_keeps_one_instance() {
        let pool = Pool::new(&config(4)).unwrap();
        for i in 0..5 {
            let result = pool.eval(EvalOptions::new(format!("return {}", i))).unwrap();
            assert_eq!(result, i.to_string());
        }
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.idle(), 1);
        pool.close().unwrap();
    }

    #[test]
    fn test_concurrent_instances_are_distinct() {
        let pool = Pool::new(&config(8)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.get().unwrap())
            })
            .collect();
        let instances: Vec<WorkerInstance> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ids: HashSet<u64> = instances.iter().map(|i| i.id()).collect();
        assert_eq!(ids.len(), 4);
        assert!(instances.iter().all(|i| i.state() == InstanceState::InUse));

        for instance in instances {
            pool.put(instance);
        }
        assert_eq!(pool.idle(), 4);
        pool.close().unwrap();
    }

    #[test]
    fn test_concurrent_evals_are_isolated() {
        let pool = Pool::new(&config(4)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut out = Vec::new();
                    let script = format!("globalThis.mine = {}; await null; print(mine); return mine", i);
                    let result = pool.eval(EvalOptions::new(script).stdout(&mut out)).unwrap();
                    (i, result, String::from_utf8(out).unwrap())
                })
            })
            .collect();
        for handle in handles {
            let (i, result, out) = handle.join().unwrap();
            assert_eq!(result, i.to_string());
            assert_eq!(out, format!("{}\n{}\n", i, i));
        }
        pool.close().unwrap();
    }

    #[test]
    fn test_put_beyond_max_idle_closes() {
        let pool = Pool::new(&config(1)).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.idle(), 1);
        pool.close().unwrap();
    }

    #[test]
    fn test_transpiler_loaded_once_per_instance() {
        let pool = Pool::with_transpiler(&config(1), &pipe_transpiler()).unwrap();
        for _ in 0..3 {
            let result = pool
                .eval(EvalOptions::new("return 9 |> Math.sqrt").dialect(Dialect::Civet))
                .unwrap();
            assert_eq!(result, "3");
        }
        let loads = pool.eval(EvalOptions::new("return globalThis.pipeLoads")).unwrap();
        assert_eq!(loads, "1");
        assert_eq!(pool.created(), 1);
        pool.close().unwrap();
    }

    #[test]
    fn test_pool_env_and_streams() {
        let pool = Pool::new(&config(1)).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = pool.eval(
            EvalOptions::new("console.error('warned'); throw new Error(process.env.MSG)")
                .env(HashMap::from([("MSG".to_string(), "from env".to_string())]))
                .stdout(&mut out)
                .stderr(&mut err),
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Script);
        assert_eq!(String::from_utf8(err).unwrap(), "warned\nError: from env\n");
        assert_eq!(out, Vec::<u8>::new());

        // The failed instance went back to the idle set
        assert_eq!(pool.idle(), 1);
        pool.close().unwrap();
    }

    #[test]
    fn test_pool_eval_file_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("task.js"), "return [scriptArgs[0], scriptArgs.slice(2)]").unwrap();
        let pool = Pool::new(&config(1)).unwrap();
        let result = pool
            .eval_file(
                EvalFileOptions::new("task.js")
                    .dir(dir.path())
                    .argv0("taskjs")
                    .args(["one"]),
            )
            .unwrap();
        assert_eq!(result, r#"["taskjs",["one"]]"#);
        pool.close().unwrap();
    }

    #[test]
    fn test_pool_eval_file_missing_matches_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(&config(1)).unwrap();
        let pooled = pool
            .eval_file(EvalFileOptions::new("nope.js").dir(dir.path()))
            .unwrap_err();
        let direct = crate::interpreter::Interpreter::new(&config(1))
            .unwrap()
            .eval_file(EvalFileOptions::new("nope.js").dir(dir.path()))
            .unwrap_err();
        assert_eq!(pooled.kind(), ErrorKind::ReadFile);
        assert_eq!(pooled.kind(), direct.kind());
        assert_eq!(pooled.to_string(), direct.to_string());
        pool.close().unwrap();
    }

    #[test]
    fn test_timeout_never_reuses_instance() {
        let pool = Pool::new(&config(2)).unwrap();
        let err = pool
            .eval_with_timeout(EvalOptions::new("for (;;) {}"), Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(pool.idle(), 0);

        assert_eq!(pool.eval(EvalOptions::new("return 'fresh'")).unwrap(), "\"fresh\"");
        assert_eq!(pool.created(), 2);
        pool.close().unwrap();
    }

    #[test]
    fn test_close_with_outstanding_instance() {
        let pool = Pool::new(&config(2)).unwrap();
        let handle = pool.clone();
        let instance = pool.get().unwrap();
        assert!(pool.close().is_err());

        // Closed pools refuse new work and shut returned instances down
        assert_eq!(handle.get().unwrap_err().kind(), ErrorKind::PoolClosed);
        handle.put(instance);
        assert_eq!(handle.idle(), 0);
    }
}
