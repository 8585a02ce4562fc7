//! Isolated worker instances
//!
//! Each [`WorkerInstance`] owns a dedicated thread running its own engine
//! with its own heap and I/O buffers. The caller talks to it through named
//! entry points (`warmup`, `setEnv`, `eval`, `evalFile`) plus a string
//! config side channel that is cleared after every call, and gets back an
//! exit code with the captured output.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use super::program::SharedProgram;
use crate::config::EngineConfig;
use crate::dialect::Dialect;
use crate::error::{Error, ErrorKind, Failure, Result};
use crate::interpreter::{DEFAULT_ARGV0, Interpreter, Job, Source};
use crate::util::to_slash;

// =============================================================================
// Config keys and exit codes
// =============================================================================

pub const EVAL_DIR: &str = "eval.dir";
pub const EVAL_DIALECT: &str = "eval.dialect";
pub const EVAL_FILE_DIR: &str = "evalFile.dir";
pub const EVAL_FILE_ARGV0: &str = "evalFile.argv0";
pub const EVAL_FILE_SCRIPT_ARGS: &str = "evalFile.scriptArgs";
pub const EVAL_FILE_DIALECT: &str = "evalFile.dialect";

pub const EXIT_OK: i32 = 0;
/// The script threw or failed to compile
pub const EXIT_SCRIPT_ERROR: i32 = 1;
/// The engine or the request itself failed
pub const EXIT_FATAL: i32 = 2;
/// The worker panicked while handling the call
pub const EXIT_PANIC: i32 = 70;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Entry points and states
// =============================================================================

/// Named entry point of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    Warmup,
    SetEnv,
    Eval,
    EvalFile,
}

impl Entry {
    pub const fn as_str(self) -> &'static str {
        match self {
            Entry::Warmup => "warmup",
            Entry::SetEnv => "setEnv",
            Entry::Eval => "eval",
            Entry::EvalFile => "evalFile",
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warmup" => Ok(Entry::Warmup),
            "setEnv" => Ok(Entry::SetEnv),
            "eval" => Ok(Entry::Eval),
            "evalFile" => Ok(Entry::EvalFile),
            other => Err(Error::Configuration(format!("unknown entry point {:?}", other))),
        }
    }
}

/// Lifecycle of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Warmed,
    Idle,
    InUse,
    Closed,
}

impl InstanceState {
    /// Validate a state change
    ///
    /// `Uninitialized -> Warmed -> {Idle <-> InUse}`, and any state may close.
    pub fn transition(self, next: InstanceState) -> Result<InstanceState> {
        use InstanceState::*;
        match (self, next) {
            (Closed, _) => Err(Error::PoolClosed),
            (_, Closed)
            | (Uninitialized, Warmed)
            | (Warmed, Idle)
            | (Warmed, InUse)
            | (Idle, InUse)
            | (InUse, Idle) => Ok(next),
            (from, to) => Err(Error::Configuration(format!(
                "invalid instance transition {:?} -> {:?}",
                from, to
            ))),
        }
    }
}

// =============================================================================
// Call results
// =============================================================================

/// Raw result of one entry-point call
#[derive(Debug, Clone, Default)]
pub struct CallOutput {
    pub exit_code: i32,
    /// Entry-specific payload; the result JSON for `eval` and `evalFile`
    pub raw: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Error reported by the engine, if any
    pub failure: Option<Failure>,
}

impl CallOutput {
    fn ok(raw: Vec<u8>) -> Self {
        CallOutput {
            exit_code: EXIT_OK,
            raw,
            ..Default::default()
        }
    }

    fn fatal(err: &Error) -> Self {
        CallOutput {
            exit_code: EXIT_FATAL,
            failure: Some(err.to_failure()),
            ..Default::default()
        }
    }

    /// Interpret the exit code
    ///
    /// Script failures stay in the output so their streams can still be
    /// flushed. Host failures become errors, and a non-zero exit with no
    /// recorded failure becomes [`Error::SandboxExit`].
    pub fn into_sandbox_output(self) -> Result<SandboxOutput> {
        let CallOutput {
            exit_code,
            raw,
            stdout,
            stderr,
            failure,
        } = self;
        match failure {
            Some(failure) if exit_code != EXIT_SCRIPT_ERROR => Err(failure.into_error()),
            None if exit_code != EXIT_OK => {
                let stderr = String::from_utf8_lossy(&stderr).into_owned();
                error!(kind = %ErrorKind::SandboxExit, exit_code, "sandbox exited abnormally");
                Err(Error::SandboxExit {
                    code: exit_code,
                    stderr,
                })
            }
            failure => Ok(SandboxOutput {
                exit_code,
                raw,
                stdout,
                stderr,
                failure,
            }),
        }
    }
}

/// Result of a sandboxed evaluation
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub exit_code: i32,
    /// JSON of the result value
    pub raw: Vec<u8>,
    /// Everything the script printed, followed by the result JSON
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Script-level failure, already written to `stderr`
    pub failure: Option<Failure>,
}

impl SandboxOutput {
    /// The result JSON, or the script error
    pub fn result(&self) -> Result<String> {
        match &self.failure {
            Some(failure) => Err(failure.clone().into_error()),
            None => Ok(String::from_utf8_lossy(&self.raw).into_owned()),
        }
    }
}

// =============================================================================
// Worker thread
// =============================================================================

struct Request {
    entry: Entry,
    input: Vec<u8>,
    config: HashMap<String, String>,
    stdin: Vec<u8>,
    reply: mpsc::Sender<CallOutput>,
}

fn worker_main(
    program: Arc<SharedProgram>,
    config: EngineConfig,
    interrupt: Arc<AtomicBool>,
    requests: mpsc::Receiver<Request>,
) {
    let transpiler = program.transpiler().cloned();
    drop(program);
    let interpreter = Interpreter::build(&config, transpiler);
    if let Ok(interp) = &interpreter {
        let flag = interrupt.clone();
        interp
            .engine()
            .set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));
    }

    for request in requests {
        let Request {
            entry,
            input,
            config,
            stdin,
            reply,
        } = request;
        let output = match &interpreter {
            Ok(interp) => match catch_unwind(AssertUnwindSafe(|| handle(interp, entry, input, &config, stdin))) {
                Ok(output) => output,
                Err(_) => {
                    error!(entry = %entry, "worker panicked");
                    CallOutput {
                        exit_code: EXIT_PANIC,
                        ..Default::default()
                    }
                }
            },
            Err(err) => CallOutput::fatal(err),
        };
        // The caller may have given up after a timeout
        let _ = reply.send(output);
    }
}

fn handle(
    interp: &Interpreter,
    entry: Entry,
    input: Vec<u8>,
    config: &HashMap<String, String>,
    stdin: Vec<u8>,
) -> CallOutput {
    match entry {
        Entry::Warmup => match interp.warmup() {
            Ok(()) => CallOutput::ok(Vec::new()),
            Err(err) => CallOutput::fatal(&err),
        },
        Entry::SetEnv => {
            let env = serde_json::from_slice::<HashMap<String, String>>(&input)
                .map_err(|e| Error::Configuration(format!("setEnv: {}", e)))
                .and_then(|env| interp.engine().inject_environment(&env));
            match env {
                Ok(()) => CallOutput::ok(Vec::new()),
                Err(err) => CallOutput::fatal(&err),
            }
        }
        Entry::Eval | Entry::EvalFile => match build_job(entry, input, config, stdin) {
            Ok(job) => run_job(interp, job),
            Err(err) => CallOutput::fatal(&err),
        },
    }
}

fn build_job(entry: Entry, input: Vec<u8>, config: &HashMap<String, String>, stdin: Vec<u8>) -> Result<Job> {
    let (dir_key, dialect_key) = match entry {
        Entry::EvalFile => (EVAL_FILE_DIR, EVAL_FILE_DIALECT),
        _ => (EVAL_DIR, EVAL_DIALECT),
    };
    let dialect = match config.get(dialect_key).map(|s| s.trim()) {
        None | Some("") => Dialect::JavaScript,
        Some(code) => {
            let code = code
                .parse::<i64>()
                .map_err(|_| Error::Configuration(format!("{}: expected an integer, got {:?}", dialect_key, code)))?;
            Dialect::from_code(code)?
        }
    };
    let dir = config.get(dir_key).filter(|d| !d.is_empty()).map(PathBuf::from);
    let text = String::from_utf8(input).map_err(|e| Error::Configuration(format!("{}: {}", entry, e)))?;

    let source = match entry {
        Entry::EvalFile => {
            let script_args: Vec<String> = match config.get(EVAL_FILE_SCRIPT_ARGS) {
                Some(json) => serde_json::from_str(json)
                    .map_err(|e| Error::Configuration(format!("{}: {}", EVAL_FILE_SCRIPT_ARGS, e)))?,
                None => vec![text.clone()],
            };
            Source::File {
                path: PathBuf::from(&text),
                argv0: config
                    .get(EVAL_FILE_ARGV0)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_ARGV0.to_string()),
                // The first entry is the file itself
                args: script_args.into_iter().skip(1).collect(),
            }
        }
        _ => Source::Script(text),
    };

    Ok(Job {
        source,
        dialect,
        dir,
        env: None,
        stdin,
    })
}

fn run_job(interp: &Interpreter, job: Job) -> CallOutput {
    match interp.run(job) {
        Ok(outcome) => {
            let (exit_code, raw, failure) = match outcome.result {
                Ok(json) => (EXIT_OK, json.into_bytes(), None),
                Err(err) => (EXIT_SCRIPT_ERROR, Vec::new(), Some(err.to_failure())),
            };
            CallOutput {
                exit_code,
                raw,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                failure,
            }
        }
        Err(err) => CallOutput::fatal(&err),
    }
}

// =============================================================================
// Worker Instance
// =============================================================================

/// One isolated engine on its own thread
pub struct WorkerInstance {
    id: u64,
    state: InstanceState,
    config: HashMap<String, String>,
    stdin: Vec<u8>,
    requests: Option<mpsc::Sender<Request>>,
    thread: Option<JoinHandle<()>>,
    interrupt: Arc<AtomicBool>,
    poisoned: bool,
    broken: bool,
}

impl fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("poisoned", &self.poisoned)
            .field("broken", &self.broken)
            .finish()
    }
}

impl WorkerInstance {
    /// Start a new instance; it must be warmed up before use
    pub fn spawn(program: Arc<SharedProgram>, config: &EngineConfig) -> Result<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let interrupt = Arc::new(AtomicBool::new(false));

        let thread = {
            let config = config.clone();
            let interrupt = interrupt.clone();
            thread::Builder::new()
                .name(format!("taskjs-worker-{}", id))
                .spawn(move || worker_main(program, config, interrupt, rx))?
        };
        debug!(instance = id, "worker instance spawned");

        Ok(WorkerInstance {
            id,
            state: InstanceState::Uninitialized,
            config: HashMap::new(),
            stdin: Vec::new(),
            requests: Some(tx),
            thread: Some(thread),
            interrupt,
            poisoned: false,
            broken: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Move to `next`, rejecting invalid lifecycle changes
    pub fn transition(&mut self, next: InstanceState) -> Result<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// An instance abandoned after a timeout; never reused
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// An instance whose thread died or panicked
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Set a per-call config value; cleared after the next call
    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.insert(key.into(), value.into());
    }

    pub fn config(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Input the next call reads from standard input
    pub fn set_stdin(&mut self, stdin: Vec<u8>) {
        self.stdin = stdin;
    }

    /// Invoke an entry point and wait for it to finish
    pub fn call(&mut self, entry: Entry, input: &[u8]) -> Result<CallOutput> {
        self.call_inner(entry, input, None)
    }

    fn call_inner(&mut self, entry: Entry, input: &[u8], timeout: Option<Duration>) -> Result<CallOutput> {
        if self.state == InstanceState::Closed || self.poisoned || self.requests.is_none() {
            return Err(Error::PoolClosed);
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        let request = Request {
            entry,
            input: input.to_vec(),
            config: std::mem::take(&mut self.config),
            stdin: std::mem::take(&mut self.stdin),
            reply: reply_tx,
        };
        let sent = self
            .requests
            .as_ref()
            .is_some_and(|requests| requests.send(request).is_ok());
        if !sent {
            self.broken = true;
            return Err(Error::EngineInit(format!("worker {} is gone", self.id)));
        }

        let output = match timeout {
            None => reply_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(limit) => reply_rx.recv_timeout(limit),
        };
        match output {
            Ok(output) => {
                if output.exit_code == EXIT_PANIC {
                    self.broken = true;
                }
                Ok(output)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.interrupt.store(true, Ordering::Relaxed);
                self.poisoned = true;
                let limit = timeout.unwrap_or_default();
                error!(instance = self.id, entry = %entry, kind = %ErrorKind::Timeout, "evaluation timed out");
                Err(Error::Timeout(limit))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.broken = true;
                Err(Error::EngineInit(format!("worker {} exited", self.id)))
            }
        }
    }

    /// Load the dialect module and move to `Warmed`
    pub fn warmup(&mut self) -> Result<()> {
        let output = self.call(Entry::Warmup, &[])?;
        match output.failure {
            Some(failure) => Err(failure.into_error()),
            None => self.transition(InstanceState::Warmed),
        }
    }

    /// Replace `process.env` inside the instance
    pub fn set_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec(env).map_err(|e| Error::Configuration(e.to_string()))?;
        // setEnv carries no config or input; keep what the caller staged for eval
        let staged = std::mem::take(&mut self.config);
        let stdin = std::mem::take(&mut self.stdin);
        let output = self.call(Entry::SetEnv, &json);
        self.config = staged;
        self.stdin = stdin;
        output?.into_sandbox_output().map(drop)
    }

    /// Evaluate an inline script
    ///
    /// Runs in `eval.dir` when set, else in the process cwd.
    pub fn eval(&mut self, script: &str, dialect: Dialect) -> Result<SandboxOutput> {
        self.stage_eval(dialect)?;
        self.call(Entry::Eval, script.as_bytes())?.into_sandbox_output()
    }

    /// Evaluate an inline script, giving up after `timeout`
    ///
    /// A timed-out instance is interrupted and poisoned.
    pub fn eval_with_timeout(&mut self, script: &str, dialect: Dialect, timeout: Duration) -> Result<SandboxOutput> {
        self.stage_eval(dialect)?;
        self.call_inner(Entry::Eval, script.as_bytes(), Some(timeout))?
            .into_sandbox_output()
    }

    fn stage_eval(&mut self, dialect: Dialect) -> Result<()> {
        self.set_config(EVAL_DIALECT, dialect.code().to_string());
        if !self.config.contains_key(EVAL_DIR) {
            self.set_config(EVAL_DIR, host_cwd()?);
        }
        Ok(())
    }

    /// Evaluate a script file with `scriptArgs = [argv0, file, ...args]`
    pub fn eval_file(&mut self, file: &str, args: &[String], dialect: Dialect) -> Result<SandboxOutput> {
        self.set_config(EVAL_FILE_DIALECT, dialect.code().to_string());
        if !self.config.contains_key(EVAL_FILE_DIR) {
            self.set_config(EVAL_FILE_DIR, host_cwd()?);
        }
        if !self.config.contains_key(EVAL_FILE_ARGV0) {
            let argv0 = std::env::args().next().unwrap_or_else(|| DEFAULT_ARGV0.to_string());
            self.set_config(EVAL_FILE_ARGV0, to_slash(std::path::Path::new(&argv0)));
        }
        let mut script_args = Vec::with_capacity(args.len() + 1);
        script_args.push(file.to_string());
        script_args.extend(args.iter().cloned());
        let json = serde_json::to_string(&script_args).map_err(|e| Error::Configuration(e.to_string()))?;
        self.set_config(EVAL_FILE_SCRIPT_ARGS, json);

        self.call(Entry::EvalFile, file.as_bytes())?.into_sandbox_output()
    }

    /// Stop the worker thread
    ///
    /// Poisoned instances are detached instead of joined, since their
    /// script may still be unwinding from the interrupt.
    pub fn close(mut self) {
        self.state = InstanceState::Closed;
        self.requests = None;
        if let Some(thread) = self.thread.take() {
            if self.poisoned {
                drop(thread);
            } else if thread.join().is_err() {
                error!(instance = self.id, "worker thread panicked on shutdown");
            }
        }
        debug!(instance = self.id, "worker instance closed");
    }
}

fn host_cwd() -> Result<String> {
    Ok(to_slash(&std::env::current_dir()?))
}
