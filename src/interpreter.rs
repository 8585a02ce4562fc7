//! Execution facade
//!
//! [`Interpreter`] turns an [`EvalOptions`] or [`EvalFileOptions`] into one
//! blocking evaluation: inject the environment, move the virtual working
//! directory, transpile if needed, run with the job queue drained, and write
//! the JSON result (or the error message) to the caller's streams.
//!
//! Script-level failures are written to the error stream and returned.
//! Host-level failures return early and leave the error stream untouched.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::EngineConfig;
use crate::context::{DEFAULT_MODULE_NAME, Engine, EvalFlags};
use crate::dialect::{self, Dialect, Transpiler};
use crate::error::{Error, Result};
use crate::util::{chdir_prefix, declares_module, resolve_path, to_slash, wrap_async};

/// Program name reported as `scriptArgs[0]` unless overridden
pub const DEFAULT_ARGV0: &str = "taskjs";

/// Options for evaluating an inline script
///
/// Classic scripts run inside an async function body: use `return` to
/// produce a result and `await` freely. Module-shaped sources run as
/// modules and produce `undefined`.
#[derive(Default)]
pub struct EvalOptions<'a> {
    pub script: String,
    pub dialect: Dialect,
    pub dir: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub stdin: Option<&'a mut dyn Read>,
    pub stdout: Option<&'a mut dyn Write>,
    pub stderr: Option<&'a mut dyn Write>,
}

impl<'a> EvalOptions<'a> {
    pub fn new(script: impl Into<String>) -> Self {
        EvalOptions {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdin(mut self, stdin: &'a mut dyn Read) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout(mut self, stdout: &'a mut dyn Write) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn stderr(mut self, stderr: &'a mut dyn Write) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub(crate) fn split(self) -> Result<(Job, Streams<'a>)> {
        let EvalOptions {
            script,
            dialect,
            dir,
            env,
            stdin,
            stdout,
            stderr,
        } = self;
        let job = Job {
            source: Source::Script(script),
            dialect,
            dir,
            env,
            stdin: read_input(stdin)?,
        };
        Ok((job, Streams { stdout, stderr }))
    }
}

/// Options for evaluating a script file
#[derive(Default)]
pub struct EvalFileOptions<'a> {
    /// Script path; relative paths resolve against `dir`, else the process cwd
    pub file: PathBuf,
    /// Reported as `scriptArgs[0]`
    pub argv0: Option<String>,
    /// Appended to `scriptArgs` after the file name
    pub args: Vec<String>,
    pub dialect: Dialect,
    pub dir: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub stdin: Option<&'a mut dyn Read>,
    pub stdout: Option<&'a mut dyn Write>,
    pub stderr: Option<&'a mut dyn Write>,
}

impl<'a> EvalFileOptions<'a> {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        EvalFileOptions {
            file: file.into(),
            ..Default::default()
        }
    }

    pub fn argv0(mut self, argv0: impl Into<String>) -> Self {
        self.argv0 = Some(argv0.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdin(mut self, stdin: &'a mut dyn Read) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout(mut self, stdout: &'a mut dyn Write) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn stderr(mut self, stderr: &'a mut dyn Write) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub(crate) fn split(self) -> Result<(Job, Streams<'a>)> {
        let EvalFileOptions {
            file,
            argv0,
            args,
            dialect,
            dir,
            env,
            stdin,
            stdout,
            stderr,
        } = self;
        let job = Job {
            source: Source::File {
                path: file,
                argv0: argv0.unwrap_or_else(|| DEFAULT_ARGV0.to_string()),
                args,
            },
            dialect,
            dir,
            env,
            stdin: read_input(stdin)?,
        };
        Ok((job, Streams { stdout, stderr }))
    }
}

fn read_input(stdin: Option<&mut dyn Read>) -> Result<Vec<u8>> {
    let mut input = Vec::new();
    if let Some(reader) = stdin {
        reader.read_to_end(&mut input)?;
    }
    Ok(input)
}

/// What to run
#[derive(Debug, Clone)]
pub(crate) enum Source {
    Script(String),
    File {
        path: PathBuf,
        argv0: String,
        args: Vec<String>,
    },
}

/// Owned evaluation request, free of caller borrows so it can cross threads
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub source: Source,
    pub dialect: Dialect,
    pub dir: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub stdin: Vec<u8>,
}

/// Caller output streams
pub(crate) struct Streams<'a> {
    stdout: Option<&'a mut dyn Write>,
    stderr: Option<&'a mut dyn Write>,
}

impl Streams<'_> {
    pub(crate) fn flush(&mut self, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        if let Some(out) = self.stdout.as_mut() {
            out.write_all(stdout)?;
            out.flush()?;
        }
        if let Some(err) = self.stderr.as_mut() {
            err.write_all(stderr)?;
            err.flush()?;
        }
        Ok(())
    }
}

/// Result of a completed run
///
/// `result` holds the JSON of the value or the script-level error; the
/// buffers hold everything the run wrote, including that JSON or message.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub result: Result<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Evaluates scripts on one long-lived engine
pub struct Interpreter {
    engine: Engine,
    transpiler: Option<Transpiler>,
}

impl Interpreter {
    /// Build an interpreter; the Civet bundle comes from the configuration
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Interpreter::build(config, config.transpiler()?)
    }

    pub fn with_transpiler(config: &EngineConfig, transpiler: Transpiler) -> Result<Self> {
        Interpreter::build(config, Some(transpiler))
    }

    pub(crate) fn build(config: &EngineConfig, transpiler: Option<Transpiler>) -> Result<Self> {
        Ok(Interpreter {
            engine: Engine::new(config)?,
            transpiler,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn transpiler(&self) -> Option<&Transpiler> {
        self.transpiler.as_ref()
    }

    /// Evaluate an inline script and return the JSON of its result
    pub fn eval(&self, options: EvalOptions<'_>) -> Result<String> {
        let (job, mut streams) = options.split()?;
        self.finish(job, &mut streams)
    }

    /// Evaluate a script file and return the JSON of its result
    pub fn eval_file(&self, options: EvalFileOptions<'_>) -> Result<String> {
        let (job, mut streams) = options.split()?;
        self.finish(job, &mut streams)
    }

    fn finish(&self, job: Job, streams: &mut Streams<'_>) -> Result<String> {
        let outcome = self.run(job)?;
        streams.flush(&outcome.stdout, &outcome.stderr)?;
        outcome.result
    }

    /// Load the dialect module ahead of the first script
    pub fn warmup(&self) -> Result<()> {
        match &self.transpiler {
            Some(transpiler) => transpiler.ensure_loaded(&self.engine),
            None => Ok(()),
        }
    }

    /// Run a job to completion
    ///
    /// `Err` means the engine itself failed; script failures are reported
    /// inside the [`Outcome`].
    pub(crate) fn run(&self, job: Job) -> Result<Outcome> {
        let engine = &self.engine;
        let host_cwd = std::env::current_dir()?;

        engine.reset_io();
        engine.set_cwd(host_cwd.clone());
        engine.set_stdin(job.stdin);
        if let Some(env) = &job.env {
            engine.inject_environment(env)?;
        }

        let dir = match &job.dir {
            Some(dir) => {
                let dir = resolve_path(&host_cwd, dir);
                if !dir.is_dir() {
                    return Err(Error::Configuration(format!(
                        "dir {} is not a directory",
                        dir.display()
                    )));
                }
                Some(dir)
            }
            None => None,
        };

        let (code, name) = match job.source {
            Source::Script(script) => {
                // Arguments from an earlier file run must not leak into this one
                engine.with(|scope| scope.set_script_args(&[]))?;
                (script, DEFAULT_MODULE_NAME.to_string())
            }
            Source::File { path, argv0, args } => {
                let path = resolve_path(dir.as_deref().unwrap_or(&host_cwd), &path);
                let code = std::fs::read_to_string(&path).map_err(|source| Error::ReadFile {
                    path: path.clone(),
                    source,
                })?;
                let name = to_slash(&path);
                let mut script_args = Vec::with_capacity(args.len() + 2);
                script_args.push(to_slash(Path::new(&argv0)));
                script_args.push(name.clone());
                script_args.extend(args);
                engine.with(|scope| scope.set_script_args(&script_args))?;
                (strip_shebang(code), name)
            }
        };

        debug!(dialect = %job.dialect, dir = ?dir, module = %name, "evaluating");
        let result = self.evaluate(&code, &name, job.dialect, dir.as_deref());

        let result = match result {
            Ok(json) => {
                engine.write_stdout(format!("{}\n", json).as_bytes());
                Ok(json)
            }
            Err(err) if err.is_script_level() => {
                debug!(kind = %err.kind(), "script failed");
                engine.write_stderr(format!("{}\n", err).as_bytes());
                Err(err)
            }
            Err(err) => return Err(err),
        };

        Ok(Outcome {
            result,
            stdout: engine.take_stdout(),
            stderr: engine.take_stderr(),
        })
    }

    fn evaluate(&self, code: &str, name: &str, dialect: Dialect, dir: Option<&Path>) -> Result<String> {
        let code = match dialect {
            Dialect::JavaScript => code.to_string(),
            Dialect::Civet => {
                let transpiler = self.transpiler.as_ref().ok_or_else(|| {
                    Error::Configuration("civet dialect requested but no transpiler is configured".into())
                })?;
                dialect::transpile(&self.engine, transpiler, code)?
            }
        };

        let prefix = dir.map(|d| chdir_prefix(&to_slash(d))).unwrap_or_default();
        let (source, flags) = if declares_module(&code) {
            (
                format!("{}{}", prefix, code),
                EvalFlags::default().module().filename(name),
            )
        } else {
            (wrap_async(&prefix, &code), EvalFlags::default())
        };

        self.engine.with(|scope| {
            let val = scope.eval(&source, &flags.await_promise())?;
            let val = scope.check(val)?;
            Ok(val.to_json(scope.ctx())?)
        })
    }
}

/// Turn a leading `#!` line into a comment so line numbers stay put
fn strip_shebang(code: String) -> String {
    match code.strip_prefix("#!") {
        Some(rest) => format!("//{}", rest),
        None => code,
    }
}

/// Evaluate an inline script on a fresh interpreter
pub fn evaluate_script(config: &EngineConfig, options: EvalOptions<'_>) -> Result<String> {
    Interpreter::new(config)?.eval(options)
}

/// Evaluate a script file on a fresh interpreter
pub fn evaluate_file(config: &EngineConfig, options: EvalFileOptions<'_>) -> Result<String> {
    Interpreter::new(config)?.eval_file(options)
}
