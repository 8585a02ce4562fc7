//! Error types
//!
//! Errors fall into two groups. Engine-level failures (allocation,
//! configuration, serialization) abort the current call and leave the
//! caller's error stream untouched. Script-level failures (syntax errors,
//! thrown values, rejected promises, abnormal sandbox exits) are written to
//! the error stream and returned, and the engine stays usable.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by the engine, the facade and the pool
#[derive(Debug, Error)]
pub enum Error {
    /// The caller passed options that cannot be evaluated
    #[error("invalid options: {0}")]
    Configuration(String),

    /// Runtime, context or memory-limit allocation failed
    #[error("failed to initialize engine: {0}")]
    EngineInit(String),

    /// Source could not be parsed, or a module target was not a module
    #[error("{0}")]
    Compile(String),

    /// A thrown value or rejected promise
    #[error("{0}")]
    Script(String),

    /// A sandboxed instance terminated with a non-zero exit code
    #[error("sandbox exited with code {code}")]
    SandboxExit { code: i32, stderr: String },

    /// Bytecode could not be written
    #[error("failed to serialize bytecode: {0}")]
    Serialization(String),

    /// A script file or transpiler bundle could not be read
    #[error("failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Caller-supplied stream failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure reported by the binding
    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    /// A sandboxed evaluation did not finish in time
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// The pool or instance was closed
    #[error("pool is closed")]
    PoolClosed,
}

/// Classification of [`Error`], stable across thread boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    EngineInit,
    Compile,
    Script,
    SandboxExit,
    Serialization,
    ReadFile,
    Io,
    Engine,
    Timeout,
    PoolClosed,
}

impl ErrorKind {
    /// Short name used as a structured logging field
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::EngineInit => "engine_init",
            ErrorKind::Compile => "compile",
            ErrorKind::Script => "script",
            ErrorKind::SandboxExit => "sandbox_exit",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ReadFile => "read_file",
            ErrorKind::Io => "io",
            ErrorKind::Engine => "engine",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PoolClosed => "pool_closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::EngineInit(_) => ErrorKind::EngineInit,
            Error::Compile(_) => ErrorKind::Compile,
            Error::Script(_) => ErrorKind::Script,
            Error::SandboxExit { .. } => ErrorKind::SandboxExit,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::ReadFile { .. } => ErrorKind::ReadFile,
            Error::Io(_) => ErrorKind::Io,
            Error::Engine(_) => ErrorKind::Engine,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::PoolClosed => ErrorKind::PoolClosed,
        }
    }

    /// Whether the error came from the evaluated program rather than the host
    ///
    /// Script-level errors are reported on the caller's error stream and
    /// leave the engine usable.
    pub fn is_script_level(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Compile | ErrorKind::Script | ErrorKind::SandboxExit
        )
    }

    /// Flatten into a [`Failure`] that can be sent to another thread
    pub fn to_failure(&self) -> Failure {
        let mut failure = Failure {
            kind: self.kind(),
            message: self.to_string(),
            path: None,
            timeout: None,
        };
        match self {
            Error::SandboxExit { stderr, .. } => failure.message = stderr.clone(),
            Error::ReadFile { path, source } => {
                failure.message = source.to_string();
                failure.path = Some(path.clone());
            }
            Error::Timeout(limit) => failure.timeout = Some(*limit),
            _ => {}
        }
        failure
    }
}

/// Error payload exchanged with pool worker threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// File that could not be read, for [`ErrorKind::ReadFile`]
    pub path: Option<PathBuf>,
    /// Elapsed limit, for [`ErrorKind::Timeout`]
    pub timeout: Option<Duration>,
}

impl Failure {
    /// Rebuild an [`Error`] on the receiving side
    ///
    /// Kinds that wrap foreign error values are carried as their message;
    /// binding errors come back as [`Error::EngineInit`].
    pub fn into_error(self) -> Error {
        let Failure {
            kind,
            message,
            path,
            timeout,
        } = self;
        match kind {
            ErrorKind::Configuration => Error::Configuration(message),
            ErrorKind::EngineInit => Error::EngineInit(message),
            ErrorKind::Compile => Error::Compile(message),
            ErrorKind::Script => Error::Script(message),
            ErrorKind::SandboxExit => Error::SandboxExit {
                code: 1,
                stderr: message,
            },
            ErrorKind::Serialization => Error::Serialization(message),
            ErrorKind::ReadFile => Error::ReadFile {
                path: path.unwrap_or_default(),
                source: std::io::Error::other(message),
            },
            ErrorKind::Io => Error::Io(std::io::Error::other(message)),
            ErrorKind::Engine => Error::EngineInit(message),
            ErrorKind::Timeout => Error::Timeout(timeout.unwrap_or_default()),
            ErrorKind::PoolClosed => Error::PoolClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_level_kinds() {
        assert!(Error::Compile("SyntaxError: x".into()).is_script_level());
        assert!(Error::Script("Error: boom".into()).is_script_level());
        assert!(
            Error::SandboxExit {
                code: 3,
                stderr: String::new()
            }
            .is_script_level()
        );
        assert!(!Error::EngineInit("oom".into()).is_script_level());
        assert!(!Error::Configuration("bad".into()).is_script_level());
        assert!(!Error::PoolClosed.is_script_level());
    }

    #[test]
    fn test_failure_round_trip_keeps_kind() {
        let err = Error::Compile("SyntaxError: unexpected token".into());
        let back = err.to_failure().into_error();
        assert_eq!(back.kind(), ErrorKind::Compile);
        assert_eq!(back.to_string(), "SyntaxError: unexpected token");
    }

    #[test]
    fn test_failure_round_trip_read_file_and_timeout() {
        let err = Error::ReadFile {
            path: PathBuf::from("/work/task.js"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let back = err.to_failure().into_error();
        assert_eq!(back.kind(), ErrorKind::ReadFile);
        assert_eq!(back.to_string(), err.to_string());

        let err = Error::Timeout(Duration::from_millis(250));
        let back = err.to_failure().into_error();
        assert_eq!(back.kind(), ErrorKind::Timeout);
        assert_eq!(back.to_string(), err.to_string());
    }

    #[test]
    fn test_read_file_display() {
        let err = Error::ReadFile {
            path: PathBuf::from("missing.js"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to read missing.js: not found");
        assert_eq!(err.kind().as_str(), "read_file");
    }
}
