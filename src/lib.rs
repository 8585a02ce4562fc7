//! taskjs - embedded JavaScript for task runners
//!
//! Runs inline snippets and script files in-process on QuickJS, without
//! shelling out to an interpreter. One blocking call evaluates the script,
//! drains the job queue and hands back the JSON of the result.
//!
//! # Features
//! - Per-call environment (`process.env`) and virtual working directory
//! - `print`, `console`, `scriptArgs` and importable `os`/`std` modules
//! - Civet dialect through a bundled transpiler, loaded once per engine
//! - Pooled, thread-isolated instances for concurrent reuse
//!
//! # Example
//! ```no_run
//! use taskjs::{EngineConfig, EvalOptions, evaluate_script};
//!
//! let mut out = Vec::new();
//! let json = evaluate_script(
//!     &EngineConfig::default(),
//!     EvalOptions::new("print('hello'); return 1 + 2").stdout(&mut out),
//! )
//! .unwrap();
//! assert_eq!(json, "3");
//! assert_eq!(out, b"hello\n3\n");
//! ```

// Core modules
pub mod context;
pub mod error;
pub mod value;

// Host environment
pub mod builtins;
pub mod config;

// Dialects and execution
pub mod dialect;
pub mod interpreter;
pub mod pool;

// Utilities
pub mod util;

// Re-export main types
pub use config::EngineConfig;
pub use context::{Engine, EvalFlags, Scope};
pub use dialect::{Dialect, Transpiler};
pub use error::{Error, ErrorKind, Result};
pub use interpreter::{EvalFileOptions, EvalOptions, Interpreter, evaluate_file, evaluate_script};
pub use pool::{Pool, SandboxOutput, WorkerInstance};
pub use value::{Tag, Val};
