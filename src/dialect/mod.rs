//! Dialect preprocessing
//!
//! Scripts written in a dialect are transpiled to JavaScript inside the same
//! engine before they run. The transpiler is an ordinary JavaScript bundle
//! that declares a top-level `compile(source, options)` function; it is
//! loaded as a module at most once per engine.

pub mod cache;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::context::{Engine, EvalFlags};
use crate::error::{Error, ErrorKind, Result};
use crate::util::escape_literal;

pub use cache::{CompiledModule, ModuleCache};

/// Source language of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    #[default]
    JavaScript,
    Civet,
}

impl Dialect {
    /// Integer code used on the sandbox config channel
    pub const fn code(self) -> i64 {
        match self {
            Dialect::JavaScript => 0,
            Dialect::Civet => 1,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Dialect::JavaScript),
            1 => Ok(Dialect::Civet),
            other => Err(Error::Configuration(format!("unknown dialect code {}", other))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Dialect::JavaScript => "javascript",
            Dialect::Civet => "civet",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "js" | "javascript" => Ok(Dialect::JavaScript),
            "civet" => Ok(Dialect::Civet),
            other => Err(Error::Configuration(format!("unknown dialect {:?}", other))),
        }
    }
}

/// Statement prepended to a bundle so its `compile` becomes importable
const EXPORT_COMPILE: &str = "export { compile };\n";

/// Civet's QuickJS build (`dist/quickjs.mjs`), compiled into the crate
#[cfg(feature = "bundled-civet")]
const CIVET_BUNDLE: Option<&str> = Some(include_str!("../../civet/quickjs.mjs"));
#[cfg(not(feature = "bundled-civet"))]
const CIVET_BUNDLE: Option<&str> = None;

static BUNDLED: Lazy<Option<Transpiler>> = Lazy::new(|| CIVET_BUNDLE.map(Transpiler::civet));

/// A transpiler bundle, loadable as a module
#[derive(Debug, Clone)]
pub struct Transpiler {
    name: String,
    source: Arc<str>,
    bytecode: Option<Arc<[u8]>>,
}

impl Transpiler {
    /// Module name the Civet bundle is registered under
    pub const CIVET: &'static str = "civet";

    /// Wrap a bundle that declares a top-level `compile` function
    pub fn new(name: impl Into<String>, bundle: &str) -> Self {
        let mut source = String::with_capacity(EXPORT_COMPILE.len() + bundle.len());
        source.push_str(EXPORT_COMPILE);
        source.push_str(bundle);
        Transpiler {
            name: name.into(),
            source: source.into(),
            bytecode: None,
        }
    }

    pub fn civet(bundle: &str) -> Self {
        Transpiler::new(Self::CIVET, bundle)
    }

    /// The Civet bundle compiled into the crate, if any
    pub fn bundled() -> Option<Self> {
        BUNDLED.clone()
    }

    /// Read the Civet bundle from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let bundle = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Transpiler::civet(&bundle))
    }

    /// Attach precompiled bytecode; loads then skip parsing
    pub fn with_bytecode(mut self, bytecode: Arc<[u8]>) -> Self {
        self.bytecode = Some(bytecode);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module source, including the export statement
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bytecode(&self) -> Option<&Arc<[u8]>> {
        self.bytecode.as_ref()
    }

    /// Cache key: module name plus a fingerprint of the source
    pub fn key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.source.hash(&mut hasher);
        format!("{}:{:016x}", self.name, hasher.finish())
    }

    /// Expression that transpiles `source` and settles to the JavaScript text
    pub fn expression(&self, source: &str) -> String {
        format!(
            "(async()=>(await import('{}')).compile('{}',{{js:true}}))()",
            escape_literal(&self.name),
            escape_literal(source)
        )
    }

    /// Load the bundle into `engine` unless it is already there
    ///
    /// Precompiled bytecode is tried first, then the process-wide cache,
    /// then plain source.
    pub fn ensure_loaded(&self, engine: &Engine) -> Result<()> {
        if engine.has_module(&self.name) {
            return Ok(());
        }

        let bytecode = match &self.bytecode {
            Some(bytes) => Some(bytes.clone()),
            None => self.cached_bytecode(engine),
        };

        engine.with(|scope| {
            let val = scope.load_module(
                &self.source,
                &self.name,
                bytecode.as_deref(),
                false,
            )?;
            scope.check(val).map(drop)
        })
    }

    fn cached_bytecode(&self, engine: &Engine) -> Option<Arc<[u8]>> {
        let compiled = ModuleCache::global().get_or_compile(&self.key(), &self.name, || {
            engine.compile(&self.source, &EvalFlags::default().filename(self.name.as_str()))
        });
        match compiled {
            Ok(module) => Some(module.bytecode),
            Err(err) if err.kind() == ErrorKind::Serialization => {
                warn!(module = %self.name, error = %err, "bytecode unavailable, loading from source");
                None
            }
            // Source load reports the same failure with the script's own message
            Err(err) => {
                debug!(module = %self.name, error = %err, "transpiler precompile failed");
                None
            }
        }
    }
}

/// Transpile dialect source to JavaScript in `engine`
///
/// Load and compile failures come back as script-level errors; the
/// untranspiled source is never evaluated.
pub fn transpile(engine: &Engine, transpiler: &Transpiler, source: &str) -> Result<String> {
    transpiler.ensure_loaded(engine)?;
    let expression = transpiler.expression(source);
    engine.with(|scope| {
        let val = scope.eval(&expression, &EvalFlags::default().await_promise())?;
        let val = scope.check(val)?;
        val.to_rust_string().ok_or_else(|| {
            Error::Script(format!(
                "{} transpiler returned {} instead of a string",
                transpiler.name(),
                val.tag()
            ))
        })
    })
}
