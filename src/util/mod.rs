//! Utility functions
//!
//! Helpers for building the small JavaScript snippets the host wraps around
//! user code, and for resolving paths against a virtual working directory.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters that would end or corrupt a single-quoted JavaScript literal
static LITERAL_SPECIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\\\\'\n\r\u{2028}\u{2029}]").expect("valid literal regex"));

/// Leading tokens that make a source a module
///
/// Skips an optional shebang, whitespace and comments, then looks for
/// `import` not followed by `(` or `.`, `export`, or `await`.
static MODULE_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A(?:#![^\n]*)?(?:\s+|//[^\n]*|/\*.*?\*/)*(?:import\b\s*[^\s(.]|export\b|await\b)")
        .expect("valid module regex")
});

/// Like [`MODULE_SHAPE`] but only `import` and `export` count
static MODULE_DECLARATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A(?:#![^\n]*)?(?:\s+|//[^\n]*|/\*.*?\*/)*(?:import\b\s*[^\s(.]|export\b)")
        .expect("valid declaration regex")
});

/// Escape a string for embedding in a single-quoted JavaScript literal
///
/// `'` + `escape_literal(s)` + `'` evaluates to exactly `s`.
pub fn escape_literal(s: &str) -> String {
    LITERAL_SPECIALS
        .replace_all(s, |caps: &regex::Captures<'_>| match &caps[0] {
            "\\" => "\\\\",
            "'" => "\\'",
            "\n" => "\\n",
            "\r" => "\\r",
            "\u{2028}" => "\\u2028",
            _ => "\\u2029",
        })
        .into_owned()
}

/// Check whether source text has the shape of an ES module
pub fn detect_module(source: &str) -> bool {
    MODULE_SHAPE.is_match(source)
}

/// Check whether source opens with an `import` or `export` declaration
///
/// A leading `await` is not enough here: script bodies are run inside an
/// async function, where `await` is already legal.
pub fn declares_module(source: &str) -> bool {
    MODULE_DECLARATION.is_match(source)
}

/// Snippet that moves the engine's working directory to `dir`
pub fn chdir_prefix(dir: &str) -> String {
    format!("(await import('os')).chdir('{}');", escape_literal(dir))
}

/// Wrap a script body in an async arrow so top-level `await` works in
/// classic scripts
pub fn wrap_async(prefix: &str, body: &str) -> String {
    format!("(async()=>{{{}{}\n}})()", prefix, body)
}

/// Resolve `path` against `base` without touching the filesystem
///
/// `.` components are dropped and `..` pops one component; `..` at the
/// root stays at the root.
pub fn resolve_path(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Render a path with forward slashes
pub fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
