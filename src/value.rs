//! Tagged view over engine values
//!
//! Engine values are opaque. Code that needs a native representation first
//! asks for the value's [`Tag`], then calls the extraction method that
//! matches it. Extraction never guesses: asking a string for its integer
//! payload returns `None`.
//!
//! # Tag numbering
//! Tags reuse the QuickJS numbering so they read the same in logs:
//! - Non-negative tags: immediates (int, bool, null, undefined, exception, float64)
//! - Negative tags: heap references (object, module, string)

use std::fmt;

use rquickjs::module::Evaluated;
use rquickjs::{Ctx, Module, Type, Value};

/// Classification of an engine value
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// 32-bit signed integer fast path
    Int = 0,
    Bool = 1,
    Null = 2,
    Undefined = 3,
    /// Marker for a pending exception
    Exception = 6,
    /// Any other number: doubles, out-of-range integers, bigints
    Float64 = 7,
    /// Objects, arrays, functions, promises, symbols and error objects
    Object = -1,
    Module = -3,
    String = -7,
}

impl Tag {
    /// Classify a value without consuming it
    pub fn of(value: &Value<'_>) -> Tag {
        match value.type_of() {
            Type::Int => Tag::Int,
            Type::Bool => Tag::Bool,
            Type::Null => Tag::Null,
            Type::Undefined | Type::Uninitialized => Tag::Undefined,
            Type::Float | Type::BigInt => Tag::Float64,
            Type::String => Tag::String,
            Type::Module => Tag::Module,
            _ => Tag::Object,
        }
    }

    /// Get the raw tag number
    #[inline]
    pub const fn raw(self) -> i8 {
        self as i8
    }

    /// Check if this tag is numeric (int or float64)
    #[inline]
    pub const fn is_number(self) -> bool {
        matches!(self, Tag::Int | Tag::Float64)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Int => "int",
            Tag::Bool => "bool",
            Tag::Null => "null",
            Tag::Undefined => "undefined",
            Tag::Exception => "exception",
            Tag::Float64 => "float64",
            Tag::Object => "object",
            Tag::Module => "module",
            Tag::String => "string",
        };
        f.write_str(name)
    }
}

enum Repr<'js> {
    Value(Value<'js>),
    Declared(Module<'js>),
    Evaluated(Module<'js, Evaluated>),
    Exception,
}

/// Opaque handle to a value produced by an engine
///
/// The `'js` lifetime ties the handle to the engine scope that produced it,
/// so a `Val` can never outlive its engine.
pub struct Val<'js> {
    repr: Repr<'js>,
}

impl<'js> Val<'js> {
    pub(crate) fn from_value(value: Value<'js>) -> Self {
        Val {
            repr: Repr::Value(value),
        }
    }

    pub(crate) fn declared(module: Module<'js>) -> Self {
        Val {
            repr: Repr::Declared(module),
        }
    }

    pub(crate) fn evaluated(module: Module<'js, Evaluated>) -> Self {
        Val {
            repr: Repr::Evaluated(module),
        }
    }

    /// The exception marker. The thrown value itself stays pending in the
    /// engine until it is taken with `Scope::exception_to_error`.
    pub(crate) fn exception() -> Self {
        Val {
            repr: Repr::Exception,
        }
    }

    /// Get the tag of this value
    pub fn tag(&self) -> Tag {
        match &self.repr {
            Repr::Value(value) => Tag::of(value),
            Repr::Declared(_) | Repr::Evaluated(_) => Tag::Module,
            Repr::Exception => Tag::Exception,
        }
    }

    /// Check if this is the exception marker
    #[inline]
    pub fn is_exception(&self) -> bool {
        matches!(self.repr, Repr::Exception)
    }

    /// Get integer value, returns None unless the tag is `Int`
    pub fn as_i32(&self) -> Option<i32> {
        match &self.repr {
            Repr::Value(value) if self.tag() == Tag::Int => value.as_int(),
            _ => None,
        }
    }

    /// Get numeric value, returns None unless the tag is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match &self.repr {
            Repr::Value(value) if self.tag().is_number() => value.as_number(),
            _ => None,
        }
    }

    /// Get boolean value, returns None unless the tag is `Bool`
    pub fn as_bool(&self) -> Option<bool> {
        match &self.repr {
            Repr::Value(value) if self.tag() == Tag::Bool => value.as_bool(),
            _ => None,
        }
    }

    /// Copy the string payload out, returns None unless the tag is `String`
    pub fn to_rust_string(&self) -> Option<String> {
        match &self.repr {
            Repr::Value(value) => value.as_string().and_then(|s| s.to_string().ok()),
            _ => None,
        }
    }

    /// Borrow the underlying value, if this is a plain value
    pub fn value(&self) -> Option<&Value<'js>> {
        match &self.repr {
            Repr::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Take the underlying value, if this is a plain value
    pub fn into_value(self) -> Option<Value<'js>> {
        match self.repr {
            Repr::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Get the namespace object of an evaluated module
    pub fn module_namespace(&self) -> Option<rquickjs::Object<'js>> {
        match &self.repr {
            Repr::Evaluated(module) => module.namespace().ok(),
            _ => None,
        }
    }

    /// Serialize JSON-style
    ///
    /// Modules and the exception marker serialize as `undefined`.
    pub fn to_json(&self, ctx: &Ctx<'js>) -> rquickjs::Result<String> {
        match &self.repr {
            Repr::Value(value) => to_json(ctx, value),
            _ => Ok(UNDEFINED.to_string()),
        }
    }
}

impl fmt::Debug for Val<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Int => write!(f, "Int({})", self.as_i32().unwrap_or_default()),
            Tag::Bool => write!(f, "Bool({})", self.as_bool().unwrap_or_default()),
            Tag::Float64 => write!(f, "Float64({})", self.as_f64().unwrap_or(f64::NAN)),
            Tag::String => write!(f, "String({:?})", self.to_rust_string().unwrap_or_default()),
            tag => write!(f, "{}", tag),
        }
    }
}

/// Text used for values JSON cannot represent
pub const UNDEFINED: &str = "undefined";

/// JSON-style serialization of an engine value
///
/// `JSON.stringify` yields nothing for `undefined`, functions and symbols;
/// those serialize as `undefined`.
pub fn to_json<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<String> {
    match ctx.json_stringify(value.clone())? {
        Some(json) => json.to_string(),
        None => Ok(UNDEFINED.to_string()),
    }
}

/// Render a single value the way `print` does
///
/// Strings are written verbatim, integers in decimal, booleans and the
/// nullish values by name, everything else as JSON.
pub fn display_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<String> {
    match Tag::of(value) {
        Tag::String => match value.as_string() {
            Some(s) => s.to_string(),
            None => Ok(String::new()),
        },
        Tag::Int => Ok(value.as_int().unwrap_or_default().to_string()),
        Tag::Bool => Ok(value.as_bool().unwrap_or_default().to_string()),
        Tag::Null => Ok("null".to_string()),
        Tag::Undefined => Ok(UNDEFINED.to_string()),
        _ => to_json(ctx, value),
    }
}
