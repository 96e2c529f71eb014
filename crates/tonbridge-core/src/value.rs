//! The guest value model.

use std::fmt;
use std::rc::Rc;

use crate::object::{GuestFunction, GuestObject, GuestPromise};

pub type GuestObjectRef = Rc<dyn GuestObject>;
pub type GuestFunctionRef = Rc<dyn GuestFunction>;
pub type GuestPromiseRef = Rc<dyn GuestPromise>;

/// A script value as seen from native code.
///
/// Scalars are carried by value; objects, functions and promises are shared
/// references into the engine. `GuestValue` is deliberately `!Send`: guest
/// values must only be touched on the thread that owns their context.
#[derive(Clone)]
pub enum GuestValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<GuestValue>),
    Object(GuestObjectRef),
    Function(GuestFunctionRef),
    Promise(GuestPromiseRef),
}

impl GuestValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, GuestValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, GuestValue::Null)
    }

    /// Null or undefined.
    pub fn is_nullish(&self) -> bool {
        matches!(self, GuestValue::Undefined | GuestValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            GuestValue::Undefined => "undefined",
            GuestValue::Null => "null",
            GuestValue::Bool(_) => "boolean",
            GuestValue::Number(_) => "number",
            GuestValue::String(_) => "string",
            GuestValue::Bytes(_) => "bytes",
            GuestValue::Array(_) => "array",
            GuestValue::Object(_) => "object",
            GuestValue::Function(_) => "function",
            GuestValue::Promise(_) => "promise",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GuestValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GuestValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GuestValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&GuestObjectRef> {
        match self {
            GuestValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&GuestFunctionRef> {
        match self {
            GuestValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&GuestPromiseRef> {
        match self {
            GuestValue::Promise(p) => Some(p),
            _ => None,
        }
    }

    /// Best-effort message string for a value used as an error, for
    /// surfacing guest rejections to native callers.
    pub fn error_message(&self) -> String {
        match self {
            GuestValue::String(s) => s.clone(),
            GuestValue::Object(obj) => match obj.get_member("message") {
                Some(GuestValue::String(s)) => s,
                _ => "guest error".to_string(),
            },
            GuestValue::Number(n) => n.to_string(),
            GuestValue::Bool(b) => b.to_string(),
            other => other.type_name().to_string(),
        }
    }
}

impl fmt::Debug for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestValue::Undefined => write!(f, "undefined"),
            GuestValue::Null => write!(f, "null"),
            GuestValue::Bool(b) => write!(f, "{b}"),
            GuestValue::Number(n) => write!(f, "{n}"),
            GuestValue::String(s) => write!(f, "{s:?}"),
            GuestValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            GuestValue::Array(items) => f.debug_list().entries(items).finish(),
            GuestValue::Object(_) => write!(f, "<object>"),
            GuestValue::Function(_) => write!(f, "<function>"),
            GuestValue::Promise(_) => write!(f, "<promise>"),
        }
    }
}
