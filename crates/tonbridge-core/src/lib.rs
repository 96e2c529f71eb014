//! tonbridge-core - the engine-facing abstraction of the tonbridge host.
//!
//! The bridge layer in `tonbridge-runtime` never talks to a concrete script
//! interpreter directly. It talks to the capability traits defined here:
//!
//! - [`GuestValue`] models a script value (undefined, null, scalars, arrays,
//!   objects, functions, promises). Object/function/promise variants are
//!   `Rc`-backed trait objects, so guest values never leave the thread that
//!   owns the interpreter.
//! - [`GuestObject`], [`GuestFunction`] and [`GuestPromise`] are the three
//!   capabilities the bridge needs from an engine: member access, invocation,
//!   and settlement observation.
//! - [`ScriptContext`] is one execution context (global object, eval, value
//!   construction, deferred promises). [`ScriptVm`] is the pooled virtual
//!   machine that contexts are created from.
//!
//! A provided interpreter is adapted to these traits by the embedder; the
//! `mock` module (behind the `test-util` feature) ships a scripted in-memory
//! engine so the bridge layer can be tested without one.

pub mod context;
pub mod error;
pub mod object;
pub mod value;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use context::{DeferredPromise, INVOKE_WRAPPER_NAME, ScriptContext, ScriptVm};
pub use error::{GuestError, GuestErrorKind, GuestResult};
pub use object::{GuestFunction, GuestObject, GuestPromise, NativeFn, SettleFn};
pub use value::{GuestFunctionRef, GuestObjectRef, GuestPromiseRef, GuestValue};
