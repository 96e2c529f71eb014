//! Execution-context and virtual-machine interfaces.

use std::rc::Rc;

use crate::error::GuestResult;
use crate::object::{NativeFn, SettleFn};
use crate::value::{GuestFunctionRef, GuestObjectRef, GuestPromiseRef, GuestValue};

/// Name of the call-bridge invoke wrapper function. The bridge evaluates a
/// script defining a function with this name once per context; engines that
/// cannot evaluate arbitrary source (such as the mock) key on it.
pub const INVOKE_WRAPPER_NAME: &str = "__tonbridge_invoke";

/// Resolve/reject handles for a promise created on the native side.
///
/// Each handle consumes itself; settling twice is impossible by construction.
pub struct DeferredPromise {
    pub resolve: SettleFn,
    pub reject: SettleFn,
}

/// One script execution context.
///
/// Contexts are single-threaded: they are created on the thread that will
/// run all guest code and every method must be called from that thread.
pub trait ScriptContext {
    /// Evaluate script source, returning the completion value.
    fn eval(&self, source: &str, source_url: &str) -> GuestResult<GuestValue>;

    /// The global object of this context.
    fn global(&self) -> GuestObjectRef;

    /// Create an empty object.
    fn create_object(&self) -> GuestObjectRef;

    /// Expose a native function to guest code under the given name.
    fn create_function(&self, name: &str, body: NativeFn) -> GuestFunctionRef;

    /// Create a pending promise together with its settle handles.
    fn create_deferred(&self) -> GuestResult<(GuestValue, DeferredPromise)>;

    /// Create an already-resolved promise.
    fn resolved(&self, value: GuestValue) -> GuestPromiseRef;

    /// Create an already-rejected promise.
    fn rejected(&self, reason: GuestValue) -> GuestPromiseRef;
}

/// A pooled interpreter instance.
///
/// The virtual machine itself may be shared across threads; contexts created
/// from it are bound to the creating thread.
pub trait ScriptVm: Send + Sync + 'static {
    fn create_context(&self) -> GuestResult<Rc<dyn ScriptContext>>;
}
