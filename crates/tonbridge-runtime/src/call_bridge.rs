//! Dynamic call bridge: dotted-path invocation of guest functions with
//! uniform promise wrapping.
//!
//! Every call goes through a small wrapper script evaluated once per context
//! (memoized): it invokes the target with the given `this` and arguments,
//! folds synchronous returns and throws into a settled promise, and passes
//! already-pending promises through unchanged. The native caller therefore
//! always observes exactly one settlement, whatever shape the guest function
//! has.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value as Json;
use tonbridge_core::{GuestFunctionRef, GuestObjectRef, GuestValue, ScriptContext};

use crate::error::{HostError, HostResult};
use crate::marshal;

/// Wrapper script evaluated once per context. The function name must stay in
/// sync with `tonbridge_core::INVOKE_WRAPPER_NAME`.
const INVOKE_WRAPPER_SOURCE: &str = r#"
(function __tonbridge_invoke(fn, thisArg, args) {
    try {
        var result = fn.apply(thisArg, args);
        if (result && typeof result.then === 'function') {
            return result;
        }
        return Promise.resolve(result);
    } catch (e) {
        return Promise.reject(e);
    }
})
"#;

/// A dotted path into the guest object graph, resolved against a root
/// object. Resolution is lazy and re-walks the path on every call, because
/// guest objects are mutable and may be replaced between calls.
#[derive(Clone)]
pub struct GuestFunctionReference {
    root: GuestObjectRef,
    path: Vec<String>,
}

impl GuestFunctionReference {
    /// An empty path is invalid and fails immediately.
    pub fn new(root: GuestObjectRef, path: &str) -> HostResult<Self> {
        let segments: Vec<String> = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(HostError::EmptyPath);
        }
        Ok(Self {
            root,
            path: segments,
        })
    }

    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// Walk the path, returning the target function and the object it was
    /// fetched from (the `this` binding for the call).
    pub fn resolve(&self) -> HostResult<(GuestValue, GuestFunctionRef)> {
        let mut this = GuestValue::Undefined;
        let mut current = GuestValue::Object(self.root.clone());

        for segment in &self.path {
            let object = current.as_object().ok_or_else(|| HostError::PathResolution {
                path: self.path(),
                segment: segment.clone(),
            })?;
            let next = object
                .get_member(segment)
                .ok_or_else(|| HostError::PathResolution {
                    path: self.path(),
                    segment: segment.clone(),
                })?;
            this = current;
            current = next;
        }

        match current {
            GuestValue::Function(function) => Ok((this, function)),
            other => Err(HostError::NotCallable {
                path: self.path(),
                found: other.type_name(),
            }),
        }
    }
}

/// One native argument to a guest call. Scalars pass through as-is; anything
/// structured goes through the marshalling layer. There is no implicit
/// structural coercion beyond these variants.
#[derive(Debug, Clone)]
pub enum CallArg {
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    Json(Json),
}

impl CallArg {
    /// Encode a serializable domain value as an argument.
    pub fn encode<T: Serialize>(value: &T) -> HostResult<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| HostError::internal(format!("argument not serializable: {e}")))?;
        Ok(Self::Json(json))
    }

    fn to_guest(&self, ctx: &dyn ScriptContext) -> GuestValue {
        match self {
            CallArg::Bool(b) => GuestValue::Bool(*b),
            CallArg::Int(n) => GuestValue::Number(*n as f64),
            CallArg::Number(n) => GuestValue::Number(*n),
            CallArg::Str(s) => GuestValue::String(s.clone()),
            CallArg::Json(json) => marshal::encode_json(ctx, json),
        }
    }
}

impl From<bool> for CallArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CallArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for CallArg {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for CallArg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Json> for CallArg {
    fn from(value: Json) -> Self {
        Self::Json(value)
    }
}

/// A prepared guest call: resolved function, `this` binding, and normalized
/// arguments. Produces exactly one settlement once begun.
pub struct PendingInvocation {
    this: GuestValue,
    function: GuestFunctionRef,
    args: Vec<GuestValue>,
}

/// Continuation resumed with the single settlement of a guest call.
pub type SettleCallback = Box<dyn FnOnce(HostResult<GuestValue>)>;

/// Per-context call bridge.
pub struct CallBridge {
    ctx: Rc<dyn ScriptContext>,
    wrapper: RefCell<Option<GuestFunctionRef>>,
}

impl CallBridge {
    pub fn new(ctx: Rc<dyn ScriptContext>) -> Self {
        Self {
            ctx,
            wrapper: RefCell::new(None),
        }
    }

    /// Reference a dotted path against the context's global object.
    pub fn reference(&self, path: &str) -> HostResult<GuestFunctionReference> {
        GuestFunctionReference::new(self.ctx.global(), path)
    }

    /// Resolve the reference and normalize arguments. Path-resolution and
    /// not-callable failures are reported here, before any guest code runs.
    pub fn prepare(
        &self,
        reference: &GuestFunctionReference,
        args: &[CallArg],
    ) -> HostResult<PendingInvocation> {
        let (this, function) = reference.resolve()?;
        let args = args.iter().map(|arg| arg.to_guest(&*self.ctx)).collect();
        Ok(PendingInvocation {
            this,
            function,
            args,
        })
    }

    /// Run the invocation. `on_settled` is resumed exactly once, with the
    /// resolution value or the rejection converted to a [`HostError`].
    pub fn begin(&self, invocation: PendingInvocation, on_settled: SettleCallback) {
        let wrapper = match self.wrapper() {
            Ok(wrapper) => wrapper,
            Err(err) => return on_settled(Err(err)),
        };

        let outcome = wrapper.call(
            GuestValue::Undefined,
            &[
                GuestValue::Function(invocation.function),
                invocation.this,
                GuestValue::Array(invocation.args),
            ],
        );

        let promise = match outcome {
            Ok(GuestValue::Promise(promise)) => promise,
            Ok(other) => {
                return on_settled(Err(HostError::internal(format!(
                    "invoke wrapper returned {}, expected a promise",
                    other.type_name()
                ))));
            }
            Err(err) => return on_settled(Err(err.into())),
        };

        // Both observers share one continuation slot; whichever fires first
        // takes it, the other finds it empty.
        let slot: Rc<Cell<Option<SettleCallback>>> = Rc::new(Cell::new(Some(on_settled)));
        let resolve_slot = slot.clone();
        promise.then(
            Box::new(move |value| {
                if let Some(resume) = resolve_slot.take() {
                    resume(Ok(value));
                }
            }),
            Box::new(move |reason| {
                if let Some(resume) = slot.take() {
                    resume(Err(HostError::guest(reason.error_message())));
                }
            }),
        );
    }

    /// Convenience: reference + prepare + begin. Preparation failures are
    /// delivered through `on_settled` so the caller always gets exactly one
    /// settlement.
    pub fn invoke(&self, path: &str, args: &[CallArg], on_settled: SettleCallback) {
        let prepared = self
            .reference(path)
            .and_then(|reference| self.prepare(&reference, args));
        match prepared {
            Ok(invocation) => self.begin(invocation, on_settled),
            Err(err) => on_settled(Err(err)),
        }
    }

    fn wrapper(&self) -> HostResult<GuestFunctionRef> {
        if let Some(wrapper) = self.wrapper.borrow().as_ref() {
            return Ok(wrapper.clone());
        }
        let value = self.ctx.eval(INVOKE_WRAPPER_SOURCE, "<tonbridge_invoke>")?;
        let GuestValue::Function(function) = value else {
            return Err(HostError::internal(
                "invoke wrapper did not evaluate to a function",
            ));
        };
        *self.wrapper.borrow_mut() = Some(function.clone());
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tonbridge_core::mock::{MockContext, MockFunction, MockObject, MockPromise};
    use tonbridge_core::{GuestError, GuestObject, INVOKE_WRAPPER_NAME};

    fn settlements() -> (
        Rc<RefCell<Vec<HostResult<GuestValue>>>>,
        impl Fn() -> SettleCallback,
    ) {
        let log: Rc<RefCell<Vec<HostResult<GuestValue>>>> = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move || {
                let log = log.clone();
                Box::new(move |result| log.borrow_mut().push(result)) as SettleCallback
            }
        };
        (log, make)
    }

    fn bridge_with_wallet() -> (CallBridge, Rc<MockObject>) {
        let ctx = MockContext::new();
        let wallet = MockObject::new();
        ctx.global()
            .set_member("wallet", GuestValue::Object(wallet.clone()));
        (CallBridge::new(ctx), wallet)
    }

    #[test]
    fn wrapper_source_defines_the_shared_name() {
        assert!(INVOKE_WRAPPER_SOURCE.contains(INVOKE_WRAPPER_NAME));
    }

    #[test]
    fn sync_function_settles_exactly_once() {
        let (bridge, wallet) = bridge_with_wallet();
        wallet.set_member(
            "version",
            GuestValue::Function(MockFunction::new(|_this, _args| {
                Ok(GuestValue::String("2.1.0".into()))
            })),
        );

        let (log, settle) = settlements();
        bridge.invoke("wallet.version", &[], settle());

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].as_ref().unwrap().as_str(), Some("2.1.0"));
    }

    #[test]
    fn throwing_function_rejects_with_its_message() {
        let (bridge, wallet) = bridge_with_wallet();
        wallet.set_member(
            "explode",
            GuestValue::Function(MockFunction::new(|_this, _args| {
                Err(GuestError::runtime("kaboom"))
            })),
        );

        let (log, settle) = settlements();
        bridge.invoke("wallet.explode", &[], settle());

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        match log[0].as_ref().unwrap_err() {
            HostError::Guest { message } => assert_eq!(message, "kaboom"),
            other => panic!("expected guest error, got {other}"),
        }
    }

    #[test]
    fn pending_promise_passes_through_and_settles_later() {
        let (bridge, wallet) = bridge_with_wallet();
        let pending = MockPromise::pending();
        {
            let pending = pending.clone();
            wallet.set_member(
                "slow",
                GuestValue::Function(MockFunction::new(move |_this, _args| {
                    Ok(GuestValue::Promise(pending.clone()))
                })),
            );
        }

        let (log, settle) = settlements();
        bridge.invoke("wallet.slow", &[], settle());
        assert!(log.borrow().is_empty());

        pending.resolve(GuestValue::Number(7.0));
        // A second settlement attempt must not resume the continuation again.
        pending.reject(GuestValue::String("late".into()));

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].as_ref().unwrap().as_f64(), Some(7.0));
    }

    #[test]
    fn path_miss_reports_before_any_guest_code_runs() {
        let (bridge, _wallet) = bridge_with_wallet();
        let (log, settle) = settlements();
        bridge.invoke("wallet.missing.deep", &[], settle());

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        match log[0].as_ref().unwrap_err() {
            HostError::PathResolution { path, segment } => {
                assert_eq!(path, "wallet.missing.deep");
                assert_eq!(segment, "missing");
            }
            other => panic!("expected path resolution error, got {other}"),
        }
    }

    #[test]
    fn non_callable_target_is_a_type_error() {
        let (bridge, wallet) = bridge_with_wallet();
        wallet.set_member("address", GuestValue::String("EQabc".into()));

        let reference = bridge.reference("wallet.address").unwrap();
        match bridge.prepare(&reference, &[]) {
            Err(HostError::NotCallable { path, found }) => {
                assert_eq!(path, "wallet.address");
                assert_eq!(found, "string");
            }
            other => panic!("expected not-callable, got {:?}", other.err()),
        }
    }

    #[test]
    fn empty_path_is_invalid() {
        let (bridge, _wallet) = bridge_with_wallet();
        assert!(matches!(bridge.reference(""), Err(HostError::EmptyPath)));
        assert!(matches!(bridge.reference("."), Err(HostError::EmptyPath)));
    }

    #[test]
    fn resolution_rewalks_the_path_each_call() {
        let (bridge, wallet) = bridge_with_wallet();
        wallet.set_member(
            "f",
            GuestValue::Function(MockFunction::new(|_this, _args| {
                Ok(GuestValue::String("old".into()))
            })),
        );
        let reference = bridge.reference("wallet.f").unwrap();

        let (log, settle) = settlements();
        let invocation = bridge.prepare(&reference, &[]).unwrap();
        bridge.begin(invocation, settle());

        // Replace the member; the same reference must see the new function.
        wallet.set_member(
            "f",
            GuestValue::Function(MockFunction::new(|_this, _args| {
                Ok(GuestValue::String("new".into()))
            })),
        );
        let invocation = bridge.prepare(&reference, &[]).unwrap();
        bridge.begin(invocation, settle());

        let log = log.borrow();
        assert_eq!(log[0].as_ref().unwrap().as_str(), Some("old"));
        assert_eq!(log[1].as_ref().unwrap().as_str(), Some("new"));
    }

    #[test]
    fn arguments_are_normalized() {
        let (bridge, wallet) = bridge_with_wallet();
        let seen: Rc<RefCell<Vec<GuestValue>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            wallet.set_member(
                "record",
                GuestValue::Function(MockFunction::new(move |_this, args| {
                    seen.borrow_mut().extend(args.iter().cloned());
                    Ok(GuestValue::Undefined)
                })),
            );
        }

        let (_log, settle) = settlements();
        bridge.invoke(
            "wallet.record",
            &[
                CallArg::from("hello"),
                CallArg::from(true),
                CallArg::from(41i64),
                CallArg::Json(serde_json::json!({"nested": [1, 2]})),
            ],
            settle(),
        );

        let seen = seen.borrow();
        assert_eq!(seen[0].as_str(), Some("hello"));
        assert_eq!(seen[1].as_bool(), Some(true));
        assert_eq!(seen[2].as_f64(), Some(41.0));
        assert!(seen[3].as_object().is_some());
    }

    #[test]
    fn this_binding_is_the_parent_object() {
        let (bridge, wallet) = bridge_with_wallet();
        let wallet_id = wallet.identity();
        let observed = Rc::new(Cell::new(0usize));
        {
            let observed = observed.clone();
            wallet.set_member(
                "whoami",
                GuestValue::Function(MockFunction::new(move |this, _args| {
                    if let Some(object) = this.as_object() {
                        observed.set(object.identity());
                    }
                    Ok(GuestValue::Undefined)
                })),
            );
        }

        let (_log, settle) = settlements();
        bridge.invoke("wallet.whoami", &[], settle());
        assert_eq!(observed.get(), wallet_id);
    }
}
