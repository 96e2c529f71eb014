//! Scripted in-memory engine for exercising the bridge layer in tests.
//!
//! This is not an interpreter. Objects are member maps, functions are native
//! closures, and promises are settle-once cells. The only source the mock
//! can "evaluate" is the call-bridge invoke wrapper, which it recognizes by
//! [`INVOKE_WRAPPER_NAME`] and materializes as a native function with the
//! same semantics a real engine would give the wrapper script.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::{DeferredPromise, INVOKE_WRAPPER_NAME, ScriptContext, ScriptVm};
use crate::error::{GuestError, GuestResult};
use crate::object::{GuestFunction, GuestObject, GuestPromise, NativeFn, SettleFn};
use crate::value::{GuestFunctionRef, GuestObjectRef, GuestPromiseRef, GuestValue};

/// Plain object backed by an ordered member list.
#[derive(Default)]
pub struct MockObject {
    members: RefCell<Vec<(String, GuestValue)>>,
}

impl MockObject {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl GuestObject for MockObject {
    fn get_member(&self, name: &str) -> Option<GuestValue> {
        self.members
            .borrow()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn set_member(&self, name: &str, value: GuestValue) {
        let mut members = self.members.borrow_mut();
        if let Some(entry) = members.iter_mut().find(|(key, _)| key == name) {
            entry.1 = value;
        } else {
            members.push((name.to_string(), value));
        }
    }

    fn member_names(&self) -> Vec<String> {
        self.members
            .borrow()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Function backed by a native closure.
pub struct MockFunction {
    #[allow(clippy::type_complexity)]
    body: Box<dyn Fn(GuestValue, &[GuestValue]) -> GuestResult<GuestValue>>,
}

impl MockFunction {
    pub fn new(
        body: impl Fn(GuestValue, &[GuestValue]) -> GuestResult<GuestValue> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            body: Box::new(body),
        })
    }
}

impl GuestFunction for MockFunction {
    fn call(&self, this: GuestValue, args: &[GuestValue]) -> GuestResult<GuestValue> {
        (self.body)(this, args)
    }
}

enum PromiseState {
    Pending(Vec<(SettleFn, SettleFn)>),
    Resolved(GuestValue),
    Rejected(GuestValue),
}

/// Settle-once promise cell. Settlement is replayed to `then` registrations
/// that arrive after the promise settled.
pub struct MockPromise {
    state: RefCell<PromiseState>,
}

impl MockPromise {
    pub fn pending() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Pending(Vec::new())),
        })
    }

    pub fn resolved(value: GuestValue) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Resolved(value)),
        })
    }

    pub fn rejected(reason: GuestValue) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Rejected(reason)),
        })
    }

    pub fn resolve(&self, value: GuestValue) {
        let waiters = self.settle(PromiseState::Resolved(value.clone()));
        for (on_resolved, _) in waiters {
            on_resolved(value.clone());
        }
    }

    pub fn reject(&self, reason: GuestValue) {
        let waiters = self.settle(PromiseState::Rejected(reason.clone()));
        for (_, on_rejected) in waiters {
            on_rejected(reason.clone());
        }
    }

    fn settle(&self, next: PromiseState) -> Vec<(SettleFn, SettleFn)> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            PromiseState::Pending(waiters) => {
                let waiters = std::mem::take(waiters);
                *state = next;
                waiters
            }
            // Second settlement attempts are ignored.
            _ => Vec::new(),
        }
    }
}

impl GuestPromise for MockPromise {
    fn then(&self, on_resolved: SettleFn, on_rejected: SettleFn) {
        let settled = match &*self.state.borrow() {
            PromiseState::Pending(_) => None,
            PromiseState::Resolved(value) => Some((true, value.clone())),
            PromiseState::Rejected(reason) => Some((false, reason.clone())),
        };

        match settled {
            Some((true, value)) => on_resolved(value),
            Some((false, reason)) => on_rejected(reason),
            None => {
                if let PromiseState::Pending(waiters) = &mut *self.state.borrow_mut() {
                    waiters.push((on_resolved, on_rejected));
                }
            }
        }
    }
}

/// One mock execution context.
pub struct MockContext {
    global: Rc<MockObject>,
}

impl MockContext {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            global: MockObject::new(),
        })
    }
}

impl ScriptContext for MockContext {
    fn eval(&self, source: &str, source_url: &str) -> GuestResult<GuestValue> {
        if source.contains(INVOKE_WRAPPER_NAME) {
            return Ok(GuestValue::Function(invoke_wrapper()));
        }
        if source.trim().is_empty() {
            return Ok(GuestValue::Undefined);
        }
        Err(GuestError::runtime(format!(
            "mock engine cannot evaluate {source_url}"
        )))
    }

    fn global(&self) -> GuestObjectRef {
        self.global.clone()
    }

    fn create_object(&self) -> GuestObjectRef {
        MockObject::new()
    }

    fn create_function(&self, _name: &str, body: NativeFn) -> GuestFunctionRef {
        MockFunction::new(move |_this, args| body(args))
    }

    fn create_deferred(&self) -> GuestResult<(GuestValue, DeferredPromise)> {
        let promise = MockPromise::pending();
        let resolve = {
            let promise = promise.clone();
            Box::new(move |value| promise.resolve(value)) as SettleFn
        };
        let reject = {
            let promise = promise.clone();
            Box::new(move |reason| promise.reject(reason)) as SettleFn
        };
        Ok((
            GuestValue::Promise(promise),
            DeferredPromise { resolve, reject },
        ))
    }

    fn resolved(&self, value: GuestValue) -> GuestPromiseRef {
        MockPromise::resolved(value)
    }

    fn rejected(&self, reason: GuestValue) -> GuestPromiseRef {
        MockPromise::rejected(reason)
    }
}

/// Native rendition of the invoke wrapper script: call the target with the
/// given `this` and argument array, fold synchronous results and throws into
/// a settled promise, pass pending promises through untouched.
fn invoke_wrapper() -> GuestFunctionRef {
    MockFunction::new(|_this, args| {
        let func = match args.first() {
            Some(GuestValue::Function(f)) => f.clone(),
            other => {
                return Err(GuestError::type_error(format!(
                    "invoke wrapper target is {}, not a function",
                    other.map(GuestValue::type_name).unwrap_or("missing")
                )));
            }
        };
        let this = args.get(1).cloned().unwrap_or(GuestValue::Undefined);
        let call_args = match args.get(2) {
            Some(GuestValue::Array(items)) => items.clone(),
            _ => Vec::new(),
        };

        match func.call(this, &call_args) {
            Ok(GuestValue::Promise(p)) => Ok(GuestValue::Promise(p)),
            Ok(value) => Ok(GuestValue::Promise(MockPromise::resolved(value))),
            Err(err) => {
                let reason = MockObject::new();
                reason.set_member("name", GuestValue::String("Error".into()));
                reason.set_member("message", GuestValue::String(err.message.clone()));
                Ok(GuestValue::Promise(MockPromise::rejected(
                    GuestValue::Object(reason),
                )))
            }
        }
    })
}

/// Mock virtual machine; counts the contexts it hands out.
#[derive(Default)]
pub struct MockVm {
    contexts: AtomicUsize,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

impl ScriptVm for MockVm {
    fn create_context(&self) -> GuestResult<Rc<dyn ScriptContext>> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_settles_once_and_replays() {
        let promise = MockPromise::pending();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let record = |label: &'static str| {
            let hits = hits.clone();
            Box::new(move |_value| hits.borrow_mut().push(label)) as SettleFn
        };
        promise.then(record("early-ok"), record("early-err"));

        promise.resolve(GuestValue::Number(1.0));
        promise.reject(GuestValue::String("late".into()));
        promise.then(record("late-ok"), record("late-err"));

        assert_eq!(*hits.borrow(), vec!["early-ok", "late-ok"]);
    }

    #[test]
    fn object_members_keep_insertion_order() {
        let obj = MockObject::new();
        obj.set_member("b", GuestValue::Number(1.0));
        obj.set_member("a", GuestValue::Number(2.0));
        obj.set_member("b", GuestValue::Number(3.0));
        assert_eq!(obj.member_names(), vec!["b", "a"]);
        assert_eq!(obj.get_member("b").unwrap().as_f64(), Some(3.0));
    }
}
