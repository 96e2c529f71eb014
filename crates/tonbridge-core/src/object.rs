//! Capability traits a provided interpreter must implement.
//!
//! The bridge walks dotted member paths via [`GuestObject::get_member`],
//! invokes callables via [`GuestFunction::call`] and observes settlement via
//! [`GuestPromise::then`]. Nothing in the bridge layer ever reflects over
//! native types or reaches into engine internals.

use std::rc::Rc;

use crate::error::GuestResult;
use crate::value::GuestValue;

/// Member access on a guest object.
pub trait GuestObject {
    /// Look up a member by name. `None` means the member is absent, which is
    /// distinct from a present member holding `undefined`.
    fn get_member(&self, name: &str) -> Option<GuestValue>;

    /// Set (or define) a member.
    fn set_member(&self, name: &str, value: GuestValue);

    /// Names of own enumerable members, in insertion order.
    fn member_names(&self) -> Vec<String>;

    /// Stable identity for this object, used for identity comparisons.
    fn identity(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

/// A callable guest value.
pub trait GuestFunction {
    /// Invoke with an explicit `this` binding. A thrown guest exception
    /// surfaces as `Err`.
    fn call(&self, this: GuestValue, args: &[GuestValue]) -> GuestResult<GuestValue>;
}

/// Callback invoked with the settlement value of a promise. At most one of
/// the two callbacks handed to [`GuestPromise::then`] ever fires, and it
/// fires at most once.
pub type SettleFn = Box<dyn FnOnce(GuestValue)>;

/// A guest promise, observed through side-effecting `then` callbacks.
pub trait GuestPromise {
    /// Register resolution and rejection observers. Implementations must
    /// replay an already-reached settlement to late registrations.
    fn then(&self, on_resolved: SettleFn, on_rejected: SettleFn);
}

/// A native function body exposed to guest code.
pub type NativeFn = Rc<dyn Fn(&[GuestValue]) -> GuestResult<GuestValue>>;
