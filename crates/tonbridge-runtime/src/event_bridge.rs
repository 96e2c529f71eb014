//! Event dispatch bridge: guest-originated events fanned out to native
//! listeners.
//!
//! The guest script announces wallet events (connect, transaction, sign
//! data, disconnect) through one installed function; the bridge delivers
//! each event to every live native listener. Listeners register with a
//! liveness guard and are pruned before every table operation, so a dropped
//! guard is never observed again. The dispatcher never interprets payloads;
//! each listener decodes what it needs from the raw guest value.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use tonbridge_core::{GuestError, GuestValue, ScriptContext};
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::marshal::{self, MarshalError};
use crate::sync_cell::SyncCell;

/// The event kinds the guest script may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeEventKind {
    Connect,
    Transaction,
    SignData,
    Disconnect,
}

impl BridgeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Transaction => "transaction",
            Self::SignData => "signData",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for BridgeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeEventKind {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "transaction" | "sendTransaction" => Ok(Self::Transaction),
            "signData" | "sign-data" => Ok(Self::SignData),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(HostError::config(format!("unknown event kind '{other}'"))),
        }
    }
}

/// One guest-announced event. The payload stays raw; listeners decode it
/// lazily into whatever record they expect.
pub struct BridgeEvent {
    pub kind: BridgeEventKind,
    pub payload: GuestValue,
}

impl BridgeEvent {
    /// Decode the payload into a required record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MarshalError> {
        marshal::decode(&self.payload)
    }

    /// Decode the payload into an optional record; a nullish payload is
    /// absent, not an error.
    pub fn decode_opt<T: DeserializeOwned>(&self) -> Result<Option<T>, MarshalError> {
        marshal::decode_opt(&self.payload)
    }
}

/// A native event listener. Runs on the context thread.
pub type EventHandler = Rc<dyn Fn(&BridgeEvent) -> HostResult<()>>;

struct Listener {
    handler: EventHandler,
    alive: Arc<AtomicBool>,
}

/// Keeps one listener registered. Dropping the guard deregisters it; the
/// entry is removed from the table on the next operation that touches it.
#[must_use = "dropping the guard deregisters the listener"]
pub struct ListenerGuard {
    alive: Arc<AtomicBool>,
}

impl ListenerGuard {
    pub fn is_registered(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Per-context listener table. Listeners receive every event kind.
#[derive(Default)]
pub struct EventBridge {
    listeners: SyncCell<Vec<Listener>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native listener.
    ///
    /// Registering the same handler instance twice does not create a second
    /// entry; the returned guard shares the existing liveness flag, so
    /// dropping either guard deregisters the listener.
    pub fn subscribe(&self, handler: EventHandler) -> ListenerGuard {
        self.listeners.with(|entries| {
            entries.retain(|listener| listener.alive.load(Ordering::Acquire));

            if let Some(existing) = entries
                .iter()
                .find(|listener| Rc::ptr_eq(&listener.handler, &handler))
            {
                return ListenerGuard {
                    alive: existing.alive.clone(),
                };
            }

            let alive = Arc::new(AtomicBool::new(true));
            entries.push(Listener {
                handler,
                alive: alive.clone(),
            });
            debug!(count = entries.len(), "event listener registered");
            ListenerGuard { alive }
        })
    }

    /// Number of live listeners, after pruning dead entries.
    pub fn live_count(&self) -> usize {
        self.listeners.with(|entries| {
            entries.retain(|listener| listener.alive.load(Ordering::Acquire));
            entries.len()
        })
    }

    /// Deliver a guest-announced event to every live listener.
    ///
    /// An unknown kind string fails before any listener runs, as does an
    /// empty listener table (the script expected at least one consumer).
    /// Every listener is invoked even when an earlier one fails; dispatch
    /// succeeds if at least one listener succeeds, and otherwise surfaces
    /// the first failure in registration order.
    pub fn dispatch(&self, kind: &str, payload: GuestValue) -> HostResult<()> {
        let kind = kind.parse::<BridgeEventKind>()?;

        // Snapshot live handlers in one critical section, call them outside
        // it: a listener may subscribe or drop guards re-entrantly.
        let handlers: Vec<EventHandler> = self.listeners.with(|entries| {
            entries.retain(|listener| listener.alive.load(Ordering::Acquire));
            entries
                .iter()
                .map(|listener| listener.handler.clone())
                .collect()
        });
        if handlers.is_empty() {
            return Err(HostError::config(format!(
                "no live listeners for '{kind}' event"
            )));
        }

        let event = BridgeEvent { kind, payload };
        let mut first_err = None;
        let mut delivered = 0usize;
        for handler in handlers {
            match handler(&event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(kind = %kind, error = %err, "event listener failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) if delivered == 0 => Err(err),
            _ => Ok(()),
        }
    }
}

/// Install `dispatchBridgeEvent` on the context. The guest calls it with a
/// kind string and an opaque payload; a failed dispatch throws, which the
/// guest's promise machinery turns into a rejection.
pub fn install(ctx: &Rc<dyn ScriptContext>, bridge: Rc<EventBridge>) {
    let global = ctx.global();
    let dispatch = ctx.create_function(
        "dispatchBridgeEvent",
        Rc::new(move |args| {
            let kind = args
                .first()
                .and_then(GuestValue::as_str)
                .ok_or_else(|| GuestError::type_error("event kind must be a string"))?
                .to_string();
            let payload = args.get(1).cloned().unwrap_or(GuestValue::Undefined);
            bridge
                .dispatch(&kind, payload)
                .map_err(|e| GuestError::runtime(e.to_string()))?;
            Ok(GuestValue::Undefined)
        }),
    );
    global.set_member("dispatchBridgeEvent", GuestValue::Function(dispatch));
}
