//! Host runtime bridging native code and an embedded wallet guest script.
//!
//! The runtime runs one opaque guest script per [`Host`], confined to a
//! dedicated context thread, and gives native code a typed surface over it:
//!
//! - [`call_bridge`] invokes guest functions by dotted path and folds every
//!   outcome shape into exactly one settlement;
//! - [`event_bridge`] fans guest-announced events out to native listeners
//!   registered with liveness guards;
//! - [`marshal`] converts values across the boundary without collapsing
//!   null and undefined;
//! - [`apis`] supplies the platform surface the script expects (timers,
//!   fetch, server-sent events, crypto, secret storage);
//! - [`pool`] bounds the number of script virtual machines.
//!
//! Engine bindings live behind the traits in `tonbridge-core`; anything that
//! can provide objects, functions and promises can sit underneath.

pub mod apis;
pub mod call_bridge;
pub mod config;
pub mod error;
pub mod event_bridge;
pub mod host;
pub mod marshal;
pub mod pool;
pub mod reactor;
pub mod sync_cell;

pub use call_bridge::{CallArg, CallBridge, GuestFunctionReference};
pub use config::RuntimeConfig;
pub use error::{HostError, HostResult};
pub use event_bridge::{BridgeEvent, BridgeEventKind, EventBridge, EventHandler, ListenerGuard};
pub use host::{BridgeContext, Host, HostBuilder};
pub use marshal::MarshalError;
pub use pool::VmPool;
pub use sync_cell::SyncCell;

pub use tonbridge_core::{GuestValue, ScriptContext, ScriptVm};
