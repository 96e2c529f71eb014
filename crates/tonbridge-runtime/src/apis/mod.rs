//! Host-provided APIs exposed to guest code.
//!
//! Each module installs one polyfill surface on the context's global object:
//! timers, fetch, server-sent event streams, crypto primitives, and secret
//! storage. Background work runs on the shared runtime and reports back
//! through the reactor channel.

pub mod crypto;
pub mod fetch;
pub mod secrets;
pub mod sse;
pub mod timers;
