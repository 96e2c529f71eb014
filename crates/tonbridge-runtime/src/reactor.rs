//! Reactor: the single seam between background tasks and the context thread.
//!
//! Guest values are not `Send`, so background work (HTTP transfers, timer
//! sleeps, SSE reads) never touches them. Instead each background task sends
//! a [`NativeEvent`] over a channel, and the context thread drains the
//! channel between jobs and performs the guest-side effects there: settling
//! deferred promises, firing timer callbacks, delivering stream signals.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::Value as Json;
use tokio::runtime::Handle;
use tonbridge_core::{DeferredPromise, GuestValue, ScriptContext};
use tracing::{trace, warn};

use crate::error::{HostError, HostResult};
use crate::marshal;

/// Completion notice from a background task. Everything inside is `Send`;
/// conversion to guest values happens on the context thread.
pub enum NativeEvent {
    /// A scheduled future finished; settle the deferred promise it backs.
    PromiseSettled {
        id: u64,
        result: HostResult<Json>,
    },
    /// A timer deadline elapsed.
    TimerFired { id: i32 },
    /// An event-stream session produced a signal.
    Sse {
        session: u64,
        signal: crate::apis::sse::SseSignal,
    },
}

/// Per-context reactor. Lives on the context thread; hands out `Send`
/// channel ends to background tasks.
pub struct Reactor {
    ctx: Rc<dyn ScriptContext>,
    handle: Handle,
    tx: Sender<NativeEvent>,
    rx: Receiver<NativeEvent>,
    pending: RefCell<HashMap<u64, DeferredPromise>>,
    next_id: Cell<u64>,
}

impl Reactor {
    pub fn new(ctx: Rc<dyn ScriptContext>, handle: Handle) -> Self {
        let (tx, rx) = unbounded();
        Self {
            ctx,
            handle,
            tx,
            rx,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    /// Channel end for background tasks that report their own event kinds
    /// (timers, stream sessions).
    pub fn sender(&self) -> Sender<NativeEvent> {
        self.tx.clone()
    }

    /// Runtime handle for spawning background tasks.
    pub fn runtime(&self) -> &Handle {
        &self.handle
    }

    /// Number of promises awaiting settlement.
    pub fn pending_promises(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Run a future in the background and hand guest code a promise for its
    /// outcome. The future resolves to the JSON shape of the resolution
    /// value; the conversion to a guest value happens at settlement time on
    /// the context thread.
    pub fn schedule_promise<F>(&self, fut: F) -> HostResult<GuestValue>
    where
        F: Future<Output = HostResult<Json>> + Send + 'static,
    {
        let (promise, deferred) = self.ctx.create_deferred()?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.pending.borrow_mut().insert(id, deferred);

        let tx = self.tx.clone();
        self.handle.spawn(async move {
            let result = fut.await;
            // The receiver only disappears when the context shuts down, in
            // which case the settlement has nowhere to go anyway.
            let _ = tx.send(NativeEvent::PromiseSettled { id, result });
        });

        trace!(promise = id, "background promise scheduled");
        Ok(promise)
    }

    /// Drain queued events. Promise settlements are applied here; events that
    /// belong to other subsystems (timers, streams) are returned for the
    /// caller to route.
    pub fn drain(&self) -> Vec<NativeEvent> {
        let mut routed = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                NativeEvent::PromiseSettled { id, result } => self.settle(id, result),
                other => routed.push(other),
            }
        }
        routed
    }

    fn settle(&self, id: u64, result: HostResult<Json>) {
        let Some(deferred) = self.pending.borrow_mut().remove(&id) else {
            warn!(promise = id, "settlement for unknown promise");
            return;
        };
        match result {
            Ok(json) => {
                trace!(promise = id, "promise resolved");
                (deferred.resolve)(marshal::encode_json(&*self.ctx, &json));
            }
            Err(err) => {
                trace!(promise = id, error = %err, "promise rejected");
                (deferred.reject)(GuestValue::String(err.to_string()));
            }
        }
    }

    /// Reject every still-pending promise. Called on context shutdown so no
    /// guest `await` is left hanging.
    pub fn reject_all(&self, reason: &str) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for (_, deferred) in pending {
            (deferred.reject)(GuestValue::String(reason.to_string()));
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.reject_all("context shut down");
    }
}

#[allow(dead_code)]
fn assert_event_is_send() {
    fn check<T: Send>() {}
    check::<NativeEvent>();
    check::<HostError>();
}
