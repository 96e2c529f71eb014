//! Timer polyfill: `setTimeout`, `setInterval` and their clear functions.
//!
//! Timer ids are positive, monotonically increasing `i32` values, never
//! reused within a context. The table slot is reserved *before* the deadline
//! task is spawned, so a clear racing the first fire always finds a slot to
//! remove; a fire arriving for a cleared id finds no slot and is dropped.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tonbridge_core::{GuestError, GuestFunctionRef, GuestValue, ScriptContext};
use tracing::{trace, warn};

use crate::reactor::NativeEvent;
use crate::sync_cell::SyncCell;

struct TimerEntry {
    callback: GuestFunctionRef,
    repeating: bool,
    /// `None` between slot reservation and task spawn.
    task: Option<AbortHandle>,
}

/// Per-context timer table.
pub struct Timers {
    table: SyncCell<HashMap<i32, TimerEntry>>,
    next_id: Cell<i32>,
    events: Sender<NativeEvent>,
    runtime: Handle,
}

impl Timers {
    pub fn new(events: Sender<NativeEvent>, runtime: Handle) -> Rc<Self> {
        Rc::new(Self {
            table: SyncCell::default(),
            next_id: Cell::new(1),
            events,
            runtime,
        })
    }

    /// Number of timers currently armed.
    pub fn active_count(&self) -> usize {
        self.table.with(|table| table.len())
    }

    /// Arm a timer. The slot is inserted first with no task handle; only
    /// then is the deadline task spawned and the handle filled in. A clear
    /// arriving between the two steps removes the slot, and the handle is
    /// aborted instead of stored.
    pub fn set(&self, callback: GuestFunctionRef, delay: Duration, repeating: bool) -> i32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        self.table.with(|table| {
            table.insert(
                id,
                TimerEntry {
                    callback,
                    repeating,
                    task: None,
                },
            );
        });

        let tx = self.events.clone();
        let task = self.runtime.spawn(async move {
            if repeating {
                // A zero period is not representable for an interval.
                let period = delay.max(Duration::from_millis(1));
                let start = tokio::time::Instant::now() + period;
                let mut ticks = tokio::time::interval_at(start, period);
                loop {
                    ticks.tick().await;
                    if tx.send(NativeEvent::TimerFired { id }).is_err() {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(delay).await;
                let _ = tx.send(NativeEvent::TimerFired { id });
            }
        });

        let handle = task.abort_handle();
        self.table.with(|table| match table.get_mut(&id) {
            Some(entry) => entry.task = Some(handle),
            None => handle.abort(),
        });

        trace!(timer = id, ?delay, repeating, "timer armed");
        id
    }

    /// Disarm a timer. Unknown ids are ignored, matching platform behavior.
    pub fn clear(&self, id: i32) {
        let removed = self.table.with(|table| table.remove(&id));
        if let Some(entry) = removed {
            if let Some(task) = entry.task {
                task.abort();
            }
            trace!(timer = id, "timer cleared");
        }
    }

    /// Deliver a fired deadline to its callback. Called on the context
    /// thread when the reactor routes a [`NativeEvent::TimerFired`]. Fires
    /// for ids with no slot are stale (the timer was cleared) and ignored.
    pub fn fire(&self, id: i32) {
        let callback = self.table.with(|table| {
            let repeating = table.get(&id).map(|entry| entry.repeating)?;
            if repeating {
                table.get(&id).map(|entry| entry.callback.clone())
            } else {
                table.remove(&id).map(|entry| entry.callback)
            }
        });
        let Some(callback) = callback else {
            trace!(timer = id, "stale timer fire dropped");
            return;
        };
        if let Err(err) = callback.call(GuestValue::Undefined, &[]) {
            warn!(timer = id, error = %err, "timer callback failed");
        }
    }

    /// Disarm everything. Called on context shutdown.
    pub fn clear_all(&self) {
        let entries = self.table.with(std::mem::take);
        for (_, entry) in entries {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }
}

/// Install the four timer globals on the context.
pub fn install(ctx: &Rc<dyn ScriptContext>, timers: Rc<Timers>) {
    let global = ctx.global();

    for (name, repeating) in [("setTimeout", false), ("setInterval", true)] {
        let timers = timers.clone();
        let set = ctx.create_function(
            name,
            Rc::new(move |args| {
                let callback = match args.first() {
                    Some(GuestValue::Function(f)) => f.clone(),
                    other => {
                        return Err(GuestError::type_error(format!(
                            "{name} callback is {}, not a function",
                            other.map(GuestValue::type_name).unwrap_or("missing")
                        )));
                    }
                };
                let millis = args
                    .get(1)
                    .and_then(GuestValue::as_f64)
                    .filter(|ms| ms.is_finite() && *ms > 0.0)
                    .unwrap_or(0.0);
                let id = timers.set(callback, Duration::from_millis(millis as u64), repeating);
                Ok(GuestValue::Number(id as f64))
            }),
        );
        global.set_member(name, GuestValue::Function(set));
    }

    for name in ["clearTimeout", "clearInterval"] {
        let timers = timers.clone();
        let clear = ctx.create_function(
            name,
            Rc::new(move |args| {
                if let Some(id) = args.first().and_then(GuestValue::as_f64) {
                    timers.clear(id as i32);
                }
                Ok(GuestValue::Undefined)
            }),
        );
        global.set_member(name, GuestValue::Function(clear));
    }
}
