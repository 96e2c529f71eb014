//! Bounded pool of script virtual machines.
//!
//! A fixed array of slots, filled lazily and selected round-robin. Machine
//! construction is expensive and is serialized: only one build is in flight
//! at a time, and acquirers that land on a slot being built wait on a
//! condvar instead of starting a duplicate. The pool therefore never holds
//! more machines than its capacity.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tonbridge_core::ScriptVm;
use tracing::{debug, info};

use crate::error::{HostError, HostResult};

type VmFactory<V> = Box<dyn Fn() -> HostResult<Arc<V>> + Send + Sync>;

struct PoolState<V> {
    slots: Vec<Option<Arc<V>>>,
    next: usize,
    building: bool,
}

/// Fixed-capacity machine pool.
pub struct VmPool<V: ScriptVm> {
    state: Mutex<PoolState<V>>,
    built: Condvar,
    factory: VmFactory<V>,
    capacity: usize,
}

impl<V: ScriptVm> VmPool<V> {
    /// Build the pool and its first machine; the remaining slots fill when
    /// the round-robin cursor reaches them.
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> HostResult<Arc<V>> + Send + Sync + 'static,
    ) -> HostResult<Self> {
        if capacity == 0 {
            return Err(HostError::config("pool capacity must be at least 1"));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.push(Some(factory()?));
        slots.resize_with(capacity, || None);
        info!(capacity, "machine pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                next: 0,
                building: false,
            }),
            built: Condvar::new(),
            factory: Box::new(factory),
            capacity,
        })
    }

    /// Machines currently held. Never exceeds the capacity.
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Hand out the machine in the next round-robin slot, building it if
    /// the slot is empty. Waits while another acquirer's build is in
    /// flight rather than racing it.
    pub fn acquire(&self) -> HostResult<Arc<V>> {
        let mut state = self.state.lock();
        let index = state.next;
        state.next = (state.next + 1) % self.capacity;

        loop {
            if let Some(vm) = &state.slots[index] {
                return Ok(vm.clone());
            }
            if state.building {
                self.built.wait(&mut state);
                continue;
            }

            state.building = true;
            let outcome = MutexGuard::unlocked(&mut state, || (self.factory)());
            state.building = false;
            self.built.notify_all();
            let vm = outcome?;
            debug!(slot = index, "machine built");
            state.slots[index] = Some(vm.clone());
            return Ok(vm);
        }
    }

    /// Free every machine nothing else currently references. Freed slots
    /// rebuild lazily when the cursor reaches them again. Returns how many
    /// were freed.
    pub fn garbage_collect(&self) -> usize {
        let mut state = self.state.lock();
        let mut freed = 0;
        for slot in &mut state.slots {
            if slot
                .as_ref()
                .is_some_and(|vm| Arc::strong_count(vm) == 1)
            {
                *slot = None;
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, "idle machines collected");
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tonbridge_core::mock::MockVm;

    fn mock_pool(capacity: usize) -> VmPool<MockVm> {
        VmPool::new(capacity, || Ok(Arc::new(MockVm::new()))).unwrap()
    }

    #[test]
    fn first_machine_is_built_up_front() {
        let pool = mock_pool(4);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            VmPool::new(0, || Ok(Arc::new(MockVm::new()))),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn slots_fill_lazily_in_round_robin_order() {
        let pool = mock_pool(3);
        let a = pool.acquire().unwrap();
        assert_eq!(pool.size(), 1);
        let b = pool.acquire().unwrap();
        assert_eq!(pool.size(), 2);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.size(), 3);

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(!Arc::ptr_eq(&a, &c));

        // Fourth acquire wraps around to the first machine.
        let d = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &d));
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn capacity_one_always_returns_the_same_machine() {
        let pool = mock_pool(1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn concurrent_acquire_never_exceeds_capacity() {
        let pool = Arc::new(mock_pool(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let vm = pool.acquire().unwrap();
                        peak.fetch_max(pool.size(), Ordering::SeqCst);
                        std::hint::black_box(&vm);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.size() <= 3);
    }

    #[test]
    fn factory_failure_surfaces_and_the_slot_stays_empty() {
        let failures = Arc::new(AtomicUsize::new(1));
        let pool = {
            let failures = failures.clone();
            VmPool::new(2, move || {
                if failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Ok(Arc::new(MockVm::new()))
                } else {
                    Err(HostError::internal("engine library unavailable"))
                }
            })
            .unwrap()
        };

        // Slot 0 was built at construction and serves fine.
        assert!(pool.acquire().is_ok());
        // The cursor lands on the empty slot; its build fails.
        assert!(pool.acquire().is_err());
        assert_eq!(pool.size(), 1);
        // Wrapped around to the machine built at construction.
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn garbage_collect_frees_only_unreferenced_machines() {
        let pool = mock_pool(2);
        let busy = pool.acquire().unwrap();
        let idle = pool.acquire().unwrap();
        drop(idle);
        assert_eq!(pool.size(), 2);

        assert_eq!(pool.garbage_collect(), 1);
        assert_eq!(pool.size(), 1);

        drop(busy);
        assert_eq!(pool.garbage_collect(), 1);
        assert_eq!(pool.size(), 0);

        // Freed slots rebuild when selected again.
        assert!(pool.acquire().is_ok());
        assert_eq!(pool.size(), 1);
    }
}
