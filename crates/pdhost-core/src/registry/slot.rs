//! Per-instance state and the locks that guard it

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Local};

use crate::buffer::BufferTable;
use crate::patch::PatchTable;
use crate::router::SubscriptionTable;
use crate::types::{InstanceId, InstanceState};

thread_local! {
    /// Instances whose inbound dispatch is running on this thread
    static DISPATCHING: RefCell<Vec<InstanceId>> = const { RefCell::new(Vec::new()) };
}

/// Control-plane state, guarded by the per-instance control lock
#[derive(Debug)]
pub struct InstanceData {
    pub state: InstanceState,
    pub sample_rate: u32,
    pub patches: PatchTable,
    pub buffers: BufferTable,
    pub created_at: DateTime<Local>,
}

/// One registered engine instance
///
/// Lock order: dispatch gate, then control lock, then subscriptions.
/// Inbound dispatch only ever takes the gate (read) and the subscription
/// lock, so listeners may issue control operations on the same instance.
pub struct InstanceSlot {
    id: InstanceId,
    /// Inbound callbacks may run (cleared at the start of release)
    active: AtomicBool,
    /// Read by the audio context without locking
    computing: AtomicBool,
    control: Mutex<InstanceData>,
    subscriptions: Mutex<SubscriptionTable>,
    dispatch_gate: RwLock<()>,
}

impl InstanceSlot {
    pub(crate) fn new(id: InstanceId, sample_rate: u32) -> Self {
        Self {
            id,
            active: AtomicBool::new(false),
            computing: AtomicBool::new(false),
            control: Mutex::new(InstanceData {
                state: InstanceState::Uninitialized,
                sample_rate,
                patches: PatchTable::default(),
                buffers: BufferTable::default(),
                created_at: Local::now(),
            }),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            dispatch_gate: RwLock::new(()),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Acquire the control lock
    pub fn lock(&self) -> MutexGuard<'_, InstanceData> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscriptions(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_computing(&self) -> bool {
        self.computing.load(Ordering::Acquire)
    }

    /// Move to `state`, keeping the lock-free flags in step
    pub(crate) fn set_state(&self, data: &mut InstanceData, state: InstanceState) {
        data.state = state;
        self.computing
            .store(state == InstanceState::Computing, Ordering::Release);
        self.active.store(state.is_live(), Ordering::Release);
    }

    /// Enter inbound dispatch; `None` once release has begun
    ///
    /// Nested dispatch for the same instance on the same thread does not
    /// take the gate again.
    pub fn enter_dispatch(&self) -> Option<DispatchGuard<'_>> {
        if !self.is_active() {
            return None;
        }

        let nested = DISPATCHING.with(|d| d.borrow().contains(&self.id));
        let gate = if nested {
            None
        } else {
            Some(self.dispatch_gate.read().unwrap_or_else(|e| e.into_inner()))
        };

        if !self.is_active() {
            return None;
        }

        DISPATCHING.with(|d| d.borrow_mut().push(self.id));
        Some(DispatchGuard {
            id: self.id,
            _gate: gate,
        })
    }

    /// True when called from inside an inbound callback of this instance
    pub fn is_dispatching_here(&self) -> bool {
        DISPATCHING.with(|d| d.borrow().contains(&self.id))
    }

    /// Stop dispatch and wait for in-flight callbacks to finish
    pub(crate) fn deactivate(&self) -> RwLockWriteGuard<'_, ()> {
        self.active.store(false, Ordering::Release);
        self.computing.store(false, Ordering::Release);
        self.dispatch_gate
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Marks a running inbound dispatch; release waits for it to drop
pub struct DispatchGuard<'a> {
    id: InstanceId,
    _gate: Option<RwLockReadGuard<'a, ()>>,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        DISPATCHING.with(|d| {
            let mut stack = d.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.id) {
                stack.remove(pos);
            }
        });
    }
}

/// Innermost instance whose inbound callback is running on this thread
///
/// Release is refused while this is `Some`, whichever instance it targets.
pub fn dispatching_instance() -> Option<InstanceId> {
    DISPATCHING.with(|d| d.borrow().last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn live_slot(id: InstanceId) -> InstanceSlot {
        let slot = InstanceSlot::new(id, 44100);
        let mut data = slot.lock();
        slot.set_state(&mut data, InstanceState::Suspended);
        drop(data);
        slot
    }

    #[test]
    fn test_new_slot_is_uninitialized() {
        let slot = InstanceSlot::new(3, 48000);
        assert_eq!(slot.state(), InstanceState::Uninitialized);
        assert!(!slot.is_active());
        assert!(slot.enter_dispatch().is_none());
    }

    #[test]
    fn test_state_flags_follow_state() {
        let slot = live_slot(0);
        assert!(slot.is_active());
        assert!(!slot.is_computing());

        let mut data = slot.lock();
        slot.set_state(&mut data, InstanceState::Computing);
        assert!(slot.is_computing());
    }

    #[test]
    fn test_nested_dispatch() {
        let slot = live_slot(1);
        let outer = slot.enter_dispatch().unwrap();
        assert!(slot.is_dispatching_here());
        {
            let _inner = slot.enter_dispatch().unwrap();
        }
        assert!(slot.is_dispatching_here());
        drop(outer);
        assert!(!slot.is_dispatching_here());
    }

    #[test]
    fn test_dispatching_instance_tracks_innermost() {
        let first = live_slot(4);
        let second = live_slot(5);
        assert_eq!(dispatching_instance(), None);

        let outer = first.enter_dispatch().unwrap();
        assert_eq!(dispatching_instance(), Some(4));
        {
            let _inner = second.enter_dispatch().unwrap();
            assert_eq!(dispatching_instance(), Some(5));
            assert!(first.is_dispatching_here() && second.is_dispatching_here());
        }
        assert_eq!(dispatching_instance(), Some(4));
        drop(outer);
        assert_eq!(dispatching_instance(), None);
    }

    #[test]
    fn test_deactivate_waits_for_dispatch() {
        let slot = Arc::new(live_slot(2));
        let guard = slot.enter_dispatch().unwrap();

        let releasing = slot.clone();
        let handle = thread::spawn(move || {
            let _gate = releasing.deactivate();
            releasing.enter_dispatch().is_none()
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(guard);
        assert!(handle.join().unwrap());
    }
}
