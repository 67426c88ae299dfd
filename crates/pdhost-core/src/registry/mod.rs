//! Instance registry - the set of engine instances this host owns
//!
//! The registry map is the only process-wide lock in the host. It is held
//! just long enough to look up, insert or remove an [`InstanceSlot`]; all
//! per-instance work happens under that slot's own locks.
//!
//! ```text
//! InstanceRegistry ── Mutex<BTreeMap<id, Arc<InstanceSlot>>>
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    InstanceSlot 0      InstanceSlot 1      InstanceSlot 2
//!    control lock        control lock        control lock
//!    subscriptions       subscriptions       subscriptions
//!    dispatch gate       dispatch gate       dispatch gate
//! ```

mod slot;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HostError, HostResult};
use crate::types::InstanceId;

pub use slot::{dispatching_instance, DispatchGuard, InstanceData, InstanceSlot};

/// Registry of engine instances, one owner per id
#[derive(Default)]
pub struct InstanceRegistry {
    slots: Mutex<BTreeMap<InstanceId, Arc<InstanceSlot>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<InstanceId, Arc<InstanceSlot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `id` for a new instance in the `Uninitialized` state
    pub fn reserve(&self, id: InstanceId, sample_rate: u32) -> HostResult<Arc<InstanceSlot>> {
        let mut slots = self.slots();
        if slots.contains_key(&id) {
            return Err(HostError::AlreadyExists(id));
        }
        let slot = Arc::new(InstanceSlot::new(id, sample_rate));
        slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Reserve the lowest unused id
    pub fn reserve_next(&self, sample_rate: u32) -> Arc<InstanceSlot> {
        let mut slots = self.slots();
        let id = (0..)
            .zip(slots.keys())
            .find(|(expected, used)| expected != *used)
            .map_or(slots.len() as InstanceId, |(expected, _)| expected);
        let slot = Arc::new(InstanceSlot::new(id, sample_rate));
        slots.insert(id, slot.clone());
        slot
    }

    pub fn get(&self, id: InstanceId) -> Option<Arc<InstanceSlot>> {
        self.slots().get(&id).cloned()
    }

    /// Remove `id`; the caller becomes the only party allowed to destroy it
    pub fn remove(&self, id: InstanceId) -> Option<Arc<InstanceSlot>> {
        self.slots().remove(&id)
    }

    /// Remove `slot` only if it is still the registered owner of its id
    pub fn remove_slot(&self, slot: &Arc<InstanceSlot>) -> bool {
        let mut slots = self.slots();
        match slots.get(&slot.id()) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(&slot.id());
                true
            }
            _ => false,
        }
    }

    pub fn contains_slot(&self, slot: &Arc<InstanceSlot>) -> bool {
        self.slots()
            .get(&slot.id())
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Remove every instance, returning them for teardown
    pub fn drain(&self) -> Vec<Arc<InstanceSlot>> {
        std::mem::take(&mut *self.slots()).into_values().collect()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.slots().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Run a control-plane operation under the instance's control lock
    ///
    /// Fails with `InvalidInstance` unless the instance is `Computing` or
    /// `Suspended`. Operations on one instance are serialized; operations on
    /// different instances never contend.
    pub fn with_live<T>(
        &self,
        id: InstanceId,
        f: impl FnOnce(&InstanceSlot, &mut InstanceData) -> HostResult<T>,
    ) -> HostResult<T> {
        let slot = self.get(id).ok_or(HostError::InvalidInstance(id))?;
        let mut data = slot.lock();
        if !data.state.is_live() {
            return Err(HostError::InvalidInstance(id));
        }
        f(&slot, &mut data)
    }
}
