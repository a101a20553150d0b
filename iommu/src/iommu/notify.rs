//! Group notifier chains
//!
//! Observers subscribe to a group per event kind. Notification is synchronous
//! and runs subscribers in registration order. The chain is copied out of
//! its lock before callbacks run, so a subscriber may (un)register others.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::device::Device;
use super::group::Group;

/// Group membership and driver binding events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum GroupEvent {
    /// Device added
    AddDevice = 1,
    /// Device about to be removed
    DelDevice = 2,
    /// Driver about to bind
    BindDriver = 3,
    /// Driver bound
    BoundDriver = 4,
    /// Driver about to unbind
    UnbindDriver = 5,
    /// Driver unbound
    UnboundDriver = 6,
}

/// Handle returned by registration, used to unregister
pub type NotifierId = u64;

/// Subscriber callback
pub type Notifier = Arc<dyn Fn(GroupEvent, &Group, &Arc<Device>) + Send + Sync>;

/// Per-group event subscribers
pub(crate) struct NotifierChain {
    subscribers: Mutex<BTreeMap<GroupEvent, Vec<(NotifierId, Notifier)>>>,
    next_id: AtomicU64,
}

impl NotifierChain {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, event: GroupEvent, notifier: Notifier) -> NotifierId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(event)
            .or_default()
            .push((id, notifier));
        id
    }

    /// Remove a subscriber; false if the id is unknown.
    pub(crate) fn unregister(&self, id: NotifierId) -> bool {
        let mut subscribers = self.subscribers.lock();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(nid, _)| *nid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn call(&self, event: GroupEvent, group: &Group, dev: &Arc<Device>) {
        let chain: Vec<Notifier> = match self.subscribers.lock().get(&event) {
            Some(list) => list.iter().map(|(_, n)| n.clone()).collect(),
            None => return,
        };
        for notifier in chain {
            notifier(event, group, dev);
        }
    }

    pub(crate) fn count(&self, event: GroupEvent) -> usize {
        self.subscribers.lock().get(&event).map_or(0, Vec::len)
    }
}
