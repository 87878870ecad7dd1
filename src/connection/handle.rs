use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use super::event::ConnectionEvent;
use super::ConnectionState;
use crate::apn::item::{ApnItem, ApnType};
use crate::error::Error;
use crate::event::{HandlerEvent, SlotEvent, SlotQueue};
use crate::types::INVALID_CID;

/// Stable id of a connection state machine within its slot.
pub type MachineId = u32;

/// Externally visible state of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub cid: i32,
    pub apn_type: Option<ApnType>,
    pub capability: u64,
    pub reuse_capability: u64,
    pub apn: Option<Arc<ApnItem>>,
    pub iface_name: String,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Inactive,
            cid: INVALID_CID,
            apn_type: None,
            capability: 0,
            reuse_capability: 0,
            apn: None,
            iface_name: String::new(),
        }
    }
}

/// Shared view of a connection state machine.
///
/// The machine itself is owned by the slot runner. Holders and the data
/// connection manager keep this handle to query it and to post events into
/// its queue. Holders bind and unbind; the last unbind hands the connection
/// back for teardown.
pub struct ConnectionHandle {
    id: MachineId,
    slot_id: i32,
    binds: AtomicUsize,
    snapshot: Mutex<CriticalSectionRawMutex, RefCell<ConnectionSnapshot>>,
    queue: SlotQueue,
}

impl core::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("slot_id", &self.slot_id)
            .field("binds", &self.bind_count())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(id: MachineId, slot_id: i32, queue: SlotQueue) -> Self {
        Self {
            id,
            slot_id,
            binds: AtomicUsize::new(0),
            snapshot: Mutex::new(RefCell::new(ConnectionSnapshot::default())),
            queue,
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    pub fn post(&self, event: ConnectionEvent) -> Result<(), Error> {
        self.queue.post(SlotEvent::Connection {
            machine: self.id,
            event,
        })
    }

    /// Report a completion to the slot controller.
    pub(crate) fn notify(&self, event: HandlerEvent) -> Result<(), Error> {
        self.queue.post(SlotEvent::Handler(event))
    }

    pub fn bind(&self) {
        self.binds.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this released the last binding.
    pub fn unbind(&self) -> bool {
        let previous = self
            .binds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous == 1
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.lock(|s| s.borrow().clone())
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        self.snapshot.lock(|s| f(&mut s.borrow_mut()));
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.lock(|s| s.borrow().state)
    }

    pub fn cid(&self) -> i32 {
        self.snapshot.lock(|s| s.borrow().cid)
    }

    pub fn capability(&self) -> u64 {
        self.snapshot.lock(|s| s.borrow().capability)
    }

    pub fn apn(&self) -> Option<Arc<ApnItem>> {
        self.snapshot.lock(|s| s.borrow().apn.clone())
    }

    pub fn iface_name(&self) -> String {
        self.snapshot.lock(|s| s.borrow().iface_name.clone())
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_inactive(&self) -> bool {
        self.state() == ConnectionState::Inactive
    }

    pub fn is_activating(&self) -> bool {
        self.state() == ConnectionState::Activating
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state() == ConnectionState::Disconnecting
    }
}
