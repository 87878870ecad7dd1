//! Per-slot event queue and the events it carries.

use core::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;

use crate::apn::item::{ApnRecord, ApnType};
use crate::apn::retry::RetryScene;
use crate::connection::event::ConnectionEvent;
use crate::connection::handle::MachineId;
use crate::error::Error;
use crate::incall::IncallEvent;
use crate::monitor::{CellDataFlowType, RecoveryAction};
use crate::types::{DisconnectReason, NetRequest, PdpErrorReason, RadioIndication, MAX_SLOT_COUNT};

pub const SLOT_QUEUE_DEPTH: usize = 64;

/// Requests coming in through [`Control`](crate::asynch::control::Control).
#[derive(Debug, Clone)]
pub enum SlotRequest {
    RequestNet(NetRequest),
    ReleaseNet(NetRequest),
    SetDataEnabled(bool),
    SetRoamingEnabled(bool),
    SetIncallDataEnabled(bool),
    ClearConnections {
        apn_type: Option<ApnType>,
        reason: DisconnectReason,
    },
    ApnChanged(Vec<ApnRecord>),
    SetPreferredApn(i32),
    ClearFlowType,
    DefaultDataSlotChanged,
}

/// Completion and housekeeping events for the slot controller.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    EstablishComplete {
        machine: MachineId,
        apn_type: ApnType,
        cid: i32,
    },
    DisconnectComplete {
        machine: MachineId,
        apn_type: Option<ApnType>,
        reason: DisconnectReason,
        cause: PdpErrorReason,
        retry_after_ms: i64,
        scene: RetryScene,
    },
    RetryToCreateApn(ApnType),
    ResumeDataPermitted,
    IncallDataComplete,
    Recovery(RecoveryAction),
    FlowTypeChanged(CellDataFlowType),
}

#[derive(Debug, Clone)]
pub enum SlotEvent {
    Request(SlotRequest),
    Indication(RadioIndication),
    Connection {
        machine: MachineId,
        event: ConnectionEvent,
    },
    Handler(HandlerEvent),
    Incall(IncallEvent),
}

type SlotChannel = Channel<CriticalSectionRawMutex, SlotEvent, SLOT_QUEUE_DEPTH>;

/// Sending and receiving end of a slot's event queue.
#[derive(Clone)]
pub struct SlotQueue {
    slot_id: i32,
    channel: Arc<SlotChannel>,
}

impl core::fmt::Debug for SlotQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotQueue")
            .field("slot_id", &self.slot_id)
            .field("len", &self.channel.len())
            .finish()
    }
}

impl SlotQueue {
    pub fn new(slot_id: i32) -> Self {
        Self {
            slot_id,
            channel: Arc::new(Channel::new()),
        }
    }

    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    /// Enqueue without waiting. A full queue drops the event.
    pub fn post(&self, event: SlotEvent) -> Result<(), Error> {
        self.channel.try_send(event).map_err(|e| {
            error!("Slot {} event queue full, dropping event", self.slot_id);
            Error::from(e)
        })
    }

    pub async fn receive(&self) -> SlotEvent {
        self.channel.receive().await
    }

    pub fn try_receive(&self) -> Option<SlotEvent> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    fn same_channel(&self, other: &SlotQueue) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }
}

const SLOTS: usize = MAX_SLOT_COUNT as usize;

/// Queues of every live slot, so one slot can tell the others about
/// process wide changes it caused.
pub struct SlotDirectory {
    queues: Mutex<CriticalSectionRawMutex, RefCell<heapless::Vec<SlotQueue, SLOTS>>>,
}

impl core::fmt::Debug for SlotDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let slots: heapless::Vec<i32, SLOTS> =
            self.queues.lock(|q| q.borrow().iter().map(|q| q.slot_id()).collect());
        f.debug_struct("SlotDirectory").field("slots", &slots).finish()
    }
}

impl Default for SlotDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotDirectory {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Add a slot, replacing an earlier queue of the same slot.
    pub fn register(&self, queue: SlotQueue) -> Result<(), Error> {
        self.queues.lock(|q| {
            let queues = &mut *q.borrow_mut();
            queues.retain(|q| q.slot_id() != queue.slot_id());
            queues
                .push(queue)
                .map_err(|q| Error::InvalidSlot(q.slot_id()))
        })
    }

    /// Remove `queue`. A newer queue registered for the same slot stays.
    pub fn unregister(&self, queue: &SlotQueue) {
        self.queues
            .lock(|q| q.borrow_mut().retain(|q| !q.same_channel(queue)));
    }

    pub fn slot_ids(&self) -> heapless::Vec<i32, SLOTS> {
        self.queues
            .lock(|q| q.borrow().iter().map(|q| q.slot_id()).collect())
    }

    /// Tell every slot but `origin` that the default data slot moved.
    pub fn default_data_slot_changed(&self, origin: i32) {
        let others: heapless::Vec<SlotQueue, SLOTS> = self.queues.lock(|q| {
            q.borrow()
                .iter()
                .filter(|q| q.slot_id() != origin)
                .cloned()
                .collect()
        });
        for queue in others {
            let event = SlotEvent::Request(SlotRequest::DefaultDataSlotChanged);
            if let Err(e) = queue.post(event) {
                error!("Slot {} missed default slot change: {}", queue.slot_id(), e);
            }
        }
    }
}

/// Radio responses go straight to the machine that issued the request.
impl From<RadioIndication> for SlotEvent {
    fn from(indication: RadioIndication) -> Self {
        match indication {
            RadioIndication::SetupDataCallResponse { token, result } => SlotEvent::Connection {
                machine: token.machine,
                event: match result {
                    Ok(result) => ConnectionEvent::ActivateDone {
                        connect_id: token.connect_id,
                        result: Some(result),
                    },
                    Err(error) => ConnectionEvent::RadioError {
                        connect_id: token.connect_id,
                        error: Some(error),
                    },
                },
            },
            RadioIndication::DeactivateDataCallResponse { token, result } => {
                if let Err(e) = result {
                    warn!("Machine {} deactivation failed with {}", token.machine, e.code);
                }
                SlotEvent::Connection {
                    machine: token.machine,
                    event: ConnectionEvent::DeactivateDone {
                        connect_id: token.connect_id,
                    },
                }
            }
            other => SlotEvent::Indication(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{RadioResponseError, RequestToken};
    use embassy_futures::block_on;

    const TOKEN: RequestToken = RequestToken {
        machine: 3,
        connect_id: 7,
    };

    #[test]
    fn responses_route_to_machine() {
        let event = SlotEvent::from(RadioIndication::SetupDataCallResponse {
            token: TOKEN,
            result: Err(RadioResponseError { code: 2 }),
        });
        assert!(matches!(
            event,
            SlotEvent::Connection {
                machine: 3,
                event: ConnectionEvent::RadioError {
                    connect_id: 7,
                    error: Some(RadioResponseError { code: 2 })
                }
            }
        ));

        // A failed deactivation still ends the call on our side.
        let event = SlotEvent::from(RadioIndication::DeactivateDataCallResponse {
            token: TOKEN,
            result: Err(RadioResponseError { code: 1 }),
        });
        assert!(matches!(
            event,
            SlotEvent::Connection {
                machine: 3,
                event: ConnectionEvent::DeactivateDone { connect_id: 7 }
            }
        ));

        assert!(matches!(
            SlotEvent::from(RadioIndication::RoamingChanged(true)),
            SlotEvent::Indication(RadioIndication::RoamingChanged(true))
        ));
    }

    #[test]
    fn full_queue_rejects_posts() {
        let queue = SlotQueue::new(0);
        for _ in 0..SLOT_QUEUE_DEPTH {
            queue
                .post(SlotEvent::Handler(HandlerEvent::ResumeDataPermitted))
                .unwrap();
        }
        assert_eq!(
            queue.post(SlotEvent::Handler(HandlerEvent::ResumeDataPermitted)),
            Err(Error::QueueFull)
        );
        assert_eq!(queue.len(), SLOT_QUEUE_DEPTH);

        let event = block_on(queue.receive());
        assert!(matches!(
            event,
            SlotEvent::Handler(HandlerEvent::ResumeDataPermitted)
        ));
        assert!(queue.try_receive().is_some());
    }

    #[test]
    fn directory_reaches_other_slots_only() {
        let directory = SlotDirectory::new();
        let first = SlotQueue::new(0);
        let second = SlotQueue::new(1);
        directory.register(first.clone()).unwrap();
        directory.register(second.clone()).unwrap();

        directory.default_data_slot_changed(1);
        assert!(matches!(
            first.try_receive(),
            Some(SlotEvent::Request(SlotRequest::DefaultDataSlotChanged))
        ));
        assert!(second.is_empty());

        let replacement = SlotQueue::new(0);
        directory.register(replacement.clone()).unwrap();
        directory.unregister(&first);
        assert_eq!(directory.slot_ids().as_slice(), &[1, 0]);
        directory.unregister(&replacement);
        assert_eq!(directory.slot_ids().as_slice(), &[1]);
    }
}
