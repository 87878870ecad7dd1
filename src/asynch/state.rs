use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::WakerRegistration;
use heapless::FnvIndexMap;

use crate::apn::holder::ApnProfileState;
use crate::apn::item::{ApnItem, ApnType};
use crate::manager::MAX_ACTIVE_CONNECTIONS;
use crate::monitor::CellDataFlowType;

/// Cellular data state of a slot as reported to applications.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum CellularDataState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but a voice call on a 2G/1x network holds the data path.
    Suspended,
    Disconnecting,
}

impl CellularDataState {
    pub fn code(self) -> i32 {
        match self {
            CellularDataState::Disconnected => 0,
            CellularDataState::Connecting => 1,
            CellularDataState::Connected => 2,
            CellularDataState::Suspended => 3,
            CellularDataState::Disconnecting => 4,
        }
    }

    pub fn from_apn_state(state: ApnProfileState, suspended: bool) -> Self {
        match state {
            ApnProfileState::Connected if suspended => CellularDataState::Suspended,
            ApnProfileState::Connected => CellularDataState::Connected,
            ApnProfileState::Connecting | ApnProfileState::Retrying => {
                CellularDataState::Connecting
            }
            ApnProfileState::Disconnecting => CellularDataState::Disconnecting,
            ApnProfileState::Idle | ApnProfileState::Failed => CellularDataState::Disconnected,
        }
    }
}

/// What the slot controller last published.
#[derive(Debug, Clone, Default)]
pub struct SlotSnapshot {
    pub data_state: CellularDataState,
    pub apn_states: FnvIndexMap<ApnType, ApnProfileState, 16>,
    pub flow_type: CellDataFlowType,
    /// Cids of active connections carrying internet traffic.
    pub internet_cids: heapless::Vec<i32, MAX_ACTIVE_CONNECTIONS>,
    pub data_enabled: bool,
    pub roaming_enabled: bool,
    /// APN of the connection serving default traffic.
    pub default_apn: Option<Arc<ApnItem>>,
}

struct Shared {
    snapshot: SlotSnapshot,
    state_waker: WakerRegistration,
}

/// Slot state shared between the runner and its [`Control`] handles.
///
/// [`Control`]: super::control::Control
pub struct SlotState {
    slot_id: i32,
    shared: Mutex<CriticalSectionRawMutex, RefCell<Shared>>,
}

impl core::fmt::Debug for SlotState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotState")
            .field("slot_id", &self.slot_id)
            .field("data_state", &self.data_state(None))
            .finish()
    }
}

impl SlotState {
    pub fn new(slot_id: i32) -> Self {
        Self {
            slot_id,
            shared: Mutex::new(RefCell::new(Shared {
                snapshot: SlotSnapshot::default(),
                state_waker: WakerRegistration::new(),
            })),
        }
    }

    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    pub fn publish(&self, snapshot: SlotSnapshot) {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            if s.snapshot.data_state != snapshot.data_state {
                info!(
                    "Slot {} cellular data {:?} -> {:?}",
                    self.slot_id, s.snapshot.data_state, snapshot.data_state
                );
            }
            s.snapshot = snapshot;
            s.state_waker.wake();
        });
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.shared.lock(|s| s.borrow().snapshot.clone())
    }

    pub fn with_snapshot<R>(&self, f: impl FnOnce(&SlotSnapshot) -> R) -> R {
        self.shared.lock(|s| f(&s.borrow().snapshot))
    }

    pub fn data_state(&self, cx: Option<&mut Context>) -> CellularDataState {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            if let Some(cx) = cx {
                s.state_waker.register(cx.waker());
            }
            s.snapshot.data_state
        })
    }

    pub async fn wait_for_data_state(&self, state: CellularDataState) {
        if self.data_state(None) == state {
            return;
        }

        poll_fn(|cx| {
            if self.data_state(Some(cx)) == state {
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }

    pub async fn wait_data_state_change(&self) -> CellularDataState {
        let old_state = self.data_state(None);

        poll_fn(|cx| {
            let current = self.data_state(Some(cx));
            if current != old_state {
                return Poll::Ready(current);
            }
            Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn publish_replaces_snapshot() {
        let state = SlotState::new(0);
        assert_eq!(state.data_state(None), CellularDataState::Disconnected);

        let mut snapshot = SlotSnapshot {
            data_state: CellularDataState::Connected,
            data_enabled: true,
            ..Default::default()
        };
        snapshot
            .apn_states
            .insert(ApnType::Default, ApnProfileState::Connected)
            .unwrap();
        state.publish(snapshot);

        assert_eq!(state.data_state(None), CellularDataState::Connected);
        assert!(state.with_snapshot(|s| s.data_enabled));
        assert_eq!(
            state.snapshot().apn_states.get(&ApnType::Default),
            Some(&ApnProfileState::Connected)
        );
    }

    #[test]
    fn wait_returns_once_state_matches() {
        let state = SlotState::new(1);
        state.publish(SlotSnapshot {
            data_state: CellularDataState::Connecting,
            ..Default::default()
        });
        block_on(state.wait_for_data_state(CellularDataState::Connecting));
    }

    #[test]
    fn suspended_only_when_connected() {
        assert_eq!(
            CellularDataState::from_apn_state(ApnProfileState::Connected, true),
            CellularDataState::Suspended
        );
        assert_eq!(
            CellularDataState::from_apn_state(ApnProfileState::Retrying, true),
            CellularDataState::Connecting
        );
        assert_eq!(
            CellularDataState::from_apn_state(ApnProfileState::Failed, false),
            CellularDataState::Disconnected
        );
        assert_eq!(CellularDataState::Suspended.code(), 3);
    }
}
