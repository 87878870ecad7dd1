use std::sync::Arc;

use crate::apn::holder::ApnProfileState;
use crate::apn::item::{ApnItem, ApnRecord, ApnType};
use crate::apn::manager::capability_to_apn_type;
use crate::error::Error;
use crate::event::{SlotEvent, SlotQueue, SlotRequest};
use crate::monitor::CellDataFlowType;
use crate::types::{DisconnectReason, NetRequest};

use super::state::{CellularDataState, SlotSnapshot, SlotState};

/// Handle to a running slot.
///
/// Requests are queued for the [`Runner`](super::runner::Runner); reads come
/// from the state it last published.
#[derive(Debug, Clone)]
pub struct Control {
    queue: SlotQueue,
    state: Arc<SlotState>,
}

impl Control {
    pub(crate) fn new(queue: SlotQueue, state: Arc<SlotState>) -> Self {
        Self { queue, state }
    }

    pub fn slot_id(&self) -> i32 {
        self.state.slot_id()
    }

    fn request(&self, request: SlotRequest) -> Result<(), Error> {
        self.queue.post(SlotEvent::Request(request))
    }

    pub fn request_net(&self, request: NetRequest) -> Result<(), Error> {
        if capability_to_apn_type(request.capability).is_none() {
            return Err(Error::InvalidParameter);
        }
        self.request(SlotRequest::RequestNet(request))
    }

    pub fn release_net(&self, request: NetRequest) -> Result<(), Error> {
        if capability_to_apn_type(request.capability).is_none() {
            return Err(Error::InvalidParameter);
        }
        self.request(SlotRequest::ReleaseNet(request))
    }

    pub fn set_data_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.request(SlotRequest::SetDataEnabled(enabled))
    }

    pub fn set_roaming_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.request(SlotRequest::SetRoamingEnabled(enabled))
    }

    pub fn set_incall_data_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.request(SlotRequest::SetIncallDataEnabled(enabled))
    }

    /// Tear down the connection of `apn_type`, or every connection.
    pub fn clear_connections(
        &self,
        apn_type: Option<ApnType>,
        reason: DisconnectReason,
    ) -> Result<(), Error> {
        self.request(SlotRequest::ClearConnections { apn_type, reason })
    }

    pub fn apn_changed(&self, records: Vec<ApnRecord>) -> Result<(), Error> {
        self.request(SlotRequest::ApnChanged(records))
    }

    pub fn set_preferred_apn(&self, profile_id: i32) -> Result<(), Error> {
        self.request(SlotRequest::SetPreferredApn(profile_id))
    }

    pub fn clear_flow_type(&self) -> Result<(), Error> {
        self.request(SlotRequest::ClearFlowType)
    }

    pub fn default_data_slot_changed(&self) -> Result<(), Error> {
        self.request(SlotRequest::DefaultDataSlotChanged)
    }

    pub fn cellular_data_state(&self) -> CellularDataState {
        self.state.data_state(None)
    }

    pub fn apn_state(&self, apn_type: ApnType) -> ApnProfileState {
        self.state
            .with_snapshot(|s| s.apn_states.get(&apn_type).copied().unwrap_or_default())
    }

    pub fn flow_type(&self) -> CellDataFlowType {
        self.state.with_snapshot(|s| s.flow_type)
    }

    pub fn is_data_enabled(&self) -> bool {
        self.state.with_snapshot(|s| s.data_enabled)
    }

    pub fn is_roaming_enabled(&self) -> bool {
        self.state.with_snapshot(|s| s.roaming_enabled)
    }

    /// Whether the active connection on `cid` carries internet traffic.
    pub fn has_internet_capability(&self, cid: i32) -> bool {
        self.state.with_snapshot(|s| s.internet_cids.contains(&cid))
    }

    pub fn default_apn(&self) -> Option<Arc<ApnItem>> {
        self.state.with_snapshot(|s| s.default_apn.clone())
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.state.snapshot()
    }

    pub async fn wait_for_cellular_data_state(&self, state: CellularDataState) {
        self.state.wait_for_data_state(state).await
    }

    pub async fn wait_cellular_data_state_change(&self) -> CellularDataState {
        self.state.wait_data_state_change().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::NetCapability;

    #[test]
    fn requests_are_queued() {
        let queue = SlotQueue::new(0);
        let control = Control::new(queue.clone(), Arc::new(SlotState::new(0)));

        control.set_data_enabled(false).unwrap();
        control
            .clear_connections(Some(ApnType::Mms), DisconnectReason::ClearConnection)
            .unwrap();
        assert!(matches!(
            queue.try_receive(),
            Some(SlotEvent::Request(SlotRequest::SetDataEnabled(false)))
        ));
        assert!(matches!(
            queue.try_receive(),
            Some(SlotEvent::Request(SlotRequest::ClearConnections {
                apn_type: Some(ApnType::Mms),
                reason: DisconnectReason::ClearConnection,
            }))
        ));
    }

    #[test]
    fn unknown_capability_rejected() {
        let queue = SlotQueue::new(0);
        let control = Control::new(queue.clone(), Arc::new(SlotState::new(0)));
        let request = NetRequest {
            capability: 0,
            ..Default::default()
        };
        assert_eq!(control.request_net(request.clone()), Err(Error::InvalidParameter));
        assert_eq!(control.release_net(request), Err(Error::InvalidParameter));
        assert!(queue.is_empty());

        let request = NetRequest {
            capability: NetCapability::Mms.bit(),
            ..Default::default()
        };
        control.request_net(request).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(control.apn_state(ApnType::Mms), ApnProfileState::Idle);
    }
}
