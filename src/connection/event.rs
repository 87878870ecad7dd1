use std::sync::Arc;

use crate::apn::item::{ApnItem, ApnType};
use crate::types::{
    DisconnectReason, FrequencyType, LinkCapability, NrState, RadioResponseError, RadioTech,
    SetupDataCallResult,
};

/// Everything needed to bring one data call up.
#[derive(Debug, Clone)]
pub struct DataConnectionParams {
    pub apn_type: ApnType,
    pub apn: Arc<ApnItem>,
    pub capability: u64,
    pub radio_tech: RadioTech,
    pub roaming: bool,
    pub allow_roaming: bool,
    pub user_request: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDisconnectParams {
    pub apn_type: ApnType,
    pub reason: DisconnectReason,
}

/// Events a connection state machine reacts to.
///
/// Payloads that can legitimately be missing (a racing teardown, a radio
/// response without body) are `Option`s; a `None` is logged and dropped by
/// the state that receives it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connect(Option<DataConnectionParams>),
    Disconnect(Option<DataDisconnectParams>),
    DisconnectAll(Option<DataDisconnectParams>),
    ActivateDone {
        connect_id: u32,
        result: Option<SetupDataCallResult>,
    },
    RadioError {
        connect_id: u32,
        error: Option<RadioResponseError>,
    },
    DeactivateDone {
        connect_id: u32,
    },
    ConnectTimeoutCheck {
        connect_id: u32,
    },
    DisconnectTimeoutCheck {
        connect_id: u32,
    },
    /// The modem no longer reports this call as active.
    LostConnection(Option<SetupDataCallResult>),
    DrsOrRatChanged(RadioTech),
    RoamOn,
    RoamOff,
    LinkCapabilityChanged(Option<LinkCapability>),
    VoiceCallStarted,
    VoiceCallEnded,
    NrStateChanged(NrState),
    NrFrequencyChanged(FrequencyType),
    /// Fresh call information for an established call.
    DataConnectionComplete(Option<SetupDataCallResult>),
    RadioAdapterHostDied,
    InterfaceLinkDown,
}
