//! Radio, telephony and network types shared across the crate.

use serde::{Deserialize, Serialize};

/// Highest valid SIM slot id plus one.
pub const MAX_SLOT_COUNT: i32 = 4;

/// A call id is only meaningful once the radio has accepted the activation.
pub const INVALID_CID: i32 = -1;

pub fn is_valid_slot_id(slot_id: i32) -> bool {
    (0..MAX_SLOT_COUNT).contains(&slot_id)
}

/// Packet-switched radio technology of a slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioTech {
    #[default]
    Unknown,
    Gsm,
    OneXRtt,
    Wcdma,
    Hspa,
    Hspap,
    TdScdma,
    Evdo,
    Ehrpd,
    Lte,
    LteCa,
    Iwlan,
    Nr,
}

impl RadioTech {
    /// Name used as key into the bandwidth and TCP buffer tables.
    ///
    /// NR is keyed further by NR state and frequency; see
    /// [`RadioTech::config_name_with_nr`].
    pub fn config_name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Gsm => "GSM",
            Self::OneXRtt => "1xRTT",
            Self::Wcdma => "WCDMA",
            Self::Hspa => "HSPA",
            Self::Hspap => "HSPAP",
            Self::TdScdma => "TD_SCDMA",
            Self::Evdo => "EVDO",
            Self::Ehrpd => "EHRPD",
            Self::Lte => "LTE",
            Self::LteCa => "LTE_CA",
            Self::Iwlan => "IWLAN",
            Self::Nr => "NR_SA",
        }
    }

    pub fn config_name_with_nr(self, nr_state: NrState, frequency: FrequencyType) -> &'static str {
        let nsa = nr_state == NrState::NsaDualConnected;
        match self {
            Self::Nr if nr_state == NrState::SaAttached => "NR_SA",
            Self::Nr | Self::Lte | Self::LteCa if nsa || self == Self::Nr => {
                if frequency == FrequencyType::MmWave {
                    "NR_NSA_MMWAVE"
                } else {
                    "NR_NSA"
                }
            }
            _ => self.config_name(),
        }
    }

    /// Technologies where an ongoing voice call suspends packet data.
    pub fn suspends_data_in_call(self) -> bool {
        matches!(self, Self::Gsm | Self::OneXRtt)
    }

    /// Technologies able to carry data alongside a voice call on the other slot.
    pub fn supports_concurrent_data(self) -> bool {
        matches!(
            self,
            Self::Wcdma | Self::Hspa | Self::Hspap | Self::Lte | Self::LteCa | Self::Nr
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NrState {
    #[default]
    NotSupport,
    NsaNoDetect,
    NsaConnectedDetect,
    NsaIdleDetect,
    NsaDualConnected,
    SaAttached,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyType {
    #[default]
    Unknown,
    MmWave,
}

/// Voice call state as reported by the telephony stack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Active,
    Holding,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Disconnecting,
    Disconnected,
}

impl CallState {
    pub fn in_call(self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnected)
    }
}

/// Dual SIM standby mode. Only `V2` needs the in-call data workaround.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DsdsMode {
    #[default]
    V2,
    V3,
    V5Tdm,
    V5Dsda,
}

/// Why a connection went (or is going) down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    #[default]
    Normal,
    GsmAndCallingOnly,
    RetryConnection,
    PermanentReject,
    ClearConnection,
    ChangeConnection,
}

/// PDP reject causes reported by the radio, 3GPP TS 24.008 values plus the
/// pseudo causes the radio layer uses for locally decided outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdpErrorReason {
    NoError,
    OperatorDeterminedBarring,
    NasSignalling,
    LlcSndcpFailure,
    InsufficientResources,
    MissingOrUnknownApn,
    UnknownPdpAddressOrType,
    UserAuthenticationFailed,
    ActivationRejectedGgsn,
    ActivationRejectedUnspecified,
    ServiceOptionNotSupported,
    ServiceOptionNotSubscribed,
    ServiceOptionOutOfOrder,
    NsapiInUse,
    RegularDeactivation,
    QosNotAccepted,
    NetworkFailure,
    ReactivationRequested,
    FeatureNotSupported,
    PdpTypeIpv4OnlyAllowed,
    PdpTypeIpv6OnlyAllowed,
    SingleAddressBearersOnly,
    MultipleConnectionsNotAllowed,
    ProtocolError,
    // Pseudo causes
    ToNormal,
    ToGsmAndCallingOnly,
    ToClearConnection,
    ToChangeConnection,
    ToPermanentReject,
    RetryConnection,
    RadioNotAvailable,
    Unknown(i32),
}

impl PdpErrorReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NoError,
            8 => Self::OperatorDeterminedBarring,
            14 => Self::NasSignalling,
            25 => Self::LlcSndcpFailure,
            26 => Self::InsufficientResources,
            27 => Self::MissingOrUnknownApn,
            28 => Self::UnknownPdpAddressOrType,
            29 => Self::UserAuthenticationFailed,
            30 => Self::ActivationRejectedGgsn,
            31 => Self::ActivationRejectedUnspecified,
            32 => Self::ServiceOptionNotSupported,
            33 => Self::ServiceOptionNotSubscribed,
            34 => Self::ServiceOptionOutOfOrder,
            35 => Self::NsapiInUse,
            36 => Self::RegularDeactivation,
            37 => Self::QosNotAccepted,
            38 => Self::NetworkFailure,
            39 => Self::ReactivationRequested,
            40 => Self::FeatureNotSupported,
            50 => Self::PdpTypeIpv4OnlyAllowed,
            51 => Self::PdpTypeIpv6OnlyAllowed,
            52 => Self::SingleAddressBearersOnly,
            55 => Self::MultipleConnectionsNotAllowed,
            95..=111 => Self::ProtocolError,
            -1 => Self::ToNormal,
            -2 => Self::ToGsmAndCallingOnly,
            -3 => Self::ToClearConnection,
            -4 => Self::ToChangeConnection,
            -5 => Self::ToPermanentReject,
            -6 => Self::RetryConnection,
            -7 => Self::RadioNotAvailable,
            other => Self::Unknown(other),
        }
    }
}

/// Capabilities a network supplier can advertise, with the platform's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum NetCapability {
    Mms = 0,
    Supl = 1,
    Dun = 2,
    Ia = 3,
    Xcap = 4,
    Bip = 5,
    Internet = 12,
    InternalDefault = 18,
    Snssai1 = 19,
    Snssai2 = 20,
    Snssai3 = 21,
    Snssai4 = 22,
    Snssai5 = 23,
    Snssai6 = 24,
}

impl NetCapability {
    /// Every capability a slot registers a supplier for.
    pub const ALL: [NetCapability; 14] = [
        Self::Internet,
        Self::Mms,
        Self::Supl,
        Self::Dun,
        Self::Ia,
        Self::Xcap,
        Self::Bip,
        Self::InternalDefault,
        Self::Snssai1,
        Self::Snssai2,
        Self::Snssai3,
        Self::Snssai4,
        Self::Snssai5,
        Self::Snssai6,
    ];

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u64 == code)
    }

    pub fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

/// A connectivity request as handed over by the network subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetRequest {
    pub uid: u32,
    pub request_id: i32,
    pub capability: u64,
    pub ident: String,
    pub register_type: u32,
}

/// APN profile handed to the radio on activation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataProfile {
    pub profile_id: i32,
    pub apn: String,
    pub protocol: String,
    pub roaming_protocol: String,
    pub auth_type: i32,
    pub user_name: String,
    pub password: String,
}

/// Network slice routing parameters attached to an activation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteSelectionDescriptor {
    pub snssai: String,
    pub ssc_mode: u8,
    pub dnn: String,
    pub pdu_session_type: u8,
}

/// Identifies a radio response with the attempt that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub machine: u32,
    pub connect_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateDataParam {
    pub token: RequestToken,
    pub radio_tech: RadioTech,
    pub profile: DataProfile,
    pub is_roaming: bool,
    pub allow_roaming: bool,
    pub route: Option<RouteSelectionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeactivateDataParam {
    pub token: RequestToken,
    pub cid: i32,
    pub reason: DisconnectReason,
}

/// One entry of a data call list, or the answer to an activation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupDataCallResult {
    /// 0 on success, a PDP cause code otherwise.
    pub reason: i32,
    /// Radio suggested retry delay in milliseconds, 0 or negative if none.
    pub retry_time: i64,
    pub cid: i32,
    /// 0 inactive, 1 active with link down, 2 active with link up.
    pub active: i32,
    pub pdu_session_id: i32,
    pub ip_type: String,
    pub iface_name: String,
    /// Space separated `address/prefix` tokens.
    pub address: String,
    pub dns: String,
    pub dns_sec: String,
    pub gateway: String,
    pub pcscf: String,
    pub mtu: u32,
}

impl SetupDataCallResult {
    pub fn is_success(&self) -> bool {
        self.reason == 0 && self.active > 0 && self.cid > INVALID_CID
    }
}

/// Radio reported link capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCapability {
    pub primary_downlink_kbps: u32,
    pub primary_uplink_kbps: u32,
    pub secondary_downlink_kbps: u32,
    pub secondary_uplink_kbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioResponseError {
    pub code: i32,
}

/// Cellular packet counters as read from the traffic statistics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketCounts {
    pub sent: u64,
    pub received: u64,
}

/// Indications and responses delivered by the radio layer and platform.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioIndication {
    SetupDataCallResponse {
        token: RequestToken,
        result: Result<SetupDataCallResult, RadioResponseError>,
    },
    DeactivateDataCallResponse {
        token: RequestToken,
        result: Result<(), RadioResponseError>,
    },
    DataCallListChanged(Vec<SetupDataCallResult>),
    RadioTechChanged(RadioTech),
    RoamingChanged(bool),
    NrStateChanged(NrState),
    NrFrequencyChanged(FrequencyType),
    CallStateChanged(CallState),
    LinkCapabilityChanged(LinkCapability),
    PsAttachChanged(bool),
    SimStateChanged { has_sim: bool },
    DsdsModeChanged(DsdsMode),
    RadioAdapterHostDied,
    InterfaceLinkDown(String),
    ScreenStateChanged(bool),
}
