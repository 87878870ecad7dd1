use core::str::FromStr;
use core::sync::atomic::{AtomicBool, Ordering};

use heapless::String as CappedString;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{DataProfile, NetCapability};

/// Logical APN categories, one holder each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApnType {
    Default,
    Mms,
    Supl,
    Dun,
    Ims,
    Ia,
    Emergency,
    InternalDefault,
    Xcap,
    Bip,
    Snssai1,
    Snssai2,
    Snssai3,
    Snssai4,
    Snssai5,
    Snssai6,
}

impl ApnType {
    pub const ALL: [ApnType; 16] = [
        Self::Default,
        Self::Mms,
        Self::Supl,
        Self::Dun,
        Self::Ims,
        Self::Ia,
        Self::Emergency,
        Self::InternalDefault,
        Self::Xcap,
        Self::Bip,
        Self::Snssai1,
        Self::Snssai2,
        Self::Snssai3,
        Self::Snssai4,
        Self::Snssai5,
        Self::Snssai6,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Mms => "mms",
            Self::Supl => "supl",
            Self::Dun => "dun",
            Self::Ims => "ims",
            Self::Ia => "ia",
            Self::Emergency => "emergency",
            Self::InternalDefault => "internal_default",
            Self::Xcap => "xcap",
            Self::Bip => "bip",
            Self::Snssai1 => "snssai1",
            Self::Snssai2 => "snssai2",
            Self::Snssai3 => "snssai3",
            Self::Snssai4 => "snssai4",
            Self::Snssai5 => "snssai5",
            Self::Snssai6 => "snssai6",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Network slice index encoded in the type, 1 based.
    pub fn slice_index(self) -> Option<u8> {
        match self {
            Self::Snssai1 => Some(1),
            Self::Snssai2 => Some(2),
            Self::Snssai3 => Some(3),
            Self::Snssai4 => Some(4),
            Self::Snssai5 => Some(5),
            Self::Snssai6 => Some(6),
            _ => None,
        }
    }

    /// Supplier capability served by this type. IMS and emergency are used
    /// by the telephony stack directly and never advertised.
    pub fn capability(self) -> Option<NetCapability> {
        match self {
            Self::Default => Some(NetCapability::Internet),
            Self::Mms => Some(NetCapability::Mms),
            Self::Supl => Some(NetCapability::Supl),
            Self::Dun => Some(NetCapability::Dun),
            Self::Ia => Some(NetCapability::Ia),
            Self::Xcap => Some(NetCapability::Xcap),
            Self::Bip => Some(NetCapability::Bip),
            Self::InternalDefault => Some(NetCapability::InternalDefault),
            Self::Snssai1 => Some(NetCapability::Snssai1),
            Self::Snssai2 => Some(NetCapability::Snssai2),
            Self::Snssai3 => Some(NetCapability::Snssai3),
            Self::Snssai4 => Some(NetCapability::Snssai4),
            Self::Snssai5 => Some(NetCapability::Snssai5),
            Self::Snssai6 => Some(NetCapability::Snssai6),
            Self::Ims | Self::Emergency => None,
        }
    }

    pub fn from_capability(capability: NetCapability) -> Self {
        match capability {
            NetCapability::Internet => Self::Default,
            NetCapability::Mms => Self::Mms,
            NetCapability::Supl => Self::Supl,
            NetCapability::Dun => Self::Dun,
            NetCapability::Ia => Self::Ia,
            NetCapability::Xcap => Self::Xcap,
            NetCapability::Bip => Self::Bip,
            NetCapability::InternalDefault => Self::InternalDefault,
            NetCapability::Snssai1 => Self::Snssai1,
            NetCapability::Snssai2 => Self::Snssai2,
            NetCapability::Snssai3 => Self::Snssai3,
            NetCapability::Snssai4 => Self::Snssai4,
            NetCapability::Snssai5 => Self::Snssai5,
            NetCapability::Snssai6 => Self::Snssai6,
        }
    }
}

impl FromStr for ApnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or(Error::InvalidParameter)
    }
}

/// Set of APN types an item can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApnTypes(u32);

impl ApnTypes {
    pub const NONE: ApnTypes = ApnTypes(0);
    pub const ALL: ApnTypes = ApnTypes(u32::MAX);

    pub fn single(apn_type: ApnType) -> Self {
        Self(apn_type.bit())
    }

    /// Parse a comma separated type string. `*` selects every type and unknown
    /// names are ignored.
    pub fn parse(types: &str) -> Self {
        let mut set = Self::NONE;
        for name in types.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return Self::ALL;
            }
            match name.parse::<ApnType>() {
                Ok(t) => set.0 |= t.bit(),
                Err(_) => debug!("Ignoring unknown apn type {}", name),
            }
        }
        set
    }

    pub fn contains(self, apn_type: ApnType) -> bool {
        self.0 & apn_type.bit() != 0
    }

    pub fn is_all(self) -> bool {
        self == Self::ALL
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ApnType> {
        ApnType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

/// One row of the APN profile database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApnRecord {
    pub profile_id: i32,
    pub profile_name: String,
    pub mcc: String,
    pub mnc: String,
    pub apn: String,
    pub apn_types: String,
    pub protocol: String,
    pub roaming_protocol: String,
    pub auth_type: i32,
    pub user: String,
    pub password: String,
    pub proxy: String,
    pub mms_proxy: String,
    pub mmsc: String,
    pub mvno_type: String,
    pub mvno_match_data: String,
    pub edited: bool,
}

impl ApnRecord {
    pub fn numeric(&self) -> String {
        format!("{}{}", self.mcc, self.mnc)
    }
}

pub const PROTOCOL_IPV4: &str = "IP";
pub const PROTOCOL_IPV6: &str = "IPV6";
pub const PROTOCOL_IPV4V6: &str = "IPV4V6";

fn normalize_protocol(protocol: &str) -> &str {
    let p = protocol.trim();
    if p.eq_ignore_ascii_case("IPV4") || p.eq_ignore_ascii_case("IP") {
        PROTOCOL_IPV4
    } else if p.eq_ignore_ascii_case("IPV6") {
        PROTOCOL_IPV6
    } else if p.eq_ignore_ascii_case("IPV4V6") {
        PROTOCOL_IPV4V6
    } else {
        p
    }
}

/// Whether two PDP protocols can be served by the same connection. Dual stack
/// is compatible with either single stack, but v4 only and v6 only are not.
pub fn is_similar_protocol(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_protocol(a), normalize_protocol(b));
    a == b || a == PROTOCOL_IPV4V6 || b == PROTOCOL_IPV4V6
}

/// An APN profile. Shared between holders and connections; only the bad flag
/// changes after construction.
#[derive(Debug)]
pub struct ApnItem {
    pub record: ApnRecord,
    types: ApnTypes,
    bad: AtomicBool,
}

impl ApnItem {
    pub fn from_record(record: ApnRecord) -> Self {
        let mut types = ApnTypes::parse(&record.apn_types);
        if types.is_empty() {
            types = ApnTypes::single(ApnType::Default);
        }
        Self {
            record,
            types,
            bad: AtomicBool::new(false),
        }
    }

    /// Placeholder used when the database has nothing for the current network.
    pub fn make_default_apn(apn_type: ApnType) -> Self {
        Self::from_record(ApnRecord {
            profile_id: -1,
            profile_name: String::from("default"),
            apn_types: String::from(apn_type.as_str()),
            protocol: String::from(PROTOCOL_IPV4V6),
            roaming_protocol: String::from(PROTOCOL_IPV4V6),
            ..Default::default()
        })
    }

    pub fn types(&self) -> ApnTypes {
        self.types
    }

    pub fn can_deal_with_type(&self, apn_type: ApnType) -> bool {
        self.types.is_all()
            || self.types.contains(apn_type)
            || (apn_type == ApnType::InternalDefault && self.types.contains(ApnType::Default))
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Relaxed)
    }

    pub fn mark_bad(&self, bad: bool) {
        self.bad.store(bad, Ordering::Relaxed);
    }

    pub fn is_edited(&self) -> bool {
        self.record.edited
    }

    pub fn protocol(&self, roaming: bool) -> &str {
        if roaming {
            &self.record.roaming_protocol
        } else {
            &self.record.protocol
        }
    }

    /// Whether `other` could replace this item without tearing the call down.
    pub fn is_compatible_apn_item(&self, other: &ApnItem, roaming: bool) -> bool {
        is_similar_protocol(self.protocol(roaming), other.protocol(roaming))
            && self.record.apn.eq_ignore_ascii_case(&other.record.apn)
            && self.record.auth_type == other.record.auth_type
            && self.record.user == other.record.user
            && self.record.password == other.record.password
            && self.record.proxy == other.record.proxy
            && self.record.mms_proxy == other.record.mms_proxy
            && self.types == other.types
    }

    pub fn data_profile(&self) -> DataProfile {
        DataProfile {
            profile_id: self.record.profile_id,
            apn: self.record.apn.clone(),
            protocol: self.record.protocol.clone(),
            roaming_protocol: self.record.roaming_protocol.clone(),
            auth_type: self.record.auth_type,
            user_name: self.record.user.clone(),
            password: self.record.password.clone(),
        }
    }
}

pub const APN_ATTR_LEN: usize = 256;
pub const APN_ATTR_SHORT_LEN: usize = 64;

/// Fixed size APN record for the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApnAttribute {
    pub types: CappedString<APN_ATTR_SHORT_LEN>,
    pub numeric: CappedString<APN_ATTR_SHORT_LEN>,
    pub profile_id: i32,
    pub protocol: CappedString<APN_ATTR_SHORT_LEN>,
    pub roaming_protocol: CappedString<APN_ATTR_SHORT_LEN>,
    pub auth_type: i32,
    pub apn: CappedString<APN_ATTR_LEN>,
    pub apn_name: CappedString<APN_ATTR_LEN>,
    pub user: CappedString<APN_ATTR_LEN>,
    pub password: CappedString<APN_ATTR_LEN>,
    pub proxy: CappedString<APN_ATTR_LEN>,
    pub mms_proxy: CappedString<APN_ATTR_LEN>,
    pub is_edited: bool,
}

/// Copy `s` into a capped string, cutting at the last char boundary that fits.
fn capped<const N: usize>(s: &str) -> CappedString<N> {
    let mut end = s.len().min(N);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = CappedString::new();
    // Cannot fail, `end <= N`.
    let _ = out.push_str(&s[..end]);
    out
}

impl From<&ApnRecord> for ApnAttribute {
    fn from(r: &ApnRecord) -> Self {
        Self {
            types: capped(&r.apn_types),
            numeric: capped(&r.numeric()),
            profile_id: r.profile_id,
            protocol: capped(&r.protocol),
            roaming_protocol: capped(&r.roaming_protocol),
            auth_type: r.auth_type,
            apn: capped(&r.apn),
            apn_name: capped(&r.profile_name),
            user: capped(&r.user),
            password: capped(&r.password),
            proxy: capped(&r.proxy),
            mms_proxy: capped(&r.mms_proxy),
            is_edited: r.edited,
        }
    }
}

impl From<&ApnAttribute> for ApnRecord {
    fn from(a: &ApnAttribute) -> Self {
        let numeric = a.numeric.as_str();
        let (mcc, mnc) = if numeric.len() >= 5 && numeric.is_char_boundary(3) {
            numeric.split_at(3)
        } else {
            (numeric, "")
        };
        Self {
            profile_id: a.profile_id,
            profile_name: a.apn_name.as_str().into(),
            mcc: mcc.into(),
            mnc: mnc.into(),
            apn: a.apn.as_str().into(),
            apn_types: a.types.as_str().into(),
            protocol: a.protocol.as_str().into(),
            roaming_protocol: a.roaming_protocol.as_str().into(),
            auth_type: a.auth_type,
            user: a.user.as_str().into(),
            password: a.password.as_str().into(),
            proxy: a.proxy.as_str().into(),
            mms_proxy: a.mms_proxy.as_str().into(),
            edited: a.is_edited,
            ..Default::default()
        }
    }
}
