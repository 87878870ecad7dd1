use std::sync::Arc;

use super::holder::{ApnHolder, ApnProfileState, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NONE};
use super::item::{ApnItem, ApnRecord, ApnType};
use crate::connection::handle::ConnectionHandle;
use crate::types::NetCapability;

pub fn apn_type_priority(apn_type: ApnType) -> i32 {
    match apn_type {
        ApnType::Mms | ApnType::Ims | ApnType::Ia | ApnType::Emergency => PRIORITY_HIGH,
        ApnType::Default
        | ApnType::InternalDefault
        | ApnType::Snssai1
        | ApnType::Snssai2
        | ApnType::Snssai3
        | ApnType::Snssai4
        | ApnType::Snssai5
        | ApnType::Snssai6 => PRIORITY_LOW,
        ApnType::Supl | ApnType::Dun | ApnType::Xcap | ApnType::Bip => PRIORITY_NONE,
    }
}

/// Capability bit of an APN type, 0 for types never advertised.
pub fn apn_type_to_capability(apn_type: ApnType) -> u64 {
    apn_type.capability().map(|c| c.bit()).unwrap_or(0)
}

/// APN type serving the first capability of `capability` in supplier order.
pub fn capability_to_apn_type(capability: u64) -> Option<ApnType> {
    NetCapability::ALL
        .into_iter()
        .find(|c| capability & c.bit() != 0)
        .map(ApnType::from_capability)
}

/// Every APN holder of a slot and the APN profiles they pick from.
#[derive(Debug)]
pub struct ApnManager {
    holders: Vec<ApnHolder>,
    all_apns: Vec<Arc<ApnItem>>,
    preferred_apn_id: Option<i32>,
}

impl Default for ApnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApnManager {
    pub fn new() -> Self {
        let mut holders: Vec<ApnHolder> = ApnType::ALL
            .into_iter()
            .map(|t| ApnHolder::new(t, apn_type_priority(t)))
            .collect();
        holders.sort_by_key(|h| core::cmp::Reverse(h.priority()));
        Self {
            holders,
            all_apns: Vec::new(),
            preferred_apn_id: None,
        }
    }

    /// Holders, highest priority first.
    pub fn sorted_holders(&self) -> impl Iterator<Item = &ApnHolder> {
        self.holders.iter()
    }

    pub fn sorted_holders_mut(&mut self) -> impl Iterator<Item = &mut ApnHolder> {
        self.holders.iter_mut()
    }

    pub fn find_apn_holder(&self, apn_type: ApnType) -> Option<&ApnHolder> {
        self.holders.iter().find(|h| h.apn_type() == apn_type)
    }

    pub fn find_apn_holder_mut(&mut self, apn_type: ApnType) -> Option<&mut ApnHolder> {
        self.holders.iter_mut().find(|h| h.apn_type() == apn_type)
    }

    /// Holder of the highest priority among the capabilities in `capability`.
    pub fn find_best_capability_apn_holder(&self, capability: u64) -> Option<&ApnHolder> {
        self.holders
            .iter()
            .find(|h| h.capability() != 0 && capability & h.capability() != 0)
    }

    /// Replace the profile set. Without any profile a placeholder default
    /// APN is used so the default holder still has something to try.
    pub fn create_all_apn_items(&mut self, records: &[ApnRecord]) -> usize {
        self.all_apns = records
            .iter()
            .cloned()
            .map(|r| Arc::new(ApnItem::from_record(r)))
            .collect();
        if self.all_apns.is_empty() {
            debug!("No apn profiles, using placeholder default apn");
            self.all_apns
                .push(Arc::new(ApnItem::make_default_apn(ApnType::Default)));
        }
        self.all_apns.len()
    }

    pub fn all_apn_items(&self) -> &[Arc<ApnItem>] {
        &self.all_apns
    }

    pub fn set_preferred_apn(&mut self, profile_id: i32) {
        self.preferred_apn_id = (profile_id >= 0).then_some(profile_id);
    }

    pub fn preferred_apn_id(&self) -> Option<i32> {
        self.preferred_apn_id
    }

    /// Items able to serve `apn_type` with a PDP protocol for the current
    /// roaming state. For default traffic the preferred profile goes first.
    pub fn filter_matched_apns(&self, apn_type: ApnType, roaming: bool) -> Vec<Arc<ApnItem>> {
        let mut matched: Vec<Arc<ApnItem>> = self
            .all_apns
            .iter()
            .filter(|apn| apn.can_deal_with_type(apn_type))
            .filter(|apn| !apn.protocol(roaming).trim().is_empty())
            .cloned()
            .collect();
        if matches!(apn_type, ApnType::Default | ApnType::InternalDefault) {
            if let Some(preferred) = self.preferred_apn_id {
                if let Some(pos) = matched.iter().position(|a| a.record.profile_id == preferred)
                {
                    let item = matched.remove(pos);
                    matched.insert(0, item);
                }
            }
        }
        matched
    }

    /// The most advanced state over every holder.
    pub fn overall_apn_state(&self) -> ApnProfileState {
        overall(self.holders.iter().map(|h| h.apn_state()))
    }

    pub fn overall_default_apn_state(&self) -> ApnProfileState {
        overall(
            self.holders
                .iter()
                .filter(|h| matches!(h.apn_type(), ApnType::Default | ApnType::InternalDefault))
                .map(|h| h.apn_state()),
        )
    }

    /// True when no holder still wanting data is bound to `machine`.
    pub fn is_data_connection_not_used(&self, machine: &Arc<ConnectionHandle>) -> bool {
        !self.holders.iter().any(|h| {
            h.is_data_call_enabled()
                && h.cellular_data_machine()
                    .is_some_and(|m| Arc::ptr_eq(m, machine))
        })
    }
}

fn overall(states: impl Iterator<Item = ApnProfileState>) -> ApnProfileState {
    let mut connecting = false;
    let mut disconnecting = false;
    let mut failed = false;
    for state in states {
        match state {
            ApnProfileState::Connected => return ApnProfileState::Connected,
            ApnProfileState::Connecting | ApnProfileState::Retrying => connecting = true,
            ApnProfileState::Disconnecting => disconnecting = true,
            ApnProfileState::Failed => failed = true,
            ApnProfileState::Idle => {}
        }
    }
    if connecting {
        ApnProfileState::Connecting
    } else if disconnecting {
        ApnProfileState::Disconnecting
    } else if failed {
        ApnProfileState::Failed
    } else {
        ApnProfileState::Idle
    }
}
