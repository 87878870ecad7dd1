//! Request surface of the cellular data core.
//!
//! Every request is validated here (slot id, callback, buffer length) before
//! it reaches a slot. Failures map onto [`ResultCode`] at the caller's side
//! through `ResultCode::from`.

use core::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::apn::holder::ApnProfileState;
use crate::apn::item::{ApnAttribute, ApnRecord, ApnType};
use crate::asynch::control::Control;
use crate::asynch::state::CellularDataState;
use crate::context::Context;
use crate::error::Error;
use crate::monitor::CellDataFlowType;
use crate::types::{is_valid_slot_id, DisconnectReason};

/// Longest network slice policy buffer accepted.
pub const MAX_BUFFER_LEN: usize = 65_538;

/// Stable request codes of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestCode {
    IsCellularDataEnabled = 0,
    EnableCellularData = 1,
    GetCellularDataState = 2,
    IsCellularDataRoamingEnabled = 3,
    EnableCellularDataRoaming = 4,
    GetDefaultCellularDataSlotId = 5,
    SetDefaultCellularDataSlotId = 6,
    GetDefaultCellularDataSimId = 7,
    GetCellularDataFlowType = 8,
    ClearCellularDataFlowType = 9,
    HasInternetCapability = 10,
    ClearCellularDataConnections = 11,
    ClearAllConnections = 12,
    GetApnState = 13,
    RegisterSimAccountCallback = 14,
    UnregisterSimAccountCallback = 15,
    GetDataConnApnAttr = 16,
    SetDataConnApnAttr = 17,
    QueryApnInfo = 18,
    InsertApnInfo = 19,
    MergeApnInfo = 20,
    SetPreferApn = 21,
    SendUrspDecodeResult = 22,
    SendUePolicySectionIdentifier = 23,
    SendImsRsdList = 24,
    SyncAllowedNssaiWithModem = 25,
    SyncEhplmnWithModem = 26,
}

impl RequestCode {
    pub const ALL: [RequestCode; 27] = [
        Self::IsCellularDataEnabled,
        Self::EnableCellularData,
        Self::GetCellularDataState,
        Self::IsCellularDataRoamingEnabled,
        Self::EnableCellularDataRoaming,
        Self::GetDefaultCellularDataSlotId,
        Self::SetDefaultCellularDataSlotId,
        Self::GetDefaultCellularDataSimId,
        Self::GetCellularDataFlowType,
        Self::ClearCellularDataFlowType,
        Self::HasInternetCapability,
        Self::ClearCellularDataConnections,
        Self::ClearAllConnections,
        Self::GetApnState,
        Self::RegisterSimAccountCallback,
        Self::UnregisterSimAccountCallback,
        Self::GetDataConnApnAttr,
        Self::SetDataConnApnAttr,
        Self::QueryApnInfo,
        Self::InsertApnInfo,
        Self::MergeApnInfo,
        Self::SetPreferApn,
        Self::SendUrspDecodeResult,
        Self::SendUePolicySectionIdentifier,
        Self::SendImsRsdList,
        Self::SyncAllowedNssaiWithModem,
        Self::SyncEhplmnWithModem,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for RequestCode {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| c.code() == code)
            .ok_or(Error::InvalidParameter)
    }
}

/// Told when the default data slot or its SIM changes.
pub trait SimAccountCallback: Send + Sync {
    fn on_sim_account_changed(&self);
}

/// Kinds of network slice policy message forwarded to the slice service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicePolicy {
    UrspDecodeResult,
    UePolicySectionIdentifier,
    ImsRsdList,
    AllowedNssai,
    Ehplmn,
}

struct Shared {
    apn_records: BTreeMap<i32, Vec<ApnRecord>>,
    callbacks: Vec<Arc<dyn SimAccountCallback>>,
}

pub struct CellularDataService {
    ctx: Arc<Context>,
    slots: BTreeMap<i32, Control>,
    shared: Mutex<CriticalSectionRawMutex, RefCell<Shared>>,
}

impl core::fmt::Debug for CellularDataService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CellularDataService")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CellularDataService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            slots: BTreeMap::new(),
            shared: Mutex::new(RefCell::new(Shared {
                apn_records: BTreeMap::new(),
                callbacks: Vec::new(),
            })),
        }
    }

    /// Serve a slot started with `records` as its APN profiles.
    pub fn add_slot(&mut self, control: Control, records: Vec<ApnRecord>) {
        let slot_id = control.slot_id();
        self.shared.lock(|s| {
            s.borrow_mut().apn_records.insert(slot_id, records);
        });
        self.slots.insert(slot_id, control);
    }

    fn control(&self, slot_id: i32) -> Result<&Control, Error> {
        if !is_valid_slot_id(slot_id) {
            return Err(Error::InvalidSlot(slot_id));
        }
        self.slots.get(&slot_id).ok_or(Error::InvalidSlot(slot_id))
    }

    fn default_control(&self) -> Result<&Control, Error> {
        self.control(self.ctx.sim.default_data_slot_id())
    }

    pub fn is_cellular_data_enabled(&self, slot_id: i32) -> Result<bool, Error> {
        Ok(self.control(slot_id)?.is_data_enabled())
    }

    pub fn enable_cellular_data(&self, slot_id: i32, enable: bool) -> Result<(), Error> {
        self.control(slot_id)?.set_data_enabled(enable)
    }

    /// Data state of the default data slot.
    pub fn get_cellular_data_state(&self) -> Result<CellularDataState, Error> {
        Ok(self.default_control()?.cellular_data_state())
    }

    pub fn is_cellular_data_roaming_enabled(&self, slot_id: i32) -> Result<bool, Error> {
        Ok(self.control(slot_id)?.is_roaming_enabled())
    }

    pub fn enable_cellular_data_roaming(&self, slot_id: i32, enable: bool) -> Result<(), Error> {
        self.control(slot_id)?.set_roaming_enabled(enable)
    }

    pub fn get_default_cellular_data_slot_id(&self) -> i32 {
        self.ctx.sim.default_data_slot_id()
    }

    /// Move default data to `slot_id`. Every slot re-evaluates its default
    /// connection and registered callbacks are told.
    pub fn set_default_cellular_data_slot_id(&self, slot_id: i32) -> Result<(), Error> {
        self.control(slot_id)?;
        if !self.ctx.sim.has_sim_card(slot_id) {
            warn!("Slot {} has no sim, default data unchanged", slot_id);
            return Err(Error::InvalidParameter);
        }
        self.ctx.sim.set_default_data_slot_id(slot_id)?;
        info!("Default data slot is now {}", slot_id);
        for control in self.slots.values() {
            if let Err(e) = control.default_data_slot_changed() {
                error!("Slot {} missed default slot change: {}", control.slot_id(), e);
            }
        }
        self.notify_sim_account_changed();
        Ok(())
    }

    pub fn get_default_cellular_data_sim_id(&self) -> Result<i32, Error> {
        let slot_id = self.ctx.sim.default_data_slot_id();
        self.control(slot_id)?;
        if !self.ctx.sim.has_sim_card(slot_id) {
            return Err(Error::SimAccount(slot_id));
        }
        Ok(self.ctx.sim.sim_id(slot_id))
    }

    pub fn get_cellular_data_flow_type(&self) -> Result<CellDataFlowType, Error> {
        Ok(self.default_control()?.flow_type())
    }

    pub fn clear_cellular_data_flow_type(&self) -> Result<(), Error> {
        self.default_control()?.clear_flow_type()
    }

    pub fn has_internet_capability(&self, slot_id: i32, cid: i32) -> Result<bool, Error> {
        Ok(self.control(slot_id)?.has_internet_capability(cid))
    }

    pub fn clear_cellular_data_connections(&self, slot_id: i32) -> Result<(), Error> {
        self.control(slot_id)?
            .clear_connections(None, DisconnectReason::ClearConnection)
    }

    pub fn clear_all_connections(
        &self,
        slot_id: i32,
        reason: DisconnectReason,
    ) -> Result<(), Error> {
        self.control(slot_id)?.clear_connections(None, reason)
    }

    pub fn get_apn_state(&self, slot_id: i32, apn_type: &str) -> Result<ApnProfileState, Error> {
        let control = self.control(slot_id)?;
        let apn_type: ApnType = apn_type.parse()?;
        Ok(control.apn_state(apn_type))
    }

    pub fn register_sim_account_callback(
        &self,
        callback: Option<Arc<dyn SimAccountCallback>>,
    ) -> Result<(), Error> {
        let callback = callback.ok_or(Error::MissingCallback)?;
        self.shared.lock(|s| {
            let callbacks = &mut s.borrow_mut().callbacks;
            if !callbacks.iter().any(|c| same_callback(c, &callback)) {
                callbacks.push(callback);
            }
        });
        Ok(())
    }

    pub fn unregister_sim_account_callback(
        &self,
        callback: Option<&Arc<dyn SimAccountCallback>>,
    ) -> Result<(), Error> {
        let callback = callback.ok_or(Error::MissingCallback)?;
        self.shared.lock(|s| {
            s.borrow_mut()
                .callbacks
                .retain(|c| !same_callback(c, callback));
        });
        Ok(())
    }

    fn notify_sim_account_changed(&self) {
        let callbacks = self.shared.lock(|s| s.borrow().callbacks.clone());
        for callback in callbacks {
            callback.on_sim_account_changed();
        }
    }

    /// Attribute record of the APN serving default data, blank when none.
    pub fn get_data_conn_apn_attr(&self, slot_id: i32) -> Result<ApnAttribute, Error> {
        let control = self.control(slot_id)?;
        Ok(control
            .default_apn()
            .map(|apn| ApnAttribute::from(&apn.record))
            .unwrap_or_default())
    }

    pub fn set_data_conn_apn_attr(&self, slot_id: i32, attr: &ApnAttribute) -> Result<(), Error> {
        self.merge_apn_info(slot_id, ApnRecord::from(attr)).map(|_| ())
    }

    pub fn query_apn_info(&self, slot_id: i32) -> Result<Vec<ApnRecord>, Error> {
        self.control(slot_id)?;
        Ok(self.shared.lock(|s| {
            s.borrow()
                .apn_records
                .get(&slot_id)
                .cloned()
                .unwrap_or_default()
        }))
    }

    /// Add a profile. A non positive id gets the next free one, which is
    /// returned.
    pub fn insert_apn_info(&self, slot_id: i32, mut record: ApnRecord) -> Result<i32, Error> {
        let control = self.control(slot_id)?;
        if record.apn.trim().is_empty() {
            return Err(Error::InvalidParameter);
        }
        let records = self.shared.lock(|s| {
            let mut s = s.borrow_mut();
            let records = s.apn_records.entry(slot_id).or_default();
            if record.profile_id <= 0 || records.iter().any(|r| r.profile_id == record.profile_id)
            {
                record.profile_id = next_profile_id(records);
            }
            records.push(record.clone());
            records.clone()
        });
        debug!("Slot {} apn profile {} inserted", slot_id, record.profile_id);
        control.apn_changed(records)?;
        Ok(record.profile_id)
    }

    /// Replace the profile with the same id, marking it edited, or insert it.
    pub fn merge_apn_info(&self, slot_id: i32, mut record: ApnRecord) -> Result<i32, Error> {
        let control = self.control(slot_id)?;
        let merged = self.shared.lock(|s| {
            let mut s = s.borrow_mut();
            let records = s.apn_records.entry(slot_id).or_default();
            let existing = records
                .iter_mut()
                .find(|r| record.profile_id > 0 && r.profile_id == record.profile_id)?;
            record.edited = true;
            *existing = record.clone();
            Some(records.clone())
        });
        match merged {
            Some(records) => {
                debug!("Slot {} apn profile {} merged", slot_id, record.profile_id);
                control.apn_changed(records)?;
                Ok(record.profile_id)
            }
            None => self.insert_apn_info(slot_id, record),
        }
    }

    pub fn set_preferred_apn(&self, slot_id: i32, profile_id: i32) -> Result<(), Error> {
        let control = self.control(slot_id)?;
        let known = self.shared.lock(|s| {
            s.borrow()
                .apn_records
                .get(&slot_id)
                .is_some_and(|r| r.iter().any(|r| r.profile_id == profile_id))
        });
        if profile_id >= 0 && !known {
            return Err(Error::InvalidParameter);
        }
        control.set_preferred_apn(profile_id)
    }

    /// Forward a network slice policy message to the slice service.
    pub fn send_slice_policy(
        &self,
        slot_id: i32,
        policy: SlicePolicy,
        buffer: &[u8],
    ) -> Result<(), Error> {
        self.control(slot_id)?;
        if buffer.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if buffer.len() > MAX_BUFFER_LEN {
            return Err(Error::BufferTooLarge(buffer.len()));
        }
        let slice = &self.ctx.slice;
        match policy {
            SlicePolicy::UrspDecodeResult => slice.ursp_decode_result(slot_id, buffer),
            SlicePolicy::UePolicySectionIdentifier => {
                slice.ue_policy_section_identifier(slot_id, buffer)
            }
            SlicePolicy::ImsRsdList => slice.ims_rsd_list(slot_id, buffer),
            SlicePolicy::AllowedNssai => slice.allowed_nssai(slot_id, buffer),
            SlicePolicy::Ehplmn => slice.ehplmn(slot_id, buffer),
        }
    }
}

fn same_callback(a: &Arc<dyn SimAccountCallback>, b: &Arc<dyn SimAccountCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn next_profile_id(records: &[ApnRecord]) -> i32 {
    records
        .iter()
        .map(|r| r.profile_id)
        .max()
        .unwrap_or(0)
        .max(0)
        + 1
}
