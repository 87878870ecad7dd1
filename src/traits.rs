//! Interfaces of the collaborators the cellular data core drives.
//!
//! All of them are called from the slot runner and must not block on it.

use crate::error::Error;
use crate::link::{NetLinkInfo, NetSupplierInfo};
use crate::types::{
    ActivateDataParam, CallState, DataProfile, DeactivateDataParam, DsdsMode, FrequencyType,
    NetCapability, NrState, PacketCounts, RadioTech, RouteSelectionDescriptor,
};

/// Command side of the baseband. Answers arrive later as
/// [`RadioIndication`](crate::types::RadioIndication)s.
pub trait RadioLayer: Send + Sync {
    fn activate_pdp_context(&self, slot_id: i32, param: &ActivateDataParam) -> Result<(), Error>;
    fn deactivate_pdp_context(&self, slot_id: i32, param: &DeactivateDataParam)
        -> Result<(), Error>;
    fn get_pdp_context_list(&self, slot_id: i32) -> Result<(), Error>;
    fn set_data_permitted(&self, slot_id: i32, permitted: bool) -> Result<(), Error>;
    fn set_initial_apn(&self, _slot_id: i32, _profile: &DataProfile) -> Result<(), Error> {
        Ok(())
    }
    fn reregister_network(&self, slot_id: i32) -> Result<(), Error>;
    fn restart_radio(&self, slot_id: i32) -> Result<(), Error>;
}

pub trait SimAccount: Send + Sync {
    fn default_data_slot_id(&self) -> i32;
    fn set_default_data_slot_id(&self, slot_id: i32) -> Result<(), Error>;
    fn sim_id(&self, slot_id: i32) -> i32;
    fn has_sim_card(&self, slot_id: i32) -> bool;
    fn dsds_mode(&self) -> DsdsMode;
}

/// Radio technology and registration queries.
pub trait NetworkState: Send + Sync {
    fn ps_radio_tech(&self, slot_id: i32) -> RadioTech;
    fn is_ps_roaming(&self, slot_id: i32) -> bool;
    fn is_ps_attached(&self, slot_id: i32) -> bool;
    fn nr_state(&self, slot_id: i32) -> NrState;
    fn frequency_type(&self, slot_id: i32) -> FrequencyType;
    /// IMS voice or video registration.
    fn ims_registered(&self, slot_id: i32) -> bool;
    fn call_state(&self, slot_id: i32) -> CallState;
}

/// The platform's network supplier registry.
pub trait NetSupplierRegistry: Send + Sync {
    /// Returns the supplier id assigned by the platform, or its error code.
    fn register_net_supplier(&self, ident: &str, capability: NetCapability) -> Result<u32, i32>;
    fn unregister_net_supplier(&self, supplier_id: u32) -> Result<(), i32>;
    fn update_net_supplier_info(&self, supplier_id: u32, info: &NetSupplierInfo)
        -> Result<(), i32>;
    fn update_net_link_info(&self, supplier_id: u32, info: &NetLinkInfo) -> Result<(), i32>;
}

pub trait TrafficStats: Send + Sync {
    /// Cellular interface packet counters of a slot, `None` when unreadable.
    fn packets(&self, slot_id: i32) -> Option<PacketCounts>;
}

/// What a slice lookup is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceQuery<'a> {
    pub slice_index: Option<u8>,
    pub dnn: &'a str,
}

/// 5G network slice policy. Buffers are opaque protocol messages.
pub trait NetworkSlice: Send + Sync {
    fn route_selection(
        &self,
        _slot_id: i32,
        _query: &SliceQuery<'_>,
    ) -> Option<RouteSelectionDescriptor> {
        None
    }
    fn ursp_decode_result(&self, _slot_id: i32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
    fn ue_policy_section_identifier(&self, _slot_id: i32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
    fn ims_rsd_list(&self, _slot_id: i32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
    fn allowed_nssai(&self, _slot_id: i32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
    fn ehplmn(&self, _slot_id: i32, _buffer: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
}

/// Device without network slicing support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetworkSlice;

impl NetworkSlice for NoNetworkSlice {}

/// Device without traffic counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrafficStats;

impl TrafficStats for NoTrafficStats {
    fn packets(&self, _slot_id: i32) -> Option<PacketCounts> {
        None
    }
}
