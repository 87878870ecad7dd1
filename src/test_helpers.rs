//! Recording fakes of the platform collaborators.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::OperatorConfig;
use crate::connection::handle::ConnectionHandle;
use crate::context::Context;
use crate::error::Error;
use crate::event::SlotQueue;
use crate::link::{NetLinkInfo, NetSupplierInfo};
use crate::traits::{
    NetSupplierRegistry, NetworkSlice, NetworkState, RadioLayer, SimAccount, SliceQuery,
    TrafficStats,
};
use crate::types::{
    ActivateDataParam, CallState, DataProfile, DeactivateDataParam, DsdsMode, FrequencyType,
    NetCapability, NrState, PacketCounts, RadioTech, RouteSelectionDescriptor,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_handle(id: u32) -> Arc<ConnectionHandle> {
    Arc::new(ConnectionHandle::new(id, 0, SlotQueue::new(0)))
}

#[derive(Debug, Default)]
struct RadioLog {
    activations: Vec<ActivateDataParam>,
    deactivations: Vec<DeactivateDataParam>,
    data_permitted: Vec<(i32, bool)>,
    initial_apns: Vec<DataProfile>,
    call_list_requests: usize,
    reregistrations: usize,
    restarts: usize,
    fail_activation: bool,
}

#[derive(Debug, Default)]
pub struct MockRadio {
    log: Mutex<RadioLog>,
}

impl MockRadio {
    pub fn activations(&self) -> Vec<ActivateDataParam> {
        self.log.lock().unwrap().activations.clone()
    }

    pub fn deactivations(&self) -> Vec<DeactivateDataParam> {
        self.log.lock().unwrap().deactivations.clone()
    }

    pub fn data_permitted(&self) -> Vec<(i32, bool)> {
        self.log.lock().unwrap().data_permitted.clone()
    }

    pub fn initial_apns(&self) -> Vec<DataProfile> {
        self.log.lock().unwrap().initial_apns.clone()
    }

    pub fn call_list_requests(&self) -> usize {
        self.log.lock().unwrap().call_list_requests
    }

    pub fn reregistrations(&self) -> usize {
        self.log.lock().unwrap().reregistrations
    }

    pub fn restarts(&self) -> usize {
        self.log.lock().unwrap().restarts
    }

    /// Refuse activation requests outright.
    pub fn fail_activation(&self, fail: bool) {
        self.log.lock().unwrap().fail_activation = fail;
    }
}

impl RadioLayer for MockRadio {
    fn activate_pdp_context(&self, _slot_id: i32, param: &ActivateDataParam) -> Result<(), Error> {
        let mut log = self.log.lock().unwrap();
        if log.fail_activation {
            return Err(Error::Radio(-1));
        }
        log.activations.push(param.clone());
        Ok(())
    }

    fn deactivate_pdp_context(
        &self,
        _slot_id: i32,
        param: &DeactivateDataParam,
    ) -> Result<(), Error> {
        self.log.lock().unwrap().deactivations.push(param.clone());
        Ok(())
    }

    fn get_pdp_context_list(&self, _slot_id: i32) -> Result<(), Error> {
        self.log.lock().unwrap().call_list_requests += 1;
        Ok(())
    }

    fn set_data_permitted(&self, slot_id: i32, permitted: bool) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .data_permitted
            .push((slot_id, permitted));
        Ok(())
    }

    fn set_initial_apn(&self, _slot_id: i32, profile: &DataProfile) -> Result<(), Error> {
        self.log.lock().unwrap().initial_apns.push(profile.clone());
        Ok(())
    }

    fn reregister_network(&self, _slot_id: i32) -> Result<(), Error> {
        self.log.lock().unwrap().reregistrations += 1;
        Ok(())
    }

    fn restart_radio(&self, _slot_id: i32) -> Result<(), Error> {
        self.log.lock().unwrap().restarts += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct SimConfig {
    default_data_slot: i32,
    no_sim: Vec<i32>,
    dsds_mode: DsdsMode,
}

/// Every slot holds a SIM with id `slot + 1`; slot 0 carries data.
#[derive(Debug)]
pub struct MockSim {
    config: Mutex<SimConfig>,
}

impl Default for MockSim {
    fn default() -> Self {
        Self {
            config: Mutex::new(SimConfig {
                default_data_slot: 0,
                no_sim: Vec::new(),
                dsds_mode: DsdsMode::V2,
            }),
        }
    }
}

impl MockSim {
    pub fn set_default_data_slot(&self, slot_id: i32) {
        self.config.lock().unwrap().default_data_slot = slot_id;
    }

    pub fn default_data_slot(&self) -> i32 {
        self.config.lock().unwrap().default_data_slot
    }

    pub fn set_has_sim(&self, slot_id: i32, has_sim: bool) {
        let mut config = self.config.lock().unwrap();
        config.no_sim.retain(|s| *s != slot_id);
        if !has_sim {
            config.no_sim.push(slot_id);
        }
    }

    pub fn set_dsds_mode(&self, mode: DsdsMode) {
        self.config.lock().unwrap().dsds_mode = mode;
    }
}

impl SimAccount for MockSim {
    fn default_data_slot_id(&self) -> i32 {
        self.default_data_slot()
    }

    fn set_default_data_slot_id(&self, slot_id: i32) -> Result<(), Error> {
        self.set_default_data_slot(slot_id);
        Ok(())
    }

    fn sim_id(&self, slot_id: i32) -> i32 {
        slot_id + 1
    }

    fn has_sim_card(&self, slot_id: i32) -> bool {
        !self.config.lock().unwrap().no_sim.contains(&slot_id)
    }

    fn dsds_mode(&self) -> DsdsMode {
        self.config.lock().unwrap().dsds_mode
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotNetwork {
    radio_tech: RadioTech,
    roaming: bool,
    attached: bool,
    ims_registered: bool,
    call_state: CallState,
}

impl Default for SlotNetwork {
    fn default() -> Self {
        Self {
            radio_tech: RadioTech::Lte,
            roaming: false,
            attached: true,
            ims_registered: false,
            call_state: CallState::Idle,
        }
    }
}

/// Attached on LTE at home, no call, on every slot.
#[derive(Debug, Default)]
pub struct MockNetwork {
    slots: Mutex<BTreeMap<i32, SlotNetwork>>,
}

impl MockNetwork {
    fn slot(&self, slot_id: i32) -> SlotNetwork {
        self.slots
            .lock()
            .unwrap()
            .get(&slot_id)
            .copied()
            .unwrap_or_default()
    }

    fn update(&self, slot_id: i32, f: impl FnOnce(&mut SlotNetwork)) {
        f(self.slots.lock().unwrap().entry(slot_id).or_default());
    }

    pub fn set_radio_tech(&self, slot_id: i32, radio_tech: RadioTech) {
        self.update(slot_id, |s| s.radio_tech = radio_tech);
    }

    pub fn set_roaming(&self, slot_id: i32, roaming: bool) {
        self.update(slot_id, |s| s.roaming = roaming);
    }

    pub fn set_attached(&self, slot_id: i32, attached: bool) {
        self.update(slot_id, |s| s.attached = attached);
    }

    pub fn set_ims_registered(&self, slot_id: i32, registered: bool) {
        self.update(slot_id, |s| s.ims_registered = registered);
    }

    pub fn set_call_state(&self, slot_id: i32, call_state: CallState) {
        self.update(slot_id, |s| s.call_state = call_state);
    }
}

impl NetworkState for MockNetwork {
    fn ps_radio_tech(&self, slot_id: i32) -> RadioTech {
        self.slot(slot_id).radio_tech
    }

    fn is_ps_roaming(&self, slot_id: i32) -> bool {
        self.slot(slot_id).roaming
    }

    fn is_ps_attached(&self, slot_id: i32) -> bool {
        self.slot(slot_id).attached
    }

    fn nr_state(&self, _slot_id: i32) -> NrState {
        NrState::NotSupport
    }

    fn frequency_type(&self, _slot_id: i32) -> FrequencyType {
        FrequencyType::Unknown
    }

    fn ims_registered(&self, slot_id: i32) -> bool {
        self.slot(slot_id).ims_registered
    }

    fn call_state(&self, slot_id: i32) -> CallState {
        self.slot(slot_id).call_state
    }
}

#[derive(Debug, Default)]
struct RegistryLog {
    next_id: u32,
    registered: Vec<(String, NetCapability)>,
    unregistered: Vec<u32>,
    failing: Vec<NetCapability>,
    supplier_updates: Vec<(u32, NetSupplierInfo)>,
    link_updates: Vec<(u32, NetLinkInfo)>,
}

#[derive(Debug, Default)]
pub struct MockSupplierRegistry {
    log: Mutex<RegistryLog>,
}

impl MockSupplierRegistry {
    pub fn registered(&self) -> Vec<(String, NetCapability)> {
        self.log.lock().unwrap().registered.clone()
    }

    pub fn unregistered(&self) -> Vec<u32> {
        self.log.lock().unwrap().unregistered.clone()
    }

    pub fn fail_registration(&self, capability: NetCapability) {
        self.log.lock().unwrap().failing.push(capability);
    }

    pub fn supplier_updates(&self) -> Vec<(u32, NetSupplierInfo)> {
        self.log.lock().unwrap().supplier_updates.clone()
    }

    pub fn link_updates(&self) -> Vec<(u32, NetLinkInfo)> {
        self.log.lock().unwrap().link_updates.clone()
    }
}

impl NetSupplierRegistry for MockSupplierRegistry {
    fn register_net_supplier(&self, ident: &str, capability: NetCapability) -> Result<u32, i32> {
        let mut log = self.log.lock().unwrap();
        if log.failing.contains(&capability) {
            return Err(-1);
        }
        log.next_id += 1;
        log.registered.push((ident.to_string(), capability));
        Ok(log.next_id)
    }

    fn unregister_net_supplier(&self, supplier_id: u32) -> Result<(), i32> {
        self.log.lock().unwrap().unregistered.push(supplier_id);
        Ok(())
    }

    fn update_net_supplier_info(
        &self,
        supplier_id: u32,
        info: &NetSupplierInfo,
    ) -> Result<(), i32> {
        self.log
            .lock()
            .unwrap()
            .supplier_updates
            .push((supplier_id, info.clone()));
        Ok(())
    }

    fn update_net_link_info(&self, supplier_id: u32, info: &NetLinkInfo) -> Result<(), i32> {
        self.log
            .lock()
            .unwrap()
            .link_updates
            .push((supplier_id, info.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockTraffic {
    counts: Mutex<Option<PacketCounts>>,
}

impl MockTraffic {
    pub fn set(&self, counts: PacketCounts) {
        *self.counts.lock().unwrap() = Some(counts);
    }
}

impl TrafficStats for MockTraffic {
    fn packets(&self, _slot_id: i32) -> Option<PacketCounts> {
        *self.counts.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct SliceLog {
    route: Option<RouteSelectionDescriptor>,
    last_query: Option<(Option<u8>, String)>,
    buffers: Vec<(&'static str, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct MockSlice {
    log: Mutex<SliceLog>,
}

impl MockSlice {
    pub fn set_route(&self, route: Option<RouteSelectionDescriptor>) {
        self.log.lock().unwrap().route = route;
    }

    pub fn last_query(&self) -> Option<(Option<u8>, String)> {
        self.log.lock().unwrap().last_query.clone()
    }

    /// Policy buffers received, tagged with the kind of message.
    pub fn buffers(&self) -> Vec<(&'static str, Vec<u8>)> {
        self.log.lock().unwrap().buffers.clone()
    }

    fn record(&self, kind: &'static str, buffer: &[u8]) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .buffers
            .push((kind, buffer.to_vec()));
        Ok(())
    }
}

impl NetworkSlice for MockSlice {
    fn route_selection(
        &self,
        _slot_id: i32,
        query: &SliceQuery<'_>,
    ) -> Option<RouteSelectionDescriptor> {
        let mut log = self.log.lock().unwrap();
        log.last_query = Some((query.slice_index, query.dnn.to_string()));
        log.route.clone()
    }

    fn ursp_decode_result(&self, _slot_id: i32, buffer: &[u8]) -> Result<(), Error> {
        self.record("ursp", buffer)
    }

    fn ue_policy_section_identifier(&self, _slot_id: i32, buffer: &[u8]) -> Result<(), Error> {
        self.record("upsi", buffer)
    }

    fn ims_rsd_list(&self, _slot_id: i32, buffer: &[u8]) -> Result<(), Error> {
        self.record("ims_rsd", buffer)
    }

    fn allowed_nssai(&self, _slot_id: i32, buffer: &[u8]) -> Result<(), Error> {
        self.record("nssai", buffer)
    }

    fn ehplmn(&self, _slot_id: i32, buffer: &[u8]) -> Result<(), Error> {
        self.record("ehplmn", buffer)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MockOperatorConfig {
    pub bandwidth: Option<String>,
    pub tcp_buffer: Option<String>,
    pub mtu: Option<String>,
    pub multiple_connections: bool,
    pub bandwidth_source_modem: bool,
    pub nr_uplink_follows_lte: bool,
    pub preferred_apn: Option<i32>,
}

impl OperatorConfig for MockOperatorConfig {
    fn bandwidth_config(&self, _slot_id: i32) -> Option<String> {
        self.bandwidth.clone()
    }

    fn tcp_buffer_config(&self, _slot_id: i32) -> Option<String> {
        self.tcp_buffer.clone()
    }

    fn mtu_config(&self, _slot_id: i32) -> Option<String> {
        self.mtu.clone()
    }

    fn multiple_connections_enabled(&self, _slot_id: i32) -> bool {
        self.multiple_connections
    }

    fn bandwidth_source_modem(&self, _slot_id: i32) -> bool {
        self.bandwidth_source_modem
    }

    fn nr_uplink_follows_lte(&self, _slot_id: i32) -> bool {
        self.nr_uplink_follows_lte
    }

    fn preferred_apn_id(&self, _slot_id: i32) -> Option<i32> {
        self.preferred_apn
    }
}

#[derive(Debug, Clone)]
pub struct TestMocks {
    pub radio: Arc<MockRadio>,
    pub sim: Arc<MockSim>,
    pub network: Arc<MockNetwork>,
    pub registry: Arc<MockSupplierRegistry>,
    pub traffic: Arc<MockTraffic>,
    pub slice: Arc<MockSlice>,
}

pub fn test_context() -> (Arc<Context>, TestMocks) {
    test_context_with_operator(MockOperatorConfig::default())
}

pub fn test_context_with_operator(operator: MockOperatorConfig) -> (Arc<Context>, TestMocks) {
    let mocks = TestMocks {
        radio: Arc::new(MockRadio::default()),
        sim: Arc::new(MockSim::default()),
        network: Arc::new(MockNetwork::default()),
        registry: Arc::new(MockSupplierRegistry::default()),
        traffic: Arc::new(MockTraffic::default()),
        slice: Arc::new(MockSlice::default()),
    };
    let ctx = Context::new(
        mocks.radio.clone(),
        mocks.sim.clone(),
        mocks.network.clone(),
        mocks.registry.clone(),
    )
    .with_operator_config(Arc::new(operator))
    .with_traffic_stats(mocks.traffic.clone())
    .with_network_slice(mocks.slice.clone());
    (Arc::new(ctx), mocks)
}
