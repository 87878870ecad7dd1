//! State machine driving one radio data call.
//!
//! ```text
//!             Default
//!   +-----------+-----------+--------------+
//! Inactive  Activating    Active    Disconnecting
//! ```
//!
//! Events are offered to the current leaf first and then to `Default`. A
//! state may park an event until the next transition; parked events are
//! replayed right after the transition, ahead of anything queued later.

use std::collections::VecDeque;
use std::sync::Arc;

use embassy_time::Instant;

use super::event::{ConnectionEvent, DataConnectionParams, DataDisconnectParams};
use super::handle::{ConnectionHandle, MachineId};
use super::slice::resolve_route_selection;
use super::ConnectionState;
use crate::apn::item::{ApnItem, ApnType};
use crate::apn::retry::{convert_pdp_error_to_disconn_reason, RetryScene};
use crate::context::Context;
use crate::error::Error;
use crate::event::HandlerEvent;
use crate::hsm::{transition_path, Outcome, StateTree};
use crate::link::{
    gateway_routes, ip_type_of, net_score_by_slot_id, parse_address_list, resolve_mtu,
    split_proxy_ip_address, HttpProxy, NetLinkInfo, NetSupplierInfo,
};
use crate::manager::{DataConnectionManager, LinkBandwidth};
use crate::net_agent::supplier_ident;
use crate::timer::DeferredTimers;
use crate::timing;
use crate::types::{
    ActivateDataParam, DeactivateDataParam, DisconnectReason, FrequencyType, LinkCapability,
    NetCapability, NrState, PdpErrorReason, RadioTech, RequestToken, SetupDataCallResult,
    INVALID_CID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTimer {
    ConnectTimeout,
    DisconnectTimeout,
}

/// Why the last call went down, reported once `Inactive` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Teardown {
    reason: DisconnectReason,
    cause: PdpErrorReason,
    retry_after_ms: i64,
    scene: RetryScene,
}

impl Teardown {
    fn retry(scene: RetryScene) -> Self {
        Self {
            reason: DisconnectReason::RetryConnection,
            cause: PdpErrorReason::RetryConnection,
            retry_after_ms: 0,
            scene,
        }
    }

    fn from_call(result: &SetupDataCallResult, scene: RetryScene) -> Self {
        let cause = PdpErrorReason::from_code(result.reason);
        let reason = match cause {
            PdpErrorReason::NoError => DisconnectReason::RetryConnection,
            other => convert_pdp_error_to_disconn_reason(other),
        };
        Self {
            reason,
            cause,
            retry_after_ms: result.retry_time,
            scene,
        }
    }
}

pub struct CellularDataStateMachine {
    handle: Arc<ConnectionHandle>,
    ctx: Arc<Context>,
    manager: Arc<DataConnectionManager>,
    state: ConnectionState,
    deferred: VecDeque<ConnectionEvent>,
    timers: DeferredTimers<ConnectionTimer, ConnectionEvent>,

    connect_id: u32,
    cid: i32,
    capability: u64,
    reuse_capability: u64,
    apn_type: Option<ApnType>,
    apn_item: Option<Arc<ApnItem>>,
    rat: RadioTech,
    roaming: bool,
    nr_state: NrState,
    frequency: FrequencyType,
    voice_call_active: bool,
    modem_bandwidth: Option<LinkBandwidth>,
    bandwidth: LinkBandwidth,
    tcp_buffer: String,
    link_info: NetLinkInfo,
    supplier_info: NetSupplierInfo,
    proxy: Option<HttpProxy>,
    start_time: Option<Instant>,
    disconnect_params: Option<DataDisconnectParams>,
    teardown: Option<Teardown>,
}

impl core::fmt::Debug for CellularDataStateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CellularDataStateMachine")
            .field("id", &self.handle.id())
            .field("state", &self.state)
            .field("connect_id", &self.connect_id)
            .field("cid", &self.cid)
            .field("apn_type", &self.apn_type)
            .finish()
    }
}

impl CellularDataStateMachine {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        ctx: Arc<Context>,
        manager: Arc<DataConnectionManager>,
    ) -> Self {
        let mut machine = Self {
            handle,
            ctx,
            manager,
            state: ConnectionState::Default,
            deferred: VecDeque::new(),
            timers: DeferredTimers::new(),
            connect_id: 0,
            cid: INVALID_CID,
            capability: 0,
            reuse_capability: 0,
            apn_type: None,
            apn_item: None,
            rat: RadioTech::Unknown,
            roaming: false,
            nr_state: NrState::NotSupport,
            frequency: FrequencyType::Unknown,
            voice_call_active: false,
            modem_bandwidth: None,
            bandwidth: LinkBandwidth::default(),
            tcp_buffer: String::new(),
            link_info: NetLinkInfo::default(),
            supplier_info: NetSupplierInfo::default(),
            proxy: None,
            start_time: None,
            disconnect_params: None,
            teardown: None,
        };
        machine.transition(ConnectionState::Inactive);
        machine
    }

    pub fn id(&self) -> MachineId {
        self.handle.id()
    }

    pub fn slot_id(&self) -> i32 {
        self.handle.slot_id()
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn cid(&self) -> i32 {
        self.cid
    }

    pub fn apn_type(&self) -> Option<ApnType> {
        self.apn_type
    }

    pub fn apn_item(&self) -> Option<&Arc<ApnItem>> {
        self.apn_item.as_ref()
    }

    pub fn capability(&self) -> u64 {
        self.capability
    }

    pub fn link_info(&self) -> &NetLinkInfo {
        &self.link_info
    }

    pub fn supplier_info(&self) -> &NetSupplierInfo {
        &self.supplier_info
    }

    pub fn bandwidth(&self) -> LinkBandwidth {
        self.bandwidth
    }

    pub fn tcp_buffer(&self) -> &str {
        &self.tcp_buffer
    }

    pub fn proxy(&self) -> Option<&HttpProxy> {
        self.proxy.as_ref()
    }

    /// When the current activation attempt was issued.
    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn is_timer_pending(&self, timer: ConnectionTimer) -> bool {
        self.timers.is_pending(timer)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now` through the normal event path.
    pub fn on_timer(&mut self, now: Instant) {
        for event in self.timers.take_due(now) {
            self.process(event);
        }
    }

    /// Additional capability riding on this connection for another holder.
    pub fn add_reuse_capability(&mut self, capability: u64) {
        self.reuse_capability |= capability;
        self.handle.update(|s| s.reuse_capability |= capability);
        if self.state == ConnectionState::Active {
            self.push_supplier_info();
            self.push_link_info();
        }
    }

    pub fn remove_reuse_capability(&mut self, capability: u64) {
        if self.reuse_capability & capability == 0 {
            return;
        }
        if self.state == ConnectionState::Active {
            let gone = NetSupplierInfo {
                is_available: false,
                ..self.supplier_info.clone()
            };
            self.push_supplier_info_for(capability, &gone);
        }
        self.reuse_capability &= !capability;
        self.handle.update(|s| s.reuse_capability &= !capability);
    }

    pub fn process(&mut self, event: ConnectionEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            match self.dispatch(&event) {
                Outcome::Handled | Outcome::NotHandled => {}
                Outcome::Defer => {
                    trace!("Machine {} defers {:?} in {:?}", self.id(), event, self.state);
                    self.deferred.push_back(event);
                }
                Outcome::Transition(to) => {
                    self.transition(to);
                    let mut replay = core::mem::take(&mut self.deferred);
                    replay.append(&mut pending);
                    pending = replay;
                }
            }
        }
    }

    fn dispatch(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        for state in self.state.lineage() {
            let outcome = match state {
                ConnectionState::Default => self.default_state(event),
                ConnectionState::Inactive => self.inactive_state(event),
                ConnectionState::Activating => self.activating_state(event),
                ConnectionState::Active => self.active_state(event),
                ConnectionState::Disconnecting => self.disconnecting_state(event),
            };
            if outcome != Outcome::NotHandled {
                return outcome;
            }
        }
        Outcome::NotHandled
    }

    fn transition(&mut self, to: ConnectionState) {
        let (exits, entries) = transition_path(self.state, to);
        for state in exits {
            self.exit(state);
        }
        debug!("Machine {} {:?} -> {:?}", self.id(), self.state, to);
        self.state = to;
        self.handle.update(|s| s.state = to);
        for state in entries {
            self.enter(state);
        }
    }

    fn enter(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Default => {}
            ConnectionState::Inactive => self.enter_inactive(),
            ConnectionState::Activating => {
                self.start_time = Some(Instant::now());
                self.timers.schedule(
                    ConnectionTimer::ConnectTimeout,
                    timing::connect_task_timeout(),
                    ConnectionEvent::ConnectTimeoutCheck {
                        connect_id: self.connect_id,
                    },
                );
            }
            ConnectionState::Active => self.enter_active(),
            ConnectionState::Disconnecting => self.enter_disconnecting(),
        }
    }

    fn exit(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Activating => {
                self.timers.cancel(ConnectionTimer::ConnectTimeout);
            }
            ConnectionState::Active => {
                self.manager.remove_active_connection_by_cid(self.cid);
                self.supplier_info.is_available = false;
                self.push_supplier_info();
            }
            ConnectionState::Disconnecting => {
                self.timers.cancel(ConnectionTimer::DisconnectTimeout);
            }
            ConnectionState::Default | ConnectionState::Inactive => {}
        }
    }

    fn enter_inactive(&mut self) {
        self.connect_id = self.connect_id.wrapping_add(1);
        self.cid = INVALID_CID;
        self.link_info = NetLinkInfo::default();
        self.supplier_info.is_available = false;
        self.modem_bandwidth = None;
        self.disconnect_params = None;
        self.handle.update(|s| {
            s.cid = INVALID_CID;
            s.iface_name.clear();
        });

        let Some(teardown) = self.teardown.take() else {
            return;
        };
        debug!(
            "Machine {} down, reason {:?} cause {:?}",
            self.id(),
            teardown.reason,
            teardown.cause
        );
        let event = HandlerEvent::DisconnectComplete {
            machine: self.id(),
            apn_type: self.apn_type,
            reason: teardown.reason,
            cause: teardown.cause,
            retry_after_ms: teardown.retry_after_ms,
            scene: teardown.scene,
        };
        if let Err(e) = self.handle.notify(event) {
            error!("Machine {} cannot report disconnect: {}", self.id(), e);
        }
    }

    fn enter_active(&mut self) {
        if let Err(e) = self
            .manager
            .add_active_connection_by_cid(self.cid, self.handle.clone())
        {
            error!("Machine {} cid {} not indexed: {}", self.id(), self.cid, e);
        }
        let cid = self.cid;
        self.handle.update(|s| s.cid = cid);
        self.refresh_tcp_buffer();
        self.refresh_bandwidth();
        self.supplier_info.is_available = true;
        self.supplier_info.is_roaming = self.roaming;
        self.push_supplier_info();
        self.push_link_info();

        let Some(apn_type) = self.apn_type else {
            return;
        };
        info!(
            "Machine {} established {} on cid {}",
            self.id(),
            apn_type.as_str(),
            self.cid
        );
        let event = HandlerEvent::EstablishComplete {
            machine: self.id(),
            apn_type,
            cid: self.cid,
        };
        if let Err(e) = self.handle.notify(event) {
            error!("Machine {} cannot report establish: {}", self.id(), e);
        }
    }

    fn enter_disconnecting(&mut self) {
        let reason = self
            .disconnect_params
            .map(|p| p.reason)
            .unwrap_or_default();
        let param = DeactivateDataParam {
            token: self.token(),
            cid: self.cid,
            reason,
        };
        self.timers.schedule(
            ConnectionTimer::DisconnectTimeout,
            timing::disconnect_timeout(),
            ConnectionEvent::DisconnectTimeoutCheck {
                connect_id: self.connect_id,
            },
        );
        if let Err(e) = self.ctx.radio.deactivate_pdp_context(self.slot_id(), &param) {
            // Nothing left to wait for.
            warn!("Machine {} deactivate failed: {}", self.id(), e);
            let done = ConnectionEvent::DeactivateDone {
                connect_id: self.connect_id,
            };
            if let Err(e) = self.handle.post(done) {
                error!("Machine {} cannot finish teardown: {}", self.id(), e);
            }
        }
    }

    fn token(&self) -> RequestToken {
        RequestToken {
            machine: self.id(),
            connect_id: self.connect_id,
        }
    }

    fn default_state(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        match event {
            ConnectionEvent::DrsOrRatChanged(rat) => self.rat = *rat,
            ConnectionEvent::RoamOn => self.roaming = true,
            ConnectionEvent::RoamOff => self.roaming = false,
            ConnectionEvent::VoiceCallStarted => self.voice_call_active = true,
            ConnectionEvent::VoiceCallEnded => self.voice_call_active = false,
            ConnectionEvent::NrStateChanged(state) => self.nr_state = *state,
            ConnectionEvent::NrFrequencyChanged(freq) => self.frequency = *freq,
            other => {
                debug!(
                    "Machine {} ignores {:?} in {:?}",
                    self.id(),
                    other,
                    self.state
                );
            }
        }
        Outcome::Handled
    }

    fn inactive_state(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        match event {
            ConnectionEvent::Connect(Some(params)) => match self.do_connect(params) {
                Ok(()) => Outcome::Transition(ConnectionState::Activating),
                Err(e) => {
                    warn!("Machine {} activate failed: {}", self.id(), e);
                    self.teardown = Some(Teardown::retry(RetryScene::SetupData));
                    Outcome::Transition(ConnectionState::Inactive)
                }
            },
            ConnectionEvent::Connect(None) => {
                warn!("Machine {} connect without parameters", self.id());
                Outcome::Handled
            }
            ConnectionEvent::Disconnect(_) | ConnectionEvent::DisconnectAll(_) => {
                trace!("Machine {} already inactive", self.id());
                Outcome::Handled
            }
            _ => Outcome::NotHandled,
        }
    }

    fn do_connect(&mut self, params: &DataConnectionParams) -> Result<(), Error> {
        self.apn_type = Some(params.apn_type);
        self.apn_item = Some(params.apn.clone());
        self.capability = params.capability;
        self.rat = params.radio_tech;
        self.roaming = params.roaming;
        self.proxy = Some(params.apn.record.proxy.as_str())
            .filter(|p| !p.is_empty())
            .map(split_proxy_ip_address);

        let apn = params.apn.clone();
        let capability = params.capability;
        let apn_type = params.apn_type;
        self.handle.update(|s| {
            s.apn_type = Some(apn_type);
            s.apn = Some(apn);
            s.capability = capability;
        });

        let param = ActivateDataParam {
            token: self.token(),
            radio_tech: params.radio_tech,
            profile: params.apn.data_profile(),
            is_roaming: params.roaming,
            allow_roaming: params.allow_roaming,
            route: resolve_route_selection(&self.ctx, self.slot_id(), params.apn_type, &params.apn),
        };
        info!(
            "Machine {} activating {} apn {:?} attempt {}",
            self.id(),
            params.apn_type.as_str(),
            params.apn.record.apn,
            self.connect_id
        );
        self.ctx.radio.activate_pdp_context(self.slot_id(), &param)
    }

    fn is_stale(&self, connect_id: u32) -> bool {
        if connect_id != self.connect_id {
            debug!(
                "Machine {} drops response of attempt {}, current {}",
                self.id(),
                connect_id,
                self.connect_id
            );
            return true;
        }
        false
    }

    fn activating_state(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        match event {
            ConnectionEvent::ActivateDone { connect_id, result } => {
                if self.is_stale(*connect_id) {
                    return Outcome::Handled;
                }
                let Some(result) = result else {
                    warn!("Machine {} activate done without result", self.id());
                    return Outcome::Handled;
                };
                if result.is_success() {
                    self.cid = result.cid;
                    self.update_network_info(result);
                    return Outcome::Transition(ConnectionState::Active);
                }
                warn!(
                    "Machine {} activate rejected, cause {} active {} cid {}",
                    self.id(),
                    result.reason,
                    result.active,
                    result.cid
                );
                self.teardown = Some(Teardown::from_call(result, RetryScene::SetupData));
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::RadioError { connect_id, error } => {
                if self.is_stale(*connect_id) {
                    return Outcome::Handled;
                }
                warn!("Machine {} radio error {:?}", self.id(), error);
                self.teardown = Some(Teardown::retry(RetryScene::SetupData));
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::ConnectTimeoutCheck { connect_id } => {
                if self.is_stale(*connect_id) {
                    return Outcome::Handled;
                }
                warn!("Machine {} activation timed out", self.id());
                self.teardown = Some(Teardown::retry(RetryScene::SetupData));
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::RadioAdapterHostDied => {
                warn!("Machine {} radio host died while activating", self.id());
                self.teardown = Some(Teardown::retry(RetryScene::SetupData));
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::DrsOrRatChanged(_) => Outcome::Handled,
            ConnectionEvent::Disconnect(_) | ConnectionEvent::DisconnectAll(_) => Outcome::Defer,
            ConnectionEvent::Connect(_) => {
                trace!("Machine {} already activating", self.id());
                Outcome::Handled
            }
            _ => Outcome::NotHandled,
        }
    }

    fn active_state(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        match event {
            ConnectionEvent::Disconnect(params) | ConnectionEvent::DisconnectAll(params) => {
                let Some(params) = params else {
                    warn!("Machine {} disconnect without parameters", self.id());
                    return Outcome::Handled;
                };
                self.disconnect_params = Some(*params);
                Outcome::Transition(ConnectionState::Disconnecting)
            }
            ConnectionEvent::LostConnection(result) => {
                info!("Machine {} lost cid {}", self.id(), self.cid);
                self.teardown = Some(match result {
                    Some(result) => Teardown::from_call(result, RetryScene::ModemDeactivate),
                    None => Teardown::retry(RetryScene::ModemDeactivate),
                });
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::RadioAdapterHostDied => {
                warn!("Machine {} radio host died while active", self.id());
                self.teardown = Some(Teardown::retry(RetryScene::ModemDeactivate));
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::LinkCapabilityChanged(capability) => {
                let Some(capability) = capability else {
                    warn!("Machine {} empty link capability", self.id());
                    return Outcome::Handled;
                };
                self.update_link_capability(capability);
                Outcome::Handled
            }
            ConnectionEvent::RoamOn | ConnectionEvent::RoamOff => {
                self.roaming = matches!(event, ConnectionEvent::RoamOn);
                self.supplier_info.is_roaming = self.roaming;
                self.push_supplier_info();
                Outcome::Handled
            }
            ConnectionEvent::VoiceCallStarted | ConnectionEvent::VoiceCallEnded => {
                self.voice_call_active = matches!(event, ConnectionEvent::VoiceCallStarted);
                self.refresh_bandwidth();
                self.push_supplier_info();
                Outcome::Handled
            }
            ConnectionEvent::NrStateChanged(_) | ConnectionEvent::NrFrequencyChanged(_) => {
                let _ = self.default_state(event);
                self.refresh_bandwidth();
                self.push_supplier_info();
                Outcome::Handled
            }
            ConnectionEvent::DrsOrRatChanged(rat) => {
                self.rat = *rat;
                self.refresh_tcp_buffer();
                self.refresh_bandwidth();
                self.push_supplier_info();
                self.push_link_info();
                Outcome::Handled
            }
            ConnectionEvent::DataConnectionComplete(result) => {
                let Some(result) = result else {
                    warn!("Machine {} data connection update without result", self.id());
                    return Outcome::Handled;
                };
                self.update_network_info(result);
                Outcome::Handled
            }
            ConnectionEvent::Connect(_) => {
                trace!("Machine {} already active", self.id());
                Outcome::Handled
            }
            _ => Outcome::NotHandled,
        }
    }

    fn disconnecting_state(&mut self, event: &ConnectionEvent) -> Outcome<ConnectionState> {
        match event {
            ConnectionEvent::DeactivateDone { connect_id }
            | ConnectionEvent::DisconnectTimeoutCheck { connect_id } => {
                if self.is_stale(*connect_id) {
                    return Outcome::Handled;
                }
                if matches!(event, ConnectionEvent::DisconnectTimeoutCheck { .. }) {
                    warn!("Machine {} deactivation timed out", self.id());
                }
                self.teardown = Some(self.user_teardown());
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::RadioAdapterHostDied => {
                warn!("Machine {} radio host died while disconnecting", self.id());
                self.teardown = Some(self.user_teardown());
                Outcome::Transition(ConnectionState::Inactive)
            }
            ConnectionEvent::InterfaceLinkDown => {
                if self.timers.reschedule(
                    ConnectionTimer::DisconnectTimeout,
                    timing::link_down_disconnect_delay(),
                ) {
                    debug!("Machine {} link down, finishing teardown early", self.id());
                }
                Outcome::Handled
            }
            ConnectionEvent::Connect(_) => Outcome::Defer,
            ConnectionEvent::Disconnect(_) | ConnectionEvent::DisconnectAll(_) => {
                trace!("Machine {} already disconnecting", self.id());
                Outcome::Handled
            }
            _ => Outcome::NotHandled,
        }
    }

    fn user_teardown(&self) -> Teardown {
        Teardown {
            reason: self
                .disconnect_params
                .map(|p| p.reason)
                .unwrap_or_default(),
            cause: PdpErrorReason::NoError,
            retry_after_ms: 0,
            scene: RetryScene::Others,
        }
    }

    /// Derive link details from a data call and push them to the platform.
    pub fn update_network_info(&mut self, result: &SetupDataCallResult) {
        let slot_id = self.slot_id();
        let addresses = parse_address_list(&result.address);
        let mut dns = parse_address_list(&result.dns);
        dns.extend(parse_address_list(&result.dns_sec));
        let gateways = parse_address_list(&result.gateway);
        let ip_type = ip_type_of(&addresses);
        let mtu_config = self.ctx.operator.mtu_config(slot_id);
        let mtu = resolve_mtu(result, ip_type, mtu_config.as_deref());

        self.link_info = NetLinkInfo {
            iface_name: result.iface_name.clone(),
            routes: gateway_routes(&result.iface_name, &gateways),
            addresses,
            dns,
            mtu,
            tcp_buffer_sizes: self.tcp_buffer.clone(),
            ident: supplier_ident(self.ctx.sim.sim_id(slot_id)),
            http_proxy: self.proxy.clone(),
        };
        let iface = result.iface_name.clone();
        self.handle.update(|s| s.iface_name = iface);

        self.supplier_info.score =
            net_score_by_slot_id(slot_id, self.ctx.sim.default_data_slot_id());
        trace!(
            "Machine {} {} {} mtu {} score {}",
            self.id(),
            result.iface_name,
            ip_type,
            mtu,
            self.supplier_info.score
        );
        self.push_supplier_info();
        self.push_link_info();
    }

    fn config_name(&self) -> &'static str {
        self.rat.config_name_with_nr(self.nr_state, self.frequency)
    }

    fn refresh_tcp_buffer(&mut self) {
        self.tcp_buffer = self.manager.tcp_buffer_for(self.config_name());
        self.link_info.tcp_buffer_sizes = self.tcp_buffer.clone();
    }

    fn refresh_bandwidth(&mut self) {
        let table = || self.manager.bandwidth_for(self.config_name()).unwrap_or_default();
        let bandwidth = if self.voice_call_active && self.rat.suspends_data_in_call() {
            LinkBandwidth::default()
        } else if self.manager.is_bandwidth_source_modem() {
            self.modem_bandwidth.unwrap_or_else(table)
        } else {
            table()
        };
        self.bandwidth = bandwidth;
        self.supplier_info.link_down_bandwidth_kbps = bandwidth.down_kbps;
        self.supplier_info.link_up_bandwidth_kbps = bandwidth.up_kbps;
    }

    fn update_link_capability(&mut self, capability: &LinkCapability) {
        if !self.manager.is_bandwidth_source_modem() {
            trace!("Machine {} bandwidth from table, ignoring modem", self.id());
            return;
        }
        self.modem_bandwidth = Some(LinkBandwidth {
            down_kbps: capability.primary_downlink_kbps,
            up_kbps: capability.primary_uplink_kbps,
        });
        self.refresh_bandwidth();
        self.push_supplier_info();
    }

    fn capabilities(&self) -> impl Iterator<Item = NetCapability> {
        let mask = self.capability | self.reuse_capability;
        NetCapability::ALL
            .into_iter()
            .filter(move |c| mask & c.bit() != 0)
    }

    fn push_supplier_info(&self) {
        self.push_supplier_info_for(self.capability | self.reuse_capability, &self.supplier_info);
    }

    fn push_supplier_info_for(&self, mask: u64, info: &NetSupplierInfo) {
        let slot_id = self.slot_id();
        for capability in NetCapability::ALL
            .into_iter()
            .filter(|c| mask & c.bit() != 0)
        {
            if let Err(e) = self
                .ctx
                .net_agent
                .update_net_supplier_info(slot_id, capability, info)
            {
                debug!("Supplier info for {:?} not pushed: {}", capability, e);
            }
        }
    }

    /// Link details are only advertised for an available connection.
    fn push_link_info(&self) {
        if !self.supplier_info.is_available {
            return;
        }
        let slot_id = self.slot_id();
        for capability in self.capabilities() {
            if let Err(e) = self
                .ctx
                .net_agent
                .update_net_link_info(slot_id, capability, &self.link_info)
            {
                debug!("Link info for {:?} not pushed: {}", capability, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use embassy_time::Duration;

    use super::*;
    use crate::apn::item::ApnRecord;
    use crate::event::{SlotEvent, SlotQueue};
    use crate::test_helpers::{init_logger, test_context, TestMocks};

    struct Fixture {
        machine: CellularDataStateMachine,
        manager: Arc<DataConnectionManager>,
        queue: SlotQueue,
        mocks: TestMocks,
    }

    fn fixture() -> Fixture {
        init_logger();
        let (ctx, mocks) = test_context();
        ctx.net_agent.register_net_supplier(0, 1).unwrap();
        let queue = SlotQueue::new(0);
        let handle = Arc::new(ConnectionHandle::new(7, 0, queue.clone()));
        let manager = Arc::new(DataConnectionManager::new(0, ctx.traffic.clone()));
        manager.add_connection_state_machine(handle.clone());
        let machine = CellularDataStateMachine::new(handle, ctx, manager.clone());
        Fixture {
            machine,
            manager,
            queue,
            mocks,
        }
    }

    fn params() -> DataConnectionParams {
        let apn = ApnItem::from_record(ApnRecord {
            profile_id: 1,
            apn: "internet".into(),
            apn_types: "default,supl".into(),
            protocol: "IPV4V6".into(),
            roaming_protocol: "IPV4V6".into(),
            proxy: "10.0.0.1:8080".into(),
            ..Default::default()
        });
        DataConnectionParams {
            apn_type: ApnType::Default,
            apn: Arc::new(apn),
            capability: NetCapability::Internet.bit(),
            radio_tech: RadioTech::Lte,
            roaming: false,
            allow_roaming: false,
            user_request: true,
        }
    }

    fn success(cid: i32) -> SetupDataCallResult {
        SetupDataCallResult {
            cid,
            active: 1,
            iface_name: "rmnet0".into(),
            address: "10.1.2.3/24".into(),
            dns: "8.8.8.8".into(),
            gateway: "10.1.2.1".into(),
            mtu: 1400,
            ..Default::default()
        }
    }

    fn handler_events(queue: &SlotQueue) -> Vec<HandlerEvent> {
        let mut out = Vec::new();
        while let Some(event) = queue.try_receive() {
            if let SlotEvent::Handler(event) = event {
                out.push(event);
            }
        }
        out
    }

    fn activate(f: &mut Fixture, cid: i32) {
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id,
            result: Some(success(cid)),
        });
        assert_eq!(f.machine.state(), ConnectionState::Active);
    }

    #[test]
    fn connect_then_activate_reaches_active() {
        let mut f = fixture();
        assert_eq!(f.machine.state(), ConnectionState::Inactive);

        f.machine.process(ConnectionEvent::Connect(Some(params())));
        assert_eq!(f.machine.state(), ConnectionState::Activating);
        assert!(f.machine.is_timer_pending(ConnectionTimer::ConnectTimeout));
        let activations = f.mocks.radio.activations();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].token.connect_id, f.machine.connect_id());
        assert_eq!(activations[0].profile.apn, "internet");

        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id,
            result: Some(success(3)),
        });
        assert_eq!(f.machine.state(), ConnectionState::Active);
        assert!(!f.machine.is_timer_pending(ConnectionTimer::ConnectTimeout));
        assert_eq!(f.manager.get_active_connection_by_cid(3).unwrap().id(), 7);
        assert_eq!(f.machine.handle().cid(), 3);
        assert!(f.machine.supplier_info().is_available);
        assert_eq!(f.machine.bandwidth().down_kbps, 30480);
        assert_eq!(
            f.machine.proxy(),
            Some(&HttpProxy {
                host: "10.0.0.1".into(),
                port: 8080
            })
        );
        assert_eq!(
            handler_events(&f.queue),
            vec![HandlerEvent::EstablishComplete {
                machine: 7,
                apn_type: ApnType::Default,
                cid: 3
            }]
        );
        assert!(!f.mocks.registry.link_updates().is_empty());
    }

    #[test]
    fn update_network_info_parses_ipv4_call() {
        let mut f = fixture();
        let result = SetupDataCallResult {
            cid: 1,
            active: 2,
            iface_name: "rmnet1".into(),
            address: "192.168.1.1/24".into(),
            dns: "8.8.8.8".into(),
            gateway: "192.168.1.1".into(),
            ..Default::default()
        };
        f.machine.update_network_info(&result);
        let link = f.machine.link_info();
        assert_eq!(link.ip_type(), "IPV4");
        assert_eq!(link.addresses.len(), 1);
        assert_eq!(link.addresses[0].prefix_len, 24);
        assert_eq!(link.dns.len(), 1);
        assert_eq!(link.routes.len(), 1);
        assert_eq!(link.mtu, crate::config::DEFAULT_MTU);
        // Not available yet, so nothing was advertised.
        assert!(f.mocks.registry.link_updates().is_empty());
    }

    #[test]
    fn malformed_events_leave_state_unchanged() {
        let mut f = fixture();
        f.machine.process(ConnectionEvent::Connect(None));
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id: f.machine.connect_id(),
            result: Some(success(1)),
        });
        f.machine.process(ConnectionEvent::Disconnect(None));
        assert_eq!(f.machine.state(), ConnectionState::Inactive);

        f.machine.process(ConnectionEvent::Connect(Some(params())));
        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id,
            result: None,
        });
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id: connect_id.wrapping_sub(1),
            result: Some(success(1)),
        });
        f.machine.process(ConnectionEvent::LinkCapabilityChanged(None));
        f.machine.process(ConnectionEvent::DrsOrRatChanged(RadioTech::Nr));
        assert_eq!(f.machine.state(), ConnectionState::Activating);

        activate(&mut f, 2);
    }

    #[test]
    fn rejected_activation_reports_reason() {
        let mut f = fixture();
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id,
            result: Some(SetupDataCallResult {
                reason: 27,
                retry_time: 5_000,
                ..Default::default()
            }),
        });
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
        assert_eq!(f.machine.connect_id(), connect_id + 1);
        assert_eq!(
            handler_events(&f.queue),
            vec![HandlerEvent::DisconnectComplete {
                machine: 7,
                apn_type: Some(ApnType::Default),
                reason: DisconnectReason::PermanentReject,
                cause: PdpErrorReason::MissingOrUnknownApn,
                retry_after_ms: 5_000,
                scene: RetryScene::SetupData,
            }]
        );
    }

    #[test]
    fn radio_refusal_reenters_inactive() {
        let mut f = fixture();
        f.mocks.radio.fail_activation(true);
        let before = f.machine.connect_id();
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
        assert_eq!(f.machine.connect_id(), before + 1);
        let events = handler_events(&f.queue);
        assert!(matches!(
            events.as_slice(),
            [HandlerEvent::DisconnectComplete {
                reason: DisconnectReason::RetryConnection,
                ..
            }]
        ));
    }

    #[test]
    fn connect_timeout_fails_attempt() {
        let mut f = fixture();
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        let deadline = f.machine.next_deadline().unwrap();
        f.machine.on_timer(deadline - Duration::from_secs(1));
        assert_eq!(f.machine.state(), ConnectionState::Activating);

        f.machine.on_timer(deadline);
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
        assert!(f.machine.next_deadline().is_none());
    }

    #[test]
    fn host_death_fails_activation_at_once() {
        let mut f = fixture();
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        assert_eq!(f.machine.state(), ConnectionState::Activating);

        f.machine.process(ConnectionEvent::RadioAdapterHostDied);
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
        assert!(f.machine.next_deadline().is_none());
        let events = handler_events(&f.queue);
        assert!(matches!(
            events.as_slice(),
            [HandlerEvent::DisconnectComplete {
                reason: DisconnectReason::RetryConnection,
                scene: RetryScene::SetupData,
                ..
            }]
        ));
    }

    #[test]
    fn disconnect_deferred_while_activating() {
        let mut f = fixture();
        f.machine.process(ConnectionEvent::Connect(Some(params())));
        f.machine.process(ConnectionEvent::Disconnect(Some(DataDisconnectParams {
            apn_type: ApnType::Default,
            reason: DisconnectReason::ClearConnection,
        })));
        assert_eq!(f.machine.state(), ConnectionState::Activating);

        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::ActivateDone {
            connect_id,
            result: Some(success(4)),
        });
        assert_eq!(f.machine.state(), ConnectionState::Disconnecting);
        assert!(f.manager.get_active_connection_by_cid(4).is_none());
        let deactivations = f.mocks.radio.deactivations();
        assert_eq!(deactivations.len(), 1);
        assert_eq!(deactivations[0].cid, 4);
        assert_eq!(deactivations[0].reason, DisconnectReason::ClearConnection);
    }

    #[test]
    fn teardown_completes_with_saved_reason() {
        let mut f = fixture();
        activate(&mut f, 5);
        handler_events(&f.queue);

        f.machine.process(ConnectionEvent::Disconnect(Some(DataDisconnectParams {
            apn_type: ApnType::Default,
            reason: DisconnectReason::Normal,
        })));
        assert_eq!(f.machine.state(), ConnectionState::Disconnecting);
        assert!(f.machine.is_timer_pending(ConnectionTimer::DisconnectTimeout));
        assert!(!f.machine.supplier_info().is_available);

        f.machine.process(ConnectionEvent::Connect(Some(params())));
        let connect_id = f.machine.connect_id();
        f.machine.process(ConnectionEvent::DeactivateDone { connect_id });

        // The parked connect runs as soon as the call is down.
        assert_eq!(f.machine.state(), ConnectionState::Activating);
        assert_eq!(f.mocks.radio.activations().len(), 2);
        assert!(matches!(
            handler_events(&f.queue).as_slice(),
            [HandlerEvent::DisconnectComplete {
                reason: DisconnectReason::Normal,
                scene: RetryScene::Others,
                ..
            }]
        ));
    }

    #[test]
    fn link_down_shortens_disconnect_timeout() {
        let mut f = fixture();
        activate(&mut f, 6);
        f.machine.process(ConnectionEvent::Disconnect(Some(DataDisconnectParams {
            apn_type: ApnType::Default,
            reason: DisconnectReason::Normal,
        })));
        let full = f.machine.next_deadline().unwrap();
        f.machine.process(ConnectionEvent::InterfaceLinkDown);
        let early = f.machine.next_deadline().unwrap();
        assert!(early < full);

        f.machine.on_timer(early);
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
    }

    #[test]
    fn lost_connection_uses_modem_scene() {
        let mut f = fixture();
        activate(&mut f, 8);
        handler_events(&f.queue);

        f.machine.process(ConnectionEvent::LostConnection(Some(SetupDataCallResult {
            cid: 8,
            reason: 38,
            retry_time: -1,
            ..Default::default()
        })));
        assert_eq!(f.machine.state(), ConnectionState::Inactive);
        assert!(f.manager.get_active_connection_by_cid(8).is_none());
        assert_eq!(
            handler_events(&f.queue),
            vec![HandlerEvent::DisconnectComplete {
                machine: 7,
                apn_type: Some(ApnType::Default),
                reason: DisconnectReason::RetryConnection,
                cause: PdpErrorReason::NetworkFailure,
                retry_after_ms: -1,
                scene: RetryScene::ModemDeactivate,
            }]
        );
    }

    #[test]
    fn voice_call_on_gsm_zeroes_bandwidth() {
        let mut f = fixture();
        activate(&mut f, 9);
        f.machine.process(ConnectionEvent::DrsOrRatChanged(RadioTech::Gsm));
        assert_eq!(f.machine.bandwidth().down_kbps, 30);
        f.machine.process(ConnectionEvent::VoiceCallStarted);
        assert_eq!(f.machine.bandwidth(), LinkBandwidth::default());
        f.machine.process(ConnectionEvent::VoiceCallEnded);
        assert_eq!(f.machine.bandwidth().down_kbps, 30);
    }

    #[test]
    fn nr_state_switches_bandwidth_row() {
        let mut f = fixture();
        activate(&mut f, 10);
        f.machine
            .process(ConnectionEvent::NrStateChanged(NrState::NsaDualConnected));
        assert_eq!(f.machine.bandwidth().down_kbps, 47000);
        f.machine
            .process(ConnectionEvent::NrFrequencyChanged(FrequencyType::MmWave));
        assert_eq!(f.machine.bandwidth().down_kbps, 145000);
    }
}
