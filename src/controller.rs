//! Per-slot cellular data controller.
//!
//! Owns the APN holders, the connection machines and the in-call machine of
//! one slot and reacts to everything arriving on the slot queue: requests
//! from [`Control`](crate::asynch::control::Control), radio indications,
//! connection events and the completions the machines report back.

use std::collections::BTreeMap;
use std::sync::Arc;

use embassy_time::{Duration, Instant};

use crate::apn::holder::ApnProfileState;
use crate::apn::item::{ApnRecord, ApnType};
use crate::apn::manager::{apn_type_to_capability, capability_to_apn_type, ApnManager};
use crate::apn::retry::RetryScene;
use crate::asynch::state::{CellularDataState, SlotSnapshot, SlotState};
use crate::connection::event::{ConnectionEvent, DataConnectionParams, DataDisconnectParams};
use crate::connection::handle::{ConnectionHandle, MachineId};
use crate::connection::machine::CellularDataStateMachine;
use crate::connection::ConnectionState;
use crate::context::Context;
use crate::error::Error;
use crate::event::{HandlerEvent, SlotEvent, SlotQueue, SlotRequest};
use crate::incall::{IncallDataStateMachine, IncallEvent};
use crate::manager::DataConnectionManager;
use crate::monitor::RecoveryAction;
use crate::timer::DeferredTimers;
use crate::timing;
use crate::types::{
    CallState, DisconnectReason, NetCapability, NetRequest, PdpErrorReason, RadioIndication,
    RadioTech,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerTimer {
    RetryToCreateApn(ApnType),
    ResumeDataPermitted,
}

/// What to do with a holder once its connection went down.
enum AfterDisconnect {
    Stay,
    Reconnect,
    RestartRadio,
}

fn is_default_type(apn_type: ApnType) -> bool {
    matches!(apn_type, ApnType::Default | ApnType::InternalDefault)
}

/// Types that follow the user's data and roaming switches.
fn needs_user_switch(apn_type: ApnType) -> bool {
    !matches!(apn_type, ApnType::Ims | ApnType::Emergency | ApnType::Ia)
}

pub struct CellularDataController {
    slot_id: i32,
    ctx: Arc<Context>,
    queue: SlotQueue,
    state: Arc<SlotState>,
    apn_manager: ApnManager,
    manager: Arc<DataConnectionManager>,
    machines: BTreeMap<MachineId, CellularDataStateMachine>,
    next_machine_id: MachineId,
    incall: IncallDataStateMachine,
    timers: DeferredTimers<ControllerTimer, HandlerEvent>,

    data_enabled: bool,
    roaming_enabled: bool,
    data_permitted: Option<bool>,
    radio_tech: RadioTech,
    roaming: bool,
    ps_attached: bool,
    call_state: CallState,
}

impl core::fmt::Debug for CellularDataController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CellularDataController")
            .field("slot_id", &self.slot_id)
            .field("machines", &self.machines.len())
            .field("data_enabled", &self.data_enabled)
            .field("roaming_enabled", &self.roaming_enabled)
            .field("radio_tech", &self.radio_tech)
            .field("roaming", &self.roaming)
            .finish()
    }
}

impl CellularDataController {
    pub fn new(slot_id: i32, ctx: Arc<Context>, queue: SlotQueue, state: Arc<SlotState>) -> Self {
        let manager = Arc::new(DataConnectionManager::new(slot_id, ctx.traffic.clone()));
        manager.init_config(ctx.operator.as_ref());

        let mut apn_manager = ApnManager::new();
        if let Some(id) = ctx.operator.preferred_apn_id(slot_id) {
            apn_manager.set_preferred_apn(id);
        }

        if let Err(e) = ctx.slots.register(queue.clone()) {
            error!("Slot {} cannot join the slot directory: {}", slot_id, e);
        }

        let network = ctx.network.clone();
        Self {
            slot_id,
            incall: IncallDataStateMachine::new(slot_id, ctx.clone(), queue.clone()),
            ctx,
            queue,
            state,
            apn_manager,
            manager,
            machines: BTreeMap::new(),
            next_machine_id: 1,
            timers: DeferredTimers::new(),
            data_enabled: true,
            roaming_enabled: false,
            data_permitted: None,
            radio_tech: network.ps_radio_tech(slot_id),
            roaming: network.is_ps_roaming(slot_id),
            ps_attached: network.is_ps_attached(slot_id),
            call_state: network.call_state(slot_id),
        }
    }

    /// Register the slot's suppliers, load the APN profiles and publish the
    /// first snapshot.
    pub fn init(&mut self, records: &[ApnRecord]) -> Result<(), Error> {
        if self.ctx.sim.has_sim_card(self.slot_id) {
            let sim_id = self.ctx.sim.sim_id(self.slot_id);
            self.ctx.net_agent.register_net_supplier(self.slot_id, sim_id)?;
        }
        self.apn_manager.create_all_apn_items(records);
        self.refresh_matched_apns();
        self.set_initial_apn();
        self.update_data_permitted();
        self.publish();
        Ok(())
    }

    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    pub fn apn_manager(&self) -> &ApnManager {
        &self.apn_manager
    }

    pub fn data_connection_manager(&self) -> &Arc<DataConnectionManager> {
        &self.manager
    }

    pub fn machine(&self, id: MachineId) -> Option<&CellularDataStateMachine> {
        self.machines.get(&id)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    pub fn incall(&self) -> &IncallDataStateMachine {
        &self.incall
    }

    pub fn is_retry_pending(&self, apn_type: ApnType) -> bool {
        self.timers
            .is_pending(ControllerTimer::RetryToCreateApn(apn_type))
    }

    pub fn is_data_enabled(&self) -> bool {
        self.data_enabled
    }

    pub fn is_roaming_enabled(&self) -> bool {
        self.roaming_enabled
    }

    /// Handle one event from the slot queue.
    pub fn process(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Request(request) => self.handle_request(request),
            SlotEvent::Indication(indication) => self.handle_indication(indication),
            SlotEvent::Connection { machine, event } => self.dispatch_connection(machine, event),
            SlotEvent::Handler(event) => self.handle_handler_event(event),
            SlotEvent::Incall(event) => self.process_incall(event),
        }
        self.publish();
    }

    /// Fire everything due at `now`: own timers, connection timeouts and the
    /// monitor's polling.
    pub fn on_timer(&mut self, now: Instant) {
        for event in self.timers.take_due(now) {
            self.handle_handler_event(event);
        }

        let due: Vec<MachineId> = self
            .machines
            .iter()
            .filter(|(_, m)| m.next_deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(machine) = self.machines.get_mut(&id) {
                machine.on_timer(now);
            }
        }

        let events = self.manager.on_monitor_timer(now);
        for event in events {
            self.handle_handler_event(event);
        }
        self.publish();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let machines = self.machines.values().filter_map(|m| m.next_deadline());
        let monitor = self.manager.with_monitor(|m| m.next_deadline());
        self.timers
            .next_deadline()
            .into_iter()
            .chain(machines)
            .chain(monitor)
            .min()
    }

    fn handle_request(&mut self, request: SlotRequest) {
        match request {
            SlotRequest::RequestNet(request) => {
                if let Err(e) = self.request_net(&request) {
                    warn!("Slot {} request net failed: {}", self.slot_id, e);
                }
            }
            SlotRequest::ReleaseNet(request) => {
                if let Err(e) = self.release_net(&request) {
                    warn!("Slot {} release net failed: {}", self.slot_id, e);
                }
            }
            SlotRequest::SetDataEnabled(enabled) => self.set_cellular_data_enable(enabled),
            SlotRequest::SetRoamingEnabled(enabled) => {
                self.set_cellular_data_roaming_enabled(enabled)
            }
            SlotRequest::SetIncallDataEnabled(enabled) => self.process_incall(if enabled {
                IncallEvent::SettingsOn
            } else {
                IncallEvent::SettingsOff
            }),
            SlotRequest::ClearConnections { apn_type, reason } => match apn_type {
                Some(apn_type) => self.clear_connection(apn_type, reason),
                None => self.clear_all_connections(reason),
            },
            SlotRequest::ApnChanged(records) => self.handle_apn_changed(&records),
            SlotRequest::SetPreferredApn(profile_id) => self.set_preferred_apn(profile_id),
            SlotRequest::ClearFlowType => self.manager.restart_flow_polling(),
            SlotRequest::DefaultDataSlotChanged => self.handle_default_slot_changed(),
        }
    }

    /// Add a requester to the holder serving `request.capability` and bring
    /// the connection up when possible.
    pub fn request_net(&mut self, request: &NetRequest) -> Result<(), Error> {
        let apn_type = capability_to_apn_type(request.capability).ok_or(Error::InvalidParameter)?;
        self.apn_manager
            .find_apn_holder_mut(apn_type)
            .ok_or(Error::ApnHolderNotFound)?
            .request_cellular_data(request);

        // MMS on the non default slot needs data permitted for a while.
        if apn_type == ApnType::Mms && !self.is_default_data_slot() {
            self.timers.schedule(
                ControllerTimer::ResumeDataPermitted,
                timing::resume_data_permitted_delay(),
                HandlerEvent::ResumeDataPermitted,
            );
            self.update_data_permitted();
        }

        self.establish_if_connectable(apn_type);
        Ok(())
    }

    /// Drop a requester. The connection goes once nobody wants it.
    pub fn release_net(&mut self, request: &NetRequest) -> Result<(), Error> {
        let apn_type = capability_to_apn_type(request.capability).ok_or(Error::InvalidParameter)?;
        let empty = self
            .apn_manager
            .find_apn_holder_mut(apn_type)
            .ok_or(Error::ApnHolderNotFound)?
            .release_cellular_data(request);
        if empty {
            self.clear_connection(apn_type, DisconnectReason::Normal);
        }
        Ok(())
    }

    pub fn set_cellular_data_enable(&mut self, enabled: bool) {
        if self.data_enabled == enabled {
            return;
        }
        info!("Slot {} cellular data {}", self.slot_id, if enabled { "on" } else { "off" });
        self.data_enabled = enabled;
        if enabled {
            self.apn_manager
                .sorted_holders_mut()
                .for_each(|holder| holder.clear_bad_apns());
            self.establish_all_apns_if_connectable();
        } else {
            self.clear_user_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn set_cellular_data_roaming_enabled(&mut self, enabled: bool) {
        if self.roaming_enabled == enabled {
            return;
        }
        self.roaming_enabled = enabled;
        if !self.roaming {
            return;
        }
        if enabled {
            self.establish_all_apns_if_connectable();
        } else {
            self.clear_user_connections(DisconnectReason::ClearConnection);
        }
    }

    fn is_default_data_slot(&self) -> bool {
        self.ctx.sim.default_data_slot_id() == self.slot_id
    }

    fn update_data_permitted(&mut self) {
        let permitted = self.is_default_data_slot()
            || self.timers.is_pending(ControllerTimer::ResumeDataPermitted);
        if self.data_permitted == Some(permitted) {
            return;
        }
        debug!("Slot {} data permitted {}", self.slot_id, permitted);
        match self.ctx.radio.set_data_permitted(self.slot_id, permitted) {
            Ok(()) => self.data_permitted = Some(permitted),
            Err(e) => warn!("Slot {} set data permitted failed: {}", self.slot_id, e),
        }
    }

    /// Whether the slot may bring up a connection of `apn_type` right now.
    fn can_connect(&self, apn_type: ApnType) -> bool {
        if !self.ctx.sim.has_sim_card(self.slot_id) || !self.ps_attached {
            return false;
        }
        if needs_user_switch(apn_type) {
            if !self.data_enabled {
                return false;
            }
            if self.roaming && !self.roaming_enabled {
                return false;
            }
        }
        !is_default_type(apn_type) || self.is_default_data_slot()
    }

    fn refresh_matched_apns(&mut self) {
        for apn_type in ApnType::ALL {
            let matched = self.apn_manager.filter_matched_apns(apn_type, self.roaming);
            if let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) {
                holder.set_all_matched_apns(matched);
            }
        }
    }

    /// Hand the attach APN to the modem, the IA profile when there is one.
    fn set_initial_apn(&self) {
        let candidate = [ApnType::Ia, ApnType::Default].into_iter().find_map(|t| {
            self.apn_manager
                .filter_matched_apns(t, self.roaming)
                .into_iter()
                .next()
        });
        let Some(apn) = candidate else {
            return;
        };
        if let Err(e) = self
            .ctx
            .radio
            .set_initial_apn(self.slot_id, &apn.data_profile())
        {
            warn!("Slot {} set initial apn failed: {}", self.slot_id, e);
        }
    }

    fn establish_if_connectable(&mut self, apn_type: ApnType) {
        let connectable = self
            .apn_manager
            .find_apn_holder(apn_type)
            .is_some_and(|h| h.is_connectable());
        if !connectable || self.is_retry_pending(apn_type) || !self.can_connect(apn_type) {
            return;
        }
        if let Err(e) = self.establish_data_connection(apn_type) {
            debug!("Slot {} {} not established: {}", self.slot_id, apn_type.as_str(), e);
        }
    }

    /// Try every enabled holder, highest priority first. Holders waiting for
    /// a retry keep waiting.
    pub fn establish_all_apns_if_connectable(&mut self) {
        let types: Vec<ApnType> = self
            .apn_manager
            .sorted_holders()
            .filter(|h| h.is_connectable())
            .map(|h| h.apn_type())
            .collect();
        for apn_type in types {
            self.establish_if_connectable(apn_type);
        }
    }

    /// Bring up a connection for `apn_type`, reusing an active one when the
    /// operator allows several connections and one can serve the type.
    pub fn establish_data_connection(&mut self, apn_type: ApnType) -> Result<(), Error> {
        self.timers
            .cancel(ControllerTimer::RetryToCreateApn(apn_type));

        let unmatched = self
            .apn_manager
            .find_apn_holder(apn_type)
            .ok_or(Error::ApnHolderNotFound)?
            .all_matched_apns()
            .is_empty();
        if unmatched {
            let matched = self.apn_manager.filter_matched_apns(apn_type, self.roaming);
            if let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) {
                holder.set_all_matched_apns(matched);
            }
        }

        if self.ctx.operator.multiple_connections_enabled(self.slot_id) {
            if let Some(id) = self.find_reusable_machine(apn_type) {
                return self.reuse_connection(apn_type, id);
            }
        }

        let holder = self
            .apn_manager
            .find_apn_holder_mut(apn_type)
            .ok_or(Error::ApnHolderNotFound)?;
        let user_request = holder.apn_state() != ApnProfileState::Retrying;
        if user_request {
            holder.retry_policy_mut().initial_retry_count_value();
        }
        let Some(apn) = holder.next_retry_apn() else {
            warn!("Slot {} no usable apn for {}", self.slot_id, apn_type.as_str());
            holder.set_apn_state(ApnProfileState::Failed);
            return Err(Error::NoMatchedApn);
        };
        holder.set_current_apn(Some(apn.clone()));
        let capability = holder.capability();

        let id = self.next_machine_id;
        self.next_machine_id = self.next_machine_id.checked_add(1).unwrap_or(1);
        let handle = Arc::new(ConnectionHandle::new(id, self.slot_id, self.queue.clone()));
        self.manager.add_connection_state_machine(handle.clone());
        self.machines.insert(
            id,
            CellularDataStateMachine::new(handle.clone(), self.ctx.clone(), self.manager.clone()),
        );

        let holder = self
            .apn_manager
            .find_apn_holder_mut(apn_type)
            .ok_or(Error::ApnHolderNotFound)?;
        let released = holder.set_cellular_data_machine(handle);
        holder.set_apn_state(ApnProfileState::Connecting);
        self.teardown_released(released);

        let params = DataConnectionParams {
            apn_type,
            apn,
            capability,
            radio_tech: self.radio_tech,
            roaming: self.roaming,
            allow_roaming: self.roaming_enabled,
            user_request,
        };
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.process(ConnectionEvent::Connect(Some(params)));
        }
        Ok(())
    }

    fn find_reusable_machine(&self, apn_type: ApnType) -> Option<MachineId> {
        self.machines
            .values()
            .find(|m| {
                m.state() == ConnectionState::Active
                    && m.apn_type() != Some(apn_type)
                    && m.apn_item().is_some_and(|a| a.can_deal_with_type(apn_type))
            })
            .map(|m| m.id())
    }

    fn reuse_connection(&mut self, apn_type: ApnType, id: MachineId) -> Result<(), Error> {
        let machine = self.machines.get_mut(&id).ok_or(Error::ConnectionNotFound)?;
        machine.add_reuse_capability(apn_type_to_capability(apn_type));
        let handle = machine.handle().clone();
        let apn = machine.apn_item().cloned();
        let owner = machine.apn_type().and_then(|t| t.capability());
        if let Some(capability) = apn_type.capability() {
            self.ctx
                .net_agent
                .set_reused_link(self.slot_id, capability, owner);
        }

        let holder = self
            .apn_manager
            .find_apn_holder_mut(apn_type)
            .ok_or(Error::ApnHolderNotFound)?;
        holder.set_current_apn(apn);
        let released = holder.set_cellular_data_machine(handle);
        holder.set_apn_state(ApnProfileState::Connected);
        info!(
            "Slot {} {} rides on machine {}",
            self.slot_id,
            apn_type.as_str(),
            id
        );
        self.teardown_released(released);
        Ok(())
    }

    /// Tear down a connection no holder is bound to any more.
    fn teardown_released(&mut self, released: Option<Arc<ConnectionHandle>>) {
        let Some(handle) = released else {
            return;
        };
        let id = handle.id();
        let Some(machine) = self.machines.get_mut(&id) else {
            return;
        };
        if machine.state() == ConnectionState::Inactive {
            self.destroy_machine(id);
            return;
        }
        let params = DataDisconnectParams {
            apn_type: machine.apn_type().unwrap_or(ApnType::Default),
            reason: DisconnectReason::Normal,
        };
        machine.process(ConnectionEvent::Disconnect(Some(params)));
    }

    fn destroy_machine(&mut self, id: MachineId) {
        if self.machines.remove(&id).is_some() {
            debug!("Slot {} machine {} destroyed", self.slot_id, id);
        }
        self.manager.remove_connection_state_machine(id);
    }

    /// Release `apn_type` from its connection. A connection shared with other
    /// holders stays up; otherwise it is torn down with `reason`.
    pub fn clear_connection(&mut self, apn_type: ApnType, reason: DisconnectReason) {
        self.timers
            .cancel(ControllerTimer::RetryToCreateApn(apn_type));
        let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) else {
            return;
        };
        let Some(handle) = holder.cellular_data_machine().cloned() else {
            holder.set_apn_state(ApnProfileState::Idle);
            return;
        };
        let id = handle.id();

        if handle.bind_count() > 1 {
            holder.release_cellular_data_machine();
            holder.set_apn_state(ApnProfileState::Idle);
            if let Some(machine) = self.machines.get_mut(&id) {
                machine.remove_reuse_capability(apn_type_to_capability(apn_type));
            }
            if let Some(capability) = apn_type.capability() {
                self.ctx
                    .net_agent
                    .set_reused_link(self.slot_id, capability, None);
            }
            return;
        }

        let inactive = self
            .machines
            .get(&id)
            .map_or(true, |m| m.state() == ConnectionState::Inactive);
        if inactive {
            holder.release_cellular_data_machine();
            holder.set_apn_state(ApnProfileState::Idle);
            self.destroy_machine(id);
            return;
        }

        holder.set_apn_state(ApnProfileState::Disconnecting);
        debug!(
            "Slot {} clearing {} with {:?}",
            self.slot_id,
            apn_type.as_str(),
            reason
        );
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.process(ConnectionEvent::Disconnect(Some(DataDisconnectParams {
                apn_type,
                reason,
            })));
        }
    }

    pub fn clear_all_connections(&mut self, reason: DisconnectReason) {
        for apn_type in ApnType::ALL {
            self.clear_connection(apn_type, reason);
        }
    }

    /// Clear what the user's data and roaming switches govern.
    fn clear_user_connections(&mut self, reason: DisconnectReason) {
        for apn_type in ApnType::ALL.into_iter().filter(|t| needs_user_switch(*t)) {
            self.clear_connection(apn_type, reason);
        }
    }

    /// Reload the profiles. Holders whose candidates changed reconnect.
    pub fn handle_apn_changed(&mut self, records: &[ApnRecord]) {
        let count = self.apn_manager.create_all_apn_items(records);
        info!("Slot {} apn profiles changed, {} items", self.slot_id, count);
        self.set_initial_apn();

        for apn_type in ApnType::ALL {
            let matched = self.apn_manager.filter_matched_apns(apn_type, self.roaming);
            let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) else {
                continue;
            };
            if holder.is_same_matched_apns(&matched, self.roaming) {
                holder.clear_bad_apns();
                continue;
            }
            holder.set_all_matched_apns(matched);
            holder.retry_policy_mut().initial_retry_count_value();
            if holder.cellular_data_machine().is_some() {
                self.clear_connection(apn_type, DisconnectReason::ChangeConnection);
            }
        }
        self.establish_all_apns_if_connectable();
    }

    pub fn set_preferred_apn(&mut self, profile_id: i32) {
        self.apn_manager.set_preferred_apn(profile_id);
        for apn_type in [ApnType::Default, ApnType::InternalDefault] {
            let matched = self.apn_manager.filter_matched_apns(apn_type, self.roaming);
            if let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) {
                holder.set_all_matched_apns(matched);
            }
        }
    }

    fn handle_handler_event(&mut self, event: HandlerEvent) {
        match event {
            HandlerEvent::EstablishComplete { machine, .. } => {
                self.handle_establish_complete(machine)
            }
            HandlerEvent::DisconnectComplete {
                machine,
                reason,
                cause,
                retry_after_ms,
                scene,
                ..
            } => self.handle_disconnect_complete(machine, reason, cause, retry_after_ms, scene),
            HandlerEvent::RetryToCreateApn(apn_type) => self.handle_retry(apn_type),
            HandlerEvent::ResumeDataPermitted => self.update_data_permitted(),
            HandlerEvent::IncallDataComplete => self.handle_default_slot_changed(),
            HandlerEvent::Recovery(action) => self.handle_recovery(action),
            HandlerEvent::FlowTypeChanged(flow_type) => {
                trace!("Slot {} flow type {:?}", self.slot_id, flow_type);
            }
        }
    }

    fn bound_holders(&self, handle: &Arc<ConnectionHandle>) -> Vec<ApnType> {
        self.apn_manager
            .sorted_holders()
            .filter(|h| {
                h.cellular_data_machine()
                    .is_some_and(|m| Arc::ptr_eq(m, handle))
            })
            .map(|h| h.apn_type())
            .collect()
    }

    fn handle_establish_complete(&mut self, id: MachineId) {
        let Some(machine) = self.machines.get_mut(&id) else {
            debug!("Slot {} establish of unknown machine {}", self.slot_id, id);
            return;
        };
        if machine.state() != ConnectionState::Active {
            // A teardown was queued behind the activation.
            debug!("Slot {} machine {} no longer active", self.slot_id, id);
            return;
        }
        let handle = machine.handle().clone();
        let bound = self.bound_holders(&handle);
        if bound.is_empty() {
            debug!("Slot {} machine {} up without holder", self.slot_id, id);
            self.teardown_released(Some(handle));
            return;
        }

        let mut unwanted = Vec::new();
        for apn_type in &bound {
            self.timers
                .cancel(ControllerTimer::RetryToCreateApn(*apn_type));
            let Some(holder) = self.apn_manager.find_apn_holder_mut(*apn_type) else {
                continue;
            };
            if !holder.is_data_call_enabled() {
                unwanted.push(*apn_type);
                continue;
            }
            holder.set_apn_state(ApnProfileState::Connected);
            holder.set_failed_cause(None);
            holder.retry_policy_mut().initial_retry_count_value();
        }
        for apn_type in unwanted {
            self.clear_connection(apn_type, DisconnectReason::Normal);
        }

        if bound.iter().any(|t| is_default_type(*t)) {
            self.incall.process(IncallEvent::DataConnected);
            self.manager.start_stall_detection_timer();
        }
        self.establish_all_apns_if_connectable();
    }

    fn handle_disconnect_complete(
        &mut self,
        id: MachineId,
        reason: DisconnectReason,
        cause: PdpErrorReason,
        retry_after_ms: i64,
        scene: RetryScene,
    ) {
        let Some(handle) = self.machines.get(&id).map(|m| m.handle().clone()) else {
            debug!("Slot {} disconnect of unknown machine {}", self.slot_id, id);
            return;
        };

        let bound = self.bound_holders(&handle);
        let mut reconnect = Vec::new();
        let mut restart_radio = false;
        for apn_type in &bound {
            match self.holder_disconnected(*apn_type, reason, cause, retry_after_ms, scene) {
                AfterDisconnect::Stay => {}
                AfterDisconnect::Reconnect => reconnect.push(*apn_type),
                AfterDisconnect::RestartRadio => restart_radio = true,
            }
        }
        if handle.bind_count() == 0 {
            self.destroy_machine(id);
        }

        if bound.iter().any(|t| is_default_type(*t)) {
            self.process_incall(IncallEvent::DataDisconnected);
        }
        if self.manager.is_active_connections_empty() {
            self.manager.stop_stall_detection_timer();
        }
        if restart_radio {
            warn!("Slot {} restarting radio", self.slot_id);
            if let Err(e) = self.ctx.radio.restart_radio(self.slot_id) {
                error!("Slot {} radio restart failed: {}", self.slot_id, e);
            }
        }
        for apn_type in reconnect {
            if let Err(e) = self.establish_data_connection(apn_type) {
                debug!("Slot {} reconnect {} failed: {}", self.slot_id, apn_type.as_str(), e);
            }
        }
    }

    /// Unbind one holder from a connection that went down and decide whether
    /// and when it tries again.
    fn holder_disconnected(
        &mut self,
        apn_type: ApnType,
        reason: DisconnectReason,
        cause: PdpErrorReason,
        retry_after_ms: i64,
        scene: RetryScene,
    ) -> AfterDisconnect {
        let slot_id = self.slot_id;
        let can_connect = self.can_connect(apn_type);
        let default_retrying = self
            .apn_manager
            .find_apn_holder(ApnType::Default)
            .is_some_and(|h| h.apn_state() == ApnProfileState::Retrying);
        let prop_on = self.ctx.features.retry_scene_table();
        let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) else {
            return AfterDisconnect::Stay;
        };

        holder.release_cellular_data_machine();
        holder.set_failed_cause((cause != PdpErrorReason::NoError).then_some(cause));
        if reason == DisconnectReason::PermanentReject {
            holder.set_apn_bad_state(true);
        }
        let policy = holder.retry_policy_mut();
        policy.set_prop_on(prop_on);
        let restart = policy.restart_radio_if_required(cause, slot_id);

        let retry_worthy = match reason {
            DisconnectReason::ClearConnection => false,
            DisconnectReason::Normal => scene != RetryScene::Others,
            _ => true,
        };
        if !holder.is_data_call_enabled() || !retry_worthy {
            holder.set_apn_state(ApnProfileState::Idle);
        } else if holder.retry_policy().is_all_bad_apn() || holder.retry_policy().is_retry_exhausted()
        {
            info!("Slot {} {} gives up", slot_id, apn_type.as_str());
            holder.set_apn_state(ApnProfileState::Failed);
        } else if !can_connect {
            holder.set_apn_state(ApnProfileState::Idle);
        } else if scene == RetryScene::Others {
            holder.set_apn_state(ApnProfileState::Idle);
            return if restart {
                AfterDisconnect::RestartRadio
            } else {
                AfterDisconnect::Reconnect
            };
        } else {
            let delay = holder
                .next_retry_delay(cause, retry_after_ms, scene, default_retrying)
                .max(0);
            holder.set_apn_state(ApnProfileState::Retrying);
            debug!(
                "Slot {} {} retry in {} ms",
                slot_id,
                apn_type.as_str(),
                delay
            );
            self.timers.schedule(
                ControllerTimer::RetryToCreateApn(apn_type),
                Duration::from_millis(delay as u64),
                HandlerEvent::RetryToCreateApn(apn_type),
            );
        }
        if restart {
            AfterDisconnect::RestartRadio
        } else {
            AfterDisconnect::Stay
        }
    }

    fn handle_retry(&mut self, apn_type: ApnType) {
        let connectable = self
            .apn_manager
            .find_apn_holder(apn_type)
            .is_some_and(|h| h.is_connectable());
        if connectable && self.can_connect(apn_type) {
            if let Err(e) = self.establish_data_connection(apn_type) {
                debug!("Slot {} retry {} failed: {}", self.slot_id, apn_type.as_str(), e);
            }
            return;
        }
        if let Some(holder) = self.apn_manager.find_apn_holder_mut(apn_type) {
            if holder.apn_state() == ApnProfileState::Retrying {
                holder.set_apn_state(ApnProfileState::Idle);
            }
        }
    }

    fn handle_recovery(&mut self, action: RecoveryAction) {
        info!("Slot {} recovery {:?}", self.slot_id, action);
        let result = match action {
            RecoveryAction::GetDataCallList => self.ctx.radio.get_pdp_context_list(self.slot_id),
            RecoveryAction::CleanupConnections => {
                self.clear_all_connections(DisconnectReason::RetryConnection);
                Ok(())
            }
            RecoveryAction::ReregisterNetwork => self.ctx.radio.reregister_network(self.slot_id),
            RecoveryAction::RadioRestart => self.ctx.radio.restart_radio(self.slot_id),
        };
        if let Err(e) = result {
            warn!("Slot {} recovery {:?} failed: {}", self.slot_id, action, e);
        }
    }

    /// The default data slot moved. Only the default slot keeps default data.
    fn handle_default_slot_changed(&mut self) {
        self.update_data_permitted();
        if self.is_default_data_slot() {
            self.establish_all_apns_if_connectable();
        } else {
            self.clear_connection(ApnType::Default, DisconnectReason::ChangeConnection);
            self.clear_connection(ApnType::InternalDefault, DisconnectReason::ChangeConnection);
        }
    }

    fn process_incall(&mut self, event: IncallEvent) {
        let before = self.ctx.sim.default_data_slot_id();
        self.incall.process(event);
        if self.ctx.sim.default_data_slot_id() != before {
            self.handle_default_slot_changed();
            self.ctx.slots.default_data_slot_changed(self.slot_id);
        }
    }

    fn handle_call_state_changed(&mut self, call_state: CallState) {
        let was_in_call = self.call_state.in_call();
        self.call_state = call_state;
        if was_in_call != call_state.in_call() {
            self.broadcast(if call_state.in_call() {
                ConnectionEvent::VoiceCallStarted
            } else {
                ConnectionEvent::VoiceCallEnded
            });
        }
        self.process_incall(IncallEvent::CallStateChanged(call_state));
    }

    fn dispatch_connection(&mut self, id: MachineId, event: ConnectionEvent) {
        match self.machines.get_mut(&id) {
            Some(machine) => machine.process(event),
            None => debug!("Slot {} event for unknown machine {}", self.slot_id, id),
        }
    }

    fn broadcast(&mut self, event: ConnectionEvent) {
        for machine in self.machines.values_mut() {
            machine.process(event.clone());
        }
    }

    fn handle_indication(&mut self, indication: RadioIndication) {
        match indication {
            RadioIndication::SetupDataCallResponse { .. }
            | RadioIndication::DeactivateDataCallResponse { .. } => {
                if let SlotEvent::Connection { machine, event } = SlotEvent::from(indication) {
                    self.dispatch_connection(machine, event);
                }
            }
            RadioIndication::DataCallListChanged(calls) => {
                let lost = self.manager.handle_data_call_list_changed(&calls);
                if lost > 0 {
                    info!("Slot {} lost {} data calls", self.slot_id, lost);
                }
            }
            RadioIndication::RadioTechChanged(rat) => {
                self.radio_tech = rat;
                self.broadcast(ConnectionEvent::DrsOrRatChanged(rat));
                self.establish_all_apns_if_connectable();
            }
            RadioIndication::RoamingChanged(roaming) => {
                if self.roaming == roaming {
                    return;
                }
                self.roaming = roaming;
                self.broadcast(if roaming {
                    ConnectionEvent::RoamOn
                } else {
                    ConnectionEvent::RoamOff
                });
                if roaming && !self.roaming_enabled {
                    self.clear_user_connections(DisconnectReason::ClearConnection);
                } else {
                    self.establish_all_apns_if_connectable();
                }
            }
            RadioIndication::NrStateChanged(state) => {
                self.broadcast(ConnectionEvent::NrStateChanged(state))
            }
            RadioIndication::NrFrequencyChanged(frequency) => {
                self.broadcast(ConnectionEvent::NrFrequencyChanged(frequency))
            }
            RadioIndication::CallStateChanged(call_state) => {
                self.handle_call_state_changed(call_state)
            }
            RadioIndication::LinkCapabilityChanged(capability) => {
                self.broadcast(ConnectionEvent::LinkCapabilityChanged(Some(capability)))
            }
            RadioIndication::PsAttachChanged(attached) => {
                self.ps_attached = attached;
                if attached {
                    self.establish_all_apns_if_connectable();
                }
            }
            RadioIndication::SimStateChanged { has_sim } => {
                if has_sim {
                    let sim_id = self.ctx.sim.sim_id(self.slot_id);
                    if let Err(e) = self.ctx.net_agent.register_net_supplier(self.slot_id, sim_id)
                    {
                        error!("Slot {} supplier registration failed: {}", self.slot_id, e);
                    }
                    self.establish_all_apns_if_connectable();
                } else {
                    self.clear_all_connections(DisconnectReason::ClearConnection);
                    self.ctx.net_agent.unregister_net_supplier(self.slot_id);
                }
            }
            RadioIndication::DsdsModeChanged(_) => self.process_incall(IncallEvent::DsdsChanged),
            RadioIndication::RadioAdapterHostDied => {
                self.broadcast(ConnectionEvent::RadioAdapterHostDied)
            }
            RadioIndication::InterfaceLinkDown(iface) => {
                for machine in self.machines.values_mut() {
                    if machine.handle().iface_name() == iface {
                        machine.process(ConnectionEvent::InterfaceLinkDown);
                    }
                }
            }
            RadioIndication::ScreenStateChanged(on) => {
                self.manager.with_monitor(|m| m.set_screen_state(on))
            }
        }
    }

    /// Mirror the slot into the shared state read by `Control`.
    fn publish(&self) {
        let suspended = self.call_state.in_call() && self.radio_tech.suspends_data_in_call();
        let default_holder = self.apn_manager.find_apn_holder(ApnType::Default);
        let mut snapshot = SlotSnapshot {
            data_state: CellularDataState::from_apn_state(
                self.apn_manager.overall_default_apn_state(),
                suspended,
            ),
            flow_type: self.manager.with_monitor(|m| m.flow_type()),
            data_enabled: self.data_enabled,
            roaming_enabled: self.roaming_enabled,
            default_apn: default_holder
                .filter(|h| h.apn_state() == ApnProfileState::Connected)
                .and_then(|h| h.current_apn().cloned()),
            ..Default::default()
        };
        for holder in self.apn_manager.sorted_holders() {
            snapshot
                .apn_states
                .insert(holder.apn_type(), holder.apn_state())
                .ok();
        }
        for (cid, handle) in self.manager.all_active_connections() {
            let s = handle.snapshot();
            if (s.capability | s.reuse_capability) & NetCapability::Internet.bit() != 0 {
                snapshot.internet_cids.push(cid).ok();
            }
        }
        self.state.publish(snapshot);
    }
}

impl Drop for CellularDataController {
    fn drop(&mut self) {
        self.ctx.slots.unregister(&self.queue);
    }
}
