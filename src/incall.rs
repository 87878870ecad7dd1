//! Secondary slot data during a voice call on DSDS 2.0 devices.
//!
//! On such devices the non default slot cannot keep data up while it
//! carries a call. For the duration of the call the default data slot is
//! moved to the calling slot and restored afterwards.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::context::Context;
use crate::event::{HandlerEvent, SlotEvent, SlotQueue};
use crate::hsm::{transition_path, Outcome, StateTree};
use crate::types::{is_valid_slot_id, CallState, DsdsMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncallState {
    Idle,
    SecondaryActive,
    ActivatingSecondary,
    ActivatedSecondary,
    DeactivatingSecondary,
}

impl StateTree for IncallState {
    fn parent(self) -> Option<Self> {
        match self {
            IncallState::Idle | IncallState::SecondaryActive => None,
            IncallState::ActivatingSecondary
            | IncallState::ActivatedSecondary
            | IncallState::DeactivatingSecondary => Some(IncallState::SecondaryActive),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncallEvent {
    CallStateChanged(CallState),
    SettingsOn,
    SettingsOff,
    /// The default connection of this slot came up.
    DataConnected,
    /// The default connection of this slot went down.
    DataDisconnected,
    DsdsChanged,
}

pub struct IncallDataStateMachine {
    slot_id: i32,
    ctx: Arc<Context>,
    queue: SlotQueue,
    state: IncallState,
    call_state: CallState,
    settings_on: bool,
    data_connected: bool,
    saved_default_slot: Option<i32>,
    secondary_used: bool,
}

impl core::fmt::Debug for IncallDataStateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IncallDataStateMachine")
            .field("slot_id", &self.slot_id)
            .field("state", &self.state)
            .field("call_state", &self.call_state)
            .field("settings_on", &self.settings_on)
            .finish()
    }
}

impl IncallDataStateMachine {
    pub fn new(slot_id: i32, ctx: Arc<Context>, queue: SlotQueue) -> Self {
        Self {
            slot_id,
            ctx,
            queue,
            state: IncallState::Idle,
            call_state: CallState::Idle,
            settings_on: false,
            data_connected: false,
            saved_default_slot: None,
            secondary_used: false,
        }
    }

    pub fn state(&self) -> IncallState {
        self.state
    }

    pub fn call_state(&self) -> CallState {
        self.call_state
    }

    pub fn is_settings_on(&self) -> bool {
        self.settings_on
    }

    /// Whether data may be moved to this slot for the ongoing call.
    pub fn is_secondary_can_active_data(&self) -> bool {
        let sim = &self.ctx.sim;
        let network = &self.ctx.network;
        if sim.dsds_mode() != DsdsMode::V2 {
            return false;
        }
        let primary = sim.default_data_slot_id();
        if !is_valid_slot_id(primary) || primary == self.slot_id {
            return false;
        }
        if !sim.has_sim_card(primary) {
            return false;
        }
        if !network.ims_registered(self.slot_id) {
            return false;
        }
        if !self.call_state.in_call() {
            return false;
        }
        network
            .ps_radio_tech(self.slot_id)
            .supports_concurrent_data()
    }

    fn can_start(&self) -> bool {
        self.settings_on && self.ctx.features.incall_data() && self.is_secondary_can_active_data()
    }

    pub fn process(&mut self, event: IncallEvent) {
        let outcome = self.dispatch(event);
        if let Outcome::Transition(to) = outcome {
            self.transition(to);
        }
    }

    fn dispatch(&mut self, event: IncallEvent) -> Outcome<IncallState> {
        for state in self.state.lineage() {
            let outcome = match state {
                IncallState::Idle => self.idle_state(event),
                IncallState::SecondaryActive => self.secondary_active_state(event),
                IncallState::ActivatingSecondary => self.activating_state(event),
                IncallState::ActivatedSecondary => Outcome::NotHandled,
                IncallState::DeactivatingSecondary => self.deactivating_state(event),
            };
            if outcome != Outcome::NotHandled {
                return outcome;
            }
        }
        debug!("Incall slot {} ignores {:?} in {:?}", self.slot_id, event, self.state);
        Outcome::Handled
    }

    fn transition(&mut self, to: IncallState) {
        let mut next = VecDeque::from([to]);
        while let Some(to) = next.pop_front() {
            let (exits, entries) = transition_path(self.state, to);
            if exits.contains(&IncallState::SecondaryActive) {
                self.secondary_used = true;
            }
            debug!("Incall slot {} {:?} -> {:?}", self.slot_id, self.state, to);
            self.state = to;
            for state in entries {
                if let Some(follow) = self.enter(state) {
                    next.push_back(follow);
                }
            }
        }
    }

    /// Entry actions. A returned state is transitioned to right away.
    fn enter(&mut self, state: IncallState) -> Option<IncallState> {
        match state {
            IncallState::Idle => {
                let used = core::mem::take(&mut self.secondary_used);
                if used && !self.call_state.in_call() {
                    info!("Incall data on slot {} complete", self.slot_id);
                    let event = SlotEvent::Handler(HandlerEvent::IncallDataComplete);
                    if let Err(e) = self.queue.post(event) {
                        error!("Incall slot {} cannot report completion: {}", self.slot_id, e);
                    }
                }
                None
            }
            IncallState::SecondaryActive | IncallState::ActivatedSecondary => None,
            IncallState::ActivatingSecondary => {
                let primary = self.ctx.sim.default_data_slot_id();
                match self.ctx.sim.set_default_data_slot_id(self.slot_id) {
                    Ok(()) => {
                        info!(
                            "Incall data moves default slot {} -> {}",
                            primary, self.slot_id
                        );
                        self.saved_default_slot = Some(primary);
                        self.data_connected.then_some(IncallState::ActivatedSecondary)
                    }
                    Err(e) => {
                        warn!("Incall slot {} cannot take default data: {}", self.slot_id, e);
                        Some(IncallState::Idle)
                    }
                }
            }
            IncallState::DeactivatingSecondary => {
                if let Some(primary) = self.saved_default_slot.take() {
                    if let Err(e) = self.ctx.sim.set_default_data_slot_id(primary) {
                        error!("Incall cannot restore default slot {}: {}", primary, e);
                    }
                }
                (!self.data_connected).then_some(IncallState::Idle)
            }
        }
    }

    fn idle_state(&mut self, event: IncallEvent) -> Outcome<IncallState> {
        match event {
            IncallEvent::CallStateChanged(call_state) => {
                self.call_state = call_state;
                if self.can_start() {
                    return Outcome::Transition(IncallState::ActivatingSecondary);
                }
                Outcome::Handled
            }
            IncallEvent::SettingsOn => {
                self.settings_on = true;
                if self.can_start() {
                    return Outcome::Transition(IncallState::ActivatingSecondary);
                }
                Outcome::Handled
            }
            IncallEvent::SettingsOff => {
                self.settings_on = false;
                Outcome::Handled
            }
            IncallEvent::DataConnected => {
                self.data_connected = true;
                Outcome::Handled
            }
            IncallEvent::DataDisconnected => {
                self.data_connected = false;
                Outcome::Handled
            }
            IncallEvent::DsdsChanged => Outcome::Handled,
        }
    }

    fn secondary_active_state(&mut self, event: IncallEvent) -> Outcome<IncallState> {
        match event {
            IncallEvent::CallStateChanged(call_state) => {
                self.call_state = call_state;
                if call_state.in_call() {
                    Outcome::Handled
                } else {
                    Outcome::Transition(IncallState::DeactivatingSecondary)
                }
            }
            IncallEvent::SettingsOn => {
                self.settings_on = true;
                Outcome::Handled
            }
            IncallEvent::SettingsOff => {
                self.settings_on = false;
                Outcome::Transition(IncallState::DeactivatingSecondary)
            }
            IncallEvent::DsdsChanged => {
                if self.ctx.sim.dsds_mode() == DsdsMode::V2 {
                    Outcome::Handled
                } else {
                    Outcome::Transition(IncallState::DeactivatingSecondary)
                }
            }
            IncallEvent::DataConnected => {
                self.data_connected = true;
                Outcome::Handled
            }
            IncallEvent::DataDisconnected => {
                self.data_connected = false;
                Outcome::Handled
            }
        }
    }

    fn activating_state(&mut self, event: IncallEvent) -> Outcome<IncallState> {
        match event {
            IncallEvent::DataConnected => {
                self.data_connected = true;
                Outcome::Transition(IncallState::ActivatedSecondary)
            }
            _ => Outcome::NotHandled,
        }
    }

    fn deactivating_state(&mut self, event: IncallEvent) -> Outcome<IncallState> {
        match event {
            IncallEvent::DataDisconnected => {
                self.data_connected = false;
                Outcome::Transition(IncallState::Idle)
            }
            IncallEvent::CallStateChanged(call_state) => {
                self.call_state = call_state;
                Outcome::Handled
            }
            IncallEvent::SettingsOff | IncallEvent::DsdsChanged => Outcome::Handled,
            _ => Outcome::NotHandled,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{test_context, TestMocks};
    use crate::types::RadioTech;

    fn machine() -> (IncallDataStateMachine, TestMocks, SlotQueue) {
        let (ctx, mocks) = test_context();
        mocks.sim.set_default_data_slot(0);
        mocks.sim.set_has_sim(0, true);
        mocks.sim.set_dsds_mode(DsdsMode::V2);
        mocks.network.set_ims_registered(1, true);
        mocks.network.set_radio_tech(1, RadioTech::Lte);
        let queue = SlotQueue::new(1);
        let machine = IncallDataStateMachine::new(1, ctx, queue.clone());
        (machine, mocks, queue)
    }

    #[test]
    fn gate_needs_every_condition() {
        let (mut machine, mocks, _) = machine();
        assert!(!machine.is_secondary_can_active_data());
        machine.call_state = CallState::Active;
        assert!(machine.is_secondary_can_active_data());

        mocks.network.set_radio_tech(1, RadioTech::Gsm);
        assert!(!machine.is_secondary_can_active_data());
        mocks.network.set_radio_tech(1, RadioTech::Nr);
        assert!(machine.is_secondary_can_active_data());

        mocks.network.set_ims_registered(1, false);
        assert!(!machine.is_secondary_can_active_data());
        mocks.network.set_ims_registered(1, true);

        mocks.sim.set_has_sim(0, false);
        assert!(!machine.is_secondary_can_active_data());
        mocks.sim.set_has_sim(0, true);

        mocks.sim.set_dsds_mode(DsdsMode::V5Dsda);
        assert!(!machine.is_secondary_can_active_data());
        mocks.sim.set_dsds_mode(DsdsMode::V2);

        mocks.sim.set_default_data_slot(1);
        assert!(!machine.is_secondary_can_active_data());
    }

    #[test]
    fn call_moves_data_and_restores_it() {
        let (mut machine, mocks, queue) = machine();
        machine.process(IncallEvent::SettingsOn);
        assert_eq!(machine.state(), IncallState::Idle);

        machine.process(IncallEvent::CallStateChanged(CallState::Active));
        assert_eq!(machine.state(), IncallState::ActivatingSecondary);
        assert_eq!(mocks.sim.default_data_slot(), 1);

        machine.process(IncallEvent::DataConnected);
        assert_eq!(machine.state(), IncallState::ActivatedSecondary);

        machine.process(IncallEvent::CallStateChanged(CallState::Disconnected));
        assert_eq!(machine.state(), IncallState::DeactivatingSecondary);
        assert_eq!(mocks.sim.default_data_slot(), 0);
        assert!(queue.is_empty());

        machine.process(IncallEvent::DataDisconnected);
        assert_eq!(machine.state(), IncallState::Idle);
        assert!(matches!(
            queue.try_receive(),
            Some(SlotEvent::Handler(HandlerEvent::IncallDataComplete))
        ));
    }

    #[test]
    fn settings_off_without_data_returns_to_idle() {
        let (mut machine, mocks, _) = machine();
        machine.process(IncallEvent::SettingsOn);
        machine.process(IncallEvent::CallStateChanged(CallState::Dialing));
        assert_eq!(machine.state(), IncallState::ActivatingSecondary);

        machine.process(IncallEvent::SettingsOff);
        assert_eq!(machine.state(), IncallState::Idle);
        assert_eq!(mocks.sim.default_data_slot(), 0);
    }

    #[test]
    fn disabled_feature_never_activates() {
        let (mut machine, _, _) = machine();
        machine.ctx.features.set_incall_data(false);
        machine.process(IncallEvent::SettingsOn);
        machine.process(IncallEvent::CallStateChanged(CallState::Active));
        assert_eq!(machine.state(), IncallState::Idle);
    }
}
