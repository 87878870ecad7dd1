//! Traffic polling, data flow type and stall recovery for one slot.

use embassy_time::Instant;

use crate::event::HandlerEvent;
use crate::timer::DeferredTimers;
use crate::timing;
use crate::types::PacketCounts;

/// Sent packets without a single received one before a stall is declared.
pub const STALL_SENT_PACKETS_THRESHOLD: u64 = 10;

/// Direction of recent cellular traffic, as shown in the status bar.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellDataFlowType {
    #[default]
    None,
    Up,
    Down,
    UpDown,
    Dormant,
}

impl CellDataFlowType {
    pub fn from_deltas(sent: u64, received: u64) -> Self {
        match (sent > 0, received > 0) {
            (true, true) => CellDataFlowType::UpDown,
            (true, false) => CellDataFlowType::Up,
            (false, true) => CellDataFlowType::Down,
            (false, false) => CellDataFlowType::None,
        }
    }
}

/// Escalating steps taken while the data path looks stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    GetDataCallList,
    CleanupConnections,
    ReregisterNetwork,
    RadioRestart,
}

impl RecoveryAction {
    pub fn next(self) -> Self {
        match self {
            RecoveryAction::GetDataCallList => RecoveryAction::CleanupConnections,
            RecoveryAction::CleanupConnections => RecoveryAction::ReregisterNetwork,
            RecoveryAction::ReregisterNetwork => RecoveryAction::RadioRestart,
            RecoveryAction::RadioRestart => RecoveryAction::GetDataCallList,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorTimer {
    FlowPoll,
    StallDetection,
}

/// Flow type and stall tracking for one slot.
///
/// Packet counters are passed in by the owner so the monitor never calls out
/// while its lock is held.
pub struct DataConnectionMonitor {
    slot_id: i32,
    timers: DeferredTimers<MonitorTimer, MonitorTimer>,
    screen_on: bool,
    dormant: bool,
    flow_type: CellDataFlowType,
    flow_baseline: Option<PacketCounts>,
    stall_baseline: Option<PacketCounts>,
    sent_without_reply: u64,
    stage: RecoveryAction,
    last_recovery: Option<Instant>,
}

impl core::fmt::Debug for DataConnectionMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataConnectionMonitor")
            .field("slot_id", &self.slot_id)
            .field("screen_on", &self.screen_on)
            .field("flow_type", &self.flow_type)
            .field("stage", &self.stage)
            .finish()
    }
}

impl DataConnectionMonitor {
    pub fn new(slot_id: i32) -> Self {
        Self {
            slot_id,
            timers: DeferredTimers::new(),
            screen_on: true,
            dormant: false,
            flow_type: CellDataFlowType::None,
            flow_baseline: None,
            stall_baseline: None,
            sent_without_reply: 0,
            stage: RecoveryAction::GetDataCallList,
            last_recovery: None,
        }
    }

    pub fn flow_type(&self) -> CellDataFlowType {
        self.flow_type
    }

    pub fn recovery_stage(&self) -> RecoveryAction {
        self.stage
    }

    pub fn is_stall_detection_running(&self) -> bool {
        self.timers.is_pending(MonitorTimer::StallDetection)
    }

    pub fn is_flow_polling(&self) -> bool {
        self.timers.is_pending(MonitorTimer::FlowPoll)
    }

    fn stall_interval(&self) -> embassy_time::Duration {
        if self.screen_on {
            timing::stall_detection_aggressive()
        } else {
            timing::stall_detection_passive()
        }
    }

    pub fn start_stall_detection(&mut self, counts: Option<PacketCounts>) {
        if self.is_stall_detection_running() {
            return;
        }
        debug!("Slot {} stall detection started", self.slot_id);
        self.stall_baseline = counts;
        self.sent_without_reply = 0;
        let interval = self.stall_interval();
        self.timers
            .schedule(MonitorTimer::StallDetection, interval, MonitorTimer::StallDetection);
    }

    pub fn stop_stall_detection(&mut self) {
        if self.timers.cancel(MonitorTimer::StallDetection) {
            debug!("Slot {} stall detection stopped", self.slot_id);
        }
        self.stall_baseline = None;
        self.sent_without_reply = 0;
    }

    pub fn start_flow_polling(&mut self, counts: Option<PacketCounts>) {
        if self.is_flow_polling() {
            return;
        }
        self.flow_baseline = counts;
        self.timers.schedule(
            MonitorTimer::FlowPoll,
            timing::flow_poll_interval(),
            MonitorTimer::FlowPoll,
        );
    }

    /// Stop polling. Returns the new flow type when it had to be reset.
    pub fn stop_flow_polling(&mut self) -> Option<CellDataFlowType> {
        self.timers.cancel(MonitorTimer::FlowPoll);
        self.flow_baseline = None;
        self.set_flow_type(CellDataFlowType::None)
    }

    /// Screen off slows stall detection down to the passive cadence.
    pub fn set_screen_state(&mut self, on: bool) {
        if self.screen_on == on {
            return;
        }
        self.screen_on = on;
        if self.is_stall_detection_running() {
            let interval = self.stall_interval();
            self.timers.reschedule(MonitorTimer::StallDetection, interval);
        }
    }

    /// A dormant link overrides the traffic derived flow type.
    pub fn set_dormant(&mut self, dormant: bool) -> Option<CellDataFlowType> {
        self.dormant = dormant;
        if dormant {
            self.set_flow_type(CellDataFlowType::Dormant)
        } else {
            self.set_flow_type(CellDataFlowType::None)
        }
    }

    fn set_flow_type(&mut self, flow_type: CellDataFlowType) -> Option<CellDataFlowType> {
        if self.flow_type == flow_type {
            return None;
        }
        trace!("Slot {} flow type {:?} -> {:?}", self.slot_id, self.flow_type, flow_type);
        self.flow_type = flow_type;
        Some(flow_type)
    }

    /// Feed a fresh counter reading and derive the flow type from the delta.
    pub fn update_flow_type(&mut self, counts: PacketCounts) -> Option<CellDataFlowType> {
        let previous = self.flow_baseline.replace(counts)?;
        if self.dormant {
            return self.set_flow_type(CellDataFlowType::Dormant);
        }
        let sent = counts.sent.saturating_sub(previous.sent);
        let received = counts.received.saturating_sub(previous.received);
        self.set_flow_type(CellDataFlowType::from_deltas(sent, received))
    }

    /// Feed a counter reading into stall detection.
    ///
    /// Returns the recovery step to take when enough packets went out with
    /// nothing coming back. Any inbound traffic resets the escalation.
    pub fn check_stall(&mut self, counts: PacketCounts) -> Option<RecoveryAction> {
        let previous = self.stall_baseline.replace(counts)?;
        let sent = counts.sent.saturating_sub(previous.sent);
        let received = counts.received.saturating_sub(previous.received);

        if received > 0 {
            if self.stage != RecoveryAction::GetDataCallList {
                info!("Slot {} traffic recovered", self.slot_id);
            }
            self.sent_without_reply = 0;
            self.stage = RecoveryAction::GetDataCallList;
            self.last_recovery = None;
            return None;
        }

        self.sent_without_reply = self.sent_without_reply.saturating_add(sent);
        if self.sent_without_reply <= STALL_SENT_PACKETS_THRESHOLD {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = self.last_recovery {
            if now.saturating_duration_since(last) < timing::recovery_stage_interval() {
                return None;
            }
        }

        let action = self.stage;
        warn!(
            "Slot {} data stall, {} packets unanswered, recovery {:?}",
            self.slot_id, self.sent_without_reply, action
        );
        self.stage = action.next();
        self.sent_without_reply = 0;
        self.last_recovery = Some(now);
        Some(action)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run expired timers and report what the controller has to act on.
    pub fn is_due(&self, now: Instant) -> bool {
        self.timers.next_deadline().is_some_and(|d| d <= now)
    }

    /// Run the due polls against `counts`, read just before.
    pub fn on_timer(&mut self, now: Instant, counts: Option<PacketCounts>) -> Vec<HandlerEvent> {
        let mut out = Vec::new();
        for timer in self.timers.take_due(now) {
            match timer {
                MonitorTimer::FlowPoll => {
                    if let Some(counts) = counts {
                        if let Some(flow) = self.update_flow_type(counts) {
                            out.push(HandlerEvent::FlowTypeChanged(flow));
                        }
                    }
                    self.timers.schedule(
                        MonitorTimer::FlowPoll,
                        timing::flow_poll_interval(),
                        MonitorTimer::FlowPoll,
                    );
                }
                MonitorTimer::StallDetection => {
                    if let Some(counts) = counts {
                        if let Some(action) = self.check_stall(counts) {
                            out.push(HandlerEvent::Recovery(action));
                        }
                    }
                    let interval = self.stall_interval();
                    self.timers.schedule(
                        MonitorTimer::StallDetection,
                        interval,
                        MonitorTimer::StallDetection,
                    );
                }
            }
        }
        out
    }
}
