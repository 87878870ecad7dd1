use std::sync::Arc;

use super::item::{ApnItem, ApnType};
use super::retry::{ConnectionRetryPolicy, RetryScene};
use crate::connection::handle::ConnectionHandle;
use crate::types::{NetRequest, PdpErrorReason};

/// Connectivity state of one APN type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApnProfileState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
    Retrying,
}

/// Holder priorities, higher wins.
pub const PRIORITY_NONE: i32 = 0;
pub const PRIORITY_LOW: i32 = 1;
pub const PRIORITY_HIGH: i32 = 2;

/// Desired and actual connectivity of one APN type.
#[derive(Debug)]
pub struct ApnHolder {
    apn_type: ApnType,
    priority: i32,
    apn_state: ApnProfileState,
    data_call_enabled: bool,
    current_apn: Option<Arc<ApnItem>>,
    retry_policy: ConnectionRetryPolicy,
    cellular_data_machine: Option<Arc<ConnectionHandle>>,
    requests: Vec<NetRequest>,
    failed_cause: Option<PdpErrorReason>,
}

impl ApnHolder {
    pub fn new(apn_type: ApnType, priority: i32) -> Self {
        Self {
            apn_type,
            priority,
            apn_state: ApnProfileState::Idle,
            data_call_enabled: false,
            current_apn: None,
            retry_policy: ConnectionRetryPolicy::new(),
            cellular_data_machine: None,
            requests: Vec::new(),
            failed_cause: None,
        }
    }

    pub fn apn_type(&self) -> ApnType {
        self.apn_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Supplier capability bit mask served by this holder.
    pub fn capability(&self) -> u64 {
        self.apn_type.capability().map(|c| c.bit()).unwrap_or(0)
    }

    pub fn apn_state(&self) -> ApnProfileState {
        self.apn_state
    }

    pub fn set_apn_state(&mut self, state: ApnProfileState) {
        if self.apn_state != state {
            debug!(
                "Apn {} state {:?} -> {:?}",
                self.apn_type.as_str(),
                self.apn_state,
                state
            );
            self.apn_state = state;
        }
    }

    pub fn is_data_call_enabled(&self) -> bool {
        self.data_call_enabled
    }

    pub fn set_data_call_enabled(&mut self, enabled: bool) {
        self.data_call_enabled = enabled;
        if !enabled {
            self.requests.clear();
        }
    }

    /// Register a requester. Duplicates are ignored.
    pub fn request_cellular_data(&mut self, request: &NetRequest) {
        if !self.requests.contains(request) {
            debug!(
                "Apn {} request uid {} id {} ident {}",
                self.apn_type.as_str(),
                request.uid,
                request.request_id,
                request.ident
            );
            self.requests.push(request.clone());
        }
        self.data_call_enabled = true;
    }

    /// Remove a requester; returns whether no requester is left.
    pub fn release_cellular_data(&mut self, request: &NetRequest) -> bool {
        self.requests.retain(|r| r != request);
        self.data_call_enabled = !self.requests.is_empty();
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[NetRequest] {
        &self.requests
    }

    pub fn release_all_cellular_data(&mut self) {
        self.requests.clear();
        self.data_call_enabled = false;
    }

    pub fn set_all_matched_apns(&mut self, apns: Vec<Arc<ApnItem>>) {
        self.retry_policy.set_matched_apns(apns);
    }

    pub fn all_matched_apns(&self) -> &[Arc<ApnItem>] {
        self.retry_policy.matched_apns()
    }

    /// Whether `apns` is functionally the same candidate list, so the current
    /// connection can be kept.
    pub fn is_same_matched_apns(&self, apns: &[Arc<ApnItem>], roaming: bool) -> bool {
        let current = self.retry_policy.matched_apns();
        if current.is_empty() || current.len() != apns.len() {
            return false;
        }
        current
            .iter()
            .zip(apns)
            .all(|(old, new)| old.is_compatible_apn_item(new, roaming))
    }

    pub fn next_retry_apn(&mut self) -> Option<Arc<ApnItem>> {
        self.retry_policy.next_retry_apn_item()
    }

    pub fn current_apn(&self) -> Option<&Arc<ApnItem>> {
        self.current_apn.as_ref()
    }

    pub fn set_current_apn(&mut self, apn: Option<Arc<ApnItem>>) {
        self.current_apn = apn;
    }

    /// Mark the current APN bad or good.
    pub fn set_apn_bad_state(&self, bad: bool) {
        if let Some(apn) = &self.current_apn {
            info!(
                "Apn {} profile {} marked {}",
                self.apn_type.as_str(),
                apn.record.profile_id,
                if bad { "bad" } else { "good" }
            );
            apn.mark_bad(bad);
        }
    }

    /// Make every candidate usable again and start a fresh retry cycle.
    pub fn clear_bad_apns(&mut self) {
        let mut cleared = 0;
        for apn in self.retry_policy.matched_apns().iter().filter(|apn| apn.is_bad()) {
            apn.mark_bad(false);
            cleared += 1;
        }
        if cleared > 0 {
            debug!("Apn {} cleared {} bad profiles", self.apn_type.as_str(), cleared);
        }
        self.retry_policy.initial_retry_count_value();
    }

    pub fn retry_policy(&self) -> &ConnectionRetryPolicy {
        &self.retry_policy
    }

    pub fn retry_policy_mut(&mut self) -> &mut ConnectionRetryPolicy {
        &mut self.retry_policy
    }

    pub fn next_retry_delay(
        &mut self,
        cause: PdpErrorReason,
        suggested_time: i64,
        scene: RetryScene,
        is_default_apn_retrying: bool,
    ) -> i64 {
        self.retry_policy.next_retry_delay(
            self.apn_type,
            cause,
            suggested_time,
            scene,
            is_default_apn_retrying,
        )
    }

    pub fn failed_cause(&self) -> Option<PdpErrorReason> {
        self.failed_cause
    }

    pub fn set_failed_cause(&mut self, cause: Option<PdpErrorReason>) {
        self.failed_cause = cause;
    }

    pub fn cellular_data_machine(&self) -> Option<&Arc<ConnectionHandle>> {
        self.cellular_data_machine.as_ref()
    }

    /// Bind a connection. A previously bound one is unbound first; the
    /// returned handle is set when that released its last binding.
    pub fn set_cellular_data_machine(
        &mut self,
        machine: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        if let Some(current) = &self.cellular_data_machine {
            if Arc::ptr_eq(current, &machine) {
                return None;
            }
        }
        let released = self.release_cellular_data_machine();
        machine.bind();
        self.cellular_data_machine = Some(machine);
        released
    }

    /// Drop the binding. Returns the handle when this was its last binding,
    /// so the caller can tear the connection down.
    pub fn release_cellular_data_machine(&mut self) -> Option<Arc<ConnectionHandle>> {
        let machine = self.cellular_data_machine.take()?;
        if machine.unbind() {
            Some(machine)
        } else {
            None
        }
    }

    /// Whether a connect attempt makes sense right now.
    pub fn is_connectable(&self) -> bool {
        self.data_call_enabled
            && matches!(
                self.apn_state,
                ApnProfileState::Idle | ApnProfileState::Failed | ApnProfileState::Retrying
            )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apn::item::ApnRecord;
    use crate::test_helpers::test_handle;

    fn request(uid: u32, request_id: i32, capability: u64, ident: &str) -> NetRequest {
        NetRequest {
            uid,
            request_id,
            capability,
            ident: ident.into(),
            ..Default::default()
        }
    }

    fn apn(name: &str, protocol: &str) -> Arc<ApnItem> {
        Arc::new(ApnItem::from_record(ApnRecord {
            apn: name.into(),
            apn_types: "default".into(),
            protocol: protocol.into(),
            roaming_protocol: protocol.into(),
            ..Default::default()
        }))
    }

    #[test]
    fn request_and_release_default() {
        let mut holder = ApnHolder::new(ApnType::Default, 0);
        let req = request(0, 0, 0, "simId1");
        holder.request_cellular_data(&req);
        assert!(holder.is_data_call_enabled());
        holder.release_cellular_data(&req);
        assert!(holder.requests().is_empty());
        assert!(!holder.is_data_call_enabled());
    }

    #[test]
    fn duplicate_requests_are_tracked_once() {
        let mut holder = ApnHolder::new(ApnType::Mms, PRIORITY_HIGH);
        let a = request(1000, 1, 0, "simId1");
        let b = request(1001, 2, 0, "simId1");
        holder.request_cellular_data(&a);
        holder.request_cellular_data(&a);
        holder.request_cellular_data(&b);
        assert_eq!(holder.requests().len(), 2);

        assert!(!holder.release_cellular_data(&a));
        assert!(holder.is_data_call_enabled());
        assert!(!holder.release_cellular_data(&a));
        assert!(holder.is_data_call_enabled());
        assert!(holder.release_cellular_data(&b));
        assert!(!holder.is_data_call_enabled());
    }

    #[test]
    fn releasing_unknown_requester_is_noop() {
        let mut holder = ApnHolder::new(ApnType::Default, 0);
        assert!(holder.release_cellular_data(&request(9, 9, 12, "simId2")));
        assert!(!holder.is_data_call_enabled());
    }

    #[test]
    fn same_matched_apns_uses_compatibility() {
        let mut holder = ApnHolder::new(ApnType::Default, 0);
        assert!(!holder.is_same_matched_apns(&[apn("internet", "IP")], false));

        holder.set_all_matched_apns(vec![apn("internet", "IP")]);
        assert!(holder.is_same_matched_apns(&[apn("internet", "IPV4V6")], false));
        assert!(!holder.is_same_matched_apns(&[apn("internet", "IPV6")], false));
        assert!(!holder.is_same_matched_apns(
            &[apn("internet", "IP"), apn("wap", "IP")],
            false
        ));
    }

    #[test]
    fn bad_state_applies_to_current_apn() {
        let mut holder = ApnHolder::new(ApnType::Default, 0);
        let first = apn("a", "IP");
        let second = apn("b", "IP");
        holder.set_all_matched_apns(vec![first.clone(), second.clone()]);

        let current = holder.next_retry_apn();
        holder.set_current_apn(current);
        holder.set_apn_bad_state(true);
        assert!(first.is_bad());
        assert!(Arc::ptr_eq(&holder.next_retry_apn().unwrap(), &second));
        assert!(Arc::ptr_eq(&holder.next_retry_apn().unwrap(), &second));
    }

    #[test]
    fn cleared_apns_become_candidates_again() {
        let mut holder = ApnHolder::new(ApnType::Default, 0);
        let only = apn("internet", "IP");
        holder.set_all_matched_apns(vec![only.clone()]);

        let current = holder.next_retry_apn();
        holder.set_current_apn(current);
        holder.set_apn_bad_state(true);
        assert!(holder.next_retry_apn().is_none());

        holder.clear_bad_apns();
        assert!(!only.is_bad());
        assert_eq!(holder.retry_policy().try_count(), 0);
        assert!(Arc::ptr_eq(&holder.next_retry_apn().unwrap(), &only));
    }

    #[test]
    fn last_unbind_hands_back_machine() {
        let machine = test_handle(1);
        let mut default = ApnHolder::new(ApnType::Default, 0);
        let mut mms = ApnHolder::new(ApnType::Mms, PRIORITY_HIGH);

        assert!(default.set_cellular_data_machine(machine.clone()).is_none());
        assert!(mms.set_cellular_data_machine(machine.clone()).is_none());
        assert_eq!(machine.bind_count(), 2);

        assert!(default.release_cellular_data_machine().is_none());
        let released = mms.release_cellular_data_machine().expect("last binding");
        assert!(Arc::ptr_eq(&released, &machine));
        assert_eq!(machine.bind_count(), 0);
    }
}
