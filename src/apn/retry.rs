use std::sync::Arc;

use rand::Rng;

use super::item::{ApnItem, ApnType};
use crate::types::{DisconnectReason, PdpErrorReason};

/// Delay used for every retry when the scene table is switched off.
pub const FIXED_RETRY_DELAY_MS: i64 = 10_000;
/// Upper bound applied to a radio suggested retry delay.
pub const MAX_SUGGESTED_DELAY_MS: i64 = 60 * 60 * 1000;
/// Upper bound of the random jitter added to computed delays.
pub const MAX_RANDOM_DELAY_MS: i64 = 2_000;

const SETUP_DATA_BASE_MS: i64 = 5_000;
const MODEM_DEACTIVATE_BASE_MS: i64 = 30_000;
const BACKGROUND_BASE_MS: i64 = 20_000;
const MAX_SCENE_DELAY_MS: i64 = 5 * 60 * 1000;

/// Consecutive identical hard failures that warrant a radio restart.
pub const RESTART_RADIO_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// What triggered the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScene {
    /// Activation failed or timed out.
    SetupData,
    /// The modem dropped an established call.
    ModemDeactivate,
    Others,
}

/// Retry decisions for one APN holder. Owns the matched candidate list and
/// the cursor into it; performs no I/O.
#[derive(Debug)]
pub struct ConnectionRetryPolicy {
    matched_apns: Vec<Arc<ApnItem>>,
    current_apn_index: i32,
    try_count: u32,
    max_retry_count: u32,
    is_prop_on: bool,
    last_hard_cause: Option<PdpErrorReason>,
    same_cause_count: u32,
}

impl Default for ConnectionRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRetryPolicy {
    pub fn new() -> Self {
        Self {
            matched_apns: Vec::new(),
            current_apn_index: -1,
            try_count: 0,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            is_prop_on: true,
            last_hard_cause: None,
            same_cause_count: 0,
        }
    }

    pub fn set_matched_apns(&mut self, apns: Vec<Arc<ApnItem>>) {
        self.current_apn_index = if apns.is_empty() { -1 } else { 0 };
        self.matched_apns = apns;
    }

    pub fn matched_apns(&self) -> &[Arc<ApnItem>] {
        &self.matched_apns
    }

    pub fn current_apn_index(&self) -> i32 {
        self.current_apn_index
    }

    pub fn set_prop_on(&mut self, on: bool) {
        self.is_prop_on = on;
    }

    pub fn is_prop_on(&self) -> bool {
        self.is_prop_on
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    pub fn set_max_retry_count(&mut self, count: u32) {
        self.max_retry_count = count;
    }

    pub fn is_all_bad_apn(&self) -> bool {
        self.matched_apns.iter().all(|apn| apn.is_bad())
    }

    /// Reset attempt tracking for a fresh activation cycle.
    pub fn initial_retry_count_value(&mut self) {
        self.try_count = 0;
        self.last_hard_cause = None;
        self.same_cause_count = 0;
    }

    /// The next usable candidate starting at the cursor, wrapping once.
    pub fn next_retry_apn_item(&mut self) -> Option<Arc<ApnItem>> {
        let len = self.matched_apns.len();
        if len == 0 || self.current_apn_index < 0 || self.current_apn_index as usize >= len {
            return None;
        }
        if self.is_all_bad_apn() {
            debug!("Every matched apn is marked bad");
            return None;
        }
        let start = self.current_apn_index as usize;
        for step in 0..len {
            let idx = (start + step) % len;
            let apn = &self.matched_apns[idx];
            if !apn.is_bad() {
                self.current_apn_index = ((idx + 1) % len) as i32;
                return Some(apn.clone());
            }
        }
        None
    }

    /// Milliseconds to wait before the next activation attempt.
    pub fn next_retry_delay(
        &mut self,
        apn_type: ApnType,
        cause: PdpErrorReason,
        suggested_time: i64,
        scene: RetryScene,
        is_default_apn_retrying: bool,
    ) -> i64 {
        let jitter = rand::thread_rng().gen_range(0..MAX_RANDOM_DELAY_MS);
        let attempt = self.try_count;
        self.try_count = self.try_count.saturating_add(1);
        if !self.is_prop_on {
            return FIXED_RETRY_DELAY_MS + jitter;
        }
        if suggested_time > 0 {
            return suggested_time.min(MAX_SUGGESTED_DELAY_MS);
        }

        let background = !matches!(apn_type, ApnType::Default) && !is_default_apn_retrying;
        let base = match scene {
            RetryScene::SetupData if background => BACKGROUND_BASE_MS,
            RetryScene::SetupData => SETUP_DATA_BASE_MS,
            RetryScene::ModemDeactivate if background => MODEM_DEACTIVATE_BASE_MS * 2,
            RetryScene::ModemDeactivate => MODEM_DEACTIVATE_BASE_MS,
            RetryScene::Others => FIXED_RETRY_DELAY_MS,
        };
        let delay = match scene {
            RetryScene::Others => base,
            _ => base
                .saturating_mul(1 << attempt.min(16))
                .min(MAX_SCENE_DELAY_MS),
        };
        trace!(
            "Retry delay for {} ({:?}, {:?}): {} ms, try {}",
            apn_type.as_str(),
            scene,
            cause,
            delay,
            self.try_count
        );
        delay + jitter
    }

    /// Whether the retry budget of this cycle is spent.
    pub fn is_retry_exhausted(&self) -> bool {
        self.try_count >= self.max_retry_count
    }

    /// Track hard failures and tell the caller when the radio should be
    /// restarted. The caller issues the restart.
    pub fn restart_radio_if_required(&mut self, fail_cause: PdpErrorReason, slot_id: i32) -> bool {
        if !self.is_prop_on || !is_hard_failure(fail_cause) {
            self.last_hard_cause = None;
            self.same_cause_count = 0;
            return false;
        }
        if self.last_hard_cause == Some(fail_cause) {
            self.same_cause_count += 1;
        } else {
            self.last_hard_cause = Some(fail_cause);
            self.same_cause_count = 1;
        }
        if self.same_cause_count >= RESTART_RADIO_THRESHOLD {
            warn!(
                "Slot {} failed {} times with {:?}, radio restart required",
                slot_id, self.same_cause_count, fail_cause
            );
            self.same_cause_count = 0;
            self.last_hard_cause = None;
            return true;
        }
        false
    }
}

fn is_hard_failure(cause: PdpErrorReason) -> bool {
    matches!(
        cause,
        PdpErrorReason::NetworkFailure
            | PdpErrorReason::ActivationRejectedUnspecified
            | PdpErrorReason::ServiceOptionOutOfOrder
            | PdpErrorReason::LlcSndcpFailure
            | PdpErrorReason::NasSignalling
    )
}

/// Classify a PDP failure. Anything not listed fails safe as a permanent
/// reject so unknown causes never cause a retry storm.
pub fn convert_pdp_error_to_disconn_reason(reason: PdpErrorReason) -> DisconnectReason {
    use PdpErrorReason::*;

    match reason {
        NoError | RegularDeactivation | ToNormal => DisconnectReason::Normal,
        ToGsmAndCallingOnly => DisconnectReason::GsmAndCallingOnly,
        InsufficientResources
        | ActivationRejectedUnspecified
        | ServiceOptionOutOfOrder
        | NetworkFailure
        | ReactivationRequested
        | LlcSndcpFailure
        | NasSignalling
        | QosNotAccepted
        | RadioNotAvailable
        | RetryConnection => DisconnectReason::RetryConnection,
        ToClearConnection => DisconnectReason::ClearConnection,
        PdpTypeIpv4OnlyAllowed
        | PdpTypeIpv6OnlyAllowed
        | SingleAddressBearersOnly
        | MultipleConnectionsNotAllowed
        | ToChangeConnection => DisconnectReason::ChangeConnection,
        OperatorDeterminedBarring
        | MissingOrUnknownApn
        | UnknownPdpAddressOrType
        | UserAuthenticationFailed
        | ActivationRejectedGgsn
        | ServiceOptionNotSupported
        | ServiceOptionNotSubscribed
        | NsapiInUse
        | FeatureNotSupported
        | ProtocolError
        | ToPermanentReject
        | Unknown(_) => DisconnectReason::PermanentReject,
    }
}
