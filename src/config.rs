use core::sync::atomic::{AtomicBool, Ordering};

/// MTU used when neither the radio nor the operator provides one.
pub const DEFAULT_MTU: u32 = 1500;

/// TCP buffer sizes used when the radio technology has no table entry.
pub const DEFAULT_TCP_BUFFER: &str = "4096,87380,110208,4096,16384,110208";

/// Per radio technology `name:down,up` pairs in Kbps.
pub const DEFAULT_BANDWIDTH_CONFIG: &str = "GSM:30,15;\
1xRTT:30,15;\
WCDMA:384,64;\
HSPA:2048,512;\
HSPAP:4096,1024;\
TD_SCDMA:384,128;\
EVDO:750,48;\
EHRPD:750,48;\
LTE:30480,15360;\
LTE_CA:60960,30720;\
IWLAN:10240,10240;\
NR_NSA:47000,18000;\
NR_NSA_MMWAVE:145000,60000;\
NR_SA:145000,60000";

/// Per radio technology `name:rmem_min,rmem_def,rmem_max,wmem_min,wmem_def,wmem_max`.
pub const DEFAULT_TCP_BUFFER_CONFIG: &str = "GSM:4092,8760,48000,4096,8760,48000;\
1xRTT:16384,32768,131072,4096,16384,102400;\
WCDMA:58254,349525,1048576,58254,349525,1048576;\
HSPA:40778,244668,734003,16777,100663,301990;\
HSPAP:122334,734003,2202010,32040,192239,576717;\
TD_SCDMA:58254,349525,1048576,58254,349525,1048576;\
EVDO:4094,87380,524288,4096,16384,262144;\
EHRPD:131072,262144,1048576,4096,16384,524288;\
LTE:524288,1048576,2097152,262144,524288,1048576;\
LTE_CA:4096,6291456,12582912,4096,1048576,2097152;\
IWLAN:4096,6291456,12582912,4096,1048576,2097152;\
NR_NSA:2097152,6291456,16777216,512000,2097152,8388608;\
NR_NSA_MMWAVE:2097152,6291456,16777216,512000,2097152,8388608;\
NR_SA:2097152,6291456,16777216,512000,2097152,8388608";

/// Read-only view of the operator configuration for a slot.
///
/// Every accessor has a default so that integrations only override what the
/// carrier actually provisions.
pub trait OperatorConfig: Send + Sync {
    /// Bandwidth table in the [`DEFAULT_BANDWIDTH_CONFIG`] format.
    fn bandwidth_config(&self, _slot_id: i32) -> Option<String> {
        None
    }

    /// TCP buffer table in the [`DEFAULT_TCP_BUFFER_CONFIG`] format.
    fn tcp_buffer_config(&self, _slot_id: i32) -> Option<String> {
        None
    }

    /// MTU overrides keyed by IP type, e.g. `IPV4:1400;IPV6:1280`.
    fn mtu_config(&self, _slot_id: i32) -> Option<String> {
        None
    }

    fn multiple_connections_enabled(&self, _slot_id: i32) -> bool {
        false
    }

    /// Take link bandwidth from the modem's link capability reports instead
    /// of the static table.
    fn bandwidth_source_modem(&self, _slot_id: i32) -> bool {
        false
    }

    /// NR NSA uplink is anchored on LTE, so its uplink figure mirrors LTE.
    fn nr_uplink_follows_lte(&self, _slot_id: i32) -> bool {
        false
    }

    fn preferred_apn_id(&self, _slot_id: i32) -> Option<i32> {
        None
    }
}

/// Operator configuration with nothing provisioned.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOperatorConfig;

impl OperatorConfig for DefaultOperatorConfig {}

/// Runtime feature switches.
#[derive(Debug)]
pub struct Features {
    retry_scene_table: AtomicBool,
    sa_network_slice: AtomicBool,
    incall_data: AtomicBool,
}

impl Default for Features {
    fn default() -> Self {
        Self::new()
    }
}

impl Features {
    pub const fn new() -> Self {
        Self {
            retry_scene_table: AtomicBool::new(true),
            sa_network_slice: AtomicBool::new(false),
            incall_data: AtomicBool::new(true),
        }
    }

    /// Whether the scene based retry table is used. When off every retry
    /// waits the same fixed delay.
    pub fn retry_scene_table(&self) -> bool {
        self.retry_scene_table.load(Ordering::Relaxed)
    }

    pub fn set_retry_scene_table(&self, on: bool) {
        self.retry_scene_table.store(on, Ordering::Relaxed);
    }

    pub fn sa_network_slice(&self) -> bool {
        self.sa_network_slice.load(Ordering::Relaxed)
    }

    pub fn set_sa_network_slice(&self, on: bool) {
        self.sa_network_slice.store(on, Ordering::Relaxed);
    }

    pub fn incall_data(&self) -> bool {
        self.incall_data.load(Ordering::Relaxed)
    }

    pub fn set_incall_data(&self, on: bool) {
        self.incall_data.store(on, Ordering::Relaxed);
    }
}

/// Split a `name:value;name:value` table into its entries.
///
/// Entries without exactly one `:` or with an empty side are skipped.
pub fn table_entries<'a>(config: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    config.split(';').filter_map(|entry| {
        let mut parts = entry.trim().split(':');
        let name = parts.next()?.trim();
        let value = parts.next()?.trim();
        if parts.next().is_some() || name.is_empty() || value.is_empty() {
            warn!("Skipping malformed config entry {:?}", entry);
            return None;
        }
        Some((name, value))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_tables_cover_every_entry() {
        assert_eq!(table_entries(DEFAULT_BANDWIDTH_CONFIG).count(), 14);
        assert_eq!(table_entries(DEFAULT_TCP_BUFFER_CONFIG).count(), 14);
    }

    #[test]
    fn table_entries_skip_malformed() {
        let entries: Vec<_> = table_entries("LTE:1,2;broken;NR_SA:3,4;a:b:c;:5").collect();
        assert_eq!(entries, vec![("LTE", "1,2"), ("NR_SA", "3,4")]);
    }

    #[test]
    fn features_toggle_at_runtime() {
        let features = Features::new();
        assert!(features.retry_scene_table());
        features.set_retry_scene_table(false);
        assert!(!features.retry_scene_table());
        assert!(!features.sa_network_slice());
    }
}
