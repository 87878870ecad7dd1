//! Per-slot directory of connections and slot wide link configuration.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::FnvIndexMap;

use crate::config::{
    table_entries, OperatorConfig, DEFAULT_BANDWIDTH_CONFIG, DEFAULT_TCP_BUFFER,
    DEFAULT_TCP_BUFFER_CONFIG,
};
use crate::connection::event::ConnectionEvent;
use crate::connection::handle::{ConnectionHandle, MachineId};
use crate::error::Error;
use crate::event::HandlerEvent;
use crate::monitor::DataConnectionMonitor;
use crate::traits::TrafficStats;
use crate::types::SetupDataCallResult;

/// Most data calls a modem keeps up at once on one slot.
pub const MAX_ACTIVE_CONNECTIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkBandwidth {
    pub down_kbps: u32,
    pub up_kbps: u32,
}

impl LinkBandwidth {
    /// Parse a `down,up` pair.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let (down, up) = value.split_once(',').ok_or(Error::Parse)?;
        Ok(Self {
            down_kbps: down.trim().parse()?,
            up_kbps: up.trim().parse()?,
        })
    }
}

type Shared<T> = Mutex<CriticalSectionRawMutex, RefCell<T>>;

/// Owns the slot's connection list and the cid index.
///
/// The two are guarded separately. The list changes when a connection is
/// created or destroyed, the index when one becomes or stops being active.
pub struct DataConnectionManager {
    slot_id: i32,
    connections: Shared<Vec<Arc<ConnectionHandle>>>,
    active_by_cid: Shared<FnvIndexMap<i32, Arc<ConnectionHandle>, MAX_ACTIVE_CONNECTIONS>>,
    bandwidth: Shared<BTreeMap<String, LinkBandwidth>>,
    tcp_buffer: Shared<BTreeMap<String, String>>,
    bandwidth_source_modem: AtomicBool,
    traffic: Arc<dyn TrafficStats>,
    monitor: Shared<DataConnectionMonitor>,
}

impl core::fmt::Debug for DataConnectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataConnectionManager")
            .field("slot_id", &self.slot_id)
            .field("connections", &self.connections.lock(|c| c.borrow().len()))
            .field("active", &self.active_by_cid.lock(|c| c.borrow().len()))
            .finish()
    }
}

impl DataConnectionManager {
    pub fn new(slot_id: i32, traffic: Arc<dyn TrafficStats>) -> Self {
        let manager = Self {
            slot_id,
            connections: Mutex::new(RefCell::new(Vec::new())),
            active_by_cid: Mutex::new(RefCell::new(FnvIndexMap::new())),
            bandwidth: Mutex::new(RefCell::new(BTreeMap::new())),
            tcp_buffer: Mutex::new(RefCell::new(BTreeMap::new())),
            bandwidth_source_modem: AtomicBool::new(false),
            traffic,
            monitor: Mutex::new(RefCell::new(DataConnectionMonitor::new(slot_id))),
        };
        manager.load_bandwidth_config(DEFAULT_BANDWIDTH_CONFIG, false);
        manager.load_tcp_buffer_config(DEFAULT_TCP_BUFFER_CONFIG);
        manager
    }

    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    /// Reload the link tables from the operator, falling back to the built in
    /// tables for anything not provisioned.
    pub fn init_config(&self, operator: &dyn OperatorConfig) {
        let bandwidth = operator
            .bandwidth_config(self.slot_id)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_BANDWIDTH_CONFIG.to_string());
        self.load_bandwidth_config(&bandwidth, operator.nr_uplink_follows_lte(self.slot_id));

        let tcp = operator
            .tcp_buffer_config(self.slot_id)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_TCP_BUFFER_CONFIG.to_string());
        self.load_tcp_buffer_config(&tcp);

        self.set_bandwidth_source_modem(operator.bandwidth_source_modem(self.slot_id));
    }

    fn load_bandwidth_config(&self, config: &str, nr_uplink_follows_lte: bool) {
        let mut table = BTreeMap::new();
        for (name, value) in table_entries(config) {
            match LinkBandwidth::parse(value) {
                Ok(bandwidth) => {
                    table.insert(name.to_string(), bandwidth);
                }
                Err(_) => warn!("Bad bandwidth entry {}:{}", name, value),
            }
        }
        if nr_uplink_follows_lte {
            if let Some(lte_up) = table.get("LTE").map(|b| b.up_kbps) {
                for name in ["NR_NSA", "NR_NSA_MMWAVE"] {
                    if let Some(entry) = table.get_mut(name) {
                        entry.up_kbps = lte_up;
                    }
                }
            }
        }
        debug!("Slot {} loaded {} bandwidth entries", self.slot_id, table.len());
        self.bandwidth.lock(|b| *b.borrow_mut() = table);
    }

    fn load_tcp_buffer_config(&self, config: &str) {
        let table: BTreeMap<String, String> = table_entries(config)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.tcp_buffer.lock(|t| *t.borrow_mut() = table);
    }

    pub fn bandwidth_for(&self, name: &str) -> Option<LinkBandwidth> {
        self.bandwidth.lock(|b| b.borrow().get(name).copied())
    }

    pub fn tcp_buffer_for(&self, name: &str) -> String {
        self.tcp_buffer.lock(|t| {
            t.borrow()
                .get(name)
                .cloned()
                .unwrap_or_else(|| DEFAULT_TCP_BUFFER.to_string())
        })
    }

    pub fn set_bandwidth_source_modem(&self, modem: bool) {
        self.bandwidth_source_modem.store(modem, Ordering::Relaxed);
    }

    pub fn is_bandwidth_source_modem(&self) -> bool {
        self.bandwidth_source_modem.load(Ordering::Relaxed)
    }

    pub fn add_connection_state_machine(&self, handle: Arc<ConnectionHandle>) {
        self.connections.lock(|c| {
            let mut c = c.borrow_mut();
            if !c.iter().any(|h| h.id() == handle.id()) {
                c.push(handle);
            }
        });
    }

    /// Forget a connection. It is dropped from the cid index as well.
    pub fn remove_connection_state_machine(&self, id: MachineId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.lock(|c| {
            let mut c = c.borrow_mut();
            let pos = c.iter().position(|h| h.id() == id)?;
            Some(c.remove(pos))
        });
        self.active_by_cid.lock(|a| {
            let mut a = a.borrow_mut();
            let stale: heapless::Vec<i32, MAX_ACTIVE_CONNECTIONS> = a
                .iter()
                .filter(|(_, h)| h.id() == id)
                .map(|(cid, _)| *cid)
                .collect();
            for cid in stale {
                a.remove(&cid);
            }
        });
        removed
    }

    pub fn all_connection_machines(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.lock(|c| c.borrow().clone())
    }

    pub fn add_active_connection_by_cid(
        &self,
        cid: i32,
        handle: Arc<ConnectionHandle>,
    ) -> Result<(), Error> {
        self.active_by_cid.lock(|a| {
            a.borrow_mut()
                .insert(cid, handle)
                .map(|_| ())
                .map_err(|_| Error::CapacityExceeded(MAX_ACTIVE_CONNECTIONS))
        })
    }

    pub fn remove_active_connection_by_cid(&self, cid: i32) -> Option<Arc<ConnectionHandle>> {
        self.active_by_cid.lock(|a| a.borrow_mut().remove(&cid))
    }

    pub fn get_active_connection_by_cid(&self, cid: i32) -> Option<Arc<ConnectionHandle>> {
        self.active_by_cid.lock(|a| a.borrow().get(&cid).cloned())
    }

    pub fn all_active_connections(&self) -> Vec<(i32, Arc<ConnectionHandle>)> {
        self.active_by_cid.lock(|a| {
            a.borrow()
                .iter()
                .map(|(cid, h)| (*cid, h.clone()))
                .collect()
        })
    }

    pub fn is_active_connections_empty(&self) -> bool {
        self.active_by_cid.lock(|a| a.borrow().is_empty())
    }

    /// Cross check the active connections against the modem's call list.
    ///
    /// A connection whose cid is missing or no longer active is told it lost
    /// its call. The others get the fresh call details. Returns how many
    /// connections were lost.
    pub fn handle_data_call_list_changed(&self, calls: &[SetupDataCallResult]) -> usize {
        let mut lost = 0;
        for (cid, handle) in self.all_active_connections() {
            let entry = calls.iter().find(|c| c.cid == cid);
            let event = match entry {
                Some(call) if call.active > 0 => {
                    ConnectionEvent::DataConnectionComplete(Some(call.clone()))
                }
                other => {
                    info!("Slot {} cid {} dropped by modem", self.slot_id, cid);
                    lost += 1;
                    ConnectionEvent::LostConnection(other.cloned())
                }
            };
            if let Err(e) = handle.post(event) {
                error!("Cannot deliver call list update to cid {}: {}", cid, e);
            }
        }
        lost
    }

    /// Run `f` against the stall and flow monitor.
    pub fn with_monitor<R>(&self, f: impl FnOnce(&mut DataConnectionMonitor) -> R) -> R {
        self.monitor.lock(|m| f(&mut m.borrow_mut()))
    }

    /// Start stall detection and flow polling for a fresh connection.
    pub fn start_stall_detection_timer(&self) {
        let counts = self.traffic.packets(self.slot_id);
        self.with_monitor(|m| {
            m.start_stall_detection(counts);
            m.start_flow_polling(counts);
        });
    }

    pub fn stop_stall_detection_timer(&self) {
        self.with_monitor(|m| {
            m.stop_stall_detection();
            m.stop_flow_polling();
        });
    }

    /// Reset the flow type and poll again while something is connected.
    pub fn restart_flow_polling(&self) {
        let active = !self.is_active_connections_empty();
        let counts = active.then(|| self.traffic.packets(self.slot_id)).flatten();
        self.with_monitor(|m| {
            m.stop_flow_polling();
            if active {
                m.start_flow_polling(counts);
            }
        });
    }

    /// Run the monitor's due polls. Counters are read outside the lock.
    pub fn on_monitor_timer(&self, now: embassy_time::Instant) -> Vec<HandlerEvent> {
        if !self.with_monitor(|m| m.is_due(now)) {
            return Vec::new();
        }
        let counts = self.traffic.packets(self.slot_id);
        self.with_monitor(|m| m.on_timer(now, counts))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{SlotEvent, SlotQueue};
    use crate::monitor::{CellDataFlowType, RecoveryAction};
    use crate::test_helpers::{MockOperatorConfig, MockTraffic};
    use crate::types::PacketCounts;

    fn manager() -> DataConnectionManager {
        DataConnectionManager::new(0, Arc::new(MockTraffic::default()))
    }

    #[test]
    fn default_tables_are_loaded() {
        let manager = manager();
        assert_eq!(
            manager.bandwidth_for("LTE"),
            Some(LinkBandwidth {
                down_kbps: 30480,
                up_kbps: 15360
            })
        );
        assert_eq!(manager.tcp_buffer_for("UNKNOWN"), DEFAULT_TCP_BUFFER);
        assert!(manager.tcp_buffer_for("LTE").starts_with("524288,"));
    }

    #[test]
    fn nr_nsa_uplink_follows_lte() {
        let manager = manager();
        let operator = MockOperatorConfig {
            bandwidth: Some("LTE:100,40;NR_NSA:500,200;NR_NSA_MMWAVE:900,300;NR_SA:800,400".into()),
            nr_uplink_follows_lte: true,
            ..Default::default()
        };
        manager.init_config(&operator);
        assert_eq!(manager.bandwidth_for("NR_NSA").unwrap().up_kbps, 40);
        assert_eq!(manager.bandwidth_for("NR_NSA_MMWAVE").unwrap().up_kbps, 40);
        assert_eq!(manager.bandwidth_for("NR_NSA").unwrap().down_kbps, 500);
        assert_eq!(manager.bandwidth_for("NR_SA").unwrap().up_kbps, 400);
        assert_eq!(manager.bandwidth_for("GSM"), None);
    }

    #[test]
    fn cid_index_follows_connection_list() {
        let manager = manager();
        let queue = SlotQueue::new(0);
        let handle = Arc::new(ConnectionHandle::new(1, 0, queue));
        manager.add_connection_state_machine(handle.clone());
        manager.add_connection_state_machine(handle.clone());
        assert_eq!(manager.all_connection_machines().len(), 1);

        manager.add_active_connection_by_cid(5, handle.clone()).unwrap();
        assert_eq!(manager.get_active_connection_by_cid(5).unwrap().id(), 1);

        manager.remove_connection_state_machine(1);
        assert!(manager.get_active_connection_by_cid(5).is_none());
        assert!(manager.is_active_connections_empty());
    }

    #[test]
    fn full_cid_index_reports_capacity() {
        let manager = manager();
        let handle = Arc::new(ConnectionHandle::new(1, 0, SlotQueue::new(0)));
        for cid in 0..MAX_ACTIVE_CONNECTIONS as i32 {
            manager.add_active_connection_by_cid(cid, handle.clone()).unwrap();
        }
        assert_eq!(
            manager.add_active_connection_by_cid(99, handle),
            Err(Error::CapacityExceeded(MAX_ACTIVE_CONNECTIONS))
        );
    }

    #[test]
    fn stall_timer_polls_traffic_counters() {
        let traffic = Arc::new(MockTraffic::default());
        let manager = DataConnectionManager::new(0, traffic.clone());
        traffic.set(PacketCounts { sent: 0, received: 0 });
        manager.start_stall_detection_timer();
        assert!(manager.with_monitor(|m| m.is_stall_detection_running() && m.is_flow_polling()));

        let now = embassy_time::Instant::now();
        assert!(manager.on_monitor_timer(now).is_empty());

        traffic.set(PacketCounts { sent: 12, received: 0 });
        let events = manager.on_monitor_timer(now + embassy_time::Duration::from_secs(11));
        assert!(events.contains(&HandlerEvent::Recovery(RecoveryAction::GetDataCallList)));
        assert!(events.contains(&HandlerEvent::FlowTypeChanged(CellDataFlowType::Up)));

        manager.stop_stall_detection_timer();
        assert!(!manager.with_monitor(|m| m.is_stall_detection_running() || m.is_flow_polling()));
    }

    #[test]
    fn call_list_change_reports_lost_calls() {
        let manager = manager();
        let queue = SlotQueue::new(0);
        let kept = Arc::new(ConnectionHandle::new(1, 0, queue.clone()));
        let dropped = Arc::new(ConnectionHandle::new(2, 0, queue.clone()));
        manager.add_active_connection_by_cid(1, kept).unwrap();
        manager.add_active_connection_by_cid(2, dropped).unwrap();

        let calls = vec![SetupDataCallResult {
            cid: 1,
            active: 2,
            ..Default::default()
        }];
        assert_eq!(manager.handle_data_call_list_changed(&calls), 1);

        let mut lost = Vec::new();
        while let Some(event) = queue.try_receive() {
            if let SlotEvent::Connection {
                machine,
                event: ConnectionEvent::LostConnection(_),
            } = event
            {
                lost.push(machine);
            }
        }
        assert_eq!(lost, vec![2]);
    }
}
