use std::sync::Arc;

use crate::config::{DefaultOperatorConfig, Features, OperatorConfig};
use crate::event::SlotDirectory;
use crate::net_agent::NetAgent;
use crate::traits::{
    NetSupplierRegistry, NetworkSlice, NetworkState, NoNetworkSlice, NoTrafficStats, RadioLayer,
    SimAccount, TrafficStats,
};

/// Process wide collaborators shared by every slot.
///
/// Build one before the first slot is created and drop it after the last
/// runner is gone; the net agent lives exactly as long as this context.
pub struct Context {
    pub radio: Arc<dyn RadioLayer>,
    pub sim: Arc<dyn SimAccount>,
    pub network: Arc<dyn NetworkState>,
    pub operator: Arc<dyn OperatorConfig>,
    pub traffic: Arc<dyn TrafficStats>,
    pub slice: Arc<dyn NetworkSlice>,
    pub net_agent: NetAgent,
    pub features: Features,
    /// Queues of the slots built on this context.
    pub slots: SlotDirectory,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("net_agent", &self.net_agent)
            .field("features", &self.features)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        radio: Arc<dyn RadioLayer>,
        sim: Arc<dyn SimAccount>,
        network: Arc<dyn NetworkState>,
        registry: Arc<dyn NetSupplierRegistry>,
    ) -> Self {
        Self {
            radio,
            sim,
            network,
            operator: Arc::new(DefaultOperatorConfig),
            traffic: Arc::new(NoTrafficStats),
            slice: Arc::new(NoNetworkSlice),
            net_agent: NetAgent::new(registry),
            features: Features::new(),
            slots: SlotDirectory::new(),
        }
    }

    pub fn with_operator_config(mut self, operator: Arc<dyn OperatorConfig>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_traffic_stats(mut self, traffic: Arc<dyn TrafficStats>) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn with_network_slice(mut self, slice: Arc<dyn NetworkSlice>) -> Self {
        self.slice = slice;
        self
    }
}
