//! Registration of this crate's connectivity with the platform's network
//! supplier registry.

use core::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::error::Error;
use crate::link::{NetLinkInfo, NetSupplierInfo};
use crate::traits::NetSupplierRegistry;
use crate::types::{NetCapability, MAX_SLOT_COUNT};

/// Upper bound of the supplier table, one row per slot and capability.
pub const MAX_SUPPLIERS: usize = 64;

const _: () = assert!(MAX_SLOT_COUNT as usize * NetCapability::ALL.len() <= MAX_SUPPLIERS);

/// Registration record of one (slot, capability) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetSupplier {
    pub slot_id: i32,
    pub capability: NetCapability,
    /// 0 until the registry accepted the supplier.
    pub supplier_id: u32,
    pub sim_id: i32,
    pub reg_result: i32,
    /// Set when this capability is served by the link of another capability.
    pub reused_by: Option<NetCapability>,
}

pub fn supplier_ident(sim_id: i32) -> String {
    format!("simId{}", sim_id)
}

pub struct NetAgent {
    registry: Arc<dyn NetSupplierRegistry>,
    suppliers: Mutex<CriticalSectionRawMutex, RefCell<heapless::Vec<NetSupplier, MAX_SUPPLIERS>>>,
}

impl core::fmt::Debug for NetAgent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetAgent")
            .field("suppliers", &self.suppliers.lock(|s| s.borrow().len()))
            .finish()
    }
}

impl NetAgent {
    pub fn new(registry: Arc<dyn NetSupplierRegistry>) -> Self {
        Self {
            registry,
            suppliers: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Register one supplier per capability for `slot_id`.
    ///
    /// Capabilities already registered for the slot are left alone. Returns
    /// the number of suppliers the registry accepted.
    pub fn register_net_supplier(&self, slot_id: i32, sim_id: i32) -> Result<usize, Error> {
        let ident = supplier_ident(sim_id);
        let mut accepted = 0;
        for capability in NetCapability::ALL {
            if self.supplier_id(slot_id, capability).is_some() {
                continue;
            }
            let (supplier_id, reg_result) =
                match self.registry.register_net_supplier(&ident, capability) {
                    Ok(id) => (id, 0),
                    Err(code) => {
                        error!(
                            "Register supplier {:?} for slot {} failed: {}",
                            capability, slot_id, code
                        );
                        (0, code)
                    }
                };
            let record = NetSupplier {
                slot_id,
                capability,
                supplier_id,
                sim_id,
                reg_result,
                reused_by: None,
            };
            self.suppliers.lock(|s| {
                let mut s = s.borrow_mut();
                s.retain(|r| !(r.slot_id == slot_id && r.capability == capability));
                s.push(record).map_err(|_| Error::BufferTooLarge(MAX_SUPPLIERS))
            })?;
            if supplier_id != 0 {
                accepted += 1;
            }
        }
        info!("Slot {} registered {} net suppliers", slot_id, accepted);
        Ok(accepted)
    }

    pub fn unregister_net_supplier(&self, slot_id: i32) {
        let removed: Vec<NetSupplier> = self.suppliers.lock(|s| {
            let mut s = s.borrow_mut();
            let removed = s.iter().filter(|r| r.slot_id == slot_id).copied().collect();
            s.retain(|r| r.slot_id != slot_id);
            removed
        });
        for record in removed.into_iter().filter(|r| r.supplier_id != 0) {
            if let Err(code) = self.registry.unregister_net_supplier(record.supplier_id) {
                warn!(
                    "Unregister supplier {} failed: {}",
                    record.supplier_id, code
                );
            }
        }
    }

    pub fn unregister_all_net_supplier(&self) {
        for slot_id in 0..MAX_SLOT_COUNT {
            self.unregister_net_supplier(slot_id);
        }
    }

    /// Registry id of the supplier for (slot, capability), if registered.
    pub fn supplier_id(&self, slot_id: i32, capability: NetCapability) -> Option<u32> {
        self.record(slot_id, capability)
            .map(|r| r.supplier_id)
            .filter(|id| *id != 0)
    }

    pub fn record(&self, slot_id: i32, capability: NetCapability) -> Option<NetSupplier> {
        self.suppliers.lock(|s| {
            s.borrow()
                .iter()
                .find(|r| r.slot_id == slot_id && r.capability == capability)
                .copied()
        })
    }

    pub fn update_net_supplier_info(
        &self,
        slot_id: i32,
        capability: NetCapability,
        info: &NetSupplierInfo,
    ) -> Result<(), Error> {
        let id = self
            .supplier_id(slot_id, capability)
            .ok_or(Error::ConnectionNotFound)?;
        debug!(
            "Supplier {} available {} score {}",
            id, info.is_available, info.score
        );
        self.registry
            .update_net_supplier_info(id, info)
            .map_err(Error::Supplier)
    }

    pub fn update_net_link_info(
        &self,
        slot_id: i32,
        capability: NetCapability,
        info: &NetLinkInfo,
    ) -> Result<(), Error> {
        let id = self
            .supplier_id(slot_id, capability)
            .ok_or(Error::ConnectionNotFound)?;
        self.registry
            .update_net_link_info(id, info)
            .map_err(Error::Supplier)
    }

    /// Record that `capability` on `slot_id` now rides on the link of
    /// `reused_by`, or clear that with `None`.
    pub fn set_reused_link(
        &self,
        slot_id: i32,
        capability: NetCapability,
        reused_by: Option<NetCapability>,
    ) {
        self.suppliers.lock(|s| {
            if let Some(r) = s
                .borrow_mut()
                .iter_mut()
                .find(|r| r.slot_id == slot_id && r.capability == capability)
            {
                r.reused_by = reused_by;
            }
        });
    }
}
