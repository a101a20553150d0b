//! Device and bus handles
//!
//! The hypervisor's device model lives elsewhere; the framework only needs
//! a name, the group back-reference and the bus's IOMMU operation set.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;

use spin::{Mutex, RwLock};

use super::group::Group;
use super::ops::{IommuCap, IommuOps};
use crate::error::{IommuError, IommuResult};

/// A pass-through capable device
pub struct Device {
    name: String,
    /// Group membership, cleared on removal
    group: Mutex<Option<Weak<Group>>>,
}

impl Device {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            group: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current IOMMU group of this device.
    pub fn iommu_group(&self) -> Option<Arc<Group>> {
        self.group.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn group_slot(&self) -> &Mutex<Option<Weak<Group>>> {
        &self.group
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name).finish()
    }
}

/// A bus; carries the IOMMU operation set of the driver serving it
pub struct Bus {
    name: String,
    ops: RwLock<Option<Arc<dyn IommuOps>>>,
}

impl Bus {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            ops: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the IOMMU operation set for this bus.
    ///
    /// A bus is served by at most one IOMMU driver.
    pub fn set_iommu_ops(&self, ops: Arc<dyn IommuOps>) -> IommuResult<()> {
        let mut slot = self.ops.write();
        if slot.is_some() {
            return Err(IommuError::Busy);
        }
        *slot = Some(ops);
        log::debug!("[IOMMU] Operation set installed on bus {}", self.name);
        Ok(())
    }

    pub fn iommu_ops(&self) -> Option<Arc<dyn IommuOps>> {
        self.ops.read().clone()
    }

    pub fn iommu_present(&self) -> bool {
        self.ops.read().is_some()
    }

    /// Query a capability of the bus's IOMMU; false without one.
    pub fn capable(&self, cap: IommuCap) -> bool {
        self.ops.read().as_ref().is_some_and(|ops| ops.capable(cap))
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("iommu_present", &self.iommu_present())
            .finish()
    }
}
