//! IOMMU framework for device pass-through
//!
//! Object model, leaf first:
//! - [`IommuOps`]: the operation set a hardware driver supplies through a [`Bus`]
//! - [`Domain`]: a reference-counted translation context
//! - [`Group`]: devices that must share one domain
//! - [`Controller`]: one physical IOMMU instance owning groups and domains
//! - [`ControllerRegistry`]: the process-wide catalogue of controllers
//!
//! Every API here except fault reporting and [`Domain::get`] must run in
//! thread context: they take spin locks owned by the registry, controllers
//! and groups. Fault reporting never touches those locks.

pub mod controller;
pub mod device;
pub mod domain;
pub mod fault;
pub mod group;
pub mod notify;
pub mod ops;
pub mod payload;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

pub use controller::{Controller, ControllerRegistry};
pub use device::{Bus, Device};
pub use domain::{Domain, DomainGeometry};
pub use fault::{FaultHandler, FaultStats, FaultToken};
pub use group::Group;
pub use notify::{GroupEvent, NotifierId};
pub use ops::{
    AttrValue, DomainAttr, DomainType, DriverDomain, FaultFlags, IommuCap, IommuOps, PhandleArgs,
    Prot,
};
pub use payload::Payload;

use crate::error::{IommuError, IommuResult};

/// Device class name IOMMU controllers register under.
pub const CONTROLLER_CLASS_NAME: &str = "iommu";

/// Maximum length of a controller name, in bytes.
pub const IOMMU_NAME_SIZE: usize = 64;

/// Maximum length of a group or domain name, in bytes.
pub const FIELD_NAME_SIZE: usize = 64;

/// Whether `init` has run.
static IOMMU_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the IOMMU framework.
///
/// Runs once at boot before any controller registers. Later calls are
/// harmless no-ops.
pub fn init() -> IommuResult<()> {
    if IOMMU_INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    // Materialize the registry now rather than on first registration.
    let count = controller::registry().count();
    log::info!("[IOMMU] Framework initialized ({} controllers)", count);
    Ok(())
}

/// Check whether the IOMMU framework has been initialized.
pub fn is_initialized() -> bool {
    IOMMU_INITIALIZED.load(Ordering::Acquire)
}

/// Reset the process-wide registry, dropping every registered controller.
///
/// Only for test harnesses that need a clean slate between cases.
#[cfg(any(test, feature = "testing"))]
pub fn reset_registry() {
    controller::registry().reset();
}

/// Reject names longer than `max` bytes.
pub(crate) fn check_name(name: &str, max: usize) -> IommuResult<()> {
    if name.len() >= max {
        return Err(IommuError::NameTooLong);
    }
    Ok(())
}

/// Register a controller in the process-wide registry.
pub fn controller_register(ctrl: &Arc<Controller>) -> IommuResult<()> {
    if !is_initialized() {
        return Err(IommuError::NotInitialized);
    }
    controller::registry().register(ctrl)
}

/// Unregister a controller from the process-wide registry.
pub fn controller_unregister(ctrl: &Arc<Controller>) -> IommuResult<()> {
    controller::registry().unregister(ctrl)
}

/// Find a registered controller by name.
pub fn controller_find(name: &str) -> IommuResult<Arc<Controller>> {
    controller::registry().find(name)
}

/// Number of registered controllers.
pub fn controller_count() -> usize {
    controller::registry().count()
}

/// Hand a newly discovered device to the bus's IOMMU driver.
///
/// The driver is expected to place the device in a group via
/// [`Group::add_device`].
pub fn probe_device(bus: &Bus, dev: &Arc<Device>) -> IommuResult<()> {
    let ops = bus.iommu_ops().ok_or(IommuError::NoIommu)?;
    ops.add_device(dev)
}

/// Tell the bus's IOMMU driver a device is going away.
pub fn release_device(bus: &Bus, dev: &Arc<Device>) -> IommuResult<()> {
    let ops = bus.iommu_ops().ok_or(IommuError::NoIommu)?;
    ops.remove_device(dev);
    Ok(())
}

/// Pass firmware master-ID arguments for a device to the bus's IOMMU driver.
pub fn xlate_device(
    bus: &Bus,
    dev: &Arc<Device>,
    args: &PhandleArgs,
) -> IommuResult<()> {
    let ops = bus.iommu_ops().ok_or(IommuError::NoIommu)?;
    ops.of_xlate(dev, args)
}

#[cfg(test)]
pub(crate) mod test_util;
