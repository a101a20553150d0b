//! Shared fixtures for unit tests

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::controller::Controller;
use super::device::{Bus, Device};
use super::domain::{Domain, DomainGeometry};
use super::ops::{DomainType, DriverDomain, IommuCap, IommuOps, Prot};
use crate::error::{IommuError, IommuResult};

/// Driver that keeps no page tables and only counts calls
#[derive(Default)]
pub(crate) struct NullOps {
    attached: AtomicUsize,
    freed: AtomicUsize,
    maps: AtomicUsize,
    /// Extra bytes `unmap` claims beyond the request
    unmap_excess: AtomicUsize,
    alloc_error: Mutex<Option<IommuError>>,
    geometry: Mutex<DomainGeometry>,
}

impl NullOps {
    /// Devices currently attached through this driver.
    pub(crate) fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub(crate) fn maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_alloc(&self, err: IommuError) {
        *self.alloc_error.lock() = Some(err);
    }

    pub(crate) fn over_report_unmap(&self, excess: usize) {
        self.unmap_excess.store(excess, Ordering::SeqCst);
    }

    pub(crate) fn set_geometry(&self, geometry: DomainGeometry) {
        *self.geometry.lock() = geometry;
    }
}

impl IommuOps for NullOps {
    fn capable(&self, cap: IommuCap) -> bool {
        cap == IommuCap::CacheCoherency
    }

    fn domain_alloc(&self, _ty: DomainType, _ctrl: &Arc<Controller>) -> IommuResult<DriverDomain> {
        if let Some(err) = *self.alloc_error.lock() {
            return Err(err);
        }
        Ok(DriverDomain::new(0xd0d0u32).with_geometry(*self.geometry.lock()))
    }

    fn domain_free(&self, _domain: &Domain) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }

    fn attach_dev(&self, _domain: &Domain, _dev: &Arc<Device>) -> IommuResult<()> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_dev(&self, _domain: &Domain, _dev: &Arc<Device>) {
        self.attached.fetch_sub(1, Ordering::SeqCst);
    }

    fn map(&self, _domain: &Domain, _iova: u64, _paddr: u64, _size: usize, _prot: Prot)
        -> IommuResult<()> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmap(&self, _domain: &Domain, _iova: u64, size: usize) -> usize {
        size + self.unmap_excess.load(Ordering::SeqCst)
    }

    fn iova_to_phys(&self, _domain: &Domain, _iova: u64) -> Option<u64> {
        None
    }

    fn pgsize_bitmap(&self) -> u64 {
        0x1000
    }
}

/// Unregistered controller backed by a device of the same name.
pub(crate) fn controller(name: &str) -> Arc<Controller> {
    Controller::new(name, Device::new(name)).unwrap()
}

/// A platform bus served by a fresh [`NullOps`].
pub(crate) fn ops_bus() -> (Arc<Bus>, Arc<NullOps>) {
    let bus = Bus::new("platform");
    let ops = Arc::new(NullOps::default());
    bus.set_iommu_ops(ops.clone()).unwrap();
    (bus, ops)
}
