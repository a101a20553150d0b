//! Common test utilities for vmm-iommu integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vmm_iommu::iommu::{self, AttrValue, DomainAttr};
use vmm_iommu::{
    Bus, Controller, Device, Domain, DomainGeometry, DomainType, DriverDomain, Group, IommuCap,
    IommuError, IommuOps, IommuResult, PhandleArgs, Prot,
};

/// Per-domain page table kept by [`MockOps`]: page IOVA to page PA.
pub type PageTable = Mutex<BTreeMap<u64, u64>>;

/// Initialize the framework for an integration test.
pub fn init_test_env() {
    iommu::init().unwrap();
}

/// Register a fresh controller with a process-unique name.
pub fn register_controller(name: &str) -> Arc<Controller> {
    init_test_env();
    let ctrl = Controller::new(name, Device::new(name)).unwrap();
    iommu::controller_register(&ctrl).unwrap();
    ctrl
}

/// Software IOMMU driver with one page table per domain
pub struct MockOps {
    granule: u64,
    /// Largest amount one `unmap` call tears down
    unmap_chunk: usize,
    geometry: DomainGeometry,
    fail_attach: Mutex<Option<String>>,
    probe_group: Mutex<Option<Arc<Group>>>,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub attach_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    pub xlate_args: Mutex<Vec<PhandleArgs>>,
}

impl MockOps {
    pub fn new(granule: u64) -> Self {
        Self {
            granule,
            unmap_chunk: usize::MAX,
            geometry: DomainGeometry::default(),
            fail_attach: Mutex::new(None),
            probe_group: Mutex::new(None),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
            detach_calls: AtomicUsize::new(0),
            xlate_args: Mutex::new(Vec::new()),
        }
    }

    /// Cap how much a single `unmap` call removes.
    pub fn with_unmap_chunk(mut self, chunk: usize) -> Self {
        self.unmap_chunk = chunk;
        self
    }

    pub fn with_geometry(mut self, geometry: DomainGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Make `attach_dev` fail for the named device.
    pub fn fail_attach_for(&self, dev: Option<&str>) {
        *self.fail_attach.lock().unwrap() = dev.map(String::from);
    }

    /// Group that `add_device` places probed devices in.
    pub fn set_probe_group(&self, group: Option<Arc<Group>>) {
        *self.probe_group.lock().unwrap() = group;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn table<'a>(&self, domain: &'a Domain) -> &'a PageTable {
        domain
            .private::<PageTable>()
            .expect("domain not allocated by MockOps")
    }
}

impl IommuOps for MockOps {
    fn capable(&self, cap: IommuCap) -> bool {
        matches!(cap, IommuCap::CacheCoherency | IommuCap::NoExec)
    }

    fn domain_alloc(&self, _ty: DomainType, _ctrl: &Arc<Controller>) -> IommuResult<DriverDomain> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let table: PageTable = Mutex::new(BTreeMap::new());
        Ok(DriverDomain::new(table).with_geometry(self.geometry))
    }

    fn domain_free(&self, domain: &Domain) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        if let Some(table) = domain.private::<PageTable>() {
            table.lock().unwrap().clear();
        }
    }

    fn attach_dev(&self, _domain: &Domain, dev: &Arc<Device>) -> IommuResult<()> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.lock().unwrap().as_deref() == Some(dev.name()) {
            return Err(IommuError::Driver(-5));
        }
        Ok(())
    }

    fn detach_dev(&self, _domain: &Domain, _dev: &Arc<Device>) {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn map(&self, domain: &Domain, iova: u64, paddr: u64, size: usize, _prot: Prot)
        -> IommuResult<()> {
        let mut table = self.table(domain).lock().unwrap();
        let pages = size as u64 / self.granule;
        if (0..pages).any(|i| table.contains_key(&(iova + i * self.granule))) {
            return Err(IommuError::Busy);
        }
        for i in 0..pages {
            table.insert(iova + i * self.granule, paddr + i * self.granule);
        }
        Ok(())
    }

    fn unmap(&self, domain: &Domain, iova: u64, size: usize) -> usize {
        let mut table = self.table(domain).lock().unwrap();
        let size = size.min(self.unmap_chunk);
        let mut unmapped = 0usize;
        while unmapped < size {
            table.remove(&(iova + unmapped as u64));
            unmapped += self.granule as usize;
        }
        unmapped
    }

    fn iova_to_phys(&self, domain: &Domain, iova: u64) -> Option<u64> {
        let page = iova & !(self.granule - 1);
        self.table(domain)
            .lock()
            .unwrap()
            .get(&page)
            .map(|pa| pa + (iova - page))
    }

    fn add_device(&self, dev: &Arc<Device>) -> IommuResult<()> {
        match self.probe_group.lock().unwrap().as_ref() {
            Some(group) => group.add_device(dev),
            None => Err(IommuError::NotFound),
        }
    }

    fn remove_device(&self, dev: &Arc<Device>) {
        let _ = Group::remove_device(dev);
    }

    fn domain_get_attr(&self, _domain: &Domain, attr: DomainAttr) -> IommuResult<AttrValue> {
        match attr {
            DomainAttr::FslPamuV1 => Ok(AttrValue::FslPamuV1(false)),
            _ => Err(IommuError::Unsupported),
        }
    }

    fn of_xlate(&self, _dev: &Arc<Device>, args: &PhandleArgs) -> IommuResult<()> {
        self.xlate_args.lock().unwrap().push(args.clone());
        Ok(())
    }

    fn pgsize_bitmap(&self) -> u64 {
        self.granule
    }
}

/// A bus served by `ops`.
pub fn bus_with(name: &str, ops: &Arc<MockOps>) -> Arc<Bus> {
    let bus = Bus::new(name);
    bus.set_iommu_ops(ops.clone()).unwrap();
    bus
}
