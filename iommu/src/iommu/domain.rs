//! IOMMU domains
//!
//! A domain is one isolated translation context. Its lifetime is governed by
//! an explicit reference count, independent of group attachment:
//!
//! - `alloc` returns a domain holding one reference
//! - `get` adds a reference; lock-free, so callable from any context that
//!   already holds one
//! - `free` drops a reference; the caller that takes the count from 1 to 0
//!   unlinks the domain from its controller and hands it back to the driver
//!
//! The count is a single atomic updated by compare-and-swap, so exactly one
//! decrement observes the transition to zero under any interleaving. `free`
//! takes the controller's domain lock on that final path and must therefore
//! only run in thread context, never from a fault handler.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::RwLock;

use super::controller::Controller;
use super::device::Bus;
use super::fault::{FaultSlot, FaultStats};
use super::ops::{AttrValue, DomainAttr, DomainType, DriverDomain, IommuOps, Prot};
use super::{check_name, FIELD_NAME_SIZE};
use crate::error::{IommuError, IommuResult};

/// Address range a domain can map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainGeometry {
    /// First address that can be mapped
    pub aperture_start: u64,
    /// Last address that can be mapped
    pub aperture_end: u64,
    /// DMA only allowed in mappable range?
    pub force_aperture: bool,
}

impl DomainGeometry {
    pub fn new(aperture_start: u64, aperture_end: u64, force_aperture: bool) -> Self {
        Self {
            aperture_start,
            aperture_end,
            force_aperture,
        }
    }

    /// Whether `[iova, iova + size)` lies inside the aperture.
    pub fn contains(&self, iova: u64, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        match iova.checked_add(size as u64 - 1) {
            Some(last) => iova >= self.aperture_start && last <= self.aperture_end,
            None => false,
        }
    }

    fn permits(&self, iova: u64, size: usize) -> bool {
        !self.force_aperture || self.contains(iova, size)
    }
}

impl Default for DomainGeometry {
    fn default() -> Self {
        Self::new(0, u64::MAX, false)
    }
}

/// An isolated address-translation context
pub struct Domain {
    name: String,
    ty: DomainType,
    bus: Arc<Bus>,
    ctrl: Weak<Controller>,
    ops: Arc<dyn IommuOps>,
    private: Box<dyn Any + Send + Sync>,
    geometry: DomainGeometry,
    ref_count: AtomicU32,
    /// Set while some group holds this domain
    attached: AtomicBool,
    pub(super) fault: RwLock<Option<FaultSlot>>,
    pub(super) fault_stats: FaultStats,
}

impl Domain {
    /// Allocate a domain of type `ty` for devices on `bus` behind `ctrl`.
    ///
    /// The bus's IOMMU driver builds the translation context. The new domain
    /// holds one reference and is linked into the controller's domain list.
    pub fn alloc(
        name: &str,
        bus: &Arc<Bus>,
        ctrl: &Arc<Controller>,
        ty: DomainType,
    ) -> IommuResult<Arc<Self>> {
        check_name(name, FIELD_NAME_SIZE)?;
        if !ty.is_valid() {
            return Err(IommuError::InvalidArgument);
        }
        let ops = bus.iommu_ops().ok_or(IommuError::NoIommu)?;

        let DriverDomain { private, geometry } = ops.domain_alloc(ty, ctrl)?;

        let domain = Arc::new(Self {
            name: String::from(name),
            ty,
            bus: bus.clone(),
            ctrl: Arc::downgrade(ctrl),
            ops,
            private,
            geometry,
            ref_count: AtomicU32::new(1),
            attached: AtomicBool::new(false),
            fault: RwLock::new(None),
            fault_stats: FaultStats::new(),
        });
        ctrl.link_domain(domain.clone());

        log::debug!(
            "[IOMMU] Domain {} ({:?}) allocated on {} for bus {}",
            domain.name,
            ty,
            ctrl.name(),
            bus.name()
        );
        Ok(domain)
    }

    /// Take an additional reference.
    ///
    /// Fails with `InvalidState` once the count has reached zero.
    pub fn get(&self) -> IommuResult<()> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(1)
                }
            })
            .map(|_| ())
            .map_err(|_| IommuError::InvalidState)
    }

    /// Drop a reference, tearing the domain down when it was the last one.
    ///
    /// The last reference cannot be dropped while a group still has the
    /// domain attached (`Busy`). Dropping a reference from a domain whose
    /// count already reached zero yields `InvalidState`.
    pub fn free(&self) -> IommuResult<()> {
        let mut count = self.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return Err(IommuError::InvalidState);
            }
            if count == 1 && self.attached.load(Ordering::Acquire) {
                log::warn!(
                    "[IOMMU] Refusing to drop last reference of attached domain {}",
                    self.name
                );
                return Err(IommuError::Busy);
            }
            match self.ref_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }

        if count == 1 {
            self.destroy();
        }
        Ok(())
    }

    /// Alias of [`Domain::free`], for callers pairing it with `get`.
    pub fn dref(&self) -> IommuResult<()> {
        self.free()
    }

    fn destroy(&self) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.unlink_domain(self);
        }
        self.ops.domain_free(self);
        // Handlers commonly capture the domain; break the cycle here.
        self.fault.write().take();
        log::debug!("[IOMMU] Domain {} destroyed", self.name);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the domain still holds at least one reference.
    pub fn is_live(&self) -> bool {
        self.ref_count() != 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain_type(&self) -> DomainType {
        self.ty
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn controller(&self) -> Option<Arc<Controller>> {
        self.ctrl.upgrade()
    }

    pub fn geometry(&self) -> DomainGeometry {
        self.geometry
    }

    /// Driver-private context, if it is a `T`.
    pub fn private<T: Any>(&self) -> Option<&T> {
        self.private.downcast_ref::<T>()
    }

    /// Whether a group currently has this domain attached.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn ops(&self) -> &Arc<dyn IommuOps> {
        &self.ops
    }

    pub(crate) fn belongs_to(&self, ctrl: &Weak<Controller>) -> bool {
        Weak::ptr_eq(&self.ctrl, ctrl)
    }

    /// Mark the domain as owned by a group; false if another group has it.
    pub(crate) fn claim_owner(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_owner(&self) {
        self.attached.store(false, Ordering::Release);
    }

    fn check_live(&self) -> IommuResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(IommuError::InvalidState)
        }
    }

    /// Smallest page size the driver supports, for paging domains only.
    fn min_pagesz(&self) -> IommuResult<u64> {
        self.check_live()?;
        if !self.ty.contains(DomainType::PAGING) {
            return Err(IommuError::InvalidArgument);
        }
        let bitmap = self.ops.pgsize_bitmap();
        if bitmap == 0 {
            return Err(IommuError::Unsupported);
        }
        Ok(1u64 << bitmap.trailing_zeros())
    }

    /// Whether `[addr, addr + size)` fits in the 64-bit address space.
    fn in_address_space(addr: u64, size: usize) -> bool {
        size != 0 && addr.checked_add(size as u64 - 1).is_some()
    }

    /// Map `size` bytes at `paddr` to `iova`.
    ///
    /// Addresses and size must be aligned to the smallest supported page.
    pub fn map(&self, iova: u64, paddr: u64, size: usize, prot: Prot) -> IommuResult<()> {
        let min_pagesz = self.min_pagesz()?;
        if size == 0 || (iova | paddr | size as u64) & (min_pagesz - 1) != 0 {
            log::warn!(
                "[IOMMU] Unaligned map {:#x}->{:#x} size {:#x} on {} (min page {:#x})",
                iova,
                paddr,
                size,
                self.name,
                min_pagesz
            );
            return Err(IommuError::InvalidArgument);
        }
        if !Self::in_address_space(iova, size) || !Self::in_address_space(paddr, size) {
            return Err(IommuError::InvalidArgument);
        }
        if !self.geometry.permits(iova, size) {
            return Err(IommuError::InvalidArgument);
        }

        log::trace!(
            "[IOMMU] map {}: {:#x}->{:#x} size {:#x} prot {:?}",
            self.name,
            iova,
            paddr,
            size,
            prot
        );
        self.ops.map(self, iova, paddr, size, prot)
    }

    /// Unmap up to `size` bytes at `iova`.
    ///
    /// Returns how much the driver actually unmapped, which may be less
    /// than requested; see [`Domain::unmap_range`].
    pub fn unmap(&self, iova: u64, size: usize) -> IommuResult<usize> {
        let min_pagesz = self.min_pagesz()?;
        if size == 0 || (iova | size as u64) & (min_pagesz - 1) != 0 {
            return Err(IommuError::InvalidArgument);
        }
        if !Self::in_address_space(iova, size) || !self.geometry.permits(iova, size) {
            return Err(IommuError::InvalidArgument);
        }

        let mut unmapped = self.ops.unmap(self, iova, size);
        if unmapped > size {
            log::warn!(
                "[IOMMU] Driver reported {:#x} unmapped of {:#x} on {}, clamping",
                unmapped,
                size,
                self.name
            );
            unmapped = size;
        }
        log::trace!(
            "[IOMMU] unmap {}: {:#x} size {:#x} -> {:#x}",
            self.name,
            iova,
            size,
            unmapped
        );
        Ok(unmapped)
    }

    /// Unmap `[iova, iova + size)`, calling the driver until the range is
    /// consumed or it stops making progress. Returns the total unmapped.
    pub fn unmap_range(&self, iova: u64, size: usize) -> IommuResult<usize> {
        let mut unmapped = 0usize;
        while unmapped < size {
            let next = iova
                .checked_add(unmapped as u64)
                .ok_or(IommuError::InvalidArgument)?;
            let step = self.unmap(next, size - unmapped)?;
            if step == 0 {
                break;
            }
            unmapped += step;
        }
        Ok(unmapped)
    }

    /// Translate an IOVA; `None` when unmapped.
    pub fn iova_to_phys(&self, iova: u64) -> Option<u64> {
        if !self.is_live() {
            return None;
        }
        if self.ty == DomainType::IDENTITY {
            return Some(iova);
        }
        if !self.ty.contains(DomainType::PAGING) {
            return None;
        }
        self.ops.iova_to_phys(self, iova)
    }

    /// Configure and enable window `wnd_nr` of a windowed domain.
    pub fn window_enable(&self, wnd_nr: u32, paddr: u64, size: u64, prot: Prot) -> IommuResult<()> {
        self.check_live()?;
        self.ops
            .domain_window_enable(self, wnd_nr, paddr, size, prot)
    }

    /// Disable window `wnd_nr` of a windowed domain.
    pub fn window_disable(&self, wnd_nr: u32) {
        if self.is_live() {
            self.ops.domain_window_disable(self, wnd_nr);
        }
    }

    /// Split the aperture into `count` windows.
    pub fn set_windows(&self, count: u32) -> IommuResult<()> {
        self.check_live()?;
        self.ops.domain_set_windows(self, count)
    }

    /// Number of windows, zero for a non-windowed domain.
    pub fn get_windows(&self) -> u32 {
        self.ops.domain_get_windows(self)
    }

    /// Read an extended attribute.
    ///
    /// Geometry and paging support are answered here; everything else is
    /// up to the driver.
    pub fn get_attr(&self, attr: DomainAttr) -> IommuResult<AttrValue> {
        self.check_live()?;
        match attr {
            DomainAttr::Geometry => Ok(AttrValue::Geometry(self.geometry)),
            DomainAttr::Paging => Ok(AttrValue::Paging(self.ops.pgsize_bitmap() != 0)),
            DomainAttr::Windows => Ok(AttrValue::Windows(self.ops.domain_get_windows(self))),
            _ => self.ops.domain_get_attr(self, attr),
        }
    }

    /// Write an extended attribute.
    pub fn set_attr(&self, value: AttrValue) -> IommuResult<()> {
        self.check_live()?;
        log::debug!("[IOMMU] set_attr {:?} on {}", value.attr(), self.name);
        match value {
            AttrValue::Windows(count) => self.ops.domain_set_windows(self, count),
            _ => self.ops.domain_set_attr(self, &value),
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("bus", &self.bus.name())
            .field("ref_count", &self.ref_count())
            .field("attached", &self.is_attached())
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}
