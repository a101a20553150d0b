//! Driver operation set
//!
//! A concrete IOMMU driver (SMMU, VT-d, PAMU, ...) implements [`IommuOps`]
//! and installs it on the bus its devices live on. The framework never
//! touches hardware itself; it only calls through this trait.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use bitflags::bitflags;

use super::controller::Controller;
use super::device::Device;
use super::domain::{Domain, DomainGeometry};
use crate::error::{IommuError, IommuResult};

bitflags! {
    /// Mapping protection attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// DMA cache coherency
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
    }
}

bitflags! {
    /// Domain feature flags.
    ///
    /// Only the combinations exposed as associated constants below are valid
    /// domain types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DomainType: u32 {
        /// Supports map/unmap
        const PAGING = 1 << 0;
        /// Used by a DMA-API implementation
        const DMA_API = 1 << 1;
        /// Identity mapped
        const PT = 1 << 2;
    }
}

impl DomainType {
    /// All DMA is blocked; isolates devices.
    pub const BLOCKED: Self = Self::empty();
    /// DMA addresses are system physical addresses.
    pub const IDENTITY: Self = Self::PT;
    /// Mappings managed by the IOMMU API user; used for guests.
    pub const UNMANAGED: Self = Self::PAGING;
    /// Internal DMA-API domain.
    pub const DMA: Self = Self::PAGING.union(Self::DMA_API);

    /// Whether this flag combination is one of the four domain types.
    pub fn is_valid(self) -> bool {
        self == Self::BLOCKED
            || self == Self::IDENTITY
            || self == Self::UNMANAGED
            || self == Self::DMA
    }
}

bitflags! {
    /// Fault flags passed to fault handlers.
    ///
    /// An empty set is a read fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
    }
}

impl FaultFlags {
    pub const READ: Self = Self::empty();

    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// Hardware capabilities a driver may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuCap {
    /// IOMMU can enforce cache coherent DMA transactions
    CacheCoherency,
    /// IOMMU supports interrupt isolation
    IntrRemap,
    /// IOMMU honours `Prot::NOEXEC`
    NoExec,
}

/// Extended domain attributes.
///
/// FSL PAMUv1 constraints: the aperture must be a naturally aligned power of
/// two, the window count must be a power of two, and each window's mapped
/// size must be a power of two of at least 4KB with a naturally aligned
/// physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainAttr {
    Geometry,
    Paging,
    Windows,
    FslPamuStash,
    FslPamuEnable,
    FslPamuV1,
}

/// Value carried by a domain attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrValue {
    Geometry(DomainGeometry),
    Paging(bool),
    Windows(u32),
    FslPamuStash { cpu: u32, cache: u32 },
    FslPamuEnable(bool),
    FslPamuV1(bool),
}

impl AttrValue {
    /// The attribute this value belongs to.
    pub fn attr(&self) -> DomainAttr {
        match self {
            Self::Geometry(_) => DomainAttr::Geometry,
            Self::Paging(_) => DomainAttr::Paging,
            Self::Windows(_) => DomainAttr::Windows,
            Self::FslPamuStash { .. } => DomainAttr::FslPamuStash,
            Self::FslPamuEnable(_) => DomainAttr::FslPamuEnable,
            Self::FslPamuV1(_) => DomainAttr::FslPamuV1,
        }
    }
}

/// Firmware reference to an IOMMU plus the master-ID cells that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhandleArgs {
    /// Name of the IOMMU node the phandle points at
    pub node: String,
    /// Specifier cells
    pub args: Vec<u32>,
}

/// What a driver hands back from `domain_alloc`.
pub struct DriverDomain {
    /// Driver-private context, owned by the domain until teardown
    pub private: Box<dyn Any + Send + Sync>,
    /// Address range the domain can map
    pub geometry: DomainGeometry,
}

impl DriverDomain {
    /// Wrap driver state with an unrestricted geometry.
    pub fn new<T: Any + Send + Sync>(private: T) -> Self {
        Self {
            private: Box::new(private),
            geometry: DomainGeometry::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: DomainGeometry) -> Self {
        self.geometry = geometry;
        self
    }
}

impl core::fmt::Debug for DriverDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverDomain")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

/// IOMMU ops and capabilities.
///
/// Optional operations have defaults that report [`IommuError::Unsupported`]
/// (or do nothing, for the infallible ones).
pub trait IommuOps: Send + Sync {
    /// Check capability
    fn capable(&self, cap: IommuCap) -> bool;

    /// Allocate driver state for a new domain
    fn domain_alloc(&self, ty: DomainType, ctrl: &Arc<Controller>) -> IommuResult<DriverDomain>;

    /// Release driver state of a domain whose last reference dropped
    fn domain_free(&self, domain: &Domain);

    /// Attach a device to a domain
    fn attach_dev(&self, domain: &Domain, dev: &Arc<Device>) -> IommuResult<()>;

    /// Detach a device from a domain
    fn detach_dev(&self, domain: &Domain, dev: &Arc<Device>);

    /// Map a physically contiguous region into a domain
    fn map(&self, domain: &Domain, iova: u64, paddr: u64, size: usize, prot: Prot)
        -> IommuResult<()>;

    /// Unmap up to `size` bytes at `iova`, returning how much was unmapped
    fn unmap(&self, domain: &Domain, iova: u64, size: usize) -> usize;

    /// Translate an IOVA, `None` if unmapped
    fn iova_to_phys(&self, domain: &Domain, iova: u64) -> Option<u64>;

    /// Add a device to IOMMU grouping
    fn add_device(&self, _dev: &Arc<Device>) -> IommuResult<()> {
        Err(IommuError::Unsupported)
    }

    /// Remove a device from IOMMU grouping
    fn remove_device(&self, _dev: &Arc<Device>) {}

    /// Query a driver-defined domain attribute
    fn domain_get_attr(&self, _domain: &Domain, _attr: DomainAttr) -> IommuResult<AttrValue> {
        Err(IommuError::Unsupported)
    }

    /// Change a driver-defined domain attribute
    fn domain_set_attr(&self, _domain: &Domain, _value: &AttrValue) -> IommuResult<()> {
        Err(IommuError::Unsupported)
    }

    /// Configure and enable a window of a windowed domain
    fn domain_window_enable(
        &self,
        _domain: &Domain,
        _wnd_nr: u32,
        _paddr: u64,
        _size: u64,
        _prot: Prot,
    ) -> IommuResult<()> {
        Err(IommuError::Unsupported)
    }

    /// Disable a window of a windowed domain
    fn domain_window_disable(&self, _domain: &Domain, _wnd_nr: u32) {}

    /// Set the number of windows of a domain
    fn domain_set_windows(&self, _domain: &Domain, _count: u32) -> IommuResult<()> {
        Err(IommuError::Unsupported)
    }

    /// Number of windows of a domain, zero if not windowed
    fn domain_get_windows(&self, _domain: &Domain) -> u32 {
        0
    }

    /// Add firmware master IDs of a device to IOMMU grouping
    fn of_xlate(&self, _dev: &Arc<Device>, _args: &PhandleArgs) -> IommuResult<()> {
        Err(IommuError::Unsupported)
    }

    /// Bitmap of all supported page sizes
    fn pgsize_bitmap(&self) -> u64;
}
