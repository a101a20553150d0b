//! VMM IOMMU Framework
//!
//! Host-side control plane for device pass-through. Tracks the IOMMU
//! controllers present in the machine, the groups of devices that share a
//! translation context behind each controller, and the translation domains
//! bound to those groups. All hardware work is delegated to a driver-supplied
//! [`iommu::IommuOps`] implementation.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod iommu;

pub use error::{IommuError, IommuResult};
pub use iommu::{
    Bus, Controller, ControllerRegistry, Device, Domain, DomainAttr, DomainGeometry, DomainType,
    DriverDomain, FaultFlags, Group, GroupEvent, IommuCap, IommuOps, PhandleArgs, Prot,
};
