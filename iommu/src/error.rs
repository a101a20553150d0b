//! Error types for the IOMMU framework
//!
//! Every control-plane operation reports failure synchronously through
//! [`IommuError`]. Codes returned by a driver's operation set travel through
//! unchanged as [`IommuError::Driver`].

use core::fmt;

/// IOMMU operation result type
pub type IommuResult<T> = core::result::Result<T, IommuError>;

/// IOMMU framework error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Controller, group, device or domain lookup missed
    NotFound,
    /// A controller with the same name is already registered
    DuplicateName,
    /// Device already belongs to another group
    AlreadyMember,
    /// Group already has a domain, or domain already has an owner group
    AlreadyAttached,
    /// Object is still referenced, attached or non-empty
    Busy,
    /// Domain type or attribute not supported by the driver
    Unsupported,
    /// Allocation failure
    NoMemory,
    /// No fault handler installed
    NotImplemented,
    /// Malformed request (bad domain type, alignment, aperture)
    InvalidArgument,
    /// Name exceeds the bounded name length
    NameTooLong,
    /// Bus has no IOMMU operation set
    NoIommu,
    /// Domain reference count already dropped to zero
    InvalidState,
    /// Framework used before `iommu::init`
    NotInitialized,
    /// Error code reported by the hardware driver, passed through verbatim
    Driver(i32),
}

impl IommuError {
    /// Get a static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::DuplicateName => "Name already registered",
            Self::AlreadyMember => "Device already member of a group",
            Self::AlreadyAttached => "Domain already attached",
            Self::Busy => "Resource busy",
            Self::Unsupported => "Not supported by IOMMU driver",
            Self::NoMemory => "Out of memory",
            Self::NotImplemented => "Not implemented",
            Self::InvalidArgument => "Invalid argument",
            Self::NameTooLong => "Name too long",
            Self::NoIommu => "No IOMMU on bus",
            Self::InvalidState => "Invalid object state",
            Self::NotInitialized => "IOMMU framework not initialized",
            Self::Driver(_) => "IOMMU driver error",
        }
    }

    /// Convert error to a negative errno-style code
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => -2,
            Self::DuplicateName | Self::AlreadyMember => -17,
            Self::AlreadyAttached | Self::Busy => -16,
            Self::Unsupported => -95,
            Self::NoMemory => -12,
            Self::NotImplemented => -38,
            Self::InvalidArgument => -22,
            Self::NameTooLong => -36,
            Self::NoIommu => -19,
            Self::InvalidState => -14,
            Self::NotInitialized => -11,
            Self::Driver(code) if code > 0 => -code,
            Self::Driver(code) => code,
        }
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver(code) => write!(f, "{}: code {}", self.as_str(), code),
            _ => f.write_str(self.as_str()),
        }
    }
}
