//! Fault reporting
//!
//! Each domain carries at most one fault handler plus an opaque token handed
//! back on every invocation. Hardware drivers call [`report_iommu_fault`]
//! from their interrupt path, so dispatch never waits on a lock: it tries
//! the domain's handler slot once and never touches registry, controller or
//! group locks. A fault that lands while the slot is being rewritten (by
//! `set_fault_handler`, `clear_fault_handler` or domain teardown) is treated
//! as having no handler and reported back as `NotImplemented`.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::device::Device;
use super::domain::Domain;
use super::ops::FaultFlags;
use crate::error::{IommuError, IommuResult};

/// Opaque value given back to the fault handler
pub type FaultToken = Arc<dyn Any + Send + Sync>;

/// Fault handler callback.
///
/// Returns `Ok` if the fault was handled. Any error is passed back to the
/// reporting driver, which then applies its default behavior.
pub type FaultHandler = Arc<
    dyn Fn(&Domain, &Arc<Device>, u64, FaultFlags, Option<&FaultToken>) -> IommuResult<()>
        + Send
        + Sync,
>;

/// Installed handler plus its token
#[derive(Clone)]
pub(crate) struct FaultSlot {
    handler: FaultHandler,
    token: Option<FaultToken>,
}

/// Per-domain fault counters
#[derive(Debug, Default)]
pub struct FaultStats {
    reported: AtomicU64,
    handled: AtomicU64,
    unhandled: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            reported: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
        }
    }

    /// Faults reported against the domain.
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    /// Faults a handler accepted.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Faults with no handler, or that the handler declined.
    pub fn unhandled(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }
}

impl Domain {
    /// Install a fault handler, replacing any previous one.
    pub fn set_fault_handler<F>(&self, handler: F, token: Option<FaultToken>)
    where
        F: Fn(&Domain, &Arc<Device>, u64, FaultFlags, Option<&FaultToken>) -> IommuResult<()>
            + Send
            + Sync
            + 'static,
    {
        *self.fault.write() = Some(FaultSlot {
            handler: Arc::new(handler),
            token,
        });
        log::debug!("[IOMMU] Fault handler installed on {}", self.name());
    }

    /// Remove the fault handler, if any.
    pub fn clear_fault_handler(&self) {
        self.fault.write().take();
    }

    pub fn has_fault_handler(&self) -> bool {
        self.fault.read().is_some()
    }

    /// Report a translation fault on `iova` by `dev`.
    ///
    /// Returns `NotImplemented` when no handler is installed, or when the
    /// handler slot is being replaced at that moment; otherwise the
    /// handler's own result. Never spins, so it is safe from interrupt
    /// context.
    pub fn report_fault(&self, dev: &Arc<Device>, iova: u64, flags: FaultFlags) -> IommuResult<()> {
        self.fault_stats.reported.fetch_add(1, Ordering::Relaxed);

        // Clone out so the handler may reinstall itself.
        let slot = self.fault.try_read().and_then(|slot| (*slot).clone());
        let result = match slot {
            Some(slot) => (slot.handler)(self, dev, iova, flags, slot.token.as_ref()),
            None => {
                log::warn!(
                    "[IOMMU] No fault handler on {} (device {}, iova {:#x})",
                    self.name(),
                    dev.name(),
                    iova
                );
                Err(IommuError::NotImplemented)
            }
        };

        match result {
            Ok(()) => {
                self.fault_stats.handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.fault_stats.unhandled.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "[IOMMU] Unhandled {} fault on {}: device {}, iova {:#x} ({})",
                    if flags.is_write() { "write" } else { "read" },
                    self.name(),
                    dev.name(),
                    iova,
                    err
                );
            }
        }
        result
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }
}

impl fmt::Debug for FaultSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultSlot")
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

/// Report an IOMMU fault to the domain's handler.
///
/// Called by hardware drivers, possibly from interrupt context.
pub fn report_iommu_fault(
    domain: &Domain,
    dev: &Arc<Device>,
    iova: u64,
    flags: FaultFlags,
) -> IommuResult<()> {
    domain.report_fault(dev, iova, flags)
}
