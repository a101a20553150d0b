//! IOMMU controllers and the controller registry
//!
//! A [`Controller`] is one physical IOMMU instance. It owns the list of groups
//! and the list of domains created against it, each behind its own lock so
//! group and domain management never contend. The [`ControllerRegistry`] is
//! the process-wide catalogue of registered controllers.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::ControlFlow;

use lazy_static::lazy_static;
use spin::Mutex;

use super::device::Device;
use super::domain::Domain;
use super::group::Group;
use super::{check_name, IOMMU_NAME_SIZE};
use crate::error::{IommuError, IommuResult};

/// One physical IOMMU instance
pub struct Controller {
    name: String,
    dev: Arc<Device>,
    groups: Mutex<Vec<Arc<Group>>>,
    domains: Mutex<Vec<Arc<Domain>>>,
}

impl Controller {
    /// Create a controller for the IOMMU device `dev`.
    pub fn new(name: &str, dev: Arc<Device>) -> IommuResult<Arc<Self>> {
        check_name(name, IOMMU_NAME_SIZE)?;
        Ok(Arc::new(Self {
            name: String::from(name),
            dev,
            groups: Mutex::new(Vec::new()),
            domains: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The IOMMU hardware device backing this controller.
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Visit each group of this controller under the group lock.
    ///
    /// Stops at the first `Break` and returns it. The visitor must not call
    /// back into group allocation or release on this controller.
    pub fn for_each_group<B, F>(&self, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(&Arc<Group>) -> ControlFlow<B>,
    {
        for group in self.groups.lock().iter() {
            if let ControlFlow::Break(b) = f(group) {
                return ControlFlow::Break(b);
            }
        }
        ControlFlow::Continue(())
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Visit each domain of this controller under the domain lock.
    ///
    /// Same contract as [`Controller::for_each_group`].
    pub fn for_each_domain<B, F>(&self, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(&Arc<Domain>) -> ControlFlow<B>,
    {
        for domain in self.domains.lock().iter() {
            if let ControlFlow::Break(b) = f(domain) {
                return ControlFlow::Break(b);
            }
        }
        ControlFlow::Continue(())
    }

    pub fn domain_count(&self) -> usize {
        self.domains.lock().len()
    }

    pub(crate) fn groups(&self) -> &Mutex<Vec<Arc<Group>>> {
        &self.groups
    }

    pub(crate) fn link_domain(&self, domain: Arc<Domain>) {
        self.domains.lock().push(domain);
    }

    /// Drop a domain from the list; false if it was not linked.
    pub(crate) fn unlink_domain(&self, domain: &Domain) -> bool {
        let mut domains = self.domains.lock();
        match domains
            .iter()
            .position(|d| core::ptr::eq(Arc::as_ptr(d), domain))
        {
            Some(pos) => {
                domains.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("dev", &self.dev.name())
            .field("groups", &self.group_count())
            .field("domains", &self.domain_count())
            .finish()
    }
}

/// Catalogue of registered controllers
pub struct ControllerRegistry {
    controllers: Mutex<Vec<Arc<Controller>>>,
}

lazy_static! {
    /// Process-wide controller registry.
    static ref IOMMU_CONTROLLERS: ControllerRegistry = ControllerRegistry::new();
}

/// The process-wide controller registry.
pub fn registry() -> &'static ControllerRegistry {
    &IOMMU_CONTROLLERS
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self {
            controllers: Mutex::new(Vec::new()),
        }
    }

    /// Register a controller.
    ///
    /// Fails with `DuplicateName` if a controller with the same name is
    /// already registered.
    pub fn register(&self, ctrl: &Arc<Controller>) -> IommuResult<()> {
        let mut controllers = self.controllers.lock();
        if controllers.iter().any(|c| c.name == ctrl.name) {
            return Err(IommuError::DuplicateName);
        }
        controllers.push(ctrl.clone());
        log::info!(
            "[IOMMU] Registered controller {} (device {})",
            ctrl.name,
            ctrl.dev.name()
        );
        Ok(())
    }

    /// Unregister a controller.
    ///
    /// Refuses with `Busy` while the controller still owns groups or domains.
    pub fn unregister(&self, ctrl: &Arc<Controller>) -> IommuResult<()> {
        let mut controllers = self.controllers.lock();
        let pos = controllers
            .iter()
            .position(|c| Arc::ptr_eq(c, ctrl))
            .ok_or(IommuError::NotFound)?;

        let (groups, domains) = (ctrl.group_count(), ctrl.domain_count());
        if groups != 0 || domains != 0 {
            log::warn!(
                "[IOMMU] Controller {} busy: {} groups, {} domains",
                ctrl.name,
                groups,
                domains
            );
            return Err(IommuError::Busy);
        }

        controllers.remove(pos);
        log::info!("[IOMMU] Unregistered controller {}", ctrl.name);
        Ok(())
    }

    /// Find a controller by name.
    pub fn find(&self, name: &str) -> IommuResult<Arc<Controller>> {
        self.controllers
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or(IommuError::NotFound)
    }

    /// Visit controllers starting at `start`, or at the head when `None`.
    ///
    /// Stops at the first `Break` and returns it. An unregistered `start`
    /// visits nothing. The visitor runs under the registry lock and must not
    /// call back into the registry.
    pub fn iterate<B, F>(&self, start: Option<&Arc<Controller>>, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(&Arc<Controller>) -> ControlFlow<B>,
    {
        let controllers = self.controllers.lock();
        let first = match start {
            Some(start) => match controllers.iter().position(|c| Arc::ptr_eq(c, start)) {
                Some(pos) => pos,
                None => return ControlFlow::Continue(()),
            },
            None => 0,
        };
        for ctrl in &controllers[first..] {
            if let ControlFlow::Break(b) = f(ctrl) {
                return ControlFlow::Break(b);
            }
        }
        ControlFlow::Continue(())
    }

    /// Number of registered controllers.
    pub fn count(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Forget every controller; only meaningful between test cases.
    pub fn reset(&self) {
        self.controllers.lock().clear();
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("count", &self.count())
            .finish()
    }
}
