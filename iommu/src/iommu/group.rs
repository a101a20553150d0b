//! IOMMU groups
//!
//! A group is the smallest set of devices the hardware can isolate from the
//! rest of the system. All members share one translation context, so a domain
//! is attached to a group as a whole and never to a single device.
//!
//! Lock order: controller group list, then group domain slot, then member
//! list, then the device's group back-reference.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::controller::{self, Controller};
use super::device::Device;
use super::domain::Domain;
use super::notify::{GroupEvent, NotifierChain, NotifierId};
use super::payload::Payload;
use super::{check_name, FIELD_NAME_SIZE};
use crate::error::{IommuError, IommuResult};

/// Next group ID; unique for the life of the process
static NEXT_GROUP_ID: AtomicU32 = AtomicU32::new(0);

/// Devices sharing one DMA translation context
pub struct Group {
    id: u32,
    name: String,
    ctrl: Weak<Controller>,
    /// Cleared by `free`; a dead group accepts no devices or domains
    live: AtomicBool,
    domain: Mutex<Option<Arc<Domain>>>,
    devices: Mutex<Vec<Arc<Device>>>,
    iommu_data: Mutex<Option<Payload>>,
    notifier: NotifierChain,
}

impl Group {
    /// Allocate a group under `ctrl`.
    pub fn alloc(name: &str, ctrl: &Arc<Controller>) -> IommuResult<Arc<Self>> {
        check_name(name, FIELD_NAME_SIZE)?;

        let group = Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            ctrl: Arc::downgrade(ctrl),
            live: AtomicBool::new(true),
            domain: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
            iommu_data: Mutex::new(None),
            notifier: NotifierChain::new(),
        });
        ctrl.groups().lock().push(group.clone());

        log::debug!(
            "[IOMMU] Group {} (id {}) allocated on {}",
            group.name,
            group.id,
            ctrl.name()
        );
        Ok(group)
    }

    /// Current group of `dev`.
    pub fn get(dev: &Device) -> IommuResult<Arc<Self>> {
        dev.iommu_group().ok_or(IommuError::NotFound)
    }

    /// Look up a group by ID across all registered controllers.
    pub fn get_by_id(id: u32) -> IommuResult<Arc<Self>> {
        let found = controller::registry().iterate(None, |ctrl| {
            ctrl.for_each_group(|group| {
                if group.id == id {
                    ControlFlow::Break(group.clone())
                } else {
                    ControlFlow::Continue(())
                }
            })
        });
        match found {
            ControlFlow::Break(group) => Ok(group),
            ControlFlow::Continue(()) => Err(IommuError::NotFound),
        }
    }

    /// Release the group.
    ///
    /// The group must have no attached domain and no member devices. On
    /// success its private data is released.
    pub fn free(self: &Arc<Self>) -> IommuResult<()> {
        let ctrl = self.ctrl.upgrade().ok_or(IommuError::NotFound)?;
        {
            let mut groups = ctrl.groups().lock();
            let pos = groups
                .iter()
                .position(|g| Arc::ptr_eq(g, self))
                .ok_or(IommuError::NotFound)?;

            let domain = self.domain.lock();
            let devices = self.devices.lock();
            if domain.is_some() || !devices.is_empty() {
                log::warn!(
                    "[IOMMU] Group {} busy: domain attached {}, {} devices",
                    self.name,
                    domain.is_some(),
                    devices.len()
                );
                return Err(IommuError::Busy);
            }
            self.live.store(false, Ordering::Release);
            groups.remove(pos);
        }

        // Runs the release callback, if data was set.
        drop(self.iommu_data.lock().take());

        log::debug!("[IOMMU] Group {} (id {}) freed", self.name, self.id);
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller this group was allocated under.
    pub fn controller(&self) -> Option<Arc<Controller>> {
        self.ctrl.upgrade()
    }

    /// Attach private data, replacing (and releasing) any previous data.
    pub fn set_iommudata(&self, data: Payload) {
        let previous = self.iommu_data.lock().replace(data);
        drop(previous);
    }

    /// Run `f` on the private data if it is a `T`.
    pub fn with_iommudata<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.iommu_data
            .lock()
            .as_ref()
            .and_then(|data| data.downcast_ref::<T>())
            .map(f)
    }

    /// Copy of the private data if it is a `T`.
    pub fn get_iommudata<T: Any + Clone>(&self) -> Option<T> {
        self.with_iommudata(T::clone)
    }

    /// Add a device to this group.
    ///
    /// A device in another group is refused with `AlreadyMember`. If a
    /// domain is attached, the device is attached to it before it joins.
    pub fn add_device(self: &Arc<Self>, dev: &Arc<Device>) -> IommuResult<()> {
        {
            let domain = self.domain.lock();
            if !self.live.load(Ordering::Acquire) {
                return Err(IommuError::InvalidState);
            }
            let mut devices = self.devices.lock();
            let mut membership = dev.group_slot().lock();

            if let Some(current) = membership.as_ref().and_then(Weak::upgrade) {
                if Arc::ptr_eq(&current, self) {
                    return Ok(());
                }
                return Err(IommuError::AlreadyMember);
            }

            if let Some(domain) = domain.as_ref() {
                if let Err(e) = domain.ops().attach_dev(domain, dev) {
                    log::warn!(
                        "[IOMMU] Device {} failed to join attached domain {}: {:?}",
                        dev.name(),
                        domain.name(),
                        e
                    );
                    return Err(e);
                }
            }

            devices.push(dev.clone());
            *membership = Some(Arc::downgrade(self));
        }

        log::debug!("[IOMMU] Device {} added to group {}", dev.name(), self.name);
        self.notifier.call(GroupEvent::AddDevice, self, dev);
        Ok(())
    }

    /// Remove a device from whatever group it belongs to.
    ///
    /// Observers get `DelDevice` while the membership is still visible, and
    /// only for a device actually on the member list. Two racing removals of
    /// the same device can both notify; the loser then returns `NotFound`.
    pub fn remove_device(dev: &Arc<Device>) -> IommuResult<()> {
        let group = dev.iommu_group().ok_or(IommuError::NotFound)?;
        if !group.devices.lock().iter().any(|d| Arc::ptr_eq(d, dev)) {
            return Err(IommuError::NotFound);
        }
        group.notifier.call(GroupEvent::DelDevice, &group, dev);

        let domain = group.domain.lock();
        let mut devices = group.devices.lock();
        let mut membership = dev.group_slot().lock();

        let pos = devices
            .iter()
            .position(|d| Arc::ptr_eq(d, dev))
            .ok_or(IommuError::NotFound)?;
        if let Some(domain) = domain.as_ref() {
            domain.ops().detach_dev(domain, dev);
        }
        devices.remove(pos);
        *membership = None;

        log::debug!(
            "[IOMMU] Device {} removed from group {}",
            dev.name(),
            group.name
        );
        Ok(())
    }

    /// Visit each member device under the group lock.
    ///
    /// Stops at the first `Break` and returns it.
    pub fn for_each_dev<B, F>(&self, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(&Arc<Device>) -> ControlFlow<B>,
    {
        for dev in self.devices.lock().iter() {
            if let ControlFlow::Break(b) = f(dev) {
                return ControlFlow::Break(b);
            }
        }
        ControlFlow::Continue(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Attach `domain` to every device in the group.
    ///
    /// All or nothing: if any device fails, the devices already attached are
    /// detached again and the driver's error is returned.
    pub fn attach_domain(&self, domain: &Arc<Domain>) -> IommuResult<()> {
        let mut slot = self.domain.lock();
        if !self.live.load(Ordering::Acquire) {
            return Err(IommuError::InvalidState);
        }
        if slot.is_some() {
            return Err(IommuError::AlreadyAttached);
        }
        if !domain.is_live() {
            return Err(IommuError::InvalidState);
        }
        if !domain.belongs_to(&self.ctrl) {
            return Err(IommuError::InvalidArgument);
        }
        if !domain.claim_owner() {
            return Err(IommuError::AlreadyAttached);
        }

        let devices = self.devices.lock();
        for (i, dev) in devices.iter().enumerate() {
            if let Err(e) = domain.ops().attach_dev(domain, dev) {
                log::warn!(
                    "[IOMMU] Attach of {} to group {} failed at device {}: {:?}, rolling back",
                    domain.name(),
                    self.name,
                    dev.name(),
                    e
                );
                for prev in devices[..i].iter().rev() {
                    domain.ops().detach_dev(domain, prev);
                }
                domain.release_owner();
                return Err(e);
            }
        }

        *slot = Some(domain.clone());
        log::debug!(
            "[IOMMU] Domain {} attached to group {} ({} devices)",
            domain.name(),
            self.name,
            devices.len()
        );
        Ok(())
    }

    /// Detach the current domain, if any, from every device in the group.
    pub fn detach_domain(&self) -> IommuResult<()> {
        let mut slot = self.domain.lock();
        let domain = match slot.take() {
            Some(domain) => domain,
            None => return Ok(()),
        };

        for dev in self.devices.lock().iter() {
            domain.ops().detach_dev(&domain, dev);
        }
        domain.release_owner();

        log::debug!(
            "[IOMMU] Domain {} detached from group {}",
            domain.name(),
            self.name
        );
        Ok(())
    }

    /// Domain currently attached to this group.
    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.lock().clone()
    }

    /// Subscribe to `event` on this group.
    pub fn register_notifier<F>(&self, event: GroupEvent, f: F) -> NotifierId
    where
        F: Fn(GroupEvent, &Group, &Arc<Device>) + Send + Sync + 'static,
    {
        self.notifier.register(event, Arc::new(f))
    }

    pub fn unregister_notifier(&self, id: NotifierId) -> IommuResult<()> {
        if self.notifier.unregister(id) {
            Ok(())
        } else {
            Err(IommuError::NotFound)
        }
    }

    pub fn notifier_count(&self, event: GroupEvent) -> usize {
        self.notifier.count(event)
    }

    /// Signal a driver-binding event for a member device.
    ///
    /// Membership events are raised by the group itself.
    pub fn notify(&self, event: GroupEvent, dev: &Arc<Device>) -> IommuResult<()> {
        match event {
            GroupEvent::AddDevice | GroupEvent::DelDevice => Err(IommuError::InvalidArgument),
            _ => {
                self.notifier.call(event, self, dev);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("devices", &self.device_count())
            .finish_non_exhaustive()
    }
}
