use std::sync::Mutex;

use vpci_iface::{IrqInfo, MsiRouteConfig, MsiState, VfioDeviceFd, VmIrqRouter, UNASSIGNED_GSI};
use vpci_irq::IrqSetBuffer;

use crate::error::MsiError;
use crate::vector::MsixEntry;
use crate::vector::MsiVector;

/// Shared guts of one MSI or MSI-X capability. Guarded by the single mutex
/// the concurrency model grants this capability — callers take the lock for
/// the duration of a config-space or MMIO access, including the host ioctl
/// it may trigger, which is intentional: it serializes mode transitions
/// against a concurrent table write from a second guest CPU.
pub struct MsiCapabilityInner {
    pub position: u16,
    pub guest_state: MsiState,
    pub host_state: MsiState,
    pub irq_info: IrqInfo,
    irq_set: IrqSetBuffer,
    pub vectors: Vec<MsiVector>,
}

pub struct MsiCapability {
    irq_index: u32,
    inner: Mutex<MsiCapabilityInner>,
}

impl MsiCapability {
    pub fn new(position: u16, irq_index: u32, irq_info: IrqInfo, nr_entries: usize) -> Self {
        let vectors = (0..nr_entries).map(|_| MsiVector::new()).collect();
        Self {
            irq_index,
            inner: Mutex::new(MsiCapabilityInner {
                position,
                // A capability starts disabled, masked, and empty: nothing
                // has been armed on the host yet.
                guest_state: MsiState::MASKED | MsiState::EMPTY,
                host_state: MsiState::MASKED | MsiState::EMPTY,
                irq_info,
                irq_set: IrqSetBuffer::new(irq_index, nr_entries),
                vectors,
            }),
        }
    }

    pub fn irq_index(&self) -> u32 {
        self.irq_index
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MsiCapabilityInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Capability-enable transition: the guest wrote the enable bit in the
    /// MSI or MSI-X control register.
    pub fn set_enabled(
        &self,
        enabled: bool,
        device: &dyn VfioDeviceFd,
        router: &dyn VmIrqRouter,
    ) -> Result<(), MsiError> {
        let mut inner = self.lock();
        inner.guest_state.set(MsiState::ENABLED, enabled);
        if enabled {
            enable_msis(&mut inner, device, router)
        } else {
            disable_msis(&mut inner, device)
        }
    }

    /// Capability-mask transition: the MSI-X "mask all" bit, or the MSI
    /// per-vector mask-bit register being written as a whole.
    pub fn set_capability_masked(
        &self,
        masked: bool,
        device: &dyn VfioDeviceFd,
        router: &dyn VmIrqRouter,
    ) -> Result<(), MsiError> {
        let mut inner = self.lock();
        inner.guest_state.set(MsiState::MASKED, masked);
        enable_msis(&mut inner, device, router)
    }

    /// Vector update: an MSI-X table write, or an MSI address/data write.
    pub fn update_vector(
        &self,
        vector_index: usize,
        new_config: MsixEntry,
        device: &dyn VfioDeviceFd,
        router: &dyn VmIrqRouter,
    ) -> Result<(), MsiError> {
        let mut inner = self.lock();
        update_msi_entry(&mut inner, vector_index, new_config, device, router)?;
        enable_msis(&mut inner, device, router)
    }
}

fn route_config(entry: MsixEntry) -> MsiRouteConfig {
    MsiRouteConfig {
        address_lo: entry.address_lo,
        address_hi: entry.address_hi,
        data: entry.data,
    }
}

/// Per-vector reconciliation (`update_msi_entry`): refresh the vector's
/// mask bit, and if the host side is already armed (not EMPTY), apply a
/// targeted `arm_single` diff for this one vector without disturbing the
/// others. Rule: mask-all (capability-level) takes precedence over
/// per-vector mask when deciding whether a route should exist.
fn update_msi_entry(
    inner: &mut MsiCapabilityInner,
    vector_index: usize,
    new_config: MsixEntry,
    device: &dyn VfioDeviceFd,
    router: &dyn VmIrqRouter,
) -> Result<(), MsiError> {
    if vector_index >= inner.vectors.len() {
        return Err(MsiError::VectorOutOfRange(vector_index));
    }

    inner.vectors[vector_index].config = new_config;
    inner.vectors[vector_index].guest_state.remove(MsiState::EMPTY);
    inner.vectors[vector_index].guest_state.set(MsiState::MASKED, new_config.masked());

    let capability_masked = inner.guest_state.contains(MsiState::MASKED);
    let desired_masked = capability_masked || new_config.masked();

    if inner.host_state.contains(MsiState::EMPTY) {
        // Accumulate purely in software; `enable_msis` performs the bulk
        // bring-up once the capability itself is unmasked.
        return Ok(());
    }

    let currently_masked = inner.vectors[vector_index].host_state.contains(MsiState::MASKED);

    if desired_masked == currently_masked {
        // The mask bit didn't change, so no host SET_IRQS is needed, but
        // the route's address/data is unconditionally kept in sync.
        let gsi = inner.vectors[vector_index].gsi;
        if gsi != UNASSIGNED_GSI {
            router
                .update_msi_route(gsi, route_config(new_config))
                .map_err(MsiError::RouteUpdate)?;
        }
        return Ok(());
    }

    if desired_masked {
        inner.irq_set.arm_single(device, vector_index, -1)?;
        if let Err(e) = router.remove_irqfd(inner.vectors[vector_index].gsi, inner.vectors[vector_index].raw_eventfd()) {
            log::warn!("remove_irqfd failed for vector {vector_index}: {e}");
        }
        inner.vectors[vector_index].host_state.insert(MsiState::MASKED);
    } else {
        let eventfd = inner.vectors[vector_index]
            .ensure_eventfd()
            .map_err(MsiError::RouteUpdate)?;
        let gsi = if inner.vectors[vector_index].gsi == UNASSIGNED_GSI {
            let gsi = router
                .add_msi_route(route_config(new_config))
                .map_err(MsiError::RouteUpdate)?;
            inner.vectors[vector_index].gsi = gsi;
            gsi
        } else {
            let gsi = inner.vectors[vector_index].gsi;
            router
                .update_msi_route(gsi, route_config(new_config))
                .map_err(MsiError::RouteUpdate)?;
            gsi
        };
        router.add_irqfd(gsi, eventfd, None).map_err(MsiError::RouteUpdate)?;
        inner.irq_set.arm_single(device, vector_index, eventfd)?;
        inner.vectors[vector_index].host_state.remove(MsiState::MASKED);
    }
    Ok(())
}

/// Capability-level reconciliation. Idempotent: if the capability is
/// already armed (host EMPTY already cleared) this is a no-op, since
/// per-vector diffs are already applied by `update_msi_entry`.
fn enable_msis(inner: &mut MsiCapabilityInner, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter) -> Result<(), MsiError> {
    if !inner.host_state.contains(MsiState::EMPTY) {
        return Ok(());
    }
    let guest_enabled = inner.guest_state.contains(MsiState::ENABLED);
    let guest_unmasked = !inner.guest_state.contains(MsiState::MASKED);
    let has_configured_vector = inner.vectors.iter().any(|v| !v.guest_state.contains(MsiState::EMPTY));

    if !(guest_enabled && guest_unmasked && has_configured_vector) {
        return Ok(());
    }

    let mut fds = Vec::with_capacity(inner.vectors.len());
    for vector in inner.vectors.iter_mut() {
        let configured = !vector.guest_state.contains(MsiState::EMPTY);
        let masked = vector.guest_state.contains(MsiState::MASKED);
        if configured && !masked {
            let fd = vector.ensure_eventfd().map_err(MsiError::RouteUpdate)?;
            let gsi = router
                .add_msi_route(route_config(vector.config))
                .map_err(MsiError::RouteUpdate)?;
            vector.gsi = gsi;
            router.add_irqfd(gsi, fd, None).map_err(MsiError::RouteUpdate)?;
            vector.host_state.remove(MsiState::MASKED);
            fds.push(fd);
        } else {
            vector.host_state.insert(MsiState::MASKED);
            fds.push(-1);
        }
    }

    inner.irq_set.arm_multi(device, &fds)?;
    inner.host_state.remove(MsiState::EMPTY);
    inner.host_state.insert(MsiState::ENABLED);
    inner.host_state.remove(MsiState::MASKED);
    Ok(())
}

/// Tears the capability down entirely: disarm every route, drop back to
/// EMPTY so a later re-enable performs a fresh bulk `arm_multi`.
fn disable_msis(inner: &mut MsiCapabilityInner, device: &dyn VfioDeviceFd) -> Result<(), MsiError> {
    if inner.host_state.contains(MsiState::EMPTY) {
        return Ok(());
    }
    inner.irq_set.disarm(device)?;
    for vector in inner.vectors.iter_mut() {
        vector.gsi = UNASSIGNED_GSI;
        vector.host_state = MsiState::MASKED | MsiState::EMPTY;
    }
    inner.host_state = MsiState::MASKED | MsiState::EMPTY;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::MSIX_VECTOR_CTRL_MASK_BIT;
    use std::cell::RefCell;
    use std::io;
    use std::os::unix::io::RawFd;
    use vpci_iface::{IrqSetRequest, RegionInfo};

    #[derive(Default)]
    struct FakeDevice {
        set_irqs_calls: RefCell<Vec<(u32, Vec<RawFd>)>>,
    }

    impl VfioDeviceFd for FakeDevice {
        fn region_info(&self, _index: u32) -> io::Result<RegionInfo> {
            unimplemented!()
        }
        fn irq_info(&self, _index: u32) -> io::Result<IrqInfo> {
            unimplemented!()
        }
        fn set_irqs(&self, request: &IrqSetRequest) -> io::Result<()> {
            self.set_irqs_calls
                .borrow_mut()
                .push((request.start, request.fds.to_vec()));
            Ok(())
        }
        fn pread(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            unimplemented!()
        }
        fn pwrite(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct FakeRouter {
        next_gsi: RefCell<i32>,
    }

    impl VmIrqRouter for FakeRouter {
        fn register_mmio(&self, _a: u64, _s: u64, _h: std::sync::Arc<dyn vpci_iface::MmioHandler>) -> io::Result<()> {
            unimplemented!()
        }
        fn unregister_mmio(&self, _a: u64) -> io::Result<()> {
            unimplemented!()
        }
        fn add_msi_route(&self, _c: MsiRouteConfig) -> io::Result<vpci_iface::Gsi> {
            let mut n = self.next_gsi.borrow_mut();
            let gsi = *n;
            *n += 1;
            Ok(gsi)
        }
        fn update_msi_route(&self, _gsi: vpci_iface::Gsi, _c: MsiRouteConfig) -> io::Result<()> {
            Ok(())
        }
        fn remove_msi_route(&self, _gsi: vpci_iface::Gsi) -> io::Result<()> {
            Ok(())
        }
        fn add_irqfd(&self, _gsi: vpci_iface::Gsi, _fd: RawFd, _resample: Option<RawFd>) -> io::Result<()> {
            Ok(())
        }
        fn remove_irqfd(&self, _gsi: vpci_iface::Gsi, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }
        fn get_one_reg(&self, _v: u32, _r: u64) -> io::Result<u128> {
            unimplemented!()
        }
        fn set_one_reg(&self, _v: u32, _r: u64, _val: u128) -> io::Result<()> {
            unimplemented!()
        }
        fn vcpu_init(&self, _v: u32, _f: &[u32]) -> io::Result<()> {
            unimplemented!()
        }
        fn vcpu_finalize(&self, _v: u32, _f: i32) -> io::Result<()> {
            unimplemented!()
        }
        fn check_extension(&self, _e: u32) -> i32 {
            0
        }
    }

    fn irq_info() -> IrqInfo {
        IrqInfo { count: 4, flags: 0 }
    }

    #[test]
    fn lazy_init_triggers_exactly_one_bulk_arm() {
        let device = FakeDevice::default();
        let router = FakeRouter::default();
        let cap = MsiCapability::new(0x50, 1, irq_info(), 4);

        cap.set_enabled(true, &device, &router).unwrap();
        cap.set_capability_masked(true, &device, &router).unwrap();
        assert!(device.set_irqs_calls.borrow().is_empty());

        let entry = MsixEntry {
            address_lo: 0xFEE0_0000,
            address_hi: 0,
            data: 0x41,
            ctrl: 0,
        };
        cap.update_vector(0, entry, &device, &router).unwrap();
        assert!(device.set_irqs_calls.borrow().is_empty());

        cap.set_capability_masked(false, &device, &router).unwrap();
        let calls = device.set_irqs_calls.borrow();
        assert_eq!(calls.len(), 1);
        let (start, fds) = &calls[0];
        assert_eq!(*start, 0);
        assert_eq!(fds.len(), 4);
        assert!(fds[0] >= 0);
        assert_eq!(&fds[1..], &[-1, -1, -1]);
        drop(calls);

        assert!(!cap.lock().host_state.contains(MsiState::EMPTY));
    }

    #[test]
    fn targeted_update_with_unchanged_mask_sends_no_set_irqs() {
        let device = FakeDevice::default();
        let router = FakeRouter::default();
        let cap = MsiCapability::new(0x50, 1, irq_info(), 4);
        cap.set_enabled(true, &device, &router).unwrap();
        let entry0 = MsixEntry {
            address_lo: 1,
            address_hi: 0,
            data: 1,
            ctrl: 0,
        };
        cap.update_vector(0, entry0, &device, &router).unwrap();
        cap.set_capability_masked(false, &device, &router).unwrap();
        device.set_irqs_calls.borrow_mut().clear();

        // vector 3 is still masked (never unmasked); rewriting its address
        // with ctrl.mask unchanged (=1) must not produce a SET_IRQS call.
        let entry3 = MsixEntry {
            address_lo: 0xAAAA,
            address_hi: 0,
            data: 7,
            ctrl: MSIX_VECTOR_CTRL_MASK_BIT,
        };
        cap.update_vector(3, entry3, &device, &router).unwrap();
        assert!(device.set_irqs_calls.borrow().is_empty());
    }

    #[test]
    fn disable_then_reenable_rearms_from_empty() {
        let device = FakeDevice::default();
        let router = FakeRouter::default();
        let cap = MsiCapability::new(0x50, 1, irq_info(), 2);
        cap.set_enabled(true, &device, &router).unwrap();
        let entry = MsixEntry {
            address_lo: 1,
            address_hi: 0,
            data: 1,
            ctrl: 0,
        };
        cap.update_vector(0, entry, &device, &router).unwrap();
        cap.set_capability_masked(false, &device, &router).unwrap();
        assert_eq!(device.set_irqs_calls.borrow().len(), 1);

        cap.set_enabled(false, &device, &router).unwrap();
        assert!(cap.lock().host_state.contains(MsiState::EMPTY));

        cap.set_enabled(true, &device, &router).unwrap();
        cap.set_capability_masked(false, &device, &router).unwrap();
        assert_eq!(device.set_irqs_calls.borrow().len(), 2);
    }
}
