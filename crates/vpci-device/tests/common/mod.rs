use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use vpci_device::interfaces::*;
use vpci_iface::Gsi;

pub const CONFIG_SPACE_SIZE: usize = 256;

/// A VFIO device fd backed by an in-memory 256-byte config-space array plus
/// a log of every `SET_IRQS` call, so tests can assert exactly how many
/// host ioctls a scenario produced.
pub struct FakeDevice {
    pub config: RefCell<[u8; CONFIG_SPACE_SIZE]>,
    pub set_irqs_log: RefCell<Vec<(u32, u32, Vec<RawFd>)>>,
}

impl FakeDevice {
    pub fn new(config: [u8; CONFIG_SPACE_SIZE]) -> Self {
        Self { config: RefCell::new(config), set_irqs_log: RefCell::new(Vec::new()) }
    }
}

impl VfioDeviceFd for FakeDevice {
    fn region_info(&self, _index: u32) -> io::Result<RegionInfo> {
        Ok(RegionInfo { offset: 0, size: 0x1000, flags: 0 })
    }
    fn irq_info(&self, _index: u32) -> io::Result<IrqInfo> {
        Ok(IrqInfo { count: 4, flags: 0 })
    }
    fn set_irqs(&self, request: &IrqSetRequest) -> io::Result<()> {
        self.set_irqs_log.borrow_mut().push((request.irq_index, request.start, request.fds.to_vec()));
        Ok(())
    }
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let config = self.config.borrow();
        let start = offset as usize;
        buf.copy_from_slice(&config[start..start + buf.len()]);
        Ok(buf.len())
    }
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut config = self.config.borrow_mut();
        let start = offset as usize;
        config[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// A host virtualization interface backed by plain counters: GSIs are
/// handed out sequentially, irqfd bindings are just logged.
#[derive(Default)]
pub struct FakeRouter {
    pub next_gsi: RefCell<Gsi>,
    pub irqfd_log: RefCell<Vec<(Gsi, RawFd, bool)>>,
    pub mmio_regions: RefCell<HashMap<u64, Arc<dyn MmioHandler>>>,
}

impl VmIrqRouter for FakeRouter {
    fn register_mmio(&self, guest_phys_addr: u64, _size: u64, handler: Arc<dyn MmioHandler>) -> io::Result<()> {
        self.mmio_regions.borrow_mut().insert(guest_phys_addr, handler);
        Ok(())
    }
    fn unregister_mmio(&self, guest_phys_addr: u64) -> io::Result<()> {
        self.mmio_regions.borrow_mut().remove(&guest_phys_addr);
        Ok(())
    }
    fn add_msi_route(&self, _config: MsiRouteConfig) -> io::Result<Gsi> {
        let mut next = self.next_gsi.borrow_mut();
        let gsi = *next;
        *next += 1;
        Ok(gsi)
    }
    fn update_msi_route(&self, _gsi: Gsi, _config: MsiRouteConfig) -> io::Result<()> {
        Ok(())
    }
    fn remove_msi_route(&self, _gsi: Gsi) -> io::Result<()> {
        Ok(())
    }
    fn add_irqfd(&self, gsi: Gsi, trigger_fd: RawFd, _resample_fd: Option<RawFd>) -> io::Result<()> {
        self.irqfd_log.borrow_mut().push((gsi, trigger_fd, true));
        Ok(())
    }
    fn remove_irqfd(&self, gsi: Gsi, trigger_fd: RawFd) -> io::Result<()> {
        self.irqfd_log.borrow_mut().push((gsi, trigger_fd, false));
        Ok(())
    }
    fn get_one_reg(&self, _vcpu_index: u32, _reg_id: u64) -> io::Result<u128> {
        Ok(0)
    }
    fn set_one_reg(&self, _vcpu_index: u32, _reg_id: u64, _value: u128) -> io::Result<()> {
        Ok(())
    }
    fn vcpu_init(&self, _vcpu_index: u32, _features: &[u32]) -> io::Result<()> {
        Ok(())
    }
    fn vcpu_finalize(&self, _vcpu_index: u32, _feature: i32) -> io::Result<()> {
        Ok(())
    }
    fn check_extension(&self, _extension: u32) -> i32 {
        1
    }
}

#[derive(Default)]
pub struct FakeAllocator {
    pub next_mmio: RefCell<u64>,
}

impl GuestPhysAllocator for FakeAllocator {
    fn allocate_mmio(&self, size: u64) -> io::Result<u64> {
        let mut next = self.next_mmio.borrow_mut();
        let base = *next;
        *next += size;
        Ok(base)
    }
    fn allocate_io_port(&self, _size: u16) -> io::Result<u16> {
        Ok(0xC000)
    }
}

const MSIX_CAP_ID: u8 = 0x11;
const MSIX_CAP_SIZE: usize = 12;

/// Builds a blank 256-byte Type-0 config space with a single MSI-X
/// capability at offset 0x40: table and PBA both in BAR 0, entry count 4.
pub fn config_with_msix_capability() -> [u8; CONFIG_SPACE_SIZE] {
    let mut raw = [0u8; CONFIG_SPACE_SIZE];
    raw[0x0E] = 0x00; // header type 0
    raw[0x34] = 0x40; // capabilities_ptr

    raw[0x40] = MSIX_CAP_ID;
    raw[0x41] = 0x00; // next = 0, end of chain
                      // message control at +2..+4 left zero (table size field unused by us)
    raw[0x40 + 4..0x40 + 8].copy_from_slice(&0u32.to_le_bytes()); // table offset/BIR = BAR0, offset 0
    raw[0x40 + 8..0x40 + MSIX_CAP_SIZE].copy_from_slice(&0x1000u32.to_le_bytes()); // PBA offset/BIR = BAR0, offset 0x1000
    raw
}
