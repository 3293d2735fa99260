//! Trait boundaries for the two host collaborators named as external
//! dependencies: the host virtualization interface (vCPU/IRQ-routing/MMIO
//! side) and the host IOMMU/device framework (the VFIO device fd side).
//!
//! Nothing in this workspace implements these traits; the embedding
//! hypervisor supplies real implementations backed by `kvm-ioctls` and
//! `vfio-ioctls`. Tests in `vpci-device` implement them with in-memory fakes.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::Gsi;

/// One MSI/MSI-X route's addressing, as understood by the host virtualization
/// interface (the guest-programmed 16-byte MSI-X table entry, minus the
/// control word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiRouteConfig {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

/// A registered MMIO region handler, invoked by the host virtualization
/// interface's dispatch bus when a guest access lands in the registered
/// range. Offsets are relative to the start of the registered region.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

/// The host virtualization interface: vCPU register access, MSI-X route
/// management, irqfd bindings, and the MMIO dispatch bus.
pub trait VmIrqRouter: Send + Sync {
    fn register_mmio(&self, guest_phys_addr: u64, size: u64, handler: Arc<dyn MmioHandler>) -> io::Result<()>;
    fn unregister_mmio(&self, guest_phys_addr: u64) -> io::Result<()>;

    fn add_msi_route(&self, config: MsiRouteConfig) -> io::Result<Gsi>;
    fn update_msi_route(&self, gsi: Gsi, config: MsiRouteConfig) -> io::Result<()>;
    fn remove_msi_route(&self, gsi: Gsi) -> io::Result<()>;

    fn add_irqfd(&self, gsi: Gsi, trigger_fd: RawFd, resample_fd: Option<RawFd>) -> io::Result<()>;
    fn remove_irqfd(&self, gsi: Gsi, trigger_fd: RawFd) -> io::Result<()>;

    fn get_one_reg(&self, vcpu_index: u32, reg_id: u64) -> io::Result<u128>;
    fn set_one_reg(&self, vcpu_index: u32, reg_id: u64, value: u128) -> io::Result<()>;
    fn vcpu_init(&self, vcpu_index: u32, features: &[u32]) -> io::Result<()>;
    fn vcpu_finalize(&self, vcpu_index: u32, feature: i32) -> io::Result<()>;
    fn check_extension(&self, extension: u32) -> i32;
}

/// `GET_REGION_INFO` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
}

/// `GET_IRQ_INFO` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqInfo {
    pub count: u32,
    pub flags: u32,
}

/// `SET_IRQS` action selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqAction {
    Trigger,
    Unmask,
    Mask,
}

/// `SET_IRQS` data-kind selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqDataKind {
    None,
    EventFd,
    Bool,
}

/// One `SET_IRQS` request: `start` + `fds` model the host's
/// `{index, start, count, data[]}` variable-length struct without exposing
/// its raw byte layout to callers — `vpci_irq` owns packing that.
pub struct IrqSetRequest<'a> {
    pub irq_index: u32,
    pub action: IrqAction,
    pub data_kind: IrqDataKind,
    pub start: u32,
    pub fds: &'a [RawFd],
}

/// The host IOMMU/device framework: the VFIO device fd itself.
pub trait VfioDeviceFd: Send + Sync {
    fn region_info(&self, index: u32) -> io::Result<RegionInfo>;
    fn irq_info(&self, index: u32) -> io::Result<IrqInfo>;
    fn set_irqs(&self, request: &IrqSetRequest) -> io::Result<()>;
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// Stand-in for the guest-memory allocator named as an out-of-scope
/// collaborator: reserves guest-physical windows for BARs and the MSI-X
/// table/PBA.
pub trait GuestPhysAllocator: Send + Sync {
    fn allocate_mmio(&self, size: u64) -> io::Result<u64>;
    fn allocate_io_port(&self, size: u16) -> io::Result<u16>;
}
