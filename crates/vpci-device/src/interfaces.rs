//! Re-exports the host collaborator traits so downstream crates only need
//! one `use vpci_device::interfaces::*;` import, regardless of which inner
//! crate actually declares a given trait.

pub use vpci_iface::{
    GuestPhysAllocator, IrqAction, IrqDataKind, IrqInfo, IrqSetRequest, MmioHandler, MsiRouteConfig, RegionInfo,
    VfioDeviceFd, VmIrqRouter,
};
