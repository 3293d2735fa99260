//! Shared types and host-collaborator traits used by every `vpci-*` crate.
//!
//! This crate has no in-workspace dependencies, the way `aero-pci-routing`
//! is the dependency-free leaf of the teacher workspace's PCI concerns. It
//! exists so `vpci-irq`, `vpci-msi`, `vpci-config` and `vpci-vcpu-reset` can
//! share one vocabulary without any of them depending on `vpci-device`
//! (which composes all of them and would otherwise create a cycle).

pub mod interfaces;
pub mod state;

pub use interfaces::{GuestPhysAllocator, IrqAction, IrqDataKind, IrqSetRequest, MmioHandler, RegionInfo, IrqInfo, VfioDeviceFd, VmIrqRouter};
pub use state::{CapabilityKind, Gsi, IrqMode, MsiState, UNASSIGNED_GSI};
