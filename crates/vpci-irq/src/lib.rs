//! IRQ-eventfd bridge: owns the host `SET_IRQS` payload and the eventfd
//! slot array behind one IRQ index (INTx, MSI, or MSI-X) on a VFIO device.
//!
//! This is deliberately the thinnest layer in the workspace — it knows
//! nothing about MSI/MSI-X state machines or PCI config space, only how to
//! pack and reissue the host ioctl.

mod bridge;
mod error;
mod fd_budget;

pub use bridge::IrqSetBuffer;
pub use error::IrqBridgeError;
pub use fd_budget::reserve_fd_budget;
