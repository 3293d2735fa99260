//! Top-level VFIO-PCI passthrough device: ties config-space virtualization,
//! BAR management, the MSI/MSI-X/INTx mode controller, and AArch64/AArch32
//! vCPU reset into one object with a setup/teardown lifecycle.

mod config;
mod context;
mod error;
pub mod interfaces;

pub use config::DeviceConfig;
pub use context::{DeviceContext, PassthroughParams};
pub use error::DeviceError;
