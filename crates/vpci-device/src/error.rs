use thiserror::Error;

/// Composes every sub-crate's error type at the one boundary that ties them
/// together, so callers outside this workspace see a single error type.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device exposes an MSI or MSI-X capability but no matching IRQ index was supplied: {0:?}")]
    MissingIrqIndex(vpci_iface::CapabilityKind),
    #[error("config-space virtualization failed: {0}")]
    Config(#[from] vpci_config::ConfigError),
    #[error("MSI/MSI-X state machine failed: {0}")]
    Msi(#[from] vpci_msi::MsiError),
    #[error("INTx mode switch failed: {0}")]
    Mode(#[from] vpci_msi::ModeError),
    #[error("IRQ eventfd bridge failed: {0}")]
    IrqBridge(#[from] vpci_irq::IrqBridgeError),
    #[error("vCPU reset failed: {0}")]
    VcpuReset(#[from] vpci_vcpu_reset::VcpuResetError),
    #[error("host ioctl failed: {0}")]
    Io(#[from] std::io::Error),
}
