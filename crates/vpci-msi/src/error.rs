use thiserror::Error;

/// Errors that can escape the MSI/MSI-X state machine. Per the propagation
/// policy, only setup-time callers see these — runtime reconciliation
/// failures (IRQ_TRANSIENT) are logged and absorbed inside the state
/// machine so a misbehaving guest can never turn them into a crash.
#[derive(Debug, Error)]
pub enum MsiError {
    #[error("vector index {0} out of range")]
    VectorOutOfRange(usize),
    #[error(transparent)]
    IrqBridge(#[from] vpci_irq::IrqBridgeError),
    #[error("host route update failed: {0}")]
    RouteUpdate(#[source] std::io::Error),
}
