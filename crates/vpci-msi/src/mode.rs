use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use log::warn;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use vpci_iface::{Gsi, IrqAction, IrqDataKind, IrqSetRequest, IrqMode, VfioDeviceFd, VmIrqRouter};

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("host SET_IRQS failed during INTx {action}: {source}")]
    HostIoctl { action: &'static str, #[source] source: std::io::Error },
    #[error("irqfd binding failed: {0}")]
    Irqfd(#[source] std::io::Error),
}

/// INTx's pair of event channels: `trigger_fd` carries host→guest
/// assertions, `unmask_fd` carries guest→host EOI/reassert.
struct IntxState {
    trigger_fd: EventFd,
    unmask_fd: EventFd,
    gsi: Gsi,
    armed: bool,
}

/// Mutually-exclusive mode switching between INTx, MSI, and MSI-X, and the
/// route plumbing into the host virtualization interface for INTx. MSI and
/// MSI-X's own route plumbing lives in [`crate::capability::MsiCapability`];
/// this type only owns *which* of the three is currently active and the
/// INTx arm/disarm sequence itself.
pub struct ModeController {
    current_mode: Mutex<IrqMode>,
    intx_irq_index: u32,
    intx: Option<Mutex<IntxState>>,
}

impl ModeController {
    pub fn new(intx_irq_index: u32, intx_channels: Option<(EventFd, EventFd, Gsi)>) -> Self {
        Self {
            current_mode: Mutex::new(IrqMode::Intx),
            intx_irq_index,
            intx: intx_channels.map(|(trigger_fd, unmask_fd, gsi)| {
                Mutex::new(IntxState { trigger_fd, unmask_fd, gsi, armed: false })
            }),
        }
    }

    pub fn current_mode(&self) -> IrqMode {
        *self.current_mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn arm_intx(&self, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter) -> Result<(), ModeError> {
        let Some(intx_mutex) = &self.intx else { return Ok(()) };
        let mut intx = intx_mutex.lock().unwrap_or_else(|p| p.into_inner());
        if intx.armed {
            return Ok(());
        }
        let trigger_fd = intx.trigger_fd.as_raw_fd();
        let unmask_fd = intx.unmask_fd.as_raw_fd();
        router
            .add_irqfd(intx.gsi, trigger_fd, Some(unmask_fd))
            .map_err(ModeError::Irqfd)?;

        let trigger_req = IrqSetRequest {
            irq_index: self.intx_irq_index,
            action: IrqAction::Trigger,
            data_kind: IrqDataKind::EventFd,
            start: 0,
            fds: &[trigger_fd],
        };
        device
            .set_irqs(&trigger_req)
            .map_err(|source| ModeError::HostIoctl { action: "TRIGGER arm", source })?;

        let unmask_req = IrqSetRequest {
            irq_index: self.intx_irq_index,
            action: IrqAction::Unmask,
            data_kind: IrqDataKind::EventFd,
            start: 0,
            fds: &[unmask_fd],
        };
        device
            .set_irqs(&unmask_req)
            .map_err(|source| ModeError::HostIoctl { action: "UNMASK arm", source })?;

        intx.armed = true;
        *self.current_mode.lock().unwrap_or_else(|p| p.into_inner()) = IrqMode::Intx;
        Ok(())
    }

    /// Disarming is the mirror of arming. Idempotent: disarming an already
    /// disarmed INTx is a no-op, guaranteeing "no double-close".
    pub fn disarm_intx(&self, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter) -> Result<(), ModeError> {
        let Some(intx_mutex) = &self.intx else { return Ok(()) };
        let mut intx = intx_mutex.lock().unwrap_or_else(|p| p.into_inner());
        if !intx.armed {
            return Ok(());
        }
        let unmask_req = IrqSetRequest {
            irq_index: self.intx_irq_index,
            action: IrqAction::Unmask,
            data_kind: IrqDataKind::None,
            start: 0,
            fds: &[],
        };
        device
            .set_irqs(&unmask_req)
            .map_err(|source| ModeError::HostIoctl { action: "UNMASK disarm", source })?;

        let trigger_req = IrqSetRequest {
            irq_index: self.intx_irq_index,
            action: IrqAction::Trigger,
            data_kind: IrqDataKind::None,
            start: 0,
            fds: &[],
        };
        device
            .set_irqs(&trigger_req)
            .map_err(|source| ModeError::HostIoctl { action: "TRIGGER disarm", source })?;

        let trigger_fd = intx.trigger_fd.as_raw_fd();
        router.remove_irqfd(intx.gsi, trigger_fd).map_err(ModeError::Irqfd)?;
        intx.armed = false;
        Ok(())
    }

    /// Guest enables MSI or MSI-X: tear INTx down unconditionally (rule 1),
    /// exactly once, before the caller arms the new mode via
    /// `MsiCapability::set_enabled`.
    pub fn switch_to_msi_like(&self, new_mode: IrqMode, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter) {
        if let Err(e) = self.disarm_intx(device, router) {
            warn!("failed to tear down INTx before enabling {new_mode:?}: {e}");
        }
        *self.current_mode.lock().unwrap_or_else(|p| p.into_inner()) = new_mode;
    }

    /// Guest disables MSI/MSI-X: fall back to INTx with the same GSI it had
    /// before MSI/MSI-X was enabled. Failure is logged, not propagated.
    pub fn fallback_to_intx(&self, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter) {
        if let Err(e) = self.arm_intx(device, router) {
            warn!("failed to re-arm INTx after MSI/MSI-X disable: {e}");
        }
    }
}
