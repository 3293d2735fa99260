use std::os::unix::io::RawFd;

use vpci_iface::{IrqAction, IrqDataKind, IrqSetRequest, VfioDeviceFd};

use crate::error::IrqBridgeError;

/// Owns the eventfd slot array for one IRQ index (MSI or MSI-X) on a VFIO
/// device, and the three ioctl wrappers that reprogram it.
///
/// The slot array is allocated once, sized for `nr_entries`, and kept for
/// the lifetime of the capability: `arm_single` overwrites one slot in
/// place so the hot path — a guest rewriting one MSI-X vector — never
/// reallocates.
pub struct IrqSetBuffer {
    irq_index: u32,
    fds: Vec<RawFd>,
}

impl IrqSetBuffer {
    pub fn new(irq_index: u32, nr_entries: usize) -> Self {
        Self {
            irq_index,
            fds: vec![-1; nr_entries],
        }
    }

    pub fn nr_entries(&self) -> usize {
        self.fds.len()
    }

    pub fn fd(&self, vector_index: usize) -> RawFd {
        self.fds[vector_index]
    }

    /// Bulk "set all eventfds" request. Failure here is fatal to the
    /// capability — the caller propagates it as SETUP_FATAL on init or
    /// IRQ_TRANSIENT on a later re-arm.
    pub fn arm_multi(&mut self, device: &dyn VfioDeviceFd, fds: &[RawFd]) -> Result<(), IrqBridgeError> {
        assert_eq!(fds.len(), self.fds.len(), "arm_multi fd count must match nr_entries");
        self.fds.copy_from_slice(fds);
        let request = IrqSetRequest {
            irq_index: self.irq_index,
            action: IrqAction::Trigger,
            data_kind: IrqDataKind::EventFd,
            start: 0,
            fds: &self.fds,
        };
        device.set_irqs(&request).map_err(|source| IrqBridgeError::HostIoctl {
            irq_index: self.irq_index,
            start: 0,
            count: self.fds.len(),
            source,
        })
    }

    /// Reprograms exactly one slot without perturbing the others.
    pub fn arm_single(
        &mut self,
        device: &dyn VfioDeviceFd,
        vector_index: usize,
        fd_or_neg1: RawFd,
    ) -> Result<(), IrqBridgeError> {
        self.fds[vector_index] = fd_or_neg1;
        let request = IrqSetRequest {
            irq_index: self.irq_index,
            action: IrqAction::Trigger,
            data_kind: IrqDataKind::EventFd,
            start: vector_index as u32,
            fds: &self.fds[vector_index..=vector_index],
        };
        device.set_irqs(&request).map_err(|source| IrqBridgeError::HostIoctl {
            irq_index: self.irq_index,
            start: vector_index as u32,
            count: 1,
            source,
        })
    }

    /// `count=0` request; tears down the host side entirely.
    pub fn disarm(&mut self, device: &dyn VfioDeviceFd) -> Result<(), IrqBridgeError> {
        self.fds.iter_mut().for_each(|fd| *fd = -1);
        let request = IrqSetRequest {
            irq_index: self.irq_index,
            action: IrqAction::Trigger,
            data_kind: IrqDataKind::None,
            start: 0,
            fds: &[],
        };
        device.set_irqs(&request).map_err(|source| IrqBridgeError::HostIoctl {
            irq_index: self.irq_index,
            start: 0,
            count: 0,
            source,
        })
    }
}
