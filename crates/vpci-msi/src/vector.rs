use vmm_sys_util::eventfd::EventFd;
use vpci_iface::{Gsi, MsiState, UNASSIGNED_GSI};

/// One 16-byte MSI-X table entry: address_lo, address_hi, data, ctrl.
/// Bit 0 of `ctrl` is the per-vector mask bit; the rest of `ctrl` is reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsixEntry {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
    pub ctrl: u32,
}

pub const MSIX_VECTOR_CTRL_MASK_BIT: u32 = 1 << 0;
pub const MSIX_ENTRY_SIZE: usize = 16;

impl MsixEntry {
    pub fn from_bytes(bytes: &[u8; MSIX_ENTRY_SIZE]) -> Self {
        Self {
            address_lo: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            address_hi: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            data: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            ctrl: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; MSIX_ENTRY_SIZE] {
        let mut out = [0u8; MSIX_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.address_lo.to_le_bytes());
        out[4..8].copy_from_slice(&self.address_hi.to_le_bytes());
        out[8..12].copy_from_slice(&self.data.to_le_bytes());
        out[12..16].copy_from_slice(&self.ctrl.to_le_bytes());
        out
    }

    pub fn masked(&self) -> bool {
        self.ctrl & MSIX_VECTOR_CTRL_MASK_BIT != 0
    }
}

/// One MSI or MSI-X vector. `guest_state`/`host_state` additionally carry
/// per-vector `MASKED`; `EMPTY` here means "never written by the guest".
#[derive(Debug, Clone)]
pub struct MsiVector {
    pub config: MsixEntry,
    pub gsi: Gsi,
    /// Lazily allocated the first time the vector is unmasked; kept for the
    /// rest of the capability's lifetime once created.
    pub eventfd: Option<EventFd>,
    pub guest_state: MsiState,
    pub host_state: MsiState,
}

impl MsiVector {
    pub fn new() -> Self {
        Self {
            config: MsixEntry::default(),
            gsi: UNASSIGNED_GSI,
            eventfd: None,
            guest_state: MsiState::MASKED | MsiState::EMPTY,
            host_state: MsiState::MASKED | MsiState::EMPTY,
        }
    }

    pub fn raw_eventfd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.eventfd.as_ref().map(|e| e.as_raw_fd()).unwrap_or(-1)
    }

    pub fn ensure_eventfd(&mut self) -> std::io::Result<i32> {
        use std::os::unix::io::AsRawFd;
        if self.eventfd.is_none() {
            self.eventfd = Some(EventFd::new(libc::EFD_NONBLOCK)?);
        }
        Ok(self.eventfd.as_ref().unwrap().as_raw_fd())
    }
}

impl Default for MsiVector {
    fn default() -> Self {
        Self::new()
    }
}
