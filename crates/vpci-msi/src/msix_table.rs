use std::sync::Arc;

use log::warn;
use vpci_iface::{MmioHandler, VfioDeviceFd, VmIrqRouter};

use crate::capability::MsiCapability;
use crate::vector::{MsixEntry, MSIX_ENTRY_SIZE};

/// Trap-and-emulate handler for the virtual MSI-X table window.
///
/// Registered on the bus at `msix_table.guest_phys_addr`, size
/// `table.size`. Accesses must be 4 or 8 bytes and naturally aligned;
/// anything else is warned about and ignored rather than faulted to the
/// guest, per the ACCESS_BAD policy.
pub struct MsixTableHandler {
    capability: Arc<MsiCapability>,
    device: Arc<dyn VfioDeviceFd>,
    router: Arc<dyn VmIrqRouter>,
}

impl MsixTableHandler {
    pub fn new(capability: Arc<MsiCapability>, device: Arc<dyn VfioDeviceFd>, router: Arc<dyn VmIrqRouter>) -> Self {
        Self { capability, device, router }
    }

    fn table_len(&self) -> u64 {
        (self.capability.lock().vectors.len() * MSIX_ENTRY_SIZE) as u64
    }
}

fn access_is_valid(offset: u64, len: usize, table_len: u64) -> bool {
    if !matches!(len, 4 | 8) {
        return false;
    }
    if offset % len as u64 != 0 {
        return false;
    }
    offset + len as u64 <= table_len
}

impl MmioHandler for MsixTableHandler {
    fn read(&self, offset: u64, data: &mut [u8]) {
        if !access_is_valid(offset, data.len(), self.table_len()) {
            warn!("rejected MSI-X table read at offset {offset} len {}", data.len());
            return;
        }
        let inner = self.capability.lock();
        let vector_index = (offset / MSIX_ENTRY_SIZE as u64) as usize;
        let field_offset = (offset % MSIX_ENTRY_SIZE as u64) as usize;
        let bytes = inner.vectors[vector_index].config.to_bytes();
        data.copy_from_slice(&bytes[field_offset..field_offset + data.len()]);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let table_len = self.table_len();
        if !access_is_valid(offset, data.len(), table_len) {
            warn!("rejected MSI-X table write at offset {offset} len {}", data.len());
            return;
        }

        let vector_index = (offset / MSIX_ENTRY_SIZE as u64) as usize;
        let field_offset = (offset % MSIX_ENTRY_SIZE as u64) as usize;

        let new_config = {
            let inner = self.capability.lock();
            let mut bytes = inner.vectors[vector_index].config.to_bytes();
            bytes[field_offset..field_offset + data.len()].copy_from_slice(data);
            MsixEntry::from_bytes(&bytes)
        };

        if let Err(e) = self
            .capability
            .update_vector(vector_index, new_config, self.device.as_ref(), self.router.as_ref())
        {
            warn!("MSI-X vector {vector_index} update failed: {e}");
        }
    }
}

/// Trap-and-emulate handler for the Pending Bit Array. This is
/// deliberately a stub: writes are dropped, reads fall through to the
/// device. Masking here is realized by removing host routes, not by the
/// IOMMU layer's mask primitive, so no pending bit would ever legitimately
/// be set by local emulation.
pub struct MsixPbaHandler {
    device: Arc<dyn VfioDeviceFd>,
    pba_offset: u64,
}

impl MsixPbaHandler {
    pub fn new(device: Arc<dyn VfioDeviceFd>, pba_offset: u64) -> Self {
        Self { device, pba_offset }
    }
}

impl MmioHandler for MsixPbaHandler {
    fn read(&self, offset: u64, data: &mut [u8]) {
        if let Err(e) = self.device.pread(data, self.pba_offset + offset) {
            warn!("PBA pread at offset {offset} failed: {e}");
        }
    }

    fn write(&self, _offset: u64, _data: &[u8]) {
        // Intentionally dropped.
    }
}
