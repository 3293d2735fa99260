use std::sync::Arc;

use log::warn;
use vpci_iface::{GuestPhysAllocator, MmioHandler, VmIrqRouter};

use crate::error::ConfigError;

pub const NUM_BARS: usize = 6;
const COMMAND_IO_ENABLE: u16 = 1 << 0;
const COMMAND_MEMORY_ENABLE: u16 = 1 << 1;
const BAR_IO_SPACE_BIT: u32 = 1 << 0;
const BAR_ADDRESS_MASK_MEM: u32 = !0xF;
const BAR_ADDRESS_MASK_IO: u32 = !0x3;

/// Either a normal pass-through BAR, or the special MSI-X table/PBA BAR
/// whose guest-physical window is driven by the MSI-X emulator instead of a
/// direct device-fd mapping.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    PassThrough,
    MsixTable,
    MsixPba,
}

pub struct BarRegion {
    pub is_ioport: bool,
    pub size: u64,
    pub guest_phys_base: u64,
    pub port_base: u16,
    /// Offset of this region within the device fd (from `GET_REGION_INFO`).
    pub host_region_offset: u64,
    pub kind: BarKind,
    active: bool,
}

impl BarRegion {
    fn new(is_ioport: bool, size: u64, host_region_offset: u64, kind: BarKind) -> Self {
        Self {
            is_ioport,
            size,
            guest_phys_base: 0,
            port_base: 0,
            host_region_offset,
            kind,
            active: false,
        }
    }
}

/// Discovers BARs, reserves guest-physical (or port) windows for them, and
/// drives BAR activation/deactivation as the guest programs the command
/// register and BAR values.
pub struct BarManager {
    regions: Vec<Option<BarRegion>>,
}

impl BarManager {
    /// `sizes`/`is_ioport`/`host_region_offset` come from walking
    /// `GET_REGION_INFO` for each of the six BAR slots; a `None` entry
    /// means the BAR slot is unused (size 0).
    pub fn discover(
        sizes: [u64; NUM_BARS],
        is_ioport: [bool; NUM_BARS],
        host_region_offsets: [u64; NUM_BARS],
        msix_table_bar: Option<usize>,
        msix_pba_bar: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let mut regions = Vec::with_capacity(NUM_BARS);
        for i in 0..NUM_BARS {
            if sizes[i] == 0 {
                regions.push(None);
                continue;
            }
            if !sizes[i].is_power_of_two() {
                return Err(ConfigError::BarSizeNotPowerOfTwo { index: i, size: sizes[i] });
            }
            let kind = if Some(i) == msix_table_bar {
                BarKind::MsixTable
            } else if Some(i) == msix_pba_bar {
                BarKind::MsixPba
            } else {
                BarKind::PassThrough
            };
            regions.push(Some(BarRegion::new(is_ioport[i], sizes[i], host_region_offsets[i], kind)));
        }
        Ok(Self { regions })
    }

    pub fn region(&self, index: usize) -> Option<&BarRegion> {
        self.regions[index].as_ref()
    }

    pub fn reserve_windows(&mut self, allocator: &dyn GuestPhysAllocator) -> Result<(), ConfigError> {
        for (index, slot) in self.regions.iter_mut().enumerate() {
            let Some(region) = slot else { continue };
            // The MSI-X table/PBA BARs' windows are assigned by the MSI-X
            // emulator, not reserved here.
            if region.kind != BarKind::PassThrough {
                continue;
            }
            if region.is_ioport {
                let port = allocator
                    .allocate_io_port(region.size as u16)
                    .map_err(|source| ConfigError::WindowAllocation { index, source })?;
                region.port_base = port;
            } else {
                let page_size = 0x1000u64;
                let rounded = region.size.next_multiple_of(page_size);
                let base = allocator
                    .allocate_mmio(rounded)
                    .map_err(|source| ConfigError::WindowAllocation { index, source })?;
                region.guest_phys_base = base;
            }
        }
        Ok(())
    }

    /// Assigns the MSI-X table/PBA windows, computed by the MSI-X emulator
    /// from its own layout rules (`vpci_msi` owns their sizing).
    pub fn set_msix_window(&mut self, index: usize, guest_phys_base: u64) {
        if let Some(region) = self.regions[index].as_mut() {
            region.guest_phys_base = guest_phys_base;
        }
    }

    /// Invoked when the guest programs `command` and/or a BAR register.
    /// Idempotent: reprogramming the same base while already active does
    /// nothing.
    pub fn activate(
        &mut self,
        index: usize,
        command: u16,
        bar_value: u32,
        router: &dyn VmIrqRouter,
        table_handler: Option<Arc<dyn MmioHandler>>,
        pba_handler: Option<Arc<dyn MmioHandler>>,
    ) {
        let Some(region) = self.regions[index].as_mut() else { return };

        let decode_enabled = if region.is_ioport {
            command & COMMAND_IO_ENABLE != 0
        } else {
            command & COMMAND_MEMORY_ENABLE != 0
        };
        let base_programmed = if region.is_ioport {
            (bar_value & BAR_ADDRESS_MASK_IO) != 0
        } else {
            (bar_value & BAR_ADDRESS_MASK_MEM) != 0
        };

        if !(decode_enabled && base_programmed) {
            deactivate_region(region, router);
            return;
        }

        if region.active {
            return;
        }

        let handler = match region.kind {
            BarKind::MsixTable => table_handler,
            BarKind::MsixPba => pba_handler,
            BarKind::PassThrough => None,
        };

        let result = if let Some(handler) = handler {
            router.register_mmio(region.guest_phys_base, region.size, handler)
        } else if region.is_ioport {
            // Port-space pass-through mapping is owned by the PIO bus
            // outside this crate's scope; we only track activation state
            // here.
            Ok(())
        } else {
            // A real pass-through memory mapping is installed by the
            // embedding hypervisor's memory subsystem using
            // `host_region_offset`; this crate only tracks the decision.
            Ok(())
        };

        match result {
            Ok(()) => region.active = true,
            Err(e) => warn!("BAR {index} activation failed: {e}"),
        }
    }

    pub fn deactivate(&mut self, index: usize, router: &dyn VmIrqRouter) {
        if let Some(region) = self.regions[index].as_mut() {
            deactivate_region(region, router);
        }
    }
}

fn deactivate_region(region: &mut BarRegion, router: &dyn VmIrqRouter) {
    if !region.active {
        return;
    }
    if matches!(region.kind, BarKind::MsixTable | BarKind::MsixPba) {
        if let Err(e) = router.unregister_mmio(region.guest_phys_base) {
            warn!("BAR deactivation: unregister_mmio failed: {e}");
        }
    }
    region.active = false;
}
