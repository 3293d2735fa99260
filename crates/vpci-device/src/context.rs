use std::sync::{Arc, Mutex};

use vmm_sys_util::eventfd::EventFd;
use vpci_config::{BarManager, ConfigSpaceVirtualizer, NUM_BARS};
use vpci_iface::{CapabilityKind, GuestPhysAllocator, Gsi, MmioHandler, VfioDeviceFd, VmIrqRouter};
use vpci_msi::{MsiCapability, MsixPbaHandler, MsixTableHandler, ModeController, MSIX_ENTRY_SIZE};
use vpci_vcpu_reset::{Aarch32CoreRegs, Aarch64CoreRegs, FeatureConfig};

use crate::config::DeviceConfig;
use crate::error::DeviceError;

const COMMAND_OFFSET: u64 = 0x04;
const COMMAND_SIZE: u64 = 2;
const BAR0_OFFSET: u64 = 0x10;
const GUEST_PHYS_PAGE_SIZE: u64 = 0x1000;

/// Everything needed to set up one passthrough device: region layout from
/// `GET_REGION_INFO`, which BAR (if any) backs the MSI-X table/PBA, and the
/// fixed IRQ indices each mode uses.
pub struct PassthroughParams {
    pub config_region_offset: u64,
    pub bar_sizes: [u64; NUM_BARS],
    pub bar_is_ioport: [bool; NUM_BARS],
    pub bar_host_region_offsets: [u64; NUM_BARS],
    pub msix_table_bar: Option<usize>,
    pub msix_pba_bar: Option<usize>,
    pub msix_pba_offset_in_bar: u64,
    pub msix_entry_count: usize,
    pub msi_vector_count: usize,
    pub msi_irq_index: Option<u32>,
    pub msix_irq_index: Option<u32>,
    pub intx_irq_index: u32,
    pub intx_channels: Option<(EventFd, EventFd, Gsi)>,
}

/// Ties the config-space virtualizer, BAR manager, MSI/MSI-X state
/// machines, INTx mode controller, and vCPU reset protocol together into
/// one passthrough device.
pub struct DeviceContext {
    device: Arc<dyn VfioDeviceFd>,
    router: Arc<dyn VmIrqRouter>,
    config: ConfigSpaceVirtualizer,
    bars: Mutex<BarManager>,
    mode_controller: Arc<ModeController>,
    msi: Option<Arc<MsiCapability>>,
    msix: Option<Arc<MsiCapability>>,
    msix_table_handler: Option<Arc<MsixTableHandler>>,
    msix_pba_handler: Option<Arc<MsixPbaHandler>>,
    device_config: DeviceConfig,
}

impl DeviceContext {
    /// Parses config space, builds the MSI/MSI-X capabilities the chain
    /// retained, discovers and reserves BAR windows, and writes the
    /// completed header back to the device. Capability and BAR order
    /// mirrors `teardown`'s reverse order: nothing here is armed on the
    /// host yet except what `fixup_and_write_back` touches.
    pub fn setup(
        device: Arc<dyn VfioDeviceFd>,
        router: Arc<dyn VmIrqRouter>,
        allocator: &dyn GuestPhysAllocator,
        params: PassthroughParams,
        device_config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let mode_controller = Arc::new(ModeController::new(params.intx_irq_index, params.intx_channels));

        let (config, capabilities) =
            ConfigSpaceVirtualizer::parse(device.as_ref(), params.config_region_offset, Arc::clone(&mode_controller))?;

        let mut msi = None;
        let mut msix = None;
        for cap in &capabilities {
            match cap.kind {
                CapabilityKind::Msi => {
                    let irq_index = params.msi_irq_index.ok_or(DeviceError::MissingIrqIndex(CapabilityKind::Msi))?;
                    let irq_info = device.irq_info(irq_index)?;
                    let capability =
                        Arc::new(MsiCapability::new(cap.virtual_offset as u16, irq_index, irq_info, params.msi_vector_count));
                    config.attach_capability(cap.virtual_offset, cap.size, false, Arc::clone(&capability));
                    msi = Some(capability);
                }
                CapabilityKind::MsiX => {
                    let irq_index = params.msix_irq_index.ok_or(DeviceError::MissingIrqIndex(CapabilityKind::MsiX))?;
                    let irq_info = device.irq_info(irq_index)?;
                    let capability = Arc::new(MsiCapability::new(
                        cap.virtual_offset as u16,
                        irq_index,
                        irq_info,
                        params.msix_entry_count,
                    ));
                    config.attach_capability(cap.virtual_offset, cap.size, true, Arc::clone(&capability));
                    msix = Some(capability);
                }
                CapabilityKind::PciExpress => {}
            }
        }

        vpci_irq::reserve_fd_budget((params.msi_vector_count + params.msix_entry_count) as u64);

        let mut bars = BarManager::discover(
            params.bar_sizes,
            params.bar_is_ioport,
            params.bar_host_region_offsets,
            params.msix_table_bar,
            params.msix_pba_bar,
        )?;
        bars.reserve_windows(allocator)?;

        if let Some(index) = params.msix_table_bar {
            let window = allocate_window(allocator, params.bar_sizes[index], index)?;
            bars.set_msix_window(index, window);
        }
        if let Some(index) = params.msix_pba_bar {
            let window = allocate_window(allocator, params.bar_sizes[index], index)?;
            bars.set_msix_window(index, window);
        }

        let msix_table_handler = msix
            .as_ref()
            .map(|capability| Arc::new(MsixTableHandler::new(Arc::clone(capability), Arc::clone(&device), Arc::clone(&router))));
        let msix_pba_handler = params.msix_pba_bar.map(|index| {
            Arc::new(MsixPbaHandler::new(
                Arc::clone(&device),
                params.bar_host_region_offsets[index] + params.msix_pba_offset_in_bar,
            ))
        });
        let _ = MSIX_ENTRY_SIZE; // table sizing is driven by msix_entry_count, kept for documentation.

        let mut bar_values: [Option<u32>; NUM_BARS] = Default::default();
        for (index, slot) in bar_values.iter_mut().enumerate() {
            if let Some(region) = bars.region(index) {
                *slot = Some(if region.is_ioport { region.port_base as u32 } else { region.guest_phys_base as u32 });
            }
        }
        config.fixup_and_write_back(device.as_ref(), &bar_values)?;

        // INTx is the power-on default mode; MSI/MSI-X only take over once
        // the guest driver negotiates them via the capability's enable bit.
        mode_controller.arm_intx(device.as_ref(), router.as_ref())?;

        Ok(Self {
            device,
            router,
            config,
            bars: Mutex::new(bars),
            mode_controller,
            msi,
            msix,
            msix_table_handler,
            msix_pba_handler,
            device_config,
        })
    }

    /// Tears everything down in the reverse order setup built it: disable
    /// MSI-X then MSI (closing their eventfds and clearing host routes),
    /// disarm INTx, then deactivate every BAR (unregistering the MSI-X
    /// table/PBA MMIO windows).
    pub fn teardown(&self) -> Result<(), DeviceError> {
        if let Some(msix) = &self.msix {
            msix.set_enabled(false, self.device.as_ref(), self.router.as_ref())?;
        }
        if let Some(msi) = &self.msi {
            msi.set_enabled(false, self.device.as_ref(), self.router.as_ref())?;
        }
        self.mode_controller.disarm_intx(self.device.as_ref(), self.router.as_ref())?;

        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        for index in 0..NUM_BARS {
            bars.deactivate(index, self.router.as_ref());
        }
        Ok(())
    }

    pub fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.config.read(self.device.as_ref(), offset, data);
    }

    /// Config-space write callback. After forwarding to the state machines,
    /// re-evaluates BAR activation if the write touched `COMMAND` or a BAR
    /// register — `BarManager::activate` is idempotent, so this is safe to
    /// call liberally.
    pub fn write_config(&self, offset: u64, data: &[u8]) {
        self.config.write(self.device.as_ref(), self.router.as_ref(), offset, data);
        if touches_command_or_bar(offset, data.len()) {
            self.reconcile_bars();
        }
    }

    fn reconcile_bars(&self) {
        let mut command_bytes = [0u8; 2];
        self.read_config(COMMAND_OFFSET, &mut command_bytes);
        let command = u16::from_le_bytes(command_bytes);

        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        for index in 0..NUM_BARS {
            if bars.region(index).is_none() {
                continue;
            }
            let mut bar_bytes = [0u8; 4];
            self.read_config(BAR0_OFFSET + index as u64 * 4, &mut bar_bytes);
            let bar_value = u32::from_le_bytes(bar_bytes);
            let table_handler = self.msix_table_handler.clone().map(|h| h as Arc<dyn MmioHandler>);
            let pba_handler = self.msix_pba_handler.clone().map(|h| h as Arc<dyn MmioHandler>);
            bars.activate(index, command, bar_value, self.router.as_ref(), table_handler, pba_handler);
        }
    }

    pub fn init_vcpu_features(&self, vcpu_index: u32) -> Result<(), DeviceError> {
        let config = FeatureConfig {
            aarch32_guest: self.device_config.aarch32_guest,
            pmuv3: self.device_config.pmuv3,
            pointer_auth: false,
            sve: self.device_config.sve_max_vq.is_some(),
        };
        vpci_vcpu_reset::init_vcpu(self.router.as_ref(), vcpu_index, &config)?;
        Ok(())
    }

    pub fn finalize_sve(&self, vcpu_index: u32, vqs: &mut Vec<u32>) -> Result<(), DeviceError> {
        vpci_vcpu_reset::finalize_sve(self.router.as_ref(), vcpu_index, vqs, self.device_config.sve_max_vq)?;
        Ok(())
    }

    pub fn reset_vcpu_aarch64(
        &self,
        vcpu_index: u32,
        regs: &Aarch64CoreRegs,
        is_boot_cpu: bool,
        dtb_guest_addr: u64,
        kernel_entry: u64,
    ) -> Result<(), DeviceError> {
        vpci_vcpu_reset::reset_vcpu_aarch64(self.router.as_ref(), vcpu_index, regs, is_boot_cpu, dtb_guest_addr, kernel_entry)?;
        Ok(())
    }

    pub fn reset_vcpu_aarch32(
        &self,
        vcpu_index: u32,
        regs: &Aarch32CoreRegs,
        is_boot_cpu: bool,
        dtb_guest_addr: u64,
        kernel_entry: u64,
    ) -> Result<(), DeviceError> {
        vpci_vcpu_reset::reset_vcpu_aarch32(self.router.as_ref(), vcpu_index, regs, is_boot_cpu, dtb_guest_addr, kernel_entry)?;
        Ok(())
    }

    pub fn apply_vcpu_affinity(&self, vcpu_index: usize) -> Result<(), DeviceError> {
        if let Some(set) = self.device_config.vcpu_affinity.get(vcpu_index) {
            vpci_vcpu_reset::apply_vcpu_affinity(set)?;
        }
        Ok(())
    }
}

fn allocate_window(allocator: &dyn GuestPhysAllocator, size: u64, index: usize) -> Result<u64, DeviceError> {
    let rounded = size.next_multiple_of(GUEST_PHYS_PAGE_SIZE);
    allocator
        .allocate_mmio(rounded)
        .map_err(|source| DeviceError::Config(vpci_config::ConfigError::WindowAllocation { index, source }))
}

fn touches_command_or_bar(offset: u64, len: usize) -> bool {
    let end = offset + len as u64;
    let command_touched = offset < COMMAND_OFFSET + COMMAND_SIZE && end > COMMAND_OFFSET;
    let bar_end = BAR0_OFFSET + NUM_BARS as u64 * 4;
    let bar_touched = offset < bar_end && end > BAR0_OFFSET;
    command_touched || bar_touched
}
