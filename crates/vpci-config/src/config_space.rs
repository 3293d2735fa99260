use std::sync::{Arc, Mutex};

use log::warn;
use vpci_iface::{IrqMode, VfioDeviceFd, VmIrqRouter};
use vpci_msi::{MsiCapability, MsixEntry, ModeController};

use crate::capability_chain::{parse_and_rewrite_chain, ParsedCapability};
use crate::error::ConfigError;
use crate::header::{PciVirtualHeader, CONFIG_SPACE_SIZE};

const MSI_CTRL_ENABLE: u16 = 1 << 0;
const MSI_CTRL_64BIT: u16 = 1 << 7;
const MSI_MSG_ADDR_OFFSET: u64 = 4;
const MSIX_CTRL_ENABLE: u16 = 1 << 15;
const MSIX_CTRL_MASK_ALL: u16 = 1 << 14;

/// One attached MSI or MSI-X capability, recorded so the write callback can
/// recognize accesses to its control register.
struct AttachedCapability {
    virtual_offset: u8,
    size: u8,
    is_msix: bool,
    capability: Arc<MsiCapability>,
}

/// Reads the real config header, filters the capability chain, synthesizes
/// the guest-visible header, and proxies config-space reads/writes.
pub struct ConfigSpaceVirtualizer {
    header: Mutex<PciVirtualHeader>,
    capabilities: Vec<ParsedCapability>,
    config_region_offset: u64,
    attached: Mutex<Vec<AttachedCapability>>,
    mode_controller: Arc<ModeController>,
}

impl ConfigSpaceVirtualizer {
    /// Parse phase. Returns the virtualizer plus the set of retained
    /// capabilities so the caller can build the MSI/MSI-X state machines
    /// and BAR manager before calling [`Self::attach_capability`] and
    /// [`Self::fixup_and_write_back`].
    pub fn parse(
        device: &dyn VfioDeviceFd,
        config_region_offset: u64,
        mode_controller: Arc<ModeController>,
    ) -> Result<(Self, Vec<ParsedCapability>), ConfigError> {
        let mut raw = [0u8; CONFIG_SPACE_SIZE];
        let got = device
            .pread(&mut raw, config_region_offset)
            .map_err(|_| ConfigError::ShortIo { offset: config_region_offset, wanted: CONFIG_SPACE_SIZE, got: 0 })?;
        if got != CONFIG_SPACE_SIZE {
            return Err(ConfigError::ShortIo { offset: config_region_offset, wanted: CONFIG_SPACE_SIZE, got });
        }

        let mut header = PciVirtualHeader::from_real(&raw)?;
        let mut scratch = [0u8; CONFIG_SPACE_SIZE - 0x40];
        let (capabilities, head) = parse_and_rewrite_chain(&raw, header.capabilities_ptr(), &mut scratch)?;
        header.splice_capability_region(&scratch);
        header.set_capabilities_ptr(head);

        Ok((
            Self {
                header: Mutex::new(header),
                capabilities: capabilities.clone(),
                config_region_offset,
                attached: Mutex::new(Vec::new()),
                mode_controller,
            },
            capabilities,
        ))
    }

    pub fn capabilities(&self) -> &[ParsedCapability] {
        &self.capabilities
    }

    /// Wires an already-constructed MSI or MSI-X state machine to the
    /// capability's location in the virtual header, so the write callback
    /// can recognize control-register writes and drive it.
    pub fn attach_capability(&self, virtual_offset: u8, size: u8, is_msix: bool, capability: Arc<MsiCapability>) {
        self.attached.lock().unwrap().push(AttachedCapability { virtual_offset, size, is_msix, capability });
    }

    /// Fixup phase: synthesizes BAR values, zeroes cardbus/ROM, writes the
    /// completed virtual header back to the device fd.
    pub fn fixup_and_write_back(
        &self,
        device: &dyn VfioDeviceFd,
        bar_values: &[Option<u32>; crate::bar::NUM_BARS],
    ) -> Result<(), ConfigError> {
        let mut header = self.header.lock().unwrap();
        for (index, value) in bar_values.iter().enumerate() {
            header.set_bar(index, value.unwrap_or(0));
        }
        header.zero_cardbus_and_rom();
        let bytes = *header.as_bytes();
        drop(header);
        device
            .pwrite(&bytes, self.config_region_offset)
            .map_err(|_| ConfigError::ShortIo { offset: self.config_region_offset, wanted: CONFIG_SPACE_SIZE, got: 0 })?;
        Ok(())
    }

    /// Read callback. Performs a pread into a discard buffer against the
    /// real device fd (some registers have read side effects); the virtual
    /// header is the authoritative source of the returned value.
    pub fn read(&self, device: &dyn VfioDeviceFd, offset: u64, data: &mut [u8]) {
        let mut discard = vec![0u8; data.len()];
        if let Err(e) = device.pread(&mut discard, self.config_region_offset + offset) {
            warn!("config-space read side-effect pread at offset {offset} failed: {e}");
        }
        let header = self.header.lock().unwrap();
        let bytes = header.as_bytes();
        data.copy_from_slice(&bytes[offset as usize..offset as usize + data.len()]);
    }

    /// Write callback. Guards the expansion-ROM register, forwards the raw
    /// write to the device, then invokes any attached MSI/MSI-X control
    /// handling (order matters: host-capability reconciliation must see
    /// the hardware state the write just produced), and finally refreshes
    /// the virtual header with a pread.
    pub fn write(&self, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter, offset: u64, data: &[u8]) {
        if offset as usize == PciVirtualHeader::expansion_rom_offset() {
            return;
        }

        if let Err(e) = device.pwrite(data, self.config_region_offset + offset) {
            warn!("config-space write pwrite at offset {offset} failed: {e}");
        }

        self.dispatch_capability_write(device, router, offset, data);

        let mut refresh = vec![0u8; data.len()];
        match device.pread(&mut refresh, self.config_region_offset + offset) {
            Ok(_) => {
                let mut header = self.header.lock().unwrap();
                let start = offset as usize;
                header.as_bytes_mut()[start..start + data.len()].copy_from_slice(&refresh);
            }
            Err(e) => warn!("config-space write refresh pread at offset {offset} failed: {e}"),
        }
    }

    /// Reassembles a plain MSI capability's message-address/message-data
    /// fields into a vector config, merging the virtual header's last-known
    /// bytes with the bytes this write is contributing. MSI has no per-vector
    /// mask register, so `ctrl` is left clear (see DESIGN.md's MSI-masking
    /// scope note).
    fn read_msi_message(&self, start: u64, size: u8, write_offset: u64, write_data: &[u8]) -> MsixEntry {
        let mut cap = [0u8; 14];
        let avail = (size as usize).min(cap.len());
        {
            let header = self.header.lock().unwrap();
            let bytes = header.as_bytes();
            let cap_start = start as usize;
            cap[..avail].copy_from_slice(&bytes[cap_start..cap_start + avail]);
        }

        let rel = (write_offset - start) as usize;
        if rel < cap.len() {
            let end = (rel + write_data.len()).min(cap.len());
            cap[rel..end].copy_from_slice(&write_data[..end - rel]);
        }

        let ctrl = u16::from_le_bytes([cap[2], cap[3]]);
        let address_lo = u32::from_le_bytes(cap[4..8].try_into().unwrap());
        let (address_hi, data) = if ctrl & MSI_CTRL_64BIT != 0 {
            (u32::from_le_bytes(cap[8..12].try_into().unwrap()), u16::from_le_bytes([cap[12], cap[13]]) as u32)
        } else {
            (0, u16::from_le_bytes([cap[8], cap[9]]) as u32)
        };
        MsixEntry { address_lo, address_hi, data, ctrl: 0 }
    }

    fn dispatch_capability_write(&self, device: &dyn VfioDeviceFd, router: &dyn VmIrqRouter, offset: u64, data: &[u8]) {
        let attached = self.attached.lock().unwrap();
        for entry in attached.iter() {
            let start = entry.virtual_offset as u64;
            let end = start + entry.size as u64;
            if offset < start || offset >= end {
                continue;
            }

            if !entry.is_msix && offset >= start + MSI_MSG_ADDR_OFFSET {
                let config = self.read_msi_message(start, entry.size, offset, data);
                if let Err(e) = entry.capability.update_vector(0, config, device, router) {
                    warn!("MSI message-address/data vector update failed: {e}");
                }
                continue;
            }

            let ctrl_offset = start + 2;
            if offset != ctrl_offset || data.len() < 2 {
                continue;
            }
            let ctrl = u16::from_le_bytes([data[0], data[1]]);
            let was_enabled = entry.capability.lock().guest_state.contains(vpci_iface::MsiState::ENABLED);
            let enable = if entry.is_msix { ctrl & MSIX_CTRL_ENABLE != 0 } else { ctrl & MSI_CTRL_ENABLE != 0 };

            if enable && !was_enabled {
                self.mode_controller
                    .switch_to_msi_like(if entry.is_msix { IrqMode::MsiX } else { IrqMode::Msi }, device, router);
            }
            if let Err(e) = entry.capability.set_enabled(enable, device, router) {
                warn!("capability enable transition failed: {e}");
            }
            if entry.is_msix {
                let mask_all = ctrl & MSIX_CTRL_MASK_ALL != 0;
                if let Err(e) = entry.capability.set_capability_masked(mask_all, device, router) {
                    warn!("capability mask-all transition failed: {e}");
                }
            } else {
                // Plain MSI has no mask-all register (that's an MSI-X-only
                // control bit), so the capability is never masked at this
                // level; only the enable bit gates arming.
                if let Err(e) = entry.capability.set_capability_masked(false, device, router) {
                    warn!("capability mask transition failed: {e}");
                }
            }
            if !enable && was_enabled {
                self.mode_controller.fallback_to_intx(device, router);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::os::unix::io::RawFd;
    use vpci_iface::{IrqInfo, IrqSetRequest, MsiRouteConfig, RegionInfo};

    #[derive(Default)]
    struct FakeDevice {
        storage: RefCell<[u8; CONFIG_SPACE_SIZE]>,
        set_irqs_calls: RefCell<Vec<(u32, Vec<RawFd>)>>,
    }
    impl VfioDeviceFd for FakeDevice {
        fn region_info(&self, _i: u32) -> io::Result<RegionInfo> {
            unimplemented!()
        }
        fn irq_info(&self, _i: u32) -> io::Result<IrqInfo> {
            unimplemented!()
        }
        fn set_irqs(&self, request: &IrqSetRequest) -> io::Result<()> {
            self.set_irqs_calls.borrow_mut().push((request.start, request.fds.to_vec()));
            Ok(())
        }
        fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let storage = self.storage.borrow();
            let start = offset as usize;
            buf.copy_from_slice(&storage[start..start + buf.len()]);
            Ok(buf.len())
        }
        fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
            let mut storage = self.storage.borrow_mut();
            let start = offset as usize;
            storage[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn blank_device() -> FakeDevice {
        let mut raw = [0u8; CONFIG_SPACE_SIZE];
        raw[0x0E] = 0; // Type 0
        FakeDevice { storage: RefCell::new(raw), set_irqs_calls: RefCell::new(Vec::new()) }
    }

    #[derive(Default)]
    struct FakeRouter {
        next_gsi: RefCell<i32>,
    }
    impl VmIrqRouter for FakeRouter {
        fn register_mmio(&self, _a: u64, _s: u64, _h: Arc<dyn vpci_iface::MmioHandler>) -> io::Result<()> {
            unimplemented!()
        }
        fn unregister_mmio(&self, _a: u64) -> io::Result<()> {
            unimplemented!()
        }
        fn add_msi_route(&self, _c: MsiRouteConfig) -> io::Result<vpci_iface::Gsi> {
            let mut n = self.next_gsi.borrow_mut();
            let gsi = *n;
            *n += 1;
            Ok(gsi)
        }
        fn update_msi_route(&self, _gsi: vpci_iface::Gsi, _c: MsiRouteConfig) -> io::Result<()> {
            Ok(())
        }
        fn remove_msi_route(&self, _gsi: vpci_iface::Gsi) -> io::Result<()> {
            Ok(())
        }
        fn add_irqfd(&self, _gsi: vpci_iface::Gsi, _fd: RawFd, _resample: Option<RawFd>) -> io::Result<()> {
            Ok(())
        }
        fn remove_irqfd(&self, _gsi: vpci_iface::Gsi, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }
        fn get_one_reg(&self, _v: u32, _r: u64) -> io::Result<u128> {
            unimplemented!()
        }
        fn set_one_reg(&self, _v: u32, _r: u64, _val: u128) -> io::Result<()> {
            unimplemented!()
        }
        fn vcpu_init(&self, _v: u32, _f: &[u32]) -> io::Result<()> {
            unimplemented!()
        }
        fn vcpu_finalize(&self, _v: u32, _f: i32) -> io::Result<()> {
            unimplemented!()
        }
        fn check_extension(&self, _e: u32) -> i32 {
            0
        }
    }

    #[test]
    fn parse_rejects_bad_header_type() {
        let device = blank_device();
        device.storage.borrow_mut()[0x0E] = 0x02;
        let controller = Arc::new(ModeController::new(0, None));
        let err = ConfigSpaceVirtualizer::parse(&device, 0, controller).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedHeaderType(0x02)));
    }

    #[test]
    fn round_trip_read_after_fixup() {
        let device = blank_device();
        let controller = Arc::new(ModeController::new(0, None));
        let (virtualizer, _caps) = ConfigSpaceVirtualizer::parse(&device, 0, controller).unwrap();
        let mut bars: [Option<u32>; crate::bar::NUM_BARS] = Default::default();
        bars[0] = Some(0x1000_0000);
        virtualizer.fixup_and_write_back(&device, &bars).unwrap();

        let mut buf = [0u8; 4];
        virtualizer.read(&device, 0x10, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 0x1000_0000);
    }

    #[test]
    fn msi_message_write_then_enable_arms_the_host() {
        let mut raw = [0u8; CONFIG_SPACE_SIZE];
        raw[0x0E] = 0x00;
        raw[0x34] = 0x40; // caps_ptr
        raw[0x40] = 0x05; // MSI capability id
        raw[0x41] = 0x00; // next = 0
        let device = FakeDevice { storage: RefCell::new(raw), set_irqs_calls: RefCell::new(Vec::new()) };
        let router = FakeRouter::default();

        let controller = Arc::new(ModeController::new(0, None));
        let (virtualizer, caps) = ConfigSpaceVirtualizer::parse(&device, 0, controller).unwrap();
        assert_eq!(caps.len(), 1);
        let cap = Arc::new(MsiCapability::new(caps[0].virtual_offset as u16, 1, IrqInfo { count: 1, flags: 0 }, 1));
        virtualizer.attach_capability(caps[0].virtual_offset, caps[0].size, false, cap.clone());

        let start = caps[0].virtual_offset as u64;
        // Message address, then enable: the capability must see a configured
        // vector by the time the enable bit lands.
        virtualizer.write(&device, &router, start + 4, &0xFEE0_0000u32.to_le_bytes());
        virtualizer.write(&device, &router, start + 8, &0x41u16.to_le_bytes());
        assert!(device.set_irqs_calls.borrow().is_empty());

        virtualizer.write(&device, &router, start + 2, &MSI_CTRL_ENABLE.to_le_bytes());

        let calls = device.set_irqs_calls.borrow();
        assert_eq!(calls.len(), 1, "expected exactly one bulk SET_IRQS once MSI is enabled, got {calls:?}");
        assert!(calls[0].1[0] >= 0);
    }
}
