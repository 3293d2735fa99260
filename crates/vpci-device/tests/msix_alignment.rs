mod common;

use std::cell::RefCell;
use std::sync::Arc;

use common::{config_with_msix_capability, FakeAllocator, FakeDevice, FakeRouter};
use vpci_device::{DeviceConfig, DeviceContext, PassthroughParams};

#[test]
fn unaligned_table_write_is_rejected_and_does_not_mutate_the_vector() {
    let device = Arc::new(FakeDevice::new(config_with_msix_capability()));
    let router = Arc::new(FakeRouter::default());
    let allocator = FakeAllocator { next_mmio: RefCell::new(0x2000_0000) };

    let mut bar_sizes = [0u64; vpci_config::NUM_BARS];
    bar_sizes[0] = 0x1000;
    bar_sizes[1] = 0x1000;

    let params = PassthroughParams {
        config_region_offset: 0,
        bar_sizes,
        bar_is_ioport: [false; vpci_config::NUM_BARS],
        bar_host_region_offsets: [0; vpci_config::NUM_BARS],
        msix_table_bar: Some(0),
        msix_pba_bar: Some(1),
        msix_pba_offset_in_bar: 0,
        msix_entry_count: 4,
        msi_vector_count: 0,
        msi_irq_index: None,
        msix_irq_index: Some(1),
        intx_irq_index: 0,
        intx_channels: None,
    };

    let ctx = DeviceContext::setup(device.clone(), router.clone(), &allocator, params, DeviceConfig::default()).unwrap();
    ctx.write_config(0x04, &2u16.to_le_bytes());

    let table_base = 0x2000_0000u64;
    let table_handler = router.mmio_regions.borrow().get(&table_base).cloned().expect("table BAR must be active");

    let mut before = [0u8; 4];
    table_handler.read(0, &mut before);

    // Rejected: only 4 or 8-byte accesses are valid.
    table_handler.write(0, &[0xAA, 0xBB]);

    let mut after = [0u8; 4];
    table_handler.read(0, &mut after);
    assert_eq!(before, after, "a rejected write must not mutate the vector");
}
