use std::io;

use vpci_iface::VmIrqRouter;

const CPSR_E_BIT: u128 = 1 << 9;
const SCTLR_EE_BIT: u128 = 1 << 25;
const SCTLR_E0E_BIT: u128 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Reads back the guest's configured data endianness. AArch32 keeps it in
/// CPSR.E; AArch64 keeps it in SCTLR_EL1, using the EL0-specific bit when
/// the CPU is currently running at EL0 and the generic EE bit otherwise.
pub fn query_endianness(
    router: &dyn VmIrqRouter,
    vcpu_index: u32,
    is_aarch32: bool,
    cpsr_or_sctlr_reg: u64,
    currently_at_el0: bool,
) -> io::Result<Endianness> {
    let value = router.get_one_reg(vcpu_index, cpsr_or_sctlr_reg)?;
    let bit = if is_aarch32 {
        CPSR_E_BIT
    } else if currently_at_el0 {
        SCTLR_E0E_BIT
    } else {
        SCTLR_EE_BIT
    };
    Ok(if value & bit != 0 { Endianness::Big } else { Endianness::Little })
}
