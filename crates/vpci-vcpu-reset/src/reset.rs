use std::io;

use vpci_iface::VmIrqRouter;

/// PSTATE value for an AArch64 vCPU at reset: D/A/I/F all masked, mode EL1h.
pub const PSTATE_AARCH64_RESET: u64 = 0x3c5;

/// CPSR value for an AArch32 vCPU at reset: I/F masked, mode SVC.
pub const CPSR_AARCH32_RESET: u64 = 0xd3;

/// The one-time register writes an AArch64 reset issues, named by the
/// register IDs the embedding hypervisor's KVM binding resolves them to.
pub struct Aarch64CoreRegs {
    pub pstate: u64,
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub pc: u64,
}

/// Resets one AArch64 vCPU. `x1`-`x3` are always cleared; `x0` (DTB address)
/// and `pc` (kernel entry) are only written for the boot CPU — secondaries
/// are left parked with neither register touched, to be woken by the guest's
/// own SMP bring-up (PSCI CPU_ON) rather than by us.
pub fn reset_vcpu_aarch64(
    router: &dyn VmIrqRouter,
    vcpu_index: u32,
    regs: &Aarch64CoreRegs,
    is_boot_cpu: bool,
    dtb_guest_addr: u64,
    kernel_entry: u64,
) -> io::Result<()> {
    router.set_one_reg(vcpu_index, regs.pstate, PSTATE_AARCH64_RESET as u128)?;
    router.set_one_reg(vcpu_index, regs.x1, 0)?;
    router.set_one_reg(vcpu_index, regs.x2, 0)?;
    router.set_one_reg(vcpu_index, regs.x3, 0)?;
    if is_boot_cpu {
        router.set_one_reg(vcpu_index, regs.x0, dtb_guest_addr as u128)?;
        router.set_one_reg(vcpu_index, regs.pc, kernel_entry as u128)?;
    }
    Ok(())
}

/// The one-time register writes an AArch32 reset issues.
pub struct Aarch32CoreRegs {
    pub cpsr: u64,
    pub r0: u64,
    pub r1: u64,
    pub r2: u64,
    pub pc: u64,
}

/// Resets one AArch32 vCPU. Same boot-cpu-only rule as
/// [`reset_vcpu_aarch64`]: `r0`/`r1`/`r2`/`pc` are only written for the boot
/// CPU. `r1` carries the Linux "machine type" register, which has no valid
/// encoding left on a DT-booted kernel — we set it to `u32::MAX` (-1) as the
/// kernel boot protocol requires.
pub fn reset_vcpu_aarch32(
    router: &dyn VmIrqRouter,
    vcpu_index: u32,
    regs: &Aarch32CoreRegs,
    is_boot_cpu: bool,
    dtb_guest_addr: u64,
    kernel_entry: u64,
) -> io::Result<()> {
    router.set_one_reg(vcpu_index, regs.cpsr, CPSR_AARCH32_RESET as u128)?;
    if is_boot_cpu {
        router.set_one_reg(vcpu_index, regs.r0, 0)?;
        router.set_one_reg(vcpu_index, regs.r1, u32::MAX as u128)?;
        router.set_one_reg(vcpu_index, regs.r2, dtb_guest_addr as u128)?;
        router.set_one_reg(vcpu_index, regs.pc, kernel_entry as u128)?;
    }
    Ok(())
}
