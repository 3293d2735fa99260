use vpci_vcpu_reset::CpuSet;

/// Per-device configuration the embedding hypervisor supplies once at
/// construction, covering the bits of vCPU reset and feature negotiation
/// that vary per guest rather than being fixed by the passthrough protocol.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Boot the guest's vCPU 0 in AArch32 mode instead of AArch64.
    pub aarch32_guest: bool,
    /// Request the PMUv3 feature on every vCPU.
    pub pmuv3: bool,
    /// Ceiling on the SVE vector-length bitmap, in 128-bit quanta. `None`
    /// means SVE is not requested at all.
    pub sve_max_vq: Option<u32>,
    /// Host CPU affinity applied to each vCPU thread, indexed by vCPU index.
    /// Empty means no affinity is applied.
    pub vcpu_affinity: Vec<CpuSet>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { aarch32_guest: false, pmuv3: false, sve_max_vq: None, vcpu_affinity: Vec::new() }
    }
}
