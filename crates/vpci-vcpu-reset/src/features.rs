use std::io;

use vpci_iface::VmIrqRouter;

use crate::error::VcpuResetError;

pub const KVM_ARM_VCPU_EL1_32BIT: u32 = 1;
pub const KVM_ARM_VCPU_PMU_V3: u32 = 2;
pub const KVM_ARM_VCPU_SVE: u32 = 4;
pub const KVM_ARM_VCPU_PTRAUTH_ADDRESS: u32 = 5;
pub const KVM_ARM_VCPU_PTRAUTH_GENERIC: u32 = 6;

pub const KVM_ARM_VCPU_FINALIZE_SVE: i32 = 0;

pub const SVE_VQ_MIN: u32 = 1;
pub const SVE_VQ_MAX: u32 = 16;

/// The feature set negotiated for one vCPU before `KVM_ARM_VCPU_INIT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureConfig {
    pub aarch32_guest: bool,
    pub pmuv3: bool,
    pub pointer_auth: bool,
    pub sve: bool,
}

/// Turns a [`FeatureConfig`] into the `KVM_ARM_VCPU_*` feature bits to pass
/// to `vcpu_init`. Pointer authentication is all-or-nothing: address and
/// generic keys are requested together or not at all, since a guest that
/// sees one without the other will fault on key-rotation instructions the
/// host never told it to expect.
pub fn select_features(config: &FeatureConfig) -> Vec<u32> {
    let mut features = Vec::new();
    if config.aarch32_guest {
        features.push(KVM_ARM_VCPU_EL1_32BIT);
    }
    if config.pmuv3 {
        features.push(KVM_ARM_VCPU_PMU_V3);
    }
    if config.pointer_auth {
        features.push(KVM_ARM_VCPU_PTRAUTH_ADDRESS);
        features.push(KVM_ARM_VCPU_PTRAUTH_GENERIC);
    }
    if config.sve {
        features.push(KVM_ARM_VCPU_SVE);
    }
    features
}

pub fn init_vcpu(router: &dyn VmIrqRouter, vcpu_index: u32, config: &FeatureConfig) -> io::Result<()> {
    router.vcpu_init(vcpu_index, &select_features(config))
}

/// Clamps a host-reported SVE vector-length bitmap (each entry is a
/// supported VQ, vector length in 128-bit units) down to `max_vq`. `max_vq`
/// must be a power of two so it represents a single selectable ceiling
/// rather than an arbitrary cutoff the guest could observe as a gap.
pub fn clamp_sve_vq_set(vqs: &mut Vec<u32>, max_vq: u32) -> Result<(), VcpuResetError> {
    if !max_vq.is_power_of_two() || !(SVE_VQ_MIN..=SVE_VQ_MAX).contains(&max_vq) {
        return Err(VcpuResetError::InvalidSveVq(max_vq));
    }
    vqs.retain(|&vq| vq <= max_vq);
    Ok(())
}

/// Clamps the bitmap then issues `KVM_ARM_VCPU_FINALIZE(SVE)`. Must run
/// after `vcpu_init` requested the SVE feature and before the first run.
pub fn finalize_sve(
    router: &dyn VmIrqRouter,
    vcpu_index: u32,
    vqs: &mut Vec<u32>,
    max_vq: Option<u32>,
) -> Result<(), VcpuResetError> {
    if let Some(vq) = max_vq {
        clamp_sve_vq_set(vqs, vq)?;
    }
    router.vcpu_finalize(vcpu_index, KVM_ARM_VCPU_FINALIZE_SVE).map_err(VcpuResetError::HostIoctl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_auth_requests_both_keys_together() {
        let config = FeatureConfig { pointer_auth: true, ..Default::default() };
        let features = select_features(&config);
        assert!(features.contains(&KVM_ARM_VCPU_PTRAUTH_ADDRESS));
        assert!(features.contains(&KVM_ARM_VCPU_PTRAUTH_GENERIC));
    }

    #[test]
    fn clamp_drops_vqs_above_the_ceiling() {
        let mut vqs = vec![1, 2, 3, 4, 5];
        clamp_sve_vq_set(&mut vqs, 4).unwrap();
        assert_eq!(vqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn clamp_rejects_a_non_power_of_two_ceiling() {
        let mut vqs = vec![1, 2, 3];
        assert!(matches!(clamp_sve_vq_set(&mut vqs, 3), Err(VcpuResetError::InvalidSveVq(3))));
    }
}
