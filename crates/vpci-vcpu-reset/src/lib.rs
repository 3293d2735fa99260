//! AArch64/AArch32 vCPU reset protocol: register reset state, feature
//! negotiation, SVE vector-length finalization, endianness queries, and
//! vCPU thread affinity.

mod affinity;
mod endianness;
mod error;
mod features;
mod reset;

pub use affinity::{apply_vcpu_affinity, CpuSet};
pub use endianness::{query_endianness, Endianness};
pub use error::VcpuResetError;
pub use features::{
    clamp_sve_vq_set, finalize_sve, init_vcpu, select_features, FeatureConfig, KVM_ARM_VCPU_EL1_32BIT,
    KVM_ARM_VCPU_FINALIZE_SVE, KVM_ARM_VCPU_PMU_V3, KVM_ARM_VCPU_PTRAUTH_ADDRESS, KVM_ARM_VCPU_PTRAUTH_GENERIC,
    KVM_ARM_VCPU_SVE, SVE_VQ_MAX, SVE_VQ_MIN,
};
pub use reset::{
    reset_vcpu_aarch32, reset_vcpu_aarch64, Aarch32CoreRegs, Aarch64CoreRegs, CPSR_AARCH32_RESET, PSTATE_AARCH64_RESET,
};
