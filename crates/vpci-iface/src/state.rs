use bitflags::bitflags;

bitflags! {
    /// Per-capability and per-vector enable/mask/empty tracking.
    ///
    /// Every capability and every vector carries *two* independent values of
    /// this type: `guest_state` (what the driver thinks it programmed) and
    /// `host_state` (what is actually realized on the physical device). They
    /// are updated at different times — guest state synchronously with the
    /// mediated write, host state only after the corresponding host ioctl
    /// succeeds — and must never be collapsed into a single field.
    #[derive(Default)]
    pub struct MsiState: u8 {
        const ENABLED = 1 << 0;
        const MASKED  = 1 << 1;
        const EMPTY   = 1 << 2;
    }
}

/// Host interrupt route identifier handed back by [`crate::VmIrqRouter::add_msi_route`].
///
/// `-1` means "unassigned", matching the host ioctl convention this mirrors.
pub type Gsi = i32;

pub const UNASSIGNED_GSI: Gsi = -1;

/// Capability types retained in the virtual capability chain. Everything
/// else is dropped while walking the real device's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Msi,
    MsiX,
    PciExpress,
}

/// The three mutually-exclusive interrupt delivery modes a device can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    Intx,
    Msi,
    MsiX,
}
