use thiserror::Error;

/// SETUP_FATAL conditions: these abort device bring-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported PCI header type {0:#x} (only Type 0 / normal is supported)")]
    UnsupportedHeaderType(u8),
    #[error("capability chain parse failed: capability at offset {0:#x} would overflow the 256-byte header")]
    CapabilityOverflow(u8),
    #[error("BAR {index} has non-power-of-two size {size:#x}")]
    BarSizeNotPowerOfTwo { index: usize, size: u64 },
    #[error("guest-physical window allocation failed for BAR {index}: {source}")]
    WindowAllocation { index: usize, #[source] source: std::io::Error },
    #[error("short pread/pwrite of config space at offset {offset}: wanted {wanted}, got {got}")]
    ShortIo { offset: u64, wanted: usize, got: usize },
}
