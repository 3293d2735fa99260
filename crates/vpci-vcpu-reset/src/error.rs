use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcpuResetError {
    #[error("sve-max-vq {0} must be a power of two no greater than 16")]
    InvalidSveVq(u32),
    #[error("vCPU reset ioctl failed: {0}")]
    HostIoctl(#[source] std::io::Error),
}
