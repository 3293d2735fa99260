use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrqBridgeError {
    #[error("SET_IRQS failed for irq index {irq_index} (start {start}, count {count}): {source}")]
    HostIoctl {
        irq_index: u32,
        start: u32,
        count: usize,
        #[source]
        source: std::io::Error,
    },
}
