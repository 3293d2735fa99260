use std::collections::HashSet;

use log::warn;
use vpci_iface::CapabilityKind;

use crate::error::ConfigError;
use crate::header::CONFIG_SPACE_SIZE;

const CAP_ID_MSI: u8 = 0x05;
const CAP_ID_PCI_EXPRESS: u8 = 0x10;
const CAP_ID_MSIX: u8 = 0x11;

const CAP_NEXT_PTR_MASK: u8 = !0x03;

const MSI_MSG_CTRL_OFFSET: usize = 2;
const MSI_CTRL_64BIT: u16 = 1 << 7;
const MSI_CTRL_PER_VECTOR_MASK: u16 = 1 << 8;
const MSI_CAP_SIZE_32BIT: u8 = 10;
const MSI_CAP_SIZE_64BIT: u8 = 14;
const MSI_CAP_SIZE_PER_VECTOR_EXTRA: u8 = 10;

const MSIX_CAP_SIZE: u8 = 12;
/// Root-endpoint legacy v1 PCI-Express capability; link/slot/root fields
/// are deliberately omitted (out of scope).
const PCI_EXPRESS_CAP_SIZE: u8 = 12;

/// One capability retained in the virtual chain.
#[derive(Debug, Clone, Copy)]
pub struct ParsedCapability {
    pub kind: CapabilityKind,
    /// Offset of this capability in the REAL device's config space.
    pub real_offset: u8,
    /// Offset assigned to this capability in the virtual 256-byte buffer.
    pub virtual_offset: u8,
    pub size: u8,
}

fn msi_cap_size(real: &[u8; CONFIG_SPACE_SIZE], offset: u8) -> u8 {
    let ctrl = u16::from_le_bytes([
        real[offset as usize + MSI_MSG_CTRL_OFFSET],
        real[offset as usize + MSI_MSG_CTRL_OFFSET + 1],
    ]);
    let mut size = if ctrl & MSI_CTRL_64BIT != 0 { MSI_CAP_SIZE_64BIT } else { MSI_CAP_SIZE_32BIT };
    if ctrl & MSI_CTRL_PER_VECTOR_MASK != 0 {
        size += MSI_CAP_SIZE_PER_VECTOR_EXTRA;
    }
    size
}

fn cap_size(kind: CapabilityKind, real: &[u8; CONFIG_SPACE_SIZE], offset: u8) -> u8 {
    match kind {
        CapabilityKind::Msi => msi_cap_size(real, offset),
        CapabilityKind::MsiX => MSIX_CAP_SIZE,
        CapabilityKind::PciExpress => PCI_EXPRESS_CAP_SIZE,
    }
}

/// Walks the real device's capability chain starting at `caps_ptr`, copies
/// retained capabilities (MSI, MSI-X, PCI-Express) into `scratch` (which
/// represents bytes `[0x40, 0x100)` of the virtual header, i.e. index 0 of
/// `scratch` is virtual offset `0x40`), rewrites each retained capability's
/// `next` field to point at the next retained one, and drops everything
/// else. Returns the parsed capabilities in chain order and the head
/// pointer to install in the virtual header (0 if the chain is empty).
///
/// Guaranteed to terminate even against a malformed or cyclic real chain:
/// each offset is visited at most once.
pub fn parse_and_rewrite_chain(
    real: &[u8; CONFIG_SPACE_SIZE],
    caps_ptr: u8,
    scratch: &mut [u8; CONFIG_SPACE_SIZE - 0x40],
) -> Result<(Vec<ParsedCapability>, u8), ConfigError> {
    let mut caps = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = caps_ptr & CAP_NEXT_PTR_MASK;
    let mut next_free: u8 = 0x40;
    let mut prev_virtual_offset: Option<u8> = None;

    while cursor != 0 {
        if !visited.insert(cursor) {
            warn!("capability chain loop detected at offset {cursor:#x}; truncating");
            break;
        }
        if cursor as usize + 2 > CONFIG_SPACE_SIZE {
            warn!("capability at offset {cursor:#x} is outside config space; truncating chain");
            break;
        }

        let cap_id = real[cursor as usize];
        let next = real[cursor as usize + 1] & CAP_NEXT_PTR_MASK;

        let kind = match cap_id {
            CAP_ID_MSI => Some(CapabilityKind::Msi),
            CAP_ID_MSIX => Some(CapabilityKind::MsiX),
            CAP_ID_PCI_EXPRESS => Some(CapabilityKind::PciExpress),
            other => {
                warn!("dropping unrecognized PCI capability id {other:#x} at offset {cursor:#x}");
                None
            }
        };

        if let Some(kind) = kind {
            let size = cap_size(kind, real, cursor);
            if next_free as usize + size as usize > CONFIG_SPACE_SIZE {
                return Err(ConfigError::CapabilityOverflow(cursor));
            }
            let dest = next_free;
            let src_start = cursor as usize;
            let src_end = src_start + size as usize;
            let dst_start = (dest - 0x40) as usize;
            scratch[dst_start..dst_start + size as usize].copy_from_slice(&real[src_start..src_end]);

            if let Some(prev) = prev_virtual_offset {
                scratch[(prev - 0x40) as usize + 1] = dest;
            }
            scratch[dst_start + 1] = 0; // terminate until a successor is linked in

            caps.push(ParsedCapability {
                kind,
                real_offset: cursor,
                virtual_offset: dest,
                size,
            });
            prev_virtual_offset = Some(dest);
            next_free += size;
        }

        cursor = next;
    }

    let head = caps.first().map(|c| c.virtual_offset).unwrap_or(0);
    Ok((caps, head))
}
