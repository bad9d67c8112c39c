//! Pass 1: flattened-tree parsing.
//!
//! The blob is a version-17 flat device tree, all words big-endian: a fixed
//! header, a memory-reservation block of (address, size) pairs ending at a
//! (0, 0) sentinel, a structure block of 4-byte tokens, and a strings block
//! holding the property names. This pass walks the token stream and builds
//! the node/property graph with every property left `Raw`.

use crate::error::{ErrorCode, KResult};
use crate::mm::pmm::Pmm;
use crate::mm::PhysAddr;
use crate::util::align::align_up;

use super::{DeviceTree, NodeId, ReservedRegion};

/// The value of the header magic field, after the big-endian flip.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 0x01;
const FDT_END_NODE: u32 = 0x02;
const FDT_PROP: u32 = 0x03;
const FDT_NOP: u32 = 0x04;
const FDT_END: u32 = 0x09;

/// The flat-tree header: ten big-endian `u32` fields.
pub struct Header {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl Header {
    /// Read the header fields from the start of the blob.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least 40 readable bytes (the page holding it
    /// must be mapped).
    pub unsafe fn read(addr: PhysAddr) -> Header {
        let base = addr as *const u32;
        let word = |i: usize| u32::from_be(base.add(i).read_unaligned());
        Header {
            magic: word(0),
            total_size: word(1),
            off_dt_struct: word(2),
            off_dt_strings: word(3),
            off_mem_rsvmap: word(4),
            version: word(5),
            last_comp_version: word(6),
            boot_cpuid_phys: word(7),
            size_dt_strings: word(8),
            size_dt_struct: word(9),
        }
    }
}

/// Big-endian u32 at `off`, `None` past the end.
pub(crate) fn be_u32(bytes: &[u8], off: usize) -> Option<u32> {
    let chunk = bytes.get(off..off.checked_add(4)?)?;
    Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Big-endian u64 at `off`, `None` past the end.
pub(crate) fn be_u64(bytes: &[u8], off: usize) -> Option<u64> {
    let high = be_u32(bytes, off)? as u64;
    let low = be_u32(bytes, off + 4)? as u64;
    Some(high << 32 | low)
}

/// Read the memory-reservation block: big-endian (address, size) pairs up
/// to, excluding, the (0, 0) sentinel.
pub(crate) fn parse_reserved(
    dt: &mut DeviceTree,
    pmm: &mut Pmm,
    blob: &[u8],
    off_mem_rsvmap: usize,
) -> KResult<()> {
    let mut off = off_mem_rsvmap;
    loop {
        let address = be_u64(blob, off).ok_or(ErrorCode::DtbUnclosedRootNode)?;
        let size = be_u64(blob, off + 8).ok_or(ErrorCode::DtbUnclosedRootNode)?;
        off += 16;
        if address == 0 && size == 0 {
            return Ok(());
        }
        dt.reserved.push(
            pmm,
            ReservedRegion { address: address as PhysAddr, size: size as usize },
        )?;
    }
}

/// Capture the NUL-terminated byte string at `off` into the arena.
///
/// FDT names and string values are printable ASCII per the flat-tree spec;
/// the blob is trusted firmware input, so the UTF-8 check is skipped.
fn capture_cstr(
    dt_arena: &mut crate::mm::bump::BumpArena,
    pmm: &mut Pmm,
    bytes: &[u8],
    off: usize,
) -> KResult<(&'static str, usize)> {
    let tail = bytes.get(off..).ok_or(ErrorCode::DtbUnclosedRootNode)?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ErrorCode::DtbUnclosedRootNode)?;
    let copied = dt_arena.copy_bytes(pmm, &tail[..len])?;
    let s = unsafe { core::str::from_utf8_unchecked(copied) };
    Ok((s, len))
}

/// Walk the structure block and build the node/property graph.
///
/// An unknown token is a fatal bring-up error and halts; a structurally
/// unbalanced stream (unterminated name, `FDT_END_NODE` below the root, a
/// property outside any node, `FDT_END` with an open node) surfaces
/// `DtbUnclosedRootNode`.
pub(crate) fn parse_structure(
    dt: &mut DeviceTree,
    pmm: &mut Pmm,
    structure: &[u8],
    strings: &[u8],
) -> KResult<()> {
    let mut off = 0usize;
    let mut curr: Option<NodeId> = None;
    let mut depth = 0usize;

    loop {
        debug_assert!(off % 4 == 0, "Accesses must be 4 bytes aligned.");
        let token = be_u32(structure, off).ok_or(ErrorCode::DtbUnclosedRootNode)?;
        off += 4;

        match token {
            FDT_BEGIN_NODE => {
                let (name, len) = capture_cstr(&mut dt.arena, pmm, structure, off)?;
                off += align_up(len + 1, 4);

                // The unnamed top-level node is the root.
                let name = if depth == 0 && name.is_empty() { "/" } else { name };
                let id = dt.alloc_node(pmm, name, curr)?;
                curr = Some(id);
                depth += 1;
            }

            FDT_END_NODE => {
                let id = curr.ok_or(ErrorCode::DtbUnclosedRootNode)?;
                curr = dt.node(id).parent;
                depth -= 1;
            }

            FDT_PROP => {
                let value_len =
                    be_u32(structure, off).ok_or(ErrorCode::DtbUnclosedRootNode)? as usize;
                let name_off =
                    be_u32(structure, off + 4).ok_or(ErrorCode::DtbUnclosedRootNode)? as usize;
                off += 8;

                let node = curr.ok_or(ErrorCode::DtbUnclosedRootNode)?;
                let (name, _) = capture_cstr(&mut dt.arena, pmm, strings, name_off)?;
                let raw = structure
                    .get(off..off + value_len)
                    .ok_or(ErrorCode::DtbUnclosedRootNode)?;
                let value = dt.arena.copy_bytes(pmm, raw)?;
                off += align_up(value_len, 4);

                dt.prepend_property(pmm, node, name, value)?;
            }

            FDT_NOP => {}

            FDT_END => {
                if curr.is_some() {
                    return Err(ErrorCode::DtbUnclosedRootNode.into());
                }
                return Ok(());
            }

            _ => panic!("dtb: unknown structure token {:#x} at offset {:#x}", token, off - 4),
        }
    }
}
