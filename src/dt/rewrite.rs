//! Pass 2: typed property rewrite.
//!
//! Starting from the root (address_cells=2, size_cells=1), every property is
//! dispatched on its literal name and its `Raw` payload replaced by a typed
//! value. Cell counts are inherited top-down: a node's own `#address-cells`
//! and `#size-cells` apply to its children, while its `reg`/`ranges` decode
//! with the counts inherited from its parent. Names outside the recognized
//! set stay raw and are logged.

use crate::error::{ErrorCode, KResult};
use crate::mm::bump::BumpArena;
use crate::mm::pmm::Pmm;

use super::parse::{be_u32, be_u64};
use super::{CellList, DeviceStatus, DeviceTree, NodeId, PropertyValue, Ranges, Reg};

/// Rewrite every property in the tree, recursing from the root.
pub(crate) fn rewrite_tree(dt: &mut DeviceTree, pmm: &mut Pmm) -> KResult<()> {
    let root = dt.root().ok_or(ErrorCode::DtbNoNodes)?;
    rewrite_node(dt, pmm, root)
}

fn rewrite_node(dt: &mut DeviceTree, pmm: &mut Pmm, id: NodeId) -> KResult<()> {
    let (addr_cells, size_cells, first_prop, first_child) = {
        let node = dt.node(id);
        (node.address_cells, node.size_cells, node.properties, node.first_child)
    };

    // Cells the children inherit; updated by this node's own cells props.
    let mut next_addr_cells = addr_cells;
    let mut next_size_cells = size_cells;

    let mut pid = first_prop;
    while let Some(p) = pid {
        let (name, value, next) = {
            let prop = dt.prop(p);
            (prop.name, prop.value, prop.next)
        };
        pid = next;

        let raw = match value {
            PropertyValue::Raw(raw) => raw,
            // Already typed; pass 2 runs once per property.
            _ => continue,
        };

        let rewritten = match name {
            "compatible" => Some(rewrite_compatible(&mut dt.arena, pmm, raw)?),
            "model" => Some(PropertyValue::Model(prop_str(raw))),
            "phandle" | "linux,phandle" => Some(PropertyValue::Phandle(raw_u32(raw))),
            "status" => Some(PropertyValue::Status(parse_status(raw))),
            "#address-cells" => {
                let cells = raw_u32(raw);
                if cells > 3 {
                    return Err(ErrorCode::DtbAddressCellsTooLarge.into());
                }
                next_addr_cells = cells;
                Some(PropertyValue::AddressCells(cells))
            }
            "#size-cells" => {
                let cells = raw_u32(raw);
                if cells > 2 {
                    return Err(ErrorCode::DtbSizeCellsTooLarge.into());
                }
                next_size_cells = cells;
                Some(PropertyValue::SizeCells(cells))
            }
            "dma-coherent" => Some(PropertyValue::DmaCoherent(true)),
            "dma-noncoherent" => Some(PropertyValue::DmaCoherent(false)),
            "device_type" => Some(PropertyValue::DeviceType(prop_str(raw))),
            "reg" => Some(PropertyValue::Reg(rewrite_reg(
                &mut dt.arena,
                pmm,
                raw,
                addr_cells,
                size_cells,
            )?)),
            "ranges" => Some(PropertyValue::Ranges(rewrite_ranges(
                &mut dt.arena,
                pmm,
                raw,
                addr_cells,
                size_cells,
            )?)),
            "dma-ranges" => Some(PropertyValue::DmaRanges(rewrite_ranges(
                &mut dt.arena,
                pmm,
                raw,
                addr_cells,
                size_cells,
            )?)),
            _ => {
                log::debug!("unhandled device tree property: {}", name);
                None
            }
        };

        if let Some(value) = rewritten {
            dt.props[p.0 as usize].value = value;
        }
    }

    let mut child = first_child;
    while let Some(c) = child {
        let next = {
            let node = dt.node_mut(c);
            node.address_cells = next_addr_cells;
            node.size_cells = next_size_cells;
            node.next_sibling
        };
        rewrite_node(dt, pmm, c)?;
        child = next;
    }

    Ok(())
}

/// The string payload without its trailing NUL.
fn prop_str(raw: &'static [u8]) -> &'static str {
    let bytes = match raw.split_last() {
        Some((0, rest)) => rest,
        _ => raw,
    };
    // ASCII per the flat-tree spec; trusted firmware input.
    unsafe { core::str::from_utf8_unchecked(bytes) }
}

/// A single big-endian u32 payload.
fn raw_u32(raw: &[u8]) -> u32 {
    match be_u32(raw, 0) {
        Some(v) => v,
        None => panic!("dtb: u32 property with {} byte(s)", raw.len()),
    }
}

fn parse_status(raw: &'static [u8]) -> DeviceStatus {
    let value = prop_str(raw);
    match value {
        "okay" => DeviceStatus::Okay,
        "disabled" => DeviceStatus::Disabled,
        "reserved" => DeviceStatus::Reserved,
        "fail" => DeviceStatus::Fail,
        _ => match value.strip_prefix("fail-") {
            Some(reason) => DeviceStatus::FailCondition(reason),
            None => panic!("dtb: unknown status value: {}", value),
        },
    }
}

/// Split the NUL-delimited string list into a vector of strings.
fn rewrite_compatible(
    arena: &mut BumpArena,
    pmm: &mut Pmm,
    raw: &'static [u8],
) -> KResult<PropertyValue> {
    let count = raw.iter().filter(|&&b| b == 0).count();
    let list = arena.alloc_array::<&'static str>(pmm, count)?;

    let mut start = 0;
    let mut idx = 0;
    for (i, &b) in raw.iter().enumerate() {
        if b == 0 {
            let s = unsafe { core::str::from_utf8_unchecked(&raw[start..i]) };
            unsafe {
                list.add(idx).write(s);
            }
            idx += 1;
            start = i + 1;
        }
    }
    debug_assert_eq!(idx, count);

    Ok(PropertyValue::Compatible(unsafe {
        core::slice::from_raw_parts(list, count)
    }))
}

/// Decode `count` cell-encoded values of `cells` width each, the first at
/// `first_off`, consecutive ones `stride` bytes apart.
fn decode_cells(
    arena: &mut BumpArena,
    pmm: &mut Pmm,
    raw: &[u8],
    first_off: usize,
    stride: usize,
    count: usize,
    cells: u32,
) -> KResult<CellList> {
    let read = |off: usize, len: usize| -> u128 {
        match len {
            // Widths follow the cell count: 4, 8 or 12 significant bytes.
            4 => be_u32(raw, off).map(|v| v as u128),
            8 => be_u64(raw, off).map(|v| v as u128),
            12 => {
                let high = be_u32(raw, off).map(|v| v as u128);
                let low = be_u64(raw, off + 4).map(|v| v as u128);
                high.zip(low).map(|(h, l)| h << 64 | l)
            }
            _ => None,
        }
        .unwrap_or_else(|| panic!("dtb: truncated cell value at offset {}", off))
    };

    match cells {
        0 => Ok(CellList::Empty),
        1 => {
            let ptr = arena.alloc_array::<u32>(pmm, count)?;
            for i in 0..count {
                unsafe { ptr.add(i).write(read(first_off + i * stride, 4) as u32) };
            }
            Ok(CellList::Single(unsafe {
                core::slice::from_raw_parts(ptr, count)
            }))
        }
        2 => {
            let ptr = arena.alloc_array::<u64>(pmm, count)?;
            for i in 0..count {
                unsafe { ptr.add(i).write(read(first_off + i * stride, 8) as u64) };
            }
            Ok(CellList::Double(unsafe {
                core::slice::from_raw_parts(ptr, count)
            }))
        }
        3 => {
            let ptr = arena.alloc_array::<u128>(pmm, count)?;
            for i in 0..count {
                unsafe { ptr.add(i).write(read(first_off + i * stride, 12)) };
            }
            Ok(CellList::Triple(unsafe {
                core::slice::from_raw_parts(ptr, count)
            }))
        }
        _ => unreachable!("cells validated against the rewrite limits"),
    }
}

/// Decode `reg` into (address, size) pairs, sized by the cells inherited
/// from the parent.
fn rewrite_reg(
    arena: &mut BumpArena,
    pmm: &mut Pmm,
    raw: &'static [u8],
    address_cells: u32,
    size_cells: u32,
) -> KResult<Reg> {
    let address_size = 4 * address_cells as usize;
    let size_size = 4 * size_cells as usize;
    let pair_size = address_size + size_size;
    assert!(pair_size > 0, "dtb: reg with zero cells");
    assert!(
        raw.len() % pair_size == 0,
        "dtb: reg length {} not a multiple of the pair size {}",
        raw.len(),
        pair_size
    );

    let pairs = raw.len() / pair_size;
    assert!(pairs > 0, "dtb: empty reg property");

    let addresses = decode_cells(arena, pmm, raw, 0, pair_size, pairs, address_cells)?;
    let sizes = decode_cells(arena, pmm, raw, address_size, pair_size, pairs, size_cells)?;
    Ok(Reg { addresses, sizes, pairs: pairs as u32 })
}

/// Decode `ranges` / `dma-ranges` into (child, parent, length) triplets.
fn rewrite_ranges(
    arena: &mut BumpArena,
    pmm: &mut Pmm,
    raw: &'static [u8],
    address_cells: u32,
    size_cells: u32,
) -> KResult<Ranges> {
    let address_size = 4 * address_cells as usize;
    let size_size = 4 * size_cells as usize;
    assert!(address_size > 0, "dtb: ranges with zero address cells");
    assert!(size_size > 0, "dtb: ranges with zero size cells");

    let trip_size = 2 * address_size + size_size;
    assert!(
        raw.len() % trip_size == 0,
        "dtb: ranges length {} not a multiple of the triplet size {}",
        raw.len(),
        trip_size
    );
    let triplets = raw.len() / trip_size;

    let child_addrs = decode_cells(arena, pmm, raw, 0, trip_size, triplets, address_cells)?;
    let parent_addrs =
        decode_cells(arena, pmm, raw, address_size, trip_size, triplets, address_cells)?;
    let lengths =
        decode_cells(arena, pmm, raw, 2 * address_size, trip_size, triplets, size_cells)?;
    Ok(Ranges { child_addrs, parent_addrs, lengths, triplets: triplets as u32 })
}
