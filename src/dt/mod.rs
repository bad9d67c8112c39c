//! In-memory device tree built from the firmware-provided blob.
//!
//! [`DeviceTree::initialize`] runs the whole pipeline once at boot: the blob
//! pages are identity-mapped, the flattened tree is parsed into a node /
//! property graph ([`parse`]), a second pass rewrites well-known properties
//! into typed values ([`rewrite`]), and the blob pages are unmapped again so
//! the underlying memory can be excluded from the heap.
//!
//! Nodes and properties live in growable index arrays; all cross references
//! are [`NodeId`] / [`PropId`] indices, so array growth is free to relocate
//! storage. Names, string values and decoded payload arrays live in a bump
//! arena that is never freed, which is what makes the `&'static` references
//! in the typed values sound.
//!
//! The tree is one-shot: produced by `initialize`, read-only thereafter.

pub mod parse;
pub mod print;
pub mod rewrite;

use crate::error::{ErrorCode, KResult};
use crate::mm::bump::BumpArena;
use crate::mm::mmu::{self, EntryBits, PageKind, PageTable};
use crate::mm::pmm::Pmm;
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::util::align::align_down;
use crate::util::paged_vec::PagedVec;

/// Index of a node in the tree. `NodeId(0)` is the root.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct NodeId(pub u32);

/// Index of a property.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PropId(pub u32);

/// A memory region the firmware asks the kernel to keep its hands off.
#[derive(Copy, Clone, Debug)]
pub struct ReservedRegion {
    pub address: PhysAddr,
    pub size: usize,
}

#[derive(Copy, Clone)]
pub struct Node {
    pub name: &'static str,
    /// `<u32>` cells encoding an address in this node's `reg`. Inherited
    /// from the parent, overridden by an own `#address-cells` for children.
    pub address_cells: u32,
    /// `<u32>` cells encoding a size in this node's `reg`.
    pub size_cells: u32,
    /// Head of the property list (most recently parsed first).
    pub properties: Option<PropId>,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
}

#[derive(Copy, Clone)]
pub struct Property {
    pub name: &'static str,
    pub next: Option<PropId>,
    pub value: PropertyValue,
}

/// Operational status of a device, from the `status` property.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DeviceStatus {
    /// The device is operational.
    Okay,
    /// Not operational, but may be enabled.
    Disabled,
    /// Operational but owned by firmware; should not be used.
    Reserved,
    /// The device has failed.
    Fail,
    /// The device has failed for the described reason.
    FailCondition(&'static str),
}

/// A decoded array of cell-encoded values. The width follows the cell count
/// the value was encoded with: 1 cell decodes to `u32`, 2 to `u64`, 3 to
/// `u128` (12 significant bytes).
#[derive(Copy, Clone)]
pub enum CellList {
    Empty,
    Single(&'static [u32]),
    Double(&'static [u64]),
    Triple(&'static [u128]),
}

impl CellList {
    pub fn len(&self) -> usize {
        match self {
            CellList::Empty => 0,
            CellList::Single(v) => v.len(),
            CellList::Double(v) => v.len(),
            CellList::Triple(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `u128`.
    pub fn get(&self, i: usize) -> Option<u128> {
        match self {
            CellList::Empty => None,
            CellList::Single(v) => v.get(i).map(|&x| x as u128),
            CellList::Double(v) => v.get(i).map(|&x| x as u128),
            CellList::Triple(v) => v.get(i).copied(),
        }
    }
}

/// Decoded `reg` property: `pairs` (address, size) pairs.
#[derive(Copy, Clone)]
pub struct Reg {
    pub addresses: CellList,
    pub sizes: CellList,
    pub pairs: u32,
}

/// Decoded `ranges` / `dma-ranges` property: `triplets`
/// (child-bus-address, parent-bus-address, length) triplets.
#[derive(Copy, Clone)]
pub struct Ranges {
    pub child_addrs: CellList,
    pub parent_addrs: CellList,
    pub lengths: CellList,
    pub triplets: u32,
}

/// A property value. `Raw` is what pass 1 produces; pass 2 rewrites the
/// recognized names into the typed variants and leaves the rest raw.
#[derive(Copy, Clone)]
pub enum PropertyValue {
    Raw(&'static [u8]),
    Compatible(&'static [&'static str]),
    Model(&'static str),
    Phandle(u32),
    Status(DeviceStatus),
    AddressCells(u32),
    SizeCells(u32),
    DmaCoherent(bool),
    DeviceType(&'static str),
    Reg(Reg),
    Ranges(Ranges),
    DmaRanges(Ranges),
}

pub struct DeviceTree {
    pub(crate) reserved: PagedVec<ReservedRegion>,
    pub(crate) nodes: PagedVec<Node>,
    pub(crate) props: PagedVec<Property>,
    pub(crate) arena: BumpArena,
    initialized: bool,
}

impl DeviceTree {
    pub const fn new() -> Self {
        DeviceTree {
            reserved: PagedVec::new(),
            nodes: PagedVec::new(),
            props: PagedVec::new(),
            arena: BumpArena::new(),
            initialized: false,
        }
    }

    /// Parse the flattened device tree at `dtb_addr` and build the typed
    /// in-memory tree. One-shot; the blob pages are identity-mapped for the
    /// duration of the parse and unmapped before returning.
    pub fn initialize(
        &mut self,
        pmm: &mut Pmm,
        root_table: &mut PageTable,
        dtb_addr: PhysAddr,
    ) -> KResult<()> {
        let aligned_base = align_down(dtb_addr, PAGE_SIZE);
        mmu::map(
            root_table,
            pmm,
            aligned_base,
            aligned_base,
            EntryBits::Read.val(),
            PageKind::Page,
        )
        .map_err(|e| e.push(ErrorCode::DtbMappingFailed))?;

        // The header words are big-endian; nothing else of the blob may be
        // touched before the magic check passes.
        let header = unsafe { parse::Header::read(dtb_addr) };
        if header.magic != parse::FDT_MAGIC {
            return Err(ErrorCode::DtbMagicNumber.into());
        }

        // The blob may span more than the one page mapped so far.
        let total_size = header.total_size as usize;
        let mut pa = aligned_base + PAGE_SIZE;
        while pa < dtb_addr + total_size {
            mmu::map(root_table, pmm, pa, pa, EntryBits::Read.val(), PageKind::Page)
                .map_err(|e| e.push(ErrorCode::DtbMappingFailed))?;
            pa += PAGE_SIZE;
        }

        let blob = unsafe { core::slice::from_raw_parts(dtb_addr as *const u8, total_size) };
        parse::parse_reserved(self, pmm, blob, header.off_mem_rsvmap as usize)?;

        let structure = blob
            .get(header.off_dt_struct as usize..)
            .ok_or(ErrorCode::DtbUnclosedRootNode)?;
        let strings = blob
            .get(header.off_dt_strings as usize..)
            .ok_or(ErrorCode::DtbUnclosedRootNode)?;
        parse::parse_structure(self, pmm, structure, strings)?;

        if self.nodes.is_empty() {
            return Err(ErrorCode::DtbNoNodes.into());
        }

        // The rewrite starts from the architectural default cell counts.
        {
            let root = &mut self.nodes[0];
            root.address_cells = 2;
            root.size_cells = 1;
        }
        rewrite::rewrite_tree(self, pmm).map_err(|e| e.push(ErrorCode::DtbRewriteFailed))?;

        self.initialized = true;

        // The tree owns copies of everything it needs; drop the window onto
        // the blob so the memory can be handed back to the PMM.
        let mut pa = aligned_base;
        while pa < dtb_addr + total_size {
            mmu::unmap(root_table, pa);
            pa += PAGE_SIZE;
        }

        Ok(())
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The root node, once pass 1 has produced any node.
    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    #[inline]
    pub fn prop(&self, id: PropId) -> &Property {
        &self.props[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn reserved_regions(&self) -> &[ReservedRegion] {
        self.reserved.as_slice()
    }

    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children { dt: self, next: self.node(id).first_child }
    }

    pub fn properties(&self, id: NodeId) -> Properties<'_> {
        Properties { dt: self, next: self.node(id).properties }
    }

    pub fn find_property(&self, id: NodeId, name: &str) -> Option<&Property> {
        let mut pid = self.node(id).properties;
        while let Some(p) = pid {
            let prop = self.prop(p);
            if prop.name == name {
                return Some(prop);
            }
            pid = prop.next;
        }
        None
    }

    /// Resolve an absolute `/soc/uart@10000000` style path. A component
    /// without a `@unit-address` also matches a node carrying one (first
    /// match in child order wins); `"/"` resolves to the root. Aliases are
    /// not consulted.
    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        let root = self.root()?;
        let rest = path.strip_prefix('/')?;
        if rest.is_empty() {
            return Some(root);
        }

        let mut curr = root;
        for component in rest.split('/') {
            if component.is_empty() {
                return None;
            }
            let mut found = None;
            let mut child = self.node(curr).first_child;
            while let Some(c) = child {
                let name = self.node(c).name;
                let matches = name == component
                    || (!component.contains('@')
                        && name.split('@').next() == Some(component));
                if matches {
                    found = Some(c);
                    break;
                }
                child = self.node(c).next_sibling;
            }
            curr = found?;
        }
        Some(curr)
    }

    /// Append a node linked as the last child of `parent`. Only the very
    /// first node may have no parent.
    pub(crate) fn alloc_node(
        &mut self,
        pmm: &mut Pmm,
        name: &'static str,
        parent: Option<NodeId>,
    ) -> KResult<NodeId> {
        if parent.is_none() && !self.nodes.is_empty() {
            // A second root: the structure block is malformed.
            return Err(ErrorCode::DtbUnclosedRootNode.into());
        }

        let idx = self.nodes.push(
            pmm,
            Node {
                name,
                address_cells: 0,
                size_cells: 0,
                properties: None,
                parent,
                first_child: None,
                next_sibling: None,
            },
        )?;
        let id = NodeId(idx as u32);

        if let Some(parent) = parent {
            match self.node(parent).first_child {
                None => self.node_mut(parent).first_child = Some(id),
                Some(first) => {
                    let mut last = first;
                    while let Some(next) = self.node(last).next_sibling {
                        last = next;
                    }
                    self.node_mut(last).next_sibling = Some(id);
                }
            }
        }
        Ok(id)
    }

    /// Prepend a raw property to `node`'s property list.
    pub(crate) fn prepend_property(
        &mut self,
        pmm: &mut Pmm,
        node: NodeId,
        name: &'static str,
        value: &'static [u8],
    ) -> KResult<PropId> {
        let head = self.node(node).properties;
        let idx = self.props.push(
            pmm,
            Property { name, next: head, value: PropertyValue::Raw(value) },
        )?;
        let id = PropId(idx as u32);
        self.node_mut(node).properties = Some(id);
        Ok(id)
    }
}

pub struct Children<'a> {
    dt: &'a DeviceTree,
    next: Option<NodeId>,
}

impl<'a> Iterator for Children<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.dt.node(id).next_sibling;
        Some(id)
    }
}

pub struct Properties<'a> {
    dt: &'a DeviceTree,
    next: Option<PropId>,
}

impl<'a> Iterator for Properties<'a> {
    type Item = &'a Property;

    fn next(&mut self) -> Option<&'a Property> {
        let id = self.next?;
        let prop = self.dt.prop(id);
        self.next = prop.next;
        Some(prop)
    }
}

////////////////////// Kernel singleton /////////////////////////////

static mut DEVICE_TREE: DeviceTree = DeviceTree::new();

/// The process-wide device tree. Populated once by [`dt_initialize`],
/// read-only afterwards.
pub fn device_tree() -> &'static mut DeviceTree {
    unsafe { &mut *core::ptr::addr_of_mut!(DEVICE_TREE) }
}

/// Parse the DTB at `dtb_addr` into the kernel's device tree, using the
/// kernel PMM and root page table.
pub fn dt_initialize(dtb_addr: PhysAddr) -> KResult<()> {
    device_tree().initialize(crate::mm::pmm::pmm(), mmu::kernel_root(), dtb_addr)
}

pub fn dt_is_initialized() -> bool {
    device_tree().is_initialized()
}

#[cfg(test)]
mod tests;
