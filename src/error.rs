//! Stacked error values.
//!
//! An [`ErrorStack`] is a register-storable stack of up to 8 cascading error
//! codes, one byte each, newest at the low byte. A zero stack means success.
//! Call sites that can give an inner failure more context push an outer code
//! on top, so inspecting the stack yields the most specific error first.

use core::fmt;

/// One-byte error code. The discriminant values are part of the on-register
/// encoding of [`ErrorStack`] and must stay dense.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    NotImplemented,
    NullArgument,

    // Slab allocator errors:
    SlabRegionTooSmall,
    SlabForeignBlock,

    // Physical memory manager errors:
    PmmInit,
    PmmSlabAllocFailed,
    PmmAddRegionTooSmall,
    PmmAddManagedRegion,
    PmmBadAlignment,
    PmmOutOfMemory,
    PmmRegionListEmpty,
    PmmRegionListFull,
    PmmRegionAllocatedFrom,
    PmmRegionNotManaged,

    // Paging errors:
    PagingUnalignedAddress,
    PagingInvalidAddress,
    PagingInvalidFlags,
    PagingInvalidType,
    PagingSetupTable,
    PagingMappingExists,

    // Device tree errors:
    DtbMagicNumber,
    DtbMappingFailed,
    DtbUnclosedRootNode,
    DtbNoNodes,
    DtbAddressCellsTooLarge,
    DtbSizeCellsTooLarge,
    DtbRewriteFailed,
}

sa::const_assert_eq!(core::mem::size_of::<ErrorCode>(), 1);

/// One past the largest valid discriminant.
const ERROR_CODE_GUARD: u8 = ErrorCode::DtbRewriteFailed as u8 + 1;

impl ErrorCode {
    #[inline]
    fn from_raw(raw: u8) -> ErrorCode {
        assert!(raw < ERROR_CODE_GUARD, "corrupt error stack byte: {:#x}", raw);
        // Guarded above; the enum is a dense repr(u8).
        unsafe { core::mem::transmute(raw) }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::Ok => "No error.",
            ErrorCode::NotImplemented => "Not implemented.",
            ErrorCode::NullArgument => "Pointer argument to function was null.",

            ErrorCode::SlabRegionTooSmall => {
                "Slab region is too small to allocate a block from."
            }
            ErrorCode::SlabForeignBlock => {
                "Slab block being returned is not managed by this allocator."
            }

            ErrorCode::PmmInit => "Physical memory manager initialization failed.",
            ErrorCode::PmmSlabAllocFailed => {
                "Physical memory manager slab allocator failed to allocate a block."
            }
            ErrorCode::PmmAddRegionTooSmall => {
                "Region added to the physical memory manager is smaller than one page."
            }
            ErrorCode::PmmAddManagedRegion => {
                "Region added to the physical memory manager is already managed by it."
            }
            ErrorCode::PmmBadAlignment => {
                "Allocation alignment must be a power of two and at least one page."
            }
            ErrorCode::PmmOutOfMemory => {
                "Physical memory manager does not have enough free memory for the request."
            }
            ErrorCode::PmmRegionListEmpty => {
                "Physical memory manager region list is empty."
            }
            ErrorCode::PmmRegionListFull => {
                "Physical memory manager region list is full."
            }
            ErrorCode::PmmRegionAllocatedFrom => {
                "Region has outstanding allocations."
            }
            ErrorCode::PmmRegionNotManaged => {
                "No managed region contains the given interval."
            }

            ErrorCode::PagingUnalignedAddress => {
                "Mapped addresses must be aligned to the page size of the mapping."
            }
            ErrorCode::PagingInvalidAddress => "Address is outside the translatable range.",
            ErrorCode::PagingInvalidFlags => {
                "Leaf mappings need at least one of R/W/X, and W requires R."
            }
            ErrorCode::PagingInvalidType => "Unknown page size for the mapping.",
            ErrorCode::PagingSetupTable => "Failed to set up an intermediate page table.",
            ErrorCode::PagingMappingExists => {
                "A mapping already exists for the virtual address."
            }

            ErrorCode::DtbMagicNumber => {
                "Device tree blob magic number is not 0xd00dfeed."
            }
            ErrorCode::DtbMappingFailed => {
                "Failed to map the device tree blob into the kernel page table."
            }
            ErrorCode::DtbUnclosedRootNode => {
                "Device tree structure block is unbalanced."
            }
            ErrorCode::DtbNoNodes => "Device tree blob contains no nodes.",
            ErrorCode::DtbAddressCellsTooLarge => "#address-cells value is larger than 3.",
            ErrorCode::DtbSizeCellsTooLarge => "#size-cells value is larger than 2.",
            ErrorCode::DtbRewriteFailed => "Device tree property rewrite pass failed.",
        }
    }
}

/// Packed stack of up to 8 [`ErrorCode`] bytes, newest at the low byte.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ErrorStack(u64);

impl ErrorStack {
    /// An empty (success) stack.
    pub const fn new() -> Self {
        ErrorStack(0)
    }

    #[inline]
    pub const fn from_code(code: ErrorCode) -> Self {
        ErrorStack(code as u64)
    }

    /// Push `code` on top of the stack. The oldest frame falls off once more
    /// than 8 codes are stacked.
    #[inline]
    #[must_use]
    pub const fn push(self, code: ErrorCode) -> Self {
        ErrorStack((self.0 << 8) | code as u64)
    }

    #[inline]
    #[must_use]
    pub const fn pop(self) -> Self {
        ErrorStack(self.0 >> 8)
    }

    /// The newest (most specific) code.
    #[inline]
    pub fn top(self) -> ErrorCode {
        ErrorCode::from_raw((self.0 & 0xff) as u8)
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self.top() == ErrorCode::Ok
    }

    #[inline]
    pub fn is_fail(self) -> bool {
        !self.is_ok()
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<ErrorCode> for ErrorStack {
    fn from(code: ErrorCode) -> Self {
        ErrorStack::from_code(code)
    }
}

impl fmt::Display for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.top().describe())
    }
}

impl fmt::Debug for ErrorStack {
    /// Renders the whole stack, newest first: `PmmInit <- SlabRegionTooSmall`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = *self;
        write!(f, "{:?}", stack.top())?;
        stack = stack.pop();
        while stack.is_fail() {
            write!(f, " <- {:?}", stack.top())?;
            stack = stack.pop();
        }
        Ok(())
    }
}

pub type KResult<T> = Result<T, ErrorStack>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stack_is_ok() {
        let err = ErrorStack::new();
        assert!(err.is_ok());
        assert_eq!(err.top(), ErrorCode::Ok);
        assert_eq!(err.raw(), 0);
    }

    #[test]
    fn push_pop_ordering() {
        let err = ErrorStack::from_code(ErrorCode::SlabRegionTooSmall)
            .push(ErrorCode::PmmInit);
        assert!(err.is_fail());
        // Newest on top.
        assert_eq!(err.top(), ErrorCode::PmmInit);
        let popped = err.pop();
        assert_eq!(popped.top(), ErrorCode::SlabRegionTooSmall);
        assert!(popped.pop().is_ok());
    }

    #[test]
    fn deep_stack_drops_oldest() {
        let mut err = ErrorStack::from_code(ErrorCode::NullArgument);
        for _ in 0..8 {
            err = err.push(ErrorCode::PmmOutOfMemory);
        }
        // The NullArgument frame has been shifted out of the 8-byte window.
        let mut depth = 0;
        let mut walk = err;
        while walk.is_fail() {
            assert_eq!(walk.top(), ErrorCode::PmmOutOfMemory);
            walk = walk.pop();
            depth += 1;
        }
        assert_eq!(depth, 8);
    }

    #[test]
    fn display_uses_top_frame() {
        let err = ErrorStack::from_code(ErrorCode::SlabRegionTooSmall)
            .push(ErrorCode::PmmInit);
        assert_eq!(format!("{}", err), ErrorCode::PmmInit.describe());
        assert_eq!(format!("{:?}", err), "PmmInit <- SlabRegionTooSmall");
    }
}
