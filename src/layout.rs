//! Kernel image layout, as resolved by the link step.
//!
//! The linker script provides one absolute symbol per section boundary; the
//! accessors below read the symbol addresses, which *are* the values.

macro_rules! layout_symbol {
    ($(#[$doc:meta])* $sym:ident, $accessor:ident) => {
        $(#[$doc])*
        #[inline]
        pub fn $accessor() -> usize {
            extern "C" {
                static $sym: u8;
            }
            unsafe { core::ptr::addr_of!($sym) as usize }
        }
    };
}

layout_symbol!(TEXT_START, text_start);
layout_symbol!(TEXT_END, text_end);
layout_symbol!(RODATA_START, rodata_start);
layout_symbol!(RODATA_END, rodata_end);
layout_symbol!(DATA_START, data_start);
layout_symbol!(DATA_END, data_end);
layout_symbol!(BSS_START, bss_start);
layout_symbol!(BSS_END, bss_end);
layout_symbol!(STACK_START, stack_start);
layout_symbol!(STACK_END, stack_end);
layout_symbol!(HEAP_START, heap_start);
layout_symbol!(HEAP_END, heap_end);
layout_symbol!(
    /// Heap byte count. An absolute symbol, so the address is the size.
    HEAP_SIZE,
    heap_size
);
