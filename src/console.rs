//! Kernel console output funnel.
//!
//! The kernel itself owns no character device. A `putchar` callback is
//! injected once by the entry code (see [`init`]); every piece of formatted
//! output, including the [`log`] records rendered by [`logk`], is funneled
//! through it byte by byte. Before injection the output is discarded, which
//! is also the behavior under host tests.
//!
//! [`logk`]: crate::logk

use core::fmt;

/// Character-output sink. Receives one raw byte per call.
pub type Putchar = fn(u8);

static mut SINK: Option<Putchar> = None;

/// Install the character sink. Called once by the entry code before any
/// other output; a later call replaces the sink.
pub fn init(putchar: Putchar) {
    unsafe {
        *core::ptr::addr_of_mut!(SINK) = Some(putchar);
    }
}

#[inline]
fn put_byte(byte: u8) {
    let sink = unsafe { *core::ptr::addr_of!(SINK) };
    if let Some(putchar) = sink {
        putchar(byte);
    }
}

/// Zero-sized writer over the injected sink. Constructed in place by the
/// `print_k!`/`println_k!` macros.
pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            put_byte(byte);
        }
        Ok(())
    }
}
