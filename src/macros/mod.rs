//! Macros used across the kernel.

#[macro_use]
pub mod print;
