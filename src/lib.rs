//! Bring-up core of a small RISC-V supervisor-mode kernel.
//!
//! Four subsystems, brought up leaves-first by the boot path in `main.rs`:
//!
//! 1. A slab allocator ([`mm::slab`]) handing out fixed-size metadata blocks
//!    from donated buffers.
//! 2. A physical memory manager ([`mm::pmm`]) managing page-aligned regions
//!    with a first-fit policy, drawing its block descriptors from the slab.
//! 3. An SV39 page-table engine ([`mm::mmu`]) mapping 4KiB pages across the
//!    three translation levels, allocating intermediate tables from the PMM.
//! 4. A device-tree parser ([`dt`]) consuming the firmware-provided blob and
//!    producing a typed in-memory tree backed by a bump arena.
//!
//! Everything here is pure memory manipulation, so the library also builds
//! with `std` under `cfg(test)` and the subsystems are exercised by host
//! tests against page-aligned heap buffers.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod macros;

pub mod arch;
pub mod console;
pub mod dt;
pub mod error;
#[cfg(target_arch = "riscv64")]
pub mod layout;
pub mod logk;
pub mod mm;
pub mod util;
