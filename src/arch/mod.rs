//! Architecture support. RISC-V only.

#[cfg(target_arch = "riscv64")]
pub mod riscv;
