//! Kernel entry: early bring-up on the boot hart, then the main loop.
//!
//! The bring-up order is dictated by the subsystems feeding each other: the
//! PMM seeds its descriptor slab and receives the early heap, the SV39 root
//! table is filled with identity mappings through the PMM, paging is switched
//! on through the CSR facade, and only then (from `kmain`, with translation
//! live) the device tree is parsed and its reserved regions are punched out
//! of the heap.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use svos::dt;
    use svos::error::ErrorCode;
    use svos::layout;
    use svos::logk;
    use svos::mm::mmu::{self, build_satp, EntryBits, Mode, PageKind, PageTable};
    use svos::mm::pmm::{pmm, Pmm};
    use svos::mm::{PhysAddr, PAGE_SIZE};
    use svos::util::align::{align_down, align_up};
    use svos::{console, print_k, println_k};

    use core::arch::{asm, global_asm};

    // The boot hart clears BSS, takes the boot stack and enters kinit with
    // the firmware-provided (hartid, dtb) pair still in a0/a1. Secondary
    // harts park. The trap vector is a parked stub; real trap handling is an
    // external collaborator.
    global_asm!(
        r#"
        .section .text.init
        .global _start
        _start:
            csrr    t0, mhartid
            bnez    t0, 3f

            la      t1, BSS_START
            la      t2, BSS_END
        1:
            bgeu    t1, t2, 2f
            sd      zero, (t1)
            addi    t1, t1, 8
            j       1b
        2:
            la      sp, STACK_END
            call    kinit
        3:
            wfi
            j       3b

        .global asm_trap_vector
        .align 2
        asm_trap_vector:
            j       asm_trap_vector
        "#
    );

    extern "C" {
        fn asm_trap_vector();
    }

    /// QEMU virt NS16550A transmit register. The UART driver proper is an
    /// external collaborator; the kernel only injects this raw byte sink
    /// into the console.
    const UART_BASE: usize = 0x1000_0000;

    fn uart_putchar(byte: u8) {
        unsafe {
            (UART_BASE as *mut u8).write_volatile(byte);
        }
    }

    /// Early heap handed to the PMM before any device memory is known.
    const EARLY_HEAP_PAGES: usize = 128;
    const EARLY_HEAP_SIZE: usize = EARLY_HEAP_PAGES * PAGE_SIZE;

    #[repr(C, align(4096))]
    struct EarlyHeap([u8; EARLY_HEAP_SIZE]);

    static mut EARLY_HEAP: EarlyHeap = EarlyHeap([0; EARLY_HEAP_SIZE]);

    /// The DTB physical address handed over by firmware. Written by `kinit`
    /// (after the entry stub cleared BSS), read by `kmain`.
    static mut DTB_BASE: PhysAddr = 0;

    /// Identity-map `[start, end)` into `root`, widened to page boundaries.
    fn id_map_range(root: &mut PageTable, pmm: &mut Pmm, start: usize, end: usize, bits: u32) {
        let aligned_start = align_down(start, PAGE_SIZE);
        let aligned_end = align_up(end, PAGE_SIZE);
        assert!(aligned_start < aligned_end, "Start address must be less than end address");

        let mut pa = aligned_start;
        while pa < aligned_end {
            if let Err(err) = mmu::map(root, pmm, pa, pa, bits, PageKind::Page) {
                panic!("[kinit] Failed to map {:#x}: {}", pa, err);
            }
            pa += PAGE_SIZE;
        }
    }

    fn verify_identity(root: &PageTable, start: usize, end: usize, what: &str) {
        let mut va = align_down(start, PAGE_SIZE);
        let aligned_end = align_up(end, PAGE_SIZE);
        while va < aligned_end {
            let pa = mmu::virt_to_phys(root, va);
            assert!(
                pa == Some(va),
                "{}: identity mapping failed, va: {:#x}, pa: {:?}",
                what,
                va,
                pa
            );
            va += PAGE_SIZE;
        }
    }

    /// Machine-mode initialization on the boot hart. Prepares the PMM and
    /// the kernel address space, then drops to supervisor mode in `kmain`
    /// with paging on.
    #[no_mangle]
    extern "C" fn kinit(hart_id: usize, dtb: *const u8) -> ! {
        console::init(uart_putchar);
        logk::init();

        println_k!();
        println_k!("=========================================");
        println_k!("        svos (sv39 supervisor os)        ");
        println_k!("=========================================");
        println_k!("[kinit] Running in hart#{}, dtb: {:p}", hart_id, dtb);
        println_k!("[kinit] Kernel image layout:");
        println_k!("    * Text:   {:#x} -> {:#x}", layout::text_start(), layout::text_end());
        println_k!("    * RoData: {:#x} -> {:#x}", layout::rodata_start(), layout::rodata_end());
        println_k!("    * Data:   {:#x} -> {:#x}", layout::data_start(), layout::data_end());
        println_k!("    * Bss:    {:#x} -> {:#x}", layout::bss_start(), layout::bss_end());
        println_k!("    * Stack:  {:#x} -> {:#x}", layout::stack_start(), layout::stack_end());
        println_k!(
            "    * Heap:   {:#x} -> {:#x} ({:#x} bytes)",
            layout::heap_start(),
            layout::heap_end(),
            layout::heap_size()
        );

        unsafe {
            DTB_BASE = dtb as PhysAddr;
        }

        let pmm = pmm();
        if let Err(err) = pmm.initialize() {
            panic!("[kinit] Failed to initialize pmm: {}", err);
        }
        let early_heap = unsafe { core::ptr::addr_of_mut!(EARLY_HEAP) as PhysAddr };
        if let Err(err) = pmm.add_region(early_heap, EARLY_HEAP_SIZE) {
            panic!("[kinit] Failed to add the early heap region: {}", err);
        }
        println_k!(
            "[kinit] pmm initialized with the early heap ({:#x} bytes).",
            pmm.total_mem()
        );

        let root = mmu::kernel_root();
        let rx = EntryBits::ReadExecute.val();
        let ro = EntryBits::Read.val();
        let rw = EntryBits::ReadWrite.val();
        id_map_range(root, pmm, layout::text_start(), layout::text_end(), rx);
        id_map_range(root, pmm, layout::rodata_start(), layout::rodata_end(), ro);
        id_map_range(root, pmm, layout::data_start(), layout::data_end(), rw);
        id_map_range(root, pmm, layout::bss_start(), layout::bss_end(), rw);
        id_map_range(root, pmm, layout::stack_start(), layout::stack_end(), rw);
        id_map_range(root, pmm, UART_BASE, UART_BASE + PAGE_SIZE, rw);
        println_k!("[kinit] Kernel identity mappings installed.");

        verify_identity(root, layout::text_start(), layout::text_end(), "TEXT");
        verify_identity(root, layout::rodata_start(), layout::rodata_end(), "RODATA");
        verify_identity(root, layout::data_start(), layout::data_end(), "DATA");
        verify_identity(root, layout::bss_start(), layout::bss_end(), "BSS");
        verify_identity(root, layout::stack_start(), layout::stack_end(), "STACK");
        verify_identity(root, UART_BASE, UART_BASE + PAGE_SIZE, "UART");

        use svos::arch::riscv;
        // Supervisor previous-privilege and interrupt-enable staging.
        riscv::sstatus_write((1 << 8) | (1 << 5));
        riscv::sepc_write(kmain as usize);
        // Delegate software, timer and external interrupts to S-mode.
        riscv::mideleg_write((1 << 1) | (1 << 5) | (1 << 9));
        riscv::sie_write((1 << 1) | (1 << 5) | (1 << 9));
        riscv::stvec_write(asm_trap_vector as usize);
        riscv::satp_write(build_satp(Mode::Sv39, 0, root.addr() as u64));
        // Open the whole physical address space in PMP.
        riscv::pmpaddr0_write(usize::MAX >> 10);
        riscv::pmpcfg0_write(0x1f);

        riscv::sfence_vma();
        riscv::sret();
    }

    /// Supervisor-mode entry with paging live.
    #[no_mangle]
    extern "C" fn kmain() -> ! {
        println_k!("[kmain] Paging enabled. Kernel is now running with paging.");

        let dtb_addr = unsafe { DTB_BASE };
        if let Err(err) = dt::dt_initialize(dtb_addr) {
            panic!("[kmain] Failed to parse DTB: {}", err);
        }

        // Exclude the firmware-reserved regions from the general heap. Most
        // of them live outside the early heap and are simply not managed.
        let tree = dt::device_tree();
        for region in tree.reserved_regions() {
            match pmm().remove_region(region.address, region.size) {
                Ok(()) => {
                    println_k!(
                        "[kmain] Reserved {:#x} ({:#x} bytes) removed from the heap.",
                        region.address,
                        region.size
                    );
                }
                Err(err) if err.top() == ErrorCode::PmmRegionNotManaged => {}
                Err(err) => {
                    panic!("[kmain] Failed to reserve {:#x}: {}", region.address, err);
                }
            }
        }

        tree.dump();
        pmm().dump();

        println_k!("[kmain] Kernel loop reached.");
        loop {
            unsafe {
                asm!("wfi");
            }
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println_k!("{}", info);
        abort();
    }

    #[no_mangle]
    extern "C" fn abort() -> ! {
        loop {
            unsafe {
                asm!("wfi");
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
