//! Shared test utilities: a reference `Cpu` implementation and checker
//! fixtures.
//!
//! `TestCpu` models just enough of a guest machine for the unit tests:
//! a flat physical memory, a register file, two-level page tables the
//! tests can populate, pendable timer interrupts, and whole-machine
//! snapshots by `Clone`. It deliberately implements the same "reads never
//! trap" contract the real facade promises.

#![allow(dead_code)]

use crate::machine::{Cpu, Key, Reg, CR0_PG, WORD_SIZE};
use crate::opts::{GuestLayout, Options};
use crate::pp::PpRegistry;
use crate::sched::ThreadId;
use crate::Checker;

/// Flat physical memory size; addresses beyond it read zero, writes drop.
const PHYS_MEM_BYTES: usize = 1 << 20;
/// Where the fixture's page directory lives.
const PAGE_DIR: u32 = 0x0008_0000;
/// First physical frame handed out for page tables.
const FIRST_PAGE_TABLE: u32 = 0x0008_1000;

#[derive(Clone, Debug)]
pub struct TestCpu {
    regs: [u32; 9],
    cr0: u32,
    cr3: u32,
    mem: Vec<u8>,
    next_page_table: u32,
    timer_irq: bool,
    pending_event: bool,
    timer_entry: u32,
    /// Scancode log, for asserting on injected keypresses.
    pub key_events: Vec<(Key, bool)>,
}

impl TestCpu {
    pub fn new() -> Self {
        TestCpu {
            regs: [0; 9],
            cr0: 0,
            cr3: PAGE_DIR,
            mem: vec![0; PHYS_MEM_BYTES],
            next_page_table: FIRST_PAGE_TABLE,
            timer_irq: false,
            pending_event: false,
            timer_entry: GuestLayout::pebbles().timer_entry,
            key_events: Vec::new(),
        }
    }

    pub fn set_cr0(&mut self, val: u32) {
        self.cr0 = val;
    }

    pub fn set_cr3(&mut self, val: u32) {
        self.cr3 = val;
    }

    /// Map one 4 KiB page into the fixture's page tables (allocating a
    /// page table on demand) and turn paging on.
    pub fn map_page(&mut self, vaddr: u32, paddr: u32) {
        assert_eq!(vaddr & 0xfff, 0, "page-align the virtual address");
        let upper = vaddr >> 22;
        let lower = (vaddr >> 12) & 1023;
        let pde_addr = self.cr3 + WORD_SIZE * upper;
        let pde = self.read_phys(pde_addr, WORD_SIZE);
        let table = if pde & 1 == 0 {
            let table = self.next_page_table;
            self.next_page_table += 0x1000;
            self.write_phys(pde_addr, table | 1, WORD_SIZE);
            table
        } else {
            pde & !0xfff
        };
        self.write_phys(table + WORD_SIZE * lower, (paddr & !0xfff) | 1, WORD_SIZE);
        self.cr0 |= CR0_PG;
    }

    fn reg_index(reg: Reg) -> usize {
        match reg {
            Reg::Eax => 0,
            Reg::Ebx => 1,
            Reg::Ecx => 2,
            Reg::Edx => 3,
            Reg::Esi => 4,
            Reg::Edi => 5,
            Reg::Esp => 6,
            Reg::Ebp => 7,
            Reg::Eip => 8,
        }
    }
}

impl Default for TestCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for TestCpu {
    type Snapshot = TestCpu;

    fn reg(&self, reg: Reg) -> u32 {
        self.regs[Self::reg_index(reg)]
    }

    fn set_reg(&mut self, reg: Reg, val: u32) {
        self.regs[Self::reg_index(reg)] = val;
    }

    fn cr0(&self) -> u32 {
        self.cr0
    }

    fn cr3(&self) -> u32 {
        self.cr3
    }

    fn read_phys(&self, addr: u32, width: u32) -> u32 {
        let mut val = 0u32;
        for i in 0..width {
            let byte = self
                .mem
                .get(addr.wrapping_add(i) as usize)
                .copied()
                .unwrap_or(0);
            val |= u32::from(byte) << (8 * i);
        }
        val
    }

    fn write_phys(&mut self, addr: u32, val: u32, width: u32) {
        for i in 0..width {
            if let Some(slot) = self.mem.get_mut(addr.wrapping_add(i) as usize) {
                *slot = (val >> (8 * i)) as u8;
            }
        }
    }

    fn raise_timer_irq(&mut self) {
        self.timer_irq = true;
        self.pending_event = true;
    }

    fn lower_timer_irq(&mut self) {
        self.timer_irq = false;
    }

    fn pending_async_event(&self) -> bool {
        self.pending_event
    }

    fn deliver_pending_interrupt(&mut self) -> bool {
        assert!(self.pending_event, "no event to deliver");
        self.pending_event = false;
        self.regs[Self::reg_index(Reg::Eip)] = self.timer_entry;
        false
    }

    fn ack_timer_interrupt(&mut self) {
        self.timer_irq = false;
        self.pending_event = false;
    }

    fn key_event(&mut self, key: Key, released: bool) {
        self.key_events.push((key, released));
    }

    fn take_snapshot(&self) -> TestCpu {
        self.clone()
    }

    fn restore_snapshot(&mut self, snapshot: &TestCpu) {
        *self = snapshot.clone();
    }
}

/// A checker over a `TestCpu` with the given threads on the runqueue; the
/// first tid is current.
pub fn checker_fixture(tids: &[ThreadId]) -> (TestCpu, Checker<TestCpu>) {
    let mut chk = Checker::new(
        Options::default(),
        GuestLayout::pebbles(),
        PpRegistry::default(),
    );
    for &tid in tids {
        chk.sched.create_agent(tid);
    }
    chk.sched.cur_agent = tids.first().copied().unwrap_or(0);
    (TestCpu::new(), chk)
}

/// Mark the test program as underway (population grew past its start).
pub fn start_test(chk: &mut Checker<TestCpu>) {
    chk.test.test_ever_caused = true;
    chk.test.start_population = 1;
}
