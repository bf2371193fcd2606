/*!
Machine facade: the checker's window onto the guest CPU.

Purpose
- Define the `Cpu` trait behind which the actual instruction simulator hides:
  register file access, physical memory, interrupt/keyboard event injection,
  and opaque whole-machine snapshots.
- Provide the guest-visible services the checker layers on top: virtual
  memory reads/writes via a two-level page walk, null-terminated string
  reads, opcode classification, and forced transaction aborts.

Guarantees
- Reads never trap. An unmapped virtual address reads as zero; callers that
  care about the distinction use the `try_` variants, which report the
  translation failure. Writes to unmapped addresses are dropped and return
  false. The checker must keep going while the guest is still in its
  pre-paging window.
*/

use crate::opts::GuestLayout;

pub const WORD_SIZE: u32 = 4;
pub const PAGE_SIZE: u32 = 4096;

pub const OPCODE_HLT: u8 = 0xf4;
const OPCODE_LOCK_PREFIX: u8 = 0xf0;

pub const CR0_PG: u32 = 1 << 31;

/// Architected HTM status values (EAX after an aborted transaction).
pub const XBEGIN_STARTED: u32 = !0;
pub const XABORT_EXPLICIT: u32 = 1 << 0;
pub const XABORT_RETRY: u32 = 1 << 1;
pub const XABORT_CONFLICT: u32 = 1 << 2;
pub const XABORT_CAPACITY: u32 = 1 << 3;

/// General-purpose registers the checker inspects or patches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Esp,
    Ebp,
    Eip,
}

/// Keyboard keys the checker can inject to drive guest test menus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Enter,
    Space,
    Minus,
    LeftShift,
    /// Lowercase letter or digit, passed through to the backend's scan table.
    Alnum(char),
}

/// The black-box instruction simulator.
///
/// The simulator owns all guest state; the checker only ever observes and
/// patches it through this trait. `Snapshot` is an opaque whole-machine
/// checkpoint used by the save/restore engine; the choice tree stores these
/// but never looks inside.
pub trait Cpu {
    type Snapshot: Clone;

    fn reg(&self, reg: Reg) -> u32;
    fn set_reg(&mut self, reg: Reg, val: u32);

    fn cr0(&self) -> u32;
    fn cr3(&self) -> u32;

    /// Physical memory read of `width` bytes (1, 2, or 4), little-endian.
    fn read_phys(&self, addr: u32, width: u32) -> u32;
    fn write_phys(&mut self, addr: u32, val: u32, width: u32);

    /// Raise/lower the timer IRQ line. Raising pends an async event which the
    /// backend delivers at the next instruction boundary.
    fn raise_timer_irq(&mut self);
    fn lower_timer_irq(&mut self);
    /// Whether an unmasked async event is pending delivery.
    fn pending_async_event(&self) -> bool;
    /// Force delivery of the pending event now (modifies eip). Returns true
    /// if the backend wants its outer cpu loop broken, which the checker
    /// never expects.
    fn deliver_pending_interrupt(&mut self) -> bool;
    /// Acknowledge the timer interrupt at the PIC (EOI).
    fn ack_timer_interrupt(&mut self);

    /// Generate one keyboard scancode event (press or release).
    fn key_event(&mut self, key: Key, released: bool);

    fn take_snapshot(&self) -> Self::Snapshot;
    fn restore_snapshot(&mut self, snapshot: &Self::Snapshot);
}

/// Entry points this backend does not implement.
#[derive(Debug, thiserror::Error)]
#[error("not supported by this backend: {0}")]
pub struct Unsupported(pub &'static str);

// ---------------------------------------------------------------------
// Virtual memory
// ---------------------------------------------------------------------

/// Walk the guest's two-level page table for `addr`, honoring CR3.
///
/// On guests whose kernel half is known to be direct-mapped the walk is
/// skipped for kernel addresses; user addresses cannot be translated at all
/// while paging is still off. Absent PDEs/PTEs (or poisoned ones, when the
/// guest publishes a poison pattern) fail the translation.
pub fn mem_translate<C: Cpu>(cpu: &C, layout: &GuestLayout, addr: u32) -> Option<u32> {
    if layout.kernel_direct_mapped {
        if layout.kernel_memory(addr) {
            return Some(addr);
        } else if (cpu.cr0() & CR0_PG) == 0 {
            // Paging off; a user address has no mapping yet.
            return None;
        }
    } else {
        // The kernel itself lives above the paging boundary here, so the
        // checker must not be entered before the guest enables paging.
        assert!(
            (cpu.cr0() & CR0_PG) != 0,
            "guest expected to enable paging before checker entrypoint"
        );
    }

    let upper = addr >> 22;
    let lower = (addr >> 12) & 1023;
    let offset = addr & (PAGE_SIZE - 1);
    let pde_addr = cpu.cr3().wrapping_add(WORD_SIZE * upper);
    let pde = cpu.read_phys(pde_addr, WORD_SIZE);
    if (pde & 0x1) == 0 || layout.pde_pte_poison == Some(pde) {
        return None;
    }
    let pte_addr = (pde & !(PAGE_SIZE - 1)).wrapping_add(WORD_SIZE * lower);
    let pte = cpu.read_phys(pte_addr, WORD_SIZE);
    if (pte & 0x1) == 0 || layout.pde_pte_poison == Some(pte) {
        return None;
    }
    Some((pte & !(PAGE_SIZE - 1)) + offset)
}

/// Virtual read; `None` on translation failure.
pub fn try_read_mem<C: Cpu>(cpu: &C, layout: &GuestLayout, addr: u32, width: u32) -> Option<u32> {
    mem_translate(cpu, layout, addr).map(|phys| cpu.read_phys(phys, width))
}

/// Virtual read; zero when the address cannot be translated.
pub fn read_mem<C: Cpu>(cpu: &C, layout: &GuestLayout, addr: u32, width: u32) -> u32 {
    try_read_mem(cpu, layout, addr, width).unwrap_or(0)
}

/// Virtual write; returns false (dropping the store) on translation failure.
pub fn write_mem<C: Cpu>(
    cpu: &mut C,
    layout: &GuestLayout,
    addr: u32,
    val: u32,
    width: u32,
) -> bool {
    match mem_translate(cpu, layout, addr) {
        Some(phys) => {
            cpu.write_phys(phys, val, width);
            true
        }
        None => false,
    }
}

pub fn read_byte<C: Cpu>(cpu: &C, layout: &GuestLayout, addr: u32) -> u8 {
    read_mem(cpu, layout, addr, 1) as u8
}

/// Read a null-terminated guest string at a virtual address.
pub fn read_string<C: Cpu>(cpu: &C, layout: &GuestLayout, addr: u32) -> String {
    let mut buf = Vec::new();
    let mut offset = 0;
    loop {
        let b = read_byte(cpu, layout, addr.wrapping_add(offset));
        if b == 0 {
            break;
        }
        buf.push(b);
        offset += 1;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Read the `offset`th word up the guest stack (offset 0 = top of stack).
pub fn read_stack<C: Cpu>(cpu: &C, layout: &GuestLayout, offset: u32) -> u32 {
    read_mem(
        cpu,
        layout,
        cpu.reg(Reg::Esp).wrapping_add(offset * WORD_SIZE),
        WORD_SIZE,
    )
}

// ---------------------------------------------------------------------
// Opcode classification
// ---------------------------------------------------------------------

/// Classify up to 3 opcode bytes as an atomic swap (xchg/cmpxchg, with an
/// optional LOCK prefix).
pub fn opcodes_are_atomic_swap(ops: &[u8; 3]) -> bool {
    let mut offset = 0;
    if ops[offset] == OPCODE_LOCK_PREFIX {
        offset += 1;
    }
    if ops[offset] == 0x86 || ops[offset] == 0x87 {
        /* xchg */
        true
    } else if ops[offset] == 0x0f {
        offset += 1;
        /* cmpxchg; xadd (0F C0/C1) deliberately not classified */
        ops[offset] == 0xb0 || ops[offset] == 0xb1
    } else {
        false
    }
}

pub fn instruction_is_atomic_swap<C: Cpu>(cpu: &C, layout: &GuestLayout, eip: u32) -> bool {
    let ops = [
        read_byte(cpu, layout, eip),
        read_byte(cpu, layout, eip.wrapping_add(1)),
        read_byte(cpu, layout, eip.wrapping_add(2)),
    ];
    opcodes_are_atomic_swap(&ops)
}

/// The three instruction shapes the scheduler cares about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsnClass {
    AtomicSwap,
    Hlt,
    Other,
}

pub fn classify_instruction<C: Cpu>(cpu: &C, layout: &GuestLayout, eip: u32) -> InsnClass {
    if read_byte(cpu, layout, eip) == OPCODE_HLT {
        InsnClass::Hlt
    } else if instruction_is_atomic_swap(cpu, layout, eip) {
        InsnClass::AtomicSwap
    } else {
        InsnClass::Other
    }
}

// ---------------------------------------------------------------------
// Event injection
// ---------------------------------------------------------------------

/// Pend a timer interrupt for delivery at the next instruction boundary.
pub fn cause_timer_interrupt<C: Cpu>(cpu: &mut C) {
    cpu.lower_timer_irq();
    cpu.raise_timer_irq();
    assert!(cpu.pending_async_event());
}

/// Inject a timer interrupt and force its delivery before the next guest
/// instruction. Returns the handler entrypoint the guest landed on.
pub fn cause_timer_interrupt_immediately<C: Cpu>(cpu: &mut C, layout: &GuestLayout) -> u32 {
    cpu.lower_timer_irq();
    cpu.raise_timer_irq();
    assert!(cpu.pending_async_event());
    let needs_break = cpu.deliver_pending_interrupt();
    assert!(!needs_break, "no need to break out of cpu loop");
    assert!(!cpu.pending_async_event());
    assert_eq!(
        cpu.reg(Reg::Eip),
        layout.timer_entry,
        "timer delivery landed somewhere other than the handler"
    );
    layout.timer_entry
}

/// Discard a just-delivered timer interrupt: EOI the PIC and skip the guest
/// straight to the end of its timer wrapper.
pub fn avoid_timer_interrupt_immediately<C: Cpu>(cpu: &mut C, layout: &GuestLayout) -> u32 {
    cpu.ack_timer_interrupt();
    cpu.set_reg(Reg::Eip, layout.timer_wrap_end);
    layout.timer_wrap_end
}

fn do_scan<C: Cpu>(cpu: &mut C, key: Key, shift: bool) {
    if shift {
        cpu.key_event(Key::LeftShift, false);
    }
    cpu.key_event(key, false);
    cpu.key_event(key, true);
    if shift {
        cpu.key_event(Key::LeftShift, true);
    }
}

/// Type one character on the guest keyboard.
pub fn cause_keypress<C: Cpu>(cpu: &mut C, ch: char) {
    match ch {
        '\n' => do_scan(cpu, Key::Enter, false),
        '_' => do_scan(cpu, Key::Minus, true),
        ' ' => do_scan(cpu, Key::Space, false),
        'a'..='z' | '0'..='9' => do_scan(cpu, Key::Alnum(ch), false),
        _ => panic!("keypress '{ch}' not implemented"),
    }
}

/// Force the guest's current transaction onto its abort path.
///
/// Sets the architected status register and branches eip past the xbegin to
/// its failure handler. Because of the 1-instruction delay on timer
/// interrupts after a preemption point, the failure is injected right after
/// the frame push at the top of the guest's `_xbegin`.
pub fn cause_transaction_failure<C: Cpu>(cpu: &mut C, layout: &GuestLayout, status: u32) -> u32 {
    assert_ne!(status, XBEGIN_STARTED, "cannot inject a successful start");
    let xbegin = layout
        .htm_xbegin
        .expect("transaction abort without an HTM-aware guest layout");
    let xbegin_end = layout
        .htm_xbegin_end
        .expect("transaction abort without an HTM-aware guest layout");
    cpu.set_reg(Reg::Eax, status);
    assert_eq!(cpu.reg(Reg::Eip), xbegin + 1);
    cpu.set_reg(Reg::Eip, xbegin_end - 1);
    xbegin_end - 1
}

/// Whether guest interrupts are currently enabled. Unimplemented for this
/// backend; surfaced as an error rather than a wrong answer.
pub fn interrupts_enabled<C: Cpu>(_cpu: &C) -> Result<bool, Unsupported> {
    Err(Unsupported("interrupts_enabled"))
}

/// Delay the in-flight instruction by one cycle. Unimplemented for this
/// backend.
pub fn delay_instruction<C: Cpu>(_cpu: &mut C) -> Result<u32, Unsupported> {
    Err(Unsupported("delay_instruction"))
}
