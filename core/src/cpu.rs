//! vCPU state and the per-arch operation table.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::tb::{JumpCache, TbId, TranslationBlock};

/// No exception pending.
pub const EXCP_NONE: i32 = -1;
/// Cooperative exit codes. Everything at or above `EXCP_INTERRUPT` is
/// an exit request from the execution loop rather than a guest-ISA
/// exception.
pub const EXCP_INTERRUPT: i32 = 0x10000;
pub const EXCP_HLT: i32 = 0x10001;
pub const EXCP_DEBUG: i32 = 0x10002;
pub const EXCP_HALTED: i32 = 0x10003;

/// Single-step mode bits.
pub const SSTEP_ENABLE: u32 = 0x1;
/// Do not deliver external interrupts while stepping.
pub const SSTEP_NOIRQ: u32 = 0x2;
/// Do not fire timers while stepping.
pub const SSTEP_NOTIMER: u32 = 0x4;

bitflags::bitflags! {
    /// OR-able interrupt request bits exchanged between the execution
    /// loop, the per-arch interrupt processor and asynchronous
    /// requesters.
    pub struct InterruptRequest: u32 {
        /// External hardware interrupt pending.
        const HARD   = 1 << 1;
        /// Force the dispatch loop to look up a fresh TB instead of
        /// chaining; raised when the program flow was changed behind
        /// the translated code's back.
        const EXITTB = 1 << 2;
        const TIMER  = 1 << 3;
        const HALT   = 1 << 5;
        const DEBUG  = 1 << 7;
        const INIT   = 1 << 10;
        const RESET  = 1 << 11;
        /// External sources suppressed while single-stepping with
        /// `SSTEP_NOIRQ`.
        const SSTEP_MASK = Self::HARD.bits | Self::TIMER.bits;
    }
}

/// The cross-thread-visible part of a vCPU. Other threads obtain a
/// handle to this through the current-cpu publication and poke the
/// bits with release ordering; the execution loop reads them with
/// acquire ordering.
#[derive(Default)]
pub struct IntrState {
    pub interrupt_request: AtomicU32,
    pub exit_request: AtomicBool,
}

/// A guest watchpoint with its hit latch.
#[derive(Debug, Clone, Default)]
pub struct Watchpoint {
    pub vaddr: u64,
    pub len: u64,
    pub flags: u32,
    pub hit: bool,
}

/// x86 register indices into [`X86State::regs`].
pub const R_EAX: usize = 0;
pub const R_ECX: usize = 1;
pub const R_EDX: usize = 2;
pub const R_EBX: usize = 3;
pub const R_ESP: usize = 4;
pub const R_EBP: usize = 5;
pub const R_ESI: usize = 6;
pub const R_EDI: usize = 7;

/// Architectural register file consumed by translation and by hook and
/// tracer callbacks. The CR3 value doubles as the address-space
/// identifier of the process the vCPU currently runs.
#[derive(Debug, Clone, Default)]
pub struct X86State {
    pub pc: u64,
    pub cs_base: u64,
    pub cr3: u64,
    /// Mode flags that affect translation (privilege level, code size).
    pub flags: u32,
    pub regs: [u64; 16],
}

/// Per-arch operation table, one static instance per supported target.
///
/// The execution loop is arch-agnostic; everything ISA-specific goes
/// through these entries.
pub struct CpuClass {
    pub cpu_exec_enter: fn(&mut CpuState),
    pub cpu_exec_exit: fn(&mut CpuState),
    pub cpu_has_work: fn(&CpuState) -> bool,
    /// Deliver the pending guest-ISA exception in `exception_index`.
    pub do_interrupt: fn(&mut CpuState),
    /// Service pending interrupt request bits. Returns true when an
    /// interrupt was handled and a fresh TB lookup is required; may
    /// also leave the loop through `cpu_loop_exit`.
    pub cpu_exec_interrupt: fn(&mut CpuState, InterruptRequest) -> bool,
    pub debug_excp_handler: fn(&mut CpuState),
    /// INIT cold path; the loop reports `EXCP_HALTED` afterwards.
    pub do_cpu_init: fn(&mut CpuState),
    pub cpu_reset: fn(&mut CpuState),
    pub set_pc: fn(&mut CpuState, u64),
    /// Restore arch state from a TB that was entered but never started
    /// executing. Falls back to `set_pc(tb.pc)` when absent.
    pub synchronize_from_tb: Option<fn(&mut CpuState, &TranslationBlock)>,
}

fn x86_nop(_cpu: &mut CpuState) {}

fn x86_has_work(cpu: &CpuState) -> bool {
    !cpu.interrupt_request().is_empty()
}

fn x86_exec_interrupt(_cpu: &mut CpuState, _req: InterruptRequest) -> bool {
    false
}

fn x86_do_cpu_init(cpu: &mut CpuState) {
    cpu.clear_interrupt(InterruptRequest::INIT);
    (cpu.class.cpu_reset)(cpu);
}

fn x86_reset(cpu: &mut CpuState) {
    cpu.arch = X86State::default();
    cpu.exception_index = EXCP_NONE;
}

fn x86_set_pc(cpu: &mut CpuState, pc: u64) {
    cpu.arch.pc = pc;
}

/// Baseline x86 operation table. Interrupt delivery beyond the generic
/// loop-level conversions is left inert; embedders install their own
/// table for full ISA behavior.
pub const X86_CLASS: CpuClass = CpuClass {
    cpu_exec_enter: x86_nop,
    cpu_exec_exit: x86_nop,
    cpu_has_work: x86_has_work,
    do_interrupt: x86_nop,
    cpu_exec_interrupt: x86_exec_interrupt,
    debug_excp_handler: x86_nop,
    do_cpu_init: x86_do_cpu_init,
    cpu_reset: x86_reset,
    set_pc: x86_set_pc,
    synchronize_from_tb: None,
};

/// State of a single vCPU. Exactly one is active at a time under the
/// big-lock discipline; asynchronous requesters reach it only through
/// the shared [`IntrState`] handle and the process-wide exit flag.
pub struct CpuState {
    pub class: &'static CpuClass,
    pub arch: X86State,

    pub halted: bool,
    /// Pending exception, `EXCP_NONE` when clear. Values at or above
    /// `EXCP_INTERRUPT` make `cpu_exec` return; smaller non-negative
    /// values are delivered through `do_interrupt`.
    pub exception_index: i32,
    pub singlestep_enabled: u32,
    pub can_do_io: bool,

    /// Remaining instruction budget of the current icount slice; the
    /// low 16 bits are what the translated code decrements.
    pub icount_decr: i32,
    /// Tokens not yet moved into the decrementer.
    pub icount_extra: i64,

    /// TB currently executing on this vCPU, if any.
    pub current_tb: Option<TbId>,
    /// Per-vCPU virtual-PC fast lookup, cleared on every cache flush.
    pub tb_jmp_cache: JumpCache,

    pub watchpoints: Vec<Watchpoint>,
    /// Index of the watchpoint whose hit is being reported, if any.
    pub watchpoint_hit: Option<usize>,

    pub intr: Arc<IntrState>,
}

impl CpuState {
    pub fn new(class: &'static CpuClass) -> Self {
        Self {
            class,
            arch: X86State::default(),
            halted: false,
            exception_index: EXCP_NONE,
            singlestep_enabled: 0,
            can_do_io: true,
            icount_decr: 0,
            icount_extra: 0,
            current_tb: None,
            tb_jmp_cache: JumpCache::new(),
            watchpoints: Vec::new(),
            watchpoint_hit: None,
            intr: Arc::new(IntrState::default()),
        }
    }

    /// The subset of CPU state that discriminates translated blocks:
    /// (pc, cs_base, flags).
    pub fn tb_cpu_state(&self) -> (u64, u64, u32) {
        (self.arch.pc, self.arch.cs_base, self.arch.flags)
    }

    /// Address-space identifier of the running process (CR3).
    pub fn asid(&self) -> u64 {
        self.arch.cr3
    }

    pub fn interrupt_request(&self) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(self.intr.interrupt_request.load(Ordering::Acquire))
    }

    pub fn set_interrupt(&self, mask: InterruptRequest) {
        self.intr
            .interrupt_request
            .fetch_or(mask.bits(), Ordering::Release);
    }

    pub fn clear_interrupt(&self, mask: InterruptRequest) {
        self.intr
            .interrupt_request
            .fetch_and(!mask.bits(), Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.intr.exit_request.load(Ordering::Acquire)
    }

    pub fn set_exit_request(&self) {
        self.intr.exit_request.store(true, Ordering::Release);
    }

    pub fn clear_exit_request(&self) {
        self.intr.exit_request.store(false, Ordering::Release);
    }

    /// Low 16 bits of the icount decrementer.
    pub fn icount_budget(&self) -> u16 {
        (self.icount_decr as u32 & 0xffff) as u16
    }

    /// Load a fresh slice into the decrementer, clearing any carry.
    pub fn set_icount_budget(&mut self, insns: u16) {
        self.icount_decr = insns as i32;
    }
}
