//! Shared fixtures: a scripted guest program and a translator that
//! embeds dispatcher callouts at generation time, the way the
//! production translator does.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use dba_core::tb::{
    tb_exit_encode, TranslationBlock, CF_COUNT_MASK, CF_USE_ICOUNT, INVALID_PAGE,
    TARGET_PAGE_MASK, TB_EXIT_ICOUNT_EXPIRED, TB_EXIT_IDX0, TB_EXIT_REQUESTED,
};
use dba_core::{CpuClass, CpuState, TbId, X86_CLASS};
use dba_exec::{cpu_loop_exit, ExecContext, GeneratedTb, IcountConfig, Translator};

/// Guest ops understood by the scripted translator.
#[derive(Debug, Clone, Copy)]
pub enum GuestOp {
    /// Fall through to the next instruction.
    Step,
    /// Unconditional branch; ends the block.
    Jmp(u64),
    /// Raise a guest-ISA exception from a helper; ends the block.
    Raise(i32),
    /// Leave the loop with a cooperative exit code; ends the block.
    Exit(i32),
}

pub const INSN_LEN: u64 = 4;

/// A guest program: ops keyed by pc.
pub struct TestProgram {
    ops: BTreeMap<u64, GuestOp>,
}

impl TestProgram {
    pub fn new(start: u64, ops: &[GuestOp]) -> Self {
        let mut program = Self {
            ops: BTreeMap::new(),
        };
        program.insert(start, ops);
        program
    }

    /// Lay out another run of instructions, for programs spanning
    /// several code regions.
    pub fn insert(&mut self, start: u64, ops: &[GuestOp]) {
        for (i, op) in ops.iter().enumerate() {
            self.ops.insert(start + i as u64 * INSN_LEN, *op);
        }
    }

    fn op_at(&self, pc: u64) -> GuestOp {
        *self
            .ops
            .get(&pc)
            .unwrap_or_else(|| panic!("no guest op at {pc:#x}"))
    }
}

/// Everything the "generated host code" of one block bakes in at
/// translation time.
struct BlockCode {
    entry: u64,
    insns: Vec<u64>,
    last_pc: u64,
    terminal: Option<GuestOp>,
    next_pc: u64,
    hook_pcs: Vec<u64>,
    trace_insn: bool,
    trace_block: bool,
}

/// Scripted translator over a [`TestProgram`]. Consults the global
/// hook and tracer registries while generating, exactly as the
/// production translator contract requires.
pub struct TestTranslator {
    pub program: TestProgram,
    blocks: Vec<BlockCode>,
    pub max_block_insns: u32,
    /// Report code-region pressure exactly once.
    pub code_full_once: Cell<bool>,
    /// Total guest instructions executed.
    pub executed: u64,
    /// Number of blocks generated.
    pub gen_count: u64,
    pub tlb_flushes: u64,
    pub freed: u64,
}

impl TestTranslator {
    pub fn new(program: TestProgram) -> Self {
        Self {
            program,
            blocks: Vec::new(),
            max_block_insns: 8,
            code_full_once: Cell::new(false),
            executed: 0,
            gen_count: 0,
            tlb_flushes: 0,
            freed: 0,
        }
    }
}

impl Translator for TestTranslator {
    fn tb_gen_code(
        &mut self,
        _cpu: &mut CpuState,
        pc: u64,
        cs_base: u64,
        flags: u32,
        cflags: u32,
    ) -> GeneratedTb {
        let limit = {
            let bound = cflags & CF_COUNT_MASK;
            if bound == 0 {
                self.max_block_insns
            } else {
                bound
            }
        };

        let mut insns = Vec::new();
        let mut hook_pcs = Vec::new();
        let mut terminal = None;
        let mut cur = pc;
        let mut last_pc = pc;
        loop {
            let op = self.program.op_at(cur);
            insns.push(cur);
            if dba_obhook::context().implanted_at(cur) {
                hook_pcs.push(cur);
            }
            last_pc = cur;
            match op {
                GuestOp::Step => {
                    cur += INSN_LEN;
                    if insns.len() as u32 >= limit {
                        break;
                    }
                }
                other => {
                    terminal = Some(other);
                    break;
                }
            }
        }
        let next_pc = match terminal {
            Some(GuestOp::Jmp(target)) => target,
            _ => last_pc + INSN_LEN,
        };
        let trace_insn = dba_tracer::context().instruction_callouts_needed(pc);
        let trace_block = dba_tracer::context().block_callouts_needed(pc);

        let mut tb = TranslationBlock::new(pc, cs_base, flags, cflags);
        tb.size = insns.len() as u32 * INSN_LEN as u32;
        tb.icount = insns.len() as u16;
        tb.tc_ptr = self.blocks.len();
        // identity guest-physical mapping
        tb.phys_pc = pc;
        tb.page_addr[0] = pc & TARGET_PAGE_MASK;
        tb.page_addr[1] = if (last_pc & TARGET_PAGE_MASK) != (pc & TARGET_PAGE_MASK) {
            last_pc & TARGET_PAGE_MASK
        } else {
            INVALID_PAGE
        };

        self.blocks.push(BlockCode {
            entry: pc,
            insns,
            last_pc,
            terminal,
            next_pc,
            hook_pcs,
            trace_insn,
            trace_block,
        });
        self.gen_count += 1;

        GeneratedTb {
            tb,
            cache_flushed: false,
        }
    }

    fn tb_exec(&mut self, cpu: &mut CpuState, tb_id: TbId, tb: &TranslationBlock) -> usize {
        // the prologue polls the stop request before the first insn
        if cpu.exit_requested() {
            return tb_exit_encode(tb_id, TB_EXIT_REQUESTED);
        }
        let icount_len = self.blocks[tb.tc_ptr].insns.len() as i32;
        if tb.cflags & CF_USE_ICOUNT != 0 {
            if cpu.icount_decr < icount_len {
                return tb_exit_encode(tb_id, TB_EXIT_ICOUNT_EXPIRED);
            }
            cpu.icount_decr -= icount_len;
        }

        let code = &self.blocks[tb.tc_ptr];
        let (entry, last_pc, next_pc, terminal) =
            (code.entry, code.last_pc, code.next_pc, code.terminal);
        let insns = code.insns.clone();
        let hook_pcs = code.hook_pcs.clone();
        let (trace_insn, trace_block) = (code.trace_insn, code.trace_block);

        if trace_block {
            dba_tracer::dispatch_block(cpu, entry, last_pc);
        }
        for pc in insns {
            cpu.arch.pc = pc;
            if hook_pcs.contains(&pc) {
                dba_obhook::dispatch(cpu);
            }
            if trace_insn {
                dba_tracer::dispatch_instruction(cpu, pc);
            }
            self.executed += 1;
        }

        match terminal {
            None => {
                cpu.arch.pc = next_pc;
                tb_exit_encode(tb_id, TB_EXIT_IDX0)
            }
            Some(GuestOp::Jmp(target)) => {
                cpu.arch.pc = target;
                tb_exit_encode(tb_id, TB_EXIT_IDX0)
            }
            Some(GuestOp::Raise(excp)) => {
                cpu.exception_index = excp;
                cpu_loop_exit(cpu);
            }
            Some(GuestOp::Exit(code)) => {
                cpu.arch.pc = next_pc;
                cpu.exception_index = code;
                cpu_loop_exit(cpu);
            }
            Some(GuestOp::Step) => unreachable!("Step cannot terminate a block"),
        }
    }

    fn get_page_addr_code(&mut self, _cpu: &mut CpuState, pc: u64) -> u64 {
        pc
    }

    fn tlb_flush(&mut self, _cpu: &mut CpuState, _global: bool) {
        self.tlb_flushes += 1;
    }

    fn code_cache_nearly_full(&self) -> bool {
        self.code_full_once.replace(false)
    }

    fn tb_freed(&mut self, _tb: &TranslationBlock) {
        self.freed += 1;
    }
}

/// Serializes tests that touch the process-wide registries and resets
/// them to a pristine state.
static REGISTRY_LOCK: Mutex<()> = Mutex::new(());

pub fn setup() -> MutexGuard<'static, ()> {
    let guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    dba_core::exit_flag::reset();
    dba_obhook::context().shutdown();
    dba_tracer::context().clean_up();
    dba_obhook::context().clear_pending_hooks();
    dba_tracer::context().clear_switch_pending();
    guard
}

pub fn new_cpu(entry: u64, asid: u64) -> CpuState {
    let mut cpu = CpuState::new(&X86_CLASS);
    cpu.arch.pc = entry;
    cpu.arch.cr3 = asid;
    cpu
}

pub fn new_cpu_with_class(entry: u64, asid: u64, class: &'static CpuClass) -> CpuState {
    let mut cpu = CpuState::new(class);
    cpu.arch.pc = entry;
    cpu.arch.cr3 = asid;
    cpu
}

pub fn new_ctx(program: TestProgram) -> ExecContext<TestTranslator> {
    ExecContext::new(TestTranslator::new(program))
}

pub fn new_icount_ctx(program: TestProgram) -> ExecContext<TestTranslator> {
    ExecContext::with_icount(
        TestTranslator::new(program),
        IcountConfig {
            enabled: true,
            align: false,
            shift: 0,
        },
    )
}
