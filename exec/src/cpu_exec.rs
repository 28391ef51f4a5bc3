//! Main vCPU execution loop.
//!
//! One activation per `cpu_exec` call: publish the vCPU, then loop
//! over pre-dispatch checks, TB acquisition under the cache lock and
//! TB execution, until a cooperative exit code is pending. Components
//! nested anywhere below the loop abort the current block with
//! [`cpu_loop_exit`]; the outer frame catches the unwind, repairs the
//! lock state and resumes at the pending-exception check.

use std::cell::Cell;
use std::cmp;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{compiler_fence, fence, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use dba_core::tb::{
    tb_exit_reason, tb_exit_tb, tb_phys_hash_func, CF_COUNT_MASK, CF_NOCACHE, CF_USE_ICOUNT,
    INVALID_PAGE, TARGET_PAGE_MASK, TARGET_PAGE_SIZE, TB_EXIT_ICOUNT_EXPIRED, TB_EXIT_IDX1,
    TB_EXIT_REQUESTED,
};
use dba_core::{
    exit_flag, CpuState, IntrState, InterruptRequest, TbId, EXCP_DEBUG, EXCP_HALTED, EXCP_HLT,
    EXCP_INTERRUPT, EXCP_NONE, SSTEP_NOIRQ,
};

use crate::clock::SyncClocks;
use crate::{ExecContext, Translator};

/// Unwind payload of the non-local return out of translated code.
pub struct CpuLoopExit;

/// Publication slot for the running vCPU's async-request state. Other
/// threads use it to target `exit_request` and `interrupt_request`;
/// anything sent before the slot is filled must go through the
/// process-wide exit flag instead.
static CURRENT_CPU: Lazy<Mutex<Option<Arc<IntrState>>>> = Lazy::new(|| Mutex::new(None));

/// Async-request handle of the vCPU currently inside `cpu_exec`, if
/// any.
pub fn current_cpu_intr() -> Option<Arc<IntrState>> {
    CURRENT_CPU.lock().unwrap().clone()
}

fn publish_current_cpu(cpu: &CpuState) {
    *CURRENT_CPU.lock().unwrap() = Some(cpu.intr.clone());
}

fn clear_current_cpu() {
    *CURRENT_CPU.lock().unwrap() = None;
}

/// Abort the TB currently executing and re-enter the loop head.
/// Callable from helpers and callbacks running inside a block.
pub fn cpu_loop_exit(cpu: &mut CpuState) -> ! {
    cpu.current_tb = None;
    panic::panic_any(CpuLoopExit);
}

/// Cancel the current TB after a host fault so the MMU can retry the
/// access; a real guest fault is raised as an exception on the next
/// iteration.
pub fn cpu_resume_from_signal(cpu: &mut CpuState) -> ! {
    cpu.exception_index = EXCP_NONE;
    panic::panic_any(CpuLoopExit);
}

/// Forwarded from the MMU/address-space collaborator after its mapping
/// rotation; all that is left to do here is re-arm the TLB.
pub fn cpu_reload_memory_map<T: Translator>(ctx: &mut ExecContext<T>, cpu: &mut CpuState) {
    ctx.translator.tlb_flush(cpu, true);
}

fn cpu_handle_debug_exception(cpu: &mut CpuState) {
    if cpu.watchpoint_hit.is_none() {
        for wp in &mut cpu.watchpoints {
            wp.hit = false;
        }
    }
    (cpu.class.debug_excp_handler)(cpu);
}

/// Execute one TB and fix up the CPU state afterwards if the block
/// never started.
fn cpu_tb_exec<T: Translator>(ctx: &mut ExecContext<T>, cpu: &mut CpuState, tb_id: TbId) -> usize {
    cpu.can_do_io = false;
    let next_tb = {
        let ExecContext {
            tb_cache,
            translator,
            ..
        } = ctx;
        translator.tb_exec(cpu, tb_id, tb_cache.get(tb_id))
    };
    cpu.can_do_io = true;

    if tb_exit_reason(next_tb) > TB_EXIT_IDX1 {
        // The block was entered but never started (instruction budget
        // hit zero, or a stop was requested); put the guest PC back at
        // the block entry.
        let stopped = ctx.tb_cache.get(tb_exit_tb(next_tb));
        match cpu.class.synchronize_from_tb {
            Some(sync) => sync(cpu, stopped),
            None => (cpu.class.set_pc)(cpu, stopped.pc),
        }
    }
    next_tb
}

fn tb_find_fast<T: Translator>(ctx: &mut ExecContext<T>, cpu: &mut CpuState) -> TbId {
    // A subset of the CPU state discriminates TBs; it is always the
    // same before a given block executes.
    let (pc, cs_base, flags) = cpu.tb_cpu_state();
    if let Some(id) = cpu.tb_jmp_cache.lookup(pc) {
        let tb = ctx.tb_cache.get(id);
        if !tb.invalid && tb.pc == pc && tb.cs_base == cs_base && tb.flags == flags {
            ctx.stats.jc_hit += 1;
            return id;
        }
    }
    tb_find_slow(ctx, cpu, pc, cs_base, flags)
}

fn tb_find_slow<T: Translator>(
    ctx: &mut ExecContext<T>,
    cpu: &mut CpuState,
    pc: u64,
    cs_base: u64,
    flags: u32,
) -> TbId {
    let ExecContext {
        tb_cache,
        translator,
        icount,
        stats,
    } = ctx;

    tb_cache.clear_invalidated_flag();

    // find the block through its physical mapping
    let phys_pc = translator.get_page_addr_code(cpu, pc);
    let phys_page1 = phys_pc & TARGET_PAGE_MASK;
    let h = tb_phys_hash_func(phys_pc);

    let mut phys_page2: Option<u64> = None;
    let hit = tb_cache.lookup(h, |tb| {
        if tb.pc != pc
            || tb.page_addr[0] != phys_page1
            || tb.cs_base != cs_base
            || tb.flags != flags
        {
            return false;
        }
        if tb.page_addr[1] == INVALID_PAGE {
            return true;
        }
        // the block straddles a page: the second mapping must match
        let p2 = *phys_page2.get_or_insert_with(|| {
            let virt_page2 = (pc & TARGET_PAGE_MASK) + TARGET_PAGE_SIZE;
            translator.get_page_addr_code(cpu, virt_page2)
        });
        tb.page_addr[1] == p2
    });

    let id = match hit {
        Some(id) => {
            stats.ht_hit += 1;
            id
        }
        None => {
            // no translated code available: generate it now
            stats.translate += 1;
            let cflags = if icount.enabled { CF_USE_ICOUNT } else { 0 };
            let generated = translator.tb_gen_code(cpu, pc, cs_base, flags, cflags);
            if generated.cache_flushed {
                tb_cache.tb_flush(cpu);
                tb_cache.set_invalidated_flag();
            }
            let id = tb_cache.alloc(generated.tb);
            tb_cache.link_phys(id);
            id
        }
    };

    cpu.tb_jmp_cache.insert(pc, id);
    id
}

/// Run the truncated tail of an icount slice outside every cache: the
/// template TB is invalidated, a bounded replacement is generated with
/// `CF_NOCACHE`, executed exactly once, then dropped.
pub fn cpu_exec_nocache<T: Translator>(
    ctx: &mut ExecContext<T>,
    cpu: &mut CpuState,
    max_insns: u32,
    orig_tb: TbId,
) {
    // Longer counts only happen when an existing block outgrew the
    // refill granule.
    let max_insns = cmp::min(max_insns, CF_COUNT_MASK);

    ctx.tb_cache.lock();
    let (pc, cs_base, flags) = {
        let tb = ctx.tb_cache.get(orig_tb);
        (tb.pc, tb.cs_base, tb.flags)
    };
    // generation may flush the template block; invalidate it first
    ctx.tb_cache.tb_phys_invalidate(orig_tb);
    let cflags = max_insns
        | CF_NOCACHE
        | if ctx.icount.enabled { CF_USE_ICOUNT } else { 0 };
    let generated = ctx
        .translator
        .tb_gen_code(cpu, pc, cs_base, flags, cflags);
    if generated.cache_flushed {
        ctx.tb_cache.tb_flush(cpu);
        ctx.tb_cache.set_invalidated_flag();
    }
    let id = ctx.tb_cache.alloc(generated.tb);
    ctx.tb_cache.unlock();

    cpu.current_tb = Some(id);
    ctx.stats.nocache_runs += 1;
    cpu_tb_exec(ctx, cpu, id);
    cpu.current_tb = None;

    ctx.tb_cache.lock();
    ctx.tb_cache.tb_phys_invalidate(id);
    {
        let ExecContext {
            tb_cache,
            translator,
            ..
        } = ctx;
        translator.tb_freed(tb_cache.get(id));
    }
    ctx.tb_cache.tb_free(id);
    ctx.tb_cache.unlock();
}

/// Drive the vCPU until a cooperative exit is pending. Returns the
/// exit code: `EXCP_INTERRUPT`, `EXCP_DEBUG`, `EXCP_HLT`, `EXCP_HALTED`
/// or, in user-only builds, a guest exception number.
pub fn cpu_exec<T: Translator>(ctx: &mut ExecContext<T>, cpu: &mut CpuState) -> i32 {
    if cpu.halted {
        if !(cpu.class.cpu_has_work)(cpu) {
            return EXCP_HALTED;
        }
        cpu.halted = false;
    }

    publish_current_cpu(cpu);
    // Threads that could not yet see the publication above signalled
    // through the process-wide exit flag; the fence orders the
    // publication before our read of that flag.
    fence(Ordering::SeqCst);
    if exit_flag::pending() {
        cpu.set_exit_request();
    }

    (cpu.class.cpu_exec_enter)(cpu);

    let mut sc = SyncClocks::init(cpu, &ctx.icount);

    // survives the unwind; tells the recovery path whether the cache
    // lock was held at the exit site
    let have_tb_lock = Cell::new(false);

    let ret = loop {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            cpu_exec_inner(ctx, cpu, &mut sc, &have_tb_lock)
        }));
        match result {
            Ok(code) => break code,
            Err(payload) if payload.is::<CpuLoopExit>() => {
                // Re-entry after a non-local exit: locals derived from
                // the vCPU are gone, the lock may still be held.
                cpu.can_do_io = true;
                if have_tb_lock.replace(false) {
                    ctx.tb_cache.unlock();
                }
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    };

    (cpu.class.cpu_exec_exit)(cpu);
    // fail safe: the publication is only meaningful inside cpu_exec
    clear_current_cpu();
    ret
}

fn cpu_exec_inner<T: Translator>(
    ctx: &mut ExecContext<T>,
    cpu: &mut CpuState,
    sc: &mut SyncClocks,
    have_tb_lock: &Cell<bool>,
) -> i32 {
    loop {
        // a pending exception is delivered (or returned) first
        if cpu.exception_index >= 0 {
            if cpu.exception_index >= EXCP_INTERRUPT {
                // exit request from the execution loop
                let ret = cpu.exception_index;
                if ret == EXCP_DEBUG {
                    cpu_handle_debug_exception(cpu);
                }
                cpu.exception_index = EXCP_NONE;
                return ret;
            }
            #[cfg(feature = "user-only")]
            {
                // fake hardware exception, handled outside the loop
                (cpu.class.do_interrupt)(cpu);
                let ret = cpu.exception_index;
                cpu.exception_index = EXCP_NONE;
                return ret;
            }
            #[cfg(not(feature = "user-only"))]
            {
                (cpu.class.do_interrupt)(cpu);
                cpu.exception_index = EXCP_NONE;
            }
        }

        // force lookup of the first TB
        let mut next_tb: usize = 0;
        loop {
            ctx.stats.loop_iters += 1;

            // a stop requested before we were visible arrives here
            if exit_flag::pending() {
                cpu.set_exit_request();
            }

            let mut interrupt_request = cpu.interrupt_request();
            if !interrupt_request.is_empty() {
                if cpu.singlestep_enabled & SSTEP_NOIRQ != 0 {
                    // mask external interrupts for this step
                    interrupt_request &= !InterruptRequest::SSTEP_MASK;
                }
                if interrupt_request.contains(InterruptRequest::DEBUG) {
                    cpu.clear_interrupt(InterruptRequest::DEBUG);
                    cpu.exception_index = EXCP_DEBUG;
                    cpu_loop_exit(cpu);
                }
                if interrupt_request.contains(InterruptRequest::HALT) {
                    cpu.clear_interrupt(InterruptRequest::HALT);
                    cpu.halted = true;
                    cpu.exception_index = EXCP_HLT;
                    cpu_loop_exit(cpu);
                }
                if interrupt_request.contains(InterruptRequest::INIT) {
                    (cpu.class.do_cpu_init)(cpu);
                    cpu.exception_index = EXCP_HALTED;
                    cpu_loop_exit(cpu);
                }
                if interrupt_request.contains(InterruptRequest::RESET) {
                    cpu.clear_interrupt(InterruptRequest::RESET);
                    (cpu.class.cpu_reset)(cpu);
                }
                // The per-arch hook has three outcomes: the request
                // was not serviced, it was serviced and a fresh TB
                // lookup is required, or it left through
                // cpu_loop_exit.
                if (cpu.class.cpu_exec_interrupt)(cpu, interrupt_request) {
                    next_tb = 0;
                }
                // Re-read rather than reuse the sampled value:
                // servicing may have raised EXITTB.
                if cpu.interrupt_request().contains(InterruptRequest::EXITTB) {
                    cpu.clear_interrupt(InterruptRequest::EXITTB);
                    // the program flow changed; no jump may be patched
                    next_tb = 0;
                }
            }

            if cpu.exit_requested() {
                cpu.clear_exit_request();
                cpu.exception_index = EXCP_INTERRUPT;
                cpu_loop_exit(cpu);
            }

            // Structural registry changes and code-region pressure
            // force a full flush so freshly generated code carries the
            // right dispatch callouts. The flags are observed without
            // a lock; the flush itself runs under it.
            let obhook_ctx = dba_obhook::context();
            let tracer_ctx = dba_tracer::context();
            let hooks_pending = obhook_ctx.pending_hooks();
            let tracer_pending = tracer_ctx.switch_pending();
            let code_full = ctx.translator.code_cache_nearly_full();
            if hooks_pending || tracer_pending || code_full {
                ctx.tb_cache.lock();
                have_tb_lock.set(true);
                ctx.tb_cache.tb_flush(cpu);
                have_tb_lock.set(false);
                ctx.tb_cache.unlock();
                if hooks_pending {
                    obhook_ctx.clear_pending_hooks();
                    ctx.stats.flush_hook += 1;
                }
                if tracer_pending {
                    tracer_ctx.clear_switch_pending();
                    ctx.stats.flush_tracer += 1;
                }
                if code_full {
                    ctx.stats.flush_code_full += 1;
                }
                // every id the loop still holds died with the flush
                next_tb = 0;
            }

            ctx.tb_cache.lock();
            have_tb_lock.set(true);
            let tb_id = tb_find_fast(ctx, cpu);
            if ctx.tb_cache.take_invalidated_flag() {
                // blocks were invalidated while generating code; the
                // chain built so far cannot be trusted
                next_tb = 0;
            }
            let (tb_pc, tb_tc_ptr, tb_crosses_page) = {
                let tb = ctx.tb_cache.get(tb_id);
                (tb.pc, tb.tc_ptr, tb.crosses_page())
            };
            log::trace!("trace tc={tb_tc_ptr:#x} [{tb_pc:016x}]");
            // Patch the calling TB's exit to chain here. Unsafe when
            // the target spans two pages.
            if next_tb != 0 {
                let slot = tb_exit_reason(next_tb);
                if slot <= TB_EXIT_IDX1 && !tb_crosses_page {
                    ctx.tb_cache.tb_add_jump(tb_exit_tb(next_tb), slot, tb_id);
                    ctx.stats.chain_patched += 1;
                }
            }
            have_tb_lock.set(false);
            ctx.tb_cache.unlock();

            // An exit may have been requested while we were looking
            // the block up; do not start executing with one pending.
            cpu.current_tb = Some(tb_id);
            compiler_fence(Ordering::SeqCst);
            if !cpu.exit_requested() {
                next_tb = cpu_tb_exec(ctx, cpu, tb_id);
                match tb_exit_reason(next_tb) {
                    TB_EXIT_REQUESTED => {
                        // Whatever asked us to stop chaining also set
                        // a request bit; it is handled at the loop
                        // top next iteration.
                        ctx.stats.exit_requested += 1;
                        next_tb = 0;
                    }
                    TB_EXIT_ICOUNT_EXPIRED => {
                        let insns_left = cpu.icount_decr;
                        if cpu.icount_extra != 0 && insns_left >= 0 {
                            // refill the decrementer and continue
                            ctx.stats.icount_refill += 1;
                            cpu.icount_extra += insns_left as i64;
                            let take = cmp::min(0xffff, cpu.icount_extra);
                            cpu.icount_extra -= take;
                            cpu.set_icount_budget(take as u16);
                        } else {
                            if insns_left > 0 {
                                // execute the remaining instructions
                                // outside the cache, with an exact
                                // bound
                                let stopped = tb_exit_tb(next_tb);
                                cpu_exec_nocache(ctx, cpu, insns_left as u32, stopped);
                                sc.align(cpu, &ctx.icount);
                            }
                            cpu.exception_index = EXCP_INTERRUPT;
                            cpu_loop_exit(cpu);
                        }
                    }
                    _ => {}
                }
            }
            cpu.current_tb = None;
            // realign the host clock if the guest ran ahead
            sc.align(cpu, &ctx.icount);
        }
    }
}
