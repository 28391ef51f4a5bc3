//! Execution engine — TB cache and the vCPU dispatch loop.
//!
//! Drives the lookup → translate → execute cycle against the
//! physical-hash TB cache and applies the coordinated-flush protocol
//! that keeps translated code in sync with the hook and tracer
//! registries.
//!
//! Reference model: QEMU's `cpu-exec.c` dispatch structure.

pub mod clock;
pub mod cpu_exec;
pub mod tb_cache;

pub use cpu_exec::{
    cpu_exec, cpu_exec_nocache, cpu_loop_exit, cpu_reload_memory_map, cpu_resume_from_signal,
    current_cpu_intr, CpuLoopExit,
};
pub use tb_cache::TbCache;

use std::fmt;

use dba_core::{CpuState, TbId, TranslationBlock};

/// A freshly generated TB plus whether generation had to flush the
/// translated-code store (for example because its code region filled
/// up). A flush during generation invalidates every id the loop may
/// still hold.
pub struct GeneratedTb {
    pub tb: TranslationBlock,
    pub cache_flushed: bool,
}

/// Guest-ISA translator and host-code runner driven by the loop.
///
/// Implementations generate host code for guest blocks and execute it.
/// Generated code must embed the hook and tracer dispatcher callouts
/// the registries call for at generation time; the loop guarantees a
/// full cache flush between a structural registry change and the next
/// lookup, so consulting the registries during generation is race-free.
pub trait Translator {
    /// Translate guest code at (pc, cs_base, flags) into a new TB.
    /// `cflags & CF_COUNT_MASK` bounds the instruction count when
    /// non-zero; `CF_NOCACHE` marks a block that will never enter a
    /// cache.
    fn tb_gen_code(
        &mut self,
        cpu: &mut CpuState,
        pc: u64,
        cs_base: u64,
        flags: u32,
        cflags: u32,
    ) -> GeneratedTb;

    /// Execute the host code of `tb` and return the encoded exit value
    /// (see `tb_exit_encode`). Helpers running inside the block may
    /// leave through `cpu_loop_exit` instead of returning.
    fn tb_exec(&mut self, cpu: &mut CpuState, tb_id: TbId, tb: &TranslationBlock) -> usize;

    /// Physical address backing guest code at `pc`.
    fn get_page_addr_code(&mut self, cpu: &mut CpuState, pc: u64) -> u64;

    fn tlb_flush(&mut self, cpu: &mut CpuState, global: bool);

    /// Polled each dispatch iteration; returning true forces a full TB
    /// flush so the code region can be recycled.
    fn code_cache_nearly_full(&self) -> bool {
        false
    }

    /// Notification that a nocache TB is being freed.
    fn tb_freed(&mut self, _tb: &TranslationBlock) {}
}

/// Icount configuration for deterministic instruction accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcountConfig {
    /// Charge executed instructions against the per-vCPU decrementer.
    pub enabled: bool,
    /// Sleep the host when the guest clock runs ahead.
    pub align: bool,
    /// log2 of nanoseconds charged per guest instruction.
    pub shift: u32,
}

/// Counters for the dispatch pipeline.
#[derive(Default)]
pub struct ExecStats {
    pub loop_iters: u64,
    // TB lookup
    pub jc_hit: u64,
    pub ht_hit: u64,
    pub translate: u64,
    // Flush causes
    pub flush_hook: u64,
    pub flush_tracer: u64,
    pub flush_code_full: u64,
    // Exits and chaining
    pub exit_requested: u64,
    pub icount_refill: u64,
    pub nocache_runs: u64,
    pub chain_patched: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_lookup = self.jc_hit + self.ht_hit + self.translate;
        writeln!(f, "=== Execution stats ===")?;
        writeln!(f, "loop iters:    {}", self.loop_iters)?;
        writeln!(f, "--- TB lookup ---")?;
        writeln!(
            f,
            "  jc hit:      {} ({:.1}%)",
            self.jc_hit,
            pct(self.jc_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  ht hit:      {} ({:.1}%)",
            self.ht_hit,
            pct(self.ht_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  translate:   {} ({:.1}%)",
            self.translate,
            pct(self.translate, total_lookup)
        )?;
        writeln!(f, "--- Flushes ---")?;
        writeln!(f, "  hooks:       {}", self.flush_hook)?;
        writeln!(f, "  tracers:     {}", self.flush_tracer)?;
        writeln!(f, "  code full:   {}", self.flush_code_full)?;
        writeln!(f, "--- Exits ---")?;
        writeln!(f, "  requested:   {}", self.exit_requested)?;
        writeln!(f, "  refills:     {}", self.icount_refill)?;
        writeln!(f, "  nocache:     {}", self.nocache_runs)?;
        writeln!(f, "  chained:     {}", self.chain_patched)?;
        Ok(())
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64 * 100.0
    }
}

/// Everything the loop needs besides the vCPU itself.
pub struct ExecContext<T: Translator> {
    pub tb_cache: TbCache,
    pub translator: T,
    pub icount: IcountConfig,
    pub stats: ExecStats,
}

impl<T: Translator> ExecContext<T> {
    pub fn new(translator: T) -> Self {
        Self {
            tb_cache: TbCache::new(),
            translator,
            icount: IcountConfig::default(),
            stats: ExecStats::default(),
        }
    }

    pub fn with_icount(translator: T, icount: IcountConfig) -> Self {
        Self {
            icount,
            ..Self::new(translator)
        }
    }
}
