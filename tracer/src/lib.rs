//! Instruction and basic-block tracer engine.
//!
//! Tracers receive a callout from translated code at every instruction
//! start or once per executed block. Six scope-partitioned lists exist:
//! for each granularity there is a per-process list (asid ≠ 0), a
//! universal-kernel list (asid = 0, kernel trace) and a universal-user
//! list (asid = 0, user trace). Routing is decided once at registration
//! and never changes.
//!
//! Structural changes (add, clean-up) raise a process-wide switch flag
//! so the execution loop regenerates translated code with the right
//! callouts; enable/disable toggles are observed by the dispatcher on
//! its next call without any flush.

mod commands;

pub use commands::TracerEntry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use thiserror::Error;

use dba_core::{is_kern_addr, CpuState};

/// Label capacity including the terminator; longer labels are clipped.
pub const MAX_SZ_TRACER_LABEL: usize = 16;

/// Trace callback. Instruction tracers receive (vcpu, pc, 0); block
/// tracers receive (vcpu, block_start, block_end).
pub type TracerCb = fn(&mut CpuState, u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TracerError {
    #[error("tracer internal failure")]
    Fail,
    #[error("unknown trace granularity")]
    InvalidGranularity,
    #[error("unknown tracer id")]
    InvalidId,
    #[error("tracer id space exhausted")]
    MaxTracerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Instruction,
    Block,
}

/// A registered tracer.
pub struct TracerRecord {
    /// Monotonically assigned, never reused while the registry lives.
    pub uid: u16,
    pub enabled: bool,
    pub asid: u64,
    pub universal: bool,
    pub kernel_trace: bool,
    pub granularity: Granularity,
    pub label: String,
    pub cb: TracerCb,
}

#[derive(Default)]
struct TracerLists {
    serial: u32,
    process_insn: Vec<TracerRecord>,
    univ_kernel_insn: Vec<TracerRecord>,
    univ_user_insn: Vec<TracerRecord>,
    process_block: Vec<TracerRecord>,
    univ_kernel_block: Vec<TracerRecord>,
    univ_user_block: Vec<TracerRecord>,
}

impl TracerLists {
    /// Fixed search order for uid lookups: instruction lists first,
    /// process scope before the universal scopes.
    fn all_mut(&mut self) -> [&mut Vec<TracerRecord>; 6] {
        [
            &mut self.process_insn,
            &mut self.univ_kernel_insn,
            &mut self.univ_user_insn,
            &mut self.process_block,
            &mut self.univ_kernel_block,
            &mut self.univ_user_block,
        ]
    }

    fn all(&self) -> [&Vec<TracerRecord>; 6] {
        [
            &self.process_insn,
            &self.univ_kernel_insn,
            &self.univ_user_insn,
            &self.process_block,
            &self.univ_kernel_block,
            &self.univ_user_block,
        ]
    }
}

/// Diagnostic callback substituted when a tracer is registered without
/// one.
pub fn default_callback(_cpu: &mut CpuState, pc_start: u64, pc_end: u64) {
    log::info!(target: "tracer", "eip {pc_start:08x}, {pc_end:08x}");
}

fn clip_label(label: &str) -> String {
    let mut end = label.len().min(MAX_SZ_TRACER_LABEL - 1);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_owned()
}

/// Process-scoped tracer registry.
pub struct TracerContext {
    lists: Mutex<TracerLists>,
    switch_pending: AtomicBool,
}

impl TracerContext {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(TracerLists::default()),
            switch_pending: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TracerLists> {
        self.lists.lock().unwrap()
    }

    fn add(
        &self,
        asid: u64,
        label: &str,
        kernel_trace: bool,
        granularity: Granularity,
        cb: Option<TracerCb>,
    ) -> Result<u16, TracerError> {
        let mut l = self.lock();
        if l.serial >= u16::MAX as u32 {
            return Err(TracerError::MaxTracerId);
        }
        l.serial += 1;
        let uid = l.serial as u16;

        let record = TracerRecord {
            uid,
            enabled: false,
            asid,
            universal: asid == 0,
            kernel_trace,
            granularity,
            label: clip_label(label),
            cb: cb.unwrap_or(default_callback),
        };
        let list = match (granularity, asid != 0, kernel_trace) {
            (Granularity::Instruction, true, _) => &mut l.process_insn,
            (Granularity::Instruction, false, true) => &mut l.univ_kernel_insn,
            (Granularity::Instruction, false, false) => &mut l.univ_user_insn,
            (Granularity::Block, true, _) => &mut l.process_block,
            (Granularity::Block, false, true) => &mut l.univ_kernel_block,
            (Granularity::Block, false, false) => &mut l.univ_user_block,
        };
        list.push(record);
        drop(l);

        // translated code must be regenerated to carry the callout
        self.switch_pending.store(true, Ordering::Release);
        log::debug!("tracer {uid} registered for asid {asid:#x} ({granularity:?})");
        Ok(uid)
    }

    /// Register an instruction-granularity tracer. `asid` 0 selects a
    /// universal scope, split into kernel and user by `kernel_trace`.
    pub fn add_instruction(
        &self,
        asid: u64,
        label: &str,
        kernel_trace: bool,
        cb: Option<TracerCb>,
    ) -> Result<u16, TracerError> {
        self.add(asid, label, kernel_trace, Granularity::Instruction, cb)
    }

    /// Register a block-granularity tracer.
    pub fn add_block(
        &self,
        asid: u64,
        label: &str,
        kernel_trace: bool,
        cb: Option<TracerCb>,
    ) -> Result<u16, TracerError> {
        self.add(asid, label, kernel_trace, Granularity::Block, cb)
    }

    fn set_enabled(&self, uid: u16, enabled: bool) -> Result<(), TracerError> {
        let mut l = self.lock();
        for list in l.all_mut() {
            if let Some(r) = list.iter_mut().find(|r| r.uid == uid) {
                r.enabled = enabled;
                return Ok(());
            }
        }
        Err(TracerError::InvalidId)
    }

    /// Start dispatching to an already-registered tracer. Observed by
    /// the dispatcher on its next call; no flush involved.
    pub fn enable(&self, uid: u16) -> Result<(), TracerError> {
        self.set_enabled(uid, true)
    }

    pub fn disable(&self, uid: u16) -> Result<(), TracerError> {
        self.set_enabled(uid, false)
    }

    pub fn get_label(&self, uid: u16) -> Result<String, TracerError> {
        let l = self.lock();
        for list in l.all() {
            if let Some(r) = list.iter().find(|r| r.uid == uid) {
                return Ok(r.label.clone());
            }
        }
        Err(TracerError::InvalidId)
    }

    pub fn get_status(&self, uid: u16) -> Result<bool, TracerError> {
        let l = self.lock();
        for list in l.all() {
            if let Some(r) = list.iter().find(|r| r.uid == uid) {
                return Ok(r.enabled);
            }
        }
        Err(TracerError::InvalidId)
    }

    /// Drop all six lists and restart uid assignment from 1. A
    /// structural change: raises the switch flag.
    pub fn clean_up(&self) {
        let mut l = self.lock();
        *l = TracerLists::default();
        drop(l);
        self.switch_pending.store(true, Ordering::Release);
    }

    /// Whether a structural change awaits a TB flush.
    pub fn switch_pending(&self) -> bool {
        self.switch_pending.load(Ordering::Acquire)
    }

    pub fn clear_switch_pending(&self) {
        self.switch_pending.store(false, Ordering::Release);
    }

    /// Translation-time probe: should instruction callouts be embedded
    /// for code at `pc`? Conservative: any non-empty list that could
    /// match is enough; the dispatcher filters precisely by asid and
    /// enablement.
    pub fn instruction_callouts_needed(&self, pc: u64) -> bool {
        let l = self.lock();
        if is_kern_addr(pc) {
            !l.univ_kernel_insn.is_empty()
        } else {
            !l.univ_user_insn.is_empty() || !l.process_insn.is_empty()
        }
    }

    /// Translation-time probe for the block callout at a TB head.
    pub fn block_callouts_needed(&self, pc: u64) -> bool {
        let l = self.lock();
        if is_kern_addr(pc) {
            !l.univ_kernel_block.is_empty()
        } else {
            !l.univ_user_block.is_empty() || !l.process_block.is_empty()
        }
    }

    fn collect(
        list: &[TracerRecord],
        asid_filter: Option<u64>,
        out: &mut Vec<TracerCb>,
    ) {
        for r in list {
            if !r.enabled {
                continue;
            }
            if let Some(asid) = asid_filter {
                if r.asid != asid {
                    continue;
                }
            }
            out.push(r.cb);
        }
    }

    /// Dispatcher called at each traced instruction's start.
    ///
    /// Kernel PCs go to the universal-kernel list only; user PCs go to
    /// the process list (filtered by the running asid) and the
    /// universal-user list. Callbacks run outside the registry lock.
    pub fn dispatch_instruction(&self, cpu: &mut CpuState, pc: u64) {
        let cbs = {
            let l = self.lock();
            let mut cbs = Vec::new();
            if is_kern_addr(pc) {
                Self::collect(&l.univ_kernel_insn, None, &mut cbs);
            } else {
                Self::collect(&l.process_insn, Some(cpu.asid()), &mut cbs);
                Self::collect(&l.univ_user_insn, None, &mut cbs);
            }
            cbs
        };
        for cb in cbs {
            cb(cpu, pc, 0);
        }
    }

    /// Dispatcher called once per executed block with its PC range.
    pub fn dispatch_block(&self, cpu: &mut CpuState, block_start: u64, block_end: u64) {
        let cbs = {
            let l = self.lock();
            let mut cbs = Vec::new();
            if is_kern_addr(block_start) {
                Self::collect(&l.univ_kernel_block, None, &mut cbs);
            } else {
                Self::collect(&l.process_block, Some(cpu.asid()), &mut cbs);
                Self::collect(&l.univ_user_block, None, &mut cbs);
            }
            cbs
        };
        for cb in cbs {
            cb(cpu, block_start, block_end);
        }
    }
}

impl Default for TracerContext {
    fn default() -> Self {
        Self::new()
    }
}

static TRACER_CTX: Lazy<TracerContext> = Lazy::new(TracerContext::new);

/// The process-wide tracer registry consulted by the execution loop
/// and the translator.
pub fn context() -> &'static TracerContext {
    &TRACER_CTX
}

/// Process-wide convenience wrappers over [`context`].
pub fn add_instruction(
    asid: u64,
    label: &str,
    kernel_trace: bool,
    cb: Option<TracerCb>,
) -> Result<u16, TracerError> {
    context().add_instruction(asid, label, kernel_trace, cb)
}

pub fn add_block(
    asid: u64,
    label: &str,
    kernel_trace: bool,
    cb: Option<TracerCb>,
) -> Result<u16, TracerError> {
    context().add_block(asid, label, kernel_trace, cb)
}

pub fn enable(uid: u16) -> Result<(), TracerError> {
    context().enable(uid)
}

pub fn disable(uid: u16) -> Result<(), TracerError> {
    context().disable(uid)
}

pub fn clean_up() {
    context().clean_up()
}

/// Dispatcher entries for translated code. Safe to call inside a TB:
/// they never unwind on their own.
pub fn dispatch_instruction(cpu: &mut CpuState, pc: u64) {
    context().dispatch_instruction(cpu, pc)
}

pub fn dispatch_block(cpu: &mut CpuState, block_start: u64, block_end: u64) {
    context().dispatch_block(cpu, block_start, block_end)
}
