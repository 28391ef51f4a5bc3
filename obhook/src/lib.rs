//! Out-of-box hook engine.
//!
//! Hooks attach to guest code addresses without any in-guest agent:
//! the translator embeds a dispatcher callout in front of every
//! instrumented instruction, and the registry here decides at run time
//! which callbacks fire. Two scopes exist: per-process hooks keyed by
//! the owning address space (CR3) and universal hooks that fire in
//! every process, which must therefore target kernel-half addresses.
//!
//! Registering a hook raises a process-wide pending flag; the
//! execution loop flushes the TB cache before the next dispatch so the
//! freshly translated code carries the new callout. Deleting a hook
//! does not flush: stale callouts simply walk an empty list.

mod commands;

pub use commands::HookEntry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use thiserror::Error;

use dba_core::{is_kern_addr, CpuState};

/// Bounded descriptor pool.
pub const MAX_NM_OBHOOK: usize = 65_535;
/// Label capacity including the terminator; user labels hold at most
/// `MAX_SZ_OBHOOK_LABEL - 1` bytes.
pub const MAX_SZ_OBHOOK_LABEL: usize = 16;

/// Callback invoked from translated code with the current vCPU state.
/// The return value of the hooked work, if any, travels through the
/// vCPU state; the engine ignores it.
pub type HookCb = fn(&mut CpuState);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ObhookError {
    #[error("out-of-box hook internal failure")]
    Fail,
    #[error("no free hook descriptor")]
    FullHook,
    #[error("universal hook address not in kernel space")]
    InvalidAddr,
    #[error("hook label too long")]
    InvalidLabel,
    #[error("null hook callback")]
    InvalidCallback,
    #[error("unknown hook descriptor")]
    InvalidDescriptor,
}

/// A registered hook. Lives inside its (asid, addr) bucket in
/// registration order until deleted.
pub struct HookRecord {
    pub descriptor: u32,
    pub asid: u64,
    pub addr: u64,
    pub enabled: bool,
    pub universal: bool,
    pub label: String,
    pub cb: HookCb,
}

#[derive(Default)]
struct HookTables {
    /// Two-level keyed table: asid → addr → registration-ordered
    /// records. Empty inner entries are collapsed on delete.
    hooks: BTreeMap<u64, BTreeMap<u64, Vec<HookRecord>>>,
    /// descriptor → owning bucket key.
    index: Vec<Option<(u64, u64)>>,
    /// Descriptors returned by delete, available for reuse.
    free: Vec<u32>,
    /// High-water mark of never-used descriptors.
    next_desc: u32,
}

impl HookTables {
    fn new() -> Self {
        Self {
            index: vec![None; MAX_NM_OBHOOK],
            ..Self::default()
        }
    }
}

/// Process-scoped hook registry.
///
/// Mutation and lookup are serialized by an internal mutex; the
/// pending-additions flag is read lock-free by the execution loop.
pub struct ObhookContext {
    tables: Mutex<HookTables>,
    pending_hooks: AtomicBool,
}

impl ObhookContext {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HookTables::new()),
            pending_hooks: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookTables> {
        self.tables.lock().unwrap()
    }

    fn add(
        &self,
        asid: u64,
        addr: u64,
        label: Option<&str>,
        cb: Option<HookCb>,
    ) -> Result<u32, ObhookError> {
        let mut t = self.lock();

        // take the descriptor availability check first so a full pool
        // wins over every other precondition
        if t.free.is_empty() && t.next_desc as usize >= MAX_NM_OBHOOK {
            return Err(ObhookError::FullHook);
        }
        // a universal hook in a per-process address range makes no
        // sense; each process maps that range differently
        if asid == 0 && !is_kern_addr(addr) {
            return Err(ObhookError::InvalidAddr);
        }
        if let Some(label) = label {
            if label.len() >= MAX_SZ_OBHOOK_LABEL {
                return Err(ObhookError::InvalidLabel);
            }
        }
        let cb = cb.ok_or(ObhookError::InvalidCallback)?;

        let descriptor = match t.free.pop() {
            Some(d) => d,
            None => {
                let d = t.next_desc;
                t.next_desc += 1;
                d
            }
        };

        let record = HookRecord {
            descriptor,
            asid,
            addr,
            enabled: true,
            universal: asid == 0,
            label: label.unwrap_or("").to_owned(),
            cb,
        };
        t.hooks
            .entry(asid)
            .or_default()
            .entry(addr)
            .or_default()
            .push(record);
        t.index[descriptor as usize] = Some((asid, addr));
        drop(t);

        // newly registered hooks only take effect once the translated
        // code embedding their callout is regenerated
        self.pending_hooks.store(true, Ordering::Release);
        log::debug!(
            "obhook {descriptor} registered at asid {asid:#x} addr {addr:#x}"
        );
        Ok(descriptor)
    }

    /// Register a process-aware hook at `addr` inside the address
    /// space identified by `asid` (CR3).
    pub fn add_process(
        &self,
        asid: u64,
        addr: u64,
        label: Option<&str>,
        cb: Option<HookCb>,
    ) -> Result<u32, ObhookError> {
        self.add(asid, addr, label, cb)
    }

    /// Register a universal hook at a kernel address, firing whichever
    /// process is running.
    pub fn add_universal(
        &self,
        kern_addr: u64,
        label: Option<&str>,
        cb: Option<HookCb>,
    ) -> Result<u32, ObhookError> {
        self.add(0, kern_addr, label, cb)
    }

    /// Delete a hook. Collapses the (asid, addr) bucket and then the
    /// asid entry if they become empty, and frees the descriptor for
    /// reuse. Does not request a TB flush: the dispatcher tolerates
    /// addresses whose list has gone empty.
    pub fn delete(&self, descriptor: u32) -> Result<(), ObhookError> {
        let mut t = self.lock();
        let (asid, addr) = t
            .index
            .get(descriptor as usize)
            .copied()
            .flatten()
            .ok_or(ObhookError::InvalidDescriptor)?;

        if let Some(outer) = t.hooks.get_mut(&asid) {
            if let Some(inner) = outer.get_mut(&addr) {
                inner.retain(|r| r.descriptor != descriptor);
                if inner.is_empty() {
                    outer.remove(&addr);
                }
            }
            if outer.is_empty() {
                t.hooks.remove(&asid);
            }
        }
        t.index[descriptor as usize] = None;
        t.free.push(descriptor);
        Ok(())
    }

    fn toggle(&self, descriptor: u32, enabled: bool) -> Result<(), ObhookError> {
        let mut t = self.lock();
        let (asid, addr) = t
            .index
            .get(descriptor as usize)
            .copied()
            .flatten()
            .ok_or(ObhookError::InvalidDescriptor)?;
        let record = t
            .hooks
            .get_mut(&asid)
            .and_then(|outer| outer.get_mut(&addr))
            .and_then(|inner| inner.iter_mut().find(|r| r.descriptor == descriptor))
            .ok_or(ObhookError::InvalidDescriptor)?;
        record.enabled = enabled;
        Ok(())
    }

    /// Enable or disable a hook. Takes effect on the very next
    /// dispatch; no flush is involved.
    pub fn set_enabled(&self, descriptor: u32, enabled: bool) -> Result<(), ObhookError> {
        self.toggle(descriptor, enabled)
    }

    pub fn enable(&self, descriptor: u32) -> Result<(), ObhookError> {
        self.toggle(descriptor, true)
    }

    pub fn disable(&self, descriptor: u32) -> Result<(), ObhookError> {
        self.toggle(descriptor, false)
    }

    fn collect_enabled(t: &HookTables, asid: u64, addr: u64, out: &mut Vec<HookCb>) {
        if let Some(inner) = t.hooks.get(&asid).and_then(|outer| outer.get(&addr)) {
            out.extend(inner.iter().filter(|r| r.enabled).map(|r| r.cb));
        }
    }

    /// Enabled callbacks registered universally at a kernel address,
    /// in registration order. Empty for non-kernel addresses or when
    /// nothing is registered.
    pub fn callbacks_univ(&self, kern_addr: u64) -> Vec<HookCb> {
        if !is_kern_addr(kern_addr) {
            return Vec::new();
        }
        let t = self.lock();
        let mut cbs = Vec::new();
        Self::collect_enabled(&t, 0, kern_addr, &mut cbs);
        cbs
    }

    /// Enabled callbacks registered at (asid, addr), in registration
    /// order.
    pub fn callbacks_proc(&self, asid: u64, addr: u64) -> Vec<HookCb> {
        let t = self.lock();
        let mut cbs = Vec::new();
        Self::collect_enabled(&t, asid, addr, &mut cbs);
        cbs
    }

    /// Translation-time probe: does any hook (any scope, any
    /// enablement) target this address? The translator embeds the
    /// dispatcher callout based on this; enablement is re-checked at
    /// dispatch time.
    pub fn implanted_at(&self, addr: u64) -> bool {
        let t = self.lock();
        t.hooks.values().any(|outer| outer.contains_key(&addr))
    }

    /// Number of live descriptors.
    pub fn hook_count(&self) -> usize {
        let t = self.lock();
        t.index.iter().filter(|slot| slot.is_some()).count()
    }

    /// Dispatcher called from translated code at an instrumented PC.
    ///
    /// Walks the universal list for the current PC, then the
    /// per-process list, invoking every enabled callback in
    /// registration order. The snapshot is taken under the registry
    /// lock but callbacks run outside it, so a callback may itself
    /// register or delete hooks and tracers.
    pub fn dispatch(&self, cpu: &mut CpuState) {
        let pc = cpu.arch.pc;
        let asid = cpu.asid();
        let cbs = {
            let t = self.lock();
            let mut cbs = Vec::new();
            Self::collect_enabled(&t, 0, pc, &mut cbs);
            if asid != 0 {
                Self::collect_enabled(&t, asid, pc, &mut cbs);
            }
            cbs
        };
        for cb in cbs {
            cb(cpu);
        }
    }

    /// Whether newly registered hooks are waiting for a TB flush.
    pub fn pending_hooks(&self) -> bool {
        self.pending_hooks.load(Ordering::Acquire)
    }

    /// Acknowledge the pending flag after flushing.
    pub fn clear_pending_hooks(&self) {
        self.pending_hooks.store(false, Ordering::Release);
    }

    /// Drop every hook and reset the descriptor pool.
    pub fn shutdown(&self) {
        let mut t = self.lock();
        *t = HookTables::new();
        drop(t);
        self.pending_hooks.store(false, Ordering::Release);
    }
}

impl Default for ObhookContext {
    fn default() -> Self {
        Self::new()
    }
}

static OBHOOK_CTX: Lazy<ObhookContext> = Lazy::new(ObhookContext::new);

/// The process-wide hook registry consulted by the execution loop and
/// the translator.
pub fn context() -> &'static ObhookContext {
    &OBHOOK_CTX
}

/// Process-wide convenience wrappers over [`context`].
pub fn add_process(
    asid: u64,
    addr: u64,
    label: Option<&str>,
    cb: Option<HookCb>,
) -> Result<u32, ObhookError> {
    context().add_process(asid, addr, label, cb)
}

pub fn add_universal(
    kern_addr: u64,
    label: Option<&str>,
    cb: Option<HookCb>,
) -> Result<u32, ObhookError> {
    context().add_universal(kern_addr, label, cb)
}

pub fn delete(descriptor: u32) -> Result<(), ObhookError> {
    context().delete(descriptor)
}

pub fn enable(descriptor: u32) -> Result<(), ObhookError> {
    context().enable(descriptor)
}

pub fn disable(descriptor: u32) -> Result<(), ObhookError> {
    context().disable(descriptor)
}

/// Dispatcher entry for translated code; reads pc and asid from the
/// vCPU state. Safe to call inside a TB: it never unwinds on its own.
pub fn dispatch(cpu: &mut CpuState) {
    context().dispatch(cpu)
}
