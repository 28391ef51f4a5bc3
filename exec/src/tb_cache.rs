//! Physical-hash translated-block cache.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use dba_core::tb::tb_phys_hash_func;
use dba_core::{CpuState, TbId, TranslationBlock, TB_PHYS_HASH_SIZE};

/// Raw test-and-set lock with explicit lock/unlock so the held state
/// can be repaired after a non-local exit out of translated code. The
/// loop tracks whether it holds the lock in a cell that survives the
/// unwind.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

struct CacheInner {
    /// TB slab. Entries are reused through the free list; ids stay
    /// stable until a flush.
    tbs: Vec<TranslationBlock>,
    free: Vec<TbId>,
    /// Chain heads keyed by physical PC hash, MRU-ordered.
    phys_hash: Vec<Option<TbId>>,
    live: usize,
}

/// The translation-block store consulted on every guest dispatch.
///
/// Structural mutation happens under the dedicated spin lock; reads
/// during TB execution rely on the big-lock discipline keeping any
/// concurrent mutation away.
pub struct TbCache {
    lock: SpinLock,
    inner: UnsafeCell<CacheInner>,
    /// Raised when generation invalidated cached TBs behind the
    /// loop's back; the loop then refuses to chain.
    invalidated_flag: AtomicBool,
}

// SAFETY: every &mut access to `inner` goes through methods whose
// callers hold the spin lock (or otherwise have exclusive use of the
// cache); the shared `get` accessor is only used while no structural
// mutation can run.
unsafe impl Send for TbCache {}
unsafe impl Sync for TbCache {}

impl TbCache {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            inner: UnsafeCell::new(CacheInner {
                tbs: Vec::new(),
                free: Vec::new(),
                phys_hash: vec![None; TB_PHYS_HASH_SIZE],
                live: 0,
            }),
            invalidated_flag: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// SAFETY: caller must hold the cache lock or otherwise exclude
    /// concurrent structural access.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut CacheInner {
        &mut *self.inner.get()
    }

    /// Shared view of a TB. The id must come from `alloc` and no flush
    /// may have happened since.
    pub fn get(&self, id: TbId) -> &TranslationBlock {
        // SAFETY: ids stay valid until a flush, and the big-lock
        // discipline keeps structural mutation and reads apart.
        unsafe { &(&(*self.inner.get()).tbs)[id] }
    }

    /// Insert a TB into the slab, reusing a freed slot when one
    /// exists. Call under the cache lock.
    pub fn alloc(&self, tb: TranslationBlock) -> TbId {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        inner.live += 1;
        match inner.free.pop() {
            Some(id) => {
                inner.tbs[id] = tb;
                id
            }
            None => {
                inner.tbs.push(tb);
                inner.tbs.len() - 1
            }
        }
    }

    /// Link an allocated TB at the head of its physical hash chain.
    /// Call under the cache lock.
    pub fn link_phys(&self, id: TbId) {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        let h = tb_phys_hash_func(inner.tbs[id].phys_pc);
        inner.tbs[id].phys_hash_next = inner.phys_hash[h];
        inner.phys_hash[h] = Some(id);
    }

    /// Walk the chain at bucket `h` for a valid TB matching `pred`,
    /// moving a hit to the chain head. Call under the cache lock.
    pub fn lookup(
        &self,
        h: usize,
        mut pred: impl FnMut(&TranslationBlock) -> bool,
    ) -> Option<TbId> {
        // SAFETY: lock held per contract; `pred` only sees a shared
        // view and cannot reach back into the cache.
        let inner = unsafe { self.inner() };
        let mut prev: Option<TbId> = None;
        let mut cur = inner.phys_hash[h];
        while let Some(id) = cur {
            let next = inner.tbs[id].phys_hash_next;
            let hit = {
                let tb = &inner.tbs[id];
                !tb.invalid && pred(tb)
            };
            if hit {
                if let Some(p) = prev {
                    // move the hit to the head of the chain
                    inner.tbs[p].phys_hash_next = next;
                    inner.tbs[id].phys_hash_next = inner.phys_hash[h];
                    inner.phys_hash[h] = Some(id);
                }
                return Some(id);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Patch a direct jump from `src`'s exit `slot` to `dst`. Only the
    /// first patch of a slot sticks. Call under the cache lock.
    pub fn tb_add_jump(&self, src: TbId, slot: usize, dst: TbId) {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        if inner.tbs[src].jmp_dest[slot].is_none() {
            inner.tbs[src].jmp_dest[slot] = Some(dst);
            inner.tbs[dst].jmp_incoming.push((src, slot));
        }
    }

    /// Invalidate a TB: unlink every direct jump in both directions
    /// and remove it from its hash chain. The slab entry stays until
    /// `tb_free` or a flush. Call under the cache lock.
    pub fn tb_phys_invalidate(&self, id: TbId) {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        inner.tbs[id].invalid = true;

        let incoming = std::mem::take(&mut inner.tbs[id].jmp_incoming);
        for (src, slot) in incoming {
            inner.tbs[src].jmp_dest[slot] = None;
        }
        for slot in 0..2 {
            if let Some(dst) = inner.tbs[id].jmp_dest[slot].take() {
                inner.tbs[dst]
                    .jmp_incoming
                    .retain(|&(s, n)| !(s == id && n == slot));
            }
        }

        let h = tb_phys_hash_func(inner.tbs[id].phys_pc);
        let mut prev: Option<TbId> = None;
        let mut cur = inner.phys_hash[h];
        while let Some(c) = cur {
            if c == id {
                let next = inner.tbs[id].phys_hash_next.take();
                match prev {
                    Some(p) => inner.tbs[p].phys_hash_next = next,
                    None => inner.phys_hash[h] = next,
                }
                break;
            }
            prev = cur;
            cur = inner.tbs[c].phys_hash_next;
        }
    }

    /// Return an invalidated, unlinked TB's slot to the free list.
    /// Only nocache TBs are freed individually. Call under the cache
    /// lock.
    pub fn tb_free(&self, id: TbId) {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        inner.free.push(id);
        inner.live -= 1;
    }

    /// Invalidate the entire TB store and the vCPU's virtual-PC fast
    /// path. Call under the cache lock.
    pub fn tb_flush(&self, cpu: &mut CpuState) {
        // SAFETY: lock held per contract.
        let inner = unsafe { self.inner() };
        log::debug!("tb_flush: dropping {} live TBs", inner.live);
        inner.tbs.clear();
        inner.free.clear();
        inner.phys_hash.fill(None);
        inner.live = 0;
        cpu.tb_jmp_cache.invalidate();
    }

    /// Count of live TBs.
    pub fn len(&self) -> usize {
        // SAFETY: a torn read of a counter is benign; callers use this
        // for accounting only.
        unsafe { (*self.inner.get()).live }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_invalidated_flag(&self) {
        self.invalidated_flag.store(true, Ordering::Release);
    }

    pub fn clear_invalidated_flag(&self) {
        self.invalidated_flag.store(false, Ordering::Release);
    }

    /// Read and clear the invalidated flag.
    pub fn take_invalidated_flag(&self) -> bool {
        self.invalidated_flag.swap(false, Ordering::AcqRel)
    }
}

impl Default for TbCache {
    fn default() -> Self {
        Self::new()
    }
}
