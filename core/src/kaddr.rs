//! Kernel-half address classification.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default kernel-half mask, matching the virtual-address layout of a
/// 64-bit Windows 10 guest.
pub const DEFAULT_KERN_ADDR_MASK: u64 = 0xffff_0000_0000_0000;

static KERN_ADDR_MASK: AtomicU64 = AtomicU64::new(DEFAULT_KERN_ADDR_MASK);

/// Check if the given guest virtual address is in kernel space.
///
/// Universal hooks and kernel-scope tracers only make sense for
/// addresses on the kernel side of the split; everything else lives in
/// per-process address spaces.
pub fn is_kern_addr(addr: u64) -> bool {
    let mask = KERN_ADDR_MASK.load(Ordering::Relaxed);
    (addr & mask) == mask
}

/// Current kernel-half mask.
pub fn kern_addr_mask() -> u64 {
    KERN_ADDR_MASK.load(Ordering::Relaxed)
}

/// Override the kernel-half mask for guests with a different layout.
/// Expected to be called once at startup, before any hook or tracer is
/// registered.
pub fn set_kern_addr_mask(mask: u64) {
    KERN_ADDR_MASK.store(mask, Ordering::Relaxed);
}
