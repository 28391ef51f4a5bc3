//! Core vCPU and translation-block types shared by the execution
//! loop, the out-of-box hook engine and the tracer engine.

pub mod cpu;
pub mod exit_flag;
pub mod kaddr;
pub mod tb;

pub use cpu::{
    CpuClass, CpuState, IntrState, InterruptRequest, Watchpoint, X86State, EXCP_DEBUG,
    EXCP_HALTED, EXCP_HLT, EXCP_INTERRUPT, EXCP_NONE, SSTEP_ENABLE, SSTEP_NOIRQ, SSTEP_NOTIMER,
    X86_CLASS,
};
pub use kaddr::{is_kern_addr, kern_addr_mask, set_kern_addr_mask};
pub use tb::{
    tb_exit_encode, tb_exit_reason, tb_exit_tb, tb_phys_hash_func, JumpCache, TbId,
    TranslationBlock, CF_COUNT_MASK, CF_NOCACHE, CF_USE_ICOUNT, INVALID_PAGE,
    TB_EXIT_ICOUNT_EXPIRED, TB_EXIT_IDX0, TB_EXIT_IDX1, TB_EXIT_MASK, TB_EXIT_REQUESTED,
    TB_JMP_CACHE_SIZE, TB_PHYS_HASH_SIZE, TARGET_PAGE_MASK, TARGET_PAGE_SIZE,
};
