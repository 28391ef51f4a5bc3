//! Monitor-facing enumeration and listing of registered tracers.

use std::fmt::{self, Write};

use crate::{Granularity, TracerContext, TracerRecord};

/// One registered tracer as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerEntry {
    pub uid: u16,
    pub asid: u64,
    pub enabled: bool,
    pub kernel_trace: bool,
    pub granularity: Granularity,
    pub label: String,
}

fn scope_name(r: &TracerRecord) -> &'static str {
    if !r.universal {
        "process"
    } else if r.kernel_trace {
        "universal-kernel"
    } else {
        "universal-user"
    }
}

fn show_list(w: &mut dyn Write, list: &[TracerRecord]) -> fmt::Result {
    for r in list {
        writeln!(
            w,
            "\tuid: {}\tasid: {:x}\tlabel: {}\tenabled: {}\tscope: {}",
            r.uid,
            r.asid,
            r.label,
            r.enabled as u8,
            scope_name(r)
        )?;
    }
    Ok(())
}

impl TracerContext {
    /// All live tracers, instruction lists first.
    pub fn enumerate(&self) -> Vec<TracerEntry> {
        let l = self.lock();
        l.all()
            .iter()
            .flat_map(|list| list.iter())
            .map(|r| TracerEntry {
                uid: r.uid,
                asid: r.asid,
                enabled: r.enabled,
                kernel_trace: r.kernel_trace,
                granularity: r.granularity,
                label: r.label.clone(),
            })
            .collect()
    }

    /// Render the six lists the way the monitor prints them.
    pub fn format_list(&self, w: &mut dyn Write) -> fmt::Result {
        let l = self.lock();
        writeln!(w, "================= Instruction tracers =================")?;
        show_list(w, &l.process_insn)?;
        show_list(w, &l.univ_user_insn)?;
        show_list(w, &l.univ_kernel_insn)?;
        writeln!(w, "================= Code block tracers ==================")?;
        show_list(w, &l.process_block)?;
        show_list(w, &l.univ_user_block)?;
        show_list(w, &l.univ_kernel_block)?;
        Ok(())
    }

    pub fn list_string(&self) -> String {
        let mut s = String::new();
        let _ = self.format_list(&mut s);
        s
    }
}
