//! Monitor-facing enumeration and listing of registered hooks.

use std::fmt::{self, Write};

use crate::ObhookContext;

/// One registered hook as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEntry {
    pub descriptor: u32,
    pub asid: u64,
    pub addr: u64,
    pub enabled: bool,
    pub universal: bool,
    pub label: String,
}

impl ObhookContext {
    /// All live hooks grouped by asid bucket, then address, then
    /// registration order.
    pub fn enumerate(&self) -> Vec<HookEntry> {
        let t = self.lock();
        let mut out = Vec::new();
        for outer in t.hooks.values() {
            for inner in outer.values() {
                for r in inner {
                    out.push(HookEntry {
                        descriptor: r.descriptor,
                        asid: r.asid,
                        addr: r.addr,
                        enabled: r.enabled,
                        universal: r.universal,
                        label: r.label.clone(),
                    });
                }
            }
        }
        out
    }

    /// Render the registry the way the monitor prints it.
    pub fn format_list(&self, w: &mut dyn Write) -> fmt::Result {
        let t = self.lock();
        for (asid, outer) in &t.hooks {
            if *asid == 0 {
                writeln!(w, "----- Universal")?;
            } else {
                writeln!(w, "----- Process {asid:016x}")?;
            }
            for (addr, inner) in outer {
                writeln!(w, "    {addr:016x}:")?;
                for r in inner {
                    writeln!(
                        w,
                        "\t{:5}, {:>10}, {:16}",
                        r.descriptor,
                        if r.enabled { "enabled" } else { "disabled" },
                        r.label
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Listing as a string, for monitors that buffer output.
    pub fn list_string(&self) -> String {
        let mut s = String::new();
        // writing into a String cannot fail
        let _ = self.format_list(&mut s);
        s
    }
}
