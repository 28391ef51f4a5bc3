//! Host/guest clock alignment for icount execution.

#[cfg(not(feature = "user-only"))]
use std::sync::Mutex;
#[cfg(not(feature = "user-only"))]
use std::time::Instant;

#[cfg(not(feature = "user-only"))]
use once_cell::sync::Lazy;

use dba_core::CpuState;

use crate::IcountConfig;

/// Allow the guest a maximum 3 ms advance; the difference between the
/// two clocks then oscillates around zero.
#[cfg(not(feature = "user-only"))]
const VM_CLOCK_ADVANCE_NS: i64 = 3_000_000;
#[cfg(not(feature = "user-only"))]
const THRESHOLD_REDUCE: f64 = 1.5;
#[cfg(not(feature = "user-only"))]
const MAX_DELAY_PRINT_RATE_NS: i64 = 2_000_000_000;
#[cfg(not(feature = "user-only"))]
const MAX_NB_PRINTS: u32 = 100;

#[cfg(not(feature = "user-only"))]
static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

#[cfg(not(feature = "user-only"))]
fn realtime_ns() -> i64 {
    CLOCK_BASE.elapsed().as_nanos() as i64
}

#[cfg(not(feature = "user-only"))]
#[derive(Default)]
struct DelayPrintState {
    threshold_delay: f64,
    last_realtime_clock: i64,
    nb_prints: u32,
}

#[cfg(not(feature = "user-only"))]
static DELAY_PRINT: Lazy<Mutex<DelayPrintState>> =
    Lazy::new(|| Mutex::new(DelayPrintState::default()));

/// Accumulated guest/host clock difference for one `cpu_exec`
/// activation.
pub struct SyncClocks {
    diff_clk: i64,
    last_cpu_icount: i64,
    realtime_clock: i64,
}

fn cpu_icount(cpu: &CpuState) -> i64 {
    cpu.icount_extra + cpu.icount_budget() as i64
}

#[cfg(not(feature = "user-only"))]
fn icount_to_ns(count: i64, shift: u32) -> i64 {
    count << shift
}

/// Rate-limited warning when the guest lags the host: at most one
/// message per two seconds and one hundred messages in total.
#[cfg(not(feature = "user-only"))]
fn print_delay(sc: &SyncClocks) {
    let mut st = DELAY_PRINT.lock().unwrap();
    if sc.realtime_clock - st.last_realtime_clock >= MAX_DELAY_PRINT_RATE_NS
        && st.nb_prints < MAX_NB_PRINTS
    {
        let late = -sc.diff_clk as f64 / 1e9;
        if late > st.threshold_delay || late < st.threshold_delay - THRESHOLD_REDUCE {
            st.threshold_delay = late.floor() + 1.0;
            log::warn!(
                "guest is now late by {:.1} to {:.1} seconds",
                st.threshold_delay - 1.0,
                st.threshold_delay
            );
            st.nb_prints += 1;
            st.last_realtime_clock = sc.realtime_clock;
        }
    }
}

impl SyncClocks {
    /// Seed the accumulator from the current clocks. The delay of the
    /// last executed slice is carried in `diff_clk`; sleeping drives
    /// it back to zero.
    pub fn init(cpu: &CpuState, cfg: &IcountConfig) -> Self {
        let mut sc = SyncClocks {
            diff_clk: 0,
            last_cpu_icount: cpu_icount(cpu),
            realtime_clock: 0,
        };
        #[cfg(not(feature = "user-only"))]
        if cfg.align {
            sc.realtime_clock = realtime_ns();
            print_delay(&sc);
        }
        #[cfg(feature = "user-only")]
        let _ = cfg;
        sc
    }

    /// Charge the instructions retired since the last call and sleep
    /// when the guest is more than the allowed advance ahead. An early
    /// wakeup leaves the unslept remainder in the accumulator.
    pub fn align(&mut self, cpu: &CpuState, cfg: &IcountConfig) {
        #[cfg(feature = "user-only")]
        {
            let _ = (cpu, cfg);
        }
        #[cfg(not(feature = "user-only"))]
        {
            if !cfg.align {
                return;
            }
            let cur = cpu_icount(cpu);
            self.diff_clk += icount_to_ns(self.last_cpu_icount - cur, cfg.shift);
            self.last_cpu_icount = cur;

            if self.diff_clk > VM_CLOCK_ADVANCE_NS {
                let req = libc::timespec {
                    tv_sec: (self.diff_clk / 1_000_000_000) as libc::time_t,
                    tv_nsec: (self.diff_clk % 1_000_000_000) as libc::c_long,
                };
                let mut rem = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                // SAFETY: both pointers are valid for the call.
                let r = unsafe { libc::nanosleep(&req, &mut rem) };
                self.diff_clk = if r < 0 {
                    rem.tv_sec as i64 * 1_000_000_000 + rem.tv_nsec as i64
                } else {
                    0
                };
            }
        }
    }

    /// Current accumulated advance in nanoseconds.
    pub fn diff_clk(&self) -> i64 {
        self.diff_clk
    }
}
