//! Interrupt context — state shared between ISRs and the kernel loop
//!
//! The kernel loop owns everything else through `&mut Kernel`. The few
//! values an interrupt handler touches live here, each behind
//! `critical_section::Mutex<Cell<_>>`, and are only read or written with
//! interrupts masked:
//!
//! - the hardware countdown (`SysTimer`)
//! - ticks counted by the countdown but not yet charged to the delta queue
//! - pending soft interrupts
//! - the currently executing module id
//! - realtime clock slots
//!
//! Author: Moroya Sakamoto

use core::cell::Cell;

use bitflags::bitflags;
use critical_section::Mutex;
use heapless::Vec;
use log::trace;

use crate::config::MAX_REALTIME_CLOCK;
use crate::error::{KernelError, KernelResult};
use crate::module::Pid;
use crate::timer::SysTimer;

bitflags! {
    /// Work posted by interrupt handlers for the kernel loop
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SoftIrq: u8 {
        /// Hardware countdown expired
        const TIMER = 0x01;
    }
}

/// Realtime clock callback, run in interrupt context
pub type RealtimeFn = fn();

#[derive(Clone, Copy)]
struct RealtimeClock {
    value: u16,
    interval: u16,
    f: Option<RealtimeFn>,
}

impl RealtimeClock {
    const IDLE: RealtimeClock = RealtimeClock {
        value: 0,
        interval: 0,
        f: None,
    };
}

/// Interrupt-shared kernel state
pub struct IrqState {
    hw: Mutex<Cell<SysTimer>>,
    outstanding: Mutex<Cell<i32>>,
    pending: Mutex<Cell<SoftIrq>>,
    current: Mutex<Cell<Pid>>,
    clocks: Mutex<Cell<[RealtimeClock; MAX_REALTIME_CLOCK]>>,
}

impl IrqState {
    pub const fn new() -> Self {
        Self {
            hw: Mutex::new(Cell::new(SysTimer::software())),
            outstanding: Mutex::new(Cell::new(0)),
            pending: Mutex::new(Cell::new(SoftIrq::empty())),
            current: Mutex::new(Cell::new(Pid::SCHED)),
            clocks: Mutex::new(Cell::new([RealtimeClock::IDLE; MAX_REALTIME_CLOCK])),
        }
    }

    /// One hardware tick (the timer ISR body)
    ///
    /// When the countdown reaches its top the elapsed interval is added
    /// to the outstanding ticks and the timer soft interrupt is posted.
    /// Returns the realtime callbacks that came due on this tick.
    pub fn hw_tick(&self) -> Vec<RealtimeFn, MAX_REALTIME_CLOCK> {
        critical_section::with(|cs| {
            let hw = self.hw.borrow(cs);
            let mut timer = hw.get();
            if timer.advance() {
                let out = self.outstanding.borrow(cs);
                out.set(out.get() + timer.interval());
                let pending = self.pending.borrow(cs);
                pending.set(pending.get() | SoftIrq::TIMER);
            }
            hw.set(timer);

            let slots = self.clocks.borrow(cs);
            let mut clocks = slots.get();
            let mut due = Vec::new();
            for clock in clocks.iter_mut() {
                let Some(f) = clock.f else { continue };
                clock.value = clock.value.saturating_sub(1);
                if clock.value == 0 {
                    let _ = due.push(f);
                    if clock.interval == 0 {
                        clock.f = None;
                    } else {
                        clock.value = clock.interval;
                    }
                }
            }
            slots.set(clocks);
            due
        })
    }

    /// Reprogram the countdown to expire `cnt` ticks from now
    ///
    /// With `keep_outstanding` the ticks already counted in the current
    /// period are kept as outstanding; otherwise outstanding is cleared.
    /// The interval is clamped to the hardware range and the counter
    /// restarts from zero.
    pub fn set_hw_top(&self, cnt: i32, keep_outstanding: bool) {
        critical_section::with(|cs| {
            let hw = self.hw.borrow(cs);
            let mut timer = hw.get();
            let out = self.outstanding.borrow(cs);
            if keep_outstanding {
                out.set(out.get() + timer.counter());
            } else {
                out.set(0);
            }
            timer.set_interval(cnt);
            trace!("irq: countdown set to {} (requested {})", timer.interval(), cnt);
            hw.set(timer);
        })
    }

    /// Ticks elapsed since the delta queue was last charged
    pub fn elapsed(&self) -> i32 {
        critical_section::with(|cs| self.outstanding.borrow(cs).get() + self.hw.borrow(cs).get().counter())
    }

    /// Claim the outstanding ticks
    pub fn take_outstanding(&self) -> i32 {
        critical_section::with(|cs| self.outstanding.borrow(cs).replace(0))
    }

    pub fn outstanding(&self) -> i32 {
        critical_section::with(|cs| self.outstanding.borrow(cs).get())
    }

    /// Hardware countdown snapshot
    pub fn timer(&self) -> SysTimer {
        critical_section::with(|cs| self.hw.borrow(cs).get())
    }

    /// Ticks since boot
    pub fn system_time(&self) -> u32 {
        self.timer().now()
    }

    /// Post a soft interrupt
    pub fn raise(&self, irq: SoftIrq) {
        critical_section::with(|cs| {
            let pending = self.pending.borrow(cs);
            pending.set(pending.get() | irq);
        })
    }

    /// Clear and report a pending soft interrupt
    pub fn take(&self, irq: SoftIrq) -> bool {
        critical_section::with(|cs| {
            let pending = self.pending.borrow(cs);
            let was = pending.get();
            pending.set(was.difference(irq));
            was.contains(irq)
        })
    }

    pub fn is_pending(&self) -> bool {
        critical_section::with(|cs| !self.pending.borrow(cs).get().is_empty())
    }

    /// Module whose handler is running
    pub fn current(&self) -> Pid {
        critical_section::with(|cs| self.current.borrow(cs).get())
    }

    pub fn set_current(&self, pid: Pid) {
        critical_section::with(|cs| self.current.borrow(cs).set(pid))
    }

    /// Start a realtime clock: `f` runs after `value` ticks, then every
    /// `interval` ticks (`interval == 0` runs it once)
    pub fn realtime_start(&self, value: u16, interval: u16, f: RealtimeFn) -> KernelResult<()> {
        critical_section::with(|cs| {
            let slots = self.clocks.borrow(cs);
            let mut clocks = slots.get();
            let free = clocks
                .iter_mut()
                .find(|c| c.f.is_none())
                .ok_or(KernelError::NoMemory)?;
            *free = RealtimeClock {
                value: value.max(1),
                interval,
                f: Some(f),
            };
            slots.set(clocks);
            Ok(())
        })
    }

    /// Stop the realtime clock running `f`
    pub fn realtime_stop(&self, f: RealtimeFn) -> KernelResult<()> {
        critical_section::with(|cs| {
            let slots = self.clocks.borrow(cs);
            let mut clocks = slots.get();
            let slot = clocks
                .iter_mut()
                .find(|c| c.f.is_some_and(|g| g as usize == f as usize))
                .ok_or(KernelError::InvalidArgument)?;
            *slot = RealtimeClock::IDLE;
            slots.set(clocks);
            Ok(())
        })
    }

    /// Realtime clocks in use
    pub fn realtime_count(&self) -> usize {
        critical_section::with(|cs| {
            self.clocks
                .borrow(cs)
                .get()
                .iter()
                .filter(|c| c.f.is_some())
                .count()
        })
    }
}

impl Default for IrqState {
    fn default() -> Self {
        Self::new()
    }
}
