//! Timers — hardware countdown model and the delta-queue timer service
//!
//! Every module timer multiplexes onto one hardware countdown. Armed
//! timers sit in a delta queue: each entry stores its expiry relative to
//! the entry before it, so only the head is compared against the
//! countdown and the countdown is reprogrammed only when the head
//! changes.
//!
//! A timer control block is always in exactly one list:
//!
//! | list       | state                                   |
//! |------------|-----------------------------------------|
//! | delta queue| armed                                   |
//! | pool       | initialised, idle                       |
//! | prealloc   | reserved for a module, no id yet        |
//! | periodic   | repeating timer fired, awaiting re-arm  |
//!
//! Author: Moroya Sakamoto

use bitflags::bitflags;
use heapless::Vec;
use log::{debug, trace};

use crate::config::{
    MAX_PREALLOCATED_TIMERS, MAX_SLEEP_INTERVAL, MAX_TIMERS, TIMER_MAX_INTERVAL, TIMER_MIN_INTERVAL,
};
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqState, SoftIrq};
use crate::list::ClassList;
use crate::message::MsgFlags;
use crate::module::Pid;

/// Hardware countdown
///
/// Counts ticks up to a programmable top, then wraps to zero and signals
/// an interrupt. On a mote this wraps the 8-bit compare timer; on the
/// host it is advanced by software.
#[derive(Debug, Clone, Copy)]
pub struct SysTimer {
    /// Ticks into the current period
    counter: i32,
    /// Period length (compare value)
    interval: i32,
    /// Ticks since boot
    ticks: u32,
    /// Wraps of `ticks`
    overflows: u32,
}

impl SysTimer {
    /// Software countdown for simulation, idling at the longest period
    pub const fn software() -> Self {
        Self {
            counter: 0,
            interval: MAX_SLEEP_INTERVAL,
            ticks: 0,
            overflows: 0,
        }
    }

    /// Program a new period; the counter restarts from zero
    pub fn set_interval(&mut self, cnt: i32) {
        self.interval = cnt.clamp(TIMER_MIN_INTERVAL, MAX_SLEEP_INTERVAL);
        self.counter = 0;
    }

    /// Advance one tick, returning true when the period completes
    pub fn advance(&mut self) -> bool {
        let (ticks, wrapped) = self.ticks.overflowing_add(1);
        if wrapped {
            self.overflows += 1;
        }
        self.ticks = ticks;
        self.counter += 1;
        if self.counter >= self.interval {
            self.counter = 0;
            true
        } else {
            false
        }
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    pub fn interval(&self) -> i32 {
        self.interval
    }

    /// Ticks since boot
    pub fn now(&self) -> u32 {
        self.ticks
    }

    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Ticks since a reference point
    pub fn elapsed_since(&self, reference: u32) -> u32 {
        self.ticks.wrapping_sub(reference)
    }
}

bitflags! {
    /// Timer behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TimerType: u8 {
        /// Fire once, then return to the pool
        const ONE_SHOT = 0x01;
        /// Expiry delivered at normal rather than high priority
        const SLOW = 0x02;
    }
}

impl TimerType {
    pub const REPEAT: TimerType = TimerType::empty();
    pub const SLOW_REPEAT: TimerType = TimerType::SLOW;
    pub const SLOW_ONE_SHOT: TimerType = TimerType::from_bits_retain(0x03);
}

/// Timer control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerBlock {
    /// Owning module
    pub pid: Pid,
    /// Id within the owning module
    pub tid: u8,
    pub kind: TimerType,
    /// Period
    pub ticks: i32,
    /// Remaining ticks relative to the previous armed timer
    pub delta: i32,
}

impl TimerBlock {
    const EMPTY: TimerBlock = TimerBlock {
        pid: Pid::NULL,
        tid: 0,
        kind: TimerType::ONE_SHOT,
        ticks: 0,
        delta: 0,
    };
}

/// Where a timer currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// In the delta queue
    Armed,
    /// Initialised, not running
    Idle,
    /// Fired, waiting to be re-armed
    Fired,
}

/// A timer popped from the head of the delta queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub pid: Pid,
    pub tid: u8,
    /// Priority of the timeout message
    pub flags: MsgFlags,
}

const DELTAQ: u8 = 0;
const POOL: u8 = 1;
const PREALLOC: u8 = 2;
const PERIODIC: u8 = 3;
const FREE: u8 = 4;

/// Timer service
pub struct TimerQueue {
    blocks: [TimerBlock; MAX_TIMERS],
    lists: ClassList<5, MAX_TIMERS>,
}

impl TimerQueue {
    pub fn new() -> Self {
        let mut lists = ClassList::new();
        for slot in 0..MAX_TIMERS {
            lists.push_back(FREE, slot as u8);
        }
        Self {
            blocks: [TimerBlock::EMPTY; MAX_TIMERS],
            lists,
        }
    }

    fn find(&self, list: u8, pid: Pid, tid: u8) -> Option<u8> {
        let blocks = &self.blocks;
        self.lists.find(list, |s| {
            let b = &blocks[s as usize];
            b.pid == pid && b.tid == tid
        })
    }

    /// Unlink an armed timer, handing its remaining delta to its successor
    fn remove_armed(&mut self, slot: u8) {
        let delta = self.blocks[slot as usize].delta;
        if let Some(next) = self.lists.next(slot) {
            if delta > 0 {
                self.blocks[next as usize].delta += delta;
            }
        }
        self.lists.remove(slot);
    }

    /// Sorted insert into the delta queue
    ///
    /// A `fresh` timer's delta counts from now, so the ticks elapsed since
    /// the queue was last charged are added first; becoming the new head
    /// reprograms the countdown.
    fn insert(&mut self, irq: &IrqState, slot: u8, fresh: bool) {
        let Some(head) = self.lists.front(DELTAQ) else {
            if fresh {
                irq.set_hw_top(self.blocks[slot as usize].delta, false);
            }
            self.lists.push_front(DELTAQ, slot);
            return;
        };

        let hw_cnt = irq.elapsed();
        if fresh {
            self.blocks[slot as usize].delta += hw_cnt;
        }

        let delta = self.blocks[slot as usize].delta;
        if delta < self.blocks[head as usize].delta {
            self.blocks[head as usize].delta -= delta;
            if fresh {
                irq.set_hw_top(delta - hw_cnt, true);
            }
            self.lists.push_front(DELTAQ, slot);
            return;
        }

        let mut cur = Some(head);
        while let Some(c) = cur {
            let d = self.blocks[slot as usize].delta;
            if d < self.blocks[c as usize].delta {
                self.blocks[c as usize].delta -= d;
                self.lists.insert_before(slot, c);
                return;
            }
            self.blocks[slot as usize].delta -= self.blocks[c as usize].delta;
            cur = self.lists.next(c);
        }
        self.lists.push_back(DELTAQ, slot);
    }

    /// Reserve `count` control blocks for `pid`
    pub fn preallocate(&mut self, pid: Pid, count: u8) -> KernelResult<()> {
        if count as usize > MAX_PREALLOCATED_TIMERS {
            return Err(KernelError::InvalidArgument);
        }
        let mut taken: Vec<u8, MAX_PREALLOCATED_TIMERS> = Vec::new();
        for _ in 0..count {
            let Some(slot) = self.lists.front(FREE) else {
                for s in taken {
                    self.lists.push_back(FREE, s);
                }
                return Err(KernelError::NoMemory);
            };
            self.blocks[slot as usize] = TimerBlock {
                pid,
                ..TimerBlock::EMPTY
            };
            self.lists.push_back(PREALLOC, slot);
            let _ = taken.push(slot);
        }
        Ok(())
    }

    /// Create or retype timer `tid` of `pid`, leaving it idle
    ///
    /// Reuses, in order: the same timer waiting for re-arm, the same timer
    /// armed (stopped first), the same timer idle, a block reserved for
    /// `pid`, a free block.
    pub fn init(&mut self, pid: Pid, tid: u8, kind: TimerType) -> KernelResult<()> {
        let slot = if let Some(s) = self.find(PERIODIC, pid, tid) {
            s
        } else if let Some(s) = self.find(DELTAQ, pid, tid) {
            self.remove_armed(s);
            s
        } else if let Some(s) = self.find(POOL, pid, tid) {
            s
        } else {
            let blocks = &self.blocks;
            let reserved = self.lists.find(PREALLOC, |s| blocks[s as usize].pid == pid);
            let s = reserved
                .or_else(|| self.lists.front(FREE))
                .ok_or(KernelError::NoMemory)?;
            self.blocks[s as usize] = TimerBlock {
                pid,
                tid,
                ..TimerBlock::EMPTY
            };
            s
        };
        self.blocks[slot as usize].kind = kind;
        self.lists.push_back(POOL, slot);
        trace!("timer: init {}/{} as {:?}", pid, tid, kind);
        Ok(())
    }

    /// Arm an idle timer to fire after `interval` ticks
    ///
    /// The interval is clamped to `TIMER_MIN_INTERVAL..=TIMER_MAX_INTERVAL`.
    pub fn start(&mut self, irq: &IrqState, pid: Pid, tid: u8, interval: i32) -> KernelResult<()> {
        let slot = self
            .find(POOL, pid, tid)
            .ok_or(KernelError::InvalidArgument)?;
        let interval = interval.clamp(TIMER_MIN_INTERVAL, TIMER_MAX_INTERVAL);
        let b = &mut self.blocks[slot as usize];
        b.ticks = interval;
        b.delta = interval;
        self.lists.remove(slot);
        self.insert(irq, slot, true);
        trace!("timer: start {}/{} for {}", pid, tid, interval);
        Ok(())
    }

    /// Disarm a timer, leaving it idle
    pub fn stop(&mut self, pid: Pid, tid: u8) -> KernelResult<()> {
        if let Some(s) = self.find(PERIODIC, pid, tid) {
            self.lists.push_back(POOL, s);
        } else if let Some(s) = self.find(DELTAQ, pid, tid) {
            self.remove_armed(s);
            self.lists.push_back(POOL, s);
        } else {
            return Err(KernelError::InvalidArgument);
        }
        trace!("timer: stop {}/{}", pid, tid);
        Ok(())
    }

    /// Give an idle timer's control block back
    pub fn release(&mut self, pid: Pid, tid: u8) -> KernelResult<()> {
        let _ = self.stop(pid, tid);
        let slot = self
            .find(POOL, pid, tid)
            .ok_or(KernelError::InvalidArgument)?;
        self.blocks[slot as usize] = TimerBlock::EMPTY;
        self.lists.push_back(FREE, slot);
        Ok(())
    }

    /// Re-arm a timer wherever it is
    ///
    /// `interval <= 0` reuses the previous period. An interval below the
    /// hardware minimum leaves the timer idle and is refused.
    pub fn restart(&mut self, irq: &IrqState, pid: Pid, tid: u8, interval: i32) -> KernelResult<()> {
        let slot = if let Some(s) = self.find(PERIODIC, pid, tid) {
            self.lists.remove(s);
            s
        } else if let Some(s) = self.find(DELTAQ, pid, tid) {
            self.remove_armed(s);
            s
        } else if let Some(s) = self.find(POOL, pid, tid) {
            self.lists.remove(s);
            s
        } else {
            return Err(KernelError::InvalidArgument);
        };

        let b = &mut self.blocks[slot as usize];
        let interval = if interval <= 0 { b.ticks } else { interval };
        if interval < TIMER_MIN_INTERVAL {
            self.lists.push_back(POOL, slot);
            return Err(KernelError::NotPermitted);
        }
        let interval = interval.min(TIMER_MAX_INTERVAL);
        b.ticks = interval;
        b.delta = interval;
        self.insert(irq, slot, true);
        trace!("timer: restart {}/{} for {}", pid, tid, interval);
        Ok(())
    }

    /// Free every control block of `pid`, returning how many
    pub fn remove_all(&mut self, pid: Pid) -> usize {
        let mut removed = 0;
        for slot in 0..MAX_TIMERS as u8 {
            let Some(list) = self.lists.class_of(slot) else {
                continue;
            };
            if list == FREE || self.blocks[slot as usize].pid != pid {
                continue;
            }
            if list == DELTAQ {
                self.remove_armed(slot);
            }
            self.blocks[slot as usize] = TimerBlock::EMPTY;
            self.lists.push_back(FREE, slot);
            removed += 1;
        }
        if removed > 0 {
            debug!("timer: released {} timers of {}", removed, pid);
        }
        removed
    }

    /// Charge the outstanding ticks to the delta queue
    pub fn update_delta(&mut self, irq: &IrqState) {
        let mut delta = irq.take_outstanding();
        let mut cur = self.lists.front(DELTAQ);
        while let Some(c) = cur {
            let b = &mut self.blocks[c as usize];
            if b.delta >= delta {
                b.delta -= delta;
                return;
            }
            let used = b.delta;
            b.delta -= delta;
            delta -= used;
            cur = self.lists.next(c);
        }
    }

    /// Pop the head if it has expired
    ///
    /// Repeating timers move to the periodic list with their next expiry
    /// (skipping any periods missed while the kernel was busy); one-shot
    /// timers go back to the pool.
    pub fn pop_expired(&mut self) -> Option<Expiry> {
        let head = self.lists.front(DELTAQ)?;
        if self.blocks[head as usize].delta > 0 {
            return None;
        }
        self.lists.remove(head);
        let b = &mut self.blocks[head as usize];
        let flags = if b.kind.contains(TimerType::SLOW) {
            MsgFlags::empty()
        } else {
            MsgFlags::HIGH_PRIORITY
        };
        let expiry = Expiry {
            pid: b.pid,
            tid: b.tid,
            flags,
        };
        if b.kind.contains(TimerType::ONE_SHOT) {
            self.lists.push_back(POOL, head);
        } else {
            let period = b.ticks.max(TIMER_MIN_INTERVAL);
            while b.delta <= 0 {
                b.delta += period;
            }
            self.lists.push_back(PERIODIC, head);
        }
        Some(expiry)
    }

    /// Re-arm fired repeating timers and program the countdown for the
    /// new head (or the longest sleep when nothing is armed)
    pub fn rearm(&mut self, irq: &IrqState) {
        while let Some(slot) = self.lists.pop_front(PERIODIC) {
            self.insert(irq, slot, false);
        }
        match self.lists.front(DELTAQ) {
            Some(head) => {
                let remaining = self.blocks[head as usize].delta - irq.elapsed();
                if remaining > 0 {
                    irq.set_hw_top(remaining, true);
                } else {
                    irq.raise(SoftIrq::TIMER);
                }
            }
            None => irq.set_hw_top(MAX_SLEEP_INTERVAL, false),
        }
    }

    pub fn state(&self, pid: Pid, tid: u8) -> Option<TimerState> {
        if self.find(DELTAQ, pid, tid).is_some() {
            Some(TimerState::Armed)
        } else if self.find(POOL, pid, tid).is_some() {
            Some(TimerState::Idle)
        } else if self.find(PERIODIC, pid, tid).is_some() {
            Some(TimerState::Fired)
        } else {
            None
        }
    }

    /// Ticks until an armed timer fires, as of the last charge
    pub fn remaining(&self, pid: Pid, tid: u8) -> Option<i32> {
        let mut sum = 0;
        for s in self.lists.iter(DELTAQ) {
            let b = &self.blocks[s as usize];
            sum += b.delta;
            if b.pid == pid && b.tid == tid {
                return Some(sum);
            }
        }
        None
    }

    /// Armed timers in expiry order
    pub fn armed(&self) -> impl Iterator<Item = &TimerBlock> + '_ {
        self.lists
            .iter(DELTAQ)
            .map(move |s| &self.blocks[s as usize])
    }

    /// Control blocks held by `pid` in any list
    pub fn owned_by(&self, pid: Pid) -> usize {
        (0..MAX_TIMERS as u8)
            .filter(|&s| {
                matches!(self.lists.class_of(s), Some(list) if list != FREE)
                    && self.blocks[s as usize].pid == pid
            })
            .count()
    }

    /// Reserved, unnamed blocks of `pid`
    pub fn reserved_for(&self, pid: Pid) -> usize {
        self.lists
            .iter(PREALLOC)
            .filter(|&s| self.blocks[s as usize].pid == pid)
            .count()
    }

    /// Free control blocks
    pub fn available(&self) -> usize {
        self.lists.len(FREE)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
