//! Kernel — the one owner of all kernel state
//!
//! Heap, timers, registry, message pool and interrupt state live in a
//! single `Kernel` value built at boot and handed by `&mut` to every
//! handler, so independent kernels can run side by side in tests.
//!
//! Author: Moroya Sakamoto

use heapless::Vec;
use log::{error, info};

use crate::config::{KernelConfig, HEAP_SIZE, PID_STACK_DEPTH};
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqState;
use crate::malloc::Heap;
use crate::message::{Message, MessageQueue, MsgType};
use crate::module::{ModuleHeader, Pid, Priority};
use crate::registry::Registry;
use crate::timer::{TimerQueue, TimerType};

/// Message-passing kernel
///
/// Memory footprint (64-bit host, default sizing):
/// - Heap: 4 KB
/// - Message pool: 32 headers + links
/// - Registry: 24 control blocks
/// - Timers: 32 control blocks
/// - Total: < 8 KB
pub struct Kernel {
    pub config: KernelConfig,
    /// Dynamic memory
    pub heap: Heap<HEAP_SIZE>,
    /// Timer control blocks and the delta queue
    pub timers: TimerQueue,
    /// Module control blocks
    pub registry: Registry,
    /// Message pool and run queue
    pub queue: MessageQueue,
    /// State shared with interrupt handlers
    pub irq: IrqState,
    /// Modules interrupted by the running handler, innermost last
    pub(crate) pid_stack: Vec<Pid, PID_STACK_DEPTH>,
    pub(crate) preemption_enabled: bool,
    pub(crate) stalled: bool,
    pub(crate) halted: bool,
    /// Module whose system call panicked, removed when its handler returns
    pub(crate) fault: Option<Pid>,
    pub(crate) rng: u16,
    pub(crate) stats: KernelStats,
}

static MEMORY_DAEMON: ModuleHeader = ModuleHeader::new(Pid::MEMORY, memory_daemon).with_priority(Priority::LOW);

/// Periodic collection of scheduler-owned memory
fn memory_daemon(k: &mut Kernel, msg: &mut Message) -> KernelResult<()> {
    match msg.kind {
        MsgType::INIT => {
            let period = k.config.gc_period.ok_or(KernelError::InvalidArgument)?;
            k.timer_start(0, period, TimerType::SLOW_REPEAT)
        }
        MsgType::TIMER_TIMEOUT => {
            k.gc_kernel();
            Ok(())
        }
        MsgType::FINAL => Ok(()),
        _ => Err(KernelError::InvalidArgument),
    }
}

impl Kernel {
    /// Boot a kernel; the memory daemon starts if a GC period is set
    pub fn new(config: KernelConfig) -> Self {
        let mut kernel = Self {
            config,
            heap: Heap::new(),
            timers: TimerQueue::new(),
            registry: Registry::new(),
            queue: MessageQueue::new(),
            irq: IrqState::new(),
            pid_stack: Vec::new(),
            preemption_enabled: true,
            stalled: false,
            halted: false,
            fault: None,
            rng: config.seed.max(1),
            stats: KernelStats::default(),
        };
        if config.gc_period.is_some() {
            if let Err(e) = kernel.register_kernel_module(&MEMORY_DAEMON) {
                error!("kernel: memory daemon failed to start: {}", e);
            }
        }
        info!(
            "kernel: node {:#06x} up ({}, recovery {})",
            config.node_address,
            if config.preemptive { "preemptive" } else { "cooperative" },
            if config.fault_recovery { "on" } else { "off" }
        );
        kernel
    }

    /// Kernel for host tests (node 1, cooperative)
    pub fn testing() -> Self {
        Self::new(KernelConfig::testing())
    }

    /// One hardware tick: run due realtime callbacks, then do all
    /// pending work. Returns the units of work done.
    pub fn tick(&mut self) -> usize {
        for f in self.irq.hw_tick() {
            f();
        }
        self.stats.ticks += 1;
        self.run()
    }

    /// Simulate `ticks` hardware ticks
    pub fn run_for(&mut self, ticks: u32) -> KernelStats {
        for _ in 0..ticks {
            self.tick();
        }
        self.stats
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    /// Stop the node
    pub fn halt(&mut self) {
        error!("kernel: halted at tick {}", self.irq.system_time());
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Memory footprint estimate
    pub fn memory_footprint(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::testing()
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Hardware ticks simulated
    pub ticks: u64,
    /// Messages handed to a handler
    pub dispatched: u64,
    /// Messages for unknown modules
    pub dropped: u64,
    /// Network messages for other nodes
    pub filtered: u64,
    /// Nested dispatches
    pub preemptions: u64,
    /// Timer soft interrupts serviced
    pub soft_interrupts: u64,
    /// Timer expiries delivered
    pub timer_expiries: u64,
    /// Modules removed after a panic
    pub faults: u64,
}
