//! Module descriptors — ids, priorities, headers, control flags
//!
//! A module is a message handler plus a state block. Its header is a
//! read-only descriptor (`&'static ModuleHeader`) that the registry only
//! reads through fields, never through raw addresses.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use bitflags::bitflags;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::message::Message;

/// Module identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u8);

impl Pid {
    /// Scheduler (kernel context, owner of in-flight payloads)
    pub const SCHED: Pid = Pid(2);
    /// Memory daemon
    pub const MEMORY: Pid = Pid(3);
    /// Source of timer expiry messages
    pub const TIMER: Pid = Pid(4);
    /// First application module id
    pub const APP_MIN: Pid = Pid(128);
    /// Last id a fixed-id module may use
    pub const APP_MAX: Pid = Pid(223);
    /// First id of the dynamic pool
    pub const THREAD_MIN: Pid = Pid(224);
    /// Last id of the dynamic pool
    pub const MAX: Pid = Pid(254);
    /// No owner
    pub const NULL: Pid = Pid(255);

    /// Id handed out from the dynamic pool
    pub const fn is_thread(self) -> bool {
        self.0 >= Self::THREAD_MIN.0 && self.0 <= Self::MAX.0
    }

    /// Built-in kernel id
    pub const fn is_kernel(self) -> bool {
        self.0 < Self::APP_MIN.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Module priority (higher number preempts lower)
///
/// Only consulted by the preemptive scheduler: a message inherits the
/// priority of its destination module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    /// Never preempts anything
    pub const IDLE: Priority = Priority(0);
    /// Background work
    pub const LOW: Priority = Priority(1);
    /// Ordinary application modules
    pub const NORMAL: Priority = Priority(2);
    /// Protocol and driver modules
    pub const HIGH: Priority = Priority(3);
    /// Radio timing and similar
    pub const CRITICAL: Priority = Priority(4);
}

/// Message handler entry point
pub type ModuleHandler = fn(&mut Kernel, &mut Message) -> KernelResult<()>;

bitflags! {
    /// Per-module control flags
    ///
    /// The low nibble belongs to the kernel, the high nibble holds the
    /// message-filtering rules a module may change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModuleFlags: u8 {
        /// Kernel module registered at boot
        const STATIC = 0x02;
        /// Id taken from the dynamic pool
        const THREAD = 0x04;
        /// Final message being delivered
        const FINALIZING = 0x08;
        /// Accept network messages addressed to other nodes
        const PROMISCUOUS = 0x40;
    }
}

impl ModuleFlags {
    /// Kernel-owned bits
    pub const KERNEL_MASK: u8 = 0x0F;
    /// Module-settable rule bits
    pub const RULES_MASK: u8 = 0xF0;
}

/// Read-only module descriptor
#[derive(Clone, Copy)]
pub struct ModuleHeader {
    /// Fixed id (ignored for spawned modules)
    pub pid: Pid,
    /// Program image identifier, shared by every instance of one image
    pub code_id: u16,
    /// Bytes of state allocated at registration
    pub state_size: u16,
    /// Timers reserved at registration
    pub num_timers: u8,
    /// Preemption priority
    pub priority: Priority,
    /// Modules this one calls synchronously; never preempted into
    /// while any of them is on the call chain
    pub dependencies: &'static [Pid],
    /// Message handler
    pub handler: ModuleHandler,
}

impl ModuleHeader {
    /// Descriptor with no state, timers or dependencies
    pub const fn new(pid: Pid, handler: ModuleHandler) -> Self {
        Self {
            pid,
            code_id: pid.0 as u16,
            state_size: 0,
            num_timers: 0,
            priority: Priority::NORMAL,
            dependencies: &[],
            handler,
        }
    }

    pub const fn with_state(self, state_size: u16) -> Self {
        Self { state_size, ..self }
    }

    pub const fn with_timers(self, num_timers: u8) -> Self {
        Self { num_timers, ..self }
    }

    pub const fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub const fn with_code_id(self, code_id: u16) -> Self {
        Self { code_id, ..self }
    }

    pub const fn with_dependencies(self, dependencies: &'static [Pid]) -> Self {
        Self {
            dependencies,
            ..self
        }
    }
}

impl fmt::Debug for ModuleHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHeader")
            .field("pid", &self.pid)
            .field("code_id", &self.code_id)
            .field("state_size", &self.state_size)
            .field("num_timers", &self.num_timers)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
