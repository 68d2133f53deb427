//! ALICE-Mote — message-passing kernel core for sensor motes
//!
//! Modules are message handlers with a private state block. The kernel
//! routes messages between them, owns their memory and timers, and runs
//! one handler at a time:
//! - Block heap with per-block owners (no global allocator)
//! - Delta-queue timers driven by one hardware countdown
//! - Module registry with fixed and dynamic ids
//! - Cooperative or priority-preemptive message dispatch
//! - Fixed pools throughout, < 8 KB RAM at default sizing
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod error;
pub mod list;
pub mod module;
pub mod malloc;
pub mod message;
pub mod irq;
pub mod timer;
pub mod registry;
pub mod scheduler;
pub mod syscall;
pub mod kernel;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use irq::{IrqState, RealtimeFn, SoftIrq};
pub use kernel::{Kernel, KernelStats};
pub use malloc::{Heap, MemPtr};
pub use message::{Message, MessageQueue, MsgFlags, MsgType, Payload};
pub use module::{ModuleFlags, ModuleHandler, ModuleHeader, Pid, Priority};
pub use registry::{ModuleControl, Registry};
pub use timer::{SysTimer, TimerQueue, TimerType};
