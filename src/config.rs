//! Kernel configuration — compile-time sizing and boot options
//!
//! Every pool in the kernel is a fixed array sized here. Nothing grows
//! at runtime; exhaustion surfaces as `KernelError::NoMemory`.
//!
//! Author: Moroya Sakamoto

/// Allocator block size in bytes (all allocations round up to this)
pub const BLOCK_SIZE: usize = 8;

/// Dynamic heap size in bytes
pub const HEAP_SIZE: usize = 4096;

/// Hash buckets in the module registry
pub const MODULE_BINS: usize = 8;

/// Module control blocks
pub const MAX_MODULES: usize = 24;

/// Timer control blocks (armed, idle, reserved and fired together)
pub const MAX_TIMERS: usize = 32;

/// Timers a module header may ask to reserve at registration
pub const MAX_PREALLOCATED_TIMERS: usize = 4;

/// Message headers (queued plus parked send-done originals)
pub const MSG_POOL_SIZE: usize = 32;

/// Depth of the interrupted-module stack
pub const PID_STACK_DEPTH: usize = 8;

/// Shortest interval the hardware countdown accepts, in ticks
pub const TIMER_MIN_INTERVAL: i32 = 2;

/// Longest interval a software timer accepts; longer requests are capped
pub const TIMER_MAX_INTERVAL: i32 = i32::MAX / 2;

/// Longest hardware countdown, used when no timer is armed
pub const MAX_SLEEP_INTERVAL: i32 = 250;

/// Realtime clock callback slots
pub const MAX_REALTIME_CLOCK: usize = 4;

/// Default memory daemon period in ticks
pub const MEM_GC_PERIOD: i32 = 10 * 1024;

/// Pending-block limit of the conservative pointer scan
pub const GC_SCAN_DEPTH: usize = 16;

/// Network broadcast address
pub const BCAST_ADDRESS: u16 = 0xFFFF;

/// Boot-time kernel options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// This node's network address
    pub node_address: u16,
    /// Priority-ordered queue with nested dispatch
    pub preemptive: bool,
    /// Deregister a faulting module instead of halting the node
    pub fault_recovery: bool,
    /// Run the memory daemon with this period (ticks)
    pub gc_period: Option<i32>,
    /// Seed for `random16`
    pub seed: u16,
}

impl KernelConfig {
    /// Cooperative kernel with fault recovery on
    pub const fn new(node_address: u16) -> Self {
        Self {
            node_address,
            preemptive: false,
            fault_recovery: true,
            gc_period: None,
            seed: 0xACE1,
        }
    }

    /// Configuration used by host tests (node 1)
    pub const fn testing() -> Self {
        Self::new(1)
    }

    pub const fn with_preemption(self, preemptive: bool) -> Self {
        Self { preemptive, ..self }
    }

    pub const fn with_fault_recovery(self, fault_recovery: bool) -> Self {
        Self {
            fault_recovery,
            ..self
        }
    }

    /// Enable the memory daemon
    pub const fn with_gc_period(self, period: i32) -> Self {
        Self {
            gc_period: Some(period),
            ..self
        }
    }

    pub const fn with_seed(self, seed: u16) -> Self {
        Self { seed, ..self }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::testing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.node_address, 1);
        assert!(!config.preemptive);
        assert!(config.fault_recovery);
        assert_eq!(config.gc_period, None);
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::new(7)
            .with_preemption(true)
            .with_fault_recovery(false)
            .with_gc_period(MEM_GC_PERIOD);
        assert_eq!(config.node_address, 7);
        assert!(config.preemptive);
        assert!(!config.fault_recovery);
        assert_eq!(config.gc_period, Some(10 * 1024));
    }

    #[test]
    fn test_heap_geometry() {
        assert_eq!(HEAP_SIZE % BLOCK_SIZE, 0);
        assert!(HEAP_SIZE <= u16::MAX as usize);
        assert!(TIMER_MIN_INTERVAL < MAX_SLEEP_INTERVAL);
        assert!(MAX_SLEEP_INTERVAL < TIMER_MAX_INTERVAL);
    }
}
