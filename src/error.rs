//! Kernel errors — one taxonomy for every subsystem
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::module::Pid;

/// Result alias used across the kernel
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Heap, pool or slot exhausted
    #[error("out of memory")]
    NoMemory,

    /// Bad id, bad pointer, or object not in the expected state
    #[error("invalid argument")]
    InvalidArgument,

    /// Module id already registered
    #[error("module already registered")]
    AlreadyExists,

    /// Request refused (e.g. interval below the hardware minimum)
    #[error("operation not permitted")]
    NotPermitted,

    /// Lookup found nothing
    #[error("no such entry")]
    NotFound,

    /// Guard byte does not match the owner tag
    #[error("heap block corrupted")]
    Corruption,

    /// The calling module faulted and is being torn down
    #[error("module {0} panicked")]
    ModulePanic(Pid),

    /// The node stopped after an unrecoverable fault
    #[error("kernel halted")]
    Halted,
}

impl KernelError {
    /// Classic negative errno
    pub const fn errno(self) -> i8 {
        match self {
            Self::NoMemory => -12,
            Self::InvalidArgument => -22,
            Self::AlreadyExists => -17,
            Self::NotPermitted => -1,
            Self::NotFound => -3,
            Self::Corruption => -14,
            Self::ModulePanic(_) => -4,
            Self::Halted => -5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KernelError::NoMemory.errno(), -12);
        assert_eq!(KernelError::InvalidArgument.errno(), -22);
        assert_eq!(KernelError::AlreadyExists.errno(), -17);
        assert_eq!(KernelError::NotPermitted.errno(), -1);
    }

    #[test]
    fn test_display() {
        let msg = format!("{}", KernelError::ModulePanic(Pid(130)));
        assert_eq!(msg, "module 130 panicked");
    }
}
