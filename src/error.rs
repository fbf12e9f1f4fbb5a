//! Unified dispatcher error type
//!
//! KernelError uses `#[repr(i32)]` with discriminants equal to errno values.
//! This eliminates all error translation - the discriminant IS the errno.
//!
//! The taxonomy is deliberately small: every error here is returned to the
//! caller as the result of a kernel entry and none of them is kernel-fatal.
//! Internal invariant violations (double-enqueue, reaping a non-zombie PCB,
//! waking a PCB that is not blocked) are programming errors caught by
//! `debug_assert!` and are not representable here.

/// Dispatcher error type with errno values as discriminants
///
/// Each variant's value is its errno. This allows zero-cost conversion
/// to syscall return values via simple negation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// No such process (ESRCH) - bad pid target for send/reply/kill
    NoProcess = 3,
    /// Interrupted kernel entry (EINTR) - a blocking wait was cut short
    /// by signal delivery
    Interrupted = 4,
    /// Bad address (EFAULT) - a user buffer failed verify-and-copy
    BadAddress = 14,
    /// Invalid argument (EINVAL) - malformed signal number, zero length,
    /// reply to a sender that is not awaiting one
    InvalidArgument = 22,
}

impl KernelError {
    /// Return negative errno for a syscall return value (i64)
    ///
    /// Example: `KernelError::NoProcess.sysret()` returns -3
    #[inline]
    pub const fn sysret(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Get the positive errno value
    #[inline]
    pub const fn errno(self) -> i32 {
        self as i32
    }
}

/// Result type alias for dispatcher operations
pub type KernelResult<T> = Result<T, KernelError>;
