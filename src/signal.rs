//! POSIX-like signal infrastructure
//!
//! Provides per-process signal state (pending set, blocked mask, action
//! table), posting via `raise`, and delivery at the two safe points:
//! `return_to_user` for processes resuming to user mode, and `sigwait`
//! for processes parked in the kernel waiting for a signal.
//!
//! Signals interact with blocking syscalls in exactly one way: posting
//! an unblocked, non-ignored signal to a process blocked in the kernel
//! cancels its wait and resumes it with `-EINTR`, leaving the signal
//! pending for the next safe point. There is no other cancellation
//! mechanism.

use crate::error::{KernelError, KernelResult};
use crate::pcb::{PcbState, Pid};
use crate::sched::Dispatcher;
use crate::uaccess::UserMem;

// =============================================================================
// Signal Numbers
// =============================================================================

/// Hangup
pub const SIGHUP: u32 = 1;
/// Interrupt
pub const SIGINT: u32 = 2;
/// Quit
pub const SIGQUIT: u32 = 3;
/// Illegal instruction
pub const SIGILL: u32 = 4;
/// Trace/breakpoint trap
pub const SIGTRAP: u32 = 5;
/// Abort
pub const SIGABRT: u32 = 6;
/// Bus error
pub const SIGBUS: u32 = 7;
/// Floating point exception
pub const SIGFPE: u32 = 8;
/// Kill (cannot be caught or ignored)
pub const SIGKILL: u32 = 9;
/// User-defined signal 1
pub const SIGUSR1: u32 = 10;
/// Segmentation fault
pub const SIGSEGV: u32 = 11;
/// User-defined signal 2
pub const SIGUSR2: u32 = 12;
/// Broken pipe
pub const SIGPIPE: u32 = 13;
/// Alarm clock
pub const SIGALRM: u32 = 14;
/// Termination
pub const SIGTERM: u32 = 15;
/// Stack fault
pub const SIGSTKFLT: u32 = 16;
/// Child stopped or terminated
pub const SIGCHLD: u32 = 17;
/// Continue if stopped
pub const SIGCONT: u32 = 18;
/// Stop (cannot be caught or ignored)
pub const SIGSTOP: u32 = 19;
/// Keyboard stop
pub const SIGTSTP: u32 = 20;
/// Background read from tty
pub const SIGTTIN: u32 = 21;
/// Background write to tty
pub const SIGTTOU: u32 = 22;
/// Urgent condition on socket
pub const SIGURG: u32 = 23;
/// CPU time limit exceeded
pub const SIGXCPU: u32 = 24;
/// File size limit exceeded
pub const SIGXFSZ: u32 = 25;
/// Virtual alarm clock
pub const SIGVTALRM: u32 = 26;
/// Profiling timer expired
pub const SIGPROF: u32 = 27;
/// Window resize
pub const SIGWINCH: u32 = 28;
/// I/O possible
pub const SIGIO: u32 = 29;
/// Power failure
pub const SIGPWR: u32 = 30;
/// Bad system call
pub const SIGSYS: u32 = 31;

/// Maximum signal number
pub const NSIG: u32 = 31;

// =============================================================================
// Signal Set
// =============================================================================

/// Signal set (signals 1-31, bit N-1 corresponds to signal N)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct SigSet(pub u64);

impl SigSet {
    /// Empty signal set (no signals)
    pub const EMPTY: Self = Self(0);

    /// Create a new empty signal set
    pub const fn new() -> Self {
        Self(0)
    }

    /// Create a signal set from a raw bitmask
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Get the raw bitmask
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Check if signal is in set (signals are 1-indexed)
    pub fn contains(&self, sig: u32) -> bool {
        if sig == 0 || sig > NSIG {
            return false;
        }
        (self.0 & (1 << (sig - 1))) != 0
    }

    /// Add signal to set
    pub fn add(&mut self, sig: u32) {
        if sig > 0 && sig <= NSIG {
            self.0 |= 1 << (sig - 1);
        }
    }

    /// Remove signal from set
    pub fn remove(&mut self, sig: u32) {
        if sig > 0 && sig <= NSIG {
            self.0 &= !(1 << (sig - 1));
        }
    }

    /// Union with another set
    pub fn union(&self, other: &SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    /// Subtract another set
    pub fn subtract(&self, other: &SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    /// Check if no signals are set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Get the highest-numbered set signal
    ///
    /// Delivery prefers the highest signal number when several are
    /// pending at once.
    pub fn last(&self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(64 - self.0.leading_zeros())
        }
    }
}

/// Signals that cannot be caught, blocked, or ignored
pub const UNMASKABLE_SIGNALS: SigSet = SigSet((1 << (SIGKILL - 1)) | (1 << (SIGSTOP - 1)));

// =============================================================================
// Signal Actions
// =============================================================================

/// Signal action flags
pub mod sa_flags {
    /// Don't block the signal during its own handler
    pub const SA_NODEFER: u64 = 0x40000000;
    /// Reset handler to default after handling
    pub const SA_RESETHAND: u64 = 0x80000000;
}

/// Special handler value: default action
pub const SIG_DFL: u64 = 0;
/// Special handler value: ignore signal
pub const SIG_IGN: u64 = 1;

/// Signal disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    /// Default action for this signal
    #[default]
    Default,
    /// Ignore signal
    Ignore,
    /// User handler function at this address
    Handler(u64),
}

impl From<u64> for SigHandler {
    fn from(val: u64) -> Self {
        match val {
            SIG_DFL => Self::Default,
            SIG_IGN => Self::Ignore,
            addr => Self::Handler(addr),
        }
    }
}

impl From<SigHandler> for u64 {
    fn from(handler: SigHandler) -> u64 {
        match handler {
            SigHandler::Default => SIG_DFL,
            SigHandler::Ignore => SIG_IGN,
            SigHandler::Handler(addr) => addr,
        }
    }
}

/// Signal action (kernel-internal representation)
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    /// Handler function or disposition
    pub handler: SigHandler,
    /// Flags (SA_*)
    pub flags: u64,
    /// Signals to block during handler execution
    pub mask: SigSet,
}

impl SigAction {
    /// Create a new signal action with default handler
    pub const fn new() -> Self {
        Self {
            handler: SigHandler::Default,
            flags: 0,
            mask: SigSet::EMPTY,
        }
    }

    /// Check if this action ignores the signal
    pub fn is_ignore(&self) -> bool {
        matches!(self.handler, SigHandler::Ignore)
    }
}

impl Default for SigAction {
    fn default() -> Self {
        Self::new()
    }
}

/// How `sigprocmask` combines the supplied set with the current mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    /// Add the set to the mask
    Block,
    /// Remove the set from the mask
    Unblock,
    /// Replace the mask with the set
    SetMask,
}

// =============================================================================
// Per-Process Signal State
// =============================================================================

/// Out-of-band data recorded when a signal is posted
///
/// One slot per signal number; a re-raise of an already-pending signal
/// overwrites the slot rather than queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    /// Signal number
    pub signo: u32,
    /// Posting process, or None when posted by the kernel (alarm expiry)
    pub sender: Option<Pid>,
}

/// Signal state embedded in each PCB
#[derive(Debug, Clone)]
pub struct SignalState {
    /// Pending (posted, undelivered) signals
    pub pending: SigSet,
    /// Blocked (masked) signals
    pub blocked: SigSet,
    /// Signal actions indexed by signal number (index 0 unused)
    pub actions: [SigAction; (NSIG + 1) as usize],
    /// Info slot per signal number (index 0 unused)
    pub info: [Option<SigInfo>; (NSIG + 1) as usize],
}

impl SignalState {
    /// Fresh state: nothing pending, nothing blocked, all defaults
    pub fn new() -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: SigSet::EMPTY,
            actions: [SigAction::new(); (NSIG + 1) as usize],
            info: [None; (NSIG + 1) as usize],
        }
    }

    /// State for a child process: dispositions and mask carry over,
    /// pending signals do not
    pub fn inherit(&self) -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: self.blocked,
            actions: self.actions,
            info: [None; (NSIG + 1) as usize],
        }
    }

    /// Highest-numbered pending signal not in the blocked mask
    pub fn deliverable(&self) -> Option<u32> {
        self.pending.subtract(&self.blocked).last()
    }

    /// Remove a signal from pending and return its info
    fn consume(&mut self, signo: u32) -> Option<SigInfo> {
        self.pending.remove(signo);
        self.info[signo as usize].take()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// What the trap-return path must do for the resuming process
///
/// The dispatcher decides which signal (if any) is delivered; acting on
/// a default disposition (terminate, stop) is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing deliverable; resume user code where it left off
    None,
    /// Divert to a user handler
    Handler {
        /// Signal being delivered
        signo: u32,
        /// Handler entry point
        handler: u64,
        /// Mask to restore when the handler returns
        old_mask: SigSet,
    },
    /// Signal with default disposition; caller applies system policy
    Default(u32),
}

impl<M: UserMem> Dispatcher<M> {
    /// Post a signal to a process
    ///
    /// Sets the pending bit and records info. If the target is blocked
    /// in the kernel and the signal is unblocked: a target parked in
    /// `sigwait` consumes the signal and resumes with its number; any
    /// other wait is cancelled and the target resumes with `-EINTR`,
    /// the signal staying pending for the next safe point. Ignored
    /// signals never interrupt a wait.
    pub fn raise(&mut self, pid: Pid, signo: u32) -> KernelResult<()> {
        if signo == 0 || signo > NSIG {
            return Err(KernelError::InvalidArgument);
        }
        let sender = self.current();
        let pcb = self.table.lookup_mut(pid)?;
        if pcb.state == PcbState::Zombie {
            return Err(KernelError::NoProcess);
        }

        pcb.signal.pending.add(signo);
        pcb.signal.info[signo as usize] = Some(SigInfo { signo, sender });

        if pcb.state != PcbState::Blocked || pcb.signal.blocked.contains(signo) {
            return Ok(());
        }
        let in_sigwait = pcb.waiting_on == Some(pcb.sig_wq);
        let ignored = pcb.signal.actions[signo as usize].is_ignore();

        if in_sigwait {
            // sigwait consumes regardless of disposition
            pcb.signal.consume(signo);
            self.wake(pid, signo as i64);
        } else if !ignored {
            self.cancel_blocked_call(pid);
            self.wake(pid, KernelError::Interrupted.sysret());
        }
        Ok(())
    }

    /// Highest-numbered deliverable signal for a process, if any
    pub fn deliverable(&self, pid: Pid) -> Option<u32> {
        self.table.get(pid)?.signal.deliverable()
    }

    /// Examine or change the blocked-signal mask
    ///
    /// SIGKILL and SIGSTOP are silently excluded from the resulting
    /// mask. Returns the previous mask. Unblocking a pending signal
    /// does not deliver it here; it becomes deliverable at the next
    /// safe point.
    pub fn sigprocmask(&mut self, pid: Pid, how: SigMaskHow, set: SigSet) -> KernelResult<SigSet> {
        let pcb = self.table.lookup_mut(pid)?;
        let old = pcb.signal.blocked;
        let new = match how {
            SigMaskHow::Block => old.union(&set),
            SigMaskHow::Unblock => old.subtract(&set),
            SigMaskHow::SetMask => set,
        };
        pcb.signal.blocked = new.subtract(&UNMASKABLE_SIGNALS);
        Ok(old)
    }

    /// Install a signal action, returning the previous one
    ///
    /// The dispositions of SIGKILL and SIGSTOP cannot be changed.
    pub fn sigaction(&mut self, pid: Pid, signo: u32, act: SigAction) -> KernelResult<SigAction> {
        if signo == 0 || signo > NSIG || signo == SIGKILL || signo == SIGSTOP {
            return Err(KernelError::InvalidArgument);
        }
        let pcb = self.table.lookup_mut(pid)?;
        let old = pcb.signal.actions[signo as usize];
        pcb.signal.actions[signo as usize] = act;
        Ok(old)
    }

    /// Safe point on the path back to user mode
    ///
    /// Dequeues the deliverable signal for `pid` and reports what the
    /// trap-return code should do. Ignored signals are discarded here.
    /// For a handler delivery the action's mask plus the signal itself
    /// (absent SA_NODEFER) are blocked; SA_RESETHAND restores the
    /// default disposition.
    pub fn return_to_user(&mut self, pid: Pid) -> KernelResult<Delivery> {
        let pcb = self.table.lookup_mut(pid)?;
        loop {
            let signo = match pcb.signal.deliverable() {
                Some(s) => s,
                None => return Ok(Delivery::None),
            };
            pcb.signal.consume(signo);
            let action = pcb.signal.actions[signo as usize];
            match action.handler {
                SigHandler::Ignore => continue,
                SigHandler::Default => return Ok(Delivery::Default(signo)),
                SigHandler::Handler(addr) => {
                    let old_mask = pcb.signal.blocked;
                    let mut during = old_mask.union(&action.mask);
                    if action.flags & sa_flags::SA_NODEFER == 0 {
                        during.add(signo);
                    }
                    pcb.signal.blocked = during.subtract(&UNMASKABLE_SIGNALS);
                    if action.flags & sa_flags::SA_RESETHAND != 0 {
                        pcb.signal.actions[signo as usize] = SigAction::new();
                    }
                    return Ok(Delivery::Handler {
                        signo,
                        handler: addr,
                        old_mask,
                    });
                }
            }
        }
    }

    /// Dequeue a deliverable signal in-kernel (the `sigwait` fast path)
    ///
    /// Unlike `return_to_user` this consumes the signal regardless of
    /// its disposition.
    pub(crate) fn take_deliverable(&mut self, pid: Pid) -> Option<u32> {
        let pcb = self.table.get_mut(pid)?;
        let signo = pcb.signal.deliverable()?;
        pcb.signal.consume(signo);
        Some(signo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigset_bit_layout() {
        let mut set = SigSet::new();
        set.add(SIGHUP);
        assert_eq!(set.bits(), 1);
        set.add(SIGALRM);
        assert!(set.contains(SIGALRM));
        assert!(!set.contains(SIGTERM));
        set.remove(SIGHUP);
        assert_eq!(set.bits(), 1 << (SIGALRM - 1));
    }

    #[test]
    fn test_sigset_out_of_range_ignored() {
        let mut set = SigSet::new();
        set.add(0);
        set.add(NSIG + 1);
        assert!(set.is_empty());
        assert!(!set.contains(0));
        assert!(!set.contains(99));
    }

    #[test]
    fn test_last_prefers_highest() {
        let mut set = SigSet::new();
        set.add(SIGINT);
        set.add(SIGUSR1);
        set.add(SIGHUP);
        assert_eq!(set.last(), Some(SIGUSR1));
        set.remove(SIGUSR1);
        assert_eq!(set.last(), Some(SIGINT));
        assert_eq!(SigSet::EMPTY.last(), None);
    }

    #[test]
    fn test_deliverable_respects_mask() {
        let mut st = SignalState::new();
        st.pending.add(SIGTERM);
        st.pending.add(SIGUSR2);
        st.blocked.add(SIGTERM);
        assert_eq!(st.deliverable(), Some(SIGUSR2));
        st.blocked.add(SIGUSR2);
        assert_eq!(st.deliverable(), None);
    }

    #[test]
    fn test_inherit_drops_pending() {
        let mut st = SignalState::new();
        st.pending.add(SIGINT);
        st.blocked.add(SIGUSR1);
        st.actions[SIGTERM as usize].handler = SigHandler::Handler(0x4000);
        let child = st.inherit();
        assert!(child.pending.is_empty());
        assert!(child.blocked.contains(SIGUSR1));
        assert_eq!(
            child.actions[SIGTERM as usize].handler,
            SigHandler::Handler(0x4000)
        );
    }

    #[test]
    fn test_handler_roundtrip() {
        assert_eq!(SigHandler::from(SIG_DFL), SigHandler::Default);
        assert_eq!(SigHandler::from(SIG_IGN), SigHandler::Ignore);
        assert_eq!(SigHandler::from(0x1234), SigHandler::Handler(0x1234));
        assert_eq!(u64::from(SigHandler::Handler(0x1234)), 0x1234);
    }
}
