//! Kernel entry points
//!
//! Thin dispatch layer between the trap/entry collaborator and the
//! dispatcher core. Each entry takes raw scalar arguments as they arrive
//! from user space, validates them, and either completes immediately or
//! parks the caller. The split is explicit in the return type: a blocked
//! entry produces no value now; the call's result arrives in the PCB's
//! `wait_result` when a wake path resumes the process, and the
//! trap-return collaborator materializes it into the resumed context.

use crate::error::{KernelError, KernelResult};
use crate::pcb::{Context, Pid};
use crate::sched::Dispatcher;
use crate::signal::{SigAction, SigMaskHow, SigSet, SIGALRM};
use crate::timer::{TimerAction, TimerFlags, TICK_HZ};
use crate::uaccess::UserMem;

/// Outcome of a kernel entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The call finished; return this value to user space
    Done(i64),
    /// The caller is parked; its result arrives through `wait_result`
    Blocked,
}

/// `sigprocmask` how value: add to the mask
pub const SIG_BLOCK: u32 = 0;
/// `sigprocmask` how value: remove from the mask
pub const SIG_UNBLOCK: u32 = 1;
/// `sigprocmask` how value: replace the mask
pub const SIG_SETMASK: u32 = 2;

impl<M: UserMem> Dispatcher<M> {
    /// Create a child of the calling process
    ///
    /// Returns the child pid. The child inherits the caller's signal
    /// dispositions and blocked mask and joins the tail of the ready
    /// queue.
    pub fn sys_create(&mut self, context: u64) -> KernelResult<Completion> {
        let parent = self.current_pid();
        let pid = self.spawn(Context(context), Some(parent))?;
        Ok(Completion::Done(pid.raw() as i64))
    }

    /// Voluntarily give up the CPU
    ///
    /// The entry itself is a no-op; the caller stays RUNNING and the
    /// reschedule on the return path rotates it to the tail of the
    /// ready queue.
    pub fn sys_yield(&mut self) -> KernelResult<Completion> {
        let _ = self.current_pid();
        Ok(Completion::Done(0))
    }

    /// Terminate the calling process
    ///
    /// Never returns to the caller; the zombie waits for a collector to
    /// reap its exit status.
    pub fn sys_exit(&mut self, status: i32) -> KernelResult<Completion> {
        self.exit_current(status);
        Ok(Completion::Blocked)
    }

    /// Sleep for `ms` milliseconds (one tick each)
    ///
    /// Blocks until the wakeup timer fires; the resumed call returns 0,
    /// or `-EINTR` if a signal cancelled the sleep early.
    pub fn sys_sleep(&mut self, ms: u64) -> KernelResult<Completion> {
        let pid = self.current_pid();
        if ms == 0 {
            return Ok(Completion::Done(0));
        }
        let handle = self.timer_create(TimerAction::Wake { pid, rc: 0 }, TimerFlags::empty());
        self.timer_start(handle, ms);
        let pcb = self.table.get_mut(pid).expect("current pid not in table");
        pcb.sleep_timer = Some(handle);
        let sleep_wq = pcb.sleep_wq;
        Ok(self.wait(sleep_wq))
    }

    /// Arm (or cancel) the per-process alarm
    ///
    /// After `seconds` the process receives SIGALRM. A second call
    /// replaces the pending alarm and returns the whole seconds that
    /// remained on it, rounded up; `alarm(0)` just cancels.
    pub fn sys_alarm(&mut self, seconds: u64) -> KernelResult<Completion> {
        let pid = self.current_pid();
        let previous = self
            .table
            .get(pid)
            .and_then(|p| p.alarm_timer)
            .map(|h| self.timers.remaining(h).unwrap_or(0));
        let remaining = match previous {
            Some(ticks) => {
                let handle = self
                    .table
                    .get(pid)
                    .and_then(|p| p.alarm_timer)
                    .expect("alarm handle vanished");
                self.timer_remove(handle);
                ticks.div_ceil(TICK_HZ)
            }
            None => 0,
        };
        if seconds > 0 {
            let handle = self.timer_create(
                TimerAction::Raise {
                    pid,
                    signo: SIGALRM,
                },
                TimerFlags::empty(),
            );
            self.timer_start(handle, seconds.saturating_mul(TICK_HZ));
            let pcb = self.table.get_mut(pid).expect("current pid not in table");
            pcb.alarm_timer = Some(handle);
        }
        Ok(Completion::Done(remaining as i64))
    }

    /// Install a signal action
    ///
    /// Returns the previous handler value. SIGKILL and SIGSTOP cannot
    /// be changed.
    pub fn sys_sigaction(
        &mut self,
        signo: u32,
        handler: u64,
        flags: u64,
        mask: u64,
    ) -> KernelResult<Completion> {
        let pid = self.current_pid();
        let act = SigAction {
            handler: handler.into(),
            flags,
            mask: SigSet::from_bits(mask),
        };
        let old = self.sigaction(pid, signo, act)?;
        Ok(Completion::Done(u64::from(old.handler) as i64))
    }

    /// Examine or change the blocked-signal mask
    ///
    /// Returns the previous mask bits.
    pub fn sys_sigprocmask(&mut self, how: u32, set: u64) -> KernelResult<Completion> {
        let pid = self.current_pid();
        let how = match how {
            SIG_BLOCK => SigMaskHow::Block,
            SIG_UNBLOCK => SigMaskHow::Unblock,
            SIG_SETMASK => SigMaskHow::SetMask,
            _ => return Err(KernelError::InvalidArgument),
        };
        let old = self.sigprocmask(pid, how, SigSet::from_bits(set))?;
        Ok(Completion::Done(old.bits() as i64))
    }

    /// Wait for any unblocked signal
    ///
    /// Consumes and returns the signal number immediately if one is
    /// already pending and unblocked; otherwise blocks until one is
    /// posted.
    pub fn sys_sigwait(&mut self) -> KernelResult<Completion> {
        let pid = self.current_pid();
        if let Some(signo) = self.take_deliverable(pid) {
            return Ok(Completion::Done(signo as i64));
        }
        let sig_wq = self
            .table
            .get(pid)
            .expect("current pid not in table")
            .sig_wq;
        Ok(self.wait(sig_wq))
    }

    /// Post a signal to a process
    pub fn sys_kill(&mut self, pid: u64, signo: u32) -> KernelResult<Completion> {
        self.raise(Pid::from_raw(pid), signo)?;
        Ok(Completion::Done(0))
    }

    /// Send a message and wait for the reply
    pub fn sys_send(
        &mut self,
        dest: u64,
        obuf: u64,
        olen: u64,
        ibuf: u64,
        ilen: u64,
    ) -> KernelResult<Completion> {
        self.send(Pid::from_raw(dest), obuf, olen, ibuf, ilen)
    }

    /// Receive the earliest inbound message
    pub fn sys_recv(&mut self, src_ptr: u64, buf: u64, len: u64) -> KernelResult<Completion> {
        self.recv(src_ptr, buf, len)
    }

    /// Reply to a received message
    pub fn sys_reply(&mut self, src: u64, buf: u64, len: u64) -> KernelResult<Completion> {
        self.reply(Pid::from_raw(src), buf, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::PcbState;
    use crate::uaccess::FlatMem;

    fn dispatcher() -> Dispatcher<FlatMem> {
        Dispatcher::new(FlatMem::new(64, 4096))
    }

    fn run(d: &mut Dispatcher<FlatMem>, pid: Pid) {
        while d.schedule() != Some(pid) {}
    }

    #[test]
    fn test_sleep_wakes_on_the_exact_tick() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);

        assert_eq!(d.sys_sleep(100).unwrap(), Completion::Blocked);
        for _ in 0..99 {
            d.tick();
        }
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Blocked);
        d.tick();
        let pcb = d.pcb(a).unwrap();
        assert_eq!(pcb.state, PcbState::Ready);
        assert_eq!(pcb.wait_result, 0);
        assert!(pcb.sleep_timer.is_none());
    }

    #[test]
    fn test_sleep_zero_completes_immediately() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);
        assert_eq!(d.sys_sleep(0).unwrap(), Completion::Done(0));
        assert_eq!(d.current(), Some(a));
    }

    #[test]
    fn test_alarm_then_sigwait() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);

        assert_eq!(d.sys_alarm(2).unwrap(), Completion::Done(0));
        assert_eq!(d.sys_sigwait().unwrap(), Completion::Blocked);

        for _ in 0..(2 * TICK_HZ) {
            d.tick();
        }
        let pcb = d.pcb(a).unwrap();
        assert_eq!(pcb.state, PcbState::Ready);
        assert_eq!(pcb.wait_result, SIGALRM as i64);
        // sigwait consumed the signal
        assert!(pcb.signal.pending.is_empty());
        assert!(pcb.alarm_timer.is_none());
    }

    #[test]
    fn test_alarm_replace_reports_remaining_seconds() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);

        d.sys_alarm(5).unwrap();
        for _ in 0..TICK_HZ {
            d.tick();
        }
        assert_eq!(d.sys_alarm(10).unwrap(), Completion::Done(4));
        assert_eq!(d.sys_alarm(0).unwrap(), Completion::Done(10));
        assert!(d.pcb(a).unwrap().alarm_timer.is_none());
    }

    #[test]
    fn test_sleep_max_duration_blocks() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);
        d.tick();
        assert_eq!(d.sys_sleep(u64::MAX).unwrap(), Completion::Blocked);
        for _ in 0..100 {
            d.tick();
        }
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Blocked);
    }

    #[test]
    fn test_alarm_max_seconds_does_not_fire_early() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);
        assert_eq!(d.sys_alarm(u64::MAX).unwrap(), Completion::Done(0));
        for _ in 0..100 {
            d.tick();
        }
        assert!(d.pcb(a).unwrap().signal.pending.is_empty());
        assert!(d.pcb(a).unwrap().alarm_timer.is_some());
    }

    #[test]
    fn test_signal_interrupts_sleep() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);

        // A custom handler so the signal is not ignored
        d.sys_sigaction(crate::signal::SIGUSR1, 0x5000, 0, 0).unwrap();
        d.sys_sleep(1000).unwrap();

        run(&mut d, b);
        d.sys_kill(a.raw(), crate::signal::SIGUSR1).unwrap();

        let pcb = d.pcb(a).unwrap();
        assert_eq!(pcb.state, PcbState::Ready);
        assert_eq!(pcb.wait_result, KernelError::Interrupted.sysret());
        // Timer was disarmed with the sleep; the signal stays pending
        assert!(pcb.sleep_timer.is_none());
        assert!(pcb.signal.pending.contains(crate::signal::SIGUSR1));

        // Nothing fires later
        for _ in 0..1000 {
            d.tick();
        }
        assert_eq!(d.pcb(a).unwrap().wait_result, KernelError::Interrupted.sysret());
    }

    #[test]
    fn test_masked_signal_does_not_interrupt() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);

        d.sys_sigprocmask(SIG_BLOCK, 1 << (crate::signal::SIGUSR1 - 1))
            .unwrap();
        d.sys_sleep(10).unwrap();

        run(&mut d, b);
        d.sys_kill(a.raw(), crate::signal::SIGUSR1).unwrap();
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Blocked);

        for _ in 0..10 {
            d.tick();
        }
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Ready);
        assert_eq!(d.pcb(a).unwrap().wait_result, 0);
        assert!(d.pcb(a).unwrap().signal.pending.contains(crate::signal::SIGUSR1));
    }

    #[test]
    fn test_kill_dead_pid_is_esrch() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        run(&mut d, b);
        d.exit_current(0);
        d.reap(b).unwrap();

        run(&mut d, a);
        assert_eq!(
            d.sys_kill(b.raw(), crate::signal::SIGTERM),
            Err(KernelError::NoProcess)
        );
    }

    #[test]
    fn test_sigwait_returns_pending_signal_without_blocking() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();

        // Post while A is merely ready; nothing is interrupted
        run(&mut d, b);
        d.sys_kill(a.raw(), crate::signal::SIGUSR2).unwrap();
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Ready);

        run(&mut d, a);
        assert_eq!(
            d.sys_sigwait().unwrap(),
            Completion::Done(crate::signal::SIGUSR2 as i64)
        );
    }
}
