//! Preemptible kernel dispatcher for a single CPU
//!
//! The dispatcher owns process control blocks, wait queues, a FIFO
//! scheduler with an idle process, tick timers, POSIX-like signals and
//! rendezvous message passing. It is the policy core of a kernel, not a
//! whole kernel: memory management sits behind the [`UserMem`] trait,
//! and the trap/context-switch machinery is a collaborator that invokes
//! [`Kernel`] entry points and acts on what they return.
//!
//! Everything mutates under one lock. [`Kernel`] wraps the dispatcher in
//! a `spin::Mutex`; each public method is one scoped critical section,
//! which on a single CPU is the whole concurrency story.
//!
//! ```
//! use dispatch::{Context, FlatMem, Kernel};
//!
//! let kernel = Kernel::new(FlatMem::new(64, 4096));
//! let pid = kernel.spawn(Context::default(), None).unwrap();
//! let running = kernel.schedule();
//! assert_eq!(running, Some(pid));
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod ipc;
pub mod klog;
pub mod pcb;
pub mod sched;
pub mod signal;
pub mod syscall;
pub mod timer;
pub mod uaccess;
pub mod waitqueue;


pub use error::{KernelError, KernelResult};
pub use pcb::{Context, Pcb, PcbState, Pid};
pub use sched::Dispatcher;
pub use signal::{Delivery, SigAction, SigSet};
pub use syscall::Completion;
pub use timer::{TimerAction, TimerFlags, TimerHandle, TICK_HZ};
pub use uaccess::{FlatMem, UserMem};
pub use waitqueue::WaitQueueId;

use spin::Mutex;

/// The kernel's locked dispatcher and its entry points
///
/// Collaborators never hold references into the dispatcher; every entry
/// point locks, works, and unlocks. Interrupt-driven paths (`clock_tick`,
/// device wakes via `wake`/`ready`) and syscall paths go through the same
/// lock, which serializes them exactly as a single-CPU interrupt-disable
/// section would.
pub struct Kernel<M: UserMem> {
    dispatcher: Mutex<Dispatcher<M>>,
}

impl<M: UserMem> Kernel<M> {
    /// Create a kernel whose idle process is already runnable
    pub fn new(mem: M) -> Self {
        Self {
            dispatcher: Mutex::new(Dispatcher::new(mem)),
        }
    }

    /// Run a closure under the dispatcher lock
    ///
    /// Escape hatch for compound operations and test assertions; the
    /// named entry points below are the normal interface.
    pub fn with<R>(&self, f: impl FnOnce(&mut Dispatcher<M>) -> R) -> R {
        f(&mut self.dispatcher.lock())
    }

    // -------------------------------------------------------------------
    // Collaborator interface
    // -------------------------------------------------------------------

    /// Create a process and make it runnable
    pub fn spawn(&self, context: Context, parent: Option<Pid>) -> KernelResult<Pid> {
        self.dispatcher.lock().spawn(context, parent)
    }

    /// Select the next process to run; the caller resumes its context
    pub fn schedule(&self) -> Option<Pid> {
        self.dispatcher.lock().schedule()
    }

    /// Clock interrupt: advance one tick, firing due timers
    pub fn clock_tick(&self) {
        self.dispatcher.lock().tick()
    }

    /// Append a NEW or preempted process to the ready queue
    pub fn ready(&self, pid: Pid) {
        self.dispatcher.lock().ready(pid)
    }

    /// Resume a blocked process, delivering `rc` to its pending call
    pub fn wake(&self, pid: Pid, rc: i64) {
        self.dispatcher.lock().wake(pid, rc)
    }

    /// Post a signal to a process
    pub fn raise(&self, pid: Pid, signo: u32) -> KernelResult<()> {
        self.dispatcher.lock().raise(pid, signo)
    }

    /// Signal-delivery safe point on the way back to user mode
    pub fn return_to_user(&self, pid: Pid) -> KernelResult<Delivery> {
        self.dispatcher.lock().return_to_user(pid)
    }

    /// Result a resumed process's blocked call should return
    pub fn wait_result(&self, pid: Pid) -> Option<i64> {
        self.dispatcher.lock().pcb(pid).map(|p| p.wait_result)
    }

    /// Collect a zombie's exit status and free its slot
    pub fn reap(&self, pid: Pid) -> KernelResult<i32> {
        self.dispatcher.lock().reap(pid)
    }

    // -------------------------------------------------------------------
    // Syscall surface
    // -------------------------------------------------------------------

    /// Create a child of the calling process
    pub fn sys_create(&self, context: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_create(context)
    }

    /// Voluntarily give up the CPU
    pub fn sys_yield(&self) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_yield()
    }

    /// Terminate the calling process
    pub fn sys_exit(&self, status: i32) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_exit(status)
    }

    /// Sleep for `ms` milliseconds
    pub fn sys_sleep(&self, ms: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_sleep(ms)
    }

    /// Arm or cancel the per-process alarm
    pub fn sys_alarm(&self, seconds: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_alarm(seconds)
    }

    /// Install a signal action
    pub fn sys_sigaction(
        &self,
        signo: u32,
        handler: u64,
        flags: u64,
        mask: u64,
    ) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_sigaction(signo, handler, flags, mask)
    }

    /// Examine or change the blocked-signal mask
    pub fn sys_sigprocmask(&self, how: u32, set: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_sigprocmask(how, set)
    }

    /// Wait for any unblocked signal
    pub fn sys_sigwait(&self) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_sigwait()
    }

    /// Post a signal to a process by raw pid
    pub fn sys_kill(&self, pid: u64, signo: u32) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_kill(pid, signo)
    }

    /// Send a message and wait for the reply
    pub fn sys_send(
        &self,
        dest: u64,
        obuf: u64,
        olen: u64,
        ibuf: u64,
        ilen: u64,
    ) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_send(dest, obuf, olen, ibuf, ilen)
    }

    /// Receive the earliest inbound message
    pub fn sys_recv(&self, src_ptr: u64, buf: u64, len: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_recv(src_ptr, buf, len)
    }

    /// Reply to a received message
    pub fn sys_reply(&self, src: u64, buf: u64, len: u64) -> KernelResult<Completion> {
        self.dispatcher.lock().sys_reply(src, buf, len)
    }
}
