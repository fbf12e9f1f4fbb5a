//! Dispatcher state and FIFO scheduler
//!
//! Owns the PCB arena, the ready queue, the wait-queue table and the
//! timer list. There is never more than one RUNNING process; all
//! transitions between queues happen under the single dispatcher lock
//! held by the [`Kernel`](crate::Kernel) facade.
//!
//! Scheduling is pure FIFO with one special case: the idle process is
//! dispatched only when no other process is ready. No priorities, no
//! quanta, no SMP balancing.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::pcb::{Context, Pcb, PcbState, PcbTable, Pid};
use crate::timer::TimerList;
use crate::uaccess::UserMem;
use crate::waitqueue::WaitQueueTable;
use crate::klogln;

/// Dispatcher core, generic over the memory-management collaborator
pub struct Dispatcher<M: UserMem> {
    /// All live processes
    pub(crate) table: PcbTable,
    /// Runnable processes in dispatch order
    pub(crate) run_queue: VecDeque<Pid>,
    /// The single RUNNING process, if any
    pub(crate) current: Option<Pid>,
    /// The process dispatched only when nothing else is ready
    idle: Pid,
    /// All wait queues
    pub(crate) queues: WaitQueueTable,
    /// Armed and dormant timers, and the tick clock
    pub(crate) timers: TimerList,
    /// Verify-and-copy collaborator
    pub(crate) mem: M,
}

impl<M: UserMem> Dispatcher<M> {
    /// Create a dispatcher with its idle process already runnable
    pub fn new(mem: M) -> Self {
        let mut d = Self {
            table: PcbTable::new(),
            run_queue: VecDeque::new(),
            current: None,
            idle: Pid::from_parts(0, 0),
            queues: WaitQueueTable::new(),
            timers: TimerList::new(),
            mem,
        };
        let idle = d
            .spawn(Context::default(), None)
            .expect("empty arena cannot be full");
        d.idle = idle;
        d
    }

    /// Create a process and make it runnable
    ///
    /// The child starts with empty pending signals; dispositions and the
    /// blocked mask are inherited from `parent` when given, defaulted
    /// otherwise.
    pub fn spawn(&mut self, context: Context, parent: Option<Pid>) -> KernelResult<Pid> {
        let inherited = match parent {
            Some(ppid) => Some(self.table.lookup(ppid)?.signal.inherit()),
            None => None,
        };
        let pid = self
            .table
            .alloc(context)
            .ok_or(KernelError::InvalidArgument)?;
        let recv_wq = self.queues.alloc();
        let sig_wq = self.queues.alloc();
        let sleep_wq = self.queues.alloc();
        let reply_wq = self.queues.alloc();
        {
            let pcb = self.table.get_mut(pid).expect("slot just allocated");
            pcb.recv_wq = recv_wq;
            pcb.sig_wq = sig_wq;
            pcb.sleep_wq = sleep_wq;
            pcb.reply_wq = reply_wq;
            if let Some(signal) = inherited {
                pcb.signal = signal;
            }
        }
        klogln!("sched: pid {} created", pid.raw());
        self.ready(pid);
        Ok(pid)
    }

    /// Append a process to the tail of the ready queue
    ///
    /// Exposed to collaborators (drivers, the timer path) alongside
    /// `wake`; internal callers use it for NEW and preempted processes.
    pub fn ready(&mut self, pid: Pid) {
        debug_assert!(
            !self.run_queue.contains(&pid),
            "pid {} already on run queue",
            pid.raw()
        );
        let pcb = self.table.get_mut(pid).expect("ready of dead pid");
        debug_assert!(pcb.waiting_on.is_none());
        pcb.transition(PcbState::Ready);
        self.run_queue.push_back(pid);
    }

    /// Dequeue the next process to dispatch
    ///
    /// Idle is deferred: if it surfaces at the head while another process
    /// is ready, it goes back to the tail and the next head is taken.
    fn pick_next(&mut self) -> Option<Pid> {
        let head = self.run_queue.pop_front()?;
        if head == self.idle && !self.run_queue.is_empty() {
            self.run_queue.push_back(self.idle);
            return self.run_queue.pop_front();
        }
        Some(head)
    }

    /// Select and dispatch the next process
    ///
    /// A still-RUNNING current (yield or tick preemption) is re-queued at
    /// the tail first. Returns the pid the trap-return collaborator must
    /// resume, or None if nothing is runnable (only before the idle
    /// process exists).
    pub fn schedule(&mut self) -> Option<Pid> {
        if let Some(prev) = self.current.take() {
            if self
                .table
                .get(prev)
                .map(|p| p.state == PcbState::Running)
                .unwrap_or(false)
            {
                self.ready(prev);
            }
        }
        let next = self.pick_next()?;
        let pcb = self.table.get_mut(next).expect("run queue held dead pid");
        pcb.transition(PcbState::Running);
        self.current = Some(next);
        Some(next)
    }

    /// The currently running process, if any
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// The idle process
    pub fn idle(&self) -> Pid {
        self.idle
    }

    /// Detach the current pid for an operation that gives up the CPU
    pub(crate) fn take_current(&mut self, what: &str) -> Pid {
        match self.current.take() {
            Some(pid) => pid,
            None => panic!("{} invoked with no current process", what),
        }
    }

    /// Current pid for an operation that keeps the CPU
    pub(crate) fn current_pid(&self) -> Pid {
        match self.current {
            Some(pid) => pid,
            None => panic!("kernel entry with no current process"),
        }
    }

    /// Terminate the current process
    ///
    /// Armed timers are torn down without firing, every sender still
    /// parked on this destination is released with `-ESRCH`, and the PCB
    /// becomes a zombie holding only pid and exit status for the reaper.
    pub fn exit_current(&mut self, status: i32) {
        let pid = self.take_current("exit");

        let armed: Vec<_> = {
            let pcb = self.table.get_mut(pid).expect("exiting pid not in table");
            debug_assert!(pcb.state == PcbState::Running);
            pcb.timers.drain(..).collect()
        };
        for handle in armed {
            self.timers.cancel(handle);
        }

        self.abort_senders(pid);

        let pcb = self.table.get_mut(pid).expect("exiting pid not in table");
        pcb.sleep_timer = None;
        pcb.alarm_timer = None;
        pcb.ipc.inbox.clear();
        pcb.exit_status = status;
        pcb.transition(PcbState::Zombie);
        klogln!("sched: pid {} exited ({})", pid.raw(), status);
    }

    /// Release a zombie slot back to the free pool
    ///
    /// Called by the parent/collector collaborator; after this the pid is
    /// permanently stale and the slot generation has advanced.
    pub fn reap(&mut self, pid: Pid) -> KernelResult<i32> {
        let pcb = self.table.reap(pid)?;
        debug_assert!(self.queues.get(pcb.recv_wq).is_empty());
        debug_assert!(self.queues.get(pcb.sig_wq).is_empty());
        debug_assert!(self.queues.get(pcb.sleep_wq).is_empty());
        debug_assert!(self.queues.get(pcb.reply_wq).is_empty());
        self.queues.free(pcb.recv_wq);
        self.queues.free(pcb.sig_wq);
        self.queues.free(pcb.sleep_wq);
        self.queues.free(pcb.reply_wq);
        klogln!("sched: pid {} reaped", pid.raw());
        Ok(pcb.exit_status)
    }

    /// Shared-state access for invariant checks in tests
    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> {
        self.table.get(pid)
    }

    /// Snapshot of the ready queue in dispatch order
    pub fn run_queue_snapshot(&self) -> Vec<Pid> {
        self.run_queue.iter().copied().collect()
    }
}
