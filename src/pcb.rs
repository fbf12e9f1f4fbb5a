//! Process control blocks
//!
//! One `Pcb` per live process, held in a fixed-capacity arena of slots.
//! A `Pid` packs the slot index with a per-slot generation counter, so a
//! stale pid held by user code can never alias a reused slot: generations
//! advance on reap and every table lookup checks them.
//!
//! The state machine is the one the scheduler enforces:
//!
//! ```text
//! NEW -> READY -> RUNNING -> { READY | BLOCKED | ZOMBIE }
//!                 BLOCKED -> READY        (wake; never straight to RUNNING)
//!                 ZOMBIE  -> FREE         (reap, at most once)
//! ```

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::ipc::IpcState;
use crate::signal::SignalState;
use crate::timer::TimerHandle;
use crate::waitqueue::WaitQueueId;

/// Number of PCB slots in the arena
pub const N_PROCS: usize = 64;

/// Process identifier: slot index in the low 32 bits, slot generation in
/// the high 32 bits
///
/// The generation changes each time the slot is reaped and reused, to
/// detect discontinuities in IPC conversations targeting a dead process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pid(u64);

impl Pid {
    /// Fabricate a pid from slot index and generation
    pub const fn from_parts(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xffff_ffff))
    }

    /// Rebuild a pid from its raw syscall representation
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Slot index part of this pid
    pub const fn slot(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    /// Generation part of this pid
    pub const fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw representation carried across the syscall boundary
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Opaque handle to saved machine state and address space
///
/// Owned exclusively by the PCB; the context-switch trampoline is an
/// external collaborator and this crate never inspects the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Context(pub u64);

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbState {
    /// Slot allocated, not yet runnable
    New,
    /// On the run queue
    Ready,
    /// The single active execution context
    Running,
    /// Parked on exactly one wait queue
    Blocked,
    /// Exited; pid and exit status retained until reaped
    Zombie,
}

impl PcbState {
    /// Check one edge of the process state machine
    fn can_become(self, next: PcbState) -> bool {
        use PcbState::*;
        matches!(
            (self, next),
            (New, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Blocked)
                | (Running, Zombie)
                | (Blocked, Ready)
        )
    }
}

/// A process control block
#[derive(Debug)]
pub struct Pcb {
    /// Stable identity, unique among live PCBs
    pub pid: Pid,
    /// Current state
    pub state: PcbState,
    /// The one wait queue this PCB is parked on while Blocked
    pub waiting_on: Option<WaitQueueId>,
    /// Value delivered to the blocking call that resumes this PCB
    pub wait_result: i64,
    /// Pending/blocked sets, dispositions, queued infos
    pub signal: SignalState,
    /// Armed timers owned by this process (sleep/alarm)
    pub timers: Vec<TimerHandle>,
    /// Timer backing an in-progress sleep, cancelled on interruption
    pub sleep_timer: Option<TimerHandle>,
    /// Timer backing the most recent alarm, replaced on re-arm
    pub alarm_timer: Option<TimerHandle>,
    /// Rendezvous state: outstanding send + inbound message FIFO
    pub ipc: IpcState,
    /// Saved machine state handle (never shared)
    pub context: Context,
    /// Exit status retained for the reaper
    pub exit_status: i32,
    /// Wait queue this process blocks on in recv
    pub recv_wq: WaitQueueId,
    /// Wait queue this process blocks on in sigwait
    pub sig_wq: WaitQueueId,
    /// Wait queue this process blocks on in sleep
    pub sleep_wq: WaitQueueId,
    /// Wait queue of senders parked on this process as destination
    pub reply_wq: WaitQueueId,
}

impl Pcb {
    /// Move to `next`, asserting the edge is legal
    ///
    /// Illegal transitions are kernel programming errors, not recoverable
    /// conditions; they only trip in debug builds.
    pub fn transition(&mut self, next: PcbState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal PCB transition {:?} -> {:?} (pid {})",
            self.state,
            next,
            self.pid.raw()
        );
        self.state = next;
    }
}

/// One arena slot
struct Slot {
    /// Bumped on reap; part of every pid minted for this slot
    generation: u32,
    pcb: Option<Pcb>,
}

/// Fixed-capacity PCB arena
///
/// Slots are stable; lookups validate the generation so a pid is only
/// good for the lifetime of the process it named.
pub struct PcbTable {
    slots: Vec<Slot>,
}

impl PcbTable {
    /// Create an empty table with `N_PROCS` slots
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(N_PROCS);
        for _ in 0..N_PROCS {
            slots.push(Slot {
                generation: 0,
                pcb: None,
            });
        }
        Self { slots }
    }

    /// Allocate a slot and mint its pid; the PCB starts in `New`
    ///
    /// The caller fills in queue ids and inherited signal state before
    /// readying the process. Returns `None` when the arena is full.
    pub fn alloc(&mut self, context: Context) -> Option<Pid> {
        let idx = self.slots.iter().position(|s| s.pcb.is_none())?;
        let generation = self.slots[idx].generation;
        let pid = Pid::from_parts(idx, generation);
        self.slots[idx].pcb = Some(Pcb {
            pid,
            state: PcbState::New,
            waiting_on: None,
            wait_result: 0,
            signal: SignalState::new(),
            timers: Vec::new(),
            sleep_timer: None,
            alarm_timer: None,
            ipc: IpcState::new(),
            context,
            exit_status: 0,
            recv_wq: WaitQueueId::INVALID,
            sig_wq: WaitQueueId::INVALID,
            sleep_wq: WaitQueueId::INVALID,
            reply_wq: WaitQueueId::INVALID,
        });
        Some(pid)
    }

    /// Look up a live PCB, validating the generation
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        let slot = self.slots.get(pid.slot())?;
        if slot.generation != pid.generation() {
            return None;
        }
        slot.pcb.as_ref()
    }

    /// Look up a live PCB for mutation, validating the generation
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        let slot = self.slots.get_mut(pid.slot())?;
        if slot.generation != pid.generation() {
            return None;
        }
        slot.pcb.as_mut()
    }

    /// Like `get`, surfacing a stale or dead pid as `NoProcess`
    pub fn lookup(&self, pid: Pid) -> KernelResult<&Pcb> {
        self.get(pid).ok_or(KernelError::NoProcess)
    }

    /// Like `get_mut`, surfacing a stale or dead pid as `NoProcess`
    pub fn lookup_mut(&mut self, pid: Pid) -> KernelResult<&mut Pcb> {
        self.get_mut(pid).ok_or(KernelError::NoProcess)
    }

    /// Free a zombie slot; the pid becomes permanently stale
    ///
    /// Must be called at most once per PCB lifetime, and only on zombies.
    pub fn reap(&mut self, pid: Pid) -> KernelResult<Pcb> {
        let slot = self
            .slots
            .get_mut(pid.slot())
            .filter(|s| s.generation == pid.generation())
            .ok_or(KernelError::NoProcess)?;
        let pcb = slot.pcb.take().ok_or(KernelError::NoProcess)?;
        debug_assert!(
            pcb.state == PcbState::Zombie,
            "reap of non-zombie pid {}",
            pid.raw()
        );
        slot.generation = slot.generation.wrapping_add(1);
        Ok(pcb)
    }

    /// Iterate over live PCBs
    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|s| s.pcb.as_ref())
    }

    /// Number of live PCBs
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.pcb.is_some()).count()
    }
}

impl Default for PcbTable {
    fn default() -> Self {
        Self::new()
    }
}
