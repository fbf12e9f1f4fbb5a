//! Rendezvous IPC: send, recv, reply
//!
//! Message passing is synchronous and unbuffered in the kernel: a send
//! parks the caller on the destination's reply queue and the caller is
//! not runnable again until the destination replies (or the sender is
//! interrupted, or the destination dies). Message payloads live in user
//! memory the whole time; the kernel keeps only descriptors and copies
//! directly from sender space to receiver space at delivery.
//!
//! Fault rule: when a copy faults mid-rendezvous, the process actively
//! executing the operation gets `BadAddress` and any blocked
//! counterparty is resumed with `-EFAULT`. The message is dropped; it is
//! never redelivered.

use alloc::collections::VecDeque;

use crate::error::{KernelError, KernelResult};
use crate::pcb::{PcbState, Pid};
use crate::sched::Dispatcher;
use crate::syscall::Completion;
use crate::uaccess::UserMem;

/// Descriptor for an inbound message parked in a destination's FIFO
///
/// Holds only the outbound half; the reply descriptors stay in the
/// sender's outstanding-send record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Sending process
    pub sender: Pid,
    /// Outbound payload address in the sender's space
    pub obuf: u64,
    /// Outbound payload length
    pub olen: u64,
}

/// The one send a process may have in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingSend {
    /// Destination process
    pub dest: Pid,
    /// Outbound payload address
    pub obuf: u64,
    /// Outbound payload length
    pub olen: u64,
    /// Reply buffer address in the sender's space
    pub ibuf: u64,
    /// Reply buffer capacity
    pub ilen: u64,
    /// Whether the destination has received the message
    pub received: bool,
}

/// Receive arguments parked while a process blocks in `recv`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvArgs {
    /// Where to store the sender pid, or 0 to skip
    pub src_ptr: u64,
    /// Receive buffer address
    pub buf: u64,
    /// Receive buffer capacity
    pub len: u64,
}

/// IPC state embedded in each PCB
#[derive(Debug, Default)]
pub struct IpcState {
    /// Outstanding send, present while parked on a reply queue
    pub sending: Option<OutstandingSend>,
    /// Inbound messages not yet received, in arrival order
    pub inbox: VecDeque<Message>,
    /// Receive arguments, present while parked on the receive queue
    pub recv_wait: Option<RecvArgs>,
}

impl IpcState {
    /// Fresh state: no send in flight, empty inbox
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: UserMem> Dispatcher<M> {
    /// Send a message and wait for the reply
    ///
    /// The destination must be alive; a dead or stale pid fails with
    /// `NoProcess` before anything blocks. If the destination is already
    /// parked in `recv` the payload is copied across immediately and the
    /// destination becomes runnable; either way the caller blocks on the
    /// destination's reply queue.
    pub(crate) fn send(
        &mut self,
        dest: Pid,
        obuf: u64,
        olen: u64,
        ibuf: u64,
        ilen: u64,
    ) -> KernelResult<Completion> {
        let caller = self.current_pid();
        if dest == caller || olen == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let dest_pcb = self.table.lookup(dest)?;
        if dest_pcb.state == PcbState::Zombie {
            return Err(KernelError::NoProcess);
        }
        let reply_wq = dest_pcb.reply_wq;
        let receiver_parked =
            dest_pcb.state == PcbState::Blocked && dest_pcb.waiting_on == Some(dest_pcb.recv_wq);

        let msg = Message {
            sender: caller,
            obuf,
            olen,
        };
        let mut received = false;
        if receiver_parked {
            let args = self
                .table
                .get_mut(dest)
                .expect("dest vanished under lock")
                .ipc
                .recv_wait
                .take()
                .expect("receiver parked without recv args");
            match self.deliver(msg, dest, args) {
                Ok(n) => {
                    self.wake(dest, n as i64);
                    received = true;
                }
                Err(e) => {
                    // Caller faulted; release the receiver to retry
                    self.wake(dest, KernelError::BadAddress.sysret());
                    return Err(e);
                }
            }
        } else {
            self.table
                .get_mut(dest)
                .expect("dest vanished under lock")
                .ipc
                .inbox
                .push_back(msg);
        }

        let pcb = self.table.get_mut(caller).expect("current pid not in table");
        debug_assert!(pcb.ipc.sending.is_none(), "second send while one in flight");
        pcb.ipc.sending = Some(OutstandingSend {
            dest,
            obuf,
            olen,
            ibuf,
            ilen,
            received,
        });
        Ok(self.wait(reply_wq))
    }

    /// Receive the earliest inbound message, blocking if there is none
    ///
    /// Copies `min(len, olen)` payload bytes into `buf` and stores the
    /// sender pid at `src_ptr` (unless 0). Receiving never resumes the
    /// sender; only `reply` does that.
    pub(crate) fn recv(&mut self, src_ptr: u64, buf: u64, len: u64) -> KernelResult<Completion> {
        let caller = self.current_pid();
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pcb = self.table.get_mut(caller).expect("current pid not in table");
        let recv_wq = pcb.recv_wq;
        let msg = match pcb.ipc.inbox.pop_front() {
            Some(m) => m,
            None => {
                pcb.ipc.recv_wait = Some(RecvArgs { src_ptr, buf, len });
                return Ok(self.wait(recv_wq));
            }
        };
        let args = RecvArgs { src_ptr, buf, len };
        match self.deliver(msg, caller, args) {
            Ok(n) => {
                self.mark_received(msg.sender, caller);
                Ok(Completion::Done(n as i64))
            }
            Err(e) => {
                // Caller faulted; the sender will never be replied to
                self.abort_send(msg.sender, caller);
                Err(e)
            }
        }
    }

    /// Reply to a received message, resuming the sender
    ///
    /// `src` must be parked awaiting a reply from the caller with its
    /// message already received; anything else is `NoProcess` (dead or
    /// stale pid) or `InvalidArgument` (wrong rendezvous state). Copies
    /// `min(len, ilen)` bytes into the sender's reply buffer and wakes
    /// it with the copied length. A zero-length reply is valid.
    pub(crate) fn reply(&mut self, src: Pid, buf: u64, len: u64) -> KernelResult<Completion> {
        let caller = self.current_pid();
        let record = match self.table.lookup(src)?.ipc.sending {
            Some(r) if r.dest == caller && r.received => r,
            _ => return Err(KernelError::InvalidArgument),
        };
        let n = (len.min(record.ilen)) as usize;
        if n > 0 {
            let bytes = match self.mem.copy_in(caller, buf, n) {
                Ok(b) => b,
                Err(e) => {
                    self.abort_send(src, caller);
                    return Err(e);
                }
            };
            if let Err(e) = self.mem.copy_out(src, record.ibuf, &bytes) {
                self.abort_send(src, caller);
                return Err(e);
            }
        }
        self.table
            .get_mut(src)
            .expect("sender vanished under lock")
            .ipc
            .sending = None;
        self.wake(src, n as i64);
        Ok(Completion::Done(0))
    }

    /// Copy a message payload into a receiver's buffer and record the
    /// sender pid
    ///
    /// Returns the number of payload bytes copied.
    fn deliver(&mut self, msg: Message, dest: Pid, args: RecvArgs) -> KernelResult<usize> {
        let n = (args.len.min(msg.olen)) as usize;
        let bytes = self.mem.copy_in(msg.sender, msg.obuf, n)?;
        self.mem.copy_out(dest, args.buf, &bytes)?;
        if args.src_ptr != 0 {
            self.mem
                .copy_out(dest, args.src_ptr, &msg.sender.raw().to_le_bytes())?;
        }
        Ok(n)
    }

    /// Flag a parked sender's message as received by `dest`
    fn mark_received(&mut self, sender: Pid, dest: Pid) {
        if let Some(pcb) = self.table.get_mut(sender) {
            if let Some(rec) = pcb.ipc.sending.as_mut() {
                if rec.dest == dest {
                    rec.received = true;
                }
            }
        }
    }

    /// Tear down a parked sender's rendezvous and resume it with
    /// `-EFAULT`
    ///
    /// Used when the counterparty faults while the sender is blocked.
    fn abort_send(&mut self, sender: Pid, dest: Pid) {
        let cleared = match self.table.get_mut(sender) {
            Some(pcb) => match pcb.ipc.sending {
                Some(rec) if rec.dest == dest => {
                    pcb.ipc.sending = None;
                    true
                }
                _ => false,
            },
            None => false,
        };
        if cleared {
            self.wake(sender, KernelError::BadAddress.sysret());
        }
    }

    /// Release every sender parked on `dest`'s reply queue with `-ESRCH`
    ///
    /// Runs while `dest` is exiting; its inbox is discarded by the
    /// caller, so the outstanding-send records must go too.
    pub(crate) fn abort_senders(&mut self, dest: Pid) {
        let reply_wq = match self.table.get(dest) {
            Some(pcb) => pcb.reply_wq,
            None => return,
        };
        let parked: alloc::vec::Vec<Pid> = self.queues.get(reply_wq).iter().collect();
        for sender in parked {
            if let Some(pcb) = self.table.get_mut(sender) {
                pcb.ipc.sending = None;
            }
        }
        self.wake_all(reply_wq, KernelError::NoProcess.sysret());
    }

    /// Undo the side effects of the blocking call `pid` is parked in
    ///
    /// Called by signal posting before the `-EINTR` wake. The PCB stays
    /// BLOCKED; only the call-specific state is torn down so the process
    /// resumes as if the call had returned early:
    /// - `recv`: drop the parked receive arguments
    /// - `send`: withdraw the un-received message from the destination
    ///   inbox and clear the outstanding-send record
    /// - `sleep`: disarm the wakeup timer
    pub(crate) fn cancel_blocked_call(&mut self, pid: Pid) {
        let (waiting_on, recv_wq, sleep_wq, sleep_timer, sending) = {
            let pcb = match self.table.get(pid) {
                Some(p) => p,
                None => return,
            };
            debug_assert!(pcb.state == PcbState::Blocked);
            (
                pcb.waiting_on,
                pcb.recv_wq,
                pcb.sleep_wq,
                pcb.sleep_timer,
                pcb.ipc.sending,
            )
        };
        if waiting_on == Some(recv_wq) {
            if let Some(pcb) = self.table.get_mut(pid) {
                pcb.ipc.recv_wait = None;
            }
        } else if waiting_on == Some(sleep_wq) {
            if let Some(handle) = sleep_timer {
                self.timer_remove(handle);
            }
        } else if let Some(rec) = sending {
            if !rec.received {
                if let Some(dest) = self.table.get_mut(rec.dest) {
                    dest.ipc.inbox.retain(|m| m.sender != pid);
                }
            }
            if let Some(pcb) = self.table.get_mut(pid) {
                pcb.ipc.sending = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::Context;
    use crate::uaccess::FlatMem;

    fn dispatcher() -> Dispatcher<FlatMem> {
        Dispatcher::new(FlatMem::new(64, 4096))
    }

    fn run(d: &mut Dispatcher<FlatMem>, pid: Pid) {
        while d.schedule() != Some(pid) {
            // FIFO rotation lands on pid eventually
        }
    }

    #[test]
    fn test_send_to_dead_pid_does_not_block() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        run(&mut d, b);
        d.exit_current(0);
        let status = d.reap(b).unwrap();
        assert_eq!(status, 0);

        run(&mut d, a);
        assert_eq!(d.send(b, 0, 4, 0, 0), Err(KernelError::NoProcess));
        assert_eq!(d.current(), Some(a));
    }

    #[test]
    fn test_send_to_self_rejected() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        run(&mut d, a);
        assert_eq!(d.send(a, 0, 4, 0, 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_rendezvous_roundtrip() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();
        d.mem.copy_out(client, 0, b"hi").unwrap();

        // Client sends first; no receiver parked, so it queues and blocks
        run(&mut d, client);
        let c = d.send(server, 0, 2, 64, 16).unwrap();
        assert_eq!(c, Completion::Blocked);
        assert_eq!(d.pcb(client).unwrap().state, PcbState::Blocked);

        // Server picks the message up from its inbox without blocking
        run(&mut d, server);
        let c = d.recv(128, 0, 16).unwrap();
        assert_eq!(c, Completion::Done(2));
        assert_eq!(d.mem.copy_in(server, 0, 2).unwrap(), b"hi");
        let src = d.mem.copy_in(server, 128, 8).unwrap();
        assert_eq!(
            u64::from_le_bytes(src.try_into().unwrap()),
            client.raw()
        );
        // Receipt alone does not resume the sender
        assert_eq!(d.pcb(client).unwrap().state, PcbState::Blocked);

        // Reply resumes the client with the copied length
        d.mem.copy_out(server, 32, b"ok").unwrap();
        let c = d.reply(client, 32, 2).unwrap();
        assert_eq!(c, Completion::Done(0));
        assert_eq!(d.pcb(client).unwrap().state, PcbState::Ready);
        assert_eq!(d.pcb(client).unwrap().wait_result, 2);
        assert_eq!(d.mem.copy_in(client, 64, 2).unwrap(), b"ok");
    }

    #[test]
    fn test_send_delivers_to_parked_receiver() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();
        d.mem.copy_out(client, 0, b"ping").unwrap();

        run(&mut d, server);
        assert_eq!(d.recv(0, 256, 16).unwrap(), Completion::Blocked);

        run(&mut d, client);
        assert_eq!(d.send(server, 0, 4, 0, 0).unwrap(), Completion::Blocked);

        // Receiver is runnable with the payload already in place
        let server_pcb = d.pcb(server).unwrap();
        assert_eq!(server_pcb.state, PcbState::Ready);
        assert_eq!(server_pcb.wait_result, 4);
        assert_eq!(d.mem.copy_in(server, 256, 4).unwrap(), b"ping");
        // Sender stays parked until the reply
        assert_eq!(d.pcb(client).unwrap().state, PcbState::Blocked);
        assert!(d.pcb(client).unwrap().ipc.sending.unwrap().received);
    }

    #[test]
    fn test_reply_without_receive_rejected() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();

        run(&mut d, client);
        d.send(server, 0, 4, 0, 0).unwrap();

        // Message queued but never received
        run(&mut d, server);
        assert_eq!(
            d.reply(client, 0, 0),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_reply_truncates_to_reply_buffer() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();
        d.mem.copy_out(client, 0, b"q").unwrap();
        d.mem.copy_out(server, 16, b"long answer").unwrap();

        run(&mut d, client);
        d.send(server, 0, 1, 64, 4).unwrap();
        run(&mut d, server);
        d.recv(0, 0, 8).unwrap();
        d.reply(client, 16, 11).unwrap();

        assert_eq!(d.pcb(client).unwrap().wait_result, 4);
        assert_eq!(d.mem.copy_in(client, 64, 4).unwrap(), b"long");
    }

    #[test]
    fn test_exit_releases_parked_senders() {
        let mut d = dispatcher();
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();

        run(&mut d, a);
        d.send(server, 0, 1, 0, 0).unwrap();
        run(&mut d, b);
        d.send(server, 0, 1, 0, 0).unwrap();

        run(&mut d, server);
        d.exit_current(1);

        for pid in [a, b] {
            let pcb = d.pcb(pid).unwrap();
            assert_eq!(pcb.state, PcbState::Ready);
            assert_eq!(pcb.wait_result, KernelError::NoProcess.sysret());
            assert!(pcb.ipc.sending.is_none());
        }
    }

    #[test]
    fn test_cancel_withdraws_queued_message() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();

        run(&mut d, client);
        d.send(server, 0, 4, 0, 0).unwrap();
        assert_eq!(d.pcb(server).unwrap().ipc.inbox.len(), 1);

        d.cancel_blocked_call(client);
        assert!(d.pcb(server).unwrap().ipc.inbox.is_empty());
        assert!(d.pcb(client).unwrap().ipc.sending.is_none());
    }

    #[test]
    fn test_recv_fault_releases_sender() {
        let mut d = dispatcher();
        let client = d.spawn(Context::default(), None).unwrap();
        let server = d.spawn(Context::default(), None).unwrap();

        run(&mut d, client);
        d.send(server, 0, 4, 0, 0).unwrap();

        // Receive into an unmapped buffer
        run(&mut d, server);
        assert_eq!(
            d.recv(0, u64::MAX - 2, 4),
            Err(KernelError::BadAddress)
        );
        let pcb = d.pcb(client).unwrap();
        assert_eq!(pcb.state, PcbState::Ready);
        assert_eq!(pcb.wait_result, KernelError::BadAddress.sysret());
        assert!(pcb.ipc.sending.is_none());
    }
}
