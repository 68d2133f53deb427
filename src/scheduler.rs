//! Scheduler — message queue discipline and the dispatch loop
//!
//! Cooperative mode serves three FIFO lanes and drains the timer soft
//! interrupt ahead of any queued message. Preemptive mode orders the
//! queue by destination priority and may run a dominating message
//! immediately, as a nested call inside the handler that posted it, when
//! the preemption point allows it.
//!
//! Every handler invocation goes through `deliver`, the recovery
//! boundary: a module whose system call latched a fault is deregistered
//! there once its handler returns.
//!
//! Author: Moroya Sakamoto

use heapless::Vec;
use log::{error, trace, warn};

use crate::config::{BCAST_ADDRESS, MSG_POOL_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::irq::SoftIrq;
use crate::kernel::Kernel;
use crate::malloc::MemPtr;
use crate::message::{Message, MsgFlags, MsgType, Payload};
use crate::module::{ModuleFlags, Pid, Priority};
use crate::registry::ModuleControl;

impl Kernel {
    /// Queue a message, taking ownership of a released payload
    ///
    /// On failure the message is disposed (a released payload is freed).
    pub fn post_message(&mut self, msg: Message) -> KernelResult<()> {
        if self.halted {
            self.dispose(msg);
            return Err(KernelError::Halted);
        }
        if let Some(ptr) = msg.released() {
            self.heap.change_owner(ptr, Pid::SCHED)?;
        }
        self.enqueue(msg)
    }

    /// Post a short (byte + word) message
    pub fn post_short(
        &mut self,
        did: Pid,
        sid: Pid,
        kind: MsgType,
        byte: u8,
        word: u16,
        flags: MsgFlags,
    ) -> KernelResult<()> {
        self.post_message(Message::short(did, sid, kind, byte, word, flags))
    }

    fn enqueue(&mut self, mut msg: Message) -> KernelResult<()> {
        if !self.config.preemptive {
            return match self.queue.enqueue(msg) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.dispose(msg);
                    Err(e)
                }
            };
        }

        msg.priority = self.module_priority(msg.did).0;
        if !self.preemption_enabled || self.pid_stack.is_empty() {
            return self.enqueue_by_priority(msg);
        }

        let current = self.module_priority(self.irq.current()).0;
        let dominates_head = self.queue.peek().map_or(true, |h| msg.priority > h.priority);
        if dominates_head && msg.priority > current && self.preemption_point(msg.did) {
            trace!("sched: {} preempts {}", msg.did, self.irq.current());
            self.stats.preemptions += 1;
            let _ = self.dispatch_message(msg);
            return Ok(());
        }

        self.enqueue_by_priority(msg)?;
        let head = self.queue.peek().map(|h| (h.priority, h.did));
        if let Some((priority, did)) = head {
            if priority > current && self.preemption_point(did) {
                if let Some(next) = self.queue.dequeue() {
                    self.stats.preemptions += 1;
                    let _ = self.dispatch_message(next);
                }
            }
        }
        Ok(())
    }

    fn enqueue_by_priority(&mut self, msg: Message) -> KernelResult<()> {
        match self.queue.enqueue_by_priority(msg) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.dispose(msg);
                Err(e)
            }
        }
    }

    /// Priority messages to `pid` run at (idle for unknown modules)
    pub fn module_priority(&self, pid: Pid) -> Priority {
        self.registry
            .get(pid)
            .map_or(Priority::IDLE, |c| c.header.priority)
    }

    /// May `did` run nested inside the current call chain?
    ///
    /// Refused when `did` is already on the chain, or when it depends on
    /// a module that is.
    pub fn preemption_point(&self, did: Pid) -> bool {
        let current = self.irq.current();
        let on_chain = |p: &Pid| *p == current || self.pid_stack.contains(p);
        if on_chain(&did) {
            return false;
        }
        self.registry
            .get(did)
            .map_or(true, |c| !c.header.dependencies.iter().any(on_chain))
    }

    /// Re-enable preemption; queued messages that now outrank the
    /// running module are dispatched before this returns
    pub fn enable_preemption(&mut self) {
        self.preemption_enabled = true;
        if !self.config.preemptive || self.pid_stack.is_empty() {
            return;
        }
        let current = self.module_priority(self.irq.current()).0;
        while let Some((priority, did)) = self.queue.peek().map(|h| (h.priority, h.did)) {
            if priority <= current || !self.preemption_point(did) {
                break;
            }
            let Some(next) = self.queue.dequeue() else {
                break;
            };
            self.stats.preemptions += 1;
            let _ = self.dispatch_message(next);
        }
    }

    pub fn disable_preemption(&mut self) {
        self.preemption_enabled = false;
    }

    /// Suspend queue dispatch (timer bookkeeping continues)
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    pub fn resume(&mut self) {
        self.stalled = false;
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// One unit of work: the timer soft interrupt if pending, else one
    /// queued message. Returns false when there was nothing to do.
    pub fn run_once(&mut self) -> bool {
        if self.halted {
            return false;
        }
        if self.irq.take(SoftIrq::TIMER) {
            self.timer_soft_interrupt();
            return true;
        }
        if self.stalled {
            return false;
        }
        self.dispatch()
    }

    /// Run until idle, returning the units of work done
    pub fn run(&mut self) -> usize {
        let mut done = 0;
        while self.run_once() {
            done += 1;
        }
        done
    }

    /// Dispatch the head of the queue
    pub fn dispatch(&mut self) -> bool {
        let Some(msg) = self.queue.dequeue() else {
            return false;
        };
        let _ = self.dispatch_message(msg);
        true
    }

    /// Deliver one message and settle its payload
    ///
    /// Returns the handler's result; a reliable message reports it back
    /// to the sender as `PKT_SENDDONE`.
    pub(crate) fn dispatch_message(&mut self, mut msg: Message) -> KernelResult<()> {
        let Some(ctl) = self.registry.get(msg.did).copied() else {
            warn!("sched: no module {} for {:?} from {}", msg.did, msg.kind, msg.sid);
            self.stats.dropped += 1;
            if msg.flags.contains(MsgFlags::RELIABLE) {
                self.send_senddone(msg, false);
            } else {
                self.dispose(msg);
            }
            return Err(KernelError::NotFound);
        };

        if msg.flags.contains(MsgFlags::FROM_NETWORK)
            && !ctl.flags.contains(ModuleFlags::PROMISCUOUS)
            && msg.daddr != self.config.node_address
            && msg.daddr != BCAST_ADDRESS
        {
            trace!("sched: {} filtered message for node {:#06x}", msg.did, msg.daddr);
            self.stats.filtered += 1;
            self.dispose(msg);
            return Ok(());
        }

        if let Some(ptr) = msg.released() {
            if let Err(e) = self.heap.change_owner(ptr, msg.did) {
                warn!("sched: payload of {:?} for {} unusable: {}", msg.kind, msg.did, e);
                msg.payload = Payload::Empty;
                msg.len = 0;
            }
        }

        let result = self.deliver(ctl, &mut msg);
        self.stats.dispatched += 1;

        // Forwarded, freed or claimed by the handler: no longer ours to free
        if let Some(ptr) = msg.released() {
            if self.heap.owner(ptr) != Some(msg.did) {
                msg.payload = Payload::Empty;
            }
        }

        if msg.flags.contains(MsgFlags::RELIABLE) {
            self.send_senddone(msg, result.is_ok());
        } else {
            self.dispose(msg);
        }
        result
    }

    /// Report delivery of a reliable message back to its sender
    ///
    /// The original is parked and travels as the report's payload until
    /// the report itself is disposed.
    fn send_senddone(&mut self, mut msg: Message, delivered: bool) {
        let sender = msg.sid;
        if !delivered {
            msg.flags.insert(MsgFlags::SEND_FAIL);
        }
        if let Some(ptr) = msg.released() {
            let _ = self.heap.change_owner(ptr, Pid::SCHED);
        }
        let slot = match self.queue.park(msg) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("sched: no room to report {:?} to {}: {}", msg.kind, sender, e);
                self.dispose(msg);
                return;
            }
        };
        let flags = if delivered {
            MsgFlags::empty()
        } else {
            MsgFlags::SEND_FAIL
        };
        let report = Message::new(sender, Pid::SCHED, MsgType::PKT_SENDDONE)
            .with_payload(Payload::Nested(slot), msg.len)
            .with_flags(flags);
        if let Err(e) = self.post_message(report) {
            warn!("sched: send-done for {} lost: {}", sender, e);
        }
    }

    /// Return a message's resources
    ///
    /// A released payload is freed unless someone other than the kernel
    /// or the destination has claimed it; a send-done report releases its
    /// parked original.
    pub(crate) fn dispose(&mut self, msg: Message) {
        match msg.payload {
            Payload::Heap(ptr) if msg.flags.contains(MsgFlags::RELEASE) => {
                let owner = self.heap.owner(ptr);
                if owner == Some(Pid::SCHED) || owner == Some(msg.did) {
                    let _ = self.heap.free(ptr);
                }
            }
            Payload::Nested(slot) => {
                if let Some(inner) = self.queue.unpark(slot) {
                    self.dispose(inner);
                }
            }
            _ => {}
        }
    }

    /// Run a handler inside the recovery boundary
    pub(crate) fn deliver(&mut self, ctl: ModuleControl, msg: &mut Message) -> KernelResult<()> {
        let prev = self.irq.current();
        self.pid_stack
            .push(prev)
            .map_err(|_| KernelError::NoMemory)?;
        self.irq.set_current(ctl.pid);
        trace!("sched: {:?} {} -> {}", msg.kind, msg.sid, ctl.pid);

        let result = (ctl.header.handler)(self, msg);

        self.irq.set_current(prev);
        self.pid_stack.pop();

        if self.fault == Some(ctl.pid) {
            self.fault = None;
            self.stats.faults += 1;
            error!("sched: module {} panicked, removing it", ctl.pid);
            let live = self
                .registry
                .get(ctl.pid)
                .is_some_and(|c| !c.flags.contains(ModuleFlags::FINALIZING));
            if live {
                let _ = self.deregister(ctl.pid);
            }
            return Err(KernelError::ModulePanic(ctl.pid));
        }
        result
    }

    /// Timer soft interrupt: charge elapsed ticks, deliver every expiry,
    /// re-arm repeating timers and reprogram the countdown
    fn timer_soft_interrupt(&mut self) {
        self.stats.soft_interrupts += 1;
        self.timers.update_delta(&self.irq);
        while let Some(expiry) = self.timers.pop_expired() {
            self.stats.timer_expiries += 1;
            let msg = Message::short(
                expiry.pid,
                Pid::TIMER,
                MsgType::TIMER_TIMEOUT,
                expiry.tid,
                0,
                expiry.flags,
            );
            if self.config.preemptive || self.stalled {
                if let Err(e) = self.post_message(msg) {
                    warn!("sched: timeout {}/{} lost: {}", expiry.pid, expiry.tid, e);
                }
            } else {
                let _ = self.dispatch_message(msg);
            }
        }
        self.timers.rearm(&self.irq);
    }

    /// Drop every queued message equal to `target`, returning how many
    pub fn remove_matching(&mut self, target: &Message) -> usize {
        let mut removed = 0;
        while let Some(msg) = self.queue.remove_matching(target) {
            self.dispose(msg);
            removed += 1;
        }
        removed
    }

    /// Collect scheduler-owned memory no queued or parked message refers to
    pub fn gc_kernel(&mut self) -> usize {
        let live: Vec<MemPtr, MSG_POOL_SIZE> = self
            .queue
            .iter()
            .chain(self.queue.iter_parked())
            .filter_map(Message::released)
            .take(MSG_POOL_SIZE)
            .collect();
        for ptr in live {
            let _ = self.heap.gc_mark(Pid::SCHED, ptr);
        }
        self.heap.gc_sweep(Pid::SCHED)
    }

    /// Conservative collection of a module's memory, rooted at its state
    pub fn gc_module(&mut self, pid: Pid) -> KernelResult<usize> {
        let ctl = self.registry.get(pid).ok_or(KernelError::InvalidArgument)?;
        let root = ctl.state;
        Ok(self.heap.gc_module(pid, root))
    }
}
