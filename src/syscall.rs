//! System calls — the module-facing kernel surface
//!
//! Every call is attributed to the module whose handler is running
//! (`irq.current()`); callers never pass their own id. Running out of
//! memory inside a handler is not reported back: the module panics, and
//! the dispatch loop removes it once its handler returns (or the node
//! halts when fault recovery is off).
//!
//! Author: Moroya Sakamoto

use log::{error, warn};

use crate::error::{KernelError, KernelResult};
use crate::irq::RealtimeFn;
use crate::kernel::Kernel;
use crate::malloc::MemPtr;
use crate::message::{Message, MsgFlags, MsgType, Payload, INLINE_PAYLOAD};
use crate::module::Pid;
use crate::timer::TimerType;

impl Kernel {
    /// Caller id, refusing callers that already panicked
    fn guard(&self) -> KernelResult<Pid> {
        if self.halted {
            return Err(KernelError::Halted);
        }
        let pid = self.irq.current();
        if self.fault == Some(pid) {
            return Err(KernelError::ModulePanic(pid));
        }
        Ok(pid)
    }

    /// Fatal failure of the running module
    ///
    /// Outside any handler the cause is returned unchanged.
    fn module_panic(&mut self, cause: KernelError) -> KernelError {
        if self.pid_stack.is_empty() {
            return cause;
        }
        let pid = self.irq.current();
        if self.config.fault_recovery {
            error!("syscall: module {} panicked: {}", pid, cause);
            self.fault = Some(pid);
            KernelError::ModulePanic(pid)
        } else {
            error!("syscall: module {} failed with {}, node halted", pid, cause);
            self.halted = true;
            KernelError::Halted
        }
    }

    fn escalate(&mut self, e: KernelError) -> KernelError {
        match e {
            KernelError::NoMemory => self.module_panic(e),
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn alloc(&mut self, size: usize) -> KernelResult<MemPtr> {
        let pid = self.guard()?;
        self.heap.alloc(size, pid).map_err(|e| self.escalate(e))
    }

    pub fn alloc_longterm(&mut self, size: usize) -> KernelResult<MemPtr> {
        let pid = self.guard()?;
        self.heap
            .alloc_longterm(size, pid)
            .map_err(|e| self.escalate(e))
    }

    /// A handler may only touch blocks it owns
    fn check_owner(&self, pid: Pid, ptr: MemPtr) -> KernelResult<()> {
        if self.pid_stack.is_empty() {
            return Ok(());
        }
        match self.heap.owner(ptr) {
            Some(owner) if owner != pid => {
                warn!("syscall: module {} touched block {:?} of {}", pid, ptr, owner);
                Err(KernelError::NotPermitted)
            }
            _ => Ok(()),
        }
    }

    /// Resize an allocation of the caller
    pub fn realloc(&mut self, ptr: MemPtr, size: usize) -> KernelResult<MemPtr> {
        let pid = self.guard()?;
        self.check_owner(pid, ptr)?;
        self.heap.realloc(ptr, size).map_err(|e| self.escalate(e))
    }

    /// Free an allocation of the caller; a corrupt or stale handle is
    /// refused, and so is a block owned by another module
    pub fn free(&mut self, ptr: MemPtr) -> KernelResult<()> {
        let pid = self.guard()?;
        self.check_owner(pid, ptr)?;
        self.heap.free(ptr).map(|_| ())
    }

    /// Take ownership of an allocation
    pub fn change_owner(&mut self, ptr: MemPtr) -> KernelResult<()> {
        let pid = self.guard()?;
        self.heap.change_owner(ptr, pid)
    }

    pub fn mem_bytes(&self, ptr: MemPtr) -> KernelResult<&[u8]> {
        self.heap.bytes(ptr)
    }

    pub fn mem_bytes_mut(&mut self, ptr: MemPtr) -> KernelResult<&mut [u8]> {
        self.heap.bytes_mut(ptr)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Initialise and arm timer `tid` of the caller
    pub fn timer_start(&mut self, tid: u8, interval: i32, kind: TimerType) -> KernelResult<()> {
        let pid = self.guard()?;
        self.timers
            .init(pid, tid, kind)
            .and_then(|()| self.timers.start(&self.irq, pid, tid, interval))
            .map_err(|e| self.escalate(e))
    }

    /// Re-arm timer `tid`; `interval <= 0` reuses its last period
    pub fn timer_restart(&mut self, tid: u8, interval: i32) -> KernelResult<()> {
        let pid = self.guard()?;
        self.timers.restart(&self.irq, pid, tid, interval)
    }

    /// Stop timer `tid` and give its control block back
    pub fn timer_stop(&mut self, tid: u8) -> KernelResult<()> {
        let pid = self.guard()?;
        self.timers.release(pid, tid)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Post a message to a local module
    ///
    /// With `RELEASE` the payload belongs to the kernel from here on,
    /// even if posting fails.
    pub fn post(
        &mut self,
        did: Pid,
        kind: MsgType,
        len: u16,
        payload: Option<MemPtr>,
        flags: MsgFlags,
    ) -> KernelResult<()> {
        let node = self.config.node_address;
        self.post_to_address(did, kind, len, payload, flags, node)
    }

    /// Post a message with an explicit destination node
    ///
    /// The transport bits of `flags` (radio, UART, I2C, SPI) select the
    /// link driver that will carry it; the kernel only queues it.
    pub fn post_to_address(
        &mut self,
        did: Pid,
        kind: MsgType,
        len: u16,
        payload: Option<MemPtr>,
        flags: MsgFlags,
        daddr: u16,
    ) -> KernelResult<()> {
        let sid = self.guard()?;
        let payload = payload.map_or(Payload::Empty, Payload::Heap);
        let msg = Message::new(did, sid, kind)
            .with_payload(payload, len)
            .with_flags(flags)
            .with_addresses(self.config.node_address, daddr);
        self.post_message(msg)
    }

    /// Post up to four bytes carried in the message itself
    pub fn post_value(&mut self, did: Pid, kind: MsgType, value: &[u8], flags: MsgFlags) -> KernelResult<()> {
        let sid = self.guard()?;
        if value.len() > INLINE_PAYLOAD {
            return Err(KernelError::InvalidArgument);
        }
        let mut inline = [0u8; INLINE_PAYLOAD];
        inline[..value.len()].copy_from_slice(value);
        let node = self.config.node_address;
        let msg = Message::new(did, sid, kind)
            .with_payload(Payload::Inline(inline), value.len() as u16)
            .with_flags(flags.difference(MsgFlags::RELEASE))
            .with_addresses(node, node);
        self.post_message(msg)
    }

    /// Claim an inbound payload
    ///
    /// A released payload changes hands and is detached from the message;
    /// anything else is copied into a fresh allocation of the caller.
    pub fn take_payload(&mut self, msg: &mut Message) -> KernelResult<MemPtr> {
        let pid = self.guard()?;
        self.claim(pid, msg)
    }

    fn claim(&mut self, pid: Pid, msg: &mut Message) -> KernelResult<MemPtr> {
        let len = msg.len as usize;
        match msg.payload {
            Payload::Heap(ptr) if msg.flags.contains(MsgFlags::RELEASE) => {
                self.heap.change_owner(ptr, pid)?;
                msg.payload = Payload::Empty;
                msg.len = 0;
                msg.flags.remove(MsgFlags::RELEASE);
                Ok(ptr)
            }
            Payload::Heap(src) => {
                let dst = self.heap.alloc(len.max(1), pid).map_err(|e| self.escalate(e))?;
                let copied = len.min(self.heap.usable_size(src)?);
                self.heap.copy(src, dst, copied)?;
                Ok(dst)
            }
            Payload::Inline(bytes) => {
                let len = len.min(INLINE_PAYLOAD);
                let dst = self.heap.alloc(len.max(1), pid).map_err(|e| self.escalate(e))?;
                self.heap.bytes_mut(dst)?[..len].copy_from_slice(&bytes[..len]);
                Ok(dst)
            }
            Payload::Nested(slot) => {
                let mut inner = *self.queue.parked(slot).ok_or(KernelError::InvalidArgument)?;
                let ptr = self.claim(pid, &mut inner)?;
                if let Some(parked) = self.queue.parked_mut(slot) {
                    *parked = inner;
                }
                Ok(ptr)
            }
            Payload::Empty => Err(KernelError::InvalidArgument),
        }
    }

    /// Payload bytes of a message (a send-done report shows its original's)
    pub fn payload<'a>(&'a self, msg: &'a Message) -> &'a [u8] {
        let len = msg.len as usize;
        match &msg.payload {
            Payload::Inline(bytes) => &bytes[..len.min(INLINE_PAYLOAD)],
            Payload::Heap(ptr) => match self.heap.bytes(*ptr) {
                Ok(bytes) => &bytes[..len.min(bytes.len())],
                Err(e) => {
                    warn!("syscall: payload of {:?} unreadable: {}", msg.kind, e);
                    &[]
                }
            },
            Payload::Nested(slot) => match self.queue.parked(*slot) {
                Some(original) => self.payload(original),
                None => &[],
            },
            Payload::Empty => &[],
        }
    }

    /// Original message carried by a send-done report
    pub fn original_message(&self, msg: &Message) -> Option<&Message> {
        match msg.payload {
            Payload::Nested(slot) => self.queue.parked(slot),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // State and identity
    // ------------------------------------------------------------------

    /// State area of the running module
    pub fn state(&mut self) -> KernelResult<&mut [u8]> {
        let pid = self.guard()?;
        let ctl = self.registry.get(pid).ok_or(KernelError::NotFound)?;
        let size = ctl.header.state_size as usize;
        match ctl.state {
            Some(ptr) => Ok(&mut self.heap.bytes_mut(ptr)?[..size]),
            None => Ok(&mut []),
        }
    }

    /// State area of any module
    pub fn state_of(&self, pid: Pid) -> Option<&[u8]> {
        let ctl = self.registry.get(pid)?;
        let bytes = self.heap.bytes(ctl.state?).ok()?;
        Some(&bytes[..ctl.header.state_size as usize])
    }

    pub fn node_id(&self) -> u16 {
        self.config.node_address
    }

    /// xorshift16
    pub fn random16(&mut self) -> u16 {
        let mut x = self.rng;
        x ^= x << 7;
        x ^= x >> 9;
        x ^= x << 8;
        self.rng = x;
        x
    }

    /// Ticks since boot
    pub fn system_time32(&self) -> u32 {
        self.irq.system_time()
    }

    /// Module whose handler is running (the scheduler between messages)
    pub fn current_pid(&self) -> Pid {
        self.irq.current()
    }

    /// Module interrupted by the running handler
    pub fn caller_pid(&self) -> Option<Pid> {
        self.pid_stack.last().copied()
    }

    // ------------------------------------------------------------------
    // Realtime clocks
    // ------------------------------------------------------------------

    pub fn realtime_start(&mut self, value: u16, interval: u16, f: RealtimeFn) -> KernelResult<()> {
        self.guard()?;
        self.irq.realtime_start(value, interval, f)
    }

    pub fn realtime_stop(&mut self, f: RealtimeFn) -> KernelResult<()> {
        self.guard()?;
        self.irq.realtime_stop(f)
    }
}
