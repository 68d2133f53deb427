//! Module registry — control blocks, id pool, registration lifecycle
//!
//! Control blocks live in a fixed arena threaded into `MODULE_BINS`
//! buckets by `pid % MODULE_BINS`. Registration allocates the module's
//! state, reserves its timers and posts `INIT` through the queue;
//! deregistration delivers `FINAL` synchronously, then reclaims every
//! timer, queued message and heap area the module still owns.
//!
//! Author: Moroya Sakamoto

use log::{debug, warn};

use crate::config::{MAX_MODULES, MODULE_BINS};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::ClassList;
use crate::malloc::MemPtr;
use crate::message::{Message, MsgFlags, MsgType, Payload};
use crate::module::{ModuleFlags, ModuleHeader, Pid};

/// Module control block
#[derive(Debug, Clone, Copy)]
pub struct ModuleControl {
    pub pid: Pid,
    /// Read-only descriptor
    pub header: &'static ModuleHeader,
    /// State area (owned by the module on the heap)
    pub state: Option<MemPtr>,
    pub flags: ModuleFlags,
}

/// Hash-bucketed control block table
pub struct Registry {
    slots: [Option<ModuleControl>; MAX_MODULES],
    bins: ClassList<MODULE_BINS, MAX_MODULES>,
    /// Dynamic id pool, bit n = `THREAD_MIN + n` in use
    thread_pids: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_MODULES],
            bins: ClassList::new(),
            thread_pids: 0,
        }
    }

    fn bucket(pid: Pid) -> u8 {
        (pid.0 as usize % MODULE_BINS) as u8
    }

    fn lookup(&self, pid: Pid) -> Option<u8> {
        let slots = &self.slots;
        self.bins.find(Self::bucket(pid), |s| {
            slots[s as usize].is_some_and(|c| c.pid == pid)
        })
    }

    pub fn get(&self, pid: Pid) -> Option<&ModuleControl> {
        let slot = self.lookup(pid)?;
        self.slots[slot as usize].as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ModuleControl> {
        let slot = self.lookup(pid)?;
        self.slots[slot as usize].as_mut()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lookup(pid).is_some()
    }

    /// Insert a control block at the head of its bucket
    pub fn link(&mut self, ctl: ModuleControl) -> KernelResult<()> {
        if self.contains(ctl.pid) {
            return Err(KernelError::AlreadyExists);
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoMemory)?;
        self.slots[slot] = Some(ctl);
        self.bins.push_front(Self::bucket(ctl.pid), slot as u8);
        Ok(())
    }

    pub fn unlink(&mut self, pid: Pid) -> Option<ModuleControl> {
        let slot = self.lookup(pid)?;
        self.bins.remove(slot);
        self.slots[slot as usize].take()
    }

    /// Take the lowest free id of the dynamic pool
    pub fn alloc_thread_pid(&mut self) -> KernelResult<Pid> {
        let span = Pid::MAX.0 - Pid::THREAD_MIN.0 + 1;
        for n in 0..span {
            let pid = Pid(Pid::THREAD_MIN.0 + n);
            if self.thread_pids & (1 << n) == 0 && !self.contains(pid) {
                self.thread_pids |= 1 << n;
                return Ok(pid);
            }
        }
        Err(KernelError::NoMemory)
    }

    pub fn free_thread_pid(&mut self, pid: Pid) {
        if pid.is_thread() {
            self.thread_pids &= !(1 << (pid.0 - Pid::THREAD_MIN.0));
        }
    }

    /// Registered modules in bucket order
    pub fn iter(&self) -> impl Iterator<Item = &ModuleControl> + '_ {
        (0..MODULE_BINS as u8)
            .flat_map(move |b| self.bins.iter(b))
            .filter_map(move |s| self.slots[s as usize].as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First module running the program image `code_id`
    pub fn find_by_code(&self, code_id: u16) -> Option<Pid> {
        self.iter()
            .find(|c| c.header.code_id == code_id && !c.flags.contains(ModuleFlags::FINALIZING))
            .map(|c| c.pid)
    }

    pub fn bucket_len(&self, bucket: u8) -> usize {
        self.bins.len(bucket)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Register a module under the fixed id in its header
    pub fn register_module(&mut self, header: &'static ModuleHeader, init: &[u8]) -> KernelResult<Pid> {
        if header.pid > Pid::APP_MAX {
            return Err(KernelError::InvalidArgument);
        }
        self.register_with(header, header.pid, ModuleFlags::empty(), init)
    }

    /// Register a module under an id taken from the dynamic pool
    pub fn spawn_module(&mut self, header: &'static ModuleHeader, init: &[u8]) -> KernelResult<Pid> {
        let pid = self.registry.alloc_thread_pid()?;
        self.register_with(header, pid, ModuleFlags::THREAD, init)
            .inspect_err(|_| self.registry.free_thread_pid(pid))
    }

    /// Register a built-in kernel module (no state area)
    pub fn register_kernel_module(&mut self, header: &'static ModuleHeader) -> KernelResult<Pid> {
        if header.pid > Pid::APP_MAX {
            return Err(KernelError::InvalidArgument);
        }
        self.register_with(header, header.pid, ModuleFlags::STATIC, &[])
    }

    fn register_with(
        &mut self,
        header: &'static ModuleHeader,
        pid: Pid,
        flags: ModuleFlags,
        init: &[u8],
    ) -> KernelResult<Pid> {
        if self.registry.contains(pid) {
            return Err(KernelError::AlreadyExists);
        }
        if let Err(e) = self.attach(header, pid, flags, init) {
            warn!("registry: {} not registered: {}", pid, e);
            self.timers.remove_all(pid);
            self.registry.unlink(pid);
            self.heap.remove_all(pid);
            return Err(e);
        }
        debug!(
            "registry: {} registered (code {:#06x}, {} state bytes)",
            pid, header.code_id, header.state_size
        );
        Ok(pid)
    }

    fn attach(
        &mut self,
        header: &'static ModuleHeader,
        pid: Pid,
        flags: ModuleFlags,
        init: &[u8],
    ) -> KernelResult<()> {
        let state = if header.state_size > 0 && !flags.contains(ModuleFlags::STATIC) {
            let ptr = self.heap.alloc_longterm(header.state_size as usize, pid)?;
            self.heap.bytes_mut(ptr)?.fill(0);
            Some(ptr)
        } else {
            None
        };
        self.timers.preallocate(pid, header.num_timers)?;
        self.registry.link(ModuleControl {
            pid,
            header,
            state,
            flags,
        })?;

        let mut msg = Message::new(pid, Pid::SCHED, MsgType::INIT).with_flags(MsgFlags::SYSTEM_PRIORITY);
        if !init.is_empty() {
            let len = u16::try_from(init.len()).map_err(|_| KernelError::InvalidArgument)?;
            let ptr = self.heap.alloc(init.len(), pid)?;
            self.heap.bytes_mut(ptr)?[..init.len()].copy_from_slice(init);
            msg = msg
                .with_payload(Payload::Heap(ptr), len)
                .with_flags(MsgFlags::SYSTEM_PRIORITY | MsgFlags::RELEASE);
        }
        self.post_message(msg)
    }

    /// Remove a module and everything it owns
    ///
    /// `FINAL` is delivered synchronously before the control block is
    /// unlinked. Queued messages addressed to the module, and queued
    /// messages still borrowing its memory, are discarded.
    pub fn deregister(&mut self, pid: Pid) -> KernelResult<()> {
        let ctl = self.registry.get_mut(pid).ok_or(KernelError::InvalidArgument)?;
        if ctl.flags.contains(ModuleFlags::FINALIZING) {
            return Err(KernelError::InvalidArgument);
        }
        ctl.flags.insert(ModuleFlags::FINALIZING);
        let ctl = *ctl;

        let mut fin = Message::new(pid, Pid::SCHED, MsgType::FINAL);
        if let Err(e) = self.deliver(ctl, &mut fin) {
            debug!("registry: {} failed FINAL: {}", pid, e);
        }

        self.registry.unlink(pid);
        if ctl.flags.contains(ModuleFlags::THREAD) {
            self.registry.free_thread_pid(pid);
        }
        let timers = self.timers.remove_all(pid);

        let stale = self.queue.drain_where(|m| {
            m.did == pid
                || (m.sid == pid
                    && matches!(m.payload, Payload::Heap(_))
                    && !m.flags.contains(MsgFlags::RELEASE))
        });
        let purged = stale.len();
        for m in stale {
            self.dispose(m);
        }

        let areas = self.heap.remove_all(pid);
        if self.fault == Some(pid) {
            self.fault = None;
        }
        debug!(
            "registry: {} removed ({} timers, {} messages, {} areas)",
            pid, timers, purged, areas
        );
        Ok(())
    }

    /// Deregister every instance of a program image, returning how many
    pub fn killall(&mut self, code_id: u16) -> usize {
        let mut killed = 0;
        while let Some(pid) = self.registry.find_by_code(code_id) {
            if self.deregister(pid).is_err() {
                break;
            }
            killed += 1;
        }
        killed
    }

    /// Replace a module's message filter rules (high nibble)
    pub fn change_rules(&mut self, pid: Pid, rules: u8) -> KernelResult<()> {
        let ctl = self.registry.get_mut(pid).ok_or(KernelError::InvalidArgument)?;
        let bits = (ctl.flags.bits() & ModuleFlags::KERNEL_MASK) | (rules & ModuleFlags::RULES_MASK);
        ctl.flags = ModuleFlags::from_bits_retain(bits);
        Ok(())
    }

    pub fn rules(&self, pid: Pid) -> Option<u8> {
        self.registry
            .get(pid)
            .map(|c| c.flags.bits() & ModuleFlags::RULES_MASK)
    }

    /// Snapshot of a module's control block
    pub fn query_module(&self, pid: Pid) -> Option<ModuleControl> {
        self.registry.get(pid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, MAX_PREALLOCATED_TIMERS};
    use crate::timer::TimerType;

    const WITNESS: Pid = Pid(140);
    const NOTE: MsgType = MsgType(40);

    /// Counts non-lifecycle messages in state[0]; on INIT stores the first
    /// init byte in state[1]; on FINAL tells the witness who is leaving
    fn counter(k: &mut Kernel, msg: &mut Message) -> KernelResult<()> {
        match msg.kind {
            MsgType::INIT => {
                let first = k.payload(msg).first().copied();
                if let Some(b) = first {
                    k.state()?[1] = b;
                }
                Ok(())
            }
            MsgType::FINAL => {
                let me = k.current_pid().0;
                k.post_value(WITNESS, NOTE, &[me], MsgFlags::empty())
            }
            _ => {
                let state = k.state()?;
                state[0] = state[0].wrapping_add(1);
                Ok(())
            }
        }
    }

    /// Records the last note byte in state[0]
    fn witness(k: &mut Kernel, msg: &mut Message) -> KernelResult<()> {
        if msg.kind == NOTE {
            let b = k.payload(msg)[0];
            k.state()?[0] = b;
        }
        Ok(())
    }

    /// Allocates, arms a timer and messages itself on INIT
    fn busy(k: &mut Kernel, msg: &mut Message) -> KernelResult<()> {
        if msg.kind == MsgType::INIT {
            k.alloc(20)?;
            k.alloc(40)?;
            k.timer_start(0, 50, TimerType::REPEAT)?;
            k.timer_start(1, 80, TimerType::ONE_SHOT)?;
            k.post_value(k.current_pid(), NOTE, &[1], MsgFlags::empty())?;
        }
        Ok(())
    }

    static COUNTER: ModuleHeader = ModuleHeader::new(Pid(130), counter).with_state(4).with_timers(1);
    static COUNTER_COPY: ModuleHeader = ModuleHeader::new(Pid(130), counter).with_state(8);
    static WITNESS_HDR: ModuleHeader = ModuleHeader::new(WITNESS, witness).with_state(2);
    static BUSY: ModuleHeader = ModuleHeader::new(Pid(131), busy).with_state(6).with_timers(2);
    static TOO_HIGH: ModuleHeader = ModuleHeader::new(Pid(230), counter);
    static TOO_MANY_TIMERS: ModuleHeader =
        ModuleHeader::new(Pid(132), counter).with_state(4).with_timers(MAX_PREALLOCATED_TIMERS as u8 + 1);
    static HUGE_STATE: ModuleHeader = ModuleHeader::new(Pid(133), counter).with_state(8000);
    static WORKER: ModuleHeader = ModuleHeader::new(Pid(0), counter).with_state(4).with_code_id(0x0777);
    static WORKER_FIXED: ModuleHeader = ModuleHeader::new(Pid(150), counter).with_code_id(0x0777);

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::testing())
    }

    #[test]
    fn test_registry_buckets() {
        let mut reg = Registry::new();
        for pid in [130u8, 138, 146, 131] {
            reg.link(ModuleControl {
                pid: Pid(pid),
                header: &COUNTER,
                state: None,
                flags: ModuleFlags::empty(),
            })
            .unwrap();
        }
        assert_eq!(reg.len(), 4);
        assert_eq!(reg.bucket_len((130 % MODULE_BINS) as u8), 3);
        assert!(reg.contains(Pid(146)));
        assert!(reg.unlink(Pid(138)).is_some());
        assert!(!reg.contains(Pid(138)));
        assert!(reg.contains(Pid(146)));
        assert!(reg.unlink(Pid(138)).is_none());
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = Registry::new();
        for n in 0..MAX_MODULES as u8 {
            reg.link(ModuleControl {
                pid: Pid(128 + n),
                header: &COUNTER,
                state: None,
                flags: ModuleFlags::empty(),
            })
            .unwrap();
        }
        let extra = ModuleControl {
            pid: Pid(200),
            header: &COUNTER,
            state: None,
            flags: ModuleFlags::empty(),
        };
        assert_eq!(reg.link(extra), Err(KernelError::NoMemory));
    }

    #[test]
    fn test_thread_pid_pool() {
        let mut reg = Registry::new();
        assert_eq!(reg.alloc_thread_pid(), Ok(Pid::THREAD_MIN));
        assert_eq!(reg.alloc_thread_pid(), Ok(Pid(225)));
        reg.free_thread_pid(Pid::THREAD_MIN);
        assert_eq!(reg.alloc_thread_pid(), Ok(Pid::THREAD_MIN));
        for _ in 0..29 {
            reg.alloc_thread_pid().unwrap();
        }
        assert_eq!(reg.alloc_thread_pid(), Err(KernelError::NoMemory));
    }

    #[test]
    fn test_register_posts_init() {
        let mut k = kernel();
        let pid = k.register_module(&COUNTER, &[]).unwrap();
        assert_eq!(pid, Pid(130));
        assert!(k.registry.contains(pid));
        assert_eq!(k.heap.owned_by(pid), 1);
        assert_eq!(k.timers.reserved_for(pid), 1);
        let init = k.queue.peek().unwrap();
        assert_eq!(init.kind, MsgType::INIT);
        assert!(init.flags.contains(MsgFlags::SYSTEM_PRIORITY));
        assert_eq!(k.run(), 1);
        assert_eq!(k.state_of(pid).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_init_payload_reaches_module() {
        let mut k = kernel();
        let pid = k.register_module(&COUNTER, &[9, 8, 7]).unwrap();
        let init = *k.queue.peek().unwrap();
        let ptr = init.released().unwrap();
        assert_eq!(k.heap.owner(ptr), Some(Pid::SCHED));
        k.run();
        assert_eq!(k.state_of(pid).unwrap()[1], 9);
        assert_eq!(k.heap.owner(ptr), None);
        assert_eq!(k.heap.owned_by(Pid::SCHED), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut k = kernel();
        k.register_module(&COUNTER, &[]).unwrap();
        let before = k.query_module(Pid(130)).unwrap();
        assert_eq!(k.register_module(&COUNTER_COPY, &[]), Err(KernelError::AlreadyExists));
        let after = k.query_module(Pid(130)).unwrap();
        assert_eq!(before.state, after.state);
        assert_eq!(after.header.state_size, 4);
        assert_eq!(k.queue.len(), 1);
    }

    #[test]
    fn test_fixed_pid_above_boundary_rejected() {
        let mut k = kernel();
        assert_eq!(k.register_module(&TOO_HIGH, &[]), Err(KernelError::InvalidArgument));
        assert_eq!(k.register_kernel_module(&TOO_HIGH), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_failed_registration_rolls_back() {
        let mut k = kernel();
        let free = k.heap.free_blocks();
        assert_eq!(k.register_module(&TOO_MANY_TIMERS, &[]), Err(KernelError::InvalidArgument));
        assert!(!k.registry.contains(Pid(132)));
        assert_eq!(k.heap.free_blocks(), free);
        assert_eq!(k.register_module(&HUGE_STATE, &[]), Err(KernelError::NoMemory));
        assert!(!k.registry.contains(Pid(133)));
        assert!(k.queue.is_empty());
    }

    #[test]
    fn test_deregister_reclaims_everything() {
        let mut k = kernel();
        let free_blocks = k.heap.free_blocks();
        let free_timers = k.timers.available();
        let pid = k.register_module(&BUSY, &[]).unwrap();
        assert!(k.dispatch());
        // state (2 blocks) + 20 bytes (3) + 40 bytes (6)
        assert_eq!(k.heap.owned_by(pid), 11);
        assert_eq!(k.heap.walk().filter(|a| a.owner == Some(pid)).count(), 3);
        assert_eq!(k.timers.owned_by(pid), 2);
        assert_eq!(k.queue.len(), 1);

        k.deregister(pid).unwrap();
        assert!(!k.registry.contains(pid));
        assert_eq!(k.heap.owned_by(pid), 0);
        assert_eq!(k.timers.owned_by(pid), 0);
        assert!(k.queue.iter().all(|m| m.did != pid && m.sid != pid));
        assert_eq!(k.heap.free_blocks(), free_blocks);
        assert_eq!(k.timers.available(), free_timers);
        k.heap.check().unwrap();

        assert_eq!(k.register_module(&BUSY, &[]), Ok(pid));
    }

    #[test]
    fn test_final_delivered_synchronously() {
        let mut k = kernel();
        k.register_module(&WITNESS_HDR, &[]).unwrap();
        let pid = k.register_module(&COUNTER, &[]).unwrap();
        k.run();
        k.deregister(pid).unwrap();
        assert_eq!(k.queue.len(), 1);
        k.run();
        assert_eq!(k.state_of(WITNESS).unwrap()[0], pid.0);
    }

    #[test]
    fn test_deregister_unknown() {
        let mut k = kernel();
        assert_eq!(k.deregister(Pid(199)), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_messages_to_removed_module_are_purged() {
        let mut k = kernel();
        let pid = k.register_module(&COUNTER, &[]).unwrap();
        k.run();
        let ptr = k.heap.alloc(16, Pid::SCHED).unwrap();
        let msg = Message::new(pid, Pid::SCHED, NOTE)
            .with_payload(Payload::Heap(ptr), 16)
            .with_flags(MsgFlags::RELEASE);
        k.post_message(msg).unwrap();
        k.deregister(pid).unwrap();
        assert!(k.queue.iter().all(|m| m.did != pid));
        assert_eq!(k.heap.owner(ptr), None);
    }

    #[test]
    fn test_spawn_uses_dynamic_pool() {
        let mut k = kernel();
        let a = k.spawn_module(&WORKER, &[]).unwrap();
        let b = k.spawn_module(&WORKER, &[]).unwrap();
        assert_eq!((a, b), (Pid(224), Pid(225)));
        assert!(k.query_module(a).unwrap().flags.contains(ModuleFlags::THREAD));
        k.deregister(a).unwrap();
        assert_eq!(k.spawn_module(&WORKER, &[]), Ok(Pid(224)));
    }

    #[test]
    fn test_killall_by_code_id() {
        let mut k = kernel();
        k.spawn_module(&WORKER, &[]).unwrap();
        k.spawn_module(&WORKER, &[]).unwrap();
        k.register_module(&WORKER_FIXED, &[]).unwrap();
        k.register_module(&COUNTER, &[]).unwrap();
        assert_eq!(k.killall(0x0777), 3);
        assert_eq!(k.registry.len(), 1);
        assert_eq!(k.killall(0x0777), 0);
    }

    #[test]
    fn test_kernel_module_has_no_state() {
        let mut k = kernel();
        let pid = k.register_kernel_module(&COUNTER).unwrap();
        let ctl = k.query_module(pid).unwrap();
        assert!(ctl.flags.contains(ModuleFlags::STATIC));
        assert!(ctl.state.is_none());
    }

    #[test]
    fn test_change_rules_keeps_kernel_bits() {
        let mut k = kernel();
        let pid = k.register_kernel_module(&COUNTER).unwrap();
        k.change_rules(pid, 0xFF).unwrap();
        let ctl = k.query_module(pid).unwrap();
        assert!(ctl.flags.contains(ModuleFlags::STATIC | ModuleFlags::PROMISCUOUS));
        assert!(!ctl.flags.contains(ModuleFlags::THREAD));
        assert_eq!(k.rules(pid), Some(0xF0));
        k.change_rules(pid, 0).unwrap();
        assert_eq!(k.rules(pid), Some(0));
        assert!(k.query_module(pid).unwrap().flags.contains(ModuleFlags::STATIC));
        assert_eq!(k.change_rules(Pid(199), 0x40), Err(KernelError::InvalidArgument));
    }
}
