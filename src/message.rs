//! Messages — headers, flags, payloads and the kernel message pool
//!
//! Message headers live in a fixed pool threaded by a `ClassList`. A
//! queued message sits in one of three lanes (HIGH, SYSTEM, LOW) that are
//! served in that order; the preemptive scheduler keeps everything in
//! the LOW lane sorted by priority instead. Send-done reports carry the
//! original message as a *parked* pool entry.
//!
//! Author: Moroya Sakamoto

use bitflags::bitflags;
use heapless::Vec;

use crate::config::MSG_POOL_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::list::ClassList;
use crate::malloc::MemPtr;
use crate::module::Pid;

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgType(pub u8);

impl MsgType {
    /// First message after registration
    pub const INIT: MsgType = MsgType(0);
    pub const DEBUG: MsgType = MsgType(1);
    /// A module timer expired (parameter byte = timer id)
    pub const TIMER_TIMEOUT: MsgType = MsgType(2);
    /// Delivery report for a reliable message
    pub const PKT_SENDDONE: MsgType = MsgType(3);
    /// Last message before deregistration, delivered synchronously
    pub const FINAL: MsgType = MsgType(6);
    pub const ERROR: MsgType = MsgType(15);
    /// First type free for modules
    pub const MOD_MSG_START: MsgType = MsgType(32);

    /// Reserved kernel type
    pub const fn is_kernel(self) -> bool {
        self.0 < Self::MOD_MSG_START.0
    }
}

bitflags! {
    /// Delivery flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u16 {
        /// Arrived over a link
        const FROM_NETWORK = 0x0100;
        const RADIO_IO = 0x0200;
        const I2C_IO = 0x0400;
        const UART_IO = 0x0800;
        const SPI_IO = 0x1000;
        const LINK_AUTO = 0x2000;
        /// Kernel lifecycle traffic
        const SYSTEM_PRIORITY = 0x0080;
        /// Fast timer expiries
        const HIGH_PRIORITY = 0x0040;
        /// Report delivery back to the sender
        const RELIABLE = 0x0008;
        /// Payload ownership passes to the kernel
        const RELEASE = 0x0004;
        /// Delivery failed (send-done reports)
        const SEND_FAIL = 0x0002;
    }
}

/// Inline payload capacity
pub const INLINE_PAYLOAD: usize = 4;

/// Message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Empty,
    /// Small value carried in the header
    Inline([u8; INLINE_PAYLOAD]),
    /// Heap allocation (kernel-owned when RELEASE is set)
    Heap(MemPtr),
    /// Parked original message of a send-done report
    Nested(u8),
}

/// Parameter of a short message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgParam {
    pub byte: u8,
    pub word: u16,
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Destination module
    pub did: Pid,
    /// Source module
    pub sid: Pid,
    /// Destination node
    pub daddr: u16,
    /// Source node
    pub saddr: u16,
    pub kind: MsgType,
    /// Payload length in bytes
    pub len: u16,
    pub flags: MsgFlags,
    /// Scheduling priority (preemptive kernel only)
    pub priority: u8,
    pub payload: Payload,
}

impl Message {
    pub const EMPTY: Message = Message::new(Pid::NULL, Pid::NULL, MsgType::DEBUG);

    /// Header with no payload
    pub const fn new(did: Pid, sid: Pid, kind: MsgType) -> Self {
        Self {
            did,
            sid,
            daddr: 0,
            saddr: 0,
            kind,
            len: 0,
            flags: MsgFlags::empty(),
            priority: 0,
            payload: Payload::Empty,
        }
    }

    /// Short message: one byte and one word inline
    pub fn short(did: Pid, sid: Pid, kind: MsgType, byte: u8, word: u16, flags: MsgFlags) -> Self {
        let w = word.to_le_bytes();
        Self {
            len: 3,
            flags: flags.difference(MsgFlags::RELEASE),
            payload: Payload::Inline([byte, w[0], w[1], 0]),
            ..Self::new(did, sid, kind)
        }
    }

    pub fn with_payload(self, payload: Payload, len: u16) -> Self {
        Self {
            payload,
            len,
            ..self
        }
    }

    pub fn with_flags(self, flags: MsgFlags) -> Self {
        Self { flags, ..self }
    }

    pub fn with_addresses(self, saddr: u16, daddr: u16) -> Self {
        Self {
            saddr,
            daddr,
            ..self
        }
    }

    /// Decode a short-message parameter
    pub fn param(&self) -> Option<MsgParam> {
        match self.payload {
            Payload::Inline(b) if self.len >= 3 => Some(MsgParam {
                byte: b[0],
                word: u16::from_le_bytes([b[1], b[2]]),
            }),
            _ => None,
        }
    }

    /// Heap payload whose ownership travels with the message
    pub fn released(&self) -> Option<MemPtr> {
        match self.payload {
            Payload::Heap(ptr) if self.flags.contains(MsgFlags::RELEASE) => Some(ptr),
            _ => None,
        }
    }
}

const HIGH: u8 = 0;
const SYSTEM: u8 = 1;
const LOW: u8 = 2;
const PARKED: u8 = 3;
const FREE: u8 = 4;

const LANES: [u8; 3] = [HIGH, SYSTEM, LOW];

/// Queue lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    High,
    System,
    Low,
}

impl Lane {
    /// Lane chosen by the cooperative scheduler
    pub fn for_flags(flags: MsgFlags) -> Lane {
        if flags.contains(MsgFlags::HIGH_PRIORITY) {
            Lane::High
        } else if flags.contains(MsgFlags::SYSTEM_PRIORITY) {
            Lane::System
        } else {
            Lane::Low
        }
    }

    const fn class(self) -> u8 {
        match self {
            Lane::High => HIGH,
            Lane::System => SYSTEM,
            Lane::Low => LOW,
        }
    }
}

/// Message pool and run queue
pub struct MessageQueue {
    slots: [Message; MSG_POOL_SIZE],
    lanes: ClassList<5, MSG_POOL_SIZE>,
}

impl MessageQueue {
    pub fn new() -> Self {
        let mut lanes = ClassList::new();
        for slot in 0..MSG_POOL_SIZE {
            lanes.push_back(FREE, slot as u8);
        }
        Self {
            slots: [Message::EMPTY; MSG_POOL_SIZE],
            lanes,
        }
    }

    fn take_slot(&mut self, msg: Message) -> KernelResult<u8> {
        let slot = self.lanes.pop_front(FREE).ok_or(KernelError::NoMemory)?;
        self.slots[slot as usize] = msg;
        Ok(slot)
    }

    /// No header left in the pool
    pub fn is_full(&self) -> bool {
        self.lanes.is_empty(FREE)
    }

    /// Queued messages
    pub fn len(&self) -> usize {
        LANES.iter().map(|&lane| self.lanes.len(lane)).sum()
    }

    pub fn is_empty(&self) -> bool {
        LANES.iter().all(|&lane| self.lanes.is_empty(lane))
    }

    /// Messages held as send-done originals
    pub fn parked_len(&self) -> usize {
        self.lanes.len(PARKED)
    }

    /// Append to the lane picked by the message flags
    pub fn enqueue(&mut self, msg: Message) -> KernelResult<()> {
        let lane = Lane::for_flags(msg.flags).class();
        let slot = self.take_slot(msg)?;
        self.lanes.push_back(lane, slot);
        Ok(())
    }

    /// Insert after every queued message of equal or higher priority
    pub fn enqueue_by_priority(&mut self, msg: Message) -> KernelResult<()> {
        let slot = self.take_slot(msg)?;
        let slots = &self.slots;
        match self
            .lanes
            .find(LOW, |s| slots[s as usize].priority < msg.priority)
        {
            Some(before) => self.lanes.insert_before(slot, before),
            None => self.lanes.push_back(LOW, slot),
        }
        Ok(())
    }

    fn head_slot(&self) -> Option<u8> {
        LANES.iter().find_map(|&lane| self.lanes.front(lane))
    }

    /// Next message to dispatch
    pub fn peek(&self) -> Option<&Message> {
        self.head_slot().map(|s| &self.slots[s as usize])
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        let slot = self.head_slot()?;
        self.lanes.push_back(FREE, slot);
        Some(self.slots[slot as usize])
    }

    /// Queued messages in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        LANES
            .iter()
            .flat_map(move |&lane| self.lanes.iter(lane))
            .map(move |s| &self.slots[s as usize])
    }

    /// Hold a message outside the run queue
    pub fn park(&mut self, msg: Message) -> KernelResult<u8> {
        let slot = self.take_slot(msg)?;
        self.lanes.push_back(PARKED, slot);
        Ok(slot)
    }

    pub fn parked(&self, slot: u8) -> Option<&Message> {
        (self.lanes.class_of(slot) == Some(PARKED)).then(|| &self.slots[slot as usize])
    }

    pub fn parked_mut(&mut self, slot: u8) -> Option<&mut Message> {
        if self.lanes.class_of(slot) != Some(PARKED) {
            return None;
        }
        Some(&mut self.slots[slot as usize])
    }

    /// Return a parked message to the pool
    pub fn unpark(&mut self, slot: u8) -> Option<Message> {
        if self.lanes.class_of(slot) != Some(PARKED) {
            return None;
        }
        self.lanes.push_back(FREE, slot);
        Some(self.slots[slot as usize])
    }

    /// Parked messages
    pub fn iter_parked(&self) -> impl Iterator<Item = &Message> + '_ {
        self.lanes.iter(PARKED).map(move |s| &self.slots[s as usize])
    }

    /// Take the first queued message equal to `target`
    pub fn remove_matching(&mut self, target: &Message) -> Option<Message> {
        let slot = LANES.iter().find_map(|&lane| {
            self.lanes
                .find(lane, |s| self.slots[s as usize] == *target)
        })?;
        self.lanes.push_back(FREE, slot);
        Some(self.slots[slot as usize])
    }

    /// Take every queued message matching `pred`
    pub fn drain_where(&mut self, mut pred: impl FnMut(&Message) -> bool) -> Vec<Message, MSG_POOL_SIZE> {
        let mut hits: Vec<u8, MSG_POOL_SIZE> = Vec::new();
        for &lane in LANES.iter() {
            for s in self.lanes.iter(lane) {
                if pred(&self.slots[s as usize]) {
                    let _ = hits.push(s);
                }
            }
        }
        let mut taken = Vec::new();
        for s in hits {
            self.lanes.push_back(FREE, s);
            let _ = taken.push(self.slots[s as usize]);
        }
        taken
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
