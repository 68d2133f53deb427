//! Block heap — first-fit allocator with owner tags and guard bytes
//!
//! The heap is a flat byte array cut into `BLOCK_SIZE` blocks. Every
//! area starts with a 3-byte header (`blocks: u16` with RESERVED and
//! GC_MARK in the top bits, `owner: u8`) and ends with a guard byte that
//! repeats the owner. Free areas keep their doubly linked free-list
//! links (`prev`, `next` block numbers) right after the header. The last
//! block is a permanently reserved sentinel anchoring the free list.
//!
//! - `alloc`: first fit, merging free successors while scanning
//! - `alloc_longterm`: full merge, then the tail of the highest fit
//! - `free`: guard check, head insert, forward coalesce
//! - `remove_all` / `gc_sweep`: stride walk over the whole heap
//!
//! Author: Moroya Sakamoto

use heapless::Vec;
use log::{debug, trace, warn};

use crate::config::{BLOCK_SIZE, GC_SCAN_DEPTH};
use crate::error::{KernelError, KernelResult};
use crate::module::Pid;

const RESERVED: u16 = 0x8000;
const GC_MARK: u16 = 0x4000;
const COUNT_MASK: u16 = 0x3FFF;

const HEADER_SIZE: usize = 3;
const OVERHEAD: usize = HEADER_SIZE + 1;

/// Handle to an allocation: byte offset of its payload within the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemPtr(u16);

impl MemPtr {
    /// Offset as stored in module memory
    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

/// One area seen by a heap walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// First block number
    pub index: u16,
    /// Length in blocks
    pub blocks: u16,
    /// Owner, `None` when free
    pub owner: Option<Pid>,
    /// GC mark bit
    pub marked: bool,
}

/// Block heap of `BYTES` bytes
pub struct Heap<const BYTES: usize> {
    mem: [u8; BYTES],
}

impl<const BYTES: usize> Heap<BYTES> {
    const BLOCKS: usize = BYTES / BLOCK_SIZE;
    const SENTINEL: u16 = (Self::BLOCKS - 1) as u16;
    const _ASSERT: () = assert!(
        BYTES % BLOCK_SIZE == 0
            && Self::BLOCKS >= 2
            && BYTES <= u16::MAX as usize
            && Self::BLOCKS <= COUNT_MASK as usize
    );

    /// Fresh heap: one free area covering everything below the sentinel
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_ASSERT;
        let mut heap = Self { mem: [0u8; BYTES] };
        let s = Self::SENTINEL;
        heap.set_raw(s, RESERVED | 1);
        heap.set_owner_byte(s, Pid::NULL.0);
        heap.set_next(s, s);
        heap.set_prev(s, s);

        heap.set_raw(0, Self::SENTINEL);
        heap.set_owner_byte(0, Pid::NULL.0);
        heap.insert_head(0);
        heap
    }

    /// Usable blocks (sentinel excluded)
    pub const fn capacity_blocks(&self) -> usize {
        Self::BLOCKS - 1
    }

    /// Blocks needed for a `size`-byte request
    pub fn blocks_for(size: usize) -> KernelResult<u16> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let blocks = size
            .checked_add(OVERHEAD)
            .ok_or(KernelError::NoMemory)?
            .div_ceil(BLOCK_SIZE);
        if blocks > Self::BLOCKS - 1 {
            return Err(KernelError::NoMemory);
        }
        Ok(blocks as u16)
    }

    // ------------------------------------------------------------------
    // Header access
    // ------------------------------------------------------------------

    #[inline]
    fn base(b: u16) -> usize {
        b as usize * BLOCK_SIZE
    }

    #[inline]
    fn raw(&self, b: u16) -> u16 {
        let o = Self::base(b);
        u16::from_le_bytes([self.mem[o], self.mem[o + 1]])
    }

    #[inline]
    fn set_raw(&mut self, b: u16, v: u16) {
        let o = Self::base(b);
        self.mem[o..o + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn count(&self, b: u16) -> u16 {
        self.raw(b) & COUNT_MASK
    }

    fn set_count(&mut self, b: u16, n: u16) {
        let flags = self.raw(b) & !COUNT_MASK;
        self.set_raw(b, flags | n);
    }

    #[inline]
    fn is_reserved(&self, b: u16) -> bool {
        self.raw(b) & RESERVED != 0
    }

    #[inline]
    fn owner_byte(&self, b: u16) -> u8 {
        self.mem[Self::base(b) + 2]
    }

    #[inline]
    fn set_owner_byte(&mut self, b: u16, owner: u8) {
        self.mem[Self::base(b) + 2] = owner;
    }

    fn link_field(&self, o: usize) -> u16 {
        u16::from_le_bytes([self.mem[o], self.mem[o + 1]])
    }

    fn prev(&self, b: u16) -> u16 {
        self.link_field(Self::base(b) + 3)
    }

    fn next(&self, b: u16) -> u16 {
        self.link_field(Self::base(b) + 5)
    }

    fn set_prev(&mut self, b: u16, p: u16) {
        let o = Self::base(b) + 3;
        self.mem[o..o + 2].copy_from_slice(&p.to_le_bytes());
    }

    fn set_next(&mut self, b: u16, n: u16) {
        let o = Self::base(b) + 5;
        self.mem[o..o + 2].copy_from_slice(&n.to_le_bytes());
    }

    /// Offset of the guard byte, if the header describes an area inside the heap
    fn guard_offset(&self, b: u16) -> Option<usize> {
        let n = self.count(b) as usize;
        let end = Self::base(b) + n * BLOCK_SIZE;
        (n > 0 && end <= Self::base(Self::SENTINEL)).then(|| end - 1)
    }

    fn user_ptr(b: u16) -> MemPtr {
        MemPtr((Self::base(b) + HEADER_SIZE) as u16)
    }

    /// Block number behind a payload handle
    fn block_of(&self, ptr: MemPtr) -> KernelResult<u16> {
        let off = (ptr.0 as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        if off % BLOCK_SIZE != 0 || off / BLOCK_SIZE >= Self::SENTINEL as usize {
            warn!("heap: pointer {:#06x} outside the heap", ptr.0);
            return Err(KernelError::InvalidArgument);
        }
        Ok((off / BLOCK_SIZE) as u16)
    }

    /// Reserved area whose guard byte matches its owner
    fn verify(&self, b: u16) -> KernelResult<Pid> {
        let owner = self.owner_byte(b);
        let guard = self.guard_offset(b).map(|o| self.mem[o]);
        if !self.is_reserved(b) || guard != Some(owner) {
            warn!(
                "heap: corrupt block {} (owner {}, guard {:?})",
                b, owner, guard
            );
            return Err(KernelError::Corruption);
        }
        Ok(Pid(owner))
    }

    // ------------------------------------------------------------------
    // Free list
    // ------------------------------------------------------------------

    fn unlink(&mut self, b: u16) {
        let p = self.prev(b);
        let n = self.next(b);
        self.set_next(p, n);
        self.set_prev(n, p);
    }

    fn insert_head(&mut self, b: u16) {
        let s = Self::SENTINEL;
        let n = self.next(s);
        self.set_next(b, n);
        self.set_prev(b, s);
        self.set_prev(n, b);
        self.set_next(s, b);
    }

    /// Absorb free successors until the area reaches `limit` blocks
    fn merge_successors(&mut self, b: u16, limit: u16) {
        while self.count(b) < limit {
            let succ = b + self.count(b);
            if succ >= Self::SENTINEL || self.is_reserved(succ) {
                break;
            }
            self.unlink(succ);
            let merged = self.count(b) + self.count(succ);
            self.set_count(b, merged);
        }
    }

    /// Cut `b` down to `req` blocks, returning the tail to the free list
    fn split(&mut self, b: u16, req: u16) {
        let n = self.count(b);
        if n > req {
            let rem = b + req;
            self.set_raw(rem, n - req);
            self.set_owner_byte(rem, Pid::NULL.0);
            self.set_count(b, req);
            self.insert_head(rem);
        }
    }

    fn reserve(&mut self, b: u16, owner: Pid) {
        let n = self.count(b);
        self.set_raw(b, n | RESERVED);
        self.set_owner_byte(b, owner.0);
        if let Some(g) = self.guard_offset(b) {
            self.mem[g] = owner.0;
        }
    }

    /// Return a reserved area to the free list
    fn release(&mut self, b: u16) {
        let n = self.count(b);
        self.set_raw(b, n);
        self.set_owner_byte(b, Pid::NULL.0);
        self.insert_head(b);
        let succ = b + n;
        if succ < Self::SENTINEL && !self.is_reserved(succ) {
            self.unlink(succ);
            let merged = n + self.count(succ);
            self.set_count(b, merged);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// First-fit allocation
    ///
    /// Free neighbours met during the scan stay merged even when the
    /// request ultimately fails.
    pub fn alloc(&mut self, size: usize, owner: Pid) -> KernelResult<MemPtr> {
        let req = Self::blocks_for(size)?;
        let s = Self::SENTINEL;
        let mut cur = self.next(s);
        while cur != s {
            self.merge_successors(cur, req);
            if self.count(cur) >= req {
                self.split(cur, req);
                self.unlink(cur);
                self.reserve(cur, owner);
                trace!("heap: alloc {} bytes at block {} for {}", size, cur, owner);
                return Ok(Self::user_ptr(cur));
            }
            cur = self.next(cur);
        }
        debug!("heap: {} bytes for {} not available", size, owner);
        Err(KernelError::NoMemory)
    }

    /// Allocation for data that lives as long as its module
    ///
    /// Defragments the whole free list, then carves the request from the
    /// tail of the highest-addressed area that fits.
    pub fn alloc_longterm(&mut self, size: usize, owner: Pid) -> KernelResult<MemPtr> {
        let req = Self::blocks_for(size)?;
        let s = Self::SENTINEL;

        let mut cur = self.next(s);
        while cur != s {
            self.merge_successors(cur, COUNT_MASK);
            cur = self.next(cur);
        }

        let mut best: Option<u16> = None;
        cur = self.next(s);
        while cur != s {
            if self.count(cur) >= req && best.map_or(true, |b| cur > b) {
                best = Some(cur);
            }
            cur = self.next(cur);
        }

        let b = best.ok_or(KernelError::NoMemory)?;
        let n = self.count(b);
        let taken = if n == req {
            self.unlink(b);
            b
        } else {
            self.set_count(b, n - req);
            let tail = b + (n - req);
            self.set_raw(tail, req);
            tail
        };
        self.reserve(taken, owner);
        debug!("heap: long-term {} bytes at block {} for {}", size, taken, owner);
        Ok(Self::user_ptr(taken))
    }

    /// Free an allocation, returning its former owner
    ///
    /// A guard mismatch (corruption, double free) refuses the request and
    /// leaves the area untouched.
    pub fn free(&mut self, ptr: MemPtr) -> KernelResult<Pid> {
        let b = self.block_of(ptr)?;
        let owner = self.verify(b)?;
        self.release(b);
        trace!("heap: free block {} of {}", b, owner);
        Ok(owner)
    }

    /// Hand an allocation to another module
    pub fn change_owner(&mut self, ptr: MemPtr, owner: Pid) -> KernelResult<()> {
        let b = self.block_of(ptr)?;
        self.verify(b)?;
        self.reserve(b, owner);
        Ok(())
    }

    /// Resize an allocation, preferring to grow in place
    ///
    /// On failure the old handle stays valid with its content intact.
    pub fn realloc(&mut self, ptr: MemPtr, size: usize) -> KernelResult<MemPtr> {
        let b = self.block_of(ptr)?;
        let owner = self.verify(b)?;
        let req = Self::blocks_for(size)?;
        let old = self.count(b);

        self.set_raw(b, old);
        self.merge_successors(b, COUNT_MASK);
        if self.count(b) >= req {
            self.split(b, req);
            self.reserve(b, owner);
            return Ok(ptr);
        }

        self.reserve(b, owner);
        let new = self.alloc(size, owner)?;
        let src = Self::base(b) + HEADER_SIZE;
        let len = old as usize * BLOCK_SIZE - OVERHEAD;
        let dst = new.0 as usize;
        self.mem.copy_within(src..src + len, dst);
        self.release(b);
        debug!("heap: moved block {} to {:#06x}", b, dst);
        Ok(new)
    }

    /// Free every allocation owned by `owner`, returning how many
    pub fn remove_all(&mut self, owner: Pid) -> usize {
        let mut freed = 0;
        let mut b = 0u16;
        while b < Self::SENTINEL {
            if self.is_reserved(b) && self.owner_byte(b) == owner.0 {
                self.release(b);
                freed += 1;
            }
            let n = self.count(b);
            if n == 0 {
                warn!("heap: zero-length area at block {}", b);
                break;
            }
            b += n;
        }
        if freed > 0 {
            debug!("heap: reclaimed {} areas of {}", freed, owner);
        }
        freed
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    /// Payload bytes of a live allocation
    pub fn bytes(&self, ptr: MemPtr) -> KernelResult<&[u8]> {
        let b = self.block_of(ptr)?;
        self.verify(b)?;
        let start = ptr.0 as usize;
        let end = Self::base(b) + self.count(b) as usize * BLOCK_SIZE - 1;
        Ok(&self.mem[start..end])
    }

    pub fn bytes_mut(&mut self, ptr: MemPtr) -> KernelResult<&mut [u8]> {
        let b = self.block_of(ptr)?;
        self.verify(b)?;
        let start = ptr.0 as usize;
        let end = Self::base(b) + self.count(b) as usize * BLOCK_SIZE - 1;
        Ok(&mut self.mem[start..end])
    }

    /// Usable bytes of a live allocation
    pub fn usable_size(&self, ptr: MemPtr) -> KernelResult<usize> {
        self.bytes(ptr).map(<[u8]>::len)
    }

    /// Copy `len` payload bytes between two live allocations
    pub fn copy(&mut self, src: MemPtr, dst: MemPtr, len: usize) -> KernelResult<()> {
        if len > self.usable_size(src)? || len > self.usable_size(dst)? {
            return Err(KernelError::InvalidArgument);
        }
        let s = src.0 as usize;
        self.mem.copy_within(s..s + len, dst.0 as usize);
        Ok(())
    }

    /// Current owner, `None` for free or corrupt areas
    pub fn owner(&self, ptr: MemPtr) -> Option<Pid> {
        let b = self.block_of(ptr).ok()?;
        self.verify(b).ok()
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Mark an allocation of `owner` as reachable
    pub fn gc_mark(&mut self, owner: Pid, ptr: MemPtr) -> KernelResult<()> {
        let b = self.block_of(ptr)?;
        if self.verify(b)? != owner {
            return Err(KernelError::NotPermitted);
        }
        let raw = self.raw(b);
        self.set_raw(b, raw | GC_MARK);
        Ok(())
    }

    /// Free unmarked allocations of `owner` and clear the marks of the rest
    pub fn gc_sweep(&mut self, owner: Pid) -> usize {
        let mut freed = 0;
        let mut b = 0u16;
        while b < Self::SENTINEL {
            if self.is_reserved(b) && self.owner_byte(b) == owner.0 {
                let raw = self.raw(b);
                if raw & GC_MARK != 0 {
                    self.set_raw(b, raw & !GC_MARK);
                } else {
                    self.release(b);
                    freed += 1;
                }
            }
            let n = self.count(b);
            if n == 0 {
                break;
            }
            b += n;
        }
        if freed > 0 {
            warn!("heap: gc freed {} unreachable areas of {}", freed, owner);
        }
        freed
    }

    /// Conservative collection of one module's memory
    ///
    /// Starting from `root`, every little-endian `u16` inside a reachable
    /// allocation that looks like a handle to another allocation of
    /// `owner` keeps that allocation alive. If the scan outgrows
    /// `GC_SCAN_DEPTH` nothing is freed.
    pub fn gc_module(&mut self, owner: Pid, root: Option<MemPtr>) -> usize {
        let mut pending: Vec<u16, GC_SCAN_DEPTH> = Vec::new();
        let mut overflow = false;

        if let Some(root) = root {
            if let Some(b) = self.candidate(root.0, owner) {
                let raw = self.raw(b);
                self.set_raw(b, raw | GC_MARK);
                overflow |= pending.push(b).is_err();
            }
        }

        while let Some(b) = pending.pop() {
            let start = Self::base(b) + HEADER_SIZE;
            let end = Self::base(b) + self.count(b) as usize * BLOCK_SIZE - 1;
            for o in start..end.saturating_sub(1) {
                let word = u16::from_le_bytes([self.mem[o], self.mem[o + 1]]);
                if let Some(t) = self.candidate(word, owner) {
                    let raw = self.raw(t);
                    if raw & GC_MARK == 0 {
                        self.set_raw(t, raw | GC_MARK);
                        overflow |= pending.push(t).is_err();
                    }
                }
            }
        }

        if overflow {
            warn!("heap: gc scan of {} overflowed, nothing freed", owner);
            self.clear_marks(owner);
            return 0;
        }
        self.gc_sweep(owner)
    }

    /// Block behind `word` if it is the start of a live area of `owner`
    fn candidate(&self, word: u16, owner: Pid) -> Option<u16> {
        let b = self.block_of(MemPtr(word)).ok()?;
        if !self.is_area_start(b) || !self.is_reserved(b) || self.owner_byte(b) != owner.0 {
            return None;
        }
        self.verify(b).ok().map(|_| b)
    }

    fn is_area_start(&self, target: u16) -> bool {
        let mut b = 0u16;
        while b < target {
            let n = self.count(b);
            if n == 0 {
                return false;
            }
            b += n;
        }
        b == target
    }

    fn clear_marks(&mut self, owner: Pid) {
        let mut b = 0u16;
        while b < Self::SENTINEL {
            let raw = self.raw(b);
            if raw & RESERVED != 0 && self.owner_byte(b) == owner.0 {
                self.set_raw(b, raw & !GC_MARK);
            }
            let n = self.count(b);
            if n == 0 {
                break;
            }
            b += n;
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Every area from the bottom of the heap up to the sentinel
    pub fn walk(&self) -> Walk<'_, BYTES> {
        Walk { heap: self, block: 0 }
    }

    /// Blocks on the free list
    pub fn free_blocks(&self) -> usize {
        self.free_areas().map(|b| self.count(b) as usize).sum()
    }

    /// Areas on the free list
    pub fn free_list_len(&self) -> usize {
        self.free_areas().count()
    }

    /// Largest area on the free list, in blocks
    pub fn largest_free(&self) -> usize {
        self.free_areas()
            .map(|b| self.count(b) as usize)
            .max()
            .unwrap_or(0)
    }

    /// Blocks held by `owner`
    pub fn owned_by(&self, owner: Pid) -> usize {
        self.walk()
            .filter(|info| info.owner == Some(owner))
            .map(|info| info.blocks as usize)
            .sum()
    }

    /// Verify the guard byte of every reserved area
    pub fn check(&self) -> KernelResult<()> {
        let mut b = 0u16;
        while b < Self::SENTINEL {
            if self.is_reserved(b) {
                self.verify(b)?;
            }
            let n = self.count(b);
            if n == 0 {
                return Err(KernelError::Corruption);
            }
            b += n;
        }
        Ok(())
    }

    fn free_areas(&self) -> FreeAreas<'_, BYTES> {
        FreeAreas {
            heap: self,
            cur: self.next(Self::SENTINEL),
        }
    }
}

impl<const BYTES: usize> Default for Heap<BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stride walk over all areas
pub struct Walk<'a, const BYTES: usize> {
    heap: &'a Heap<BYTES>,
    block: u16,
}

impl<const BYTES: usize> Iterator for Walk<'_, BYTES> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let b = self.block;
        if b >= Heap::<BYTES>::SENTINEL {
            return None;
        }
        let raw = self.heap.raw(b);
        let blocks = raw & COUNT_MASK;
        if blocks == 0 {
            self.block = Heap::<BYTES>::SENTINEL;
            return None;
        }
        self.block = b + blocks;
        Some(BlockInfo {
            index: b,
            blocks,
            owner: (raw & RESERVED != 0).then(|| Pid(self.heap.owner_byte(b))),
            marked: raw & GC_MARK != 0,
        })
    }
}

struct FreeAreas<'a, const BYTES: usize> {
    heap: &'a Heap<BYTES>,
    cur: u16,
}

impl<const BYTES: usize> Iterator for FreeAreas<'_, BYTES> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.cur == Heap::<BYTES>::SENTINEL {
            return None;
        }
        let b = self.cur;
        self.cur = self.heap.next(b);
        Some(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: Pid = Pid(130);
    const B: Pid = Pid(131);

    type SmallHeap = Heap<128>;

    fn total_blocks<const N: usize>(heap: &Heap<N>) -> usize {
        heap.walk().map(|info| info.blocks as usize).sum()
    }

    #[test]
    fn test_fresh_heap() {
        let heap = SmallHeap::new();
        assert_eq!(heap.capacity_blocks(), 15);
        assert_eq!(heap.free_list_len(), 1);
        assert_eq!(heap.free_blocks(), 15);
        assert_eq!(total_blocks(&heap), 15);
        assert!(heap.check().is_ok());
    }

    #[test]
    fn test_block_rounding() {
        assert_eq!(SmallHeap::blocks_for(1), Ok(1));
        assert_eq!(SmallHeap::blocks_for(4), Ok(1));
        assert_eq!(SmallHeap::blocks_for(5), Ok(2));
        assert_eq!(SmallHeap::blocks_for(0), Err(KernelError::InvalidArgument));
        assert_eq!(SmallHeap::blocks_for(1000), Err(KernelError::NoMemory));
        assert_eq!(SmallHeap::blocks_for(usize::MAX), Err(KernelError::NoMemory));
    }

    #[test]
    fn test_huge_requests_refused() {
        let mut heap = SmallHeap::new();
        assert_eq!(heap.alloc(usize::MAX, A), Err(KernelError::NoMemory));
        assert_eq!(heap.alloc_longterm(usize::MAX - 2, A), Err(KernelError::NoMemory));
        let p = heap.alloc(4, A).unwrap();
        assert_eq!(heap.realloc(p, usize::MAX), Err(KernelError::NoMemory));
        assert_eq!(heap.owner(p), Some(A));
        assert_eq!(heap.free_blocks(), 14);
        assert!(heap.check().is_ok());
    }

    #[test]
    fn test_alloc_tags_owner_and_guard() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(10, A).unwrap();
        assert_eq!(heap.owner(p), Some(A));
        assert_eq!(heap.usable_size(p), Ok(12));
        assert_eq!(heap.owned_by(A), 2);
        assert_eq!(heap.free_blocks(), 13);
    }

    #[test]
    fn test_alloc_then_free_restores_single_area() {
        let mut heap = SmallHeap::new();
        for size in [1, 7, 30, 100] {
            let p = heap.alloc(size, A).unwrap();
            assert_eq!(heap.free(p), Ok(A));
            assert_eq!(heap.free_list_len(), 1);
            assert_eq!(heap.largest_free(), 15);
        }
    }

    #[test]
    fn test_double_free_rejected() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(4, A).unwrap();
        let _q = heap.alloc(4, B).unwrap();
        assert_eq!(heap.free(p), Ok(A));
        assert_eq!(heap.free(p), Err(KernelError::Corruption));
        assert_eq!(total_blocks(&heap), 15);
        let r = heap.alloc(4, A).unwrap();
        assert_eq!(heap.free(r), Ok(A));
    }

    #[test]
    fn test_guard_corruption_refuses_free() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(4, A).unwrap();
        let guard = p.raw() as usize + 4;
        heap.mem[guard] = 0x55;
        assert_eq!(heap.free(p), Err(KernelError::Corruption));
        assert_eq!(heap.change_owner(p, B), Err(KernelError::Corruption));
        assert_eq!(heap.check(), Err(KernelError::Corruption));
        // left untouched
        assert_eq!(heap.free_blocks(), 14);
    }

    #[test]
    fn test_invalid_pointer_rejected() {
        let mut heap = SmallHeap::new();
        assert_eq!(heap.free(MemPtr::from_raw(0)), Err(KernelError::InvalidArgument));
        assert_eq!(heap.free(MemPtr::from_raw(12)), Err(KernelError::InvalidArgument));
        assert_eq!(heap.free(MemPtr::from_raw(123)), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_change_owner() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(6, A).unwrap();
        heap.change_owner(p, B).unwrap();
        assert_eq!(heap.owner(p), Some(B));
        assert_eq!(heap.remove_all(A), 0);
        assert_eq!(heap.free(p), Ok(B));
    }

    #[test]
    fn test_failed_alloc_keeps_merges() {
        let mut heap = SmallHeap::new();
        let a = heap.alloc(1, A).unwrap();
        let b = heap.alloc(1, A).unwrap();
        let _c = heap.alloc(100, B).unwrap();
        assert_eq!(heap.free_blocks(), 0);
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.free_list_len(), 2);

        assert_eq!(heap.alloc(20, A), Err(KernelError::NoMemory));
        assert_eq!(heap.free_list_len(), 1);
        assert_eq!(heap.largest_free(), 2);

        let d = heap.alloc(12, A).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn test_longterm_takes_high_tail() {
        let mut heap = SmallHeap::new();
        let short = heap.alloc(4, A).unwrap();
        let long = heap.alloc_longterm(4, B).unwrap();
        assert!(long.raw() > short.raw());
        let last = heap.walk().last().unwrap();
        assert_eq!(last.owner, Some(B));
        assert_eq!(last.index, 14);
    }

    #[test]
    fn test_longterm_defragments_first() {
        let mut heap = SmallHeap::new();
        let ptrs: std::vec::Vec<_> = (0..5).map(|_| heap.alloc(4, A).unwrap()).collect();
        for p in &ptrs {
            heap.free(*p).unwrap();
        }
        let p = heap.alloc_longterm(100, B).unwrap();
        assert_eq!(heap.owner(p), Some(B));
        assert_eq!(heap.free_blocks(), 2);
    }

    #[test]
    fn test_realloc_grows_in_place() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(4, A).unwrap();
        heap.bytes_mut(p).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let q = heap.realloc(p, 20).unwrap();
        assert_eq!(q, p);
        assert_eq!(&heap.bytes(q).unwrap()[..4], &[1, 2, 3, 4]);
        assert_eq!(heap.owned_by(A), 3);
        assert_eq!(total_blocks(&heap), 15);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(4, A).unwrap();
        let _wall = heap.alloc(4, B).unwrap();
        heap.bytes_mut(p).unwrap().copy_from_slice(&[9, 8, 7, 6]);
        let q = heap.realloc(p, 30).unwrap();
        assert_ne!(q, p);
        assert_eq!(&heap.bytes(q).unwrap()[..4], &[9, 8, 7, 6]);
        assert_eq!(heap.owner(p), None);
        assert_eq!(heap.owner(q), Some(A));
    }

    #[test]
    fn test_realloc_shrinks() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(60, A).unwrap();
        let q = heap.realloc(p, 4).unwrap();
        assert_eq!(q, p);
        assert_eq!(heap.owned_by(A), 1);
        assert_eq!(heap.free_blocks(), 14);
    }

    #[test]
    fn test_realloc_failure_keeps_old() {
        let mut heap = SmallHeap::new();
        let p = heap.alloc(4, A).unwrap();
        let _wall = heap.alloc(90, B).unwrap();
        heap.bytes_mut(p).unwrap()[0] = 0xAB;
        assert_eq!(heap.realloc(p, 60), Err(KernelError::NoMemory));
        assert_eq!(heap.owner(p), Some(A));
        assert_eq!(heap.bytes(p).unwrap()[0], 0xAB);
        assert!(heap.check().is_ok());
    }

    #[test]
    fn test_remove_all() {
        let mut heap = SmallHeap::new();
        heap.alloc(4, A).unwrap();
        let b = heap.alloc(4, B).unwrap();
        heap.alloc(10, A).unwrap();
        heap.alloc_longterm(4, A).unwrap();
        assert_eq!(heap.remove_all(A), 3);
        assert_eq!(heap.owned_by(A), 0);
        assert_eq!(heap.owner(b), Some(B));
        assert_eq!(total_blocks(&heap), 15);
    }

    #[test]
    fn test_gc_mark_and_sweep() {
        let mut heap = SmallHeap::new();
        let keep = heap.alloc(4, A).unwrap();
        let lost = heap.alloc(4, A).unwrap();
        let other = heap.alloc(4, B).unwrap();
        heap.gc_mark(A, keep).unwrap();
        assert_eq!(heap.gc_mark(A, other), Err(KernelError::NotPermitted));
        assert_eq!(heap.gc_sweep(A), 1);
        assert_eq!(heap.owner(keep), Some(A));
        assert_eq!(heap.owner(lost), None);
        // marks are cleared for the next round
        assert_eq!(heap.gc_sweep(A), 1);
    }

    #[test]
    fn test_gc_module_follows_handles() {
        let mut heap: Heap<512> = Heap::new();
        let state = heap.alloc(8, A).unwrap();
        let child = heap.alloc(8, A).unwrap();
        let grandchild = heap.alloc(4, A).unwrap();
        let leaked = heap.alloc(4, A).unwrap();
        heap.bytes_mut(state).unwrap()[2..4].copy_from_slice(&child.raw().to_le_bytes());
        heap.bytes_mut(child).unwrap()[0..2].copy_from_slice(&grandchild.raw().to_le_bytes());

        assert_eq!(heap.gc_module(A, Some(state)), 1);
        assert_eq!(heap.owner(state), Some(A));
        assert_eq!(heap.owner(child), Some(A));
        assert_eq!(heap.owner(grandchild), Some(A));
        assert_eq!(heap.owner(leaked), None);
    }

    #[test]
    fn test_walk_reports_areas() {
        let mut heap = SmallHeap::new();
        heap.alloc(4, A).unwrap();
        let areas: std::vec::Vec<_> = heap.walk().collect();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].owner, Some(A));
        assert_eq!(areas[1].owner, None);
        assert_eq!(areas[1].blocks, 14);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Longterm(usize),
        Free(usize),
        Realloc(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..80).prop_map(Op::Alloc),
            (1usize..40).prop_map(Op::Longterm),
            (0usize..16).prop_map(Op::Free),
            ((0usize..16), (1usize..80)).prop_map(|(i, s)| Op::Realloc(i, s)),
        ]
    }

    proptest! {
        #[test]
        fn test_blocks_are_conserved(ops in proptest::collection::vec(op(), 1..60)) {
            let mut heap: Heap<1024> = Heap::new();
            let mut live: std::vec::Vec<MemPtr> = std::vec::Vec::new();
            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Ok(p) = heap.alloc(size, A) {
                            live.push(p);
                        }
                    }
                    Op::Longterm(size) => {
                        if let Ok(p) = heap.alloc_longterm(size, A) {
                            live.push(p);
                        }
                    }
                    Op::Free(i) if !live.is_empty() => {
                        let p = live.swap_remove(i % live.len());
                        prop_assert_eq!(heap.free(p), Ok(A));
                        prop_assert_eq!(heap.free(p), Err(KernelError::Corruption));
                    }
                    Op::Realloc(i, size) if !live.is_empty() => {
                        let i = i % live.len();
                        if let Ok(q) = heap.realloc(live[i], size) {
                            live[i] = q;
                        }
                    }
                    _ => {}
                }
                prop_assert_eq!(total_blocks(&heap), heap.capacity_blocks());
                prop_assert_eq!(heap.free_blocks() + heap.owned_by(A), heap.capacity_blocks());
                prop_assert!(heap.check().is_ok());
            }
            for p in live {
                prop_assert_eq!(heap.free(p), Ok(A));
            }
            prop_assert_eq!(heap.owned_by(A), 0);
        }

        #[test]
        fn test_realloc_preserves_content(n in 1usize..40, m in 1usize..90, fill in any::<u8>()) {
            let mut heap: Heap<512> = Heap::new();
            let p = heap.alloc(n, A).unwrap();
            let _wall = heap.alloc(4, B).unwrap();
            for (i, byte) in heap.bytes_mut(p).unwrap()[..n].iter_mut().enumerate() {
                *byte = fill.wrapping_add(i as u8);
            }
            let m = n + m;
            let q = heap.realloc(p, m).unwrap();
            let bytes = heap.bytes(q).unwrap();
            for (i, byte) in bytes[..n].iter().enumerate() {
                prop_assert_eq!(*byte, fill.wrapping_add(i as u8));
            }
        }

        #[test]
        fn test_alloc_free_round_trip(sizes in proptest::collection::vec(1usize..100, 1..20)) {
            let mut heap: Heap<128> = Heap::new();
            for size in sizes {
                let p = heap.alloc(size, A).unwrap();
                heap.free(p).unwrap();
                prop_assert_eq!(heap.free_list_len(), 1);
                prop_assert_eq!(heap.largest_free(), heap.capacity_blocks());
            }
        }
    }
}
