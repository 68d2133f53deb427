//! Class lists — intrusive doubly linked lists over a fixed arena
//!
//! A `ClassList` threads up to `N` entries (arena slots, addressed by
//! `u8`) through `CLASSES` circular lists. Every entry sits in at most
//! one class at a time, so moving a timer from the delta queue to the
//! pool, or a message from a lane to the free list, is a single O(1)
//! relink. No pointers: links are `u16` node numbers, anchors first.
//!
//! Author: Moroya Sakamoto

#[derive(Debug, Clone, Copy)]
struct Link {
    next: u16,
    prev: u16,
}

const UNBOUND: u8 = u8::MAX;

/// Multi-class intrusive list
pub struct ClassList<const CLASSES: usize, const N: usize> {
    anchors: [Link; CLASSES],
    entries: [Link; N],
    class: [u8; N],
}

impl<const CLASSES: usize, const N: usize> ClassList<CLASSES, N> {
    const _ASSERT: () = assert!(CLASSES < UNBOUND as usize && N <= 256 && CLASSES + N < u16::MAX as usize);

    /// All classes empty, all entries unbound
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_ASSERT;
        let mut anchors = [Link { next: 0, prev: 0 }; CLASSES];
        for (i, anchor) in anchors.iter_mut().enumerate() {
            *anchor = Link { next: i as u16, prev: i as u16 };
        }
        let mut entries = [Link { next: 0, prev: 0 }; N];
        for (i, entry) in entries.iter_mut().enumerate() {
            let node = (CLASSES + i) as u16;
            *entry = Link { next: node, prev: node };
        }
        Self {
            anchors,
            entries,
            class: [UNBOUND; N],
        }
    }

    #[inline]
    fn node(entry: u8) -> u16 {
        CLASSES as u16 + entry as u16
    }

    #[inline]
    fn entry(node: u16) -> Option<u8> {
        (node as usize).checked_sub(CLASSES).map(|e| e as u8)
    }

    #[inline]
    fn link(&self, node: u16) -> Link {
        let n = node as usize;
        if n < CLASSES {
            self.anchors[n]
        } else {
            self.entries[n - CLASSES]
        }
    }

    #[inline]
    fn link_mut(&mut self, node: u16) -> &mut Link {
        let n = node as usize;
        if n < CLASSES {
            &mut self.anchors[n]
        } else {
            &mut self.entries[n - CLASSES]
        }
    }

    fn splice(&mut self, node: u16, prev: u16, next: u16) {
        *self.link_mut(node) = Link { next, prev };
        self.link_mut(prev).next = node;
        self.link_mut(next).prev = node;
    }

    /// Class the entry currently belongs to
    pub fn class_of(&self, entry: u8) -> Option<u8> {
        match self.class[entry as usize] {
            UNBOUND => None,
            class => Some(class),
        }
    }

    pub fn is_bound(&self, entry: u8) -> bool {
        self.class_of(entry).is_some()
    }

    pub fn front(&self, class: u8) -> Option<u8> {
        Self::entry(self.anchors[class as usize].next)
    }

    pub fn back(&self, class: u8) -> Option<u8> {
        Self::entry(self.anchors[class as usize].prev)
    }

    /// Successor within the entry's class
    pub fn next(&self, entry: u8) -> Option<u8> {
        if !self.is_bound(entry) {
            return None;
        }
        Self::entry(self.link(Self::node(entry)).next)
    }

    /// Predecessor within the entry's class
    pub fn prev(&self, entry: u8) -> Option<u8> {
        if !self.is_bound(entry) {
            return None;
        }
        Self::entry(self.link(Self::node(entry)).prev)
    }

    pub fn is_empty(&self, class: u8) -> bool {
        self.front(class).is_none()
    }

    pub fn len(&self, class: u8) -> usize {
        self.iter(class).count()
    }

    /// Unlink an entry from whatever class holds it
    pub fn remove(&mut self, entry: u8) {
        let node = Self::node(entry);
        let Link { next, prev } = self.link(node);
        self.link_mut(prev).next = next;
        self.link_mut(next).prev = prev;
        *self.link_mut(node) = Link { next: node, prev: node };
        self.class[entry as usize] = UNBOUND;
    }

    pub fn push_front(&mut self, class: u8, entry: u8) {
        self.remove(entry);
        let anchor = class as u16;
        let next = self.anchors[class as usize].next;
        self.splice(Self::node(entry), anchor, next);
        self.class[entry as usize] = class;
    }

    pub fn push_back(&mut self, class: u8, entry: u8) {
        self.remove(entry);
        let anchor = class as u16;
        let prev = self.anchors[class as usize].prev;
        self.splice(Self::node(entry), prev, anchor);
        self.class[entry as usize] = class;
    }

    /// Insert `entry` immediately before `before`, joining its class
    pub fn insert_before(&mut self, entry: u8, before: u8) {
        let Some(class) = self.class_of(before) else {
            return;
        };
        self.remove(entry);
        let next = Self::node(before);
        let prev = self.link(next).prev;
        self.splice(Self::node(entry), prev, next);
        self.class[entry as usize] = class;
    }

    pub fn pop_front(&mut self, class: u8) -> Option<u8> {
        let entry = self.front(class)?;
        self.remove(entry);
        Some(entry)
    }

    /// First entry of `class` satisfying `pred`
    pub fn find(&self, class: u8, mut pred: impl FnMut(u8) -> bool) -> Option<u8> {
        self.iter(class).find(|&e| pred(e))
    }

    /// Entries of `class`, front to back
    pub fn iter(&self, class: u8) -> Iter<'_, CLASSES, N> {
        Iter {
            list: self,
            anchor: class as u16,
            node: self.anchors[class as usize].next,
        }
    }
}

impl<const CLASSES: usize, const N: usize> Default for ClassList<CLASSES, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-to-back iterator over one class
pub struct Iter<'a, const CLASSES: usize, const N: usize> {
    list: &'a ClassList<CLASSES, N>,
    anchor: u16,
    node: u16,
}

impl<const CLASSES: usize, const N: usize> Iterator for Iter<'_, CLASSES, N> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.node == self.anchor {
            return None;
        }
        let entry = ClassList::<CLASSES, N>::entry(self.node)?;
        self.node = self.list.link(self.node).next;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<const C: usize, const N: usize>(list: &ClassList<C, N>, class: u8) -> Vec<u8> {
        list.iter(class).collect()
    }

    #[test]
    fn test_empty_list() {
        let list: ClassList<2, 8> = ClassList::new();
        assert!(list.is_empty(0));
        assert!(list.is_empty(1));
        assert_eq!(list.front(0), None);
        assert_eq!(list.class_of(3), None);
        assert_eq!(list.next(3), None);
    }

    #[test]
    fn test_push_back_is_fifo() {
        let mut list: ClassList<2, 8> = ClassList::new();
        list.push_back(0, 4);
        list.push_back(0, 1);
        list.push_back(0, 7);
        assert_eq!(collect(&list, 0), vec![4, 1, 7]);
        assert_eq!(list.pop_front(0), Some(4));
        assert_eq!(collect(&list, 0), vec![1, 7]);
        assert_eq!(list.class_of(4), None);
    }

    #[test]
    fn test_push_front_is_lifo() {
        let mut list: ClassList<1, 4> = ClassList::new();
        list.push_front(0, 0);
        list.push_front(0, 1);
        list.push_front(0, 2);
        assert_eq!(collect(&list, 0), vec![2, 1, 0]);
        assert_eq!(list.back(0), Some(0));
    }

    #[test]
    fn test_move_between_classes() {
        let mut list: ClassList<3, 8> = ClassList::new();
        list.push_back(0, 1);
        list.push_back(0, 2);
        list.push_back(2, 2);
        assert_eq!(collect(&list, 0), vec![1]);
        assert_eq!(collect(&list, 2), vec![2]);
        assert_eq!(list.class_of(2), Some(2));
    }

    #[test]
    fn test_remove_middle() {
        let mut list: ClassList<1, 8> = ClassList::new();
        for e in 0..5 {
            list.push_back(0, e);
        }
        list.remove(2);
        assert_eq!(collect(&list, 0), vec![0, 1, 3, 4]);
        assert_eq!(list.next(1), Some(3));
        assert_eq!(list.prev(3), Some(1));
        assert_eq!(list.next(4), None);
        assert_eq!(list.prev(0), None);
    }

    #[test]
    fn test_insert_before() {
        let mut list: ClassList<2, 8> = ClassList::new();
        list.push_back(1, 0);
        list.push_back(1, 1);
        list.insert_before(5, 1);
        list.insert_before(6, 0);
        assert_eq!(collect(&list, 1), vec![6, 0, 5, 1]);
        assert_eq!(list.class_of(5), Some(1));
    }

    #[test]
    fn test_insert_before_unbound_is_noop() {
        let mut list: ClassList<1, 4> = ClassList::new();
        list.insert_before(1, 2);
        assert!(!list.is_bound(1));
    }

    #[test]
    fn test_find_and_len() {
        let mut list: ClassList<1, 16> = ClassList::new();
        for e in 0..10 {
            list.push_back(0, e);
        }
        assert_eq!(list.len(0), 10);
        assert_eq!(list.find(0, |e| e > 6), Some(7));
        assert_eq!(list.find(0, |e| e > 20), None);
    }

    #[test]
    fn test_full_capacity() {
        let mut list: ClassList<4, 256> = ClassList::new();
        for e in 0..=255u8 {
            list.push_back(e % 4, e);
        }
        assert_eq!(list.len(0), 64);
        assert_eq!(list.len(3), 64);
        assert_eq!(list.back(3), Some(255));
    }
}
