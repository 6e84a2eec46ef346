//! The vaddr -> (iova, len) range map (component A of the design).
//!
//! An eight-level skip list keyed on `vaddr`. Every operation takes the
//! index's own mutex; traversals never suspend. `vaddr` is treated as
//! an opaque unsigned ordering key here — the index never dereferences
//! it.

use parking_lot::Mutex;
use rand::Rng;
use std::ptr::NonNull;

use crate::error::{Error, Result};

const MAX_LEVEL: usize = 8;

/// One mapping entry: `vaddr` is non-overlapping with every other live
/// entry, `len > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub vaddr: u64,
    pub len: u64,
    pub iova: u64,
}

impl Entry {
    fn contains(&self, q: u64) -> bool {
        q >= self.vaddr && q < self.vaddr.saturating_add(self.len)
    }
}

struct Node {
    vaddr: u64,
    len: u64,
    iova: u64,
    forward: Vec<Option<NonNull<Node>>>,
}

impl Node {
    fn contains(&self, q: u64) -> bool {
        q >= self.vaddr && q < self.vaddr.saturating_add(self.len)
    }

    fn sentinel(vaddr: u64, height: usize) -> Box<Node> {
        Box::new(Node {
            vaddr,
            len: 0,
            iova: 0,
            forward: vec![None; height],
        })
    }

    fn new(vaddr: u64, len: u64, iova: u64, height: usize) -> NonNull<Node> {
        let boxed = Box::new(Node {
            vaddr,
            len,
            iova,
            forward: vec![None; height],
        });
        NonNull::new(Box::into_raw(boxed)).unwrap()
    }

    fn entry(&self) -> Entry {
        Entry {
            vaddr: self.vaddr,
            len: self.len,
            iova: self.iova,
        }
    }
}

struct Inner {
    // sentinel head; `head.forward[i]` is the first real node at level i
    head: Box<Node>,
    // number of occupied levels; 0 when the list is empty, else 1..=MAX_LEVEL
    height: usize,
    len: usize,
}

// SAFETY: every node reachable from `head` is uniquely owned by this
// structure and freed exactly once, either by `remove`/`clear` or by
// `Drop`. All mutation happens under the outer `Mutex`.
unsafe impl Send for Inner {}

impl Inner {
    fn new() -> Self {
        Inner {
            head: Node::sentinel(0, MAX_LEVEL),
            height: 0,
            len: 0,
        }
    }

    /// Descend from the top occupied level, collecting at each level the
    /// last node whose successor does not yet reach `q`. Returns the
    /// predecessor chain (one per level) and, if present, the node
    /// containing `q`.
    unsafe fn find_with_path(
        &self,
        q: u64,
    ) -> ([*mut Node; MAX_LEVEL], Option<NonNull<Node>>) {
        let mut update: [*mut Node; MAX_LEVEL] = [self.head.as_ref() as *const Node as *mut Node; MAX_LEVEL];
        let mut cur: *const Node = self.head.as_ref();

        for level in (0..self.height).rev() {
            loop {
                let next = (*cur).forward[level];
                match next {
                    Some(n) if n.as_ref().vaddr.saturating_add(n.as_ref().len) <= q => {
                        cur = n.as_ptr();
                    }
                    _ => break,
                }
            }
            update[level] = cur as *mut Node;
        }

        let candidate = (*cur).forward.get(0).copied().flatten();
        let found = match candidate {
            Some(n) if n.as_ref().contains(q) => Some(n),
            _ => None,
        };
        (update, found)
    }

    fn random_height(&self) -> usize {
        let mut height = 1;
        let mut rng = rand::thread_rng();
        while height < MAX_LEVEL && rng.gen_bool(0.5) {
            height += 1;
        }
        height
    }

    fn insert(&mut self, vaddr: u64, len: u64, iova: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::Invalid("len must be > 0"));
        }
        unsafe {
            let (mut update, found) = self.find_with_path(vaddr);
            if found.is_some() {
                return Err(Error::Exists);
            }
            // also reject if vaddr falls inside the entry just before it
            // (find_with_path only checks containment at the node that
            // starts at-or-before q; a zero-level scan already covers
            // this because `contains` is evaluated against that node).

            let height = self.random_height();
            if height > self.height {
                for level in self.height..height {
                    update[level] = self.head.as_mut() as *mut Node;
                }
                self.height = height;
            }

            let node = Node::new(vaddr, len, iova, height);
            for level in 0..height {
                let pred = &mut *update[level];
                let next = pred.forward[level];
                (*node.as_ptr()).forward[level] = next;
                pred.forward[level] = Some(node);
            }
            self.len += 1;
            Ok(())
        }
    }

    fn remove(&mut self, vaddr: u64) -> Result<Entry> {
        unsafe {
            let (update, found) = self.find_with_path(vaddr);
            let node = found.ok_or(Error::NotFound)?;
            // found already guarantees node.vaddr == vaddr is NOT
            // required by contract (remove keys on the entry's vaddr);
            // but callers always pass the entry's own vaddr so this
            // holds in practice. Guard explicitly for correctness.
            if node.as_ref().vaddr != vaddr {
                return Err(Error::NotFound);
            }
            let height = node.as_ref().forward.len();
            for level in 0..height {
                let pred = &mut *update[level];
                if pred.forward[level] == Some(node) {
                    pred.forward[level] = node.as_ref().forward[level];
                }
            }
            while self.height > 0 && self.head.forward[self.height - 1].is_none() {
                self.height -= 1;
            }
            let entry = node.as_ref().entry();
            drop(Box::from_raw(node.as_ptr()));
            self.len -= 1;
            Ok(entry)
        }
    }

    fn find(&self, q: u64) -> Option<Entry> {
        unsafe { self.find_with_path(q).1.map(|n| n.as_ref().entry()) }
    }

    fn clear(&mut self, mut callback: Option<&mut dyn FnMut(Entry)>) {
        unsafe {
            let mut cur = self.head.forward[0];
            while let Some(n) = cur {
                let next = n.as_ref().forward[0];
                if let Some(cb) = callback.as_deref_mut() {
                    cb(n.as_ref().entry());
                }
                drop(Box::from_raw(n.as_ptr()));
                cur = next;
            }
            for slot in self.head.forward.iter_mut() {
                *slot = None;
            }
            self.height = 0;
            self.len = 0;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.clear(None);
    }
}

/// Thread-safe ordered map from `vaddr` to `(len, iova)`.
pub struct IovaIndex {
    inner: Mutex<Inner>,
}

impl IovaIndex {
    pub fn new() -> Self {
        IovaIndex { inner: Mutex::new(Inner::new()) }
    }

    /// Fails with [`Error::Exists`] when any existing entry contains
    /// `vaddr`, or [`Error::Invalid`] when `len == 0`.
    pub fn insert(&self, vaddr: u64, len: u64, iova: u64) -> Result<()> {
        self.inner.lock().insert(vaddr, len, iova)
    }

    /// Fails with [`Error::NotFound`] when no entry contains `vaddr`.
    pub fn remove(&self, vaddr: u64) -> Result<Entry> {
        self.inner.lock().remove(vaddr)
    }

    pub fn find(&self, vaddr: u64) -> Option<Entry> {
        self.inner.lock().find(vaddr)
    }

    /// Remove every entry, invoking `callback` once per entry before
    /// its release (the sentinel is never passed to the callback).
    pub fn clear(&self, callback: Option<&mut dyn FnMut(Entry)>) {
        self.inner.lock().clear(callback)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current skip-list height; used by tests to assert the index
    /// shrinks back to empty after a full drain.
    pub fn height(&self) -> usize {
        self.inner.lock().height
    }
}

impl Default for IovaIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove_roundtrip() {
        let idx = IovaIndex::new();
        idx.insert(0x1000, 0x1000, 0x8000).unwrap();
        let e = idx.find(0x1008).unwrap();
        assert_eq!(e, Entry { vaddr: 0x1000, len: 0x1000, iova: 0x8000 });
        idx.remove(0x1000).unwrap();
        assert!(idx.find(0x1000).is_none());
    }

    #[test]
    fn zero_length_is_invalid() {
        let idx = IovaIndex::new();
        assert!(matches!(idx.insert(0x1000, 0, 0x8000), Err(Error::Invalid(_))));
    }

    #[test]
    fn overlapping_insert_fails() {
        let idx = IovaIndex::new();
        idx.insert(0x1000, 0x1000, 0x8000).unwrap();
        assert!(matches!(idx.insert(0x1000, 0x100, 0x9000), Err(Error::Exists)));
        assert!(matches!(idx.insert(0x1800, 0x100, 0x9000), Err(Error::Exists)));
    }

    #[test]
    fn remove_missing_is_not_found() {
        let idx = IovaIndex::new();
        assert!(matches!(idx.remove(0x1000), Err(Error::NotFound)));
    }

    #[test]
    fn lookup_outside_range_misses() {
        let idx = IovaIndex::new();
        idx.insert(0x2000, 0x1000, 0x9000).unwrap();
        assert!(idx.find(0x1fff).is_none());
        assert!(idx.find(0x3000).is_none());
        assert!(idx.find(0x2fff).is_some());
    }

    #[test]
    fn large_random_workload_drains_cleanly() {
        use rand::seq::SliceRandom;
        let idx = IovaIndex::new();
        let mut vaddrs: Vec<u64> = Vec::new();
        let mut next = 0x1_0000u64;
        for i in 0..10_000u64 {
            let len = 0x1000;
            idx.insert(next, len, 0x1_0000_0000 + i * len).unwrap();
            vaddrs.push(next);
            next += len + 0x1000; // leave a gap so ranges never abut/overlap
        }
        assert_eq!(idx.len(), 10_000);

        let mut order = vaddrs.clone();
        order.shuffle(&mut rand::thread_rng());
        for v in &order {
            idx.remove(*v).unwrap();
        }

        for v in &vaddrs {
            assert!(idx.find(*v).is_none());
        }
        assert_eq!(idx.len(), 0);
        assert_eq!(idx.height(), 0);
    }

    #[test]
    fn clear_invokes_callback_per_entry() {
        let idx = IovaIndex::new();
        idx.insert(0x1000, 0x1000, 0x8000).unwrap();
        idx.insert(0x3000, 0x1000, 0x9000).unwrap();
        let mut seen = Vec::new();
        let mut cb = |e: Entry| seen.push(e.vaddr);
        idx.clear(Some(&mut cb));
        seen.sort();
        assert_eq!(seen, vec![0x1000, 0x3000]);
        assert_eq!(idx.len(), 0);
    }
}
