//! The string pool: three size classes, interning for medium strings, and
//! the loan protocol that lets host code read string bytes safely across a
//! GC cycle.

use std::collections::HashMap;

use wick_core::value::StrHandle;

/// 30-bit content hash, FNV-1a folded down. Matches the original's
/// `(hash:30, mark:1, large:1, id)` node layout closely enough to reuse the
/// same bit budget for bucket distribution in the index.
fn content_hash30(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h & 0x3FFF_FFFF
}

struct StrNode {
    hash: u32,
    mark: bool,
    large: bool,
    bytes: Vec<u8>,
    /// Outstanding loan count; a full GC cycle must steal every loan on a
    /// node before it can be swept, not just unmarked ones.
    loans: u32,
}

/// A read-only borrow of a string's bytes.
///
/// For short strings this is a freestanding copy (no pool entry exists to
/// borrow from). For medium/long strings it borrows the pool's own buffer;
/// [`StringPool::steal`] detaches it into an owned copy ahead of a sweep
/// that would otherwise invalidate it.
pub enum Loan {
    Owned(Vec<u8>),
    Pooled { id: u32 },
}

/// Short strings need no pool entry and no GC interest at all; everything
/// below routes medium/long strings through a dense, bitmap-backed slab so
/// ids stay small and get reused after a full collection, per the
/// original's `makeStrId`.
pub struct StringPool {
    slots: Vec<Option<StrNode>>,
    free: Vec<u32>,
    /// Medium strings are content-interned: this chains content hash to
    /// candidate ids sharing that hash.
    medium_chains: HashMap<u32, Vec<u32>>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool { slots: Vec::new(), free: Vec::new(), medium_chains: HashMap::new() }
    }

    fn alloc_slot(&mut self, node: StrNode) -> u32 {
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(node);
            id
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Some(node));
            id
        }
    }

    /// Routes `bytes` to the right size class, interning medium strings.
    pub fn make(&mut self, bytes: &[u8]) -> StrHandle {
        if let Some(h) = StrHandle::short(bytes) {
            return h;
        }
        if bytes.len() <= StrHandle::MEDIUM_MAX_LEN {
            let hash = content_hash30(bytes);
            if let Some(ids) = self.medium_chains.get(&hash) {
                for &id in ids {
                    if let Some(node) = &self.slots[id as usize] {
                        if node.bytes == bytes {
                            return StrHandle::Medium { id };
                        }
                    }
                }
            }
            let id = self.alloc_slot(StrNode {
                hash,
                mark: false,
                large: false,
                bytes: bytes.to_vec(),
                loans: 0,
            });
            self.medium_chains.entry(hash).or_default().push(id);
            StrHandle::Medium { id }
        } else {
            let hash = content_hash30(bytes);
            let id = self.alloc_slot(StrNode {
                hash,
                mark: false,
                large: true,
                bytes: bytes.to_vec(),
                loans: 0,
            });
            StrHandle::Long { id }
        }
    }

    pub fn bytes(&self, handle: &StrHandle) -> &[u8] {
        match handle {
            StrHandle::Short { .. } => handle.short_bytes().unwrap(),
            StrHandle::Medium { id } | StrHandle::Long { id } => {
                &self.slots[*id as usize].as_ref().expect("dangling string id").bytes
            }
        }
    }

    /// A content-derived hash, used by the index to place string keys.
    /// Short strings hash their inline bytes directly; medium/long strings
    /// reuse the node's precomputed hash.
    pub fn hash_of(&self, handle: &StrHandle) -> u32 {
        match handle {
            StrHandle::Short { .. } => content_hash30(handle.short_bytes().unwrap()),
            StrHandle::Medium { id } | StrHandle::Long { id } => {
                self.slots[*id as usize].as_ref().expect("dangling string id").hash
            }
        }
    }

    pub fn equal(&self, a: &StrHandle, b: &StrHandle) -> bool {
        match (a.is_short(), b.is_short()) {
            (true, true) => a == b,
            _ => self.bytes(a) == self.bytes(b),
        }
    }

    pub fn less(&self, a: &StrHandle, b: &StrHandle) -> bool {
        self.bytes(a) < self.bytes(b)
    }

    pub fn is_long(&self, handle: &StrHandle) -> bool {
        handle.is_long()
    }

    pub fn is_gced(&self, handle: &StrHandle) -> bool {
        !handle.is_short()
    }

    pub fn borrow(&mut self, handle: &StrHandle) -> Loan {
        match handle {
            StrHandle::Short { .. } => Loan::Owned(handle.short_bytes().unwrap().to_vec()),
            StrHandle::Medium { id } | StrHandle::Long { id } => {
                if let Some(node) = self.slots[*id as usize].as_mut() {
                    node.loans += 1;
                }
                Loan::Pooled { id: *id }
            }
        }
    }

    pub fn return_loan(&mut self, loan: Loan) {
        if let Loan::Pooled { id } = loan {
            if let Some(node) = self.slots[id as usize].as_mut() {
                node.loans = node.loans.saturating_sub(1);
            }
        }
    }

    /// Detaches a pooled loan into an owned copy ahead of a sweep, so the
    /// borrow stays valid even after the node it pointed at is freed.
    pub fn steal(&mut self, loan: Loan) -> Vec<u8> {
        match loan {
            Loan::Owned(bytes) => bytes,
            Loan::Pooled { id } => {
                let node = self.slots[id as usize].as_mut().expect("dangling loan");
                node.loans = node.loans.saturating_sub(1);
                node.bytes.clone()
            }
        }
    }

    pub fn mark(&mut self, handle: &StrHandle) {
        if let StrHandle::Medium { id } | StrHandle::Long { id } = handle {
            if let Some(node) = self.slots[*id as usize].as_mut() {
                node.mark = true;
            }
        }
    }

    /// Runs only on a full GC cycle. Frees every unmarked node with no
    /// outstanding loans, unchains medium nodes, then clears all marks.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for id in 0..self.slots.len() as u32 {
            let should_free = matches!(&self.slots[id as usize], Some(n) if !n.mark && n.loans == 0);
            if should_free {
                let node = self.slots[id as usize].take().unwrap();
                if !node.large {
                    if let Some(ids) = self.medium_chains.get_mut(&node.hash) {
                        ids.retain(|&x| x != id);
                    }
                }
                self.free.push(id);
                freed += 1;
            }
        }
        for slot in self.slots.iter_mut().flatten() {
            slot.mark = false;
        }
        freed
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_need_no_pool_entry() {
        let mut pool = StringPool::new();
        let h = pool.make(b"hi");
        assert!(h.is_short());
        assert_eq!(pool.bytes(&h), b"hi");
    }

    #[test]
    fn medium_strings_intern() {
        let mut pool = StringPool::new();
        let a = pool.make(b"hello world");
        let b = pool.make(b"hello world");
        assert!(a.is_medium());
        assert_eq!(a, b);
    }

    #[test]
    fn long_strings_are_unique_per_allocation() {
        let mut pool = StringPool::new();
        let content = b"this string is definitely longer than sixteen bytes";
        let a = pool.make(content);
        let b = pool.make(content);
        assert!(a.is_long());
        assert_ne!(a, b);
        assert!(pool.equal(&a, &b));
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_loaned() {
        let mut pool = StringPool::new();
        let a = pool.make(b"hello world");
        let loan = pool.borrow(&a);
        pool.sweep();
        assert_eq!(pool.bytes(&a), b"hello world");
        pool.return_loan(loan);
    }

    #[test]
    fn id_reused_after_sweep() {
        let mut pool = StringPool::new();
        let a = pool.make(b"hello world!");
        pool.sweep();
        let b = pool.make(b"totally different content");
        // freed slot id should be reused rather than growing the slab
        match (a, b) {
            (StrHandle::Medium { id: id_a }, StrHandle::Long { id: id_b }) => {
                assert_eq!(id_a, id_b);
            }
            other => panic!("unexpected handles: {other:?}"),
        }
    }
}
