use std::sync::atomic::Ordering;

use crossbeam_epoch::Guard;
use parking_lot::Mutex;

use self::{tree_bin::TreeBin, tree_node::TreeNode};

use super::{node::Node, table::Table};

pub mod tree_bin;
pub mod tree_node;

/// Hash reported by a forwarding entry.
pub const MOVED: i32 = -1;
/// Hash reported by the head of a tree bin.
pub const TREEBIN: i32 = -2;
/// Hash reported by a reservation placeholder.
pub const RESERVED: i32 = -3;

/// An entry in a bin.
///
/// A bin head is a `Node` (plain chain), a `Tree`, a `Moved` forwarding entry or a
/// `Reserved` placeholder. `TreeNode`s only ever appear inside a `Tree`.
#[derive(Debug)]
pub enum BinEntry<V> {
    Node(Node<V>),
    Tree(TreeBin<V>),
    TreeNode(TreeNode<V>),
    // The table behind the pointer outlives every guard that could have read this entry: it
    // is either the map's next table, or the current one, and it is only retired once a later
    // resize swaps it out, which defers its destruction past all pinned readers.
    Moved(*const Table<V>),
    Reserved(Mutex<()>),
}

unsafe impl<V> Send for BinEntry<V> where V: Send + Sync {}

unsafe impl<V> Sync for BinEntry<V> where V: Send + Sync {}

impl<V> BinEntry<V> {
    pub fn as_node(&self) -> Option<&Node<V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    pub fn as_tree_bin(&self) -> Option<&TreeBin<V>> {
        if let BinEntry::Tree(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    /// The key/value part of an entry that sits on a linked list, be it a
    /// plain chain or the traversal list of a tree.
    #[inline]
    pub fn node(&self) -> Option<&Node<V>> {
        match *self {
            BinEntry::Node(ref n) => Some(n),
            BinEntry::TreeNode(ref n) => Some(&n.node),
            _ => None,
        }
    }

    pub fn hash(&self) -> i32 {
        match *self {
            BinEntry::Node(ref n) => n.hash,
            BinEntry::TreeNode(ref n) => n.node.hash,
            BinEntry::Tree(_) => TREEBIN,
            BinEntry::Moved(_) => MOVED,
            BinEntry::Reserved(_) => RESERVED,
        }
    }

    /// Looks `key` up starting at this entry without taking any lock.
    pub fn find<'g>(&'g self, hash: i32, key: i64, guard: &'g Guard) -> Option<&'g Node<V>> {
        match *self {
            BinEntry::Node(_) | BinEntry::TreeNode(_) => {
                let mut entry = self;
                loop {
                    let node = entry.node()?;
                    if node.matches(hash, key) {
                        return Some(node);
                    }
                    let next = node.next.load(Ordering::SeqCst, guard);
                    // safety: nodes are retired only after being unlinked, and we still hold the
                    // guard under which we reached this one.
                    entry = unsafe { next.as_ref() }?;
                }
            }
            BinEntry::Tree(ref tree) => tree.find(hash, key, guard),
            BinEntry::Moved(next_table) => {
                // safety: see the comment on `BinEntry::Moved`.
                let mut table = unsafe { &*next_table };
                loop {
                    if table.is_empty() {
                        return None;
                    }
                    let bin = table.bin(table.bini(hash), guard);
                    // safety: the bin was read from a live table while pinned.
                    let bin = unsafe { bin.as_ref() }?;
                    match *bin {
                        BinEntry::Moved(next_table) => {
                            table = unsafe { &*next_table };
                        }
                        _ => return bin.find(hash, key, guard),
                    }
                }
            }
            BinEntry::Reserved(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{Atomic, Owned};

    fn new_node(hash: i32, key: i64, value: u64) -> Node<u64> {
        Node::new(hash, key, Atomic::new(value), Atomic::null())
    }

    #[test]
    fn find_node_no_match() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::<u64>::new(1);
        let head = new_node(1, 2, 3);
        head.next
            .store(Owned::new(BinEntry::Node(new_node(4, 5, 6))), Ordering::SeqCst);
        table.store_bin(0, Owned::new(BinEntry::Node(head)));

        let bin = table.bin(0, guard);
        assert!(unsafe { bin.deref() }.find(1, 0, guard).is_none());
        table.drop_bins();
    }

    #[test]
    fn find_node_multi_match() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::<u64>::new(1);
        let head = new_node(1, 2, 3);
        head.next
            .store(Owned::new(BinEntry::Node(new_node(4, 5, 6))), Ordering::SeqCst);
        table.store_bin(0, Owned::new(BinEntry::Node(head)));

        let bin = unsafe { table.bin(0, guard).deref() };
        assert_eq!(bin.find(1, 2, guard).map(|n| n.key), Some(2));
        assert_eq!(bin.find(4, 5, guard).map(|n| n.key), Some(5));
        // same hash, other key
        assert!(bin.find(4, 6, guard).is_none());
        table.drop_bins();
    }

    #[test]
    fn find_moved_empty_bin_no_match() {
        let guard = &crossbeam_epoch::pin();
        let table = Table::<u64>::new(1);
        let entry = BinEntry::<u64>::Moved(&table as *const _);
        assert!(entry.find(1, 2, guard).is_none());
    }

    #[test]
    fn find_moved_match() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::<u64>::new(2);
        table.store_bin(1, Owned::new(BinEntry::Node(new_node(1, 2, 3))));
        let entry = BinEntry::<u64>::Moved(&table as *const _);
        let found = entry.find(1, 2, guard).map(|n| n.value.load(Ordering::SeqCst, guard));
        assert_eq!(found.map(|v| unsafe { *v.deref() }), Some(3));
        assert!(entry.find(0, 1, guard).is_none());
        table.drop_bins();
    }

    #[test]
    fn sentinel_hashes() {
        let table = Table::<u64>::new(1);
        assert_eq!(BinEntry::<u64>::Moved(&table as *const _).hash(), MOVED);
        assert_eq!(BinEntry::<u64>::Reserved(Mutex::new(())).hash(), RESERVED);
        assert!(MOVED < 0 && TREEBIN < 0 && RESERVED < 0);
    }
}
