use std::{
    sync::atomic::{AtomicI64, Ordering},
    thread::{current, park, Thread},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::{
    core::node::Node,
    util::{dir::Dir, state::State},
};

use super::{tree_node::TreeNode, BinEntry};

/// Chain length at which a bin is converted into a tree.
pub const TREEIFY_THRESHOLD: usize = 8;
/// Node count at or below which a split tree goes back to being a chain.
pub const UNTREEIFY_THRESHOLD: usize = 6;
/// Smallest table for which bins are treeified. Smaller tables grow instead.
pub const MIN_TREEIFY_CAPACITY: usize = 64;

/// Head of a bin holding a red-black tree.
///
/// Writers already hold `lock` (the bin lock) when they get here. Rebalancing
/// additionally takes the root through `lock_state`, so that lookups which
/// entered the tree as readers never see it half rotated. Lookups that find a
/// writer present fall back to walking the `first` list instead of waiting.
#[derive(Debug)]
pub struct TreeBin<V> {
    pub root: Atomic<BinEntry<V>>,
    pub first: Atomic<BinEntry<V>>,
    pub waiter: Atomic<Thread>,
    pub lock: Mutex<()>,
    pub lock_state: AtomicI64,
}

impl<V> TreeBin<V> {
    /// Builds a tree out of a `prev`/`next` linked list of tree nodes.
    pub fn new(list: Shared<'_, BinEntry<V>>, guard: &Guard) -> Self {
        let mut root = Shared::null();

        let mut x = list;
        while x.is_null() == false {
            let x_deref = unsafe { TreeNode::get_tree_node(x) };
            let next = x_deref.node.next.load(Ordering::Relaxed, guard);

            x_deref.left.store(Shared::null(), Ordering::Relaxed);
            x_deref.right.store(Shared::null(), Ordering::Relaxed);

            if root.is_null() {
                x_deref.parent.store(Shared::null(), Ordering::Relaxed);
                x_deref.red.store(false, Ordering::Relaxed);
                root = x;
                x = next;
                continue;
            }

            let (hash, key) = (x_deref.node.hash, x_deref.node.key);
            let mut p = root;
            loop {
                let p_deref = unsafe { TreeNode::get_tree_node(p) };
                let dir = match Dir::towards(p_deref.position(hash, key)) {
                    Some(dir) => dir,
                    None => unreachable!("duplicate key in a bin"),
                };

                let child = p_deref.child(dir).load(Ordering::Relaxed, guard);
                if child.is_null() {
                    x_deref.parent.store(p, Ordering::Relaxed);
                    p_deref.child(dir).store(x, Ordering::Relaxed);
                    root = TreeNode::balance_insertion(root, x, guard);
                    break;
                }
                p = child;
            }

            x = next;
        }

        debug_assert!(TreeNode::check_invariants(root, guard));

        TreeBin {
            root: Atomic::from(root),
            first: Atomic::from(list),
            waiter: Atomic::null(),
            lock: Mutex::new(()),
            lock_state: AtomicI64::new(State::None.bits()),
        }
    }

    fn lock_root(&self, guard: &Guard) {
        if self
            .lock_state
            .compare_exchange(
                State::None.bits(),
                State::Writer.bits(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.contended_lock(guard);
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(State::None.bits(), Ordering::Release);
    }

    fn contended_lock(&self, guard: &Guard) {
        let mut waiting = false;

        loop {
            let state = self.lock_state.load(Ordering::Acquire);
            if state & !State::Waiter.bits() == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, State::Writer.bits(), Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if waiting {
                        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
                        // safety: readers only touch the waiter while pinned.
                        unsafe { guard.defer_destroy(waiter) };
                    }
                    return;
                }
            } else if state & State::Waiter.bits() == 0 {
                if self
                    .lock_state
                    .compare_exchange(
                        state,
                        state | State::Waiter.bits(),
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    waiting = true;
                    let previous = self
                        .waiter
                        .swap(Owned::new(current()), Ordering::SeqCst, guard);
                    debug_assert!(previous.is_null());
                }
            } else if waiting {
                park();
            }
            std::hint::spin_loop();
        }
    }

    /// Lock-free lookup. Walks the tree when no writer is around and the
    /// linked list otherwise.
    pub fn find<'g>(&'g self, hash: i32, key: i64, guard: &'g Guard) -> Option<&'g Node<V>> {
        let mut element = self.first.load(Ordering::SeqCst, guard);
        while element.is_null() == false {
            let state = self.lock_state.load(Ordering::SeqCst);
            if state & (State::Waiter.bits() | State::Writer.bits()) != 0 {
                let element_deref = unsafe { TreeNode::get_tree_node(element) };
                if element_deref.node.matches(hash, key) {
                    return Some(&element_deref.node);
                }
                element = element_deref.node.next.load(Ordering::SeqCst, guard);
            } else if self
                .lock_state
                .compare_exchange(
                    state,
                    state + State::Reader.bits(),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let root = self.root.load(Ordering::SeqCst, guard);
                let p = TreeNode::find_tree_node(root, hash, key, guard);

                if self
                    .lock_state
                    .fetch_add(-State::Reader.bits(), Ordering::SeqCst)
                    == (State::Reader.bits() | State::Waiter.bits())
                {
                    let waiter = self.waiter.load(Ordering::SeqCst, guard);
                    if let Some(waiter) = unsafe { waiter.as_ref() } {
                        waiter.unpark();
                    }
                }

                return unsafe { p.as_ref() }.and_then(BinEntry::node);
            }
        }
        None
    }

    /// Inserts a new tree node for `key` holding `value`, unless the key is
    /// already present. Returns the existing node in that case and null
    /// otherwise. The caller holds the bin lock.
    pub fn put_tree_val<'g>(
        &'g self,
        hash: i32,
        key: i64,
        value: Shared<'g, V>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<V>> {
        let mut p = self.root.load(Ordering::SeqCst, guard);
        if p.is_null() {
            let node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                value,
                Atomic::null(),
                Atomic::null(),
            )))
            .into_shared(guard);
            self.first.store(node, Ordering::SeqCst);
            self.root.store(node, Ordering::SeqCst);
            return Shared::null();
        }

        loop {
            let p_deref = unsafe { TreeNode::get_tree_node(p) };
            let dir = match Dir::towards(p_deref.position(hash, key)) {
                Some(dir) => dir,
                None => return p,
            };

            let child = p_deref.child(dir).load(Ordering::SeqCst, guard);
            if child.is_null() == false {
                p = child;
                continue;
            }

            let first = self.first.load(Ordering::SeqCst, guard);
            let x = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                value,
                Atomic::from(first),
                Atomic::from(p),
            )))
            .into_shared(guard);
            self.first.store(x, Ordering::SeqCst);
            if first.is_null() == false {
                unsafe { TreeNode::get_tree_node(first) }
                    .prev
                    .store(x, Ordering::SeqCst);
            }

            if TreeNode::is_red(p) == false {
                TreeNode::set_red(x, true);
                p_deref.child(dir).store(x, Ordering::SeqCst);
            } else {
                p_deref.child(dir).store(x, Ordering::SeqCst);
                self.lock_root(guard);
                let root = self.root.load(Ordering::SeqCst, guard);
                self.root
                    .store(TreeNode::balance_insertion(root, x, guard), Ordering::SeqCst);
                self.unlock_root();
            }
            break;
        }

        debug_assert!(TreeNode::check_invariants(
            self.root.load(Ordering::SeqCst, guard),
            guard
        ));
        Shared::null()
    }

    /// Unlinks `p` from the list and the tree and retires it. Its value is
    /// left to the caller.
    ///
    /// Returns `true` when the tree has become too small to be worth keeping.
    /// In that case only the list was updated, and the caller must replace
    /// the whole bin with a plain chain built from `first`.
    ///
    /// # Safety
    ///
    /// The caller holds the bin lock, and `p` is a tree node of this bin.
    pub unsafe fn remove_tree_node<'g>(&'g self, p: Shared<'g, BinEntry<V>>, guard: &'g Guard) -> bool {
        let p_deref = TreeNode::get_tree_node(p);
        let next = p_deref.node.next.load(Ordering::SeqCst, guard);
        let prev = p_deref.prev.load(Ordering::SeqCst, guard);

        if prev.is_null() {
            self.first.store(next, Ordering::SeqCst);
        } else {
            TreeNode::get_tree_node(prev)
                .node
                .next
                .store(next, Ordering::SeqCst);
        }
        if next.is_null() == false {
            TreeNode::get_tree_node(next).prev.store(prev, Ordering::SeqCst);
        }

        if self.first.load(Ordering::SeqCst, guard).is_null() {
            self.root.store(Shared::null(), Ordering::SeqCst);
            guard.defer_destroy(p);
            return true;
        }

        let mut root = self.root.load(Ordering::SeqCst, guard);
        let root_left = TreeNode::left(root, guard);
        if root.is_null()
            || TreeNode::right(root, guard).is_null()
            || root_left.is_null()
            || TreeNode::left(root_left, guard).is_null()
        {
            guard.defer_destroy(p);
            return true;
        }

        self.lock_root(guard);

        let p_left = TreeNode::left(p, guard);
        let p_right = TreeNode::right(p, guard);
        let replacement = if p_left.is_null() == false && p_right.is_null() == false {
            // swap p with its successor, so that p has at most one child
            let mut succ = p_right;
            loop {
                let succ_left = TreeNode::left(succ, guard);
                if succ_left.is_null() {
                    break;
                }
                succ = succ_left;
            }

            let color = TreeNode::is_red(succ);
            TreeNode::set_red(succ, TreeNode::is_red(p));
            TreeNode::set_red(p, color);

            let succ_right = TreeNode::right(succ, guard);
            let p_parent = TreeNode::parent(p, guard);
            if succ == p_right {
                TreeNode::set_parent(p, succ);
                TreeNode::set_right(succ, p);
            } else {
                let succ_parent = TreeNode::parent(succ, guard);
                TreeNode::set_parent(p, succ_parent);
                if succ_parent.is_null() == false {
                    if succ == TreeNode::left(succ_parent, guard) {
                        TreeNode::set_left(succ_parent, p);
                    } else {
                        TreeNode::set_right(succ_parent, p);
                    }
                }
                TreeNode::set_right(succ, p_right);
                TreeNode::set_parent(p_right, succ);
            }

            TreeNode::set_left(p, Shared::null());
            TreeNode::set_right(p, succ_right);
            TreeNode::set_parent(succ_right, p);
            TreeNode::set_left(succ, p_left);
            TreeNode::set_parent(p_left, succ);
            TreeNode::set_parent(succ, p_parent);
            if p_parent.is_null() {
                root = succ;
            } else if p == TreeNode::left(p_parent, guard) {
                TreeNode::set_left(p_parent, succ);
            } else {
                TreeNode::set_right(p_parent, succ);
            }

            if succ_right.is_null() {
                p
            } else {
                succ_right
            }
        } else if p_left.is_null() == false {
            p_left
        } else if p_right.is_null() == false {
            p_right
        } else {
            p
        };

        if replacement != p {
            let p_parent = TreeNode::parent(p, guard);
            TreeNode::set_parent(replacement, p_parent);
            if p_parent.is_null() {
                root = replacement;
            } else if p == TreeNode::left(p_parent, guard) {
                TreeNode::set_left(p_parent, replacement);
            } else {
                TreeNode::set_right(p_parent, replacement);
            }
            TreeNode::set_left(p, Shared::null());
            TreeNode::set_right(p, Shared::null());
            TreeNode::set_parent(p, Shared::null());
        }

        if TreeNode::is_red(p) == false {
            root = TreeNode::balance_deletion(root, replacement, guard);
        }

        if p == replacement {
            // detach
            let p_parent = TreeNode::parent(p, guard);
            if p_parent.is_null() == false {
                if p == TreeNode::left(p_parent, guard) {
                    TreeNode::set_left(p_parent, Shared::null());
                } else if p == TreeNode::right(p_parent, guard) {
                    TreeNode::set_right(p_parent, Shared::null());
                }
                TreeNode::set_parent(p, Shared::null());
            }
        }

        self.root.store(root, Ordering::SeqCst);
        self.unlock_root();

        debug_assert!(TreeNode::check_invariants(root, guard));
        guard.defer_destroy(p);
        false
    }

    /// Splits the tree for a table of twice the size `n`: the first bin gets
    /// the nodes whose hash has bit `n` clear, the second the rest. A side
    /// that keeps every node reuses `bin`, the entry holding this tree.
    pub fn split<'g>(
        &'g self,
        bin: Shared<'g, BinEntry<V>>,
        n: usize,
        guard: &'g Guard,
    ) -> (Shared<'g, BinEntry<V>>, Shared<'g, BinEntry<V>>) {
        let is_low = |node: &Node<V>| (node.hash as usize) & n == 0;
        let is_high = |node: &Node<V>| (node.hash as usize) & n != 0;

        let first = self.first.load(Ordering::SeqCst, guard);
        let (mut low_count, mut high_count) = (0, 0);
        let mut e = first;
        while let Some(node) = unsafe { e.as_ref() }.and_then(BinEntry::node) {
            if is_low(node) {
                low_count += 1;
            } else {
                high_count += 1;
            }
            e = node.next.load(Ordering::SeqCst, guard);
        }

        let side = |count: usize, other: usize, keep: &dyn Fn(&Node<V>) -> bool| {
            if count <= UNTREEIFY_THRESHOLD {
                untreeify(first, keep, guard)
            } else if other == 0 {
                bin
            } else {
                let list = copy_tree_nodes(first, keep, guard);
                Owned::new(BinEntry::Tree(TreeBin::new(list, guard))).into_shared(guard)
            }
        };

        (
            side(low_count, high_count, &is_low),
            side(high_count, low_count, &is_high),
        )
    }

    /// Retires every tree node on the list. Values are left alone.
    ///
    /// # Safety
    ///
    /// The bin holding this tree has been unlinked from its table.
    pub unsafe fn retire_nodes(&self, guard: &Guard) {
        let mut p = self.first.load(Ordering::SeqCst, guard);
        while p.is_null() == false {
            let next = TreeNode::get_tree_node(p).node.next.load(Ordering::SeqCst, guard);
            guard.defer_destroy(p);
            p = next;
        }
    }

    /// Full structural check of the tree and its list.
    pub fn check_invariants(&self, guard: &Guard) -> bool {
        let first = self.first.load(Ordering::SeqCst, guard);
        let root = self.root.load(Ordering::SeqCst, guard);
        first.is_null() == root.is_null()
            && TreeNode::prev(first, guard).is_null()
            && TreeNode::check_invariants(root, guard)
    }
}

impl<V> Drop for TreeBin<V> {
    fn drop(&mut self) {
        // safety: the bin is being destroyed, nobody else can reach the waiter.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let waiter = self.waiter.swap(Shared::null(), Ordering::Relaxed, guard);
        if waiter.is_null() == false {
            drop(unsafe { waiter.into_owned() });
        }
    }
}

/// Copies the nodes of the list starting at `first` that satisfy `keep` into
/// a fresh list of tree nodes, in order. Values are shared with the source.
pub fn copy_tree_nodes<'g, V, F>(
    first: Shared<'g, BinEntry<V>>,
    keep: F,
    guard: &'g Guard,
) -> Shared<'g, BinEntry<V>>
where
    F: Fn(&Node<V>) -> bool,
{
    let mut head = Shared::null();
    let mut tail: Shared<'g, BinEntry<V>> = Shared::null();

    let mut e = first;
    while let Some(node) = unsafe { e.as_ref() }.and_then(BinEntry::node) {
        if keep(node) {
            let copy = Owned::new(BinEntry::TreeNode(TreeNode::new(
                node.hash,
                node.key,
                node.value.load(Ordering::SeqCst, guard),
                Atomic::null(),
                Atomic::null(),
            )))
            .into_shared(guard);
            unsafe { TreeNode::get_tree_node(copy) }
                .prev
                .store(tail, Ordering::Relaxed);
            if tail.is_null() {
                head = copy;
            } else {
                unsafe { TreeNode::get_tree_node(tail) }
                    .node
                    .next
                    .store(copy, Ordering::Relaxed);
            }
            tail = copy;
        }
        e = node.next.load(Ordering::SeqCst, guard);
    }

    head
}

/// Like `copy_tree_nodes`, but produces a plain chain.
pub fn untreeify<'g, V, F>(
    first: Shared<'g, BinEntry<V>>,
    keep: F,
    guard: &'g Guard,
) -> Shared<'g, BinEntry<V>>
where
    F: Fn(&Node<V>) -> bool,
{
    let mut head = Shared::null();
    let mut tail: Shared<'g, BinEntry<V>> = Shared::null();

    let mut e = first;
    while let Some(node) = unsafe { e.as_ref() }.and_then(BinEntry::node) {
        if keep(node) {
            let copy = Owned::new(BinEntry::Node(Node::new(
                node.hash,
                node.key,
                node.value.load(Ordering::SeqCst, guard),
                Atomic::null(),
            )))
            .into_shared(guard);
            match unsafe { tail.as_ref() }.and_then(BinEntry::node) {
                Some(tail) => tail.next.store(copy, Ordering::Relaxed),
                None => head = copy,
            }
            tail = copy;
        }
        e = node.next.load(Ordering::SeqCst, guard);
    }

    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::Table;

    const HASH: i32 = 7;

    fn tree_list<'g>(keys: impl DoubleEndedIterator<Item = i64>, guard: &'g Guard) -> Shared<'g, BinEntry<u64>> {
        let mut head: Shared<'g, BinEntry<u64>> = Shared::null();
        for key in keys.rev() {
            let node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                HASH,
                key,
                Atomic::new(key as u64 * 10),
                Atomic::from(head),
                Atomic::null(),
            )))
            .into_shared(guard);
            if head.is_null() == false {
                unsafe { TreeNode::get_tree_node(head) }
                    .prev
                    .store(node, Ordering::Relaxed);
            }
            head = node;
        }
        head
    }

    fn value_of(tree: &TreeBin<u64>, key: i64, guard: &Guard) -> Option<u64> {
        tree.find(HASH, key, guard)
            .map(|node| unsafe { *node.value.load(Ordering::SeqCst, guard).deref() })
    }

    #[test]
    fn new_builds_valid_tree() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::new(1);
        table.store_bin(0, Owned::new(BinEntry::Tree(TreeBin::new(tree_list(0..100, guard), guard))));

        let tree = unsafe { table.bin(0, guard).deref() }.as_tree_bin().unwrap();
        assert!(tree.check_invariants(guard));
        for key in 0..100 {
            assert_eq!(value_of(tree, key, guard), Some(key as u64 * 10));
        }
        assert_eq!(value_of(tree, 100, guard), None);
        assert_eq!(tree.find(HASH + 1, 5, guard).map(|n| n.key), None);

        table.drop_bins();
    }

    #[test]
    fn find_falls_back_to_list_while_locked() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::new(1);
        table.store_bin(0, Owned::new(BinEntry::Tree(TreeBin::new(tree_list(0..20, guard), guard))));

        let tree = unsafe { table.bin(0, guard).deref() }.as_tree_bin().unwrap();
        tree.lock_root(guard);
        assert_eq!(value_of(tree, 13, guard), Some(130));
        assert_eq!(value_of(tree, 21, guard), None);
        tree.unlock_root();
        assert_eq!(tree.lock_state.load(Ordering::SeqCst), State::None.bits());

        table.drop_bins();
    }

    #[test]
    fn put_tree_val_inserts_and_detects_existing() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::new(1);
        table.store_bin(0, Owned::new(BinEntry::Tree(TreeBin::new(tree_list(0..1, guard), guard))));
        let tree = unsafe { table.bin(0, guard).deref() }.as_tree_bin().unwrap();

        for key in (1..200).rev() {
            let value = Owned::new(key as u64 * 10).into_shared(guard);
            assert!(tree.put_tree_val(HASH, key, value, guard).is_null());
            assert!(tree.check_invariants(guard));
        }

        let existing = tree.put_tree_val(HASH, 42, Shared::null(), guard);
        let existing = unsafe { existing.deref() }.node().map(|node| node.key);
        assert_eq!(existing, Some(42));
        for key in 0..200 {
            assert_eq!(value_of(tree, key, guard), Some(key as u64 * 10));
        }

        table.drop_bins();
    }

    #[test]
    fn remove_tree_node_keeps_tree_valid() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::new(1);
        table.store_bin(0, Owned::new(BinEntry::Tree(TreeBin::new(tree_list(0..64, guard), guard))));
        let tree = unsafe { table.bin(0, guard).deref() }.as_tree_bin().unwrap();

        for key in (0..64).step_by(4) {
            let root = tree.root.load(Ordering::SeqCst, guard);
            let p = TreeNode::find_tree_node(root, HASH, key, guard);
            let value = unsafe { TreeNode::get_tree_node(p) }
                .node
                .value
                .load(Ordering::SeqCst, guard);
            assert!(unsafe { tree.remove_tree_node(p, guard) } == false);
            unsafe { guard.defer_destroy(value) };
            assert!(tree.check_invariants(guard));
        }

        for key in 0..64 {
            let expected = if key % 4 == 0 { None } else { Some(key as u64 * 10) };
            assert_eq!(value_of(tree, key, guard), expected);
        }

        table.drop_bins();
    }

    #[test]
    fn remove_last_node_empties_tree() {
        let guard = &crossbeam_epoch::pin();
        let mut table = Table::new(1);
        table.store_bin(0, Owned::new(BinEntry::Tree(TreeBin::new(tree_list(0..1, guard), guard))));
        let tree = unsafe { table.bin(0, guard).deref() }.as_tree_bin().unwrap();

        let p = tree.first.load(Ordering::SeqCst, guard);
        let value = unsafe { TreeNode::get_tree_node(p) }
            .node
            .value
            .load(Ordering::SeqCst, guard);
        assert!(unsafe { tree.remove_tree_node(p, guard) });
        unsafe { guard.defer_destroy(value) };
        assert!(tree.first.load(Ordering::SeqCst, guard).is_null());
        assert!(tree.root.load(Ordering::SeqCst, guard).is_null());

        table.drop_bins();
    }

    #[test]
    fn split_untreeifies_small_sides_and_reuses_full_side() {
        let guard = &crossbeam_epoch::pin();
        let tree_of = |keys: &[(i32, i64)]| {
            let mut head: Shared<'_, BinEntry<u64>> = Shared::null();
            for &(hash, key) in keys.iter().rev() {
                let node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                    hash,
                    key,
                    Atomic::new(key as u64),
                    Atomic::from(head),
                    Atomic::null(),
                )))
                .into_shared(guard);
                if head.is_null() == false {
                    unsafe { TreeNode::get_tree_node(head) }
                        .prev
                        .store(node, Ordering::Relaxed);
                }
                head = node;
            }
            Owned::new(BinEntry::Tree(TreeBin::new(head, guard))).into_shared(guard)
        };

        // ten low nodes and three high ones for n = 16
        let mut keys: Vec<(i32, i64)> = (0..10).map(|k| (3, k)).collect();
        keys.extend((10..13).map(|k| (19, k)));
        let bin = tree_of(&keys);
        let tree = unsafe { bin.deref() }.as_tree_bin().unwrap();
        let (low, high) = tree.split(bin, 16, guard);

        let low_tree = unsafe { low.deref() }.as_tree_bin().unwrap();
        assert!(low != bin);
        assert!(low_tree.check_invariants(guard));
        assert!((0..10).all(|k| low_tree.find(3, k, guard).is_some()));

        let high_chain = unsafe { high.deref() };
        assert!(high_chain.as_node().is_some());
        assert!((10..13).all(|k| high_chain.find(19, k, guard).is_some()));
        assert!(high_chain.find(3, 0, guard).is_none());

        // all low, so the existing bin is kept as is
        let (same, empty) = low_tree.split(low, 32, guard);
        assert!(same == low);
        assert!(empty.is_null());

        // the split copies share values with the original; free them once
        let mut table = Table::new(2);
        table.store_bin(0, bin);
        unsafe {
            low_tree.retire_nodes(guard);
            guard.defer_destroy(low);
            let mut p = high;
            while let Some(node) = p.as_ref().and_then(BinEntry::node) {
                let next = node.next.load(Ordering::SeqCst, guard);
                guard.defer_destroy(p);
                p = next;
            }
        }
        table.drop_bins();
    }
}
