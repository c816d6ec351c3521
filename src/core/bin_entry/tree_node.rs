use std::{
    cmp,
    sync::atomic::{AtomicBool, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Shared};

use crate::{core::node::Node, util::dir::Dir};

use super::BinEntry;

#[derive(Debug)]
pub struct TreeNode<V> {
    pub node: Node<V>,
    pub parent: Atomic<BinEntry<V>>,
    pub left: Atomic<BinEntry<V>>,
    pub right: Atomic<BinEntry<V>>,
    pub prev: Atomic<BinEntry<V>>,
    pub red: AtomicBool,
}

impl<V> TreeNode<V> {
    pub fn new<AV>(
        hash: i32,
        key: i64,
        value: AV,
        next: Atomic<BinEntry<V>>,
        parent: Atomic<BinEntry<V>>,
    ) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        TreeNode {
            node: Node::new(hash, key, value, next),
            parent,
            left: Atomic::null(),
            right: Atomic::null(),
            prev: Atomic::null(),
            red: AtomicBool::new(false),
        }
    }

    /// Where this node sits relative to the probe `(hash, key)`. Trees are
    /// ordered by hash first and by key among equal hashes.
    #[inline]
    pub fn position(&self, hash: i32, key: i64) -> cmp::Ordering {
        self.node
            .hash
            .cmp(&hash)
            .then(self.node.key.cmp(&key))
    }

    #[inline]
    pub fn child(&self, dir: Dir) -> &Atomic<BinEntry<V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    pub fn find_tree_node<'t>(
        from: Shared<'t, BinEntry<V>>,
        hash: i32,
        key: i64,
        guard: &'t Guard,
    ) -> Shared<'t, BinEntry<V>> {
        let mut p = from;
        while p.is_null() == false {
            let p_deref = unsafe { Self::get_tree_node(p) };
            p = match Dir::towards(p_deref.position(hash, key)) {
                Some(dir) => p_deref.child(dir).load(Ordering::SeqCst, guard),
                None => return p,
            };
        }
        Shared::null()
    }

    pub fn balance_insertion<'t>(
        mut root: Shared<'t, BinEntry<V>>,
        mut x: Shared<'t, BinEntry<V>>,
        guard: &'t Guard,
    ) -> Shared<'t, BinEntry<V>> {
        Self::set_red(x, true);

        loop {
            let mut x_parent = Self::parent(x, guard);
            if x_parent.is_null() {
                Self::set_red(x, false);
                return x;
            }

            let mut x_parent_parent = Self::parent(x_parent, guard);
            if Self::is_red(x_parent) == false || x_parent_parent.is_null() {
                return root;
            }

            let x_parent_parent_left = Self::left(x_parent_parent, guard);
            if x_parent == x_parent_parent_left {
                let x_parent_parent_right = Self::right(x_parent_parent, guard);
                if Self::is_red(x_parent_parent_right) {
                    Self::set_red(x_parent_parent_right, false);
                    Self::set_red(x_parent, false);
                    Self::set_red(x_parent_parent, true);
                    x = x_parent_parent;
                } else {
                    if x == Self::right(x_parent, guard) {
                        x = x_parent;
                        root = Self::rotate_left(root, x, guard);
                        x_parent = Self::parent(x, guard);
                        x_parent_parent = Self::parent(x_parent, guard);
                    }
                    if x_parent.is_null() == false {
                        Self::set_red(x_parent, false);
                        if x_parent_parent.is_null() == false {
                            Self::set_red(x_parent_parent, true);
                            root = Self::rotate_right(root, x_parent_parent, guard);
                        }
                    }
                }
            } else if Self::is_red(x_parent_parent_left) {
                Self::set_red(x_parent_parent_left, false);
                Self::set_red(x_parent, false);
                Self::set_red(x_parent_parent, true);
                x = x_parent_parent;
            } else {
                if x == Self::left(x_parent, guard) {
                    x = x_parent;
                    root = Self::rotate_right(root, x, guard);
                    x_parent = Self::parent(x, guard);
                    x_parent_parent = Self::parent(x_parent, guard);
                }
                if x_parent.is_null() == false {
                    Self::set_red(x_parent, false);
                    if x_parent_parent.is_null() == false {
                        Self::set_red(x_parent_parent, true);
                        root = Self::rotate_left(root, x_parent_parent, guard);
                    }
                }
            }
        }
    }

    pub fn balance_deletion<'t>(
        mut root: Shared<'t, BinEntry<V>>,
        mut x: Shared<'t, BinEntry<V>>,
        guard: &'t Guard,
    ) -> Shared<'t, BinEntry<V>> {
        loop {
            if x.is_null() || x == root {
                return root;
            }

            let mut x_parent = Self::parent(x, guard);
            if x_parent.is_null() {
                Self::set_red(x, false);
                return x;
            }
            if Self::is_red(x) {
                Self::set_red(x, false);
                return root;
            }

            if Self::left(x_parent, guard) == x {
                let mut sibling = Self::right(x_parent, guard);
                if Self::is_red(sibling) {
                    Self::set_red(sibling, false);
                    Self::set_red(x_parent, true);
                    root = Self::rotate_left(root, x_parent, guard);
                    x_parent = Self::parent(x, guard);
                    sibling = Self::right(x_parent, guard);
                }
                if sibling.is_null() {
                    x = x_parent;
                    continue;
                }

                let sibling_left = Self::left(sibling, guard);
                let mut sibling_right = Self::right(sibling, guard);
                if Self::is_red(sibling_right) == false && Self::is_red(sibling_left) == false {
                    Self::set_red(sibling, true);
                    x = x_parent;
                    continue;
                }

                if Self::is_red(sibling_right) == false {
                    Self::set_red(sibling_left, false);
                    Self::set_red(sibling, true);
                    root = Self::rotate_right(root, sibling, guard);
                    x_parent = Self::parent(x, guard);
                    sibling = Self::right(x_parent, guard);
                }
                if sibling.is_null() == false {
                    Self::set_red(sibling, x_parent.is_null() == false && Self::is_red(x_parent));
                    sibling_right = Self::right(sibling, guard);
                    Self::set_red(sibling_right, false);
                }
                if x_parent.is_null() == false {
                    Self::set_red(x_parent, false);
                    root = Self::rotate_left(root, x_parent, guard);
                }
                x = root;
            } else {
                let mut sibling = Self::left(x_parent, guard);
                if Self::is_red(sibling) {
                    Self::set_red(sibling, false);
                    Self::set_red(x_parent, true);
                    root = Self::rotate_right(root, x_parent, guard);
                    x_parent = Self::parent(x, guard);
                    sibling = Self::left(x_parent, guard);
                }
                if sibling.is_null() {
                    x = x_parent;
                    continue;
                }

                let mut sibling_left = Self::left(sibling, guard);
                let sibling_right = Self::right(sibling, guard);
                if Self::is_red(sibling_left) == false && Self::is_red(sibling_right) == false {
                    Self::set_red(sibling, true);
                    x = x_parent;
                    continue;
                }

                if Self::is_red(sibling_left) == false {
                    Self::set_red(sibling_right, false);
                    Self::set_red(sibling, true);
                    root = Self::rotate_left(root, sibling, guard);
                    x_parent = Self::parent(x, guard);
                    sibling = Self::left(x_parent, guard);
                }
                if sibling.is_null() == false {
                    Self::set_red(sibling, x_parent.is_null() == false && Self::is_red(x_parent));
                    sibling_left = Self::left(sibling, guard);
                    Self::set_red(sibling_left, false);
                }
                if x_parent.is_null() == false {
                    Self::set_red(x_parent, false);
                    root = Self::rotate_right(root, x_parent, guard);
                }
                x = root;
            }
        }
    }

    fn rotate_left<'l>(
        mut root: Shared<'l, BinEntry<V>>,
        p: Shared<'l, BinEntry<V>>,
        guard: &'l Guard,
    ) -> Shared<'l, BinEntry<V>> {
        let right = Self::right(p, guard);
        if p.is_null() || right.is_null() {
            return root;
        }

        let right_left = Self::left(right, guard);
        Self::set_right(p, right_left);
        Self::set_parent(right_left, p);

        let p_parent = Self::parent(p, guard);
        Self::set_parent(right, p_parent);

        if p_parent.is_null() {
            root = right;
            Self::set_red(right, false);
        } else if Self::left(p_parent, guard) == p {
            Self::set_left(p_parent, right);
        } else {
            Self::set_right(p_parent, right);
        }

        Self::set_left(right, p);
        Self::set_parent(p, right);

        root
    }

    fn rotate_right<'l>(
        mut root: Shared<'l, BinEntry<V>>,
        p: Shared<'l, BinEntry<V>>,
        guard: &'l Guard,
    ) -> Shared<'l, BinEntry<V>> {
        let left = Self::left(p, guard);
        if p.is_null() || left.is_null() {
            return root;
        }

        let left_right = Self::right(left, guard);
        Self::set_left(p, left_right);
        Self::set_parent(left_right, p);

        let p_parent = Self::parent(p, guard);
        Self::set_parent(left, p_parent);

        if p_parent.is_null() {
            root = left;
            Self::set_red(left, false);
        } else if Self::right(p_parent, guard) == p {
            Self::set_right(p_parent, left);
        } else {
            Self::set_left(p_parent, left);
        }

        Self::set_right(left, p);
        Self::set_parent(p, left);

        root
    }

    /// Checks the subtree rooted at `root`: links are mutual, children are
    /// ordered around their parent, no red node has a red child, and every
    /// path down has the same number of black nodes.
    pub fn check_invariants(root: Shared<'_, BinEntry<V>>, guard: &Guard) -> bool {
        if root.is_null() {
            return true;
        }
        Self::parent(root, guard).is_null()
            && Self::is_red(root) == false
            && Self::black_height(root, guard).is_some()
    }

    fn black_height(t: Shared<'_, BinEntry<V>>, guard: &Guard) -> Option<usize> {
        if t.is_null() {
            return Some(1);
        }

        let t_deref = unsafe { Self::get_tree_node(t) };
        let prev = t_deref.prev.load(Ordering::Relaxed, guard);
        let next = t_deref.node.next.load(Ordering::Relaxed, guard);
        if prev.is_null() == false
            && unsafe { Self::get_tree_node(prev) }
                .node
                .next
                .load(Ordering::Relaxed, guard)
                != t
        {
            return None;
        }
        if next.is_null() == false && Self::prev(next, guard) != t {
            return None;
        }

        let parent = Self::parent(t, guard);
        if parent.is_null() == false
            && Self::left(parent, guard) != t
            && Self::right(parent, guard) != t
        {
            return None;
        }

        let (hash, key) = (t_deref.node.hash, t_deref.node.key);
        let left = Self::left(t, guard);
        let right = Self::right(t, guard);
        for (child, expected) in [(left, cmp::Ordering::Less), (right, cmp::Ordering::Greater)] {
            if child.is_null() {
                continue;
            }
            let child_deref = unsafe { Self::get_tree_node(child) };
            if Self::parent(child, guard) != t || child_deref.position(hash, key) != expected {
                return None;
            }
            if Self::is_red(t) && Self::is_red(child) {
                return None;
            }
        }

        let left_height = Self::black_height(left, guard)?;
        let right_height = Self::black_height(right, guard)?;
        if left_height != right_height {
            return None;
        }
        Some(left_height + usize::from(Self::is_red(t) == false))
    }

    pub unsafe fn get_tree_node<'t>(bin: Shared<'t, BinEntry<V>>) -> &'t TreeNode<V> {
        match *bin.deref() {
            BinEntry::TreeNode(ref tree_node) => tree_node,
            _ => unreachable!("tree links only point at tree nodes"),
        }
    }

    // Null-tolerant accessors. Tree links are only rewired by the thread
    // holding the bin lock, so loads here can be relaxed; stores that a
    // concurrent lookup may follow are not.

    #[inline]
    pub fn parent<'t>(x: Shared<'t, BinEntry<V>>, guard: &'t Guard) -> Shared<'t, BinEntry<V>> {
        if x.is_null() {
            return Shared::null();
        }
        unsafe { Self::get_tree_node(x) }
            .parent
            .load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub fn left<'t>(x: Shared<'t, BinEntry<V>>, guard: &'t Guard) -> Shared<'t, BinEntry<V>> {
        if x.is_null() {
            return Shared::null();
        }
        unsafe { Self::get_tree_node(x) }
            .left
            .load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub fn right<'t>(x: Shared<'t, BinEntry<V>>, guard: &'t Guard) -> Shared<'t, BinEntry<V>> {
        if x.is_null() {
            return Shared::null();
        }
        unsafe { Self::get_tree_node(x) }
            .right
            .load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub fn prev<'t>(x: Shared<'t, BinEntry<V>>, guard: &'t Guard) -> Shared<'t, BinEntry<V>> {
        if x.is_null() {
            return Shared::null();
        }
        unsafe { Self::get_tree_node(x) }
            .prev
            .load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub fn is_red(x: Shared<'_, BinEntry<V>>) -> bool {
        x.is_null() == false && unsafe { Self::get_tree_node(x) }.red.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_red(x: Shared<'_, BinEntry<V>>, red: bool) {
        if x.is_null() == false {
            unsafe { Self::get_tree_node(x) }
                .red
                .store(red, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_parent(x: Shared<'_, BinEntry<V>>, parent: Shared<'_, BinEntry<V>>) {
        if x.is_null() == false {
            unsafe { Self::get_tree_node(x) }
                .parent
                .store(parent, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_left(x: Shared<'_, BinEntry<V>>, left: Shared<'_, BinEntry<V>>) {
        if x.is_null() == false {
            unsafe { Self::get_tree_node(x) }
                .left
                .store(left, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn set_right(x: Shared<'_, BinEntry<V>>, right: Shared<'_, BinEntry<V>>) {
        if x.is_null() == false {
            unsafe { Self::get_tree_node(x) }
                .right
                .store(right, Ordering::SeqCst);
        }
    }
}
