use std::{fmt, ptr, sync::atomic::Ordering};

use crossbeam_epoch::{Guard, Shared};

use crate::{
    core::{bin_entry::BinEntry, node::Node, table::Table},
    map::ConcurrentLongMap,
};

/// A table the traverser left to follow a forwarding entry, and where to
/// resume in it.
#[derive(Debug)]
struct TableStack<V> {
    table: *const Table<V>,
    length: usize,
    index: usize,
}

/// Walks every bin of a table, following forwarding entries into the next
/// table and coming back once the forwarded range is done.
///
/// Every entry present for the whole walk is returned at least once. Entries
/// added or removed meanwhile may or may not be.
#[derive(Debug)]
pub(crate) struct Traverser<V> {
    table: *const Table<V>,
    next: *const BinEntry<V>,
    stack: Vec<TableStack<V>>,
    index: usize,
    base_index: usize,
    base_limit: usize,
    base_size: usize,
}

impl<V> Traverser<V> {
    pub(crate) fn new(table: Shared<'_, Table<V>>) -> Self {
        let size = unsafe { table.as_ref() }.map_or(0, Table::len);
        Traverser {
            table: table.as_raw(),
            next: ptr::null(),
            stack: Vec::new(),
            index: 0,
            base_index: 0,
            base_limit: size,
            base_size: size,
        }
    }

    /// Returns the next node.
    ///
    /// # Safety
    ///
    /// `table` was loaded under `guard`, and every call passes that same
    /// guard.
    pub(crate) unsafe fn advance<'g>(&mut self, guard: &'g Guard) -> Option<&'g Node<V>> {
        let mut e: *const BinEntry<V> = ptr::null();
        if let Some(prev) = self.next.as_ref().and_then(BinEntry::node) {
            e = prev.next.load(Ordering::SeqCst, guard).as_raw();
        }

        loop {
            if let Some(entry) = e.as_ref() {
                self.next = e;
                return entry.node();
            }

            let t = match self.table.as_ref() {
                Some(t) if self.base_index < self.base_limit && self.index < t.len() => t,
                _ => {
                    self.next = ptr::null();
                    return None;
                }
            };
            let (i, n) = (self.index, t.len());

            let bin = t.bin(i, guard);
            match bin.as_ref() {
                Some(BinEntry::Moved(next_table)) => {
                    self.stack.push(TableStack {
                        table: self.table,
                        length: n,
                        index: i,
                    });
                    self.table = *next_table;
                    continue;
                }
                Some(BinEntry::Node(_)) => e = bin.as_raw(),
                Some(BinEntry::Tree(tree)) => e = tree.first.load(Ordering::SeqCst, guard).as_raw(),
                Some(BinEntry::Reserved(_)) | None => {}
                Some(BinEntry::TreeNode(_)) => unreachable!("a tree node is never a bin head"),
            }

            if self.stack.is_empty() {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            } else {
                self.recover_state(n);
            }
        }
    }

    fn recover_state(&mut self, mut n: usize) {
        while let Some(s) = self.stack.last() {
            self.index += s.length;
            if self.index < n {
                return;
            }
            n = s.length;
            self.index = s.index;
            self.table = s.table;
            self.stack.pop();
        }

        self.index += self.base_size;
        if self.index >= n {
            self.base_index += 1;
            self.index = self.base_index;
        }
    }
}

/// Weakly consistent iterator over the entries of a map.
///
/// Created by [`ConcurrentLongMap::entries`]. It never blocks writers and
/// never fails, but may or may not reflect changes made while it runs. It
/// keeps the current thread pinned until dropped, which holds back the
/// reclamation of removed entries.
pub struct Entries<'m, V> {
    map: &'m ConcurrentLongMap<V>,
    traverser: Traverser<V>,
    last_key: Option<i64>,
    guard: Guard,
}

impl<'m, V> Entries<'m, V>
where
    V: Send + Sync,
{
    pub(crate) fn new(map: &'m ConcurrentLongMap<V>) -> Self {
        let guard = crossbeam_epoch::pin();
        let traverser = Traverser::new(map.table(&guard));
        Entries {
            map,
            traverser,
            last_key: None,
            guard,
        }
    }

    /// Removes the key last returned by `next` from the map, going through
    /// the regular locked removal path. Returns the removed value, or `None`
    /// if nothing was returned yet, the key was already removed by this
    /// method, or someone else removed it in the meantime.
    pub fn remove(&mut self) -> Option<V>
    where
        V: Clone,
    {
        let key = self.last_key.take()?;
        self.map
            .replace_node(key, None, |_| true, &self.guard)
            .cloned()
    }
}

impl<'m, V> Iterator for Entries<'m, V>
where
    V: Clone,
{
    type Item = (i64, V);

    fn next(&mut self) -> Option<Self::Item> {
        // safety: the traverser was created under `self.guard`.
        let node = unsafe { self.traverser.advance(&self.guard) }?;
        let value = node.value.load(Ordering::SeqCst, &self.guard);
        // safety: values of reachable nodes are live while we are pinned.
        let value = unsafe { value.as_ref() }?.clone();
        self.last_key = Some(node.key);
        Some((node.key, value))
    }
}

impl<'m, V> fmt::Debug for Entries<'m, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entries")
            .field("last_key", &self.last_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{Atomic, Owned};

    fn node(key: i64) -> Owned<BinEntry<i64>> {
        Owned::new(BinEntry::Node(Node::new(key as i32, key, Atomic::new(key), Atomic::null())))
    }

    fn keys(table: Shared<'_, Table<i64>>, guard: &Guard) -> Vec<i64> {
        let mut traverser = Traverser::new(table);
        let mut keys = Vec::new();
        while let Some(node) = unsafe { traverser.advance(guard) } {
            keys.push(node.key);
        }
        keys.sort_unstable();
        keys
    }

    #[test]
    fn empty_and_null_tables() {
        let guard = &crossbeam_epoch::pin();
        assert!(keys(Shared::null(), guard).is_empty());
        let table = Owned::new(Table::<i64>::new(16)).into_shared(guard);
        assert!(keys(table, guard).is_empty());
        drop(unsafe { table.into_owned() });
    }

    #[test]
    fn visits_chains() {
        let guard = &crossbeam_epoch::pin();
        let table = Owned::new(Table::<i64>::new(4)).into_shared(guard);
        let t = unsafe { table.deref() };
        let head = node(1);
        head.as_node().unwrap().next.store(node(5), Ordering::SeqCst);
        t.store_bin(1, head);
        t.store_bin(3, node(3));
        assert_eq!(keys(table, guard), vec![1, 3, 5]);

        let mut owned = unsafe { table.into_owned() };
        owned.drop_bins();
    }

    #[test]
    fn follows_forwarding_entries() {
        let guard = &crossbeam_epoch::pin();
        let old = Owned::new(Table::<i64>::new(2)).into_shared(guard);
        let new = Owned::new(Table::<i64>::new(4)).into_shared(guard);
        let (o, n) = unsafe { (old.deref(), new.deref()) };
        o.set_forwarding(new, guard);

        // bin 0 has moved to bins 0 and 2, bin 1 has not moved yet
        n.store_bin(0, node(0));
        n.store_bin(2, node(2));
        o.store_bin(0, o.forwarding(guard));
        o.store_bin(1, node(1));
        assert_eq!(keys(old, guard), vec![0, 1, 2]);

        unsafe {
            let mut old = old.into_owned();
            old.drop_bins();
            let mut new = new.into_owned();
            new.drop_bins();
        }
    }
}
