use std::{
    fmt,
    sync::atomic::{AtomicIsize, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::{
    config::{MapConfig, DEFAULT_CAPACITY},
    core::{
        bin_entry::{
            tree_bin::{copy_tree_nodes, untreeify, TreeBin, MIN_TREEIFY_CAPACITY, TREEIFY_THRESHOLD},
            tree_node::TreeNode,
            BinEntry, MOVED, RESERVED, TREEBIN,
        },
        counter::{Added, Counter},
        node::{spread, Node},
        table::Table,
    },
    error::MapError,
    iter::{Entries, Traverser},
    util::{ncpu, table_size_for, MAXIMUM_CAPACITY},
};

/// Smallest number of bins a resizing thread claims at once.
const MIN_TRANSFER_STRIDE: isize = 16;

/// Bits of `size_ctl` holding the generation stamp during a resize.
const RESIZE_STAMP_BITS: u32 = 16;

/// Shift placing the resize stamp in the high bits of `size_ctl`.
const RESIZE_STAMP_SHIFT: u32 = isize::BITS - RESIZE_STAMP_BITS;

/// Largest number of threads that can help resize.
const MAX_RESIZERS: isize = (1 << RESIZE_STAMP_SHIFT) - 1;

/// `size_ctl` once a new table could not be allocated. No count reaches it,
/// so the map stops growing.
const RESIZE_DISABLED: isize = isize::MAX;

/// A hash map from `i64` keys to values of type `V`, safe to share between
/// threads.
///
/// Lookups never block. Updates lock a single bin, and only after the bin
/// already has an entry; inserting into an empty bin is a single CAS. When
/// the map grows, every thread that runs into the resize helps move bins to
/// the new table rather than waiting for it. Bins that collect many entries
/// turn into red-black trees, so lookups stay logarithmic even for badly
/// distributed keys.
///
/// Operations that hand out values clone them. Store an `Arc<T>` to share
/// large values instead.
pub struct ConcurrentLongMap<V> {
    /// The array of bins. Lazily initialized upon first insertion.
    table: Atomic<Table<V>>,

    /// The next table to use; non-null only while resizing.
    next_table: Atomic<Table<V>>,

    /// The next table index (plus one) to split while resizing.
    transfer_index: AtomicIsize,

    counter: Counter,

    /// Table initialization and resizing control. When negative, the table
    /// is being initialized (-1) or resized (a stamp in the high bits, the
    /// number of active resizers plus one in the low bits). Otherwise, the
    /// size of the table to create once initialized, and afterwards the
    /// element count at which to grow the table next.
    size_ctl: AtomicIsize,
}

#[inline]
fn resize_stamp(n: usize) -> isize {
    n.leading_zeros() as isize | (1 << (RESIZE_STAMP_BITS - 1))
}

impl<V> ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    /// Creates an empty map with the default initial table size.
    pub fn new() -> Self {
        Self::with_table_size(0)
    }

    /// Creates an empty map that holds `capacity` entries without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_table_size(
            MapConfig::new()
                .initial_capacity(capacity)
                .table_size_unchecked(),
        )
    }

    /// Creates an empty map sized for `capacity` entries at the given
    /// density. The load factor only affects the initial table size.
    pub fn with_capacity_and_load_factor(capacity: usize, load_factor: f32) -> Result<Self, MapError> {
        Self::with_config(
            MapConfig::new()
                .initial_capacity(capacity)
                .load_factor(load_factor),
        )
    }

    pub fn with_config(config: MapConfig) -> Result<Self, MapError> {
        Ok(Self::with_table_size(config.table_size()?))
    }

    fn with_table_size(size: usize) -> Self {
        ConcurrentLongMap {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            counter: Counter::new(),
            size_ctl: AtomicIsize::new(size as isize),
        }
    }

    pub(crate) fn table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<V>> {
        self.table.load(Ordering::SeqCst, guard)
    }

    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: tables are only retired after being replaced, and we are pinned.
            if unsafe { table.as_ref() }.map_or(false, |t| t.is_empty() == false) {
                return table;
            }

            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // lost the initialization race; just spin
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let mut table = self.table.load(Ordering::SeqCst, guard);
                let mut sc = sc;
                if table.is_null() {
                    let n = if sc > 0 { sc as usize } else { DEFAULT_CAPACITY };
                    table = Owned::new(Table::new(n)).into_shared(guard);
                    self.table.store(table, Ordering::SeqCst);
                    sc = (n - (n >> 2)) as isize;
                }
                self.size_ctl.store(sc, Ordering::SeqCst);
                return table;
            }
        }
    }

    fn get_node<'g>(&'g self, key: i64, guard: &'g Guard) -> Option<&'g Node<V>> {
        let table = self.table.load(Ordering::SeqCst, guard);
        // safety: see `init_table`.
        let t = unsafe { table.as_ref() }?;
        if t.is_empty() {
            return None;
        }

        let hash = spread(key);
        let bin = t.bin(t.bini(hash), guard);
        // safety: bins are retired only once unlinked, and we are pinned.
        unsafe { bin.as_ref() }?.find(hash, key, guard)
    }

    /// Returns a reference to the value for `key`, valid for as long as
    /// `guard` is held.
    pub fn get_ref<'g>(&'g self, key: i64, guard: &'g Guard) -> Option<&'g V> {
        let node = self.get_node(key, guard)?;
        let value = node.value.load(Ordering::SeqCst, guard);
        // safety: a replaced value is retired, never freed in place.
        unsafe { value.as_ref() }
    }

    pub fn contains_key(&self, key: i64) -> bool {
        let guard = &crossbeam_epoch::pin();
        self.get_node(key, guard).is_some()
    }

    /// Maps `key` to `value`, returning a reference to the previous value.
    pub(crate) fn put_val<'g>(
        &'g self,
        key: i64,
        value: V,
        only_if_absent: bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let hash = spread(key);
        let value = Owned::new(value).into_shared(guard);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        let (old, bin_count) = loop {
            // safety: see `init_table`.
            let t = match unsafe { table.as_ref() } {
                Some(t) if t.is_empty() == false => t,
                _ => {
                    table = self.init_table(guard);
                    continue;
                }
            };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                let node = Owned::new(BinEntry::Node(Node::new(hash, key, value, Atomic::null())));
                match t.cas_bin(bini, bin, node, guard) {
                    Ok(_) => {
                        self.add_count(1, 0, guard);
                        return None;
                    }
                    // the rejected node does not own `value`
                    Err(changed) => drop(changed.new),
                }
                continue;
            }

            // safety: see `get_node`.
            let bin_deref = unsafe { bin.deref() };
            match *bin_deref {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                }
                BinEntry::Node(ref head) if only_if_absent && head.matches(hash, key) => {
                    // safety: `value` was never shared.
                    drop(unsafe { value.into_owned() });
                    let current = head.value.load(Ordering::SeqCst, guard);
                    return unsafe { current.as_ref() };
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut p = bin;
                    let old = loop {
                        let n = match unsafe { p.deref() }.as_node() {
                            Some(n) => n,
                            None => unreachable!("chains only hold nodes"),
                        };
                        if n.matches(hash, key) {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if only_if_absent {
                                drop(unsafe { value.into_owned() });
                            } else {
                                n.value.store(value, Ordering::SeqCst);
                                // safety: readers that saw `current` are pinned.
                                unsafe { guard.defer_destroy(current) };
                            }
                            break Some(current);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let node = Owned::new(BinEntry::Node(Node::new(hash, key, value, Atomic::null())));
                            n.next.store(node, Ordering::SeqCst);
                            break None;
                        }
                        p = next;
                        bin_count += 1;
                    };
                    drop(head_lock);
                    break (old, bin_count);
                }
                BinEntry::Tree(ref tree) => {
                    let tree_lock = tree.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let p = tree.put_tree_val(hash, key, value, guard);
                    let old = unsafe { p.as_ref() }.and_then(BinEntry::node).map(|n| {
                        let current = n.value.load(Ordering::SeqCst, guard);
                        if only_if_absent {
                            drop(unsafe { value.into_owned() });
                        } else {
                            n.value.store(value, Ordering::SeqCst);
                            unsafe { guard.defer_destroy(current) };
                        }
                        current
                    });
                    drop(tree_lock);
                    break (old, 2);
                }
                BinEntry::Reserved(ref lock) => {
                    // wait for the value being computed, then look again
                    drop(lock.lock());
                }
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            }
        };

        if bin_count >= TREEIFY_THRESHOLD {
            // safety: a table we inserted into stays alive while we are pinned.
            self.treeify_bin(unsafe { table.deref() }, spread(key), guard);
        }
        if let Some(old) = old {
            return unsafe { old.as_ref() };
        }
        self.add_count(1, bin_count as isize, guard);
        None
    }

    /// Replaces or removes the value of `key`, provided `observed` accepts the
    /// current one. `None` as `new_value` removes the entry. Returns the value
    /// that was replaced or removed.
    pub(crate) fn replace_node<'g, F>(
        &'g self,
        key: i64,
        mut new_value: Option<V>,
        observed: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: Fn(&V) -> bool,
    {
        let hash = spread(key);
        let removing = new_value.is_none();
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            let t = match unsafe { table.as_ref() } {
                Some(t) if t.is_empty() == false => t,
                _ => return None,
            };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            let mut old: Option<Shared<'g, V>> = None;
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let _head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut pred: Option<&Node<V>> = None;
                    let mut e = bin;
                    while let Some(n) = unsafe { e.as_ref() }.and_then(BinEntry::as_node) {
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.matches(hash, key) {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if observed(unsafe { current.deref() }) {
                                old = Some(current);
                                match new_value.take() {
                                    Some(value) => n.value.store(Owned::new(value), Ordering::SeqCst),
                                    None => {
                                        match pred {
                                            Some(pred) => pred.next.store(next, Ordering::SeqCst),
                                            None => t.store_bin(bini, next),
                                        }
                                        // safety: unlinked under the bin lock.
                                        unsafe { guard.defer_destroy(e) };
                                    }
                                }
                                unsafe { guard.defer_destroy(current) };
                            }
                            break;
                        }
                        pred = Some(n);
                        e = next;
                    }
                }
                BinEntry::Tree(ref tree) => {
                    let _tree_lock = tree.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree.root.load(Ordering::SeqCst, guard);
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    if let Some(n) = unsafe { p.as_ref() }.and_then(BinEntry::node) {
                        let current = n.value.load(Ordering::SeqCst, guard);
                        if observed(unsafe { current.deref() }) {
                            old = Some(current);
                            match new_value.take() {
                                Some(value) => n.value.store(Owned::new(value), Ordering::SeqCst),
                                None => {
                                    // safety: we hold the bin lock and `p` is in this tree.
                                    if unsafe { tree.remove_tree_node(p, guard) } {
                                        let first = tree.first.load(Ordering::SeqCst, guard);
                                        t.store_bin(bini, untreeify(first, |_| true, guard));
                                        unsafe {
                                            tree.retire_nodes(guard);
                                            guard.defer_destroy(bin);
                                        }
                                        #[cfg(feature = "tracing")]
                                        tracing::trace!(bin = bini, "tree bin turned back into a chain");
                                    }
                                }
                            }
                            unsafe { guard.defer_destroy(current) };
                        }
                    }
                }
                BinEntry::Reserved(ref lock) => {
                    drop(lock.lock());
                    continue;
                }
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            }

            let old = old?;
            if removing {
                self.add_count(-1, -1, guard);
            }
            // safety: retired above, but not before we unpin.
            return unsafe { old.as_ref() };
        }
    }

    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<V>>,
        next_table: *const Table<V>,
        guard: &'g Guard,
    ) -> Shared<'g, Table<V>> {
        if table.is_null() || next_table.is_null() {
            return table;
        }

        let next_table = Shared::from(next_table);
        // safety: table is only retired after being swapped out, which cannot
        // happen before we unpin.
        let rs = resize_stamp(unsafe { table.deref() }.len()) << RESIZE_STAMP_SHIFT;

        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc == rs + MAX_RESIZERS
                || sc == rs + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Adds `x` to the count. If `check` is non-negative, also starts or
    /// joins a resize once the count has reached `size_ctl`. `check` is the
    /// length of the chain just inserted into; counts from short chains skip
    /// the slow exact sum.
    fn add_count(&self, x: i64, check: isize, guard: &Guard) {
        let mut s = match self.counter.add(x, guard) {
            Added::Base(s) => s,
            Added::Cell => {
                if check <= 1 {
                    return;
                }
                self.counter.sum(guard)
            }
            Added::Contended => return,
        };

        if check < 0 {
            return;
        }

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if s < sc as i64 {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            let n = match unsafe { table.as_ref() } {
                Some(t) => t.len(),
                None => break,
            };
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                let next_table = self.next_table.load(Ordering::SeqCst, guard);
                if sc == rs + MAX_RESIZERS
                    || sc == rs + 1
                    || next_table.is_null()
                    || self.transfer_index.load(Ordering::SeqCst) <= 0
                {
                    break;
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.transfer(table, next_table, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard);
            }

            s = self.counter.sum(guard);
        }
    }

    /// Grows the table so that `size` entries fit without further resizing.
    fn try_presize(&self, size: usize, guard: &Guard) {
        let c = if size >= MAXIMUM_CAPACITY >> 1 {
            MAXIMUM_CAPACITY
        } else {
            table_size_for(size + (size >> 1) + 1)
        };

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            match unsafe { table.as_ref() } {
                Some(t) if t.is_empty() == false => {
                    let n = t.len();
                    if c as isize <= sc || n >= MAXIMUM_CAPACITY {
                        break;
                    }
                    if table == self.table.load(Ordering::SeqCst, guard) {
                        let rs = resize_stamp(n) << RESIZE_STAMP_SHIFT;
                        if self
                            .size_ctl
                            .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                            .is_ok()
                        {
                            self.transfer(table, Shared::null(), guard);
                        }
                    }
                }
                _ => {
                    let n = (sc as usize).max(c).min(MAXIMUM_CAPACITY);
                    if self
                        .size_ctl
                        .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        let mut sc = sc;
                        if self.table.load(Ordering::SeqCst, guard) == table {
                            self.table.store(Owned::new(Table::new(n)), Ordering::SeqCst);
                            sc = (n - (n >> 2)) as isize;
                        }
                        self.size_ctl.store(sc, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    /// Moves the bins of `table` into `next_table`, allocating the latter if
    /// the caller is the one starting the resize.
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<V>>,
        mut next_table: Shared<'g, Table<V>>,
        guard: &'g Guard,
    ) {
        // safety: the table being resized is only retired by the last thread
        // finishing this very transfer.
        let t = unsafe { table.deref() };
        let n = t.len();

        let ncpu = ncpu();
        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = (stride as isize).max(MIN_TRANSFER_STRIDE);

        if next_table.is_null() {
            let fresh = match Table::try_new(n << 1) {
                Ok(fresh) => fresh,
                Err(_error) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        bins = n << 1,
                        error = %_error,
                        "could not allocate a larger table, the map will stop growing"
                    );
                    self.size_ctl.store(RESIZE_DISABLED, Ordering::SeqCst);
                    return;
                }
            };

            next_table = Owned::new(fresh).into_shared(guard);
            t.set_forwarding(next_table, guard);
            let now_garbage = self.next_table.swap(next_table, Ordering::SeqCst, guard);
            debug_assert!(now_garbage.is_null());
            self.transfer_index.store(n as isize, Ordering::SeqCst);

            #[cfg(feature = "tracing")]
            tracing::debug!(from = n, to = n << 1, "resize started");
        }

        // safety: only swapped out by the thread completing this transfer.
        let nt = unsafe { next_table.deref() };
        let next_n = nt.len();
        let fwd = t.forwarding(guard);

        let mut advance = true;
        let mut finishing = false;
        let mut i: isize = 0;
        let mut bound: isize = 0;

        loop {
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index - 1;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                if finishing {
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
                    // safety: the old table is no longer reachable from the map.
                    unsafe { guard.defer_destroy(now_garbage) };
                    self.size_ctl
                        .store(((n << 1) - (n >> 1)) as isize, Ordering::SeqCst);

                    #[cfg(feature = "tracing")]
                    tracing::debug!(bins = n << 1, "resize finished");
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if (sc - 2) != resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        return;
                    }

                    // we are the last resizer; recheck every bin before committing
                    finishing = true;
                    advance = true;
                    i = n as isize;
                }
                continue;
            }

            let i = i as usize;
            let bin = t.bin(i, guard);
            if bin.is_null() {
                advance = t.cas_bin(i, Shared::null(), fwd, guard).is_ok();
                continue;
            }

            // safety: bins are retired only after being replaced, and we are pinned.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(_) => {
                    // already processed
                    advance = true;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(i, guard) != bin {
                        continue;
                    }

                    // the tail that stays together in one of the new bins can be reused as is
                    let mut run_bit = head.hash as usize & n;
                    let mut last_run = bin;
                    let mut p = head.next.load(Ordering::SeqCst, guard);
                    while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::as_node) {
                        let b = node.hash as usize & n;
                        if b != run_bit {
                            run_bit = b;
                            last_run = p;
                        }
                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    let (mut low_bin, mut high_bin) = if run_bit == 0 {
                        (last_run, Shared::null())
                    } else {
                        (Shared::null(), last_run)
                    };

                    let mut p = bin;
                    while p != last_run {
                        let node = match unsafe { p.deref() }.as_node() {
                            Some(node) => node,
                            None => unreachable!("chains only hold nodes"),
                        };
                        let link = if node.hash as usize & n == 0 {
                            &mut low_bin
                        } else {
                            &mut high_bin
                        };
                        *link = Owned::new(BinEntry::Node(Node::new(
                            node.hash,
                            node.key,
                            node.value.load(Ordering::SeqCst, guard),
                            Atomic::from(*link),
                        )))
                        .into_shared(guard);
                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    nt.store_bin(i, low_bin);
                    nt.store_bin(i + n, high_bin);
                    t.store_bin(i, fwd);

                    // the nodes before `last_run` were copied; their values live on in the copies
                    let mut p = bin;
                    while p != last_run {
                        let next = match unsafe { p.deref() }.as_node() {
                            Some(node) => node.next.load(Ordering::SeqCst, guard),
                            None => unreachable!("chains only hold nodes"),
                        };
                        // safety: unlinked from the old table, and not reachable from the new one.
                        unsafe { guard.defer_destroy(p) };
                        p = next;
                    }

                    drop(head_lock);
                    advance = true;
                }
                BinEntry::Tree(ref tree) => {
                    let tree_lock = tree.lock.lock();
                    if t.bin(i, guard) != bin {
                        continue;
                    }

                    let (low_bin, high_bin) = tree.split(bin, n, guard);
                    nt.store_bin(i, low_bin);
                    nt.store_bin(i + n, high_bin);
                    t.store_bin(i, fwd);

                    if low_bin != bin && high_bin != bin {
                        // safety: the tree was copied and is no longer reachable.
                        unsafe {
                            tree.retire_nodes(guard);
                            guard.defer_destroy(bin);
                        }
                    }

                    drop(tree_lock);
                    advance = true;
                }
                BinEntry::Reserved(ref lock) => {
                    // wait until the reservation is resolved, then look at the bin again
                    drop(lock.lock());
                }
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            }
        }
    }

    /// Turns the chain in the bin for `hash` into a tree, or grows the table
    /// instead while it is small.
    fn treeify_bin<'g>(&'g self, t: &'g Table<V>, hash: i32, guard: &'g Guard) {
        let n = t.len();
        if n < MIN_TREEIFY_CAPACITY {
            self.try_presize(n << 1, guard);
            return;
        }

        let index = t.bini(hash);
        let bin = t.bin(index, guard);
        if let Some(BinEntry::Node(head)) = unsafe { bin.as_ref() } {
            let _head_lock = head.lock.lock();
            if t.bin(index, guard) != bin {
                return;
            }

            let list = copy_tree_nodes(bin, |_| true, guard);
            t.store_bin(index, Owned::new(BinEntry::Tree(TreeBin::new(list, guard))));

            let mut p = bin;
            while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::as_node) {
                let next = node.next.load(Ordering::SeqCst, guard);
                // safety: replaced by the tree, which shares only the values.
                unsafe { guard.defer_destroy(p) };
                p = next;
            }

            #[cfg(feature = "tracing")]
            tracing::trace!(bin = index, "chain turned into a tree");
        }
    }

    /// Maps `key` to `value`. Returns the previous value, if any.
    pub fn put(&self, key: i64, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.put_val(key, value, false, guard).cloned()
    }

    /// Maps `key` to `value` unless the key is already present. Returns the
    /// value already there, in which case the map is left unchanged.
    pub fn put_if_absent(&self, key: i64, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.put_val(key, value, true, guard).cloned()
    }

    pub fn get(&self, key: i64) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.get_ref(key, guard).cloned()
    }

    /// Returns the value for `key`, or `default` when absent. Does not
    /// insert anything.
    pub fn get_or_default(&self, key: i64, default: V) -> V
    where
        V: Clone,
    {
        self.get(key).unwrap_or(default)
    }

    /// Removes `key` from the map, returning its value.
    pub fn remove(&self, key: i64) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, None, |_| true, guard).cloned()
    }

    /// Removes `key` only if it currently maps to `expected`.
    pub fn remove_if(&self, key: i64, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, None, |current| current == expected, guard)
            .is_some()
    }

    /// Replaces the value of `key` only if the key is present. Returns the
    /// previous value.
    pub fn replace(&self, key: i64, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, Some(value), |_| true, guard).cloned()
    }

    /// Replaces the value of `key` only if it currently maps to `expected`.
    pub fn replace_if(&self, key: i64, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        self.replace_node(key, Some(value), |current| current == expected, guard)
            .is_some()
    }

    /// Returns the value of `key`, first inserting the result of `f` if the
    /// key is absent. `f` runs at most once, under the lock of the key's bin:
    /// it must be short and must not touch this map.
    pub fn compute_if_absent<F>(&self, key: i64, f: F) -> V
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = spread(key);
        let mut f = Some(f);
        let mut compute = || match f.take() {
            Some(f) => f(),
            None => unreachable!("the value is computed at most once"),
        };

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let (value, added, bin_count) = loop {
            let t = match unsafe { table.as_ref() } {
                Some(t) if t.is_empty() == false => t,
                _ => {
                    table = self.init_table(guard);
                    continue;
                }
            };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                let reservation = Owned::new(BinEntry::Reserved(Mutex::new(()))).into_shared(guard);
                let held = match unsafe { reservation.deref() } {
                    BinEntry::Reserved(lock) => lock.lock(),
                    _ => unreachable!(),
                };

                if t.cas_bin(bini, Shared::null(), reservation, guard).is_err() {
                    drop(held);
                    // safety: the reservation was never published.
                    drop(unsafe { reservation.into_owned() });
                    continue;
                }

                let placeholder = Reservation {
                    table: t,
                    index: bini,
                    entry: reservation,
                    guard,
                };
                let value = Owned::new(compute()).into_shared(guard);
                t.store_bin(
                    bini,
                    Owned::new(BinEntry::Node(Node::new(hash, key, value, Atomic::null()))),
                );
                drop(placeholder);
                drop(held);
                break (value, true, 1);
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                }
                BinEntry::Node(ref head) if head.matches(hash, key) => {
                    break (head.value.load(Ordering::SeqCst, guard), false, 0);
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut p = bin;
                    let found = loop {
                        let n = match unsafe { p.deref() }.as_node() {
                            Some(n) => n,
                            None => unreachable!("chains only hold nodes"),
                        };
                        if n.matches(hash, key) {
                            break (n.value.load(Ordering::SeqCst, guard), false);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let value = Owned::new(compute()).into_shared(guard);
                            let node = Owned::new(BinEntry::Node(Node::new(hash, key, value, Atomic::null())));
                            n.next.store(node, Ordering::SeqCst);
                            break (value, true);
                        }
                        p = next;
                        bin_count += 1;
                    };
                    drop(head_lock);
                    break (found.0, found.1, bin_count);
                }
                BinEntry::Tree(ref tree) => {
                    let tree_lock = tree.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree.root.load(Ordering::SeqCst, guard);
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    let found = match unsafe { p.as_ref() }.and_then(BinEntry::node) {
                        Some(n) => (n.value.load(Ordering::SeqCst, guard), false),
                        None => {
                            let value = Owned::new(compute()).into_shared(guard);
                            tree.put_tree_val(hash, key, value, guard);
                            (value, true)
                        }
                    };
                    drop(tree_lock);
                    break (found.0, found.1, 2);
                }
                BinEntry::Reserved(ref lock) => {
                    drop(lock.lock());
                }
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            }
        };

        // safety: values of live or retired nodes outlive our guard.
        let result = match unsafe { value.as_ref() } {
            Some(value) => value.clone(),
            None => unreachable!("stored values are never null"),
        };

        if bin_count >= TREEIFY_THRESHOLD {
            self.treeify_bin(unsafe { table.deref() }, hash, guard);
        }
        if added {
            self.add_count(1, bin_count as isize, guard);
        }
        result
    }

    /// Removes every entry. Entries inserted concurrently may survive.
    pub fn clear(&self) {
        let guard = &crossbeam_epoch::pin();
        let mut delta = 0;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut i = 0;

        while let Some(t) = unsafe { table.as_ref() } {
            if i >= t.len() {
                break;
            }

            let bin = t.bin(i, guard);
            if bin.is_null() {
                i += 1;
                continue;
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = self.help_transfer(table, next_table, guard);
                    i = 0;
                }
                BinEntry::Node(ref head) => {
                    let _head_lock = head.lock.lock();
                    if t.bin(i, guard) != bin {
                        continue;
                    }

                    t.store_bin(i, Shared::null());
                    let mut p = bin;
                    while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::as_node) {
                        let next = node.next.load(Ordering::SeqCst, guard);
                        // safety: the chain was unlinked as a whole.
                        unsafe {
                            guard.defer_destroy(node.value.load(Ordering::SeqCst, guard));
                            guard.defer_destroy(p);
                        }
                        delta -= 1;
                        p = next;
                    }
                    i += 1;
                }
                BinEntry::Tree(ref tree) => {
                    let _tree_lock = tree.lock.lock();
                    if t.bin(i, guard) != bin {
                        continue;
                    }

                    t.store_bin(i, Shared::null());
                    let mut p = tree.first.load(Ordering::SeqCst, guard);
                    while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::node) {
                        unsafe { guard.defer_destroy(node.value.load(Ordering::SeqCst, guard)) };
                        delta -= 1;
                        p = node.next.load(Ordering::SeqCst, guard);
                    }
                    // safety: the tree was unlinked as a whole.
                    unsafe {
                        tree.retire_nodes(guard);
                        guard.defer_destroy(bin);
                    }
                    i += 1;
                }
                BinEntry::Reserved(ref lock) => {
                    drop(lock.lock());
                }
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            }
        }

        if delta != 0 {
            self.add_count(delta, -1, guard);
        }
    }

    /// Grows the table ahead of time so that `additional` more entries fit.
    pub fn reserve(&self, additional: usize) {
        let guard = &crossbeam_epoch::pin();
        self.try_presize(self.size().saturating_add(additional), guard);
    }

    /// Number of entries. Only an estimate while updates are in flight.
    pub fn size(&self) -> usize {
        usize::try_from(self.mapping_count().max(0)).unwrap_or(usize::MAX)
    }

    /// Alias of [`size`](Self::size).
    pub fn len(&self) -> usize {
        self.size()
    }

    /// The raw sum of the counter. Removals racing ahead of the matching
    /// insertions in the count can briefly make it negative.
    pub fn mapping_count(&self) -> i64 {
        let guard = &crossbeam_epoch::pin();
        self.counter.sum(guard)
    }

    pub fn is_empty(&self) -> bool {
        self.mapping_count() <= 0
    }

    fn nodes<'g>(&'g self, guard: &'g Guard) -> impl Iterator<Item = &'g Node<V>> + 'g {
        let mut traverser = Traverser::new(self.table.load(Ordering::SeqCst, guard));
        // safety: every call passes the guard the table was loaded under.
        std::iter::from_fn(move || unsafe { traverser.advance(guard) })
    }

    /// Snapshot of the keys, taken with a single traversal.
    pub fn keys(&self) -> Vec<i64> {
        let guard = &crossbeam_epoch::pin();
        self.nodes(guard).map(|node| node.key).collect()
    }

    /// Snapshot of the values, taken with a single traversal.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        self.nodes(guard)
            .filter_map(|node| unsafe { node.value.load(Ordering::SeqCst, guard).as_ref() }.cloned())
            .collect()
    }

    /// Whether some key maps to `value`. Walks the whole map.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = crossbeam_epoch::pin();
        let found = self
            .nodes(&guard)
            .any(|node| unsafe { node.value.load(Ordering::SeqCst, &guard).as_ref() } == Some(value));
        found
    }

    /// Weakly consistent iterator over the entries.
    pub fn entries(&self) -> Entries<'_, V> {
        Entries::new(self)
    }

    /// Checks the current table: every entry sits in the bin its hash
    /// selects, and every tree bin has intact red-black and list structure.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> bool {
        let guard = &crossbeam_epoch::pin();
        let table = self.table.load(Ordering::SeqCst, guard);
        let t = match unsafe { table.as_ref() } {
            Some(t) => t,
            None => return true,
        };

        (0..t.len()).all(|i| {
            let bin = t.bin(i, guard);
            let entry = match unsafe { bin.as_ref() } {
                Some(entry) => entry,
                None => return true,
            };
            match entry.hash() {
                MOVED | RESERVED => true,
                TREEBIN => entry.as_tree_bin().map_or(false, |tree| {
                    tree.check_invariants(guard) && placed_in(t, i, tree.first.load(Ordering::SeqCst, guard), guard)
                }),
                _ => placed_in(t, i, bin, guard),
            }
        })
    }

    /// Number of bins of the current table, zero before the first insert.
    #[doc(hidden)]
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();
        unsafe { self.table.load(Ordering::SeqCst, guard).as_ref() }.map_or(0, Table::len)
    }

    /// Whether the bin holding `key` is a tree.
    #[doc(hidden)]
    pub fn is_treeified(&self, key: i64) -> bool {
        let guard = &crossbeam_epoch::pin();
        let table = self.table.load(Ordering::SeqCst, guard);
        unsafe { table.as_ref() }.map_or(false, |t| {
            let bin = t.bin(t.bini(spread(key)), guard);
            matches!(unsafe { bin.as_ref() }, Some(BinEntry::Tree(_)))
        })
    }

    pub(crate) fn presize_for(&self, additional: usize, guard: &Guard) {
        if additional > 0 {
            self.try_presize(additional, guard);
        }
    }
}

/// Whether every node on the list starting at `p` belongs in bin `i`.
fn placed_in<'g, V>(t: &Table<V>, i: usize, mut p: Shared<'g, BinEntry<V>>, guard: &'g Guard) -> bool {
    while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::node) {
        if node.hash < 0 || t.bini(node.hash) != i {
            return false;
        }
        p = node.next.load(Ordering::SeqCst, guard);
    }
    true
}

/// An empty bin claimed by `compute_if_absent`. Dropping it, normally or
/// while unwinding out of the value computation, retires the placeholder
/// and empties the bin if nothing replaced it.
struct Reservation<'g, V> {
    table: &'g Table<V>,
    index: usize,
    entry: Shared<'g, BinEntry<V>>,
    guard: &'g Guard,
}

impl<V> Drop for Reservation<'_, V> {
    fn drop(&mut self) {
        if self.table.bin(self.index, self.guard) == self.entry {
            self.table.store_bin(self.index, Shared::null());
        }
        // safety: the placeholder is no longer in the table.
        unsafe { self.guard.defer_destroy(self.entry) };
    }
}

impl<V> Default for ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for ConcurrentLongMap<V> {
    fn drop(&mut self) {
        // safety: we have `&mut self`, and every reference handed out is tied
        // to a borrow of the map.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        debug_assert!(self.next_table.load(Ordering::SeqCst, guard).is_null());
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if table.is_null() {
            return;
        }

        let mut table = unsafe { table.into_owned() }.into_box();
        table.drop_bins();
    }
}

impl<V> fmt::Debug for ConcurrentLongMap<V>
where
    V: Send + Sync + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = &crossbeam_epoch::pin();
        let mut map = f.debug_map();
        for node in self.nodes(guard) {
            if let Some(value) = unsafe { node.value.load(Ordering::SeqCst, guard).as_ref() } {
                map.entry(&node.key, value);
            }
        }
        map.finish()
    }
}

impl<V> Extend<(i64, V)> for &ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    fn extend<I: IntoIterator<Item = (i64, V)>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        let guard = &crossbeam_epoch::pin();
        self.presize_for(iter.size_hint().0, guard);
        for (key, value) in iter {
            self.put_val(key, value, false, guard);
        }
    }
}

impl<V> FromIterator<(i64, V)> for ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    fn from_iter<I: IntoIterator<Item = (i64, V)>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let map = ConcurrentLongMap::with_capacity(iter.size_hint().0);
        (&map).extend(iter);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_stamp_is_negative_when_shifted() {
        for shift in 4..30 {
            let rs = resize_stamp(1 << shift) << RESIZE_STAMP_SHIFT;
            assert!(rs < 0);
            assert!(rs + 2 < 0);
            assert_ne!(resize_stamp(1 << shift), resize_stamp(1 << (shift + 1)));
        }
    }

    #[test]
    fn lazy_table_initialization() {
        let map = ConcurrentLongMap::<u32>::new();
        assert_eq!(map.capacity(), 0);
        assert_eq!(map.get(1), None);
        map.put(1, 1);
        assert_eq!(map.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn with_capacity_sizes_first_table() {
        let map = ConcurrentLongMap::<u32>::with_capacity(100);
        map.put(0, 0);
        // 1 + 100 / 0.75 = 134
        assert_eq!(map.capacity(), 256);
    }

    #[test]
    fn grows_at_three_quarters() {
        let map = ConcurrentLongMap::<i64>::new();
        for key in 0..11 {
            map.put(key, key);
        }
        assert_eq!(map.capacity(), 16);
        map.put(11, 11);
        assert_eq!(map.capacity(), 32);
        assert!((0..12).all(|key| map.get(key) == Some(key)));
    }

    #[test]
    fn disabled_resize_keeps_serving() {
        let map = ConcurrentLongMap::<i64>::new();
        map.put(0, 0);
        map.size_ctl.store(RESIZE_DISABLED, Ordering::SeqCst);
        for key in 1..200 {
            map.put(key, key);
        }
        assert_eq!(map.capacity(), 16);
        assert_eq!(map.size(), 200);
        assert!((0..200).all(|key| map.get(key) == Some(key)));
        assert!(map.check_invariants());
    }

    #[test]
    fn failed_table_allocation_stops_growth() {
        let map = ConcurrentLongMap::<i64>::new();
        for key in 0..11 {
            map.put(key, key);
        }
        crate::core::table::fail_allocations(true);
        map.put(11, 11);
        crate::core::table::fail_allocations(false);

        assert_eq!(map.size_ctl.load(Ordering::SeqCst), RESIZE_DISABLED);
        assert!(map.next_table.load(Ordering::SeqCst, &crossbeam_epoch::pin()).is_null());
        assert_eq!(map.capacity(), 16);
        for key in 12..100 {
            map.put(key, key);
        }
        assert_eq!(map.capacity(), 16);
        assert_eq!(map.size(), 100);
        assert!((0..100).all(|key| map.get(key) == Some(key)));
        assert!(map.check_invariants());
    }

    #[test]
    fn small_table_grows_instead_of_treeifying() {
        let map = ConcurrentLongMap::<i64>::new();
        // all of these land in bin 0 of a 16-bin table
        for i in 0..9 {
            map.put(i << 4, i);
        }
        assert!(map.capacity() > 16);
        assert!(map.is_treeified(0) == false);
    }

    #[test]
    fn reserve_grows_ahead() {
        let map = ConcurrentLongMap::<i64>::new();
        map.put(0, 0);
        map.reserve(1000);
        assert!(map.capacity() >= 1024);
        assert_eq!(map.get(0), Some(0));
    }

    #[test]
    fn compute_if_absent_unwinding_frees_the_bin() {
        let map = ConcurrentLongMap::<i64>::new();
        map.put(100, 100);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.compute_if_absent(1, || panic!("no value"))
        }));
        assert!(result.is_err());
        assert_eq!(map.get(1), None);
        assert_eq!(map.put(1, 1), None);
        assert_eq!(map.get(1), Some(1));
    }
}
