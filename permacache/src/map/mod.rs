//! Concurrent map implemented as an unbalanced binary search tree
//!
//! Supports lookups and insertions from any number of threads at once,
//! all without taking any locks. Does not support removal or rebalancing.
//! Nodes stay where they are until the entire map is dropped.
//!
//! Each node has its payload followed by trailing storage whose size is
//! decided by the payload type (usually to hold a copy of a variable-length key):
//!
//! ```text
//! +------+-------+-------+---------+----------------------+
//! | left | right | extra | payload | trailing (extra B)   |
//! +------+-------+-------+---------+----------------------+
//! ```
//!
//! Inserting walks down from the root until it finds an empty child slot
//! and then tries to CAS a new node into it. Losing that CAS means some other
//! thread just put a node exactly where we wanted to go, so the walk resumes
//! from *that* node (everything above it is still correct for our key).
//!
//! A single "last search" slot remembers the most recently found node,
//! which is a cheap win for code that keeps asking for the same key.
//! It is only a hint: racing updates can make it miss, never return a wrong node.

use std::{
    alloc::{self, Layout},
    cmp,
    fmt::{self, Debug},
    marker::PhantomData,
    mem::{align_of, offset_of, size_of},
    ops::Deref,
    ptr::{self, addr_of_mut, NonNull},
    slice,
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{loom_testing::*, util::roundto, util::UsizePtr};

/// Trailing storage always starts at least this aligned
const TRAILING_ALIGN: usize = align_of::<usize>();

/// Things that can be stored in a [ConcurrentMap]
pub trait MapEntry: Sized {
    /// What gets passed to [ConcurrentMap::find] and [ConcurrentMap::get_or_insert]
    type Key<'k>: ?Sized;

    /// Compare `key` against this entry
    ///
    /// `Less` means `key` sorts before this entry.
    /// Must be a consistent total order over every key ever used with the map.
    fn compare_with_key(&self, trailing: &[u8], key: &Self::Key<'_>) -> cmp::Ordering;

    /// Number of bytes of trailing storage to put after an entry created for `key`
    fn extra_allocation_size(key: &Self::Key<'_>) -> usize;

    /// Fill in the trailing storage of a new entry created for `key`
    ///
    /// `trailing` is exactly [Self::extra_allocation_size] bytes long, zeroed,
    /// and aligned to at least a pointer.
    fn init_trailing(_key: &Self::Key<'_>, _trailing: &mut [u8]) {}

    /// Summarize this entry as an integer when dumping the map
    fn key_value_for_dump(&self) -> u64;
}

#[repr(C)]
struct Node<E> {
    left: AtomicPtr<Node<E>>,
    right: AtomicPtr<Node<E>>,
    /// Number of bytes of trailing storage
    extra: usize,
    payload: E,
}

impl<E: MapEntry> Node<E> {
    const TRAILING_OFFSET: usize =
        roundto(offset_of!(Node<E>, payload) + size_of::<E>(), TRAILING_ALIGN);

    fn layout(extra: usize) -> Layout {
        let size = cmp::max(size_of::<Self>(), Self::TRAILING_OFFSET + extra);
        let align = cmp::max(align_of::<Self>(), TRAILING_ALIGN);
        match Layout::from_size_align(size, align) {
            Ok(x) => x.pad_to_align(),
            Err(_) => crate::fatal::fatal_error(format_args!(
                "map entry with {} trailing bytes is too large",
                extra
            )),
        }
    }

    /// Allocate and fully initialize a node for `key`
    ///
    /// Not visible to any other thread yet.
    fn alloc(key: &E::Key<'_>, payload: E) -> NonNull<Self> {
        let extra = E::extra_allocation_size(key);
        let layout = Self::layout(extra);
        // safety: layout is never zero-sized (it contains two pointers)
        let mem = unsafe { alloc::alloc_zeroed(layout) } as *mut Self;
        let Some(node) = NonNull::new(mem) else {
            alloc::handle_alloc_error(layout);
        };
        unsafe {
            // safety: fresh allocation of the right size, nobody else can see it
            let p = node.as_ptr();
            addr_of_mut!((*p).left).write(AtomicPtr::new(ptr::null_mut()));
            addr_of_mut!((*p).right).write(AtomicPtr::new(ptr::null_mut()));
            addr_of_mut!((*p).extra).write(extra);
            addr_of_mut!((*p).payload).write(payload);
            let trailing = slice::from_raw_parts_mut(
                (p as *mut u8).add(Self::TRAILING_OFFSET),
                extra,
            );
            E::init_trailing(key, trailing);
        }
        node
    }

    /// Drop the payload and give the memory back
    ///
    /// Does *NOT* touch the children. Nothing may reference the node afterwards.
    unsafe fn free(node: NonNull<Self>) {
        let layout = Self::layout((*node.as_ptr()).extra);
        ptr::drop_in_place(node.as_ptr());
        alloc::dealloc(node.as_ptr() as *mut u8, layout);
    }

    /// Trailing storage of a live node
    ///
    /// Derived from the node pointer (not a reference to the payload)
    /// so that it covers the whole allocation.
    unsafe fn trailing<'a>(node: NonNull<Self>) -> &'a [u8] {
        let p = node.as_ptr();
        slice::from_raw_parts((p as *const u8).add(Self::TRAILING_OFFSET), (*p).extra)
    }

    unsafe fn compare(node: NonNull<Self>, key: &E::Key<'_>) -> cmp::Ordering {
        (*node.as_ptr())
            .payload
            .compare_with_key(Self::trailing(node), key)
    }
}

/// Reference to an entry inside a [ConcurrentMap], valid as long as the map
pub struct EntryRef<'map, E> {
    node: NonNull<Node<E>>,
    _p: PhantomData<&'map E>,
}
// safety: this is just a &'map E plus a &'map [u8]
unsafe impl<'map, E: Sync> Send for EntryRef<'map, E> {}
unsafe impl<'map, E: Sync> Sync for EntryRef<'map, E> {}

impl<'map, E> Clone for EntryRef<'map, E> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'map, E> Copy for EntryRef<'map, E> {}

impl<'map, E: MapEntry> EntryRef<'map, E> {
    fn new(node: NonNull<Node<E>>) -> Self {
        Self {
            node,
            _p: PhantomData,
        }
    }

    /// The payload, with the full lifetime of the map
    pub fn get(self) -> &'map E {
        // safety: nodes live as long as the map and payloads are never mutated through the map
        unsafe { &(*self.node.as_ptr()).payload }
    }

    /// The trailing storage that was filled in by [MapEntry::init_trailing]
    pub fn trailing(self) -> &'map [u8] {
        // safety: nodes live as long as the map
        unsafe { Node::trailing(self.node) }
    }

    /// Whether both refer to the very same entry
    pub fn ptr_eq(this: Self, other: Self) -> bool {
        this.node == other.node
    }
}

impl<'map, E: MapEntry> Deref for EntryRef<'map, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<'map, E: MapEntry + Debug> Debug for EntryRef<'map, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("@node", &self.node)
            .field("payload", self.get())
            .field("trailing", &self.trailing())
            .finish()
    }
}

pub struct ConcurrentMap<E: MapEntry> {
    root: AtomicPtr<Node<E>>,
    /// Most recently found (or inserted) node
    last_search: AtomicPtr<Node<E>>,
    _p: PhantomData<Box<Node<E>>>,
}
// safety: entries get created on one thread, referenced from every thread,
// and dropped on whichever thread drops the map
unsafe impl<E: MapEntry + Send> Send for ConcurrentMap<E> {}
unsafe impl<E: MapEntry + Send + Sync> Sync for ConcurrentMap<E> {}

impl<E: MapEntry> Debug for ConcurrentMap<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("@addr", &(self as *const _))
            .field("root", &self.root.load(Ordering::Relaxed))
            .field("last_search", &self.last_search.load(Ordering::Relaxed))
            .finish()
    }
}

impl<E: MapEntry> Default for ConcurrentMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: MapEntry> ConcurrentMap<E> {
    pub fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            last_search: AtomicPtr::new(ptr::null_mut()),
            _p: PhantomData,
        }
    }

    /// Check whether the last search was for the same key
    #[inline]
    fn check_last_search(&self, key: &E::Key<'_>) -> Option<EntryRef<'_, E>> {
        // order: acquire to see the contents of the node that whoever stored it saw
        let last = NonNull::new(self.last_search.load(Ordering::Acquire))?;
        // safety: nodes stay alive as long as the map
        if unsafe { Node::compare(last, key) } == cmp::Ordering::Equal {
            Some(EntryRef::new(last))
        } else {
            None
        }
    }

    /// Look up `key`
    pub fn find(&self, key: &E::Key<'_>) -> Option<EntryRef<'_, E>> {
        if let Some(hit) = self.check_last_search(key) {
            return Some(hit);
        }

        // order: every edge load is acquire so that we see the
        // fully-initialized node that was published with release (in get_or_insert)
        let mut node = self.root.load(Ordering::Acquire);
        while let Some(n) = NonNull::new(node) {
            // safety: nodes stay alive as long as the map
            let edge = unsafe {
                match Node::compare(n, key) {
                    cmp::Ordering::Equal => {
                        self.last_search.store(node, Ordering::Release);
                        return Some(EntryRef::new(n));
                    }
                    cmp::Ordering::Less => &(*node).left,
                    cmp::Ordering::Greater => &(*node).right,
                }
            };
            node = edge.load(Ordering::Acquire);
        }

        None
    }

    /// Look up `key`, inserting a new entry built by `make` if it isn't there yet
    ///
    /// Returns the entry and whether it was newly inserted by this call.
    /// `make` is called at most once, and its result is dropped without ever
    /// becoming visible if another thread inserts the same key first.
    pub fn get_or_insert<F>(&self, key: &E::Key<'_>, make: F) -> (EntryRef<'_, E>, bool)
    where
        F: FnOnce() -> E,
    {
        if let Some(hit) = self.check_last_search(key) {
            return (hit, false);
        }

        let mut make = Some(make);
        // built at most once, carried down the tree across lost races
        let mut new_node: Option<NonNull<Node<E>>> = None;

        let mut edge = &self.root;
        let mut node = edge.load(Ordering::Acquire);
        loop {
            if let Some(n) = NonNull::new(node) {
                // safety: nodes stay alive as long as the map
                edge = unsafe {
                    match Node::compare(n, key) {
                        cmp::Ordering::Equal => {
                            if let Some(new_node) = new_node {
                                // safety: never published
                                Node::free(new_node);
                            }
                            self.last_search.store(node, Ordering::Release);
                            tracing::event!(
                                name: "map::get_or_insert",
                                Level::TRACE,
                                node = ?UsizePtr::from(node),
                                inserted = false,
                            );
                            return (EntryRef::new(n), false);
                        }
                        cmp::Ordering::Less => &(*node).left,
                        cmp::Ordering::Greater => &(*node).right,
                    }
                };
                node = edge.load(Ordering::Acquire);
                continue;
            }

            let new = match new_node {
                Some(x) => x,
                None => {
                    let Some(make) = make.take() else {
                        unreachable!()
                    };
                    *new_node.insert(Node::alloc(key, make()))
                }
            };

            // order: release publishes the node contents to whoever loads this edge,
            // acquire on failure so we can descend into the node that beat us
            match edge.compare_exchange(
                ptr::null_mut(),
                new.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.last_search.store(new.as_ptr(), Ordering::Release);
                    tracing::event!(
                        name: "map::get_or_insert",
                        Level::TRACE,
                        node = ?UsizePtr::from(new.as_ptr()),
                        inserted = true,
                    );
                    return (EntryRef::new(new), true);
                }
                Err(winner) => {
                    tracing::event!(
                        name: "map::lost_race",
                        Level::TRACE,
                        winner = ?UsizePtr::from(winner),
                    );
                    // carry on from the node that got here first
                    node = winner;
                }
            }
        }
    }

    /// Visit every entry
    ///
    /// Entries inserted while this runs may or may not be visited.
    pub fn for_each<'map>(&'map self, mut f: impl FnMut(EntryRef<'map, E>)) {
        let mut stack = vec![self.root.load(Ordering::Acquire)];
        while let Some(node) = stack.pop() {
            let Some(n) = NonNull::new(node) else {
                continue;
            };
            // safety: nodes stay alive as long as the map
            unsafe {
                stack.push((*node).right.load(Ordering::Acquire));
                stack.push((*node).left.load(Ordering::Acquire));
            }
            f(EntryRef::new(n));
        }
    }

    /// Number of entries (by walking the whole tree)
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.root.load(Ordering::Acquire).is_null()
    }

    /// Depth of the deepest node (0 for an empty map)
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(self.root.load(Ordering::Acquire), 1)];
        while let Some((node, depth)) = stack.pop() {
            if node.is_null() {
                continue;
            }
            max_depth = cmp::max(max_depth, depth);
            // safety: nodes stay alive as long as the map
            unsafe {
                stack.push(((*node).left.load(Ordering::Acquire), depth + 1));
                stack.push(((*node).right.load(Ordering::Acquire), depth + 1));
            }
        }
        max_depth
    }

    /// Render the tree in graphviz format
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "digraph g {{")?;
        writeln!(out, "graph [ rankdir = \"TB\"];")?;
        writeln!(out, "node  [ fontsize = \"16\" ];")?;
        writeln!(out, "edge  [ ];")?;

        let mut stack = vec![self.root.load(Ordering::Acquire)];
        while let Some(node) = stack.pop() {
            if node.is_null() {
                continue;
            }
            let name = UsizePtr::from(node);
            // safety: nodes stay alive as long as the map
            let (payload, left, right) = unsafe {
                (
                    &(*node).payload,
                    (*node).left.load(Ordering::Acquire),
                    (*node).right.load(Ordering::Acquire),
                )
            };
            writeln!(
                out,
                "\"{:?}\" [ label = \" {{<f0> {:016x} | {{<f1> | <f2>}}}}\" style=\"rounded\" shape=\"record\"];",
                name,
                payload.key_value_for_dump()
            )?;
            if !left.is_null() {
                writeln!(out, "\"{:?}\":f1 -> \"{:?}\":f0;", name, UsizePtr::from(left))?;
            }
            if !right.is_null() {
                writeln!(out, "\"{:?}\":f2 -> \"{:?}\":f0;", name, UsizePtr::from(right))?;
            }
            stack.push(right);
            stack.push(left);
        }

        writeln!(out, "}}")
    }
}

impl<E: MapEntry> Drop for ConcurrentMap<E> {
    fn drop(&mut self) {
        // order: we have &mut so nobody else can be touching this.
        // not recursive because nothing stops the tree from being a very long line
        let mut stack = vec![self.root.load(Ordering::Relaxed)];
        while let Some(node) = stack.pop() {
            let Some(n) = NonNull::new(node) else {
                continue;
            };
            unsafe {
                stack.push((*node).left.load(Ordering::Relaxed));
                stack.push((*node).right.load(Ordering::Relaxed));
                // safety: each node is reachable exactly once, and nothing
                // can still hold an EntryRef because we have &mut
                Node::free(n);
            }
        }
    }
}

#[cfg(test)]
mod tests;
