//! Append-only concurrent linked list
//!
//! Supports pushing onto the front from any number of threads at once
//! and walking the chain while that happens. Individual links are never
//! removed. The only way to get rid of links is [ConcurrentList::clear],
//! which needs exclusive access (since there is no way of knowing
//! whether somebody is partway through a walk).

use std::{fmt::Debug, marker::PhantomData, ptr, sync::atomic::Ordering};

use tracing::Level;

use crate::{loom_testing::*, util::UsizePtr};

/// One link in the chain
struct ListNode<T> {
    payload: T,
    /// Only written before the node is published
    next: *const ListNode<T>,
}

pub struct ConcurrentList<T> {
    first: AtomicPtr<ListNode<T>>,
    /// We own boxed `ListNode<T>`s
    _p: PhantomData<Box<ListNode<T>>>,
}
// safety: payloads move between threads when pushed by one and dropped by another
unsafe impl<T: Send> Send for ConcurrentList<T> {}
// safety: shared access hands out &T to any thread and accepts T from any thread
unsafe impl<T: Send + Sync> Sync for ConcurrentList<T> {}

impl<T> Debug for ConcurrentList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentList")
            .field("@addr", &(self as *const _))
            .field("first", &self.first.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentList<T> {
    pub fn new() -> Self {
        Self {
            first: AtomicPtr::new(ptr::null_mut()),
            _p: PhantomData,
        }
    }

    /// Add a new item to the front of the list
    ///
    /// May have to retry many times under contention, but always succeeds eventually.
    pub fn push_front(&self, payload: T) {
        let node = Box::into_raw(Box::new(ListNode {
            payload,
            next: ptr::null(),
        }));

        // order: acquire isn't needed for correctness of the push itself,
        // but it means `next` is never older than what this thread already saw
        let mut old_first = self.first.load(Ordering::Acquire);
        loop {
            unsafe {
                // safety: node isn't visible to anybody else until the exchange succeeds
                (*node).next = old_first;
            }
            // order: release so that the payload and next pointer
            // happen-before any walk that observes this node
            match self.first.compare_exchange_weak(
                old_first,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old_first = x,
            }
        }

        tracing::event!(
            name: "list::push_front",
            Level::TRACE,
            node = ?UsizePtr::from(node),
        );
    }

    /// Walk the list from the front
    ///
    /// Whatever was at the front when this gets called is where the walk starts.
    /// Items pushed after that are not seen.
    pub fn iter(&self) -> Iter<'_, T> {
        // order: synchronizes-with the push that made this node the head,
        // and because every push is an RmW, with all earlier pushes as well
        Iter {
            cur: self.first.load(Ordering::Acquire),
            _p: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.load(Ordering::Acquire).is_null()
    }

    /// Remove (and drop) every item
    ///
    /// The list can be pushed onto again afterwards.
    pub fn clear(&mut self) {
        // order: we have &mut so nobody else can be touching this
        let mut node = self.first.load(Ordering::Relaxed);
        self.first.store(ptr::null_mut(), Ordering::Relaxed);

        while !node.is_null() {
            unsafe {
                // safety: every node came from Box::into_raw in push_front
                // and has been unlinked from the head so nothing else can reach it
                let boxed = Box::from_raw(node);
                node = boxed.next as *mut _;
            }
        }
    }
}

impl<T> Drop for ConcurrentList<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<'list, T> IntoIterator for &'list ConcurrentList<T> {
    type Item = &'list T;
    type IntoIter = Iter<'list, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [ConcurrentList], see [ConcurrentList::iter]
pub struct Iter<'list, T> {
    cur: *const ListNode<T>,
    _p: PhantomData<&'list ListNode<T>>,
}

impl<'list, T> Iterator for Iter<'list, T> {
    type Item = &'list T;

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            // safety: nodes reachable from the head stay alive until clear(),
            // which can't happen while this iterator borrows the list.
            // next is never written after the node is published
            let node = self.cur.as_ref()?;
            self.cur = node.next;
            Some(&node.payload)
        }
    }
}

impl<'list, T> Clone for Iter<'list, T> {
    fn clone(&self) -> Self {
        Self {
            cur: self.cur,
            _p: PhantomData,
        }
    }
}
