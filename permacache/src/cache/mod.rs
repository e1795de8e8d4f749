//! Single-flight cache of values that live forever
//!
//! Maps a key (a short list of word-sized identifiers) to exactly one value.
//! The first thread to ask for a key builds the value; every other thread
//! asking for the same key in the meantime blocks until it is ready.
//! Once ready, a value is never replaced or freed while the cache lives.
//!
//! Each key goes through these states:
//!
//! ```text
//!   (absent) --insert won--> Initializing(thread) --publish--> Ready(value)
//! ```
//!
//! Lookups and insertions go through a [ConcurrentMap] and never lock.
//! The mutex/condvar pair is only used to put threads that lost the race
//! to sleep until the winner publishes, and it does not guard any data.
//!
//! Asking for a key from inside the code building that same key
//! (directly or via other keys) can never finish, so it aborts the process.

use std::{
    cell::UnsafeCell,
    cmp,
    fmt::{self, Debug},
    hash::Hasher,
    mem::size_of,
    slice,
    sync::{atomic::Ordering, PoisonError},
};

use rustc_hash::FxHasher;
use tracing::Level;

use crate::{
    bump::BumpPageAllocator,
    fatal::{fatal_error, AbortOnUnwind},
    list::ConcurrentList,
    loom_testing::*,
    map::{ConcurrentMap, MapEntry},
    util::UsizePtr,
};

/// Whether published entries are recorded for [SingleFlightCache::published_entries]
pub const RECORD_PUBLISHED: bool = cfg!(any(debug_assertions, feature = "enumerate"));

/// Key words together with their precomputed hash
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheKey<'a> {
    hash: u64,
    data: &'a [usize],
}

impl<'a> CacheKey<'a> {
    pub fn new(data: &'a [usize]) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write_usize(data.len());
        for &word in data {
            hasher.write_usize(word);
        }
        Self {
            hash: hasher.finish(),
            data,
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn data(&self) -> &'a [usize] {
        self.data
    }
}

enum EntryState<V> {
    Initializing(ThreadId),
    Ready(*const V),
}

/// One key's entry inside the cache
///
/// The key words themselves are stored in the map node's trailing storage.
pub struct CacheEntry<V> {
    hash: u64,
    key_len: usize,
    /// Set (with release) exactly once, after `state` becomes `Ready`
    has_value: AtomicBool,
    /// Written only while holding the cache lock.
    /// Read either while holding the lock or after acquiring `has_value == true`.
    state: UnsafeCell<EntryState<V>>,
}
// safety: the only thing shared across threads is &V (once published)
unsafe impl<V: Sync> Send for CacheEntry<V> {}
unsafe impl<V: Sync> Sync for CacheEntry<V> {}

impl<V> Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("key_len", &self.key_len)
            .field("has_value", &self.has_value.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V> CacheEntry<V> {
    fn new_initializing(key: &CacheKey<'_>, initializer: ThreadId) -> Self {
        Self {
            hash: key.hash,
            key_len: key.data.len(),
            has_value: AtomicBool::new(false),
            state: UnsafeCell::new(EntryState::Initializing(initializer)),
        }
    }

    /// The published value, if there is one yet
    pub fn value(&self) -> Option<&V> {
        // order: acquire pairs with the release in publish, making
        // both the state and the value it points to visible
        if !self.has_value.load(Ordering::Acquire) {
            return None;
        }
        // safety: state never changes again once has_value is set
        match unsafe { &*self.state.get() } {
            // safety: values live as long as the cache's allocator
            EntryState::Ready(value) => Some(unsafe { &**value }),
            EntryState::Initializing(_) => unreachable!(),
        }
    }

    /// Whether the value is currently being built by thread `tid`
    ///
    /// # Safety
    ///
    /// The cache lock must be held.
    unsafe fn is_initializing_on(&self, tid: &ThreadId) -> bool {
        matches!(&*self.state.get(), EntryState::Initializing(x) if x == tid)
    }

    /// # Safety
    ///
    /// The cache lock must be held, and this must only happen once.
    unsafe fn publish(&self, value: &V) {
        debug_assert!(!self.has_value.load(Ordering::Relaxed));
        *self.state.get() = EntryState::Ready(value);
        self.has_value.store(true, Ordering::Release);
    }

    fn key_words(trailing: &[u8]) -> &[usize] {
        debug_assert_eq!(trailing.len() % size_of::<usize>(), 0);
        debug_assert_eq!(trailing.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
        // safety: trailing storage is pointer-aligned and was filled in by init_trailing
        unsafe {
            slice::from_raw_parts(
                trailing.as_ptr() as *const usize,
                trailing.len() / size_of::<usize>(),
            )
        }
    }
}

impl<V> MapEntry for CacheEntry<V> {
    type Key<'k> = CacheKey<'k>;

    fn compare_with_key(&self, trailing: &[u8], key: &CacheKey<'_>) -> cmp::Ordering {
        key.hash
            .cmp(&self.hash)
            .then_with(|| key.data.len().cmp(&self.key_len))
            .then_with(|| key.data.cmp(Self::key_words(trailing)))
    }

    fn extra_allocation_size(key: &CacheKey<'_>) -> usize {
        key.data.len() * size_of::<usize>()
    }

    fn init_trailing(key: &CacheKey<'_>, trailing: &mut [u8]) {
        for (dst, word) in trailing
            .chunks_exact_mut(size_of::<usize>())
            .zip(key.data)
        {
            dst.copy_from_slice(&word.to_ne_bytes());
        }
    }

    fn key_value_for_dump(&self) -> u64 {
        self.hash
    }
}

struct PublishedEntry<V> {
    key: Box<[usize]>,
    value: *const V,
}
// safety: just a &V
unsafe impl<V: Sync> Send for PublishedEntry<V> {}
unsafe impl<V: Sync> Sync for PublishedEntry<V> {}

/// Cache where each value is built at most once, by whoever asks first
///
/// Values are allocated out of the cache's own [BumpPageAllocator] and are
/// never dropped, so `V` should not need to be.
pub struct SingleFlightCache<V> {
    map: ConcurrentMap<CacheEntry<V>>,
    allocator: BumpPageAllocator,
    lock: Mutex<()>,
    queue: Condvar,
    published: ConcurrentList<PublishedEntry<V>>,
}

impl<V> Debug for SingleFlightCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("@addr", &(self as *const _))
            .field("map", &self.map)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl<V> Default for SingleFlightCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SingleFlightCache<V> {
    pub fn new() -> Self {
        Self::with_allocator(BumpPageAllocator::new())
    }

    pub fn with_allocator(allocator: BumpPageAllocator) -> Self {
        Self {
            map: ConcurrentMap::new(),
            allocator,
            lock: Mutex::new(()),
            queue: Condvar::new(),
            published: ConcurrentList::new(),
        }
    }

    /// Allocator that values are built in
    pub fn allocator(&self) -> &BumpPageAllocator {
        &self.allocator
    }

    /// Get the value for `arguments`, building it with `construct` if nobody has yet
    ///
    /// `construct` runs on this thread, without any locks held, at most once
    /// per key across all threads. It gets handed the cache's allocator to
    /// put the value in. Other threads asking for the same key block until it returns.
    ///
    /// Aborts the process if `construct` panics or ends up (transitively)
    /// resolving the very key it is building.
    pub fn resolve<'c, F>(&'c self, arguments: &[usize], construct: F) -> &'c V
    where
        F: FnOnce(&'c BumpPageAllocator, &[usize]) -> &'c V,
    {
        let key = CacheKey::new(arguments);
        let _span = tracing::span!(
            Level::TRACE,
            "cache::resolve",
            hash = key.hash,
            len = arguments.len()
        )
        .entered();

        let (entry, inserted) = self
            .map
            .get_or_insert(&key, || CacheEntry::new_initializing(&key, current_thread_id()));
        let entry = entry.get();

        if !inserted {
            if let Some(value) = entry.value() {
                return value;
            }
            return self.wait_for(entry);
        }

        tracing::event!(name: "cache::construct", Level::TRACE, entry = ?UsizePtr::from(entry));
        let value = {
            let _guard = AbortOnUnwind {
                what: "constructing a cache entry",
            };
            construct(&self.allocator, arguments)
        };

        {
            let _locked = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            // safety: holding the lock, and only the inserting thread gets here
            unsafe {
                entry.publish(value);
            }
            self.queue.notify_all();
        }
        tracing::event!(
            name: "cache::publish",
            Level::TRACE,
            entry = ?UsizePtr::from(entry),
            value = ?UsizePtr::from(value),
        );

        if RECORD_PUBLISHED {
            self.published.push_front(PublishedEntry {
                key: arguments.into(),
                value,
            });
        }

        value
    }

    #[cold]
    fn wait_for<'c>(&'c self, entry: &'c CacheEntry<V>) -> &'c V {
        let me = current_thread_id();
        let mut locked = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = entry.value() {
                return value;
            }
            // safety: holding the lock
            if unsafe { entry.is_initializing_on(&me) } {
                fatal_error(format_args!(
                    "cycle detected: cache entry {:?} depends on itself",
                    UsizePtr::from(entry)
                ));
            }
            tracing::event!(name: "cache::wait", Level::TRACE, entry = ?UsizePtr::from(entry));
            locked = self
                .queue
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Get the value for `arguments` if it has already been built
    ///
    /// Never blocks. Returns `None` while the value is still being built.
    pub fn find(&self, arguments: &[usize]) -> Option<&V> {
        self.map
            .find(&CacheKey::new(arguments))
            .and_then(|entry| entry.get().value())
    }

    /// Every published `(key, value)` as of some point during this call
    ///
    /// Always empty unless [RECORD_PUBLISHED] is set.
    pub fn published_entries(&self) -> impl Iterator<Item = (&[usize], &V)> + '_ {
        // safety: values live as long as the cache's allocator
        self.published
            .iter()
            .map(|x| (&x.key[..], unsafe { &*x.value }))
    }

    /// Render the underlying tree in graphviz format, labelled by key hash
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.map.dump(out)
    }
}
