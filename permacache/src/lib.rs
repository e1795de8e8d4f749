//! Concurrent caches of values that are built once and live forever
//!
//! The main entry point is [SingleFlightCache], which gives every distinct
//! key (a short list of word-sized identifiers) exactly one value, built by
//! whichever thread asks first while everybody else waits.
//!
//! The building blocks are usable on their own:
//!
//! * [BumpPageAllocator] hands out memory that is only ever freed all at once
//! * [ConcurrentMap] is a lock-free insert-only binary search tree
//! * [ConcurrentList] is a lock-free push-only linked list
//!
//! Build with `RUSTFLAGS="--cfg loom"` to run the tests under the `loom` model checker.

pub mod bump;
pub mod cache;
pub mod fatal;
pub mod list;
mod loom_testing;
pub mod map;
pub mod util;

pub use bump::BumpPageAllocator;
pub use cache::{CacheKey, SingleFlightCache};
pub use list::ConcurrentList;
pub use map::{ConcurrentMap, EntryRef, MapEntry};
