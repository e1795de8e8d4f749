#[cfg(not(loom))]
use std::sync::atomic::AtomicUsize as StdAtomicUsize;

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[derive(Debug)]
struct IntEntry {
    key: u64,
    value: u32,
}
impl MapEntry for IntEntry {
    type Key<'k> = u64;

    fn compare_with_key(&self, _trailing: &[u8], key: &u64) -> cmp::Ordering {
        key.cmp(&self.key)
    }

    fn extra_allocation_size(_key: &u64) -> usize {
        0
    }

    fn key_value_for_dump(&self) -> u64 {
        self.key
    }
}

/// Variable-length key kept in trailing storage
#[derive(Debug)]
struct BytesEntry {
    tag: u32,
}
impl MapEntry for BytesEntry {
    type Key<'k> = [u8];

    fn compare_with_key(&self, trailing: &[u8], key: &[u8]) -> cmp::Ordering {
        key.len().cmp(&trailing.len()).then_with(|| key.cmp(trailing))
    }

    fn extra_allocation_size(key: &[u8]) -> usize {
        key.len()
    }

    fn init_trailing(key: &[u8], trailing: &mut [u8]) {
        trailing.copy_from_slice(key);
    }

    fn key_value_for_dump(&self) -> u64 {
        self.tag as u64
    }
}

#[cfg(not(loom))]
struct DropCounted<'a> {
    key: u64,
    drops: &'a StdAtomicUsize,
}
#[cfg(not(loom))]
impl<'a> Drop for DropCounted<'a> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}
#[cfg(not(loom))]
impl<'a> MapEntry for DropCounted<'a> {
    type Key<'k> = u64;

    fn compare_with_key(&self, _trailing: &[u8], key: &u64) -> cmp::Ordering {
        key.cmp(&self.key)
    }

    fn extra_allocation_size(_key: &u64) -> usize {
        0
    }

    fn key_value_for_dump(&self) -> u64 {
        self.key
    }
}

#[test]
fn ensure_map_send_sync() {
    assert_send::<ConcurrentMap<IntEntry>>();
    assert_sync::<ConcurrentMap<IntEntry>>();
    assert_send::<EntryRef<'static, IntEntry>>();
    assert_sync::<EntryRef<'static, IntEntry>>();
}

#[test]
fn trailing_offset_aligned() {
    assert_eq!(Node::<IntEntry>::TRAILING_OFFSET % TRAILING_ALIGN, 0);
    assert_eq!(Node::<BytesEntry>::TRAILING_OFFSET % TRAILING_ALIGN, 0);
    assert!(Node::<BytesEntry>::layout(0).size() >= size_of::<Node<BytesEntry>>());
    assert!(Node::<BytesEntry>::layout(13).size() >= Node::<BytesEntry>::TRAILING_OFFSET + 13);
}

#[cfg(not(loom))]
#[test]
fn map_empty() {
    let map = ConcurrentMap::<IntEntry>::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.depth(), 0);
    assert!(map.find(&5).is_none());
}

#[cfg(not(loom))]
#[test]
fn map_insert_then_find() {
    let map = ConcurrentMap::<IntEntry>::new();

    let (e, inserted) = map.get_or_insert(&5, || IntEntry { key: 5, value: 50 });
    assert!(inserted);
    assert_eq!(e.value, 50);

    let (e2, inserted) = map.get_or_insert(&5, || unreachable!());
    assert!(!inserted);
    assert!(EntryRef::ptr_eq(e, e2));

    let found = map.find(&5).unwrap();
    assert!(EntryRef::ptr_eq(e, found));
    assert!(map.find(&6).is_none());
    assert!(!map.is_empty());
    assert_eq!(map.len(), 1);
}

#[cfg(not(loom))]
#[test]
fn map_ordering_shape() {
    let map = ConcurrentMap::<IntEntry>::new();
    for k in [50, 25, 75, 10, 30, 60, 90] {
        map.get_or_insert(&k, || IntEntry {
            key: k,
            value: k as u32 * 2,
        });
    }
    assert_eq!(map.len(), 7);
    // balanced insertion order gives a perfect tree
    assert_eq!(map.depth(), 3);

    let mut seen = Vec::new();
    map.for_each(|e| seen.push(e.key));
    seen.sort();
    assert_eq!(seen, vec![10, 25, 30, 50, 60, 75, 90]);

    for k in [10, 25, 30, 50, 60, 75, 90] {
        assert_eq!(map.find(&k).unwrap().value, k as u32 * 2);
    }
    for k in [0, 11, 26, 55, 100] {
        assert!(map.find(&k).is_none());
    }
}

#[cfg(not(loom))]
#[test]
fn map_degenerate_line() {
    // sorted insertion makes a very deep tree; drop must not recurse
    let map = ConcurrentMap::<IntEntry>::new();
    for k in 0..5_000 {
        map.get_or_insert(&k, || IntEntry { key: k, value: 0 });
    }
    assert_eq!(map.depth(), 5_000);
    assert!(map.find(&4_999).is_some());
}

#[cfg(not(loom))]
#[test]
fn map_last_search_hint() {
    let map = ConcurrentMap::<IntEntry>::new();
    map.get_or_insert(&1, || IntEntry { key: 1, value: 1 });
    map.get_or_insert(&2, || IntEntry { key: 2, value: 2 });

    let a = map.find(&1).unwrap();
    assert_eq!(map.last_search.load(Ordering::Relaxed), a.node.as_ptr());
    let a2 = map.check_last_search(&1).unwrap();
    assert!(EntryRef::ptr_eq(a, a2));
    // a different key misses the hint but is still found by walking
    assert!(map.check_last_search(&2).is_none());
    assert_eq!(map.find(&2).unwrap().value, 2);
}

#[cfg(not(loom))]
#[test]
fn map_trailing_keys() {
    let map = ConcurrentMap::<BytesEntry>::new();
    let keys: [&[u8]; 5] = [b"hello", b"world", b"", b"hell", b"a much longer key than the rest"];
    for (i, k) in keys.iter().enumerate() {
        let (e, inserted) = map.get_or_insert(*k, || BytesEntry { tag: i as u32 });
        assert!(inserted);
        assert_eq!(e.trailing(), *k);
        assert_eq!(e.trailing().as_ptr() as usize % TRAILING_ALIGN, 0);
    }
    for (i, k) in keys.iter().enumerate() {
        let e = map.find(*k).unwrap();
        assert_eq!(e.tag, i as u32);
        assert_eq!(e.trailing(), *k);
    }
    assert!(map.find(&b"help"[..]).is_none());
}

#[cfg(not(loom))]
#[test]
fn map_drops_entries() {
    let drops = StdAtomicUsize::new(0);
    {
        let map = ConcurrentMap::new();
        for k in [3, 1, 2, 5, 4] {
            map.get_or_insert(&k, || DropCounted { key: k, drops: &drops });
        }
        // existing key: closure never runs, nothing extra built or dropped
        map.get_or_insert(&3, || DropCounted { key: 3, drops: &drops });
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }
    assert_eq!(drops.load(Ordering::Relaxed), 5);
}

#[cfg(not(loom))]
#[test]
fn map_dump_graphviz() {
    let map = ConcurrentMap::<IntEntry>::new();
    for k in [0x20, 0x10, 0x30] {
        map.get_or_insert(&k, || IntEntry { key: k, value: 0 });
    }
    let mut out = String::new();
    map.dump(&mut out).unwrap();
    println!("{}", out);

    assert!(out.starts_with("digraph g {\n"));
    assert!(out.ends_with("}\n"));
    assert!(out.contains("0000000000000020"));
    assert!(out.contains("0000000000000010"));
    assert!(out.contains("0000000000000030"));
    assert_eq!(out.matches("->").count(), 2);
    assert!(out.contains(":f1 -> "));
    assert!(out.contains(":f2 -> "));
}

#[cfg(not(loom))]
#[test]
fn map_concurrent_inserts() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;

    let map = ConcurrentMap::<IntEntry>::new();
    let created = StdAtomicUsize::new(0);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            let created = &created;
            s.spawn(move || {
                // every thread goes over the same keys in a different order,
                // half of them contended
                for i in 0..PER_THREAD {
                    let k = (i * 7919 + t * 13) % (PER_THREAD * 2);
                    let (e, inserted) = map.get_or_insert(&k, || IntEntry {
                        key: k,
                        value: k as u32 + 1,
                    });
                    if inserted {
                        created.fetch_add(1, Ordering::Relaxed);
                    }
                    assert_eq!(e.key, k);
                    assert_eq!(e.value, k as u32 + 1);
                }
            });
        }
    });

    let n = map.len();
    assert_eq!(n, created.load(Ordering::Relaxed));
    let mut keys = Vec::new();
    map.for_each(|e| keys.push(e.key));
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), n);
}

#[cfg(not(loom))]
mod props {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn map_matches_btreemap(
            ops in proptest::collection::vec((any::<bool>(), 0u64..64, any::<u32>()), 1..300)
        ) {
            let map = ConcurrentMap::<IntEntry>::new();
            let mut model = BTreeMap::new();

            for (is_insert, key, value) in ops {
                if is_insert {
                    let (e, inserted) = map.get_or_insert(&key, || IntEntry { key, value });
                    let was_new = !model.contains_key(&key);
                    let expected = *model.entry(key).or_insert(value);
                    prop_assert_eq!(inserted, was_new);
                    prop_assert_eq!(e.value, expected);
                } else {
                    prop_assert_eq!(map.find(&key).map(|e| e.value), model.get(&key).copied());
                }
            }
            prop_assert_eq!(map.len(), model.len());
        }
    }
}

#[cfg(loom)]
#[test]
fn map_loom_same_key() {
    loom::model(|| {
        let map = &*Box::leak(Box::new(ConcurrentMap::<IntEntry>::new()));

        let t0 = loom::thread::spawn(move || {
            let (e, inserted) = map.get_or_insert(&7, || IntEntry { key: 7, value: 0 });
            (e.node.as_ptr() as usize, e.value, inserted)
        });
        let t1 = loom::thread::spawn(move || {
            let (e, inserted) = map.get_or_insert(&7, || IntEntry { key: 7, value: 1 });
            (e.node.as_ptr() as usize, e.value, inserted)
        });

        let (a_ptr, a_val, a_ins) = t0.join().unwrap();
        let (b_ptr, b_val, b_ins) = t1.join().unwrap();

        // both see the one winner
        assert_eq!(a_ptr, b_ptr);
        assert_eq!(a_val, b_val);
        assert!(a_ins ^ b_ins);
        assert_eq!(map.len(), 1);
    });
}

#[cfg(loom)]
#[test]
fn map_loom_different_keys() {
    loom::model(|| {
        let map = &*Box::leak(Box::new(ConcurrentMap::<IntEntry>::new()));
        map.get_or_insert(&10, || IntEntry { key: 10, value: 10 });

        // both race for the same empty child slot of the root
        let t0 = loom::thread::spawn(move || {
            map.get_or_insert(&3, || IntEntry { key: 3, value: 3 }).1
        });
        let t1 = loom::thread::spawn(move || {
            map.get_or_insert(&5, || IntEntry { key: 5, value: 5 }).1
        });

        assert!(t0.join().unwrap());
        assert!(t1.join().unwrap());
        assert_eq!(map.find(&3).unwrap().value, 3);
        assert_eq!(map.find(&5).unwrap().value, 5);
        assert_eq!(map.len(), 3);
    });
}
