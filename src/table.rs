//! The hash table.
//!
//! # Locking
//!
//! The bucket array lives behind the table's `RwLock`, and every bucket is its own mutex, so the
//! per-bucket locks always match the buckets one to one. Inserts and lookups take the table lock
//! in shared mode and then the bucket's mutex (always in that order). Resizing takes the table lock
//! exclusively, which waits for every in-flight operation to drain before entries are rehomed.
//!
//! An insert which finds its chain too long cannot resize while holding its locks, as the exclusive
//! acquisition would wait for the inserting thread itself. Instead it releases both, and then asks
//! for a resize of the bucket count it observed. If another thread beat it to it, the request is
//! dropped.

#[cfg(test)]
use std::cell::Cell;
use std::time::{Duration, Instant};
use std::mem;

use parking_lot::{Mutex, MutexGuard};
use slog::{self, Logger};

use config::Config;
use error::Error;
use hash;
use rwlock::{ReadGuard, RwLock, WriteGuard};

/// An entry of the table.
struct Node<V> {
    /// The cached hash of the key.
    hashcode: u64,
    /// The key.
    key: Box<str>,
    /// The value.
    val: V,
    /// The next entry in the chain.
    next: Option<Box<Node<V>>>,
}

/// A singly-linked chain of entries, all of which belong to the same bucket.
struct Chain<V> {
    head: Option<Box<Node<V>>>,
}

impl<V> Chain<V> {
    fn new() -> Chain<V> {
        Chain {
            head: None,
        }
    }

    fn iter(&self) -> Iter<V> {
        Iter {
            next: self.head.as_ref().map(|node| &**node),
        }
    }

    fn find(&self, hashcode: u64, key: &str) -> Option<&Node<V>> {
        self.iter().find(|node| node.hashcode == hashcode && &*node.key == key)
    }

    /// Append an entry to the end of the chain, unless the key is already present.
    ///
    /// On success, the new length of the chain is returned.
    fn push_back(&mut self, hashcode: u64, key: String, val: V) -> Result<usize, Error> {
        let mut len = 1;
        let mut cursor = &mut self.head;

        while let Some(node) = cursor {
            if node.hashcode == hashcode && *node.key == *key {
                return Err(Error::DuplicateKey {
                    key: key,
                });
            }

            cursor = &mut node.next;
            len += 1;
        }

        *cursor = Some(Box::new(Node {
            hashcode: hashcode,
            key: key.into_boxed_str(),
            val: val,
            next: None,
        }));

        Ok(len)
    }

    /// Link an already allocated entry in at the head of the chain.
    fn push_front(&mut self, mut node: Box<Node<V>>) {
        node.next = self.head.take();
        self.head = Some(node);
    }

    /// Unlink the head of the chain.
    fn pop_front(&mut self) -> Option<Box<Node<V>>> {
        self.head.take().map(|mut node| {
            self.head = node.next.take();
            node
        })
    }

    /// Free every entry of the chain, returning how many there were.
    fn clear(&mut self) -> usize {
        let mut freed = 0;
        while self.pop_front().is_some() {
            freed += 1;
        }

        freed
    }
}

impl<V> Drop for Chain<V> {
    fn drop(&mut self) {
        // The default drop would recurse once per entry.
        self.clear();
    }
}

/// An iterator over the entries of a chain.
struct Iter<'a, V: 'a> {
    next: Option<&'a Node<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a Node<V>;

    fn next(&mut self) -> Option<&'a Node<V>> {
        self.next.map(|node| {
            self.next = node.next.as_ref().map(|node| &**node);
            node
        })
    }
}

/// The bucket array.
///
/// Each bucket is the head of a chain, guarded by its own mutex.
type Buckets<V> = Vec<Mutex<Chain<V>>>;

#[cfg(test)]
thread_local! {
    /// Make every bucket array allocation on this thread fail.
    static FAIL_ALLOC: Cell<bool> = Cell::new(false);
}

/// Get the smallest prime above `min`.
///
/// `None` stands for a bound which already overflowed, and like a prime beyond `usize`, it is an
/// array we can never allocate.
fn prime_above(min: Option<usize>) -> Result<usize, Error> {
    min.and_then(hash::next_prime).ok_or(Error::OutOfMemory {
        buckets: usize::max_value(),
    })
}

/// Allocate an array of `size` empty buckets.
fn alloc_buckets<V>(size: usize) -> Result<Buckets<V>, Error> {
    #[cfg(test)]
    {
        if FAIL_ALLOC.with(|fail| fail.get()) {
            return Err(Error::OutOfMemory {
                buckets: size,
            });
        }
    }

    let mut buckets = Vec::new();
    buckets.try_reserve_exact(size).map_err(|_| Error::OutOfMemory {
        buckets: size,
    })?;
    buckets.extend((0..size).map(|_| Mutex::new(Chain::new())));

    Ok(buckets)
}

/// The bucket of some hash, given the number of buckets.
fn slot(hashcode: u64, size: usize) -> usize {
    (hashcode % size as u64) as usize
}

/// Lock a bucket, giving up at `deadline` if any.
fn lock_bucket<V>(bucket: &Mutex<Chain<V>>, deadline: Option<Instant>)
    -> Result<MutexGuard<Chain<V>>, Error> {
    match deadline {
        Some(deadline) => bucket.try_lock_until(deadline).ok_or(Error::Timeout),
        None => Ok(bucket.lock()),
    }
}

/// A concurrent hash table with string keys.
///
/// The number of buckets is always prime. Keys are unique: inserting a key twice fails rather
/// than overwriting. There is no removal; entries live until the table is destroyed.
///
/// Values are moved into the table and handed out as clones, so shared values are typically
/// stored as `Arc<T>` or `&T`.
pub struct HTable<V> {
    /// The buckets.
    ///
    /// Shared mode for bucket access, exclusive mode for replacing the array.
    store: RwLock<Buckets<V>>,
    /// The configuration.
    config: Config,
    /// The logger.
    log: Logger,
}

impl<V> HTable<V> {
    /// Create a table with at least `min_size + 2` buckets.
    ///
    /// If `allow_resize` is set, the table grows when a chain gets longer than the default
    /// collision threshold.
    pub fn new(min_size: usize, allow_resize: bool) -> Result<HTable<V>, Error> {
        HTable::with_config(Config::default().min_size(min_size).allow_resize(allow_resize))
    }

    /// Create a table from a configuration.
    pub fn with_config(config: Config) -> Result<HTable<V>, Error> {
        HTable::with_logger(config, Logger::root(slog::Discard, o!()))
    }

    /// Create a table from a configuration, logging to `log`.
    pub fn with_logger(config: Config, log: Logger) -> Result<HTable<V>, Error> {
        let size = prime_above(config.min_size.checked_add(1))?;
        let buckets = alloc_buckets(size)?;

        debug!(log, "creating table"; "size" => size, "allow_resize" => config.allow_resize,
               "max_collision" => config.max_collision);

        Ok(HTable {
            store: RwLock::new(buckets),
            config: config,
            log: log,
        })
    }

    /// The current number of buckets.
    pub fn size(&self) -> usize {
        self.store.read().len()
    }

    /// The number of threads blocked on the table lock.
    pub fn waiters(&self) -> usize {
        self.store.waiters()
    }

    /// Insert a key-value pair.
    ///
    /// If the key is already present, `Error::DuplicateKey` is returned and the table is left
    /// unchanged.
    pub fn insert<K: Into<String>>(&self, key: K, val: V) -> Result<(), Error> {
        self.insert_until(key.into(), val, None)
    }

    /// Insert a key-value pair, waiting no longer than `timeout` for the locks.
    ///
    /// If the insert leads to a resize, the resize is skipped when it cannot get hold of the
    /// table within the remaining time. The entry is inserted either way.
    pub fn insert_timeout<K: Into<String>>(&self, key: K, val: V, timeout: Duration)
        -> Result<(), Error> {
        self.insert_until(key.into(), val, Instant::now().checked_add(timeout))
    }

    /// Destroy the table, freeing every entry.
    ///
    /// This is equivalent to dropping the table, except it logs how many entries were released.
    pub fn destroy(mut self) {
        let freed: usize = self.store.get_mut().iter_mut()
            .map(|bucket| bucket.get_mut().clear())
            .sum();

        debug!(self.log, "destroying table"; "entries" => freed);
    }

    fn read_store(&self, deadline: Option<Instant>) -> Result<ReadGuard<Buckets<V>>, Error> {
        match deadline {
            Some(deadline) => self.store.read_until(deadline),
            None => Ok(self.store.read()),
        }
    }

    fn write_store(&self, deadline: Option<Instant>) -> Result<WriteGuard<Buckets<V>>, Error> {
        match deadline {
            Some(deadline) => self.store.write_until(deadline),
            None => Ok(self.store.write()),
        }
    }

    fn insert_until(&self, key: String, val: V, deadline: Option<Instant>) -> Result<(), Error> {
        let hashcode = hash::hash(&key);

        let (size, len) = {
            let store = self.read_store(deadline)?;
            let size = store.len();
            let mut chain = lock_bucket(&store[slot(hashcode, size)], deadline)?;

            match chain.push_back(hashcode, key, val) {
                Ok(len) => (size, len),
                Err(err) => {
                    trace!(self.log, "rejecting duplicate key"; "error" => %err);
                    return Err(err);
                },
            }
            // The bucket is unlocked before the table.
        };

        // Both locks are released at this point. The bucket index we used is stale as soon as
        // someone resizes, so the resize only gets to know the size we saw.
        if self.config.allow_resize && len > self.config.max_collision {
            self.resize(size, deadline);
        }

        Ok(())
    }

    /// Grow the table from `from` buckets to the smallest prime at least twice as large.
    ///
    /// Nothing is done if the table no longer has `from` buckets, as somebody else resized it in
    /// the meantime. On failure (timeout or allocation), the table is left as is.
    fn resize(&self, from: usize, deadline: Option<Instant>) {
        let mut store = match self.write_store(deadline) {
            Ok(store) => store,
            Err(err) => {
                trace!(self.log, "skipping resize"; "error" => %err);
                return;
            },
        };

        if store.len() != from {
            trace!(self.log, "table already resized"; "from" => from, "size" => store.len());
            return;
        }

        // The smallest prime no less than twice the current size.
        let target = prime_above(from.checked_mul(2).map(|n| n - 1));
        let mut buckets = match target.and_then(alloc_buckets) {
            Ok(buckets) => buckets,
            Err(err) => {
                warn!(self.log, "aborting resize"; "from" => from, "error" => %err);
                return;
            },
        };
        let size = buckets.len();
        debug!(self.log, "resizing table"; "from" => from, "to" => size);

        // Rehome every entry. The nodes are relinked, not reallocated.
        let mut moved = 0;
        for bucket in store.iter_mut() {
            let chain = bucket.get_mut();
            while let Some(node) = chain.pop_front() {
                buckets[slot(node.hashcode, size)].get_mut().push_front(node);
                moved += 1;
            }
        }

        // The old (now empty) buckets and their mutexes are dropped here, while readers are still
        // shut out.
        drop(mem::replace(&mut *store, buckets));

        debug!(self.log, "resized table"; "size" => size, "moved" => moved);
    }

    /// Collect the keys of every bucket, in chain order.
    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<Vec<String>> {
        self.store.read().iter()
            .map(|bucket| bucket.lock().iter().map(|node| node.key.to_string()).collect())
            .collect()
    }
}

impl<V: Clone> HTable<V> {
    /// Look up the value of some key.
    pub fn lookup(&self, key: &str) -> Option<V> {
        let hashcode = hash::hash(key);

        let store = self.store.read();
        let chain = store[slot(hashcode, store.len())].lock();
        let val = chain.find(hashcode, key).map(|node| node.val.clone());

        val
    }

    /// Look up the value of some key, waiting no longer than `timeout` for the locks.
    pub fn lookup_timeout(&self, key: &str, timeout: Duration) -> Result<Option<V>, Error> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return Ok(self.lookup(key)),
        };
        let hashcode = hash::hash(key);

        let store = self.store.read_until(deadline)?;
        let chain = lock_bucket(&store[slot(hashcode, store.len())], Some(deadline))?;
        let val = chain.find(hashcode, key).map(|node| node.val.clone());

        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Find `n` keys landing in bucket `bucket` of a table with `size` buckets.
    fn colliding_keys(n: usize, size: usize, bucket: usize) -> Vec<String> {
        (0..).map(|i| format!("key{}", i))
            .filter(|key| slot(hash::hash(key), size) == bucket)
            .take(n)
            .collect()
    }

    #[test]
    fn chain_push_back() {
        let mut chain = Chain::new();

        assert_eq!(chain.push_back(1, "a".to_string(), 1), Ok(1));
        assert_eq!(chain.push_back(1, "b".to_string(), 2), Ok(2));
        assert_eq!(chain.push_back(2, "c".to_string(), 3), Ok(3));
        assert_eq!(chain.push_back(1, "a".to_string(), 4), Err(Error::DuplicateKey {
            key: "a".to_string(),
        }));

        let keys: Vec<&str> = chain.iter().map(|node| &*node.key).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(chain.find(1, "a").map(|node| node.val), Some(1));
        assert!(chain.find(2, "a").is_none());
        assert_eq!(chain.clear(), 3);
        assert!(chain.head.is_none());
    }

    #[test]
    fn long_chain_drop() {
        let mut chain = Chain::new();
        for i in 0..500000 {
            chain.push_front(Box::new(Node {
                hashcode: 0,
                key: "".into(),
                val: i,
                next: None,
            }));
        }

        drop(chain);
    }

    #[test]
    fn initial_size() {
        assert_eq!(HTable::<()>::new(5, true).unwrap().size(), 7);
        assert_eq!(HTable::<()>::new(0, true).unwrap().size(), 2);
        assert_eq!(HTable::<()>::new(9, false).unwrap().size(), 11);
        assert_eq!(HTable::<()>::with_config(Config::default()).unwrap().size(), 37);
    }

    #[test]
    fn chains_match_slots() {
        let table = HTable::new(5, true).unwrap();
        for i in 0..200 {
            table.insert(format!("{}", i), i).unwrap();
        }

        let size = table.size();
        assert!(size > 7);
        assert!(hash::is_prime(size));
        for (i, bucket) in table.keys().iter().enumerate() {
            for key in bucket {
                assert_eq!(slot(hash::hash(key), size), i);
            }
        }
    }

    #[test]
    fn resize_on_eleventh_collision() {
        let table = HTable::new(5, true).unwrap();
        let keys = colliding_keys(11, 7, 0);

        for (i, key) in keys[..10].iter().enumerate() {
            table.insert(&**key, i).unwrap();
        }
        assert_eq!(table.size(), 7);
        assert_eq!(table.keys()[0].len(), 10);

        table.insert(&*keys[10], 10).unwrap();
        assert_eq!(table.size(), 17);

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.lookup(key), Some(i));
        }
    }

    #[test]
    fn no_resize_when_disallowed() {
        let table = HTable::new(5, false).unwrap();
        let keys = colliding_keys(30, 7, 3);

        for key in &keys {
            table.insert(&**key, ()).unwrap();
        }

        assert_eq!(table.size(), 7);
        assert_eq!(table.keys()[3], keys);
    }

    #[test]
    fn configured_threshold() {
        let table = HTable::with_config(Config::default().min_size(5).max_collision(2)).unwrap();
        let keys = colliding_keys(3, 7, 1);

        table.insert(&*keys[0], 0).unwrap();
        table.insert(&*keys[1], 1).unwrap();
        assert_eq!(table.size(), 7);
        table.insert(&*keys[2], 2).unwrap();
        assert_eq!(table.size(), 17);
    }

    #[test]
    fn stale_resize_is_dropped() {
        let table: HTable<()> = HTable::new(5, true).unwrap();

        table.resize(7, None);
        assert_eq!(table.size(), 17);
        table.resize(7, None);
        assert_eq!(table.size(), 17);
        table.resize(17, None);
        assert_eq!(table.size(), 37);
    }

    #[test]
    fn resize_skipped_on_timeout() {
        let table: HTable<()> = HTable::new(5, true).unwrap();

        {
            let _reader = table.store.read();
            table.resize(7, Some(Instant::now() + Duration::from_millis(10)));
        }

        assert_eq!(table.size(), 7);
        assert_eq!(table.waiters(), 0);
    }

    #[test]
    fn timeouts() {
        let table = HTable::new(5, true).unwrap();
        table.insert("a", 1).unwrap();

        {
            let _writer = table.store.write();
            assert_eq!(table.insert_timeout("b", 2, Duration::from_millis(10)), Err(Error::Timeout));
            assert_eq!(table.lookup_timeout("a", Duration::from_millis(10)), Err(Error::Timeout));
        }

        {
            let store = table.store.read();
            let _bucket = store[slot(hash::hash("a"), 7)].lock();
            assert_eq!(table.lookup_timeout("a", Duration::from_millis(10)), Err(Error::Timeout));
        }

        assert_eq!(table.waiters(), 0);
        assert_eq!(table.lookup_timeout("a", Duration::from_secs(1)), Ok(Some(1)));
        assert_eq!(table.lookup("b"), None);
        assert_eq!(table.insert_timeout("b", 2, Duration::from_secs(1)), Ok(()));
        assert_eq!(table.lookup("b"), Some(2));
    }

    #[test]
    fn unbounded_timeouts() {
        let table = HTable::new(5, true).unwrap();

        table.insert_timeout("a", 1, Duration::new(u64::max_value(), 0)).unwrap();
        assert_eq!(table.lookup_timeout("a", Duration::new(u64::max_value(), 0)), Ok(Some(1)));
        assert_eq!(table.lookup_timeout("b", Duration::new(u64::max_value(), 0)), Ok(None));
    }

    #[test]
    fn size_hint_overflow() {
        assert_eq!(HTable::<()>::new(usize::max_value(), true).err(), Some(Error::OutOfMemory {
            buckets: usize::max_value(),
        }));
        assert_eq!(HTable::<()>::new(usize::max_value() - 1, true).err(), Some(Error::OutOfMemory {
            buckets: usize::max_value(),
        }));
    }

    #[test]
    fn create_out_of_memory() {
        FAIL_ALLOC.with(|fail| fail.set(true));
        let res = HTable::<()>::new(5, true);
        FAIL_ALLOC.with(|fail| fail.set(false));

        assert_eq!(res.err(), Some(Error::OutOfMemory {
            buckets: 7,
        }));
    }

    #[test]
    fn resize_out_of_memory() {
        let table = HTable::new(5, true).unwrap();
        let keys = colliding_keys(12, 7, 0);

        for (i, key) in keys[..10].iter().enumerate() {
            table.insert(&**key, i).unwrap();
        }

        // The resize fails, but the entry which triggered it stays.
        FAIL_ALLOC.with(|fail| fail.set(true));
        let res = table.insert(&*keys[10], 10);
        FAIL_ALLOC.with(|fail| fail.set(false));

        assert_eq!(res, Ok(()));
        assert_eq!(table.size(), 7);
        assert_eq!(table.keys()[0], &keys[..11]);
        for (i, key) in keys[..11].iter().enumerate() {
            assert_eq!(table.lookup(key), Some(i));
        }

        // The next insert into the overlong chain tries again.
        table.insert(&*keys[11], 11).unwrap();
        assert_eq!(table.size(), 17);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.lookup(key), Some(i));
        }
    }

    #[test]
    fn equal_hashes_keep_growing() {
        let table = HTable::new(5, true).unwrap();
        // Leading NULs leave the hash unchanged.
        let keys: Vec<String> = (0..13).map(|i| format!("{}a", "\0".repeat(i))).collect();

        for key in &keys {
            assert_eq!(hash::hash(key), 97);
        }

        let mut sizes = Vec::new();
        for key in &keys {
            table.insert(&**key, ()).unwrap();
            sizes.push(table.size());
        }

        // Every insert past the threshold doubles the table, as the chain never splits.
        assert_eq!(&sizes[9..], [7, 17, 37, 79]);
        assert_eq!(table.keys()[97 % 79].len(), 13);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroy_frees_every_entry() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let table = HTable::new(5, true).unwrap();

        for i in 0..100 {
            table.insert(format!("{}", i), Tracked(dropped.clone())).unwrap();
        }
        assert!(table.insert("0", Tracked(dropped.clone())).is_err());
        // The rejected value is dropped right away.
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        table.destroy();
        assert_eq!(dropped.load(Ordering::SeqCst), 101);
    }
}
