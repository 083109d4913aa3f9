//! The atomic data unit of the engine and the concurrent pool which buffers it between
//! producers (mapping workers, remote value streams) and a single consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

/// A (key, value) pair, immutable once constructed. This is what flows through map, shuffle
/// and reduce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Datum<V> {
    pub key: String,
    pub value: V,
}

impl<V> Datum<V> {
    pub fn new<K: Into<String>>(key: K, value: V) -> Self {
        Datum { key: key.into(), value }
    }
}

/// The error returned when a producer emits into a pool after it has been closed.
#[derive(Debug, Error)]
#[error("data pool is closed to further items")]
pub struct PoolClosed;

struct PoolInner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// An unbounded, thread-safe, closeable sequence of items.
///
/// Invariant: after `close`, the pool yields every already-buffered item and then signals
/// end-of-sequence. No item is lost or duplicated; producers fail fast once the pool is closed.
/// Shared behind an `Arc`, one pool serves concurrent producers and a single iterating
/// consumer at the same time.
pub struct DataPool<T> {
    inner: Mutex<PoolInner<T>>,
    available: Condvar,
}

impl<T> DataPool<T> {
    pub fn new() -> Self {
        DataPool {
            inner: Mutex::new(PoolInner { queue: VecDeque::new(), closed: false }),
            available: Condvar::new(),
        }
    }

    /// Appends one item. Fails fast if the pool has been closed.
    pub fn emit(&self, item: T) -> Result<(), PoolClosed> {
        let mut inner = self.inner.lock().expect("data pool lock poisoned");
        if inner.closed {
            return Err(PoolClosed);
        }
        inner.queue.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Marks the end of production. Consumers drain what is buffered and then terminate.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("data pool lock poisoned");
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("data pool lock poisoned").closed
    }

    /// Takes the next item, blocking while the pool is empty and still open. Returns `None`
    /// exactly when the pool is closed and drained.
    pub fn next_item(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("data pool lock poisoned");
        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).expect("data pool lock poisoned");
        }
    }

    pub fn iter(&self) -> PoolIterator<'_, T> {
        PoolIterator { pool: self }
    }
}

impl<T> Default for DataPool<T> {
    fn default() -> Self {
        DataPool::new()
    }
}

/// A blocking iterator over a pool; terminates when the pool is closed and drained.
pub struct PoolIterator<'a, T> {
    pool: &'a DataPool<T>,
}

impl<'a, T> Iterator for PoolIterator<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pool.next_item()
    }
}

impl<'a, T> IntoIterator for &'a DataPool<T> {
    type Item = T;
    type IntoIter = PoolIterator<'a, T>;

    fn into_iter(self) -> PoolIterator<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn emit_after_close_fails_fast() {
        let pool = DataPool::new();
        pool.emit(1).unwrap();
        pool.close();
        assert!(pool.emit(2).is_err());
    }

    #[test]
    fn closed_pool_drains_then_terminates() {
        let pool = DataPool::new();
        pool.emit("a").unwrap();
        pool.emit("b").unwrap();
        pool.close();

        let drained: Vec<&str> = pool.iter().collect();
        assert_eq!(vec!["a", "b"], drained);
        assert_eq!(None, pool.next_item());
    }

    #[test]
    fn consumer_blocks_until_close() {
        let pool = Arc::new(DataPool::new());
        let consumer_pool = pool.clone();
        let consumer = thread::spawn(move || consumer_pool.iter().count());

        for i in 0..10 {
            pool.emit(i).unwrap();
        }
        pool.close();

        assert_eq!(10, consumer.join().unwrap());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const ITEMS: usize = 250;

        let pool = Arc::new(DataPool::new());
        let consumer_pool = pool.clone();
        let consumer = thread::spawn(move || {
            let mut seen: Vec<usize> = consumer_pool.iter().collect();
            seen.sort_unstable();
            seen
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..ITEMS {
                        pool.emit(p * ITEMS + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        pool.close();

        let seen = consumer.join().unwrap();
        let expected: Vec<usize> = (0..PRODUCERS * ITEMS).collect();
        assert_eq!(expected, seen);
    }
}
