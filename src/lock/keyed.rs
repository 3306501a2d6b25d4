//! Keyed resource lock
//!
//! Mutual exclusion addressed by string keys. Used to make "check cache ->
//! populate from remote -> hand out cache contents" atomic for requests that
//! target the same object while leaving unrelated objects fully concurrent.
//!
//! Slots are created on first use and dropped again once nobody holds or
//! waits for them, so long-running mounts with many one-shot keys do not
//! accumulate entries.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Per-key lock state
#[derive(Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Registry of locks addressed by string keys
#[derive(Default)]
pub struct KeyedMutex {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `key` is free, then hold it until the guard is dropped.
    pub fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let slot = {
            let mut slots = self.slots();
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        {
            let mut held = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
            while *held {
                held = slot
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *held = true;
        }

        trace!(key = key, "Acquired keyed lock");
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            slot: Some(slot),
        }
    }

    /// Take `key` only if nobody holds or waits for it
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard<'_>> {
        let slot = {
            let mut slots = self.slots();
            // Idle slots are removed, so any entry means the key is in use
            if slots.contains_key(key) {
                return None;
            }
            let slot = Arc::new(Slot {
                held: Mutex::new(true),
                released: Condvar::new(),
            });
            slots.insert(key.to_string(), Arc::clone(&slot));
            slot
        };

        trace!(key = key, "Acquired keyed lock without waiting");
        Some(KeyedGuard {
            owner: self,
            key: key.to_string(),
            slot: Some(slot),
        })
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one key of a [`KeyedMutex`]; releases it on drop
pub struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
    slot: Option<Arc<Slot>>,
}

impl KeyedGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        {
            let mut held = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
            *held = false;
            slot.released.notify_one();
        }

        // Waiters clone the slot under the registry lock, so a count of 2
        // (registry + this guard) means nobody else needs it.
        let mut slots = self.owner.slots();
        if Arc::strong_count(&slot) == 2 {
            slots.remove(&self.key);
        }
        drop(slot);
        trace!(key = %self.key, "Released keyed lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(Mutex::new(0u64));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.lock("bucket/obj1");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        // Read-modify-write split across a yield
                        let value = *counter.lock().unwrap();
                        thread::yield_now();
                        *counter.lock().unwrap() = value + 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let locks = Arc::new(KeyedMutex::new());
        let _held = locks.lock("bucket/a");

        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&locks);
        thread::spawn(move || {
            let _guard = other.lock("bucket/b");
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(5))
            .expect("lock on a different key must not wait");
    }

    #[test]
    fn test_waiter_runs_after_release() {
        let locks = Arc::new(KeyedMutex::new());
        let guard = locks.lock("k");

        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&locks);
        let waiter = thread::spawn(move || {
            let _guard = other.lock("k");
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let locks = Arc::new(KeyedMutex::new());
        let held = locks.lock("k");
        assert!(locks.try_lock("k").is_none());
        assert!(locks.try_lock("other").is_some());

        drop(held);
        let guard = locks.try_lock("k").unwrap();

        // A blocking locker waits for the try_lock holder
        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&locks);
        let waiter = thread::spawn(move || {
            let _guard = other.lock("k");
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_slots_evicted_when_idle() {
        let locks = KeyedMutex::new();
        {
            let _a = locks.lock("a");
            let _b = locks.lock("b");
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
