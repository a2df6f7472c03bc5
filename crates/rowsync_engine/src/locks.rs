//! Reference-counted per-key locks.
//!
//! Both registries keep one slot per live key inside a single coarse
//! mutex; blocking is done on a condvar against that mutex, so no slot
//! outlives its last holder and the maps never grow unbounded.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

#[derive(Default)]
struct MutexSlot {
    refs: usize,
    held: bool,
}

/// A registry of per-key exclusive locks.
///
/// The first acquirer of a key allocates its slot; later acquirers
/// block until the holder releases. When the last reference goes away
/// the slot is removed.
#[derive(Default)]
pub struct KeyedMutexRegistry {
    slots: Mutex<HashMap<String, MutexSlot>>,
    released: Condvar,
}

impl KeyedMutexRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for `key`, blocking while another
    /// holder has it. The returned guard releases on drop.
    pub fn acquire(&self, key: &str) -> KeyedMutexGuard<'_> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().refs += 1;
        loop {
            match slots.get_mut(key) {
                Some(slot) if !slot.held => {
                    slot.held = true;
                    break;
                }
                _ => self.released.wait(&mut slots),
            }
        }
        KeyedMutexGuard {
            registry: self,
            key: key.to_string(),
        }
    }

    /// Number of keys with live slots. Zero once every guard has been
    /// dropped.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns true if no key has a live slot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.held = false;
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
        self.released.notify_all();
    }
}

/// Guard for an exclusive keyed lock.
pub struct KeyedMutexGuard<'a> {
    registry: &'a KeyedMutexRegistry,
    key: String,
}

impl Drop for KeyedMutexGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[derive(Default)]
struct RwSlot {
    refs: usize,
    readers: usize,
    writer: bool,
}

/// A registry of per-key shared/exclusive locks.
///
/// Readers of the same key proceed together; a writer excludes both
/// readers and other writers. Slots are reclaimed like
/// [`KeyedMutexRegistry`] slots.
#[derive(Default)]
pub struct KeyedRwLockRegistry {
    slots: Mutex<HashMap<String, RwSlot>>,
    released: Condvar,
}

impl KeyedRwLockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the shared lock for `key`, blocking while a writer
    /// holds it.
    pub fn acquire_read(&self, key: &str) -> KeyedReadGuard<'_> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().refs += 1;
        loop {
            match slots.get_mut(key) {
                Some(slot) if !slot.writer => {
                    slot.readers += 1;
                    break;
                }
                _ => self.released.wait(&mut slots),
            }
        }
        KeyedReadGuard {
            registry: self,
            key: key.to_string(),
        }
    }

    /// Acquires the exclusive lock for `key`, blocking while readers or
    /// another writer hold it.
    pub fn acquire_write(&self, key: &str) -> KeyedWriteGuard<'_> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().refs += 1;
        loop {
            match slots.get_mut(key) {
                Some(slot) if !slot.writer && slot.readers == 0 => {
                    slot.writer = true;
                    break;
                }
                _ => self.released.wait(&mut slots),
            }
        }
        KeyedWriteGuard {
            registry: self,
            key: key.to_string(),
        }
    }

    /// Number of keys with live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns true if no key has a live slot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_read(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.readers -= 1;
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
        self.released.notify_all();
    }

    fn release_write(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.writer = false;
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
        self.released.notify_all();
    }
}

/// Guard for a shared keyed lock.
pub struct KeyedReadGuard<'a> {
    registry: &'a KeyedRwLockRegistry,
    key: String,
}

impl Drop for KeyedReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.release_read(&self.key);
    }
}

/// Guard for an exclusive keyed lock.
pub struct KeyedWriteGuard<'a> {
    registry: &'a KeyedRwLockRegistry,
    key: String,
}

impl Drop for KeyedWriteGuard<'_> {
    fn drop(&mut self) {
        self.registry.release_write(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn acquire_and_release_reclaims_slot() {
        let registry = KeyedMutexRegistry::new();
        {
            let _a = registry.acquire("k");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let registry = KeyedMutexRegistry::new();
        let _a = registry.acquire("a");
        let _b = registry.acquire("b");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn second_acquirer_blocks_until_release() {
        let registry = Arc::new(KeyedMutexRegistry::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let guard = registry.acquire("k");

        let registry2 = Arc::clone(&registry);
        let entered2 = Arc::clone(&entered);
        let waiter = std::thread::spawn(move || {
            let _guard = registry2.acquire("k");
            entered2.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(guard);
        waiter.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn contended_count_returns_to_zero() {
        let registry = Arc::new(KeyedMutexRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = registry.acquire("shared");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn readers_share_writer_excludes() {
        let registry = Arc::new(KeyedRwLockRegistry::new());

        let r1 = registry.acquire_read("k");
        let r2 = registry.acquire_read("k");
        assert_eq!(registry.len(), 1);

        let entered = Arc::new(AtomicUsize::new(0));
        let registry2 = Arc::clone(&registry);
        let entered2 = Arc::clone(&entered);
        let writer = std::thread::spawn(move || {
            let _w = registry2.acquire_write("k");
            entered2.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(r1);
        drop(r2);
        writer.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn writer_blocks_reader() {
        let registry = Arc::new(KeyedRwLockRegistry::new());
        let w = registry.acquire_write("k");

        let entered = Arc::new(AtomicUsize::new(0));
        let registry2 = Arc::clone(&registry);
        let entered2 = Arc::clone(&entered);
        let reader = std::thread::spawn(move || {
            let _r = registry2.acquire_read("k");
            entered2.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(w);
        reader.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}
