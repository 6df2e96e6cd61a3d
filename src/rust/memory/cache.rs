// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    memory::descriptor::FragmentDescriptor,
    runtime::fail::Fail,
};
use ::std::{
    cell::UnsafeCell,
    str::FromStr,
    sync::atomic::{
        AtomicBool,
        AtomicU32,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Who may touch a descriptor cache, and therefore whether it needs a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPolicy {
    /// Only the owning poll thread touches the cache, including driver frees that happen synchronously inside a
    /// control call. No lock is taken: exclusivity is checked like a `RefCell` borrow, and overlapping access panics.
    /// Every port the thread map sends to one cache must therefore be polled by the same thread.
    PollOnly,
    /// The driver also frees descriptors from interrupt context on other cores. A spin lock guards the cache.
    Interrupt,
}

/// Ring state. Cursors increase monotonically and wrap at `u32::MAX`; slots are addressed by masking.
struct CacheRing {
    slots: Box<[FragmentDescriptor]>,
    read: u32,
    write: u32,
    mask: u32,
}

/// Fixed-capacity FIFO of free fragment descriptors owned by one dataplane worker.
///
/// Caches of different workers are kept apart with [crate::pal::arch::CacheAligned].
pub struct DescriptorCache {
    ring: UnsafeCell<CacheRing>,
    lock: Option<spin::Mutex<()>>,
    /// Set while a poll-only cache is being accessed.
    busy: AtomicBool,
    /// Dequeues attempted on an empty cache.
    alloc_failures: AtomicU32,
    /// Enqueues dropped because the cache was full.
    overflow_drops: AtomicU32,
}

/// Marks a poll-only cache as in use for the lifetime of the guard.
struct ExclusiveGuard<'a>(&'a AtomicBool);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl CacheRing {
    fn size(&self) -> u32 {
        self.write.wrapping_sub(self.read)
    }

    fn capacity(&self) -> u32 {
        self.mask + 1
    }
}

impl DescriptorCache {
    /// Creates an empty cache. `capacity` must be a power of two.
    pub fn new(capacity: usize, policy: LockPolicy) -> Result<Self, Fail> {
        if !capacity.is_power_of_two() || capacity > (u32::MAX as usize / 2) + 1 {
            let cause: String = format!("cache capacity must be a power of two (capacity={})", capacity);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let ring: CacheRing = CacheRing {
            slots: vec![FragmentDescriptor::default(); capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            mask: (capacity - 1) as u32,
        };

        Ok(Self {
            ring: UnsafeCell::new(ring),
            lock: match policy {
                LockPolicy::PollOnly => None,
                LockPolicy::Interrupt => Some(spin::Mutex::new(())),
            },
            busy: AtomicBool::new(false),
            alloc_failures: AtomicU32::new(0),
            overflow_drops: AtomicU32::new(0),
        })
    }

    /// Runs `f` with exclusive access to the ring, under the configured policy.
    fn with_ring<R>(&self, f: impl FnOnce(&mut CacheRing) -> R) -> R {
        match &self.lock {
            Some(lock) => {
                let _guard = lock.lock();
                // Safety: the lock serializes every access to the ring.
                f(unsafe { &mut *self.ring.get() })
            },
            None => {
                let _guard: ExclusiveGuard = ExclusiveGuard::claim(&self.busy);
                // Safety: the guard proves no other access is in progress.
                f(unsafe { &mut *self.ring.get() })
            },
        }
    }

    /// Appends a descriptor. A full cache drops the descriptor and counts the drop.
    pub fn enqueue(&self, desc: FragmentDescriptor) {
        let stored: bool = self.with_ring(|ring| {
            if ring.size() >= ring.capacity() {
                return false;
            }
            let idx: usize = (ring.write & ring.mask) as usize;
            ring.slots[idx] = desc;
            ring.write = ring.write.wrapping_add(1);
            true
        });
        if !stored {
            self.overflow_drops.fetch_add(1, Ordering::Relaxed);
            warn!("enqueue(): descriptor cache full, dropping buffer {}", desc.seg.lo());
        }
    }

    /// Removes the oldest descriptor, zeroing its slot. An empty cache counts an allocation failure.
    pub fn dequeue(&self) -> Option<FragmentDescriptor> {
        let desc: Option<FragmentDescriptor> = self.with_ring(|ring| {
            if ring.size() == 0 {
                return None;
            }
            let idx: usize = (ring.read & ring.mask) as usize;
            let desc: FragmentDescriptor = ring.slots[idx];
            ring.slots[idx].clear();
            ring.read = ring.read.wrapping_add(1);
            Some(desc)
        });
        if desc.is_none() {
            self.alloc_failures.fetch_add(1, Ordering::Relaxed);
        }
        desc
    }

    /// Number of cached descriptors.
    pub fn size(&self) -> u32 {
        self.with_ring(|ring| ring.size())
    }

    pub fn capacity(&self) -> u32 {
        self.with_ring(|ring| ring.capacity())
    }

    /// Read and write cursors.
    pub fn cursors(&self) -> (u32, u32) {
        self.with_ring(|ring| (ring.read, ring.write))
    }

    /// Number of slots holding a non-zero descriptor.
    pub fn nonzero_slots(&self) -> usize {
        self.with_ring(|ring| ring.slots.iter().filter(|d| !d.is_zero()).count())
    }

    pub fn alloc_failures(&self) -> u32 {
        self.alloc_failures.load(Ordering::Relaxed)
    }

    pub fn overflow_drops(&self) -> u32 {
        self.overflow_drops.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Zeroes every slot and resets both cursors and both counters.
    pub fn reset(&self) {
        self.with_ring(|ring| {
            ring.slots.iter_mut().for_each(|d| d.clear());
            ring.read = 0;
            ring.write = 0;
        });
        self.alloc_failures.store(0, Ordering::Relaxed);
        self.overflow_drops.store(0, Ordering::Relaxed);
    }

    /// Moves both cursors to `cursor`, keeping the cache empty.
    #[cfg(test)]
    fn rewind_to(&self, cursor: u32) {
        self.with_ring(|ring| {
            ring.read = cursor;
            ring.write = cursor;
        });
    }
}

impl<'a> ExclusiveGuard<'a> {
    fn claim(busy: &'a AtomicBool) -> Self {
        if busy.swap(true, Ordering::Acquire) {
            panic!("poll-only descriptor cache accessed concurrently");
        }
        Self(busy)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FromStr for LockPolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(LockPolicy::PollOnly),
            "interrupt" => Ok(LockPolicy::Interrupt),
            _ => Err(Fail::new(libc::EINVAL, "unknown lock policy")),
        }
    }
}

/// Sync trait implementation. Access to the ring is serialized by the lock policy.
unsafe impl Sync for DescriptorCache {}

/// Send trait implementation.
unsafe impl Send for DescriptorCache {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
