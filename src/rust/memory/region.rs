// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Memory region shared between the driver side and the dataplane.
//!
//! The region spans exactly one hugepage. Its layout is an ABI: every field has a fixed offset and the whole structure
//! is padded to [REGION_SIZE] bytes. Per-worker vectors are written only by the worker that owns them, which is
//! enforced in-process by [WorkerSlot] claims.

//======================================================================================================================
// Imports
//======================================================================================================================

#[cfg(target_os = "linux")]
use crate::pal::linux::shm::SharedMemory;
use crate::{
    memory::descriptor::FragmentDescriptor,
    runtime::{
        fail::Fail,
        limits::{
            ALLOC_VLEN,
            NUM_PORTS,
            NUM_WORKERS,
            PIPES_PER_PORT,
            RXTX_VLEN,
            VLEN,
        },
    },
};
use ::static_assertions::const_assert_eq;
use ::std::{
    alloc::{
        self,
        Layout,
    },
    hint,
    mem,
    ptr::{
        self,
        addr_of_mut,
        NonNull,
    },
    slice,
    sync::atomic::{
        AtomicBool,
        AtomicU32,
        Ordering,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of the shared region: one 2 MiB hugepage.
pub const REGION_SIZE: usize = 2 * 1024 * 1024;

/// Size of the descriptor vectors of one port.
pub const PORT_MAP_SIZE: usize = 54336;

const HEADER_SIZE: usize = NUM_PORTS * PORT_MAP_SIZE + 2 * NUM_WORKERS * mem::size_of::<u32>();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Descriptor vectors of one port.
#[repr(C)]
pub struct PortMap {
    pub rx_vector: [[FragmentDescriptor; RXTX_VLEN]; NUM_WORKERS],
    pub tx_vector: [[FragmentDescriptor; RXTX_VLEN]; NUM_WORKERS],
    pub alloc_vector: [[u32; ALLOC_VLEN]; NUM_WORKERS],
    pub release_vector: [[u32; VLEN]; NUM_WORKERS],
    /// Per-pipe transmit availability. Written by one worker at a time for a given port.
    pub tx_avail: [u32; PIPES_PER_PORT],
}

/// Binary layout of the shared region.
#[repr(C)]
pub struct PortMaps {
    pub maps: [PortMap; NUM_PORTS],
    /// Descriptor cache occupancy, published per worker.
    pub cache_level: [u32; NUM_WORKERS],
    /// Number of entries of the release vector filled by the last RECEIVE, per worker.
    pub release_count: [u32; NUM_WORKERS],
    _pad: [u8; REGION_SIZE - HEADER_SIZE],
}

const_assert_eq!(mem::size_of::<PortMap>(), PORT_MAP_SIZE);
const_assert_eq!(mem::size_of::<PortMaps>(), REGION_SIZE);

/// Memory behind a shared region.
enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Shm(SharedMemory),
}

/// Shared region.
pub struct SharedRegion {
    base: NonNull<PortMaps>,
    backing: Backing,
    /// Worker slots currently claimed.
    claims: [AtomicBool; NUM_WORKERS],
}

/// Exclusive access to the vectors of one worker, across every port.
pub struct WorkerSlot<'a> {
    region: &'a SharedRegion,
    worker: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedRegion {
    /// Allocates a zeroed region on the heap, aligned to a page.
    pub fn new_heap() -> Result<Self, Fail> {
        let layout: Layout = match Layout::from_size_align(REGION_SIZE, 4096) {
            Ok(layout) => layout,
            Err(_) => return Err(Fail::new(libc::EINVAL, "failed to create memory layout for shared region")),
        };
        // Safety: layout has non-zero size.
        let ptr: *mut u8 = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr as *mut PortMaps) {
            Some(base) => Ok(Self::with_backing(base, Backing::Heap(layout))),
            None => {
                let cause: &str = "failed to allocate shared region";
                error!("new_heap(): {}", cause);
                Err(Fail::new(libc::ENOMEM, cause))
            },
        }
    }

    /// Creates a zeroed region in named POSIX shared memory. The name is unlinked when the region is dropped.
    #[cfg(target_os = "linux")]
    pub fn create_shm(name: &str) -> Result<Self, Fail> {
        let shm: SharedMemory = SharedMemory::create(name, REGION_SIZE)?;
        Self::from_shm(shm)
    }

    /// Maps a region created by another process. `len` must be the exact region size.
    #[cfg(target_os = "linux")]
    pub fn open_shm(name: &str, len: usize) -> Result<Self, Fail> {
        if len != REGION_SIZE {
            let cause: String = format!("bad shared region size (len={}, expected={})", len, REGION_SIZE);
            error!("open_shm(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let shm: SharedMemory = SharedMemory::open(name, len)?;
        Self::from_shm(shm)
    }

    #[cfg(target_os = "linux")]
    fn from_shm(shm: SharedMemory) -> Result<Self, Fail> {
        match NonNull::new(shm.as_mut_ptr() as *mut PortMaps) {
            Some(base) => Ok(Self::with_backing(base, Backing::Shm(shm))),
            None => Err(Fail::new(libc::EFAULT, "shared memory mapped at null")),
        }
    }

    fn with_backing(base: NonNull<PortMaps>, backing: Backing) -> Self {
        Self {
            base,
            backing,
            claims: Default::default(),
        }
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        REGION_SIZE
    }

    /// Is the region backed by named shared memory?
    pub fn is_shared(&self) -> bool {
        !matches!(self.backing, Backing::Heap(_))
    }

    /// Base address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr() as *const u8
    }

    /// Claims the vectors of `worker`. Fails with `EBUSY` if another call holds them.
    pub fn claim(&self, worker: usize) -> Result<WorkerSlot<'_>, Fail> {
        if worker >= NUM_WORKERS {
            let cause: String = format!("invalid worker (worker={})", worker);
            error!("claim(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        match self.claims[worker].compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Ok(WorkerSlot { region: self, worker }),
            Err(_) => {
                let cause: String = format!("worker slot is busy (worker={})", worker);
                warn!("claim(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
        }
    }

    /// Claims the vectors of `worker`, spinning until the current holder releases them.
    fn claim_spin(&self, worker: usize) -> WorkerSlot<'_> {
        while self.claims[worker]
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        WorkerSlot { region: self, worker }
    }

    /// Transmit availability counters of `port`.
    pub fn tx_avail(&self, port: usize) -> Result<&[AtomicU32; PIPES_PER_PORT], Fail> {
        check_port(port)?;
        // Safety: the field is in bounds, and AtomicU32 has the layout of u32.
        Ok(unsafe { &*(addr_of_mut!((*self.base.as_ptr()).maps[port].tx_avail) as *const [AtomicU32; PIPES_PER_PORT]) })
    }

    /// Zeroes the whole region. Waits for in-flight calls to release their worker slots.
    pub fn zero(&self) {
        let mut slots: Vec<WorkerSlot> = (0..NUM_WORKERS).map(|w| self.claim_spin(w)).collect();
        for slot in slots.iter_mut() {
            slot.zero();
        }
        for port in 0..NUM_PORTS {
            if let Ok(avail) = self.tx_avail(port) {
                avail.iter().for_each(|a| a.store(0, Ordering::Relaxed));
            }
        }
        // Safety: the padding is never referenced elsewhere.
        unsafe {
            let pad: *mut u8 = addr_of_mut!((*self.base.as_ptr())._pad) as *mut u8;
            ptr::write_bytes(pad, 0, REGION_SIZE - HEADER_SIZE);
        }
    }
}

impl<'a> WorkerSlot<'a> {
    /// Worker owning this slot.
    pub fn worker(&self) -> usize {
        self.worker
    }

    fn port_map(&self, port: usize) -> Result<*mut PortMap, Fail> {
        check_port(port)?;
        // Safety: port is in bounds.
        Ok(unsafe { addr_of_mut!((*self.region.base.as_ptr()).maps[port]) })
    }

    /// RX vector of `port`.
    pub fn rx(&mut self, port: usize) -> Result<&mut [FragmentDescriptor], Fail> {
        let map: *mut PortMap = self.port_map(port)?;
        // Safety: the claim grants exclusive access to this worker's vectors.
        Ok(unsafe { slice::from_raw_parts_mut(addr_of_mut!((*map).rx_vector[self.worker]) as *mut _, RXTX_VLEN) })
    }

    /// TX vector of `port`.
    pub fn tx(&mut self, port: usize) -> Result<&mut [FragmentDescriptor], Fail> {
        let map: *mut PortMap = self.port_map(port)?;
        // Safety: the claim grants exclusive access to this worker's vectors.
        Ok(unsafe { slice::from_raw_parts_mut(addr_of_mut!((*map).tx_vector[self.worker]) as *mut _, RXTX_VLEN) })
    }

    /// Allocation-request vector of `port`.
    pub fn alloc(&mut self, port: usize) -> Result<&mut [u32], Fail> {
        let map: *mut PortMap = self.port_map(port)?;
        // Safety: the claim grants exclusive access to this worker's vectors.
        Ok(unsafe { slice::from_raw_parts_mut(addr_of_mut!((*map).alloc_vector[self.worker]) as *mut _, ALLOC_VLEN) })
    }

    /// Release vector of `port`.
    pub fn release(&mut self, port: usize) -> Result<&mut [u32], Fail> {
        let map: *mut PortMap = self.port_map(port)?;
        // Safety: the claim grants exclusive access to this worker's vectors.
        Ok(unsafe { slice::from_raw_parts_mut(addr_of_mut!((*map).release_vector[self.worker]) as *mut _, VLEN) })
    }

    pub fn cache_level(&self) -> u32 {
        // Safety: in bounds, and exclusively owned through the claim.
        unsafe { ptr::read(addr_of_mut!((*self.region.base.as_ptr()).cache_level[self.worker])) }
    }

    pub fn set_cache_level(&mut self, level: u32) {
        // Safety: in bounds, and exclusively owned through the claim.
        unsafe { ptr::write(addr_of_mut!((*self.region.base.as_ptr()).cache_level[self.worker]), level) }
    }

    pub fn release_count(&self) -> u32 {
        // Safety: in bounds, and exclusively owned through the claim.
        unsafe { ptr::read(addr_of_mut!((*self.region.base.as_ptr()).release_count[self.worker])) }
    }

    pub fn set_release_count(&mut self, count: u32) {
        // Safety: in bounds, and exclusively owned through the claim.
        unsafe { ptr::write(addr_of_mut!((*self.region.base.as_ptr()).release_count[self.worker]), count) }
    }

    fn zero(&mut self) {
        for port in 0..NUM_PORTS {
            if let Ok(v) = self.rx(port) {
                v.iter_mut().for_each(|d| d.clear());
            }
            if let Ok(v) = self.tx(port) {
                v.iter_mut().for_each(|d| d.clear());
            }
            if let Ok(v) = self.alloc(port) {
                v.fill(0);
            }
            if let Ok(v) = self.release(port) {
                v.fill(0);
            }
        }
        self.set_cache_level(0);
        self.set_release_count(0);
    }
}

fn check_port(port: usize) -> Result<(), Fail> {
    if port >= NUM_PORTS {
        let cause: String = format!("invalid port (port={})", port);
        error!("check_port(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(())
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a> Drop for WorkerSlot<'a> {
    fn drop(&mut self) {
        self.region.claims[self.worker].store(false, Ordering::Release);
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Heap(layout) = self.backing {
            // Safety: the region was allocated with this layout.
            unsafe { alloc::dealloc(self.base.as_ptr() as *mut u8, layout) };
        }
    }
}

/// Send trait implementation. The region owns its backing memory.
unsafe impl Send for SharedRegion {}

/// Sync trait implementation. Per-worker data goes through claims; shared counters are atomics.
unsafe impl Sync for SharedRegion {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
