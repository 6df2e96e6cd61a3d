// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Zero-copy buffer exchange device.
//!
//! A [Device] sits between a radio driver and one userspace dataplane. The driver binds its [DriverOps] and reports
//! port and pipe state; the dataplane opens a [Session], registers its hugepage memory, maps the shared region, and
//! issues one vector-sync call per worker and poll iteration.

pub mod abi;
pub mod driver;
pub mod inject;
pub mod ports;
pub mod stats;
pub mod sync;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::DeviceConfig,
    device::{
        abi::{
            RegisterMap,
            ThreadMap,
            VectorSyncRequest,
            IOCTL_GET_PORTS,
            IOCTL_REGISTER_MAP,
            IOCTL_THREAD_MAP,
            IOCTL_VECTOR_SYNC,
            PORT_LIST_SIZE,
        },
        driver::DriverOps,
        inject::PacketInjector,
        ports::{
            MacAddress,
            PortContext,
            PortList,
            PortTable,
        },
        stats::{
            DeviceStats,
            StatsSnapshot,
        },
        sync::VectorSyncDispatcher,
    },
    memory::{
        BlockTable,
        BufferAddress,
        DescriptorCache,
        FragmentDescriptor,
        PhysToVirt,
        SharedRegion,
        REGION_SIZE,
    },
    pal::arch::CacheAligned,
    runtime::{
        fail::Fail,
        limits::{
            NUM_PORTS,
            NUM_WORKERS,
        },
    },
};
use ::arc_swap::{
    ArcSwap,
    ArcSwapOption,
    Guard,
};
use ::std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Commands accepted by [Session::ioctl].
pub enum Command<'a> {
    /// Copies the port list out.
    GetPorts(&'a mut PortList),
    VectorSync(VectorSyncRequest),
    RegisterMap(&'a RegisterMap),
    ThreadMap(ThreadMap),
}

/// Wake-up reasons of a dataplane waiting on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollEvents {
    /// The device is going away.
    pub exiting: bool,
    /// Port or pipe state changed.
    pub state_pending: bool,
}

/// State serialized by the control-plane lock.
#[derive(Default)]
struct ControlState {
    /// Is a dataplane attached?
    user: bool,
    /// Is a driver bound?
    driver_bound: bool,
}

/// Buffer exchange device.
pub struct Device {
    config: DeviceConfig,
    region: SharedRegion,
    /// Descriptor cache of each worker.
    caches: Box<[CacheAligned<DescriptorCache>]>,
    blocks: ArcSwap<BlockTable>,
    /// Is a user memory map registered?
    mapped: AtomicBool,
    ports: PortTable,
    stats: DeviceStats,
    driver: ArcSwapOption<DriverOps>,
    injector: PacketInjector,
    control: spin::Mutex<ControlState>,
    exiting: AtomicBool,
    state_pending: AtomicBool,
    /// Translates the physical addresses of registered pages.
    memory: Arc<dyn PhysToVirt>,
}

/// Dataplane attachment to a device. Dropping it detaches the dataplane and discards every buffer it handed over.
pub struct Session<'a> {
    device: &'a Device,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Device {
    /// Creates a device whose shared region lives on the heap.
    pub fn new(config: DeviceConfig, memory: Arc<dyn PhysToVirt>) -> Result<Self, Fail> {
        let region: SharedRegion = SharedRegion::new_heap()?;
        Self::with_region(config, region, memory)
    }

    /// Creates a device on top of an existing shared region. The region is zeroed.
    pub fn with_region(config: DeviceConfig, region: SharedRegion, memory: Arc<dyn PhysToVirt>) -> Result<Self, Fail> {
        config.validate()?;

        let mut caches: Vec<CacheAligned<DescriptorCache>> = Vec::with_capacity(NUM_WORKERS);
        for _ in 0..NUM_WORKERS {
            caches.push(CacheAligned(DescriptorCache::new(config.cache_capacity, config.lock_policy)?));
        }

        let ports: PortTable = PortTable::new();
        ports.set_thread_map(config.thread_map)?;
        region.zero();

        info!(
            "new(): lock_policy={:?} cache_capacity={} thread_map={:?} shared={}",
            config.lock_policy,
            config.cache_capacity,
            config.thread_map,
            region.is_shared()
        );

        Ok(Self {
            injector: PacketInjector::new(config.max_packet_len),
            config,
            region,
            caches: caches.into_boxed_slice(),
            blocks: ArcSwap::from_pointee(BlockTable::new()),
            mapped: AtomicBool::new(false),
            ports,
            stats: DeviceStats::new(),
            driver: ArcSwapOption::empty(),
            control: spin::Mutex::new(ControlState::default()),
            exiting: AtomicBool::new(false),
            state_pending: AtomicBool::new(false),
            memory,
        })
    }

    //==================================================================================================================
    // Control Interface
    //==================================================================================================================

    /// Attaches a dataplane. Only one dataplane may be attached at a time.
    pub fn open(&self) -> Result<Session<'_>, Fail> {
        let mut control = self.control.lock();
        if control.user {
            let cause: &str = "device already in use";
            warn!("open(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, cause));
        }
        control.user = true;
        self.exiting.store(false, Ordering::Relaxed);
        debug!("open(): dataplane attached");
        Ok(Session { device: self })
    }

    fn release(&self) {
        debug!("release(): dataplane detached");
        let mut control = self.control.lock();
        if control.user {
            self.on_user_disconnect();
            control.user = false;
        }
        self.exiting.store(true, Ordering::Relaxed);
    }

    /// Returns and clears pending wake-up reasons.
    pub fn poll_events(&self) -> PollEvents {
        PollEvents {
            exiting: self.exiting.swap(false, Ordering::AcqRel),
            state_pending: self.state_pending.swap(false, Ordering::AcqRel),
        }
    }

    //==================================================================================================================
    // Driver Interface
    //==================================================================================================================

    /// Binds `ops`, or unbinds the current driver if `ops` is `None`. Only one driver may be bound at a time.
    pub fn register_driver(&self, ops: Option<DriverOps>) {
        let mut control = self.control.lock();
        match (control.driver_bound, ops) {
            (false, Some(ops)) => {
                info!("register_driver(): {:?}", ops);
                self.driver.store(Some(Arc::new(ops)));
                control.driver_bound = true;
            },
            (true, None) => {
                info!("register_driver(): driver unbound");
                self.driver.store(None);
                control.driver_bound = false;
            },
            (bound, ops) => {
                error!(
                    "register_driver(): ignoring request (bound={}, ops={})",
                    bound,
                    if ops.is_some() { "some" } else { "none" }
                );
            },
        }
    }

    /// Reports the state of a port. See [PortTable::port_state].
    pub fn port_state(&self, context: PortContext, port: usize, mac: MacAddress, enable: bool) -> Result<(), Fail> {
        self.ports.port_state(context, port, mac, enable)?;
        self.state_pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Reports the state of a pipe. See [PortTable::pipe_state].
    pub fn pipe_state(&self, port: usize, pipe: usize, mac: Option<MacAddress>, enable: bool) -> Result<(), Fail> {
        self.ports.pipe_state(port, pipe, mac, enable)?;
        self.state_pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Takes a free buffer for the receive ring of `port`. Fails if the port is disabled or its cache is empty.
    pub fn alloc_descriptor(&self, port: usize) -> Option<FragmentDescriptor> {
        if !self.ports.is_port_enabled(port) {
            return None;
        }
        self.cache_for(port).dequeue()
    }

    /// Returns a buffer released by `port`, typically on transmit completion, to the cache serving that port.
    ///
    /// Without a registered user map, or on a disabled port, the buffer is forgotten.
    pub fn free_descriptor(&self, mut desc: FragmentDescriptor, port: usize) {
        if !self.mapped.load(Ordering::Acquire) {
            trace!("free_descriptor(): no user map, forgetting buffer {}", desc.seg.lo());
            return;
        }
        if !self.ports.is_port_enabled(port) {
            debug!("free_descriptor(): port disabled, forgetting buffer (port={})", port);
            return;
        }
        stats::add(&self.stats.port(port).driver_free, 1);
        desc.seg.set_offset(self.config.data_headroom);
        self.cache_for(port).enqueue(desc);
    }

    /// Locates the buffer of `desc`. Fails with `EFAULT` without a registered user map.
    pub fn descriptor_address(&self, desc: &FragmentDescriptor) -> Result<BufferAddress, Fail> {
        self.ensure_mapped("descriptor_address")?;
        self.blocks.load().resolve(desc.seg.lo())
    }

    /// Copies the payload of `desc` into the front of `dst`. Returns the number of bytes copied.
    pub fn copy_payload(&self, desc: &FragmentDescriptor, dst: &mut [u8]) -> Result<usize, Fail> {
        self.ensure_mapped("copy_payload")?;
        self.blocks.load().copy_from_segment(&desc.seg, 0, dst)
    }

    /// Writes `src` into the payload area of `desc`. `src` must fit in the segment length.
    pub fn fill_payload(&self, desc: &FragmentDescriptor, src: &[u8]) -> Result<(), Fail> {
        self.ensure_mapped("fill_payload")?;
        self.blocks.load().copy_to_segment(&desc.seg, src)
    }

    /// Fails with `EFAULT` unless a user map is registered. Blocks kept after a disconnect belong to a dataplane that
    /// went away.
    fn ensure_mapped(&self, function: &str) -> Result<(), Fail> {
        if self.mapped.load(Ordering::Acquire) {
            return Ok(());
        }
        let cause: &str = "no user memory map registered";
        error!("{}(): {}", function, cause);
        Err(Fail::new(libc::EFAULT, cause))
    }

    //==================================================================================================================
    // Lifecycle
    //==================================================================================================================

    /// Registers the hugepage blocks of the dataplane.
    pub fn register_user_map(&self, map: &RegisterMap) -> Result<(), Fail> {
        let mut table: BlockTable = BlockTable::new();
        table.register(&map.pages, self.memory.clone())?;
        info!(
            "register_user_map(): virt={:#x} n_pages={}",
            map.virt,
            map.pages.len()
        );
        self.blocks.store(Arc::new(table));
        self.mapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Discards every buffer of a dataplane that went away: stops DMA, empties the caches, and zeroes the shared
    /// region. The block table is kept; see [Device::forget_blocks].
    pub fn on_user_disconnect(&self) {
        info!("on_user_disconnect(): reclaiming dataplane buffers");
        self.mapped.store(false, Ordering::SeqCst);

        let driver: Guard<Option<Arc<DriverOps>>> = self.driver.load();
        if let Some(cancel_dma) = Option::as_ref(&driver).and_then(|ops| ops.cancel_dma.as_ref()) {
            for port in 0..NUM_PORTS {
                self.ports.with_context(port, |context| cancel_dma(self, context));
            }
        }

        for cache in self.caches.iter() {
            cache.reset();
        }
        self.region.zero();

        if self.mapped.load(Ordering::SeqCst) {
            warn!("on_user_disconnect(): user map registered again during reclaim");
        }
    }

    /// Drops every registered block.
    pub fn forget_blocks(&self) {
        self.blocks.store(Arc::new(BlockTable::new()));
    }

    //==================================================================================================================
    // Accessors
    //==================================================================================================================

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Is a user memory map registered?
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Number of registered blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.load().count()
    }

    /// Descriptor cache of `worker`.
    pub fn cache(&self, worker: usize) -> Option<&DescriptorCache> {
        self.caches.get(worker).map(|cache| &cache.0)
    }

    /// Descriptor cache serving `port`.
    fn cache_for(&self, port: usize) -> &DescriptorCache {
        &self.caches[self.ports.worker_for(port)].0
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn injector(&self) -> &PacketInjector {
        &self.injector
    }
}

impl<'a> Session<'a> {
    pub fn device(&self) -> &'a Device {
        self.device
    }

    /// Executes a command. Returns the count produced by the command, or a negative error code.
    pub fn ioctl(&self, command: Command<'_>) -> i64 {
        let result: Result<usize, Fail> = match command {
            Command::GetPorts(out) => {
                *out = self.device.ports.snapshot();
                Ok(0)
            },
            Command::VectorSync(request) => self.vector_sync(&request),
            Command::RegisterMap(map) => self.device.register_user_map(map).map(|_| 0),
            Command::ThreadMap(map) => self.device.ports.set_thread_map(map.thread).map(|_| 0),
        };
        match result {
            Ok(n) => n as i64,
            Err(e) => e.to_retval(),
        }
    }

    /// Executes a command given as a control-call number and its binary record. Results are written back into `arg`.
    pub fn ioctl_raw(&self, number: u32, arg: &mut [u8]) -> i64 {
        let command: Result<Command, Fail> = match number {
            IOCTL_GET_PORTS => {
                if arg.len() < PORT_LIST_SIZE {
                    let cause: String = format!("port list buffer too short (len={})", arg.len());
                    error!("ioctl_raw(): {}", cause);
                    return Fail::new(libc::EFAULT, &cause).to_retval();
                }
                let list: PortList = self.device.ports.snapshot();
                arg[..PORT_LIST_SIZE].copy_from_slice(&list.to_bytes());
                return 0;
            },
            IOCTL_VECTOR_SYNC => VectorSyncRequest::from_bytes(arg).map(Command::VectorSync),
            IOCTL_REGISTER_MAP => {
                return match RegisterMap::from_bytes(arg) {
                    Ok(map) => self.ioctl(Command::RegisterMap(&map)),
                    Err(e) => e.to_retval(),
                }
            },
            IOCTL_THREAD_MAP => ThreadMap::from_bytes(arg).map(Command::ThreadMap),
            _ => {
                let cause: String = format!("unknown control call (number={:#x})", number);
                error!("ioctl_raw(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        };
        match command {
            Ok(command) => self.ioctl(command),
            Err(e) => e.to_retval(),
        }
    }

    /// Executes a vector-sync call.
    pub fn vector_sync(&self, request: &VectorSyncRequest) -> Result<usize, Fail> {
        VectorSyncDispatcher::new(self.device).dispatch(request)
    }

    /// Maps the shared region. `len` must be the exact region size.
    pub fn map_region(&self, len: usize) -> Result<&'a SharedRegion, Fail> {
        if len != REGION_SIZE {
            let cause: String = format!("incorrect size (len={}, expected={})", len, REGION_SIZE);
            error!("map_region(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(&self.device.region)
    }

    pub fn poll_events(&self) -> PollEvents {
        self.device.poll_events()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a> Drop for Session<'a> {
    fn drop(&mut self) {
        self.device.release();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
