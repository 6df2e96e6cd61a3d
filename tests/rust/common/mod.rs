// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::meshbuf::{
    memory::{
        buffer_index,
        WorkerSlot,
    },
    Device,
    DeviceConfig,
    DriverOps,
    FragmentDescriptor,
    HugePageArena,
    MacAddress,
    PacketBuffer,
    PortContext,
    RegisterMap,
    SharedRegion,
    SyncCode,
    VectorSyncRequest,
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU32,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Hugepage blocks backing the test dataplane.
pub const NB_BLOCKS: usize = 4;

/// Port driven by the mock driver.
pub const PORT: u8 = 0;

/// Worker whose cache serves [PORT] under the default thread map.
pub const WORKER: u8 = 2;

/// Pipes enabled on [PORT].
pub const ENABLED_PIPES: usize = 2;

/// MAC address of [PORT].
pub const PORT_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scriptable driver. Records every call the device makes into it.
#[derive(Default)]
pub struct MockDriver {
    /// Descriptors accepted per TRANSMIT call.
    pub tx_accept: AtomicUsize,
    /// Descriptors handed over by TRANSMIT, with their pipe.
    pub transmitted: spin::Mutex<Vec<(u32, FragmentDescriptor)>>,
    /// Batches returned by successive RECEIVE polls.
    pub rx_script: spin::Mutex<VecDeque<Vec<FragmentDescriptor>>>,
    /// Transmit availability reported for every pipe.
    pub tx_avail: AtomicU32,
    pub tx_complete_calls: AtomicUsize,
    pub cancel_dma_calls: AtomicUsize,
    /// Packets delivered by INJECT, with their pipe.
    pub injected: spin::Mutex<Vec<(u32, Vec<u8>)>>,
}

/// Device wired to a [MockDriver] and a registered hugepage arena, with [PORT] and its first pipes enabled.
pub struct Test {
    pub arena: Arc<HugePageArena>,
    pub driver: Arc<MockDriver>,
    pub device: Device,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let driver: MockDriver = MockDriver::default();
        driver.tx_accept.store(usize::MAX, Ordering::Relaxed);
        Arc::new(driver)
    }

    /// Builds the callbacks of this driver.
    pub fn ops(self: &Arc<Self>) -> DriverOps {
        let (tx, rx, avail, complete, cancel, inject) = (
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        );
        DriverOps::new()
            .with_transmit(
                move |_: &Device, _: &PortContext, pipe: u32, descs: &mut [FragmentDescriptor], _: bool| {
                    let n: usize = descs.len().min(tx.tx_accept.load(Ordering::Relaxed));
                    tx.transmitted.lock().extend(descs[..n].iter().map(|d| (pipe, *d)));
                    n
                },
            )
            .with_receive(move |_: &Device, _: &PortContext, out: &mut [FragmentDescriptor], _: bool| {
                let batch: Vec<FragmentDescriptor> = match rx.rx_script.lock().pop_front() {
                    Some(batch) => batch,
                    None => return 0,
                };
                let n: usize = batch.len().min(out.len());
                out[..n].copy_from_slice(&batch[..n]);
                n
            })
            .with_tx_avail(move |_: &Device, _: &PortContext, out: &mut [u32; 16]| {
                out.fill(avail.tx_avail.load(Ordering::Relaxed));
            })
            .with_tx_complete(move |_: &Device, _: &PortContext| {
                complete.tx_complete_calls.fetch_add(1, Ordering::Relaxed);
            })
            .with_cancel_dma(move |_: &Device, _: &PortContext| {
                cancel.cancel_dma_calls.fetch_add(1, Ordering::Relaxed);
            })
            .with_inject(move |_: &PortContext, packet: PacketBuffer, pipe: u32| {
                inject.injected.lock().push((pipe, packet.into_vec()));
                0
            })
    }

    /// Queues a batch for the next RECEIVE poll.
    pub fn script_rx(&self, batch: Vec<FragmentDescriptor>) {
        self.rx_script.lock().push_back(batch);
    }

    pub fn transmitted_count(&self) -> usize {
        self.transmitted.lock().len()
    }
}

impl Test {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let arena: Arc<HugePageArena> = Arc::new(HugePageArena::new(NB_BLOCKS)?);
        let device: Device = Device::new(config, arena.clone())?;
        let driver: Arc<MockDriver> = MockDriver::new();
        device.register_driver(Some(driver.ops()));

        let context: PortContext = Arc::new(PORT);
        device.port_state(context, PORT as usize, PORT_MAC, true)?;
        for pipe in 0..ENABLED_PIPES {
            let peer: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x01, pipe as u8]);
            device.pipe_state(PORT as usize, pipe, Some(peer), true)?;
        }
        Ok(Self { arena, driver, device })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    /// Registration record describing the arena.
    pub fn register_map(&self) -> RegisterMap {
        RegisterMap::new(self.arena.virtual_base(), self.arena.physical_addresses())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Buffer index of the `n`-th 4 KiB buffer of the arena.
pub fn nth_buffer(n: usize) -> u32 {
    let per_block: usize = (1 << 21) / 4096;
    buffer_index((n / per_block) % NB_BLOCKS, (n % per_block) * 4096)
}

/// Writes `indices` into the allocation-request vector of `worker` for `port`.
pub fn post_alloc(region: &SharedRegion, worker: u8, port: u8, indices: &[u32]) -> Result<()> {
    let mut slot: WorkerSlot = region.claim(worker as usize)?;
    slot.alloc(port as usize)?[..indices.len()].copy_from_slice(indices);
    Ok(())
}

/// Writes `descs` into the TX vector of `worker` for `port`.
pub fn post_tx(region: &SharedRegion, worker: u8, port: u8, descs: &[FragmentDescriptor]) -> Result<()> {
    let mut slot: WorkerSlot = region.claim(worker as usize)?;
    slot.tx(port as usize)?[..descs.len()].copy_from_slice(descs);
    Ok(())
}

/// Reads back the cache level and the released indices of `worker` for `port`.
pub fn read_release(region: &SharedRegion, worker: u8, port: u8) -> Result<(u32, Vec<u32>)> {
    let mut slot: WorkerSlot = region.claim(worker as usize)?;
    let count: usize = slot.release_count() as usize;
    let level: u32 = slot.cache_level();
    Ok((level, slot.release(port as usize)?[..count].to_vec()))
}

/// Reads the first `n` entries of the RX vector of `worker` for `port`.
pub fn read_rx(region: &SharedRegion, worker: u8, port: u8, n: usize) -> Result<Vec<FragmentDescriptor>> {
    let mut slot: WorkerSlot = region.claim(worker as usize)?;
    Ok(slot.rx(port as usize)?[..n].to_vec())
}

/// Builds a RECEIVE request taking in `alloc_size` allocated buffers.
pub fn receive(size: u16, alloc_size: u16) -> VectorSyncRequest {
    VectorSyncRequest::new(SyncCode::Receive, WORKER, PORT, 0, size).with_alloc_size(alloc_size)
}

/// Builds a TRANSMIT request on `pipe`.
pub fn transmit(pipe: u8, size: u16) -> VectorSyncRequest {
    VectorSyncRequest::new(SyncCode::Transmit, WORKER, PORT, pipe, size)
}

/// Builds an INJECT request.
pub fn inject(size: u16) -> VectorSyncRequest {
    VectorSyncRequest::new(SyncCode::Inject, WORKER, PORT, 0, size)
}

/// Builds the descriptor of a `len`-byte segment stored in the `n`-th buffer, addressed to `pipe` of [PORT].
pub fn segment(n: usize, pipe: u8, len: u16, eop: bool) -> FragmentDescriptor {
    let mut desc: FragmentDescriptor = FragmentDescriptor::free_buffer(nth_buffer(n), 256);
    desc.seg.set_len(len);
    desc.seg.set_eop(eop);
    desc.port_id = PORT;
    desc.pipe_id = pipe;
    desc
}
