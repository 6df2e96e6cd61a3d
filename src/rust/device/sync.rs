// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Vector-sync protocol.
//!
//! A dataplane worker issues one vector-sync call per poll iteration. The call exchanges descriptors through the
//! vectors of the worker's slot in the shared region and through the descriptor cache that the thread map assigns to
//! the addressed port.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    device::{
        abi::{
            SyncCode,
            VectorSyncRequest,
        },
        driver::{
            DriverOps,
            ReceiveFn,
        },
        stats::{
            self,
            PipeStats,
            PortStats,
        },
        Device,
    },
    memory::{
        descriptor::MAX_LO,
        BlockTable,
        DescriptorCache,
        FragmentDescriptor,
        WorkerSlot,
    },
    runtime::{
        fail::Fail,
        limits::{
            ALLOC_VLEN,
            NUM_PORTS,
            PIPES_PER_PORT,
            RXTX_VLEN,
        },
    },
};
use ::arc_swap::Guard;
use ::std::sync::{
    atomic::{
        AtomicU32,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Executes vector-sync calls against a device.
pub struct VectorSyncDispatcher<'a> {
    device: &'a Device,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> VectorSyncDispatcher<'a> {
    pub fn new(device: &'a Device) -> Self {
        Self { device }
    }

    /// Executes `request`. Returns the number of descriptors transmitted, received, or injected.
    pub fn dispatch(&self, request: &VectorSyncRequest) -> Result<usize, Fail> {
        let port: usize = request.port as usize;
        let pipe: usize = request.pipe as usize;
        if port >= NUM_PORTS || pipe >= PIPES_PER_PORT {
            let cause: String = format!("invalid port or pipe (port={}, pipe={})", port, pipe);
            error!("dispatch(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        if self.device.config.sync_debug {
            debug!(
                "dispatch(): size={} code={} worker={} port={} pipe={} alloc_size={}",
                request.size, request.code, request.worker, port, pipe, request.alloc_size
            );
        }

        let code: SyncCode = request.sync_code()?;
        let size: usize = request.size as usize;
        if size > RXTX_VLEN {
            let cause: String = format!("vector too long (size={}, max={})", size, RXTX_VLEN);
            error!("dispatch(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        match code {
            SyncCode::Transmit => {
                let mut slot: WorkerSlot = self.device.region.claim(request.worker as usize)?;
                self.transmit(&mut slot, port, pipe, size)
            },
            SyncCode::Receive => {
                let alloc_size: usize = request.alloc_size as usize;
                if alloc_size > ALLOC_VLEN {
                    let cause: String = format!("allocation vector too long (alloc_size={})", alloc_size);
                    error!("dispatch(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
                let mut slot: WorkerSlot = self.device.region.claim(request.worker as usize)?;
                self.receive(&mut slot, port, size, alloc_size)
            },
            SyncCode::Inject => {
                let mut slot: WorkerSlot = self.device.region.claim(request.worker as usize)?;
                self.inject(&mut slot, port, size)
            },
            SyncCode::Allocate | SyncCode::Free => {
                let cause: String = format!("operation not implemented (code={:?})", code);
                error!("dispatch(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Hands the first `size` descriptors of the TX vector to the driver. Descriptors the driver does not take are
    /// counted as drops.
    fn transmit(&self, slot: &mut WorkerSlot, port: usize, pipe: usize, size: usize) -> Result<usize, Fail> {
        let port_stats: &PortStats = self.device.stats.port(port);
        stats::add(&port_stats.vector_sync_tx, 1);

        if size == 0 {
            return Ok(0);
        }
        if !self.device.ports.is_pipe_enabled(port, pipe) {
            stats::add(&port_stats.tx_black_hole, size as u64);
            return Ok(0);
        }

        let driver: Guard<Option<Arc<DriverOps>>> = self.device.driver.load();
        let descs: &mut [FragmentDescriptor] = &mut slot.tx(port)?[..size];
        let sent: usize = match Option::as_ref(&driver).and_then(|ops| ops.transmit.as_ref()) {
            Some(transmit) => self
                .device
                .ports
                .with_context(port, |context| {
                    transmit(self.device, context, pipe as u32, descs, self.device.config.tx_debug)
                })
                .unwrap_or(0)
                .min(size),
            None => 0,
        };

        let pipe_stats: &PipeStats = &port_stats.pipes[pipe];
        stats::add(&pipe_stats.pkts_from_dataplane, sent as u64);
        if sent < size {
            stats::add(&pipe_stats.drops_from_dataplane, (size - sent) as u64);
        }
        Ok(sent)
    }

    /// Takes in allocated buffers, polls the driver, and hands excess cached descriptors back to the dataplane.
    fn receive(&self, slot: &mut WorkerSlot, port: usize, size: usize, alloc_size: usize) -> Result<usize, Fail> {
        let device: &Device = self.device;
        let port_stats: &PortStats = device.stats.port(port);
        stats::add(&port_stats.vector_sync_rx, 1);
        let cache: &DescriptorCache = device.cache_for(port);

        // Allocated buffers.
        if alloc_size > 0 {
            device.ensure_mapped("receive")?;
            let blocks: Guard<Arc<BlockTable>> = device.blocks.load();
            let indices: &mut [u32] = &mut slot.alloc(port)?[..alloc_size];
            for index in indices.iter() {
                blocks.resolve(*index)?;
            }
            // Bits above the buffer index are not part of the address.
            for index in indices.iter() {
                cache.enqueue(FragmentDescriptor::free_buffer(*index & MAX_LO, device.config.data_headroom));
            }
            slot.set_cache_level(cache.size());
        }

        // Receive.
        let driver: Guard<Option<Arc<DriverOps>>> = device.driver.load();
        let (ops, receive): (&DriverOps, &ReceiveFn) = match Option::as_ref(&driver) {
            Some(ops) if device.ports.is_port_enabled(port) => match ops.receive.as_ref() {
                Some(receive) => (ops, receive),
                None => return Err(not_ready(port)),
            },
            _ => return Err(not_ready(port)),
        };
        let rx: &mut [FragmentDescriptor] = &mut slot.rx(port)?[..size];
        let received: usize = match device
            .ports
            .with_context(port, |context| receive(device, context, rx, device.config.rx_debug))
        {
            Some(n) => n.min(size),
            None => return Err(Fail::new(libc::ENODEV, "port lost its context")),
        };
        stats::add(&port_stats.pkts_from_driver, received as u64);

        // Transmit completion.
        if let Some(tx_complete) = ops.tx_complete.as_ref() {
            device.ports.with_context(port, |context| tx_complete(device, context));
        }

        // Transmit availability.
        if let Some(tx_avail) = ops.tx_avail.as_ref() {
            let mut avail: [u32; PIPES_PER_PORT] = [0; PIPES_PER_PORT];
            if device
                .ports
                .with_context(port, |context| tx_avail(device, context, &mut avail))
                .is_some()
            {
                let shared: &[AtomicU32; PIPES_PER_PORT] = device.region.tx_avail(port)?;
                for (dst, src) in shared.iter().zip(avail.iter()) {
                    dst.store(*src, Ordering::Relaxed);
                }
            }
        }

        // Release excess descriptors.
        let supply: usize = cache.size() as usize;
        let released: usize = if supply > device.config.high_watermark {
            let release: &mut [u32] = slot.release(port)?;
            let batch: usize = device.config.release_batch.min(supply).min(release.len());
            let mut count: usize = 0;
            while count < batch {
                match cache.dequeue() {
                    Some(desc) => {
                        release[count] = desc.seg.lo();
                        count += 1;
                    },
                    None => break,
                }
            }
            stats::add(&port_stats.free_to_dataplane, count as u64);
            count
        } else {
            0
        };
        slot.set_release_count(released as u32);
        slot.set_cache_level(cache.size());

        Ok(received)
    }

    /// Injects the packets described by the first `size` descriptors of the TX vector into the network stack.
    fn inject(&self, slot: &mut WorkerSlot, port: usize, size: usize) -> Result<usize, Fail> {
        let device: &Device = self.device;
        if size > 0 {
            device.ensure_mapped("inject")?;
        }
        let driver: Guard<Option<Arc<DriverOps>>> = device.driver.load();
        let blocks: Guard<Arc<BlockTable>> = device.blocks.load();
        let descs: &[FragmentDescriptor] = &slot.tx(port)?[..size];
        device.injector.inject(
            descs,
            &blocks,
            &device.ports,
            &device.stats,
            Option::as_ref(&driver).and_then(|ops| ops.inject.as_ref()),
        )
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn not_ready(port: usize) -> Fail {
    let cause: String = format!("port not ready (port={})", port);
    debug!("receive(): {}", cause);
    Fail::new(libc::ENODEV, &cause)
}
