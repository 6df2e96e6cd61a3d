// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    device::{
        driver::InjectFn,
        ports::{
            MacAddress,
            PortTable,
        },
        stats::{
            self,
            DeviceStats,
            PipeStats,
        },
    },
    memory::{
        BlockTable,
        FragmentDescriptor,
    },
    runtime::{
        fail::Fail,
        limits::{
            ETH_HLEN,
            NUM_PORTS,
            PIPES_PER_PORT,
            SKB_GUARD,
        },
    },
};
use ::arc_swap::ArcSwapOption;
use ::std::{
    fmt,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Allocates the network stack buffer of an injected packet. Returns `None` when memory is exhausted.
pub type PacketAllocFn = Box<dyn Fn(usize) -> Option<PacketBuffer> + Send + Sync + 'static>;

/// Network stack packet buffer: a fixed allocation with headroom before the data and tailroom after it.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

/// Rebuilds packets out of the descriptors of an INJECT call and hands them to the network stack.
pub struct PacketInjector {
    /// Largest packet that segments may be coalesced into.
    max_packet_len: usize,
    /// Replaces the default heap allocation of packet buffers.
    allocator: ArcSwapOption<PacketAllocFn>,
}

/// Packet being assembled, with the port and pipe of its first segment.
struct Assembly {
    packet: PacketBuffer,
    port: usize,
    pipe: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PacketBuffer {
    /// Allocates an empty buffer able to hold `size` bytes.
    pub fn alloc(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            head: 0,
            tail: 0,
        }
    }

    /// Builds a buffer holding `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: data.to_vec(),
            head: 0,
            tail: data.len(),
        }
    }

    /// Moves the start of an empty buffer `len` bytes forward.
    pub fn reserve(&mut self, len: usize) {
        debug_assert!(self.is_empty());
        let head: usize = (self.head + len).min(self.buf.len());
        self.head = head;
        self.tail = head;
    }

    /// Extends the data by `len` bytes and returns the new area.
    pub fn put(&mut self, len: usize) -> Result<&mut [u8], Fail> {
        if self.tail + len > self.buf.len() {
            let cause: String = format!("no tailroom (len={}, tailroom={})", len, self.tailroom());
            warn!("put(): {}", cause);
            return Err(Fail::new(libc::ENOBUFS, &cause));
        }
        let start: usize = self.tail;
        self.tail += len;
        Ok(&mut self.buf[start..self.tail])
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.tail
    }

    /// Destination MAC address, if the buffer holds at least one.
    pub fn destination(&self) -> Option<MacAddress> {
        MacAddress::from_bytes(self.data().get(..6)?).ok()
    }

    /// Appends the data of `other`. Fails, handing `other` back, when the result would exceed `max_len`.
    pub fn try_coalesce(&mut self, other: PacketBuffer, max_len: usize) -> Result<(), PacketBuffer> {
        if self.len() + other.len() > max_len {
            return Err(other);
        }
        if other.len() <= self.tailroom() {
            self.buf[self.tail..self.tail + other.len()].copy_from_slice(other.data());
        } else {
            self.buf.truncate(self.tail);
            self.buf.extend_from_slice(other.data());
        }
        self.tail += other.len();
        Ok(())
    }

    /// Consumes the buffer and returns its data.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.truncate(self.tail);
        self.buf.drain(..self.head);
        self.buf
    }
}

impl PacketInjector {
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            max_packet_len,
            allocator: ArcSwapOption::empty(),
        }
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Installs a packet buffer allocator. `None` restores plain heap allocation.
    pub fn set_allocator(&self, allocator: Option<PacketAllocFn>) {
        self.allocator.store(allocator.map(Arc::new));
    }

    fn alloc(&self, size: usize) -> Option<PacketBuffer> {
        match Option::as_ref(&self.allocator.load()) {
            Some(allocator) => (**allocator)(size),
            None => Some(PacketBuffer::alloc(size)),
        }
    }

    /// Walks `descs`, assembling segments into packets and delivering each completed packet through `deliver`.
    ///
    /// Processing stops at the first segment addressed to an invalid or disabled pipe, or whose buffer cannot be
    /// allocated or merged; the packet being assembled is then dropped. Returns the number of segments consumed
    /// before the stop. A segment that cannot be located in the registered blocks fails the whole call.
    pub fn inject(
        &self,
        descs: &[FragmentDescriptor],
        blocks: &BlockTable,
        ports: &PortTable,
        stats: &DeviceStats,
        deliver: Option<&InjectFn>,
    ) -> Result<usize, Fail> {
        let mut current: Option<Assembly> = None;
        let mut consumed: usize = 0;

        for desc in descs {
            let port: usize = desc.port_id as usize;
            let pipe: usize = desc.pipe_id as usize;
            if port >= NUM_PORTS || pipe >= PIPES_PER_PORT {
                warn!("inject(): invalid destination (port={}, pipe={}), stopping", port, pipe);
                break;
            }
            if !ports.is_pipe_enabled(port, pipe) {
                info!("inject(): pipe not enabled (port={}, pipe={}), stopping", port, pipe);
                break;
            }

            let pre: usize = if current.is_none() { ETH_HLEN } else { 0 };
            let len: usize = desc.seg.len() as usize;
            let mut packet: PacketBuffer = match self.alloc(len + pre + 2 * SKB_GUARD) {
                Some(packet) => packet,
                None => {
                    warn!("inject(): failed to allocate packet buffer (len={})", len + pre);
                    self.drop_assembly(current.take(), stats);
                    break;
                },
            };
            packet.reserve(SKB_GUARD);
            let area: &mut [u8] = match packet.put(len + pre) {
                Ok(area) => area,
                Err(_) => {
                    self.drop_assembly(current.take(), stats);
                    break;
                },
            };
            if let Err(e) = blocks.copy_from_segment(&desc.seg, pre, area) {
                self.drop_assembly(current.take(), stats);
                return Err(e);
            }
            if pre > 0 && packet.destination().map_or(false, |mac| mac.is_multicast()) {
                stats::add(&stats.pipe(port, pipe).inject_mcast, 1);
            }
            trace!(
                "inject(): segment eop={} len={} head_len={}",
                desc.seg.eop(),
                len,
                current.as_ref().map_or(0, |a| a.packet.len())
            );

            match current.take() {
                Some(mut assembly) => match assembly.packet.try_coalesce(packet, self.max_packet_len) {
                    Ok(()) => current = Some(assembly),
                    Err(_) => {
                        warn!(
                            "inject(): failed to merge segment (len={}, head_len={}), stopping",
                            len,
                            assembly.packet.len()
                        );
                        self.drop_assembly(Some(assembly), stats);
                        break;
                    },
                },
                None => current = Some(Assembly { packet, port, pipe }),
            }
            consumed += 1;

            if desc.seg.eop() {
                if let Some(assembly) = current.take() {
                    self.deliver(assembly, ports, stats, deliver);
                }
            }
        }

        if current.is_some() {
            debug!("inject(): dropping packet without end of packet");
            self.drop_assembly(current.take(), stats);
        }
        Ok(consumed)
    }

    fn deliver(&self, assembly: Assembly, ports: &PortTable, stats: &DeviceStats, deliver: Option<&InjectFn>) {
        let (port, pipe): (usize, usize) = (assembly.port, assembly.pipe);
        let counters: &PipeStats = stats.pipe(port, pipe);
        let deliver: &InjectFn = match deliver {
            Some(deliver) => deliver,
            None => {
                warn!("deliver(): no injection callback (port={})", port);
                stats::add(&counters.inject_drops, 1);
                return;
            },
        };
        let packet: PacketBuffer = assembly.packet;
        match ports.with_context(port, |context| deliver(context, packet, pipe as u32)) {
            Some(status) => {
                stats::add(&counters.inject_pkts, 1);
                trace!("deliver(): port={} pipe={} status={}", port, pipe, status);
            },
            None => {
                warn!("deliver(): port has no context (port={})", port);
                stats::add(&counters.inject_drops, 1);
            },
        }
    }

    fn drop_assembly(&self, assembly: Option<Assembly>, stats: &DeviceStats) {
        if let Some(assembly) = assembly {
            stats::add(&stats.pipe(assembly.port, assembly.pipe).inject_drops, 1);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
