// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Topology
//======================================================================================================================

/// Number of ports (radio sectors) a device exposes.
pub const NUM_PORTS: usize = 4;

/// Number of pipes (peers) per port.
pub const PIPES_PER_PORT: usize = 16;

/// Number of dataplane workers. Must match the number of cores participating in the datapath.
pub const NUM_WORKERS: usize = 4;

/// Default port-to-worker cache mapping: every port on worker 2.
pub const DEFAULT_THREAD_MAP: [u8; NUM_PORTS] = [2, 2, 2, 2];

//======================================================================================================================
// Vectors
//======================================================================================================================

/// Vector length. Must match the dataplane vector length.
pub const VLEN: usize = 256;

/// Maximum number of segments in one packet DMA chain.
pub const MAX_SEGMENTS_IN_PACKET: usize = 8;

/// Length of the RX and TX descriptor vectors.
pub const RXTX_VLEN: usize = VLEN + MAX_SEGMENTS_IN_PACKET;

/// Maximum number of buffer indices handed over in one allocation request.
pub const ALLOC_VLEN: usize = 1024;

//======================================================================================================================
// Buffers
//======================================================================================================================

/// Network buffer size, matching the dataplane buffer size.
pub const BUF_SIZE: usize = 4096;

/// Number of network buffers in the pool. Also the default descriptor cache capacity.
pub const NB_BUFFERS: usize = 32768;

/// Maximum number of hugepage blocks backing the network buffers.
pub const MAX_NB_BLOCK: usize = 128;

/// Log2 of the block size. Must match the hugepage size.
pub const BLOCK_BITS: u32 = 21;

/// Block size, one 2 MiB hugepage.
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;

/// A buffer index counts 64-byte cache lines from the start of the buffer memory.
pub const LO_SHIFT: u32 = 6;

/// Offset from the start of a buffer to its packet data: buffer metadata followed by pre-data headroom.
pub const DATA_HEADROOM: u16 = 256;

//======================================================================================================================
// Descriptor cache flow control
//======================================================================================================================

/// Cache occupancy above which descriptors are handed back to the dataplane.
pub const THRESHOLD_HIGH: usize = 8 * 1024;

/// Documented low occupancy mark. There is no refill path keyed on it; allocation is driven by the dataplane.
pub const THRESHOLD_LOW: usize = 4 * 1024;

/// Number of descriptors handed back per release.
pub const RELEASE_BATCH: usize = VLEN;

//======================================================================================================================
// Packet injection
//======================================================================================================================

/// Guard margin reserved at both ends of an injected packet buffer.
pub const SKB_GUARD: usize = 128;

/// Length of the link-layer header carried in front of the first segment of an injected packet.
pub const ETH_HLEN: usize = 14;

/// Default upper bound of an assembled injected packet.
pub const MAX_PACKET_LEN: usize = 65535;

const_assert!(NB_BUFFERS.is_power_of_two());
const_assert!(THRESHOLD_LOW < THRESHOLD_HIGH && THRESHOLD_HIGH < NB_BUFFERS);
const_assert!(MAX_NB_BLOCK * BLOCK_SIZE >= NB_BUFFERS * BUF_SIZE);
