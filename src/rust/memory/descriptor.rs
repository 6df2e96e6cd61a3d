// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Packet segment descriptors exchanged between the driver and the dataplane.
//!
//! A segment descriptor is a single 64-bit word. Fields are packed least-significant bit first:
//!
//! | bits    | field        | width |
//! |---------|--------------|-------|
//! | 0..24   | `lo`         | 24    |
//! | 24..28  | `hi`         | 4     |
//! | 28..32  | `flags`      | 4     |
//! | 32..46  | `len`        | 14    |
//! | 46      | `eop`        | 1     |
//! | 47      | `special`    | 1     |
//! | 48..62  | `offset`     | 14    |
//! | 62..64  | `meta_flags` | 2     |
//!
//! The layout is an ABI shared with another address space, so it is encoded with shifts and masks rather than relying
//! on any compiler bitfield layout.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::static_assertions::{
    assert_eq_size,
    const_assert_eq,
};
use ::std::fmt;

//======================================================================================================================
// Constants
//======================================================================================================================

const LO_SHIFT: u32 = 0;
const LO_BITS: u32 = 24;
const HI_SHIFT: u32 = 24;
const HI_BITS: u32 = 4;
const FLAGS_SHIFT: u32 = 28;
const FLAGS_BITS: u32 = 4;
const LEN_SHIFT: u32 = 32;
const LEN_BITS: u32 = 14;
const EOP_SHIFT: u32 = 46;
const SPECIAL_SHIFT: u32 = 47;
const OFFSET_SHIFT: u32 = 48;
const OFFSET_BITS: u32 = 14;
const META_FLAGS_SHIFT: u32 = 62;
const META_FLAGS_BITS: u32 = 2;

/// Largest buffer index a descriptor can carry.
pub const MAX_LO: u32 = (1 << LO_BITS) - 1;

/// Largest segment length a descriptor can carry.
pub const MAX_LEN: u16 = (1 << LEN_BITS) - 1;

/// Largest intra-buffer offset a descriptor can carry.
pub const MAX_OFFSET: u16 = (1 << OFFSET_BITS) - 1;

const_assert_eq!(OFFSET_SHIFT + OFFSET_BITS, META_FLAGS_SHIFT);
const_assert_eq!(META_FLAGS_SHIFT + META_FLAGS_BITS, 64);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Packet segment descriptor.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SegmentDescriptor(u64);

/// Packet fragment descriptor: a segment descriptor plus its routing metadata.
///
/// `chain_len` and `total_len` are scratch fields for the producing side; they carry no meaning across the boundary.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct FragmentDescriptor {
    pub seg: SegmentDescriptor,
    pub port_id: u8,
    pub pipe_id: u8,
    pub flow_id: u16,
    pub chain_len: u16,
    pub total_len: u16,
}

// Four fragment descriptors fill one 64-byte cache line.
assert_eq_size!(SegmentDescriptor, u64);
assert_eq_size!(FragmentDescriptor, [u64; 2]);
const_assert_eq!(::std::mem::align_of::<FragmentDescriptor>(), 16);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

#[inline(always)]
const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

impl SegmentDescriptor {
    /// Creates a segment descriptor for buffer `lo`, with payload at `offset` spanning `len` bytes.
    pub fn new(lo: u32, offset: u16, len: u16) -> Self {
        let mut seg: Self = Self(0);
        seg.set_lo(lo);
        seg.set_offset(offset);
        seg.set_len(len);
        seg
    }

    /// Reinterprets a raw 64-bit word.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw 64-bit word.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn get(&self, shift: u32, bits: u32) -> u64 {
        (self.0 >> shift) & mask(bits)
    }

    #[inline(always)]
    fn set(&mut self, shift: u32, bits: u32, value: u64) {
        debug_assert!(value <= mask(bits), "value {:#x} overflows a {}-bit field", value, bits);
        self.0 = (self.0 & !(mask(bits) << shift)) | ((value & mask(bits)) << shift);
    }

    /// Buffer index.
    pub fn lo(&self) -> u32 {
        self.get(LO_SHIFT, LO_BITS) as u32
    }

    pub fn set_lo(&mut self, lo: u32) {
        self.set(LO_SHIFT, LO_BITS, lo as u64)
    }

    /// Block-selector extension of the buffer index.
    pub fn hi(&self) -> u8 {
        self.get(HI_SHIFT, HI_BITS) as u8
    }

    pub fn set_hi(&mut self, hi: u8) {
        self.set(HI_SHIFT, HI_BITS, hi as u64)
    }

    pub fn flags(&self) -> u8 {
        self.get(FLAGS_SHIFT, FLAGS_BITS) as u8
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.set(FLAGS_SHIFT, FLAGS_BITS, flags as u64)
    }

    /// Segment length in bytes.
    pub fn len(&self) -> u16 {
        self.get(LEN_SHIFT, LEN_BITS) as u16
    }

    pub fn set_len(&mut self, len: u16) {
        self.set(LEN_SHIFT, LEN_BITS, len as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is this the last segment of its packet?
    pub fn eop(&self) -> bool {
        self.get(EOP_SHIFT, 1) != 0
    }

    pub fn set_eop(&mut self, eop: bool) {
        self.set(EOP_SHIFT, 1, eop as u64)
    }

    pub fn special(&self) -> bool {
        self.get(SPECIAL_SHIFT, 1) != 0
    }

    pub fn set_special(&mut self, special: bool) {
        self.set(SPECIAL_SHIFT, 1, special as u64)
    }

    /// Byte offset of the payload within the buffer.
    pub fn offset(&self) -> u16 {
        self.get(OFFSET_SHIFT, OFFSET_BITS) as u16
    }

    pub fn set_offset(&mut self, offset: u16) {
        self.set(OFFSET_SHIFT, OFFSET_BITS, offset as u64)
    }

    pub fn meta_flags(&self) -> u8 {
        self.get(META_FLAGS_SHIFT, META_FLAGS_BITS) as u8
    }

    pub fn set_meta_flags(&mut self, meta_flags: u8) {
        self.set(META_FLAGS_SHIFT, META_FLAGS_BITS, meta_flags as u64)
    }

    /// Zeroes every field.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl FragmentDescriptor {
    /// Creates a fragment descriptor for a free buffer, with its payload starting `headroom` bytes into the buffer.
    pub fn free_buffer(lo: u32, headroom: u16) -> Self {
        Self {
            seg: SegmentDescriptor::new(lo, headroom, 0),
            ..Default::default()
        }
    }

    /// Zeroes every field.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Is every field zero?
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentDescriptor")
            .field("lo", &self.lo())
            .field("hi", &self.hi())
            .field("flags", &self.flags())
            .field("len", &self.len())
            .field("eop", &self.eop())
            .field("special", &self.special())
            .field("offset", &self.offset())
            .field("meta_flags", &self.meta_flags())
            .finish()
    }
}

impl From<u64> for SegmentDescriptor {
    fn from(bits: u64) -> Self {
        Self::from_bits(bits)
    }
}

impl From<SegmentDescriptor> for u64 {
    fn from(seg: SegmentDescriptor) -> Self {
        seg.bits()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
