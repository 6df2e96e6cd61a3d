// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    memory::descriptor::SegmentDescriptor,
    runtime::{
        fail::Fail,
        limits::{
            BLOCK_BITS,
            BLOCK_SIZE,
            LO_SHIFT,
            MAX_NB_BLOCK,
        },
    },
};
use ::std::{
    ptr::{
        self,
        NonNull,
    },
    sync::Arc,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Translates the physical address of a hugepage block into an address this process can dereference.
///
/// # Safety
///
/// Every pointer returned by `phys_to_virt()` must be valid for reads and writes of [BLOCK_SIZE] bytes for as long as
/// the implementing object is alive. The memory may be concurrently written by the other side of the shared mapping;
/// this crate only ever copies out of or into it.
pub unsafe trait PhysToVirt: Send + Sync {
    fn phys_to_virt(&self, pa: u64) -> Option<NonNull<u8>>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Location of a buffer inside the registered blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAddress {
    pub block_id: usize,
    pub offset: usize,
}

/// Table of registered hugepage blocks. Translates buffer indices into addresses.
pub struct BlockTable {
    /// Base address of each registered block.
    blocks: [Option<NonNull<u8>>; MAX_NB_BLOCK],
    /// Number of valid entries in `blocks`.
    count: usize,
    /// Keeps the memory behind `blocks` alive.
    owner: Option<Arc<dyn PhysToVirt>>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Translates a buffer index into a block number.
#[inline(always)]
pub fn index_to_block(index: u32) -> usize {
    ((index >> (BLOCK_BITS - LO_SHIFT)) as usize) & (MAX_NB_BLOCK - 1)
}

/// Translates a buffer index into a byte offset within its block.
#[inline(always)]
pub fn index_to_offset(index: u32) -> usize {
    ((index as usize) << LO_SHIFT) & (BLOCK_SIZE - 1)
}

/// Builds the buffer index of the 64-byte line at `offset` in block `block_id`.
pub fn buffer_index(block_id: usize, offset: usize) -> u32 {
    (((block_id & (MAX_NB_BLOCK - 1)) << (BLOCK_BITS - LO_SHIFT)) | ((offset & (BLOCK_SIZE - 1)) >> LO_SHIFT)) as u32
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl BlockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            blocks: [None; MAX_NB_BLOCK],
            count: 0,
            owner: None,
        }
    }

    /// Records the base address of each page in `pages`, replacing any previous registration.
    ///
    /// Addresses are trusted beyond the count bound: they are only translated, never probed.
    pub fn register(&mut self, pages: &[u64], mapping: Arc<dyn PhysToVirt>) -> Result<(), Fail> {
        if pages.len() >= MAX_NB_BLOCK {
            let cause: String = format!("too many blocks (n_pages={}, max={})", pages.len(), MAX_NB_BLOCK - 1);
            error!("register(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let mut blocks: [Option<NonNull<u8>>; MAX_NB_BLOCK] = [None; MAX_NB_BLOCK];
        for (i, pa) in pages.iter().enumerate() {
            match mapping.phys_to_virt(*pa) {
                Some(base) => {
                    debug!("register(): block={} pa={:#x} virt={:p}", i, pa, base);
                    blocks[i] = Some(base);
                },
                None => {
                    let cause: String = format!("no mapping for block (block={}, pa={:#x})", i, pa);
                    error!("register(): {}", cause);
                    return Err(Fail::new(libc::EFAULT, &cause));
                },
            }
        }

        self.blocks = blocks;
        self.count = pages.len();
        self.owner = Some(mapping);
        Ok(())
    }

    /// Discards every base address. The memory itself belongs to the other side and is left untouched.
    pub fn forget(&mut self) {
        self.blocks = [None; MAX_NB_BLOCK];
        self.count = 0;
        self.owner = None;
    }

    /// Number of registered blocks.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Translates a buffer index into a block number and an offset within that block. Fails if the block is not
    /// registered.
    pub fn resolve(&self, index: u32) -> Result<BufferAddress, Fail> {
        let block_id: usize = index_to_block(index);
        if block_id >= self.count {
            let cause: String = format!(
                "buffer index beyond registered blocks (index={:#x}, block={}, count={})",
                index, block_id, self.count
            );
            error!("resolve(): {}", cause);
            return Err(Fail::new(libc::EFAULT, &cause));
        }
        Ok(BufferAddress {
            block_id,
            offset: index_to_offset(index),
        })
    }

    /// Translates a buffer index into the address of the start of its buffer.
    pub fn address(&self, index: u32) -> Result<NonNull<u8>, Fail> {
        let addr: BufferAddress = self.resolve(index)?;
        self.pointer(addr.block_id, addr.offset)
    }

    fn pointer(&self, block_id: usize, offset: usize) -> Result<NonNull<u8>, Fail> {
        match self.blocks[block_id] {
            // Safety: offset < BLOCK_SIZE and the block is valid for BLOCK_SIZE bytes.
            Some(base) => Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) }),
            None => Err(Fail::new(libc::EFAULT, "block is not registered")),
        }
    }

    /// Locates the payload of `seg`, extended `pre` bytes before its offset, and checks it stays within its block.
    fn segment_span(&self, seg: &SegmentDescriptor, pre: usize) -> Result<(NonNull<u8>, usize), Fail> {
        let addr: BufferAddress = self.resolve(seg.lo())?;
        let data_offset: usize = seg.offset() as usize;
        if data_offset < pre {
            let cause: String = format!("segment offset too small (offset={}, pre={})", data_offset, pre);
            error!("segment_span(): {}", cause);
            return Err(Fail::new(libc::EFAULT, &cause));
        }
        let start: usize = addr.offset + data_offset - pre;
        let len: usize = seg.len() as usize + pre;
        if start + len > BLOCK_SIZE {
            let cause: String = format!("segment crosses block boundary (start={}, len={})", start, len);
            error!("segment_span(): {}", cause);
            return Err(Fail::new(libc::EFAULT, &cause));
        }
        Ok((self.pointer(addr.block_id, start)?, len))
    }

    /// Length of the payload of `seg` extended `pre` bytes backwards, once validated.
    pub fn segment_len(&self, seg: &SegmentDescriptor, pre: usize) -> Result<usize, Fail> {
        Ok(self.segment_span(seg, pre)?.1)
    }

    /// Copies the payload of `seg`, extended `pre` bytes backwards, into the front of `dst`.
    pub fn copy_from_segment(&self, seg: &SegmentDescriptor, pre: usize, dst: &mut [u8]) -> Result<usize, Fail> {
        let (src, len): (NonNull<u8>, usize) = self.segment_span(seg, pre)?;
        if dst.len() < len {
            return Err(Fail::new(libc::ENOBUFS, "destination too small for segment"));
        }
        // Safety: span was validated against the block bounds; dst is a distinct, local allocation.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), len) };
        Ok(len)
    }

    /// Copies `src` into the payload of `seg`. `src` must not exceed the segment length.
    pub fn copy_to_segment(&self, seg: &SegmentDescriptor, src: &[u8]) -> Result<(), Fail> {
        let (dst, len): (NonNull<u8>, usize) = self.segment_span(seg, 0)?;
        if src.len() > len {
            return Err(Fail::new(libc::EINVAL, "source larger than segment"));
        }
        // Safety: span was validated against the block bounds; src is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Send trait implementation. Block pointers are plain addresses kept valid by `owner`.
unsafe impl Send for BlockTable {}

/// Sync trait implementation. The table is immutable once shared.
unsafe impl Sync for BlockTable {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
