// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    memory::block_table::PhysToVirt,
    runtime::{
        fail::Fail,
        limits::{
            BLOCK_SIZE,
            MAX_NB_BLOCK,
        },
    },
};
use ::std::{
    alloc::{
        self,
        Layout,
    },
    ptr::{
        self,
        NonNull,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process-local stand-in for the dataplane's hugepage memory: a set of zeroed, block-aligned blocks.
///
/// The address of each block doubles as its "physical" address, so the arena can register itself with a
/// [crate::memory::block_table::BlockTable] exactly the way the dataplane registers its pages.
pub struct HugePageArena {
    blocks: Vec<NonNull<u8>>,
    layout: Layout,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl HugePageArena {
    /// Allocates `n_blocks` zeroed blocks.
    pub fn new(n_blocks: usize) -> Result<Self, Fail> {
        if n_blocks == 0 || n_blocks >= MAX_NB_BLOCK {
            return Err(Fail::new(libc::EINVAL, "invalid number of hugepage blocks"));
        }
        let layout: Layout = match Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE) {
            Ok(layout) => layout,
            Err(_) => return Err(Fail::new(libc::EINVAL, "failed to create memory layout for hugepage block")),
        };

        let mut arena: Self = Self {
            blocks: Vec::with_capacity(n_blocks),
            layout,
        };
        for _ in 0..n_blocks {
            // Safety: layout has non-zero size.
            let ptr: *mut u8 = unsafe { alloc::alloc_zeroed(layout) };
            match NonNull::new(ptr) {
                Some(block) => arena.blocks.push(block),
                None => return Err(Fail::new(libc::ENOMEM, "failed to allocate hugepage block")),
            }
        }
        Ok(arena)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// "Physical" address of every block, in block order.
    pub fn physical_addresses(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.as_ptr() as u64).collect()
    }

    /// Base address of the memory, as the dataplane would report it.
    pub fn virtual_base(&self) -> u64 {
        self.blocks.first().map(|b| b.as_ptr() as u64).unwrap_or(0)
    }

    /// Copies `data` into block `block_id` at byte `offset`.
    pub fn write(&self, block_id: usize, offset: usize, data: &[u8]) -> Result<(), Fail> {
        let dst: NonNull<u8> = self.span(block_id, offset, data.len())?;
        // Safety: span is inside an owned block.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copies `out.len()` bytes from block `block_id` at byte `offset`.
    pub fn read(&self, block_id: usize, offset: usize, out: &mut [u8]) -> Result<(), Fail> {
        let src: NonNull<u8> = self.span(block_id, offset, out.len())?;
        // Safety: span is inside an owned block.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn span(&self, block_id: usize, offset: usize, len: usize) -> Result<NonNull<u8>, Fail> {
        let block: NonNull<u8> = match self.blocks.get(block_id) {
            Some(block) => *block,
            None => return Err(Fail::new(libc::EINVAL, "no such block")),
        };
        if offset + len > BLOCK_SIZE {
            return Err(Fail::new(libc::EINVAL, "span crosses block boundary"));
        }
        // Safety: offset is within the block.
        Ok(unsafe { NonNull::new_unchecked(block.as_ptr().add(offset)) })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Blocks live as long as the arena, and only arena-owned addresses are translated.
unsafe impl PhysToVirt for HugePageArena {
    fn phys_to_virt(&self, pa: u64) -> Option<NonNull<u8>> {
        self.blocks.iter().copied().find(|b| b.as_ptr() as u64 == pa)
    }
}

/// Send trait implementation.
unsafe impl Send for HugePageArena {}

/// Sync trait implementation. Access goes through raw copies only.
unsafe impl Sync for HugePageArena {}

/// Drop trait implementation.
impl Drop for HugePageArena {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            // Safety: every block was allocated with `self.layout`.
            unsafe { alloc::dealloc(block.as_ptr(), self.layout) };
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
