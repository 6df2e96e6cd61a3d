// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod arena;
pub mod block_table;
pub mod cache;
pub mod descriptor;
pub mod region;

pub use self::{
    arena::HugePageArena,
    block_table::{
        buffer_index,
        BlockTable,
        BufferAddress,
        PhysToVirt,
    },
    cache::{
        DescriptorCache,
        LockPolicy,
    },
    descriptor::{
        FragmentDescriptor,
        SegmentDescriptor,
    },
    region::{
        SharedRegion,
        WorkerSlot,
        REGION_SIZE,
    },
};
