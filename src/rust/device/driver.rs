// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Callback table of the radio driver.
//!
//! Every callback is optional. A callback receives the [Device] it is bound to, so that it can reach back into the
//! exposed interface (`alloc_descriptor()`, `free_descriptor()`, `descriptor_address()`) while it runs.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    device::{
        inject::PacketBuffer,
        ports::PortContext,
        Device,
    },
    memory::FragmentDescriptor,
    runtime::limits::PIPES_PER_PORT,
};
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Hands descriptors of one pipe to the hardware. Returns the number of descriptors accepted.
pub type TransmitFn =
    Box<dyn Fn(&Device, &PortContext, u32, &mut [FragmentDescriptor], bool) -> usize + Send + Sync + 'static>;

/// Fills descriptors with received segments. Returns the number of descriptors written.
pub type ReceiveFn =
    Box<dyn Fn(&Device, &PortContext, &mut [FragmentDescriptor], bool) -> usize + Send + Sync + 'static>;

/// Reports the free room of every pipe transmit queue.
pub type TxAvailFn = Box<dyn Fn(&Device, &PortContext, &mut [u32; PIPES_PER_PORT]) + Send + Sync + 'static>;

/// Reclaims transmitted buffers, typically through `Device::free_descriptor()`.
pub type TxCompleteFn = Box<dyn Fn(&Device, &PortContext) + Send + Sync + 'static>;

/// Stops DMA in flight and drops the descriptors held in hardware rings.
pub type CancelDmaFn = Box<dyn Fn(&Device, &PortContext) + Send + Sync + 'static>;

/// Delivers an assembled packet to the network stack on a pipe. Returns a stack status code.
pub type InjectFn = Box<dyn Fn(&PortContext, PacketBuffer, u32) -> i32 + Send + Sync + 'static>;

/// Driver operations.
#[derive(Default)]
pub struct DriverOps {
    pub transmit: Option<TransmitFn>,
    pub receive: Option<ReceiveFn>,
    pub tx_avail: Option<TxAvailFn>,
    pub tx_complete: Option<TxCompleteFn>,
    pub cancel_dma: Option<CancelDmaFn>,
    pub inject: Option<InjectFn>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DriverOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transmit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &PortContext, u32, &mut [FragmentDescriptor], bool) -> usize + Send + Sync + 'static,
    {
        self.transmit = Some(Box::new(f));
        self
    }

    pub fn with_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &PortContext, &mut [FragmentDescriptor], bool) -> usize + Send + Sync + 'static,
    {
        self.receive = Some(Box::new(f));
        self
    }

    pub fn with_tx_avail<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &PortContext, &mut [u32; PIPES_PER_PORT]) + Send + Sync + 'static,
    {
        self.tx_avail = Some(Box::new(f));
        self
    }

    pub fn with_tx_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &PortContext) + Send + Sync + 'static,
    {
        self.tx_complete = Some(Box::new(f));
        self
    }

    pub fn with_cancel_dma<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &PortContext) + Send + Sync + 'static,
    {
        self.cancel_dma = Some(Box::new(f));
        self
    }

    pub fn with_inject<F>(mut self, f: F) -> Self
    where
        F: Fn(&PortContext, PacketBuffer, u32) -> i32 + Send + Sync + 'static,
    {
        self.inject = Some(Box::new(f));
        self
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for DriverOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverOps")
            .field("transmit", &self.transmit.is_some())
            .field("receive", &self.receive.is_some())
            .field("tx_avail", &self.tx_avail.is_some())
            .field("tx_complete", &self.tx_complete.is_some())
            .field("cancel_dma", &self.cancel_dma.is_some())
            .field("inject", &self.inject.is_some())
            .finish()
    }
}
