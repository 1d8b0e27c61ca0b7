// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits abstracting the device so the driver core can run against real
//! hardware mappings or the emulated device in tests.

use crate::interrupt::DeviceInterrupt;
use crate::memory::MemoryBlock;
use std::sync::Arc;
use thiserror::Error;

/// Access to a BAR's register space.
pub trait DeviceRegisterIo: Send + Sync {
    /// The length of the mapped space in bytes.
    fn len(&self) -> usize;
    /// Reads a 32-bit register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes a 32-bit register.
    fn write_u32(&self, offset: usize, value: u32);
}

/// Allocates DMA-coherent buffers visible to the device.
pub trait DmaClient: Send + Sync {
    /// Allocates a buffer of `len` bytes (rounded up to whole pages).
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}

/// An error accessing DMA-visible memory by device address.
#[derive(Debug, Error)]
#[error("dma access failed at {addr:#x}, len {len:#x}")]
pub struct DmaError {
    /// The faulting device address.
    pub addr: u64,
    /// The length of the attempted access.
    pub len: usize,
}

/// A window onto another function's DMA-visible memory, addressed by
/// device address. The master uses this to stage a slave's VHCR and
/// command payloads.
pub trait DmaSpace: Send + Sync {
    /// Copies `data.len()` bytes from `addr` into `data`.
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), DmaError>;
    /// Copies `data` to `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), DmaError>;
}

/// A device, from the driver's point of view.
pub trait DeviceBacking: 'static + Send {
    /// An object for accessing BAR0.
    type Registers: DeviceRegisterIo;

    /// Maps BAR0.
    fn map_bar0(&mut self) -> anyhow::Result<Self::Registers>;

    /// Returns the DMA allocator for this device.
    fn dma_client(&self) -> Arc<dyn DmaClient>;

    /// Maps the interrupt vector backing event queue `index`.
    fn map_interrupt(&mut self, index: u32) -> anyhow::Result<DeviceInterrupt>;

    /// Performs a full device reset, used after repeated command
    /// timeouts. On failure the device is barred.
    fn reset(&mut self) -> anyhow::Result<()>;
}

/// The reset half of [`DeviceBacking`], type-erased so the command engine
/// can hold it without being generic over the device.
pub(crate) trait DeviceControl: Send {
    fn reset_device(&mut self) -> anyhow::Result<()>;
}

impl<T: DeviceBacking> DeviceControl for T {
    fn reset_device(&mut self) -> anyhow::Result<()> {
        self.reset()
    }
}
