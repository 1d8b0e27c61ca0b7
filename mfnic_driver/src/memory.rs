// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared DMA-capable buffers.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use mfnic_defs::PAGE_SIZE;
pub use mfnic_defs::PAGE_SIZE64;

/// A region of memory shared with the device.
///
/// `as_slice` must return the same region for the lifetime of the
/// target, and `dma_address` the device address of its first byte.
pub trait DmaTarget: Send + Sync {
    /// The whole region as atomic bytes.
    fn as_slice(&self) -> &[AtomicU8];
    /// The device address of the start of the region.
    fn dma_address(&self) -> u64;
}

/// A view of a DMA target, used for command payloads, queue rings, and
/// the VHCR. All accesses are per-byte atomic, since the device may be
/// writing concurrently.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn DmaTarget>,
    offset: usize,
    len: usize,
}

impl MemoryBlock {
    /// Creates a block covering `mem[offset..offset + len]`.
    pub fn new(mem: Arc<dyn DmaTarget>, offset: usize, len: usize) -> Self {
        assert!(mem.as_slice().len() >= offset + len);
        Self { mem, offset, len }
    }

    /// Returns a view of a subset of the block.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(self.len >= offset + len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// The length of the block in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The device address of the block.
    pub fn dma_address(&self) -> u64 {
        self.mem.dma_address() + self.offset as u64
    }

    fn slice(&self) -> &[AtomicU8] {
        &self.mem.as_slice()[self.offset..][..self.len]
    }

    /// Reads from the block at `offset` into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (d, s) in data.iter_mut().zip(&self.slice()[offset..][..len]) {
            *d = s.load(Relaxed);
        }
    }

    /// Writes `data` into the block at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (d, s) in self.slice()[offset..][..data.len()].iter().zip(data) {
            d.store(*s, Relaxed);
        }
    }

    /// Reads an object from the block at `offset`.
    pub fn read_obj<T: FromBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut buf = vec![0; size_of::<T>()];
        self.read_at(offset, &mut buf);
        T::read_from_bytes(&buf).unwrap()
    }

    /// Writes an object into the block at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout + ?Sized>(
        &self,
        offset: usize,
        data: &T,
    ) {
        self.write_at(offset, data.as_bytes());
    }

    /// Fills the block with `value`.
    pub fn fill(&self, value: u8) {
        for b in self.slice() {
            b.store(value, Relaxed);
        }
    }
}
