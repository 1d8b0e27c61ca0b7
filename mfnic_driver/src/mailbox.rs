// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pooled DMA mailboxes for command payloads too large for the HCR
//! words themselves.

use crate::cmd::CmdError;
use crate::cmd::FaultState;
use crate::device::DmaClient;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The size of every mailbox.
pub const MAILBOX_SIZE: usize = PAGE_SIZE;

/// A pool of fixed-size DMA-coherent command mailboxes, carved out of a
/// single allocation at startup.
#[derive(Clone)]
pub struct MailboxPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<MemoryBlock>>,
    fault: Arc<FaultState>,
}

impl MailboxPool {
    /// Allocates a pool of `count` mailboxes.
    pub fn new(
        dma_client: &dyn DmaClient,
        count: usize,
        fault: Arc<FaultState>,
    ) -> anyhow::Result<Self> {
        let buffer = dma_client
            .allocate_dma_buffer(count * MAILBOX_SIZE)
            .context("failed to allocate command mailboxes")?;
        let free = (0..count)
            .map(|i| buffer.subblock(i * MAILBOX_SIZE, MAILBOX_SIZE))
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                fault,
            }),
        })
    }

    /// Leases a mailbox from the pool. Fails with [`CmdError::Barred`]
    /// without touching hardware once the device is barred, and with
    /// [`CmdError::OutOfMemory`] when the pool is exhausted.
    pub fn alloc(&self) -> Result<Mailbox, CmdError> {
        if self.inner.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        let block = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or(CmdError::OutOfMemory)?;
        Ok(Mailbox {
            block,
            pool: self.inner.clone(),
        })
    }
}

/// A leased mailbox; returns to the pool on drop.
pub struct Mailbox {
    block: MemoryBlock,
    pool: Arc<PoolInner>,
}

impl Mailbox {
    /// The device address of the mailbox.
    pub fn dma_address(&self) -> u64 {
        self.block.dma_address()
    }

    /// Reads from the mailbox at `offset`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        self.block.read_at(offset, data);
    }

    /// Writes into the mailbox at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.block.write_at(offset, data);
    }

    /// Reads an object from the mailbox at `offset`.
    pub fn read_obj<T: FromBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        self.block.read_obj(offset)
    }

    /// Writes an object into the mailbox at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout + ?Sized>(
        &self,
        offset: usize,
        data: &T,
    ) {
        self.block.write_obj(offset, data)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.block.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::DeviceSharedMemory;

    #[test]
    fn lease_and_return() {
        let mem = DeviceSharedMemory::new(16 * PAGE_SIZE);
        let fault = Arc::new(FaultState::new());
        let pool = MailboxPool::new(&mem, 2, fault.clone()).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a.dma_address(), b.dma_address());
        assert!(matches!(pool.alloc(), Err(CmdError::OutOfMemory)));
        drop(a);
        let _c = pool.alloc().unwrap();
    }

    #[test]
    fn barred_pool_fails_fast() {
        let mem = DeviceSharedMemory::new(16 * PAGE_SIZE);
        let fault = Arc::new(FaultState::new());
        let pool = MailboxPool::new(&mem, 2, fault.clone()).unwrap();
        fault.bar();
        assert!(matches!(pool.alloc(), Err(CmdError::Barred)));
    }
}
