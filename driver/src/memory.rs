// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Uncached memory shared with the DMA engine.

use std::io;
use std::sync::Arc;

use bcm2835_bsp::mailbox::{self, AllocationFlags, Mailbox};
use bcm2835_bsp::mem::{MemoryMap, PAGE_SIZE};
use thiserror::Error;

/// Failure to acquire or map the uncached region backing a committed
/// bitstream.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("uncached memory allocation failed")]
    AllocationFailed(#[source] mailbox::Error),
    #[error("uncached memory could not be locked")]
    LockFailed(#[source] mailbox::Error),
    #[error("uncached memory could not be mapped")]
    MapFailed(#[source] io::Error),
}

/// A firmware-allocated, bus-addressable, uncached block of memory.
///
/// The region is exclusively owned; dropping it unpins the allocation and
/// returns it to the firmware. The `DIRECT` alias keeps both the ARM and the
/// engine view uncached, so plain volatile accesses are coherent.
pub struct MemoryRegion {
    mailbox: Arc<Mailbox>,
    handle: u32,
    bus_address: u32,
    map: MemoryMap,
}

impl MemoryRegion {
    /// Allocate and pin `size` bytes, rounded up to whole pages.
    pub fn allocate(mailbox: Arc<Mailbox>, size: usize) -> Result<MemoryRegion, CommitError> {
        let size = (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;

        let handle = mailbox
            .mem_alloc(
                size as u32,
                PAGE_SIZE as u32,
                AllocationFlags::DIRECT | AllocationFlags::ZERO,
            )
            .map_err(CommitError::AllocationFailed)?;

        let bus_address = match mailbox.mem_lock(handle) {
            Ok(bus_address) => bus_address,
            Err(error) => {
                let _ = mailbox.mem_free(handle);
                return Err(CommitError::LockFailed(error));
            }
        };

        let map = match MemoryMap::new(mailbox::bus_to_physical(bus_address), size) {
            Ok(map) => map,
            Err(error) => {
                let _ = mailbox.mem_unlock(handle);
                let _ = mailbox.mem_free(handle);
                return Err(CommitError::MapFailed(error));
            }
        };

        log::debug!(
            "allocated {} bytes of uncached memory at bus address {:#010x}",
            size,
            bus_address
        );
        Ok(MemoryRegion {
            mailbox,
            handle,
            bus_address,
            map,
        })
    }

    /// Address of the region as seen by bus masters.
    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Read the word at word offset `index`.
    pub fn read(&self, index: usize) -> u32 {
        self.map.read(index)
    }

    /// Write the word at word offset `index`.
    pub fn write(&self, index: usize, value: u32) {
        self.map.write(index, value)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(error) = self.mailbox.mem_unlock(self.handle) {
            log::warn!("failed to unlock uncached memory: {}", error);
        }
        if let Err(error) = self.mailbox.mem_free(self.handle) {
            log::warn!("failed to free uncached memory: {}", error);
        }
    }
}
