// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! VideoCore property mailbox.
//!
//! The firmware side of the SoC owns physical memory management for bus
//! masters; the property interface on `/dev/vcio` is how the ARM asks it to
//! carve out, pin and release such memory.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;

use bitflags::bitflags;
use thiserror::Error;

// _IOWR(100, 0, char *); the encoded size follows the platform pointer
// width, so this differs between 32-bit and 64-bit userlands.
const IOCTL_PROPERTY: libc::c_ulong = (3 << 30)
    | ((std::mem::size_of::<*mut libc::c_char>() as libc::c_ulong) << 16)
    | (100 << 8);

const PROCESS_REQUEST: u32 = 0;
const REQUEST_SUCCESSFUL: u32 = 0x8000_0000;
const RESPONSE_PRESENT: u32 = 0x8000_0000;
const END_TAG: u32 = 0;

const TAG_ALLOCATE_MEMORY: u32 = 0x3000C;
const TAG_LOCK_MEMORY: u32 = 0x3000D;
const TAG_UNLOCK_MEMORY: u32 = 0x3000E;
const TAG_RELEASE_MEMORY: u32 = 0x3000F;

bitflags! {
    /// Allocation behavior requested from the firmware allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        /// Can be resized to 0 at any time. Use for cached data.
        const DISCARDABLE = 1 << 0;
        /// Uncached on the ARM side, `0xC` bus alias.
        const DIRECT = 1 << 2;
        /// Uncached but coherent, `0x8` bus alias.
        const COHERENT = 1 << 3;
        /// Initialise the memory to zero.
        const ZERO = 1 << 4;
        /// Don't initialise, the caller will write every byte.
        const NO_INIT = 1 << 5;
        /// Likely to be locked for long periods of time.
        const HINT_PERMALOCK = 1 << 6;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("mailbox is not accessible")]
    Open(#[source] io::Error),
    #[error("mailbox call failed")]
    Call(#[source] io::Error),
    #[error("mailbox request was not processed")]
    RequestFailed,
    #[error("mailbox tag {0:#x} returned no response")]
    TagFailed(u32),
    #[error("firmware allocator is out of memory")]
    OutOfMemory,
}

/// Property message buffers must be 16-byte aligned; the low nibble of the
/// pointer is reused as the mailbox channel number.
#[repr(C, align(16))]
struct PropertyBuffer([u32; 32]);

/// Handle on the `/dev/vcio` property channel.
pub struct Mailbox {
    file: File,
}

impl Mailbox {
    pub fn open() -> Result<Mailbox, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vcio")
            .map_err(Error::Open)?;
        Ok(Mailbox { file })
    }

    /// Submit a single-tag property request, returning the first response
    /// word.
    fn property(&self, tag: u32, request: &[u32], response_words: usize) -> Result<u32, Error> {
        let payload = request.len().max(response_words);
        assert!(payload + 6 <= 32);

        let mut buffer = PropertyBuffer([0; 32]);
        buffer.0[0] = ((payload + 6) * 4) as u32;
        buffer.0[1] = PROCESS_REQUEST;
        buffer.0[2] = tag;
        buffer.0[3] = (payload * 4) as u32;
        buffer.0[4] = (request.len() * 4) as u32;
        buffer.0[5..5 + request.len()].copy_from_slice(request);
        buffer.0[5 + payload] = END_TAG;

        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_PROPERTY as _,
                buffer.0.as_mut_ptr(),
            )
        };
        if result < 0 {
            return Err(Error::Call(io::Error::last_os_error()));
        }
        if buffer.0[1] != REQUEST_SUCCESSFUL {
            return Err(Error::RequestFailed);
        }
        if buffer.0[4] & RESPONSE_PRESENT == 0 {
            return Err(Error::TagFailed(tag));
        }
        Ok(buffer.0[5])
    }

    /// Allocate `size` bytes of firmware-side memory, returning an opaque
    /// handle. The memory has no bus address until locked.
    pub fn mem_alloc(
        &self,
        size: u32,
        alignment: u32,
        flags: AllocationFlags,
    ) -> Result<u32, Error> {
        let handle = self.property(TAG_ALLOCATE_MEMORY, &[size, alignment, flags.bits()], 1)?;
        if handle == 0 {
            return Err(Error::OutOfMemory);
        }
        Ok(handle)
    }

    /// Pin the allocation in place, returning its bus address.
    pub fn mem_lock(&self, handle: u32) -> Result<u32, Error> {
        let bus_address = self.property(TAG_LOCK_MEMORY, &[handle], 1)?;
        if bus_address == 0 {
            return Err(Error::TagFailed(TAG_LOCK_MEMORY));
        }
        Ok(bus_address)
    }

    /// Release the pin; the handle stays valid but the bus address does not.
    pub fn mem_unlock(&self, handle: u32) -> Result<(), Error> {
        let status = self.property(TAG_UNLOCK_MEMORY, &[handle], 1)?;
        if status != 0 {
            log::warn!("mailbox unlock of handle {} returned {}", handle, status);
        }
        Ok(())
    }

    /// Return the allocation to the firmware.
    pub fn mem_free(&self, handle: u32) -> Result<(), Error> {
        let status = self.property(TAG_RELEASE_MEMORY, &[handle], 1)?;
        if status != 0 {
            log::warn!("mailbox free of handle {} returned {}", handle, status);
        }
        Ok(())
    }
}

/// Strip the bus alias bits from a locked allocation's address, yielding the
/// physical address `/dev/mem` understands.
pub fn bus_to_physical(bus_address: u32) -> u32 {
    bus_address & 0x3FFF_FFFF
}
