// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use bitflags::bitflags;
use num_enum::IntoPrimitive;

use crate::mem::MemoryMap;

/// Offset of the DMA controller within the peripheral window.
pub const DMA_OFFSET: u32 = 0x7000;

/// Engines 0-14 live in the main register block; engine 15 is elsewhere and
/// not supported here.
pub const CHANNEL_COUNT: usize = 15;

// Per-channel registers, word offsets within a channel's 0x100 window.
const CS: usize = 0x00 / 4;
const CONBLK_AD: usize = 0x04 / 4;
const DEBUG: usize = 0x20 / 4;

const CHANNEL_STRIDE: usize = 0x100 / 4;

// Global registers.
const INT_STATUS: usize = 0xFE0 / 4;
const ENABLE: usize = 0xFF0 / 4;

bitflags! {
    /// Channel control and status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlStatus: u32 {
        const ACTIVE = 1 << 0;
        const END = 1 << 1;
        const INT = 1 << 2;
        const DREQ = 1 << 3;
        const PAUSED = 1 << 4;
        const DREQ_STOPS_DMA = 1 << 5;
        const WAITING_FOR_OUTSTANDING_WRITES = 1 << 6;
        const ERROR = 1 << 8;
        const WAIT_FOR_OUTSTANDING_WRITES = 1 << 28;
        const DISDEBUG = 1 << 29;
        const ABORT = 1 << 30;
        const RESET = 1 << 31;
    }

    /// Channel debug register. The error bits are write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugStatus: u32 {
        const READ_LAST_NOT_SET_ERROR = 1 << 0;
        const FIFO_ERROR = 1 << 1;
        const READ_ERROR = 1 << 2;
        const LITE = 1 << 28;
    }

    /// Transfer information word of a control block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferInformation: u32 {
        const INTERRUPT_ENABLE = 1 << 0;
        const TD_MODE = 1 << 1;
        const WAIT_FOR_WRITE_RESPONSE = 1 << 3;
        const DESTINATION_ADDRESS_INCREMENT = 1 << 4;
        const DESTINATION_WIDE_WIDTH = 1 << 5;
        const DESTINATION_DREQ = 1 << 6;
        const DESTINATION_IGNORE_WRITES = 1 << 7;
        const SOURCE_ADDRESS_INCREMENT = 1 << 8;
        const SOURCE_WIDE_WIDTH = 1 << 9;
        const SOURCE_DREQ = 1 << 10;
        const SOURCE_IGNORE_READS = 1 << 11;
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

impl DebugStatus {
    /// All of the write-1-to-clear error conditions.
    pub const ERRORS: DebugStatus = DebugStatus::READ_LAST_NOT_SET_ERROR
        .union(DebugStatus::FIFO_ERROR)
        .union(DebugStatus::READ_ERROR);
}

impl TransferInformation {
    /// Encodes the peripheral whose DREQ paces this transfer (PERMAP field).
    pub fn peripheral_mapping(peripheral: Peripheral) -> TransferInformation {
        TransferInformation::from_bits_retain(u32::from(peripheral) << 16)
    }
}

/// DREQ sources routed to the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum Peripheral {
    None = 0,
    Dsi = 1,
    PcmTx = 2,
    PcmRx = 3,
    Smi = 4,
    Pwm = 5,
    SpiTx = 6,
    SpiRx = 7,
}

/// One 256-bit control block in the exact layout the engine fetches.
///
/// Blocks must sit at 32-byte-aligned bus addresses; the engine chains to
/// `next_control_block_address` when the transfer completes and halts when
/// that field is zero.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub transfer_information: u32,
    pub source_address: u32,
    pub destination_address: u32,
    pub transfer_length: u32,
    pub stride: u32,
    pub next_control_block_address: u32,
    reserved: [u32; 2],
}

/// Stop value for `next_control_block_address`.
pub const STOP_ADDRESS: u32 = 0;

impl ControlBlock {
    /// Size of a control block in bytes.
    pub const SIZE: usize = 32;

    /// Byte offset of the next-block field within a control block, the word
    /// rewritten when a committed graph is re-pointed in place.
    pub const NEXT_OFFSET: usize = 0x14;

    pub fn new(
        transfer_information: TransferInformation,
        source_address: u32,
        destination_address: u32,
        transfer_length: u32,
        stride: u32,
        next_control_block_address: u32,
    ) -> ControlBlock {
        ControlBlock {
            transfer_information: transfer_information.bits(),
            source_address,
            destination_address,
            transfer_length,
            stride,
            next_control_block_address,
            reserved: [0; 2],
        }
    }

    /// Transfer length encoding for a 2-D transfer of `y` rows of `x` bytes.
    pub const fn two_d_transfer_length(x: u16, y: u16) -> u32 {
        (y as u32) << 16 | x as u32
    }

    /// Stride register encoding: signed byte offsets added to the source and
    /// destination addresses at the end of each 2-D row.
    pub const fn two_d_stride(source: i16, destination: i16) -> u32 {
        (destination as u16 as u32) << 16 | source as u16 as u32
    }
}

pub struct Dma {
    map: MemoryMap,
}

impl Dma {
    pub fn new(map: MemoryMap) -> Dma {
        Dma { map }
    }

    /// Power up an engine. Engines left disabled ignore all register writes.
    pub fn enable(&self, channel: usize) {
        assert!(channel < CHANNEL_COUNT);
        self.map.modify(ENABLE, |r| r | 1 << channel);
    }

    pub fn disable(&self, channel: usize) {
        assert!(channel < CHANNEL_COUNT);
        self.map.modify(ENABLE, |r| r & !(1 << channel));
    }

    /// Bitmask of channels with a pending interrupt.
    pub fn interrupt_status(&self) -> u32 {
        self.map.read(INT_STATUS)
    }

    pub fn channel(&self, channel: usize) -> Channel<'_> {
        assert!(channel < CHANNEL_COUNT);
        Channel {
            dma: self,
            base: channel * CHANNEL_STRIDE,
        }
    }
}

/// Register file of a single engine.
pub struct Channel<'a> {
    dma: &'a Dma,
    base: usize,
}

impl Channel<'_> {
    fn read(&self, register: usize) -> u32 {
        self.dma.map.read(self.base + register)
    }

    fn write(&self, register: usize, value: u32) {
        self.dma.map.write(self.base + register, value)
    }

    /// Clear all channel state. The reset bit self-clears.
    pub fn reset(&self) {
        self.write(CS, ControlStatus::RESET.bits());
    }

    /// Abort the current control block; the engine loads the next one.
    pub fn abort(&self) {
        self.dma
            .map
            .modify(self.base + CS, |r| r | ControlStatus::ABORT.bits());
    }

    /// Point the engine at the first control block of a graph and start it.
    ///
    /// Also clears any latched end/interrupt flags from a previous run.
    pub fn start(&self, control_block_bus_address: u32) {
        self.write(CONBLK_AD, control_block_bus_address);
        self.write(
            CS,
            (ControlStatus::WAIT_FOR_OUTSTANDING_WRITES
                | ControlStatus::END
                | ControlStatus::INT
                | ControlStatus::ACTIVE)
                .bits(),
        );
    }

    pub fn is_active(&self) -> bool {
        ControlStatus::from_bits_retain(self.read(CS)).contains(ControlStatus::ACTIVE)
    }

    pub fn control_status(&self) -> ControlStatus {
        ControlStatus::from_bits_retain(self.read(CS))
    }

    /// Bus address of the control block the engine is currently executing,
    /// zero once it has halted.
    pub fn control_block_address(&self) -> u32 {
        self.read(CONBLK_AD)
    }

    pub fn debug_status(&self) -> DebugStatus {
        DebugStatus::from_bits_retain(self.read(DEBUG))
    }

    /// Write-1-to-clear the given debug error flags.
    pub fn clear_debug(&self, flags: DebugStatus) {
        self.write(DEBUG, (flags & DebugStatus::ERRORS).bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_layout() {
        assert_eq!(std::mem::size_of::<ControlBlock>(), ControlBlock::SIZE);
        assert_eq!(std::mem::align_of::<ControlBlock>(), 32);
        let block = ControlBlock::new(
            TransferInformation::WAIT_FOR_WRITE_RESPONSE,
            1,
            2,
            3,
            4,
            5,
        );
        let words: [u32; 8] = unsafe { std::mem::transmute(block) };
        assert_eq!(words, [1 << 3, 1, 2, 3, 4, 5, 0, 0]);
    }

    #[test]
    fn two_d_encoding() {
        assert_eq!(ControlBlock::two_d_transfer_length(8, 2), 0x0002_0008);
        assert_eq!(ControlBlock::two_d_stride(0, 4), 0x0004_0000);
        assert_eq!(ControlBlock::two_d_stride(-4, -8), 0xFFF8_FFFC);
    }

    #[test]
    fn peripheral_mapping_field() {
        assert_eq!(
            TransferInformation::peripheral_mapping(Peripheral::Pwm).bits(),
            5 << 16
        );
    }
}
