// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use bitflags::bitflags;

use crate::mem::MemoryMap;

/// Offset of the PWM controller within the peripheral window.
pub const PWM_OFFSET: u32 = 0x20_C000;

/// Channel 1 FIFO input, as addressed by a bus master.
pub const FIFO_BUS_ADDRESS: u32 = 0x7E20_C018;

/// Channel 1 range register, as addressed by a bus master.
pub const RANGE1_BUS_ADDRESS: u32 = 0x7E20_C010;

// Word offsets within the register block.
const CTL: usize = 0x00 / 4;
const STA: usize = 0x04 / 4;
const DMAC: usize = 0x08 / 4;
const RNG1: usize = 0x10 / 4;
const FIF1: usize = 0x18 / 4;

const DMAC_ENABLE: u32 = 1 << 31;

bitflags! {
    /// Control register, channel 1 fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        const ENABLE1 = 1 << 0;
        const SERIALIZER1 = 1 << 1;
        const REPEAT_LAST1 = 1 << 2;
        const SILENCE_HIGH1 = 1 << 3;
        const INVERT1 = 1 << 4;
        const USE_FIFO1 = 1 << 5;
        const CLEAR_FIFO = 1 << 6;
        const MARK_SPACE1 = 1 << 7;
    }

    /// Status register. The error flags are write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const FIFO_FULL = 1 << 0;
        const FIFO_EMPTY = 1 << 1;
        const FIFO_WRITE_ERROR = 1 << 2;
        const FIFO_READ_ERROR = 1 << 3;
        const GAP_OCCURRED1 = 1 << 4;
        const GAP_OCCURRED2 = 1 << 5;
        const BUS_ERROR = 1 << 8;
        const TRANSMITTING1 = 1 << 9;
    }
}

impl Status {
    /// All of the write-1-to-clear error conditions.
    pub const ERRORS: Status = Status::FIFO_WRITE_ERROR
        .union(Status::FIFO_READ_ERROR)
        .union(Status::GAP_OCCURRED1)
        .union(Status::GAP_OCCURRED2)
        .union(Status::BUS_ERROR);
}

pub struct Pwm {
    map: MemoryMap,
}

impl Pwm {
    pub fn new(map: MemoryMap) -> Pwm {
        Pwm { map }
    }

    /// Configure channel 1 as a FIFO-fed serializer paced at a DREQ
    /// threshold of one word, shifting `range` bits per word MSB-first.
    ///
    /// The channel is left disabled; call `enable` once the FIFO has a
    /// producer.
    pub fn setup_serializer(&self, range: u32) {
        self.map.write(CTL, 0);
        self.map.write(STA, Status::ERRORS.bits());
        self.map.write(RNG1, range);
        // Panic well above the single-entry DREQ threshold so a briefly
        // stalled bus doesn't starve the serializer.
        self.map.write(DMAC, DMAC_ENABLE | 7 << 8 | 1);
        self.map.write(
            CTL,
            (Control::CLEAR_FIFO | Control::USE_FIFO1 | Control::SERIALIZER1).bits(),
        );
    }

    pub fn enable(&self) {
        self.map.modify(CTL, |r| r | Control::ENABLE1.bits());
    }

    pub fn disable(&self) {
        self.map.modify(CTL, |r| r & !Control::ENABLE1.bits());
    }

    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.map.read(STA))
    }

    /// Write-1-to-clear the given error flags.
    pub fn clear_status(&self, flags: Status) {
        self.map.write(STA, (flags & Status::ERRORS).bits());
    }

    /// Push one word into the FIFO directly, bypassing DMA.
    pub fn write_fifo(&self, word: u32) {
        self.map.write(FIF1, word);
    }
}
