// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use crate::mem::MemoryMap;

/// Offset of the clock manager within the peripheral window.
pub const CLOCK_OFFSET: u32 = 0x10_1000;

/// The crystal oscillator feeding the clock manager, in Hz.
pub const OSCILLATOR_FREQUENCY: f32 = 19_200_000.0;

// Word offsets of the PWM clock generator registers.
const CM_PWMCTL: usize = 0xA0 / 4;
const CM_PWMDIV: usize = 0xA4 / 4;

// Every write must carry the password in the top byte or it is ignored.
const PASSWORD: u32 = 0x5A << 24;

const SOURCE_OSCILLATOR: u32 = 1;
const ENABLE: u32 = 1 << 4;
const KILL: u32 = 1 << 5;
const BUSY: u32 = 1 << 7;

/// Largest value the 12-bit integer divisor field can hold.
pub const DIVISOR_LIMIT: u32 = 0x1000;

pub struct Clock {
    map: MemoryMap,
}

impl Clock {
    pub fn new(map: MemoryMap) -> Clock {
        Clock { map }
    }

    /// Run the PWM clock from the oscillator with an integer divisor.
    ///
    /// The generator must be stopped before the divisor changes; glitch-free
    /// switching is not needed here since the serializer is idle whenever
    /// this is called.
    pub fn setup_pwm(&self, divisor: u32) {
        assert!(divisor > 0 && divisor < DIVISOR_LIMIT);

        self.map.write(CM_PWMCTL, PASSWORD | KILL);
        while self.map.read(CM_PWMCTL) & BUSY != 0 {}

        self.map.write(CM_PWMDIV, PASSWORD | divisor << 12);
        self.map.write(CM_PWMCTL, PASSWORD | SOURCE_OSCILLATOR);
        self.map
            .write(CM_PWMCTL, PASSWORD | SOURCE_OSCILLATOR | ENABLE);
        while self.map.read(CM_PWMCTL) & BUSY == 0 {}
    }

    /// Stop the PWM clock generator.
    pub fn stop_pwm(&self) {
        self.map.write(CM_PWMCTL, PASSWORD | KILL);
        while self.map.read(CM_PWMCTL) & BUSY != 0 {}
    }
}
