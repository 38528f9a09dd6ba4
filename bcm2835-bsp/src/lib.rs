use std::io;

pub mod clock;
pub mod dma;
pub mod gpio;
pub mod mailbox;
pub mod mem;
pub mod pwm;

/// Every peripheral block the signal generator touches, mapped in one go.
pub struct Peripherals {
    pub dma: dma::Dma,
    pub pwm: pwm::Pwm,
    pub gpio: gpio::Gpio,
    pub clock: clock::Clock,
}

impl Peripherals {
    /// Map all peripheral register blocks through `/dev/mem`.
    ///
    /// Requires root (or `CAP_SYS_RAWIO`) on a stock Raspberry Pi OS kernel.
    pub fn open() -> io::Result<Peripherals> {
        let base = mem::peripheral_base();
        log::debug!("peripheral window at {:#010x}", base);
        Ok(Peripherals {
            dma: dma::Dma::new(mem::MemoryMap::new(base + dma::DMA_OFFSET, mem::PAGE_SIZE)?),
            pwm: pwm::Pwm::new(mem::MemoryMap::new(base + pwm::PWM_OFFSET, mem::PAGE_SIZE)?),
            gpio: gpio::Gpio::new(mem::MemoryMap::new(base + gpio::GPIO_OFFSET, mem::PAGE_SIZE)?),
            clock: clock::Clock::new(mem::MemoryMap::new(
                base + clock::CLOCK_OFFSET,
                mem::PAGE_SIZE,
            )?),
        })
    }
}
