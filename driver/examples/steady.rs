//! Puts a bare carrier of DCC one bits on the track for ten seconds.
//!
//! Run as root on the Raspberry Pi itself:
//!
//!     RUST_LOG=debug cargo run --example steady

use std::thread;
use std::time::Duration;

use bcm2835_bsp::mailbox::Mailbox;
use bcm2835_bsp::Peripherals;
use dcc_driver::driver::WORD_SIZE;
use dcc_driver::{Bitstream, Driver};

/// Engine 5 is unused by the firmware and the kernel on a stock image.
const DMA_CHANNEL: usize = 5;

fn main() {
    env_logger::init();

    let peripherals = Peripherals::open().expect("failed to map peripherals (root required)");
    let mailbox = Mailbox::open().expect("failed to open the mailbox");
    let mut driver = Driver::new(peripherals, mailbox, DMA_CHANNEL);

    let mut bitstream = Bitstream::new(driver.bit_duration(), WORD_SIZE);
    for _ in 0..64 {
        bitstream.append_word(0xF0F0_F0F0);
    }

    driver
        .queue(&bitstream, true, || log::info!("carrier is on the track"))
        .expect("failed to queue bitstream");

    thread::sleep(Duration::from_secs(10));
    driver.shutdown();
}
