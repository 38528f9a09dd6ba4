//! DCC waveform generation through the Raspberry Pi's PWM serializer and
//! DMA engine.
//!
//! A [`Bitstream`] describes the physical-layer words to put on the track,
//! interleaved with GPIO events and repeat/handoff markers. Compiling it
//! yields a [`QueuedBitstream`]: a graph of DMA control blocks plus a data
//! pool that, once committed to uncached memory, the engine walks on its own
//! to feed the PWM FIFO, reprogram the serializer width and toggle GPIOs at
//! the exact word where each event lands. The [`Driver`] owns the hardware,
//! stitches successive graphs together at breakpoints and retires them as
//! the engine moves on.

pub mod bitstream;
mod delayer;
pub mod driver;
pub mod memory;
pub mod queue;
mod worker;

pub use bitstream::{Bitstream, Event, Pin};
pub use driver::{Driver, QueueError};
pub use queue::{CommitError, CompileError, QueuedBitstream};
