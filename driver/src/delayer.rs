// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Delays GPIO events to match the serializer's pipeline.
//!
//! A word written to the PWM FIFO does not reach the track immediately: one
//! word sits in the FIFO behind the DREQ threshold and one in the shift
//! register. A GPIO write that should line up with a data word therefore has
//! to be issued two words later than it appears in the source stream.

use crate::bitstream::Pin;

/// Words between a FIFO write being queued and its first bit reaching the
/// track.
pub(crate) const EVENT_DELAY: u8 = 2;

/// A single GPIO transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GpioEdge {
    pub pin: Pin,
    pub set: bool,
}

/// The four words written through the GPIO output-set and output-clear
/// register pairs in one DMA transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GpioWrite {
    pub set: [u32; 2],
    pub clear: [u32; 2],
}

impl GpioWrite {
    /// Fold one edge into the write; a later edge on the same pin replaces
    /// an earlier one.
    fn merge(&mut self, edge: GpioEdge) {
        let index = (edge.pin.number() / 32) as usize;
        let mask = 1 << (edge.pin.number() % 32);
        if edge.set {
            self.set[index] |= mask;
            self.clear[index] &= !mask;
        } else {
            self.clear[index] |= mask;
            self.set[index] &= !mask;
        }
    }

    /// Payload in register order: set0, set1, clear0, clear1.
    pub fn words(&self) -> [u32; 4] {
        [self.set[0], self.set[1], self.clear[0], self.clear[1]]
    }
}

/// GPIO edges waiting out the serializer latency, oldest first.
///
/// All edges enter with the same delay and count down together, so the due
/// entries are always a prefix of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub(crate) struct DelayedEvents {
    events: Vec<(GpioEdge, u8)>,
}

impl DelayedEvents {
    pub fn defer(&mut self, edge: GpioEdge) {
        self.events.push((edge, EVENT_DELAY));
    }

    /// Advance the queue by one data word.
    ///
    /// Returns the combined write for every edge whose delay expired, merged
    /// in arrival order.
    pub fn countdown(&mut self) -> Option<GpioWrite> {
        for (_, remaining) in &mut self.events {
            *remaining -= 1;
        }
        if self.events.first().map_or(true, |(_, remaining)| *remaining > 0) {
            return None;
        }
        let mut write = GpioWrite::default();
        while self
            .events
            .first()
            .map_or(false, |(_, remaining)| *remaining == 0)
        {
            let (edge, _) = self.events.remove(0);
            write.merge(edge);
        }
        Some(write)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAILCOM_MASK: u32 = 1 << 17;
    const DEBUG_MASK: u32 = 1 << 19;

    fn set(pin: Pin) -> GpioEdge {
        GpioEdge { pin, set: true }
    }

    fn clear(pin: Pin) -> GpioEdge {
        GpioEdge { pin, set: false }
    }

    #[test]
    fn edge_released_after_two_words() {
        let mut delayed = DelayedEvents::default();
        delayed.defer(set(Pin::Debug));
        assert_eq!(delayed.countdown(), None);
        let write = delayed.countdown().expect("due after two words");
        assert_eq!(write.words(), [DEBUG_MASK, 0, 0, 0]);
        assert!(delayed.is_empty());
    }

    #[test]
    fn simultaneous_edges_coalesce() {
        let mut delayed = DelayedEvents::default();
        delayed.defer(set(Pin::RailCom));
        delayed.defer(clear(Pin::Debug));
        delayed.countdown();
        let write = delayed.countdown().expect("both due");
        assert_eq!(write.words(), [RAILCOM_MASK, 0, DEBUG_MASK, 0]);
    }

    #[test]
    fn last_edge_wins_on_one_pin() {
        let mut delayed = DelayedEvents::default();
        delayed.defer(set(Pin::RailCom));
        delayed.defer(clear(Pin::RailCom));
        delayed.countdown();
        let write = delayed.countdown().expect("due");
        assert_eq!(write.words(), [0, 0, RAILCOM_MASK, 0]);
    }

    #[test]
    fn staggered_edges_release_separately() {
        let mut delayed = DelayedEvents::default();
        delayed.defer(set(Pin::Debug));
        assert_eq!(delayed.countdown(), None);
        delayed.defer(clear(Pin::Debug));
        let first = delayed.countdown().expect("first edge due");
        assert_eq!(first.words(), [DEBUG_MASK, 0, 0, 0]);
        assert!(!delayed.is_empty());
        let second = delayed.countdown().expect("second edge due");
        assert_eq!(second.words(), [0, 0, DEBUG_MASK, 0]);
    }
}
