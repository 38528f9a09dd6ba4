// Copyright 2021 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Compiles event-annotated bitstreams into DMA control block graphs.
//!
//! The compiled graph drives three destinations as the engine walks it: the
//! PWM FIFO (data words, paced by DREQ), the PWM range register (word-width
//! changes) and the GPIO output-set/clear registers (delayed events). Start
//! and End blocks write a sentinel into slot 0 of the data pool so software
//! can follow the engine's progress without touching hardware registers.
//!
//! Addresses inside the graph are slot and block indices until `commit`
//! relocates them into an uncached region the engine can reach.

use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use bcm2835_bsp::dma::{self, Peripheral, TransferInformation};
use bcm2835_bsp::mailbox::Mailbox;
use bcm2835_bsp::{gpio, pwm};
use thiserror::Error;

use crate::bitstream::{Bitstream, Event};
use crate::delayer::{DelayedEvents, GpioEdge};
use crate::memory::MemoryRegion;

pub use crate::memory::CommitError;

/// Sentinel value once a Start block has executed.
const TRANSMITTING: u32 = 1;

/// Sentinel value once an End block has executed; -1 as a word.
const REPEATING: u32 = u32::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The bitstream, or the section after its loop marker, carries no data.
    #[error("bitstream contains no data")]
    BitstreamContainsNoData,
    /// A GPIO event's delay would have to be counted through a word that is
    /// not full width, which has no defined cycle.
    #[error("delayed GPIO event crosses a partial word")]
    UnalignedGpioDelay,
}

/// The operation a control block performs, with addresses still expressed
/// as data pool slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// Copies the literal 1 from slot 1 into the sentinel slot.
    Start,
    /// Feeds `length` pool words into the PWM FIFO.
    Data { data_index: usize, length: usize },
    /// Reprograms the serializer's bits-per-word.
    Range { data_index: usize },
    /// Writes four set/clear words to the GPIO output registers.
    Gpio { data_index: usize },
    /// Copies a literal -1 into the sentinel slot.
    End { data_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlBlock {
    pub kind: BlockKind,
    /// Index of the block the engine chains to, or `None` to halt.
    pub next: Option<usize>,
}

/// A point where a successor bitstream may take over, along with the machine
/// state the successor has to reproduce.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Breakpoint {
    /// Block whose next pointer is rewritten to jump into the successor.
    pub control_block: usize,
    /// Word width programmed through the serializer at this point.
    pub range: Option<u8>,
    /// GPIO edges still waiting out their delay at this point.
    pub delayed: DelayedEvents,
}

impl Breakpoint {
    fn state_matches(&self, other: &Breakpoint) -> bool {
        self.range == other.range && self.delayed == other.delayed
    }
}

/// Parser state at a given event position, used to find a block that the
/// repeating tail can legally jump back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParseState {
    event_index: usize,
    range: Option<u8>,
    delayed: DelayedEvents,
    run: Vec<u32>,
}

struct Parser<'a> {
    events: &'a [Event],
    word_size: u8,
    blocks: Vec<ControlBlock>,
    data: Vec<u32>,
    breakpoints: Vec<Breakpoint>,
    /// Words accumulated towards the current Data block.
    run: Vec<u32>,
    /// Width most recently programmed through a Range block.
    range: Option<u8>,
    /// GPIO edges counting down their two-word delay.
    delayed: DelayedEvents,
    /// Block the final End chains back to.
    repeat_entry: usize,
    /// Event position the repeating section resumes from.
    replay_from: usize,
    /// Delayed-event state on first entry to the repeat point.
    entry_delayed: DelayedEvents,
    states: HashMap<ParseState, usize>,
}

impl<'a> Parser<'a> {
    fn new(bitstream: &'a Bitstream, seed: Option<&Breakpoint>) -> Parser<'a> {
        let mut parser = Parser {
            events: &bitstream.events,
            word_size: bitstream.word_size,
            blocks: Vec::new(),
            data: vec![0],
            breakpoints: Vec::new(),
            run: Vec::new(),
            range: None,
            delayed: DelayedEvents::default(),
            repeat_entry: 1,
            replay_from: 0,
            entry_delayed: DelayedEvents::default(),
            states: HashMap::new(),
        };
        if let Some(breakpoint) = seed {
            parser.range = breakpoint.range;
            parser.delayed = breakpoint.delayed.clone();
            parser.entry_delayed = breakpoint.delayed.clone();
        }
        parser
    }

    fn parse(
        mut self,
        repeating: bool,
    ) -> Result<(Vec<ControlBlock>, Vec<u32>, Vec<Breakpoint>), CompileError> {
        self.check_has_data()?;

        self.emit(BlockKind::Start);
        self.data.push(TRANSMITTING);

        for index in 0..self.events.len() {
            self.record_state(index);
            let event = self.events[index];
            self.process(index, event, true)?;
        }
        self.flush_run();

        if !repeating {
            if self.delayed.is_empty() {
                self.emit_end(None);
            } else {
                self.emit_end(Some(self.blocks.len() + 1));
                self.drain_delayed()?;
            }
        } else if self.delayed == self.entry_delayed {
            self.emit_end(Some(self.repeat_entry));
        } else {
            self.emit_end(Some(self.blocks.len() + 1));
            self.unroll()?;
        }

        Ok((self.blocks, self.data, self.breakpoints))
    }

    fn check_has_data(&self) -> Result<(), CompileError> {
        let mut has_data = false;
        let mut data_after_loop = None;
        for event in self.events {
            match event {
                Event::Data { .. } => {
                    has_data = true;
                    if let Some(found) = data_after_loop.as_mut() {
                        *found = true;
                    }
                }
                Event::LoopStart => data_after_loop = Some(false),
                _ => {}
            }
        }
        if !has_data || data_after_loop == Some(false) {
            return Err(CompileError::BitstreamContainsNoData);
        }
        Ok(())
    }

    fn emit(&mut self, kind: BlockKind) {
        let next = Some(self.blocks.len() + 1);
        self.blocks.push(ControlBlock { kind, next });
    }

    /// Close the open word run into a Data block.
    fn flush_run(&mut self) {
        if self.run.is_empty() {
            return;
        }
        let data_index = self.data.len();
        let length = self.run.len();
        self.data.append(&mut self.run);
        self.emit(BlockKind::Data { data_index, length });
    }

    /// Emit an End block and record it as a handoff point.
    fn emit_end(&mut self, next: Option<usize>) {
        let data_index = self.data.len();
        self.data.push(REPEATING);
        self.blocks.push(ControlBlock {
            kind: BlockKind::End { data_index },
            next,
        });
        self.breakpoints.push(Breakpoint {
            control_block: self.blocks.len() - 1,
            range: self.range,
            delayed: self.delayed.clone(),
        });
    }

    fn record_state(&mut self, event_index: usize) {
        let state = self.state(event_index);
        let position = self.blocks.len();
        self.states.entry(state).or_insert(position);
    }

    fn state(&self, event_index: usize) -> ParseState {
        ParseState {
            event_index,
            range: self.range,
            delayed: self.delayed.clone(),
            run: self.run.clone(),
        }
    }

    fn process(&mut self, index: usize, event: Event, defer_gpio: bool) -> Result<(), CompileError> {
        match event {
            Event::Data { word, size } => {
                if !self.delayed.is_empty() && size != self.word_size {
                    return Err(CompileError::UnalignedGpioDelay);
                }
                if self.range != Some(size) {
                    // A width change is programmed right behind the word
                    // that needs it, so the word becomes its own block.
                    self.flush_run();
                    let data_index = self.data.len();
                    self.data.push(word);
                    self.emit(BlockKind::Data {
                        data_index,
                        length: 1,
                    });
                    let data_index = self.data.len();
                    self.data.push(u32::from(size));
                    self.emit(BlockKind::Range { data_index });
                    self.range = Some(size);
                } else {
                    self.run.push(word);
                }
                if let Some(write) = self.delayed.countdown() {
                    self.flush_run();
                    let data_index = self.data.len();
                    self.data.extend_from_slice(&write.words());
                    self.emit(BlockKind::Gpio { data_index });
                }
            }
            Event::GpioSet(pin) => {
                if defer_gpio {
                    self.delayed.defer(GpioEdge { pin, set: true });
                }
            }
            Event::GpioClear(pin) => {
                if defer_gpio {
                    self.delayed.defer(GpioEdge { pin, set: false });
                }
            }
            Event::LoopStart => {
                self.flush_run();
                self.repeat_entry = self.blocks.len();
                self.replay_from = index + 1;
                self.entry_delayed = self.delayed.clone();
            }
            Event::Breakpoint => {
                self.flush_run();
                self.breakpoints.push(Breakpoint {
                    control_block: self.blocks.len() - 1,
                    range: self.range,
                    delayed: self.delayed.clone(),
                });
            }
        }
        Ok(())
    }

    /// Continue emitting the repeating section until the machine state lands
    /// on one already in the graph, then chain back to it.
    ///
    /// GPIO events delayed past the end of the input would otherwise fall
    /// after the back-edge; replaying data from the repeat point places them
    /// while keeping a position the loop can legally return to. The delayed
    /// queue shrinks with every replayed word and the unroll's own entry
    /// state is recorded, so at worst the second pass matches it.
    fn unroll(&mut self) -> Result<(), CompileError> {
        loop {
            for index in self.replay_from..self.events.len() {
                let state = self.state(index);
                if let Some(&target) = self.states.get(&state) {
                    self.emit_end(Some(target));
                    return Ok(());
                }
                let position = self.blocks.len();
                self.states.insert(state, position);
                let event = self.events[index];
                self.process(index, event, true)?;
            }
            // Close the run at the wrap so every pass starts from a block
            // boundary; without this a pass that releases nothing would grow
            // the run forever and no state could repeat.
            self.flush_run();
        }
    }

    /// Replay data from the repeat point only until every pending GPIO edge
    /// has fired, then halt. Used for non-repeating bitstreams, whose own
    /// tail events must not re-enter the queue.
    fn drain_delayed(&mut self) -> Result<(), CompileError> {
        'drain: loop {
            for index in self.replay_from..self.events.len() {
                let event = self.events[index];
                self.process(index, event, false)?;
                if self.delayed.is_empty() {
                    break 'drain;
                }
            }
        }
        self.flush_run();
        self.emit_end(None);
        Ok(())
    }
}

/// A bitstream compiled into a control block graph, and once committed, the
/// uncached memory the engine executes it from.
pub struct QueuedBitstream {
    bit_duration: f32,
    duration: f32,
    pub(crate) blocks: Vec<ControlBlock>,
    pub(crate) data: Vec<u32>,
    pub(crate) breakpoints: Vec<Breakpoint>,
    memory: Option<MemoryRegion>,
}

impl QueuedBitstream {
    /// Compile a bitstream into a control block graph and data pool.
    ///
    /// A repeating bitstream loops from its End block back to its repeat
    /// point forever; a non-repeating one halts the engine instead.
    pub fn compile(bitstream: &Bitstream, repeating: bool) -> Result<QueuedBitstream, CompileError> {
        let (blocks, data, breakpoints) = Parser::new(bitstream, None).parse(repeating)?;
        Ok(QueuedBitstream {
            bit_duration: bitstream.bit_duration,
            duration: bitstream.duration(),
            blocks,
            data,
            breakpoints,
            memory: None,
        })
    }

    /// Compile a successor that can seamlessly take over from `previous`.
    ///
    /// The parser starts from the machine state at `previous`'s final
    /// breakpoint rather than from scratch, so pending GPIO edges carry
    /// across and the serializer width is not reprogrammed needlessly. Also
    /// returns the indices of the blocks in `previous` whose next pointers
    /// must be rewritten (with [`QueuedBitstream::transfer`]) once the
    /// successor has been committed.
    pub fn compile_following(
        previous: &QueuedBitstream,
        bitstream: &Bitstream,
        repeating: bool,
    ) -> Result<(QueuedBitstream, Vec<usize>), CompileError> {
        let seed = previous
            .breakpoints
            .last()
            .expect("a compiled bitstream always ends in a breakpoint");
        let (blocks, data, breakpoints) = Parser::new(bitstream, Some(seed)).parse(repeating)?;

        let offsets = previous
            .breakpoints
            .iter()
            .filter(|breakpoint| breakpoint.state_matches(seed))
            .map(|breakpoint| breakpoint.control_block)
            .collect();

        Ok((
            QueuedBitstream {
                bit_duration: bitstream.bit_duration,
                duration: bitstream.duration(),
                blocks,
                data,
                breakpoints,
                memory: None,
            },
            offsets,
        ))
    }

    /// Time one pass of the source bitstream occupies the track, in
    /// microseconds.
    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn bit_duration(&self) -> f32 {
        self.bit_duration
    }

    pub fn is_committed(&self) -> bool {
        self.memory.is_some()
    }

    /// Bus address of the entry block once committed.
    pub fn bus_address(&self) -> Option<u32> {
        self.memory.as_ref().map(|memory| memory.bus_address())
    }

    /// Materialize the hardware descriptors for a graph based at
    /// `base_bus_address`: pool slots and block indices become bus
    /// addresses, peripheral destinations are already bus addresses and
    /// pass through unchanged.
    fn descriptors(&self, base_bus_address: u32) -> Vec<dma::ControlBlock> {
        let pool_bus_address =
            base_bus_address + (self.blocks.len() * dma::ControlBlock::SIZE) as u32;
        let slot = |index: usize| pool_bus_address + (index * 4) as u32;
        let link = |next: Option<usize>| match next {
            Some(index) => base_bus_address + (index * dma::ControlBlock::SIZE) as u32,
            None => dma::STOP_ADDRESS,
        };
        let dreq = TransferInformation::NO_WIDE_BURSTS
            | TransferInformation::WAIT_FOR_WRITE_RESPONSE
            | TransferInformation::DESTINATION_DREQ
            | TransferInformation::peripheral_mapping(Peripheral::Pwm);

        self.blocks
            .iter()
            .map(|block| match block.kind {
                BlockKind::Start => dma::ControlBlock::new(
                    TransferInformation::WAIT_FOR_WRITE_RESPONSE,
                    slot(1),
                    slot(0),
                    4,
                    0,
                    link(block.next),
                ),
                BlockKind::Data { data_index, length } => dma::ControlBlock::new(
                    dreq | TransferInformation::SOURCE_ADDRESS_INCREMENT,
                    slot(data_index),
                    pwm::FIFO_BUS_ADDRESS,
                    (length * 4) as u32,
                    0,
                    link(block.next),
                ),
                BlockKind::Range { data_index } => dma::ControlBlock::new(
                    dreq,
                    slot(data_index),
                    pwm::RANGE1_BUS_ADDRESS,
                    4,
                    0,
                    link(block.next),
                ),
                BlockKind::Gpio { data_index } => dma::ControlBlock::new(
                    TransferInformation::NO_WIDE_BURSTS
                        | TransferInformation::WAIT_FOR_WRITE_RESPONSE
                        | TransferInformation::TD_MODE
                        | TransferInformation::SOURCE_ADDRESS_INCREMENT
                        | TransferInformation::DESTINATION_ADDRESS_INCREMENT,
                    slot(data_index),
                    gpio::SET_BUS_ADDRESS,
                    dma::ControlBlock::two_d_transfer_length(8, 2),
                    dma::ControlBlock::two_d_stride(0, 4),
                    link(block.next),
                ),
                BlockKind::End { data_index } => dma::ControlBlock::new(
                    TransferInformation::WAIT_FOR_WRITE_RESPONSE,
                    slot(data_index),
                    slot(0),
                    4,
                    0,
                    link(block.next),
                ),
            })
            .collect()
    }

    /// Relocate the graph into a freshly allocated uncached region.
    ///
    /// Idempotent once it has succeeded; on failure the region is released
    /// and the bitstream stays uncommitted.
    pub fn commit(&mut self, mailbox: &Arc<Mailbox>) -> Result<(), CommitError> {
        if self.memory.is_some() {
            return Ok(());
        }

        let size = self.blocks.len() * dma::ControlBlock::SIZE + self.data.len() * 4;
        let memory = MemoryRegion::allocate(mailbox.clone(), size)?;

        for (index, descriptor) in self.descriptors(memory.bus_address()).iter().enumerate() {
            let base = index * dma::ControlBlock::SIZE / 4;
            memory.write(base, descriptor.transfer_information);
            memory.write(base + 1, descriptor.source_address);
            memory.write(base + 2, descriptor.destination_address);
            memory.write(base + 3, descriptor.transfer_length);
            memory.write(base + 4, descriptor.stride);
            memory.write(base + 5, descriptor.next_control_block_address);
        }
        let pool_base = self.blocks.len() * dma::ControlBlock::SIZE / 4;
        for (index, &word) in self.data.iter().enumerate() {
            memory.write(pool_base + index, word);
        }

        // The graph must be whole before its address is handed to anything
        // that could chain the engine into it.
        fence(Ordering::SeqCst);
        self.memory = Some(memory);
        Ok(())
    }

    fn sentinel(&self) -> u32 {
        match &self.memory {
            Some(memory) => memory.read(self.blocks.len() * dma::ControlBlock::SIZE / 4),
            None => 0,
        }
    }

    /// True from the moment the engine executes the Start block until the
    /// bitstream is replaced.
    pub fn is_transmitting(&self) -> bool {
        self.sentinel() != 0
    }

    /// True once the engine has executed an End block, i.e. the bitstream
    /// has been transmitted in full at least once.
    pub fn is_repeating(&self) -> bool {
        self.sentinel() == REPEATING
    }

    /// Rewire the committed graph in place so the blocks at `offsets` chain
    /// into `next` instead of following their compiled next pointers.
    ///
    /// Each rewrite is a single word store that the engine observes
    /// atomically; it only fetches a next pointer after finishing the
    /// block's own transfer, so a block it has already passed simply takes
    /// the new edge on the following lap.
    pub fn transfer(&self, offsets: &[usize], next: &QueuedBitstream) {
        let memory = self
            .memory
            .as_ref()
            .expect("transfer requires a committed bitstream");
        let target = next
            .bus_address()
            .expect("transfer target must be committed first");
        for &offset in offsets {
            assert!(offset < self.blocks.len());
            memory.write(
                (offset * dma::ControlBlock::SIZE + dma::ControlBlock::NEXT_OFFSET) / 4,
                target,
            );
        }
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::Pin;

    const RAILCOM_MASK: u32 = 1 << 17;
    const DEBUG_MASK: u32 = 1 << 19;

    fn data(word: u32, size: u8) -> Event {
        Event::Data { word, size }
    }

    fn bitstream(events: &[Event]) -> Bitstream {
        let mut bitstream = Bitstream::new(14.5, 32);
        for &event in events {
            bitstream.append(event);
        }
        bitstream
    }

    fn compile(events: &[Event]) -> QueuedBitstream {
        QueuedBitstream::compile(&bitstream(events), true).expect("compiles")
    }

    fn block(kind: BlockKind, next: Option<usize>) -> ControlBlock {
        ControlBlock { kind, next }
    }

    /// What the engine would put on the bus, in traversal order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Step {
        Start,
        Word(u32),
        Range(u32),
        Gpio([u32; 4]),
        End,
    }

    fn walk(queued: &QueuedBitstream, limit: usize) -> Vec<Step> {
        let mut steps = Vec::new();
        let mut position = Some(0);
        while let Some(index) = position {
            if steps.len() >= limit {
                break;
            }
            let block = &queued.blocks[index];
            match block.kind {
                BlockKind::Start => steps.push(Step::Start),
                BlockKind::Data { data_index, length } => {
                    for offset in 0..length {
                        steps.push(Step::Word(queued.data[data_index + offset]));
                    }
                }
                BlockKind::Range { data_index } => {
                    steps.push(Step::Range(queued.data[data_index]))
                }
                BlockKind::Gpio { data_index } => steps.push(Step::Gpio([
                    queued.data[data_index],
                    queued.data[data_index + 1],
                    queued.data[data_index + 2],
                    queued.data[data_index + 3],
                ])),
                BlockKind::End { .. } => steps.push(Step::End),
            }
            position = block.next;
        }
        steps
    }

    fn words(steps: &[Step]) -> Vec<u32> {
        steps
            .iter()
            .filter_map(|step| match step {
                Step::Word(word) => Some(*word),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_word() {
        let queued = compile(&[data(0xCAFE_F00D, 32)]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(BlockKind::End { data_index: 4 }, Some(1)),
            ]
        );
        assert_eq!(queued.data, vec![0, 1, 0xCAFE_F00D, 32, u32::MAX]);
    }

    #[test]
    fn two_equal_words() {
        let queued = compile(&[data(0x1111_1111, 32), data(0x2222_2222, 32)]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(
                    BlockKind::Data {
                        data_index: 4,
                        length: 1
                    },
                    Some(4)
                ),
                block(BlockKind::End { data_index: 5 }, Some(1)),
            ]
        );
        assert_eq!(
            queued.data,
            vec![0, 1, 0x1111_1111, 32, 0x2222_2222, u32::MAX]
        );
    }

    #[test]
    fn width_change_reprograms_range() {
        let queued = compile(&[data(0x1111_1111, 32), data(0xABCD_EF00, 24)]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(
                    BlockKind::Data {
                        data_index: 4,
                        length: 1
                    },
                    Some(4)
                ),
                block(BlockKind::Range { data_index: 5 }, Some(5)),
                block(BlockKind::End { data_index: 6 }, Some(1)),
            ]
        );
        assert_eq!(
            queued.data,
            vec![0, 1, 0x1111_1111, 32, 0xABCD_EF00, 24, u32::MAX]
        );
    }

    #[test]
    fn equal_width_words_merge_into_one_block() {
        let queued = compile(&[
            data(0x1111_1111, 32),
            data(0x2222_2222, 32),
            data(0x3333_3333, 32),
        ]);
        assert_eq!(queued.blocks.len(), 5);
        assert_eq!(
            queued.blocks[3],
            block(
                BlockKind::Data {
                    data_index: 4,
                    length: 2
                },
                Some(4)
            )
        );
        assert_eq!(
            queued.data,
            vec![0, 1, 0x1111_1111, 32, 0x2222_2222, 0x3333_3333, u32::MAX]
        );
    }

    #[test]
    fn gpio_event_lands_two_words_late() {
        let queued = compile(&[
            data(0x1111_1111, 32),
            Event::GpioSet(Pin::Debug),
            data(0x2222_2222, 32),
            data(0x3333_3333, 32),
        ]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(
                    BlockKind::Data {
                        data_index: 4,
                        length: 2
                    },
                    Some(4)
                ),
                block(BlockKind::Gpio { data_index: 6 }, Some(5)),
                block(BlockKind::End { data_index: 10 }, Some(1)),
            ]
        );
        assert_eq!(
            queued.data,
            vec![
                0,
                1,
                0x1111_1111,
                32,
                0x2222_2222,
                0x3333_3333,
                DEBUG_MASK,
                0,
                0,
                0,
                u32::MAX
            ]
        );
    }

    #[test]
    fn simultaneous_gpio_events_share_one_block() {
        let queued = compile(&[
            data(1, 32),
            data(2, 32),
            Event::GpioSet(Pin::RailCom),
            Event::GpioClear(Pin::Debug),
            data(3, 32),
            data(4, 32),
            data(5, 32),
        ]);
        let gpio_blocks: Vec<_> = queued
            .blocks
            .iter()
            .filter_map(|block| match block.kind {
                BlockKind::Gpio { data_index } => Some(data_index),
                _ => None,
            })
            .collect();
        assert_eq!(gpio_blocks.len(), 1);
        let data_index = gpio_blocks[0];
        assert_eq!(
            &queued.data[data_index..data_index + 4],
            &[RAILCOM_MASK, 0, DEBUG_MASK, 0]
        );
        // Both edges fired after words 3 and 4; word 5 follows in a new run.
        let steps = walk(&queued, 10);
        assert_eq!(
            steps[..8],
            [
                Step::Start,
                Step::Word(1),
                Step::Range(32),
                Step::Word(2),
                Step::Word(3),
                Step::Word(4),
                Step::Gpio([RAILCOM_MASK, 0, DEBUG_MASK, 0]),
                Step::Word(5),
            ]
        );
    }

    #[test]
    fn loop_marker_breaks_run_and_sets_back_edge() {
        let queued = compile(&[
            data(0xAAAA_AAAA, 32),
            data(0xBBBB_BBBB, 32),
            Event::LoopStart,
            data(0xCCCC_CCCC, 32),
            data(0xDDDD_DDDD, 32),
        ]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(
                    BlockKind::Data {
                        data_index: 4,
                        length: 1
                    },
                    Some(4)
                ),
                block(
                    BlockKind::Data {
                        data_index: 5,
                        length: 2
                    },
                    Some(5)
                ),
                block(BlockKind::End { data_index: 7 }, Some(4)),
            ]
        );
        // Steady state repeats only the words after the loop marker.
        let steps = walk(&queued, 20);
        assert_eq!(
            words(&steps)[..8],
            [
                0xAAAA_AAAA,
                0xBBBB_BBBB,
                0xCCCC_CCCC,
                0xDDDD_DDDD,
                0xCCCC_CCCC,
                0xDDDD_DDDD,
                0xCCCC_CCCC,
                0xDDDD_DDDD,
            ]
        );
    }

    #[test]
    fn trailing_gpio_unrolls_the_tail() {
        let queued = compile(&[
            data(0x1111_1111, 32),
            data(0x2222_2222, 32),
            data(0x3333_3333, 32),
            Event::GpioSet(Pin::Debug),
        ]);
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 1
                    },
                    Some(2)
                ),
                block(BlockKind::Range { data_index: 3 }, Some(3)),
                block(
                    BlockKind::Data {
                        data_index: 4,
                        length: 2
                    },
                    Some(4)
                ),
                block(BlockKind::End { data_index: 6 }, Some(5)),
                block(
                    BlockKind::Data {
                        data_index: 7,
                        length: 2
                    },
                    Some(6)
                ),
                block(BlockKind::Gpio { data_index: 9 }, Some(7)),
                block(
                    BlockKind::Data {
                        data_index: 13,
                        length: 1
                    },
                    Some(8)
                ),
                block(BlockKind::End { data_index: 14 }, Some(5)),
            ]
        );
        // The words repeat cleanly and the edge fires two words after its
        // position at the end of the stream, every cycle.
        let steps = walk(&queued, 40);
        assert_eq!(
            words(&steps)[..12],
            [
                0x1111_1111,
                0x2222_2222,
                0x3333_3333,
                0x1111_1111,
                0x2222_2222,
                0x3333_3333,
                0x1111_1111,
                0x2222_2222,
                0x3333_3333,
                0x1111_1111,
                0x2222_2222,
                0x3333_3333,
            ]
        );
        let cycle = [
            Step::Word(0x1111_1111),
            Step::Word(0x2222_2222),
            Step::Gpio([DEBUG_MASK, 0, 0, 0]),
            Step::Word(0x3333_3333),
            Step::End,
        ];
        assert_eq!(steps[6..11], cycle);
        assert_eq!(steps[11..16], cycle);
    }

    #[test]
    fn empty_bitstream_is_rejected() {
        let source = bitstream(&[Event::GpioSet(Pin::Debug)]);
        assert_eq!(
            QueuedBitstream::compile(&source, true).err(),
            Some(CompileError::BitstreamContainsNoData)
        );
    }

    #[test]
    fn loop_without_data_is_rejected() {
        let source = bitstream(&[data(1, 32), Event::LoopStart]);
        assert_eq!(
            QueuedBitstream::compile(&source, true).err(),
            Some(CompileError::BitstreamContainsNoData)
        );
    }

    #[test]
    fn gpio_delay_across_partial_word_is_rejected() {
        let source = bitstream(&[
            data(1, 32),
            Event::GpioSet(Pin::Debug),
            data(0xFF00_0000, 24),
        ]);
        assert_eq!(
            QueuedBitstream::compile(&source, true).err(),
            Some(CompileError::UnalignedGpioDelay)
        );
    }

    #[test]
    fn constant_width_round_trip() {
        let input = [10, 20, 30, 40, 50];
        let events: Vec<Event> = input.iter().map(|&word| data(word, 32)).collect();
        let queued = compile(&events);
        // One full pass runs from the Start block to the first End.
        let steps = walk(&queued, 8);
        let end = steps
            .iter()
            .position(|step| *step == Step::End)
            .expect("graph ends");
        assert_eq!(words(&steps[..end]), input);
    }

    #[test]
    fn non_repeating_graph_halts() {
        let source = bitstream(&[data(0xF0F0_F0F0, 32)]);
        let queued = QueuedBitstream::compile(&source, false).expect("compiles");
        assert_eq!(queued.blocks[3].next, None);
        let steps = walk(&queued, 16);
        assert_eq!(
            steps,
            vec![
                Step::Start,
                Step::Word(0xF0F0_F0F0),
                Step::Range(32),
                Step::End
            ]
        );
    }

    #[test]
    fn non_repeating_trailing_gpio_drains_then_halts() {
        let source = bitstream(&[
            data(0x1111_1111, 32),
            data(0x2222_2222, 32),
            data(0x3333_3333, 32),
            Event::GpioSet(Pin::Debug),
        ]);
        let queued = QueuedBitstream::compile(&source, false).expect("compiles");
        let steps = walk(&queued, 20);
        assert_eq!(
            steps,
            vec![
                Step::Start,
                Step::Word(0x1111_1111),
                Step::Range(32),
                Step::Word(0x2222_2222),
                Step::Word(0x3333_3333),
                Step::End,
                Step::Word(0x1111_1111),
                Step::Word(0x2222_2222),
                Step::Gpio([DEBUG_MASK, 0, 0, 0]),
                Step::End,
            ]
        );
    }

    #[test]
    fn breakpoints_record_handoff_points() {
        let queued = compile(&[
            data(0x1111_1111, 32),
            Event::Breakpoint,
            data(0x2222_2222, 32),
        ]);
        // One at the marker (after the Range block) and one at the End.
        assert_eq!(queued.breakpoints.len(), 2);
        assert_eq!(queued.breakpoints[0].control_block, 2);
        assert_eq!(queued.breakpoints[1].control_block, 4);
        assert!(queued.breakpoints[0].state_matches(&queued.breakpoints[1]));
    }

    #[test]
    fn following_bitstream_continues_machine_state() {
        let previous = compile(&[
            data(0x1111_1111, 32),
            Event::Breakpoint,
            data(0x2222_2222, 32),
        ]);
        let next = bitstream(&[data(0x3333_3333, 32), data(0x4444_4444, 32)]);
        let (queued, offsets) =
            QueuedBitstream::compile_following(&previous, &next, true).expect("compiles");

        // Width already programmed at the handoff, so no Range block at all.
        assert_eq!(
            queued.blocks,
            vec![
                block(BlockKind::Start, Some(1)),
                block(
                    BlockKind::Data {
                        data_index: 2,
                        length: 2
                    },
                    Some(2)
                ),
                block(BlockKind::End { data_index: 4 }, Some(1)),
            ]
        );
        assert_eq!(offsets, vec![2, 4]);
    }

    #[test]
    fn handoff_skips_breakpoints_with_pending_edges() {
        let previous = compile(&[
            data(0x1111_1111, 32),
            Event::GpioSet(Pin::Debug),
            Event::Breakpoint,
            data(0x2222_2222, 32),
            data(0x3333_3333, 32),
        ]);
        // The marker sits under a pending edge; the End does not.
        assert_eq!(previous.breakpoints.len(), 2);
        let next = bitstream(&[data(0x4444_4444, 32)]);
        let (_, offsets) =
            QueuedBitstream::compile_following(&previous, &next, true).expect("compiles");
        assert_eq!(offsets, vec![previous.breakpoints[1].control_block]);
    }

    #[test]
    fn pending_edges_carry_into_the_successor() {
        // An edge ahead of the only word leaves the previous bitstream's
        // final state one word short of firing, so the successor owes that
        // edge after its first word before settling down.
        let previous = compile(&[Event::GpioSet(Pin::Debug), data(0x1111_1111, 32)]);
        let next = bitstream(&[
            data(0x4444_4444, 32),
            data(0x5555_5555, 32),
            data(0x6666_6666, 32),
        ]);
        let (queued, _) =
            QueuedBitstream::compile_following(&previous, &next, true).expect("compiles");
        let steps = walk(&queued, 12);
        assert_eq!(
            steps[..6],
            [
                Step::Start,
                Step::Word(0x4444_4444),
                Step::Gpio([DEBUG_MASK, 0, 0, 0]),
                Step::Word(0x5555_5555),
                Step::Word(0x6666_6666),
                Step::End,
            ]
        );
        // Once the inherited edge has fired the tail repeats clean.
        assert_eq!(
            steps[6..10],
            [
                Step::Word(0x4444_4444),
                Step::Word(0x5555_5555),
                Step::Word(0x6666_6666),
                Step::End,
            ]
        );
    }

    #[test]
    fn descriptors_relocate_pool_and_block_offsets() {
        let base = 0x4000_0000;
        let queued = compile(&[data(0xAAAA_AAAA, 32)]);
        let descriptors = queued.descriptors(base);
        assert_eq!(descriptors.len(), 4);

        let pool = base + 4 * dma::ControlBlock::SIZE as u32;
        // Start: literal 1 into the sentinel slot, chain to the Data block.
        assert_eq!(descriptors[0].source_address, pool + 4);
        assert_eq!(descriptors[0].destination_address, pool);
        assert_eq!(descriptors[0].transfer_length, 4);
        assert_eq!(
            descriptors[0].next_control_block_address,
            base + dma::ControlBlock::SIZE as u32
        );
        // Data: pool word into the FIFO, DREQ paced.
        assert_eq!(descriptors[1].source_address, pool + 8);
        assert_eq!(descriptors[1].destination_address, pwm::FIFO_BUS_ADDRESS);
        assert_eq!(
            descriptors[1].transfer_information,
            (TransferInformation::NO_WIDE_BURSTS
                | TransferInformation::WAIT_FOR_WRITE_RESPONSE
                | TransferInformation::DESTINATION_DREQ
                | TransferInformation::SOURCE_ADDRESS_INCREMENT
                | TransferInformation::peripheral_mapping(Peripheral::Pwm))
            .bits()
        );
        // Range: pool word into RNG1.
        assert_eq!(descriptors[2].source_address, pool + 12);
        assert_eq!(descriptors[2].destination_address, pwm::RANGE1_BUS_ADDRESS);
        // End: literal -1 into the sentinel slot, chain back to the Data
        // block.
        assert_eq!(descriptors[3].source_address, pool + 16);
        assert_eq!(descriptors[3].destination_address, pool);
        assert_eq!(
            descriptors[3].next_control_block_address,
            base + dma::ControlBlock::SIZE as u32
        );
    }

    #[test]
    fn gpio_descriptor_uses_two_d_mode() {
        let queued = compile(&[
            data(1, 32),
            Event::GpioSet(Pin::Debug),
            data(2, 32),
            data(3, 32),
        ]);
        let descriptors = queued.descriptors(0x4000_0000);
        let gpio_descriptor = descriptors[4];
        assert_eq!(gpio_descriptor.destination_address, gpio::SET_BUS_ADDRESS);
        assert_eq!(
            gpio_descriptor.transfer_length,
            dma::ControlBlock::two_d_transfer_length(8, 2)
        );
        assert_eq!(gpio_descriptor.stride, dma::ControlBlock::two_d_stride(0, 4));
        assert!(TransferInformation::from_bits_retain(gpio_descriptor.transfer_information)
            .contains(TransferInformation::TD_MODE));
    }

    #[test]
    fn halting_graph_ends_with_stop_address() {
        let source = bitstream(&[data(1, 32)]);
        let queued = QueuedBitstream::compile(&source, false).expect("compiles");
        let descriptors = queued.descriptors(0x4000_0000);
        assert_eq!(
            descriptors[3].next_control_block_address,
            dma::STOP_ADDRESS
        );
    }

    #[test]
    fn uncommitted_bitstream_is_not_transmitting() {
        let queued = compile(&[data(1, 32)]);
        assert!(!queued.is_committed());
        assert!(!queued.is_transmitting());
        assert!(!queued.is_repeating());
        assert_eq!(queued.bus_address(), None);
    }

    #[test]
    fn duration_comes_from_the_source() {
        let queued = compile(&[data(1, 32), data(2, 32)]);
        assert_eq!(queued.duration(), 64.0 * 14.5);
    }
}
