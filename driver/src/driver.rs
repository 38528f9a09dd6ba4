//! The track scheduler.
//!
//! Owns the hardware and a queue of committed bitstreams chained together in
//! the engine's memory. All state is confined to one worker thread; `queue`
//! and `stop` run there synchronously, watchers and the watchdog run there
//! as deferred jobs, and completion callbacks are pushed out to a separate
//! thread so they can never re-enter the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bcm2835_bsp::mailbox::Mailbox;
use bcm2835_bsp::{clock, dma, gpio, pwm, Peripherals};
use thiserror::Error;

use crate::bitstream::{Bitstream, Event, Pin};
use crate::queue::{CommitError, CompileError, QueuedBitstream};
use crate::worker::{Handle, WorkQueue};

/// The DCC waveform output, PWM0 on its alternate function 5.
const DCC_PIN: u32 = 18;

/// Half-bit period the clock divisor aims for, in microseconds.
const DESIRED_BIT_DURATION: f32 = 14.5;

/// Bits per FIFO word.
pub const WORD_SIZE: u8 = 32;

/// How often a watcher polls its bitstream's sentinel.
const WATCHER_INTERVAL: Duration = Duration::from_millis(1);

/// How often the watchdog inspects the hardware error flags.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);

/// A word of DCC one bits: 58 µs high, 58 µs low at the 14.5 µs bit clock.
const ONE_BITS_WORD: u32 = 0xF0F0_F0F0;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("bitstream could not be compiled")]
    Compile(#[from] CompileError),
    #[error("bitstream could not be committed")]
    Commit(#[from] CommitError),
}

type Completion = Box<dyn FnOnce() + Send>;

fn clock_divisor() -> u32 {
    (DESIRED_BIT_DURATION * (clock::OSCILLATOR_FREQUENCY / 1_000_000.0)).round() as u32
}

fn actual_bit_duration(divisor: u32) -> f32 {
    divisor as f32 / (clock::OSCILLATOR_FREQUENCY / 1_000_000.0)
}

/// Transmitted ahead of traffic after the track has been unpowered: a burst
/// of one bits gives boosters a clean carrier to wake up on.
fn power_on_bitstream(bit_duration: f32) -> Bitstream {
    let mut bitstream = Bitstream::new(bit_duration, WORD_SIZE);
    for _ in 0..16 {
        bitstream.append_word(ONE_BITS_WORD);
    }
    bitstream
}

/// Transmitted after the last queued bitstream: drops the cutout and debug
/// outputs and parks the line low before the graph halts the engine.
fn power_off_bitstream(bit_duration: f32) -> Bitstream {
    let mut bitstream = Bitstream::new(bit_duration, WORD_SIZE);
    bitstream.append(Event::GpioClear(Pin::RailCom));
    bitstream.append(Event::GpioClear(Pin::Debug));
    for _ in 0..8 {
        bitstream.append_word(0);
    }
    bitstream
}

/// Where a queued bitstream is in its life, as observed via its sentinel.
#[derive(Clone, Copy)]
enum Phase {
    /// Waiting for the engine to execute the Start block.
    Queued,
    /// Start observed; waiting for the End block plus one full duration.
    Transmitting { since: Instant },
    /// Completion delivered; repeating until replaced or retired.
    Repeating,
}

struct Entry {
    id: u64,
    bitstream: QueuedBitstream,
    repeating: bool,
    completion: Option<Completion>,
    phase: Phase,
}

struct WatcherCount {
    count: Mutex<usize>,
    drained: Condvar,
}

impl WatcherCount {
    fn new() -> WatcherCount {
        WatcherCount {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_for_drain(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

struct DriverState {
    peripherals: Peripherals,
    mailbox: Arc<Mailbox>,
    dma_channel: usize,
    bit_duration: f32,
    queue: Vec<Entry>,
    requires_power_on: bool,
    next_id: u64,
    running: Arc<AtomicBool>,
    watchers: Arc<WatcherCount>,
    callbacks: Sender<Completion>,
    stall_logged: bool,
}

impl DriverState {
    /// Compile, commit and chain one bitstream onto the tail of the queue,
    /// starting the engine if it is idle.
    fn enqueue(
        &mut self,
        bitstream: &Bitstream,
        repeating: bool,
        completion: Option<Completion>,
        handle: &Handle<DriverState>,
    ) -> Result<(), QueueError> {
        let (mut queued, offsets) = match self.queue.last() {
            Some(tail) => {
                QueuedBitstream::compile_following(&tail.bitstream, bitstream, repeating)?
            }
            None => (QueuedBitstream::compile(bitstream, repeating)?, Vec::new()),
        };
        queued.commit(&self.mailbox)?;
        if let Some(tail) = self.queue.last() {
            tail.bitstream.transfer(&offsets, &queued);
        }

        let id = self.next_id;
        self.next_id += 1;
        log::debug!(
            "queued bitstream {}: {:.0} µs, repeating: {}",
            id,
            queued.duration(),
            repeating
        );

        let channel = self.peripherals.dma.channel(self.dma_channel);
        if !channel.is_active() {
            let bus_address = queued
                .bus_address()
                .expect("bitstream was committed above");
            log::debug!("engine idle, starting at {:#010x}", bus_address);
            channel.start(bus_address);
        }

        self.queue.push(Entry {
            id,
            bitstream: queued,
            repeating,
            completion,
            phase: Phase::Queued,
        });
        self.watchers.increment();
        handle.post_after(WATCHER_INTERVAL, move |state, handle| {
            watch(state, handle, id)
        });
        Ok(())
    }
}

/// Follows one queued bitstream through its sentinel, retiring predecessors
/// when it starts and delivering its completion when it has played through.
fn watch(state: &mut DriverState, handle: &Handle<DriverState>, id: u64) {
    if !state.running.load(Ordering::SeqCst) {
        state.watchers.decrement();
        return;
    }
    let position = match state.queue.iter().position(|entry| entry.id == id) {
        Some(position) => position,
        None => {
            state.watchers.decrement();
            return;
        }
    };

    match state.queue[position].phase {
        Phase::Queued => {
            if state.queue[position].bitstream.is_transmitting() {
                log::debug!("bitstream {} has started", id);
                state.queue[position].phase = Phase::Transmitting {
                    since: Instant::now(),
                };
                // Everything ahead of it has been handed off and will never
                // run again; dropping the entries releases their memory.
                for removed in state.queue.drain(..position) {
                    log::debug!("retired bitstream {}", removed.id);
                }
            }
        }
        Phase::Transmitting { since } => {
            let duration = Duration::from_secs_f32(state.queue[position].bitstream.duration() * 1e-6);
            if state.queue[position].bitstream.is_repeating() && since.elapsed() >= duration {
                log::debug!("bitstream {} has played through", id);
                let entry = &mut state.queue[position];
                if let Some(completion) = entry.completion.take() {
                    let _ = state.callbacks.send(completion);
                }
                entry.phase = Phase::Repeating;
            }
        }
        Phase::Repeating => {
            let last = position == state.queue.len() - 1;
            let repeating = state.queue[position].repeating;
            if !last || repeating {
                // A successor's watcher retires this entry; nothing left to
                // observe here.
                state.watchers.decrement();
                return;
            }
            // A halting tail parks the engine; retire it once that happens.
            if !state.peripherals.dma.channel(state.dma_channel).is_active() {
                log::debug!("engine halted after bitstream {}", id);
                state.queue.pop();
                state.watchers.decrement();
                return;
            }
        }
    }

    handle.post_after(WATCHER_INTERVAL, move |state, handle| {
        watch(state, handle, id)
    });
}

/// Clears latched hardware error flags and reports anything that points at
/// real trouble. Never escalates: the protocol is self-synchronizing, so a
/// glitched bit costs one packet at worst.
fn watchdog(state: &mut DriverState, handle: &Handle<DriverState>) {
    if !state.running.load(Ordering::SeqCst) {
        return;
    }

    let status = state.peripherals.pwm.status() & pwm::Status::ERRORS;
    // TODO: BUS_ERROR is latched on every pass; work out which part of
    // serializer bring-up trips it.
    let reportable = status & !pwm::Status::BUS_ERROR;
    if !reportable.is_empty() {
        log::warn!("pwm errors observed: {:?}", reportable);
    }
    if !status.is_empty() {
        state.peripherals.pwm.clear_status(status);
    }

    let channel = state.peripherals.dma.channel(state.dma_channel);
    let debug = channel.debug_status() & dma::DebugStatus::ERRORS;
    if !debug.is_empty() {
        log::warn!("dma errors observed: {:?}", debug);
        channel.clear_debug(debug);
    }

    // The engine halting under a repeating tail means transmission died
    // mid-graph; recovery needs a full shutdown and restart.
    let stalled = state
        .queue
        .last()
        .map_or(false, |entry| entry.repeating)
        && !channel.is_active();
    if stalled {
        if !state.stall_logged {
            log::error!("dma engine inactive with bitstreams queued");
            state.stall_logged = true;
        }
    } else {
        state.stall_logged = false;
    }

    handle.post_after(WATCHDOG_INTERVAL, watchdog);
}

/// Generates the DCC signal on the track.
///
/// Bitstreams are transmitted strictly in the order queued. Power-on and
/// power-off bitstreams are inserted around non-repeating traffic so the
/// track is never left carrying half a waveform.
pub struct Driver {
    work: WorkQueue<DriverState>,
    running: Arc<AtomicBool>,
    watchers: Arc<WatcherCount>,
    callbacks: Option<JoinHandle<()>>,
    bit_duration: f32,
    shut_down: bool,
}

impl Driver {
    /// Take ownership of the hardware and prepare it for transmission.
    ///
    /// Configures the pins, the PWM clock and the serializer, and enables
    /// the chosen DMA engine. Nothing reaches the track until a bitstream is
    /// queued.
    pub fn new(peripherals: Peripherals, mailbox: Mailbox, dma_channel: usize) -> Driver {
        let divisor = clock_divisor();
        let bit_duration = actual_bit_duration(divisor);
        log::info!(
            "clock divisor {} gives a bit duration of {:.3} µs",
            divisor,
            bit_duration
        );

        peripherals.gpio.set_low(Pin::RailCom.number());
        peripherals.gpio.set_low(Pin::Debug.number());
        peripherals
            .gpio
            .set_function(Pin::RailCom.number(), gpio::Function::Output);
        peripherals
            .gpio
            .set_function(Pin::Debug.number(), gpio::Function::Output);
        peripherals.gpio.set_function(DCC_PIN, gpio::Function::Alt5);

        peripherals.clock.setup_pwm(divisor);
        peripherals.pwm.setup_serializer(u32::from(WORD_SIZE));
        peripherals.pwm.enable();

        peripherals.dma.enable(dma_channel);
        peripherals.dma.channel(dma_channel).reset();

        let running = Arc::new(AtomicBool::new(true));
        let watchers = Arc::new(WatcherCount::new());
        let (callback_sender, callback_receiver) = channel::<Completion>();
        let callbacks = thread::Builder::new()
            .name("dcc-callbacks".to_string())
            .spawn(move || {
                for completion in callback_receiver {
                    completion();
                }
            })
            .expect("failed to spawn callback thread");

        let state = DriverState {
            peripherals,
            mailbox: Arc::new(mailbox),
            dma_channel,
            bit_duration,
            queue: Vec::new(),
            requires_power_on: true,
            next_id: 0,
            running: running.clone(),
            watchers: watchers.clone(),
            callbacks: callback_sender,
            stall_logged: false,
        };
        let work = WorkQueue::spawn("dcc-driver", state);
        work.handle().post(watchdog);

        Driver {
            work,
            running,
            watchers,
            callbacks: Some(callbacks),
            bit_duration,
            shut_down: false,
        }
    }

    /// The exact bit duration the clock divisor produces, in microseconds.
    /// Bitstreams must be built with this value.
    pub fn bit_duration(&self) -> f32 {
        self.bit_duration
    }

    /// Queue a bitstream for transmission after everything queued so far.
    ///
    /// If the track is unpowered a power-on bitstream is transmitted first.
    /// A repeating bitstream stays on the track until replaced; a
    /// non-repeating one is followed by a power-off bitstream. `completion`
    /// runs on a separate thread once the bitstream has been transmitted in
    /// full at least once.
    pub fn queue(
        &self,
        bitstream: &Bitstream,
        repeating: bool,
        completion: impl FnOnce() + Send + 'static,
    ) -> Result<(), QueueError> {
        assert!((bitstream.bit_duration - self.bit_duration).abs() < 0.001);
        let bitstream = bitstream.clone();
        self.work.call(move |state, handle| {
            if state.requires_power_on {
                let power_on = power_on_bitstream(state.bit_duration);
                state.enqueue(&power_on, false, None, handle)?;
                state.requires_power_on = false;
            }
            state.enqueue(&bitstream, repeating, Some(Box::new(completion)), handle)?;
            if !repeating {
                let power_off = power_off_bitstream(state.bit_duration);
                state.enqueue(&power_off, false, None, handle)?;
                state.requires_power_on = true;
            }
            Ok(())
        })
    }

    /// Power the track off once everything queued has been transmitted.
    ///
    /// `completion` runs when the power-off bitstream has been transmitted,
    /// or immediately if the track is already unpowered.
    pub fn stop(&self, completion: impl FnOnce() + Send + 'static) -> Result<(), QueueError> {
        self.work.call(move |state, handle| {
            if state.requires_power_on {
                let _ = state.callbacks.send(Box::new(completion));
                return Ok(());
            }
            let power_off = power_off_bitstream(state.bit_duration);
            state.enqueue(&power_off, false, Some(Box::new(completion)), handle)?;
            state.requires_power_on = true;
            Ok(())
        })
    }

    /// Stop transmission and return the hardware to a safe state.
    ///
    /// Blocks until every outstanding watcher has drained, then disables the
    /// engine and the serializer, releases all queued bitstreams and parks
    /// the pins.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.running.store(false, Ordering::SeqCst);
        self.watchers.wait_for_drain();

        self.work.call(|state, _| {
            let channel = state.peripherals.dma.channel(state.dma_channel);
            channel.abort();
            channel.reset();
            state.peripherals.dma.disable(state.dma_channel);
            state.peripherals.pwm.disable();
            state.peripherals.clock.stop_pwm();
            state.queue.clear();

            state
                .peripherals
                .gpio
                .set_function(DCC_PIN, gpio::Function::Output);
            state.peripherals.gpio.set_low(DCC_PIN);
            state.peripherals.gpio.set_low(Pin::RailCom.number());
            state.peripherals.gpio.set_low(Pin::Debug.number());
        });
        self.work.shutdown();
        if let Some(callbacks) = self.callbacks.take() {
            let _ = callbacks.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
