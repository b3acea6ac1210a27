//! In-memory pins and delays for driver tests
//!
//! State lives behind `Arc`s so tests keep a handle after the pins move into
//! a channel, and so jobs can run on a second thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorKind, ErrorType, InputPin, OutputPin};

use super::MotorChannel;
use crate::pigment::{PIGMENT_COUNT, Pigment};

/// Coil levels across every channel, checked at each write
#[derive(Debug, Default)]
pub struct Board {
    high: [AtomicU32; PIGMENT_COUNT],
    overlap: AtomicBool,
}

impl Board {
    /// Some coil went high while another channel still had one energized
    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn rise(&self, channel: usize) {
        self.high[channel].fetch_add(1, Ordering::SeqCst);
        let others = (0..PIGMENT_COUNT)
            .filter(|&i| i != channel)
            .any(|i| self.high[i].load(Ordering::SeqCst) > 0);
        if others {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn fall(&self, channel: usize) {
        self.high[channel].fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct PinState {
    high: AtomicBool,
    rising: AtomicU32,
    high_writes: AtomicU32,
    fail_high: AtomicBool,
    board: Option<(Arc<Board>, usize)>,
}

#[derive(Debug, Clone, Default)]
pub struct MockPin(Arc<PinState>);

impl MockPin {
    pub fn on_board(board: &Arc<Board>, channel: usize) -> Self {
        Self(Arc::new(PinState {
            board: Some((Arc::clone(board), channel)),
            ..Default::default()
        }))
    }

    pub fn is_high(&self) -> bool {
        self.0.high.load(Ordering::SeqCst)
    }

    pub fn high_writes(&self) -> u32 {
        self.0.high_writes.load(Ordering::SeqCst)
    }

    pub fn rising_edges(&self) -> u32 {
        self.0.rising.load(Ordering::SeqCst)
    }

    /// Make every `set_high` fail; `set_low` keeps working
    pub fn fail_high_writes(&self, fail: bool) {
        self.0.fail_high.store(fail, Ordering::SeqCst);
    }
}

impl ErrorType for MockPin {
    type Error = ErrorKind;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        if self.0.high.swap(false, Ordering::SeqCst)
            && let Some((board, channel)) = &self.0.board
        {
            board.fall(*channel);
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if self.0.fail_high.load(Ordering::SeqCst) {
            return Err(ErrorKind::Other);
        }
        self.0.high_writes.fetch_add(1, Ordering::SeqCst);
        if !self.0.high.swap(true, Ordering::SeqCst) {
            self.0.rising.fetch_add(1, Ordering::SeqCst);
            if let Some((board, channel)) = &self.0.board {
                board.rise(*channel);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SwitchState {
    reads: AtomicU32,
    /// Reads before the switch reports triggered
    trigger_after: Option<u32>,
    failing: bool,
}

#[derive(Debug, Clone)]
pub struct MockSwitch(Arc<SwitchState>);

impl MockSwitch {
    pub fn never() -> Self {
        Self(Arc::default())
    }

    pub fn after(reads: u32) -> Self {
        Self(Arc::new(SwitchState {
            trigger_after: Some(reads),
            ..Default::default()
        }))
    }

    pub fn failing() -> Self {
        Self(Arc::new(SwitchState {
            failing: true,
            ..Default::default()
        }))
    }

    pub fn reads(&self) -> u32 {
        self.0.reads.load(Ordering::SeqCst)
    }
}

impl ErrorType for MockSwitch {
    type Error = ErrorKind;
}

impl InputPin for MockSwitch {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        if self.0.failing {
            return Err(ErrorKind::Other);
        }
        let n = self.0.reads.fetch_add(1, Ordering::SeqCst);
        let triggered = self.0.trigger_after.is_some_and(|after| n >= after);
        Ok(!triggered)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

/// Records requested time without sleeping
#[derive(Debug, Clone, Default)]
pub struct NoopDelay(Arc<AtomicU64>);

impl NoopDelay {
    pub fn total_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst) / 1000
    }
}

impl DelayNs for NoopDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.fetch_add(ns as u64, Ordering::SeqCst);
    }
}

/// Really sleeps, for tests that race a second thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepDelay;

impl DelayNs for SleepDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
}

pub fn mock_channel(
    pigment: Pigment,
    switch: MockSwitch,
) -> (MotorChannel<MockPin, MockSwitch>, [MockPin; 4]) {
    board_channel(pigment, switch, &Arc::default())
}

/// Channel whose coils report to a shared [`Board`]
pub fn board_channel(
    pigment: Pigment,
    switch: MockSwitch,
    board: &Arc<Board>,
) -> (MotorChannel<MockPin, MockSwitch>, [MockPin; 4]) {
    let coils = [(); 4].map(|_| MockPin::on_board(board, pigment.index()));
    let channel = MotorChannel::new(pigment, coils.clone(), switch).unwrap();
    (channel, coils)
}
