//! Driver for one pigment dispenser: a 4-coil unipolar stepper behind a
//! ULN2003-style driver plus an active-low home/limit switch.
//!
//! The driver owns its pins for the life of the process. Every run ends with
//! all four coils low, whatever made it stop.

#[cfg(test)]
pub(crate) mod mock;
mod sequence;

pub use sequence::{DISPENSE_SEQUENCE, Direction, EXTRACT_SEQUENCE, PHASES_PER_STEP, Phase};

use std::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use serde::Serialize;

use crate::error::HardwareError;
use crate::pigment::Pigment;

/// Hold time per phase
pub const DEFAULT_PHASE_DELAY_US: u32 = 1000;

/// Runtime state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Idle,
    /// Taken by an operation, not yet stepping
    Claimed,
    Stepping,
    SwitchStopped,
    Completed,
    /// Coils released after a run
    Deenergized,
}

/// Why a run ended without a hardware error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// Plunger reached its limit before the requested travel
    SwitchStopped,
    /// Emergency stop was raised mid-run
    Aborted,
}

/// Result of one dispense or extract run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub steps_requested: u32,
    /// Micro-steps actually written
    pub phases_issued: u64,
    pub outcome: StepOutcome,
}

impl StepReport {
    /// Completed full 8-phase cycles
    pub fn steps_issued(&self) -> u32 {
        (self.phases_issued / PHASES_PER_STEP as u64) as u32
    }

    pub fn stopped_by_switch(&self) -> bool {
        self.outcome == StepOutcome::SwitchStopped
    }
}

/// One stepper motor channel
pub struct MotorChannel<P: OutputPin, SW: InputPin> {
    pigment: Pigment,
    coils: [P; 4],
    switch: SW,
    state: ChannelState,
    /// Index into the active sequence table
    phase: usize,
    phases_issued: u64,
    energized: bool,
}

impl<P, SW> MotorChannel<P, SW>
where
    P: OutputPin,
    SW: InputPin,
{
    /// Wrap already-claimed pins. Coils are driven low immediately.
    pub fn new(pigment: Pigment, coils: [P; 4], switch: SW) -> Result<Self, HardwareError> {
        let mut channel = Self {
            pigment,
            coils,
            switch,
            state: ChannelState::Idle,
            phase: 0,
            phases_issued: 0,
            energized: true,
        };
        channel.deenergize()?;
        channel.state = ChannelState::Idle;
        Ok(channel)
    }

    pub fn pigment(&self) -> Pigment {
        self.pigment
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_energized(&self) -> bool {
        self.energized
    }

    /// Micro-steps written by the current or last run
    pub fn phases_issued(&self) -> u64 {
        self.phases_issued
    }

    /// Run `steps` full cycles towards the limit switch
    ///
    /// The switch and the abort flag are polled before every phase write.
    pub fn dispense<D: DelayNs>(
        &mut self,
        steps: u32,
        phase_delay_us: u32,
        delay: &mut D,
        abort: &AtomicBool,
    ) -> Result<StepReport, HardwareError> {
        self.run(Direction::Dispense, steps, phase_delay_us, delay, abort)
    }

    /// Run `steps` full cycles away from the limit switch, switch ignored
    pub fn extract<D: DelayNs>(
        &mut self,
        steps: u32,
        phase_delay_us: u32,
        delay: &mut D,
        abort: &AtomicBool,
    ) -> Result<StepReport, HardwareError> {
        self.run(Direction::Extract, steps, phase_delay_us, delay, abort)
    }

    /// Drive all coils low right away
    pub fn disable(&mut self) -> Result<(), HardwareError> {
        let result = self.deenergize();
        self.transition(ChannelState::Idle);
        result
    }

    fn run<D: DelayNs>(
        &mut self,
        direction: Direction,
        steps: u32,
        phase_delay_us: u32,
        delay: &mut D,
        abort: &AtomicBool,
    ) -> Result<StepReport, HardwareError> {
        self.transition(ChannelState::Claimed);
        self.phase = 0;
        self.phases_issued = 0;

        self.transition(ChannelState::Stepping);
        let result = self.step_loop(direction, steps, phase_delay_us, delay, abort);

        match result {
            Ok(StepOutcome::Completed) => self.transition(ChannelState::Completed),
            Ok(StepOutcome::SwitchStopped) => self.transition(ChannelState::SwitchStopped),
            _ => {}
        }

        // Release even after a failed write; the loop error wins if both fail
        let released = self.deenergize();
        self.transition(ChannelState::Idle);
        let outcome = result?;
        released?;

        let report = StepReport {
            steps_requested: steps,
            phases_issued: self.phases_issued,
            outcome,
        };

        match outcome {
            StepOutcome::Completed => tracing::info!(
                "{}: {:?} complete, {} steps",
                self.pigment,
                direction,
                report.steps_issued()
            ),
            StepOutcome::SwitchStopped => tracing::warn!(
                "{}: limit switch hit after {} of {} steps",
                self.pigment,
                report.steps_issued(),
                steps
            ),
            StepOutcome::Aborted => tracing::warn!(
                "{}: aborted after {} phases",
                self.pigment,
                self.phases_issued
            ),
        }

        Ok(report)
    }

    fn step_loop<D: DelayNs>(
        &mut self,
        direction: Direction,
        steps: u32,
        phase_delay_us: u32,
        delay: &mut D,
        abort: &AtomicBool,
    ) -> Result<StepOutcome, HardwareError> {
        let table = direction.sequence();
        let total = steps as u64 * PHASES_PER_STEP as u64;

        for _ in 0..total {
            if abort.load(Ordering::Acquire) {
                return Ok(StepOutcome::Aborted);
            }
            if direction.checks_switch() && self.switch_triggered()? {
                return Ok(StepOutcome::SwitchStopped);
            }

            self.write_phase(&table[self.phase])?;
            self.phases_issued += 1;
            self.phase = (self.phase + 1) % PHASES_PER_STEP;
            delay.delay_us(phase_delay_us);
        }

        Ok(StepOutcome::Completed)
    }

    /// Switch pulls the line low when the plunger is home
    fn switch_triggered(&mut self) -> Result<bool, HardwareError> {
        self.switch.is_low().map_err(|e| HardwareError::Read {
            pigment: self.pigment,
            reason: format!("{:?}", e),
        })
    }

    fn write_phase(&mut self, phase: &Phase) -> Result<(), HardwareError> {
        self.energized = true;
        for (pin, &level) in self.coils.iter_mut().zip(phase) {
            let written = if level == 0 {
                pin.set_low()
            } else {
                pin.set_high()
            };
            written.map_err(|e| HardwareError::Write {
                pigment: self.pigment,
                reason: format!("{:?}", e),
            })?;
        }
        Ok(())
    }

    /// Every coil gets a low write even if an earlier one fails
    fn deenergize(&mut self) -> Result<(), HardwareError> {
        let mut first_error = None;
        for pin in self.coils.iter_mut() {
            if let Err(e) = pin.set_low() {
                first_error.get_or_insert(HardwareError::Write {
                    pigment: self.pigment,
                    reason: format!("{:?}", e),
                });
            }
        }

        match first_error {
            None => {
                self.energized = false;
                self.transition(ChannelState::Deenergized);
                Ok(())
            }
            Some(e) => {
                tracing::error!("{}: failed to release coils: {}", self.pigment, e);
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: ChannelState) {
        tracing::debug!("{}: {:?} -> {:?}", self.pigment, self.state, next);
        self.state = next;
    }
}

impl<P: OutputPin, SW: InputPin> Drop for MotorChannel<P, SW> {
    fn drop(&mut self) {
        if self.energized {
            let _ = self.deenergize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockPin, MockSwitch, NoopDelay, mock_channel};
    use super::*;

    fn no_abort() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_dispense_completes() {
        let (mut channel, coils) = mock_channel(Pigment::Red, MockSwitch::never());
        let mut delay = NoopDelay::default();

        let report = channel.dispense(3, 1000, &mut delay, &no_abort()).unwrap();
        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.steps_issued(), 3);
        assert_eq!(report.phases_issued, 24);
        assert!(!report.stopped_by_switch());
        assert_eq!(delay.total_us(), 24_000);

        assert!(coils.iter().all(|c| !c.is_high()));
        assert!(!channel.is_energized());
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn test_switch_triggered_before_first_phase() {
        let (mut channel, coils) = mock_channel(Pigment::White, MockSwitch::after(0));
        let mut delay = NoopDelay::default();

        let report = channel.dispense(825, 1000, &mut delay, &no_abort()).unwrap();
        assert!(report.stopped_by_switch());
        assert_eq!(report.steps_issued(), 0);
        assert_eq!(report.phases_issued, 0);
        assert_eq!(delay.total_us(), 0);

        // Only the de-energize writes reached the coils
        assert!(coils.iter().all(|c| !c.is_high() && c.high_writes() == 0));
    }

    #[test]
    fn test_switch_mid_run() {
        let (mut channel, coils) = mock_channel(Pigment::Blue, MockSwitch::after(20));
        let report = channel
            .dispense(10, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap();

        assert!(report.stopped_by_switch());
        assert_eq!(report.phases_issued, 20);
        assert_eq!(report.steps_issued(), 2);
        assert!(coils.iter().all(|c| !c.is_high()));
    }

    #[test]
    fn test_extract_ignores_switch() {
        let switch = MockSwitch::after(0);
        let (mut channel, _coils) = mock_channel(Pigment::Yellow, switch.clone());
        let report = channel
            .extract(4, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap();

        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.steps_issued(), 4);
        assert_eq!(switch.reads(), 0);
    }

    #[test]
    fn test_first_phase_matches_table() {
        let (mut channel, coils) = mock_channel(Pigment::Black, MockSwitch::never());
        channel
            .extract(1, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap();

        // Each coil goes high once per cycle it is energized in
        let expected: Vec<u32> = (0..4)
            .map(|coil| {
                let mut rises = 0;
                let mut prev = 0;
                for phase in EXTRACT_SEQUENCE {
                    if phase[coil] == 1 && prev == 0 {
                        rises += 1;
                    }
                    prev = phase[coil];
                }
                rises
            })
            .collect();
        let counted: Vec<u32> = coils.iter().map(MockPin::rising_edges).collect();
        assert_eq!(counted, expected);
    }

    #[test]
    fn test_abort_flag_stops_run() {
        let (mut channel, coils) = mock_channel(Pigment::Red, MockSwitch::never());
        let abort = AtomicBool::new(true);

        let report = channel
            .dispense(100, 0, &mut NoopDelay::default(), &abort)
            .unwrap();
        assert_eq!(report.outcome, StepOutcome::Aborted);
        assert_eq!(report.phases_issued, 0);
        assert!(coils.iter().all(|c| !c.is_high()));
    }

    #[test]
    fn test_write_failure_still_releases() {
        let (mut channel, coils) = mock_channel(Pigment::Blue, MockSwitch::never());
        coils[2].fail_high_writes(true);

        let err = channel
            .dispense(5, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap_err();
        assert!(matches!(err, HardwareError::Write { pigment: Pigment::Blue, .. }));
        assert!(coils.iter().all(|c| !c.is_high()));
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn test_read_failure() {
        let (mut channel, _coils) = mock_channel(Pigment::White, MockSwitch::failing());
        let err = channel
            .dispense(1, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap_err();
        assert_eq!(err.pigment(), Pigment::White);
        assert!(matches!(err, HardwareError::Read { .. }));
    }

    #[test]
    fn test_zero_steps() {
        let (mut channel, _coils) = mock_channel(Pigment::Black, MockSwitch::after(0));
        let report = channel
            .dispense(0, 0, &mut NoopDelay::default(), &no_abort())
            .unwrap();
        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.phases_issued, 0);
    }

    #[test]
    fn test_drop_releases_coils() {
        let coils = [(); 4].map(|_| MockPin::default());
        {
            let mut channel =
                MotorChannel::new(Pigment::Red, coils.clone(), MockSwitch::never()).unwrap();
            channel.write_phase(&[1, 1, 0, 0]).unwrap();
            assert!(coils[0].is_high());
        }
        assert!(coils.iter().all(|c| !c.is_high()));
    }
}
