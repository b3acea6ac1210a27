//! Dispense orchestration across the five pigment channels
//!
//! All GPIO lives in one [`HardwareResource`] behind a single mutex. A job
//! holds that lock from its first coil write to its last settle, so at most
//! one motor ever steps at a time and two jobs never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use serde::{Deserialize, Serialize};

use crate::color::LabColor;
use crate::error::{HardwareError, ValidationError};
use crate::pigment::{PIGMENT_COUNT, Pigment};
use crate::solver::{self, MixProportion, MixSolver};
use crate::stepper::{DEFAULT_PHASE_DELAY_US, MotorChannel, StepOutcome, StepReport};

/// Full-scale cycles, about 5 mL
pub const DEFAULT_STEP_BUDGET: u32 = 825;

/// Pause between channels so the lines settle before the next switch read
pub const DEFAULT_SETTLE_MS: u32 = 5000;

/// Cycles of a full extraction
pub const DEFAULT_EXTRACT_REFERENCE: u32 = 4096;

/// Largest |L*|, |a*| or |b*| a dispense target may carry
pub const TARGET_LAB_LIMIT: f64 = 1000.0;

/// Settle delay granularity for abort checks
const SETTLE_SLICE_MS: u32 = 10;

/// Timing and volume settings for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenseSettings {
    pub step_budget: u32,
    pub phase_delay_us: u32,
    pub settle_ms: u32,
    pub extract_reference: u32,
}

impl Default for DispenseSettings {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            phase_delay_us: DEFAULT_PHASE_DELAY_US,
            settle_ms: DEFAULT_SETTLE_MS,
            extract_reference: DEFAULT_EXTRACT_REFERENCE,
        }
    }
}

/// Fraction of the reference extraction length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractPreset {
    Full,
    Half,
    Quarter,
    Eighth,
}

impl ExtractPreset {
    pub fn divisor(self) -> u32 {
        match self {
            ExtractPreset::Full => 1,
            ExtractPreset::Half => 2,
            ExtractPreset::Quarter => 4,
            ExtractPreset::Eighth => 8,
        }
    }

    pub fn steps(self, reference: u32) -> u32 {
        reference / self.divisor()
    }
}

/// Terminal status of one channel within a job
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    Completed,
    SwitchStopped,
    Aborted,
    Failed(HardwareError),
    /// Skipped after an earlier failure or abort
    NotRun,
}

impl From<StepOutcome> for ChannelOutcome {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Completed => ChannelOutcome::Completed,
            StepOutcome::SwitchStopped => ChannelOutcome::SwitchStopped,
            StepOutcome::Aborted => ChannelOutcome::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResult {
    pub pigment: Pigment,
    pub steps_requested: u32,
    pub steps_issued: u32,
    pub phases_issued: u64,
    pub outcome: ChannelOutcome,
}

impl ChannelResult {
    fn not_run(pigment: Pigment, steps_requested: u32) -> Self {
        Self {
            pigment,
            steps_requested,
            steps_issued: 0,
            phases_issued: 0,
            outcome: ChannelOutcome::NotRun,
        }
    }

    fn from_report(pigment: Pigment, report: StepReport) -> Self {
        Self {
            pigment,
            steps_requested: report.steps_requested,
            steps_issued: report.steps_issued(),
            phases_issued: report.phases_issued,
            outcome: report.outcome.into(),
        }
    }

    pub fn stopped_by_switch(&self) -> bool {
        self.outcome == ChannelOutcome::SwitchStopped
    }
}

/// Everything one dispense request produced
#[derive(Debug, Clone, PartialEq)]
pub struct DispenseReport {
    pub target: LabColor,
    pub proportions: MixProportion,
    pub steps: [u32; PIGMENT_COUNT],
    pub channels: [ChannelResult; PIGMENT_COUNT],
}

impl DispenseReport {
    /// True when every channel ran to completion or to its switch
    pub fn is_complete(&self) -> bool {
        self.channels.iter().all(|c| {
            matches!(
                c.outcome,
                ChannelOutcome::Completed | ChannelOutcome::SwitchStopped
            )
        })
    }
}

/// The five motor channels and the delay source they share
pub struct HardwareResource<P: OutputPin, SW: InputPin, D> {
    channels: [MotorChannel<P, SW>; PIGMENT_COUNT],
    delay: D,
}

impl<P, SW, D> HardwareResource<P, SW, D>
where
    P: OutputPin,
    SW: InputPin,
    D: DelayNs,
{
    /// Channels must be given in pigment order
    pub fn new(channels: [MotorChannel<P, SW>; PIGMENT_COUNT], delay: D) -> Self {
        Self { channels, delay }
    }

    pub fn channel(&self, pigment: Pigment) -> &MotorChannel<P, SW> {
        &self.channels[pigment.index()]
    }

    fn dispense(
        &mut self,
        pigment: Pigment,
        steps: u32,
        phase_delay_us: u32,
        abort: &AtomicBool,
    ) -> Result<StepReport, HardwareError> {
        let Self { channels, delay } = self;
        channels[pigment.index()].dispense(steps, phase_delay_us, delay, abort)
    }

    fn extract(
        &mut self,
        pigment: Pigment,
        steps: u32,
        phase_delay_us: u32,
        abort: &AtomicBool,
    ) -> Result<StepReport, HardwareError> {
        let Self { channels, delay } = self;
        channels[pigment.index()].extract(steps, phase_delay_us, delay, abort)
    }

    /// Sleep in slices; false if the abort flag came up meanwhile
    fn settle(&mut self, ms: u32, abort: &AtomicBool) -> bool {
        let mut remaining = ms;
        while remaining > 0 {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            let slice = remaining.min(SETTLE_SLICE_MS);
            self.delay.delay_ms(slice);
            remaining -= slice;
        }
        !abort.load(Ordering::Acquire)
    }

    /// Tries every channel; reports the first failure
    fn disable_all(&mut self) -> Result<(), HardwareError> {
        let mut first_error = None;
        for channel in self.channels.iter_mut() {
            if let Err(e) = channel.disable() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Turns target colors into pigment volumes on the hardware
pub struct DispenserController<P: OutputPin, SW: InputPin, D> {
    hardware: Mutex<HardwareResource<P, SW, D>>,
    abort: AtomicBool,
    solver: MixSolver,
    settings: DispenseSettings,
}

impl<P, SW, D> DispenserController<P, SW, D>
where
    P: OutputPin,
    SW: InputPin,
    D: DelayNs,
{
    pub fn new(
        hardware: HardwareResource<P, SW, D>,
        solver: MixSolver,
        settings: DispenseSettings,
    ) -> Self {
        Self {
            hardware: Mutex::new(hardware),
            abort: AtomicBool::new(false),
            solver,
            settings,
        }
    }

    pub fn settings(&self) -> &DispenseSettings {
        &self.settings
    }

    pub fn solver(&self) -> &MixSolver {
        &self.solver
    }

    /// A panic mid-job poisons the lock; the pins themselves stay usable and
    /// the next holder starts every run by claiming the channel afresh.
    fn lock(&self) -> MutexGuard<'_, HardwareResource<P, SW, D>> {
        self.hardware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Solve the mix for `target` and dispense it channel by channel
    ///
    /// Hardware failures do not fail the job: they land in the per-channel
    /// results, and every channel after a failure or abort is `NotRun`.
    pub fn dispense_job(
        &self,
        target: LabColor,
        budget: u32,
    ) -> Result<DispenseReport, ValidationError> {
        if budget == 0 {
            return Err(ValidationError::ZeroBudget);
        }
        if !target.is_finite() {
            return Err(ValidationError::NonFinite("target color"));
        }
        if let Some(&value) = target
            .to_array()
            .iter()
            .find(|v| v.abs() > TARGET_LAB_LIMIT)
        {
            return Err(ValidationError::TargetOutOfRange {
                value,
                limit: TARGET_LAB_LIMIT,
            });
        }

        let proportions = self.solver.solve(target);
        let steps = solver::steps_from_proportions(&proportions, budget);
        tracing::info!("Dispensing {:?} steps for budget {}", steps, budget);

        let mut channels = Pigment::ALL.map(|p| ChannelResult::not_run(p, steps[p.index()]));
        let mut hardware = self.lock();
        let mut stepped = false;

        for pigment in Pigment::ALL {
            let i = pigment.index();
            if steps[i] == 0 {
                channels[i].outcome = ChannelOutcome::Completed;
                continue;
            }
            if stepped && !hardware.settle(self.settings.settle_ms, &self.abort) {
                tracing::warn!("Emergency stop during settle, skipping remaining channels");
                break;
            }
            stepped = true;

            match hardware.dispense(pigment, steps[i], self.settings.phase_delay_us, &self.abort) {
                Ok(report) => {
                    channels[i] = ChannelResult::from_report(pigment, report);
                    if report.outcome == StepOutcome::Aborted {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Dispense failed: {}", e);
                    let phases = hardware.channel(pigment).phases_issued();
                    channels[i] = ChannelResult {
                        pigment,
                        steps_requested: steps[i],
                        steps_issued: (phases / crate::stepper::PHASES_PER_STEP as u64) as u32,
                        phases_issued: phases,
                        outcome: ChannelOutcome::Failed(e),
                    };
                    break;
                }
            }
        }
        drop(hardware);

        Ok(DispenseReport {
            target,
            proportions,
            steps,
            channels,
        })
    }

    /// Run one channel backwards by a preset fraction of the reference length
    pub fn extract(
        &self,
        pigment: Pigment,
        preset: ExtractPreset,
    ) -> Result<ChannelResult, HardwareError> {
        let steps = preset.steps(self.settings.extract_reference);
        tracing::info!("Extracting {} steps of {}", steps, pigment);

        let report = self.lock().extract(
            pigment,
            steps,
            self.settings.phase_delay_us,
            &self.abort,
        )?;
        Ok(ChannelResult::from_report(pigment, report))
    }

    /// Emergency stop: halt any running job and drop every coil low
    ///
    /// Raises the abort flag first so an in-flight job gives up the lock
    /// after its current phase, then releases all channels and clears it.
    pub fn disable_all(&self) -> Result<(), HardwareError> {
        tracing::warn!("Emergency stop requested");
        self.abort.store(true, Ordering::Release);

        let mut hardware = self.lock();
        let result = hardware.disable_all();
        self.abort.store(false, Ordering::Release);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pigment::BASE_LABS;
    use crate::stepper::mock::{Board, MockPin, MockSwitch, NoopDelay, SleepDelay, board_channel};
    use std::sync::Arc;
    use std::time::Duration;

    struct Rig<D> {
        controller: DispenserController<MockPin, MockSwitch, D>,
        coils: Vec<[MockPin; 4]>,
        board: Arc<Board>,
    }

    fn rig<D: DelayNs>(
        switches: [MockSwitch; PIGMENT_COUNT],
        delay: D,
        settle_ms: u32,
        phase_delay_us: u32,
    ) -> Rig<D> {
        let board = Arc::new(Board::default());
        let mut coils = Vec::new();
        let channels = Pigment::ALL.map(|p| {
            let (channel, pins) = board_channel(p, switches[p.index()].clone(), &board);
            coils.push(pins);
            channel
        });
        let settings = DispenseSettings {
            phase_delay_us,
            settle_ms,
            ..Default::default()
        };
        Rig {
            controller: DispenserController::new(
                HardwareResource::new(channels, delay),
                MixSolver::default(),
                settings,
            ),
            coils,
            board,
        }
    }

    fn never() -> [MockSwitch; PIGMENT_COUNT] {
        [(); PIGMENT_COUNT].map(|_| MockSwitch::never())
    }

    fn all_low(rig: &Rig<impl DelayNs>) -> bool {
        rig.coils.iter().flatten().all(|c| !c.is_high())
    }

    #[test]
    fn test_white_job_runs_one_channel() {
        let rig = rig(never(), NoopDelay::default(), 0, 0);
        let report = rig.controller.dispense_job(BASE_LABS[0], 825).unwrap();

        assert_eq!(report.steps, [825, 0, 0, 0, 0]);
        assert!(report.is_complete());
        assert_eq!(report.channels[0].steps_issued, 825);
        assert_eq!(report.channels[0].phases_issued, 825 * 8);
        assert!(report.channels.iter().all(|c| !c.stopped_by_switch()));
        assert!(all_low(&rig));
    }

    #[test]
    fn test_mixed_job_settles_between_channels() {
        let delay = NoopDelay::default();
        let rig = rig(never(), delay.clone(), 5000, 0);
        let report = rig
            .controller
            .dispense_job(LabColor::new(62.0, 12.0, 22.0), 825)
            .unwrap();

        assert_eq!(report.steps.iter().sum::<u32>(), 825);
        let active = report.steps.iter().filter(|&&s| s > 0).count() as u64;
        assert!(active > 1);
        assert_eq!(delay.total_us(), (active - 1) * 5_000_000);
        for (channel, &steps) in report.channels.iter().zip(&report.steps) {
            assert_eq!(channel.outcome, ChannelOutcome::Completed);
            assert_eq!(channel.steps_issued, steps);
        }
    }

    #[test]
    fn test_switch_stop_is_not_an_error() {
        let mut switches = never();
        switches[0] = MockSwitch::after(0);
        let rig = rig(switches, NoopDelay::default(), 0, 0);

        let report = rig.controller.dispense_job(BASE_LABS[0], 825).unwrap();
        let white = &report.channels[0];
        assert!(white.stopped_by_switch());
        assert_eq!(white.steps_issued, 0);
        assert!(report.is_complete());
        assert!(all_low(&rig));
    }

    #[test]
    fn test_failure_skips_later_channels() {
        let rig = rig(never(), NoopDelay::default(), 0, 0);
        let target = LabColor::new(62.0, 12.0, 22.0);
        let steps = solver::steps_from_proportions(&rig.controller.solver().solve(target), 825);
        let first = steps.iter().position(|&s| s > 0).unwrap();
        rig.coils[first][0].fail_high_writes(true);

        let report = rig.controller.dispense_job(target, 825).unwrap();
        assert!(!report.is_complete());
        assert!(matches!(
            report.channels[first].outcome,
            ChannelOutcome::Failed(HardwareError::Write { .. })
        ));
        for channel in &report.channels[first + 1..] {
            assert_eq!(channel.outcome, ChannelOutcome::NotRun);
            assert_eq!(channel.steps_issued, 0);
        }
        assert!(all_low(&rig));
    }

    #[test]
    fn test_invalid_requests() {
        let rig = rig(never(), NoopDelay::default(), 0, 0);
        assert_eq!(
            rig.controller.dispense_job(BASE_LABS[0], 0),
            Err(ValidationError::ZeroBudget)
        );
        assert!(matches!(
            rig.controller
                .dispense_job(LabColor::new(f64::NAN, 0.0, 0.0), 825),
            Err(ValidationError::NonFinite(_))
        ));
        assert_eq!(
            rig.controller
                .dispense_job(LabColor::new(1e20, 0.0, 0.0), 825),
            Err(ValidationError::TargetOutOfRange {
                value: 1e20,
                limit: TARGET_LAB_LIMIT
            })
        );
        assert!(rig.coils.iter().flatten().all(|c| c.high_writes() == 0));
    }

    #[test]
    fn test_extract_presets() {
        assert_eq!(ExtractPreset::Full.steps(4096), 4096);
        assert_eq!(ExtractPreset::Half.steps(4096), 2048);
        assert_eq!(ExtractPreset::Quarter.steps(4096), 1024);
        assert_eq!(ExtractPreset::Eighth.steps(4096), 512);

        let mut switches = never();
        switches[3] = MockSwitch::after(0);
        let rig = rig(switches, NoopDelay::default(), 0, 0);
        let result = rig
            .controller
            .extract(Pigment::Blue, ExtractPreset::Eighth)
            .unwrap();
        assert_eq!(result.outcome, ChannelOutcome::Completed);
        assert_eq!(result.steps_issued, 512);
        assert!(all_low(&rig));
    }

    #[test]
    fn test_disable_all_idle() {
        let rig = rig(never(), NoopDelay::default(), 0, 0);
        rig.controller.disable_all().unwrap();
        assert!(all_low(&rig));

        // Flag is cleared, so the next job runs normally
        let report = rig.controller.dispense_job(BASE_LABS[0], 10).unwrap();
        assert!(report.is_complete());
    }

    #[test]
    fn test_emergency_stop_interrupts_job() {
        let rig = Arc::new(rig(never(), SleepDelay, 0, 100));

        let worker = {
            let rig = Arc::clone(&rig);
            std::thread::spawn(move || rig.controller.dispense_job(BASE_LABS[0], 825))
        };

        // Wait for the white motor to start moving
        let started = std::time::Instant::now();
        while rig.coils[0].iter().all(|c| c.high_writes() == 0) {
            assert!(started.elapsed() < Duration::from_secs(5), "job never started");
            std::thread::sleep(Duration::from_millis(1));
        }
        rig.controller.disable_all().unwrap();

        let report = worker.join().unwrap().unwrap();
        let white = &report.channels[0];
        assert_eq!(white.outcome, ChannelOutcome::Aborted);
        assert!(white.phases_issued > 0);
        assert!(white.steps_issued < 825);
        for channel in &report.channels[1..] {
            assert_eq!(channel.outcome, ChannelOutcome::NotRun);
        }
        assert!(all_low(&rig));
    }

    #[test]
    fn test_concurrent_jobs_never_overlap() {
        let rig = Arc::new(rig(never(), SleepDelay, 1, 20));

        let workers: Vec<_> = (0..3)
            .map(|n| {
                let rig = Arc::clone(&rig);
                std::thread::spawn(move || {
                    if n == 1 {
                        let result = rig.controller.extract(Pigment::Red, ExtractPreset::Eighth);
                        assert_eq!(result.unwrap().outcome, ChannelOutcome::Completed);
                    } else {
                        let report = rig
                            .controller
                            .dispense_job(LabColor::new(62.0, 12.0, 22.0), 60)
                            .unwrap();
                        assert!(report.is_complete());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(rig.coils.iter().filter(|c| c[0].high_writes() > 0).count() > 1);
        assert!(!rig.board.overlapped());
        assert!(all_low(&rig));
    }

    #[test]
    fn test_emergency_stop_during_settle() {
        let rig = Arc::new(rig(never(), SleepDelay, 2000, 0));
        let target = LabColor::new(62.0, 12.0, 22.0);
        let steps = solver::steps_from_proportions(&rig.controller.solver().solve(target), 825);
        let first = steps.iter().position(|&s| s > 0).unwrap();

        let worker = {
            let rig = Arc::clone(&rig);
            std::thread::spawn(move || rig.controller.dispense_job(target, 825))
        };

        // Adjacent phases share a coil, so all four low after any high
        // write means the first channel has finished and the job settles
        let coils = &rig.coils[first];
        let started = std::time::Instant::now();
        while coils.iter().all(|c| c.high_writes() == 0) || coils.iter().any(|c| c.is_high()) {
            assert!(started.elapsed() < Duration::from_secs(5), "first channel never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        rig.controller.disable_all().unwrap();

        let report = worker.join().unwrap().unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.channels[first].outcome, ChannelOutcome::Completed);
        assert_eq!(report.channels[first].steps_issued, steps[first]);

        let skipped: Vec<_> = report.channels[first + 1..]
            .iter()
            .filter(|c| c.steps_requested > 0)
            .collect();
        assert!(!skipped.is_empty());
        for channel in skipped {
            assert_eq!(channel.outcome, ChannelOutcome::NotRun);
            assert_eq!(channel.phases_issued, 0);
        }
        assert!(all_low(&rig));
    }
}
