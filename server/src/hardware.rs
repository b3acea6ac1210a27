//! GPIO backends and the bridge from async handlers to the blocking
//! dispenser
//!
//! Pins are claimed once at startup. With the `rpi` feature they are real
//! BCM lines through rppal; otherwise they are simulated and only logged.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin, StatefulOutputPin};
use shade_mixer::{
    ChannelResult, DispenseReport, DispenserController, ExtractPreset, HardwareError,
    HardwareResource, LabColor, MixSolver, MotorChannel, Pigment,
};

use crate::config::{ChannelPins, MixerConfig};
use crate::error::AppError;

/// Dispenser operations as seen by the request handlers
///
/// Every call runs on the blocking pool; the controller's own lock keeps
/// jobs from interleaving.
#[async_trait]
pub trait Dispenser: Send + Sync {
    async fn dispense(&self, target: LabColor, budget: u32) -> Result<DispenseReport, AppError>;

    async fn extract(
        &self,
        pigment: Pigment,
        preset: ExtractPreset,
    ) -> Result<ChannelResult, AppError>;

    /// Emergency stop across all channels
    async fn disable_all(&self) -> Result<(), AppError>;
}

/// Runs a [`DispenserController`] off the async runtime
pub struct BlockingDispenser<P: OutputPin, SW: InputPin, D> {
    controller: Arc<DispenserController<P, SW, D>>,
}

impl<P, SW, D> BlockingDispenser<P, SW, D>
where
    P: OutputPin,
    SW: InputPin,
    D: DelayNs,
{
    pub fn new(controller: DispenserController<P, SW, D>) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }
}

#[async_trait]
impl<P, SW, D> Dispenser for BlockingDispenser<P, SW, D>
where
    P: OutputPin + Send + 'static,
    SW: InputPin + Send + 'static,
    D: DelayNs + Send + 'static,
{
    async fn dispense(&self, target: LabColor, budget: u32) -> Result<DispenseReport, AppError> {
        let controller = Arc::clone(&self.controller);
        let report =
            tokio::task::spawn_blocking(move || controller.dispense_job(target, budget)).await??;
        Ok(report)
    }

    async fn extract(
        &self,
        pigment: Pigment,
        preset: ExtractPreset,
    ) -> Result<ChannelResult, AppError> {
        let controller = Arc::clone(&self.controller);
        let result =
            tokio::task::spawn_blocking(move || controller.extract(pigment, preset)).await??;
        Ok(result)
    }

    async fn disable_all(&self) -> Result<(), AppError> {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.disable_all()).await??;
        Ok(())
    }
}

/// Blocking delay on the current thread
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
}

/// Coil output that only records its level
#[derive(Debug)]
pub struct SimPin {
    pin: u8,
    high: bool,
}

impl SimPin {
    pub fn new(pin: u8) -> Self {
        Self { pin, high: false }
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        if self.high {
            tracing::trace!("GPIO {} low", self.pin);
        }
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if !self.high {
            tracing::trace!("GPIO {} high", self.pin);
        }
        self.high = true;
        Ok(())
    }
}

impl StatefulOutputPin for SimPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.high)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.high)
    }
}

/// Limit switch that is never pressed (pulled up)
#[derive(Debug)]
pub struct SimSwitch;

impl ErrorType for SimSwitch {
    type Error = Infallible;
}

impl InputPin for SimSwitch {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

/// Claim all five channels, stopping at the first failure
fn claim_channels<P, SW>(
    pins: &[ChannelPins; shade_mixer::PIGMENT_COUNT],
    mut output: impl FnMut(Pigment, u8) -> Result<P, HardwareError>,
    mut input: impl FnMut(Pigment, u8) -> Result<SW, HardwareError>,
) -> Result<[MotorChannel<P, SW>; shade_mixer::PIGMENT_COUNT], HardwareError>
where
    P: OutputPin,
    SW: InputPin,
{
    let mut claim = |pigment: Pigment| -> Result<MotorChannel<P, SW>, HardwareError> {
        let lines = pins[pigment.index()];
        let [c1, c2, c3, c4] = lines.coils;
        let coils = [
            output(pigment, c1)?,
            output(pigment, c2)?,
            output(pigment, c3)?,
            output(pigment, c4)?,
        ];
        let switch = input(pigment, lines.switch)?;
        tracing::debug!(
            "Claimed {} coils {:?} switch {}",
            pigment,
            lines.coils,
            lines.switch
        );
        MotorChannel::new(pigment, coils, switch)
    };

    Ok([
        claim(Pigment::White)?,
        claim(Pigment::Black)?,
        claim(Pigment::Red)?,
        claim(Pigment::Blue)?,
        claim(Pigment::Yellow)?,
    ])
}

/// Controller over simulated pins
pub fn simulated(
    config: &MixerConfig,
    solver: MixSolver,
) -> Result<DispenserController<SimPin, SimSwitch, StdDelay>, HardwareError> {
    let channels = claim_channels(
        &config.channels,
        |_, pin| Ok(SimPin::new(pin)),
        |_, _| Ok(SimSwitch),
    )?;
    Ok(DispenserController::new(
        HardwareResource::new(channels, StdDelay),
        solver,
        config.dispense,
    ))
}

#[cfg(feature = "rpi")]
mod rpi {
    use rppal::gpio::Gpio;

    use super::*;

    fn claim_error(pigment: Pigment, pin: u8, e: rppal::gpio::Error) -> HardwareError {
        HardwareError::Claim {
            pigment,
            pin,
            reason: e.to_string(),
        }
    }

    type RpiController = DispenserController<rppal::gpio::OutputPin, rppal::gpio::InputPin, StdDelay>;

    /// Controller over real GPIO lines
    pub fn open(config: &MixerConfig, solver: MixSolver) -> Result<RpiController, HardwareError> {
        let first = config.channels[0].coils[0];
        let gpio = Gpio::new().map_err(|e| claim_error(Pigment::White, first, e))?;

        let channels = claim_channels(
            &config.channels,
            |pigment, pin| {
                gpio.get(pin)
                    .map(|p| p.into_output_low())
                    .map_err(|e| claim_error(pigment, pin, e))
            },
            |pigment, pin| {
                gpio.get(pin)
                    .map(|p| p.into_input_pullup())
                    .map_err(|e| claim_error(pigment, pin, e))
            },
        )?;

        Ok(DispenserController::new(
            HardwareResource::new(channels, StdDelay),
            solver,
            config.dispense,
        ))
    }
}

/// Acquire the configured backend once for the life of the process
pub fn open(config: &MixerConfig, solver: MixSolver) -> Result<Arc<dyn Dispenser>, HardwareError> {
    #[cfg(feature = "rpi")]
    {
        tracing::info!("Claiming GPIO lines");
        let controller = rpi::open(config, solver)?;
        Ok(Arc::new(BlockingDispenser::new(controller)))
    }

    #[cfg(not(feature = "rpi"))]
    {
        tracing::warn!("Built without the rpi feature, using simulated pins");
        let controller = simulated(config, solver)?;
        Ok(Arc::new(BlockingDispenser::new(controller)))
    }
}
