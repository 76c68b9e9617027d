//! Actuator control laws and the workers that apply them.
//!
//! Each worker owns its output exclusively except the LED line, which the
//! motion worker shares with remote command dispatch. Motion always wins
//! within its own period: whatever dispatch wrote is overwritten on the next
//! motion tick.

use std::sync::Arc;

use log::{debug, warn};

use crate::{
    config::{ControlConfig, FanStep},
    hal::{LedPin, MotionSensor, PixelStrip, PwmOutput, Rgb},
    state::SharedState,
};

/// Writes the LED line and records the level in shared state.
pub fn drive_led(state: &SharedState, led: &dyn LedPin, on: bool) {
    if let Err(err) = led.set_level(on) {
        warn!("{err}");
    }
    state.set_led_output(on);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripCommand {
    Light,
    Dark,
    Hold,
}

/// Hysteresis between the two thresholds; both comparisons are strict.
pub fn strip_command(light: f32, on_below: f32, off_above: f32) -> StripCommand {
    if light < on_below {
        StripCommand::Light
    } else if light > off_above {
        StripCommand::Dark
    } else {
        StripCommand::Hold
    }
}

pub struct LightStripWorker<P> {
    state: Arc<SharedState>,
    strip: P,
    on_below: f32,
    off_above: f32,
}

impl<P: PixelStrip> LightStripWorker<P> {
    pub fn new(state: Arc<SharedState>, strip: P, config: &ControlConfig) -> Self {
        Self {
            state,
            strip,
            on_below: config.light_on_below,
            off_above: config.light_off_above,
        }
    }

    pub fn strip(&self) -> &P {
        &self.strip
    }

    pub fn tick(&mut self) -> StripCommand {
        let command = strip_command(self.state.light_level(), self.on_below, self.off_above);
        match command {
            StripCommand::Light => self.strip.fill(Rgb::WHITE),
            StripCommand::Dark => self.strip.fill(Rgb::OFF),
            StripCommand::Hold => {}
        }
        if let Err(err) = self.strip.show() {
            warn!("{err}");
        }
        command
    }
}

/// Step table from temperature to fan power. Readings at or above the last
/// threshold, and NaN, map to full power.
#[derive(Debug, Clone, PartialEq)]
pub struct FanCurve {
    steps: Vec<FanStep>,
    max_power: u8,
}

impl FanCurve {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            steps: config.fan_steps.clone(),
            max_power: config.fan_max_power,
        }
    }

    pub fn power_for(&self, temperature: f32) -> u8 {
        self.steps
            .iter()
            .find(|step| temperature < step.below_c)
            .map_or(self.max_power, |step| step.power)
    }
}

pub struct FanWorker<P> {
    state: Arc<SharedState>,
    fan: P,
    curve: FanCurve,
}

impl<P: PwmOutput> FanWorker<P> {
    pub fn new(state: Arc<SharedState>, fan: P, config: &ControlConfig) -> Self {
        Self {
            state,
            fan,
            curve: FanCurve::new(config),
        }
    }

    pub fn fan(&self) -> &P {
        &self.fan
    }

    pub fn tick(&mut self) -> u8 {
        let power = self.curve.power_for(self.state.temperature());
        if let Err(err) = self.fan.set_duty(power) {
            warn!("{err}");
        }
        power
    }
}

pub struct MotionWorker<M> {
    state: Arc<SharedState>,
    sensor: M,
    led: Arc<dyn LedPin>,
}

impl<M: MotionSensor> MotionWorker<M> {
    pub fn new(state: Arc<SharedState>, sensor: M, led: Arc<dyn LedPin>) -> Self {
        Self { state, sensor, led }
    }

    pub fn tick(&mut self) -> bool {
        let motion = self.sensor.motion_detected();
        if motion != self.state.led_output() {
            debug!("motion {}, led follows", if motion { "detected" } else { "cleared" });
        }
        drive_led(&self.state, self.led.as_ref(), motion);
        motion
    }
}
