//! Outbound reporting: sensor telemetry, periodic network attributes and the
//! change-triggered `ledState` echo.

use std::sync::Arc;

use log::{info, warn};

use crate::{
    hal::{AnalogInput, ClimateSensor},
    session::{CloudClient, CloudSession, Link},
    state::SharedState,
    types::{LedStateReport, NetworkAttributes, TelemetryPayload},
};

/// Full scale of the 12-bit light ADC.
const LIGHT_ADC_FULL_SCALE: f32 = 4096.0;

pub fn scale_light(raw: u16) -> f32 {
    f32::from(raw) * 100.0 / LIGHT_ADC_FULL_SCALE
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryOutcome {
    Published(TelemetryPayload),
    SensorFault,
    PublishFailed,
}

/// Samples the climate sensor and the light input, stores the readings and
/// pushes them as one telemetry message.
pub struct TelemetryWorker<S, C, A> {
    state: Arc<SharedState>,
    cloud: Arc<CloudClient<S>>,
    climate: C,
    light: A,
}

impl<S, C, A> TelemetryWorker<S, C, A>
where
    S: CloudSession,
    C: ClimateSensor,
    A: AnalogInput,
{
    pub fn new(state: Arc<SharedState>, cloud: Arc<CloudClient<S>>, climate: C, light: A) -> Self {
        Self {
            state,
            cloud,
            climate,
            light,
        }
    }

    pub fn tick(&mut self) -> TelemetryOutcome {
        let reading = self.climate.read();
        let light = scale_light(self.light.read_raw());
        self.state.record_climate(reading.temperature, reading.humidity);
        self.state.record_light(light);

        let snapshot = self.state.sensors();
        if !snapshot.climate_valid() {
            warn!("failed to read climate sensor, skipping telemetry");
            return TelemetryOutcome::SensorFault;
        }

        info!(
            "temperature {:.1} C, humidity {:.1} %, light {:.1} lx",
            snapshot.temperature, snapshot.humidity, snapshot.light
        );
        let payload = TelemetryPayload {
            light: snapshot.light,
            temperature: snapshot.temperature,
            humidity: snapshot.humidity,
        };
        match self.cloud.send_telemetry(&payload) {
            Ok(()) => TelemetryOutcome::Published(payload),
            Err(err) => {
                warn!("{err}");
                TelemetryOutcome::PublishFailed
            }
        }
    }
}

/// Pushes the network diagnostics every tick, changed or not.
pub struct AttributeReporter<S, L> {
    cloud: Arc<CloudClient<S>>,
    link: Arc<L>,
}

impl<S: CloudSession, L: Link> AttributeReporter<S, L> {
    pub fn new(cloud: Arc<CloudClient<S>>, link: Arc<L>) -> Self {
        Self { cloud, link }
    }

    pub fn tick(&self) -> bool {
        let attributes = NetworkAttributes::from(self.link.diagnostics());
        match self.cloud.send_attributes(&attributes) {
            Ok(()) => true,
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }
}

/// Consumes the change flag and echoes the LED output level.
pub struct ChangeReporter<S> {
    state: Arc<SharedState>,
    cloud: Arc<CloudClient<S>>,
}

impl<S: CloudSession> ChangeReporter<S> {
    pub fn new(state: Arc<SharedState>, cloud: Arc<CloudClient<S>>) -> Self {
        Self { state, cloud }
    }

    /// Returns whether a report was attempted. The flag is cleared before the
    /// push, so a change landing during the push is reported next tick.
    pub fn tick(&self) -> bool {
        if !self.state.attributes_changed().take() {
            return false;
        }

        let report = LedStateReport {
            led_state: self.state.led_output(),
        };
        if let Err(err) = self.cloud.send_attributes(&report) {
            warn!("{err}");
        }
        true
    }
}
