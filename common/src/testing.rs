//! Recording fakes for the hardware and transport seams.

use std::{
    cell::RefCell,
    collections::VecDeque,
    convert::Infallible,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use serde_json::Value;

use crate::{
    config::{CloudConfig, NetworkConfig},
    hal::{
        AnalogInput, CharacterDisplay, ClimateReading, ClimateSensor, HalError, LedPin,
        MotionSensor, NetworkDiagnostics, PixelStrip, PwmOutput, Rgb,
    },
    session::{CloudSession, Link, LinkError, SessionError},
};

#[derive(Debug, Default)]
pub struct RecordingLed {
    pub levels: Mutex<Vec<bool>>,
}

impl RecordingLed {
    pub fn last(&self) -> Option<bool> {
        self.levels.lock().unwrap().last().copied()
    }
}

impl LedPin for RecordingLed {
    fn set_level(&self, on: bool) -> Result<(), HalError> {
        self.levels.lock().unwrap().push(on);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSession {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    failing_topic: Mutex<Option<String>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub subscriptions: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Value)>>,
}

impl RecordingSession {
    pub fn connected() -> Self {
        let session = Self::default();
        session.connected.store(true, Ordering::SeqCst);
        session
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Subscribing to or publishing on `topic` fails until cleared.
    pub fn fail_topic(&self, topic: Option<&str>) {
        *self.failing_topic.lock().unwrap() = topic.map(str::to_string);
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(published, _)| published == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn check_topic(&self, topic: &str) -> Result<(), String> {
        match self.failing_topic.lock().unwrap().as_deref() {
            Some(failing) if topic.starts_with(failing) => Err("injected failure".to_string()),
            _ => Ok(()),
        }
    }
}

impl CloudSession for RecordingSession {
    fn connect(&self, cloud: &CloudConfig) -> Result<(), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(SessionError::Connect {
                server: cloud.server.clone(),
                port: cloud.port,
                reason: "refused".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, topic_filter: &str) -> Result<(), SessionError> {
        self.check_topic(topic_filter)
            .map_err(|reason| SessionError::Subscribe {
                topic: topic_filter.to_string(),
                reason,
            })?;
        self.subscriptions
            .lock()
            .unwrap()
            .push(topic_filter.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        self.check_topic(topic).map_err(|reason| SessionError::Publish {
            topic: topic.to_string(),
            reason,
        })?;
        let value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeLink {
    pub up: AtomicBool,
    pub establish_failures: AtomicUsize,
    pub establish_calls: AtomicUsize,
    pub diagnostics: NetworkDiagnostics,
}

impl FakeLink {
    pub fn up() -> Self {
        let link = Self::default();
        link.up.store(true, Ordering::SeqCst);
        link
    }
}

impl Link for FakeLink {
    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn establish(&self, network: &NetworkConfig) -> Result<(), LinkError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.establish_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.establish_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LinkError(format!("`{}` not in range", network.wifi_ssid)));
        }
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn diagnostics(&self) -> NetworkDiagnostics {
        self.diagnostics.clone()
    }

    fn mac_address(&self) -> String {
        "24:0A:C4:00:01:FF".to_string()
    }
}

#[derive(Debug)]
pub struct FakeStrip {
    pub pixels: Vec<Rgb>,
    pub shows: usize,
}

impl FakeStrip {
    pub fn new(len: usize) -> Self {
        Self {
            pixels: vec![Rgb::OFF; len],
            shows: 0,
        }
    }
}

impl PixelStrip for FakeStrip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        self.pixels[index] = color;
    }

    fn show(&mut self) -> Result<(), HalError> {
        self.shows += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakePwm {
    pub duties: Vec<u8>,
}

impl PwmOutput for FakePwm {
    fn set_duty(&mut self, duty: u8) -> Result<(), HalError> {
        self.duties.push(duty);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeLcd {
    pub rows: [String; 2],
    pub clears: usize,
}

impl CharacterDisplay for FakeLcd {
    fn clear(&mut self) -> Result<(), HalError> {
        self.clears += 1;
        self.rows = Default::default();
        Ok(())
    }

    fn write_row(&mut self, row: u8, text: &str) -> Result<(), HalError> {
        let slot = self
            .rows
            .get_mut(usize::from(row))
            .ok_or_else(|| HalError::new("lcd", format!("no row {row}")))?;
        *slot = text.to_string();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedClimate(pub VecDeque<ClimateReading>);

impl ClimateSensor for ScriptedClimate {
    fn read(&mut self) -> ClimateReading {
        self.0.pop_front().unwrap_or(ClimateReading::FAILED)
    }
}

#[derive(Debug, Default)]
pub struct FixedAnalog(pub u16);

impl AnalogInput for FixedAnalog {
    fn read_raw(&mut self) -> u16 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct FixedMotion(pub bool);

impl MotionSensor for FixedMotion {
    fn motion_detected(&mut self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Data,
    Clock,
    Latch,
}

pub type BusLog = Rc<RefCell<Vec<(Line, bool)>>>;

/// Output line that appends every level change to a shared log.
pub struct BusPin {
    line: Line,
    log: BusLog,
}

impl BusPin {
    pub fn new(line: Line, log: &BusLog) -> Self {
        Self {
            line,
            log: log.clone(),
        }
    }
}

impl embedded_hal::digital::ErrorType for BusPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for BusPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push((self.line, false));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().push((self.line, true));
        Ok(())
    }
}
