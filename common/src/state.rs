use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

pub const BLINKING_INTERVAL_MIN_MS: u16 = 10;
pub const BLINKING_INTERVAL_MAX_MS: u16 = 60_000;
pub const DEFAULT_BLINKING_INTERVAL_MS: u16 = 1_000;

#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct ChangeFlag(AtomicBool);

impl ChangeFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clears the flag and reports whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub light: f32,
}

impl SensorSnapshot {
    pub fn climate_valid(&self) -> bool {
        !self.temperature.is_nan() && !self.humidity.is_nan()
    }
}

#[derive(Debug)]
pub struct SharedState {
    temperature: AtomicF32,
    humidity: AtomicF32,
    light_level: AtomicF32,
    led_output: AtomicBool,
    led_state: AtomicBool,
    blinking_interval_ms: AtomicU16,
    attributes_changed: ChangeFlag,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            temperature: AtomicF32::new(0.0),
            humidity: AtomicF32::new(0.0),
            light_level: AtomicF32::new(0.0),
            led_output: AtomicBool::new(false),
            led_state: AtomicBool::new(false),
            blinking_interval_ms: AtomicU16::new(DEFAULT_BLINKING_INTERVAL_MS),
            attributes_changed: ChangeFlag::default(),
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.load()
    }

    pub fn humidity(&self) -> f32 {
        self.humidity.load()
    }

    pub fn light_level(&self) -> f32 {
        self.light_level.load()
    }

    pub fn record_climate(&self, temperature: f32, humidity: f32) {
        self.temperature.store(temperature);
        self.humidity.store(humidity);
    }

    pub fn record_light(&self, light: f32) {
        self.light_level.store(light);
    }

    pub fn sensors(&self) -> SensorSnapshot {
        SensorSnapshot {
            temperature: self.temperature(),
            humidity: self.humidity(),
            light: self.light_level(),
        }
    }

    pub fn led_output(&self) -> bool {
        self.led_output.load(Ordering::Relaxed)
    }

    pub fn set_led_output(&self, on: bool) {
        self.led_output.store(on, Ordering::Relaxed);
    }

    pub fn led_state(&self) -> bool {
        self.led_state.load(Ordering::Relaxed)
    }

    pub fn set_led_state(&self, on: bool) {
        self.led_state.store(on, Ordering::Relaxed);
    }

    pub fn blinking_interval_ms(&self) -> u16 {
        self.blinking_interval_ms.load(Ordering::Relaxed)
    }

    /// Out-of-range values leave the previous interval in place.
    pub fn apply_blinking_interval(&self, requested: i64) -> bool {
        let min = i64::from(BLINKING_INTERVAL_MIN_MS);
        let max = i64::from(BLINKING_INTERVAL_MAX_MS);
        if !(min..=max).contains(&requested) {
            return false;
        }
        let Ok(interval) = u16::try_from(requested) else {
            return false;
        };
        self.blinking_interval_ms.store(interval, Ordering::Relaxed);
        true
    }

    pub fn attributes_changed(&self) -> &ChangeFlag {
        &self.attributes_changed
    }
}
