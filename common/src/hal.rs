//! Hardware the tasks drive, reduced to the operations they need.
//!
//! Concrete drivers live in the platform back-ends.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{device}: {message}")]
pub struct HalError {
    pub device: &'static str,
    pub message: String,
}

impl HalError {
    pub fn new(device: &'static str, message: impl Into<String>) -> Self {
        Self {
            device,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature: f32,
    pub humidity: f32,
}

impl ClimateReading {
    pub const FAILED: Self = Self {
        temperature: f32::NAN,
        humidity: f32::NAN,
    };
}

/// Temperature/humidity chip. A failed read yields NaN fields.
pub trait ClimateSensor {
    fn read(&mut self) -> ClimateReading;
}

/// A 12-bit analog input.
pub trait AnalogInput {
    fn read_raw(&mut self) -> u16;
}

pub trait MotionSensor {
    fn motion_detected(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Self = Self::new(255, 255, 255);
    pub const OFF: Self = Self::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Addressable strip with a local pixel buffer flushed by `show`.
pub trait PixelStrip {
    fn len(&self) -> usize;
    fn set_pixel(&mut self, index: usize, color: Rgb);
    fn show(&mut self) -> Result<(), HalError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fill(&mut self, color: Rgb) {
        for index in 0..self.len() {
            self.set_pixel(index, color);
        }
    }
}

/// 8-bit PWM channel.
pub trait PwmOutput {
    fn set_duty(&mut self, duty: u8) -> Result<(), HalError>;
}

/// The LED output line. Written from several tasks, hence `&self`.
pub trait LedPin: Send + Sync {
    fn set_level(&self, on: bool) -> Result<(), HalError>;
}

/// Character LCD addressed by row.
pub trait CharacterDisplay {
    fn clear(&mut self) -> Result<(), HalError>;
    fn write_row(&mut self, row: u8, text: &str) -> Result<(), HalError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDiagnostics {
    pub rssi: i8,
    pub channel: u8,
    pub bssid: String,
    pub local_ip: Ipv4Addr,
    pub ssid: String,
}

impl Default for NetworkDiagnostics {
    fn default() -> Self {
        Self {
            rssi: 0,
            channel: 0,
            bssid: "00:00:00:00:00:00".to_string(),
            local_ip: Ipv4Addr::UNSPECIFIED,
            ssid: String::new(),
        }
    }
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
