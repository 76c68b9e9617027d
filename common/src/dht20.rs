//! DHT20 (AHT20 core) measurement frame decoding.

use thiserror::Error;

use crate::hal::ClimateReading;

pub const ADDRESS: u8 = 0x38;
pub const TRIGGER_MEASUREMENT: [u8; 3] = [0xAC, 0x33, 0x00];
/// Conversion time after a trigger before the frame can be read.
pub const MEASUREMENT_DELAY_MS: u32 = 80;
pub const FRAME_LEN: usize = 7;

const STATUS_BUSY: u8 = 0x80;
const FULL_SCALE: f32 = 1_048_576.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("sensor still busy")]
    Busy,
    #[error("crc mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Crc { expected: u8, actual: u8 },
}

/// CRC-8, polynomial 0x31, initial value 0xFF.
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0xFF, |crc, &byte| {
        (0..8).fold(crc ^ byte, |crc, _| {
            if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            }
        })
    })
}

/// Decodes status, 20-bit humidity, 20-bit temperature and CRC.
pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<ClimateReading, FrameError> {
    if frame[0] & STATUS_BUSY != 0 {
        return Err(FrameError::Busy);
    }
    let expected = crc8(&frame[..6]);
    if expected != frame[6] {
        return Err(FrameError::Crc {
            expected,
            actual: frame[6],
        });
    }

    let raw_humidity =
        u32::from(frame[1]) << 12 | u32::from(frame[2]) << 4 | u32::from(frame[3]) >> 4;
    let raw_temperature =
        (u32::from(frame[3]) & 0x0F) << 16 | u32::from(frame[4]) << 8 | u32::from(frame[5]);

    Ok(ClimateReading {
        temperature: raw_temperature as f32 / FULL_SCALE * 200.0 - 50.0,
        humidity: raw_humidity as f32 / FULL_SCALE * 100.0,
    })
}
