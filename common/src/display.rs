//! Four-digit seven-segment display behind two chained shift registers.

use std::sync::atomic::{AtomicU8, Ordering};

use embedded_hal::digital::{ErrorKind, OutputPin, PinState};
use thiserror::Error;

pub const DIGITS: usize = 4;

/// Segment patterns for 0-9, A-F and a dash.
pub const SEGMENT_TABLE: [u8; 17] = [
    0xC0, 0xF9, 0xA4, 0xB0, 0x99, 0x92, 0x82, 0xF8, 0x80, 0x90, 0x8C, 0xBF, 0xC6, 0xA1, 0x86,
    0xFF, 0xBF,
];

pub const BLANK: u8 = 0xFF;

/// Rollover modulus of each digit, least significant first (ss then mm).
pub const DIGIT_MODULI: [u8; DIGITS] = [10, 6, 10, 6];

pub fn segment_pattern(value: u8) -> u8 {
    SEGMENT_TABLE
        .get(usize::from(value))
        .copied()
        .unwrap_or(BLANK)
}

#[derive(Debug, Default)]
pub struct DigitBuffer([AtomicU8; DIGITS]);

impl DigitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) {
        for (digit, modulus) in self.0.iter().zip(DIGIT_MODULI) {
            let next = digit.load(Ordering::Relaxed) + 1;
            if next < modulus {
                digit.store(next, Ordering::Relaxed);
                return;
            }
            digit.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> [u8; DIGITS] {
        std::array::from_fn(|position| self.0[position].load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusLine {
    Data,
    Clock,
    Latch,
}

#[derive(Debug, Error)]
#[error("display {line:?} line write failed: {kind:?}")]
pub struct DisplayError {
    pub line: BusLine,
    pub kind: ErrorKind,
}

fn on_line<E: embedded_hal::digital::Error>(line: BusLine) -> impl Fn(E) -> DisplayError {
    move |err| DisplayError {
        line,
        kind: err.kind(),
    }
}

pub struct ShiftRegisterDisplay<D, C, L> {
    data: D,
    clock: C,
    latch: L,
}

impl<D, C, L> ShiftRegisterDisplay<D, C, L>
where
    D: OutputPin,
    C: OutputPin,
    L: OutputPin,
{
    pub fn new(data: D, clock: C, latch: L) -> Self {
        Self { data, clock, latch }
    }

    pub fn render(&mut self, digits: [u8; DIGITS]) -> Result<(), DisplayError> {
        for (position, value) in digits.into_iter().enumerate() {
            self.show_digit(position, segment_pattern(value))?;
        }
        Ok(())
    }

    fn show_digit(&mut self, position: usize, pattern: u8) -> Result<(), DisplayError> {
        self.shift_out(pattern)?;
        self.shift_out(1 << position)?;
        self.latch.set_low().map_err(on_line(BusLine::Latch))?;
        self.latch.set_high().map_err(on_line(BusLine::Latch))
    }

    fn shift_out(&mut self, byte: u8) -> Result<(), DisplayError> {
        for bit in (0..8).rev() {
            let level = PinState::from(byte & (1 << bit) != 0);
            self.data.set_state(level).map_err(on_line(BusLine::Data))?;
            self.clock.set_low().map_err(on_line(BusLine::Clock))?;
            self.clock.set_high().map_err(on_line(BusLine::Clock))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{BusLog, BusPin, Line};

    fn mixed_radix(n: u32) -> [u8; DIGITS] {
        let n = n % 3600;
        [
            (n % 10) as u8,
            (n / 10 % 6) as u8,
            (n / 60 % 10) as u8,
            (n / 600 % 6) as u8,
        ]
    }

    /// Decodes the log into latched frames of bytes clocked in since the
    /// previous latch.
    fn frames(log: &BusLog) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut bits = Vec::new();
        let mut data = false;
        for &(line, level) in log.borrow().iter() {
            match (line, level) {
                (Line::Data, level) => data = level,
                (Line::Clock, true) => bits.push(data),
                (Line::Latch, true) => {
                    let bytes = bits
                        .chunks(8)
                        .map(|byte| byte.iter().fold(0u8, |acc, &bit| acc << 1 | u8::from(bit)))
                        .collect();
                    frames.push(bytes);
                    bits.clear();
                }
                _ => {}
            }
        }
        frames
    }

    #[test]
    fn counter_matches_minutes_seconds_encoding() {
        let buffer = DigitBuffer::new();
        assert_eq!(buffer.snapshot(), [0; DIGITS]);

        for n in 1..=7_300u32 {
            buffer.tick();
            assert_eq!(buffer.snapshot(), mixed_radix(n), "after {n} ticks");
        }
    }

    #[test]
    fn rollover_at_59_59_returns_to_zero() {
        let buffer = DigitBuffer::new();
        for _ in 0..3_599 {
            buffer.tick();
        }
        assert_eq!(buffer.snapshot(), [9, 5, 9, 5]);
        buffer.tick();
        assert_eq!(buffer.snapshot(), [0; DIGITS]);
    }

    #[test]
    fn segment_lookup_matches_table() {
        assert_eq!(segment_pattern(7), 0xF8);
        assert_eq!(segment_pattern(0), 0xC0);
        assert_eq!(segment_pattern(16), 0xBF);
        assert_eq!(segment_pattern(42), BLANK);
    }

    #[test]
    fn renders_pattern_then_select_msb_first_per_digit() {
        let log: BusLog = Rc::new(RefCell::new(Vec::new()));
        let mut display = ShiftRegisterDisplay::new(
            BusPin::new(Line::Data, &log),
            BusPin::new(Line::Clock, &log),
            BusPin::new(Line::Latch, &log),
        );

        display.render([7, 0, 1, 2]).unwrap();

        assert_eq!(
            frames(&log),
            vec![
                vec![0xF8, 0x01],
                vec![0xC0, 0x02],
                vec![0xF9, 0x04],
                vec![0xA4, 0x08],
            ]
        );
    }

    #[test]
    fn clock_falls_before_it_rises_and_latch_pulses_low_high() {
        let log: BusLog = Rc::new(RefCell::new(Vec::new()));
        let mut display = ShiftRegisterDisplay::new(
            BusPin::new(Line::Data, &log),
            BusPin::new(Line::Clock, &log),
            BusPin::new(Line::Latch, &log),
        );

        display.render([0; DIGITS]).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), DIGITS * (16 * 3 + 2));
        assert_eq!(
            &log[..3],
            &[(Line::Data, true), (Line::Clock, false), (Line::Clock, true)]
        );
        assert_eq!(
            &log[48..50],
            &[(Line::Latch, false), (Line::Latch, true)]
        );
    }
}
