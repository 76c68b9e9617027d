//! 16x2 character LCD frame: climate row plus a fixed banner.

use std::sync::Arc;

use log::warn;

use crate::{hal::CharacterDisplay, state::SharedState};

pub const LCD_COLUMNS: usize = 16;

/// Row of `LCD_COLUMNS` cells with cursor-positioned writes; text running
/// past the last column is cut off.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Row([char; LCD_COLUMNS]);

impl Row {
    fn blank() -> Self {
        Self([' '; LCD_COLUMNS])
    }

    fn put(&mut self, column: usize, text: &str) {
        for (cell, ch) in self.0.iter_mut().skip(column).zip(text.chars()) {
            *cell = ch;
        }
    }

    fn into_string(self) -> String {
        self.0.iter().collect()
    }
}

/// Whole-number part of a reading as shown on the panel; NaN shows as 0.
fn whole(value: f32) -> i32 {
    value as i32
}

pub fn climate_row(temperature: f32, humidity: f32) -> String {
    let mut row = Row::blank();
    row.put(0, "T:");
    row.put(2, &whole(temperature).to_string());
    row.put(4, "*C");
    row.put(11, "H:");
    row.put(13, &whole(humidity).to_string());
    row.put(15, "%");
    row.into_string()
}

pub struct LcdWorker<D> {
    state: Arc<SharedState>,
    display: D,
    banner: String,
}

impl<D: CharacterDisplay> LcdWorker<D> {
    pub fn new(state: Arc<SharedState>, display: D, banner: impl Into<String>) -> Self {
        Self {
            state,
            display,
            banner: banner.into(),
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn tick(&mut self) {
        let row = climate_row(self.state.temperature(), self.state.humidity());
        let result = self
            .display
            .clear()
            .and_then(|()| self.display.write_row(0, &row))
            .and_then(|()| self.display.write_row(1, &self.banner));
        if let Err(err) = result {
            warn!("{err}");
        }
    }
}
