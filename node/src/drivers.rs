use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use esp_idf_hal::{
    adc::{
        attenuation,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos, BLOCK},
    gpio::{AnyInputPin, AnyOutputPin, Gpio1, Input, Level, Output, PinDriver},
    i2c::I2cDriver,
    ledc::LedcDriver,
    peripheral::Peripheral,
    rmt::RmtChannel,
};
use log::warn;
use smart_leds::{SmartLedsWrite, RGB8};
use ws2812_esp32_rmt_driver::Ws2812Esp32Rmt;

use yolo_common::{
    dht20,
    hal::{
        AnalogInput, CharacterDisplay, ClimateReading, ClimateSensor, HalError, LedPin,
        MotionSensor, PixelStrip, PwmOutput, Rgb,
    },
};

pub type SharedI2c = Arc<Mutex<I2cDriver<'static>>>;

fn with_bus<T>(
    bus: &SharedI2c,
    device: &'static str,
    op: impl FnOnce(&mut I2cDriver<'static>) -> Result<T, esp_idf_svc::sys::EspError>,
) -> Result<T, HalError> {
    let mut driver = bus
        .lock()
        .map_err(|_| HalError::new(device, "i2c bus lock poisoned"))?;
    op(&mut driver).map_err(|err| HalError::new(device, err.to_string()))
}

pub struct Dht20 {
    bus: SharedI2c,
}

impl Dht20 {
    pub fn new(bus: SharedI2c) -> Self {
        Self { bus }
    }

    fn measure(&mut self) -> Result<ClimateReading, HalError> {
        with_bus(&self.bus, "dht20", |i2c| {
            i2c.write(dht20::ADDRESS, &dht20::TRIGGER_MEASUREMENT, BLOCK)
        })?;
        FreeRtos::delay_ms(dht20::MEASUREMENT_DELAY_MS);

        let mut frame = [0_u8; dht20::FRAME_LEN];
        with_bus(&self.bus, "dht20", |i2c| {
            i2c.read(dht20::ADDRESS, &mut frame, BLOCK)
        })?;
        dht20::decode(&frame).map_err(|err| HalError::new("dht20", err.to_string()))
    }
}

impl ClimateSensor for Dht20 {
    fn read(&mut self) -> ClimateReading {
        self.measure().unwrap_or_else(|err| {
            warn!("{err}");
            ClimateReading::FAILED
        })
    }
}

const LCD_RS: u8 = 0x01;
const LCD_ENABLE: u8 = 0x04;
const LCD_BACKLIGHT: u8 = 0x08;
const LCD_ROW_OFFSETS: [u8; 2] = [0x00, 0x40];

/// HD44780 in 4-bit mode behind a PCF8574 expander.
pub struct Hd44780 {
    bus: SharedI2c,
    address: u8,
}

impl Hd44780 {
    pub fn new(bus: SharedI2c, address: u8) -> anyhow::Result<Self> {
        let mut lcd = Self { bus, address };
        FreeRtos::delay_ms(50);
        for wait_us in [4_500, 4_500, 150] {
            lcd.write_nibble(0x30, 0)?;
            Ets::delay_us(wait_us);
        }
        lcd.write_nibble(0x20, 0)?;
        // Two lines, 5x8 font; display on, cursor off; left-to-right entry.
        for command in [0x28, 0x0C, 0x06] {
            lcd.command(command)?;
        }
        lcd.clear().context("failed to clear lcd")?;
        Ok(lcd)
    }

    fn expander_write(&mut self, value: u8) -> Result<(), HalError> {
        let address = self.address;
        with_bus(&self.bus, "lcd", |i2c| {
            i2c.write(address, &[value | LCD_BACKLIGHT], BLOCK)
        })
    }

    fn write_nibble(&mut self, nibble: u8, mode: u8) -> Result<(), HalError> {
        let value = (nibble & 0xF0) | mode;
        self.expander_write(value | LCD_ENABLE)?;
        Ets::delay_us(1);
        self.expander_write(value & !LCD_ENABLE)?;
        Ets::delay_us(50);
        Ok(())
    }

    fn send(&mut self, byte: u8, mode: u8) -> Result<(), HalError> {
        self.write_nibble(byte & 0xF0, mode)?;
        self.write_nibble(byte << 4, mode)
    }

    fn command(&mut self, command: u8) -> Result<(), HalError> {
        self.send(command, 0)
    }
}

impl CharacterDisplay for Hd44780 {
    fn clear(&mut self) -> Result<(), HalError> {
        self.command(0x01)?;
        FreeRtos::delay_ms(2);
        Ok(())
    }

    fn write_row(&mut self, row: u8, text: &str) -> Result<(), HalError> {
        let offset = LCD_ROW_OFFSETS
            .get(usize::from(row))
            .ok_or_else(|| HalError::new("lcd", format!("no row {row}")))?;
        self.command(0x80 | offset)?;
        for ch in text.chars() {
            let byte = if ch.is_ascii() { ch as u8 } else { b'?' };
            self.send(byte, LCD_RS)?;
        }
        Ok(())
    }
}

pub struct Ws2812 {
    driver: Ws2812Esp32Rmt<'static>,
    pixels: Vec<RGB8>,
}

impl Ws2812 {
    pub fn new<C: RmtChannel>(
        channel: impl Peripheral<P = C> + 'static,
        pin: AnyOutputPin,
        len: usize,
    ) -> anyhow::Result<Self> {
        let driver = Ws2812Esp32Rmt::new(channel, pin)
            .map_err(|err| anyhow!("failed to init ws2812 driver: {err:?}"))?;
        Ok(Self {
            driver,
            pixels: vec![RGB8::default(); len],
        })
    }
}

impl PixelStrip for Ws2812 {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = RGB8::new(color.r, color.g, color.b);
        }
    }

    fn show(&mut self) -> Result<(), HalError> {
        self.driver
            .write(self.pixels.iter().copied())
            .map_err(|err| HalError::new("strip", format!("{err:?}")))
    }
}

/// Fan on an 8-bit LEDC channel.
pub struct LedcFan(pub LedcDriver<'static>);

impl PwmOutput for LedcFan {
    fn set_duty(&mut self, duty: u8) -> Result<(), HalError> {
        self.0
            .set_duty(u32::from(duty))
            .map_err(|err| HalError::new("fan", err.to_string()))
    }
}

/// Light sensor on GPIO1 (ADC1 channel 0).
pub struct LightAdc {
    channel: AdcChannelDriver<'static, Gpio1, AdcDriver<'static, ADC1>>,
}

impl LightAdc {
    pub fn new(adc: AdcDriver<'static, ADC1>, pin: Gpio1) -> anyhow::Result<Self> {
        let config = AdcChannelConfig {
            attenuation: attenuation::DB_11,
            ..Default::default()
        };
        Ok(Self {
            channel: AdcChannelDriver::new(adc, pin, &config)?,
        })
    }
}

impl AnalogInput for LightAdc {
    fn read_raw(&mut self) -> u16 {
        self.channel.read_raw().unwrap_or_else(|err| {
            warn!("light adc read failed: {err}");
            0
        })
    }
}

pub struct PirSensor(pub PinDriver<'static, AnyInputPin, Input>);

impl MotionSensor for PirSensor {
    fn motion_detected(&mut self) -> bool {
        self.0.is_high()
    }
}

pub struct GpioLed(pub Mutex<PinDriver<'static, AnyOutputPin, Output>>);

impl LedPin for GpioLed {
    fn set_level(&self, on: bool) -> Result<(), HalError> {
        let mut pin = self
            .0
            .lock()
            .map_err(|_| HalError::new("led", "pin lock poisoned"))?;
        pin.set_level(Level::from(on))
            .map_err(|err| HalError::new("led", err.to_string()))
    }
}
