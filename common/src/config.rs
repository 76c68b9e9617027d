use serde::{Deserialize, Serialize};

use crate::lcd::LCD_COLUMNS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub server: String,
    pub port: u16,
    pub token: String,
    pub client_id: String,
    pub max_message_size: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server: "app.coreiot.io".to_string(),
            port: 1883,
            token: String::new(),
            client_id: "yolo-node".to_string(),
            max_message_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTimings {
    pub link_check_ms: u64,
    pub link_retry_ms: u64,
    pub session_check_ms: u64,
    pub telemetry_ms: u64,
    pub attributes_ms: u64,
    pub attribute_changes_ms: u64,
    pub session_pump_ms: u64,
    pub light_control_ms: u64,
    pub fan_control_ms: u64,
    pub motion_ms: u64,
    pub lcd_ms: u64,
    pub display_counter_ms: u64,
}

impl Default for TaskTimings {
    fn default() -> Self {
        Self {
            link_check_ms: 30_000,
            link_retry_ms: 500,
            session_check_ms: 1_000,
            telemetry_ms: 2_000,
            attributes_ms: 2_000,
            attribute_changes_ms: 10,
            session_pump_ms: 10,
            light_control_ms: 500,
            fan_control_ms: 500,
            motion_ms: 500,
            lcd_ms: 1_000,
            display_counter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecovery {
    /// A failed setup step ends the session worker for good.
    Abandon,
    /// A failed setup is retried with exponential backoff.
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub recovery: SessionRecovery,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recovery: SessionRecovery::Backoff,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanStep {
    pub below_c: f32,
    pub power: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub light_on_below: f32,
    pub light_off_above: f32,
    pub strip_pixels: usize,
    pub fan_steps: Vec<FanStep>,
    pub fan_max_power: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            light_on_below: 20.0,
            light_off_above: 40.0,
            strip_pixels: 4,
            fan_steps: vec![
                FanStep {
                    below_c: 28.5,
                    power: 0,
                },
                FanStep {
                    below_c: 29.0,
                    power: 80,
                },
                FanStep {
                    below_c: 29.5,
                    power: 120,
                },
                FanStep {
                    below_c: 30.0,
                    power: 160,
                },
                FanStep {
                    below_c: 30.5,
                    power: 200,
                },
            ],
            fan_max_power: 255,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcdConfig {
    pub banner: String,
}

impl Default for LcdConfig {
    fn default() -> Self {
        Self {
            banner: "  HCMUT-IOT-CE  ".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub led: i32,
    pub sda: i32,
    pub scl: i32,
    pub light_sensor: i32,
    pub light_strip: i32,
    pub fan: i32,
    pub motion: i32,
    pub display_latch: i32,
    pub display_clock: i32,
    pub display_data: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            led: 48,
            sda: 11,
            scl: 12,
            light_sensor: 1,
            light_strip: 6,
            fan: 8,
            motion: 10,
            display_latch: 38,
            display_clock: 21,
            display_data: 47,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub tasks: TaskTimings,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub lcd: LcdConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.cloud.sanitize();
        self.tasks.sanitize();
        self.session.sanitize();
        self.control.sanitize();
        self.lcd.sanitize();
    }

    /// Overlays values from the environment-style `lookup` onto the config.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ssid) = lookup("WIFI_SSID") {
            self.network.wifi_ssid = ssid;
        }
        if let Some(pass) = lookup("WIFI_PASS") {
            self.network.wifi_pass = pass;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            self.cloud.server = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.cloud.port = port;
        }
        if let Some(token) = lookup("DEVICE_TOKEN") {
            self.cloud.token = token;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.cloud.client_id = client_id;
        }
    }
}

impl CloudConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 1883;
        }
        if self.client_id.trim().is_empty() {
            self.client_id = "yolo-node".to_string();
        }
        self.max_message_size = self.max_message_size.clamp(128, 16 * 1024);
    }
}

impl TaskTimings {
    pub fn sanitize(&mut self) {
        for period in [
            &mut self.link_check_ms,
            &mut self.link_retry_ms,
            &mut self.session_check_ms,
            &mut self.telemetry_ms,
            &mut self.attributes_ms,
            &mut self.attribute_changes_ms,
            &mut self.session_pump_ms,
            &mut self.light_control_ms,
            &mut self.fan_control_ms,
            &mut self.motion_ms,
            &mut self.lcd_ms,
            &mut self.display_counter_ms,
        ] {
            *period = (*period).max(1);
        }
    }
}

impl SessionConfig {
    pub fn sanitize(&mut self) {
        self.initial_backoff_ms = self.initial_backoff_ms.max(1);
        if self.max_backoff_ms < self.initial_backoff_ms {
            self.max_backoff_ms = self.initial_backoff_ms;
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        if self.light_on_below > self.light_off_above {
            std::mem::swap(&mut self.light_on_below, &mut self.light_off_above);
        }
        self.fan_steps.retain(|step| step.below_c.is_finite());
        self.fan_steps.sort_by(|a, b| a.below_c.total_cmp(&b.below_c));
    }
}

impl LcdConfig {
    pub fn sanitize(&mut self) {
        if self.banner.chars().count() > LCD_COLUMNS {
            self.banner = self.banner.chars().take(LCD_COLUMNS).collect();
        }
    }
}
