use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hal::NetworkDiagnostics;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryPayload {
    pub light: f32,
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkAttributes {
    pub rssi: i8,
    pub channel: u8,
    pub bssid: String,
    #[serde(rename = "localIp")]
    pub local_ip: String,
    pub ssid: String,
}

impl From<NetworkDiagnostics> for NetworkAttributes {
    fn from(diagnostics: NetworkDiagnostics) -> Self {
        Self {
            rssi: diagnostics.rssi,
            channel: diagnostics.channel,
            bssid: diagnostics.bssid,
            local_ip: diagnostics.local_ip.to_string(),
            ssid: diagnostics.ssid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityAttributes {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedStateReport {
    #[serde(rename = "ledState")]
    pub led_state: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedAttributeRequest {
    #[serde(rename = "sharedKeys")]
    pub shared_keys: String,
}

impl SharedAttributeRequest {
    pub fn for_keys(keys: &[&str]) -> Self {
        Self {
            shared_keys: keys.join(","),
        }
    }
}
