//! Shared attribute and RPC vocabulary.

use serde_json::Value;

pub const BLINKING_INTERVAL_ATTR: &str = "blinkingInterval";
pub const LED_STATE_ATTR: &str = "ledState";
pub const RPC_SET_LED_SWITCH: &str = "setLedSwitchValue";

/// Keys requested from the server after every (re)connection.
pub const SHARED_ATTRIBUTE_KEYS: [&str; 2] = [LED_STATE_ATTR, BLINKING_INTERVAL_ATTR];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeChange {
    BlinkingInterval(i64),
    LedState(bool),
    LedSwitch(bool),
}

impl AttributeChange {
    /// Maps one shared attribute entry to a change. Unknown keys and
    /// non-integral intervals yield `None`.
    pub fn from_shared(key: &str, value: &Value) -> Option<Self> {
        match key {
            BLINKING_INTERVAL_ATTR => value.as_i64().map(Self::BlinkingInterval),
            LED_STATE_ATTR => Some(Self::LedState(value_as_bool(value))),
            _ => None,
        }
    }

    pub fn from_rpc(method: &str, params: &Value) -> Option<Self> {
        (method == RPC_SET_LED_SWITCH).then(|| Self::LedSwitch(value_as_bool(params)))
    }
}

/// Booleans pass through, numbers are true when nonzero, anything else is false.
pub fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}
