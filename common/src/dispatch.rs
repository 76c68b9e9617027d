//! Remote command dispatch: RPC calls and shared attribute updates, invoked
//! from the session pump.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::{
    attributes::{AttributeChange, RPC_SET_LED_SWITCH},
    control::drive_led,
    hal::LedPin,
    state::SharedState,
    topics::{classify, rpc_response_topic, InboundTopic},
    types::RpcRequest,
};

/// A reply the pump must publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct Dispatcher {
    state: Arc<SharedState>,
    led: Arc<dyn LedPin>,
    max_message_size: usize,
}

impl Dispatcher {
    pub fn new(state: Arc<SharedState>, led: Arc<dyn LedPin>, max_message_size: usize) -> Self {
        Self {
            state,
            led,
            max_message_size,
        }
    }

    /// Routes one received publish. Returns the RPC reply, if any.
    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) -> Option<Outbound> {
        if payload.len() > self.max_message_size {
            warn!(
                "dropping {} byte message on `{topic}` (limit {})",
                payload.len(),
                self.max_message_size
            );
            return None;
        }

        match classify(topic) {
            InboundTopic::RpcRequest { request_id } => {
                let request: RpcRequest = match serde_json::from_slice(payload) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!("malformed rpc request {request_id}: {err}");
                        return None;
                    }
                };
                let reply = self.handle_rpc(&request.method, &request.params)?;
                match serde_json::to_vec(&reply) {
                    Ok(payload) => Some(Outbound {
                        topic: rpc_response_topic(request_id),
                        payload,
                    }),
                    Err(err) => {
                        warn!("failed to encode rpc reply: {err}");
                        None
                    }
                }
            }
            kind @ (InboundTopic::AttributeUpdate | InboundTopic::AttributeResponse { .. }) => {
                match serde_json::from_slice::<Value>(payload) {
                    Ok(Value::Object(attributes)) if kind == InboundTopic::AttributeUpdate => {
                        self.handle_shared_attributes(&attributes);
                    }
                    Ok(Value::Object(response)) => {
                        self.handle_attribute_response(&response);
                    }
                    Ok(other) => warn!("ignoring non-object attribute payload: {other}"),
                    Err(err) => warn!("malformed attribute payload on `{topic}`: {err}"),
                }
                None
            }
            InboundTopic::Other => {
                debug!("ignoring message on `{topic}`");
                None
            }
        }
    }

    /// Handles a call to one of the exposed procedures. Unknown methods get
    /// no reply.
    pub fn handle_rpc(&self, method: &str, params: &Value) -> Option<Value> {
        let Some(change @ AttributeChange::LedSwitch(on)) =
            AttributeChange::from_rpc(method, params)
        else {
            warn!("unknown rpc method `{method}`");
            return None;
        };
        self.apply(change);

        let mut reply = Map::new();
        reply.insert(RPC_SET_LED_SWITCH.to_string(), Value::Bool(on));
        Some(Value::Object(reply))
    }

    /// Pull responses wrap the values in a `shared` object.
    pub fn handle_attribute_response(&self, response: &Map<String, Value>) -> usize {
        match response.get("shared") {
            Some(Value::Object(shared)) => self.handle_shared_attributes(shared),
            _ => {
                debug!("attribute response carried no shared values");
                0
            }
        }
    }

    pub fn handle_shared_attributes(&self, attributes: &Map<String, Value>) -> usize {
        let applied = attributes
            .iter()
            .filter_map(|(key, value)| AttributeChange::from_shared(key, value))
            .filter(|change| self.apply(*change))
            .count();
        if applied == 0 {
            debug!("attribute update carried no applicable keys");
        }
        applied
    }

    /// Applies one change; the change flag is raised only when it took effect.
    pub fn apply(&self, change: AttributeChange) -> bool {
        let applied = match change {
            AttributeChange::BlinkingInterval(requested) => {
                if self.state.apply_blinking_interval(requested) {
                    info!("blinking interval set to {requested} ms");
                    true
                } else {
                    debug!("rejected blinking interval {requested} ms");
                    false
                }
            }
            AttributeChange::LedState(on) => {
                self.state.set_led_state(on);
                drive_led(&self.state, self.led.as_ref(), on);
                info!("led state attribute set to {on}");
                true
            }
            AttributeChange::LedSwitch(on) => {
                drive_led(&self.state, self.led.as_ref(), on);
                info!("led switched {} by rpc", if on { "on" } else { "off" });
                true
            }
        };

        if applied {
            self.state.attributes_changed().raise();
        }
        applied
    }
}
