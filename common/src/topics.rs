//! ThingsBoard MQTT device API.

pub const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
pub const TOPIC_ATTRIBUTES: &str = "v1/devices/me/attributes";

pub const TOPIC_RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";
pub const TOPIC_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const TOPIC_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

pub const TOPIC_ATTRIBUTE_REQUEST_PREFIX: &str = "v1/devices/me/attributes/request/";
pub const TOPIC_ATTRIBUTE_RESPONSE_FILTER: &str = "v1/devices/me/attributes/response/+";
pub const TOPIC_ATTRIBUTE_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    RpcRequest { request_id: &'a str },
    AttributeUpdate,
    AttributeResponse { request_id: &'a str },
    Other,
}

pub fn classify(topic: &str) -> InboundTopic<'_> {
    if topic == TOPIC_ATTRIBUTES {
        return InboundTopic::AttributeUpdate;
    }
    if let Some(request_id) = topic.strip_prefix(TOPIC_RPC_REQUEST_PREFIX) {
        if !request_id.is_empty() {
            return InboundTopic::RpcRequest { request_id };
        }
    }
    if let Some(request_id) = topic.strip_prefix(TOPIC_ATTRIBUTE_RESPONSE_PREFIX) {
        if !request_id.is_empty() {
            return InboundTopic::AttributeResponse { request_id };
        }
    }
    InboundTopic::Other
}

pub fn rpc_response_topic(request_id: &str) -> String {
    format!("{TOPIC_RPC_RESPONSE_PREFIX}{request_id}")
}

pub fn attribute_request_topic(request_id: u32) -> String {
    format!("{TOPIC_ATTRIBUTE_REQUEST_PREFIX}{request_id}")
}
