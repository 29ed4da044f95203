//! Broker message envelope
//!
//! The envelope is transport-neutral: the in-process broker carries it as-is,
//! and an AMQP adapter would map `correlation_id`, `content_type` and
//! `headers` onto the matching message properties.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod payload;
pub use payload::*;

/// Header carrying the event identifier for consumer-side dedup
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
/// Header carrying the payload schema version
pub const HEADER_EVENT_VERSION: &str = "X-Event-Version";
/// Header carrying the originating request id, when known
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";
/// Header set by the broker when a delivery is dead-lettered
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

/// Content type of every ledger event
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// 消息体 - 一次发布/投递的完整内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Correlates confirms and returns with the publish attempt
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            correlation_id: None,
            content_type: None,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// JSON message with the content type already set
    pub fn json(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload.into()).with_content_type(CONTENT_TYPE_JSON)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// 解析 payload
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
