// ============================================================================
// Queue Message Types
// ============================================================================
//
// Wire format (JSON body of every broker message):
//   {"msg_id": "...", "msisdn": "...", "text": "...", "mno": "...",
//    "type": "general|otp|transactional|promotional", "status": "..."}
//
// Priority is NOT part of the body; it travels as the broker message
// property and is bounded by the queue's x-max-priority.
//
// ============================================================================

use dispatch_config::constants::MAX_PRIORITY;
use dispatch_error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Message class chosen by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    General,
    Otp,
    Transactional,
    Promotional,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::General => "general",
            MessageType::Otp => "otp",
            MessageType::Transactional => "transactional",
            MessageType::Promotional => "promotional",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mobile network operators the pipeline can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Gp,
    Robi,
    Airtel,
}

impl Operator {
    pub const ALL: [Operator; 3] = [Operator::Gp, Operator::Robi, Operator::Airtel];

    /// Canonical name, as carried in the `mno` field and in telemetry tags
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gp => "GP",
            Operator::Robi => "Robi",
            Operator::Airtel => "Airtel",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownOperator(s.to_string()))
    }
}

/// Broker-side priority, always within `0..=MAX_PRIORITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const HIGHEST: Priority = Priority(MAX_PRIORITY);

    /// Out-of-range values saturate: negatives become 0, anything above the
    /// queue maximum becomes the maximum.
    pub fn clamped(value: i64) -> Self {
        Priority(value.clamp(0, MAX_PRIORITY as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority::clamped(value as i64)
    }
}

/// Message body as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub msg_id: String,
    pub msisdn: String,
    pub text: String,
    /// Operator name; may be empty, in which case it is resolved from `msisdn`
    #[serde(default)]
    pub mno: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub status: String,
}

impl QueueMessage {
    /// Build a fresh message with a generated id and `queued` status.
    pub fn new(
        msisdn: impl Into<String>,
        text: impl Into<String>,
        operator: Operator,
        message_type: MessageType,
    ) -> Self {
        Self {
            msg_id: generate_msg_id(),
            msisdn: msisdn.into(),
            text: text.into(),
            mno: operator.as_str().to_string(),
            message_type,
            status: "queued".to_string(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a broker body. Anything that is not a JSON object with a
    /// non-empty `msg_id` is malformed.
    pub fn decode(body: &[u8]) -> Result<Self, ValidationError> {
        let msg: QueueMessage = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        if msg.msg_id.trim().is_empty() {
            return Err(ValidationError::MissingMessageId);
        }
        Ok(msg)
    }
}

/// `<YYYYmmddHHMMSS>-<uuid>`: sortable by submission second, unique across instances.
pub fn generate_msg_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        uuid::Uuid::new_v4().simple()
    )
}
