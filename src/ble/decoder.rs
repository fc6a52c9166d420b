//! Notification decoding
//!
//! Turns raw characteristic values into numbered application messages.
//! Payloads are UTF-8 text; anything else is still delivered, tagged as a
//! decode error with the original bytes attached.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    DecodeError { raw: Vec<u8>, reason: String },
}

/// One notification as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub characteristic: Uuid,
    /// Per-characteristic position in delivery order, starting at 0 for
    /// each connection.
    pub seq: u64,
    pub body: MessageBody,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            MessageBody::DecodeError { .. } => None,
        }
    }

    pub fn is_decode_error(&self) -> bool {
        matches!(self.body, MessageBody::DecodeError { .. })
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::Text(text) => write!(f, "#{} {}", self.seq, text),
            MessageBody::DecodeError { raw, reason } => {
                write!(f, "#{} <undecodable 0x{}: {}>", self.seq, hex::encode(raw), reason)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NotificationDecoder {
    next_seq: HashMap<Uuid, u64>,
}

impl NotificationDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, characteristic: Uuid, value: &[u8]) -> InboundMessage {
        let counter = self.next_seq.entry(characteristic).or_insert(0);
        let seq = *counter;
        *counter += 1;

        let body = match std::str::from_utf8(value) {
            Ok(text) => MessageBody::Text(text.to_string()),
            Err(e) => MessageBody::DecodeError {
                raw: value.to_vec(),
                reason: e.to_string(),
            },
        };

        InboundMessage {
            characteristic,
            seq,
            body,
            received_at: Utc::now(),
        }
    }

    /// Forget all sequence counters; called when a connection ends.
    pub fn reset(&mut self) {
        self.next_seq.clear();
    }
}
