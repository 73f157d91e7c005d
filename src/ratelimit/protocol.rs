//! The framing contract a host transport drives.
//!
//! A host calls [`Protocol::input`] on every readable event to learn how much
//! of its buffer is one complete message, [`Protocol::decode`] on that
//! message, and [`Protocol::encode`] on everything it writes back.

use serde_json::Value;

use super::connection::{Connection, ConnectionId};
use crate::error::{ConnLimitError, Result};

/// What the host should do with its inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// The first `n` bytes are one complete message.
    Message(usize),
    /// Receive was paused; keep the buffer and retry once resumed.
    Pending,
    /// The buffer is discarded.
    Dropped,
    /// Protocol violation: close the connection.
    Close,
}

impl InputOutcome {
    /// Byte count in the classic integer form: `n`, `0` or `-1`.
    pub fn consumed(&self) -> i64 {
        match self {
            InputOutcome::Message(len) => *len as i64,
            InputOutcome::Pending | InputOutcome::Dropped => 0,
            InputOutcome::Close => -1,
        }
    }
}

/// Host-facing operations of a rate-limiting protocol.
pub trait Protocol: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn decode<'a>(&self, buffer: &'a [u8], conn: &dyn Connection) -> &'a [u8];

    fn input(&self, buffer: &[u8], conn: &dyn Connection) -> InputOutcome;

    /// Produce the exact text written to the socket for `data`.
    ///
    /// An empty string means the data was dropped.
    fn encode(&self, data: &Value, conn: &dyn Connection) -> Result<String>;

    /// Override the limit for one connection.
    fn set_connection_limit(&self, conn: &dyn Connection, limit: u64) -> Result<()>;

    /// Close hook: forget everything about the connection.
    fn release(&self, id: ConnectionId);
}

/// Coerce outbound data to text.
///
/// Strings pass through, numbers are rendered in decimal, `true` becomes
/// `"1"`, `false` and `null` become empty. Arrays and objects are rejected.
pub fn coerce_payload(data: &Value) -> Result<String> {
    match data {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) | Value::Null => Ok(String::new()),
        Value::Array(_) => Err(ConnLimitError::InvalidPayload("array".to_string())),
        Value::Object(_) => Err(ConnLimitError::InvalidPayload("object".to_string())),
    }
}
