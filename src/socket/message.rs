use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::SocketResult;
use super::frame::FRAME_DELIMITER;

/// Direction and kind of a message.
///
/// The wire field is a free string; these are the four values peers are
/// expected to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    ClientRequest,
    ServerRequest,
    ClientResponse,
    ServerResponse,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::ClientRequest => "ClientRequest",
            MsgType::ServerRequest => "ServerRequest",
            MsgType::ClientResponse => "ClientResponse",
            MsgType::ServerResponse => "ServerResponse",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MsgType::ClientRequest | MsgType::ServerRequest)
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// The type a reply to this message carries, if it is a request
    pub fn response_type(&self) -> Option<MsgType> {
        match self {
            MsgType::ClientRequest => Some(MsgType::ServerResponse),
            MsgType::ServerRequest => Some(MsgType::ClientResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MsgType> for String {
    fn from(msg_type: MsgType) -> Self {
        msg_type.as_str().to_string()
    }
}

/// The unit of communication on a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Application-level topic or command name
    pub event_name: String,

    /// One of the [`MsgType`] strings
    pub msg_type: String,

    /// Correlation id linking a request to its response
    pub cmd_idx: String,

    /// Status code, meaningful on responses only
    pub code: i32,

    /// Application payload, commonly JSON itself
    pub content: String,

    /// Routing hint, not interpreted by this layer
    pub target_id: String,
}

impl Message {
    pub fn new(
        msg_type: impl Into<String>,
        event_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            msg_type: msg_type.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_cmd_idx(mut self, cmd_idx: impl Into<String>) -> Self {
        self.cmd_idx = cmd_idx.into();
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = target_id.into();
        self
    }

    pub fn is_request(&self) -> bool {
        self.msg_type.contains("Request")
    }

    pub fn is_response(&self) -> bool {
        self.msg_type.contains("Response")
    }

    /// Build the reply to this request.
    ///
    /// Returns `None` when this message is not a request.
    pub fn new_response(&self, code: i32) -> Option<Message> {
        if !self.is_request() {
            return None;
        }
        let msg_type = if self.msg_type.starts_with("Client") {
            MsgType::ServerResponse
        } else {
            MsgType::ClientResponse
        };
        Some(Message {
            event_name: self.event_name.clone(),
            msg_type: msg_type.into(),
            cmd_idx: self.cmd_idx.clone(),
            code,
            content: String::new(),
            target_id: self.target_id.clone(),
        })
    }

    /// Content body used for failure replies: `{"code":..,"errMsg":..}`
    pub fn error_content(code: i32, err_msg: &str) -> String {
        serde_json::json!({ "code": code, "errMsg": err_msg }).to_string()
    }

    /// Serialize to one frame, delimiter included
    pub fn encode(&self) -> SocketResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.extend_from_slice(FRAME_DELIMITER);
        Ok(bytes)
    }

    /// Parse one frame body (delimiter already stripped)
    pub fn decode(frame: &[u8]) -> SocketResult<Message> {
        Ok(serde_json::from_slice(frame)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Ok(()),
        }
    }
}

/// Produces correlation ids unique for the life of one connection.
///
/// Ids are `<unix-nanos>-<counter>`; the counter keeps ids distinct when
/// several callers issue requests within the same clock tick.
#[derive(Debug, Default)]
pub struct CmdIdxGenerator {
    counter: AtomicU64,
}

impl CmdIdxGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}-{}", nanos, seq)
    }
}
