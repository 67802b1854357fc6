//! Connection settings.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "role": "server", "request_timeout_ms": 5000, "max_running_handlers": 16 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::socket::error::{SocketError, SocketResult};
use crate::socket::frame::DEFAULT_MAX_FRAME_LEN;
use crate::socket::message::MsgType;
use crate::socket::pool;
use crate::socket::transport::DEFAULT_READ_BUFFER;

/// Which side of the connection this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl Role {
    /// `msgType` of the requests this peer issues
    pub fn request_type(&self) -> MsgType {
        match self {
            Role::Client => MsgType::ClientRequest,
            Role::Server => MsgType::ServerRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub role: Role,

    /// Default wait for `Connection::request`
    pub request_timeout_ms: u64,

    /// Cap on concurrently pending outbound requests, 0 for no cap
    pub max_pending: usize,

    /// Largest frame accepted before the buffer is discarded
    pub max_frame_len: usize,

    pub read_buffer_size: usize,

    /// Handlers running at once; 0 spawns one task per request with no cap
    pub max_running_handlers: usize,

    /// Requests queued behind running handlers before new ones are rejected
    pub max_waiting_handlers: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        let (max_running_handlers, max_waiting_handlers) = pool::default_limits();
        Self {
            role: Role::Client,
            request_timeout_ms: 30_000,
            max_pending: 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER,
            max_running_handlers,
            max_waiting_handlers,
        }
    }
}

impl SocketConfig {
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> SocketResult<Self> {
        let config: SocketConfig = serde_json::from_str(json)
            .map_err(|e| SocketError::Config(format!("JSON parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SocketResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SocketError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded socket config from {}", path.display());
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> SocketResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(SocketError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.max_frame_len == 0 {
            return Err(SocketError::Config("max_frame_len must be positive".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(SocketError::Config("read_buffer_size must be positive".to_string()));
        }
        if self.max_running_handlers > 0 && self.max_waiting_handlers == 0 {
            return Err(SocketError::Config(
                "max_waiting_handlers must be positive when handlers are bounded".to_string(),
            ));
        }
        Ok(())
    }
}
