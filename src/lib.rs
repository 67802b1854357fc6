pub mod config;
pub mod socket;

// 公開API
pub use config::{Role, SocketConfig};
pub use socket::{
    handler_fn, Connection, CorrelationTable, FrameAssembler, Message, MsgHandler, MsgType,
    SocketError, SocketResult, Transport,
};
