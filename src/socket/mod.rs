//! Request/response correlation over a byte stream.
//!
//! Peers exchange `\r\n`-terminated JSON messages. Either side may send a
//! fire-and-forget message or a request that waits for the response carrying
//! the same `cmdIdx`, while its dispatch loop hands inbound requests to the
//! application handler.
//!
//! ## Main components
//!
//! - [`message`]: the wire message and its codec
//! - [`frame`]: frame reassembly from arbitrary chunks
//! - [`correlation`]: pending request table
//! - [`dispatch`]: per-connection read loop
//! - [`connection`]: caller-facing send API
//!
//! ## Example
//!
//! ```rust,no_run
//! use linkwire::config::SocketConfig;
//! use linkwire::socket::{handler_fn, Connection, Message};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7878").await?;
//! let handler = handler_fn(|message: Message, connection: Connection| async move {
//!     let _ = connection.respond(&message, 0, "ok").await;
//! });
//! let (connection, _loop_handle) = Connection::from_tcp(stream, handler, SocketConfig::default());
//!
//! let response = connection.request("ping", "", None).await?;
//! println!("code={}", response.code);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod pool;
pub mod transport;

pub use connection::{handler_fn, Connection, HandlerFn, MsgHandler};
pub use correlation::{CorrelationTable, PendingHandle};
pub use dispatch::DispatchLoop;
pub use error::{SocketError, SocketResult};
pub use frame::FrameAssembler;
pub use message::{CmdIdxGenerator, Message, MsgType};
pub use pool::WorkerPool;
pub use transport::{ChannelTransport, ChunkSource, ReaderSource, StreamTransport, Transport};
