use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::correlation::CorrelationTable;
use super::dispatch::DispatchLoop;
use super::error::{SocketError, SocketResult};
use super::message::{CmdIdxGenerator, Message};
use super::pool::WorkerPool;
use super::transport::{ChunkSource, ReaderSource, StreamTransport, Transport};
use crate::config::SocketConfig;

/// Application handler for inbound requests.
///
/// Invoked concurrently, once per request. Replies go out through the
/// connection, typically with [`Connection::respond`].
#[async_trait]
pub trait MsgHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message, connection: Connection);
}

/// Adapter turning a closure into a [`MsgHandler`]
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MsgHandler for HandlerFn<F>
where
    F: Fn(Message, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message, connection: Connection) {
        (self.0)(message, connection).await
    }
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    table: CorrelationTable,
    ids: CmdIdxGenerator,
    config: SocketConfig,
    shutdown: CancellationToken,
}

/// One peer-to-peer link: send path plus the correlation table the
/// connection's dispatch loop resolves into.
///
/// Cheap to clone; clones share the same table and transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// A connection without a dispatch loop. Responses must be fed in
    /// through a [`DispatchLoop`] built separately.
    pub fn new(transport: Arc<dyn Transport>, config: SocketConfig) -> Self {
        let table = CorrelationTable::new(config.max_pending);
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                table,
                ids: CmdIdxGenerator::new(),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create the connection and start its dispatch loop on a new task.
    pub fn spawn<S, H>(
        transport: Arc<dyn Transport>,
        source: S,
        handler: H,
        config: SocketConfig,
    ) -> (Connection, JoinHandle<()>)
    where
        S: ChunkSource + 'static,
        H: MsgHandler,
    {
        let pool = (config.max_running_handlers > 0).then(|| {
            WorkerPool::with_limits(config.max_running_handlers, config.max_waiting_handlers)
        });
        let connection = Connection::new(transport, config);
        let dispatch = DispatchLoop::new(connection.clone(), Arc::new(handler), pool);
        let handle = tokio::spawn(dispatch.run(source));
        (connection, handle)
    }

    /// Split any duplex byte stream into the transport adapters and spawn.
    pub fn from_stream<T, H>(stream: T, handler: H, config: SocketConfig) -> (Connection, JoinHandle<()>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        H: MsgHandler,
    {
        let (reader, writer) = tokio::io::split(stream);
        let source = ReaderSource::with_capacity(reader, config.read_buffer_size);
        Self::spawn(Arc::new(StreamTransport::new(writer)), source, handler, config)
    }

    pub fn from_tcp<H>(stream: TcpStream, handler: H, config: SocketConfig) -> (Connection, JoinHandle<()>)
    where
        H: MsgHandler,
    {
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }
        match stream.peer_addr() {
            Ok(addr) => log::debug!("Connection established with {}", addr),
            Err(e) => log::debug!("Connection established (peer address unknown: {})", e),
        }
        let (reader, writer) = stream.into_split();
        let source = ReaderSource::with_capacity(reader, config.read_buffer_size);
        Self::spawn(Arc::new(StreamTransport::new(writer)), source, handler, config)
    }

    /// Send without waiting for a reply
    pub async fn send(&self, message: &Message) -> SocketResult<()> {
        if self.is_closed() {
            return Err(SocketError::ConnectionClosed);
        }
        let bytes = message.encode()?;
        log::trace!("Sending message: {}", message);
        self.inner.transport.write(&bytes).await.map_err(|e| {
            log::error!("Failed to send message {} ({}): {}", message.cmd_idx, message.event_name, e);
            SocketError::WriteFailure(e)
        })
    }

    /// Send a request and wait up to `timeout` for the response carrying
    /// the same `cmdIdx`. An empty `cmdIdx` is filled in from the
    /// connection's generator.
    pub async fn send_request(&self, mut message: Message, timeout: Duration) -> SocketResult<Message> {
        if !message.is_request() {
            return Err(SocketError::NotARequest(message.msg_type));
        }
        if message.cmd_idx.is_empty() {
            message.cmd_idx = self.inner.ids.next_id();
        }

        let table = &self.inner.table;
        let handle = table.register_pending(&message)?;
        // 書き込み失敗時や途中でfutureが破棄された場合に登録を解除する
        let _guard = table.guard(&handle);

        log::debug!("Sending request {} (event: {})", message.cmd_idx, message.event_name);
        self.send(&message).await?;

        let response = table.await_response(handle, timeout).await?;
        log::trace!("Received response for {}: {}", message.cmd_idx, response);
        Ok(response)
    }

    /// Build and send a request of this peer's role, using the configured
    /// default timeout when `timeout` is `None`.
    pub async fn request(
        &self,
        event_name: &str,
        content: impl Into<String>,
        timeout: Option<Duration>,
    ) -> SocketResult<Message> {
        let message = Message::new(self.inner.config.role.request_type(), event_name, content);
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        self.send_request(message, timeout).await
    }

    /// Reply to an inbound request
    pub async fn respond(&self, request: &Message, code: i32, content: impl Into<String>) -> SocketResult<()> {
        let mut response = request
            .new_response(code)
            .ok_or_else(|| SocketError::NotARequest(request.msg_type.clone()))?;
        response.content = content.into();
        self.send(&response).await
    }

    /// Stop the dispatch loop and fail every pending request with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let failed = self.inner.table.close_all();
        if failed > 0 {
            log::debug!("Connection closed with {} pending requests", failed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled() || self.inner.table.is_closed()
    }

    /// `cmdIdx` values still waiting for a response
    pub fn pending_requests(&self) -> Vec<String> {
        self.inner.table.pending_ids()
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn table(&self) -> &CorrelationTable {
        &self.inner.table
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::message::MsgType;
    use crate::socket::transport::ChannelTransport;
    use tokio::sync::mpsc;

    struct NoopHandler;

    #[async_trait]
    impl MsgHandler for NoopHandler {
        async fn handle(&self, _message: Message, _connection: Connection) {}
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn write(&self, _bytes: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
        }
    }

    fn channel_connection() -> (Connection, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Arc::new(ChannelTransport::new(tx)), SocketConfig::default());
        (connection, rx)
    }

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let (connection, mut rx) = channel_connection();
        let message = Message::new(MsgType::ServerResponse, "ping", "ok").with_cmd_idx("1");

        connection.send(&message).await.unwrap();

        let bytes = rx.recv().await.unwrap();
        assert!(bytes.ends_with(b"\r\n"));
        assert_eq!(Message::decode(&bytes[..bytes.len() - 2]).unwrap(), message);
        assert!(connection.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_send_request_rejects_non_request() {
        let (connection, _rx) = channel_connection();
        let message = Message::new(MsgType::ClientResponse, "ping", "");

        let result = connection.send_request(message, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SocketError::NotARequest(_))));
    }

    #[tokio::test]
    async fn test_send_request_assigns_cmd_idx() {
        let (connection, mut rx) = channel_connection();
        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request("ping", "", Some(Duration::from_secs(5))).await })
        };

        let bytes = rx.recv().await.unwrap();
        let sent = Message::decode(&bytes[..bytes.len() - 2]).unwrap();
        assert_eq!(sent.msg_type, "ClientRequest");
        assert!(!sent.cmd_idx.is_empty());
        assert_eq!(connection.pending_requests(), vec![sent.cmd_idx.clone()]);

        assert!(connection.table().resolve(sent.new_response(0).unwrap()));
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.cmd_idx, sent.cmd_idx);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_pending_entry() {
        let connection = Connection::new(Arc::new(FailingTransport), SocketConfig::default());
        let message = Message::new(MsgType::ClientRequest, "ping", "").with_cmd_idx("w1");

        let result = connection.send_request(message, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SocketError::WriteFailure(_))));
        assert!(connection.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_sends() {
        let (connection, _rx) = channel_connection();
        connection.close();

        assert!(connection.is_closed());
        let message = Message::new(MsgType::ClientRequest, "ping", "").with_cmd_idx("c1");
        assert!(matches!(
            connection.send_request(message.clone(), Duration::from_millis(10)).await,
            Err(SocketError::ConnectionClosed)
        ));
        assert!(matches!(connection.send(&message).await, Err(SocketError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_respond_requires_request() {
        let (connection, _rx) = channel_connection();
        let response = Message::new(MsgType::ServerResponse, "ping", "");
        assert!(matches!(
            connection.respond(&response, 0, "").await,
            Err(SocketError::NotARequest(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_with_closed_source_ends_loop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (source_tx, source_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        drop(source_tx);

        let (connection, handle) = Connection::spawn(
            Arc::new(ChannelTransport::new(tx)),
            source_rx,
            NoopHandler,
            SocketConfig::default(),
        );
        handle.await.unwrap();
        assert!(connection.is_closed());
    }
}
