//! Per-connection read loop.
//!
//! Frames are classified one at a time in arrival order. Responses resolve
//! pending requests in place; requests are handed to a separate task (or the
//! worker pool) so a slow handler never holds up the responses other callers
//! are waiting for.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::connection::{Connection, MsgHandler};
use super::frame::FrameAssembler;
use super::message::Message;
use super::pool::WorkerPool;
use super::transport::ChunkSource;

/// Code sent back when a request is refused because the handler pool is full
pub const BUSY_CODE: i32 = 1;

/// Busy replies waiting to be written before further ones are dropped
pub const BUSY_REPLY_QUEUE: usize = 64;

/// Upper bound on shutting down the transport once the loop stops
pub const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const LOG_PREVIEW_LEN: usize = 256;

pub struct DispatchLoop {
    connection: Connection,
    handler: Arc<dyn MsgHandler>,
    pool: Option<WorkerPool>,
    assembler: FrameAssembler,
}

impl DispatchLoop {
    /// With `pool == None` every inbound request gets its own task.
    pub fn new(connection: Connection, handler: Arc<dyn MsgHandler>, pool: Option<WorkerPool>) -> Self {
        let assembler = FrameAssembler::new(connection.config().max_frame_len);
        Self {
            connection,
            handler,
            pool,
            assembler,
        }
    }

    /// Run until the source reports the peer closed or the connection is
    /// closed locally. Pending requests are then failed with
    /// `ConnectionClosed`.
    pub async fn run<S: ChunkSource>(mut self, mut source: S) {
        log::debug!("Dispatch loop started");
        let shutdown = self.connection.shutdown_token();

        // busy応答は単一タスクから書き込む
        let (busy_tx, busy_rx) = mpsc::channel(BUSY_REPLY_QUEUE);
        let replier = tokio::spawn(send_busy_replies(self.connection.clone(), busy_rx));

        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Shutdown requested, stopping dispatch loop");
                    break;
                }
                chunk = source.next_chunk() => chunk,
            };

            let chunk = match chunk {
                Some(chunk) if !chunk.is_empty() => chunk,
                _ => {
                    log::debug!("Connection closed by peer");
                    break;
                }
            };

            for frame in self.assembler.push(&chunk) {
                self.handle_frame(&frame, &busy_tx);
            }
        }

        self.assembler.finish();
        self.connection.close();
        drop(busy_tx);

        // 書き込みが詰まっていると書き込みロックが取れないため上限を設ける
        match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, self.connection.transport().close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Failed to shut down transport: {}", e),
            Err(_) => log::warn!(
                "Transport did not shut down within {:?}, a write is still blocked",
                TRANSPORT_CLOSE_TIMEOUT
            ),
        }
        replier.abort();
        log::debug!("Dispatch loop stopped");
    }

    fn handle_frame(&self, frame: &[u8], busy: &mpsc::Sender<Message>) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to parse message: {} (frame: {})", e, frame_preview(frame));
                return;
            }
        };
        log::trace!("Received message: {}", message);

        if message.is_response() {
            self.connection.table().resolve(message);
        } else if message.is_request() {
            self.dispatch_request(message, busy);
        } else {
            log::warn!(
                "Dropping message with unknown msgType '{}' (cmdIdx: {})",
                message.msg_type,
                message.cmd_idx
            );
        }
    }

    fn dispatch_request(&self, message: Message, busy: &mpsc::Sender<Message>) {
        let handler = self.handler.clone();
        let connection = self.connection.clone();

        let Some(pool) = &self.pool else {
            tokio::spawn(async move { handler.handle(message, connection).await });
            return;
        };

        let request = message.clone();
        if let Err(e) = pool.submit(async move { handler.handle(message, connection).await }) {
            log::warn!("Rejecting request {} (event: {}): {}", request.cmd_idx, request.event_name, e);
            match busy.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    log::warn!("Busy reply queue full, dropping reply for {}", request.cmd_idx);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

async fn send_busy_replies(connection: Connection, mut requests: mpsc::Receiver<Message>) {
    let content = Message::error_content(BUSY_CODE, "server busy");
    while let Some(request) = requests.recv().await {
        if let Err(e) = connection.respond(&request, BUSY_CODE, content.clone()).await {
            log::warn!("Failed to send busy reply for {}: {}", request.cmd_idx, e);
        }
    }
}

// ログ用にフレームの先頭だけを文字列化する
fn frame_preview(frame: &[u8]) -> String {
    if frame.len() <= LOG_PREVIEW_LEN {
        return String::from_utf8_lossy(frame).into_owned();
    }
    format!(
        "{}... ({} bytes)",
        String::from_utf8_lossy(&frame[..LOG_PREVIEW_LEN]),
        frame.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::socket::connection::handler_fn;
    use crate::socket::error::SocketError;
    use crate::socket::message::MsgType;
    use crate::socket::transport::{ChannelTransport, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    struct Harness {
        connection: Connection,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start<H: MsgHandler>(handler: H, config: SocketConfig) -> Harness {
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (connection, inbound, handle) =
            start_with(Arc::new(ChannelTransport::new(out_tx)), handler, config);
        Harness {
            connection,
            inbound,
            outbound,
            handle,
        }
    }

    fn start_with<H: MsgHandler>(
        transport: Arc<dyn Transport>,
        handler: H,
        config: SocketConfig,
    ) -> (Connection, mpsc::UnboundedSender<Vec<u8>>, tokio::task::JoinHandle<()>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (inbound, in_rx) = mpsc::unbounded_channel();
        let (connection, handle) = Connection::spawn(transport, in_rx, handler, config);
        (connection, inbound, handle)
    }

    fn gated_handler(gate: Arc<Notify>) -> impl MsgHandler {
        handler_fn(move |_message: Message, _connection: Connection| {
            let gate = gate.clone();
            async move { gate.notified().await }
        })
    }

    // 書き込みが永久に完了しないトランスポート
    #[derive(Default)]
    struct StalledTransport {
        writes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn write(&self, _bytes: &[u8]) -> std::io::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn frame(message: &Message) -> Vec<u8> {
        message.encode().unwrap()
    }

    fn decode_sent(bytes: &[u8]) -> Message {
        Message::decode(&bytes[..bytes.len() - 2]).unwrap()
    }

    #[tokio::test]
    async fn test_request_dispatched_to_handler() {
        let mut harness = start(
            handler_fn(|message: Message, connection: Connection| async move {
                let _ = connection.respond(&message, 0, "pong").await;
            }),
            SocketConfig::default(),
        );

        let request = Message::new(MsgType::ClientRequest, "ping", "").with_cmd_idx("abc1");
        harness.inbound.send(frame(&request)).unwrap();

        let reply = decode_sent(&harness.outbound.recv().await.unwrap());
        assert_eq!(reply.msg_type, "ServerResponse");
        assert_eq!(reply.cmd_idx, "abc1");
        assert_eq!(reply.content, "pong");
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_responses() {
        let gate = Arc::new(Notify::new());
        let handler_gate = gate.clone();
        let harness = start(
            handler_fn(move |_message: Message, _connection: Connection| {
                let gate = handler_gate.clone();
                async move { gate.notified().await }
            }),
            SocketConfig::default(),
        );

        let waiter = {
            let connection = harness.connection.clone();
            tokio::spawn(async move {
                let request = Message::new(MsgType::ClientRequest, "sync", "").with_cmd_idx("out-1");
                connection.send_request(request, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 止まったままのリクエストの後に、待っている応答が届く
        let stuck = Message::new(MsgType::ServerRequest, "slow", "").with_cmd_idx("in-1");
        let response = Message::new(MsgType::ServerResponse, "sync", "done").with_cmd_idx("out-1");
        let mut bytes = frame(&stuck);
        bytes.extend(frame(&response));
        harness.inbound.send(bytes).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.content, "done");
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_stop_loop() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let harness = start(
            handler_fn(move |message: Message, _connection: Connection| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(message.event_name);
                }
            }),
            SocketConfig::default(),
        );

        harness.inbound.send(b"{not json}\r\n".to_vec()).unwrap();
        let request = Message::new(MsgType::ClientRequest, "after", "").with_cmd_idx("1");
        harness.inbound.send(frame(&request)).unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), "after");
        assert!(!harness.connection.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_msg_type_dropped() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let harness = start(
            handler_fn(move |message: Message, _connection: Connection| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(message.msg_type);
                }
            }),
            SocketConfig::default(),
        );

        let odd = Message::new("Heartbeat", "tick", "").with_cmd_idx("h1");
        let request = Message::new(MsgType::ClientRequest, "real", "").with_cmd_idx("r1");
        harness.inbound.send(frame(&odd)).unwrap();
        harness.inbound.send(frame(&request)).unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), "ClientRequest");
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_requests() {
        let harness = start(
            handler_fn(|_message: Message, _connection: Connection| async {}),
            SocketConfig::default(),
        );

        let waiter = {
            let connection = harness.connection.clone();
            tokio::spawn(async move {
                let request = Message::new(MsgType::ClientRequest, "ping", "").with_cmd_idx("p1");
                connection.send_request(request, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 空のチャンクは切断を意味する
        harness.inbound.send(Vec::new()).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SocketError::ConnectionClosed)));
        harness.handle.await.unwrap();
        assert!(harness.connection.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_stops_loop() {
        let harness = start(
            handler_fn(|_message: Message, _connection: Connection| async {}),
            SocketConfig::default(),
        );

        harness.connection.close();
        tokio::time::timeout(Duration::from_millis(500), harness.handle)
            .await
            .expect("dispatch loop should stop after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_saturated_pool_replies_busy() {
        let gate = Arc::new(Notify::new());
        let config = SocketConfig {
            max_running_handlers: 1,
            max_waiting_handlers: 1,
            ..SocketConfig::default()
        };
        let mut harness = start(gated_handler(gate.clone()), config);

        // w0が実行中、w1が待機中になる
        for i in 0..2 {
            let request = Message::new(MsgType::ClientRequest, "work", "").with_cmd_idx(format!("w{}", i));
            harness.inbound.send(frame(&request)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let request = Message::new(MsgType::ClientRequest, "work", "").with_cmd_idx("w2");
        harness.inbound.send(frame(&request)).unwrap();

        let reply = decode_sent(&harness.outbound.recv().await.unwrap());
        assert_eq!(reply.cmd_idx, "w2");
        assert_eq!(reply.code, BUSY_CODE);
        let content: serde_json::Value = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(content["errMsg"], "server busy");

        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_busy_replies_bounded_when_peer_stalls() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(StalledTransport::default());
        let config = SocketConfig {
            max_running_handlers: 1,
            max_waiting_handlers: 1,
            ..SocketConfig::default()
        };
        let (connection, inbound, handle) = start_with(transport.clone(), gated_handler(gate.clone()), config);

        // 応答を読まない相手から大量のリクエストが届く
        let mut bytes = Vec::new();
        for i in 0..2000 {
            let request = Message::new(MsgType::ClientRequest, "work", "").with_cmd_idx(format!("f{}", i));
            bytes.extend(frame(&request));
        }
        inbound.send(bytes).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 書き込み中のbusy応答は一つだけ
        assert_eq!(transport.writes.load(Ordering::SeqCst), 1);
        assert!(!connection.is_closed());

        connection.close();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("dispatch loop should stop after close")
            .unwrap();
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_close_with_blocked_writer_finishes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (local, mut peer) = tokio::io::duplex(64);
        let handler = handler_fn(|message: Message, connection: Connection| async move {
            // 相手が読まないので書き込みが詰まる
            let _ = connection.respond(&message, 0, "x".repeat(4096)).await;
        });
        let (connection, handle) = Connection::from_stream(local, handler, SocketConfig::default());

        let request = Message::new(MsgType::ClientRequest, "big", "").with_cmd_idx("b1");
        peer.write_all(&frame(&request)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        connection.close();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("dispatch loop should stop even when a write is blocked")
            .unwrap();
        drop(peer);
    }

    #[test]
    fn test_frame_preview_truncates_large_frames() {
        assert_eq!(frame_preview(b"{not json}"), "{not json}");

        let large = vec![b'a'; 10_000];
        let preview = frame_preview(&large);
        assert!(preview.starts_with(&"a".repeat(LOG_PREVIEW_LEN)));
        assert!(preview.ends_with("... (10000 bytes)"));
        assert!(preview.len() < 300);
    }
}
