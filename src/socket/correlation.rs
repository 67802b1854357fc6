use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::error::{SocketError, SocketResult};
use super::message::Message;

type Waiter = oneshot::Sender<SocketResult<Message>>;

struct PendingEntry {
    request: Message,
    waiter: Waiter,
    // 同じcmdIdxの再登録を区別する
    ticket: u64,
}

#[derive(Default)]
struct TableState {
    pending: HashMap<String, PendingEntry>,
    closed: bool,
}

/// Completion handle returned by [`CorrelationTable::register_pending`]
#[derive(Debug)]
pub struct PendingHandle {
    cmd_idx: String,
    ticket: u64,
    receiver: oneshot::Receiver<SocketResult<Message>>,
}

impl PendingHandle {
    pub fn cmd_idx(&self) -> &str {
        &self.cmd_idx
    }
}

/// In-flight outbound requests of one connection, keyed by `cmdIdx`.
///
/// Insert, match and removal all happen under one lock. The matched response
/// travels to the waiter through a one-shot channel, so it is delivered to
/// exactly one caller and the table keeps no reference to it.
pub struct CorrelationTable {
    state: Mutex<TableState>,
    max_pending: usize,
    next_ticket: AtomicU64,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CorrelationTable {
    /// `max_pending == 0` means unbounded
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            max_pending,
            next_ticket: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // パニックをまたぐ不変条件はないので、そのまま使い続ける
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an outbound request and hand back the handle to wait on.
    pub fn register_pending(&self, request: &Message) -> SocketResult<PendingHandle> {
        let mut state = self.lock();
        if state.closed {
            return Err(SocketError::ConnectionClosed);
        }
        if state.pending.contains_key(&request.cmd_idx) {
            return Err(SocketError::DuplicateCorrelationId(request.cmd_idx.clone()));
        }
        if self.max_pending > 0 && state.pending.len() >= self.max_pending {
            log::warn!(
                "Refusing request {}: {} requests already pending",
                request.cmd_idx,
                state.pending.len()
            );
            return Err(SocketError::TooManyPending(state.pending.len()));
        }

        let (waiter, receiver) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        state.pending.insert(
            request.cmd_idx.clone(),
            PendingEntry {
                request: request.clone(),
                waiter,
                ticket,
            },
        );
        log::trace!("Registered pending request {} ({} in flight)", request.cmd_idx, state.pending.len());

        Ok(PendingHandle {
            cmd_idx: request.cmd_idx.clone(),
            ticket,
            receiver,
        })
    }

    /// Match a response to its pending request.
    ///
    /// Returns false when nothing is pending under the response's `cmdIdx`
    /// (late, duplicate or unknown); the response is then dropped.
    pub fn resolve(&self, response: Message) -> bool {
        let entry = self.lock().pending.remove(&response.cmd_idx);
        match entry {
            Some(entry) => {
                log::trace!(
                    "Matched response {} to request event={}",
                    response.cmd_idx,
                    entry.request.event_name
                );
                if entry.waiter.send(Ok(response)).is_err() {
                    log::debug!("Waiter for request gone before its response arrived");
                }
                true
            }
            None => {
                log::warn!("{}", SocketError::UnmatchedResponse(response.cmd_idx.clone()));
                false
            }
        }
    }

    /// Drop a pending entry without resolving it
    pub fn cancel(&self, cmd_idx: &str) -> bool {
        self.lock().pending.remove(cmd_idx).is_some()
    }

    // `ticket`の登録が残っている場合だけ削除する
    fn cancel_ticket(&self, cmd_idx: &str, ticket: u64) -> bool {
        let mut state = self.lock();
        match state.pending.get(cmd_idx) {
            Some(entry) if entry.ticket == ticket => state.pending.remove(cmd_idx).is_some(),
            _ => false,
        }
    }

    /// Release every waiter with `ConnectionClosed` and refuse new entries.
    pub fn close_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            log::debug!("Failing pending request {}: connection closed", entry.request.cmd_idx);
            let _ = entry.waiter.send(Err(SocketError::ConnectionClosed));
        }
        count
    }

    /// Wait for the response matched to `handle`, at most `timeout`.
    ///
    /// The entry is removed on timeout, and also if the returned future is
    /// dropped before completion, so a late response is reported unmatched.
    pub async fn await_response(&self, handle: PendingHandle, timeout: Duration) -> SocketResult<Message> {
        let _guard = self.guard(&handle);
        let PendingHandle {
            cmd_idx,
            ticket,
            mut receiver,
        } = handle;
        let started = Instant::now();

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SocketError::ConnectionClosed),
            Err(_) => {
                if !self.cancel_ticket(&cmd_idx, ticket) {
                    // タイムアウトから削除までの間に応答が届いた
                    if let Ok(result) = receiver.try_recv() {
                        return result;
                    }
                }
                log::debug!("Request {} timed out", cmd_idx);
                Err(SocketError::Timeout {
                    cmd_idx: cmd_idx.clone(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Removes the registration behind `handle` when dropped, unless it was
    /// resolved or cancelled first
    pub(crate) fn guard(&self, handle: &PendingHandle) -> PendingGuard<'_> {
        PendingGuard {
            table: self,
            cmd_idx: handle.cmd_idx.clone(),
            ticket: handle.ticket,
        }
    }

    pub fn contains(&self, cmd_idx: &str) -> bool {
        self.lock().pending.contains_key(cmd_idx)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    cmd_idx: String,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel_ticket(&self.cmd_idx, self.ticket) {
            log::debug!("Removed abandoned pending request {}", self.cmd_idx);
        }
    }
}
