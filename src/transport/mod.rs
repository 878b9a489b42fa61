pub mod link;
pub mod process;

pub use link::{connect, Connection};
pub use process::HostProcess;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{CorrelationId, Request, Response};

type Completion = oneshot::Sender<BridgeResult<Value>>;

struct PendingRecord {
    name: String,
    completion: Completion,
}

struct PendingTable {
    calls: HashMap<CorrelationId, PendingRecord>,
    /// `None` once the channel has been torn down.
    outbound: Option<mpsc::UnboundedSender<Request>>,
}

/// Untrusted-side end of the request/response channel.
///
/// `send` parks a one-shot completion under a fresh correlation id and queues the
/// request for the link's writer; `deliver` completes it when the matching response
/// comes back. `close` discharges everything still pending with `ChannelClosed`.
pub struct ChannelTransport {
    id: Uuid,
    next_id: AtomicU64,
    table: Mutex<PendingTable>,
}

impl ChannelTransport {
    /// Create a transport plus the queue of requests it wants transmitted.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: Uuid::new_v4(),
            next_id: AtomicU64::new(1),
            table: Mutex::new(PendingTable {
                calls: HashMap::new(),
                outbound: Some(tx),
            }),
        });
        (transport, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a call and return immediately with a future for its outcome.
    pub fn send(&self, name: &str, args: Value) -> PendingCall {
        let mut table = self.table();
        let Some(outbound) = table.outbound.clone() else {
            return PendingCall::ready(Err(BridgeError::ChannelClosed));
        };

        let correlation_id = self.mint_id(&table.calls);
        let (completion, rx) = oneshot::channel();
        table.calls.insert(
            correlation_id,
            PendingRecord {
                name: name.to_string(),
                completion,
            },
        );

        let request = Request {
            correlation_id,
            name: name.to_string(),
            args,
        };
        if outbound.send(request).is_err() {
            table.calls.remove(&correlation_id);
            return PendingCall::ready(Err(BridgeError::ChannelClosed));
        }

        log::debug!(
            "[channel {}] sent '{}' as #{}",
            self.id,
            name,
            correlation_id
        );
        PendingCall::waiting(correlation_id, rx)
    }

    /// Next id not currently in flight. Skips over live ids if the counter wraps.
    fn mint_id(&self, in_flight: &HashMap<CorrelationId, PendingRecord>) -> CorrelationId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !in_flight.contains_key(&id) {
                return id;
            }
        }
    }

    /// Complete the call matching `response`. Returns `false` for unknown ids.
    pub fn deliver(&self, response: Response) -> bool {
        let record = self.table().calls.remove(&response.correlation_id);
        let Some(record) = record else {
            log::warn!(
                "[channel {}] dropping response for unknown call #{}",
                self.id,
                response.correlation_id
            );
            return false;
        };

        let result = response
            .outcome
            .map_err(|e| e.into_bridge_error(&record.name));
        if record.completion.send(result).is_err() {
            log::debug!(
                "[channel {}] caller abandoned '{}' #{} before it completed",
                self.id,
                record.name,
                response.correlation_id
            );
        }
        true
    }

    /// Fail a single call without a response, e.g. when its request could not be framed.
    pub(crate) fn reject(&self, correlation_id: CorrelationId, err: BridgeError) {
        if let Some(record) = self.table().calls.remove(&correlation_id) {
            let _ = record.completion.send(Err(err));
        }
    }

    /// Tear the channel down. Every pending call is rejected with `ChannelClosed`
    /// exactly once and later sends fail immediately. Returns how many were rejected.
    pub fn close(&self) -> usize {
        let (drained, was_open) = {
            let mut table = self.table();
            let was_open = table.outbound.take().is_some();
            (std::mem::take(&mut table.calls), was_open)
        };

        let count = drained.len();
        for (_, record) in drained {
            let _ = record.completion.send(Err(BridgeError::ChannelClosed));
        }
        if was_open {
            log::info!(
                "[channel {}] closed, {} pending call(s) rejected",
                self.id,
                count
            );
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.table().outbound.is_none()
    }

    pub fn pending_count(&self) -> usize {
        self.table().calls.len()
    }
}

enum CallState {
    Ready(Option<BridgeResult<Value>>),
    Waiting {
        correlation_id: CorrelationId,
        rx: oneshot::Receiver<BridgeResult<Value>>,
    },
}

/// Outcome of a call that has been handed to the transport.
///
/// Dropping it abandons the call; a response that arrives later is discarded.
#[must_use = "a call's outcome is only observable by awaiting it"]
pub struct PendingCall {
    state: CallState,
}

impl PendingCall {
    pub(crate) fn ready(result: BridgeResult<Value>) -> Self {
        Self {
            state: CallState::Ready(Some(result)),
        }
    }

    fn waiting(correlation_id: CorrelationId, rx: oneshot::Receiver<BridgeResult<Value>>) -> Self {
        Self {
            state: CallState::Waiting { correlation_id, rx },
        }
    }

    /// `None` if the call was rejected before it reached the channel.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match &self.state {
            CallState::Waiting { correlation_id, .. } => Some(*correlation_id),
            CallState::Ready(_) => None,
        }
    }
}

impl Future for PendingCall {
    type Output = BridgeResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let received = match &mut this.state {
            CallState::Ready(result) => {
                return Poll::Ready(result.take().unwrap_or_else(|| {
                    Err(BridgeError::Protocol("call polled after completion".into()))
                }));
            }
            CallState::Waiting { rx, .. } => ready!(Pin::new(rx).poll(cx)),
        };
        // The receiver must not be polled again once it has yielded.
        this.state = CallState::Ready(None);
        Poll::Ready(received.unwrap_or(Err(BridgeError::ChannelClosed)))
    }
}
