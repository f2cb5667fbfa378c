//! One bidirectional frame transport.
//!
//! A `ConnectionSocket` owns the outbound side of a client connection: a
//! bounded frame queue drained by a writer task that the front-end wires
//! to the real WebSocket sink. The bounded queue is the primary
//! backpressure point; a slow reader suspends its senders instead of
//! growing memory.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use cove_proto::{encode_response, Response, WireFrame};
use metrics::histogram;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::GatewayError;

/// Outbound queue depth, in frames.
pub const OUTBOUND_DEPTH: usize = 64;

/// Residual bytes the writer tolerates in the sink before forcing a
/// flush.
pub const FLUSH_THRESHOLD: usize = 128;

pub const CLOSE_CODE_NORMAL: u16 = 1000;
pub const CLOSE_CODE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_CODE_EVICTED: u16 = 4409;
pub const CLOSE_CODE_UPGRADE: u16 = 4501;
pub const CLOSE_CODE_SHUTDOWN: u16 = 4502;

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;
const STATUS_FAILED: u8 = 2;

/// Metadata captured at handshake, immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct ConnectionData {
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub account_email: String,
    pub mode: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

pub struct ConnectionSocket {
    id: Uuid,
    data: ConnectionData,
    status: AtomicU8,
    outbound: mpsc::Sender<WireFrame>,
    close_signal: Notify,
    close_reason: parking_lot::Mutex<Option<CloseReason>>,
}

impl ConnectionSocket {
    /// Returns the socket and the receiving end of its outbound queue;
    /// the caller owns draining the receiver into the transport.
    pub fn new(data: ConnectionData) -> (Arc<Self>, mpsc::Receiver<WireFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let socket = Arc::new(Self {
            id: Uuid::new_v4(),
            data,
            status: AtomicU8::new(STATUS_OPEN),
            outbound: tx,
            close_signal: Notify::new(),
            close_reason: parking_lot::Mutex::new(None),
        });
        (socket, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    pub fn is_closed(&self) -> bool {
        self.status.load(Ordering::Acquire) != STATUS_OPEN
    }

    /// Serialise and enqueue one response, honoring the session's binary
    /// and compression flags. Returns the serialised byte count, or 0
    /// when the socket is already closed. Suspends while the outbound
    /// queue is full.
    pub async fn send(
        &self,
        response: &Response,
        binary: bool,
        compress: bool,
    ) -> Result<usize, GatewayError> {
        match self.status.load(Ordering::Acquire) {
            STATUS_CLOSED => return Ok(0),
            STATUS_FAILED => {
                return Err(GatewayError::Transport("socket write failed".into()));
            }
            _ => {}
        }

        let frame = encode_response(response, binary, compress)
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        let written = frame.len();
        histogram!("cove_gateway_send_data_bytes", written as f64);

        if self.outbound.send(frame).await.is_err() {
            // Writer is gone; a concurrent close resolves pending sends
            // to zero, a write failure surfaces as an error.
            return match self.status.load(Ordering::Acquire) {
                STATUS_FAILED => Err(GatewayError::Transport("socket write failed".into())),
                _ => Ok(0),
            };
        }
        Ok(written)
    }

    /// Mark the socket closed and wake the writer so it emits a Close
    /// frame and exits. Idempotent; the first reason wins.
    pub fn close(&self, code: u16, reason: &str) {
        if self
            .status
            .compare_exchange(STATUS_OPEN, STATUS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.close_reason.lock() = Some(CloseReason {
                code,
                reason: reason.to_string(),
            });
            self.close_signal.notify_waiters();
        }
    }

    /// Recorded by the writer when the underlying transport reports a
    /// write error; subsequent sends fail instead of resolving to zero.
    pub fn mark_failed(&self) {
        self.status.store(STATUS_FAILED, Ordering::Release);
        self.close_signal.notify_waiters();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Resolves once `close` or `mark_failed` has been called.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_proto::RequestId;
    use serde_json::json;

    fn response() -> Response {
        Response::result(Some(RequestId::Number(1)), json!({ "ok": true }))
    }

    #[tokio::test]
    async fn send_reports_serialised_length() {
        let (socket, mut rx) = ConnectionSocket::new(ConnectionData::default());
        let written = socket.send(&response(), false, false).await.expect("send");
        let frame = rx.recv().await.expect("frame");
        assert_eq!(written, frame.len());
        assert!(written > 0);
    }

    #[tokio::test]
    async fn closed_socket_resolves_sends_to_zero() {
        let (socket, _rx) = ConnectionSocket::new(ConnectionData::default());
        socket.close(CLOSE_CODE_NORMAL, "bye");
        assert_eq!(socket.send(&response(), false, false).await.expect("send"), 0);
        assert_eq!(
            socket.close_reason(),
            Some(CloseReason {
                code: CLOSE_CODE_NORMAL,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn failed_socket_surfaces_transport_error() {
        let (socket, _rx) = ConnectionSocket::new(ConnectionData::default());
        socket.mark_failed();
        assert!(socket.send(&response(), false, false).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_suspends_until_drained() {
        let (socket, mut rx) = ConnectionSocket::new(ConnectionData::default());
        for _ in 0..OUTBOUND_DEPTH {
            socket.send(&response(), false, false).await.expect("fill");
        }

        let blocked = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.send(&response(), false, false).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        rx.recv().await.expect("drain one");
        let written = blocked.await.expect("join").expect("send");
        assert!(written > 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_first_reason_wins() {
        let (socket, _rx) = ConnectionSocket::new(ConnectionData::default());
        socket.close(CLOSE_CODE_UPGRADE, "upgrade");
        socket.close(CLOSE_CODE_SHUTDOWN, "shutdown");
        assert_eq!(socket.close_reason().unwrap().code, CLOSE_CODE_UPGRADE);
    }
}
