//! Per-connection state: identity, pending request table, statistics
//! windows, and the typed operations dispatched against the workspace
//! pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use cove_proto::RequestId;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::{CallContext, Pipeline, PipelineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OpCounts {
    pub find_count: u64,
    pub tx_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowCounts {
    pub find_count: f64,
    pub tx_count: f64,
}

/// Request accounting for one session. `total` is monotone, `current`
/// accumulates since the last roll, `mins5` is a weighted window
/// reflecting roughly five minutes of traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: OpCounts,
    pub current: OpCounts,
    pub mins5: WindowCounts,
}

impl SessionStats {
    /// Minute tick: blend `current` into the window and reset it.
    fn roll(&mut self) {
        self.mins5.find_count = 0.8 * self.mins5.find_count + 0.2 * self.current.find_count as f64;
        self.mins5.tx_count = 0.8 * self.mins5.tx_count + 0.2 * self.current.tx_count as f64;
        self.current = OpCounts::default();
    }

    fn wipe(&mut self) {
        *self = SessionStats::default();
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: RequestId,
    pub params: Value,
    pub start: Instant,
}

pub struct Session {
    id: Uuid,
    session_id: String,
    account: String,
    token: String,
    create_time: SystemTime,
    last_request_millis: AtomicU64,
    pipeline: Arc<dyn Pipeline>,
    requests: parking_lot::Mutex<HashMap<RequestId, PendingRequest>>,
    binary_mode: AtomicBool,
    use_compression: AtomicBool,
    use_broadcast: AtomicBool,
    workspace_closed: AtomicBool,
    upgrade_client: bool,
    stats: parking_lot::Mutex<SessionStats>,
}

pub struct SessionOptions {
    pub binary_mode: bool,
    pub use_compression: bool,
    pub use_broadcast: bool,
    pub upgrade_client: bool,
}

impl Session {
    pub fn new(
        session_id: String,
        account: String,
        token: String,
        pipeline: Arc<dyn Pipeline>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            session_id,
            account,
            token,
            create_time: SystemTime::now(),
            last_request_millis: AtomicU64::new(now_millis()),
            pipeline,
            requests: parking_lot::Mutex::new(HashMap::new()),
            binary_mode: AtomicBool::new(options.binary_mode),
            use_compression: AtomicBool::new(options.use_compression),
            use_broadcast: AtomicBool::new(options.use_broadcast),
            workspace_closed: AtomicBool::new(false),
            upgrade_client: options.upgrade_client,
            stats: parking_lot::Mutex::new(SessionStats::default()),
        })
    }

    /// Internal registry id, distinct from the reconnect identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Client-visible identity, matched on reconnect.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn create_time(&self) -> SystemTime {
        self.create_time
    }

    pub fn last_request_millis(&self) -> u64 {
        self.last_request_millis.load(Ordering::Relaxed)
    }

    pub fn binary_mode(&self) -> bool {
        self.binary_mode.load(Ordering::Relaxed)
    }

    pub fn use_compression(&self) -> bool {
        self.use_compression.load(Ordering::Relaxed)
    }

    pub fn use_broadcast(&self) -> bool {
        self.use_broadcast.load(Ordering::Relaxed)
    }

    pub fn is_upgrade_client(&self) -> bool {
        self.upgrade_client
    }

    pub fn workspace_closed(&self) -> bool {
        self.workspace_closed.load(Ordering::Acquire)
    }

    pub fn mark_workspace_closed(&self) {
        self.workspace_closed.store(true, Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    pub fn roll_stats(&self) {
        self.stats.lock().roll();
    }

    pub fn wipe_stats(&self) {
        self.stats.lock().wipe();
    }

    /// Liveness probe; answers with the session's bearer token.
    pub fn ping(&self) -> String {
        self.touch();
        self.token.clone()
    }

    pub async fn find_all(
        &self,
        request_id: Option<RequestId>,
        class: &str,
        query: Value,
        options: Option<Value>,
    ) -> Result<Value, PipelineError> {
        let _pending = self.dispatch(request_id, &query);
        {
            let mut stats = self.stats.lock();
            stats.current.find_count += 1;
            stats.total.find_count += 1;
        }
        self.pipeline
            .find_all(&self.call_context(), class, query, options)
            .await
    }

    pub async fn tx(&self, request_id: Option<RequestId>, tx: Value) -> Result<Value, PipelineError> {
        let _pending = self.dispatch(request_id, &tx);
        {
            let mut stats = self.stats.lock();
            stats.current.tx_count += 1;
            stats.total.tx_count += 1;
        }
        self.pipeline.tx(&self.call_context(), tx).await
    }

    fn call_context(&self) -> CallContext {
        CallContext {
            session: self.id,
            account: self.account.clone(),
        }
    }

    fn touch(&self) {
        self.last_request_millis.store(now_millis(), Ordering::Relaxed);
    }

    /// Record the pending entry and stamp `lastRequest`. The returned
    /// guard removes the entry on completion or cancellation.
    fn dispatch(&self, request_id: Option<RequestId>, params: &Value) -> PendingGuard<'_> {
        self.touch();
        if let Some(id) = &request_id {
            self.requests.lock().insert(
                id.clone(),
                PendingRequest {
                    id: id.clone(),
                    params: params.clone(),
                    start: Instant::now(),
                },
            );
        }
        PendingGuard {
            session: self,
            id: request_id,
        }
    }
}

struct PendingGuard<'a> {
    session: &'a Session,
    id: Option<RequestId>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.session.requests.lock().remove(&id);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
