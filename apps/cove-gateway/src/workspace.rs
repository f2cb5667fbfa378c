//! Per-workspace aggregate. Mostly a passive record: the behavior lives
//! in the session manager, which guards the mutable state here with its
//! own locking discipline (registry lock first, then workspace state,
//! never held across an await).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::pipeline::{Pipeline, PipelineError};
use crate::session::Session;
use crate::socket::ConnectionSocket;
use crate::token::WorkspaceId;

/// One attached connection: the session and the socket it speaks over.
#[derive(Clone)]
pub struct SessionEntry {
    pub session: Arc<Session>,
    pub socket: Arc<ConnectionSocket>,
}

/// Barrier observed by attach attempts racing a workspace teardown.
pub struct ClosingGate {
    done: AtomicBool,
    notify: Notify,
}

impl ClosingGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn release(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// The pipeline is constructed at most once per workspace instance and
/// may still be pending while sessions queue up to attach.
pub enum PipelineSlot {
    Pending,
    Ready(Arc<dyn Pipeline>),
    Failed(PipelineError),
}

pub struct WorkspaceState {
    pub sessions: HashMap<Uuid, SessionEntry>,
    pub upgrade: bool,
    pub backup: bool,
    pub closing: Option<Arc<ClosingGate>>,
    /// Ticks remaining before an empty workspace is evicted. `None`
    /// while at least one session is attached.
    pub soft_shutdown: Option<u32>,
}

pub struct Workspace {
    id: WorkspaceId,
    key: String,
    pipeline: parking_lot::Mutex<PipelineSlot>,
    pipeline_settled: Notify,
    pub(crate) state: parking_lot::Mutex<WorkspaceState>,
}

impl Workspace {
    pub fn new(id: WorkspaceId) -> Arc<Self> {
        let key = id.key();
        Arc::new(Self {
            id,
            key,
            pipeline: parking_lot::Mutex::new(PipelineSlot::Pending),
            pipeline_settled: Notify::new(),
            state: parking_lot::Mutex::new(WorkspaceState {
                sessions: HashMap::new(),
                upgrade: false,
                backup: false,
                closing: None,
                soft_shutdown: None,
            }),
        })
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Settle the pipeline slot. The factory runs once per workspace, so
    /// a second resolution indicates a bug upstream and is dropped.
    pub fn resolve_pipeline(&self, result: Result<Arc<dyn Pipeline>, PipelineError>) {
        let mut slot = self.pipeline.lock();
        if !matches!(*slot, PipelineSlot::Pending) {
            tracing::warn!(workspace = %self.key, "pipeline resolved twice, ignoring");
            return;
        }
        *slot = match result {
            Ok(pipeline) => PipelineSlot::Ready(pipeline),
            Err(err) => PipelineSlot::Failed(err),
        };
        drop(slot);
        self.pipeline_settled.notify_waiters();
    }

    /// Await the shared pipeline. Concurrent attachers all observe the
    /// single construction result.
    pub async fn pipeline(&self) -> Result<Arc<dyn Pipeline>, PipelineError> {
        loop {
            let settled = self.pipeline_settled.notified();
            match &*self.pipeline.lock() {
                PipelineSlot::Ready(pipeline) => return Ok(Arc::clone(pipeline)),
                PipelineSlot::Failed(err) => return Err(err.clone()),
                PipelineSlot::Pending => {}
            }
            settled.await;
        }
    }

    pub fn pipeline_if_ready(&self) -> Option<Arc<dyn Pipeline>> {
        match &*self.pipeline.lock() {
            PipelineSlot::Ready(pipeline) => Some(Arc::clone(pipeline)),
            _ => None,
        }
    }

    pub fn is_upgrading(&self) -> bool {
        self.state.lock().upgrade
    }

    pub fn closing_gate(&self) -> Option<Arc<ClosingGate>> {
        self.state.lock().closing.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn users(&self) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .values()
            .map(|entry| entry.session.account().to_string())
            .collect()
    }
}
