//! Seam to the per-workspace domain engine.
//!
//! The pipeline is an external collaborator: the gateway instantiates one
//! per workspace through a [`PipelineFactory`], forwards `findAll` and
//! `tx` calls to it, and relays the change notifications it emits back to
//! attached peers. Nothing in here interprets domain payloads.

use std::sync::Arc;

use async_trait::async_trait;
use cove_proto::Response;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::token::WorkspaceId;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("pipeline boot failed: {0}")]
    Boot(String),
    /// The factory refused to boot the current workspace format; clients
    /// are told to come back through the upgrade path.
    #[error("workspace requires an upgrade")]
    UpgradeRequired,
    /// Domain failure, passed through to the caller verbatim.
    #[error("{0}")]
    Domain(String),
}

/// Identifies the session behind a pipeline call, so emitted broadcasts
/// can exclude their originator.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session: Uuid,
    pub account: String,
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn find_all(
        &self,
        ctx: &CallContext,
        class: &str,
        query: Value,
        options: Option<Value>,
    ) -> Result<Value, PipelineError>;

    async fn tx(&self, ctx: &CallContext, tx: Value) -> Result<Value, PipelineError>;

    /// Terminate the engine. Called once, during workspace teardown.
    async fn close(&self);
}

/// Change notification emitted by a pipeline, addressed to the sessions
/// of one workspace.
#[derive(Debug)]
pub struct BroadcastEvent {
    /// Internal id of the originating session, excluded from delivery.
    pub from: Option<Uuid>,
    pub workspace_key: String,
    pub response: Response,
    /// When set, only sessions of these accounts receive the event.
    pub target: Option<Vec<String>>,
}

/// Handed to each pipeline at construction; emitting is fire-and-forget,
/// delivery runs on the manager's broadcast task.
#[derive(Clone)]
pub struct BroadcastHandle {
    workspace_key: String,
    tx: mpsc::UnboundedSender<BroadcastEvent>,
}

impl BroadcastHandle {
    pub fn new(workspace_key: String, tx: mpsc::UnboundedSender<BroadcastEvent>) -> Self {
        Self { workspace_key, tx }
    }

    pub fn emit(&self, from: Option<Uuid>, response: Response, target: Option<Vec<String>>) {
        let _ = self.tx.send(BroadcastEvent {
            from,
            workspace_key: self.workspace_key.clone(),
            response,
            target,
        });
    }
}

/// Constructs the engine for one workspace. Invoked at most once per
/// workspace instance; the result is shared by every attached session.
pub type PipelineFactory = Arc<
    dyn Fn(WorkspaceId, bool, BroadcastHandle) -> BoxFuture<'static, Result<Arc<dyn Pipeline>, PipelineError>>
        + Send
        + Sync,
>;

/// In-memory engine used by the standalone binary and the test suite.
/// Reads return the documents accumulated by prior transactions; every
/// committed transaction is relayed to workspace peers.
pub struct EchoPipeline {
    broadcasts: BroadcastHandle,
    committed: parking_lot::Mutex<Vec<Value>>,
}

impl EchoPipeline {
    pub fn factory() -> PipelineFactory {
        Arc::new(|_workspace, _upgrade, broadcasts| {
            Box::pin(async move {
                let pipeline: Arc<dyn Pipeline> = Arc::new(EchoPipeline {
                    broadcasts,
                    committed: parking_lot::Mutex::new(Vec::new()),
                });
                Ok(pipeline)
            })
        })
    }
}

#[async_trait]
impl Pipeline for EchoPipeline {
    async fn find_all(
        &self,
        _ctx: &CallContext,
        class: &str,
        _query: Value,
        _options: Option<Value>,
    ) -> Result<Value, PipelineError> {
        let committed = self.committed.lock();
        let matching: Vec<Value> = committed
            .iter()
            .filter(|doc| doc.get("class").and_then(Value::as_str) == Some(class))
            .cloned()
            .collect();
        Ok(Value::Array(matching))
    }

    async fn tx(&self, ctx: &CallContext, tx: Value) -> Result<Value, PipelineError> {
        self.committed.lock().push(tx.clone());
        self.broadcasts.emit(
            Some(ctx.session),
            Response::result(None, json!({ "tx": tx })),
            None,
        );
        Ok(json!({ "ok": true }))
    }

    async fn close(&self) {}
}
