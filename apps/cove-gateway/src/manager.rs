//! Session and workspace registry coordinator.
//!
//! Two registries are kept mutually consistent under one mutex: the
//! `workspaces` map keyed by canonical workspace key, and a flat
//! `sessions` index keyed by internal session id. The lock is never held
//! across an await; pipeline boots, closing barriers, and socket writes
//! all happen outside it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cove_proto::Response;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::pipeline::{BroadcastEvent, BroadcastHandle, PipelineError, PipelineFactory};
use crate::session::{OpCounts, Session, SessionOptions, SessionStats, WindowCounts};
use crate::socket::{ConnectionSocket, CLOSE_CODE_SHUTDOWN, CLOSE_CODE_UPGRADE};
use crate::token::TokenClaims;
use crate::workspace::{ClosingGate, SessionEntry, Workspace};

pub const DEFAULT_SOFT_SHUTDOWN_TICKS: u32 = 3;

/// Why a workspace is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Upgrade,
    Shutdown,
}

impl CloseCause {
    fn as_str(self) -> &'static str {
        match self {
            CloseCause::Upgrade => "upgrade",
            CloseCause::Shutdown => "shutdown",
        }
    }
}

pub enum AddSessionOutcome {
    Attached {
        session: Arc<Session>,
        workspace: Arc<Workspace>,
    },
    /// The workspace is mid-upgrade and the token lacks the upgrade
    /// role; the front-end sends the payload and closes.
    UpgradeInProgress(Value),
}

#[derive(Clone)]
struct FlatEntry {
    session: Arc<Session>,
    socket: Arc<ConnectionSocket>,
    workspace_key: String,
}

struct Registry {
    workspaces: HashMap<String, Arc<Workspace>>,
    sessions: HashMap<Uuid, FlatEntry>,
}

pub struct ManagerOptions {
    pub accounts_url: String,
    pub soft_shutdown_ticks: u32,
    pub tick_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            accounts_url: String::new(),
            soft_shutdown_ticks: DEFAULT_SOFT_SHUTDOWN_TICKS,
            tick_interval: Duration::from_secs(60),
        }
    }
}

struct ManagerInner {
    registry: parking_lot::Mutex<Registry>,
    factory: PipelineFactory,
    broadcast_tx: mpsc::UnboundedSender<BroadcastEvent>,
    broadcast_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<BroadcastEvent>>>,
    maintenance: parking_lot::Mutex<Option<u32>>,
    options: ManagerOptions,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(factory: PipelineFactory, options: ManagerOptions) -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                registry: parking_lot::Mutex::new(Registry {
                    workspaces: HashMap::new(),
                    sessions: HashMap::new(),
                }),
                factory,
                broadcast_tx,
                broadcast_rx: parking_lot::Mutex::new(Some(broadcast_rx)),
                maintenance: parking_lot::Mutex::new(None),
                options,
            }),
        }
    }

    /// Drain pipeline-emitted change notifications into `broadcast`.
    /// Broadcasts to any one session stay ordered because they all flow
    /// through this single task.
    pub fn spawn_broadcast_pump(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut rx = self
            .inner
            .broadcast_rx
            .lock()
            .take()
            .expect("broadcast pump spawned twice");
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.broadcast(event).await;
            }
        })
    }

    /// Minute ticker: statistics rolls, maintenance countdown, soft
    /// shutdown of empty workspaces.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut interval = tokio::time::interval(self.inner.options.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            // the first tick of `interval` fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.tick().await;
            }
        })
    }

    // ---- addSession ----------------------------------------------------

    pub async fn add_session(
        &self,
        socket: Arc<ConnectionSocket>,
        claims: &TokenClaims,
        raw_token: &str,
        prior_session_id: Option<String>,
        mut options: SessionOptions,
    ) -> Result<AddSessionOutcome, GatewayError> {
        let key = claims.workspace.key();
        options.upgrade_client = claims.is_upgrade_role();
        if options.upgrade_client || claims.is_backup_role() {
            options.use_broadcast = false;
        }

        let mut retried = false;
        loop {
            let (workspace, created) = {
                let mut registry = self.inner.registry.lock();
                match registry.workspaces.get(&key) {
                    Some(workspace) => (Arc::clone(workspace), false),
                    None => {
                        let workspace = Workspace::new(claims.workspace.clone());
                        registry.workspaces.insert(key.clone(), Arc::clone(&workspace));
                        (workspace, true)
                    }
                }
            };
            if created {
                // kicked off outside the lock; concurrent attachers
                // share the construction through the pipeline slot
                self.spawn_pipeline_boot(Arc::clone(&workspace), claims.is_upgrade_role());
                counter!("cove_gateway_workspaces_created_total", 1);
            }

            if let Some(gate) = workspace.closing_gate() {
                if retried {
                    return Err(GatewayError::ShuttingDown);
                }
                retried = true;
                gate.wait().await;
                continue;
            }

            if workspace.is_upgrading() && !claims.is_upgrade_role() {
                return Ok(AddSessionOutcome::UpgradeInProgress(
                    self.upgrade_info(claims),
                ));
            }

            let pipeline = match workspace.pipeline().await {
                Ok(pipeline) => pipeline,
                Err(PipelineError::UpgradeRequired) => {
                    return Ok(AddSessionOutcome::UpgradeInProgress(
                        self.upgrade_info(claims),
                    ));
                }
                Err(err) => return Err(GatewayError::Pipeline(err)),
            };

            let session_id = prior_session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let session = Session::new(
                session_id,
                claims.account_email.clone(),
                raw_token.to_string(),
                pipeline,
                SessionOptions {
                    binary_mode: options.binary_mode,
                    use_compression: options.use_compression,
                    use_broadcast: options.use_broadcast,
                    upgrade_client: options.upgrade_client,
                },
            );

            enum Insert {
                Done(Option<SessionEntry>),
                Racing(Option<Arc<ClosingGate>>),
                Upgrading,
            }

            let inserted = {
                let mut registry = self.inner.registry.lock();
                let still_registered = registry
                    .workspaces
                    .get(&key)
                    .map_or(false, |current| Arc::ptr_eq(current, &workspace));
                if !still_registered {
                    Insert::Racing(None)
                } else {
                    let mut state = workspace.state.lock();
                    if let Some(gate) = state.closing.clone() {
                        Insert::Racing(Some(gate))
                    } else if state.upgrade && !claims.is_upgrade_role() {
                        Insert::Upgrading
                    } else {
                        let evicted = prior_session_id.as_deref().and_then(|prior| {
                            let stale = state
                                .sessions
                                .iter()
                                .find(|(_, entry)| entry.session.session_id() == prior)
                                .map(|(id, _)| *id)?;
                            registry.sessions.remove(&stale);
                            state.sessions.remove(&stale)
                        });
                        state.sessions.insert(
                            session.id(),
                            SessionEntry {
                                session: Arc::clone(&session),
                                socket: Arc::clone(&socket),
                            },
                        );
                        state.soft_shutdown = None;
                        if claims.is_backup_role() {
                            state.backup = true;
                        }
                        registry.sessions.insert(
                            session.id(),
                            FlatEntry {
                                session: Arc::clone(&session),
                                socket: Arc::clone(&socket),
                                workspace_key: key.clone(),
                            },
                        );
                        gauge!("cove_gateway_sessions_active", registry.sessions.len() as f64);
                        Insert::Done(evicted)
                    }
                }
            };

            match inserted {
                Insert::Done(evicted) => {
                    if let Some(stale) = evicted {
                        stale.session.mark_workspace_closed();
                        stale.socket.close(
                            crate::socket::CLOSE_CODE_EVICTED,
                            "session resumed on another connection",
                        );
                        info!(
                            workspace = %key,
                            session = %session.session_id(),
                            "evicted prior connection on reconnect"
                        );
                    }
                    counter!("cove_gateway_sessions_added_total", 1);
                    return Ok(AddSessionOutcome::Attached { session, workspace });
                }
                Insert::Upgrading => {
                    return Ok(AddSessionOutcome::UpgradeInProgress(
                        self.upgrade_info(claims),
                    ));
                }
                Insert::Racing(gate) => {
                    if retried {
                        return Err(GatewayError::ShuttingDown);
                    }
                    retried = true;
                    if let Some(gate) = gate {
                        gate.wait().await;
                    }
                    continue;
                }
            }
        }
    }

    fn spawn_pipeline_boot(&self, workspace: Arc<Workspace>, upgrade: bool) {
        let factory = Arc::clone(&self.inner.factory);
        let broadcasts =
            BroadcastHandle::new(workspace.key().to_string(), self.inner.broadcast_tx.clone());
        let manager = self.clone();
        tokio::spawn(async move {
            let result = (factory)(workspace.id().clone(), upgrade, broadcasts).await;
            match &result {
                Ok(_) => info!(workspace = %workspace.key(), "pipeline ready"),
                Err(PipelineError::UpgradeRequired) => {
                    warn!(workspace = %workspace.key(), "pipeline requires upgrade");
                    manager.remove_workspace_if_same(&workspace);
                }
                Err(err) => {
                    warn!(workspace = %workspace.key(), error = %err, "pipeline boot failed");
                    manager.remove_workspace_if_same(&workspace);
                }
            }
            workspace.resolve_pipeline(result);
        });
    }

    fn remove_workspace_if_same(&self, workspace: &Arc<Workspace>) {
        let mut registry = self.inner.registry.lock();
        if registry
            .workspaces
            .get(workspace.key())
            .map_or(false, |current| Arc::ptr_eq(current, workspace))
        {
            registry.workspaces.remove(workspace.key());
        }
    }

    fn upgrade_info(&self, claims: &TokenClaims) -> Value {
        json!({
            "accountsUrl": self.inner.options.accounts_url,
            "workspace": claims.workspace.name,
        })
    }

    // ---- close ---------------------------------------------------------

    /// Socket-closed notification: drop the binding from both maps and
    /// arm the workspace's grace countdown when it empties.
    pub fn close_connection(&self, session_id: Uuid) {
        let upgrade_teardown = {
            let mut registry = self.inner.registry.lock();
            let Some(flat) = registry.sessions.remove(&session_id) else {
                return;
            };
            flat.session.mark_workspace_closed();
            gauge!("cove_gateway_sessions_active", registry.sessions.len() as f64);

            let workspace = registry.workspaces.get(&flat.workspace_key).cloned();
            match workspace {
                Some(workspace) => {
                    let mut state = workspace.state.lock();
                    state.sessions.remove(&session_id);
                    if state.sessions.is_empty() && state.closing.is_none() {
                        if state.upgrade {
                            // the upgrade window ends with its last client
                            Some(flat.workspace_key)
                        } else {
                            state.soft_shutdown = Some(self.inner.options.soft_shutdown_ticks);
                            None
                        }
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(key) = upgrade_teardown {
            let manager = self.clone();
            tokio::spawn(async move {
                manager
                    .close_all(&key, None, CLOSE_CODE_UPGRADE, CloseCause::Upgrade)
                    .await;
            });
        }
    }

    // ---- closeAll ------------------------------------------------------

    pub async fn close_all(
        &self,
        key: &str,
        ignore_socket: Option<Uuid>,
        code: u16,
        cause: CloseCause,
    ) {
        enum Begin {
            NotFound,
            InFlight(Arc<ClosingGate>),
            Started {
                workspace: Arc<Workspace>,
                gate: Arc<ClosingGate>,
                evicted: Vec<SessionEntry>,
            },
        }

        let begin = {
            let mut registry = self.inner.registry.lock();
            match registry.workspaces.get(key).cloned() {
                None => Begin::NotFound,
                Some(workspace) => {
                    let mut state = workspace.state.lock();
                    if let Some(gate) = state.closing.clone() {
                        Begin::InFlight(gate)
                    } else {
                        let gate = ClosingGate::new();
                        state.closing = Some(Arc::clone(&gate));
                        state.soft_shutdown = None;
                        if cause == CloseCause::Upgrade {
                            state.upgrade = true;
                        }
                        let mut evicted = Vec::with_capacity(state.sessions.len());
                        for (id, entry) in state.sessions.drain() {
                            registry.sessions.remove(&id);
                            entry.session.mark_workspace_closed();
                            evicted.push(entry);
                        }
                        gauge!("cove_gateway_sessions_active", registry.sessions.len() as f64);
                        drop(state);
                        Begin::Started {
                            workspace,
                            gate,
                            evicted,
                        }
                    }
                }
            }
        };

        match begin {
            Begin::NotFound => {}
            Begin::InFlight(gate) => gate.wait().await,
            Begin::Started {
                workspace,
                gate,
                evicted,
            } => {
                info!(workspace = %key, reason = cause.as_str(), sessions = evicted.len(), "closing workspace");
                for entry in &evicted {
                    let ignored = ignore_socket
                        .map_or(false, |ignored| entry.socket.id() == ignored);
                    if !ignored {
                        entry.socket.close(code, cause.as_str());
                    }
                }

                if let Ok(pipeline) = workspace.pipeline().await {
                    pipeline.close().await;
                }

                self.remove_workspace_if_same(&workspace);
                gate.release();
                counter!("cove_gateway_workspaces_closed_total", 1, "reason" => cause.as_str());
            }
        }
    }

    /// Admin-triggered upgrade eviction: quiesce every non-upgrade
    /// session and leave the workspace in its upgrade window. The window
    /// closes when the last upgrade client detaches or, if none ever
    /// arrives, when the grace countdown expires.
    pub async fn force_close(&self, key: &str) -> bool {
        let evicted = {
            let mut registry = self.inner.registry.lock();
            let Some(workspace) = registry.workspaces.get(key).cloned() else {
                return false;
            };
            let mut state = workspace.state.lock();
            if state.closing.is_some() {
                return true;
            }
            state.upgrade = true;
            state.soft_shutdown = Some(self.inner.options.soft_shutdown_ticks);
            let stale: Vec<Uuid> = state
                .sessions
                .iter()
                .filter(|(_, entry)| !entry.session.is_upgrade_client())
                .map(|(id, _)| *id)
                .collect();
            let mut evicted = Vec::with_capacity(stale.len());
            for id in stale {
                if let Some(entry) = state.sessions.remove(&id) {
                    registry.sessions.remove(&id);
                    entry.session.mark_workspace_closed();
                    evicted.push(entry);
                }
            }
            gauge!("cove_gateway_sessions_active", registry.sessions.len() as f64);
            evicted
        };

        info!(workspace = %key, sessions = evicted.len(), "force-closing for upgrade");
        for entry in evicted {
            entry.socket.close(CLOSE_CODE_UPGRADE, "upgrade");
        }
        true
    }

    // ---- broadcast -----------------------------------------------------

    /// Fan one pipeline notification out to the workspace's sessions.
    /// The originator, mute sessions, and upgrade clients are skipped;
    /// a `target` set narrows delivery to those accounts. Write failures
    /// are contained: the failing socket is scheduled for close and the
    /// remaining peers still receive the event.
    pub async fn broadcast(&self, event: BroadcastEvent) {
        let workspace = {
            let registry = self.inner.registry.lock();
            registry.workspaces.get(&event.workspace_key).cloned()
        };
        let Some(workspace) = workspace else {
            return;
        };

        let recipients: Vec<SessionEntry> = {
            let state = workspace.state.lock();
            state
                .sessions
                .values()
                .filter(|entry| Some(entry.session.id()) != event.from)
                .filter(|entry| {
                    entry.session.use_broadcast() && !entry.session.is_upgrade_client()
                })
                .filter(|entry| match &event.target {
                    Some(accounts) => accounts
                        .iter()
                        .any(|account| account == entry.session.account()),
                    None => true,
                })
                .cloned()
                .collect()
        };

        counter!("cove_gateway_broadcasts_total", 1);
        for entry in recipients {
            let result = entry
                .socket
                .send(
                    &event.response,
                    entry.session.binary_mode(),
                    entry.session.use_compression(),
                )
                .await;
            if let Err(err) = result {
                warn!(
                    session = %entry.session.session_id(),
                    error = %err,
                    "broadcast write failed, scheduling close"
                );
                counter!("cove_gateway_broadcast_failures_total", 1);
                entry.socket.close(CLOSE_CODE_SHUTDOWN, "write failure");
                self.close_connection(entry.session.id());
            }
        }
    }

    /// Operational status push: every session of every workspace except
    /// upgrade clients, regardless of their broadcast opt-out.
    async fn broadcast_status(&self, response: Response) {
        let recipients: Vec<SessionEntry> = {
            let registry = self.inner.registry.lock();
            registry
                .sessions
                .values()
                .filter(|flat| !flat.session.is_upgrade_client())
                .map(|flat| SessionEntry {
                    session: Arc::clone(&flat.session),
                    socket: Arc::clone(&flat.socket),
                })
                .collect()
        };
        for entry in recipients {
            let _ = entry
                .socket
                .send(
                    &response,
                    entry.session.binary_mode(),
                    entry.session.use_compression(),
                )
                .await;
        }
    }

    // ---- maintenance & ticker ------------------------------------------

    /// Arm (or re-arm) the maintenance countdown; zero cancels it.
    pub async fn schedule_maintenance(&self, minutes: u32) {
        {
            let mut maintenance = self.inner.maintenance.lock();
            *maintenance = if minutes == 0 { None } else { Some(minutes) };
        }
        if minutes > 0 {
            self.broadcast_status(Response::maintenance(minutes)).await;
        }
    }

    pub fn maintenance_remaining(&self) -> Option<u32> {
        *self.inner.maintenance.lock()
    }

    /// One minute of housekeeping. Normally driven by `spawn_ticker`;
    /// tests call it directly.
    pub async fn tick(&self) {
        let sessions: Vec<Arc<Session>> = {
            let registry = self.inner.registry.lock();
            registry
                .sessions
                .values()
                .map(|flat| Arc::clone(&flat.session))
                .collect()
        };
        for session in &sessions {
            session.roll_stats();
        }

        enum Maintenance {
            Idle,
            Announce(u32),
            Expired,
        }
        let step = {
            let mut maintenance = self.inner.maintenance.lock();
            match *maintenance {
                None => Maintenance::Idle,
                Some(remaining) if remaining <= 1 => {
                    *maintenance = None;
                    Maintenance::Expired
                }
                Some(remaining) => {
                    *maintenance = Some(remaining - 1);
                    Maintenance::Announce(remaining - 1)
                }
            }
        };
        match step {
            Maintenance::Idle => {}
            Maintenance::Announce(remaining) => {
                self.broadcast_status(Response::maintenance(remaining)).await;
            }
            Maintenance::Expired => {
                info!("maintenance countdown expired, shutting workspaces down");
                self.close_everything(CloseCause::Shutdown).await;
                return;
            }
        }

        // soft shutdown of empty workspaces
        let expired: Vec<String> = {
            let registry = self.inner.registry.lock();
            registry
                .workspaces
                .iter()
                .filter_map(|(key, workspace)| {
                    let mut state = workspace.state.lock();
                    if !state.sessions.is_empty() || state.closing.is_some() {
                        return None;
                    }
                    match state.soft_shutdown {
                        Some(remaining) if remaining <= 1 => {
                            state.soft_shutdown = None;
                            Some(key.clone())
                        }
                        Some(remaining) => {
                            state.soft_shutdown = Some(remaining - 1);
                            None
                        }
                        None => None,
                    }
                })
                .collect()
        };
        for key in expired {
            info!(workspace = %key, "soft shutdown expired, evicting workspace");
            self.close_all(&key, None, CLOSE_CODE_SHUTDOWN, CloseCause::Shutdown)
                .await;
        }

        gauge!(
            "cove_gateway_workspaces_active",
            self.workspace_count() as f64
        );
    }

    pub async fn close_everything(&self, cause: CloseCause) {
        let keys: Vec<String> = {
            let registry = self.inner.registry.lock();
            registry.workspaces.keys().cloned().collect()
        };
        let code = match cause {
            CloseCause::Upgrade => CLOSE_CODE_UPGRADE,
            CloseCause::Shutdown => CLOSE_CODE_SHUTDOWN,
        };
        for key in keys {
            self.close_all(&key, None, code, cause).await;
        }
    }

    // ---- statistics ----------------------------------------------------

    pub fn wipe_statistics(&self) {
        let registry = self.inner.registry.lock();
        for flat in registry.sessions.values() {
            flat.session.wipe_stats();
        }
    }

    pub fn statistics(&self, admin: bool) -> GatewayStatistics {
        let (session_stats, workspaces) = {
            let registry = self.inner.registry.lock();
            let session_stats: Vec<SessionStats> = registry
                .sessions
                .values()
                .map(|flat| flat.session.stats())
                .collect();
            let workspaces: Vec<WorkspaceStatistics> = registry
                .workspaces
                .iter()
                .map(|(key, workspace)| {
                    let state = workspace.state.lock();
                    WorkspaceStatistics {
                        workspace: workspace.id().name.clone(),
                        key: key.clone(),
                        sessions: state.sessions.len(),
                        users: state
                            .sessions
                            .values()
                            .map(|entry| entry.session.account().to_string())
                            .collect(),
                        upgrade: state.upgrade,
                        backup: state.backup,
                        closing: state.closing.is_some(),
                        soft_shutdown: state.soft_shutdown,
                    }
                })
                .collect();
            (session_stats, workspaces)
        };

        let mut total = OpCounts::default();
        let mut current = OpCounts::default();
        let mut mins5 = WindowCounts::default();
        for stats in &session_stats {
            total.find_count += stats.total.find_count;
            total.tx_count += stats.total.tx_count;
            current.find_count += stats.current.find_count;
            current.tx_count += stats.current.tx_count;
            mins5.find_count += stats.mins5.find_count;
            mins5.tx_count += stats.mins5.tx_count;
        }

        GatewayStatistics {
            active_sessions: session_stats.len(),
            active_workspaces: workspaces.len(),
            total,
            current,
            mins5,
            admin: admin.then(|| AdminStatistics {
                workspaces,
                system: SystemGauges::sample(),
            }),
        }
    }

    // ---- inspection ----------------------------------------------------

    pub fn session_count(&self) -> usize {
        self.inner.registry.lock().sessions.len()
    }

    pub fn workspace_count(&self) -> usize {
        self.inner.registry.lock().workspaces.len()
    }

    pub fn workspace(&self, key: &str) -> Option<Arc<Workspace>> {
        self.inner.registry.lock().workspaces.get(key).cloned()
    }

    /// Every flat-index entry has exactly one owning workspace entry and
    /// vice versa.
    pub fn registry_is_consistent(&self) -> bool {
        let registry = self.inner.registry.lock();
        let mut workspace_total = 0usize;
        for (key, workspace) in &registry.workspaces {
            let state = workspace.state.lock();
            workspace_total += state.sessions.len();
            for (id, _) in state.sessions.iter() {
                match registry.sessions.get(id) {
                    Some(flat) if flat.workspace_key == *key => {}
                    _ => return false,
                }
            }
        }
        workspace_total == registry.sessions.len()
    }
}

#[derive(Debug, Serialize)]
pub struct GatewayStatistics {
    pub active_sessions: usize,
    pub active_workspaces: usize,
    pub total: OpCounts,
    pub current: OpCounts,
    pub mins5: WindowCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminStatistics>,
}

#[derive(Debug, Serialize)]
pub struct AdminStatistics {
    pub workspaces: Vec<WorkspaceStatistics>,
    pub system: SystemGauges,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceStatistics {
    pub workspace: String,
    pub key: String,
    pub sessions: usize,
    pub users: Vec<String>,
    pub upgrade: bool,
    pub backup: bool,
    pub closing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_shutdown: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SystemGauges {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub cpu_usage_percent: f32,
}

impl SystemGauges {
    fn sample() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
        }
    }
}
