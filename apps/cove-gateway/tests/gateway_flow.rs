//! End-to-end flows through the session manager, driven with the
//! in-memory pipeline and raw connection sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cove_gateway::manager::{AddSessionOutcome, CloseCause, ManagerOptions, SessionManager};
use cove_gateway::pipeline::{BroadcastEvent, EchoPipeline, PipelineError, PipelineFactory};
use cove_gateway::session::{Session, SessionOptions};
use cove_gateway::socket::{
    ConnectionData, ConnectionSocket, CLOSE_CODE_EVICTED, CLOSE_CODE_SHUTDOWN, CLOSE_CODE_UPGRADE,
};
use cove_gateway::token::{TokenClaims, TokenExtra, WorkspaceId};
use cove_gateway::workspace::Workspace;
use cove_proto::{decode_response, RequestId, Response, WireFrame};
use serde_json::json;
use tokio::sync::mpsc;

fn claims(workspace: &str, email: &str) -> TokenClaims {
    TokenClaims {
        account_email: email.into(),
        workspace: WorkspaceId {
            name: workspace.into(),
            product_id: "cove".into(),
            url: String::new(),
        },
        extra: TokenExtra::default(),
    }
}

fn upgrade_claims(workspace: &str, email: &str) -> TokenClaims {
    let mut claims = claims(workspace, email);
    claims.extra.role = Some("upgrade".into());
    claims
}

fn options() -> SessionOptions {
    SessionOptions {
        binary_mode: false,
        use_compression: false,
        use_broadcast: true,
        upgrade_client: false,
    }
}

fn counting_factory(invocations: Arc<AtomicUsize>) -> PipelineFactory {
    let echo = EchoPipeline::factory();
    Arc::new(move |workspace, upgrade, broadcasts| {
        invocations.fetch_add(1, Ordering::SeqCst);
        (echo)(workspace, upgrade, broadcasts)
    })
}

fn manager_with(factory: PipelineFactory, ticks: u32) -> SessionManager {
    let manager = SessionManager::new(
        factory,
        ManagerOptions {
            accounts_url: "http://accounts.test".into(),
            soft_shutdown_ticks: ticks,
            tick_interval: Duration::from_secs(3600),
        },
    );
    manager.spawn_broadcast_pump();
    manager
}

async fn attach(
    manager: &SessionManager,
    claims: &TokenClaims,
    prior: Option<String>,
) -> (
    Arc<Session>,
    Arc<Workspace>,
    Arc<ConnectionSocket>,
    mpsc::Receiver<WireFrame>,
) {
    let (socket, rx) = ConnectionSocket::new(ConnectionData {
        account_email: claims.account_email.clone(),
        ..Default::default()
    });
    match manager
        .add_session(Arc::clone(&socket), claims, "tok", prior, options())
        .await
        .expect("attach")
    {
        AddSessionOutcome::Attached { session, workspace } => (session, workspace, socket, rx),
        AddSessionOutcome::UpgradeInProgress(_) => panic!("unexpected upgrade answer"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn attach_query_and_detach() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let manager = manager_with(counting_factory(Arc::clone(&invocations)), 1);

    let alice = claims("research", "alice@example.com");
    let (session, _workspace, _socket, _rx) = attach(&manager, &alice, None).await;
    let (peer, _, _, _) = attach(&manager, &claims("research", "bob@example.com"), None).await;

    // one workspace, one pipeline construction for both sessions
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(manager.session_count(), 2);
    assert_eq!(manager.workspace_count(), 1);
    assert!(manager.registry_is_consistent());

    session
        .tx(
            Some(RequestId::Number(1)),
            json!({ "class": "doc", "title": "hello" }),
        )
        .await
        .expect("tx");
    let found = session
        .find_all(Some(RequestId::Number(2)), "doc", json!({}), None)
        .await
        .expect("find_all");
    assert_eq!(found.as_array().map(Vec::len), Some(1));

    manager.close_connection(session.id());
    manager.close_connection(peer.id());
    assert_eq!(manager.session_count(), 0);
    assert!(session.workspace_closed());
    assert!(manager.registry_is_consistent());

    // workspace lingers for the grace window, then is evicted
    assert_eq!(manager.workspace_count(), 1);
    manager.tick().await;
    assert_eq!(manager.workspace_count(), 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_reaches_peers_but_not_originator() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let (alice, _, _alice_socket, mut alice_rx) =
        attach(&manager, &claims("shared", "alice@example.com"), None).await;
    let (_bob, _, _bob_socket, mut bob_rx) =
        attach(&manager, &claims("shared", "bob@example.com"), None).await;

    alice
        .tx(Some(RequestId::Number(1)), json!({ "class": "doc" }))
        .await
        .expect("tx");

    let frame = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .expect("bob receives the broadcast")
        .expect("frame");
    let response = decode_response(&frame).expect("decode");
    assert_eq!(response.result.unwrap()["tx"]["class"], json!("doc"));

    // nothing was fanned back to the originator
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_skips_muted_sessions() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let (alice, _, _, _alice_rx) =
        attach(&manager, &claims("target", "alice@example.com"), None).await;

    let muted_claims = claims("target", "mute@example.com");
    let (muted_socket, mut muted_rx) = ConnectionSocket::new(ConnectionData::default());
    let muted = manager
        .add_session(
            Arc::clone(&muted_socket),
            &muted_claims,
            "tok",
            None,
            SessionOptions {
                binary_mode: false,
                use_compression: false,
                use_broadcast: false,
                upgrade_client: false,
            },
        )
        .await
        .expect("attach muted");
    assert!(matches!(muted, AddSessionOutcome::Attached { .. }));

    let (_cara, _, _, mut cara_rx) =
        attach(&manager, &claims("target", "cara@example.com"), None).await;

    alice
        .tx(Some(RequestId::Number(1)), json!({ "class": "note" }))
        .await
        .expect("tx");

    tokio::time::timeout(Duration::from_secs(1), cara_rx.recv())
        .await
        .expect("cara receives")
        .expect("frame");
    assert!(muted_rx.try_recv().is_err());
}

#[tokio::test]
async fn targeted_broadcast_only_reaches_named_accounts() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let workspace_claims = claims("aimed", "alice@example.com");
    let key = workspace_claims.workspace.key();
    let (_alice, _, _, mut alice_rx) = attach(&manager, &workspace_claims, None).await;
    let (_bob, _, _, mut bob_rx) = attach(&manager, &claims("aimed", "bob@example.com"), None).await;

    manager
        .broadcast(BroadcastEvent {
            from: None,
            workspace_key: key,
            response: Response::result(None, json!({ "notice": "hi" })),
            target: Some(vec!["bob@example.com".into()]),
        })
        .await;

    let frame = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .expect("bob receives")
        .expect("frame");
    assert_eq!(
        decode_response(&frame).expect("decode").result.unwrap()["notice"],
        json!("hi")
    );
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn reconnect_with_prior_session_id_evicts_the_old_connection() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let alice = claims("reconnect", "alice@example.com");

    let (first_session, _, first_socket, _rx1) =
        attach(&manager, &alice, Some("stable-id".into())).await;
    assert_eq!(first_session.session_id(), "stable-id");

    let (second_session, _, _, _rx2) = attach(&manager, &alice, Some("stable-id".into())).await;
    assert_eq!(second_session.session_id(), "stable-id");

    assert_eq!(manager.session_count(), 1);
    assert!(manager.registry_is_consistent());
    assert!(first_socket.is_closed());
    assert_eq!(
        first_socket.close_reason().expect("close reason").code,
        CLOSE_CODE_EVICTED
    );
}

#[tokio::test]
async fn force_close_opens_an_upgrade_window() {
    let manager = manager_with(EchoPipeline::factory(), 2);
    let workspace_claims = claims("upgrademe", "alice@example.com");
    let key = workspace_claims.workspace.key();

    let (_session, _, socket, _rx) = attach(&manager, &workspace_claims, None).await;
    assert!(manager.force_close(&key).await);

    // the connected client was quiesced
    assert!(socket.is_closed());
    assert_eq!(socket.close_reason().expect("reason").code, CLOSE_CODE_UPGRADE);
    assert_eq!(manager.session_count(), 0);

    // non-upgrade admission is refused with the upgrade payload
    let (late_socket, _late_rx) = ConnectionSocket::new(ConnectionData::default());
    let refused = manager
        .add_session(
            late_socket,
            &claims("upgrademe", "cara@example.com"),
            "tok",
            None,
            options(),
        )
        .await
        .expect("answered");
    match refused {
        AddSessionOutcome::UpgradeInProgress(info) => {
            assert_eq!(info["accountsUrl"], json!("http://accounts.test"));
        }
        AddSessionOutcome::Attached { .. } => panic!("non-upgrade client attached mid-upgrade"),
    }

    // the upgrade role gets through
    let (upgrade_session, _, _, _urx) =
        attach(&manager, &upgrade_claims("upgrademe", "svc@example.com"), None).await;
    assert!(upgrade_session.is_upgrade_client());
    assert_eq!(manager.session_count(), 1);

    // the window ends when the upgrade client detaches
    manager.close_connection(upgrade_session.id());
    let probe = manager.clone();
    wait_until(move || probe.workspace_count() == 0).await;

    // a fresh attach builds a fresh workspace
    let (_fresh, workspace, _, _frx) = attach(&manager, &workspace_claims, None).await;
    assert!(!workspace.is_upgrading());
    assert!(manager.registry_is_consistent());
}

#[tokio::test]
async fn upgrade_clients_never_receive_broadcasts() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let (alice, _, _, _) = attach(&manager, &claims("quiet", "alice@example.com"), None).await;
    let (upgrader, _, _, mut upgrader_rx) =
        attach(&manager, &upgrade_claims("quiet", "svc@example.com"), None).await;
    assert!(upgrader.is_upgrade_client());

    alice
        .tx(Some(RequestId::Number(1)), json!({ "class": "doc" }))
        .await
        .expect("tx");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(upgrader_rx.try_recv().is_err());
}

#[tokio::test]
async fn maintenance_announces_then_closes_everything() {
    let manager = manager_with(EchoPipeline::factory(), 3);
    let (_a, _, socket_a, mut rx_a) =
        attach(&manager, &claims("w1", "alice@example.com"), None).await;
    let (_b, _, socket_b, mut rx_b) = attach(&manager, &claims("w2", "bob@example.com"), None).await;

    manager.schedule_maintenance(2).await;
    for rx in [&mut rx_a, &mut rx_b] {
        let frame = rx.recv().await.expect("status frame");
        let response = decode_response(&frame).expect("decode");
        let result = response.result.expect("result");
        assert_eq!(result["state"], json!("maintenance"));
        assert_eq!(result["remaining"], json!(2));
    }

    manager.tick().await;
    for rx in [&mut rx_a, &mut rx_b] {
        let frame = rx.recv().await.expect("countdown frame");
        let response = decode_response(&frame).expect("decode");
        assert_eq!(response.result.expect("result")["remaining"], json!(1));
    }

    manager.tick().await;
    assert_eq!(manager.workspace_count(), 0);
    assert_eq!(manager.session_count(), 0);
    assert_eq!(manager.maintenance_remaining(), None);
    for socket in [&socket_a, &socket_b] {
        assert_eq!(
            socket.close_reason().expect("closed").code,
            CLOSE_CODE_SHUTDOWN
        );
    }
}

#[tokio::test]
async fn rescheduling_maintenance_resets_the_counter() {
    let manager = manager_with(EchoPipeline::factory(), 3);
    manager.schedule_maintenance(5).await;
    manager.tick().await;
    assert_eq!(manager.maintenance_remaining(), Some(4));
    manager.schedule_maintenance(5).await;
    assert_eq!(manager.maintenance_remaining(), Some(5));
    manager.schedule_maintenance(0).await;
    assert_eq!(manager.maintenance_remaining(), None);
}

#[tokio::test]
async fn wipe_statistics_leaves_the_registry_alone() {
    let manager = manager_with(EchoPipeline::factory(), 1);
    let (session, _, _, _) = attach(&manager, &claims("stats", "alice@example.com"), None).await;

    session
        .find_all(Some(RequestId::Number(1)), "doc", json!({}), None)
        .await
        .expect("find_all");
    assert_eq!(session.stats().total.find_count, 1);

    manager.wipe_statistics();
    assert_eq!(session.stats().total.find_count, 0);
    assert_eq!(manager.session_count(), 1);
    assert!(manager.registry_is_consistent());

    // traffic continues after the wipe
    session
        .find_all(Some(RequestId::Number(2)), "doc", json!({}), None)
        .await
        .expect("find_all");
    assert_eq!(session.stats().total.find_count, 1);
}

#[tokio::test]
async fn pipeline_boot_failure_removes_the_workspace() {
    let factory: PipelineFactory = Arc::new(|_, _, _| {
        Box::pin(async { Err(PipelineError::Boot("no capacity".into())) })
    });
    let manager = manager_with(factory, 1);

    let (socket, _rx) = ConnectionSocket::new(ConnectionData::default());
    let result = manager
        .add_session(socket, &claims("doomed", "alice@example.com"), "tok", None, options())
        .await;
    assert!(result.is_err());
    assert_eq!(manager.workspace_count(), 0);
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn factory_upgrade_signal_maps_to_the_upgrade_answer() {
    let factory: PipelineFactory =
        Arc::new(|_, _, _| Box::pin(async { Err(PipelineError::UpgradeRequired) }));
    let manager = manager_with(factory, 1);

    let (socket, _rx) = ConnectionSocket::new(ConnectionData::default());
    let outcome = manager
        .add_session(socket, &claims("old", "alice@example.com"), "tok", None, options())
        .await
        .expect("answered");
    assert!(matches!(outcome, AddSessionOutcome::UpgradeInProgress(_)));
    assert_eq!(manager.workspace_count(), 0);
}

#[tokio::test]
async fn reattach_resets_the_soft_shutdown_countdown() {
    let manager = manager_with(EchoPipeline::factory(), 2);
    let alice = claims("linger", "alice@example.com");

    let (session, _, _, _) = attach(&manager, &alice, None).await;
    manager.close_connection(session.id());
    manager.tick().await;
    assert_eq!(manager.workspace_count(), 1);

    // a reconnect within the window keeps the workspace alive
    let (session, _, _, _rx) = attach(&manager, &alice, None).await;
    manager.tick().await;
    manager.tick().await;
    assert_eq!(manager.workspace_count(), 1);

    manager.close_connection(session.id());
    manager.tick().await;
    manager.tick().await;
    assert_eq!(manager.workspace_count(), 0);
}

#[tokio::test]
async fn closed_workspace_accepts_a_fresh_generation() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let manager = manager_with(counting_factory(Arc::clone(&invocations)), 1);
    let alice = claims("cycle", "alice@example.com");
    let key = alice.workspace.key();

    let (_s, _, _, _rx) = attach(&manager, &alice, None).await;
    manager
        .close_all(&key, None, CLOSE_CODE_SHUTDOWN, CloseCause::Shutdown)
        .await;
    assert_eq!(manager.workspace_count(), 0);

    let (_s2, _, _, _rx2) = attach(&manager, &alice, None).await;
    assert_eq!(manager.workspace_count(), 1);
    // a fresh workspace instance means a fresh pipeline construction
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert!(manager.registry_is_consistent());
}
