//! Connection front-end: token validation on handshake, frame decode,
//! request dispatch through the session, and the writer task that drains
//! each socket's outbound queue into the WebSocket sink.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::header::{ACCEPT_LANGUAGE, USER_AGENT};
use axum::http::HeaderMap;
use axum::response::Response as HttpResponse;
use cove_proto::{decode_request, ErrorCode, Request, Response, WireFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::AddSessionOutcome;
use crate::session::{Session, SessionOptions};
use crate::socket::{
    ConnectionData, ConnectionSocket, CloseReason, CLOSE_CODE_NORMAL, CLOSE_CODE_UNAUTHORIZED,
    CLOSE_CODE_UPGRADE, FLUSH_THRESHOLD,
};
use crate::token::{decode_token, TokenClaims};
use crate::workspace::Workspace;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub binary: Option<bool>,
    #[serde(default)]
    pub compression: Option<bool>,
    #[serde(default)]
    pub broadcast: Option<bool>,
}

/// Upgrade endpoint with the bearer token in the URL path.
pub async fn connect_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    let auth = decode_token(&token, &state.config.product_id)
        .map_err(|err| err.to_string())
        .map(|claims| (claims, token));
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth, params, remote_addr, headers))
}

/// Upgrade endpoint without a token. The handshake still completes so
/// the client sees a protocol-level `UNAUTHORIZED`, not a TCP reset.
pub async fn connect_handler_no_token(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    let auth = Err("missing token".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth, params, remote_addr, headers))
}

async fn handle_socket(
    ws: WebSocket,
    state: Arc<AppState>,
    auth: Result<(TokenClaims, String), String>,
    params: ConnectParams,
    remote_addr: SocketAddr,
    headers: HeaderMap,
) {
    let (mut sink, stream) = ws.split();

    let (claims, raw_token) = match auth {
        Ok(auth) => auth,
        Err(reason) => {
            counter!("cove_gateway_unauthorized_total", 1);
            warn!(remote = %remote_addr, reason = %reason, "rejecting handshake");
            let response = Response::error(None, ErrorCode::Unauthorized, reason);
            if let Ok(WireFrame::Text(text)) = cove_proto::encode_response(&response, false, false)
            {
                let _ = sink.send(Message::Text(text)).await;
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CODE_UNAUTHORIZED,
                    reason: Cow::Borrowed("unauthorized"),
                })))
                .await;
            return;
        }
    };

    let data = ConnectionData {
        remote_address: Some(remote_addr.to_string()),
        user_agent: header_string(&headers, USER_AGENT.as_str()),
        accept_language: header_string(&headers, ACCEPT_LANGUAGE.as_str()),
        account_email: claims.account_email.clone(),
        mode: claims.extra.mode.clone(),
        model: claims.extra.model.clone(),
    };
    let (socket, outbound_rx) = ConnectionSocket::new(data);
    let options = SessionOptions {
        binary_mode: params.binary.unwrap_or(false),
        use_compression: params.compression.unwrap_or(false) && state.config.enable_compression,
        use_broadcast: params.broadcast.unwrap_or(true),
        upgrade_client: false,
    };

    let outcome = state
        .manager
        .add_session(
            Arc::clone(&socket),
            &claims,
            &raw_token,
            params.session_id,
            options,
        )
        .await;

    match outcome {
        Ok(AddSessionOutcome::Attached { session, workspace }) => {
            info!(
                workspace = %workspace.key(),
                session = %session.session_id(),
                account = %session.account(),
                "session attached"
            );
            let writer = tokio::spawn(run_writer(Arc::clone(&socket), outbound_rx, sink));
            run_connection(&session, &workspace, &socket, stream).await;
            state.manager.close_connection(session.id());
            socket.close(CLOSE_CODE_NORMAL, "connection closed");
            let _ = writer.await;
            info!(
                workspace = %workspace.key(),
                session = %session.session_id(),
                "session detached"
            );
        }
        Ok(AddSessionOutcome::UpgradeInProgress(info)) => {
            let response = Response::upgrade_required(info);
            send_direct(&mut sink, &response).await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CODE_UPGRADE,
                    reason: Cow::Borrowed("upgrade"),
                })))
                .await;
        }
        Err(err) => {
            warn!(account = %claims.account_email, error = %err, "attach failed");
            let response = Response::error(None, err.code(), err.to_string());
            send_direct(&mut sink, &response).await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CODE_NORMAL,
                    reason: Cow::Borrowed("attach failed"),
                })))
                .await;
        }
    }
}

async fn run_connection(
    session: &Arc<Session>,
    workspace: &Arc<Workspace>,
    socket: &Arc<ConnectionSocket>,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => WireFrame::Text(text),
            Ok(Message::Binary(bytes)) => WireFrame::Binary(bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(session = %session.session_id(), error = %err, "read failed");
                break;
            }
        };

        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                let response =
                    Response::error(None, ErrorCode::TransportError, err.to_string());
                if send_response(session, socket, &response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if workspace.is_upgrading() && !session.is_upgrade_client() {
            let response = Response::upgrading(request.id.clone());
            let _ = send_response(session, socket, &response).await;
            socket.close(CLOSE_CODE_UPGRADE, "upgrade");
            break;
        }

        let response = dispatch_request(session, request).await;
        if send_response(session, socket, &response).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindAllParams {
    class: String,
    #[serde(default)]
    query: Value,
    #[serde(default)]
    options: Option<Value>,
}

async fn dispatch_request(session: &Arc<Session>, request: Request) -> Response {
    counter!("cove_gateway_requests_total", 1, "method" => request.method.clone());
    match request.method.as_str() {
        "ping" => Response::result(request.id, json!(session.ping())),
        "findAll" => match serde_json::from_value::<FindAllParams>(request.params) {
            Ok(params) => {
                match session
                    .find_all(request.id.clone(), &params.class, params.query, params.options)
                    .await
                {
                    Ok(result) => Response::result(request.id, result),
                    Err(err) => {
                        Response::error(request.id, ErrorCode::PipelineError, err.to_string())
                    }
                }
            }
            Err(err) => Response::error(
                request.id,
                ErrorCode::TransportError,
                format!("invalid findAll params: {err}"),
            ),
        },
        "tx" => match session.tx(request.id.clone(), request.params).await {
            Ok(result) => Response::result(request.id, result),
            Err(err) => Response::error(request.id, ErrorCode::PipelineError, err.to_string()),
        },
        other => {
            counter!("cove_gateway_unknown_methods_total", 1);
            Response::error(
                request.id,
                ErrorCode::UnknownMethod,
                format!("unknown method {other}"),
            )
        }
    }
}

async fn send_response(
    session: &Arc<Session>,
    socket: &Arc<ConnectionSocket>,
    response: &Response,
) -> Result<usize, crate::error::GatewayError> {
    let result = socket
        .send(response, session.binary_mode(), session.use_compression())
        .await;
    if let Err(err) = &result {
        warn!(session = %session.session_id(), error = %err, "send failed");
    }
    result
}

/// Pre-attach path: no session flags negotiated yet, plain text frame.
async fn send_direct(sink: &mut SplitSink<WebSocket, Message>, response: &Response) {
    if let Ok(WireFrame::Text(text)) = cove_proto::encode_response(response, false, false) {
        let _ = sink.send(Message::Text(text)).await;
    }
}

/// Drain the socket's outbound queue into the sink, flushing whenever
/// the residual buffered bytes pass the threshold or the queue idles.
/// Exits on close (emitting the recorded Close frame) or write failure.
async fn run_writer(
    socket: Arc<ConnectionSocket>,
    mut rx: mpsc::Receiver<WireFrame>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    let mut unflushed = 0usize;
    loop {
        tokio::select! {
            _ = socket.wait_closed() => {
                // frames enqueued ahead of the close signal must still
                // reach the client before the Close frame; a closed
                // socket stops new sends, so this drain terminates
                while let Ok(frame) = rx.try_recv() {
                    if let Err(err) = sink.feed(to_message(frame)).await {
                        debug!(socket = %socket.id(), error = %err, "write failed");
                        socket.mark_failed();
                        return;
                    }
                }
                if let Err(err) = sink.flush().await {
                    debug!(socket = %socket.id(), error = %err, "flush failed");
                    socket.mark_failed();
                    return;
                }
                break;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let len = frame.len();
                if let Err(err) = sink.feed(to_message(frame)).await {
                    debug!(socket = %socket.id(), error = %err, "write failed");
                    socket.mark_failed();
                    return;
                }
                unflushed += len;
                if unflushed > FLUSH_THRESHOLD || rx.is_empty() {
                    if let Err(err) = sink.flush().await {
                        debug!(socket = %socket.id(), error = %err, "flush failed");
                        socket.mark_failed();
                        return;
                    }
                    unflushed = 0;
                }
            }
        }
    }

    let CloseReason { code, reason } = socket.close_reason().unwrap_or(CloseReason {
        code: CLOSE_CODE_NORMAL,
        reason: String::new(),
    });
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })))
        .await;
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(bytes) => Message::Binary(bytes),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
