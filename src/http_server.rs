//! HTTP and WebSocket surface using Axum.
//!
//! Mutating routes pass CSRF verification and then the strict rate-limit
//! tier; listing routes pass the read tier. Both middlewares leave the
//! loaded [`Session`] in the request extensions for [`AuthSession`].

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Path, Request, State,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{Action, Resource};
use crate::csrf::{self, CSRF_HEADER};
use crate::error::LabError;
use crate::notifier::{ConnectionId, Event, Scope};
use crate::orchestrator::{LabInstance, LabSpec, ReconcileReport};
use crate::rate_limit::{RateDecision, RateIdentity, RateLimiter};
use crate::session::{redact, Session};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "labgate.sid";

/// Rate buckets idle this long are dropped by the maintenance loop.
const BUCKET_IDLE: Duration = Duration::from_secs(600);

/// How often an open realtime channel re-checks its session.
const SESSION_RECHECK: Duration = Duration::from_secs(15);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LabList {
    gns3_containers: Vec<LabInstance>,
}

#[derive(Deserialize)]
struct ProvisionRequest {
    classroom: String,
    #[serde(flatten)]
    spec: LabSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsrfTokenResponse {
    csrf_token: String,
}

/// Frames a realtime client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientFrame {
    Subscribe { scope: Scope },
    Unsubscribe { scope: Scope },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerFrame {
    Subscribed { scope: Scope },
    Unsubscribed { scope: Scope },
    Error { error: &'static str, message: String },
    Pong,
    Event { event: Event },
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    // route_layer: the layer added last runs first.
    let mutating = Router::new()
        .route("/gns3labs", post(provision_lab))
        .route("/gns3labs/instances/:id", delete(terminate_lab))
        .route("/gns3labs/reconcile", post(reconcile_labs))
        .route("/logout", post(logout))
        .route_layer(from_fn_with_state(state.clone(), rate_limit_strict))
        .route_layer(from_fn_with_state(state.clone(), csrf_protect));

    let reads = Router::new()
        .route("/gns3labs/list-userinfo", get(list_user_labs))
        .route("/gns3labs/classroom/:code", get(list_classroom_labs))
        .route("/csrf-token", get(csrf_token))
        .route("/ws", get(realtime))
        .route_layer(from_fn_with_state(state.clone(), rate_limit_read));

    Router::new()
        .merge(mutating)
        .merge(reads)
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the listed browser origins.
pub fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(CSRF_HEADER)]),
    )
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(
    port: u16,
    state: AppState,
    maintenance_every: Duration,
    cors_origins: &[String],
) -> std::io::Result<()> {
    spawn_maintenance(state.clone(), maintenance_every);

    let mut app = router(state);
    if let Some(cors) = cors_layer(cors_origins) {
        app = app.layer(cors);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}

/// Periodic reconciliation, session purge and rate-bucket pruning.
pub fn spawn_maintenance(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_maintenance(&state).await;
        }
    })
}

async fn run_maintenance(state: &AppState) {
    if let Err(err) = state.orchestrator.reconcile().await {
        warn!(error = %err, "Reconciliation sweep failed");
    }
    match state.sessions.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "Purged expired sessions"),
        Err(err) => warn!(error = %err, "Session purge failed"),
    }
    let pruned = state.strict_limiter.prune(BUCKET_IDLE).await + state.read_limiter.prune(BUCKET_IDLE).await;
    if pruned > 0 {
        debug!(pruned, "Pruned idle rate-limit buckets");
    }
}

/// Session id from the `labgate.sid` cookie.
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// An authenticated session, resolved from the cookie or from a middleware
/// that already loaded it.
pub struct AuthSession(pub Session);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthSession {
    type Rejection = LabError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<Session>() {
            return Ok(Self(session.clone()));
        }
        let id = session_cookie(&parts.headers).ok_or(LabError::Unauthenticated)?;
        let session = state.sessions.authenticate(id).await?;
        parts.extensions.insert(session.clone());
        Ok(Self(session))
    }
}

async fn csrf_protect(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, LabError> {
    if csrf::is_exempt(req.method()) {
        return Ok(next.run(req).await);
    }
    let id = session_cookie(req.headers())
        .map(str::to_owned)
        .ok_or(LabError::Unauthenticated)?;
    let session = state.sessions.authenticate(&id).await?;
    let valid = csrf::token_from_headers(req.headers()).is_some_and(|token| csrf::verify_for_session(&session, token));
    if !valid {
        warn!(
            session = %redact(&id),
            method = %req.method(),
            path = %req.uri().path(),
            "Rejected request without a valid CSRF token"
        );
        return Err(LabError::CsrfRejected);
    }
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

async fn rate_limit_strict(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, LabError> {
    let limiter = state.strict_limiter.clone();
    enforce(&state, &limiter, req, next).await
}

async fn rate_limit_read(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, LabError> {
    let limiter = state.read_limiter.clone();
    enforce(&state, &limiter, req, next).await
}

async fn enforce(state: &AppState, limiter: &RateLimiter, mut req: Request, next: Next) -> Result<Response, LabError> {
    let identity = rate_identity(state, &mut req).await;
    match limiter.consume(&identity).await {
        RateDecision::Allowed { .. } => Ok(next.run(req).await),
        RateDecision::Limited { retry_after } => Err(LabError::RateLimited { retry_after }),
    }
}

/// Charge the authenticated user when there is one, otherwise the client address.
async fn rate_identity(state: &AppState, req: &mut Request) -> RateIdentity {
    if let Some(session) = req.extensions().get::<Session>() {
        return RateIdentity::User(session.user_id.clone());
    }
    if let Some(id) = session_cookie(req.headers()).map(str::to_owned) {
        if let Ok(session) = state.sessions.authenticate(&id).await {
            let identity = RateIdentity::User(session.user_id.clone());
            req.extensions_mut().insert(session);
            return identity;
        }
    }
    client_ip(req, state.trust_forwarded_for)
        .map(RateIdentity::Origin)
        .unwrap_or(RateIdentity::Anonymous)
}

fn client_ip(req: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

async fn health() -> &'static str {
    "OK"
}

async fn list_user_labs(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> Result<Json<LabList>, LabError> {
    let labs = state.orchestrator.list(&session).await?;
    Ok(Json(LabList { gns3_containers: labs }))
}

async fn list_classroom_labs(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(code): Path<String>,
) -> Result<Json<LabList>, LabError> {
    let labs = state.orchestrator.list_classroom(&session, &code).await?;
    Ok(Json(LabList { gns3_containers: labs }))
}

async fn provision_lab(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LabInstance>), LabError> {
    let Json(req) = payload.map_err(|e| LabError::InvalidRequest(e.body_text()))?;
    let classroom = req.classroom.trim();
    if classroom.is_empty() {
        return Err(LabError::InvalidRequest("classroom is required".into()));
    }
    let provisioned = state.orchestrator.provision(&session, classroom, req.spec).await?;
    let status = if provisioned.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(provisioned.instance)))
}

async fn terminate_lab(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Path(id): Path<String>,
) -> Result<StatusCode, LabError> {
    let outcome = state.orchestrator.terminate(&session, &id).await?;
    debug!(instance = %id, ?outcome, "Terminate handled");
    Ok(StatusCode::NO_CONTENT)
}

async fn reconcile_labs(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> Result<Json<ReconcileReport>, LabError> {
    state.auth.require(&session, Action::Reconcile, Resource::System).await?;
    info!(requester = %session.user_id, "Manual reconciliation");
    Ok(Json(state.orchestrator.reconcile().await?))
}

async fn csrf_token(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> Result<Json<CsrfTokenResponse>, LabError> {
    let token = state.csrf.issue(&session.id).await?;
    Ok(Json(CsrfTokenResponse { csrf_token: token }))
}

async fn logout(State(state): State<AppState>, AuthSession(session): AuthSession) -> Result<Response, LabError> {
    state.sessions.invalidate(&session.id).await?;
    info!(user = %session.user_id, "Logged out");
    let clear = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, clear)]).into_response())
}

async fn realtime(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    ws: WebSocketUpgrade,
) -> Result<Response, LabError> {
    state
        .auth
        .require(&session, Action::Subscribe, Resource::User(&session.user_id))
        .await?;
    Ok(ws.on_upgrade(move |socket| realtime_session(state, socket, session)))
}

async fn realtime_session(state: AppState, mut socket: WebSocket, session: Session) {
    let mut subscription = state.notifier.connect().await;
    let connection = subscription.id;
    let own = Scope::User(session.user_id.clone());
    state.notifier.subscribe(connection, own.clone()).await;
    state.set_presence(&session, true).await;
    info!(user = %session.user_id, connection, "Realtime channel open");

    let mut recheck = interval(SESSION_RECHECK);
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
    recheck.tick().await;

    if send_frame(&mut socket, &ServerFrame::Subscribed { scope: own }).await.is_ok() {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(&state, &session.id, connection, &text).await;
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                event = subscription.events.recv() => match event {
                    Some(event) => {
                        if state.sessions.verify(&session.id).await.is_err() {
                            close_ended_session(&mut socket, &session).await;
                            break;
                        }
                        if send_frame(&mut socket, &ServerFrame::Event { event }).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = recheck.tick() => {
                    if state.sessions.verify(&session.id).await.is_err() {
                        close_ended_session(&mut socket, &session).await;
                        break;
                    }
                }
            }
        }
    }

    state.notifier.disconnect(connection).await;
    state.set_presence(&session, false).await;
    info!(user = %session.user_id, connection, "Realtime channel closed");
}

/// Tell the client its session is gone, then close the socket.
async fn close_ended_session(socket: &mut WebSocket, session: &Session) {
    info!(user = %session.user_id, session = %redact(&session.id), "Session ended, closing realtime channel");
    let _ = send_frame(socket, &error_frame(&LabError::Unauthenticated)).await;
    let close = CloseFrame {
        code: close_code::POLICY,
        reason: "session ended".into(),
    };
    let _ = socket.send(Message::Close(Some(close))).await;
}

async fn handle_client_frame(state: &AppState, session_id: &str, connection: ConnectionId, text: &str) -> ServerFrame {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => return error_frame(&LabError::InvalidRequest(format!("bad frame: {err}"))),
    };
    match frame {
        ClientFrame::Ping => ServerFrame::Pong,
        ClientFrame::Subscribe { scope } => match authorize_scope(state, session_id, &scope).await {
            Ok(()) => {
                state.notifier.subscribe(connection, scope.clone()).await;
                ServerFrame::Subscribed { scope }
            }
            Err(err) => error_frame(&err),
        },
        ClientFrame::Unsubscribe { scope } => {
            state.notifier.unsubscribe(connection, &scope).await;
            ServerFrame::Unsubscribed { scope }
        }
    }
}

/// Re-checks the session so a logged-out user cannot widen a live channel.
async fn authorize_scope(state: &AppState, session_id: &str, scope: &Scope) -> Result<(), LabError> {
    let session = state.sessions.authenticate(session_id).await?;
    let resource = match scope {
        Scope::User(user) => Resource::User(user),
        Scope::Classroom(code) => Resource::Classroom(code),
    };
    state.auth.require(&session, Action::Subscribe, resource).await
}

fn error_frame(err: &LabError) -> ServerFrame {
    ServerFrame::Error {
        error: err.code(),
        message: err.to_string(),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(payload) => socket.send(Message::Text(payload)).await,
        Err(err) => {
            warn!(error = %err, "Failed to encode realtime frame");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::testing::{self, FakeRuntime};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        runtime: Arc<FakeRuntime>,
        client: reqwest::Client,
    }

    impl TestServer {
        async fn start(settings: crate::config::Settings) -> Self {
            let (state, runtime, _roster) = testing::app_state(&settings).await;
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = router(state.clone());
            tokio::spawn(async move {
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                    .unwrap();
            });
            Self {
                addr,
                state,
                runtime,
                client: reqwest::Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn login(&self, user: &str, role: Role) -> Session {
            self.state.sessions.create(user, role).await.unwrap()
        }

        fn get(&self, session: &Session, path: &str) -> reqwest::RequestBuilder {
            self.client.get(self.url(path)).header("cookie", cookie(session))
        }

        async fn token(&self, session: &Session) -> String {
            let body: serde_json::Value = self
                .get(session, "/csrf-token")
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["csrfToken"].as_str().unwrap().to_string()
        }

        fn post(&self, session: &Session, token: Option<&str>, path: &str) -> reqwest::RequestBuilder {
            let mut req = self.client.post(self.url(path)).header("cookie", cookie(session));
            if let Some(token) = token {
                req = req.header(CSRF_HEADER, token);
            }
            req
        }

        fn delete(&self, session: &Session, token: &str, path: &str) -> reqwest::RequestBuilder {
            self.client
                .delete(self.url(path))
                .header("cookie", cookie(session))
                .header(CSRF_HEADER, token)
        }
    }

    fn cookie(session: &Session) -> String {
        format!("{SESSION_COOKIE}={}", session.id)
    }

    fn provision_body(classroom: &str) -> serde_json::Value {
        serde_json::json!({ "classroom": classroom })
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; labgate.sid=abc123; lang=en"));
        assert_eq!(session_cookie(&headers), Some("abc123"));

        headers.insert(header::COOKIE, HeaderValue::from_static("labgate.sid="));
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","scope":{"classroom":"CS101"}}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { scope: Scope::Classroom(c) } if c == "CS101"));
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[tokio::test]
    async fn health_needs_no_session() {
        let server = TestServer::start(testing::settings()).await;
        let body = server.client.get(server.url("/health")).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn provisioning_flow_for_a_student() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;
        let token = server.token(&alice).await;

        let resp = server
            .post(&alice, Some(&token), "/gns3labs")
            .json(&provision_body("CS101"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let first: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(first["status"], "running");
        assert_eq!(first["owner"], "alice");

        let resp = server
            .post(&alice, Some(&token), "/gns3labs")
            .json(&provision_body("CS101"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let second: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(second["id"], first["id"]);

        let list: serde_json::Value = server
            .get(&alice, "/gns3labs/list-userinfo")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["gns3Containers"].as_array().unwrap().len(), 1);

        let id = first["id"].as_str().unwrap();
        for _ in 0..2 {
            let resp = server
                .delete(&alice, &token, &format!("/gns3labs/instances/{id}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        assert!(server.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn csrf_rejection_has_no_side_effects() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;
        let bob = server.login("bob", Role::Student).await;
        let bobs_token = server.token(&bob).await;

        for token in [None, Some("garbage.token"), Some(bobs_token.as_str())] {
            let resp = server
                .post(&alice, token, "/gns3labs")
                .json(&provision_body("CS101"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["error"], "csrf_rejected");
        }
        assert_eq!(server.runtime.create_calls(), 0);
    }

    #[tokio::test]
    async fn expired_session_is_unauthenticated() {
        let mut settings = testing::settings();
        settings.session_ttl = Duration::from_millis(50);
        let server = TestServer::start(settings).await;
        let alice = server.login("alice", Role::Student).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let resp = server.get(&alice, "/gns3labs/list-userinfo").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn strict_tier_blocks_the_eleventh_mutation() {
        let mut settings = testing::settings();
        settings.strict_rate.refill_interval = Duration::from_secs(3600);
        let server = TestServer::start(settings).await;
        let alice = server.login("alice", Role::Student).await;
        let token = server.token(&alice).await;

        for _ in 0..10 {
            let resp = server
                .delete(&alice, &token, "/gns3labs/instances/gns3lab-missing")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        let resp = server
            .delete(&alice, &token, "/gns3labs/instances/gns3lab-missing")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "60");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["retryAfter"], 60);

        // Reads are charged to a separate tier.
        let resp = server.get(&alice, "/gns3labs/list-userinfo").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instructor_and_admin_views() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;
        let token = server.token(&alice).await;
        server
            .post(&alice, Some(&token), "/gns3labs")
            .json(&provision_body("CS101"))
            .send()
            .await
            .unwrap();

        let prof = server.login("prof", Role::Instructor).await;
        let list: serde_json::Value = server
            .get(&prof, "/gns3labs/classroom/CS101")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["gns3Containers"][0]["owner"], "alice");

        let resp = server.get(&alice, "/gns3labs/classroom/CS101").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = server.post(&alice, Some(&token), "/gns3labs/reconcile").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let root = server.login("root", Role::Administrator).await;
        let root_token = server.token(&root).await;
        let resp = server.post(&root, Some(&root_token), "/gns3labs/reconcile").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(report["checked"], 1);
    }

    #[tokio::test]
    async fn logout_invalidates_the_session() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;
        let token = server.token(&alice).await;

        let resp = server.post(&alice, Some(&token), "/logout").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers()[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        let resp = server.get(&alice, "/gns3labs/list-userinfo").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;
        let token = server.token(&alice).await;
        let resp = server
            .post(&alice, Some(&token), "/gns3labs")
            .json(&serde_json::json!({ "image": "x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
    }

    async fn next_frame<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame ok");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn websocket_pushes_instance_transitions() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;

        let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("cookie", cookie(&alice).parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let hello = next_frame(&mut ws).await;
        assert_eq!(hello["type"], "subscribed");
        assert_eq!(hello["scope"]["user"], "alice");

        ws.send(WsMessage::Text(
            r#"{"type":"subscribe","scope":{"classroom":"CS101"}}"#.into(),
        ))
        .await
        .unwrap();
        let denied = next_frame(&mut ws).await;
        assert_eq!(denied["type"], "error");
        assert_eq!(denied["error"], "forbidden");

        let token = server.token(&alice).await;
        server
            .post(&alice, Some(&token), "/gns3labs")
            .json(&provision_body("CS101"))
            .send()
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let frame = next_frame(&mut ws).await;
            if frame["type"] == "event" && frame["event"]["kind"] == "instance" {
                seen.push(frame["event"]["status"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(seen, vec!["provisioning", "running"]);

        ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(next_frame(&mut ws).await["type"], "pong");
    }

    #[tokio::test]
    async fn instructors_see_presence_in_their_classroom() {
        let server = TestServer::start(testing::settings()).await;
        let prof = server.login("prof", Role::Instructor).await;
        let alice = server.login("alice", Role::Student).await;

        let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
        request.headers_mut().insert("cookie", cookie(&prof).parse().unwrap());
        let (mut prof_ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        next_frame(&mut prof_ws).await;
        prof_ws
            .send(WsMessage::Text(
                r#"{"type":"subscribe","scope":{"classroom":"CS101"}}"#.into(),
            ))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut prof_ws).await["type"], "subscribed");

        let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
        request.headers_mut().insert("cookie", cookie(&alice).parse().unwrap());
        let (_alice_ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        loop {
            let frame = next_frame(&mut prof_ws).await;
            if frame["type"] == "event" && frame["event"]["kind"] == "presence" && frame["event"]["userId"] == "alice" {
                assert_eq!(frame["event"]["online"], true);
                break;
            }
        }
    }

    #[tokio::test]
    async fn websocket_closes_after_logout() {
        let server = TestServer::start(testing::settings()).await;
        let alice = server.login("alice", Role::Student).await;

        let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
        request.headers_mut().insert("cookie", cookie(&alice).parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(next_frame(&mut ws).await["type"], "subscribed");

        let token = server.token(&alice).await;
        let resp = server.post(&alice, Some(&token), "/logout").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // Alice signs in elsewhere; her new lab must not reach the old channel.
        let fresh = server.login("alice", Role::Student).await;
        server
            .state
            .orchestrator
            .provision(&fresh, "CS101", LabSpec::default())
            .await
            .unwrap();

        let ended = next_frame(&mut ws).await;
        assert_eq!(ended["type"], "error");
        assert_eq!(ended["error"], "unauthenticated");
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("close within timeout");
            match msg {
                Some(Ok(WsMessage::Close(frame))) => {
                    assert_eq!(u16::from(frame.unwrap().code), close_code::POLICY);
                    break;
                }
                Some(Ok(WsMessage::Text(text))) => panic!("frame after logout: {text}"),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    }

    #[tokio::test]
    async fn websocket_requires_a_session() {
        let server = TestServer::start(testing::settings()).await;
        let request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
        assert!(tokio_tungstenite::connect_async(request).await.is_err());
    }
}
