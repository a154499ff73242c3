use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{
    error::{EngineError, Result},
    gatekeeper::AcceptedSource,
    model::{BroadcastStatus, NewStation, SessionRecord, Station, StationId, StationSettings},
    notify::{BroadcastBus, Notification},
    orchestrator::{BroadcastView, Orchestrator},
};

#[derive(Clone)]
pub struct AppState {
    pub orch: Arc<Orchestrator>,
    pub bus: Arc<BroadcastBus>,
    /// Upper bound on answering the media server's source-auth hook.
    pub auth_timeout: Duration,
    pub version: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/stations", post(api_station_create).get(api_station_list))
        .route(
            "/api/v1/stations/:id",
            get(api_station_get)
                .patch(api_station_update)
                .delete(api_station_delete),
        )
        .route("/api/v1/stations/:id/broadcast", get(api_broadcast_get))
        .route("/api/v1/stations/:id/broadcast/start", post(api_broadcast_start))
        .route("/api/v1/stations/:id/broadcast/stop", post(api_broadcast_stop))
        .route("/api/v1/stations/:id/sessions", get(api_sessions))
        .route("/api/v1/hooks/icecast/auth", post(hook_icecast_auth))
        .route("/api/v1/hooks/icecast/disconnect", post(hook_icecast_disconnect))
        .route("/api/v1/hooks/origin/publish", post(hook_origin_publish))
        .route("/api/v1/hooks/origin/publish_done", post(hook_origin_publish_done))
        .route("/api/v1/events", get(api_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "stationcast engine is running. Try /api/v1/status"
}

async fn api_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let stations = state.orch.list_stations().await?;
    let active = stations.iter().filter(|s| s.is_active).count();
    Ok(Json(json!({
        "ok": true,
        "version": state.version,
        "stations": stations.len(),
        "active": active,
    })))
}

// --- stations ---

async fn api_station_create(
    State(state): State<AppState>,
    Json(new): Json<NewStation>,
) -> Result<(StatusCode, Json<Station>)> {
    let station = state.orch.create_station(new).await?;
    Ok((StatusCode::CREATED, Json(station)))
}

async fn api_station_list(State(state): State<AppState>) -> Result<Json<Vec<Station>>> {
    Ok(Json(state.orch.list_stations().await?))
}

async fn api_station_get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Station>> {
    Ok(Json(state.orch.get_station(&StationId(id)).await?))
}

async fn api_station_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(settings): Json<StationSettings>,
) -> Result<Json<Station>> {
    Ok(Json(state.orch.update_station(&StationId(id), settings).await?))
}

async fn api_station_delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.orch.delete_station(&StationId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- broadcast ---

async fn api_broadcast_get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<BroadcastView>> {
    Ok(Json(state.orch.broadcast_view(&StationId(id)).await?))
}

async fn api_broadcast_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BroadcastStatus>> {
    Ok(Json(state.orch.start_broadcast(&StationId(id)).await?))
}

async fn api_broadcast_stop(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    state.orch.stop_broadcast(&StationId(id)).await?;
    Ok(Json(json!({"ok": true})))
}

async fn api_sessions(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<SessionRecord>>> {
    Ok(Json(state.orch.sessions(&StationId(id)).await?))
}

// --- media server hooks (Icecast URL auth) ---

#[derive(Debug, Deserialize)]
struct IcecastAuthForm {
    #[serde(default)]
    action: String,
    mount: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    pass: String,
    #[serde(default)]
    ip: String,
}

fn accept_source() -> Response {
    (StatusCode::OK, [("icecast-auth-user", "1")]).into_response()
}

fn reject_source() -> Response {
    (StatusCode::UNAUTHORIZED, [("icecast-auth-message", "rejected")]).into_response()
}

async fn hook_icecast_auth(State(state): State<AppState>, Form(form): Form<IcecastAuthForm>) -> Response {
    debug!(action = %form.action, mount = %form.mount, ip = %form.ip, "source auth hook");
    let gate = state.orch.gatekeeper().clone();
    let mount = form.mount.clone();
    let mut task = tokio::spawn(async move { gate.on_live_authenticate(&form.mount, &form.user, &form.pass).await });

    match tokio::time::timeout(state.auth_timeout, &mut task).await {
        Ok(Ok(Ok(_))) => accept_source(),
        Ok(Ok(Err(EngineError::Unauthorized { .. }))) => reject_source(),
        Ok(Ok(Err(e))) => {
            warn!(mount = %mount, "source auth failed: {e}");
            reject_source()
        }
        Ok(Err(e)) => {
            warn!(mount = %mount, "source auth task failed: {e}");
            reject_source()
        }
        Err(_) => {
            warn!(mount = %mount, "source auth timed out; rejecting");
            // The media server has been told no; undo a late accept.
            let gate = state.orch.gatekeeper().clone();
            tokio::spawn(async move {
                if let Ok(Ok(AcceptedSource::Dj { .. })) = task.await {
                    gate.revoke_live(&mount).await;
                }
            });
            reject_source()
        }
    }
}

#[derive(Debug, Deserialize)]
struct IcecastMountForm {
    mount: String,
}

async fn hook_icecast_disconnect(State(state): State<AppState>, Form(form): Form<IcecastMountForm>) -> StatusCode {
    state.orch.gatekeeper().on_live_disconnect(&form.mount).await;
    StatusCode::OK
}

// --- origin push hooks ---

/// RTMP-style origins send the stream key as `name`; others send `mount`.
#[derive(Debug, Deserialize)]
struct OriginHookForm {
    mount: Option<String>,
    name: Option<String>,
}

impl OriginHookForm {
    fn key(self) -> Result<String> {
        self.mount
            .or(self.name)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EngineError::InvalidRequest("mount or name is required".into()))
    }
}

async fn hook_origin_publish(
    State(state): State<AppState>,
    Form(form): Form<OriginHookForm>,
) -> Result<Json<serde_json::Value>> {
    state.orch.reconciler().signal_started(&form.key()?).await;
    Ok(Json(json!({"ok": true})))
}

async fn hook_origin_publish_done(
    State(state): State<AppState>,
    Form(form): Form<OriginHookForm>,
) -> Result<Json<serde_json::Value>> {
    state.orch.reconciler().signal_ended(&form.key()?).await;
    Ok(Json(json!({"ok": true})))
}

// --- notification fan-out ---

async fn api_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| relay_events(socket, rx))
}

async fn relay_events(mut socket: WebSocket, mut rx: Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(n) => {
                let Ok(text) = serde_json::to_string(&n) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event subscriber lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        model::StationStatus,
        notify::NotificationBus,
        origin::OriginRegistry,
        store::Store,
        testing::{FakeMediaServer, FakeProcesses},
    };

    struct Harness {
        base: String,
        http: reqwest::Client,
        orch: Arc<Orchestrator>,
        store: Store,
        _tmp: tempfile::TempDir,
    }

    async fn harness(max_port: u16) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            base_port: 8100,
            max_port,
            runtime_dir: tmp.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let store = Store::open_in_memory().unwrap();
        let bus = Arc::new(BroadcastBus::default());
        let orch = Orchestrator::build(
            &cfg,
            store.clone(),
            Arc::new(FakeProcesses::default()),
            Arc::new(FakeMediaServer::default()),
            None::<Arc<dyn OriginRegistry>>,
            bus.clone() as Arc<dyn NotificationBus>,
        );
        let app = build_router(AppState {
            orch: orch.clone(),
            bus,
            auth_timeout: Duration::from_secs(2),
            version: "test".into(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Harness {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            orch,
            store,
            _tmp: tmp,
        }
    }

    impl Harness {
        async fn form(&self, path: &str, body: &str) -> reqwest::Response {
            self.http
                .post(format!("{}{path}", self.base))
                .header("content-type", "application/x-www-form-urlencoded")
                .body(body.to_string())
                .send()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn create_station_hides_the_source_password() {
        let h = harness(8100).await;
        let resp = h
            .http
            .post(format!("{}/api/v1/stations", h.base))
            .json(&json!({"name": "Night Owl"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["mountPoint"], "/night-owl");
        assert_eq!(body["port"], 8100);
        assert!(body.get("sourcePassword").is_none());

        let resp = h
            .http
            .post(format!("{}/api/v1/stations", h.base))
            .json(&json!({"name": "Another"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn unknown_station_is_404() {
        let h = harness(8199).await;
        let resp = h
            .http
            .get(format!("{}/api/v1/stations/nope/broadcast", h.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn icecast_auth_hook_answers_with_the_auth_header() {
        let h = harness(8199).await;
        let st = h
            .orch
            .create_station(NewStation {
                name: "foo".into(),
                ..NewStation::default()
            })
            .await
            .unwrap();
        h.store.create_dj(&st.id, "alice", "s3cret").await.unwrap();

        let ok = h
            .form("/api/v1/hooks/icecast/auth", "action=stream_auth&mount=%2Ffoo&user=alice&pass=s3cret&ip=10.0.0.5")
            .await;
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.headers()["icecast-auth-user"], "1");
        assert!(h.orch.get_broadcast_status(&st.id).await.unwrap().live_dj_connected);

        let bad = h
            .form("/api/v1/hooks/icecast/auth", "action=stream_auth&mount=%2Ffoo&user=alice&pass=nope")
            .await;
        assert_eq!(bad.status(), 401);
        assert!(bad.headers().get("icecast-auth-user").is_none());

        let gone = h.form("/api/v1/hooks/icecast/disconnect", "action=mount_remove&mount=%2Ffoo").await;
        assert_eq!(gone.status(), 200);
        assert!(!h.orch.get_broadcast_status(&st.id).await.unwrap().live_dj_connected);
    }

    #[tokio::test]
    async fn origin_push_hooks_drive_status() {
        let h = harness(8199).await;
        let st = h
            .orch
            .create_station(NewStation {
                name: "foo".into(),
                ..NewStation::default()
            })
            .await
            .unwrap();

        let resp = h.form("/api/v1/hooks/origin/publish", "app=live&name=foo").await;
        assert_eq!(resp.status(), 200);
        assert_eq!(h.store.get_station(&st.id).await.unwrap().status, StationStatus::Live);

        let resp = h.form("/api/v1/hooks/origin/publish_done", "mount=%2Ffoo").await;
        assert_eq!(resp.status(), 200);
        assert_eq!(h.store.get_station(&st.id).await.unwrap().status, StationStatus::Ended);

        let resp = h.form("/api/v1/hooks/origin/publish", "app=live").await;
        assert_eq!(resp.status(), 400);
    }
}
