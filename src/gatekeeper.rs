use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    autodj::AutoDj,
    error::{EngineError, Result},
    media_server::MediaServerManager,
    model::{mount_key, now_rfc3339, NowPlaying, SessionKind, SessionRecord, Station},
    registry::{LiveConnection, StationRegistry},
    store::Store,
};

/// Username Icecast source clients use with the station-wide password.
pub const FALLBACK_USER: &str = "source";

/// How long after a preemption the preempted source's departure is expected.
const PREEMPTED_DEPARTURE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AcceptedSource {
    /// Station-wide fallback credential: the Auto DJ's own connection.
    AutoDj,
    Dj { dj_id: String, username: String },
}

/// Constant-time comparison for the station-wide source password, which is
/// kept recoverable because the Auto DJ encoder has to present it.
fn secrets_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Live-Source Gatekeeper, called from the media server's auth hooks.
pub struct Gatekeeper {
    store: Store,
    registry: Arc<StationRegistry>,
    autodj: Arc<AutoDj>,
    media: Arc<MediaServerManager>,
    live_debounce: Duration,
}

impl Gatekeeper {
    pub fn new(
        store: Store,
        registry: Arc<StationRegistry>,
        autodj: Arc<AutoDj>,
        media: Arc<MediaServerManager>,
        live_debounce: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            autodj,
            media,
            live_debounce,
        }
    }

    async fn resolve(&self, mount: &str, username: &str, password: &str) -> Result<(Station, AcceptedSource)> {
        let unauthorized = || EngineError::Unauthorized {
            mount: mount.to_string(),
        };
        let station = self
            .store
            .find_station_by_mount_key(mount_key(mount))
            .await?
            .ok_or_else(unauthorized)?;

        if username == FALLBACK_USER && secrets_match(password, &station.source_password) {
            return Ok((station, AcceptedSource::AutoDj));
        }

        let Some(dj) = self.store.find_dj(&station.id, username).await? else {
            return Err(unauthorized());
        };
        if !dj.active {
            return Err(unauthorized());
        }
        let (password, hash) = (password.to_string(), dj.password_hash);
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
        if !verified {
            return Err(unauthorized());
        }
        let source = AcceptedSource::Dj {
            dj_id: dj.id,
            username: dj.username,
        };
        Ok((station, source))
    }

    /// Authenticate a source connecting to `mount`. A DJ credential preempts
    /// Auto DJ before the accept is returned.
    pub async fn on_live_authenticate(&self, mount: &str, username: &str, password: &str) -> Result<AcceptedSource> {
        let (station, source) = match self.resolve(mount, username, password).await {
            Ok(ok) => ok,
            Err(e @ EngineError::Unauthorized { .. }) => {
                debug!(mount, username, "source rejected");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let AcceptedSource::Dj { dj_id, username } = &source else {
            let guard = self.registry.lock(&station.id).await;
            let mounted = self.registry.mark_auto_dj_mounted(&guard);
            debug!(station = %station.id, mounted, "auto dj source accepted");
            return Ok(source);
        };

        let id = station.id.clone();
        let guard = self.registry.lock(&id).await;

        // Live wins: a pending resume must not fire underneath this DJ.
        self.autodj.cancel_pending(&id);
        if let Some(run) = self.registry.auto_dj(&id) {
            info!(station = %id, dj = %username, "live source preempts auto dj");
            self.autodj.stop_locked(&guard).await?;
            if run.source_mounted {
                // Its mount_remove may race this accept; only that one is swallowed.
                self.registry
                    .expect_preempted_departure(&guard, tokio::time::Instant::now() + PREEMPTED_DEPARTURE_WINDOW);
            }
            if let Err(e) = self
                .media
                .control()
                .kill_active_source(&id, &station.mount_point)
                .await
            {
                warn!(station = %id, "failed to kick auto dj source: {e}");
            }
        }

        let connection = LiveConnection {
            mount_key: station.mount_key().to_string(),
            station_id: id.clone(),
            source_id: username.clone(),
            dj_id: Some(dj_id.clone()),
            connected_at: now_rfc3339(),
        };
        self.registry.connect_live(&guard, connection);
        if let Err(e) = self.store.set_now_playing(NowPlaying::live(&id, username)).await {
            warn!(station = %id, "failed to record live now playing: {e}");
        }
        drop(guard);

        if let Err(e) = self.store.touch_dj_last_connected(dj_id).await {
            warn!(station = %id, "failed to update dj last connection: {e}");
        }
        info!(station = %id, dj = %username, "live source connected");
        Ok(source)
    }

    /// A source left `mount`. Only tracked live connections matter here.
    pub async fn on_live_disconnect(&self, mount: &str) {
        self.end_live(mount, true).await
    }

    /// Drop a live connection the media server never completed, e.g. when
    /// the accept answer arrived after the hook gave up waiting.
    pub async fn revoke_live(&self, mount: &str) {
        self.end_live(mount, false).await
    }

    async fn end_live(&self, mount: &str, absorb: bool) {
        // Resolved through the store, not the live index: a departure can
        // arrive while the preempting accept still holds the station lock.
        let id = match self.store.find_station_by_mount_key(mount_key(mount)).await {
            Ok(Some(station)) => station.id,
            Ok(None) => {
                debug!(mount, "disconnect for an unknown mount");
                return;
            }
            Err(e) => {
                warn!(mount, "disconnect lookup failed: {e}");
                return;
            }
        };

        let guard = self.registry.lock(&id).await;
        if absorb && self.registry.absorb_departure(&guard) {
            debug!(station = %id, "preempted auto dj source left the mount");
            return;
        }
        let Some(conn) = self.registry.disconnect_live(&guard) else {
            if absorb {
                self.registry.mark_auto_dj_unmounted(&guard);
            }
            debug!(station = %id, "disconnect for a mount without a live connection");
            return;
        };
        if let Err(e) = self.store.clear_now_playing(&id).await {
            warn!(station = %id, "failed to clear now playing: {e}");
        }
        drop(guard);

        info!(station = %id, dj = %conn.source_id, "live source disconnected");
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            station_id: id.clone(),
            kind: SessionKind::Live.as_str().into(),
            source: conn.source_id.clone(),
            started_at: conn.connected_at.clone(),
            ended_at: now_rfc3339(),
            exit_code: None,
        };
        if let Err(e) = self.store.append_session(record).await {
            warn!(station = %id, "failed to append live session: {e}");
        }

        match self.store.auto_dj_enabled(&id).await {
            Ok(true) => self
                .autodj
                .schedule_resume(&id, "resume after live", self.live_debounce),
            Ok(false) => {}
            Err(e) => debug!(station = %id, "not resuming auto dj: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        autodj::{process_name, AutoDjSettings},
        model::{NewStation, StationId},
        ports::PortAllocator,
        scheduler::Scheduler,
        testing::{FakeMediaServer, FakeProcesses},
    };

    struct Fixture {
        gate: Arc<Gatekeeper>,
        autodj: Arc<AutoDj>,
        procs: Arc<FakeProcesses>,
        media: Arc<FakeMediaServer>,
        registry: Arc<StationRegistry>,
        store: Store,
        station: Station,
        dj_id: String,
        _tmp: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let registry = Arc::new(StationRegistry::new());
        let procs = Arc::new(FakeProcesses::default());
        let media = Arc::new(FakeMediaServer::default());
        let autodj = Arc::new(AutoDj::new(
            store.clone(),
            registry.clone(),
            procs.clone(),
            Arc::new(Scheduler::new()),
            AutoDjSettings {
                ffmpeg_bin: "ffmpeg".into(),
                runtime_dir: tmp.path().to_path_buf(),
                restart_backoff: Duration::from_secs(3),
                bitrate_kbps: 128,
            },
        ));
        let manager = Arc::new(MediaServerManager::new(
            media.clone(),
            registry.clone(),
            store.clone(),
            "adm".into(),
            "http://127.0.0.1:3000".into(),
            Duration::from_secs(2),
        ));
        let gate = Arc::new(Gatekeeper::new(
            store.clone(),
            registry.clone(),
            autodj.clone(),
            manager,
            Duration::from_millis(1500),
        ));

        let station = store
            .create_station(
                NewStation {
                    name: "foo".into(),
                    auto_dj_enabled: true,
                    ..NewStation::default()
                },
                PortAllocator::new(8100, 8199),
            )
            .await
            .unwrap();
        let pl = store.create_playlist(&station.id, "default", true).await.unwrap();
        let t = store.create_track(&station.id, "Song", "Band", "/m/s.mp3", 180).await.unwrap();
        store.add_to_playlist(&pl, &t, 0).await.unwrap();
        store.set_active(&station.id, true).await.unwrap();
        let dj_id = store.create_dj(&station.id, "alice", "secret").await.unwrap();
        let station = store.get_station(&station.id).await.unwrap();

        Fixture {
            gate,
            autodj,
            procs,
            media,
            registry,
            store,
            station,
            dj_id,
            _tmp: tmp,
        }
    }

    fn assert_exclusive(registry: &StationRegistry, id: &StationId) {
        let autodj = registry.auto_dj(id).is_some();
        let live = registry.live_connection(id).is_some();
        assert!(!(autodj && live), "auto dj and live source both active");
    }

    #[tokio::test(start_paused = true)]
    async fn dj_connect_preempts_running_auto_dj() {
        let f = fixture().await;
        let id = f.station.id.clone();
        f.autodj.start(&id).await.unwrap();
        assert!(f.autodj.is_running(&id));

        let src = f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();
        assert!(matches!(src, AcceptedSource::Dj { .. }));
        assert!(!f.autodj.is_running(&id));
        assert!(f.registry.is_live(&id));
        assert_exclusive(&f.registry, &id);
        assert_eq!(f.procs.signalled(&process_name(&id)), 1);
        assert_eq!(f.media.kills(&id), 1);

        let np = f.store.now_playing(&id).await.unwrap().unwrap();
        assert!(np.is_live);
        assert_eq!(np.live_source.as_deref(), Some("alice"));
        assert!(f.store.dj_last_connected(&f.dj_id).await.unwrap().is_some());

        // The preempted Auto DJ's process exit must not restart it under the DJ.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.autodj.is_running(&id));
        assert_exclusive(&f.registry, &id);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_credential_is_auto_dj_and_never_preempts() {
        let f = fixture().await;
        let id = f.station.id.clone();
        f.autodj.start(&id).await.unwrap();

        let pw = f.station.source_password.clone();
        let src = f.gate.on_live_authenticate("foo", FALLBACK_USER, &pw).await.unwrap();
        assert_eq!(src, AcceptedSource::AutoDj);
        assert!(f.autodj.is_running(&id));
        assert!(!f.registry.is_live(&id));
        assert_eq!(f.media.kills(&id), 0);
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthorized() {
        let f = fixture().await;
        let cases = [
            ("/foo", "alice", "wrong"),
            ("/foo", "mallory", "secret"),
            ("/nope", "alice", "secret"),
            ("/foo", FALLBACK_USER, "wrong"),
        ];
        for (mount, user, pass) in cases {
            let err = f.gate.on_live_authenticate(mount, user, pass).await.unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized { .. }), "{mount} {user}");
        }

        f.store.set_dj_active(&f.dj_id, false).await.unwrap();
        let err = f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
        assert!(!f.registry.is_live(&f.station.id));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resumes_auto_dj_after_debounce() {
        let f = fixture().await;
        let id = f.station.id.clone();
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.is_live(&id));
        assert!(f.store.now_playing(&id).await.unwrap().is_none());
        assert!(!f.autodj.is_running(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.autodj.is_running(&id));
        assert_exclusive(&f.registry, &id);

        let sessions = f.store.list_sessions(&id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].kind, "live");
        assert_eq!(sessions[0].source, "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_debounce_keeps_auto_dj_off() {
        let f = fixture().await;
        let id = f.station.id.clone();
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();
        f.gate.on_live_disconnect("/foo").await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.registry.is_live(&id));
        assert!(!f.autodj.is_running(&id));
        assert_eq!(f.procs.spawned(&process_name(&id)), 0);
    }

    async fn start_mounted_auto_dj(f: &Fixture) {
        f.autodj.start(&f.station.id).await.unwrap();
        let pw = f.station.source_password.clone();
        f.gate.on_live_authenticate("/foo", FALLBACK_USER, &pw).await.unwrap();
        assert!(f.registry.auto_dj(&f.station.id).unwrap().source_mounted);
    }

    #[tokio::test(start_paused = true)]
    async fn preempted_source_departure_does_not_end_the_live_session() {
        let f = fixture().await;
        let id = f.station.id.clone();
        start_mounted_auto_dj(&f).await;
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

        // Icecast reports the Auto DJ source leaving.
        f.gate.on_live_disconnect("/foo").await;
        assert!(f.registry.is_live(&id));

        // The DJ's own departure is real.
        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.is_live(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn departure_racing_the_preempting_accept_is_still_absorbed() {
        let f = fixture().await;
        let id = f.station.id.clone();
        start_mounted_auto_dj(&f).await;

        // Icecast reports the kicked source while the accept is still in flight.
        let (gate, media) = (f.gate.clone(), f.media.clone());
        let departure = tokio::spawn(async move {
            media.source_kicked().await;
            gate.on_live_disconnect("/foo").await;
        });
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();
        departure.await.unwrap();
        assert!(f.registry.is_live(&id));

        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.is_live(&id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.autodj.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn dj_leaving_early_ends_live_when_auto_dj_never_reached_the_mount() {
        let f = fixture().await;
        let id = f.station.id.clone();
        // The encoder was spawned but never got through source auth.
        f.autodj.start(&id).await.unwrap();
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.is_live(&id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(f.autodj.is_running(&id));
        assert_exclusive(&f.registry, &id);
        assert_eq!(f.store.list_sessions(&id).await.unwrap().iter().filter(|s| s.kind == "live").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_dj_source_leaving_on_its_own_is_not_expected_again() {
        let f = fixture().await;
        let id = f.station.id.clone();
        start_mounted_auto_dj(&f).await;

        // The encoder dropped off the mount before any DJ showed up.
        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.auto_dj(&id).unwrap().source_mounted);

        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();
        f.gate.on_live_disconnect("/foo").await;
        assert!(!f.registry.is_live(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn now_playing_matches_the_registry_after_a_fast_reconnect() {
        for _ in 0..8 {
            let f = fixture().await;
            let id = f.station.id.clone();
            f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

            let gate = f.gate.clone();
            let leave = tokio::spawn(async move { gate.on_live_disconnect("/foo").await });
            let gate = f.gate.clone();
            let back = tokio::spawn(async move { gate.on_live_authenticate("/foo", "alice", "secret").await });
            leave.await.unwrap();
            back.await.unwrap().unwrap();

            let np = f.store.now_playing(&id).await.unwrap();
            let np_live = np.as_ref().is_some_and(|np| np.is_live);
            assert_eq!(f.registry.is_live(&id), np_live);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_ignores_the_preemption_window_and_resumes_auto_dj() {
        let f = fixture().await;
        let id = f.station.id.clone();
        start_mounted_auto_dj(&f).await;
        f.gate.on_live_authenticate("/foo", "alice", "secret").await.unwrap();

        f.gate.revoke_live("/foo").await;
        assert!(!f.registry.is_live(&id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.autodj.is_running(&id));
    }

    #[tokio::test]
    async fn unknown_disconnect_is_ignored() {
        let f = fixture().await;
        f.gate.on_live_disconnect("/foo").await;
        f.gate.on_live_disconnect("/elsewhere").await;
        assert_eq!(f.store.list_sessions(&f.station.id).await.unwrap().len(), 0);
    }

    #[test]
    fn secrets_compare_exactly() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }
}
