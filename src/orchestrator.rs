use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    autodj::{AutoDj, AutoDjSettings},
    config::EngineConfig,
    error::{EngineError, Result},
    gatekeeper::Gatekeeper,
    media_server::{InstanceHandle, MediaServerControl, MediaServerManager},
    model::{
        now_rfc3339, BroadcastStatus, NewStation, SessionKind, SessionRecord, Station, StationId,
        StationSettings, StationStatus,
    },
    notify::NotificationBus,
    origin::OriginRegistry,
    ports::PortAllocator,
    process::ProcessSupervisor,
    reconciler::Reconciler,
    registry::{AutoDjPhase, LiveConnection, StationGuard, StationRegistry},
    scheduler::Scheduler,
    store::Store,
};

/// Everything the status endpoint reports for one station.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastView {
    #[serde(flatten)]
    pub status: BroadcastStatus,
    pub station_status: StationStatus,
    pub is_active: bool,
    pub auto_dj_phase: AutoDjPhase,
    pub pending: Option<&'static str>,
    pub instance: Option<InstanceHandle>,
    pub live: Option<LiveConnection>,
}

/// Station lifecycle and broadcast control on top of the components.
pub struct Orchestrator {
    store: Store,
    registry: Arc<StationRegistry>,
    ports: PortAllocator,
    media: Arc<MediaServerManager>,
    autodj: Arc<AutoDj>,
    gatekeeper: Arc<Gatekeeper>,
    reconciler: Arc<Reconciler>,
}

impl Orchestrator {
    pub fn build(
        cfg: &EngineConfig,
        store: Store,
        processes: Arc<dyn ProcessSupervisor>,
        control: Arc<dyn MediaServerControl>,
        origin: Option<Arc<dyn OriginRegistry>>,
        bus: Arc<dyn NotificationBus>,
    ) -> Arc<Self> {
        let registry = Arc::new(StationRegistry::new());
        let media = Arc::new(MediaServerManager::new(
            control,
            registry.clone(),
            store.clone(),
            cfg.admin_password.clone(),
            cfg.hook_base_url.clone(),
            cfg.autodj_backoff,
        ));
        let autodj = Arc::new(AutoDj::new(
            store.clone(),
            registry.clone(),
            processes,
            Arc::new(Scheduler::new()),
            AutoDjSettings {
                ffmpeg_bin: cfg.ffmpeg_bin.clone(),
                runtime_dir: cfg.runtime_dir.clone(),
                restart_backoff: cfg.autodj_backoff,
                bitrate_kbps: 128,
            },
        ));
        let gatekeeper = Arc::new(Gatekeeper::new(
            store.clone(),
            registry.clone(),
            autodj.clone(),
            media.clone(),
            cfg.live_debounce,
        ));
        let reconciler = Arc::new(Reconciler::new(origin, store.clone(), bus, cfg.origin_timeout));

        Arc::new(Self {
            store,
            registry,
            ports: PortAllocator::new(cfg.base_port, cfg.max_port),
            media,
            autodj,
            gatekeeper,
            reconciler,
        })
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper> {
        &self.gatekeeper
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    // --- stations ---

    pub async fn create_station(&self, new: NewStation) -> Result<Station> {
        let station = self.store.create_station(new, self.ports).await?;
        info!(
            station = %station.id,
            mount = %station.mount_point,
            port = ?station.port,
            "station created"
        );
        Ok(station)
    }

    pub async fn get_station(&self, id: &StationId) -> Result<Station> {
        self.store.get_station(id).await
    }

    pub async fn list_stations(&self) -> Result<Vec<Station>> {
        self.store.list_stations().await
    }

    /// Apply a settings change and bring Auto DJ in line with it.
    pub async fn update_station(&self, id: &StationId, settings: StationSettings) -> Result<Station> {
        let guard = self.registry.lock(id).await;
        let before = self.store.get_station(id).await?;
        let after = self.store.update_settings(id, settings).await?;

        if before.auto_dj_enabled && !after.auto_dj_enabled {
            self.autodj.stop_locked(&guard).await?;
        } else if after.auto_dj_enabled && after.is_active {
            let playlist_changed = before.default_playlist_id != after.default_playlist_id;
            if playlist_changed && self.autodj.is_running(id) {
                // The feed is materialised at start; pick up the new playlist.
                self.autodj.stop_locked(&guard).await?;
            }
            self.start_auto_dj_locked(&guard).await;
        }
        Ok(after)
    }

    /// Tear down broadcast state, then remove the station and its port lease.
    pub async fn delete_station(&self, id: &StationId) -> Result<()> {
        self.stop_broadcast(id).await?;
        let guard = self.registry.lock(id).await;
        self.store.delete_station(id).await?;
        self.registry.forget(&guard);
        info!(station = %id, "station deleted");
        Ok(())
    }

    pub async fn sessions(&self, id: &StationId) -> Result<Vec<SessionRecord>> {
        self.store.get_station(id).await?;
        self.store.list_sessions(id).await
    }

    // --- broadcast ---

    pub async fn start_broadcast(&self, id: &StationId) -> Result<BroadcastStatus> {
        let guard = self.registry.lock(id).await;
        let station = self.store.get_station(id).await?;

        // A station already on air keeps its instance; replacing it would drop
        // a connected DJ and every listener.
        if !(station.is_active && self.registry.instance(id).is_some()) {
            self.media.ensure_running_locked(&guard, &station).await?;
        }
        self.store.set_active(id, true).await?;
        self.start_auto_dj_locked(&guard).await;
        drop(guard);

        self.get_broadcast_status(id).await
    }

    async fn start_auto_dj_locked(&self, guard: &StationGuard) {
        let id = guard.station();
        match self.autodj.start_locked(guard).await {
            Ok(()) => {}
            Err(e @ (EngineError::NoPlayableTracks { .. } | EngineError::AutoDjDisabled(_))) => {
                debug!(station = %id, "auto dj not started: {e}")
            }
            Err(e) => warn!(station = %id, "auto dj failed to start: {e}"),
        }
    }

    pub async fn stop_broadcast(&self, id: &StationId) -> Result<()> {
        let guard = self.registry.lock(id).await;
        let station = self.store.get_station(id).await?;

        self.autodj.stop_locked(&guard).await?;

        if self.registry.live_connection(id).is_some() {
            if let Err(e) = self
                .media
                .control()
                .kill_active_source(id, &station.mount_point)
                .await
            {
                warn!(station = %id, "failed to kick live source: {e}");
            }
            if let Some(conn) = self.registry.disconnect_live(&guard) {
                info!(station = %id, dj = %conn.source_id, "live source dropped by stop");
                let record = SessionRecord {
                    id: Uuid::new_v4().to_string(),
                    station_id: id.clone(),
                    kind: SessionKind::Live.as_str().into(),
                    source: conn.source_id,
                    started_at: conn.connected_at,
                    ended_at: now_rfc3339(),
                    exit_code: None,
                };
                if let Err(e) = self.store.append_session(record).await {
                    warn!(station = %id, "failed to append live session: {e}");
                }
            }
        }

        self.media.stop_locked(&guard).await?;
        self.store.set_active(id, false).await?;
        self.store.clear_now_playing(id).await?;
        info!(station = %id, "broadcast stopped");
        Ok(())
    }

    pub async fn get_broadcast_status(&self, id: &StationId) -> Result<BroadcastStatus> {
        self.store.get_station(id).await?;
        Ok(BroadcastStatus {
            auto_dj_running: self.autodj.is_running(id),
            live_dj_connected: self.registry.is_live(id),
            now_playing: self.store.now_playing(id).await?,
        })
    }

    pub async fn broadcast_view(&self, id: &StationId) -> Result<BroadcastView> {
        let station = self.store.get_station(id).await?;
        let status = self.get_broadcast_status(id).await?;
        Ok(BroadcastView {
            status,
            station_status: station.status,
            is_active: station.is_active,
            auto_dj_phase: self.registry.phase(id),
            pending: self.autodj.pending(id),
            instance: self.registry.instance(id),
            live: self.registry.live_connection(id),
        })
    }

    // --- process lifecycle ---

    /// Repair port leases, replace instances of active stations, resume Auto DJ.
    pub async fn startup(&self) -> Result<()> {
        let repaired = self.store.assign_missing_ports(self.ports).await?;
        for lease in &repaired {
            info!(station = %lease.station_id, port = lease.port, "assigned missing port lease");
        }

        let active = self.store.list_active_stations().await?;
        info!(stations = active.len(), "relaunching active stations");
        for (id, res) in self.media.relaunch_active(&active).await {
            if let Err(e) = res {
                warn!(station = %id, "relaunch failed: {e}");
            }
        }
        for station in &active {
            let guard = self.registry.lock(&station.id).await;
            self.start_auto_dj_locked(&guard).await;
        }
        Ok(())
    }

    /// Stop Auto DJ children. Media server instances outlive the engine.
    pub async fn shutdown(&self) {
        for id in self.registry.stations() {
            if let Err(e) = self.autodj.stop(&id).await {
                warn!(station = %id, "auto dj stop on shutdown failed: {e}");
            }
        }
    }
}
