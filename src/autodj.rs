use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{EngineError, Result},
    media_server::{create_private_dir, write_private_file},
    model::{now_rfc3339, NowPlaying, SessionKind, SessionRecord, Station, StationId, Track},
    process::{ExitOutcome, ProcessHandle, ProcessSpec, ProcessSupervisor, StopSignal},
    registry::{AutoDjPhase, AutoDjRun, StationGuard, StationRegistry},
    scheduler::Scheduler,
    store::Store,
};

// --- Auto DJ ----------------------------------------------------------------
//
// One ffmpeg per station reads the station's playlist as an ffconcat feed and
// pushes it to the station's Icecast mount with the station source password
// (the "fallback" credential the gatekeeper recognises as Auto DJ).
//
// Per-station state machine: Stopped -> Starting -> Running -> Stopped, or
// Running -> Restarting -> Starting after an unexpected exit.

#[derive(Debug, Clone)]
pub struct AutoDjSettings {
    pub ffmpeg_bin: String,
    pub runtime_dir: PathBuf,
    pub restart_backoff: Duration,
    pub bitrate_kbps: u16,
}

pub const AUTODJ_SOURCE: &str = "autodj";

pub fn process_name(station: &StationId) -> String {
    format!("autodj-{station}")
}

/// ffconcat feed, looped by ffmpeg with `-stream_loop -1`.
pub fn render_feed(tracks: &[Track]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for t in tracks {
        // Single quotes are closed, escaped, and reopened.
        out.push_str(&format!("file '{}'\n", t.path.replace('\'', r"'\''")));
        if t.duration_sec > 0 {
            out.push_str(&format!("duration {}\n", t.duration_sec));
        }
    }
    out
}

fn ffmpeg_args(station: &Station, port: u16, feed: &Path, bitrate_kbps: u16) -> Vec<String> {
    let url = format!(
        "icecast://source:{}@127.0.0.1:{}{}",
        station.source_password, port, station.mount_point
    );
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-re".into(),
        "-stream_loop".into(),
        "-1".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        feed.to_string_lossy().to_string(),
        "-vn".into(),
        "-c:a".into(),
        "libmp3lame".into(),
        "-b:a".into(),
        format!("{bitrate_kbps}k"),
        "-content_type".into(),
        "audio/mpeg".into(),
        "-ice_name".into(),
        station.name.clone(),
        "-f".into(),
        "mp3".into(),
        url,
    ]
}

/// Playback Supervisor.
pub struct AutoDj {
    store: Store,
    registry: Arc<StationRegistry>,
    processes: Arc<dyn ProcessSupervisor>,
    scheduler: Arc<Scheduler>,
    settings: AutoDjSettings,
    tickers: Mutex<HashMap<StationId, (u64, JoinHandle<()>)>>,
}

impl AutoDj {
    pub fn new(
        store: Store,
        registry: Arc<StationRegistry>,
        processes: Arc<dyn ProcessSupervisor>,
        scheduler: Arc<Scheduler>,
        settings: AutoDjSettings,
    ) -> Self {
        Self {
            store,
            registry,
            processes,
            scheduler,
            settings,
            tickers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, id: &StationId) -> bool {
        self.registry.auto_dj(id).is_some()
    }

    pub async fn start(self: &Arc<Self>, id: &StationId) -> Result<()> {
        let guard = self.registry.lock(id).await;
        self.start_locked(&guard).await
    }

    pub async fn start_locked(self: &Arc<Self>, guard: &StationGuard) -> Result<()> {
        let id = guard.station().clone();
        if self.registry.auto_dj(&id).is_some() {
            return Ok(());
        }
        if self.registry.is_live(&id) {
            debug!(station = %id, "auto dj start skipped: live source on air");
            return Ok(());
        }

        let station = self.store.get_station(&id).await?;
        if !station.auto_dj_enabled {
            info!(station = %id, "auto dj is disabled; not starting");
            return Err(EngineError::AutoDjDisabled(id.to_string()));
        }

        self.registry.set_phase(guard, AutoDjPhase::Starting);
        match self.launch(guard, &station).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.registry.set_phase(guard, AutoDjPhase::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(self: &Arc<Self>, guard: &StationGuard, station: &Station) -> Result<()> {
        let id = station.id.clone();
        let tracks = self.store.resolve_playlist(&id).await?;
        let Some(first) = tracks.first().cloned() else {
            info!(station = %id, "auto dj has nothing to play");
            return Err(EngineError::NoPlayableTracks {
                station: id.to_string(),
            });
        };
        let port = station.port.ok_or_else(|| {
            EngineError::InvalidRequest(format!("station {id} has no port lease"))
        })?;

        let dir = self.settings.runtime_dir.join(id.as_str());
        let feed = dir.join("autodj.ffconcat");
        {
            let (dir, feed, body) = (dir.clone(), feed.clone(), render_feed(&tracks));
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                create_private_dir(&dir)?;
                write_private_file(&feed, &body)
            })
            .await??;
        }

        let handle = self
            .processes
            .spawn(ProcessSpec {
                name: process_name(&id),
                program: self.settings.ffmpeg_bin.clone(),
                args: ffmpeg_args(station, port, &feed, self.settings.bitrate_kbps),
                redact: vec![station.source_password.clone()],
                cwd: Some(dir),
            })
            .await?;

        let run = AutoDjRun {
            handle: handle.clone(),
            started_at: now_rfc3339(),
            current_track: Some(first.id.clone()),
            source_mounted: false,
        };
        if let Err(current) = self.registry.begin_auto_dj(guard, run.clone()) {
            // Only reachable if someone mutated state without the station lock.
            warn!(station = %id, ?current, "auto dj lost the race; stopping new process");
            let _ = self.processes.signal(&handle, StopSignal::Terminate).await;
            return Ok(());
        }

        if let Err(e) = self.store.set_now_playing(NowPlaying::track(&id, &first)).await {
            warn!(station = %id, "failed to record now playing: {e}");
        }
        info!(station = %id, tracks = tracks.len(), pid = ?handle.pid, "auto dj running");

        self.spawn_ticker(&id, handle.id, tracks);
        self.spawn_exit_watch(id, run);
        Ok(())
    }

    fn spawn_exit_watch(self: &Arc<Self>, id: StationId, run: AutoDjRun) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.processes.await_exit(&run.handle).await;
            this.on_exit(&id, run, outcome).await;
        });
    }

    /// Advance "now playing" by track duration while this run is current.
    fn spawn_ticker(self: &Arc<Self>, id: &StationId, handle_id: u64, tracks: Vec<Track>) {
        if tracks.first().map_or(true, |t| t.duration_sec == 0) {
            return;
        }
        let this = self.clone();
        let station = id.clone();
        let task = tokio::spawn(async move {
            let mut i = 0usize;
            loop {
                let dur = tracks[i].duration_sec;
                if dur == 0 {
                    // The feed plays the whole file; its end is unknown here.
                    debug!(station = %station, track = %tracks[i].id, "track length unknown; now playing stays put");
                    break;
                }
                tokio::time::sleep(Duration::from_secs(dur as u64)).await;
                i = (i + 1) % tracks.len();

                let _guard = this.registry.lock(&station).await;
                if !this
                    .registry
                    .set_current_track(&station, handle_id, Some(tracks[i].id.clone()))
                {
                    break;
                }
                if let Err(e) = this.store.set_now_playing(NowPlaying::track(&station, &tracks[i])).await {
                    warn!(station = %station, "failed to advance now playing: {e}");
                }
            }
        });
        if let Some((_, prev)) = self
            .tickers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), (handle_id, task))
        {
            prev.abort();
        }
    }

    fn stop_ticker(&self, id: &StationId, handle_id: Option<u64>) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        let matches = match (tickers.get(id), handle_id) {
            (Some((current, _)), Some(h)) => *current == h,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some((_, task)) = tickers.remove(id) {
                task.abort();
            }
        }
    }

    async fn on_exit(self: &Arc<Self>, id: &StationId, run: AutoDjRun, outcome: ExitOutcome) {
        let guard = self.registry.lock(id).await;
        self.stop_ticker(id, Some(run.handle.id));
        let unexpected = self.registry.take_auto_dj_run(&guard, run.handle.id).is_some();

        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            station_id: id.clone(),
            kind: SessionKind::AutoDj.as_str().into(),
            source: AUTODJ_SOURCE.into(),
            started_at: run.started_at.clone(),
            ended_at: now_rfc3339(),
            exit_code: outcome.code,
        };
        if let Err(e) = self.store.append_session(record).await {
            warn!(station = %id, "failed to append auto dj session: {e}");
        }

        if !unexpected {
            // Stopped on purpose (stop or live preemption) and already cleaned up.
            debug!(station = %id, code = ?outcome.code, "auto dj process exited after stop");
            return;
        }

        if let Err(e) = self.store.clear_now_playing(id).await {
            warn!(station = %id, "failed to clear now playing: {e}");
        }
        warn!(
            station = %id,
            code = ?outcome.code,
            last_error = outcome.summary.as_deref().unwrap_or(""),
            "auto dj exited"
        );

        match self.store.auto_dj_enabled(id).await {
            Ok(true) => {
                self.registry.set_phase(&guard, AutoDjPhase::Restarting);
                self.schedule_resume(id, "auto dj restart", self.settings.restart_backoff);
            }
            Ok(false) => self.registry.set_phase(&guard, AutoDjPhase::Stopped),
            Err(e) => {
                self.registry.set_phase(&guard, AutoDjPhase::Stopped);
                debug!(station = %id, "not restarting auto dj: {e}");
            }
        }
    }

    /// Start Auto DJ after `delay`, superseding any pending start/restart.
    pub fn schedule_resume(self: &Arc<Self>, id: &StationId, label: &'static str, delay: Duration) {
        let this = self.clone();
        let station = id.clone();
        self.scheduler.schedule(id, label, delay, async move {
            this.resume(&station).await;
        });
    }

    pub fn cancel_pending(&self, id: &StationId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Label of the start waiting to fire for this station, if any.
    pub fn pending(&self, id: &StationId) -> Option<&'static str> {
        self.scheduler.pending(id)
    }

    /// Deferred start. Every precondition is re-checked under the station
    /// lock at the moment of acting: live wins, and a station disabled or
    /// taken off air in the meantime stays off.
    pub async fn resume(self: &Arc<Self>, id: &StationId) {
        let guard = self.registry.lock(id).await;
        if self.registry.is_live(id) {
            debug!(station = %id, "auto dj resume aborted: live source on air");
            self.registry.set_phase(&guard, AutoDjPhase::Stopped);
            return;
        }
        let station = match self.store.get_station(id).await {
            Ok(s) => s,
            Err(e) => {
                debug!(station = %id, "auto dj resume aborted: {e}");
                return;
            }
        };
        if !station.auto_dj_enabled || !station.is_active {
            debug!(station = %id, "auto dj resume aborted: disabled or off air");
            self.registry.set_phase(&guard, AutoDjPhase::Stopped);
            return;
        }
        match self.start_locked(&guard).await {
            Ok(()) => {}
            Err(e @ EngineError::NoPlayableTracks { .. }) => debug!(station = %id, "{e}"),
            Err(e) => warn!(station = %id, "auto dj resume failed: {e}"),
        }
    }

    pub async fn stop(&self, id: &StationId) -> Result<()> {
        let guard = self.registry.lock(id).await;
        self.stop_locked(&guard).await
    }

    /// Idempotent: stopping a station without Auto DJ is a no-op.
    pub async fn stop_locked(&self, guard: &StationGuard) -> Result<()> {
        let id = guard.station();
        self.scheduler.cancel(id);
        let Some(run) = self.registry.take_auto_dj(guard) else {
            self.registry.set_phase(guard, AutoDjPhase::Stopped);
            return Ok(());
        };
        self.stop_ticker(id, Some(run.handle.id));
        self.terminate(id, &run.handle).await;
        self.store.clear_now_playing(id).await?;
        info!(station = %id, "auto dj stopped");
        Ok(())
    }

    async fn terminate(&self, id: &StationId, handle: &ProcessHandle) {
        if let Err(e) = self.processes.signal(handle, StopSignal::Terminate).await {
            warn!(station = %id, "failed to signal auto dj: {e}");
        }
    }
}
