use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::{
    media_server::InstanceHandle,
    model::StationId,
    process::ProcessHandle,
};

/// One Auto DJ run as the registry sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoDjRun {
    pub handle: ProcessHandle,
    pub started_at: String,
    pub current_track: Option<String>,
    /// The media server accepted this run's source connection.
    pub source_mounted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConnection {
    pub mount_key: String,
    pub station_id: StationId,
    pub source_id: String,
    /// DJ row that authenticated, if the source was a personal credential.
    pub dj_id: Option<String>,
    pub connected_at: String,
}

/// Who is feeding a station right now. Being a single enum is what keeps
/// Auto DJ and a live source from both being the program feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BroadcastState {
    #[default]
    Off,
    AutoDj(AutoDjRun),
    LiveDj(LiveConnection),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoDjPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
}

#[derive(Debug, Default)]
struct StationEntry {
    broadcast: BroadcastState,
    phase: AutoDjPhase,
    instance: Option<InstanceHandle>,
    /// Until this instant the next departure from the mount is the preempted
    /// Auto DJ source leaving, not the live connection.
    preempted_departure_until: Option<tokio::time::Instant>,
}

/// Proof that the caller holds a station's serialization lock.
pub struct StationGuard {
    station: StationId,
    _guard: OwnedMutexGuard<()>,
}

impl StationGuard {
    pub fn station(&self) -> &StationId {
        &self.station
    }
}

/// Process-wide map station id -> broadcast state.
///
/// Reads are cheap snapshots. Every mutation of a station's broadcast state
/// takes a `&StationGuard` for that station, so start/stop/preempt sequences
/// for one station never interleave while other stations proceed freely.
#[derive(Default)]
pub struct StationRegistry {
    entries: Mutex<HashMap<StationId, StationEntry>>,
    locks: Mutex<HashMap<StationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StationId, StationEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard_matches(guard: &StationGuard, id: &StationId) {
        debug_assert_eq!(guard.station(), id, "station guard used for another station");
    }

    pub async fn lock(&self, id: &StationId) -> StationGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.clone())
            .or_default()
            .clone();
        StationGuard {
            station: id.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    pub fn state(&self, id: &StationId) -> BroadcastState {
        self.entries()
            .get(id)
            .map(|e| e.broadcast.clone())
            .unwrap_or_default()
    }

    pub fn phase(&self, id: &StationId) -> AutoDjPhase {
        self.entries().get(id).map(|e| e.phase).unwrap_or_default()
    }

    pub fn is_live(&self, id: &StationId) -> bool {
        matches!(self.state(id), BroadcastState::LiveDj(_))
    }

    pub fn auto_dj(&self, id: &StationId) -> Option<AutoDjRun> {
        match self.state(id) {
            BroadcastState::AutoDj(run) => Some(run),
            _ => None,
        }
    }

    pub fn set_phase(&self, guard: &StationGuard, phase: AutoDjPhase) {
        self.entries()
            .entry(guard.station().clone())
            .or_default()
            .phase = phase;
    }

    /// Off -> AutoDj. Any other current state is returned untouched.
    pub fn begin_auto_dj(&self, guard: &StationGuard, run: AutoDjRun) -> Result<(), BroadcastState> {
        let mut entries = self.entries();
        let entry = entries.entry(guard.station().clone()).or_default();
        if entry.broadcast != BroadcastState::Off {
            return Err(entry.broadcast.clone());
        }
        entry.broadcast = BroadcastState::AutoDj(run);
        entry.phase = AutoDjPhase::Running;
        Ok(())
    }

    /// AutoDj -> Off, whatever run is current.
    pub fn take_auto_dj(&self, guard: &StationGuard) -> Option<AutoDjRun> {
        self.take_auto_dj_if(guard, |_| true)
    }

    /// AutoDj -> Off only if the current run is the given process.
    pub fn take_auto_dj_run(&self, guard: &StationGuard, handle_id: u64) -> Option<AutoDjRun> {
        self.take_auto_dj_if(guard, |run| run.handle.id == handle_id)
    }

    fn take_auto_dj_if(
        &self,
        guard: &StationGuard,
        pred: impl Fn(&AutoDjRun) -> bool,
    ) -> Option<AutoDjRun> {
        let mut entries = self.entries();
        let entry = entries.get_mut(guard.station())?;
        if !matches!(&entry.broadcast, BroadcastState::AutoDj(run) if pred(run)) {
            return None;
        }
        entry.phase = AutoDjPhase::Stopped;
        match std::mem::take(&mut entry.broadcast) {
            BroadcastState::AutoDj(run) => Some(run),
            _ => None,
        }
    }

    /// Compare-and-swap of the "now playing" pointer of a running Auto DJ.
    pub fn set_current_track(&self, id: &StationId, handle_id: u64, track: Option<String>) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(id).map(|e| &mut e.broadcast) {
            Some(BroadcastState::AutoDj(run)) if run.handle.id == handle_id => {
                run.current_track = track;
                true
            }
            _ => false,
        }
    }

    /// Record a live source. The caller must already have stopped Auto DJ;
    /// an Auto DJ still recorded here is overwritten, live wins.
    pub fn connect_live(&self, guard: &StationGuard, conn: LiveConnection) -> BroadcastState {
        Self::guard_matches(guard, &conn.station_id);
        let mut entries = self.entries();
        let entry = entries.entry(conn.station_id.clone()).or_default();
        if matches!(entry.broadcast, BroadcastState::AutoDj(_)) {
            entry.phase = AutoDjPhase::Stopped;
        }
        std::mem::replace(&mut entry.broadcast, BroadcastState::LiveDj(conn))
    }

    /// The running Auto DJ's source got through the media server's auth.
    pub fn mark_auto_dj_mounted(&self, guard: &StationGuard) -> bool {
        match self.entries().get_mut(guard.station()).map(|e| &mut e.broadcast) {
            Some(BroadcastState::AutoDj(run)) => {
                run.source_mounted = true;
                true
            }
            _ => false,
        }
    }

    /// The mount lost its Auto DJ source while Auto DJ is still recorded.
    pub fn mark_auto_dj_unmounted(&self, guard: &StationGuard) {
        if let Some(BroadcastState::AutoDj(run)) = self.entries().get_mut(guard.station()).map(|e| &mut e.broadcast) {
            run.source_mounted = false;
        }
    }

    pub fn live_connection(&self, id: &StationId) -> Option<LiveConnection> {
        match self.state(id) {
            BroadcastState::LiveDj(conn) => Some(conn),
            _ => None,
        }
    }

    /// LiveDj -> Off.
    pub fn disconnect_live(&self, guard: &StationGuard) -> Option<LiveConnection> {
        let mut entries = self.entries();
        let entry = entries.get_mut(guard.station())?;
        match std::mem::take(&mut entry.broadcast) {
            BroadcastState::LiveDj(conn) => {
                entry.preempted_departure_until = None;
                Some(conn)
            }
            other => {
                entry.broadcast = other;
                None
            }
        }
    }

    /// Announce that the mounted Auto DJ source is being kicked, so its
    /// departure arrives some time before `until`.
    pub fn expect_preempted_departure(&self, guard: &StationGuard, until: tokio::time::Instant) {
        self.entries()
            .entry(guard.station().clone())
            .or_default()
            .preempted_departure_until = Some(until);
    }

    /// Swallow one mount departure announced by `expect_preempted_departure`.
    pub fn absorb_departure(&self, guard: &StationGuard) -> bool {
        self.entries()
            .get_mut(guard.station())
            .and_then(|e| e.preempted_departure_until.take())
            .is_some_and(|until| tokio::time::Instant::now() < until)
    }

    pub fn set_instance(&self, guard: &StationGuard, instance: InstanceHandle) -> Option<InstanceHandle> {
        self.entries()
            .entry(guard.station().clone())
            .or_default()
            .instance
            .replace(instance)
    }

    pub fn take_instance(&self, guard: &StationGuard) -> Option<InstanceHandle> {
        self.entries()
            .get_mut(guard.station())
            .and_then(|e| e.instance.take())
    }

    pub fn instance(&self, id: &StationId) -> Option<InstanceHandle> {
        self.entries().get(id).and_then(|e| e.instance.clone())
    }

    /// Drop everything known about a station. Broadcast state must already be Off.
    pub fn forget(&self, guard: &StationGuard) {
        self.entries().remove(guard.station());
    }

    pub fn stations(&self) -> Vec<StationId> {
        self.entries().keys().cloned().collect()
    }
}
