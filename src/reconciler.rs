use std::{collections::HashSet, sync::Arc, time::Duration};

use serde_json::json;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    error::{EngineError, Result},
    model::{mount_key, Station, StationStatus},
    notify::{NotificationBus, Topic},
    origin::OriginRegistry,
    store::Store,
};

// --- State reconciler -------------------------------------------------------
//
// The only writer of `live`/`ended` and the only publisher of stream and
// recording notifications. `known` mirrors the last successfully observed set
// of active mount keys that belong to a station; a failed fetch leaves it as
// it was.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started: Vec<String>,
    pub ended: Vec<String>,
}

pub struct Reconciler {
    origin: Option<Arc<dyn OriginRegistry>>,
    store: Store,
    bus: Arc<dyn NotificationBus>,
    known: Mutex<HashSet<String>>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        origin: Option<Arc<dyn OriginRegistry>>,
        store: Store,
        bus: Arc<dyn NotificationBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            origin,
            store,
            bus,
            known: Mutex::new(HashSet::new()),
            timeout,
        }
    }

    pub async fn known_active(&self) -> HashSet<String> {
        self.known.lock().await.clone()
    }

    async fn fetch(&self, origin: &dyn OriginRegistry) -> Result<HashSet<String>> {
        match tokio::time::timeout(self.timeout, origin.list_active_signals()).await {
            Ok(res) => res,
            Err(_) => Err(EngineError::OriginUnreachable(format!(
                "no answer within {:?}",
                self.timeout
            ))),
        }
    }

    /// One poll: fetch, diff against the known set, apply transitions.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let Some(origin) = &self.origin else {
            return Ok(CycleReport::default());
        };
        let active = self.fetch(origin.as_ref()).await?;

        let mut known = self.known.lock().await;
        let mut report = CycleReport::default();

        let mut started: Vec<String> = active.difference(&known).cloned().collect();
        started.sort();
        let mut ended: Vec<String> = known.difference(&active).cloned().collect();
        ended.sort();

        for key in started {
            if self.apply_started(&key).await {
                known.insert(key.clone());
                report.started.push(key);
            }
        }
        for key in ended {
            if self.apply_ended(&key).await {
                known.remove(&key);
                report.ended.push(key);
            }
        }
        Ok(report)
    }

    /// Origin push: a mount began publishing.
    pub async fn signal_started(&self, mount: &str) {
        let key = mount_key(mount).to_string();
        let mut known = self.known.lock().await;
        if known.contains(&key) {
            return;
        }
        if self.apply_started(&key).await {
            known.insert(key);
        }
    }

    /// Origin push: a mount stopped publishing.
    pub async fn signal_ended(&self, mount: &str) {
        let key = mount_key(mount).to_string();
        let mut known = self.known.lock().await;
        if !known.contains(&key) {
            return;
        }
        if self.apply_ended(&key).await {
            known.remove(&key);
        }
    }

    /// Returns whether `key` should now count as known-active.
    async fn apply_started(&self, key: &str) -> bool {
        let station = match self.store.find_station_by_mount_key(key).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(mount = key, "active signal for a mount without a station");
                return false;
            }
            Err(e) => {
                warn!(mount = key, "station lookup failed: {e}");
                return false;
            }
        };
        match self.store.transition_status(&station.id, StationStatus::Live).await {
            Ok(()) => {
                info!(station = %station.id, mount = key, "stream started");
                let payload = self.payload(&station, key).await;
                self.bus.publish(Topic::StreamStart, payload.clone());
                if station.record_broadcasts {
                    self.bus.publish(Topic::RecordingStart, payload);
                }
                true
            }
            Err(EngineError::DuplicateTransition { .. }) => true,
            Err(e) => {
                warn!(station = %station.id, "live transition failed: {e}");
                false
            }
        }
    }

    /// Returns whether `key` should be dropped from the known set.
    async fn apply_ended(&self, key: &str) -> bool {
        let station = match self.store.find_station_by_mount_key(key).await {
            Ok(Some(s)) => s,
            Ok(None) => return true,
            Err(e) => {
                warn!(mount = key, "station lookup failed: {e}");
                return false;
            }
        };
        match self.store.transition_status(&station.id, StationStatus::Ended).await {
            Ok(()) => {
                info!(station = %station.id, mount = key, "stream ended");
                if let Err(e) = self.store.clear_now_playing(&station.id).await {
                    warn!(station = %station.id, "failed to clear now playing: {e}");
                }
                let payload = self.payload(&station, key).await;
                if station.record_broadcasts {
                    self.bus.publish(Topic::RecordingStop, payload.clone());
                }
                self.bus.publish(Topic::StreamStop, payload);
                true
            }
            Err(EngineError::DuplicateTransition { .. }) | Err(EngineError::StationNotFound(_)) => true,
            Err(e) => {
                warn!(station = %station.id, "ended transition failed: {e}");
                false
            }
        }
    }

    async fn payload(&self, station: &Station, key: &str) -> serde_json::Value {
        // Re-read so the payload carries the timestamps just written.
        let current = self.store.get_station(&station.id).await.ok();
        let st = current.as_ref().unwrap_or(station);
        json!({
            "stationId": st.id,
            "mount": key,
            "status": st.status,
            "actualStart": st.actual_start,
            "actualEnd": st.actual_end,
        })
    }

    /// Poll loop. `None` when no origin registry is configured.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.origin.as_ref()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match this.run_cycle().await {
                    Ok(report) if report != CycleReport::default() => {
                        debug!(started = ?report.started, ended = ?report.ended, "reconcile cycle");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("reconcile cycle skipped: {e}"),
                }
            }
        }))
    }
}
