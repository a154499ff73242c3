//! In-memory stand-ins for the external collaborators.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};

use crate::{
    error::{EngineError, Result},
    media_server::{instance_name, InstanceConfig, InstanceHandle, MediaServerControl},
    model::{now_rfc3339, StationId},
    origin::OriginRegistry,
    process::{ExitOutcome, ProcessHandle, ProcessSpec, ProcessSupervisor, StopSignal},
};

fn exit(code: i32) -> ExitOutcome {
    ExitOutcome {
        code: Some(code),
        success: code == 0,
        summary: None,
    }
}

#[derive(Default)]
struct ProcState {
    next_id: u64,
    by_name: HashMap<String, Vec<(u64, ProcessSpec)>>,
    exits: HashMap<u64, oneshot::Sender<ExitOutcome>>,
    waiters: HashMap<u64, oneshot::Receiver<ExitOutcome>>,
    signals: HashMap<String, usize>,
    fail_next: bool,
}

/// Processes that run until signalled or told to exit.
#[derive(Default)]
pub struct FakeProcesses {
    state: Mutex<ProcState>,
}

impl FakeProcesses {
    fn state(&self) -> std::sync::MutexGuard<'_, ProcState> {
        self.state.lock().unwrap()
    }

    pub fn spawned(&self, name: &str) -> usize {
        self.state().by_name.get(name).map_or(0, Vec::len)
    }

    pub fn signalled(&self, name: &str) -> usize {
        self.state().signals.get(name).copied().unwrap_or(0)
    }

    pub fn last_spec(&self, name: &str) -> Option<ProcessSpec> {
        self.state()
            .by_name
            .get(name)
            .and_then(|v| v.last())
            .map(|(_, spec)| spec.clone())
    }

    /// Make the most recent process with this name exit on its own.
    pub fn exit_latest(&self, name: &str, code: i32) {
        let mut st = self.state();
        let id = st.by_name.get(name).and_then(|v| v.last()).map(|(id, _)| *id);
        if let Some(tx) = id.and_then(|id| st.exits.remove(&id)) {
            let _ = tx.send(exit(code));
        }
    }

    pub fn fail_next_spawn(&self) {
        self.state().fail_next = true;
    }
}

#[async_trait]
impl ProcessSupervisor for FakeProcesses {
    async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let mut st = self.state();
        if std::mem::take(&mut st.fail_next) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", spec.program),
            )));
        }
        st.next_id += 1;
        let id = st.next_id;
        let (tx, rx) = oneshot::channel();
        st.exits.insert(id, tx);
        st.waiters.insert(id, rx);
        let name = spec.name.clone();
        st.by_name.entry(name.clone()).or_default().push((id, spec));
        Ok(ProcessHandle { id, name, pid: None })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()> {
        let mut st = self.state();
        *st.signals.entry(handle.name.clone()).or_default() += 1;
        let code = match signal {
            StopSignal::Terminate => 143,
            StopSignal::Kill => 137,
        };
        if let Some(tx) = st.exits.remove(&handle.id) {
            let _ = tx.send(exit(code));
        }
        Ok(())
    }

    async fn await_exit(&self, handle: &ProcessHandle) -> ExitOutcome {
        let rx = self.state().waiters.remove(&handle.id);
        match rx {
            Some(rx) => rx.await.unwrap_or_default(),
            None => ExitOutcome::default(),
        }
    }
}

#[derive(Default)]
struct MediaState {
    next_id: u64,
    starts: HashMap<StationId, usize>,
    stops: HashMap<StationId, usize>,
    kills: HashMap<StationId, usize>,
    configs: HashMap<StationId, InstanceConfig>,
    current: HashMap<StationId, (u64, oneshot::Sender<ExitOutcome>)>,
    waiters: HashMap<u64, oneshot::Receiver<ExitOutcome>>,
    fail_next: bool,
}

/// Media server tier that records every admin call.
#[derive(Default)]
pub struct FakeMediaServer {
    state: Mutex<MediaState>,
    kicked: Notify,
}

impl FakeMediaServer {
    fn state(&self) -> std::sync::MutexGuard<'_, MediaState> {
        self.state.lock().unwrap()
    }

    pub fn starts(&self, id: &StationId) -> usize {
        self.state().starts.get(id).copied().unwrap_or(0)
    }

    pub fn stops(&self, id: &StationId) -> usize {
        self.state().stops.get(id).copied().unwrap_or(0)
    }

    pub fn kills(&self, id: &StationId) -> usize {
        self.state().kills.get(id).copied().unwrap_or(0)
    }

    pub fn last_config(&self, id: &StationId) -> Option<InstanceConfig> {
        self.state().configs.get(id).cloned()
    }

    pub fn is_running(&self, id: &StationId) -> bool {
        self.state().current.contains_key(id)
    }

    pub fn fail_next_start(&self) {
        self.state().fail_next = true;
    }

    /// Resolves once a source has been kicked (immediately if one already was).
    pub async fn source_kicked(&self) {
        self.kicked.notified().await
    }

    /// The station's instance dies without being asked to.
    pub fn crash(&self, id: &StationId) {
        if let Some((_, tx)) = self.state().current.remove(id) {
            let _ = tx.send(exit(1));
        }
    }
}

#[async_trait]
impl MediaServerControl for FakeMediaServer {
    async fn start_instance(&self, config: InstanceConfig) -> Result<InstanceHandle> {
        let mut st = self.state();
        let station = config.station_id.clone();
        *st.starts.entry(station.clone()).or_default() += 1;
        if std::mem::take(&mut st.fail_next) {
            return Err(EngineError::Internal("port already in use".into()));
        }
        st.next_id += 1;
        let id = st.next_id;
        let (tx, rx) = oneshot::channel();
        st.current.insert(station.clone(), (id, tx));
        st.waiters.insert(id, rx);
        let port = config.port;
        st.configs.insert(station.clone(), config);
        Ok(InstanceHandle {
            instance_id: instance_name(&station),
            port,
            process_id: id,
            pid: None,
            started_at: now_rfc3339(),
        })
    }

    async fn stop_instance(&self, station: &StationId) -> Result<()> {
        let mut st = self.state();
        *st.stops.entry(station.clone()).or_default() += 1;
        if let Some((_, tx)) = st.current.remove(station) {
            let _ = tx.send(exit(0));
        }
        Ok(())
    }

    async fn kill_active_source(&self, station: &StationId, _mount: &str) -> Result<()> {
        *self.state().kills.entry(station.clone()).or_default() += 1;
        self.kicked.notify_one();
        Ok(())
    }

    async fn wait_instance(&self, handle: &InstanceHandle) -> ExitOutcome {
        let rx = self.state().waiters.remove(&handle.process_id);
        match rx {
            Some(rx) => rx.await.unwrap_or_default(),
            None => ExitOutcome::default(),
        }
    }
}

#[derive(Default)]
struct OriginState {
    active: HashSet<String>,
    fail: bool,
    hang: bool,
}

/// Origin registry whose answer the test controls.
#[derive(Default)]
pub struct FakeOrigin {
    state: Mutex<OriginState>,
}

impl FakeOrigin {
    pub fn set(&self, keys: &[&str]) {
        self.state.lock().unwrap().active = keys.iter().map(|k| k.to_string()).collect();
    }

    pub fn fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }
}

#[async_trait]
impl OriginRegistry for FakeOrigin {
    async fn list_active_signals(&self) -> Result<HashSet<String>> {
        let (active, fail, hang) = {
            let st = self.state.lock().unwrap();
            (st.active.clone(), st.fail, st.hang)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(EngineError::OriginUnreachable("connection refused".into()));
        }
        Ok(active)
    }
}
