use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::{EngineError, Result},
    model::{now_rfc3339, Station, StationId},
    process::{pid_alive, signal_pid, ExitOutcome, ProcessHandle, ProcessSpec, ProcessSupervisor, StopSignal},
    registry::{StationGuard, StationRegistry},
    scheduler::Scheduler,
    store::Store,
};

// --- Media server instances (Icecast) --------------------------------------
//
// One Icecast process per station, bound to the station's leased port, with
// source authentication delegated back to us through Icecast's URL auth.
// Instances are started with everything baked into their config file, so a
// changed password or port always means stop-then-start.

/// Everything an instance is created with.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub station_id: StationId,
    pub station_name: String,
    pub port: u16,
    pub mount_point: String,
    pub source_password: String,
    pub admin_password: String,
    pub hook_base_url: String,
}

impl InstanceConfig {
    pub fn instance_name(&self) -> String {
        instance_name(&self.station_id)
    }
}

pub fn instance_name(station: &StationId) -> String {
    format!("icecast-{station}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHandle {
    pub instance_id: String,
    pub port: u16,
    #[serde(skip)]
    pub process_id: u64,
    pub pid: Option<u32>,
    pub started_at: String,
}

/// Administrative control over the media-server tier.
#[async_trait]
pub trait MediaServerControl: Send + Sync + 'static {
    async fn start_instance(&self, config: InstanceConfig) -> Result<InstanceHandle>;

    /// Stop the instance named after the station. Not-found is success.
    async fn stop_instance(&self, station: &StationId) -> Result<()>;

    /// Kick whatever source is connected to `mount`.
    async fn kill_active_source(&self, station: &StationId, mount: &str) -> Result<()>;

    /// Resolve when the instance process exits.
    async fn wait_instance(&self, handle: &InstanceHandle) -> ExitOutcome;
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_icecast_config(cfg: &InstanceConfig, dir: &Path) -> String {
    let hook = cfg.hook_base_url.trim_end_matches('/');
    let logdir = dir.join("log");
    format!(
        r#"<icecast>
    <location>stationcast</location>
    <admin>{name}</admin>
    <limits>
        <clients>500</clients>
        <sources>2</sources>
        <queue-size>524288</queue-size>
        <source-timeout>10</source-timeout>
        <burst-size>65535</burst-size>
    </limits>
    <authentication>
        <source-password>{source_password}</source-password>
        <admin-user>admin</admin-user>
        <admin-password>{admin_password}</admin-password>
    </authentication>
    <hostname>localhost</hostname>
    <listen-socket>
        <port>{port}</port>
    </listen-socket>
    <mount type="normal">
        <mount-name>{mount}</mount-name>
        <authentication type="url">
            <option name="stream_auth" value="{hook}/api/v1/hooks/icecast/auth"/>
            <option name="mount_remove" value="{hook}/api/v1/hooks/icecast/disconnect"/>
            <option name="auth_header" value="icecast-auth-user: 1"/>
        </authentication>
    </mount>
    <paths>
        <logdir>{logdir}</logdir>
        <webroot>/usr/share/icecast2/web</webroot>
        <adminroot>/usr/share/icecast2/admin</adminroot>
    </paths>
    <logging>
        <errorlog>-</errorlog>
        <loglevel>2</loglevel>
    </logging>
    <security>
        <chroot>0</chroot>
    </security>
</icecast>
"#,
        name = xml_escape(&cfg.station_name),
        source_password = xml_escape(&cfg.source_password),
        admin_password = xml_escape(&cfg.admin_password),
        port = cfg.port,
        mount = xml_escape(&cfg.mount_point),
        hook = xml_escape(hook),
        logdir = xml_escape(&logdir.to_string_lossy()),
    )
}

/// Create `dir` readable by the engine user only.
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

pub(crate) fn write_private_file(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// `MediaServerControl` that runs Icecast processes through a `ProcessSupervisor`.
pub struct IcecastControl {
    supervisor: Arc<dyn ProcessSupervisor>,
    runtime_dir: PathBuf,
    icecast_bin: String,
    admin_password: String,
    http: reqwest::Client,
    running: Mutex<HashMap<StationId, (ProcessHandle, u16)>>,
}

impl IcecastControl {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        runtime_dir: PathBuf,
        icecast_bin: String,
        admin_password: String,
    ) -> Self {
        Self {
            supervisor,
            runtime_dir,
            icecast_bin,
            admin_password,
            http: reqwest::Client::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn station_dir(&self, station: &StationId) -> PathBuf {
        self.runtime_dir.join(station.as_str())
    }

    fn pidfile(&self, station: &StationId) -> PathBuf {
        self.station_dir(station).join("icecast.pid")
    }

    fn config_path(&self, station: &StationId) -> PathBuf {
        self.station_dir(station).join("icecast.xml")
    }

    /// Stop an instance left behind by a previous engine run.
    async fn stop_stale(&self, station: &StationId) -> Result<()> {
        let pidfile = self.pidfile(station);
        let pid = match tokio::fs::read_to_string(&pidfile).await {
            Ok(s) => s.trim().parse::<u32>().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let _ = tokio::fs::remove_file(&pidfile).await;

        let Some(pid) = pid else {
            return Ok(());
        };
        // Pids get reused; only touch the process if it still runs our config.
        let config = self.config_path(station);
        if !pid_runs_config(pid, &config) {
            debug!(station = %station, pid, "stale pidfile points at nothing of ours");
            return Ok(());
        }
        info!(station = %station, pid, "stopping instance from previous run");
        signal_pid(pid, StopSignal::Terminate)?;
        wait_pid_gone(pid, Duration::from_secs(5)).await;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn pid_runs_config(pid: u32, config: &Path) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let needle = config.to_string_lossy();
            raw.split(|b| *b == 0)
                .any(|arg| String::from_utf8_lossy(arg) == needle)
        }
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn pid_runs_config(pid: u32, _config: &Path) -> bool {
    pid_alive(pid)
}

async fn wait_pid_gone(pid: u32, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            warn!(pid, "instance ignored SIGTERM; killing");
            let _ = signal_pid(pid, StopSignal::Kill);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[async_trait]
impl MediaServerControl for IcecastControl {
    async fn start_instance(&self, config: InstanceConfig) -> Result<InstanceHandle> {
        let station = config.station_id.clone();
        let dir = self.station_dir(&station);
        let path = self.config_path(&station);
        let xml = render_icecast_config(&config, &dir);
        {
            let dir = dir.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                create_private_dir(&dir)?;
                create_private_dir(&dir.join("log"))?;
                write_private_file(&path, &xml)
            })
            .await??;
        }

        let handle = self
            .supervisor
            .spawn(ProcessSpec {
                name: config.instance_name(),
                program: self.icecast_bin.clone(),
                args: vec!["-c".into(), path.to_string_lossy().to_string()],
                redact: vec![config.source_password.clone(), config.admin_password.clone()],
                cwd: Some(dir),
            })
            .await?;

        if let Some(pid) = handle.pid {
            tokio::fs::write(self.pidfile(&station), pid.to_string()).await?;
        }

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(station, (handle.clone(), config.port));

        Ok(InstanceHandle {
            instance_id: handle.name.clone(),
            port: config.port,
            process_id: handle.id,
            pid: handle.pid,
            started_at: now_rfc3339(),
        })
    }

    async fn stop_instance(&self, station: &StationId) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(station);

        match running {
            Some((handle, _port)) => {
                self.supervisor.signal(&handle, StopSignal::Terminate).await?;
                if let Some(pid) = handle.pid {
                    wait_pid_gone(pid, Duration::from_secs(5)).await;
                }
                let _ = tokio::fs::remove_file(self.pidfile(station)).await;
                Ok(())
            }
            None => self.stop_stale(station).await,
        }
    }

    async fn kill_active_source(&self, station: &StationId, mount: &str) -> Result<()> {
        let port = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(station)
            .map(|(_, port)| *port);
        let Some(port) = port else {
            return Ok(());
        };

        let url = reqwest::Url::parse_with_params(
            &format!("http://127.0.0.1:{port}/admin/killsource"),
            &[("mount", mount)],
        )
        .map_err(|e| EngineError::Internal(format!("bad killsource url: {e}")))?;
        let resp = self
            .http
            .get(url)
            .basic_auth("admin", Some(&self.admin_password))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| EngineError::Internal(format!("killsource request failed: {e}")))?;

        // Icecast answers 400 when no source is mounted; nothing to kick.
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::BAD_REQUEST {
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "killsource on {mount} returned {}",
                resp.status()
            )))
        }
    }

    async fn wait_instance(&self, handle: &InstanceHandle) -> ExitOutcome {
        let process = ProcessHandle {
            id: handle.process_id,
            name: handle.instance_id.clone(),
            pid: handle.pid,
        };
        self.supervisor.await_exit(&process).await
    }
}

/// Media Server Lifecycle Manager: one fresh instance per station.
pub struct MediaServerManager {
    control: Arc<dyn MediaServerControl>,
    registry: Arc<StationRegistry>,
    store: Store,
    restarts: Scheduler,
    admin_password: String,
    hook_base_url: String,
    restart_backoff: Duration,
}

impl MediaServerManager {
    pub fn new(
        control: Arc<dyn MediaServerControl>,
        registry: Arc<StationRegistry>,
        store: Store,
        admin_password: String,
        hook_base_url: String,
        restart_backoff: Duration,
    ) -> Self {
        Self {
            control,
            registry,
            store,
            restarts: Scheduler::new(),
            admin_password,
            hook_base_url,
            restart_backoff,
        }
    }

    pub fn control(&self) -> &Arc<dyn MediaServerControl> {
        &self.control
    }

    pub async fn ensure_running(self: &Arc<Self>, station: &Station) -> Result<InstanceHandle> {
        let guard = self.registry.lock(&station.id).await;
        self.ensure_running_locked(&guard, station).await
    }

    /// Stop whatever instance the station has, then start a fresh one.
    pub async fn ensure_running_locked(
        self: &Arc<Self>,
        guard: &StationGuard,
        station: &Station,
    ) -> Result<InstanceHandle> {
        let port = station.port.ok_or_else(|| EngineError::InstanceStartFailed {
            station: station.id.to_string(),
            reason: "station has no port lease".into(),
        })?;

        self.restarts.cancel(&station.id);
        self.registry.take_instance(guard);
        if let Err(e) = self.control.stop_instance(&station.id).await {
            warn!(station = %station.id, "tearing down previous instance failed: {e}");
        }

        let config = InstanceConfig {
            station_id: station.id.clone(),
            station_name: station.name.clone(),
            port,
            mount_point: station.mount_point.clone(),
            source_password: station.source_password.clone(),
            admin_password: self.admin_password.clone(),
            hook_base_url: self.hook_base_url.clone(),
        };
        let handle = self
            .control
            .start_instance(config)
            .await
            .map_err(|e| EngineError::InstanceStartFailed {
                station: station.id.to_string(),
                reason: e.to_string(),
            })?;

        info!(station = %station.id, port, instance = %handle.instance_id, "media server instance started");
        self.registry.set_instance(guard, handle.clone());
        self.watch(station.id.clone(), handle.clone());
        Ok(handle)
    }

    fn watch(self: &Arc<Self>, station: StationId, handle: InstanceHandle) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.control.wait_instance(&handle).await;
            let guard = this.registry.lock(&station).await;
            if this.registry.instance(&station).as_ref() != Some(&handle) {
                // Replaced or stopped on purpose.
                return;
            }
            this.registry.take_instance(&guard);
            drop(guard);
            warn!(
                station = %station,
                code = ?outcome.code,
                last_error = outcome.summary.as_deref().unwrap_or(""),
                "media server instance exited unexpectedly; restarting in {:?}",
                this.restart_backoff
            );
            let again = this.clone();
            let id = station.clone();
            this.restarts.schedule(&station, "instance restart", this.restart_backoff, async move {
                again.restart_if_active(&id).await;
            });
        });
    }

    async fn restart_if_active(self: &Arc<Self>, id: &StationId) {
        let station = match self.store.get_station(id).await {
            Ok(s) => s,
            Err(e) => {
                debug!(station = %id, "instance restart skipped: {e}");
                return;
            }
        };
        if !station.is_active {
            return;
        }
        let guard = self.registry.lock(id).await;
        if self.registry.instance(id).is_some() {
            return;
        }
        if let Err(e) = self.ensure_running_locked(&guard, &station).await {
            warn!(station = %id, "instance restart failed: {e}");
        }
    }

    pub async fn stop(&self, id: &StationId) -> Result<()> {
        let guard = self.registry.lock(id).await;
        self.stop_locked(&guard).await
    }

    pub async fn stop_locked(&self, guard: &StationGuard) -> Result<()> {
        let id = guard.station();
        self.restarts.cancel(id);
        let had = self.registry.take_instance(guard);
        self.control.stop_instance(id).await?;
        if had.is_some() {
            info!(station = %id, "media server instance stopped");
        }
        Ok(())
    }

    /// Startup pass: fresh instance for every station that should be on air.
    pub async fn relaunch_active(self: &Arc<Self>, stations: &[Station]) -> Vec<(StationId, Result<InstanceHandle>)> {
        let mut tasks = Vec::new();
        for station in stations.iter().filter(|s| s.is_active).cloned() {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                let res = this.ensure_running(&station).await;
                (station.id, res)
            }));
        }
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(r) => out.push(r),
                Err(e) => warn!("relaunch task failed: {e}"),
            }
        }
        out
    }
}
