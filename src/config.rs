use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

// Engine configuration.
//
// Everything is read from `STATIONCAST_*` environment variables once at
// startup. Unset variables fall back to defaults that match the installer
// layout under /opt/stationcast/shared.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub bind: SocketAddr,
    /// Base URL the media server uses to reach our hook endpoints.
    pub hook_base_url: String,
    pub base_port: u16,
    pub max_port: u16,
    /// Per-station config artifacts, feeds and pidfiles live below this dir.
    pub runtime_dir: PathBuf,
    pub icecast_bin: String,
    pub ffmpeg_bin: String,
    pub admin_password: String,
    pub origin_url: Option<String>,
    pub reconcile_interval: Duration,
    pub origin_timeout: Duration,
    pub autodj_backoff: Duration,
    pub live_debounce: Duration,
    pub auth_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "/opt/stationcast/shared/stationcast.db".into(),
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            hook_base_url: "http://127.0.0.1:3000".into(),
            base_port: 8100,
            max_port: 8199,
            runtime_dir: PathBuf::from("/opt/stationcast/shared/stations"),
            icecast_bin: "icecast".into(),
            ffmpeg_bin: "ffmpeg".into(),
            admin_password: fastrand_secret(24),
            origin_url: None,
            reconcile_interval: Duration::from_secs(5),
            origin_timeout: Duration::from_millis(3000),
            autodj_backoff: Duration::from_secs(3),
            live_debounce: Duration::from_millis(1500),
            auth_timeout: Duration::from_millis(2000),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = var("STATIONCAST_DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = var("STATIONCAST_BIND") {
            cfg.bind = v
                .parse()
                .with_context(|| format!("STATIONCAST_BIND is not a socket address: {v}"))?;
        }
        cfg.hook_base_url = var("STATIONCAST_PUBLIC_HOOK_URL")
            .unwrap_or_else(|| format!("http://{}", cfg.bind));
        if let Some(v) = var("STATIONCAST_BASE_PORT") {
            cfg.base_port = parse("STATIONCAST_BASE_PORT", &v)?;
        }
        if let Some(v) = var("STATIONCAST_MAX_PORT") {
            cfg.max_port = parse("STATIONCAST_MAX_PORT", &v)?;
        }
        if let Some(v) = var("STATIONCAST_RUNTIME_DIR") {
            cfg.runtime_dir = PathBuf::from(v);
        }
        if let Some(v) = var("STATIONCAST_ICECAST") {
            cfg.icecast_bin = v;
        }
        if let Some(v) = var("STATIONCAST_FFMPEG") {
            cfg.ffmpeg_bin = v;
        }
        if let Some(v) = var("STATIONCAST_ADMIN_PASSWORD") {
            cfg.admin_password = v;
        }
        cfg.origin_url = var("STATIONCAST_ORIGIN_URL");
        if let Some(v) = var("STATIONCAST_RECONCILE_SECS") {
            cfg.reconcile_interval = Duration::from_secs(parse("STATIONCAST_RECONCILE_SECS", &v)?);
        }
        if let Some(v) = var("STATIONCAST_ORIGIN_TIMEOUT_MS") {
            cfg.origin_timeout = Duration::from_millis(parse("STATIONCAST_ORIGIN_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("STATIONCAST_AUTODJ_BACKOFF_SECS") {
            cfg.autodj_backoff = Duration::from_secs(parse("STATIONCAST_AUTODJ_BACKOFF_SECS", &v)?);
        }
        if let Some(v) = var("STATIONCAST_LIVE_DEBOUNCE_MS") {
            cfg.live_debounce = Duration::from_millis(parse("STATIONCAST_LIVE_DEBOUNCE_MS", &v)?);
        }
        if let Some(v) = var("STATIONCAST_AUTH_TIMEOUT_MS") {
            cfg.auth_timeout = Duration::from_millis(parse("STATIONCAST_AUTH_TIMEOUT_MS", &v)?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_port == 0 {
            anyhow::bail!("STATIONCAST_BASE_PORT must be non-zero");
        }
        if self.base_port > self.max_port {
            anyhow::bail!(
                "port pool is empty: base port {} > max port {}",
                self.base_port,
                self.max_port
            );
        }
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("STATIONCAST_RECONCILE_SECS must be at least 1");
        }
        if self.admin_password.trim().is_empty() {
            anyhow::bail!("STATIONCAST_ADMIN_PASSWORD must not be empty");
        }
        Ok(())
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("{name} has an invalid value: {value}"))
}

/// Random alphanumeric secret, used for source and admin passwords.
pub fn fastrand_secret(len: usize) -> String {
    std::iter::repeat_with(fastrand::alphanumeric).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.admin_password.len(), 24);
    }

    #[test]
    fn inverted_port_pool_is_rejected() {
        let cfg = EngineConfig {
            base_port: 9000,
            max_port: 8999,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn secrets_are_alphanumeric() {
        let s = fastrand_secret(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
