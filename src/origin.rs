use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    error::{EngineError, Result},
    model::mount_key,
};

/// The authoritative record of which mounts carry a signal right now.
#[async_trait]
pub trait OriginRegistry: Send + Sync + 'static {
    async fn list_active_signals(&self) -> Result<HashSet<String>>;
}

/// Origin answers either with a bare list of mounts or wrapped in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignalList {
    Bare(Vec<String>),
    Wrapped { active: Vec<String> },
}

impl SignalList {
    fn into_keys(self) -> HashSet<String> {
        let raw = match self {
            SignalList::Bare(v) => v,
            SignalList::Wrapped { active } => active,
        };
        raw.iter()
            .map(|m| mount_key(m))
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub struct HttpOriginRegistry {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpOriginRegistry {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl OriginRegistry for HttpOriginRegistry {
    async fn list_active_signals(&self) -> Result<HashSet<String>> {
        let unreachable = |e: reqwest::Error| EngineError::OriginUnreachable(e.to_string());
        let resp = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?;
        let list: SignalList = resp.json().await.map_err(unreachable)?;
        Ok(list.into_keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(body: &str) -> HashSet<String> {
        serde_json::from_str::<SignalList>(body).unwrap().into_keys()
    }

    #[test]
    fn accepts_both_body_shapes_and_normalizes_mounts() {
        let expected: HashSet<String> = ["foo".to_string(), "bar".to_string()].into();
        assert_eq!(keys(r#"["/foo", "bar"]"#), expected);
        assert_eq!(keys(r#"{"active": ["foo", "/bar", ""]}"#), expected);
        assert!(keys("[]").is_empty());
    }

    #[tokio::test]
    async fn unreachable_origin_is_origin_unreachable() {
        // Nothing listens on port 9 of the loopback interface.
        let origin = HttpOriginRegistry::new("http://127.0.0.1:9/active".into(), Duration::from_millis(500));
        let err = origin.list_active_signals().await.unwrap_err();
        assert!(matches!(err, EngineError::OriginUnreachable(_)));
    }
}
