use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::StationId;

struct Pending {
    generation: u64,
    label: &'static str,
    handle: JoinHandle<()>,
}

/// Delayed, cancellable work keyed by station.
///
/// At most one pending task per station: scheduling again supersedes (aborts)
/// the previous one. A task leaves the table when its delay elapses, before its
/// body runs, so cancellation only ever aborts work that has not started.
#[derive(Default)]
pub struct Scheduler {
    tasks: Arc<Mutex<HashMap<StationId, Pending>>>,
    next_generation: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, station: &StationId, label: &'static str, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks_for_task = self.tasks.clone();
        let key = station.clone();

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut tasks = tasks_for_task.lock().unwrap_or_else(|e| e.into_inner());
                if tasks.get(&key).map(|p| p.generation) == Some(generation) {
                    tasks.remove(&key);
                }
            }
            work.await;
        });

        if let Some(prev) = tasks.insert(
            station.clone(),
            Pending {
                generation,
                label,
                handle,
            },
        ) {
            debug!(station = %station, "{} superseded by {label}", prev.label);
            prev.handle.abort();
        }
    }

    /// Abort the pending task for a station. Returns whether one was pending.
    pub fn cancel(&self, station: &StationId) -> bool {
        let prev = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(station);
        match prev {
            Some(p) => {
                debug!(station = %station, "cancelled pending {}", p.label);
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self, station: &StationId) -> Option<&'static str> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(station)
            .map(|p| p.label)
    }
}
