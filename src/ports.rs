use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::{
    error::{EngineError, Result},
    model::StationId,
    store::db_used_ports,
};

/// A station's hold on one port from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortLease {
    pub port: u16,
    pub station_id: StationId,
}

/// Lowest-free-port policy over `[base, max]`.
///
/// There is no counter: the set of used ports is always recomputed from the
/// station rows, so whatever the database says is the truth after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base: u16,
    max: u16,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self { base, max }
    }

    pub fn capacity(&self) -> usize {
        if self.max < self.base {
            0
        } else {
            (self.max - self.base) as usize + 1
        }
    }

    /// Pick the lowest port without a lease. Must run inside the transaction
    /// that persists the lease.
    pub fn allocate(&self, conn: &Connection) -> Result<u16> {
        let used = db_used_ports(conn)?;
        self.lowest_free(used.iter().copied())
    }

    pub fn lowest_free(&self, used: impl IntoIterator<Item = u16>) -> Result<u16> {
        let used: BTreeSet<u16> = used.into_iter().collect();
        (self.base..=self.max)
            .find(|p| !used.contains(p))
            .ok_or(EngineError::PoolExhausted {
                base: self.base,
                max: self.max,
            })
    }
}
