use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::{
    config::fastrand_secret,
    error::{EngineError, Result},
    model::{
        now_rfc3339, slugify, DjCredential, NewStation, NowPlaying, SessionRecord, Station,
        StationId, StationSettings, StationStatus, Track,
    },
    ports::{PortAllocator, PortLease},
};

// --- Persistence (SQLite) -------------------------------------------------
//
// One connection guarded by a mutex. rusqlite is synchronous, so every call
// goes through `spawn_blocking`. Read-modify-write sequences (port allocation,
// mount derivation, status transitions) run inside IMMEDIATE transactions so
// two requests can never both observe a port or mount as free.

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS stations (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            description         TEXT,
            mount_point         TEXT NOT NULL UNIQUE,
            port                INTEGER UNIQUE,
            source_password     TEXT NOT NULL,
            auto_dj_enabled     INTEGER NOT NULL,
            default_playlist_id TEXT,
            record_broadcasts   INTEGER NOT NULL DEFAULT 0,
            is_active           INTEGER NOT NULL DEFAULT 0,
            status              TEXT NOT NULL DEFAULT 'idle',
            actual_start        TEXT,
            actual_end          TEXT,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS djs (
            id                TEXT PRIMARY KEY,
            station_id        TEXT NOT NULL REFERENCES stations(id) ON DELETE CASCADE,
            username          TEXT NOT NULL,
            password_hash     TEXT NOT NULL,
            active            INTEGER NOT NULL DEFAULT 1,
            last_connected_at TEXT,
            UNIQUE (station_id, username)
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id         TEXT PRIMARY KEY,
            station_id TEXT NOT NULL REFERENCES stations(id) ON DELETE CASCADE,
            name       TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tracks (
            id           TEXT PRIMARY KEY,
            station_id   TEXT NOT NULL REFERENCES stations(id) ON DELETE CASCADE,
            title        TEXT NOT NULL,
            artist       TEXT NOT NULL,
            path         TEXT NOT NULL,
            duration_sec INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            track_id    TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            position    INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_playlist_tracks_position
            ON playlist_tracks(playlist_id, position);

        CREATE TABLE IF NOT EXISTS now_playing (
            station_id  TEXT PRIMARY KEY REFERENCES stations(id) ON DELETE CASCADE,
            track_id    TEXT,
            live_source TEXT,
            title       TEXT NOT NULL,
            artist      TEXT NOT NULL,
            is_live     INTEGER NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS broadcast_sessions (
            id         TEXT PRIMARY KEY,
            station_id TEXT NOT NULL,
            kind       TEXT NOT NULL,
            source     TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at   TEXT NOT NULL,
            exit_code  INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_broadcast_sessions_station
            ON broadcast_sessions(station_id, started_at);
        "#,
    )?;
    Ok(())
}

#[cfg(not(test))]
const DJ_HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const DJ_HASH_COST: u32 = 4;

const STATION_COLUMNS: &str = "id, name, description, mount_point, port, source_password, \
     auto_dj_enabled, default_playlist_id, record_broadcasts, is_active, status, \
     actual_start, actual_end, created_at";

fn station_from_row(row: &Row<'_>) -> rusqlite::Result<Station> {
    Ok(Station {
        id: StationId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        mount_point: row.get(3)?,
        port: row.get::<_, Option<i64>>(4)?.map(|p| p as u16),
        source_password: row.get(5)?,
        auto_dj_enabled: row.get::<_, i64>(6)? != 0,
        default_playlist_id: row.get(7)?,
        record_broadcasts: row.get::<_, i64>(8)? != 0,
        is_active: row.get::<_, i64>(9)? != 0,
        status: StationStatus::parse(&row.get::<_, String>(10)?),
        actual_start: row.get(11)?,
        actual_end: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn db_get_station(conn: &Connection, id: &StationId) -> Result<Station> {
    conn.query_row(
        &format!("SELECT {STATION_COLUMNS} FROM stations WHERE id = ?1"),
        params![id.as_str()],
        station_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::StationNotFound(id.to_string()))
}

fn db_query_stations(conn: &Connection, filter: &str) -> Result<Vec<Station>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATION_COLUMNS} FROM stations {filter} ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([], station_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// First free mount among `/slug`, `/slug-2`, `/slug-3`, ...
fn db_unique_mount(conn: &Connection, name: &str) -> Result<String> {
    let slug = slugify(name);
    let mut candidate = format!("/{slug}");
    let mut n = 2u32;
    loop {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM stations WHERE mount_point = ?1)",
            params![candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
        candidate = format!("/{slug}-{n}");
        n += 1;
    }
}

pub(crate) fn db_used_ports(conn: &Connection) -> rusqlite::Result<Vec<u16>> {
    let mut stmt = conn.prepare("SELECT port FROM stations WHERE port IS NOT NULL ORDER BY port")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row? as u16);
    }
    Ok(out)
}

fn db_create_station(
    conn: &mut Connection,
    new: &NewStation,
    allocator: &PortAllocator,
) -> Result<Station> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidRequest("station name is empty".into()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // The port lease is the `port` column itself: allocating and inserting in
    // one transaction means a crash can never leave a leased-but-orphaned port.
    let port = allocator.allocate(&tx)?;
    let mount_point = db_unique_mount(&tx, name)?;
    let id = StationId::new();
    let created_at = now_rfc3339();

    tx.execute(
        "INSERT INTO stations (id, name, description, mount_point, port, source_password,
             auto_dj_enabled, default_playlist_id, record_broadcasts, is_active, status,
             actual_start, actual_end, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, 0, 'idle', NULL, NULL, ?9)",
        params![
            id.as_str(),
            name,
            new.description,
            mount_point,
            port as i64,
            fastrand_secret(24),
            if new.auto_dj_enabled { 1 } else { 0 },
            if new.record_broadcasts { 1 } else { 0 },
            created_at,
        ],
    )?;

    let station = db_get_station(&tx, &id)?;
    tx.commit()?;
    Ok(station)
}

fn db_assign_missing_ports(
    conn: &mut Connection,
    allocator: &PortAllocator,
) -> Result<Vec<PortLease>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let missing: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT id FROM stations WHERE port IS NULL ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut assigned = Vec::with_capacity(missing.len());
    for id in missing {
        let port = allocator.allocate(&tx)?;
        tx.execute(
            "UPDATE stations SET port = ?1 WHERE id = ?2 AND port IS NULL",
            params![port as i64, id],
        )?;
        assigned.push(PortLease {
            port,
            station_id: StationId(id),
        });
    }
    tx.commit()?;
    Ok(assigned)
}

fn db_update_settings(
    conn: &mut Connection,
    id: &StationId,
    settings: &StationSettings,
) -> Result<Station> {
    let tx = conn.transaction()?;
    let current = db_get_station(&tx, id)?;

    let name = match &settings.name {
        Some(n) if n.trim().is_empty() => {
            return Err(EngineError::InvalidRequest("station name is empty".into()))
        }
        Some(n) => n.trim().to_string(),
        None => current.name,
    };
    let description = match &settings.description {
        Some(d) => d.clone(),
        None => current.description,
    };
    let auto_dj_enabled = settings.auto_dj_enabled.unwrap_or(current.auto_dj_enabled);
    let default_playlist_id = match &settings.default_playlist_id {
        Some(Some(pl)) => {
            let owned = tx
                .query_row(
                    "SELECT 1 FROM playlists WHERE id = ?1 AND station_id = ?2",
                    params![pl, id.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !owned {
                return Err(EngineError::InvalidRequest(format!(
                    "playlist {pl} does not belong to station {id}"
                )));
            }
            Some(pl.clone())
        }
        Some(None) => None,
        None => current.default_playlist_id,
    };
    let record_broadcasts = settings.record_broadcasts.unwrap_or(current.record_broadcasts);

    tx.execute(
        "UPDATE stations SET name = ?1, description = ?2, auto_dj_enabled = ?3,
             default_playlist_id = ?4, record_broadcasts = ?5
         WHERE id = ?6",
        params![
            name,
            description,
            if auto_dj_enabled { 1 } else { 0 },
            default_playlist_id,
            if record_broadcasts { 1 } else { 0 },
            id.as_str(),
        ],
    )?;
    let station = db_get_station(&tx, id)?;
    tx.commit()?;
    Ok(station)
}

fn db_transition_status(conn: &Connection, id: &StationId, target: StationStatus) -> Result<()> {
    let now = now_rfc3339();
    let changed = match target {
        StationStatus::Live => conn.execute(
            "UPDATE stations SET status = 'live', actual_start = ?1, actual_end = NULL
             WHERE id = ?2 AND status <> 'live'",
            params![now, id.as_str()],
        )?,
        StationStatus::Ended => conn.execute(
            "UPDATE stations SET status = 'ended', actual_end = ?1
             WHERE id = ?2 AND status <> 'ended'",
            params![now, id.as_str()],
        )?,
        StationStatus::Idle => conn.execute(
            "UPDATE stations SET status = 'idle' WHERE id = ?1 AND status <> 'idle'",
            params![id.as_str()],
        )?,
    };

    if changed == 0 {
        // Either the row is gone or it already has the target status.
        db_get_station(conn, id)?;
        return Err(EngineError::DuplicateTransition {
            station: id.to_string(),
            status: target.to_string(),
        });
    }
    Ok(())
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        path: row.get(3)?,
        duration_sec: row.get::<_, i64>(4)?.max(0) as u32,
    })
}

fn db_playlist_tracks(conn: &Connection, playlist_id: &str) -> rusqlite::Result<Vec<Track>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.title, t.artist, t.path, t.duration_sec
         FROM playlist_tracks pt JOIN tracks t ON t.id = pt.track_id
         WHERE pt.playlist_id = ?1
         ORDER BY pt.position ASC",
    )?;
    let rows = stmt.query_map(params![playlist_id], track_from_row)?;
    rows.collect()
}

fn db_resolve_playlist(conn: &Connection, id: &StationId) -> Result<Vec<Track>> {
    let station = db_get_station(conn, id)?;
    let playlist_id = match station.default_playlist_id {
        Some(pl) => Some(pl),
        None => conn
            .query_row(
                "SELECT id FROM playlists WHERE station_id = ?1 AND is_default = 1
                 ORDER BY rowid LIMIT 1",
                params![id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?,
    };
    match playlist_id {
        Some(pl) => Ok(db_playlist_tracks(conn, &pl)?),
        None => Ok(Vec::new()),
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        db_init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db_init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| EngineError::Internal("store connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    // --- stations ---

    pub async fn create_station(&self, new: NewStation, allocator: PortAllocator) -> Result<Station> {
        self.call(move |conn| db_create_station(conn, &new, &allocator))
            .await
    }

    pub async fn assign_missing_ports(&self, allocator: PortAllocator) -> Result<Vec<PortLease>> {
        self.call(move |conn| db_assign_missing_ports(conn, &allocator))
            .await
    }

    pub async fn port_leases(&self) -> Result<Vec<PortLease>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT port, id FROM stations WHERE port IS NOT NULL ORDER BY port")?;
            let rows = stmt.query_map([], |row| {
                Ok(PortLease {
                    port: row.get::<_, i64>(0)? as u16,
                    station_id: StationId(row.get(1)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn get_station(&self, id: &StationId) -> Result<Station> {
        let id = id.clone();
        self.call(move |conn| db_get_station(conn, &id)).await
    }

    pub async fn list_stations(&self) -> Result<Vec<Station>> {
        self.call(|conn| db_query_stations(conn, "")).await
    }

    pub async fn list_active_stations(&self) -> Result<Vec<Station>> {
        self.call(|conn| db_query_stations(conn, "WHERE is_active = 1"))
            .await
    }

    pub async fn station_count(&self) -> Result<usize> {
        self.call(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM stations", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    pub async fn find_station_by_mount_key(&self, key: &str) -> Result<Option<Station>> {
        let mount = format!("/{}", crate::model::mount_key(key));
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {STATION_COLUMNS} FROM stations WHERE mount_point = ?1"),
                    params![mount],
                    station_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn update_settings(&self, id: &StationId, settings: StationSettings) -> Result<Station> {
        let id = id.clone();
        self.call(move |conn| db_update_settings(conn, &id, &settings))
            .await
    }

    pub async fn set_active(&self, id: &StationId, active: bool) -> Result<()> {
        let id = id.clone();
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE stations SET is_active = ?1 WHERE id = ?2",
                params![if active { 1 } else { 0 }, id.as_str()],
            )?;
            if n == 0 {
                return Err(EngineError::StationNotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    pub async fn auto_dj_enabled(&self, id: &StationId) -> Result<bool> {
        let id = id.clone();
        self.call(move |conn| {
            conn.query_row(
                "SELECT auto_dj_enabled FROM stations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v != 0)
            .ok_or_else(|| EngineError::StationNotFound(id.to_string()))
        })
        .await
    }

    pub async fn delete_station(&self, id: &StationId) -> Result<()> {
        let id = id.clone();
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM stations WHERE id = ?1", params![id.as_str()])?;
            if n == 0 {
                return Err(EngineError::StationNotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Conditional status write; `DuplicateTransition` when nothing changed.
    pub async fn transition_status(&self, id: &StationId, target: StationStatus) -> Result<()> {
        let id = id.clone();
        self.call(move |conn| db_transition_status(conn, &id, target))
            .await
    }

    // --- playlists / tracks ---

    /// Ordered tracks Auto DJ should play: the configured playlist, else the
    /// station's default playlist.
    pub async fn resolve_playlist(&self, id: &StationId) -> Result<Vec<Track>> {
        let id = id.clone();
        self.call(move |conn| db_resolve_playlist(conn, &id)).await
    }

    pub async fn create_playlist(&self, station: &StationId, name: &str, is_default: bool) -> Result<String> {
        let station = station.clone();
        let name = name.to_string();
        self.call(move |conn| {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO playlists (id, station_id, name, is_default) VALUES (?1, ?2, ?3, ?4)",
                params![id, station.as_str(), name, if is_default { 1 } else { 0 }],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn create_track(
        &self,
        station: &StationId,
        title: &str,
        artist: &str,
        path: &str,
        duration_sec: u32,
    ) -> Result<String> {
        let station = station.clone();
        let (title, artist, path) = (title.to_string(), artist.to_string(), path.to_string());
        self.call(move |conn| {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tracks (id, station_id, title, artist, path, duration_sec)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, station.as_str(), title, artist, path, duration_sec as i64],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn add_to_playlist(&self, playlist_id: &str, track_id: &str, position: i64) -> Result<()> {
        let (playlist_id, track_id) = (playlist_id.to_string(), track_id.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO playlist_tracks (playlist_id, track_id, position) VALUES (?1, ?2, ?3)",
                params![playlist_id, track_id, position],
            )?;
            Ok(())
        })
        .await
    }

    // --- DJs ---

    pub async fn create_dj(&self, station: &StationId, username: &str, password: &str) -> Result<String> {
        let station = station.clone();
        let username = username.to_string();
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, DJ_HASH_COST)).await??;
        self.call(move |conn| {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO djs (id, station_id, username, password_hash, active) VALUES (?1, ?2, ?3, ?4, 1)",
                params![id, station.as_str(), username, hash],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn set_dj_active(&self, dj_id: &str, active: bool) -> Result<()> {
        let dj_id = dj_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE djs SET active = ?1 WHERE id = ?2",
                params![if active { 1 } else { 0 }, dj_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn find_dj(&self, station: &StationId, username: &str) -> Result<Option<DjCredential>> {
        let station = station.clone();
        let username = username.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, station_id, username, password_hash, active FROM djs
                     WHERE station_id = ?1 AND username = ?2",
                    params![station.as_str(), username],
                    |row| {
                        Ok(DjCredential {
                            id: row.get(0)?,
                            station_id: StationId(row.get(1)?),
                            username: row.get(2)?,
                            password_hash: row.get(3)?,
                            active: row.get::<_, i64>(4)? != 0,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    pub async fn touch_dj_last_connected(&self, dj_id: &str) -> Result<()> {
        let dj_id = dj_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE djs SET last_connected_at = ?1 WHERE id = ?2",
                params![now_rfc3339(), dj_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn dj_last_connected(&self, dj_id: &str) -> Result<Option<String>> {
        let dj_id = dj_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT last_connected_at FROM djs WHERE id = ?1",
                    params![dj_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten())
        })
        .await
    }

    // --- now playing ---

    pub async fn set_now_playing(&self, np: NowPlaying) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO now_playing (station_id, track_id, live_source, title, artist, is_live, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(station_id) DO UPDATE SET
                   track_id=excluded.track_id,
                   live_source=excluded.live_source,
                   title=excluded.title,
                   artist=excluded.artist,
                   is_live=excluded.is_live,
                   updated_at=excluded.updated_at",
                params![
                    np.station_id.as_str(),
                    np.track_id,
                    np.live_source,
                    np.title,
                    np.artist,
                    if np.is_live { 1 } else { 0 },
                    np.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_now_playing(&self, id: &StationId) -> Result<()> {
        let id = id.clone();
        self.call(move |conn| {
            conn.execute("DELETE FROM now_playing WHERE station_id = ?1", params![id.as_str()])?;
            Ok(())
        })
        .await
    }

    pub async fn now_playing(&self, id: &StationId) -> Result<Option<NowPlaying>> {
        let id = id.clone();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT station_id, track_id, live_source, title, artist, is_live, updated_at
                     FROM now_playing WHERE station_id = ?1",
                    params![id.as_str()],
                    |row| {
                        Ok(NowPlaying {
                            station_id: StationId(row.get(0)?),
                            track_id: row.get(1)?,
                            live_source: row.get(2)?,
                            title: row.get(3)?,
                            artist: row.get(4)?,
                            is_live: row.get::<_, i64>(5)? != 0,
                            updated_at: row.get(6)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    // --- session history ---

    pub async fn append_session(&self, rec: SessionRecord) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO broadcast_sessions (id, station_id, kind, source, started_at, ended_at, exit_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rec.id,
                    rec.station_id.as_str(),
                    rec.kind,
                    rec.source,
                    rec.started_at,
                    rec.ended_at,
                    rec.exit_code,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_sessions(&self, id: &StationId) -> Result<Vec<SessionRecord>> {
        let id = id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, station_id, kind, source, started_at, ended_at, exit_code
                 FROM broadcast_sessions WHERE station_id = ?1
                 ORDER BY started_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![id.as_str()], |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    station_id: StationId(row.get(1)?),
                    kind: row.get(2)?,
                    source: row.get(3)?,
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    exit_code: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
