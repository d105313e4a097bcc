//! Embedded SQLite store for packet records, interface identities, and
//! per-application aggregates.
//!
//! A single connection serves all threads, serialized behind a mutex; WAL
//! journaling keeps readers unblocked. All writes are idempotent at the row
//! level, either by unique constraint or by the update-then-insert pattern.

use crate::direction::Direction;
use crate::error::NetmonError;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One row per observed IP packet. Appended exactly once, never updated.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: i64,
    pub src_ip: String,
    pub src_port: String,
    pub dst_ip: String,
    pub dst_port: String,
    pub protocol: String,
    pub length: u32,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub process_path: Option<String>,
    pub direction: Direction,
}

/// Flush payload for one application's aggregates.
#[derive(Debug, Clone)]
pub struct AppStatsRow {
    pub process_id: u32,
    pub process_name: String,
    pub process_path: String,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub destinations_json: String,
}

/// An `application_stats` row as read back at startup.
#[derive(Debug, Clone)]
pub struct StoredAppStats {
    pub id: i64,
    pub process_id: u32,
    pub process_name: String,
    pub process_path: String,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub destinations: String,
}

const CREATE_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS network_interfaces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(name, description)
    );

    CREATE TABLE IF NOT EXISTS packet_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        device_id INTEGER NOT NULL,
        src_ip TEXT NOT NULL,
        src_port TEXT NOT NULL,
        dst_ip TEXT NOT NULL,
        dst_port TEXT NOT NULL,
        protocol TEXT NOT NULL,
        length INTEGER NOT NULL,
        process_id INTEGER,
        process_name TEXT,
        process_path TEXT,
        direction TEXT
    );

    CREATE TABLE IF NOT EXISTS application_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        process_id INTEGER NOT NULL,
        process_name TEXT NOT NULL,
        process_path TEXT,
        total_packets INTEGER NOT NULL DEFAULT 0,
        total_bytes INTEGER NOT NULL DEFAULT 0,
        last_updated TIMESTAMP,
        destinations TEXT,
        first_seen TIMESTAMP,
        last_seen TIMESTAMP,
        UNIQUE(process_name, process_id)
    );

    CREATE TABLE IF NOT EXISTS protocol_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_stats_id INTEGER NOT NULL REFERENCES application_stats(id),
        protocol TEXT NOT NULL,
        packet_count INTEGER NOT NULL DEFAULT 0,
        UNIQUE(app_stats_id, protocol)
    );
"#;

// Kept separate from table creation: index creation must run after the
// legacy-schema migration, which may rebuild packet_logs.
const CREATE_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_timestamp ON packet_logs(timestamp);
    CREATE INDEX IF NOT EXISTS idx_protocol ON packet_logs(protocol);
    CREATE INDEX IF NOT EXISTS idx_process_name ON packet_logs(process_name);
    CREATE INDEX IF NOT EXISTS idx_device_id ON packet_logs(device_id);
    CREATE INDEX IF NOT EXISTS idx_app_process_name ON application_stats(process_name);
    CREATE INDEX IF NOT EXISTS idx_app_process_id ON application_stats(process_id);
    CREATE INDEX IF NOT EXISTS idx_proto_app_id ON protocol_stats(app_stats_id);
"#;

const REBUILD_LEGACY_PACKET_LOGS: &str = r#"
    BEGIN;

    CREATE TABLE packet_logs_new (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        device_id INTEGER NOT NULL,
        src_ip TEXT NOT NULL,
        src_port TEXT NOT NULL,
        dst_ip TEXT NOT NULL,
        dst_port TEXT NOT NULL,
        protocol TEXT NOT NULL,
        length INTEGER NOT NULL,
        process_id INTEGER,
        process_name TEXT,
        process_path TEXT,
        direction TEXT
    );

    INSERT INTO packet_logs_new (
        id, timestamp, device_id, src_ip, src_port, dst_ip, dst_port,
        protocol, length, process_id, process_name, process_path, direction
    )
    SELECT
        p.id, p.timestamp, COALESCE(ni.id, 0), p.src_ip, p.src_port,
        p.dst_ip, p.dst_port, p.protocol, p.length, p.process_id,
        p.process_name, p.process_path, p.direction
    FROM packet_logs p
    LEFT JOIN network_interfaces ni ON ni.name = p.device;

    DROP TABLE packet_logs;
    ALTER TABLE packet_logs_new RENAME TO packet_logs;

    COMMIT;
"#;

/// Handle to the on-disk store. One connection, any thread.
pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the store, applies pragmas, creates the
    /// schema, and runs pending migrations. `":memory:"` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NetmonError> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| NetmonError::StoreInitFailed(e.to_string()))?;
            }
            Connection::open(path)
        }
        .map_err(|e| NetmonError::StoreInitFailed(e.to_string()))?;

        let store = Self::initialize(conn)?;
        info!("packet store initialized at {}", path.display());
        Ok(store)
    }

    /// Database location under the per-user local application directory.
    pub fn default_path() -> Result<PathBuf, NetmonError> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| NetmonError::StoreInitFailed("no user directories available".into()))?;
        Ok(base
            .data_local_dir()
            .join("GripNetMonitor")
            .join("netmonitor.db"))
    }

    fn initialize(conn: Connection) -> Result<Self, NetmonError> {
        apply_pragmas(&conn).map_err(|e| NetmonError::StoreInitFailed(e.to_string()))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| NetmonError::StoreInitFailed(e.to_string()))?;
        migrate_schema(&conn).map_err(|e| NetmonError::StoreMigrationFailed(e.to_string()))?;
        conn.execute_batch(CREATE_INDEXES)
            .map_err(|e| NetmonError::StoreInitFailed(e.to_string()))?;

        Ok(Store {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Re-runs the forward-only migrations. A no-op on an up-to-date schema.
    pub fn migrate(&self) -> Result<()> {
        self.with_conn(migrate_schema)
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    /// Closes the underlying connection; later writes fail.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            if let Err((_, e)) = conn.close() {
                debug!("error closing store: {}", e);
            }
        }
    }

    /// Returns the id of the interface row matching (name, description),
    /// inserting one on first sight.
    pub fn upsert_interface(&self, name: &str, description: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM network_interfaces WHERE name = ?1 AND description = ?2",
                    params![name, description],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                return Ok(id);
            }

            conn.execute(
                "INSERT INTO network_interfaces (name, description, created_at) VALUES (?1, ?2, ?3)",
                params![name, description, Utc::now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Appends one packet row. Never retried; the caller logs failures and
    /// keeps capturing.
    pub fn append_packet(&self, record: &PacketRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO packet_logs (
                    timestamp, device_id, src_ip, src_port, dst_ip, dst_port,
                    protocol, length, process_id, process_name, process_path, direction
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.timestamp,
                    record.device_id,
                    record.src_ip,
                    record.src_port,
                    record.dst_ip,
                    record.dst_port,
                    record.protocol,
                    record.length,
                    record.process_id,
                    record.process_name,
                    record.process_path,
                    record.direction.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Writes one application's rollup, keyed on (process_name, process_id).
    pub fn upsert_app_stats(&self, row: &AppStatsRow) -> Result<()> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let updated = conn.execute(
                "UPDATE application_stats
                 SET process_path = ?1, total_packets = ?2, total_bytes = ?3,
                     last_updated = ?4, destinations = ?5, last_seen = ?4
                 WHERE process_name = ?6 AND process_id = ?7",
                params![
                    row.process_path,
                    row.total_packets as i64,
                    row.total_bytes as i64,
                    now,
                    row.destinations_json,
                    row.process_name,
                    row.process_id,
                ],
            )?;

            if updated == 0 {
                conn.execute(
                    "INSERT INTO application_stats (
                        process_id, process_name, process_path, total_packets,
                        total_bytes, last_updated, destinations, first_seen, last_seen
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?6)",
                    params![
                        row.process_id,
                        row.process_name,
                        row.process_path,
                        row.total_packets as i64,
                        row.total_bytes as i64,
                        now,
                        row.destinations_json,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Writes one per-application protocol counter.
    pub fn upsert_protocol_stats(
        &self,
        process_name: &str,
        process_id: u32,
        protocol: &str,
        packet_count: u64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let app_id: i64 = conn
                .query_row(
                    "SELECT id FROM application_stats WHERE process_name = ?1 AND process_id = ?2",
                    params![process_name, process_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| {
                    anyhow!(
                        "no application_stats row for {} (pid {})",
                        process_name,
                        process_id
                    )
                })?;

            conn.execute(
                "INSERT INTO protocol_stats (app_stats_id, protocol, packet_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(app_stats_id, protocol)
                 DO UPDATE SET packet_count = excluded.packet_count",
                params![app_id, protocol, packet_count as i64],
            )?;
            Ok(())
        })
    }

    pub fn get_all_app_stats(&self) -> Result<Vec<StoredAppStats>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, process_id, process_name, process_path,
                        total_packets, total_bytes, destinations
                 FROM application_stats",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredAppStats {
                    id: row.get(0)?,
                    process_id: row.get(1)?,
                    process_name: row.get(2)?,
                    process_path: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    total_packets: row.get::<_, i64>(4)? as u64,
                    total_bytes: row.get::<_, i64>(5)? as u64,
                    destinations: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                })
            })?;

            let mut stats = Vec::new();
            for row in rows {
                stats.push(row?);
            }
            Ok(stats)
        })
    }

    pub fn get_protocol_stats_for_app(&self, app_stats_id: i64) -> Result<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT protocol, packet_count FROM protocol_stats WHERE app_stats_id = ?1",
            )?;
            let rows = stmt.query_map(params![app_stats_id], |row| {
                Ok((row.get(0)?, row.get::<_, i64>(1)? as u64))
            })?;

            let mut protocols = Vec::new();
            for row in rows {
                protocols.push(row?);
            }
            Ok(protocols)
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => bail!("store is closed"),
        }
    }

    /// (device_id, direction, process_id, process_name) per stored packet.
    #[cfg(test)]
    pub(crate) fn packet_log_rows(&self) -> Result<Vec<(i64, String, Option<u32>, Option<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, direction, process_id, process_name
                 FROM packet_logs ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -2000i64)?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Forward-only migrations.
///
/// 1. Adds the `direction` column to `packet_logs` when missing.
/// 2. Replaces the legacy `device` text column with `device_id`, copying
///    rows by joining on the interface name. Rows whose device matches no
///    known interface keep `device_id = 0` as a sentinel.
fn migrate_schema(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "packet_logs", "direction")? {
        info!("migrating packet_logs: adding direction column");
        conn.execute("ALTER TABLE packet_logs ADD COLUMN direction TEXT", [])?;
    }

    if column_exists(conn, "packet_logs", "device")? {
        info!("migrating packet_logs: replacing device name column with device_id");
        conn.execute_batch(REBUILD_LEGACY_PACKET_LOGS)?;
        conn.execute_batch(CREATE_INDEXES)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Store {
        Store::open(":memory:").unwrap()
    }

    fn record(direction: Direction) -> PacketRecord {
        PacketRecord {
            timestamp: Utc::now(),
            device_id: 1,
            src_ip: "10.0.0.1".into(),
            src_port: "5555".into(),
            dst_ip: "8.8.8.8".into(),
            dst_port: "443".into(),
            protocol: "TCP".into(),
            length: 120,
            process_id: Some(42),
            process_name: Some("curl".into()),
            process_path: Some("/usr/bin/curl".into()),
            direction,
        }
    }

    #[test]
    fn upsert_interface_is_idempotent() {
        let store = memory_store();

        let first = store.upsert_interface("eth0", "Ethernet").unwrap();
        for _ in 0..4 {
            assert_eq!(store.upsert_interface("eth0", "Ethernet").unwrap(), first);
        }

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM network_interfaces WHERE name = 'eth0'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);

        // A different description is a different interface identity.
        let other = store.upsert_interface("eth0", "Virtual").unwrap();
        assert_ne!(other, first);
    }

    #[test]
    fn append_packet_round_trips() {
        let store = memory_store();
        store.append_packet(&record(Direction::Outgoing)).unwrap();

        let (direction, pid): (String, Option<u32>) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT direction, process_id FROM packet_logs",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(direction, "outgoing");
        assert_eq!(pid, Some(42));
    }

    #[test]
    fn app_stats_update_then_insert() {
        let store = memory_store();
        let mut row = AppStatsRow {
            process_id: 42,
            process_name: "curl".into(),
            process_path: "/usr/bin/curl".into(),
            total_packets: 10,
            total_bytes: 1200,
            destinations_json: r#"["8.8.8.8"]"#.into(),
        };

        store.upsert_app_stats(&row).unwrap();
        row.total_packets = 25;
        row.total_bytes = 3000;
        store.upsert_app_stats(&row).unwrap();

        let (count, packets): (i64, i64) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MAX(total_packets) FROM application_stats",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(packets, 25);
    }

    #[test]
    fn protocol_stats_conflict_updates_count() {
        let store = memory_store();
        store
            .upsert_app_stats(&AppStatsRow {
                process_id: 42,
                process_name: "curl".into(),
                process_path: "/usr/bin/curl".into(),
                total_packets: 1,
                total_bytes: 100,
                destinations_json: "[]".into(),
            })
            .unwrap();

        store.upsert_protocol_stats("curl", 42, "TCP", 5).unwrap();
        store.upsert_protocol_stats("curl", 42, "TCP", 9).unwrap();
        store.upsert_protocol_stats("curl", 42, "UDP", 2).unwrap();

        let apps = store.get_all_app_stats().unwrap();
        assert_eq!(apps.len(), 1);
        let mut protocols = store.get_protocol_stats_for_app(apps[0].id).unwrap();
        protocols.sort();
        assert_eq!(
            protocols,
            vec![("TCP".to_string(), 9), ("UDP".to_string(), 2)]
        );
    }

    #[test]
    fn protocol_stats_requires_app_row() {
        let store = memory_store();
        assert!(store.upsert_protocol_stats("ghost", 1, "TCP", 1).is_err());
    }

    #[test]
    fn migrate_twice_is_noop() {
        let store = memory_store();

        let columns_before: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('packet_logs')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();

        store.migrate().unwrap();
        store.migrate().unwrap();

        let columns_after: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('packet_logs')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(columns_before, columns_after);
    }

    #[test]
    fn legacy_device_column_migrates_to_device_id() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE network_interfaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(name, description)
            );
            INSERT INTO network_interfaces (name, description) VALUES ('eth0', '');
            INSERT INTO network_interfaces (name, description) VALUES ('wlan0', '');

            CREATE TABLE packet_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                device TEXT NOT NULL,
                src_ip TEXT NOT NULL,
                src_port TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                dst_port TEXT NOT NULL,
                protocol TEXT NOT NULL,
                length INTEGER NOT NULL,
                process_id INTEGER,
                process_name TEXT,
                process_path TEXT
            );
            INSERT INTO packet_logs (device, src_ip, src_port, dst_ip, dst_port, protocol, length)
                VALUES ('eth0', '10.0.0.1', '1', '8.8.8.8', '2', 'TCP', 10);
            INSERT INTO packet_logs (device, src_ip, src_port, dst_ip, dst_port, protocol, length)
                VALUES ('wlan0', '10.0.0.2', '3', '8.8.4.4', '4', 'UDP', 20);
            INSERT INTO packet_logs (device, src_ip, src_port, dst_ip, dst_port, protocol, length)
                VALUES ('gone0', '10.0.0.3', '5', '1.1.1.1', '6', 'TCP', 30);
            "#,
        )
        .unwrap();

        let store = Store::initialize(conn).unwrap();

        let device_ids: Vec<i64> = store
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT device_id FROM packet_logs ORDER BY id")?;
                let ids = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .unwrap();
        // eth0 and wlan0 resolve by name; the unknown device falls back to 0.
        assert_eq!(device_ids, vec![1, 2, 0]);

        let (has_direction, index_count): (bool, i64) = store
            .with_conn(|conn| {
                let direction = column_exists(conn, "packet_logs", "direction")?;
                let indexes: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'
                     AND name IN ('idx_timestamp', 'idx_protocol', 'idx_process_name', 'idx_device_id')",
                    [],
                    |r| r.get(0),
                )?;
                Ok((direction, indexes))
            })
            .unwrap();
        assert!(has_direction);
        assert_eq!(index_count, 4);

        assert!(!column_exists_in(&store, "device"));
    }

    fn column_exists_in(store: &Store, column: &str) -> bool {
        store
            .with_conn(|conn| column_exists(conn, "packet_logs", column))
            .unwrap()
    }

    #[test]
    fn closed_store_rejects_writes() {
        let store = memory_store();
        assert!(store.is_initialized());
        store.close();
        assert!(!store.is_initialized());
        assert!(store.append_packet(&record(Direction::Internal)).is_err());
    }
}
