//! SQLite database for meshgate state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Shared connection handle. Callers lock it for the duration of one
    /// statement or transaction.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Users
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                given_name TEXT NOT NULL DEFAULT '',
                family_name TEXT NOT NULL DEFAULT '',
                picture TEXT,
                locale TEXT,
                verified_email INTEGER NOT NULL DEFAULT 0
            );

            -- Devices
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                machine_name TEXT NOT NULL,
                platform TEXT NOT NULL DEFAULT '',
                ip_address TEXT,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                UNIQUE(device_id, user_id),
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_devices_device_id ON devices(device_id);
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

            -- Overlay address leases, one per device, never freed
            CREATE TABLE IF NOT EXISTS address_leases (
                device_pk TEXT PRIMARY KEY,
                network TEXT NOT NULL,
                address TEXT NOT NULL,
                address_num INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(network, address_num),
                FOREIGN KEY(device_pk) REFERENCES devices(id) ON DELETE CASCADE
            );

            -- Peers in externally managed overlay networks
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                machine_name TEXT NOT NULL,
                network_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                platform TEXT,
                ip_address TEXT,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                UNIQUE(network_id, node_id),
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_peers_network_user ON peers(network_id, user_id);
            "#,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_creates_tables() {
        let db = Database::open_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'devices', 'address_leases', 'peers')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_open_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        Database::open(&path).unwrap();
        Database::open(&path).unwrap();
        assert!(path.exists());
    }
}
