//! Device and peer registry
//!
//! The relay and the trust authority only talk to persistence through
//! [`DeviceRegistry`]. [`SqliteRegistry`] is the production implementation
//! on top of the shared [`Database`].

use crate::address::AddressAllocator;
use crate::db::Database;
use crate::types::{now_millis, Device, NewDevice, NewPeer, Peer, User, UserProfile};
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

/// Read/write interface to users, devices, leases and peers
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Create the user on first login, refresh the profile afterwards.
    async fn upsert_user(&self, profile: &UserProfile) -> Result<User>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    /// First-or-create on `(device_id, user_id)`.
    async fn register_device(&self, user_id: Uuid, device: &NewDevice) -> Result<Device>;

    async fn find_user_device(&self, user_id: Uuid, device_id: &str) -> Result<Option<Device>>;

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>>;

    /// Return the device's lease, allocating the next address in the
    /// allocator's network if it has none. Read-highest, compute and insert
    /// happen atomically.
    async fn lease_address(&self, device_pk: Uuid, allocator: &AddressAllocator) -> Result<Ipv4Addr>;

    /// Upsert on `(network_id, node_id)`.
    async fn upsert_peer(&self, user_id: Uuid, peer: &NewPeer) -> Result<Peer>;

    async fn list_peers(&self, user_id: Uuid, network_id: &str) -> Result<Vec<Peer>>;
}

/// SQLite-backed registry
#[derive(Clone)]
pub struct SqliteRegistry {
    db: Database,
}

const DEVICE_COLUMNS: &str =
    "id, device_id, user_id, machine_name, platform, ip_address, created, updated";

const USER_COLUMNS: &str =
    "id, subject, email, name, given_name, family_name, picture, locale, verified_email";

const PEER_COLUMNS: &str =
    "id, machine_name, network_id, node_id, user_id, platform, ip_address, created, updated";

impl SqliteRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl DeviceRegistry for SqliteRegistry {
    async fn upsert_user(&self, profile: &UserProfile) -> Result<User> {
        if profile.email.trim().is_empty() {
            return Err(Error::InvalidInput("profile has no email".to_string()));
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO users (id, subject, email, name, given_name, family_name, picture, locale, verified_email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(email) DO UPDATE SET
                name = excluded.name,
                given_name = excluded.given_name,
                family_name = excluded.family_name,
                picture = excluded.picture,
                verified_email = excluded.verified_email",
            params![
                Uuid::new_v4().to_string(),
                profile.id,
                profile.email,
                profile.name,
                profile.given_name,
                profile.family_name,
                profile.picture,
                profile.locale,
                profile.verified_email,
            ],
        )?;

        let user = conn.query_row(
            &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
            params![profile.email],
            user_from_row,
        )?;
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    async fn register_device(&self, user_id: Uuid, device: &NewDevice) -> Result<Device> {
        device.validate()?;
        let now = now_millis();

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO devices (id, device_id, user_id, machine_name, platform, ip_address, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
             ON CONFLICT(device_id, user_id) DO UPDATE SET
                machine_name = excluded.machine_name,
                platform = excluded.platform,
                updated = excluded.updated",
            params![
                Uuid::new_v4().to_string(),
                device.device_id,
                user_id.to_string(),
                device.machine_name,
                device.platform,
                now,
            ],
        )?;

        let registered = conn.query_row(
            &format!(
                "SELECT {} FROM devices WHERE device_id = ?1 AND user_id = ?2",
                DEVICE_COLUMNS
            ),
            params![device.device_id, user_id.to_string()],
            device_from_row,
        )?;

        debug!("Registered device {} for user {}", registered.device_id, user_id);
        Ok(registered)
    }

    async fn find_user_device(&self, user_id: Uuid, device_id: &str) -> Result<Option<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let device = conn
            .query_row(
                &format!(
                    "SELECT {} FROM devices WHERE device_id = ?1 AND user_id = ?2",
                    DEVICE_COLUMNS
                ),
                params![device_id, user_id.to_string()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE user_id = ?1 ORDER BY created ASC, rowid ASC",
            DEVICE_COLUMNS
        ))?;

        let rows = stmt.query_map(params![user_id.to_string()], device_from_row)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    async fn lease_address(&self, device_pk: Uuid, allocator: &AddressAllocator) -> Result<Ipv4Addr> {
        let network = allocator.network_key();

        let conn = self.db.connection();
        let mut conn = conn.lock();
        // IMMEDIATE takes the write lock up front, so two connections to the
        // same file cannot both read the same highest address.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT address FROM address_leases WHERE device_pk = ?1",
                params![device_pk.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(address) = existing {
            return address
                .parse()
                .map_err(|_| Error::Internal(format!("corrupt lease address {}", address)));
        }

        let known: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1)",
                params![device_pk.to_string()],
                |row| row.get(0),
            )?;
        if !known {
            return Err(Error::not_found("device", device_pk.to_string()));
        }

        let highest: Option<i64> = tx.query_row(
            "SELECT MAX(address_num) FROM address_leases WHERE network = ?1",
            params![network],
            |row| row.get(0),
        )?;
        let highest = highest.and_then(|n| u32::try_from(n).ok()).map(Ipv4Addr::from);

        let address = allocator.next_after(highest)?;
        let now = now_millis();

        tx.execute(
            "INSERT INTO address_leases (device_pk, network, address, address_num, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device_pk.to_string(),
                network,
                address.to_string(),
                i64::from(u32::from(address)),
                now,
            ],
        )?;
        tx.execute(
            "UPDATE devices SET ip_address = ?1, updated = ?2 WHERE id = ?3",
            params![address.to_string(), now, device_pk.to_string()],
        )?;
        tx.commit()?;

        info!("Leased {} in {} to device {}", address, network, device_pk);
        Ok(address)
    }

    async fn upsert_peer(&self, user_id: Uuid, peer: &NewPeer) -> Result<Peer> {
        peer.validate()?;
        let now = now_millis();

        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "INSERT INTO peers (id, machine_name, network_id, node_id, user_id, platform, ip_address, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)
             ON CONFLICT(network_id, node_id) DO UPDATE SET
                machine_name = excluded.machine_name,
                platform = excluded.platform,
                updated = excluded.updated
             WHERE peers.user_id = excluded.user_id",
            params![
                Uuid::new_v4().to_string(),
                peer.machine_name,
                peer.network_id,
                peer.node_id,
                user_id.to_string(),
                peer.platform,
                now,
            ],
        )?;

        // Zero rows: the node is already registered by someone else
        if changed == 0 {
            return Err(Error::Unauthorized(format!(
                "node {} in network {} belongs to another user",
                peer.node_id, peer.network_id
            )));
        }

        let stored = conn.query_row(
            &format!(
                "SELECT {} FROM peers WHERE network_id = ?1 AND node_id = ?2 AND user_id = ?3",
                PEER_COLUMNS
            ),
            params![peer.network_id, peer.node_id, user_id.to_string()],
            peer_from_row,
        )?;
        Ok(stored)
    }

    async fn list_peers(&self, user_id: Uuid, network_id: &str) -> Result<Vec<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE network_id = ?1 AND user_id = ?2 ORDER BY created ASC, rowid ASC",
            PEER_COLUMNS
        ))?;

        let rows = stmt.query_map(params![network_id, user_id.to_string()], peer_from_row)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: uuid_column(row, 0)?,
        device_id: row.get(1)?,
        user_id: uuid_column(row, 2)?,
        machine_name: row.get(3)?,
        platform: row.get(4)?,
        ip_address: row.get(5)?,
        created: row.get(6)?,
        updated: row.get(7)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_column(row, 0)?,
        subject: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        given_name: row.get(4)?,
        family_name: row.get(5)?,
        picture: row.get(6)?,
        locale: row.get(7)?,
        verified_email: row.get(8)?,
    })
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: uuid_column(row, 0)?,
        machine_name: row.get(1)?,
        network_id: row.get(2)?,
        node_id: row.get(3)?,
        user_id: uuid_column(row, 4)?,
        platform: row.get(5)?,
        ip_address: row.get(6)?,
        created: row.get(7)?,
        updated: row.get(8)?,
    })
}
