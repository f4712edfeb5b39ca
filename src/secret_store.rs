//! Per-car persistence: reconnection keys, saved sessions, trusted-device
//! tokens and handles, plus the small set of installation-wide records in
//! SPEC_FULL.md 3.1.
//!
//! Modeled on the SQLite-backed `Database` in the reference P2P messaging
//! app (`db.rs`): a single `Mutex<Connection>`, migrations run once at open,
//! and opaque BLOB columns for anything that isn't a small fixed record.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{AssociationHandle, CarRecord, EscrowToken, ReconnectionKey, SessionBlob};

/// Narrow persistence trait so the core never depends on SQLite directly;
/// tests substitute an in-memory `HashMap`-backed fake.
pub trait SecretStore: Send + Sync {
    fn put_car(&self, id: Uuid, record: &CarRecord) -> CoreResult<()>;
    fn get_car(&self, id: Uuid) -> CoreResult<Option<CarRecord>>;
    fn delete_car(&self, id: Uuid) -> CoreResult<()>;
    fn list_car_ids(&self) -> CoreResult<Vec<Uuid>>;

    fn put_key(&self, id: Uuid, key: &ReconnectionKey) -> CoreResult<()>;
    fn get_key(&self, id: Uuid) -> CoreResult<Option<ReconnectionKey>>;
    fn delete_key(&self, id: Uuid) -> CoreResult<()>;

    fn put_session(&self, id: Uuid, session: &SessionBlob) -> CoreResult<()>;
    fn get_session(&self, id: Uuid) -> CoreResult<Option<SessionBlob>>;
    fn delete_session(&self, id: Uuid) -> CoreResult<()>;

    fn put_token(&self, id: Uuid, token: EscrowToken) -> CoreResult<()>;
    fn get_token(&self, id: Uuid) -> CoreResult<Option<EscrowToken>>;
    fn delete_token(&self, id: Uuid) -> CoreResult<()>;

    fn put_handle(&self, id: Uuid, handle: &AssociationHandle) -> CoreResult<()>;
    fn get_handle(&self, id: Uuid) -> CoreResult<Option<AssociationHandle>>;
    fn delete_handle(&self, id: Uuid) -> CoreResult<()>;

    /// Removes every record associated with `id` in one call. Callers rely
    /// on this being atomic: after it returns, `get_key`/`get_session`/
    /// `get_token`/`get_handle`/`get_car` all return `None` for `id`.
    fn dissociate(&self, id: Uuid) -> CoreResult<()>;

    /// Reads or lazily generates the 16-byte installation device id
    /// persisted at the `device_id` logical key (SPEC_FULL.md 3.1).
    fn device_id(&self) -> CoreResult<[u8; 16]>;
}

/// SQLite-backed implementation, one local file, bundled so the demo binary
/// has no external library dependency.
pub struct SqliteSecretStore {
    conn: Mutex<Connection>,
}

impl SqliteSecretStore {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cars (
                id TEXT PRIMARY KEY,
                name TEXT
            );
            CREATE TABLE IF NOT EXISTS reconnection_keys (
                car_id TEXT PRIMARY KEY,
                key BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                car_id TEXT PRIMARY KEY,
                blob BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tokens (
                car_id TEXT PRIMARY KEY,
                token INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS handles (
                car_id TEXT PRIMARY KEY,
                handle BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS installation (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

}

impl SecretStore for SqliteSecretStore {
    fn put_car(&self, id: Uuid, record: &CarRecord) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute(
            "INSERT INTO cars (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id.to_string(), record.name],
        )?;
        Ok(())
    }

    fn get_car(&self, id: Uuid) -> CoreResult<Option<CarRecord>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let name: Option<Option<String>> = conn
            .query_row("SELECT name FROM cars WHERE id = ?1", params![id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(name.map(|name| CarRecord { name }))
    }

    fn delete_car(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute("DELETE FROM cars WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn list_car_ids(&self) -> CoreResult<Vec<Uuid>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id FROM cars ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            if let Ok(id) = Uuid::parse_str(&row?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn put_key(&self, id: Uuid, key: &ReconnectionKey) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute(
            "INSERT INTO reconnection_keys (car_id, key) VALUES (?1, ?2)
             ON CONFLICT(car_id) DO UPDATE SET key = excluded.key",
            params![id.to_string(), key.0.to_vec()],
        )?;
        Ok(())
    }

    fn get_key(&self, id: Uuid) -> CoreResult<Option<ReconnectionKey>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT key FROM reconnection_keys WHERE car_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.and_then(|b| {
            if b.len() == 32 {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&b);
                Some(ReconnectionKey(arr))
            } else {
                None
            }
        }))
    }

    fn delete_key(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute("DELETE FROM reconnection_keys WHERE car_id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn put_session(&self, id: Uuid, session: &SessionBlob) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute(
            "INSERT INTO sessions (car_id, blob) VALUES (?1, ?2)
             ON CONFLICT(car_id) DO UPDATE SET blob = excluded.blob",
            params![id.to_string(), session.0],
        )?;
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> CoreResult<Option<SessionBlob>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let bytes: Option<Vec<u8>> = conn
            .query_row("SELECT blob FROM sessions WHERE car_id = ?1", params![id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(bytes.map(SessionBlob))
    }

    fn delete_session(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute("DELETE FROM sessions WHERE car_id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn put_token(&self, id: Uuid, token: EscrowToken) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute(
            "INSERT INTO tokens (car_id, token) VALUES (?1, ?2)
             ON CONFLICT(car_id) DO UPDATE SET token = excluded.token",
            params![id.to_string(), token.0 as i64],
        )?;
        Ok(())
    }

    fn get_token(&self, id: Uuid) -> CoreResult<Option<EscrowToken>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let value: Option<i64> = conn
            .query_row("SELECT token FROM tokens WHERE car_id = ?1", params![id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.map(|v| EscrowToken(v as u64)))
    }

    fn delete_token(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute("DELETE FROM tokens WHERE car_id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn put_handle(&self, id: Uuid, handle: &AssociationHandle) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute(
            "INSERT INTO handles (car_id, handle) VALUES (?1, ?2)
             ON CONFLICT(car_id) DO UPDATE SET handle = excluded.handle",
            params![id.to_string(), handle.0],
        )?;
        Ok(())
    }

    fn get_handle(&self, id: Uuid) -> CoreResult<Option<AssociationHandle>> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let bytes: Option<Vec<u8>> = conn
            .query_row("SELECT handle FROM handles WHERE car_id = ?1", params![id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(bytes.map(AssociationHandle))
    }

    fn delete_handle(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        conn.execute("DELETE FROM handles WHERE car_id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn dissociate(&self, id: Uuid) -> CoreResult<()> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let id_str = id.to_string();
        conn.execute("DELETE FROM reconnection_keys WHERE car_id = ?1", params![id_str])?;
        conn.execute("DELETE FROM sessions WHERE car_id = ?1", params![id_str])?;
        conn.execute("DELETE FROM tokens WHERE car_id = ?1", params![id_str])?;
        conn.execute("DELETE FROM handles WHERE car_id = ?1", params![id_str])?;
        conn.execute("DELETE FROM cars WHERE id = ?1", params![id_str])?;
        Ok(())
    }

    fn device_id(&self) -> CoreResult<[u8; 16]> {
        let conn = self.conn.lock().expect("secret store mutex poisoned");
        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM installation WHERE key = 'device_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(bytes) = existing {
            let mut out = [0u8; 16];
            out.copy_from_slice(&bytes[..16]);
            return Ok(out);
        }
        let generated: [u8; 16] = crate::crypto::random_array();
        conn.execute(
            "INSERT INTO installation (key, value) VALUES ('device_id', ?1)",
            params![generated.to_vec()],
        )?;
        Ok(generated)
    }
}
