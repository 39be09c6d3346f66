//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for mytoken. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking. State changes
//! run in `IMMEDIATE` transactions so that the write lock is taken before the
//! first read of a read-modify-write sequence.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mytoken_core::{
    CapabilitySet, ClientMetaData, ConsentDecision, ConsentState, Event, EventKind, ExchangeError,
    ExchangeState, MytokenId, Restriction, Usage, UsageKind, UsedRestriction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    AccessTokenRecord, MytokenEntry, NewExchange, NewMytoken, Store, StoredExchange, StoredMytoken,
    UsageClaim,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }

    /// Run `f` in an immediate transaction on the blocking pool. Any error
    /// rolls the whole transaction back.
    async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn id_from_blob(bytes: Vec<u8>) -> Result<MytokenId> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData("mytoken id must be 16 bytes".into()))?;
    Ok(MytokenId::from_bytes(arr))
}

fn opt_id_from_blob(bytes: Option<Vec<u8>>) -> Result<Option<MytokenId>> {
    bytes.map(id_from_blob).transpose()
}

struct MytokenRow {
    id: Vec<u8>,
    parent_id: Option<Vec<u8>>,
    oidc_iss: String,
    oidc_sub: String,
    name: Option<String>,
    capabilities: Vec<u8>,
    subtoken_capabilities: Option<Vec<u8>>,
    created_at: i64,
    expires_at: Option<i64>,
    ip: String,
    revoked: bool,
}

impl MytokenRow {
    const COLUMNS: &'static str = "id, parent_id, oidc_iss, oidc_sub, name, capabilities, \
         subtoken_capabilities, created_at, expires_at, ip, revoked";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            oidc_iss: row.get("oidc_iss")?,
            oidc_sub: row.get("oidc_sub")?,
            name: row.get("name")?,
            capabilities: row.get("capabilities")?,
            subtoken_capabilities: row.get("subtoken_capabilities")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            ip: row.get("ip")?,
            revoked: row.get("revoked")?,
        })
    }

    fn into_stored(self, restrictions: Vec<UsedRestriction>) -> Result<StoredMytoken> {
        Ok(StoredMytoken {
            id: id_from_blob(self.id)?,
            parent_id: opt_id_from_blob(self.parent_id)?,
            oidc_iss: self.oidc_iss,
            oidc_sub: self.oidc_sub,
            name: self.name,
            capabilities: from_cbor(&self.capabilities)?,
            subtoken_capabilities: self
                .subtoken_capabilities
                .as_deref()
                .map(from_cbor::<CapabilitySet>)
                .transpose()?,
            restrictions,
            created_at: self.created_at,
            expires_at: self.expires_at,
            ip: self.ip,
            revoked: self.revoked,
        })
    }
}

struct ExchangeRow {
    code: String,
    consent_code: Option<String>,
    created_at: i64,
    expires_at: i64,
    consent: String,
    flow: Option<Vec<u8>>,
    mytoken_id: Option<Vec<u8>>,
    token_attached: bool,
    claimed: bool,
}

impl ExchangeRow {
    const SELECT: &'static str = "SELECT code, consent_code, created_at, expires_at, consent, flow, \
         mytoken_id, token IS NOT NULL AS token_attached, claimed FROM pending_exchanges";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            code: row.get("code")?,
            consent_code: row.get("consent_code")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            consent: row.get("consent")?,
            flow: row.get("flow")?,
            mytoken_id: row.get("mytoken_id")?,
            token_attached: row.get("token_attached")?,
            claimed: row.get("claimed")?,
        })
    }

    fn into_stored(self) -> Result<StoredExchange> {
        let consent = ConsentState::from_name(&self.consent)
            .ok_or_else(|| StoreError::InvalidData(format!("consent state {}", self.consent)))?;
        Ok(StoredExchange {
            code: self.code,
            consent_code: self.consent_code,
            created_at: self.created_at,
            expires_at: self.expires_at,
            consent,
            flow: self.flow.as_deref().map(from_cbor).transpose()?,
            mytoken_id: opt_id_from_blob(self.mytoken_id)?,
            token_attached: self.token_attached,
            claimed: self.claimed,
        })
    }
}

fn load_mytoken(conn: &Connection, id: &MytokenId) -> Result<Option<StoredMytoken>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM mytokens WHERE id = ?1", MytokenRow::COLUMNS),
            params![id.as_bytes().as_slice()],
            MytokenRow::from_row,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT clause, usages_at_done, usages_other_done FROM restrictions
         WHERE mytoken_id = ?1 ORDER BY idx",
    )?;
    let raw = stmt
        .query_map(params![id.as_bytes().as_slice()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let restrictions = raw
        .into_iter()
        .map(|(clause, at, other)| {
            Ok(UsedRestriction {
                restriction: from_cbor::<Restriction>(&clause)?,
                usage: Usage {
                    at: at as u64,
                    other: other as u64,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    row.into_stored(restrictions).map(Some)
}

fn load_exchange(conn: &Connection, column: &str, value: &str) -> Result<Option<StoredExchange>> {
    conn.query_row(
        &format!("{} WHERE {} = ?1", ExchangeRow::SELECT, column),
        params![value],
        ExchangeRow::from_row,
    )
    .optional()?
    .map(ExchangeRow::into_stored)
    .transpose()
}

// ─────────────────────────────────────────────────────────────────────────────
// Transaction steps
// ─────────────────────────────────────────────────────────────────────────────

/// Conditionally increment a clause counter.
fn charge(conn: &Connection, usage: &UsageClaim) -> Result<()> {
    let sql = match usage.kind {
        UsageKind::AccessToken => {
            "UPDATE restrictions SET usages_at_done = usages_at_done + 1
             WHERE mytoken_id = ?1 AND idx = ?2
               AND (usages_at IS NULL OR usages_at_done < usages_at)"
        }
        UsageKind::Other => {
            "UPDATE restrictions SET usages_other_done = usages_other_done + 1
             WHERE mytoken_id = ?1 AND idx = ?2
               AND (usages_other IS NULL OR usages_other_done < usages_other)"
        }
    };

    let changed = conn.execute(
        sql,
        params![usage.mytoken_id.as_bytes().as_slice(), usage.clause as i64],
    )?;
    if changed == 0 {
        return Err(StoreError::UsageExhausted {
            mytoken_id: usage.mytoken_id,
            clause: usage.clause,
        });
    }
    Ok(())
}

fn append_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (mytoken_id, event, time, comment, ip, user_agent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.mytoken_id.as_bytes().as_slice(),
            event.kind.as_str(),
            event.time,
            event.comment,
            event.ip,
            event.user_agent,
        ],
    )?;
    Ok(())
}

fn append_events(conn: &Connection, events: &[Event]) -> Result<()> {
    events.iter().try_for_each(|e| append_event(conn, e))
}

fn insert_mytoken_row(conn: &Connection, m: &NewMytoken) -> Result<()> {
    let rt_id: i64 = match &m.refresh_token {
        Some(token) => {
            conn.execute(
                "INSERT INTO refresh_tokens (token, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![token, m.created_at],
            )?;
            conn.last_insert_rowid()
        }
        None => {
            let parent = m.parent_id.ok_or_else(|| {
                StoreError::InvalidData("a root mytoken needs a refresh token".into())
            })?;
            conn.query_row(
                "SELECT rt_id FROM mytokens WHERE id = ?1",
                params![parent.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("parent mytoken {}", parent)))?
        }
    };

    let subtoken_capabilities = m.subtoken_capabilities.as_ref().map(to_cbor).transpose()?;
    conn.execute(
        "INSERT INTO mytokens (
            id, parent_id, rt_id, oidc_iss, oidc_sub, name, capabilities,
            subtoken_capabilities, created_at, expires_at, ip, revoked
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
        params![
            m.id.as_bytes().as_slice(),
            m.parent_id.as_ref().map(|p| p.as_bytes().to_vec()),
            rt_id,
            m.oidc_iss,
            m.oidc_sub,
            m.name,
            to_cbor(&m.capabilities)?,
            subtoken_capabilities,
            m.created_at,
            m.expires_at,
            m.ip,
        ],
    )?;

    for (idx, clause) in m.restrictions.iter().enumerate() {
        conn.execute(
            "INSERT INTO restrictions (mytoken_id, idx, clause, usages_at, usages_other)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                m.id.as_bytes().as_slice(),
                idx as i64,
                to_cbor(clause)?,
                clause.usages_at.map(|v| v as i64),
                clause.usages_other.map(|v| v as i64),
            ],
        )?;
    }

    if let Some(short) = &m.short_token {
        conn.execute(
            "INSERT INTO short_tokens (short_token, mytoken_id, token) VALUES (?1, ?2, ?3)",
            params![short.short, m.id.as_bytes().as_slice(), short.long],
        )?;
    }

    if let Some(transfer) = &m.transfer {
        insert_exchange_row(conn, transfer)?;
    }

    Ok(())
}

fn insert_exchange_row(conn: &Connection, ex: &NewExchange) -> Result<()> {
    let flow = ex.flow.as_ref().map(to_cbor).transpose()?;
    conn.execute(
        "INSERT INTO pending_exchanges (
            code, consent_code, created_at, expires_at, consent, flow, mytoken_id, token, claimed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        params![
            ex.code,
            ex.consent_code,
            ex.created_at,
            ex.expires_at,
            ex.consent.as_str(),
            flow,
            ex.mytoken_id.as_ref().map(|id| id.as_bytes().to_vec()),
            ex.token,
        ],
    )?;
    Ok(())
}

const SUBTREE: &str = "WITH RECURSIVE subtree(id) AS (
        SELECT id FROM mytokens WHERE id = ?1
        UNION ALL
        SELECT m.id FROM mytokens m JOIN subtree s ON m.parent_id = s.id
    )";

fn subtree_ids(conn: &Connection, root: &MytokenId, sql: &str) -> Result<Vec<MytokenId>> {
    let mut stmt = conn.prepare(&format!("{} {}", SUBTREE, sql))?;
    let raw = stmt
        .query_map(params![root.as_bytes().as_slice()], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter().map(id_from_blob).collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_mytoken(
        &self,
        mytoken: NewMytoken,
        usage: Option<UsageClaim>,
        events: Vec<Event>,
    ) -> Result<()> {
        self.write(move |tx| {
            if let Some(usage) = &usage {
                charge(tx, usage)?;
            }
            insert_mytoken_row(tx, &mytoken)?;
            append_events(tx, &events)
        })
        .await
    }

    async fn get_mytoken(&self, id: &MytokenId) -> Result<Option<StoredMytoken>> {
        let id = *id;
        self.blocking(move |conn| load_mytoken(conn, &id)).await
    }

    async fn get_refresh_token(&self, id: &MytokenId) -> Result<Option<String>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT r.token FROM refresh_tokens r JOIN mytokens m ON m.rt_id = r.id
                 WHERE m.id = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn resolve_short_token(&self, short: &str) -> Result<Option<String>> {
        let short = short.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT token FROM short_tokens WHERE short_token = ?1",
                params![short],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_mytokens(&self, oidc_iss: &str, oidc_sub: &str) -> Result<Vec<MytokenEntry>> {
        let oidc_iss = oidc_iss.to_string();
        let oidc_sub = oidc_sub.to_string();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mytokens
                 WHERE oidc_iss = ?1 AND oidc_sub = ?2 AND revoked = 0
                 ORDER BY created_at, rowid",
                MytokenRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![oidc_iss, oidc_sub], MytokenRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|row| {
                    Ok(MytokenEntry {
                        id: id_from_blob(row.id)?,
                        parent_id: opt_id_from_blob(row.parent_id)?,
                        name: row.name,
                        capabilities: from_cbor(&row.capabilities)?,
                        created_at: row.created_at,
                        expires_at: row.expires_at,
                        ip: row.ip,
                    })
                })
                .collect()
        })
        .await
    }

    async fn descendants(&self, id: &MytokenId) -> Result<Vec<MytokenId>> {
        let id = *id;
        self.blocking(move |conn| subtree_ids(conn, &id, "SELECT id FROM subtree WHERE id != ?1"))
            .await
    }

    async fn revoke(
        &self,
        target: &MytokenId,
        recursive: bool,
        usage: Option<UsageClaim>,
        client: &ClientMetaData,
        now: i64,
    ) -> Result<Vec<MytokenId>> {
        let target = *target;
        let client = client.clone();

        let revoked = self
            .write(move |tx| {
                if let Some(usage) = &usage {
                    charge(tx, usage)?;
                }

                let already: bool = tx
                    .query_row(
                        "SELECT revoked FROM mytokens WHERE id = ?1",
                        params![target.as_bytes().as_slice()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("mytoken {}", target)))?;

                let ids = if recursive {
                    subtree_ids(
                        tx,
                        &target,
                        "SELECT m.id FROM mytokens m JOIN subtree s ON m.id = s.id
                         WHERE m.revoked = 0",
                    )?
                } else if already {
                    Vec::new()
                } else {
                    vec![target]
                };

                for id in &ids {
                    tx.execute(
                        "UPDATE mytokens SET revoked = 1 WHERE id = ?1",
                        params![id.as_bytes().as_slice()],
                    )?;
                    let mut event = Event::new(EventKind::Revoked, *id, &client, now);
                    if recursive {
                        event = event.with_comment(format!("recursive revocation of {}", target));
                    }
                    append_event(tx, &event)?;
                }
                Ok(ids)
            })
            .await?;

        tracing::debug!(%target, recursive, count = revoked.len(), "revoked mytokens");
        Ok(revoked)
    }

    async fn record_usage(&self, usage: Option<UsageClaim>, events: Vec<Event>) -> Result<()> {
        self.write(move |tx| {
            if let Some(usage) = &usage {
                charge(tx, usage)?;
            }
            append_events(tx, &events)
        })
        .await
    }

    async fn record_access_token(
        &self,
        usage: Option<UsageClaim>,
        record: AccessTokenRecord,
        rotated_refresh_token: Option<String>,
        event: Event,
    ) -> Result<()> {
        self.write(move |tx| {
            if let Some(usage) = &usage {
                charge(tx, usage)?;
            }

            tx.execute(
                "INSERT INTO access_tokens (
                    mytoken_id, fingerprint, ip, comment, scopes, audiences, created_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.mytoken_id.as_bytes().as_slice(),
                    record.fingerprint,
                    record.ip,
                    record.comment,
                    record.scopes.join(" "),
                    record.audiences.join(" "),
                    record.created_at,
                    record.expires_at,
                ],
            )?;

            if let Some(token) = &rotated_refresh_token {
                tx.execute(
                    "UPDATE refresh_tokens SET token = ?1, updated_at = ?2
                     WHERE id = (SELECT rt_id FROM mytokens WHERE id = ?3)",
                    params![token, record.created_at, record.mytoken_id.as_bytes().as_slice()],
                )?;
            }

            append_event(tx, &event)
        })
        .await
    }

    async fn access_tokens(&self, id: &MytokenId) -> Result<Vec<AccessTokenRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT fingerprint, ip, comment, scopes, audiences, created_at, expires_at
                 FROM access_tokens WHERE mytoken_id = ?1 ORDER BY id",
            )?;
            let records = stmt
                .query_map(params![id.as_bytes().as_slice()], |row| {
                    let scopes: String = row.get("scopes")?;
                    let audiences: String = row.get("audiences")?;
                    Ok(AccessTokenRecord {
                        mytoken_id: id,
                        fingerprint: row.get("fingerprint")?,
                        ip: row.get("ip")?,
                        comment: row.get("comment")?,
                        scopes: mytoken_core::restriction::split_list(&scopes),
                        audiences: mytoken_core::restriction::split_list(&audiences),
                        created_at: row.get("created_at")?,
                        expires_at: row.get("expires_at")?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn history(&self, id: &MytokenId) -> Result<Vec<Event>> {
        let id = *id;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} SELECT e.event, e.mytoken_id, e.time, e.comment, e.ip, e.user_agent
                 FROM events e JOIN subtree s ON e.mytoken_id = s.id
                 ORDER BY e.id",
                SUBTREE
            ))?;
            let raw = stmt
                .query_map(params![id.as_bytes().as_slice()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(kind, mytoken_id, time, comment, ip, user_agent)| {
                    Ok(Event {
                        kind: EventKind::from_name(&kind)
                            .ok_or_else(|| StoreError::InvalidData(format!("event kind {}", kind)))?,
                        mytoken_id: id_from_blob(mytoken_id)?,
                        time,
                        comment,
                        ip,
                        user_agent,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert_exchange(
        &self,
        exchange: NewExchange,
        usage: Option<UsageClaim>,
        events: Vec<Event>,
    ) -> Result<()> {
        self.write(move |tx| {
            if let Some(usage) = &usage {
                charge(tx, usage)?;
            }
            insert_exchange_row(tx, &exchange)?;
            append_events(tx, &events)
        })
        .await
    }

    async fn get_exchange(&self, code: &str) -> Result<Option<StoredExchange>> {
        let code = code.to_string();
        self.blocking(move |conn| load_exchange(conn, "code", &code)).await
    }

    async fn get_exchange_by_consent_code(
        &self,
        consent_code: &str,
    ) -> Result<Option<StoredExchange>> {
        let consent_code = consent_code.to_string();
        self.blocking(move |conn| load_exchange(conn, "consent_code", &consent_code))
            .await
    }

    async fn decide_consent(
        &self,
        consent_code: &str,
        decision: ConsentDecision,
        now: i64,
    ) -> Result<()> {
        let consent_code = consent_code.to_string();

        self.write(move |tx| {
            let changed = tx.execute(
                "UPDATE pending_exchanges SET consent = ?1
                 WHERE consent_code = ?2 AND consent = 'pending' AND expires_at >= ?3",
                params![decision.resulting_state().as_str(), consent_code, now],
            )?;
            if changed == 1 {
                return Ok(());
            }

            let err = match load_exchange(tx, "consent_code", &consent_code)? {
                None => ExchangeError::UnknownCode,
                Some(ex) if ex.status().state_at(now) == ExchangeState::Expired => {
                    ExchangeError::Expired
                }
                Some(_) => ExchangeError::ConsentAlreadyDecided,
            };
            Err(err.into())
        })
        .await
    }

    async fn complete_exchange(
        &self,
        consent_code: &str,
        mytoken: NewMytoken,
        token: String,
        events: Vec<Event>,
        now: i64,
    ) -> Result<()> {
        let consent_code = consent_code.to_string();

        self.write(move |tx| {
            insert_mytoken_row(tx, &mytoken)?;

            let changed = tx.execute(
                "UPDATE pending_exchanges SET token = ?1, mytoken_id = ?2
                 WHERE consent_code = ?3 AND consent = 'granted' AND token IS NULL
                   AND claimed = 0 AND expires_at >= ?4",
                params![token, mytoken.id.as_bytes().as_slice(), consent_code, now],
            )?;
            if changed == 0 {
                let err = match load_exchange(tx, "consent_code", &consent_code)? {
                    None => ExchangeError::UnknownCode,
                    Some(ex) => match ex.status().state_at(now) {
                        ExchangeState::Expired => ExchangeError::Expired,
                        ExchangeState::Declined => ExchangeError::ConsentDeclined,
                        ExchangeState::Pending if ex.consent == ConsentState::Pending => {
                            ExchangeError::ConsentRequired
                        }
                        _ => ExchangeError::AlreadyClaimed,
                    },
                };
                return Err(err.into());
            }

            append_events(tx, &events)
        })
        .await
    }

    async fn pop_exchange_token(
        &self,
        code: &str,
        client: &ClientMetaData,
        now: i64,
    ) -> Result<String> {
        let code = code.to_string();
        let client = client.clone();

        self.write(move |tx| {
            let popped: Option<(String, Option<Vec<u8>>)> = tx
                .query_row(
                    "UPDATE pending_exchanges SET claimed = 1
                     WHERE code = ?1 AND claimed = 0 AND token IS NOT NULL
                       AND consent = 'granted' AND expires_at >= ?2
                     RETURNING token, mytoken_id",
                    params![code, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match popped {
                Some((token, mytoken_id)) => {
                    // RETURNING reports the updated row, so the token is
                    // cleared only after it has been read.
                    tx.execute(
                        "UPDATE pending_exchanges SET token = NULL WHERE code = ?1",
                        params![code],
                    )?;
                    if let Some(id) = opt_id_from_blob(mytoken_id)? {
                        append_event(
                            tx,
                            &Event::new(EventKind::TransferCodeUsed, id, &client, now),
                        )?;
                    }
                    tracing::debug!(polling_code = %code, "exchange token claimed");
                    Ok(token)
                }
                None => {
                    let err = match load_exchange(tx, "code", &code)? {
                        None => ExchangeError::UnknownCode,
                        Some(ex) => ex
                            .status()
                            .state_at(now)
                            .poll_error()
                            .unwrap_or(ExchangeError::AlreadyClaimed),
                    };
                    Err(err.into())
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_core::{Capability, FlowParameters};

    fn client() -> ClientMetaData {
        ClientMetaData::new("192.0.2.1".parse().unwrap()).with_user_agent("tests")
    }

    fn root(restrictions: Vec<Restriction>) -> NewMytoken {
        NewMytoken {
            id: MytokenId::generate(),
            parent_id: None,
            oidc_iss: "https://idp.example".into(),
            oidc_sub: "alice".into(),
            name: Some("root".into()),
            capabilities: CapabilitySet::from([Capability::AccessToken, Capability::CreateMytoken]),
            subtoken_capabilities: None,
            restrictions,
            created_at: 100,
            expires_at: None,
            ip: "192.0.2.1".into(),
            refresh_token: Some("rt-1".into()),
            short_token: None,
            transfer: None,
        }
    }

    fn child_of(parent: &NewMytoken) -> NewMytoken {
        NewMytoken {
            id: MytokenId::generate(),
            parent_id: Some(parent.id),
            refresh_token: None,
            name: None,
            ..parent.clone()
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_mytoken() {
        let store = SqliteStore::open_memory().unwrap();
        let m = root(vec![
            Restriction::any().with_scope("read").with_usages_at(1),
            Restriction::any(),
        ]);
        let id = m.id;
        let created = Event::new(EventKind::Created, id, &client(), 100);
        store.insert_mytoken(m, None, vec![created]).await.unwrap();

        let stored = store.get_mytoken(&id).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.parent_id, None);
        assert!(!stored.revoked);
        assert_eq!(stored.restrictions.len(), 2);
        assert_eq!(stored.restrictions[0].restriction.scope.as_deref(), Some("read"));
        assert_eq!(stored.restrictions[0].usage, Usage::default());
        assert_eq!(store.get_refresh_token(&id).await.unwrap().as_deref(), Some("rt-1"));

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, EventKind::Created);

        assert!(store.get_mytoken(&MytokenId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_child_shares_refresh_token() {
        let store = SqliteStore::open_memory().unwrap();
        let parent = root(vec![]);
        let child = child_of(&parent);
        store.insert_mytoken(parent.clone(), None, vec![]).await.unwrap();
        store.insert_mytoken(child.clone(), None, vec![]).await.unwrap();

        assert_eq!(
            store.get_refresh_token(&child.id).await.unwrap().as_deref(),
            Some("rt-1")
        );
        assert_eq!(store.descendants(&parent.id).await.unwrap(), vec![child.id]);
    }

    #[tokio::test]
    async fn test_orphan_child_rejected() {
        let store = SqliteStore::open_memory().unwrap();
        let parent = root(vec![]);
        let child = child_of(&parent);

        let err = store.insert_mytoken(child.clone(), None, vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get_mytoken(&child.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_is_conditional() {
        let store = SqliteStore::open_memory().unwrap();
        let m = root(vec![Restriction::any().with_usages_other(1)]);
        let id = m.id;
        store.insert_mytoken(m, None, vec![]).await.unwrap();

        let claim = UsageClaim {
            mytoken_id: id,
            clause: 0,
            kind: UsageKind::Other,
        };
        let event = || Event::new(EventKind::TokeninfoIntrospect, id, &client(), 200);

        store.record_usage(Some(claim), vec![event()]).await.unwrap();
        let err = store.record_usage(Some(claim), vec![event()]).await.unwrap_err();
        assert!(matches!(err, StoreError::UsageExhausted { clause: 0, .. }));

        let stored = store.get_mytoken(&id).await.unwrap().unwrap();
        assert_eq!(stored.restrictions[0].usage.other, 1);
        // the rejected attempt left no event behind
        assert_eq!(store.history(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_child_insert_rolls_back_parent_usage() {
        let store = SqliteStore::open_memory().unwrap();
        let parent = root(vec![Restriction::any().with_usages_other(5)]);
        store.insert_mytoken(parent.clone(), None, vec![]).await.unwrap();

        // duplicate id makes the insert fail after the usage was charged
        let mut child = child_of(&parent);
        child.id = parent.id;
        let claim = UsageClaim {
            mytoken_id: parent.id,
            clause: 0,
            kind: UsageKind::Other,
        };
        assert!(store.insert_mytoken(child, Some(claim), vec![]).await.is_err());

        let stored = store.get_mytoken(&parent.id).await.unwrap().unwrap();
        assert_eq!(stored.restrictions[0].usage.other, 0);
    }

    #[tokio::test]
    async fn test_revoke_recursive() {
        let store = SqliteStore::open_memory().unwrap();
        let a = root(vec![]);
        let b = child_of(&a);
        let c = child_of(&b);
        let d = child_of(&a);
        for m in [&a, &b, &c, &d] {
            store.insert_mytoken(m.clone(), None, vec![]).await.unwrap();
        }

        let revoked = store.revoke(&b.id, true, None, &client(), 300).await.unwrap();
        assert_eq!(revoked.len(), 2);
        assert!(store.get_mytoken(&b.id).await.unwrap().unwrap().revoked);
        assert!(store.get_mytoken(&c.id).await.unwrap().unwrap().revoked);
        assert!(!store.get_mytoken(&a.id).await.unwrap().unwrap().revoked);
        assert!(!store.get_mytoken(&d.id).await.unwrap().unwrap().revoked);

        // idempotent
        let again = store.revoke(&b.id, true, None, &client(), 301).await.unwrap();
        assert!(again.is_empty());

        let listed: Vec<MytokenId> = store
            .list_mytokens("https://idp.example", "alice")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a.id) && listed.contains(&d.id));
    }

    #[tokio::test]
    async fn test_revoke_recursive_is_all_or_nothing() {
        let store = SqliteStore::open_memory().unwrap();
        let root_token = root(vec![]);
        let middle = child_of(&root_token);
        let mut leaf = child_of(&middle);
        leaf.name = Some("leaf".into());
        for m in [&root_token, &middle, &leaf] {
            store.insert_mytoken(m.clone(), None, vec![]).await.unwrap();
        }

        // fail on the last row of the cascade
        store
            .blocking(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER fail_leaf_revocation
                     BEFORE UPDATE OF revoked ON mytokens WHEN NEW.name = 'leaf'
                     BEGIN SELECT RAISE(ABORT, 'leaf is locked'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.revoke(&root_token.id, true, None, &client(), 300).await.is_err());
        for m in [&root_token, &middle, &leaf] {
            assert!(!store.get_mytoken(&m.id).await.unwrap().unwrap().revoked);
            assert!(!store
                .history(&m.id)
                .await
                .unwrap()
                .iter()
                .any(|e| e.kind == EventKind::Revoked));
        }
    }

    #[tokio::test]
    async fn test_revoke_non_recursive_keeps_children() {
        let store = SqliteStore::open_memory().unwrap();
        let a = root(vec![]);
        let b = child_of(&a);
        store.insert_mytoken(a.clone(), None, vec![]).await.unwrap();
        store.insert_mytoken(b.clone(), None, vec![]).await.unwrap();

        let revoked = store.revoke(&a.id, false, None, &client(), 300).await.unwrap();
        assert_eq!(revoked, vec![a.id]);
        assert!(!store.get_mytoken(&b.id).await.unwrap().unwrap().revoked);

        let err = store
            .revoke(&MytokenId::generate(), false, None, &client(), 300)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_access_token_record_and_rotation() {
        let store = SqliteStore::open_memory().unwrap();
        let m = root(vec![Restriction::any().with_usages_at(1)]);
        let id = m.id;
        store.insert_mytoken(m, None, vec![]).await.unwrap();

        let record = AccessTokenRecord {
            mytoken_id: id,
            fingerprint: "ff".into(),
            ip: "192.0.2.1".into(),
            comment: None,
            scopes: vec!["read".into(), "write".into()],
            audiences: vec![],
            created_at: 200,
            expires_at: Some(500),
        };
        let claim = UsageClaim {
            mytoken_id: id,
            clause: 0,
            kind: UsageKind::AccessToken,
        };
        let event = Event::new(EventKind::AccessTokenCreated, id, &client(), 200);

        store
            .record_access_token(Some(claim), record.clone(), Some("rt-2".into()), event.clone())
            .await
            .unwrap();
        assert_eq!(store.access_tokens(&id).await.unwrap(), vec![record.clone()]);
        assert_eq!(store.get_refresh_token(&id).await.unwrap().as_deref(), Some("rt-2"));

        let err = store
            .record_access_token(Some(claim), record, Some("rt-3".into()), event)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UsageExhausted { .. }));
        assert_eq!(store.access_tokens(&id).await.unwrap().len(), 1);
        assert_eq!(store.get_refresh_token(&id).await.unwrap().as_deref(), Some("rt-2"));
    }

    #[tokio::test]
    async fn test_short_token_resolution() {
        let store = SqliteStore::open_memory().unwrap();
        let mut m = root(vec![]);
        m.short_token = Some(crate::traits::ShortToken {
            short: "abc123".into(),
            long: "h.p.s".into(),
        });
        store.insert_mytoken(m, None, vec![]).await.unwrap();

        assert_eq!(
            store.resolve_short_token("abc123").await.unwrap().as_deref(),
            Some("h.p.s")
        );
        assert_eq!(store.resolve_short_token("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exchange_lifecycle() {
        let store = SqliteStore::open_memory().unwrap();
        let flow = FlowParameters::new("https://idp.example");
        let ex = NewExchange::polling("poll".into(), "consent".into(), flow.clone(), 100, 400);
        store.insert_exchange(ex, None, vec![]).await.unwrap();

        let err = store.pop_exchange_token("poll", &client(), 150).await.unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::AuthorizationPending)));

        let m = root(vec![]);
        let err = store
            .complete_exchange("consent", m.clone(), "h.p.s".into(), vec![], 150)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::ConsentRequired)));
        assert!(store.get_mytoken(&m.id).await.unwrap().is_none());

        store.decide_consent("consent", ConsentDecision::Grant, 160).await.unwrap();
        let err = store
            .decide_consent("consent", ConsentDecision::Decline, 161)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::ConsentAlreadyDecided)));

        store
            .complete_exchange("consent", m.clone(), "h.p.s".into(), vec![], 170)
            .await
            .unwrap();
        let stored = store.get_exchange("poll").await.unwrap().unwrap();
        assert_eq!(stored.flow, Some(flow));
        assert_eq!(stored.mytoken_id, Some(m.id));
        assert_eq!(stored.status().state_at(170), ExchangeState::Granted);

        assert_eq!(store.pop_exchange_token("poll", &client(), 180).await.unwrap(), "h.p.s");
        let claimed = store.get_exchange("poll").await.unwrap().unwrap();
        assert!(claimed.claimed);
        assert!(!claimed.token_attached);
        assert_eq!(claimed.status().state_at(180), ExchangeState::Claimed);

        let err = store.pop_exchange_token("poll", &client(), 181).await.unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::AlreadyClaimed)));

        let kinds: Vec<EventKind> = store.history(&m.id).await.unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::TransferCodeUsed]);
    }

    #[tokio::test]
    async fn test_exchange_expiry_and_unknown_codes() {
        let store = SqliteStore::open_memory().unwrap();
        let ex = NewExchange::polling(
            "poll".into(),
            "consent".into(),
            FlowParameters::new("https://idp.example"),
            100,
            200,
        );
        store.insert_exchange(ex, None, vec![]).await.unwrap();

        let err = store
            .decide_consent("consent", ConsentDecision::Grant, 201)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::Expired)));

        let err = store.pop_exchange_token("poll", &client(), 201).await.unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::Expired)));

        let err = store.pop_exchange_token("other", &client(), 150).await.unwrap_err();
        assert!(matches!(err, StoreError::Exchange(ExchangeError::UnknownCode)));
    }

    #[tokio::test]
    async fn test_transfer_code_created_with_mytoken() {
        let store = SqliteStore::open_memory().unwrap();
        let mut m = root(vec![]);
        m.transfer = Some(NewExchange::transfer("xfer".into(), m.id, "h.p.s".into(), 100, 400));
        let id = m.id;
        let event = Event::new(EventKind::TransferCodeCreated, id, &client(), 100);
        store.insert_mytoken(m, None, vec![event]).await.unwrap();

        assert_eq!(store.pop_exchange_token("xfer", &client(), 150).await.unwrap(), "h.p.s");
        let kinds: Vec<EventKind> = store.history(&id).await.unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::TransferCodeCreated, EventKind::TransferCodeUsed]);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mytoken.db");

        let m = root(vec![Restriction::any().with_usages_at(3)]);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_mytoken(m.clone(), None, vec![]).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let stored = store.get_mytoken(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.restrictions[0].restriction.usages_at, Some(3));
    }
}
