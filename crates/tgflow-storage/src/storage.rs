use crate::cache::{CacheEntry, CacheMetrics, EntryCache};
use crate::schema::{self, OpenReport, StoreSchema};
use crate::types::{BatchOp, Key, KeyRange, Query};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, ToSql, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("batch aborted at op {index}: {source}")]
    TransactionAborted {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },
    #[error("schema upgrade to version {version} failed: {source}")]
    UpgradeFailed {
        version: u32,
        #[source]
        source: Box<StorageError>,
    },
    #[error("database {name:?} is at version {current}, cannot open at older version {requested}")]
    VersionDowngrade {
        name: String,
        current: u32,
        requested: u32,
    },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error("unknown index {index:?} on store {store:?}")]
    UnknownIndex { store: String, index: String },
    #[error("store {store:?} has no usable key for this value at key path {key_path:?}")]
    InvalidKey { store: String, key_path: String },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::QuotaExceeded(err.to_string()),
            _ => StorageError::Sqlite(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// How a version bump treats stores the new version no longer declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePolicy {
    /// Drop undeclared stores (and their data) during the upgrade pass.
    /// Dropped names are listed in [`OpenReport::dropped_stores`].
    pub drop_undeclared_stores: bool,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        Self {
            drop_undeclared_stores: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Max number of `(store, key)` entries kept in memory (default: 10_000).
    pub cache_capacity: usize,
    /// Lifetime of a cached copy (default: 5 minutes). `None` keeps entries
    /// until evicted or invalidated.
    pub cache_ttl: Option<Duration>,
    /// SQLite busy timeout (default: 5s).
    pub busy_timeout: Duration,
    /// Upper bound for the database file size. Writes past it fail with
    /// [`StorageError::QuotaExceeded`].
    pub max_size_bytes: Option<u64>,
    pub upgrade: UpgradePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl: Some(Duration::from_secs(300)),
            busy_timeout: Duration::from_secs(5),
            max_size_bytes: None,
            upgrade: UpgradePolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum Backend {
    InMemory,
    Directory(PathBuf),
}

type Slot = Arc<Mutex<Option<Database>>>;

/// Owner of every logical database in the process.
///
/// Each database name maps to one lazily-opened shared connection. Concurrent
/// `open` calls for the same name serialize on a per-name slot, so exactly one
/// caller performs the open/upgrade sequence and the rest receive its handle.
pub struct StorageManager {
    backend: Backend,
    config: StorageConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl StorageManager {
    /// Databases live as `<root>/<db_name>.sqlite3`.
    pub fn with_root(root: impl Into<PathBuf>, config: StorageConfig) -> Self {
        Self {
            backend: Backend::Directory(root.into()),
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Databases live only as long as the manager (or a handle) keeps them.
    pub fn in_memory(config: StorageConfig) -> Self {
        Self {
            backend: Backend::InMemory,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or join an in-flight open of) `db_name` at `version`.
    ///
    /// Idempotent. A higher `version` than the one on disk runs a single
    /// upgrade transaction; a lower one fails with
    /// [`StorageError::VersionDowngrade`]. A failed open leaves the database
    /// un-opened so the call can be retried.
    pub fn open(&self, db_name: &str, version: u32, stores: &[StoreSchema]) -> Result<Database> {
        schema::validate(stores, version)
            .map_err(|err| StorageError::InvalidSchema(err.to_string()))?;
        if db_name.is_empty() || db_name.contains(['/', '\\']) {
            return Err(StorageError::InvalidSchema(format!(
                "invalid database name {db_name:?}"
            )));
        }

        let slot = {
            let mut slots = self.slots.lock().expect("storage manager mutex poisoned");
            slots.entry(db_name.to_string()).or_default().clone()
        };

        let mut guard = slot.lock().expect("database slot mutex poisoned");
        if let Some(db) = guard.as_ref() {
            let current = db.version();
            if version > current {
                db.upgrade_in_place(version, stores, self.config.upgrade)?;
            } else if version < current {
                return Err(StorageError::VersionDowngrade {
                    name: db_name.to_string(),
                    current,
                    requested: version,
                });
            }
            return Ok(db.clone());
        }

        let conn = self.connect(db_name)?;
        let db = Database::from_connection(db_name, conn, version, stores, &self.config)?;
        *guard = Some(db.clone());
        Ok(db)
    }

    /// Drop the manager's handle for `db_name`. Outstanding [`Database`]
    /// clones keep the connection alive until they are dropped.
    pub fn close(&self, db_name: &str) -> bool {
        let slot = {
            let mut slots = self.slots.lock().expect("storage manager mutex poisoned");
            slots.remove(db_name)
        };
        match slot {
            Some(slot) => slot.lock().expect("database slot mutex poisoned").take().is_some(),
            None => false,
        }
    }

    fn connect(&self, db_name: &str) -> Result<Connection> {
        let conn = match &self.backend {
            Backend::InMemory => Connection::open_in_memory()?,
            Backend::Directory(root) => {
                std::fs::create_dir_all(root)?;
                Connection::open(root.join(format!("{db_name}.sqlite3")))?
            }
        };
        conn.busy_timeout(self.config.busy_timeout)?;
        if let Some(max_bytes) = self.config.max_size_bytes {
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |r| r.get(0))?;
            let page_size = u64::try_from(page_size).unwrap_or(4096).max(1);
            let pages = i64::try_from((max_bytes / page_size).max(1)).unwrap_or(i64::MAX);
            conn.pragma_update(None, "max_page_count", pages)?;
        }
        Ok(conn)
    }
}

struct Inner {
    conn: Connection,
    version: u32,
    stores: HashMap<String, StoreSchema>,
    cache: EntryCache,
    report: OpenReport,
}

impl Inner {
    fn schema(&self, store: &str) -> Result<&StoreSchema> {
        self.stores
            .get(store)
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }
}

/// Handle to one opened database.
///
/// The connection and the entry cache share one lock: a `get` either observes
/// all of a concurrent `batch` or none of it.
#[derive(Clone)]
pub struct Database {
    name: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("version", &self.version())
            .finish()
    }
}

enum ResolvedOp<'a> {
    Put {
        store: &'a str,
        key: Key,
        value: &'a serde_json::Value,
        expires_at: Option<i64>,
    },
    Delete {
        store: &'a str,
        key: &'a Key,
    },
}

impl Database {
    fn from_connection(
        name: &str,
        mut conn: Connection,
        version: u32,
        stores: &[StoreSchema],
        config: &StorageConfig,
    ) -> Result<Self> {
        schema::init(&conn)?;
        let previous = schema::user_version(&conn)?;
        if version < previous {
            return Err(StorageError::VersionDowngrade {
                name: name.to_string(),
                current: previous,
                requested: version,
            });
        }

        let report = if version > previous {
            run_upgrade(&mut conn, previous, version, stores, config.upgrade)?
        } else {
            OpenReport {
                previous_version: previous,
                version,
                ..OpenReport::default()
            }
        };
        let catalog = schema::load_catalog(&conn)?;
        log::debug!(
            "opened database {name:?} at version {version} ({} stores)",
            catalog.len()
        );

        Ok(Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(Inner {
                conn,
                version,
                stores: catalog,
                cache: EntryCache::new(config.cache_capacity, config.cache_ttl),
                report,
            })),
        })
    }

    fn upgrade_in_place(&self, version: u32, stores: &[StoreSchema], policy: UpgradePolicy) -> Result<()> {
        let mut inner = self.inner.lock().expect("database mutex poisoned");
        let previous = inner.version;
        let report = run_upgrade(&mut inner.conn, previous, version, stores, policy)?;
        for dropped in &report.dropped_stores {
            inner.cache.invalidate_store(dropped);
        }
        inner.stores = schema::load_catalog(&inner.conn)?;
        inner.version = version;
        inner.report = report;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.inner.lock().expect("database mutex poisoned").version
    }

    /// What the most recent open/upgrade did, including dropped stores.
    pub fn open_report(&self) -> OpenReport {
        self.inner.lock().expect("database mutex poisoned").report.clone()
    }

    pub fn store_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("database mutex poisoned");
        let mut names: Vec<String> = inner.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Point lookup: cache first, then the store.
    ///
    /// Records in ephemeral stores whose expiry has passed read as absent even
    /// before [`Database::reclaim`] removes them.
    pub fn get(&self, store: &str, key: impl Into<Key>) -> Result<Option<serde_json::Value>> {
        let key = key.into();
        let mut inner = self.inner.lock().expect("database mutex poisoned");
        let ephemeral = inner.schema(store)?.ephemeral;
        let now_ms = now_millis();

        if let Some(entry) = inner.cache.get(store, &key, Instant::now()) {
            if ephemeral && entry.is_expired_at(now_ms) {
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }

        let row = read_row(&inner.conn, store, &key)?;
        let Some((value, stored_at, expires_at)) = row else {
            return Ok(None);
        };
        let entry = CacheEntry::new(store, key, value, stored_at, expires_at);
        let visible = !(ephemeral && entry.is_expired_at(now_ms));
        let value = visible.then(|| entry.value.clone());
        inner.cache.insert(entry, Instant::now());
        Ok(value)
    }

    /// Apply `ops` in one read-write transaction.
    ///
    /// Either every op lands or none does. The cache reflects every op before
    /// this returns, so a following `get` never sees pre-batch data.
    pub fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("database mutex poisoned");
        batch_locked(&mut inner, ops)
    }

    /// Range read that always goes to the store; results are never cached.
    pub fn query(&self, store: &str, query: &Query) -> Result<Vec<serde_json::Value>> {
        let inner = self.inner.lock().expect("database mutex poisoned");
        let declared = inner.schema(store)?;
        let column = match &query.index {
            Some(index) => {
                let index = declared.find_index(index).ok_or_else(|| StorageError::UnknownIndex {
                    store: store.to_string(),
                    index: index.clone(),
                })?;
                schema::json_path_expr(&index.key_path)
            }
            None => "pk".to_string(),
        };

        let now_ms = now_millis();
        let limit = query
            .limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let mut clauses = Vec::new();
        let mut args: Vec<&dyn ToSql> = Vec::new();
        if let Some(KeyRange { lower, upper }) = &query.range {
            match lower {
                Bound::Included(k) => {
                    clauses.push(format!("{column} >= ?"));
                    args.push(k);
                }
                Bound::Excluded(k) => {
                    clauses.push(format!("{column} > ?"));
                    args.push(k);
                }
                Bound::Unbounded => {}
            }
            match upper {
                Bound::Included(k) => {
                    clauses.push(format!("{column} <= ?"));
                    args.push(k);
                }
                Bound::Excluded(k) => {
                    clauses.push(format!("{column} < ?"));
                    args.push(k);
                }
                Bound::Unbounded => {}
            }
        }
        if declared.ephemeral {
            clauses.push("(expires_at IS NULL OR expires_at >= ?)".to_string());
            args.push(&now_ms);
        }
        args.push(&limit);

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT value FROM {} {where_sql} ORDER BY {column}, pk LIMIT ?",
            schema::table_name(store)
        );

        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    /// Delete expired records from every ephemeral store. Returns how many
    /// records were removed. Non-ephemeral stores are never touched.
    pub fn reclaim(&self) -> Result<usize> {
        let now_ms = now_millis();
        let mut inner = self.inner.lock().expect("database mutex poisoned");

        let mut ephemeral: Vec<String> = inner
            .stores
            .values()
            .filter(|s| s.ephemeral)
            .map(|s| s.name.clone())
            .collect();
        ephemeral.sort();

        let mut ops = Vec::new();
        for store in &ephemeral {
            let mut stmt = inner.conn.prepare(&format!(
                "SELECT pk FROM {} WHERE expires_at IS NOT NULL AND expires_at < ?1",
                schema::table_name(store)
            ))?;
            let keys = stmt.query_map(params![now_ms], |r| r.get::<_, Key>(0))?;
            for key in keys {
                ops.push(BatchOp::delete(store.as_str(), key?));
            }
        }

        if ops.is_empty() {
            return Ok(0);
        }
        batch_locked(&mut inner, &ops)?;
        log::debug!(
            "reclaimed {} expired records from database {:?}",
            ops.len(),
            self.name
        );
        Ok(ops.len())
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.inner.lock().expect("database mutex poisoned").cache.metrics()
    }

    /// Drop all memory-resident copies. Stored data is unaffected.
    pub fn clear_cache(&self) {
        self.inner.lock().expect("database mutex poisoned").cache.clear();
    }
}

fn run_upgrade(
    conn: &mut Connection,
    previous: u32,
    version: u32,
    stores: &[StoreSchema],
    policy: UpgradePolicy,
) -> Result<OpenReport> {
    let mut attempt = || -> Result<OpenReport> {
        let tx = conn.transaction()?;
        let report = schema::upgrade(&tx, previous, version, stores, policy.drop_undeclared_stores)?;
        tx.commit()?;
        Ok(report)
    };
    let report = attempt().map_err(|err| StorageError::UpgradeFailed {
        version,
        source: Box::new(err),
    })?;

    if !report.dropped_stores.is_empty() {
        log::warn!(
            "schema upgrade {previous} -> {version} dropped undeclared stores: {:?}",
            report.dropped_stores
        );
    }
    log::debug!(
        "schema upgrade {previous} -> {version} created stores {:?}",
        report.created_stores
    );
    Ok(report)
}

fn batch_locked(inner: &mut Inner, ops: &[BatchOp]) -> Result<()> {
    let mut resolved = Vec::with_capacity(ops.len());
    for op in ops {
        resolved.push(resolve_op(inner, op)?);
    }

    let now_ms = now_millis();
    let Inner { conn, cache, .. } = inner;
    {
        let tx = conn.transaction()?;
        for (index, op) in resolved.iter().enumerate() {
            apply_op(&tx, op, now_ms).map_err(|err| {
                if matches!(err, StorageError::QuotaExceeded(_)) {
                    err
                } else {
                    StorageError::TransactionAborted {
                        index,
                        source: Box::new(err),
                    }
                }
            })?;
        }
        tx.commit()?;
    }

    let now = Instant::now();
    for op in resolved {
        match op {
            ResolvedOp::Put {
                store,
                key,
                value,
                expires_at,
            } => cache.insert(
                CacheEntry::new(store, key, value.clone(), now_ms, expires_at),
                now,
            ),
            ResolvedOp::Delete { store, key } => cache.invalidate(store, key),
        }
    }
    Ok(())
}

fn resolve_op<'a>(inner: &Inner, op: &'a BatchOp) -> Result<ResolvedOp<'a>> {
    let schema = inner.schema(op.store())?;
    match op {
        BatchOp::Put {
            store,
            key,
            value,
            expires_at,
        } => {
            let invalid = || StorageError::InvalidKey {
                store: store.clone(),
                key_path: schema.key_path.clone(),
            };
            let inline = lookup_path(value, &schema.key_path).and_then(Key::from_json);
            let key = match (key, inline) {
                (None, Some(inline)) => inline,
                (None, None) => return Err(invalid()),
                // In-line stores only accept an explicit key that agrees with the value.
                (Some(key), inline) if !schema.key_path.is_empty() => {
                    if inline.as_ref() != Some(key) {
                        return Err(invalid());
                    }
                    key.clone()
                }
                (Some(key), _) => key.clone(),
            };
            Ok(ResolvedOp::Put {
                store,
                key,
                value,
                expires_at: *expires_at,
            })
        }
        BatchOp::Delete { store, key } => Ok(ResolvedOp::Delete { store, key }),
    }
}

fn apply_op(tx: &Transaction<'_>, op: &ResolvedOp<'_>, now_ms: i64) -> Result<()> {
    match op {
        ResolvedOp::Put {
            store,
            key,
            value,
            expires_at,
        } => {
            let raw = serde_json::to_string(value)?;
            tx.execute(
                &format!(
                    r#"
                    INSERT INTO {} (pk, value, stored_at, expires_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(pk) DO UPDATE SET
                      value = excluded.value,
                      stored_at = excluded.stored_at,
                      expires_at = excluded.expires_at
                    "#,
                    schema::table_name(store)
                ),
                params![key, raw, now_ms, expires_at],
            )?;
        }
        ResolvedOp::Delete { store, key } => {
            tx.execute(
                &format!("DELETE FROM {} WHERE pk = ?1", schema::table_name(store)),
                params![key],
            )?;
        }
    }
    Ok(())
}

fn read_row(
    conn: &Connection,
    store: &str,
    key: &Key,
) -> Result<Option<(serde_json::Value, i64, Option<i64>)>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT value, stored_at, expires_at FROM {} WHERE pk = ?1",
                schema::table_name(store)
            ),
            params![key],
            |r| Ok((r.get::<_, String>(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    match row {
        Some((raw, stored_at, expires_at)) => {
            Ok(Some((serde_json::from_str(&raw)?, stored_at, expires_at)))
        }
        None => Ok(None),
    }
}

fn lookup_path<'v>(value: &'v serde_json::Value, path: &str) -> Option<&'v serde_json::Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(value, |cur, seg| cur.get(seg))
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
