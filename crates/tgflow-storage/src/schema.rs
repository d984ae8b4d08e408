use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const CATALOG_TABLE: &str = "__tgflow_stores";

/// Declaration of a secondary index over a JSON field of the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Dotted path into the stored value, e.g. `profile.username`.
    pub key_path: String,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declaration of one object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    /// Path of the in-line key inside stored values. Empty for out-of-line keys.
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub indices: Vec<IndexSchema>,
    /// Ephemeral stores are swept by `Database::reclaim`.
    #[serde(default)]
    pub ephemeral: bool,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: String::new(),
            indices: Vec::new(),
            ephemeral: false,
        }
    }

    pub fn key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indices.push(index);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indices.iter().find(|idx| idx.name == name)
    }
}

/// What an `open` call changed in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    pub previous_version: u32,
    pub version: u32,
    pub upgraded: bool,
    pub created_stores: Vec<String>,
    /// Stores removed because the new version no longer declares them.
    pub dropped_stores: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SchemaError {
    #[error("invalid identifier {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidIdentifier(String),
    #[error("invalid key path {0:?}")]
    InvalidKeyPath(String),
    #[error("store {0:?} declared more than once")]
    DuplicateStore(String),
    #[error("index {index:?} declared more than once on store {store:?}")]
    DuplicateIndex { store: String, index: String },
    #[error("schema version must be at least 1")]
    ZeroVersion,
}

pub(crate) fn validate(stores: &[StoreSchema], version: u32) -> Result<(), SchemaError> {
    if version == 0 {
        return Err(SchemaError::ZeroVersion);
    }
    let mut seen = HashMap::new();
    for store in stores {
        validate_identifier(&store.name)?;
        if !store.key_path.is_empty() {
            validate_key_path(&store.key_path)?;
        }
        if seen.insert(store.name.as_str(), ()).is_some() {
            return Err(SchemaError::DuplicateStore(store.name.clone()));
        }
        let mut seen_idx = HashMap::new();
        for index in &store.indices {
            validate_identifier(&index.name)?;
            validate_key_path(&index.key_path)?;
            if seen_idx.insert(index.name.as_str(), ()).is_some() {
                return Err(SchemaError::DuplicateIndex {
                    store: store.name.clone(),
                    index: index.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_identifier(name: &str) -> Result<(), SchemaError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

fn validate_key_path(path: &str) -> Result<(), SchemaError> {
    let ok = !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'));
    if ok {
        Ok(())
    } else {
        Err(SchemaError::InvalidKeyPath(path.to_string()))
    }
}

pub(crate) fn table_name(store: &str) -> String {
    format!("\"s_{store}\"")
}

fn index_name(store: &str, index: &str) -> String {
    format!("\"i_{store}_{index}\"")
}

/// SQL expression for a JSON key path. Queries must use the exact same
/// expression as the index definition for SQLite to pick the index.
pub(crate) fn json_path_expr(key_path: &str) -> String {
    format!("json_extract(value, '$.{key_path}')")
}

pub(crate) fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |r| r.get(0))
}

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
          name TEXT PRIMARY KEY,
          key_path TEXT NOT NULL DEFAULT '',
          ephemeral INTEGER NOT NULL DEFAULT 0,
          indices TEXT NOT NULL
        );
        "#
    ))
}

pub(crate) fn load_catalog(conn: &Connection) -> rusqlite::Result<HashMap<String, StoreSchema>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name, key_path, ephemeral, indices FROM {CATALOG_TABLE}"
    ))?;
    let rows = stmt.query_map([], |r| {
        let indices: serde_json::Value = r.get(3)?;
        // A corrupt indices column only loses index metadata, not data.
        let indices: Vec<IndexSchema> = serde_json::from_value(indices).unwrap_or_default();
        Ok(StoreSchema {
            name: r.get(0)?,
            key_path: r.get(1)?,
            ephemeral: r.get::<_, i64>(2)? != 0,
            indices,
        })
    })?;

    let mut stores = HashMap::new();
    for store in rows {
        let store = store?;
        stores.insert(store.name.clone(), store);
    }
    Ok(stores)
}

/// Run the upgrade pass inside `tx`: create missing stores/indices, rewrite
/// catalog rows, drop undeclared stores (when allowed) and bump `user_version`.
pub(crate) fn upgrade(
    tx: &Transaction<'_>,
    previous_version: u32,
    version: u32,
    stores: &[StoreSchema],
    drop_undeclared: bool,
) -> rusqlite::Result<OpenReport> {
    let existing = load_catalog(tx)?;
    let mut report = OpenReport {
        previous_version,
        version,
        upgraded: true,
        ..OpenReport::default()
    };

    for store in stores {
        let table = table_name(&store.name);
        let previous = existing.get(&store.name);
        if previous.is_none() {
            report.created_stores.push(store.name.clone());
        }
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
              pk NOT NULL PRIMARY KEY,
              value TEXT NOT NULL,
              stored_at INTEGER NOT NULL,
              expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS "x_{name}_expires" ON {table}(expires_at);
            "#,
            name = store.name,
        ))?;

        let previous_indices: BTreeMap<&str, &IndexSchema> = previous
            .map(|p| p.indices.iter().map(|i| (i.name.as_str(), i)).collect())
            .unwrap_or_default();

        for (name, old) in &previous_indices {
            if store.find_index(name) != Some(*old) {
                tx.execute_batch(&format!(
                    "DROP INDEX IF EXISTS {};",
                    index_name(&store.name, name)
                ))?;
            }
        }
        for index in &store.indices {
            let unique = if index.unique { "UNIQUE " } else { "" };
            tx.execute_batch(&format!(
                "CREATE {unique}INDEX IF NOT EXISTS {} ON {table}({});",
                index_name(&store.name, &index.name),
                json_path_expr(&index.key_path),
            ))?;
        }

        let indices = serde_json::to_value(&store.indices)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        tx.execute(
            &format!(
                r#"
                INSERT INTO {CATALOG_TABLE} (name, key_path, ephemeral, indices)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name) DO UPDATE SET
                  key_path = excluded.key_path,
                  ephemeral = excluded.ephemeral,
                  indices = excluded.indices
                "#
            ),
            params![&store.name, &store.key_path, store.ephemeral, indices],
        )?;
    }

    if drop_undeclared {
        let mut undeclared: Vec<&String> = existing
            .keys()
            .filter(|name| !stores.iter().any(|s| &s.name == *name))
            .collect();
        undeclared.sort();
        for name in undeclared {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", table_name(name)))?;
            tx.execute(
                &format!("DELETE FROM {CATALOG_TABLE} WHERE name = ?1"),
                params![name],
            )?;
            report.dropped_stores.push(name.clone());
        }
    }

    tx.pragma_update(None, "user_version", version)?;
    Ok(report)
}

#[cfg(test)]
fn store_exists(conn: &Connection, store: &str) -> rusqlite::Result<bool> {
    use rusqlite::OptionalExtension;

    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![format!("s_{store}")],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
