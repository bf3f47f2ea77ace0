//! Allocation of serial indexes from sharded database counters.
//!
//! Each allocation draws a shard at random, bumps that shard's counter row
//! inside a write transaction and folds the shard back into the result as
//! `value * num_shards + shard`. Indexes are unique per year as long as
//! nothing else writes the counter table; they are not globally ordered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use rusqlite::{Connection, TransactionBehavior, params};
use tracing::debug;

use crate::config::SerialProviderConfig;
use crate::error::TempUserError;
use crate::migrate::open_connection;

pub const SERIAL_TABLE: &str = "user_autocreate_serial";

pub trait SerialProvider: Send + Sync {
    /// Allocate an index not previously returned for `year` (0 when names
    /// are not year-sharded).
    fn acquire_index(&self, year: i32) -> Result<u64>;
}

/// Shared counter algorithm for providers that keep their counters in a
/// `user_autocreate_serial`-shaped table.
pub trait DbSerialProvider: Send + Sync {
    fn num_shards(&self) -> u32;

    fn table_name(&self) -> &str;

    /// A fresh connection. Counter values are never cached between calls.
    fn open_connection(&self) -> Result<Connection>;

    fn acquire_db_index(&self, year: i32) -> Result<u64> {
        let num_shards = self.num_shards();
        let shard = if num_shards > 1 {
            rand::thread_rng().gen_range(0..num_shards)
        } else {
            0
        };
        let table = self.table_name();

        let mut connection = self.open_connection()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start serial transaction")?;
        transaction
            .execute(
                &format!(
                    "INSERT INTO {table} (uas_shard, uas_year, uas_value) VALUES (?1, ?2, 1)
                     ON CONFLICT (uas_shard, uas_year) DO UPDATE SET uas_value = uas_value + 1"
                ),
                params![i64::from(shard), i64::from(year)],
            )
            .with_context(|| format!("failed to increment {table} shard {shard}"))?;
        let value: i64 = transaction
            .query_row(
                &format!("SELECT uas_value FROM {table} WHERE uas_shard = ?1 AND uas_year = ?2"),
                params![i64::from(shard), i64::from(year)],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to read {table} shard {shard}"))?;
        transaction
            .commit()
            .context("failed to commit serial transaction")?;

        let value = u64::try_from(value).context("serial counter is negative")?;
        let index = value
            .checked_mul(u64::from(num_shards.max(1)))
            .and_then(|scaled| scaled.checked_add(u64::from(shard)))
            .context("serial index does not fit into u64")?;
        debug!(shard, year, value, index, "acquired serial index");
        Ok(index)
    }
}

/// Counters in the local workspace database.
#[derive(Debug, Clone)]
pub struct LocalSerialProvider {
    db_path: PathBuf,
    num_shards: u32,
}

impl LocalSerialProvider {
    pub fn new(db_path: impl Into<PathBuf>, num_shards: u32) -> Self {
        Self {
            db_path: db_path.into(),
            num_shards,
        }
    }
}

impl DbSerialProvider for LocalSerialProvider {
    fn num_shards(&self) -> u32 {
        self.num_shards
    }

    fn table_name(&self) -> &str {
        SERIAL_TABLE
    }

    fn open_connection(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }
}

impl SerialProvider for LocalSerialProvider {
    fn acquire_index(&self, year: i32) -> Result<u64> {
        self.acquire_db_index(year)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCounter {
    pub shard: u32,
    pub year: i32,
    pub value: u64,
}

/// Current counter rows, ordered by year then shard.
pub fn load_shard_counters(connection: &Connection) -> Result<Vec<ShardCounter>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT uas_shard, uas_year, uas_value FROM {SERIAL_TABLE} ORDER BY uas_year, uas_shard"
        ))
        .context("failed to prepare shard counter query")?;
    let rows = statement
        .query_map([], |row| {
            let shard: i64 = row.get(0)?;
            let year: i64 = row.get(1)?;
            let value: i64 = row.get(2)?;
            Ok((shard, year, value))
        })
        .context("failed to run shard counter query")?;

    let mut out = Vec::new();
    for row in rows {
        let (shard, year, value) = row.context("failed to read shard counter row")?;
        out.push(ShardCounter {
            shard: u32::try_from(shard).context("shard does not fit into u32")?,
            year: i32::try_from(year).context("year does not fit into i32")?,
            value: u64::try_from(value).context("serial counter is negative")?,
        });
    }
    Ok(out)
}

/// What built-in and extension factories get to work with.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub db_path: PathBuf,
}

pub type SerialProviderFactory = Box<
    dyn Fn(&SerialProviderConfig, &ProviderContext) -> Result<Arc<dyn SerialProvider>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownSerialProvider {
    Local { num_shards: u32 },
}

impl KnownSerialProvider {
    /// Returns `None` for types that are not built in.
    pub fn from_config(config: &SerialProviderConfig) -> Option<Self> {
        match config.kind.as_str() {
            "local" => Some(Self::Local {
                num_shards: config.num_shards,
            }),
            _ => None,
        }
    }

    pub fn build(self, context: &ProviderContext) -> Arc<dyn SerialProvider> {
        match self {
            Self::Local { num_shards } => {
                Arc::new(LocalSerialProvider::new(context.db_path.clone(), num_shards))
            }
        }
    }
}

/// Resolves a provider `type`: built-ins first, then registered factories.
pub struct SerialProviderRegistry {
    context: ProviderContext,
    factories: HashMap<String, SerialProviderFactory>,
}

impl SerialProviderRegistry {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            context,
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: SerialProviderFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn create(&self, config: &SerialProviderConfig) -> Result<Arc<dyn SerialProvider>> {
        if let Some(known) = KnownSerialProvider::from_config(config) {
            return Ok(known.build(&self.context));
        }
        match self.factories.get(&config.kind) {
            Some(factory) => factory(config, &self.context),
            None => Err(TempUserError::UnknownSerialProvider(config.kind.clone()).into()),
        }
    }
}

impl std::fmt::Debug for SerialProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("SerialProviderRegistry")
            .field("context", &self.context)
            .field("extensions", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    use tempfile::tempdir;

    use super::*;
    use crate::migrate::run_migrations;

    fn migrated_db() -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("tempuser.db");
        run_migrations(&db_path).expect("migrate");
        (temp, db_path)
    }

    fn shard_value(db_path: &Path, shard: u64, year: i32) -> u64 {
        let connection = open_connection(db_path).expect("open");
        let counters = load_shard_counters(&connection).expect("counters");
        counters
            .iter()
            .find(|c| u64::from(c.shard) == shard && c.year == year)
            .map(|c| c.value)
            .expect("counter row")
    }

    #[test]
    fn single_shard_counts_up_from_one() {
        let (_temp, db_path) = migrated_db();
        let provider = LocalSerialProvider::new(&db_path, 1);
        let indexes: Vec<u64> = (0..20)
            .map(|_| provider.acquire_index(0).expect("acquire"))
            .collect();
        assert_eq!(indexes, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn zero_shards_behaves_like_one() {
        let (_temp, db_path) = migrated_db();
        let provider = LocalSerialProvider::new(&db_path, 0);
        assert_eq!(provider.acquire_index(0).expect("acquire"), 1);
        assert_eq!(provider.acquire_index(0).expect("acquire"), 2);
    }

    #[test]
    fn sharded_indexes_encode_their_shard() {
        let (_temp, db_path) = migrated_db();
        let provider = LocalSerialProvider::new(&db_path, 4);
        let mut seen = HashSet::new();
        let mut last_per_shard: BTreeMap<u64, u64> = BTreeMap::new();

        for _ in 0..10 {
            let index = provider.acquire_index(0).expect("acquire");
            let shard = index % 4;
            assert!(seen.insert(index), "duplicate index {index}");
            assert_eq!(shard_value(&db_path, shard, 0), index / 4);
            if let Some(previous) = last_per_shard.insert(shard, index) {
                assert!(index > previous);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn years_keep_separate_counters() {
        let (_temp, db_path) = migrated_db();
        let provider = LocalSerialProvider::new(&db_path, 1);
        assert_eq!(provider.acquire_index(2024).expect("acquire"), 1);
        assert_eq!(provider.acquire_index(2024).expect("acquire"), 2);
        assert_eq!(provider.acquire_index(2025).expect("acquire"), 1);

        let connection = open_connection(&db_path).expect("open");
        let counters = load_shard_counters(&connection).expect("counters");
        assert_eq!(
            counters,
            vec![
                ShardCounter {
                    shard: 0,
                    year: 2024,
                    value: 2,
                },
                ShardCounter {
                    shard: 0,
                    year: 2025,
                    value: 1,
                },
            ]
        );
    }

    #[test]
    fn concurrent_callers_never_share_an_index() {
        let (_temp, db_path) = migrated_db();
        let provider = Arc::new(LocalSerialProvider::new(&db_path, 4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| provider.acquire_index(0).expect("acquire"))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for index in handle.join().expect("join") {
                assert!(all.insert(index), "duplicate index {index}");
            }
        }
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn missing_table_is_an_error_and_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("empty.db");
        let provider = LocalSerialProvider::new(&db_path, 1);
        let err = provider.acquire_index(0).expect_err("must fail");
        assert!(err.to_string().contains("failed to increment"));

        let connection = open_connection(&db_path).expect("open");
        let tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 0);
    }

    #[test]
    fn failed_read_back_rolls_back_the_increment() {
        let (_temp, db_path) = migrated_db();
        let provider = LocalSerialProvider::new(&db_path, 1);
        assert_eq!(provider.acquire_index(0).expect("acquire"), 1);

        // Corrupt the row after the upsert has bumped it, so the read-back fails.
        let connection = open_connection(&db_path).expect("open");
        connection
            .execute_batch(
                "CREATE TRIGGER corrupt_serial AFTER UPDATE ON user_autocreate_serial
                 BEGIN
                     UPDATE user_autocreate_serial SET uas_value = 'corrupt'
                     WHERE uas_shard = NEW.uas_shard AND uas_year = NEW.uas_year;
                 END;",
            )
            .expect("create trigger");

        let err = provider.acquire_index(0).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to read"), "{err:#}");
        assert_eq!(shard_value(&db_path, 0, 0), 1);

        connection
            .execute_batch("DROP TRIGGER corrupt_serial;")
            .expect("drop trigger");
        assert_eq!(provider.acquire_index(0).expect("acquire"), 2);
    }

    #[test]
    fn registry_builds_local_and_rejects_unknown() {
        let (_temp, db_path) = migrated_db();
        let registry = SerialProviderRegistry::new(ProviderContext {
            db_path: db_path.clone(),
        });
        let provider = registry
            .create(&SerialProviderConfig::default())
            .expect("local provider");
        assert_eq!(provider.acquire_index(0).expect("acquire"), 1);

        let config = SerialProviderConfig {
            kind: "centralauth".to_string(),
            ..SerialProviderConfig::default()
        };
        let err = registry.create(&config).err().expect("must fail");
        assert_eq!(
            err.downcast_ref::<TempUserError>(),
            Some(&TempUserError::UnknownSerialProvider("centralauth".to_string()))
        );
    }

    #[test]
    fn registry_uses_extension_factories() {
        struct Fixed(u64);
        impl SerialProvider for Fixed {
            fn acquire_index(&self, _year: i32) -> Result<u64> {
                Ok(self.0)
            }
        }

        let mut registry = SerialProviderRegistry::new(ProviderContext {
            db_path: PathBuf::from("unused.db"),
        });
        registry.register(
            "fixed",
            Box::new(
                |config: &SerialProviderConfig,
                 _context: &ProviderContext|
                 -> Result<Arc<dyn SerialProvider>> {
                    let value = config
                        .options
                        .get("value")
                        .and_then(toml::Value::as_integer)
                        .unwrap_or(7);
                    Ok(Arc::new(Fixed(u64::try_from(value)?)))
                },
            ),
        );
        let mut config = SerialProviderConfig {
            kind: "fixed".to_string(),
            ..SerialProviderConfig::default()
        };
        config
            .options
            .insert("value".to_string(), toml::Value::Integer(42));
        let provider = registry.create(&config).expect("fixed provider");
        assert_eq!(provider.acquire_index(0).expect("acquire"), 42);
    }
}
