use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::migrate::open_connection;
use crate::pattern::Pattern;
use crate::status::{CreateStatus, StatusMessage, USER_EXISTS};

const MAX_NAME_BYTES: usize = 255;
const INVALID_NAME_CHARS: &[char] = &['#', '<', '>', '[', ']', '|', '{', '}', '/', '@', ':', '='];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
}

impl User {
    /// A not-yet-loaded user, or `None` when `name` is not a valid user name.
    pub fn new_from_name(name: &str) -> Option<Self> {
        canonical_user_name(name).map(|name| Self { id: None, name })
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }
}

/// Normalise a user name: underscores become spaces, runs of spaces
/// collapse, and the first letter is uppercased. Returns `None` for empty
/// or overlong names, names with reserved characters, and IP addresses.
pub fn canonical_user_name(name: &str) -> Option<String> {
    let spaced = name.replace('_', " ");
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.len() > MAX_NAME_BYTES {
        return None;
    }
    if collapsed
        .chars()
        .any(|ch| ch.is_control() || INVALID_NAME_CHARS.contains(&ch))
    {
        return None;
    }
    if collapsed.parse::<IpAddr>().is_ok() {
        return None;
    }

    let mut chars = collapsed.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Why an account is being created without a registration form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCreateSource {
    Temp,
    Session,
}

impl AutoCreateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temp => "temp",
            Self::Session => "session",
        }
    }
}

/// Who a central-ID lookup is answering for. `Raw` bypasses visibility
/// restrictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Public,
    Raw,
}

pub trait AuthManager: Send + Sync {
    /// Create `user` if it does not exist, optionally logging it in. An
    /// existing user yields a good status with a `userexists` warning.
    fn auto_create_user(
        &self,
        user: &User,
        source: AutoCreateSource,
        login: bool,
        log: bool,
    ) -> Result<CreateStatus>;
}

pub trait CentralIdLookup: Send + Sync {
    fn central_id_from_name(&self, name: &str, audience: Audience) -> Result<Option<i64>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAccount {
    pub id: i64,
    pub name: String,
    pub registration: i64,
    pub touched: i64,
    pub is_temp: bool,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub total: usize,
    pub temp: usize,
}

/// Accounts in the `user` table of the workspace database.
#[derive(Debug, Clone)]
pub struct LocalAccountStore {
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalAccountStore {
    pub fn new(db_path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db_path: db_path.into(),
            clock,
        }
    }

    pub fn find_account(&self, name: &str) -> Result<Option<StoredAccount>> {
        let Some(name) = canonical_user_name(name) else {
            return Ok(None);
        };
        let connection = open_connection(&self.db_path)?;
        load_account(&connection, &name)
    }

    /// Up to `limit` names matching `pattern`, oldest registration first.
    pub fn list_matching(&self, pattern: &Pattern, limit: usize) -> Result<Vec<String>> {
        let connection = open_connection(&self.db_path)?;
        let like = pattern.like_condition("user_name");
        let mut statement = connection
            .prepare(&format!(
                "SELECT user_name FROM user WHERE {} ORDER BY user_registration, user_id",
                like.sql
            ))
            .context("failed to prepare account listing query")?;
        let rows = statement
            .query_map(params![like.value], |row| row.get::<_, String>(0))
            .context("failed to run account listing query")?;

        let mut out = Vec::new();
        for row in rows {
            if out.len() >= limit {
                break;
            }
            let name = row.context("failed to read account row")?;
            // LIKE is case-insensitive for ASCII; the pattern decides.
            if pattern.is_match(&name) {
                out.push(name);
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<AccountStats> {
        let connection = open_connection(&self.db_path)?;
        let (total, temp): (i64, i64) = connection
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(user_is_temp), 0) FROM user",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count accounts")?;
        Ok(AccountStats {
            total: usize::try_from(total).context("account count does not fit into usize")?,
            temp: usize::try_from(temp).context("temp account count does not fit into usize")?,
        })
    }
}

impl AuthManager for LocalAccountStore {
    fn auto_create_user(
        &self,
        user: &User,
        source: AutoCreateSource,
        login: bool,
        log: bool,
    ) -> Result<CreateStatus> {
        let now = self.clock.now_secs();
        let mut connection = open_connection(&self.db_path)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start account transaction")?;

        let mut status = CreateStatus::good();
        let id = match load_account(&transaction, &user.name)? {
            Some(existing) => {
                status.warning(StatusMessage::new(USER_EXISTS));
                existing.id
            }
            None => {
                transaction
                    .execute(
                        "INSERT INTO user (user_name, user_registration, user_touched, user_is_temp, user_source)
                         VALUES (?1, ?2, ?2, ?3, ?4)",
                        params![
                            user.name,
                            now,
                            i64::from(source == AutoCreateSource::Temp),
                            source.as_str()
                        ],
                    )
                    .with_context(|| format!("failed to insert account {}", user.name))?;
                let id = transaction.last_insert_rowid();
                if log {
                    info!(user = %user.name, id, source = source.as_str(), "auto-created account");
                }
                id
            }
        };

        if login {
            transaction
                .execute(
                    "UPDATE user SET user_touched = ?1 WHERE user_id = ?2",
                    params![now, id],
                )
                .with_context(|| format!("failed to touch account {}", user.name))?;
            debug!(user = %user.name, id, "session established");
        }
        transaction
            .commit()
            .context("failed to commit account transaction")?;

        status.user = Some(User {
            id: Some(id),
            name: user.name.clone(),
        });
        Ok(status)
    }
}

impl CentralIdLookup for LocalAccountStore {
    fn central_id_from_name(&self, name: &str, _audience: Audience) -> Result<Option<i64>> {
        Ok(self.find_account(name)?.map(|account| account.id))
    }
}

fn load_account(connection: &Connection, name: &str) -> Result<Option<StoredAccount>> {
    connection
        .query_row(
            "SELECT user_id, user_name, user_registration, user_touched, user_is_temp, user_source
             FROM user WHERE user_name = ?1",
            [name],
            |row| {
                Ok(StoredAccount {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    registration: row.get(2)?,
                    touched: row.get(3)?,
                    is_temp: row.get::<_, i64>(4)? != 0,
                    source: row.get(5)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load account {name}"))
}
