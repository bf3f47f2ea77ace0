use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::migrate::open_connection;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ThrottleCondition {
    pub count: u32,
    pub seconds: u64,
    /// Count attempts from every IP against one shared window.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all_ips: bool,
}

impl ThrottleCondition {
    pub fn new(count: u32, seconds: u64) -> Self {
        Self {
            count,
            seconds,
            all_ips: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleHit {
    pub throttle_index: usize,
    pub count: u32,
    /// Seconds until the window that was hit resets.
    pub wait: u64,
}

pub trait Throttler: Send + Sync {
    /// Record an attempt. `Some` means the attempt is over a limit and was
    /// not counted against any condition.
    fn increase(
        &self,
        subject: Option<&str>,
        ip: Option<IpAddr>,
        caller: &str,
    ) -> Result<Option<ThrottleHit>>;
}

/// Fixed windows per condition, subject and client IP, kept in the
/// workspace database so limits hold across processes.
#[derive(Debug)]
pub struct WindowThrottler {
    kind: &'static str,
    conditions: Vec<ThrottleCondition>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

struct PendingWindow {
    condition: i64,
    ip: String,
    expires_at: i64,
}

impl WindowThrottler {
    /// `kind` keys the stored windows and labels log lines, e.g.
    /// `acctcreate` or `tempacctname`.
    pub fn new(
        kind: &'static str,
        conditions: Vec<ThrottleCondition>,
        db_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kind,
            conditions,
            db_path: db_path.into(),
            clock,
        }
    }
}

impl Throttler for WindowThrottler {
    fn increase(
        &self,
        subject: Option<&str>,
        ip: Option<IpAddr>,
        caller: &str,
    ) -> Result<Option<ThrottleHit>> {
        let now = self.clock.now_secs();
        let subject = subject.unwrap_or_default();
        let client_ip = ip.map(|ip| ip.to_string()).unwrap_or_default();

        let mut connection = open_connection(&self.db_path)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start throttle transaction")?;
        transaction
            .execute(
                "DELETE FROM throttle_window WHERE tw_throttle = ?1 AND tw_expires_at <= ?2",
                params![self.kind, now],
            )
            .context("failed to purge expired throttle windows")?;

        let mut pending = Vec::with_capacity(self.conditions.len());
        for (index, condition) in self.conditions.iter().enumerate() {
            if condition.count == 0 || condition.seconds == 0 {
                continue;
            }
            let window = PendingWindow {
                condition: i64::try_from(index).context("throttle index does not fit into i64")?,
                ip: if condition.all_ips {
                    String::new()
                } else {
                    client_ip.clone()
                },
                expires_at: now
                    .saturating_add(i64::try_from(condition.seconds).unwrap_or(i64::MAX)),
            };
            let current: Option<(i64, i64)> = transaction
                .query_row(
                    "SELECT tw_hits, tw_expires_at FROM throttle_window
                     WHERE tw_throttle = ?1 AND tw_condition = ?2 AND tw_subject = ?3 AND tw_ip = ?4",
                    params![self.kind, window.condition, subject, window.ip],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("failed to read throttle window")?;

            if let Some((hits, expires_at)) = current
                && hits >= i64::from(condition.count)
            {
                transaction
                    .commit()
                    .context("failed to commit throttle transaction")?;
                let wait = u64::try_from(expires_at - now).unwrap_or(0);
                info!(
                    throttle = self.kind,
                    caller,
                    index,
                    ip = ?ip,
                    count = condition.count,
                    wait,
                    "throttle limit hit"
                );
                return Ok(Some(ThrottleHit {
                    throttle_index: index,
                    count: condition.count,
                    wait,
                }));
            }
            pending.push(window);
        }

        for window in &pending {
            transaction
                .execute(
                    "INSERT INTO throttle_window
                        (tw_throttle, tw_condition, tw_subject, tw_ip, tw_hits, tw_expires_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)
                     ON CONFLICT (tw_throttle, tw_condition, tw_subject, tw_ip)
                     DO UPDATE SET tw_hits = tw_hits + 1",
                    params![self.kind, window.condition, subject, window.ip, window.expires_at],
                )
                .context("failed to record throttle attempt")?;
        }
        transaction
            .commit()
            .context("failed to commit throttle transaction")?;
        debug!(throttle = self.kind, windows = pending.len(), "throttle attempt recorded");
        Ok(None)
    }
}
