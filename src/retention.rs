//! Retention sweeps.
//!
//! A [`RetentionScheduler`] runs a list of [`RetentionPolicy`] values
//! against a store, at most once per cooldown per workspace unless forced.
//! Each policy is fault-isolated: its error is logged and collected in the
//! report, and the remaining policies still run.
//!
//! Two forced runs started at the same time may overlap. Every built-in
//! policy is idempotent, so overlap only costs duplicate work.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::sqlite_store::SqliteStore;

/// One retention task. Returns how many items it compacted or removed.
#[async_trait]
pub trait RetentionPolicy: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, store: &SqliteStore, now_ms: i64) -> Result<u64>;
}

/// Checkpoint and truncate the write-ahead log.
pub struct WalCompaction;

#[async_trait]
impl RetentionPolicy for WalCompaction {
    fn name(&self) -> &str {
        "wal_compaction"
    }

    async fn run(&self, store: &SqliteStore, _now_ms: i64) -> Result<u64> {
        store.checkpoint_wal().await
    }
}

/// Delete transient buffer items older than `ttl_ms`.
pub struct TransientPrune {
    pub ttl_ms: i64,
}

#[async_trait]
impl RetentionPolicy for TransientPrune {
    fn name(&self) -> &str {
        "transient_prune"
    }

    async fn run(&self, store: &SqliteStore, now_ms: i64) -> Result<u64> {
        store.prune_transient(now_ms.saturating_sub(self.ttl_ms)).await
    }
}

/// Delete expired pins and their indexed chunks.
pub struct ExpiredPinPrune;

#[async_trait]
impl RetentionPolicy for ExpiredPinPrune {
    fn name(&self) -> &str {
        "pin_prune"
    }

    async fn run(&self, store: &SqliteStore, now_ms: i64) -> Result<u64> {
        store.prune_expired_pins(now_ms).await
    }
}

/// The built-in policies enabled in `config`, in run order.
pub fn default_policies(config: &RetentionConfig) -> Vec<Box<dyn RetentionPolicy>> {
    let mut policies: Vec<Box<dyn RetentionPolicy>> = Vec::new();
    if config.wal_compaction {
        policies.push(Box::new(WalCompaction));
    }
    if config.transient_prune {
        policies.push(Box::new(TransientPrune {
            ttl_ms: (config.transient_ttl_secs as i64).saturating_mul(1000),
        }));
    }
    if config.pin_prune {
        policies.push(Box::new(ExpiredPinPrune));
    }
    policies
}

/// Outcome of one [`RetentionScheduler::run`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    /// Items affected per policy name. Failed policies are absent.
    pub counts: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl RetentionReport {
    fn skipped(reason: &str) -> Self {
        Self {
            ran: false,
            skipped_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Per-workspace rate limiter for retention sweeps.
///
/// State is in-process only; a restarted process starts with no history.
pub struct RetentionScheduler {
    cooldown: Duration,
    last_run: Mutex<HashMap<PathBuf, Instant>>,
}

impl RetentionScheduler {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(Duration::from_secs(config.cooldown_secs))
    }

    /// Claim a run slot for `workspace`. Returns `false` while the
    /// previous run is inside the cooldown, unless `force` is set.
    fn try_begin(&self, workspace: &Path, force: bool) -> bool {
        let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if !force {
            if let Some(prev) = last_run.get(workspace) {
                if now.duration_since(*prev) < self.cooldown {
                    return false;
                }
            }
        }
        last_run.insert(workspace.to_path_buf(), now);
        true
    }

    /// Forget every recorded run.
    pub fn reset(&self) {
        self.last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run `policies` for `workspace` unless it is cooling down.
    pub async fn run(
        &self,
        workspace: &Path,
        store: &SqliteStore,
        policies: &[Box<dyn RetentionPolicy>],
        force: bool,
        now_ms: i64,
    ) -> RetentionReport {
        if !self.try_begin(workspace, force) {
            debug!(workspace = %workspace.display(), "retention skipped, cooling down");
            return RetentionReport::skipped("cooldown");
        }

        let start = Instant::now();
        let mut report = RetentionReport {
            ran: true,
            ..Default::default()
        };

        for policy in policies {
            match policy.run(store, now_ms).await {
                Ok(count) => {
                    report.counts.insert(policy.name().to_string(), count);
                }
                Err(e) => {
                    warn!(policy = policy.name(), error = %e, "retention policy failed");
                    report.errors.push(format!("{}: {}", policy.name(), e));
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            workspace = %workspace.display(),
            policies = policies.len(),
            errors = report.errors.len(),
            "retention complete"
        );
        report
    }
}
