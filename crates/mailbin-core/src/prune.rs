use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::db::SqlValue;
use crate::error::Result;
use crate::events::MailboxEvent;
use crate::search::{CompiledQuery, Predicate};
use crate::store::MessageStore;

const HOUR_MS: i64 = 3600 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// `(mailbox, deleted)` for every mailbox that lost messages.
    pub pruned: Vec<(String, u64)>,
    pub failures: usize,
    pub vacuumed: bool,
}

impl PruneReport {
    pub fn deleted(&self) -> u64 {
        self.pruned.iter().map(|(_, n)| n).sum()
    }
}

/// Keeps every mailbox under its configured ceiling (and age limit) by
/// deleting the oldest messages, and vacuums the database once deletions
/// have been left to settle.
pub struct Pruner {
    store: MessageStore,
    interval: Duration,
}

impl Pruner {
    pub fn new(store: MessageStore) -> Self {
        let interval = store.config().prune_interval();
        Self { store, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs cycles until `shutdown` carries `true` or its sender is dropped.
    /// The signal is only observed between cycles.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("[prune] started, every {:?}", self.interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.deleted() > 0 || report.failures > 0 || report.vacuumed {
                        info!(
                            "[prune] cycle removed {} messages, {} failures, vacuumed {}",
                            report.deleted(),
                            report.failures,
                            report.vacuumed
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("[prune] stopped");
    }

    /// One pass over every known mailbox. Failures are logged per mailbox.
    pub async fn run_cycle(&self) -> PruneReport {
        let mut report = PruneReport::default();
        match self.store.vacuum_due().await {
            Ok(false) => {}
            Ok(true) => match self.store.vacuum().await {
                Ok(()) => report.vacuumed = true,
                Err(err) => {
                    warn!("[prune] vacuum failed: {}", err);
                    report.failures += 1;
                }
            },
            Err(err) => {
                warn!("[prune] vacuum check failed: {}", err);
                report.failures += 1;
            }
        }
        for (mailbox, stats) in self.store.stats().snapshot() {
            match self.prune_mailbox(&mailbox, stats.total).await {
                Ok(0) => {}
                Ok(deleted) => {
                    self.store.notifier.notify(MailboxEvent::Prune {
                        mailbox: mailbox.clone(),
                        deleted,
                    });
                    report.pruned.push((mailbox, deleted));
                }
                Err(err) => {
                    warn!("[prune] {}: {}", mailbox, err);
                    report.failures += 1;
                }
            }
        }
        report
    }

    async fn prune_mailbox(&self, mailbox: &str, total: u64) -> Result<u64> {
        let config = self.store.config();
        let mut budget = config.prune_batch_size;
        let mut deleted = 0;

        let limit = config.limit_for(mailbox);
        if limit > 0 && total > limit {
            let overflow = (total - limit).min(budget);
            let report = self
                .store
                .delete_matching(mailbox, &CompiledQuery::default(), Some(overflow))
                .await?;
            debug!(
                "[prune] {}: {} over limit {}, removed {}",
                mailbox,
                total - limit,
                limit,
                report.deleted
            );
            deleted += report.deleted;
            budget = budget.saturating_sub(report.deleted);
        }

        if config.max_age_hours > 0 && budget > 0 {
            let cutoff = self.store.clock.now_ms() - config.max_age_hours as i64 * HOUR_MS;
            let mut older = CompiledQuery::default();
            older.push(Predicate {
                sql: "m.created < ?".to_string(),
                values: vec![SqlValue::Int(cutoff)],
            });
            let report = self
                .store
                .delete_matching(mailbox, &older, Some(budget))
                .await?;
            deleted += report.deleted;
        }

        Ok(deleted)
    }
}
