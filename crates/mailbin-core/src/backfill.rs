use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::MessageStore;
use crate::tags::{TagRules, decode_tags, encode_tags};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub name: &'static str,
    pub version: u32,
    pub updated: u64,
    pub skipped: u64,
    pub batches: u64,
    pub failed_batches: u64,
}

impl JobReport {
    fn new(name: &'static str, version: u32) -> Self {
        Self {
            name,
            version,
            ..Self::default()
        }
    }
}

/// A one-off data repair. Re-running a finished job must find nothing to do.
#[async_trait]
pub trait BackfillJob: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &'static str;
    async fn run(&self, store: &MessageStore, batch_size: u64) -> Result<JobReport>;
}

pub struct BackfillRunner {
    jobs: Vec<Box<dyn BackfillJob>>,
}

impl BackfillRunner {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// The jobs run at every startup.
    pub fn standard(config: &StoreConfig) -> Self {
        let mut runner = Self::new();
        if config.ignore_duplicate_ids {
            runner.register(Box::new(RowJob(MessageIds)));
        }
        runner.register(Box::new(RowJob(SearchIndex { all: false })));
        if let Ok(rules) = TagRules::new(&config.tag_pattern) {
            runner.register(Box::new(RowJob(TagFormat { rules })));
        }
        runner.register(Box::new(OrphanedData));
        runner
    }

    /// Jobs run in ascending version order regardless of registration order.
    pub fn register(&mut self, job: Box<dyn BackfillJob>) {
        self.jobs.push(job);
        self.jobs.sort_by_key(|job| job.version());
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    pub async fn run_all(&self, store: &MessageStore) -> Vec<JobReport> {
        let batch_size = store.config().backfill_batch_size.max(1);
        let mut reports = Vec::new();
        for job in &self.jobs {
            match job.run(store, batch_size).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    warn!("[backfill] {} v{} failed: {}", job.name(), job.version(), err);
                    let mut report = JobReport::new(job.name(), job.version());
                    report.failed_batches = 1;
                    reports.push(report);
                }
            }
        }
        reports
    }
}

impl Default for BackfillRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Regenerates search text and snippet for every message.
pub async fn reindex_all(store: &MessageStore) -> Result<JobReport> {
    let batch_size = store.config().backfill_batch_size.max(1);
    RowJob(SearchIndex { all: true }).run(store, batch_size).await
}

#[derive(Debug)]
struct PendingRow {
    seq: i64,
    mailbox: String,
    id: String,
    tags: String,
}

enum RowUpdate {
    MessageId(String),
    Index { search_text: String, snippet: String },
    Tags(String),
}

/// A job that repairs rows matching `pending`, one row at a time.
#[async_trait]
trait RowRepair: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &'static str;
    /// Condition over unaliased `mailbox` columns selecting rows to repair.
    fn pending(&self) -> &'static str;
    async fn repair(&self, store: &MessageStore, row: &PendingRow) -> Result<RowUpdate>;
}

struct RowJob<R>(R);

#[async_trait]
impl<R: RowRepair> BackfillJob for RowJob<R> {
    fn version(&self) -> u32 {
        self.0.version()
    }

    fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Keyset scan over `seq`. Each batch commits in its own transaction and
    /// every update re-checks `pending`, so rows fixed concurrently are left
    /// untouched.
    async fn run(&self, store: &MessageStore, batch_size: u64) -> Result<JobReport> {
        let repair = &self.0;
        let mut report = JobReport::new(repair.name(), repair.version());
        let select = format!(
            "SELECT seq, mailbox, id, tags FROM mailbox WHERE seq > ? AND ({}) ORDER BY seq LIMIT ?",
            repair.pending()
        );
        let mut last_seq = 0i64;
        loop {
            let rows = sqlx::query_as::<_, (i64, String, String, String)>(&select)
                .bind(last_seq)
                .bind(batch_size as i64)
                .fetch_all(store.pool())
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            last_seq = last.0;

            let mut updates = Vec::with_capacity(rows.len());
            for (seq, mailbox, id, tags) in rows {
                let row = PendingRow {
                    seq,
                    mailbox,
                    id,
                    tags,
                };
                match repair.repair(store, &row).await {
                    Ok(update) => updates.push((row.seq, update)),
                    Err(err) => {
                        warn!(
                            "[backfill] {}: skipping {}/{}: {}",
                            repair.name(),
                            row.mailbox,
                            row.id,
                            err
                        );
                        report.skipped += 1;
                    }
                }
            }

            report.batches += 1;
            match apply_batch(store, repair.pending(), &updates).await {
                Ok(applied) => report.updated += applied,
                Err(err) => {
                    warn!("[backfill] {}: batch rolled back: {}", repair.name(), err);
                    report.failed_batches += 1;
                }
            }
            info!(
                "[backfill] {}: {} updated, {} skipped after {} batches",
                repair.name(),
                report.updated,
                report.skipped,
                report.batches
            );
        }
        Ok(report)
    }
}

async fn apply_batch(
    store: &MessageStore,
    pending: &str,
    updates: &[(i64, RowUpdate)],
) -> Result<u64> {
    if updates.is_empty() {
        return Ok(0);
    }
    let mut tx = store.pool().begin().await?;
    let mut applied = 0;
    for (seq, update) in updates {
        let result = match update {
            RowUpdate::MessageId(message_id) => {
                let query = format!(
                    "UPDATE mailbox SET message_id = ? WHERE seq = ? AND ({})",
                    pending
                );
                sqlx::query(&query)
                    .bind(message_id)
                    .bind(*seq)
                    .execute(&mut *tx)
                    .await?
            }
            RowUpdate::Index {
                search_text,
                snippet,
            } => {
                let query = format!(
                    "UPDATE mailbox SET search_text = ?, snippet = ? WHERE seq = ? AND ({})",
                    pending
                );
                sqlx::query(&query)
                    .bind(search_text)
                    .bind(snippet)
                    .bind(*seq)
                    .execute(&mut *tx)
                    .await?
            }
            RowUpdate::Tags(tags) => {
                let query = format!("UPDATE mailbox SET tags = ? WHERE seq = ? AND ({})", pending);
                sqlx::query(&query)
                    .bind(tags)
                    .bind(*seq)
                    .execute(&mut *tx)
                    .await?
            }
        };
        applied += result.rows_affected();
    }
    tx.commit().await?;
    Ok(applied)
}

/// Fills `message_id` for rows stored before it was recorded. Needed by
/// duplicate suppression.
struct MessageIds;

#[async_trait]
impl RowRepair for MessageIds {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "message_ids"
    }

    fn pending(&self) -> &'static str {
        "message_id IS NULL"
    }

    async fn repair(&self, store: &MessageStore, row: &PendingRow) -> Result<RowUpdate> {
        let raw = store.get_raw(&row.mailbox, &row.id).await?;
        let envelope = mailbin_content::parse(&raw)?;
        Ok(RowUpdate::MessageId(envelope.message_id))
    }
}

struct SearchIndex {
    all: bool,
}

#[async_trait]
impl RowRepair for SearchIndex {
    fn version(&self) -> u32 {
        if self.all { 5 } else { 2 }
    }

    fn name(&self) -> &'static str {
        if self.all { "reindex" } else { "search_index" }
    }

    fn pending(&self) -> &'static str {
        if self.all {
            "1 = 1"
        } else {
            "search_text IS NULL OR snippet IS NULL"
        }
    }

    async fn repair(&self, store: &MessageStore, row: &PendingRow) -> Result<RowUpdate> {
        let raw = store.get_raw(&row.mailbox, &row.id).await?;
        let envelope = mailbin_content::parse(&raw)?;
        Ok(RowUpdate::Index {
            search_text: mailbin_content::search_text(&envelope),
            snippet: mailbin_content::snippet(&envelope),
        })
    }
}

/// Converts legacy comma-separated tag text to a normalized JSON array.
struct TagFormat {
    rules: TagRules,
}

#[async_trait]
impl RowRepair for TagFormat {
    fn version(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "tag_format"
    }

    fn pending(&self) -> &'static str {
        "(CASE WHEN json_valid(tags) THEN json_type(tags) ELSE NULL END) IS NOT 'array'"
    }

    async fn repair(&self, _store: &MessageStore, row: &PendingRow) -> Result<RowUpdate> {
        let tags = self.rules.normalize_lenient(&decode_tags(&row.tags));
        Ok(RowUpdate::Tags(encode_tags(&tags)?))
    }
}

/// Removes raw rows whose summary no longer exists.
struct OrphanedData;

#[async_trait]
impl BackfillJob for OrphanedData {
    fn version(&self) -> u32 {
        4
    }

    fn name(&self) -> &'static str {
        "orphaned_data"
    }

    async fn run(&self, store: &MessageStore, batch_size: u64) -> Result<JobReport> {
        let mut report = JobReport::new(self.name(), self.version());
        loop {
            let removed = sqlx::query(
                "DELETE FROM mailbox_data WHERE rowid IN (
                     SELECT d.rowid FROM mailbox_data d
                     WHERE NOT EXISTS (
                         SELECT 1 FROM mailbox m WHERE m.mailbox = d.mailbox AND m.id = d.id
                     )
                     LIMIT ?
                 )",
            )
            .bind(batch_size as i64)
            .execute(store.pool())
            .await?
            .rows_affected();
            if removed == 0 {
                break;
            }
            report.batches += 1;
            report.updated += removed;
            info!("[backfill] {}: {} removed", self.name(), report.updated);
        }
        Ok(report)
    }
}
