use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use mailbin_content::{Address, Envelope, PartData};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backfill::BackfillRunner;
use crate::blob::{BlobStore, SqliteBlobStore};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::db::{self, SqlValue, bind_query, bind_query_as, placeholders};
use crate::error::{Result, StoreError};
use crate::events::{MailboxEvent, NoopNotifier, Notifier};
use crate::model::{
    DeleteReport, Message, MessageSummary, Page, ReadTarget, SearchResults, Stored,
};
use crate::search::{self, CompiledQuery, Predicate};
use crate::stats::{MailboxStats, StatsCache};
use crate::tags::{TagFilter, TagRules, decode_tags, encode_tags};

const SUMMARY_COLUMNS: &str = "m.id, m.mailbox, m.created, m.is_read, m.from_addr, \
     m.to_addr, m.cc_addr, m.bcc_addr, m.reply_to_addr, m.subject, m.message_id, m.size, \
     m.attachment_count, m.inline_count, m.tags, m.snippet";

const ID_CHUNK: usize = 500;

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    mailbox: String,
    created: i64,
    is_read: bool,
    from_addr: Option<String>,
    to_addr: String,
    cc_addr: String,
    bcc_addr: String,
    reply_to_addr: String,
    subject: String,
    message_id: Option<String>,
    size: i64,
    attachment_count: i64,
    inline_count: i64,
    tags: String,
    snippet: Option<String>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<MessageSummary> {
        let from = match self.from_addr.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str::<Option<Address>>(json)?,
            _ => None,
        };
        Ok(MessageSummary {
            id: self.id,
            mailbox: self.mailbox,
            created: self.created,
            read: self.is_read,
            from,
            to: decode_addresses(&self.to_addr)?,
            cc: decode_addresses(&self.cc_addr)?,
            bcc: decode_addresses(&self.bcc_addr)?,
            reply_to: decode_addresses(&self.reply_to_addr)?,
            subject: self.subject,
            message_id: self.message_id.unwrap_or_default(),
            size: self.size.max(0) as u64,
            attachments: self.attachment_count.max(0) as u32,
            inline: self.inline_count.max(0) as u32,
            tags: decode_tags(&self.tags),
            snippet: self.snippet.unwrap_or_default(),
        })
    }
}

fn decode_addresses(json: &str) -> Result<Vec<Address>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

/// Row values derived from one parsed message.
struct NewRow {
    summary: MessageSummary,
    search_text: String,
}

/// Paired summary/raw storage for every mailbox, with the stats cache and
/// event sink that follow each mutation. Cloning is cheap.
#[derive(Clone)]
pub struct MessageStore {
    pub(crate) pool: SqlitePool,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) stats: Arc<StatsCache>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) tag_rules: TagRules,
    pub(crate) tag_filters: Arc<Vec<TagFilter>>,
    /// Shared by every row change that is paired with a stats transition.
    /// Bulk delete rounds, stats recounts and vacuum hold it exclusively, so
    /// none of them observes a summary row whose transition is still pending.
    pub(crate) gate: Arc<RwLock<()>>,
    /// Clock reading of the most recent mutation, in milliseconds.
    pub(crate) last_activity: Arc<AtomicI64>,
}

impl MessageStore {
    /// Installs logging if requested, connects, applies schema migrations,
    /// runs the registered backfill jobs and loads stats for every mailbox.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        crate::logging::init();
        let pool = db::connect(&config).await?;
        db::migrate(&pool).await?;
        let store = Self::from_pool(pool, config)?;
        let reports = BackfillRunner::standard(&store.config).run_all(&store).await;
        for report in reports.iter().filter(|r| r.updated > 0 || r.skipped > 0) {
            info!(
                "[backfill] {}: updated {} skipped {}",
                report.name, report.updated, report.skipped
            );
        }
        store.refresh_all_stats().await?;
        Ok(store)
    }

    /// Wraps an already migrated pool. Stats start empty.
    pub fn from_pool(pool: SqlitePool, config: StoreConfig) -> Result<Self> {
        let tag_rules = TagRules::new(&config.tag_pattern)?;
        let tag_filters = TagFilter::compile_all(&config.tag_filters, &tag_rules);
        if !tag_filters.is_empty() {
            info!("[tags] loaded {} tag filters", tag_filters.len());
        }
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            blobs: Arc::new(SqliteBlobStore::new(pool.clone())),
            pool,
            stats: Arc::new(StatsCache::new()),
            notifier: Arc::new(NoopNotifier),
            last_activity: Arc::new(AtomicI64::new(clock.now_ms())),
            clock,
            config: Arc::new(config),
            tag_rules,
            tag_filters: Arc::new(tag_filters),
            gate: Arc::new(RwLock::new(())),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.touch();
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsCache {
        &self.stats
    }

    /// Parses and persists one raw message. With duplicate suppression on, a
    /// Message-ID already present in the mailbox is not stored again and the
    /// existing id is returned.
    pub async fn store(&self, mailbox: &str, raw: &[u8]) -> Result<Stored> {
        let envelope = mailbin_content::parse(raw)?;
        let id = Uuid::new_v4().to_string();
        let mut row = self.build_row(mailbox, &id, raw.len(), &envelope);
        let dedup = self.config.ignore_duplicate_ids && !row.summary.message_id.is_empty();

        let _ingest = self.gate.read().await;

        if !self.insert_summary(&row, dedup).await? {
            let existing = sqlx::query_as::<_, (String,)>(
                "SELECT id FROM mailbox WHERE mailbox = ? AND message_id = ? ORDER BY seq LIMIT 1",
            )
            .bind(mailbox)
            .bind(&row.summary.message_id)
            .fetch_optional(&self.pool)
            .await?;
            match existing {
                Some((existing,)) => {
                    debug!(
                        "[store] {}: duplicate Message-ID {:?}, keeping {}",
                        mailbox, row.summary.message_id, existing
                    );
                    return Ok(Stored::DuplicateSuppressed(existing));
                }
                // The earlier copy was deleted in between.
                None => {
                    self.insert_summary(&row, false).await?;
                }
            }
        }

        if let Err(err) = self.blobs.put(mailbox, &id, raw).await {
            warn!("[store] {}: raw write failed for {}: {}", mailbox, id, err);
            let cleanup = sqlx::query("DELETE FROM mailbox WHERE mailbox = ? AND id = ?")
                .bind(mailbox)
                .bind(&id)
                .execute(&self.pool)
                .await;
            if let Err(cleanup) = cleanup {
                error!("[store] {}: could not remove summary {}: {}", mailbox, id, cleanup);
            }
            return Err(err);
        }

        if let Err(err) = self.apply_tag_filters(&mut row).await {
            warn!("[tags] {}: tag filters failed for {}: {}", mailbox, id, err);
        }
        self.stats.insert(mailbox);
        self.touch();
        self.notifier.notify(MailboxEvent::New(row.summary));
        Ok(Stored::New(id))
    }

    async fn apply_tag_filters(&self, row: &mut NewRow) -> Result<()> {
        let s = &row.summary;
        let matched = self.filter_tags(&s.mailbox, &s.id).await?;
        if matched.is_empty() {
            return Ok(());
        }
        let mut merged = s.tags.clone();
        merged.extend(matched);
        let merged = self.tag_rules.normalize_lenient(&merged);
        if merged == s.tags {
            return Ok(());
        }
        sqlx::query("UPDATE mailbox SET tags = ? WHERE mailbox = ? AND id = ?")
            .bind(encode_tags(&merged)?)
            .bind(&s.mailbox)
            .bind(&s.id)
            .execute(&self.pool)
            .await?;
        row.summary.tags = merged;
        Ok(())
    }

    fn build_row(&self, mailbox: &str, id: &str, size: usize, envelope: &Envelope) -> NewRow {
        let created = match envelope.date {
            Some(date) if self.config.use_message_dates => date,
            _ => self.clock.now_ms(),
        };
        let suggested = mailbin_content::suggested_tags(
            envelope,
            !self.config.tags_disable_x_tags,
            !self.config.tags_disable_plus,
        );
        NewRow {
            summary: MessageSummary {
                id: id.to_string(),
                mailbox: mailbox.to_string(),
                created,
                read: false,
                from: envelope.from.clone(),
                to: envelope.to.clone(),
                cc: envelope.cc.clone(),
                bcc: envelope.bcc.clone(),
                reply_to: envelope.reply_to.clone(),
                subject: envelope.subject.clone(),
                message_id: envelope.message_id.clone(),
                size: size as u64,
                attachments: envelope.attachments.len() as u32,
                inline: envelope.inlines.len() as u32,
                tags: self.tag_rules.normalize_lenient(&suggested),
                snippet: mailbin_content::snippet(envelope),
            },
            search_text: mailbin_content::search_text(envelope),
        }
    }

    /// Returns false when `dedup` is set and the Message-ID already exists.
    /// The existence check and the insert are a single statement.
    async fn insert_summary(&self, row: &NewRow, dedup: bool) -> Result<bool> {
        let s = &row.summary;
        let mut query = String::from(
            "INSERT INTO mailbox (mailbox, id, created, is_read, from_addr, to_addr, cc_addr,
                 bcc_addr, reply_to_addr, subject, message_id, size, attachment_count,
                 inline_count, tags, search_text, snippet)
             SELECT ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?",
        );
        if dedup {
            query.push_str(
                " WHERE NOT EXISTS (SELECT 1 FROM mailbox WHERE mailbox = ? AND message_id = ?)",
            );
        }
        let from = match &s.from {
            Some(addr) => Some(serde_json::to_string(addr)?),
            None => None,
        };
        let mut q = sqlx::query(&query)
            .bind(&s.mailbox)
            .bind(&s.id)
            .bind(s.created)
            .bind(from)
            .bind(serde_json::to_string(&s.to)?)
            .bind(serde_json::to_string(&s.cc)?)
            .bind(serde_json::to_string(&s.bcc)?)
            .bind(serde_json::to_string(&s.reply_to)?)
            .bind(&s.subject)
            .bind(&s.message_id)
            .bind(s.size as i64)
            .bind(s.attachments as i64)
            .bind(s.inline as i64)
            .bind(encode_tags(&s.tags)?)
            .bind(&row.search_text)
            .bind(&s.snippet);
        if dedup {
            q = q.bind(&s.mailbox).bind(&s.message_id);
        }
        Ok(q.execute(&self.pool).await?.rows_affected() > 0)
    }

    pub async fn get_summary(&self, mailbox: &str, id: &str) -> Result<MessageSummary> {
        let query = format!(
            "SELECT {} FROM mailbox m WHERE m.mailbox = ? AND m.id = ?",
            SUMMARY_COLUMNS
        );
        let row = sqlx::query_as::<_, SummaryRow>(&query)
            .bind(mailbox)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::message_not_found(mailbox, id))?;
        row.into_summary()
    }

    /// Full retrieval. The first retrieval of an unread message marks it read;
    /// the returned message shows the flag as it was before this call.
    pub async fn get(&self, mailbox: &str, id: &str) -> Result<Message> {
        let summary = self.get_summary(mailbox, id).await?;
        let raw = self.get_raw(mailbox, id).await?;
        let envelope = mailbin_content::parse(&raw)?;

        if !summary.read {
            let _ingest = self.gate.read().await;
            let flipped = sqlx::query(
                "UPDATE mailbox SET is_read = 1 WHERE mailbox = ? AND id = ? AND is_read = 0",
            )
            .bind(mailbox)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            self.stats.mark_read(mailbox, flipped);
            if flipped > 0 {
                self.touch();
            }
        }

        let date = envelope.date.unwrap_or(summary.created);
        Ok(Message {
            summary,
            date,
            return_path: envelope.return_path,
            text: envelope.text,
            html: envelope.html,
            attachment_parts: envelope.attachments,
            inline_parts: envelope.inlines,
        })
    }

    pub async fn get_raw(&self, mailbox: &str, id: &str) -> Result<Vec<u8>> {
        self.blobs.get(mailbox, id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "message data",
            key: format!("{}/{}", mailbox, id),
        })
    }

    /// Decoded content of one attachment or inline part.
    pub async fn get_part(&self, mailbox: &str, id: &str, part_id: &str) -> Result<PartData> {
        let raw = self.get_raw(mailbox, id).await?;
        mailbin_content::part_data(&raw, part_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "part",
            key: format!("{}/{}/{}", mailbox, id, part_id),
        })
    }

    /// Newest first.
    pub async fn list(&self, mailbox: &str, page: &Page) -> Result<Vec<MessageSummary>> {
        self.fetch_page(mailbox, &CompiledQuery::default(), page).await
    }

    pub async fn search(
        &self,
        mailbox: &str,
        query: &str,
        page: &Page,
        timezone: Option<&str>,
    ) -> Result<SearchResults> {
        let compiled = search::compile(query, timezone);
        let messages = self.fetch_page(mailbox, &compiled, page).await?;
        let matched = self.count_matching(mailbox, &compiled, None).await?;
        Ok(SearchResults { messages, matched })
    }

    pub async fn search_unread_count(
        &self,
        mailbox: &str,
        query: &str,
        timezone: Option<&str>,
    ) -> Result<u64> {
        let compiled = search::compile(query, timezone);
        self.count_matching(mailbox, &compiled, Some(false)).await
    }

    async fn fetch_page(
        &self,
        mailbox: &str,
        compiled: &CompiledQuery,
        page: &Page,
    ) -> Result<Vec<MessageSummary>> {
        let mut filter = compiled.clone();
        let offset = match page.before.as_deref() {
            Some(cursor) => {
                let (created, seq) = sqlx::query_as::<_, (i64, i64)>(
                    "SELECT created, seq FROM mailbox WHERE mailbox = ? AND id = ?",
                )
                .bind(mailbox)
                .bind(cursor)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::message_not_found(mailbox, cursor))?;
                filter.push(Predicate {
                    sql: "(m.created, m.seq) < (?, ?)".to_string(),
                    values: vec![SqlValue::Int(created), SqlValue::Int(seq)],
                });
                0
            }
            None => page.start,
        };

        let query = format!(
            "SELECT {} FROM mailbox m WHERE m.mailbox = ?{}
             ORDER BY m.created DESC, m.seq DESC LIMIT ? OFFSET ?",
            SUMMARY_COLUMNS,
            filter.where_sql()
        );
        let q = bind_query_as(
            sqlx::query_as::<_, SummaryRow>(&query).bind(mailbox),
            &filter.values(),
        );
        let rows = q
            .bind(page.effective_limit() as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    async fn count_matching(
        &self,
        mailbox: &str,
        compiled: &CompiledQuery,
        read: Option<bool>,
    ) -> Result<u64> {
        let mut query = format!(
            "SELECT COUNT(*) FROM mailbox m WHERE m.mailbox = ?{}",
            compiled.where_sql()
        );
        if read.is_some() {
            query.push_str(" AND m.is_read = ?");
        }
        let mut q = bind_query_as(
            sqlx::query_as::<_, (i64,)>(&query).bind(mailbox),
            &compiled.values(),
        );
        if let Some(read) = read {
            q = q.bind(read);
        }
        Ok(q.fetch_one(&self.pool).await?.0 as u64)
    }

    pub async fn delete_one(&self, mailbox: &str, id: &str) -> Result<()> {
        let _ingest = self.gate.read().await;
        let (read, size) = sqlx::query_as::<_, (bool, i64)>(
            "DELETE FROM mailbox WHERE mailbox = ? AND id = ? RETURNING is_read, size",
        )
        .bind(mailbox)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::message_not_found(mailbox, id))?;

        self.remove_blobs(mailbox, &[id.to_string()]).await;
        self.stats.delete(mailbox, 1, u64::from(!read));
        self.add_deleted_size(size.max(0) as u64).await;
        self.touch();
        self.notifier.notify(MailboxEvent::Delete {
            mailbox: mailbox.to_string(),
            ids: vec![id.to_string()],
        });
        Ok(())
    }

    /// Deletes the listed messages; unknown ids are ignored. Returns the number
    /// removed.
    pub async fn delete_many(&self, mailbox: &str, ids: &[String]) -> Result<u64> {
        let _ingest = self.gate.read().await;
        let mut removed_ids = Vec::new();
        let mut unread = 0;
        let mut bytes = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let query = format!(
                "DELETE FROM mailbox WHERE mailbox = ? AND id IN ({}) RETURNING id, is_read, size",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query_as::<_, (String, bool, i64)>(&query).bind(mailbox);
            for id in chunk {
                q = q.bind(id);
            }
            let rows = match q.fetch_all(&self.pool).await {
                Ok(rows) => rows,
                Err(err) if removed_ids.is_empty() => return Err(err.into()),
                // Earlier chunks are gone; account for them before failing.
                Err(err) => {
                    self.finish_delete_many(mailbox, removed_ids, unread, bytes).await;
                    return Err(err.into());
                }
            };
            for (id, read, size) in rows {
                if !read {
                    unread += 1;
                }
                bytes += size.max(0) as u64;
                removed_ids.push(id);
            }
        }
        Ok(self.finish_delete_many(mailbox, removed_ids, unread, bytes).await)
    }

    async fn finish_delete_many(
        &self,
        mailbox: &str,
        removed_ids: Vec<String>,
        unread: u64,
        bytes: u64,
    ) -> u64 {
        if removed_ids.is_empty() {
            return 0;
        }
        self.remove_blobs(mailbox, &removed_ids).await;
        let removed = removed_ids.len() as u64;
        self.stats.delete(mailbox, removed, unread);
        self.add_deleted_size(bytes).await;
        self.touch();
        self.notifier.notify(MailboxEvent::Delete {
            mailbox: mailbox.to_string(),
            ids: removed_ids,
        });
        removed
    }

    /// Empties the mailbox in bounded rounds, then recounts its stats.
    pub async fn delete_all(&self, mailbox: &str) -> Result<DeleteReport> {
        self.delete_bulk(mailbox, &CompiledQuery::default()).await
    }

    pub async fn delete_by_query(
        &self,
        mailbox: &str,
        query: &str,
        timezone: Option<&str>,
    ) -> Result<DeleteReport> {
        let compiled = search::compile(query, timezone);
        self.delete_bulk(mailbox, &compiled).await
    }

    async fn delete_bulk(&self, mailbox: &str, filter: &CompiledQuery) -> Result<DeleteReport> {
        let report = self.delete_matching(mailbox, filter, None).await?;
        self.stats_refresh(mailbox).await?;
        if report.deleted > 0 {
            info!(
                "[store] {}: deleted {} messages in {} rounds",
                mailbox, report.deleted, report.rounds
            );
            self.notifier.notify(MailboxEvent::Prune {
                mailbox: mailbox.to_string(),
                deleted: report.deleted,
            });
        }
        Ok(report)
    }

    /// Deletes matching messages oldest first, at most `delete_batch_size` per
    /// round and at most `cap` overall. Each round holds the gate exclusively
    /// and its stats transition is exact.
    pub(crate) async fn delete_matching(
        &self,
        mailbox: &str,
        filter: &CompiledQuery,
        cap: Option<u64>,
    ) -> Result<DeleteReport> {
        let query = format!(
            "DELETE FROM mailbox WHERE seq IN (
                 SELECT m.seq FROM mailbox m WHERE m.mailbox = ?{}
                 ORDER BY m.created ASC, m.seq ASC LIMIT ?
             ) RETURNING id, is_read, size",
            filter.where_sql()
        );
        let values = filter.values();
        let mut report = DeleteReport::default();
        loop {
            let mut batch = self.config.delete_batch_size;
            if let Some(cap) = cap {
                batch = batch.min(cap.saturating_sub(report.deleted));
            }
            if batch == 0 {
                break;
            }
            let _round = self.gate.write().await;
            let rows = bind_query_as(
                sqlx::query_as::<_, (String, bool, i64)>(&query).bind(mailbox),
                &values,
            )
            .bind(batch as i64)
            .fetch_all(&self.pool)
            .await?;
            if rows.is_empty() {
                break;
            }
            let unread = rows.iter().filter(|(_, read, _)| !read).count() as u64;
            let bytes: u64 = rows.iter().map(|(_, _, size)| (*size).max(0) as u64).sum();
            let ids: Vec<String> = rows.into_iter().map(|(id, _, _)| id).collect();
            self.remove_blobs(mailbox, &ids).await;
            self.stats.delete(mailbox, ids.len() as u64, unread);
            self.add_deleted_size(bytes).await;
            self.touch();
            report.deleted += ids.len() as u64;
            report.rounds += 1;
            debug!(
                "[store] {}: round {} removed {}",
                mailbox,
                report.rounds,
                ids.len()
            );
        }
        Ok(report)
    }

    /// Summary rows are already gone; a raw row left behind here is invisible
    /// and removed by the orphan backfill job.
    async fn remove_blobs(&self, mailbox: &str, ids: &[String]) {
        if let Err(err) = self.blobs.delete(mailbox, ids).await {
            warn!(
                "[store] {}: raw delete failed for {} ids: {}",
                mailbox,
                ids.len(),
                err
            );
        }
    }

    /// Sets the read flag and returns how many messages actually changed.
    pub async fn set_read_status(
        &self,
        mailbox: &str,
        target: &ReadTarget,
        read: bool,
    ) -> Result<u64> {
        let _ingest = self.gate.read().await;
        let changed = match target {
            ReadTarget::Ids(ids) => {
                let mut changed = 0;
                for chunk in ids.chunks(ID_CHUNK) {
                    let query = format!(
                        "UPDATE mailbox SET is_read = ? WHERE mailbox = ? AND is_read = ? AND id IN ({})",
                        placeholders(chunk.len())
                    );
                    let mut q = sqlx::query(&query).bind(read).bind(mailbox).bind(!read);
                    for id in chunk {
                        q = q.bind(id);
                    }
                    changed += q.execute(&self.pool).await?.rows_affected();
                }
                changed
            }
            ReadTarget::Query { query, timezone } => {
                let compiled = search::compile(query, timezone.as_deref());
                self.set_read_matching(mailbox, &compiled, read).await?
            }
            ReadTarget::All => {
                self.set_read_matching(mailbox, &CompiledQuery::default(), read)
                    .await?
            }
        };
        if read {
            self.stats.mark_read(mailbox, changed);
        } else {
            self.stats.mark_unread(mailbox, changed);
        }
        if changed > 0 {
            self.touch();
        }
        Ok(changed)
    }

    async fn set_read_matching(
        &self,
        mailbox: &str,
        filter: &CompiledQuery,
        read: bool,
    ) -> Result<u64> {
        let query = format!(
            "UPDATE mailbox SET is_read = ? WHERE seq IN (
                 SELECT m.seq FROM mailbox m WHERE m.mailbox = ? AND m.is_read = ?{}
             )",
            filter.where_sql()
        );
        let q = sqlx::query(&query).bind(read).bind(mailbox).bind(!read);
        let q = bind_query(q, &filter.values());
        Ok(q.execute(&self.pool).await?.rows_affected())
    }

    pub fn stats_get(&self, mailbox: &str) -> Result<MailboxStats> {
        self.stats.get(mailbox)
    }

    /// Recounts `mailbox` from storage and replaces the cached entry.
    pub async fn stats_refresh(&self, mailbox: &str) -> Result<MailboxStats> {
        let _recount = self.gate.write().await;
        let (total, unread) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(is_read = 0), 0) FROM mailbox WHERE mailbox = ?",
        )
        .bind(mailbox)
        .fetch_one(&self.pool)
        .await?;
        let stats = MailboxStats {
            total: total as u64,
            unread: unread as u64,
        };
        self.stats.replace(mailbox, stats);
        Ok(stats)
    }

    pub async fn refresh_all_stats(&self) -> Result<()> {
        let _recount = self.gate.write().await;
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT mailbox, COUNT(*), COALESCE(SUM(is_read = 0), 0) FROM mailbox GROUP BY mailbox",
        )
        .fetch_all(&self.pool)
        .await?;
        let counts: HashMap<String, MailboxStats> = rows
            .into_iter()
            .map(|(mailbox, total, unread)| {
                (
                    mailbox,
                    MailboxStats {
                        total: total as u64,
                        unread: unread as u64,
                    },
                )
            })
            .collect();
        info!("[stats] loaded {} mailboxes", counts.len());
        self.stats.replace_all(counts);
        Ok(())
    }

    /// Every mailbox holding at least one message.
    pub async fn mailboxes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT mailbox FROM mailbox ORDER BY mailbox",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
