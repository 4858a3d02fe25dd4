//! Space reclamation. Deleted message bytes are tallied in the `settings`
//! table; once the store has been idle long enough and the tally is a large
//! enough share of what is still stored, the database is vacuumed.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::MessageStore;

const DELETED_SIZE_KEY: &str = "deleted_size";

impl MessageStore {
    /// Records a mutation at the current clock reading.
    pub(crate) fn touch(&self) {
        self.last_activity
            .store(self.clock.now_ms(), Ordering::SeqCst);
    }

    /// Clock reading of the most recent mutation, in milliseconds.
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub(crate) async fn add_deleted_size(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let res = sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
        )
        .bind(DELETED_SIZE_KEY)
        .bind(bytes as i64)
        .execute(&self.pool)
        .await;
        if let Err(err) = res {
            warn!("[vacuum] could not record {} deleted bytes: {}", bytes, err);
        }
    }

    /// Bytes deleted since the last vacuum.
    pub async fn deleted_size(&self) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT value FROM settings WHERE key = ?")
            .bind(DELETED_SIZE_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(0, |(v,)| v.max(0) as u64))
    }

    /// Sum of the message sizes still stored, across all mailboxes.
    pub async fn stored_size(&self) -> Result<u64> {
        let (total,) = sqlx::query_as::<_, (i64,)>("SELECT COALESCE(SUM(size), 0) FROM mailbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    /// True once the store has been idle for `vacuum_idle_secs` and the
    /// deleted bytes reach `vacuum_min_deleted_percent` of the stored bytes.
    /// An empty store with any deleted bytes always qualifies.
    pub async fn vacuum_due(&self) -> Result<bool> {
        let Some(idle) = self.config.vacuum_idle() else {
            return Ok(false);
        };
        let quiet = self.clock.now_ms() - self.last_activity_ms();
        if quiet < idle.as_millis() as i64 {
            return Ok(false);
        }
        let deleted = self.deleted_size().await?;
        if deleted == 0 {
            return Ok(false);
        }
        let total = self.stored_size().await?;
        let percent = if total == 0 {
            100
        } else {
            deleted.saturating_mul(100) / total
        };
        debug!("[vacuum] {} deleted bytes, {}% of {}", deleted, percent, total);
        Ok(percent >= self.config.vacuum_min_deleted_percent)
    }

    /// Checkpoints the WAL, rebuilds the database file and truncates the WAL,
    /// then clears the deleted-bytes tally. No mutation runs meanwhile.
    pub async fn vacuum(&self) -> Result<()> {
        let _exclusive = self.gate.write().await;
        let started = std::time::Instant::now();
        sqlx::query("PRAGMA wal_checkpoint").execute(&self.pool).await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE settings SET value = 0 WHERE key = ?")
            .bind(DELETED_SIZE_KEY)
            .execute(&self.pool)
            .await?;
        info!("[vacuum] database compacted in {:?}", started.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::store::MessageStore;
    use crate::test_support::{TempDb, sample_message};

    const IDLE_MS: i64 = 300 * 1000;

    #[tokio::test]
    async fn deletes_are_tallied_by_size() -> anyhow::Result<()> {
        let db = TempDb::new("vacuum-tally");
        let store = MessageStore::open(db.config()).await?;
        let a = store.store("default", sample_message(1).as_bytes()).await?;
        let b = store.store("default", sample_message(2).as_bytes()).await?;
        assert_eq!(store.deleted_size().await?, 0);

        store.delete_one("default", a.id()).await?;
        let first = sample_message(1).len() as u64;
        assert_eq!(store.deleted_size().await?, first);

        store.delete_many("default", &[b.id().to_string()]).await?;
        let second = sample_message(2).len() as u64;
        assert_eq!(store.deleted_size().await?, first + second);
        assert_eq!(store.stored_size().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn vacuum_waits_for_idle_then_resets_tally() -> anyhow::Result<()> {
        let db = TempDb::new("vacuum-idle");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MessageStore::open(db.config())
            .await?
            .with_clock(clock.clone());
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(store.store("default", sample_message(i).as_bytes()).await?);
        }
        assert!(!store.vacuum_due().await?, "nothing deleted yet");

        store.delete_one("default", ids[0].id()).await?;
        clock.advance(IDLE_MS - 1000);
        assert!(!store.vacuum_due().await?, "still inside the idle window");

        clock.advance(1000);
        assert!(store.vacuum_due().await?);
        store.vacuum().await?;
        assert_eq!(store.deleted_size().await?, 0);
        assert!(!store.vacuum_due().await?);
        assert_eq!(store.stats_get("default")?.total, 3);
        Ok(())
    }

    #[tokio::test]
    async fn small_deletions_stay_below_threshold() -> anyhow::Result<()> {
        let db = TempDb::new("vacuum-threshold");
        let mut config = db.config();
        config.vacuum_min_deleted_percent = 50;
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MessageStore::open(config).await?.with_clock(clock.clone());
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(store.store("default", sample_message(i).as_bytes()).await?);
        }
        store.delete_one("default", ids[0].id()).await?;
        clock.advance(IDLE_MS);
        // One of four similar messages is about a third of what remains.
        assert!(!store.vacuum_due().await?);

        store.delete_one("default", ids[1].id()).await?;
        clock.advance(IDLE_MS);
        assert!(store.vacuum_due().await?);
        Ok(())
    }

    #[tokio::test]
    async fn zero_idle_disables_vacuum() -> anyhow::Result<()> {
        let db = TempDb::new("vacuum-off");
        let mut config = db.config();
        config.vacuum_idle_secs = 0;
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MessageStore::open(config).await?.with_clock(clock.clone());
        let stored = store.store("default", sample_message(1).as_bytes()).await?;
        store.delete_one("default", stored.id()).await?;
        clock.advance(10 * IDLE_MS);
        assert!(!store.vacuum_due().await?);
        Ok(())
    }
}
