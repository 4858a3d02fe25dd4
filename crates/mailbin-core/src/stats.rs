use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::warn;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStats {
    pub total: u64,
    pub unread: u64,
}

#[derive(Debug, Default)]
struct Entry {
    stats: MailboxStats,
    drifted: bool,
}

/// Per-mailbox counters kept in step with every committed mutation. One lock
/// guards the whole map; every transition is O(1).
#[derive(Debug, Default)]
pub struct StatsCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counters for `mailbox`; fails once a transition has underflowed until
    /// the entry is replaced by a refresh.
    pub fn get(&self, mailbox: &str) -> Result<MailboxStats> {
        let entries = self.lock();
        match entries.get(mailbox) {
            Some(entry) if entry.drifted => Err(StoreError::Drift {
                mailbox: mailbox.to_string(),
            }),
            Some(entry) => Ok(entry.stats),
            None => Ok(MailboxStats::default()),
        }
    }

    /// Cached totals regardless of drift, for scheduling decisions.
    pub fn snapshot(&self) -> Vec<(String, MailboxStats)> {
        let entries = self.lock();
        let mut out: Vec<_> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.stats))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn is_drifted(&self, mailbox: &str) -> bool {
        self.lock().get(mailbox).is_some_and(|entry| entry.drifted)
    }

    pub fn insert(&self, mailbox: &str) {
        let mut entries = self.lock();
        let entry = entries.entry(mailbox.to_string()).or_default();
        entry.stats.total += 1;
        entry.stats.unread += 1;
    }

    /// Removal of `removed` messages, `unread_removed` of which were unread.
    pub fn delete(&self, mailbox: &str, removed: u64, unread_removed: u64) {
        if removed == 0 {
            return;
        }
        let mut entries = self.lock();
        let entry = entries.entry(mailbox.to_string()).or_default();
        entry.stats.total = checked_sub(mailbox, "total", entry.stats.total, removed, &mut entry.drifted);
        entry.stats.unread = checked_sub(
            mailbox,
            "unread",
            entry.stats.unread,
            unread_removed,
            &mut entry.drifted,
        );
    }

    pub fn mark_read(&self, mailbox: &str, count: u64) {
        if count == 0 {
            return;
        }
        let mut entries = self.lock();
        let entry = entries.entry(mailbox.to_string()).or_default();
        entry.stats.unread = checked_sub(mailbox, "unread", entry.stats.unread, count, &mut entry.drifted);
    }

    pub fn mark_unread(&self, mailbox: &str, count: u64) {
        if count == 0 {
            return;
        }
        let mut entries = self.lock();
        let entry = entries.entry(mailbox.to_string()).or_default();
        entry.stats.unread += count;
        if entry.stats.unread > entry.stats.total {
            warn!(
                "[stats] {}: unread {} exceeds total {}, marking drifted",
                mailbox, entry.stats.unread, entry.stats.total
            );
            entry.stats.unread = entry.stats.total;
            entry.drifted = true;
        }
    }

    /// Replaces the entry with freshly counted values and clears drift.
    pub fn replace(&self, mailbox: &str, stats: MailboxStats) {
        let mut entries = self.lock();
        entries.insert(
            mailbox.to_string(),
            Entry {
                stats,
                drifted: false,
            },
        );
    }

    /// Replaces the whole map; mailboxes missing from `counts` are dropped.
    pub fn replace_all(&self, counts: HashMap<String, MailboxStats>) {
        let mut entries = self.lock();
        entries.clear();
        for (mailbox, stats) in counts {
            entries.insert(
                mailbox,
                Entry {
                    stats,
                    drifted: false,
                },
            );
        }
    }
}

fn checked_sub(mailbox: &str, field: &str, current: u64, by: u64, drifted: &mut bool) -> u64 {
    match current.checked_sub(by) {
        Some(value) => value,
        None => {
            warn!(
                "[stats] {}: {} underflow ({} - {}), marking drifted",
                mailbox, field, current, by
            );
            *drifted = true;
            0
        }
    }
}
