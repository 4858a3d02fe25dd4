use std::collections::BTreeSet;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::TagFilterConfig;
use crate::db::bind_query_as;
use crate::error::{Result, StoreError};
use crate::events::MailboxEvent;
use crate::model::TagCount;
use crate::search::{self, CompiledQuery};
use crate::store::MessageStore;

/// Tag column as a JSON array, with legacy non-JSON values read as empty.
pub(crate) const TAGS_JSON: &str = "CASE WHEN json_valid(m.tags) THEN m.tags ELSE '[]' END";

const RETAG_BATCH: i64 = 500;

/// Replaces anything but ASCII letters, digits, `-`, `_` and space with a
/// space, then collapses and trims whitespace.
pub fn clean_tag(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ') {
                c
            } else {
                ' '
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct TagRules {
    pattern: Regex,
}

impl TagRules {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| StoreError::Validation(format!("invalid tag pattern: {}", err)))?;
        Ok(Self { pattern })
    }

    pub fn is_valid(&self, tag: &str) -> bool {
        self.pattern.is_match(tag)
    }

    /// Cleaned, validated, deduplicated and sorted. The first invalid tag
    /// fails the whole set.
    pub fn normalize<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<String>> {
        let mut set = BTreeSet::new();
        for tag in tags {
            let cleaned = clean_tag(tag.as_ref());
            if cleaned.is_empty() {
                continue;
            }
            if !self.is_valid(&cleaned) {
                return Err(StoreError::Validation(format!("invalid tag {:?}", cleaned)));
            }
            set.insert(cleaned);
        }
        Ok(set.into_iter().collect())
    }

    /// Like `normalize`, but invalid tags are dropped instead of failing.
    pub fn normalize_lenient<S: AsRef<str>>(&self, tags: &[S]) -> Vec<String> {
        let mut set = BTreeSet::new();
        for tag in tags {
            let cleaned = clean_tag(tag.as_ref());
            if cleaned.is_empty() {
                continue;
            }
            if self.is_valid(&cleaned) {
                set.insert(cleaned);
            } else {
                debug!("[tags] dropping invalid tag {:?}", cleaned);
            }
        }
        set.into_iter().collect()
    }

    fn single(&self, tag: &str) -> Result<String> {
        let cleaned = clean_tag(tag);
        if cleaned.is_empty() || !self.is_valid(&cleaned) {
            return Err(StoreError::Validation(format!("invalid tag {:?}", tag)));
        }
        Ok(cleaned)
    }
}

/// A configured query whose matches receive `tags` on arrival.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub query: String,
    pub tags: Vec<String>,
    compiled: CompiledQuery,
}

impl TagFilter {
    /// Compiles each entry once. Entries without a query, or without a
    /// single valid tag, are skipped.
    pub fn compile_all(entries: &[TagFilterConfig], rules: &TagRules) -> Vec<TagFilter> {
        let mut out = Vec::new();
        for entry in entries {
            let query = entry.query.trim();
            if query.is_empty() {
                warn!("[tags] ignoring tag filter with missing match");
                continue;
            }
            let tags = rules.normalize_lenient(&entry.tags);
            if tags.is_empty() {
                warn!("[tags] ignoring tag filter {:?} without valid tags", query);
                continue;
            }
            let compiled = search::compile(query, None);
            if compiled.is_empty() {
                warn!("[tags] ignoring tag filter {:?} that matches everything", query);
                continue;
            }
            out.push(TagFilter {
                query: query.to_string(),
                tags,
                compiled,
            });
        }
        out
    }
}

/// Reads a stored tag column: a JSON array, or legacy comma-separated text.
pub(crate) fn decode_tags(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(tags) = serde_json::from_str::<Vec<String>>(trimmed) {
        return tags;
    }
    trimmed
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub(crate) fn encode_tags(tags: &[String]) -> Result<String> {
    Ok(serde_json::to_string(tags)?)
}

impl MessageStore {
    /// Replaces the tag set of one message and returns the stored set.
    pub async fn set_tags<S: AsRef<str> + Sync>(
        &self,
        mailbox: &str,
        id: &str,
        tags: &[S],
    ) -> Result<Vec<String>> {
        let tags = self.tag_rules.normalize(tags)?;
        let encoded = encode_tags(&tags)?;
        let updated = sqlx::query("UPDATE mailbox SET tags = ? WHERE mailbox = ? AND id = ?")
            .bind(&encoded)
            .bind(mailbox)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::message_not_found(mailbox, id));
        }
        self.touch();
        self.notifier.notify(MailboxEvent::Update {
            mailbox: mailbox.to_string(),
            id: id.to_string(),
            tags: tags.clone(),
        });
        Ok(tags)
    }

    /// Renames `old` to `new` on every message in every mailbox. Returns the
    /// number of messages changed.
    pub async fn rename_tag(&self, old: &str, new: &str) -> Result<u64> {
        let new = self.tag_rules.single(new)?;
        let old = old.trim();
        if old == new {
            return Ok(0);
        }
        let changed = self
            .retag(old, |tags| {
                let mut set: BTreeSet<String> = tags.into_iter().filter(|t| t != old).collect();
                set.insert(new.clone());
                set.into_iter().collect()
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "tag",
                key: old.to_string(),
            });
        }
        info!("[tags] renamed {:?} to {:?} on {} messages", old, new, changed);
        Ok(changed)
    }

    /// Removes `name` from every message; no message is deleted.
    pub async fn delete_tag(&self, name: &str) -> Result<u64> {
        let name = name.trim();
        let changed = self
            .retag(name, |tags| tags.into_iter().filter(|t| t != name).collect())
            .await?;
        info!("[tags] removed {:?} from {} messages", name, changed);
        Ok(changed)
    }

    /// Distinct tags in `mailbox` with the number of messages carrying each.
    pub async fn list_tags(&self, mailbox: &str) -> Result<Vec<TagCount>> {
        let query = format!(
            "SELECT json_each.value, COUNT(*) FROM mailbox m, json_each({})
             WHERE m.mailbox = ? GROUP BY json_each.value ORDER BY json_each.value",
            TAGS_JSON
        );
        let rows = sqlx::query_as::<_, (String, i64)>(&query)
            .bind(mailbox)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, total)| TagCount {
                name,
                total: total as u64,
            })
            .collect())
    }

    /// Tags of every configured filter matching the stored message.
    pub(crate) async fn filter_tags(&self, mailbox: &str, id: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for filter in self.tag_filters.iter() {
            let query = format!(
                "SELECT COUNT(*) FROM mailbox m WHERE m.mailbox = ? AND m.id = ?{}",
                filter.compiled.where_sql()
            );
            let (hits,) = bind_query_as(
                sqlx::query_as::<_, (i64,)>(&query).bind(mailbox).bind(id),
                &filter.compiled.values(),
            )
            .fetch_one(&self.pool)
            .await?;
            if hits > 0 {
                out.extend(filter.tags.iter().cloned());
            }
        }
        Ok(out)
    }

    /// Rewrites the tags of every message carrying `tag`, in keyset batches.
    /// A row whose tags changed since it was read is left alone.
    async fn retag<F>(&self, tag: &str, rewrite: F) -> Result<u64>
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
    {
        let select = format!(
            "SELECT m.seq, m.mailbox, m.id, m.tags FROM mailbox m
             WHERE m.seq > ? AND EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value = ?)
             ORDER BY m.seq LIMIT ?",
            TAGS_JSON
        );
        let mut last_seq = 0i64;
        let mut changed = 0u64;
        loop {
            let rows = sqlx::query_as::<_, (i64, String, String, String)>(&select)
                .bind(last_seq)
                .bind(tag)
                .bind(RETAG_BATCH)
                .fetch_all(&self.pool)
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            last_seq = last.0;

            let updates: Vec<_> = rows
                .into_iter()
                .map(|(seq, mailbox, id, raw)| (seq, mailbox, id, rewrite(decode_tags(&raw)), raw))
                .collect();

            let mut tx = self.pool.begin().await?;
            let mut batch_changed = Vec::new();
            for (seq, mailbox, id, tags, raw) in &updates {
                let encoded = encode_tags(tags)?;
                let n = sqlx::query("UPDATE mailbox SET tags = ? WHERE seq = ? AND tags = ?")
                    .bind(&encoded)
                    .bind(*seq)
                    .bind(raw)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if n > 0 {
                    batch_changed.push((mailbox.clone(), id.clone(), tags.clone()));
                }
            }
            tx.commit().await?;
            self.touch();

            changed += batch_changed.len() as u64;
            for (mailbox, id, tags) in batch_changed {
                self.notifier.notify(MailboxEvent::Update { mailbox, id, tags });
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::{TagFilter, TagRules, clean_tag, decode_tags};
    use crate::config::{DEFAULT_TAG_PATTERN, TagFilterConfig};
    use crate::error::StoreError;

    #[test]
    fn clean_tag_strips_and_collapses() {
        assert_eq!(clean_tag("  Urgent!!  "), "Urgent");
        assert_eq!(clean_tag("one,two;three"), "one two three");
        assert_eq!(clean_tag("a.b/c"), "a b c");
        assert_eq!(clean_tag("snake_case-tag"), "snake_case-tag");
        assert_eq!(clean_tag("日本"), "");
    }

    #[test]
    fn clean_tag_is_idempotent() {
        for input in ["  Hello   World ", "x@y#z", "", "--__--", "tab\there", "Ünïcode tag"] {
            let once = clean_tag(input);
            assert_eq!(clean_tag(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn normalize_dedups_sorts_and_keeps_case() {
        let rules = TagRules::new(DEFAULT_TAG_PATTERN).unwrap();
        let tags = rules
            .normalize(&["important", "Important", " important ", "!!", "beta"])
            .unwrap();
        assert_eq!(tags, vec!["Important", "beta", "important"]);
    }

    #[test]
    fn custom_pattern_rejects_short_tags() {
        let rules = TagRules::new(r"^[a-zA-Z0-9\- _]{3,}$").unwrap();
        let err = rules.normalize(&["ok-tag", "ab"]).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(rules.normalize_lenient(&["ok-tag", "ab"]), vec!["ok-tag"]);
    }

    #[test]
    fn invalid_pattern_is_a_validation_error() {
        assert!(matches!(TagRules::new("("), Err(StoreError::Validation(_))));
    }

    #[test]
    fn unusable_tag_filters_are_skipped() {
        let rules = TagRules::new(DEFAULT_TAG_PATTERN).unwrap();
        let entry = |query: &str, tags: &[&str]| TagFilterConfig {
            query: query.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        let filters = TagFilter::compile_all(
            &[
                entry("  ", &["x"]),
                entry("from:a@b.com", &["!!!"]),
                entry(r#""""#, &["x"]),
                entry("subject:invoice", &["billing", "Billing", "billing"]),
            ],
            &rules,
        );
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].query, "subject:invoice");
        assert_eq!(filters[0].tags, vec!["Billing", "billing"]);
    }

    #[test]
    fn decode_reads_json_and_legacy_text() {
        assert_eq!(decode_tags(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(decode_tags("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(decode_tags("").is_empty());
    }
}
