//! Message store and retrieval engine for captured mail.
//!
//! Every message is persisted twice: a summary row with the indexed fields,
//! tags and derived search text, and the untouched raw bytes behind the
//! [`BlobStore`] seam. [`MessageStore`] keeps the two halves paired, keeps
//! per-mailbox [`MailboxStats`] in step with every mutation and emits a
//! [`MailboxEvent`] after each change. [`Pruner`] bounds mailbox size in the
//! background and reclaims space once the store is idle, and
//! [`BackfillRunner`] repairs older rows at startup.

pub mod backfill;
pub mod blob;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod prune;
pub mod search;
pub mod stats;
pub mod store;
pub mod tags;
pub mod vacuum;

#[cfg(test)]
pub(crate) mod test_support;

pub use backfill::{BackfillJob, BackfillRunner, JobReport, reindex_all};
pub use blob::{BlobStore, SqliteBlobStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StoreConfig, TagFilterConfig};
pub use error::{Result, StoreError};
pub use events::{ChannelNotifier, MailboxEvent, NoopNotifier, Notifier};
pub use model::{
    Address, DeleteReport, Message, MessageSummary, Page, Part, ReadTarget, SearchResults, Stored,
    TagCount,
};
pub use prune::{PruneReport, Pruner};
pub use stats::{MailboxStats, StatsCache};
pub use store::MessageStore;
pub use tags::{TagFilter, TagRules, clean_tag};
