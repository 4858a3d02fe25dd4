use serde::{Deserialize, Serialize};

pub use mailbin_content::{Address, Part};

pub const DEFAULT_PAGE_LIMIT: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub mailbox: String,
    /// Milliseconds since the epoch.
    pub created: i64,
    pub read: bool,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub subject: String,
    pub message_id: String,
    pub size: u64,
    pub attachments: u32,
    pub inline: u32,
    pub tags: Vec<String>,
    pub snippet: String,
}

/// A fully parsed message as returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(flatten)]
    pub summary: MessageSummary,
    /// Date header, or `created` when the header is missing.
    pub date: i64,
    pub return_path: String,
    pub text: String,
    pub html: String,
    pub attachment_parts: Vec<Part>,
    pub inline_parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub start: u64,
    pub limit: u64,
    /// Keyset cursor: only messages older than this id are returned.
    pub before: Option<String>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            start: 0,
            limit: DEFAULT_PAGE_LIMIT,
            before: None,
        }
    }
}

impl Page {
    pub fn new(start: u64, limit: u64) -> Self {
        Self {
            start,
            limit,
            before: None,
        }
    }

    pub fn before(id: impl Into<String>, limit: u64) -> Self {
        Self {
            start: 0,
            limit,
            before: Some(id.into()),
        }
    }

    pub(crate) fn effective_limit(&self) -> u64 {
        if self.limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    New(String),
    /// Dedup is enabled and the mailbox already holds this Message-ID; carries
    /// the id of the existing message.
    DuplicateSuppressed(String),
}

impl Stored {
    pub fn id(&self) -> &str {
        match self {
            Stored::New(id) | Stored::DuplicateSuppressed(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Stored::New(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: u64,
    pub rounds: u32,
}

#[derive(Debug, Clone)]
pub enum ReadTarget {
    Ids(Vec<String>),
    /// Messages matching a search; dates in the query resolve in `timezone`
    /// (an IANA name or a fixed offset) when given, else in UTC.
    Query {
        query: String,
        timezone: Option<String>,
    },
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub name: String,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub messages: Vec<MessageSummary>,
    /// Number of messages matching the query, ignoring pagination.
    pub matched: u64,
}
