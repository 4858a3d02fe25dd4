use mailbin_content::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Persist(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("stats for mailbox {mailbox:?} drifted; refresh required")]
    Drift { mailbox: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("corrupt stored value: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        StoreError::Parse(err.to_string())
    }
}

impl StoreError {
    pub(crate) fn message_not_found(mailbox: &str, id: &str) -> Self {
        StoreError::NotFound {
            kind: "message",
            key: format!("{}/{}", mailbox, id),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
