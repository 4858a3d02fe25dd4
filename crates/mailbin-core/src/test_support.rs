use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::StoreConfig;

/// Throwaway database file, removed with its WAL files on drop.
pub(crate) struct TempDb {
    path: PathBuf,
}

impl TempDb {
    pub(crate) fn new(label: &str) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!(
            "mailbin-core-{}-{}-{}.db",
            label,
            std::process::id(),
            ts
        ));
        let _ = std::fs::remove_file(&path);
        Self { path }
    }

    pub(crate) fn config(&self) -> StoreConfig {
        StoreConfig {
            database: self.path.clone(),
            ..StoreConfig::default()
        }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) fn sample_message(i: usize) -> String {
    format!(
        "From: Sender {i} <sender{i}@example.com>\r\n\
         To: inbox@example.com\r\n\
         Subject: Sample {i}\r\n\
         Message-ID: <msg-{i}@example.com>\r\n\
         Date: Mon, 02 Jun 2025 09:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of sample {i} unique-token-{i}\r\n"
    )
}
