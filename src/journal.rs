//! Run journal
//!
//! Append-only, line-oriented log of significant run events (rotations,
//! observed identities, navigation results, attempt failures), one
//! timestamped entry per line. This is the operator-facing record of what a
//! run did; diagnostic logging goes through `tracing` separately.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Append-only run journal
pub struct Journal {
    file: Mutex<Option<tokio::fs::File>>,
}

impl Journal {
    /// Open (or create) the journal at `path` in append mode
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    /// A journal that only mirrors entries to tracing
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Append one timestamped entry
    pub async fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);

        let mut file = self.file.lock().await;
        if let Some(file) = file.as_mut() {
            let line = format!(
                "[{}] {}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!("Failed to append journal entry: {}", e);
            }
        }
    }
}
