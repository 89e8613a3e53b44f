//! JSONL journal backend.
//!
//! Each identity owns one append-only file `<data_dir>/<escaped-id>.jsonl`
//! holding one [`JournalEntry`] per line. Compaction rewrites the file
//! through a temp file and an atomic rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use shopcast_core::{Cursor, IdentityId, Notification};

use super::backend::{JournalEntry, StoreBackend};
use super::StoreError;

const JOURNAL_EXT: &str = "jsonl";

#[derive(Debug, Clone)]
pub struct JsonlBackend {
    data_dir: PathBuf,
}

impl JsonlBackend {
    /// Opens (and creates if missing) the journal directory.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn journal_path(&self, identity: &IdentityId) -> PathBuf {
        self.data_dir
            .join(format!("{}.{JOURNAL_EXT}", escape_file_name(identity.as_str())))
    }

    async fn append_line(&self, identity: &IdentityId, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(identity))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for JsonlBackend {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn load(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.data_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }

            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut loaded = 0usize;
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(line) {
                    Ok(entry) => {
                        entries.push(entry);
                        loaded += 1;
                    }
                    // A torn final write leaves a partial line; skip it.
                    Err(e) => warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable journal line"
                    ),
                }
            }
            // Terminate a torn tail so the next append starts on a fresh line.
            if !text.is_empty() && !text.ends_with('\n') {
                let mut file = OpenOptions::new().append(true).open(&path).await?;
                file.write_all(b"\n").await?;
            }
            debug!(path = %path.display(), entries = loaded, "Loaded journal");
        }

        Ok(entries)
    }

    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        self.append_line(
            &notification.identity,
            &JournalEntry::Notification(notification.clone()),
        )
        .await
    }

    async fn mark_read(&self, identity: &IdentityId, upto: Cursor) -> Result<(), StoreError> {
        self.append_line(
            identity,
            &JournalEntry::Read {
                identity: identity.clone(),
                upto,
            },
        )
        .await
    }

    async fn compact(
        &self,
        identity: &IdentityId,
        pruned_through: Cursor,
        retained: &[Notification],
    ) -> Result<(), StoreError> {
        let path = self.journal_path(identity);
        let tmp_path = path.with_extension(format!("{JOURNAL_EXT}.tmp"));

        let mut buf = serde_json::to_vec(&JournalEntry::Pruned {
            identity: identity.clone(),
            through: pruned_through,
        })?;
        buf.push(b'\n');
        for notification in retained {
            serde_json::to_writer(&mut buf, &JournalEntry::Notification(notification.clone()))?;
            buf.push(b'\n');
        }

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        debug!(
            identity = %identity,
            pruned_through = %pruned_through,
            retained = retained.len(),
            "Compacted journal"
        );
        Ok(())
    }

    async fn record_pruned(&self, identity: &IdentityId, through: Cursor) -> Result<(), StoreError> {
        self.append_line(
            identity,
            &JournalEntry::Pruned {
                identity: identity.clone(),
                through,
            },
        )
        .await
    }
}

/// Maps an identity onto a safe file name. Anything outside
/// `[A-Za-z0-9-]` becomes `_xx` (lowercase hex of each byte).
fn escape_file_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}
