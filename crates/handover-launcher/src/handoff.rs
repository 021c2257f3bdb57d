use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use handover_process::HandoffRecord;
use tokio::io::AsyncWriteExt;

/// Persists the single bridged record at a well-known path shared with the
/// Viewer client, which polls it. Writes are whole-record (tmp file +
/// rename), so a concurrent reader never observes a half-written value.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    path: PathBuf,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl HandoffStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, endpoint: Option<&str>) -> anyhow::Result<()> {
        let record = HandoffRecord {
            endpoint: endpoint.map(str::to_string),
            written_at_unix_ms: Some(now_unix_ms()),
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create handoff dir")?;
        }

        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let data = serde_json::to_vec_pretty(&record).context("serialize handoff record")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create handoff tmp")?;
        f.write_all(&data).await.context("write handoff tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist handoff record")?;
        Ok(())
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        self.write(None).await
    }

    /// A missing file reads as the default (null) record, not an error.
    pub async fn read(&self) -> anyhow::Result<HandoffRecord> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HandoffRecord::default());
            }
            Err(e) => return Err(e).context("read handoff record"),
        };
        serde_json::from_slice(&data).context("parse handoff record")
    }
}
