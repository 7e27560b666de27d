//! JSON snapshot of a run.
//!
//! Besides the sheet, a run can leave a JSON copy of everything it collected.
//! Files are organised by the collection date and time:
//!
//! ```text
//! json_output_dir/
//! └── 2025-05-06/
//!     ├── 0900.json
//!     └── 1500.json
//! ```

use crate::models::RunSnapshot;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

/// Path of the snapshot file for `snapshot` under `json_output_dir`.
pub fn snapshot_path(snapshot: &RunSnapshot, json_output_dir: &str) -> PathBuf {
    Path::new(json_output_dir)
        .join(snapshot.collected_at.format("%Y-%m-%d").to_string())
        .join(format!("{}.json", snapshot.collected_at.format("%H%M")))
}

/// Write a [`RunSnapshot`] as pretty JSON, returning the file written.
///
/// The date directory is created if needed. A second run in the same minute
/// overwrites the earlier file.
#[instrument(level = "info", skip_all, fields(json_output_dir = %json_output_dir, records = snapshot.records.len()))]
pub async fn write_snapshot(
    snapshot: &RunSnapshot,
    json_output_dir: &str,
) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(snapshot)?;
    let path = snapshot_path(snapshot, json_output_dir);

    if let Some(dir) = path.parent() {
        info!(dir = %dir.display(), "Ensuring JSON directory exists");
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create JSON dir");
            return Err(e.into());
        }
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run snapshot");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArticleRecord;
    use chrono::{FixedOffset, TimeZone};

    fn snapshot() -> RunSnapshot {
        let collected_at = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 5, 6, 9, 5, 0)
            .unwrap();
        RunSnapshot {
            collected_at,
            records: vec![ArticleRecord {
                id: "abc".to_string(),
                collected_at,
                title: "見出し".to_string(),
                provider: "共同通信".to_string(),
                published_at: String::new(),
                url: "https://news.yahoo.co.jp/articles/abc".to_string(),
                genre: "国内/社会".to_string(),
                body: "本文".to_string(),
            }],
        }
    }

    #[test]
    fn test_snapshot_path_uses_local_date_and_time() {
        let path = snapshot_path(&snapshot(), "/out");
        assert_eq!(path, PathBuf::from("/out/2025-05-06/0905.json"));
    }

    #[tokio::test]
    async fn test_write_snapshot_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let path = write_snapshot(&snapshot(), dir).await.unwrap();

        assert!(path.starts_with(tmp.path().join("2025-05-06")));
        let raw = std::fs::read_to_string(&path).unwrap();
        let read: RunSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(read.records, snapshot().records);
        assert!(raw.contains("国内/社会"));
    }
}
