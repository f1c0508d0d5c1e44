//! Decision journal - append-only tick records and current status
//!
//! Layout under the state directory:
//! - `journal/decisions/YYYY-MM-DD.jsonl`: one [`TickReport`] per line
//! - `state/now.json`: latest [`NowState`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::TickReport;

/// Current status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub mode: String,
    pub status: String,
    pub last_action: String,
    pub last_reason: String,
    pub open_positions: usize,
    pub tracked_positions: usize,
    pub session_stats: SessionStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub ticks: u64,
    pub opens: u64,
    pub closes: u64,
    pub failed_ticks: u64,
}

/// Writes journal lines and the status file
pub struct DecisionJournal {
    state_dir: PathBuf,
    journal_dir: PathBuf,
}

impl DecisionJournal {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            state_dir: base.join("state"),
            journal_dir: base.join("journal").join("decisions"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.journal_dir).await?;
        Ok(())
    }

    pub fn journal_path(&self, day: DateTime<Utc>) -> PathBuf {
        self.journal_dir
            .join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let path = self.state_dir.join("now.json");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    /// Append one tick record to the day's journal file
    pub async fn append(&self, report: &TickReport) -> anyhow::Result<()> {
        let path = self.journal_path(report.timestamp);
        let mut line = serde_json::to_string(report)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Journaled tick to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;
    use tempfile::tempdir;

    fn report(timestamp: DateTime<Utc>, reason: &str) -> TickReport {
        TickReport {
            timestamp,
            instrument: "GOLD".to_string(),
            price: None,
            balance: None,
            decision: Decision::hold(reason),
            opened: None,
            evaluations: vec![],
            closes: vec![],
            pruned: vec![],
            skipped_records: 0,
            persisted: false,
            errors: vec![],
        }
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_tick() {
        let dir = tempdir().unwrap();
        let journal = DecisionJournal::new(dir.path());
        journal.init().await.unwrap();

        let now = Utc::now();
        journal.append(&report(now, "first")).await.unwrap();
        journal.append(&report(now, "second")).await.unwrap();

        let content = std::fs::read_to_string(journal.journal_path(now)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["decision"]["reason"], "second");
        assert_eq!(parsed["decision"]["action"], "HOLD");
    }

    #[tokio::test]
    async fn test_write_now() {
        let dir = tempdir().unwrap();
        let journal = DecisionJournal::new(dir.path());
        journal.init().await.unwrap();

        let state = NowState {
            timestamp: Utc::now(),
            instrument: "GOLD".to_string(),
            mode: "paper".to_string(),
            status: "running".to_string(),
            last_action: "HOLD".to_string(),
            last_reason: "no condition met".to_string(),
            open_positions: 0,
            tracked_positions: 0,
            session_stats: SessionStats { ticks: 3, ..SessionStats::default() },
        };
        journal.write_now(&state).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("state").join("now.json")).unwrap();
        let back: NowState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.session_stats.ticks, 3);
        assert_eq!(back.status, "running");
    }

    #[tokio::test]
    async fn test_append_without_init_fails() {
        let dir = tempdir().unwrap();
        let journal = DecisionJournal::new(dir.path().join("missing"));
        assert!(journal.append(&report(Utc::now(), "x")).await.is_err());
    }
}
