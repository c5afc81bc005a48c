//! Append-only trial log and end-of-run summary, read by external
//! dashboards.

use chrono::{DateTime, Utc};
use hd_optimizer::{BestResult, ObservationHistory, Trial};
use hd_types::{HdError, HdResult, ObjectiveDirection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "trials.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment: String,
    pub direction: ObjectiveDirection,
    pub best: Option<BestResult>,
    pub total_trials: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_history(experiment: impl Into<String>, history: &ObservationHistory) -> Self {
        Self {
            experiment: experiment.into(),
            direction: history.direction(),
            best: history.best().cloned(),
            total_trials: history.len(),
            succeeded: history.succeeded_count(),
            failed: history.failed_count(),
            finished_at: Utc::now(),
        }
    }
}

/// One JSON line per finished trial, in recording order.
#[derive(Debug)]
pub struct TrialJournal {
    dir: PathBuf,
    file: Mutex<File>,
}

impl TrialJournal {
    /// Create the experiment directory and start a fresh journal in it.
    pub fn create(dir: impl AsRef<Path>) -> HdResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(JOURNAL_FILE))?;
        Ok(Self {
            dir,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    pub fn append(&self, trial: &Trial) -> HdResult<()> {
        let mut line = serde_json::to_vec(trial)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> HdResult<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(summary)?)?;
        Ok(path)
    }

    /// Every trial recorded in the journal at `path`.
    pub fn read(path: impl AsRef<Path>) -> HdResult<Vec<Trial>> {
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Trial>(line).map_err(HdError::from))
            .collect()
    }
}
