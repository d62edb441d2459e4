use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::context::Context;
use crate::fsops;

pub const KIND_SPACE_USED: &str = "space-used";
pub const KIND_ENV_FAILURE: &str = "env-failure";
/// Recorded once per request that folded more than one descriptor file.
pub const KIND_ENV_MERGE: &str = "env-merge";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
pub const DEFAULT_STATS_WINDOW_DAYS: u64 = 12;

/// How a materialize request was satisfied. Counters are derived from this
/// tag, never from exception paths, so statistics stay accurate under
/// concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Hit,
    Dirty,
    Miss,
    Failure,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Dirty => "dirty",
            Self::Miss => "miss",
            Self::Failure => "failure",
        }
    }
}

/// One line of the append-only stats journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub timestamp: u64,
    pub kind: String,
    pub blueprint: String,
    pub space: String,
    pub controller: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
}

/// Append-only newline-delimited-JSON event log. Writers only append;
/// readers tolerate a torn final line.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            path: ctx.journal_file(),
        }
    }

    /// Append one event; writers hold no lock beyond the append itself.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal file cannot be opened or written.
    pub fn append(&self, event: &JournalEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fsops::ensure_dir(parent)?;
        }
        let mut line = serde_json::to_string(event).context("failed to encode journal event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to journal {}", self.path.display()))?;
        Ok(())
    }

    /// Read every decodable event; a torn final line is skipped, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error only when the journal file itself is unreadable.
    pub fn read_all(&self) -> Result<Vec<JournalEvent>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read journal {}", self.path.display()))?;
        let mut events = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => trace!(%err, "skipping unparsable journal line"),
            }
        }
        Ok(events)
    }
}

/// Aggregated counts over a trailing day window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub window_days: u64,
    pub requests: usize,
    pub merges: usize,
    pub hits: usize,
    pub dirty: usize,
    pub misses: usize,
    pub failures: usize,
}

#[must_use]
pub fn aggregate(events: &[JournalEvent], window_days: u64) -> StatsSummary {
    let cutoff = crate::timestamp_secs().saturating_sub(window_days * SECONDS_PER_DAY);
    let mut summary = StatsSummary {
        window_days,
        ..StatsSummary::default()
    };
    for event in events {
        if event.timestamp < cutoff {
            continue;
        }
        // Merge markers annotate a request that is already counted by its
        // space-used or failure event.
        if event.kind == KIND_ENV_MERGE {
            summary.merges += 1;
            continue;
        }
        summary.requests += 1;
        match event.outcome {
            Outcome::Hit => summary.hits += 1,
            Outcome::Dirty => summary.dirty += 1,
            Outcome::Miss => summary.misses += 1,
            Outcome::Failure => summary.failures += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: Outcome, timestamp: u64) -> JournalEvent {
        JournalEvent {
            timestamp,
            kind: KIND_SPACE_USED.to_string(),
            blueprint: "0123456789abcdef".to_string(),
            space: "user".to_string(),
            controller: "test".to_string(),
            duration_ms: 42,
            outcome,
        }
    }

    #[test]
    fn append_and_read_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new(temp.path(), "test", "test");
        let journal = Journal::new(&ctx);

        let now = crate::timestamp_secs();
        journal.append(&event(Outcome::Miss, now)).expect("append miss");
        journal.append(&event(Outcome::Hit, now)).expect("append hit");

        let events = journal.read_all().expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, Outcome::Miss);
        assert_eq!(events[1].outcome, Outcome::Hit);
    }

    #[test]
    fn torn_final_line_is_tolerated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new(temp.path(), "test", "test");
        let journal = Journal::new(&ctx);

        let now = crate::timestamp_secs();
        journal.append(&event(Outcome::Hit, now)).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(ctx.journal_file())
            .expect("open");
        file.write_all(b"{\"timestamp\": 12, \"kind\": \"spa").expect("torn write");

        let events = journal.read_all().expect("read");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn aggregate_honors_the_window() {
        let now = crate::timestamp_secs();
        let events = vec![
            event(Outcome::Hit, now),
            event(Outcome::Dirty, now.saturating_sub(SECONDS_PER_DAY)),
            event(Outcome::Failure, now.saturating_sub(40 * SECONDS_PER_DAY)),
        ];
        let summary = aggregate(&events, DEFAULT_STATS_WINDOW_DAYS);
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.dirty, 1);
        assert_eq!(summary.failures, 0);
    }

    #[test]
    fn merge_markers_count_separately_from_requests() {
        let now = crate::timestamp_secs();
        let mut merge = event(Outcome::Miss, now);
        merge.kind = KIND_ENV_MERGE.to_string();
        let events = vec![event(Outcome::Miss, now), merge];

        let summary = aggregate(&events, DEFAULT_STATS_WINDOW_DAYS);
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.merges, 1);
        assert_eq!(summary.misses, 1);
    }
}
