use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One discovered image, identified by its canonical absolute path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkItem {
    pub identity: String,
    pub path: PathBuf,
}

impl WorkItem {
    /// `None` when the path is not valid UTF-8 and so has no faithful
    /// string identity.
    pub fn new(path: PathBuf) -> Option<Self> {
        let identity = path.to_str()?.to_string();
        Some(Self { identity, path })
    }
}

/// Raw image bytes handed to a classifier.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

/// What the classifier says about one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleClassification {
    pub primary_style: String,
    pub secondary_style: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    InvalidInput,
    Network,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::InvalidInput => "invalid_input",
            Self::Network => "network",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Succeeded,
    Failed,
}

/// One ledger row: a classification result or a terminal failure marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub primary_style: String,
    pub secondary_style: String,
    pub description: String,
    pub processed_at: DateTime<Utc>,
    pub status: EntryStatus,
    pub failure_kind: Option<FailureKind>,
}

impl LedgerEntry {
    pub fn succeeded(identity: &str, result: StyleClassification, at: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            primary_style: result.primary_style,
            secondary_style: result.secondary_style,
            description: result.description,
            processed_at: at,
            status: EntryStatus::Succeeded,
            failure_kind: None,
        }
    }

    pub fn failed(identity: &str, kind: FailureKind, message: &str, at: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            primary_style: String::new(),
            secondary_style: String::new(),
            description: message.to_string(),
            processed_at: at,
            status: EntryStatus::Failed,
            failure_kind: Some(kind),
        }
    }
}

/// Final state of one work item in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Skipped,
    Succeeded,
    Failed {
        kind: FailureKind,
        message: String,
        recorded: bool,
    },
    /// Not attempted: the run stopped dispatching before reaching it.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub identity: String,
    pub kind: FailureKind,
    pub message: String,
    pub recorded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub failures: Vec<FailureReport>,
}

impl RunReport {
    pub fn push(&mut self, item: &WorkItem, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Deferred => self.deferred += 1,
            ItemOutcome::Failed {
                kind,
                message,
                recorded,
            } => {
                self.failed += 1;
                self.failures.push(FailureReport {
                    identity: item.identity.clone(),
                    kind,
                    message,
                    recorded,
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.skipped + self.succeeded + self.failed + self.deferred
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Skipped: {}  Succeeded: {}  Failed: {}  Deferred: {}",
            self.skipped, self.succeeded, self.failed, self.deferred
        )?;
        for failure in &self.failures {
            let fate = if failure.recorded {
                "recorded"
            } else {
                "retry next run"
            };
            writeln!(
                f,
                "  [{}] {} ({}): {}",
                failure.kind, failure.identity, fate, failure.message
            )?;
        }
        Ok(())
    }
}
