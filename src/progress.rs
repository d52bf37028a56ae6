//! Progress reporting
//!
//! Every batch produces zero or more `UploadEvent::Progress` events followed
//! by exactly one terminal event (`Completed`, `Failed` or `Cancelled`).
//!
//! # Thread Safety
//!
//! `ProgressAggregator` is the only mutable state shared between concurrent
//! file workers. Each chunk completion updates it under one lock acquisition,
//! and the overall percentage it reports never decreases.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::orchestrator::{FileFailure, UploadPhase};
use crate::verification::UploadVerificationResult;

/// Progress within a phase
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: UploadPhase,

    /// 0-100
    pub percentage: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Event observed by the caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEvent {
    Progress(ProgressEvent),
    Completed {
        result: UploadVerificationResult,
    },
    Failed {
        phase: UploadPhase,
        reason: String,
        #[serde(rename = "failedFiles")]
        failed_files: Vec<FileFailure>,
    },
    Cancelled {
        phase: UploadPhase,
    },
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Create a reporter and the receiving end of its event stream
pub fn progress_channel() -> (ProgressReporter, mpsc::UnboundedReceiver<UploadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressReporter { tx: Some(tx) }, rx)
}

/// Sending half of the event stream
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl ProgressReporter {
    /// Reporter that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn progress(&self, phase: UploadPhase, percentage: f64, detail: Option<String>) {
        self.send(UploadEvent::Progress(ProgressEvent {
            phase,
            percentage: percentage.clamp(0.0, 100.0),
            detail,
        }));
    }

    /// Emit the terminal event
    pub fn finish(&self, event: UploadEvent) {
        debug_assert!(event.is_terminal());
        self.send(event);
    }

    fn send(&self, event: UploadEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("Progress receiver dropped");
            }
        }
    }
}

/// Overall transfer progress across all files of a batch
///
/// Each file contributes `1 / file_count` of the total, weighted by the
/// fraction of its chunks completed.
#[derive(Debug)]
pub struct ProgressAggregator {
    file_count: usize,
    state: Mutex<AggregateState>,
}

#[derive(Debug, Default)]
struct AggregateState {
    per_file: HashMap<String, f64>,
    overall: f64,
}

impl ProgressAggregator {
    pub fn new(file_count: usize) -> Self {
        Self {
            file_count,
            state: Mutex::new(AggregateState::default()),
        }
    }

    /// Record a chunk completion and return the overall percentage
    pub fn record(&self, file_id: &str, completed_chunks: usize, total_chunks: usize) -> f64 {
        let fraction = if total_chunks == 0 {
            1.0
        } else {
            (completed_chunks as f64 / total_chunks as f64).min(1.0)
        };

        let mut state = self.state.lock();
        let entry = state.per_file.entry(file_id.to_string()).or_insert(0.0);
        *entry = entry.max(fraction);

        let overall = if self.file_count == 0 {
            100.0
        } else {
            state.per_file.values().sum::<f64>() / self.file_count as f64 * 100.0
        };
        state.overall = state.overall.max(overall.min(100.0));
        state.overall
    }

    pub fn overall(&self) -> f64 {
        self.state.lock().overall
    }
}
