//! Upload phases and the transitions between them

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::progress::ProgressReporter;

/// Phase of a batch upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Building,
    Negotiating,
    Transferring,
    Verifying,
    Done,
    Failed,
    Cancelled,
}

impl UploadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// `Transferring -> Negotiating` and `Verifying -> Negotiating` are the
    /// re-negotiation paths after a session expires; the batch then returns
    /// to the phase it left.
    pub fn can_transition_to(self, next: UploadPhase) -> bool {
        use UploadPhase::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (Building, Negotiating)
                | (Negotiating, Transferring)
                | (Transferring, Verifying)
                | (Transferring, Negotiating)
                | (Verifying, Negotiating)
                | (Negotiating, Verifying)
                | (Verifying, Done)
                | (_, Failed)
                | (_, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one batch, with logged and reported transitions
#[derive(Debug)]
pub struct PhaseTracker {
    upload_id: String,
    current: UploadPhase,
    reporter: ProgressReporter,
}

impl PhaseTracker {
    /// Starts in `Building`
    pub fn new(upload_id: impl Into<String>, reporter: ProgressReporter) -> Self {
        let tracker = Self {
            upload_id: upload_id.into(),
            current: UploadPhase::Building,
            reporter,
        };
        tracker.reporter.progress(UploadPhase::Building, 0.0, None);
        tracker
    }

    pub fn current(&self) -> UploadPhase {
        self.current
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn advance(&mut self, next: UploadPhase) -> bool {
        if !self.current.can_transition_to(next) {
            tracing::error!(
                upload_id = %self.upload_id,
                from = %self.current,
                to = %next,
                "Illegal upload phase transition"
            );
            return false;
        }

        tracing::info!(
            upload_id = %self.upload_id,
            from = %self.current,
            to = %next,
            "Upload phase transition"
        );
        self.current = next;

        if !next.is_terminal() {
            self.reporter.progress(next, 0.0, None);
        }
        true
    }
}
