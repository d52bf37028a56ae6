//! Upload Orchestrator
//!
//! Sequences the pipeline phases for one batch and reports progress:
//!
//! ```text
//! Building -> Negotiating -> Transferring -> Verifying -> Done
//!                  ^              |              |
//!                  +--------------+--------------+  (session expired)
//! ```
//!
//! Any non-terminal phase may end in `Failed` or `Cancelled`.

pub mod phase;
pub mod runner;

pub use phase::{PhaseTracker, UploadPhase};
pub use runner::{FileFailure, UploadFailure, UploadOrchestrator, UploadOutcome, UploadRequest};
