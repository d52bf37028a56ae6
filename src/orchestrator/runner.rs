//! Batch runner
//!
//! Files transfer concurrently through a bounded pool; chunks within a file
//! go strictly in order. A chunk is retried up to the session's retry budget
//! before its file is given up on. Sibling files carry on regardless, and
//! files that completed are never rolled back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use super::phase::{PhaseTracker, UploadPhase};
use crate::cancel::CancellationSignal;
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::error::{Result, UploadError};
use crate::hashing::Checksum;
use crate::manifest::{
    DeviceClass, FileManifestEntry, ManifestBuilder, NetworkClass, PendingFile, UploadManifest,
};
use crate::progress::{ProgressAggregator, ProgressReporter, UploadEvent};
use crate::retry::RetryPolicy;
use crate::session::{NegotiatedSession, SessionNegotiator};
use crate::traits::{ChunkDestination, UploadAuthority};
use crate::transfer::{ChunkedTransferEngine, FileTransferRecord};
use crate::verification::{UploadVerificationResult, VerificationClient};

// ============================================================================
// Request / Outcome
// ============================================================================

/// One batch to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub upload_id: String,
    pub principal_id: String,
    pub files: Vec<PendingFile>,
    pub device_class: DeviceClass,
    pub network_class: NetworkClass,
}

/// A file that did not make it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub file_id: String,

    /// Chunk that exhausted its attempts; absent for verification failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,

    pub attempts: u32,

    pub error: String,
}

/// Why a batch failed
#[derive(Debug, thiserror::Error)]
#[error("Upload failed while {phase}: {error}")]
pub struct UploadFailure {
    pub phase: UploadPhase,
    #[source]
    pub error: UploadError,
    pub failed_files: Vec<FileFailure>,
}

impl UploadFailure {
    fn new(phase: UploadPhase, error: UploadError) -> Self {
        Self {
            phase,
            error,
            failed_files: Vec::new(),
        }
    }
}

/// Terminal state of a batch
#[derive(Debug)]
pub enum UploadOutcome {
    Done(UploadVerificationResult),
    Failed(UploadFailure),
    Cancelled { phase: UploadPhase },
}

impl UploadOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn phase(&self) -> UploadPhase {
        match self {
            Self::Done(_) => UploadPhase::Done,
            Self::Failed(_) => UploadPhase::Failed,
            Self::Cancelled { .. } => UploadPhase::Cancelled,
        }
    }
}

/// How one file's transfer pass ended
enum FileStatus {
    Complete,
    Failed(FileFailure),
    Expired,
    Cancelled,
}

struct FileOutcome {
    record: FileTransferRecord,
    status: FileStatus,
}

impl FileOutcome {
    fn new(record: FileTransferRecord, status: FileStatus) -> Self {
        Self { record, status }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs batches end to end
#[derive(Clone)]
pub struct UploadOrchestrator {
    builder: ManifestBuilder,
    authority: Arc<dyn UploadAuthority>,
    destination: Arc<dyn ChunkDestination>,
    clock: Arc<dyn Clock>,
    negotiation_attempts: u32,
    renegotiation_limit: u32,
    retry: RetryPolicy,
    max_concurrent_files: usize,
}

impl UploadOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        authority: Arc<dyn UploadAuthority>,
        destination: Arc<dyn ChunkDestination>,
    ) -> Self {
        Self {
            builder: ManifestBuilder::new(config.chunk_policy, config.client_version.clone()),
            authority,
            destination,
            clock: Arc::new(SystemClock),
            negotiation_attempts: config.negotiation_attempts,
            renegotiation_limit: config.renegotiation_limit,
            retry: config.retry,
            max_concurrent_files: config.max_concurrent_files.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.builder = self.builder.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Run one batch to a terminal outcome
    ///
    /// `reporter` receives progress events and exactly one terminal event.
    pub async fn run(
        &self,
        request: UploadRequest,
        reporter: ProgressReporter,
        cancel: CancellationSignal,
    ) -> UploadOutcome {
        tracing::info!(
            upload_id = %request.upload_id,
            principal_id = %request.principal_id,
            files = request.files.len(),
            network = ?request.network_class,
            "Upload started"
        );

        let mut tracker = PhaseTracker::new(request.upload_id.clone(), reporter.clone());

        match self.drive(&request, &mut tracker, &reporter, &cancel).await {
            Ok(result) => {
                tracker.advance(UploadPhase::Done);
                reporter.finish(UploadEvent::Completed {
                    result: result.clone(),
                });
                UploadOutcome::Done(result)
            }
            Err(failure) if matches!(failure.error, UploadError::Cancelled) => {
                let phase = failure.phase;
                tracker.advance(UploadPhase::Cancelled);
                tracing::info!(
                    upload_id = %request.upload_id,
                    phase = %phase,
                    "Upload cancelled"
                );
                reporter.finish(UploadEvent::Cancelled { phase });
                UploadOutcome::Cancelled { phase }
            }
            Err(failure) => {
                tracker.advance(UploadPhase::Failed);
                tracing::error!(
                    upload_id = %request.upload_id,
                    phase = %failure.phase,
                    failed_files = failure.failed_files.len(),
                    error = %failure.error,
                    "Upload failed"
                );
                reporter.finish(UploadEvent::Failed {
                    phase: failure.phase,
                    reason: failure.error.to_string(),
                    failed_files: failure.failed_files.clone(),
                });
                UploadOutcome::Failed(failure)
            }
        }
    }

    async fn drive(
        &self,
        request: &UploadRequest,
        tracker: &mut PhaseTracker,
        reporter: &ProgressReporter,
        cancel: &CancellationSignal,
    ) -> std::result::Result<UploadVerificationResult, UploadFailure> {
        // Building
        let manifest = cancellable(
            cancel,
            self.builder.build(
                &request.upload_id,
                &request.principal_id,
                &request.files,
                request.device_class,
                request.network_class,
            ),
        )
        .await
        .map_err(|e| UploadFailure::new(UploadPhase::Building, e))?;

        reporter.progress(
            UploadPhase::Building,
            100.0,
            Some(format!(
                "{} files, {} chunks",
                manifest.file_count,
                manifest.total_chunks()
            )),
        );

        // Negotiating
        tracker.advance(UploadPhase::Negotiating);
        let negotiator = SessionNegotiator::new(
            self.authority.clone(),
            self.clock.clone(),
            self.negotiation_attempts,
            self.retry,
        );
        let mut session = cancellable(cancel, negotiator.negotiate(&manifest))
            .await
            .map_err(|e| UploadFailure::new(UploadPhase::Negotiating, e))?;

        // Transferring
        tracker.advance(UploadPhase::Transferring);
        let mut renegotiations = 0;
        let failed_files = self
            .transfer_all(
                request,
                &manifest,
                &mut session,
                &negotiator,
                &mut renegotiations,
                tracker,
                reporter,
                cancel,
            )
            .await?;

        if let Some(first) = failed_files.first() {
            let error = UploadError::ChunkTransfer {
                file_id: first.file_id.clone(),
                chunk_index: first.chunk_index.unwrap_or_default(),
                reason: first.error.clone(),
            };
            return Err(UploadFailure {
                phase: UploadPhase::Transferring,
                error,
                failed_files,
            });
        }

        // Verifying
        let verifier = VerificationClient::new(self.authority.clone(), self.clock.clone());
        loop {
            tracker.advance(UploadPhase::Verifying);
            let verification =
                verifier.verify(&request.upload_id, &manifest, &session, |done, total| {
                    reporter.progress(
                        UploadPhase::Verifying,
                        done as f64 / total as f64 * 100.0,
                        None,
                    )
                });

            match cancellable(cancel, verification).await {
                Err(e) if e.requires_renegotiation() => {
                    // Every chunk is already held by the authority; only the
                    // session needs replacing
                    session = self
                        .renegotiate(
                            &manifest,
                            &session,
                            &negotiator,
                            &mut renegotiations,
                            UploadPhase::Verifying,
                            &[],
                            tracker,
                            cancel,
                        )
                        .await?;
                }
                result => return result.map_err(verification_failure),
            }
        }
    }

    /// Replace a lapsed session, within the batch's re-negotiation budget
    ///
    /// `phase` and `failed_files` describe the failure reported when the
    /// budget is spent.
    #[allow(clippy::too_many_arguments)]
    async fn renegotiate(
        &self,
        manifest: &UploadManifest,
        expired: &NegotiatedSession,
        negotiator: &SessionNegotiator,
        used: &mut u32,
        phase: UploadPhase,
        failed_files: &[FileFailure],
        tracker: &mut PhaseTracker,
        cancel: &CancellationSignal,
    ) -> std::result::Result<NegotiatedSession, UploadFailure> {
        if *used >= self.renegotiation_limit {
            return Err(UploadFailure {
                phase,
                error: UploadError::SessionExpired(expired.session_id().to_string()),
                failed_files: failed_files.to_vec(),
            });
        }
        *used += 1;

        tracing::warn!(
            upload_id = %manifest.upload_id,
            session_id = %expired.session_id(),
            phase = %phase,
            attempt = *used,
            limit = self.renegotiation_limit,
            "Session expired, re-negotiating"
        );

        tracker.advance(UploadPhase::Negotiating);
        cancellable(cancel, negotiator.negotiate(manifest))
            .await
            .map_err(|error| UploadFailure {
                phase: UploadPhase::Negotiating,
                error,
                failed_files: failed_files.to_vec(),
            })
    }

    /// Transfer every file, re-negotiating when the session expires
    ///
    /// Returns the files that exhausted their retries.
    #[allow(clippy::too_many_arguments)]
    async fn transfer_all(
        &self,
        request: &UploadRequest,
        manifest: &UploadManifest,
        session: &mut NegotiatedSession,
        negotiator: &SessionNegotiator,
        renegotiations: &mut u32,
        tracker: &mut PhaseTracker,
        reporter: &ProgressReporter,
        cancel: &CancellationSignal,
    ) -> std::result::Result<Vec<FileFailure>, UploadFailure> {
        let engine =
            ChunkedTransferEngine::new(self.destination.clone(), self.clock.clone(), cancel.clone());
        let aggregator = ProgressAggregator::new(manifest.file_count);

        let mut open: HashMap<String, FileTransferRecord> = manifest
            .files
            .iter()
            .map(|e| (e.file_id.clone(), FileTransferRecord::new(e.file_id.clone())))
            .collect();
        let mut failures: Vec<FileFailure> = Vec::new();

        loop {
            // Entries are in input order, so they pair up with the request files
            let pending: Vec<_> = request
                .files
                .iter()
                .zip(&manifest.files)
                .filter_map(|(file, entry)| {
                    open.remove(&entry.file_id).map(|record| (file, entry, record))
                })
                .collect();

            let current: &NegotiatedSession = &*session;
            let outcomes: Vec<FileOutcome> = stream::iter(pending)
                .map(|(file, entry, record)| {
                    self.transfer_one(
                        &engine,
                        file,
                        entry,
                        current,
                        record,
                        &aggregator,
                        reporter,
                        cancel,
                    )
                })
                .buffer_unordered(self.max_concurrent_files)
                .collect()
                .await;

            let mut expired = false;
            let mut cancelled = false;
            for outcome in outcomes {
                match outcome.status {
                    FileStatus::Complete => {}
                    FileStatus::Failed(failure) => failures.push(failure),
                    FileStatus::Expired => {
                        expired = true;
                        open.insert(outcome.record.file_id.clone(), outcome.record);
                    }
                    FileStatus::Cancelled => {
                        cancelled = true;
                        open.insert(outcome.record.file_id.clone(), outcome.record);
                    }
                }
            }

            // Report failures in manifest order
            failures.sort_by_key(|f| {
                manifest
                    .files
                    .iter()
                    .position(|e| e.file_id == f.file_id)
                    .unwrap_or(usize::MAX)
            });

            if cancelled || cancel.is_cancelled() {
                return Err(UploadFailure {
                    phase: UploadPhase::Transferring,
                    error: UploadError::Cancelled,
                    failed_files: failures,
                });
            }

            if !expired {
                return Ok(failures);
            }

            tracing::debug!(
                upload_id = %manifest.upload_id,
                remaining_files = open.len(),
                "Transfer pass ended on an expired session"
            );
            let renewed = self
                .renegotiate(
                    manifest,
                    session,
                    negotiator,
                    renegotiations,
                    UploadPhase::Transferring,
                    &failures,
                    tracker,
                    cancel,
                )
                .await?;

            // Chunk indices only carry over under the same chunk size
            if renewed.chunk_size() != session.chunk_size() {
                tracing::warn!(
                    upload_id = %manifest.upload_id,
                    old_chunk_size = session.chunk_size(),
                    new_chunk_size = renewed.chunk_size(),
                    "Chunk size changed, restarting open files"
                );
                for record in open.values_mut() {
                    *record = FileTransferRecord::new(record.file_id.clone());
                }
            }

            *session = renewed;
            tracker.advance(UploadPhase::Transferring);
        }
    }

    /// Drive one file until it completes, exhausts a chunk, or is interrupted
    #[allow(clippy::too_many_arguments)]
    async fn transfer_one(
        &self,
        engine: &ChunkedTransferEngine,
        file: &PendingFile,
        entry: &FileManifestEntry,
        session: &NegotiatedSession,
        mut record: FileTransferRecord,
        aggregator: &ProgressAggregator,
        reporter: &ProgressReporter,
        cancel: &CancellationSignal,
    ) -> FileOutcome {
        let plan = session.plan_for(entry);
        let max_attempts = session.allowed_retries().max(1);

        loop {
            if record.is_complete(&plan) {
                tracing::info!(
                    file_id = %entry.file_id,
                    chunks = plan.chunk_count,
                    attempts = record.attempts.len(),
                    "File transferred"
                );
                return FileOutcome::new(record, FileStatus::Complete);
            }

            let start = record.next_index();
            let pass = engine
                .transfer_file(file, entry, session, start, |done, total| {
                    let overall = aggregator.record(&entry.file_id, done, total);
                    reporter.progress(
                        UploadPhase::Transferring,
                        overall,
                        Some(entry.file_id.clone()),
                    );
                })
                .await;

            // Keep what landed before looking at why the pass stopped
            for attempt in pass.records {
                record.push(attempt);
            }

            match pass.interrupted {
                None => {}
                Some(UploadError::Cancelled) => {
                    return FileOutcome::new(record, FileStatus::Cancelled);
                }
                Some(e) if e.requires_renegotiation() => {
                    tracing::debug!(
                        file_id = %entry.file_id,
                        next_index = record.next_index(),
                        "Session lapsed mid-file"
                    );
                    return FileOutcome::new(record, FileStatus::Expired);
                }
                Some(e) => {
                    let index = record.next_index();
                    let failure = FileFailure {
                        file_id: entry.file_id.clone(),
                        chunk_index: Some(index),
                        attempts: record.attempts_for(index) + 1,
                        error: e.to_string(),
                    };
                    return FileOutcome::new(record, FileStatus::Failed(failure));
                }
            }

            let (index, error) = match record.last_failure() {
                Some(failed) => (
                    failed.chunk_index,
                    failed.error.clone().unwrap_or_default(),
                ),
                None => continue,
            };

            let made = record.attempts_for(index);
            if made >= max_attempts {
                tracing::error!(
                    file_id = %entry.file_id,
                    chunk_index = index,
                    attempts = made,
                    error = %error,
                    "Chunk retries exhausted"
                );
                let failure = FileFailure {
                    file_id: entry.file_id.clone(),
                    chunk_index: Some(index),
                    attempts: made,
                    error,
                };
                return FileOutcome::new(record, FileStatus::Failed(failure));
            }

            let delay = self.retry.delay_for(made);
            tracing::warn!(
                file_id = %entry.file_id,
                chunk_index = index,
                attempt = made,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Chunk failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return FileOutcome::new(record, FileStatus::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Race `work` against cancellation
async fn cancellable<T, F>(cancel: &CancellationSignal, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = work => result,
    }
}

fn verification_failure(error: UploadError) -> UploadFailure {
    let failed_files = match &error {
        UploadError::VerificationMismatch { result } => result
            .failed_files()
            .map(|d| FileFailure {
                file_id: d.file_id.clone(),
                chunk_index: None,
                attempts: 0,
                error: format!(
                    "expected {} bytes ({}), authority holds {} bytes ({})",
                    d.expected_size,
                    d.expected_checksum,
                    d.uploaded_size,
                    d.uploaded_checksum
                        .as_ref()
                        .map(Checksum::as_str)
                        .unwrap_or("none")
                ),
            })
            .collect(),
        _ => Vec::new(),
    };

    UploadFailure {
        phase: UploadPhase::Verifying,
        error,
        failed_files,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthoritySettings, ReferenceAuthority};
    use crate::cancel::cancellation;
    use crate::clock::ManualClock;
    use crate::hashing::digest;
    use crate::manifest::ChunkSizePolicy;
    use crate::progress::progress_channel;
    use crate::session::{SessionAcknowledgment, TransferTarget};
    use crate::traits::{ChunkPayload, ReceivedFile};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const MIB: usize = 1024 * 1024;

    type PutHook = Arc<dyn Fn(&str, usize) + Send + Sync>;

    /// Reference authority with fault injection and call accounting
    struct Harness {
        inner: ReferenceAuthority,
        opens: Mutex<u32>,
        puts: Mutex<Vec<(String, usize)>>,
        /// (file, chunk, remaining failures)
        fail_chunk: Mutex<Option<(String, usize, u32)>>,
        /// File whose reported checksum is corrupted
        tamper: Option<String>,
        after_put: Option<PutHook>,
    }

    impl Harness {
        fn new(inner: ReferenceAuthority) -> Self {
            Self {
                inner,
                opens: Mutex::new(0),
                puts: Mutex::new(Vec::new()),
                fail_chunk: Mutex::new(None),
                tamper: None,
                after_put: None,
            }
        }

        fn failing(self, file_id: &str, chunk_index: usize, times: u32) -> Self {
            *self.fail_chunk.lock() = Some((file_id.to_string(), chunk_index, times));
            self
        }

        fn puts_for(&self, file_id: &str) -> Vec<usize> {
            self.puts
                .lock()
                .iter()
                .filter(|(f, _)| f == file_id)
                .map(|(_, i)| *i)
                .collect()
        }

        fn opens(&self) -> u32 {
            *self.opens.lock()
        }
    }

    #[async_trait]
    impl UploadAuthority for Harness {
        async fn open_session(&self, manifest: &UploadManifest) -> Result<SessionAcknowledgment> {
            *self.opens.lock() += 1;
            self.inner.open_session(manifest).await
        }

        async fn received_file(&self, upload_id: &str, file_id: &str) -> Result<Option<ReceivedFile>> {
            let mut received = self.inner.received_file(upload_id, file_id).await?;
            if self.tamper.as_deref() == Some(file_id) {
                if let Some(r) = received.as_mut() {
                    r.checksum = Some(digest(b"tampered"));
                }
            }
            Ok(received)
        }
    }

    #[async_trait]
    impl ChunkDestination for Harness {
        async fn put_chunk(&self, target: &TransferTarget, chunk: ChunkPayload<'_>) -> Result<()> {
            self.puts
                .lock()
                .push((chunk.file_id.to_string(), chunk.chunk_index));

            let inject = {
                let mut fail = self.fail_chunk.lock();
                match fail.as_mut() {
                    Some((file_id, index, remaining))
                        if file_id.as_str() == chunk.file_id
                            && *index == chunk.chunk_index
                            && *remaining > 0 =>
                    {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if inject {
                return Err(UploadError::ChunkTransfer {
                    file_id: chunk.file_id.to_string(),
                    chunk_index: chunk.chunk_index,
                    reason: "connection reset by peer".into(),
                });
            }

            self.inner.put_chunk(target, chunk).await?;

            if let Some(hook) = &self.after_put {
                hook(chunk.file_id, chunk.chunk_index);
            }
            Ok(())
        }
    }

    fn small_chunks() -> PipelineConfig {
        PipelineConfig {
            chunk_policy: ChunkSizePolicy {
                fast: 4,
                constrained: 4,
            },
            retry: RetryPolicy::immediate(),
            ..PipelineConfig::default()
        }
    }

    fn request(files: Vec<PendingFile>) -> UploadRequest {
        UploadRequest {
            upload_id: "u-1".into(),
            principal_id: "agent-7".into(),
            files,
            device_class: DeviceClass::Camera,
            network_class: NetworkClass::Wifi,
        }
    }

    /// Two 10-byte captures: three 4-byte chunks each
    fn two_photos() -> Vec<PendingFile> {
        vec![
            PendingFile::from_bytes("a", "a.jpg", "jpg", b"0123456789".to_vec()),
            PendingFile::from_bytes("b", "b.jpg", "jpg", b"abcdefghij".to_vec()),
        ]
    }

    fn orchestrator(config: &PipelineConfig, harness: &Arc<Harness>) -> UploadOrchestrator {
        UploadOrchestrator::new(config, harness.clone(), harness.clone())
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn assert_single_terminal(events: &[UploadEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().map(UploadEvent::is_terminal).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_batch_completes_and_verifies() {
        let harness = Arc::new(Harness::new(ReferenceAuthority::new(
            AuthoritySettings::default(),
        )));
        let files = vec![
            PendingFile::from_bytes("a", "a.jpg", "jpg", vec![0x11u8; 12 * MIB]),
            PendingFile::from_bytes("b", "b.mp4", "mp4", vec![0x22u8; 3 * MIB]),
        ];
        let config = PipelineConfig {
            retry: RetryPolicy::immediate(),
            ..PipelineConfig::default()
        };
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&config, &harness)
            .run(request(files), reporter, CancellationSignal::never())
            .await;

        let result = match outcome {
            UploadOutcome::Done(result) => result,
            other => panic!("expected done, got {:?}", other),
        };
        assert!(result.success);
        assert!(result.checksum_matches);
        assert_eq!(result.files_verified, 2);
        assert_eq!(harness.puts_for("a"), vec![0, 1, 2]);
        assert_eq!(harness.puts_for("b"), vec![0]);

        let events = drain(rx).await;
        assert_single_terminal(&events);
        assert!(matches!(events.last(), Some(UploadEvent::Completed { .. })));

        let transfer_progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) if p.phase == UploadPhase::Transferring => {
                    Some(p.percentage)
                }
                _ => None,
            })
            .collect();
        assert!(transfer_progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(transfer_progress.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_recovers() {
        let harness = Arc::new(
            Harness::new(ReferenceAuthority::new(AuthoritySettings::default())).failing("a", 1, 2),
        );

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(
                request(two_photos()),
                ProgressReporter::disabled(),
                CancellationSignal::never(),
            )
            .await;

        assert!(outcome.is_done());
        assert_eq!(harness.puts_for("a"), vec![0, 1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn test_chunk_retries_are_bounded() {
        let harness = Arc::new(
            Harness::new(ReferenceAuthority::new(AuthoritySettings::default()))
                .failing("b", 1, u32::MAX),
        );
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(request(two_photos()), reporter, CancellationSignal::never())
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Transferring);
        assert_eq!(failure.failed_files.len(), 1);
        assert_eq!(failure.failed_files[0].file_id, "b");
        assert_eq!(failure.failed_files[0].chunk_index, Some(1));
        assert_eq!(failure.failed_files[0].attempts, 3);

        // Exactly allowed_retries attempts at the failing chunk, nothing after it
        assert_eq!(harness.puts_for("b"), vec![0, 1, 1, 1]);

        // The sibling finished and stays uploaded
        assert_eq!(harness.puts_for("a"), vec![0, 1, 2]);
        let a = harness.inner.file_status("u-1", "a").await.unwrap();
        assert_eq!(a.checksum, Some(digest(b"0123456789")));

        let events = drain(rx).await;
        assert_single_terminal(&events);
        assert!(matches!(
            events.last(),
            Some(UploadEvent::Failed { failed_files, .. }) if failed_files.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_verification_mismatch_names_file() {
        let mut harness = Harness::new(ReferenceAuthority::new(AuthoritySettings::default()));
        harness.tamper = Some("b".into());
        let harness = Arc::new(harness);

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(
                request(two_photos()),
                ProgressReporter::disabled(),
                CancellationSignal::never(),
            )
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Verifying);
        assert_eq!(failure.failed_files.len(), 1);
        assert_eq!(failure.failed_files[0].file_id, "b");
        assert_eq!(failure.failed_files[0].chunk_index, None);

        let UploadError::VerificationMismatch { result } = &failure.error else {
            panic!("expected verification mismatch");
        };
        assert_eq!(result.files_verified, 1);
        assert!(!result.checksum_matches);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_chunks() {
        let (handle, signal) = cancellation();
        let mut harness = Harness::new(ReferenceAuthority::new(AuthoritySettings::default()));
        harness.after_put = Some(Arc::new(move |_: &str, _: usize| handle.cancel()));
        let harness = Arc::new(harness);
        let config = PipelineConfig {
            max_concurrent_files: 1,
            ..small_chunks()
        };
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&config, &harness)
            .run(request(two_photos()), reporter, signal)
            .await;

        assert!(matches!(
            outcome,
            UploadOutcome::Cancelled {
                phase: UploadPhase::Transferring
            }
        ));
        assert_eq!(harness.puts.lock().len(), 1);

        let events = drain(rx).await;
        assert_single_terminal(&events);
        assert!(matches!(events.last(), Some(UploadEvent::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (handle, signal) = cancellation();
        handle.cancel();
        let harness = Arc::new(Harness::new(ReferenceAuthority::new(
            AuthoritySettings::default(),
        )));

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(request(two_photos()), ProgressReporter::disabled(), signal)
            .await;

        assert!(matches!(
            outcome,
            UploadOutcome::Cancelled {
                phase: UploadPhase::Building
            }
        ));
        assert_eq!(harness.opens(), 0);
    }

    /// The session lapses right after chunk `lapse_after` of file `a` lands
    fn expiring_harness_after(clock: &Arc<ManualClock>, lapse_after: usize) -> Harness {
        let settings = AuthoritySettings {
            session_ttl: Duration::minutes(10),
            ..AuthoritySettings::default()
        };
        let mut harness = Harness::new(ReferenceAuthority::with_clock(settings, clock.clone()));

        let hook_clock = clock.clone();
        harness.after_put = Some(Arc::new(move |file_id: &str, index: usize| {
            if file_id == "a" && index == lapse_after {
                hook_clock.advance(Duration::minutes(11));
            }
        }));
        harness
    }

    fn expiring_harness(clock: &Arc<ManualClock>) -> Harness {
        expiring_harness_after(clock, 0)
    }

    fn one_photo() -> Vec<PendingFile> {
        vec![PendingFile::from_bytes(
            "a",
            "a.jpg",
            "jpg",
            b"0123456789".to_vec(),
        )]
    }

    #[tokio::test]
    async fn test_session_expiry_triggers_renegotiation() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let harness = Arc::new(expiring_harness(&clock));
        let config = PipelineConfig {
            max_concurrent_files: 1,
            ..small_chunks()
        };
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&config, &harness)
            .with_clock(clock.clone())
            .run(request(one_photo()), reporter, CancellationSignal::never())
            .await;

        assert!(outcome.is_done(), "{:?}", outcome);
        assert_eq!(harness.opens(), 2);
        // Resumed at the next unsent chunk
        assert_eq!(harness.puts_for("a"), vec![0, 1, 2]);

        let negotiating = drain(rx)
            .await
            .iter()
            .filter(|e| {
                matches!(e, UploadEvent::Progress(p)
                    if p.phase == UploadPhase::Negotiating && p.percentage == 0.0)
            })
            .count();
        assert_eq!(negotiating, 2);
    }

    #[tokio::test]
    async fn test_every_lapse_keeps_landed_chunks() {
        // A session lapses after each chunk; the file still finishes
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = AuthoritySettings {
            session_ttl: Duration::minutes(10),
            ..AuthoritySettings::default()
        };
        let mut harness = Harness::new(ReferenceAuthority::with_clock(settings, clock.clone()));
        let hook_clock = clock.clone();
        harness.after_put = Some(Arc::new(move |_: &str, _: usize| {
            hook_clock.advance(Duration::minutes(11));
        }));
        let harness = Arc::new(harness);
        let config = PipelineConfig {
            max_concurrent_files: 1,
            renegotiation_limit: 3,
            ..small_chunks()
        };

        let outcome = orchestrator(&config, &harness)
            .with_clock(clock.clone())
            .run(
                request(one_photo()),
                ProgressReporter::disabled(),
                CancellationSignal::never(),
            )
            .await;

        assert!(outcome.is_done(), "{:?}", outcome);
        // No chunk is sent twice across sessions
        assert_eq!(harness.puts_for("a"), vec![0, 1, 2]);
        assert_eq!(harness.opens(), 4);
    }

    #[tokio::test]
    async fn test_expiry_before_verification_renegotiates() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let harness = Arc::new(expiring_harness_after(&clock, 2));
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&small_chunks(), &harness)
            .with_clock(clock.clone())
            .run(request(one_photo()), reporter, CancellationSignal::never())
            .await;

        let result = match outcome {
            UploadOutcome::Done(result) => result,
            other => panic!("expected done, got {:?}", other),
        };
        assert!(result.success);
        assert_eq!(harness.opens(), 2);
        // Nothing re-sent: the authority kept the chunks across sessions
        assert_eq!(harness.puts_for("a"), vec![0, 1, 2]);

        let phases: Vec<UploadPhase> = drain(rx)
            .await
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) if p.percentage == 0.0 => Some(p.phase),
                _ => None,
            })
            .collect();
        let tail: Vec<UploadPhase> = phases.iter().rev().take(3).rev().copied().collect();
        assert_eq!(
            tail,
            vec![
                UploadPhase::Verifying,
                UploadPhase::Negotiating,
                UploadPhase::Verifying
            ]
        );
    }

    #[tokio::test]
    async fn test_expiry_before_verification_respects_limit() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let harness = Arc::new(expiring_harness_after(&clock, 2));
        let config = PipelineConfig {
            renegotiation_limit: 0,
            ..small_chunks()
        };

        let outcome = orchestrator(&config, &harness)
            .with_clock(clock.clone())
            .run(
                request(one_photo()),
                ProgressReporter::disabled(),
                CancellationSignal::never(),
            )
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Verifying);
        assert!(matches!(failure.error, UploadError::SessionExpired(_)));
        assert_eq!(harness.opens(), 1);
    }

    #[tokio::test]
    async fn test_renegotiation_limit() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let harness = Arc::new(expiring_harness(&clock));
        let config = PipelineConfig {
            renegotiation_limit: 0,
            ..small_chunks()
        };

        let outcome = orchestrator(&config, &harness)
            .with_clock(clock.clone())
            .run(
                request(two_photos()),
                ProgressReporter::disabled(),
                CancellationSignal::never(),
            )
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Transferring);
        assert!(matches!(failure.error, UploadError::SessionExpired(_)));
        assert_eq!(harness.opens(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_fails_building() {
        let harness = Arc::new(Harness::new(ReferenceAuthority::new(
            AuthoritySettings::default(),
        )));
        let (reporter, rx) = progress_channel();

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(request(vec![]), reporter, CancellationSignal::never())
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Building);
        assert!(matches!(failure.error, UploadError::EmptyInput));
        assert_eq!(harness.opens(), 0);
        assert_single_terminal(&drain(rx).await);
    }

    #[tokio::test]
    async fn test_rejection_fails_negotiation() {
        let harness = Arc::new(Harness::new(ReferenceAuthority::new(
            AuthoritySettings::default(),
        )));
        let files = vec![PendingFile::from_bytes("d", "d.pdf", "pdf", b"%PDF-1.7".to_vec())];

        let outcome = orchestrator(&small_chunks(), &harness)
            .run(request(files), ProgressReporter::disabled(), CancellationSignal::never())
            .await;

        let failure = match outcome {
            UploadOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failure.phase, UploadPhase::Negotiating);
        assert!(matches!(failure.error, UploadError::SessionRejected(_)));
        assert_eq!(harness.opens(), 1);
        assert!(harness.puts.lock().is_empty());
    }
}
