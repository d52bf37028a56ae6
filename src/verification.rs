//! Verification Client
//!
//! Asks the upload authority what it received for every manifest entry and
//! reconciles that against the sizes and digests computed locally.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Result, UploadError};
use crate::hashing::Checksum;
use crate::manifest::{FileManifestEntry, UploadManifest};
use crate::session::NegotiatedSession;
use crate::traits::{ReceivedFile, UploadAuthority};

/// Expected vs uploaded state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVerificationDetail {
    pub file_id: String,
    pub file_name: String,
    pub expected_size: u64,
    pub uploaded_size: u64,
    pub expected_checksum: Checksum,
    pub uploaded_checksum: Option<Checksum>,
    pub verified: bool,
}

impl FileVerificationDetail {
    /// Compare an entry against the authority's record of it
    pub fn reconcile(entry: &FileManifestEntry, received: Option<&ReceivedFile>) -> Self {
        let uploaded_size = received.map(|r| r.size).unwrap_or(0);
        let uploaded_checksum = received.and_then(|r| r.checksum.clone());
        let verified = uploaded_size == entry.size
            && uploaded_checksum.as_ref() == Some(&entry.checksum);

        Self {
            file_id: entry.file_id.clone(),
            file_name: entry.file_name.clone(),
            expected_size: entry.size,
            uploaded_size,
            expected_checksum: entry.checksum.clone(),
            uploaded_checksum,
            verified,
        }
    }
}

/// Final outcome of a batch, as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadVerificationResult {
    pub success: bool,
    pub upload_id: String,
    pub files_verified: usize,
    pub files_total: usize,
    pub checksum_matches: bool,
    pub details: Vec<FileVerificationDetail>,
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl UploadVerificationResult {
    /// Aggregate per-file details
    pub fn from_details(
        upload_id: impl Into<String>,
        details: Vec<FileVerificationDetail>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let files_total = details.len();
        let files_verified = details.iter().filter(|d| d.verified).count();
        let checksum_matches = details.iter().all(|d| d.verified);
        let success = checksum_matches && files_verified == files_total;

        let message = if success {
            format!("All {} files verified", files_total)
        } else {
            let failed: Vec<&str> = details
                .iter()
                .filter(|d| !d.verified)
                .map(|d| d.file_id.as_str())
                .collect();
            format!(
                "{}/{} files verified; mismatched: {}",
                files_verified,
                files_total,
                failed.join(", ")
            )
        };

        Self {
            success,
            upload_id: upload_id.into(),
            files_verified,
            files_total,
            checksum_matches,
            details,
            message,
            completed_at,
        }
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileVerificationDetail> {
        self.details.iter().filter(|d| !d.verified)
    }
}

/// Confirms a batch with the upload authority
#[derive(Clone)]
pub struct VerificationClient {
    authority: Arc<dyn UploadAuthority>,
    clock: Arc<dyn Clock>,
}

impl VerificationClient {
    pub fn new(authority: Arc<dyn UploadAuthority>, clock: Arc<dyn Clock>) -> Self {
        Self { authority, clock }
    }

    /// Verify every manifest entry
    ///
    /// Returns `VerificationMismatch` carrying the full result when any file
    /// fails to verify. `on_progress(checked, total)` runs after each query.
    pub async fn verify<F>(
        &self,
        upload_id: &str,
        manifest: &UploadManifest,
        session: &NegotiatedSession,
        mut on_progress: F,
    ) -> Result<UploadVerificationResult>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = manifest.files.len();
        let mut details = Vec::with_capacity(total);

        for (checked, entry) in manifest.files.iter().enumerate() {
            session.ensure_active(self.clock.now())?;

            let received = self
                .authority
                .received_file(upload_id, &entry.file_id)
                .await?;

            if received.is_none() {
                tracing::warn!(
                    upload_id = %upload_id,
                    file_id = %entry.file_id,
                    "Authority has no record of file"
                );
            }

            let detail = FileVerificationDetail::reconcile(entry, received.as_ref());
            tracing::debug!(
                upload_id = %upload_id,
                file_id = %entry.file_id,
                expected_size = detail.expected_size,
                uploaded_size = detail.uploaded_size,
                verified = detail.verified,
                "File verified"
            );
            details.push(detail);
            on_progress(checked + 1, total);
        }

        let result = UploadVerificationResult::from_details(upload_id, details, self.clock.now());

        if result.success {
            tracing::info!(
                upload_id = %upload_id,
                files = result.files_total,
                "Upload verified"
            );
            Ok(result)
        } else {
            tracing::warn!(
                upload_id = %upload_id,
                files_verified = result.files_verified,
                files_total = result.files_total,
                "Upload verification mismatch"
            );
            Err(UploadError::VerificationMismatch {
                result: Box::new(result),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hashing::digest;
    use crate::manifest::{DeviceClass, ManifestBuilder, NetworkClass, PendingFile};
    use crate::session::{SessionAcknowledgment, TransferTarget};
    use async_trait::async_trait;
    use chrono::Duration;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Authority answering verification queries from a fixed table
    #[derive(Default)]
    struct TableAuthority {
        files: HashMap<String, ReceivedFile>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UploadAuthority for TableAuthority {
        async fn open_session(&self, _: &UploadManifest) -> Result<SessionAcknowledgment> {
            Err(UploadError::Authority("not used".into()))
        }

        async fn received_file(&self, _: &str, file_id: &str) -> Result<Option<ReceivedFile>> {
            self.queries.lock().push(file_id.to_string());
            Ok(self.files.get(file_id).cloned())
        }
    }

    const A: &[u8] = b"front elevation";
    const B: &[u8] = b"kitchen walkthrough";

    async fn setup(clock: Arc<ManualClock>) -> (UploadManifest, NegotiatedSession) {
        let files = vec![
            PendingFile::from_bytes("a", "a.jpg", "jpg", A.to_vec()),
            PendingFile::from_bytes("b", "b.mp4", "mp4", B.to_vec()),
        ];
        let manifest = ManifestBuilder::default()
            .with_clock(clock.clone())
            .build("u-1", "p-1", &files, DeviceClass::Camera, NetworkClass::Wifi)
            .await
            .unwrap();

        let now = clock.now();
        let ack = SessionAcknowledgment {
            success: true,
            session_id: "s-1".into(),
            expires_at: now + Duration::minutes(5),
            destinations: ["a", "b"]
                .into_iter()
                .map(|id| (id.to_string(), TransferTarget::new(format!("https://store/{}", id))))
                .collect(),
            max_chunk_size: 1024,
            allowed_retries: 3,
            message: String::new(),
        };
        let session = NegotiatedSession::from_ack(ack, &manifest, now).unwrap();
        (manifest, session)
    }

    fn received(id: &str, data: &[u8]) -> (String, ReceivedFile) {
        (
            id.to_string(),
            ReceivedFile {
                file_id: id.to_string(),
                size: data.len() as u64,
                checksum: Some(digest(data)),
                chunks_received: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_all_files_verified() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manifest, session) = setup(clock.clone()).await;
        let authority = Arc::new(TableAuthority {
            files: [received("a", A), received("b", B)].into_iter().collect(),
            ..TableAuthority::default()
        });
        let mut progress = Vec::new();

        let result = VerificationClient::new(authority, clock)
            .verify("u-1", &manifest, &session, |done, total| progress.push((done, total)))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.checksum_matches);
        assert_eq!(result.files_verified, 2);
        assert_eq!(result.files_total, 2);
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_on_one_file() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manifest, session) = setup(clock.clone()).await;

        // Same size, different bytes
        let mut corrupted = B.to_vec();
        corrupted[0] ^= 0xff;
        let authority = Arc::new(TableAuthority {
            files: [received("a", A), received("b", &corrupted)]
                .into_iter()
                .collect(),
            ..TableAuthority::default()
        });

        let err = VerificationClient::new(authority, clock)
            .verify("u-1", &manifest, &session, |_, _| {})
            .await
            .unwrap_err();

        let UploadError::VerificationMismatch { result } = err else {
            panic!("expected verification mismatch");
        };
        assert!(!result.success);
        assert!(!result.checksum_matches);
        assert_eq!(result.files_verified, 1);

        let a = &result.details[0];
        let b = &result.details[1];
        assert!(a.verified);
        assert!(!b.verified);
        assert_eq!(b.uploaded_size, b.expected_size);
        assert_ne!(b.uploaded_checksum.as_ref(), Some(&b.expected_checksum));
        assert_eq!(
            result.failed_files().map(|d| d.file_id.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_with_matching_checksum() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manifest, session) = setup(clock.clone()).await;

        // Digest agrees but the authority counted fewer bytes
        let (id, mut short) = received("b", B);
        short.size -= 1;
        let authority = Arc::new(TableAuthority {
            files: [received("a", A), (id, short)].into_iter().collect(),
            ..TableAuthority::default()
        });

        let err = VerificationClient::new(authority, clock)
            .verify("u-1", &manifest, &session, |_, _| {})
            .await
            .unwrap_err();

        let UploadError::VerificationMismatch { result } = err else {
            panic!("expected verification mismatch");
        };
        assert!(!result.success);
        assert_eq!(result.files_verified, 1);

        let b = &result.details[1];
        assert!(!b.verified);
        assert_eq!(b.uploaded_checksum.as_ref(), Some(&b.expected_checksum));
        assert_eq!(b.uploaded_size + 1, b.expected_size);

        let entry = &manifest.files[1];
        let exact = ReceivedFile {
            file_id: "b".into(),
            size: entry.size,
            checksum: Some(entry.checksum.clone()),
            chunks_received: 1,
        };
        assert!(FileVerificationDetail::reconcile(entry, Some(&exact)).verified);
    }

    #[tokio::test]
    async fn test_unknown_file_counts_as_unverified() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manifest, session) = setup(clock.clone()).await;
        let authority = Arc::new(TableAuthority {
            files: [received("a", A)].into_iter().collect(),
            ..TableAuthority::default()
        });

        let err = VerificationClient::new(authority.clone(), clock)
            .verify("u-1", &manifest, &session, |_, _| {})
            .await
            .unwrap_err();

        let UploadError::VerificationMismatch { result } = err else {
            panic!("expected verification mismatch");
        };
        assert_eq!(result.details[1].uploaded_size, 0);
        assert!(result.details[1].uploaded_checksum.is_none());
        assert_eq!(authority.queries.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_queried() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manifest, session) = setup(clock.clone()).await;
        let authority = Arc::new(TableAuthority::default());
        clock.advance(Duration::minutes(6));

        let err = VerificationClient::new(authority.clone(), clock)
            .verify("u-1", &manifest, &session, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::SessionExpired(_)));
        assert!(authority.queries.lock().is_empty());
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = UploadVerificationResult::from_details("u-1", vec![], Utc::now());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["filesVerified"], 0);
        assert_eq!(json["checksumMatches"], true);
        assert!(json.get("completedAt").is_some());
    }
}
