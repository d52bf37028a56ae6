//! Session Negotiator
//!
//! Submits a manifest to the upload authority. Transient authority failures
//! are retried with backoff; a rejection is final.

use std::sync::Arc;

use super::types::NegotiatedSession;
use crate::clock::Clock;
use crate::error::Result;
use crate::manifest::UploadManifest;
use crate::retry::RetryPolicy;
use crate::traits::UploadAuthority;

/// Negotiates upload sessions with the authority
#[derive(Clone)]
pub struct SessionNegotiator {
    authority: Arc<dyn UploadAuthority>,
    clock: Arc<dyn Clock>,
    attempts: u32,
    retry: RetryPolicy,
}

impl SessionNegotiator {
    pub fn new(
        authority: Arc<dyn UploadAuthority>,
        clock: Arc<dyn Clock>,
        attempts: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            authority,
            clock,
            attempts: attempts.max(1),
            retry,
        }
    }

    /// Negotiate a session for `manifest`
    pub async fn negotiate(&self, manifest: &UploadManifest) -> Result<NegotiatedSession> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.try_negotiate(manifest).await {
                Ok(session) => {
                    tracing::info!(
                        upload_id = %manifest.upload_id,
                        session_id = %session.session_id(),
                        expires_at = %session.expires_at(),
                        chunk_size = session.chunk_size(),
                        allowed_retries = session.allowed_retries(),
                        attempt = attempt,
                        "Upload session negotiated"
                    );
                    return Ok(session);
                }
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        upload_id = %manifest.upload_id,
                        attempt = attempt,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Negotiation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        upload_id = %manifest.upload_id,
                        attempt = attempt,
                        error = %e,
                        "Negotiation failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn try_negotiate(&self, manifest: &UploadManifest) -> Result<NegotiatedSession> {
        let ack = self.authority.open_session(manifest).await?;
        NegotiatedSession::from_ack(ack, manifest, self.clock.now())
    }
}
