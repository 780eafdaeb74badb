//! Retrying client for requests to a single target node.
//!
//! A transient failure resends the whole request, so a retried chunk carries
//! the same bytes and sequence number. Each attempt has its own timeout and a
//! timeout counts as a transient failure.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::cluster::DiscoveryNode;
use crate::config::ReplicationSettings;
use crate::error::{Result, SourceError, TransportError};
use crate::transfer::cancel::CancelFlag;
use crate::transfer::protocol::{FileChunkAck, FileChunkRequest};

/// Network transport towards replica nodes.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Deliver one chunk and wait for the target's acknowledgement.
    async fn send_file_chunk(
        &self,
        target: &DiscoveryNode,
        request: &FileChunkRequest,
    ) -> std::result::Result<FileChunkAck, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: usize,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    /// Overall budget across all attempts of one request
    pub time_budget: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ReplicationSettings) -> Self {
        Self {
            max_attempts: settings.chunk_retry_attempts.max(1),
            attempt_timeout: settings.chunk_timeout(),
            retry_delay: settings.retry_delay(),
            time_budget: settings.internal_action_retry_timeout(),
        }
    }

    fn may_retry(&self, attempt: usize, started: Instant) -> bool {
        attempt < self.max_attempts && started.elapsed() + self.retry_delay < self.time_budget
    }
}

pub struct RetryableTransportClient {
    transport: Arc<dyn ReplicaTransport>,
    target: DiscoveryNode,
    policy: RetryPolicy,
}

impl RetryableTransportClient {
    pub fn new(transport: Arc<dyn ReplicaTransport>, target: DiscoveryNode, policy: RetryPolicy) -> Self {
        Self {
            transport,
            target,
            policy,
        }
    }

    pub fn target(&self) -> &DiscoveryNode {
        &self.target
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a chunk, retrying transient failures within the policy.
    ///
    /// Fails with `TransferAborted` once the budget is spent, with
    /// `Transport` for a non-transient rejection, and with `Cancelled` as soon
    /// as `cancel` fires.
    pub async fn send_file_chunk(&self, request: &FileChunkRequest, cancel: &CancelFlag) -> Result<FileChunkAck> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(SourceError::cancelled(reason)),
                res = tokio::time::timeout(
                    self.policy.attempt_timeout,
                    self.transport.send_file_chunk(&self.target, request),
                ) => res.unwrap_or(Err(TransportError::Timeout(self.policy.attempt_timeout))),
            };

            let err = match outcome {
                Ok(ack) => return Ok(ack),
                Err(err) if !err.is_retryable() => return Err(SourceError::Transport(err)),
                Err(err) => err,
            };

            if !self.policy.may_retry(attempt, started) {
                return Err(SourceError::TransferAborted {
                    file: request.metadata.name.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                node = %self.target.id,
                file = %request.metadata.name,
                seq_no = request.seq_no,
                attempt,
                error = %err,
                "chunk send failed, retrying"
            );

            tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(SourceError::cancelled(reason)),
                _ = tokio::time::sleep(self.policy.retry_delay) => {}
            }
        }
    }
}
