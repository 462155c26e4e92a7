//! Work queue client.
//!
//! Wraps a managed point-to-point queue (SQS) behind the [`WorkQueue`] trait:
//! send, long-poll receive and acknowledge-by-handle. A message stays on the
//! queue until it is acknowledged; if that never happens the provider's
//! visibility timeout makes it available again.

use crate::config::QueueConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client as SqsClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// SQS accepts at most this many messages per receive call
const MAX_BATCH: u32 = 10;
/// SQS long-poll ceiling
const MAX_WAIT: Duration = Duration::from_secs(20);

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Failed to receive messages: {0}")]
    Receive(String),

    #[error("Failed to acknowledge message: {0}")]
    Acknowledge(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One unit of work: a source object to analyze for an organization/category.
///
/// Wire names are fixed by the producer convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    #[serde(rename = "school")]
    pub organization: String,
    #[serde(rename = "subject")]
    pub category: String,
    #[serde(rename = "s3_path")]
    pub source_path: String,
}

impl WorkRequest {
    pub fn new(
        organization: impl Into<String>,
        category: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            category: category.into(),
            source_path: source_path.into(),
        }
    }
}

/// Opaque token that identifies one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Handles are long; the tail is enough to correlate log lines
        let tail = self.0.len().saturating_sub(12);
        match self.0.get(tail..) {
            Some(suffix) if tail > 0 => write!(f, "...{}", suffix),
            _ => f.write_str(&self.0),
        }
    }
}

/// A received message
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Provider message id
    pub message_id: String,
    /// Raw JSON body
    pub body: Vec<u8>,
    /// Handle used to acknowledge this delivery
    pub receipt_handle: ReceiptHandle,
}

/// Why a message body could not be turned into a [`WorkRequest`]
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("Message field '{field}' is not a usable path segment: {reason}")]
    UnsafeField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Check that `value` can be used as one directory or key segment.
///
/// Rejects separators, drive prefixes, `.`/`..` and control characters so a
/// segment can never leave the directory it is joined onto.
pub fn check_path_segment(value: &str) -> Result<(), &'static str> {
    if value == "." || value == ".." {
        return Err("relative directory reference");
    }
    if value.contains(['/', '\\']) {
        return Err("contains a path separator");
    }
    if value.contains(':') {
        return Err("contains a drive or scheme separator");
    }
    if value.chars().any(char::is_control) {
        return Err("contains control characters");
    }
    Ok(())
}

impl QueueMessage {
    /// Deserialize the body as a work request
    pub fn decode_request(&self) -> Result<WorkRequest, DecodeError> {
        let request: WorkRequest = serde_json::from_slice(&self.body)?;

        for (name, value) in [
            ("school", &request.organization),
            ("subject", &request.category),
            ("s3_path", &request.source_path),
        ] {
            if value.trim().is_empty() {
                return Err(DecodeError::EmptyField(name));
            }
        }

        for (field, value) in [
            ("school", &request.organization),
            ("subject", &request.category),
        ] {
            check_path_segment(value)
                .map_err(|reason| DecodeError::UnsafeField { field, reason })?;
        }

        Ok(request)
    }
}

/// Point-to-point queue operations the pipeline depends on
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Serialize and enqueue a request, returning the provider message id.
    ///
    /// There is no idempotency key, so a retried send may produce a duplicate.
    async fn send(&self, request: &WorkRequest) -> Result<String, QueueError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    ///
    /// An empty vector means nothing arrived before the wait elapsed.
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete the message behind `handle`
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;
}

/// SQS-backed work queue
pub struct SqsWorkQueue {
    client: SqsClient,
    queue_url: String,
    message_group_id: String,
}

impl SqsWorkQueue {
    /// Create a new SQS queue client
    pub async fn new(config: &QueueConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut sqs_config_builder = aws_sdk_sqs::config::Builder::from(&aws_config);

        // Configure custom endpoint for LocalStack/ElasticMQ
        if let Some(ref endpoint_url) = config.endpoint_url {
            sqs_config_builder = sqs_config_builder.endpoint_url(endpoint_url);
        }

        let client = SqsClient::from_conf(sqs_config_builder.build());

        info!(
            queue_url = %config.queue_url,
            region = %config.region,
            "SQS work queue initialized"
        );

        Self::from_client(client, config.queue_url.clone(), config.message_group_id.clone())
    }

    /// Wrap an already configured client
    pub fn from_client(client: SqsClient, queue_url: String, message_group_id: String) -> Self {
        Self {
            client,
            queue_url,
            message_group_id,
        }
    }

    fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

#[async_trait]
impl WorkQueue for SqsWorkQueue {
    #[instrument(skip(self, request), fields(source_path = %request.source_path))]
    async fn send(&self, request: &WorkRequest) -> Result<String, QueueError> {
        let body = serde_json::to_string(request)?;

        let mut send = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        if self.is_fifo() {
            send = send
                .message_group_id(&self.message_group_id)
                .message_deduplication_id(Uuid::new_v4().to_string());
        }

        let output = send
            .send()
            .await
            .map_err(|e| QueueError::Send(DisplayErrorContext(&e).to_string()))?;

        let message_id = output.message_id().unwrap_or_default().to_string();
        info!(message_id = %message_id, "Sent work request");

        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let max_messages = max_messages.clamp(1, MAX_BATCH);
        let wait = wait.min(MAX_WAIT);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let mut messages = Vec::new();
        for message in output.messages() {
            let (Some(body), Some(handle)) = (message.body(), message.receipt_handle()) else {
                warn!(
                    message_id = message.message_id().unwrap_or("unknown"),
                    "Skipping message without body or receipt handle"
                );
                continue;
            };

            messages.push(QueueMessage {
                message_id: message.message_id().unwrap_or_default().to_string(),
                body: body.as_bytes().to_vec(),
                receipt_handle: ReceiptHandle::new(handle),
            });
        }

        if messages.is_empty() {
            debug!("No messages received");
        } else {
            debug!(count = messages.len(), "Received messages");
        }

        Ok(messages)
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle.as_str())
            .send()
            .await
            .map_err(|e| QueueError::Acknowledge(DisplayErrorContext(&e).to_string()))?;

        debug!("Deleted message");
        Ok(())
    }
}
