use crate::analysis::{AnalysisError, ContentAnalyzer, ProcessingResult};
use crate::config::Config;
use crate::queue::{DecodeError, QueueError, QueueMessage, WorkQueue, WorkRequest};
use crate::results::{PersistedArtifacts, PersistenceError, ResultStore};
use crate::transfer::{ObjectPath, ObjectTransfer, TransferError};
use crate::upload_worker::{UploadQueue, UploadTask};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Furthest state a message reached.
///
/// A message that stops short of `Acknowledged` is abandoned: it stays on the
/// queue and is redelivered after the visibility timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Downloaded,
    Analyzed,
    Persisted,
    Acknowledged,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Downloaded => "downloaded",
            Stage::Analyzed => "analyzed",
            Stage::Persisted => "persisted",
            Stage::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can stop a single message short of acknowledgment
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Failed to read staged file {path}: {source}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Acknowledge(QueueError),

    #[error("Processing exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Local copy of a source object, owned by one message's processing
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub local_path: PathBuf,
    pub source: ObjectPath,
}

impl StagedFile {
    pub fn file_name(&self) -> &str {
        self.source.file_name()
    }
}

/// Final state of one message
#[derive(Debug)]
pub enum MessageOutcome {
    Acknowledged(PersistedArtifacts),
    Abandoned { stage: Stage, error: ProcessingError },
}

/// Counters for one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub received: usize,
    pub acknowledged: usize,
    /// Stopped before persistence completed
    pub abandoned: usize,
    /// Persisted, but the acknowledgment itself failed
    pub ack_failures: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged(_) => self.acknowledged += 1,
            MessageOutcome::Abandoned {
                error: ProcessingError::Acknowledge(_),
                ..
            } => self.ack_failures += 1,
            MessageOutcome::Abandoned { .. } => self.abandoned += 1,
        }
    }
}

/// Receive settings for a drain cycle
#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub max_messages: u32,
    pub wait: Duration,
    pub max_messages_per_drain: usize,
    pub message_timeout: Duration,
}

impl DrainSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_messages: config.queue.max_messages,
            wait: config.receive_wait(),
            max_messages_per_drain: config.queue.max_messages_per_drain,
            message_timeout: config.message_timeout(),
        }
    }
}

/// Drives queue messages through download, analysis, persistence and
/// acknowledgment, one at a time.
pub struct PipelineOrchestrator {
    queue: Arc<dyn WorkQueue>,
    transfer: Arc<ObjectTransfer>,
    analyzer: Arc<dyn ContentAnalyzer>,
    results: ResultStore,
    settings: DrainSettings,
    uploads: Option<UploadQueue>,
}

impl PipelineOrchestrator {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        transfer: Arc<ObjectTransfer>,
        analyzer: Arc<dyn ContentAnalyzer>,
        results: ResultStore,
        settings: DrainSettings,
    ) -> Self {
        Self {
            queue,
            transfer,
            analyzer,
            results,
            settings,
            uploads: None,
        }
    }

    /// Queue every acknowledged result directory on `uploads`
    pub fn with_upload_queue(mut self, uploads: UploadQueue) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Process messages until a receive comes back empty.
    ///
    /// Per-message failures are logged and counted; only a failing receive
    /// ends the cycle with an error.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            if report.received >= self.settings.max_messages_per_drain {
                warn!(
                    limit = self.settings.max_messages_per_drain,
                    "Drain limit reached, deferring remaining messages"
                );
                break;
            }

            let messages = match self
                .queue
                .receive(self.settings.max_messages, self.settings.wait)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Receive failed, ending drain cycle");
                    metrics::counter!("processor.queue.errors").increment(1);
                    return Err(e);
                }
            };

            if messages.is_empty() {
                debug!("No messages in queue");
                break;
            }

            for message in messages {
                // Unprocessed messages from this batch reappear after their visibility timeout
                if report.received >= self.settings.max_messages_per_drain {
                    break;
                }
                report.received += 1;
                metrics::counter!("processor.messages.received").increment(1);

                let outcome = self.process_message(&message).await;
                report.record(&outcome);
            }
        }

        metrics::histogram!("processor.drain.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            received = report.received,
            acknowledged = report.acknowledged,
            abandoned = report.abandoned,
            ack_failures = report.ack_failures,
            "Drain cycle finished"
        );

        Ok(report)
    }

    /// Run one message through every stage, isolating its failures
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn process_message(&self, message: &QueueMessage) -> MessageOutcome {
        let mut stage = Stage::Received;
        let deadline = self.settings.message_timeout;

        let processed =
            match tokio::time::timeout(deadline, self.advance(message, &mut stage)).await {
                Ok(result) => result,
                Err(_) => Err(ProcessingError::DeadlineExceeded(deadline)),
            };

        let (request, staged, artifacts) = match processed {
            Ok(done) => done,
            Err(error) => return self.abandon(stage, error),
        };

        if let Err(e) = self.acknowledge(message).await {
            return self.abandon(Stage::Persisted, e);
        }

        self.cleanup(&staged).await;
        metrics::counter!("processor.messages.acknowledged").increment(1);
        info!(directory = %artifacts.directory.display(), "Message processed");

        if let Some(uploads) = &self.uploads {
            let task = UploadTask::new(
                artifacts.directory.clone(),
                request.organization,
                request.category,
            );
            if let Err(e) = uploads.enqueue(task) {
                warn!(error = %e, "Result directory not queued for mirroring");
            }
        }

        MessageOutcome::Acknowledged(artifacts)
    }

    async fn advance(
        &self,
        message: &QueueMessage,
        stage: &mut Stage,
    ) -> Result<(WorkRequest, StagedFile, PersistedArtifacts), ProcessingError> {
        let request = message.decode_request()?;
        debug!(
            organization = %request.organization,
            category = %request.category,
            source = %request.source_path,
            "Decoded work request"
        );

        let staged = self.download(&request).await?;
        *stage = Stage::Downloaded;

        let result = self.analyze(&staged).await?;
        *stage = Stage::Analyzed;

        let artifacts = self.persist(&request, &staged, &result).await?;
        *stage = Stage::Persisted;

        Ok((request, staged, artifacts))
    }

    /// Received -> Downloaded
    pub async fn download(&self, request: &WorkRequest) -> Result<StagedFile, ProcessingError> {
        let source: ObjectPath = request.source_path.parse()?;
        let local_path = self.transfer.download(&source).await?;
        Ok(StagedFile { local_path, source })
    }

    /// Downloaded -> Analyzed. Only a validated result leaves this step.
    pub async fn analyze(&self, staged: &StagedFile) -> Result<ProcessingResult, ProcessingError> {
        let transcript = tokio::fs::read_to_string(&staged.local_path)
            .await
            .map_err(|source| ProcessingError::ReadSource {
                path: staged.local_path.clone(),
                source,
            })?;

        let result = self.analyzer.analyze(&transcript).await?;
        result.validate()?;
        Ok(result)
    }

    /// Analyzed -> Persisted
    pub async fn persist(
        &self,
        request: &WorkRequest,
        staged: &StagedFile,
        result: &ProcessingResult,
    ) -> Result<PersistedArtifacts, ProcessingError> {
        let remote_base = staged.source.parent();
        let artifacts = self
            .results
            .persist(request, staged.file_name(), result, &remote_base)
            .await?;
        Ok(artifacts)
    }

    /// Persisted -> Acknowledged
    pub async fn acknowledge(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        self.queue
            .acknowledge(&message.receipt_handle)
            .await
            .map_err(ProcessingError::Acknowledge)
    }

    /// Remove the staged copy once its message is acknowledged
    async fn cleanup(&self, staged: &StagedFile) {
        if let Err(e) = tokio::fs::remove_file(&staged.local_path).await {
            warn!(
                path = %staged.local_path.display(),
                error = %e,
                "Failed to remove staged file"
            );
        }
    }

    fn abandon(&self, stage: Stage, error: ProcessingError) -> MessageOutcome {
        match &error {
            ProcessingError::Acknowledge(_) => {
                warn!(error = %error, "Acknowledgment failed, message will be redelivered");
                metrics::counter!("processor.messages.ack_failed").increment(1);
            }
            _ => {
                error!(stage = %stage, error = %error, "Abandoning message");
                metrics::counter!("processor.messages.abandoned", "stage" => stage.as_str())
                    .increment(1);
            }
        }
        MessageOutcome::Abandoned { stage, error }
    }
}
