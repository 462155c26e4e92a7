//! Transcript Processor
//!
//! Queue-driven processing of lecture transcripts. Each queue message names a
//! transcript object in S3; the processor downloads it, asks an analysis
//! service for a summary and a multiple-choice quiz, persists the result
//! locally (and mirrors the readable parts back to S3), and only then deletes
//! the message. Anything that fails before that point leaves the message on
//! the queue for redelivery.
//!
//! Independently, a bulk upload worker mirrors whole local directories to S3,
//! one directory at a time.
//!
//! ## Architecture
//!
//! ```text
//!   SQS queue                                   Data/{org}/{category}/{ts}/
//! ┌──────────────┐   receive    ┌──────────────┐   persist   ┌──────────────┐
//! │ WorkRequest  │─────────────▶│ Pipeline     │────────────▶│ Result       │
//! │ messages     │◀─────────────│ Orchestrator │             │ Store        │
//! └──────────────┘  acknowledge └──────────────┘             └──────────────┘
//!                                  │       │                        │
//!                          download│       │analyze                 │mirror
//!                                  ▼       ▼                        ▼
//!                        ┌──────────────┐ ┌──────────────┐   ┌──────────────┐
//!                        │ Object       │ │ Analysis     │   │ S3           │
//!                        │ Transfer     │ │ Service      │   │              │
//!                        └──────────────┘ └──────────────┘   └──────────────┘
//!                                  ▲
//!                                  │ upload
//!                        ┌──────────────┐
//!  UploadQueue ─────────▶│ Bulk Upload  │
//!                        │ Worker       │
//!                        └──────────────┘
//! ```

pub mod analysis;
pub mod config;
pub mod orchestrator;
pub mod queue;
pub mod results;
pub mod transfer;
pub mod upload_worker;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{AnalysisError, ChatCompletionAnalyzer, ContentAnalyzer, ProcessingResult, QuizItem};
pub use config::{Config, ConfigError, PersistMode};
pub use orchestrator::{
    DrainReport, DrainSettings, MessageOutcome, PipelineOrchestrator, ProcessingError, Stage,
    StagedFile,
};
pub use queue::{QueueError, QueueMessage, ReceiptHandle, SqsWorkQueue, WorkQueue, WorkRequest};
pub use results::{PersistedArtifacts, PersistenceError, ResultStore};
pub use transfer::{ObjectPath, ObjectStore, ObjectTransfer, S3ObjectStore, TransferError};
pub use upload_worker::{BulkUploadWorker, DirectoryUploadReport, UploadError, UploadQueue, UploadTask};
