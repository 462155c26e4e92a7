//! Background directory mirroring.
//!
//! A single consumer drains an unbounded FIFO of [`UploadTask`]s, so at most
//! one directory upload is in flight at any time. After each task the worker
//! pauses for a cooldown to throttle bursts against object storage.

use crate::queue::check_path_segment;
use crate::transfer::{ObjectPath, ObjectTransfer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Errors from the bulk upload worker
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload worker has stopped")]
    WorkerStopped,

    #[error("Cannot upload {path}: {reason}")]
    InvalidDirectory { path: PathBuf, reason: String },

    #[error("Invalid {field} '{value}': {reason}")]
    InvalidTask {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Directory scan task failed: {0}")]
    Join(String),
}

/// Request to mirror a local directory to object storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local_directory: PathBuf,
    pub organization: String,
    pub category: String,
}

impl UploadTask {
    pub fn new(
        local_directory: impl Into<PathBuf>,
        organization: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            local_directory: local_directory.into(),
            organization: organization.into(),
            category: category.into(),
        }
    }

    /// Last path segment of the directory, used as the remote prefix
    pub fn timestamp(&self) -> Option<&str> {
        self.local_directory.file_name().and_then(|name| name.to_str())
    }
}

/// Outcome of one directory upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUploadReport {
    pub prefix: ObjectPath,
    pub uploaded: usize,
    pub failed: usize,
}

/// Producer side of the worker's task queue
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<UploadTask>,
}

impl UploadQueue {
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<UploadTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Append a task. Never waits on uploads.
    pub fn enqueue(&self, task: UploadTask) -> Result<(), UploadError> {
        let directory = task.local_directory.clone();
        self.tx.send(task).map_err(|_| UploadError::WorkerStopped)?;
        info!(directory = %directory.display(), "Queued directory upload");
        Ok(())
    }
}

/// Single-consumer worker that mirrors queued directories
pub struct BulkUploadWorker {
    transfer: Arc<ObjectTransfer>,
    bucket: String,
    cooldown: Duration,
    tasks: mpsc::UnboundedReceiver<UploadTask>,
    shutdown: CancellationToken,
}

impl BulkUploadWorker {
    pub fn new(
        transfer: Arc<ObjectTransfer>,
        bucket: impl Into<String>,
        cooldown: Duration,
        shutdown: CancellationToken,
    ) -> (Self, UploadQueue) {
        let (tx, tasks) = mpsc::unbounded_channel();
        let worker = Self {
            transfer,
            bucket: bucket.into(),
            cooldown,
            tasks,
            shutdown,
        };
        (worker, UploadQueue { tx })
    }

    /// Run on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process tasks in arrival order until cancelled or every producer is gone.
    ///
    /// A directory upload that has started is finished before shutdown is honoured.
    pub async fn run(mut self) {
        info!(bucket = %self.bucket, "Bulk upload worker started");

        loop {
            let task = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                task = self.tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            match self.upload_directory(&task).await {
                Ok(report) => {
                    metrics::counter!("processor.uploads.completed").increment(1);
                    info!(
                        prefix = %report.prefix,
                        uploaded = report.uploaded,
                        failed = report.failed,
                        "Finished directory upload"
                    );
                }
                Err(e) => {
                    metrics::counter!("processor.uploads.failed").increment(1);
                    error!(
                        directory = %task.local_directory.display(),
                        error = %e,
                        "Directory upload failed"
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cooldown) => {}
            }
        }

        info!("Bulk upload worker stopped");
    }

    /// Mirror every file under the task's directory to
    /// `organization/category/timestamp/<relative path>`
    #[instrument(skip(self, task), fields(directory = %task.local_directory.display()))]
    pub async fn upload_directory(
        &self,
        task: &UploadTask,
    ) -> Result<DirectoryUploadReport, UploadError> {
        let timestamp = task.timestamp().ok_or_else(|| UploadError::InvalidDirectory {
            path: task.local_directory.clone(),
            reason: "path has no final segment".into(),
        })?;

        for (field, value) in [
            ("organization", task.organization.as_str()),
            ("category", task.category.as_str()),
        ] {
            check_path_segment(value).map_err(|reason| UploadError::InvalidTask {
                field,
                value: value.to_string(),
                reason,
            })?;
        }

        let prefix = ObjectPath::new(
            self.bucket.clone(),
            format!("{}/{}/{}", task.organization, task.category, timestamp),
        );

        if let Err(e) = self.transfer.ensure_prefix(&prefix).await {
            warn!(prefix = %prefix, error = %e, "Failed to create prefix marker");
        }

        let files = scan_directory(task.local_directory.clone()).await?;
        debug!(files = files.len(), prefix = %prefix, "Starting directory upload");

        let mut report = DirectoryUploadReport {
            prefix: prefix.clone(),
            uploaded: 0,
            failed: 0,
        };

        for (local, relative) in files {
            let remote = prefix.join(&relative);
            match self.transfer.upload(&local, &remote).await {
                Ok(()) => report.uploaded += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("processor.upload.files.failed").increment(1);
                    warn!(local = %local.display(), remote = %remote, error = %e, "File upload failed");
                }
            }
        }

        Ok(report)
    }
}

/// Regular files under `root` with their `/`-separated relative paths, sorted
async fn scan_directory(root: PathBuf) -> Result<Vec<(PathBuf, String)>, UploadError> {
    tokio::task::spawn_blocking(move || {
        if !root.is_dir() {
            return Err(UploadError::InvalidDirectory {
                path: root.clone(),
                reason: "not a directory".into(),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|source| UploadError::Walk {
                path: root.clone(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(relative) = relative_key(&root, entry.path()) {
                files.push((entry.path().to_path_buf(), relative));
            }
        }
        Ok(files)
    })
    .await
    .map_err(|e| UploadError::Join(e.to_string()))?
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}
