//! Result persistence.
//!
//! Results land under `<data_dir>/<organization>/<category>/<timestamp>/`.
//! Every write overwrites in place and the rendering is deterministic, so a
//! redelivered message produces byte-identical artifacts at the same paths.

use crate::analysis::{option_letter, ProcessingResult};
use crate::config::PersistMode;
use crate::queue::{check_path_segment, WorkRequest};
use crate::transfer::{ObjectPath, ObjectTransfer, TransferError};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

/// Errors that can occur while persisting a result
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to mirror result: {0}")]
    Mirror(#[from] TransferError),

    #[error("Cannot use {field} '{value}' as a result directory: {reason}")]
    InvalidSegment {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Timestamp identity of a source file: its first two `_`-delimited tokens
pub fn timestamp_from_filename(file_name: &str) -> String {
    file_name.split('_').take(2).collect::<Vec<_>>().join("_")
}

/// Local files written for one result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArtifacts {
    pub directory: PathBuf,
    pub result_json: PathBuf,
    pub summary_txt: Option<PathBuf>,
    pub quiz_txt: Option<PathBuf>,
    /// Remote copies, in upload order
    pub mirrored: Vec<ObjectPath>,
}

/// Writes processing results locally and mirrors the readable artifacts
pub struct ResultStore {
    data_dir: PathBuf,
    mode: PersistMode,
    transfer: Arc<ObjectTransfer>,
}

impl ResultStore {
    pub fn new(data_dir: impl Into<PathBuf>, mode: PersistMode, transfer: Arc<ObjectTransfer>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mode,
            transfer,
        }
    }

    /// Directory that holds results for `request` at `timestamp`
    pub fn result_dir(&self, request: &WorkRequest, timestamp: &str) -> PathBuf {
        self.data_dir
            .join(&request.organization)
            .join(&request.category)
            .join(timestamp)
    }

    /// Persist `result` for the staged source file.
    ///
    /// In [`PersistMode::Full`] success requires the local writes and both
    /// remote uploads to `remote_base`.
    #[instrument(skip(self, request, result), fields(org = %request.organization, category = %request.category))]
    pub async fn persist(
        &self,
        request: &WorkRequest,
        source_file_name: &str,
        result: &ProcessingResult,
        remote_base: &ObjectPath,
    ) -> Result<PersistedArtifacts, PersistenceError> {
        let timestamp = timestamp_from_filename(source_file_name);
        for (field, value) in [
            ("organization", request.organization.as_str()),
            ("category", request.category.as_str()),
            ("timestamp", timestamp.as_str()),
        ] {
            check_path_segment(value).map_err(|reason| PersistenceError::InvalidSegment {
                field,
                value: value.to_string(),
                reason,
            })?;
        }
        let directory = self.result_dir(request, &timestamp);

        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| write_error(&directory, e))?;

        let result_json = directory.join(format!("{}_result.json", timestamp));
        write_file(&result_json, serde_json::to_string_pretty(result)?.as_bytes()).await?;

        let mut artifacts = PersistedArtifacts {
            directory: directory.clone(),
            result_json,
            summary_txt: None,
            quiz_txt: None,
            mirrored: Vec::new(),
        };

        if self.mode == PersistMode::JsonOnly {
            info!(directory = %directory.display(), "Saved result");
            return Ok(artifacts);
        }

        let summary_name = format!("{}_summary.txt", timestamp);
        let quiz_name = format!("{}_quiz.txt", timestamp);
        let summary_txt = directory.join(&summary_name);
        let quiz_txt = directory.join(&quiz_name);

        write_file(&summary_txt, result.summary.as_bytes()).await?;
        write_file(&quiz_txt, render_quiz(result).as_bytes()).await?;
        info!(directory = %directory.display(), "Saved result, summary and quiz");

        for (local, name) in [(&summary_txt, &summary_name), (&quiz_txt, &quiz_name)] {
            let remote = remote_base.join(name);
            self.transfer.upload(local, &remote).await?;
            artifacts.mirrored.push(remote);
        }

        artifacts.summary_txt = Some(summary_txt);
        artifacts.quiz_txt = Some(quiz_txt);
        Ok(artifacts)
    }
}

/// Human-readable quiz: lettered options per question, then an answer key
pub fn render_quiz(result: &ProcessingResult) -> String {
    let mut out = String::new();

    for item in &result.items {
        let _ = writeln!(out, "Question: {}", item.prompt);
        for (i, choice) in item.choices.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", option_letter(i), choice);
        }
        out.push('\n');
    }

    out.push_str("\nAnswers:\n");
    for (i, item) in result.items.iter().enumerate() {
        let _ = writeln!(out, "  Question {}: {}", i + 1, option_letter(item.correct_index));
    }

    out
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| write_error(path, e))
}

fn write_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::QuizItem;
    use crate::testing::InMemoryObjectStore;

    fn sample_result() -> ProcessingResult {
        ProcessingResult {
            summary: "Crop rotation keeps soil fertile.".into(),
            items: vec![
                QuizItem {
                    prompt: "Why rotate crops?".into(),
                    choices: vec!["Fertility".into(), "Color".into(), "Taste".into(), "Noise".into()],
                    correct_index: 0,
                },
                QuizItem {
                    prompt: "Which crop fixes nitrogen?".into(),
                    choices: vec!["Wheat".into(), "Rice".into(), "Beans".into(), "Corn".into()],
                    correct_index: 2,
                },
            ],
        }
    }

    fn store(root: &Path, mode: PersistMode) -> (ResultStore, Arc<InMemoryObjectStore>) {
        let objects = Arc::new(InMemoryObjectStore::new());
        let transfer = Arc::new(ObjectTransfer::new(objects.clone(), root.join("downloads")));
        (ResultStore::new(root.join("Data"), mode, transfer), objects)
    }

    #[test]
    fn test_timestamp_from_filename() {
        assert_eq!(
            timestamp_from_filename("16-09-2024_06-34-24_transcript.txt"),
            "16-09-2024_06-34-24"
        );
        assert_eq!(timestamp_from_filename("single.txt"), "single.txt");
        assert_eq!(timestamp_from_filename("a_b"), "a_b");
    }

    #[test]
    fn test_render_quiz_layout() {
        let quiz = render_quiz(&sample_result());
        let expected = "Question: Why rotate crops?\n  A. Fertility\n  B. Color\n  C. Taste\n  D. Noise\n\n\
Question: Which crop fixes nitrogen?\n  A. Wheat\n  B. Rice\n  C. Beans\n  D. Corn\n\n\
\nAnswers:\n  Question 1: A\n  Question 2: C\n";
        assert_eq!(quiz, expected);
    }

    #[tokio::test]
    async fn test_persist_full_writes_and_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, objects) = store(tmp.path(), PersistMode::Full);
        let request = WorkRequest::new("CIS", "Science", "s3://eonpod-data/CIS/Science/16-09-2024_06-34-24_t.txt");
        let base = ObjectPath::new("eonpod-data", "CIS/Science");

        let artifacts = store
            .persist(&request, "16-09-2024_06-34-24_t.txt", &sample_result(), &base)
            .await
            .unwrap();

        let dir = tmp.path().join("Data/CIS/Science/16-09-2024_06-34-24");
        assert_eq!(artifacts.directory, dir);
        assert!(dir.join("16-09-2024_06-34-24_result.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.join("16-09-2024_06-34-24_summary.txt")).unwrap(),
            "Crop rotation keeps soil fertile."
        );

        let summary_remote = ObjectPath::new("eonpod-data", "CIS/Science/16-09-2024_06-34-24_summary.txt");
        let quiz_remote = ObjectPath::new("eonpod-data", "CIS/Science/16-09-2024_06-34-24_quiz.txt");
        assert_eq!(artifacts.mirrored, vec![summary_remote.clone(), quiz_remote.clone()]);
        assert!(objects.object(&summary_remote).is_some());
        assert!(objects.object(&quiz_remote).is_some());
    }

    #[tokio::test]
    async fn test_persist_json_only_skips_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, objects) = store(tmp.path(), PersistMode::JsonOnly);
        let request = WorkRequest::new("CIS", "Science", "s3://b/CIS/x_y_z.txt");

        let artifacts = store
            .persist(&request, "x_y_z.txt", &sample_result(), &ObjectPath::new("b", "CIS"))
            .await
            .unwrap();

        assert!(artifacts.result_json.exists());
        assert!(artifacts.summary_txt.is_none());
        assert!(objects.writes().is_empty());

        let saved: ProcessingResult =
            serde_json::from_slice(&std::fs::read(&artifacts.result_json).unwrap()).unwrap();
        assert_eq!(saved, sample_result());
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path(), PersistMode::Full);
        let request = WorkRequest::new("CIS", "Science", "s3://b/CIS/a_b_c.txt");
        let base = ObjectPath::new("b", "CIS");

        let first = store.persist(&request, "a_b_c.txt", &sample_result(), &base).await.unwrap();
        let json_before = std::fs::read(&first.result_json).unwrap();
        let quiz_before = std::fs::read(first.quiz_txt.as_ref().unwrap()).unwrap();

        let second = store.persist(&request, "a_b_c.txt", &sample_result(), &base).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second.result_json).unwrap(), json_before);
        assert_eq!(std::fs::read(second.quiz_txt.as_ref().unwrap()).unwrap(), quiz_before);
        assert_eq!(std::fs::read_dir(&second.directory).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_persist_stays_inside_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (store, objects) = store(tmp.path(), PersistMode::Full);
        let outside_org = outside.path().to_string_lossy().into_owned();

        for request in [
            WorkRequest::new(outside_org.as_str(), "x", "s3://b/CIS/a_b_c.txt"),
            WorkRequest::new("..", "..", "s3://b/CIS/a_b_c.txt"),
        ] {
            let result = store
                .persist(&request, "a_b_c.txt", &sample_result(), &ObjectPath::new("b", "CIS"))
                .await;
            assert!(matches!(result, Err(PersistenceError::InvalidSegment { .. })));
        }

        assert!(std::fs::read_dir(outside.path()).unwrap().next().is_none());
        assert!(!tmp.path().join("Data").exists());
        assert!(!tmp.path().join("a_b").exists());
        assert!(objects.writes().is_empty());
    }

    #[tokio::test]
    async fn test_persist_fails_when_mirror_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, objects) = store(tmp.path(), PersistMode::Full);
        objects.fail_puts_to("CIS/a_b_quiz.txt");
        let request = WorkRequest::new("CIS", "Science", "s3://b/CIS/a_b_c.txt");

        let result = store
            .persist(&request, "a_b_c.txt", &sample_result(), &ObjectPath::new("b", "CIS"))
            .await;

        assert!(matches!(result, Err(PersistenceError::Mirror(_))));
        // Local artifacts stay behind; the next delivery overwrites them
        assert!(tmp.path().join("Data/CIS/Science/a_b/a_b_result.json").exists());
    }
}
