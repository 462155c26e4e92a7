//! Content analysis: transcript text in, summary and quiz out.

use crate::config::AnalysisConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Letters available for labelling choices
const MAX_CHOICES: usize = 26;

/// Errors from the analysis service or from its output
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Analysis request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Analysis service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Analysis response contained no completion")]
    EmptyResponse,

    #[error("Malformed analysis output: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid analysis result: {0}")]
    Invalid(String),
}

/// One multiple-choice question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizItem {
    #[serde(rename = "question")]
    pub prompt: String,
    #[serde(rename = "options")]
    pub choices: Vec<String>,
    /// Zero-based index into `choices`
    #[serde(rename = "correct_answer")]
    pub correct_index: usize,
}

/// Structured output of one analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub summary: String,
    #[serde(rename = "quiz_questions")]
    pub items: Vec<QuizItem>,
}

impl ProcessingResult {
    /// Reject results whose answers do not point at an existing choice
    pub fn validate(&self) -> Result<(), AnalysisError> {
        for (number, item) in self.items.iter().enumerate().map(|(i, item)| (i + 1, item)) {
            if item.choices.is_empty() {
                return Err(AnalysisError::Invalid(format!(
                    "question {} has no options",
                    number
                )));
            }
            if item.choices.len() > MAX_CHOICES {
                return Err(AnalysisError::Invalid(format!(
                    "question {} has {} options, at most {} can be lettered",
                    number,
                    item.choices.len(),
                    MAX_CHOICES
                )));
            }
            if item.correct_index >= item.choices.len() {
                return Err(AnalysisError::Invalid(format!(
                    "question {} answer index {} is outside {} options",
                    number,
                    item.correct_index,
                    item.choices.len()
                )));
            }
        }
        Ok(())
    }
}

/// External service that turns transcript text into a [`ProcessingResult`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, transcript: &str) -> Result<ProcessingResult, AnalysisError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatCompletion,
}

#[derive(Deserialize)]
struct ChatCompletion {
    content: Option<String>,
}

/// Analyzer backed by an OpenAI-compatible chat completions endpoint
pub struct ChatCompletionAnalyzer {
    client: Client,
    config: AnalysisConfig,
}

impl ChatCompletionAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AnalysisError::Client(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn prompt(&self, transcript: &str) -> String {
        let options = (0..self.config.options_per_question)
            .map(|i| format!("\"Option {}\"", option_letter(i as usize)))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"Given the following lecture transcript, please provide:
1. A concise summary of the lecture (max {words} words)
2. {count} multiple-choice quiz questions based on the content, each with exactly {per} options

Lecture transcript:
{transcript}

Please format your response as a JSON object with the following structure:
{{
  "summary": "Your summary here",
  "quiz_questions": [
    {{
      "question": "Question 1",
      "options": [{options}],
      "correct_answer": 0
    }}
  ]
}}
"correct_answer" is the zero-based index of the correct option."#,
            words = self.config.summary_word_limit,
            count = self.config.question_count,
            per = self.config.options_per_question,
            transcript = transcript,
            options = options,
        )
    }
}

#[async_trait]
impl ContentAnalyzer for ChatCompletionAnalyzer {
    #[instrument(skip(self, transcript), fields(model = %self.config.model, chars = transcript.len()))]
    async fn analyze(&self, transcript: &str) -> Result<ProcessingResult, AnalysisError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a helpful assistant.".to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: self.prompt(transcript),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response: ChatResponse = response.json().await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(AnalysisError::EmptyResponse)?;

        debug!(chars = content.len(), "Received completion");
        parse_result(&content)
    }
}

/// Parse completion text, tolerating a surrounding Markdown code fence
pub fn parse_result(content: &str) -> Result<ProcessingResult, AnalysisError> {
    Ok(serde_json::from_str(strip_code_fence(content))?)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line
    let inner = inner.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    inner.trim_end().trim_end_matches("```").trim()
}

/// `0 -> 'A'`, `1 -> 'B'`, ...
pub fn option_letter(index: usize) -> char {
    (b'A' + (index % MAX_CHOICES) as u8) as char
}
