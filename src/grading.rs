//! Client for the external LLM/ASR grading service, plus the deterministic
//! fallback used when that service is unavailable. A paid exam never stays
//! ungraded: the fallback produces a provisional band and the session still
//! completes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exam::ExamType;
use crate::scoring;

const DEFAULT_BASE_URL: &str = "https://grader.internal.lexam.dev";

/// One prompt/response pair to grade. Writing submits a single item; speaking
/// submits one per part.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingItem {
    pub label: String,
    pub prompt: String,
    pub response: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingTask {
    pub exam_type: ExamType,
    pub items: Vec<GradingItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub score: f64,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub cost_usd_micros: Option<u64>,
}

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("grading api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("grading http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid grading response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, task: &GradingTask) -> Result<GradingOutcome, GradingError>;
}

#[derive(Clone)]
pub struct HttpGrader {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: Option<String>,
}

impl HttpGrader {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn grade_url(&self) -> String {
        format!("{}/v1/grade", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct GradeRequestBody<'a> {
    exam_type: &'a str,
    items: &'a [GradingItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[async_trait]
impl Grader for HttpGrader {
    async fn grade(&self, task: &GradingTask) -> Result<GradingOutcome, GradingError> {
        let body = GradeRequestBody {
            exam_type: task.exam_type.as_str(),
            items: &task.items,
            model: self.model.as_deref(),
        };
        let response = self
            .http
            .post(self.grade_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GradingError::Api { status, body });
        }

        let outcome: GradingOutcome = response
            .json()
            .await
            .map_err(|err| GradingError::InvalidResponse(err.to_string()))?;
        if !outcome.score.is_finite() {
            return Err(GradingError::InvalidResponse(
                "score is not a finite number".to_string(),
            ));
        }
        Ok(outcome)
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Provisional score when the grading service is down. Length thresholds for
/// writing, answered-part count for speaking; same inputs always produce the
/// same band.
pub fn fallback_outcome(task: &GradingTask) -> GradingOutcome {
    let score = match task.exam_type {
        ExamType::Writing => {
            let words = task
                .items
                .first()
                .map(|item| word_count(&item.response))
                .unwrap_or(0);
            match words {
                0..=49 => 4.0,
                50..=149 => 4.5,
                150..=249 => 5.0,
                _ => 6.0,
            }
        }
        ExamType::Speaking => {
            let answered = task
                .items
                .iter()
                .filter(|item| !item.response.trim().is_empty())
                .count();
            match answered {
                0 => 4.0,
                1 => 4.5,
                2 => 5.0,
                _ => 5.5,
            }
        }
        // Objective types never reach the grader.
        ExamType::Reading | ExamType::Listening => 4.0,
    };

    GradingOutcome {
        score: scoring::clamp_half_band(score),
        sub_scores: BTreeMap::new(),
        feedback: "Provisional score: automated assessment was unavailable, so this band \
                   was estimated from response length. It may be revised."
            .to_string(),
        cost_usd_micros: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writing_task(words: usize) -> GradingTask {
        GradingTask {
            exam_type: ExamType::Writing,
            items: vec![GradingItem {
                label: "essay".to_string(),
                prompt: "Describe the chart.".to_string(),
                response: vec!["word"; words].join(" "),
            }],
        }
    }

    #[test]
    fn writing_fallback_uses_length_thresholds() {
        assert_eq!(fallback_outcome(&writing_task(0)).score, 4.0);
        assert_eq!(fallback_outcome(&writing_task(49)).score, 4.0);
        assert_eq!(fallback_outcome(&writing_task(50)).score, 4.5);
        assert_eq!(fallback_outcome(&writing_task(200)).score, 5.0);
        assert_eq!(fallback_outcome(&writing_task(260)).score, 6.0);
    }

    #[test]
    fn speaking_fallback_counts_answered_parts() {
        let task = |responses: [&str; 3]| GradingTask {
            exam_type: ExamType::Speaking,
            items: responses
                .iter()
                .enumerate()
                .map(|(index, response)| GradingItem {
                    label: format!("part{}", index + 1),
                    prompt: "q".to_string(),
                    response: response.to_string(),
                })
                .collect(),
        };
        assert_eq!(fallback_outcome(&task(["", "", ""])).score, 4.0);
        assert_eq!(fallback_outcome(&task(["yes", " ", ""])).score, 4.5);
        assert_eq!(fallback_outcome(&task(["yes", "yes", ""])).score, 5.0);
        assert_eq!(fallback_outcome(&task(["a", "b", "c"])).score, 5.5);
    }

    #[test]
    fn fallback_is_deterministic() {
        let task = writing_task(120);
        let first = fallback_outcome(&task);
        let second = fallback_outcome(&task);
        assert_eq!(first.score, second.score);
        assert!(first.feedback.contains("Provisional"));
        assert!(first.cost_usd_micros.is_none());
    }
}
