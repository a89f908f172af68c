//! Exam session orchestration: gate the start on funds, hand the candidate
//! stripped content, and grade submissions. Objective types are scored from
//! the stored answer key; writing and speaking go to the external grader, with
//! the deterministic fallback keeping a paid exam from ever staying ungraded.
//!
//! The grading call happens outside any store transaction; only the final
//! completion write is transactional, and it is conditional on the session
//! still being in progress so the first submission always wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LexamError, Result};
use crate::exam::{ExamContent, ExamType};
use crate::grading::{self, Grader, GradingItem, GradingTask};
use crate::scoring;
use crate::sqlite_store::SqliteStore;
use crate::store_types::{ExamSessionRecord, SessionStatus};

#[derive(Clone)]
pub struct ExamService {
    store: SqliteStore,
    grader: Arc<dyn Grader>,
}

/// What the candidate gets back from a successful start.
#[derive(Clone, Debug, Serialize)]
pub struct StartedExam {
    pub session_id: String,
    pub exam_type: ExamType,
    pub duration_seconds: u32,
    pub content: ExamContent,
    pub balance_after: i64,
}

/// Per-question correctness, returned for objectively graded submissions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub correct: bool,
    pub submitted: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "grading", rename_all = "snake_case")]
pub enum SubmitResult {
    Objective {
        score: f64,
        correct: usize,
        total: usize,
        breakdown: Vec<QuestionResult>,
    },
    Subjective {
        score: f64,
        sub_scores: BTreeMap<String, f64>,
        feedback: String,
        /// True when the external grader was unavailable and the fallback
        /// heuristic produced the band.
        provisional: bool,
    },
}

impl SubmitResult {
    pub fn score(&self) -> f64 {
        match self {
            Self::Objective { score, .. } => *score,
            Self::Subjective { score, .. } => *score,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Subjective { provisional: true, .. })
    }
}

impl ExamService {
    pub fn new(store: SqliteStore, grader: Arc<dyn Grader>) -> Self {
        Self { store, grader }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[tracing::instrument(skip(self), fields(user_id = %user_id, exam_type = %exam_type))]
    pub async fn start(&self, user_id: &str, exam_type: ExamType) -> Result<StartedExam> {
        let session_id = new_session_id();
        let started = self
            .store
            .start_exam_session(user_id, exam_type, &session_id)
            .await?;

        tracing::info!(session_id = %started.session_id, balance_after = started.balance_after, "exam started");
        Ok(StartedExam {
            session_id: started.session_id,
            exam_type,
            duration_seconds: exam_type.duration_seconds(),
            content: started.content,
            balance_after: started.balance_after,
        })
    }

    /// Owner-only session view. The answer key is never part of the view.
    pub async fn view(&self, user_id: &str, session_id: &str) -> Result<ExamSessionRecord> {
        let mut session = self.load_owned(user_id, session_id).await?;
        session.answer_key = None;
        Ok(session)
    }

    #[tracing::instrument(skip(self, answers), fields(user_id = %user_id, session_id = %session_id))]
    pub async fn submit(
        &self,
        user_id: &str,
        session_id: &str,
        answers: Value,
    ) -> Result<SubmitResult> {
        let session = self.load_owned(user_id, session_id).await?;
        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Completed => return Err(LexamError::AlreadySubmitted),
            SessionStatus::Failed => {
                return Err(LexamError::InvalidState {
                    reason: "session has failed and cannot be submitted".to_string(),
                });
            }
        }

        let result = if session.exam_type.is_objective() {
            self.grade_objective(&session, answers).await?
        } else {
            self.grade_subjective(&session, answers).await?
        };
        Ok(result)
    }

    async fn grade_objective(
        &self,
        session: &ExamSessionRecord,
        answers: Value,
    ) -> Result<SubmitResult> {
        let Some(Value::Object(key)) = session.answer_key.clone() else {
            // An objective session without a key cannot be graded; mark it
            // terminally failed rather than leaving it submittable forever.
            tracing::error!(session_id = %session.id, "objective session has no answer key");
            let _ = self.store.fail_exam_session(&session.id).await;
            return Err(LexamError::InvalidState {
                reason: "session has no answer key".to_string(),
            });
        };

        let submitted = match &answers {
            Value::Object(map) => map.clone(),
            // Any other submission shape grades as all-incorrect, never errors.
            _ => serde_json::Map::new(),
        };

        let mut breakdown = Vec::with_capacity(key.len());
        let mut correct = 0usize;
        for (question_id, expected) in &key {
            let given = submitted.get(question_id).cloned().unwrap_or(Value::Null);
            let is_correct = scoring::answer_matches(expected, &given);
            if is_correct {
                correct += 1;
            }
            breakdown.push(QuestionResult {
                question_id: question_id.clone(),
                correct: is_correct,
                submitted: given,
            });
        }
        let total = key.len();
        let percent = scoring::percent_correct(correct, total);
        let score = scoring::band_for_percent(percent);

        let payload = merge_payload(
            &session.payload,
            answers,
            serde_json::json!({
                "results": breakdown,
                "percent_correct": percent,
            }),
        );
        self.complete(&session.id, payload, score, None, None).await?;

        Ok(SubmitResult::Objective {
            score,
            correct,
            total,
            breakdown,
        })
    }

    async fn grade_subjective(
        &self,
        session: &ExamSessionRecord,
        answers: Value,
    ) -> Result<SubmitResult> {
        let content: ExamContent = serde_json::from_value(
            session.payload.get("content").cloned().unwrap_or(Value::Null),
        )
        .map_err(|err| LexamError::InvalidState {
            reason: format!("session content cannot be read: {err}"),
        })?;

        let task = build_grading_task(session.exam_type, &content, &answers)?;

        // The external call runs outside any transaction. Non-response is not
        // surfaced to the candidate: the fallback band completes the exam.
        let (outcome, provisional) = match self.grader.grade(&task).await {
            Ok(outcome) => (outcome, false),
            Err(err) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "grading service unavailable; applying fallback score"
                );
                (grading::fallback_outcome(&task), true)
            }
        };

        let score = scoring::clamp_half_band(outcome.score);
        let sub_scores_json = if outcome.sub_scores.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&outcome.sub_scores).map_err(|err| {
                LexamError::Internal {
                    message: format!("sub-score serialization failed: {err}"),
                }
            })?)
        };

        let payload = merge_payload(
            &session.payload,
            answers,
            serde_json::json!({
                "feedback": outcome.feedback,
                "provisional": provisional,
            }),
        );
        self.complete(
            &session.id,
            payload,
            score,
            sub_scores_json,
            outcome.cost_usd_micros,
        )
        .await?;

        Ok(SubmitResult::Subjective {
            score,
            sub_scores: outcome.sub_scores,
            feedback: outcome.feedback,
            provisional,
        })
    }

    async fn complete(
        &self,
        session_id: &str,
        payload: Value,
        score: f64,
        sub_scores: Option<Value>,
        ai_cost_usd_micros: Option<u64>,
    ) -> Result<()> {
        let completed = self
            .store
            .complete_exam_session(session_id, payload, score, sub_scores, ai_cost_usd_micros)
            .await?;
        if !completed {
            // A concurrent submission won the conditional update.
            return Err(LexamError::AlreadySubmitted);
        }
        tracing::info!(session_id = %session_id, score, "exam completed");
        Ok(())
    }

    async fn load_owned(&self, user_id: &str, session_id: &str) -> Result<ExamSessionRecord> {
        let session = self
            .store
            .get_exam_session(session_id)
            .await?
            .ok_or(LexamError::NotFound { what: "exam session" })?;
        if session.user_id != user_id {
            return Err(LexamError::Forbidden {
                reason: "exam session belongs to another account".to_string(),
            });
        }
        Ok(session)
    }
}

/// Folds the submission and grading results into the stored payload alongside
/// the presented content, so the completed row is self-describing.
fn merge_payload(existing: &Value, answers: Value, results: Value) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    merged.insert("answers".to_string(), answers);
    if let Value::Object(extra) = results {
        for (key, value) in extra {
            merged.insert(key, value);
        }
    }
    Value::Object(merged)
}

fn build_grading_task(
    exam_type: ExamType,
    content: &ExamContent,
    answers: &Value,
) -> Result<GradingTask> {
    match (exam_type, content) {
        (ExamType::Writing, ExamContent::Writing { prompt, .. }) => {
            let Some(text) = answers.get("text").and_then(Value::as_str) else {
                return Err(LexamError::InvalidRequest {
                    reason: "writing submission requires a `text` field".to_string(),
                });
            };
            Ok(GradingTask {
                exam_type,
                items: vec![GradingItem {
                    label: "essay".to_string(),
                    prompt: prompt.clone(),
                    response: text.to_string(),
                }],
            })
        }
        (ExamType::Speaking, ExamContent::Speaking { parts }) => {
            let Some(responses) = answers.get("parts").and_then(Value::as_array) else {
                return Err(LexamError::InvalidRequest {
                    reason: "speaking submission requires a `parts` array".to_string(),
                });
            };
            let items = parts
                .iter()
                .enumerate()
                .map(|(index, part)| GradingItem {
                    label: format!("part{}", part.part),
                    prompt: part.prompt.clone(),
                    response: responses
                        .get(index)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect();
            Ok(GradingTask { exam_type, items })
        }
        _ => Err(LexamError::InvalidState {
            reason: "session content does not match its exam type".to_string(),
        }),
    }
}

fn new_session_id() -> String {
    let mut buf = [0u8; 16];
    if getrandom::fill(&mut buf).is_err() {
        // Degrade to a timestamp-derived id rather than refusing to start.
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        return format!("exm_{ts:032x}");
    }
    let mut out = String::with_capacity(4 + 32);
    out.push_str("exm_");
    for byte in buf {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
