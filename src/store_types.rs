use serde::{Deserialize, Serialize};

use crate::exam::ExamType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Purchase,
    Usage,
    UsageFail,
    Grant,
    Refund,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "PURCHASE",
            Self::Usage => "USAGE",
            Self::UsageFail => "USAGE_FAIL",
            Self::Grant => "GRANT",
            Self::Refund => "REFUND",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PURCHASE" => Some(Self::Purchase),
            "USAGE" => Some(Self::Usage),
            "USAGE_FAIL" => Some(Self::UsageFail),
            "GRANT" => Some(Self::Grant),
            "REFUND" => Some(Self::Refund),
            _ => None,
        }
    }
}

/// One immutable credit-affecting event. `amount` is signed: positive adds
/// credit, negative consumes it. `external_ref` is the idempotency key for
/// purchases and refunds and is unique per kind when present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub kind: LedgerKind,
    pub external_ref: Option<String>,
    pub reason: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub credits: i64,
    pub disabled: bool,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExamSessionRecord {
    pub id: String,
    pub user_id: String,
    pub exam_type: ExamType,
    pub status: SessionStatus,
    /// Presented content at start; answers and per-question results are merged
    /// in on completion.
    pub payload: serde_json::Value,
    /// Answer keys extracted at start for objective types; never part of
    /// `payload`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_key: Option<serde_json::Value>,
    pub score: Option<f64>,
    pub sub_scores: Option<serde_json::Value>,
    pub ai_cost_usd_micros: Option<u64>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentItemRecord {
    pub id: String,
    pub exam_type: ExamType,
    /// 1–3 for speaking questions, 0 otherwise.
    pub part: u8,
    pub published: bool,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub id: i64,
    pub ts_ms: u64,
    pub kind: String,
    pub payload: serde_json::Value,
}
