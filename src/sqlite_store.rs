//! SQLite-backed store. Every credit mutation pairs the `users.credits`
//! update with a ledger append inside one transaction, and the partial unique
//! index on `(kind, external_ref)` is what makes purchase/refund application
//! idempotent under concurrent delivery.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::exam::{self, ExamContent, ExamType, SelectedItem};
use crate::store_types::{
    AuditLogRecord, ContentItemRecord, ExamSessionRecord, LedgerEntry, LedgerKind, SessionStatus,
    UserRecord,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("insufficient funds: balance={balance}")]
    InsufficientFunds { balance: i64 },
    #[error("no published content for {exam_type}")]
    ContentUnavailable { exam_type: String },
    #[error("account disabled")]
    AccountDisabled,
    #[error("ledger entry not found")]
    EntryNotFound,
    #[error("not refundable: {reason}")]
    NotRefundable { reason: &'static str },
    #[error("already refunded")]
    AlreadyRefunded,
    #[error("corrupt record: {reason}")]
    Corrupt { reason: String },
}

/// Result of starting an exam: what the candidate sees, the extracted answer
/// key (objective types), and the balance after the deduction.
#[derive(Clone, Debug)]
pub struct StartedSession {
    pub session_id: String,
    pub content: ExamContent,
    pub answer_key: Option<serde_json::Value>,
    pub balance_after: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Applied { entry_id: i64 },
    /// The same payment reference was applied before; nothing changed.
    Replayed,
}

#[derive(Clone, Debug)]
pub struct RefundApplied {
    pub user_id: String,
    pub amount: i64,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    // ----- users -----

    pub async fn ensure_user(&self, user_id: &str) -> Result<(), StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO users (id, credits, disabled, created_at_ms)
                 VALUES (?1, 0, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<UserRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT id, credits, disabled, created_at_ms FROM users WHERE id=?1",
                    rusqlite::params![user_id],
                    |row| {
                        Ok(UserRecord {
                            id: row.get(0)?,
                            credits: row.get(1)?,
                            disabled: row.get::<_, i64>(2)? != 0,
                            created_at_ms: i64_to_u64(row.get(3)?),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    /// Admin toggle; the flag is enforced by every credit-consuming operation.
    pub async fn set_user_disabled(
        &self,
        user_id: &str,
        disabled: bool,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE users SET disabled=?2 WHERE id=?1",
                rusqlite::params![user_id, disabled as i64],
            )?;
            if changed == 1 {
                append_audit(
                    &conn,
                    ts_ms,
                    "user_disabled_toggle",
                    serde_json::json!({ "user_id": user_id, "disabled": disabled }),
                )?;
            }
            Ok(changed == 1)
        })
        .await?
    }

    pub async fn balance_of(&self, user_id: &str) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let credits: Option<i64> = conn
                .query_row(
                    "SELECT credits FROM users WHERE id=?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(credits.unwrap_or(0))
        })
        .await?
    }

    /// Sums the ledger directly. The cached column and this sum must agree at
    /// all times; the admin balance-audit endpoint and the tests compare them.
    pub async fn recompute_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let sum: Option<i64> = conn.query_row(
                "SELECT SUM(amount) FROM ledger_entries WHERE user_id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            Ok(sum.unwrap_or(0))
        })
        .await?
    }

    // ----- ledger -----

    pub async fn ledger_entries_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerEntry>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, kind, external_ref, reason, created_at_ms
                 FROM ledger_entries
                 WHERE user_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], ledger_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(entry_from_raw(row?)?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn find_ledger_entry(&self, id: i64) -> Result<Option<LedgerEntry>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LedgerEntry>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw = conn
                .query_row(
                    "SELECT id, user_id, amount, kind, external_ref, reason, created_at_ms
                     FROM ledger_entries WHERE id=?1",
                    rusqlite::params![id],
                    ledger_row,
                )
                .optional()?;
            raw.map(entry_from_raw).transpose()
        })
        .await?
    }

    /// Idempotency lookup: the unique index makes `(kind, external_ref)`
    /// identify at most one entry.
    pub async fn find_by_external_ref(
        &self,
        external_ref: &str,
        kind: LedgerKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let path = self.path.clone();
        let external_ref = external_ref.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<LedgerEntry>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw = conn
                .query_row(
                    "SELECT id, user_id, amount, kind, external_ref, reason, created_at_ms
                     FROM ledger_entries WHERE kind=?1 AND external_ref=?2",
                    rusqlite::params![kind.as_str(), external_ref],
                    ledger_row,
                )
                .optional()?;
            raw.map(entry_from_raw).transpose()
        })
        .await?
    }

    // ----- exam sessions -----

    /// The whole exam start as one unit of work: disabled gate, balance
    /// check, deduction plus `USAGE` append, uniform-random selection over
    /// published content, session insert.
    ///
    /// When the requested type has no published content, the deduction half
    /// commits and a second transaction restores the credit with a
    /// `USAGE_FAIL` append, so the ledger keeps the documented entry pair and
    /// the balance nets to zero. A failed restore is an operational incident:
    /// it is logged at error level and recorded in the audit log.
    pub async fn start_exam_session(
        &self,
        user_id: &str,
        exam_type: ExamType,
        session_id: &str,
    ) -> Result<StartedSession, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let session_id = session_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<StartedSession, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO users (id, credits, disabled, created_at_ms)
                 VALUES (?1, 0, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;
            let (credits, disabled): (i64, i64) = tx.query_row(
                "SELECT credits, disabled FROM users WHERE id=?1",
                rusqlite::params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if disabled != 0 {
                return Err(StoreError::AccountDisabled);
            }
            if credits < 1 {
                return Err(StoreError::InsufficientFunds { balance: credits });
            }

            tx.execute(
                "UPDATE users SET credits = credits - 1 WHERE id=?1",
                rusqlite::params![user_id],
            )?;
            tx.execute(
                "INSERT INTO ledger_entries (user_id, amount, kind, external_ref, reason, created_at_ms)
                 VALUES (?1, -1, ?2, NULL, ?3, ?4)",
                rusqlite::params![
                    user_id,
                    LedgerKind::Usage.as_str(),
                    format!("exam start: {exam_type}"),
                    ts_ms
                ],
            )?;

            match select_exam_content(&tx, exam_type)? {
                Some((content, answer_key)) => {
                    let payload = serde_json::json!({ "content": content });
                    tx.execute(
                        "INSERT INTO exam_sessions
                             (id, user_id, exam_type, status, payload_json, answer_key_json, created_at_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            session_id,
                            user_id,
                            exam_type.as_str(),
                            SessionStatus::InProgress.as_str(),
                            serde_json::to_string(&payload)?,
                            answer_key
                                .as_ref()
                                .map(serde_json::to_string)
                                .transpose()?,
                            ts_ms
                        ],
                    )?;
                    tx.commit()?;
                    Ok(StartedSession {
                        session_id,
                        content,
                        answer_key,
                        balance_after: credits - 1,
                    })
                }
                None => {
                    // Commit the deduction, then restore it as an explicit
                    // compensating pair rather than silently rolling back.
                    tx.commit()?;
                    let restore = restore_credit(&mut conn, &user_id, exam_type, ts_ms);
                    if let Err(err) = restore {
                        tracing::error!(
                            user_id = %user_id,
                            exam_type = %exam_type,
                            error = %err,
                            "credit restore failed after content-unavailable exam start; \
                             user is owed one credit"
                        );
                        let _ = append_audit(
                            &conn,
                            now_millis(),
                            "compensation_failure",
                            serde_json::json!({
                                "user_id": user_id,
                                "exam_type": exam_type.as_str(),
                                "error": err.to_string(),
                            }),
                        );
                    }
                    Err(StoreError::ContentUnavailable {
                        exam_type: exam_type.as_str().to_string(),
                    })
                }
            }
        })
        .await?
    }

    pub async fn get_exam_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ExamSessionRecord>, StoreError> {
        let path = self.path.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ExamSessionRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let raw = conn
                .query_row(
                    "SELECT id, user_id, exam_type, status, payload_json, answer_key_json,
                            score, sub_scores_json, ai_cost_usd_micros, created_at_ms, completed_at_ms
                     FROM exam_sessions WHERE id=?1",
                    rusqlite::params![session_id],
                    session_row,
                )
                .optional()?;
            raw.map(session_from_raw).transpose()
        })
        .await?
    }

    /// Completion is one conditional update: answers, results, score, and the
    /// status flip land together, and only the first submission can win.
    /// Returns `false` when the session was not in progress.
    pub async fn complete_exam_session(
        &self,
        session_id: &str,
        payload: serde_json::Value,
        score: f64,
        sub_scores: Option<serde_json::Value>,
        ai_cost_usd_micros: Option<u64>,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let session_id = session_id.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE exam_sessions
                 SET status=?2, payload_json=?3, score=?4, sub_scores_json=?5,
                     ai_cost_usd_micros=?6, completed_at_ms=?7
                 WHERE id=?1 AND status=?8",
                rusqlite::params![
                    session_id,
                    SessionStatus::Completed.as_str(),
                    serde_json::to_string(&payload)?,
                    score,
                    sub_scores.as_ref().map(serde_json::to_string).transpose()?,
                    ai_cost_usd_micros.map(u64_to_i64),
                    ts_ms,
                    SessionStatus::InProgress.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    /// Terminal failure mark for a session whose stored state can no longer be
    /// interpreted. Same conditional-update discipline as completion.
    pub async fn fail_exam_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE exam_sessions SET status=?2 WHERE id=?1 AND status=?3",
                rusqlite::params![
                    session_id,
                    SessionStatus::Failed.as_str(),
                    SessionStatus::InProgress.as_str()
                ],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    // ----- billing -----

    /// Applies a confirmed purchase exactly once per payment reference. The
    /// pre-insert lookup answers the common replay cheaply; the unique index
    /// settles races between concurrent deliveries of the same event.
    pub async fn apply_purchase(
        &self,
        user_id: &str,
        credits: i64,
        payment_ref: &str,
        reason: &str,
    ) -> Result<PurchaseOutcome, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let payment_ref = payment_ref.to_string();
        let reason = reason.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<PurchaseOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM ledger_entries WHERE kind=?1 AND external_ref=?2",
                    rusqlite::params![LedgerKind::Purchase.as_str(), payment_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(PurchaseOutcome::Replayed);
            }

            tx.execute(
                "INSERT OR IGNORE INTO users (id, credits, disabled, created_at_ms)
                 VALUES (?1, 0, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;

            let inserted = tx.execute(
                "INSERT INTO ledger_entries (user_id, amount, kind, external_ref, reason, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id,
                    credits,
                    LedgerKind::Purchase.as_str(),
                    payment_ref,
                    reason,
                    ts_ms
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Ok(PurchaseOutcome::Replayed);
                }
                Err(err) => return Err(err.into()),
            }
            let entry_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE users SET credits = credits + ?2 WHERE id=?1",
                rusqlite::params![user_id, credits],
            )?;
            tx.commit()?;
            Ok(PurchaseOutcome::Applied { entry_id })
        })
        .await?
    }

    /// Ledger half of a refund, run only after the external reversal
    /// confirmed. Revalidates everything inside the transaction so a racing
    /// second refund fails here even if it slipped past the caller's
    /// precheck.
    pub async fn apply_refund(
        &self,
        entry_id: i64,
        admin_id: &str,
        reversal_id: &str,
    ) -> Result<RefundApplied, StoreError> {
        let path = self.path.clone();
        let admin_id = admin_id.to_string();
        let reversal_id = reversal_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<RefundApplied, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let raw = tx
                .query_row(
                    "SELECT id, user_id, amount, kind, external_ref, reason, created_at_ms
                     FROM ledger_entries WHERE id=?1",
                    rusqlite::params![entry_id],
                    ledger_row,
                )
                .optional()?;
            let entry = raw.map(entry_from_raw).transpose()?.ok_or(StoreError::EntryNotFound)?;

            if entry.kind != LedgerKind::Purchase {
                return Err(StoreError::NotRefundable {
                    reason: "entry is not a purchase",
                });
            }
            let Some(external_ref) = entry.external_ref.clone() else {
                return Err(StoreError::NotRefundable {
                    reason: "purchase has no external payment reference",
                });
            };

            let refunded: Option<i64> = tx
                .query_row(
                    "SELECT id FROM ledger_entries WHERE kind=?1 AND external_ref=?2",
                    rusqlite::params![LedgerKind::Refund.as_str(), external_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if refunded.is_some() {
                return Err(StoreError::AlreadyRefunded);
            }

            tx.execute(
                "UPDATE users SET credits = credits - ?2 WHERE id=?1",
                rusqlite::params![entry.user_id, entry.amount],
            )?;
            let inserted = tx.execute(
                "INSERT INTO ledger_entries (user_id, amount, kind, external_ref, reason, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    entry.user_id,
                    -entry.amount,
                    LedgerKind::Refund.as_str(),
                    external_ref,
                    format!("refund of entry {entry_id}, reversal {reversal_id}"),
                    ts_ms
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::AlreadyRefunded);
                }
                Err(err) => return Err(err.into()),
            }

            // Annotation only; amount and kind of the original never change.
            tx.execute(
                "UPDATE ledger_entries SET reason=?2 WHERE id=?1",
                rusqlite::params![
                    entry_id,
                    format!(
                        "{} [refunded at {ts_ms} by {admin_id}, reversal {reversal_id}]",
                        entry.reason
                    )
                ],
            )?;
            append_audit(
                &tx,
                ts_ms,
                "refund",
                serde_json::json!({
                    "admin_id": admin_id,
                    "user_id": entry.user_id,
                    "entry_id": entry_id,
                    "external_ref": external_ref,
                    "reversal_id": reversal_id,
                    "amount": entry.amount,
                }),
            )?;
            tx.commit()?;
            Ok(RefundApplied {
                user_id: entry.user_id,
                amount: entry.amount,
            })
        })
        .await?
    }

    pub async fn apply_grant(
        &self,
        user_id: &str,
        credits: i64,
        reason: &str,
        admin_id: &str,
    ) -> Result<LedgerEntry, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let reason = reason.to_string();
        let admin_id = admin_id.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<LedgerEntry, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO users (id, credits, disabled, created_at_ms)
                 VALUES (?1, 0, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;
            tx.execute(
                "UPDATE users SET credits = credits + ?2 WHERE id=?1",
                rusqlite::params![user_id, credits],
            )?;
            tx.execute(
                "INSERT INTO ledger_entries (user_id, amount, kind, external_ref, reason, created_at_ms)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                rusqlite::params![user_id, credits, LedgerKind::Grant.as_str(), reason, ts_ms],
            )?;
            let entry_id = tx.last_insert_rowid();
            append_audit(
                &tx,
                ts_ms,
                "grant",
                serde_json::json!({
                    "admin_id": admin_id,
                    "user_id": user_id,
                    "credits": credits,
                    "reason": reason,
                }),
            )?;
            tx.commit()?;
            Ok(LedgerEntry {
                id: entry_id,
                user_id,
                amount: credits,
                kind: LedgerKind::Grant,
                external_ref: None,
                reason,
                created_at_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    // ----- content -----

    pub async fn upsert_content_item(
        &self,
        id: &str,
        exam_type: ExamType,
        part: u8,
        published: bool,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO content_items (id, exam_type, part, published, payload_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     exam_type=excluded.exam_type,
                     part=excluded.part,
                     published=excluded.published,
                     payload_json=excluded.payload_json",
                rusqlite::params![
                    id,
                    exam_type.as_str(),
                    part as i64,
                    published as i64,
                    serde_json::to_string(&payload)?,
                    ts_ms
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn set_content_published(
        &self,
        id: &str,
        published: bool,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE content_items SET published=?2 WHERE id=?1",
                rusqlite::params![id, published as i64],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    pub async fn list_content(
        &self,
        exam_type: Option<ExamType>,
    ) -> Result<Vec<ContentItemRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ContentItemRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut out = Vec::new();
            let mut push_row = |raw: RawContentRow| -> Result<(), StoreError> {
                out.push(content_from_raw(raw)?);
                Ok(())
            };
            if let Some(exam_type) = exam_type {
                let mut stmt = conn.prepare(
                    "SELECT id, exam_type, part, published, payload_json, created_at_ms
                     FROM content_items WHERE exam_type=?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(rusqlite::params![exam_type.as_str()], content_row)?;
                for row in rows {
                    push_row(row?)?;
                }
            } else {
                let mut stmt = conn.prepare(
                    "SELECT id, exam_type, part, published, payload_json, created_at_ms
                     FROM content_items ORDER BY id",
                )?;
                let rows = stmt.query_map([], content_row)?;
                for row in rows {
                    push_row(row?)?;
                }
            }
            Ok(out)
        })
        .await?
    }

    // ----- audit -----

    pub async fn append_audit_log(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let kind = kind.into();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            append_audit(&conn, ts_ms, &kind, payload)?;
            Ok(())
        })
        .await?
    }

    pub async fn list_audit_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<AuditLogRecord>, StoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<AuditLogRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut out = Vec::new();
            let mut push_row = |(id, ts_ms, kind, payload_json): (i64, i64, String, String)|
             -> Result<(), StoreError> {
                out.push(AuditLogRecord {
                    id,
                    ts_ms: i64_to_u64(ts_ms),
                    kind,
                    payload: serde_json::from_str(&payload_json)?,
                });
                Ok(())
            };
            if let Some(since) = since_ts_ms {
                let mut stmt = conn.prepare(
                    "SELECT id, ts_ms, kind, payload_json FROM audit_logs
                     WHERE ts_ms >= ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![u64_to_i64(since), limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                for row in rows {
                    push_row(row?)?;
                }
            } else {
                let mut stmt = conn.prepare(
                    "SELECT id, ts_ms, kind, payload_json FROM audit_logs
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                for row in rows {
                    push_row(row?)?;
                }
            }
            Ok(out)
        })
        .await?
    }
}

// ----- row mapping -----

type RawLedgerRow = (i64, String, i64, String, Option<String>, String, i64);

fn ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLedgerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn entry_from_raw(raw: RawLedgerRow) -> Result<LedgerEntry, StoreError> {
    let (id, user_id, amount, kind, external_ref, reason, created_at_ms) = raw;
    let kind = LedgerKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
        reason: format!("unknown ledger kind {kind:?} on entry {id}"),
    })?;
    Ok(LedgerEntry {
        id,
        user_id,
        amount,
        kind,
        external_ref,
        reason,
        created_at_ms: i64_to_u64(created_at_ms),
    })
}

type RawSessionRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<i64>,
    i64,
    Option<i64>,
);

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn session_from_raw(raw: RawSessionRow) -> Result<ExamSessionRecord, StoreError> {
    let (
        id,
        user_id,
        exam_type,
        status,
        payload_json,
        answer_key_json,
        score,
        sub_scores_json,
        ai_cost,
        created_at_ms,
        completed_at_ms,
    ) = raw;
    let exam_type = ExamType::parse(&exam_type).ok_or_else(|| StoreError::Corrupt {
        reason: format!("unknown exam type {exam_type:?} on session {id}"),
    })?;
    let status = SessionStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        reason: format!("unknown session status {status:?} on session {id}"),
    })?;
    Ok(ExamSessionRecord {
        id,
        user_id,
        exam_type,
        status,
        payload: serde_json::from_str(&payload_json)?,
        answer_key: answer_key_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        score,
        sub_scores: sub_scores_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        ai_cost_usd_micros: ai_cost.map(i64_to_u64),
        created_at_ms: i64_to_u64(created_at_ms),
        completed_at_ms: completed_at_ms.map(i64_to_u64),
    })
}

type RawContentRow = (String, String, i64, i64, String, i64);

fn content_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawContentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn content_from_raw(raw: RawContentRow) -> Result<ContentItemRecord, StoreError> {
    let (id, exam_type, part, published, payload_json, created_at_ms) = raw;
    let exam_type = ExamType::parse(&exam_type).ok_or_else(|| StoreError::Corrupt {
        reason: format!("unknown exam type {exam_type:?} on content item {id}"),
    })?;
    Ok(ContentItemRecord {
        id,
        exam_type,
        part: part.clamp(0, 3) as u8,
        published: published != 0,
        payload: serde_json::from_str(&payload_json)?,
        created_at_ms: i64_to_u64(created_at_ms),
    })
}

// ----- selection -----

/// Loads published, parseable candidates for one `(exam_type, part)` slot.
/// Rows whose payload fails to parse or is labeled with the wrong type are
/// skipped with a warning; they are authoring mistakes, not fatal errors.
fn load_candidates(
    tx: &rusqlite::Transaction<'_>,
    exam_type: ExamType,
    part: u8,
) -> Result<Vec<SelectedItem>, StoreError> {
    let mut stmt = tx.prepare(
        "SELECT id, payload_json FROM content_items
         WHERE exam_type=?1 AND part=?2 AND published=1
         ORDER BY id",
    )?;
    let rows = stmt.query_map(rusqlite::params![exam_type.as_str(), part as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (content_id, payload_json) = row?;
        match serde_json::from_str::<crate::exam::ContentPayload>(&payload_json) {
            Ok(payload) if payload.exam_type() == exam_type => out.push(SelectedItem {
                content_id,
                part,
                payload,
            }),
            Ok(_) => {
                tracing::warn!(content_id = %content_id, "content payload labeled with wrong exam type; skipped");
            }
            Err(err) => {
                tracing::warn!(content_id = %content_id, error = %err, "unparseable content payload; skipped");
            }
        }
    }
    Ok(out)
}

fn select_exam_content(
    tx: &rusqlite::Transaction<'_>,
    exam_type: ExamType,
) -> Result<Option<(ExamContent, Option<serde_json::Value>)>, StoreError> {
    let mut picks = Vec::new();
    for part in exam_type.part_range() {
        let candidates = load_candidates(tx, exam_type, part)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let index = random_index(candidates.len());
        picks.push(candidates[index].clone());
    }
    Ok(exam::assemble_content(exam_type, &picks))
}

fn restore_credit(
    conn: &mut rusqlite::Connection,
    user_id: &str,
    exam_type: ExamType,
    ts_ms: i64,
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE users SET credits = credits + 1 WHERE id=?1",
        rusqlite::params![user_id],
    )?;
    tx.execute(
        "INSERT INTO ledger_entries (user_id, amount, kind, external_ref, reason, created_at_ms)
         VALUES (?1, 1, ?2, NULL, ?3, ?4)",
        rusqlite::params![
            user_id,
            LedgerKind::UsageFail.as_str(),
            format!("content unavailable for {exam_type}; credit restored"),
            ts_ms
        ],
    )?;
    tx.commit()
}

fn append_audit(
    conn: &rusqlite::Connection,
    ts_ms: i64,
    kind: &str,
    payload: serde_json::Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit_logs (ts_ms, kind, payload_json) VALUES (?1, ?2, ?3)",
        rusqlite::params![ts_ms, kind, serde_json::to_string(&payload)?],
    )?;
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL,
            credits INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            kind TEXT NOT NULL,
            external_ref TEXT,
            reason TEXT NOT NULL DEFAULT '',
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_entries_user_id
            ON ledger_entries(user_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_kind_external_ref
            ON ledger_entries(kind, external_ref) WHERE external_ref IS NOT NULL;

        CREATE TABLE IF NOT EXISTS exam_sessions (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            status TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            answer_key_json TEXT,
            score REAL,
            sub_scores_json TEXT,
            ai_cost_usd_micros INTEGER,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_exam_sessions_user_id
            ON exam_sessions(user_id);

        CREATE TABLE IF NOT EXISTS content_items (
            id TEXT PRIMARY KEY NOT NULL,
            exam_type TEXT NOT NULL,
            part INTEGER NOT NULL DEFAULT 0,
            published INTEGER NOT NULL DEFAULT 0,
            payload_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_content_items_type_published
            ON content_items(exam_type, published);

        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_ts_ms
            ON audit_logs(ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn random_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let mut buf = [0u8; 8];
    if getrandom::fill(&mut buf).is_err() {
        return 0;
    }
    (u64::from_le_bytes(buf) % len as u64) as usize
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let store = SqliteStore::new(dir.path().join("lexam.sqlite"));
        store.init().await.expect("init");
        store
    }

    fn reading_payload() -> serde_json::Value {
        json!({
            "format": "reading",
            "title": "Tides",
            "passage": "The tide rises, the tide falls.",
            "questions": [
                {"id": "q1", "prompt": "one", "answer": "alpha"},
                {"id": "q2", "prompt": "two", "answer": ["paris", "france"]},
                {"id": "q3", "prompt": "three", "answer": true},
                {"id": "q4", "prompt": "four", "answer": "delta"}
            ]
        })
    }

    async fn seed_funded_user(store: &SqliteStore, user_id: &str, credits: i64) {
        store.ensure_user(user_id).await.expect("user");
        store
            .apply_grant(user_id, credits, "seed", "admin-1")
            .await
            .expect("grant");
    }

    #[tokio::test]
    async fn balance_always_equals_ledger_sum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        seed_funded_user(&store, "u1", 3).await;
        store
            .apply_purchase("u1", 5, "pi_sum", "pack five")
            .await
            .expect("purchase");
        store
            .upsert_content_item("c1", ExamType::Reading, 0, true, reading_payload())
            .await
            .expect("content");
        store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await
            .expect("start");

        let cached = store.balance_of("u1").await.expect("balance");
        let recomputed = store.recompute_balance("u1").await.expect("sum");
        assert_eq!(cached, recomputed);
        assert_eq!(cached, 3 + 5 - 1);
    }

    #[tokio::test]
    async fn start_deducts_and_creates_in_progress_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 1).await;
        store
            .upsert_content_item("c1", ExamType::Reading, 0, true, reading_payload())
            .await
            .expect("content");

        let started = store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await
            .expect("start");
        assert_eq!(started.balance_after, 0);
        assert!(started.answer_key.is_some());

        let session = store
            .get_exam_session("exam-1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.user_id, "u1");
        // The embedded content never carries answer keys.
        assert!(!session.payload["content"].to_string().contains("alpha"));
    }

    #[tokio::test]
    async fn start_with_zero_balance_is_rejected_without_ledger_noise() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.ensure_user("u1").await.expect("user");
        store
            .upsert_content_item("c1", ExamType::Reading, 0, true, reading_payload())
            .await
            .expect("content");

        let err = store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientFunds { balance: 0 })
        ));
        assert!(store
            .ledger_entries_for_user("u1", 10)
            .await
            .expect("ledger")
            .is_empty());
    }

    #[tokio::test]
    async fn content_unavailable_restores_credit_as_entry_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 2).await;

        let err = store
            .start_exam_session("u1", ExamType::Listening, "exam-1")
            .await;
        assert!(matches!(err, Err(StoreError::ContentUnavailable { .. })));

        assert_eq!(store.balance_of("u1").await.expect("balance"), 2);
        assert_eq!(store.recompute_balance("u1").await.expect("sum"), 2);

        let entries = store
            .ledger_entries_for_user("u1", 10)
            .await
            .expect("ledger");
        let kinds: Vec<LedgerKind> = entries.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![LedgerKind::UsageFail, LedgerKind::Usage, LedgerKind::Grant]
        );
        assert!(store.get_exam_session("exam-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn speaking_needs_all_three_parts_published() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 5).await;

        for part in [1u8, 2] {
            store
                .upsert_content_item(
                    &format!("s{part}"),
                    ExamType::Speaking,
                    part,
                    true,
                    json!({"format": "speaking", "prompt": format!("part {part}")}),
                )
                .await
                .expect("content");
        }

        let err = store
            .start_exam_session("u1", ExamType::Speaking, "exam-1")
            .await;
        assert!(matches!(err, Err(StoreError::ContentUnavailable { .. })));

        store
            .upsert_content_item(
                "s3",
                ExamType::Speaking,
                3,
                true,
                json!({"format": "speaking", "prompt": "part 3"}),
            )
            .await
            .expect("content");

        let started = store
            .start_exam_session("u1", ExamType::Speaking, "exam-2")
            .await
            .expect("start");
        assert!(started.answer_key.is_none());
        match started.content {
            ExamContent::Speaking { parts } => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[2].prompt, "part 3");
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_account_cannot_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 1).await;
        store
            .upsert_content_item("c1", ExamType::Reading, 0, true, reading_payload())
            .await
            .expect("content");
        assert!(store.set_user_disabled("u1", true).await.expect("toggle"));

        let err = store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await;
        assert!(matches!(err, Err(StoreError::AccountDisabled)));
        assert_eq!(store.balance_of("u1").await.expect("balance"), 1);
    }

    #[tokio::test]
    async fn purchase_applies_once_per_payment_ref() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.ensure_user("u1").await.expect("user");

        let first = store
            .apply_purchase("u1", 5, "pi_abc", "pack five")
            .await
            .expect("first");
        assert!(matches!(first, PurchaseOutcome::Applied { .. }));

        let second = store
            .apply_purchase("u1", 5, "pi_abc", "pack five")
            .await
            .expect("second");
        assert_eq!(second, PurchaseOutcome::Replayed);

        assert_eq!(store.balance_of("u1").await.expect("balance"), 5);
        assert_eq!(
            store
                .ledger_entries_for_user("u1", 10)
                .await
                .expect("ledger")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn refund_applies_once_and_annotates_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.ensure_user("u1").await.expect("user");
        let PurchaseOutcome::Applied { entry_id } = store
            .apply_purchase("u1", 5, "pi_xyz", "pack five")
            .await
            .expect("purchase")
        else {
            panic!("expected applied");
        };

        let applied = store
            .apply_refund(entry_id, "admin-1", "rev_1")
            .await
            .expect("refund");
        assert_eq!(applied.amount, 5);
        assert_eq!(store.balance_of("u1").await.expect("balance"), 0);
        assert_eq!(store.recompute_balance("u1").await.expect("sum"), 0);

        let again = store.apply_refund(entry_id, "admin-1", "rev_2").await;
        assert!(matches!(again, Err(StoreError::AlreadyRefunded)));
        assert_eq!(store.balance_of("u1").await.expect("balance"), 0);

        let original = store
            .find_ledger_entry(entry_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(original.kind, LedgerKind::Purchase);
        assert_eq!(original.amount, 5);
        assert!(original.reason.contains("refunded"));

        let refund = store
            .find_by_external_ref("pi_xyz", LedgerKind::Refund)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(refund.amount, -5);
    }

    #[tokio::test]
    async fn refund_rejects_non_purchase_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let grant = store
            .apply_grant("u1", 3, "welcome", "admin-1")
            .await
            .expect("grant");

        let err = store.apply_refund(grant.id, "admin-1", "rev_1").await;
        assert!(matches!(err, Err(StoreError::NotRefundable { .. })));
        let err = store.apply_refund(9999, "admin-1", "rev_1").await;
        assert!(matches!(err, Err(StoreError::EntryNotFound)));
    }

    #[tokio::test]
    async fn complete_is_first_writer_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 1).await;
        store
            .upsert_content_item("c1", ExamType::Reading, 0, true, reading_payload())
            .await
            .expect("content");
        store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await
            .expect("start");

        let first = store
            .complete_exam_session("exam-1", json!({"answers": {}}), 7.5, None, None)
            .await
            .expect("first");
        assert!(first);

        let second = store
            .complete_exam_session("exam-1", json!({"answers": {"q1": "late"}}), 4.0, None, None)
            .await
            .expect("second");
        assert!(!second);

        let session = store
            .get_exam_session("exam-1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(session.score, Some(7.5));
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn unpublished_and_broken_content_is_never_selected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        seed_funded_user(&store, "u1", 1).await;

        store
            .upsert_content_item("draft", ExamType::Reading, 0, false, reading_payload())
            .await
            .expect("content");
        store
            .upsert_content_item(
                "broken",
                ExamType::Reading,
                0,
                true,
                json!({"format": "listening", "title": "x", "audio_url": "u", "questions": []}),
            )
            .await
            .expect("content");

        let err = store
            .start_exam_session("u1", ExamType::Reading, "exam-1")
            .await;
        assert!(matches!(err, Err(StoreError::ContentUnavailable { .. })));
        assert_eq!(store.balance_of("u1").await.expect("balance"), 1);
    }
}
