//! Credit billing: checkout pass-through, webhook reconciliation, admin
//! refunds, and credit grants.
//!
//! Reconciliation applies exactly one credit grant per payment reference no
//! matter how many times the processor delivers the event. The pre-insert
//! lookup answers the common replay cheaply; the store's unique index settles
//! races. Refunds call the processor's reversal first and touch the ledger
//! only after it confirms, so a failed external call leaves nothing to undo.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::PackConfig;
use crate::error::{LexamError, Result};
use crate::payments::{CheckoutSession, PaymentProcessor};
use crate::sqlite_store::{PurchaseOutcome, SqliteStore};
use crate::store_types::{LedgerEntry, LedgerKind};

#[derive(Clone)]
pub struct BillingService {
    store: SqliteStore,
    processor: Arc<dyn PaymentProcessor>,
    packs: Vec<PackConfig>,
}

/// What happened to one webhook delivery. `Ignored` is a success from the
/// processor's point of view (HTTP 200) so it stops redelivering events we
/// will never be able to apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied { credits: i64 },
    Replayed,
    Ignored { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundReceipt {
    pub entry_id: i64,
    pub user_id: String,
    pub amount: i64,
    pub reversal_id: String,
}

impl BillingService {
    pub fn new(
        store: SqliteStore,
        processor: Arc<dyn PaymentProcessor>,
        packs: Vec<PackConfig>,
    ) -> Self {
        Self {
            store,
            processor,
            packs,
        }
    }

    pub fn packs(&self) -> &[PackConfig] {
        &self.packs
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn pack(&self, pack_id: &str) -> Option<&PackConfig> {
        self.packs.iter().find(|pack| pack.id == pack_id)
    }

    /// Pass-through to the processor's hosted payment page. No ledger effect;
    /// credits arrive later through the webhook.
    pub async fn checkout(&self, user_id: &str, pack_id: &str) -> Result<CheckoutSession> {
        let pack = self
            .pack(pack_id)
            .ok_or(LexamError::NotFound { what: "credit pack" })?;
        self.store.ensure_user(user_id).await?;
        let session = self.processor.create_checkout_session(user_id, pack).await?;
        tracing::info!(user_id = %user_id, pack_id = %pack_id, "checkout session created");
        Ok(session)
    }

    /// Applies one payment-confirmation event. Malformed events and unknown
    /// packs are dropped with a warning, not retried: they are
    /// misconfiguration, never transient.
    #[tracing::instrument(skip(self, event))]
    pub async fn reconcile(&self, event: &Value) -> Result<ReconcileOutcome> {
        let Some((user_id, pack_id, payment_ref)) = parse_event(event) else {
            tracing::warn!("webhook event missing user_id, pack_id, or payment_ref; dropped");
            return Ok(ReconcileOutcome::Ignored {
                reason: "malformed event".to_string(),
            });
        };

        if let Some(existing) = self
            .store
            .find_by_external_ref(&payment_ref, LedgerKind::Purchase)
            .await?
        {
            tracing::info!(
                payment_ref = %payment_ref,
                entry_id = existing.id,
                "purchase already applied; replay ignored"
            );
            return Ok(ReconcileOutcome::Replayed);
        }

        let Some(pack) = self.pack(&pack_id) else {
            tracing::warn!(pack_id = %pack_id, payment_ref = %payment_ref, "unknown pack id; dropped");
            return Ok(ReconcileOutcome::Ignored {
                reason: format!("unknown pack: {pack_id}"),
            });
        };

        let outcome = self
            .store
            .apply_purchase(
                &user_id,
                pack.credits,
                &payment_ref,
                &format!("pack {pack_id} purchase"),
            )
            .await?;

        match outcome {
            PurchaseOutcome::Applied { entry_id } => {
                tracing::info!(
                    user_id = %user_id,
                    payment_ref = %payment_ref,
                    credits = pack.credits,
                    entry_id,
                    "purchase applied"
                );
                Ok(ReconcileOutcome::Applied {
                    credits: pack.credits,
                })
            }
            PurchaseOutcome::Replayed => Ok(ReconcileOutcome::Replayed),
        }
    }

    /// Admin reversal of one prior purchase, once. The external call comes
    /// first: if it fails, the ledger is untouched and the operation is
    /// safely retryable.
    #[tracing::instrument(skip(self), fields(admin_id = %admin_id, entry_id))]
    pub async fn refund(&self, admin_id: &str, entry_id: i64) -> Result<RefundReceipt> {
        let entry = self
            .store
            .find_ledger_entry(entry_id)
            .await?
            .ok_or(LexamError::NotFound { what: "ledger entry" })?;
        if entry.kind != LedgerKind::Purchase {
            return Err(LexamError::InvalidState {
                reason: "entry is not a purchase".to_string(),
            });
        }
        let Some(payment_ref) = entry.external_ref.clone() else {
            return Err(LexamError::InvalidState {
                reason: "purchase has no external payment reference".to_string(),
            });
        };
        if self
            .store
            .find_by_external_ref(&payment_ref, LedgerKind::Refund)
            .await?
            .is_some()
        {
            return Err(LexamError::AlreadyRefunded);
        }

        let reversal_id = self.processor.reverse_charge(&payment_ref).await?;

        // Ledger half only after the processor confirmed. The store
        // revalidates under its own transaction, so a racing second refund
        // still cannot apply twice.
        let applied = self
            .store
            .apply_refund(entry_id, admin_id, &reversal_id)
            .await?;
        tracing::info!(
            admin_id = %admin_id,
            user_id = %applied.user_id,
            entry_id,
            reversal_id = %reversal_id,
            amount = applied.amount,
            "refund applied"
        );
        Ok(RefundReceipt {
            entry_id,
            user_id: applied.user_id,
            amount: applied.amount,
            reversal_id,
        })
    }

    pub async fn grant(
        &self,
        admin_id: &str,
        user_id: &str,
        credits: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        if credits < 1 {
            return Err(LexamError::InvalidRequest {
                reason: "grant must add at least one credit".to_string(),
            });
        }
        let entry = self
            .store
            .apply_grant(user_id, credits, reason, admin_id)
            .await?;
        tracing::info!(admin_id = %admin_id, user_id = %user_id, credits, "credits granted");
        Ok(entry)
    }
}

/// Pulls `{user_id, pack_id, payment_ref}` out of an event. The processor
/// nests business fields under `metadata` and may wrap the whole thing in a
/// `data` envelope depending on the event version; both layouts are accepted.
fn parse_event(event: &Value) -> Option<(String, String, String)> {
    let body = event.get("data").unwrap_or(event);
    let payment_ref = non_empty(body.get("payment_ref")?)?;
    let metadata = body.get("metadata")?;
    let user_id = non_empty(metadata.get("user_id")?)?;
    let pack_id = non_empty(metadata.get("pack_id")?)?;
    Some((user_id, pack_id, payment_ref))
}

fn non_empty(value: &Value) -> Option<String> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
