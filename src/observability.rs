use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub exams_started: u64,
    pub exams_completed: u64,
    pub insufficient_funds: u64,
    pub content_compensations: u64,
    pub rate_limited: u64,
    pub purchases_applied: u64,
    pub purchase_replays: u64,
    pub refunds: u64,
    pub grading_fallbacks: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    snapshot: ObservabilitySnapshot,
}

impl Observability {
    pub fn record_exam_started(&mut self) {
        self.snapshot.exams_started = self.snapshot.exams_started.saturating_add(1);
    }

    pub fn record_exam_completed(&mut self) {
        self.snapshot.exams_completed = self.snapshot.exams_completed.saturating_add(1);
    }

    pub fn record_insufficient_funds(&mut self) {
        self.snapshot.insufficient_funds = self.snapshot.insufficient_funds.saturating_add(1);
    }

    pub fn record_content_compensation(&mut self) {
        self.snapshot.content_compensations =
            self.snapshot.content_compensations.saturating_add(1);
    }

    pub fn record_rate_limited(&mut self) {
        self.snapshot.rate_limited = self.snapshot.rate_limited.saturating_add(1);
    }

    pub fn record_purchase_applied(&mut self) {
        self.snapshot.purchases_applied = self.snapshot.purchases_applied.saturating_add(1);
    }

    pub fn record_purchase_replay(&mut self) {
        self.snapshot.purchase_replays = self.snapshot.purchase_replays.saturating_add(1);
    }

    pub fn record_refund(&mut self) {
        self.snapshot.refunds = self.snapshot.refunds.saturating_add(1);
    }

    pub fn record_grading_fallback(&mut self) {
        self.snapshot.grading_fallbacks = self.snapshot.grading_fallbacks.saturating_add(1);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        self.snapshot.clone()
    }
}
