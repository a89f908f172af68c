pub mod billing;
pub mod config;
mod error;
pub mod exam;
pub mod grading;
#[cfg(feature = "server")]
pub mod http;
pub mod limits;
pub mod observability;
pub mod payments;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod scoring;
pub mod session;
pub mod sqlite_store;
pub mod store_types;

pub use error::{LexamError, Result};

pub use billing::{BillingService, ReconcileOutcome, RefundReceipt};
pub use config::{ApiKeyConfig, AppConfig, GradingConfig, PackConfig, PaymentConfig};
pub use exam::{ContentPayload, ExamContent, ExamType};
pub use grading::{Grader, GradingError, GradingOutcome, GradingTask, HttpGrader};
pub use limits::{ActionLimitsConfig, RateLimiter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use payments::{CheckoutSession, HttpPaymentClient, PaymentError, PaymentProcessor};
pub use session::{ExamService, StartedExam, SubmitResult};
pub use sqlite_store::{PurchaseOutcome, SqliteStore, StoreError};
pub use store_types::{
    AuditLogRecord, ContentItemRecord, ExamSessionRecord, LedgerEntry, LedgerKind, SessionStatus,
    UserRecord,
};

#[cfg(feature = "server")]
pub use http::AppState;
#[cfg(feature = "store-redis")]
pub use redis_store::RedisLimitStore;
