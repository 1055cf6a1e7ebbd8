mod evaluator;
mod postgres;
mod sink;
mod store;
mod types;

pub use evaluator::RiskEvaluator;
pub use postgres::PgAlertStore;
pub use sink::{AlertSink, TracingAlertSink, WebhookAlertSink};
pub use store::{AlertStore, MemoryAlertStore};
pub use types::{
    Alert, AlertCategory, AlertDecision, AlertSeverity, AlertStatus, DataGap, Feedback,
    FeedbackKind,
};
