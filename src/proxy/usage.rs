use futures::future::BoxFuture;
use tracing::info;

// Captured once per completed request and recorded off the hot path.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: i64,
    pub account_id: i64,
    pub model: String,
    pub stream: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub first_token_ms: Option<u64>,
    pub switch_count: usize,
    pub user_agent: String,
}

// Billing and analytics live elsewhere; the gateway only hands them the
// record. The default sink writes a structured log line.
pub trait UsageRecorder: Send + Sync {
    fn record<'a>(&'a self, record: UsageRecord) -> BoxFuture<'a, Result<(), String>>;
}

#[derive(Default)]
pub struct LogUsageRecorder;

impl UsageRecorder for LogUsageRecorder {
    fn record<'a>(&'a self, record: UsageRecord) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            info!(
                user_id = record.user_id,
                account_id = record.account_id,
                model = %record.model,
                stream = record.stream,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                first_token_ms = record.first_token_ms,
                switch_count = record.switch_count,
                user_agent = %record.user_agent,
                "usage_recorded"
            );
            Ok(())
        })
    }
}
