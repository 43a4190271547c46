use std::sync::Arc;

use crate::models::AppConfig;
use crate::modules::persistence::AccountStore;
use crate::proxy::concurrency::ConcurrencyArbiter;
use crate::proxy::forwarder::UpstreamForwarder;
use crate::proxy::passthrough::ErrorPassthrough;
use crate::proxy::selection::AccountSelector;
use crate::proxy::usage::UsageRecorder;

// Axum application state: the service graph behind the gateway surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub accounts: Arc<AccountStore>,
    pub arbiter: Arc<ConcurrencyArbiter>,
    pub selector: Arc<AccountSelector>,
    pub forwarder: Arc<UpstreamForwarder>,
    pub passthrough: Arc<ErrorPassthrough>,
    pub usage: Arc<dyn UsageRecorder>,
}
