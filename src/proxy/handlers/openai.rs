use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::HeaderMap,
    response::Response,
    Extension,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::models::Subject;
use crate::proxy::concurrency::{
    account_slot_key, calculate_max_wait, user_slot_key, PingSender, SlotGuard,
};
use crate::proxy::forwarder::{
    ForwardError, ForwardPayload, UpstreamFailoverError, UsageTotals,
};
use crate::proxy::handlers::errors::{
    build_body_too_large_message, error_response, extract_upstream_error_message,
    map_upstream_error, sse_error_frame,
};
use crate::proxy::handlers::validation::{validate_responses_request, RequestMeta};
use crate::proxy::selection::SelectError;
use crate::proxy::session_hash::derive_session_hash;
use crate::proxy::state::AppState;
use crate::proxy::usage::UsageRecord;

const USER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const USAGE_RECORD_TIMEOUT: Duration = Duration::from_secs(10);

// One message from the orchestration task to the client connection. The
// first message decides the HTTP response; after StreamStart everything is
// SSE frames on an already-committed 200.
#[derive(Debug)]
enum Event {
    Error {
        status: u16,
        err_type: String,
        message: String,
    },
    Json {
        status: u16,
        body: Vec<u8>,
    },
    StreamStart,
    Chunk(Bytes),
    StreamError {
        err_type: String,
        message: String,
    },
}

// The client side of the orchestration: owns the stream-started latch.
// Once committed, errors can only appear as SSE error frames.
struct ClientSink {
    tx: mpsc::Sender<Event>,
    committed: AtomicBool,
}

impl ClientSink {
    fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            committed: AtomicBool::new(false),
        }
    }

    fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    async fn stream_start(&self) -> bool {
        if self.committed.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.tx.send(Event::StreamStart).await.is_ok()
    }

    async fn chunk(&self, bytes: Bytes) -> bool {
        self.tx.send(Event::Chunk(bytes)).await.is_ok()
    }

    async fn error(&self, status: u16, err_type: &str, message: &str) {
        let event = if self.committed() {
            Event::StreamError {
                err_type: err_type.to_string(),
                message: message.to_string(),
            }
        } else {
            Event::Error {
                status,
                err_type: err_type.to_string(),
                message: message.to_string(),
            }
        };
        let _ = self.tx.send(event).await;
    }

    async fn json(&self, status: u16, body: Vec<u8>) {
        if self.committed() {
            let message = extract_upstream_error_message(&body)
                .unwrap_or_else(|| "Upstream request failed".to_string());
            let _ = self
                .tx
                .send(Event::StreamError {
                    err_type: "upstream_error".to_string(),
                    message,
                })
                .await;
            return;
        }
        let _ = self.tx.send(Event::Json { status, body }).await;
    }
}

// POST /openai/v1/responses
pub async fn responses(
    State(state): State<AppState>,
    Extension(subject): Extension<Subject>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let limit = state.config.proxy.request_body_max_bytes;
    if body.len() > limit {
        return error_response(
            413,
            "invalid_request_error",
            &build_body_too_large_message(limit),
        );
    }
    let meta = match validate_responses_request(&body) {
        Ok(meta) => meta,
        Err(e) => return error_response(e.status, e.err_type, &e.message),
    };

    let (tx, mut rx) = mpsc::channel::<Event>(32);
    let sink = Arc::new(ClientSink::new(tx));
    let cancel = CancellationToken::new();
    {
        // Client disconnect tears down every wait in the orchestration. The
        // watcher must drop its sender clone once orchestration completes,
        // or the event channel would never close.
        let watch_tx = sink.tx.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_tx.closed() => watch_cancel.cancel(),
                _ = watch_cancel.cancelled() => {}
            }
        });
    }

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    {
        let state = state.clone();
        let headers = headers.clone();
        let body = body.to_vec();
        let meta = meta.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            orchestrate(state, subject, headers, body, meta, user_agent, sink, cancel).await;
        });
    }
    drop(sink);

    match rx.recv().await {
        None => error_response(502, "upstream_error", "Upstream request failed"),
        Some(Event::Error {
            status,
            err_type,
            message,
        }) => error_response(status, &err_type, &message),
        Some(Event::Json { status, body }) => json_passthrough_response(status, body),
        Some(Event::StreamStart) => sse_response(rx),
        Some(other) => {
            error!("[E-GATEWAY-PROTOCOL] unexpected_first_event: {:?}", other);
            error_response(502, "upstream_error", "Upstream request failed")
        }
    }
}

fn json_passthrough_response(status: u16, body: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| error_response(502, "upstream_error", "Upstream request failed"))
}

fn sse_response(rx: mpsc::Receiver<Event>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some(Event::Chunk(bytes)) => Some((Ok::<Bytes, std::convert::Infallible>(bytes), rx)),
            Some(Event::StreamError { err_type, message }) => Some((
                Ok(Bytes::from(sse_error_frame(&err_type, &message))),
                rx,
            )),
            Some(_) => Some((Ok(Bytes::new()), rx)),
            None => None,
        }
    });
    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| error_response(502, "upstream_error", "Upstream request failed"))
}

// Pings emitted inside slot waits commit the stream, exactly like any
// other first byte.
fn spawn_ping_forwarder(sink: Arc<ClientSink>) -> PingSender {
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        while let Some(Ok(chunk)) = rx.recv().await {
            if !sink.stream_start().await {
                break;
            }
            if !sink.chunk(chunk).await {
                break;
            }
        }
    });
    tx
}

#[allow(clippy::too_many_arguments)]
async fn orchestrate(
    state: AppState,
    subject: Subject,
    headers: HeaderMap,
    body: Vec<u8>,
    meta: RequestMeta,
    user_agent: String,
    sink: Arc<ClientSink>,
    cancel: CancellationToken,
) {
    // Cancelling on every exit path releases the disconnect watcher and,
    // with it, the last sender keeping the client channel open.
    let _done = cancel.clone().drop_guard();

    // User slot: fast path first, wait queue only on a miss.
    let user_key = user_slot_key(subject.user_id);
    let _user_guard: SlotGuard = match state.arbiter.try_acquire_slot(&user_key, subject.concurrency)
    {
        Err(e) => {
            warn!("user_slot_acquire_failed user_id={}: {}", subject.user_id, e);
            sink.error(
                429,
                "rate_limit_error",
                "Concurrency limit exceeded for user, please retry later",
            )
            .await;
            return;
        }
        Ok(Some(guard)) => guard,
        Ok(None) => {
            let max_wait = calculate_max_wait(subject.concurrency);
            let mut wait_counted = false;
            match state.arbiter.increment_wait_count(&user_key, max_wait) {
                Err(e) => {
                    // Degraded wait accounting keeps the request alive.
                    warn!("user_wait_counter_increment_failed: {}", e);
                }
                Ok(false) => {
                    sink.error(
                        429,
                        "rate_limit_error",
                        "Too many pending requests, please retry later",
                    )
                    .await;
                    return;
                }
                Ok(true) => wait_counted = true,
            }

            let ping = meta.stream.then(|| spawn_ping_forwarder(sink.clone()));
            let result = state
                .arbiter
                .acquire_slot_with_wait(
                    &user_key,
                    subject.concurrency,
                    USER_WAIT_TIMEOUT,
                    &cancel,
                    ping.as_ref(),
                )
                .await;
            if wait_counted {
                state.arbiter.decrement_wait_count(&user_key);
            }
            match result {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(
                        "user_slot_acquire_failed_after_wait user_id={}: {}",
                        subject.user_id, e
                    );
                    sink.error(
                        429,
                        "rate_limit_error",
                        "Concurrency limit exceeded for user, please retry later",
                    )
                    .await;
                    return;
                }
            }
        }
    };

    let session_hash = derive_session_hash(&headers, &body);
    let max_switches = state.config.gateway.max_account_switches;
    let mut excluded: HashSet<i64> = HashSet::new();
    let mut switch_count = 0usize;
    let mut last_failover: Option<UpstreamFailoverError> = None;

    loop {
        debug!(
            "account_selecting model={} excluded={}",
            meta.model,
            excluded.len()
        );
        let selection = match state.selector.select(
            subject.group_id,
            &session_hash,
            &meta.model,
            &excluded,
        ) {
            Ok(selection) => selection,
            Err(e) => {
                warn!(
                    "account_select_failed model={} excluded={}: {}",
                    meta.model,
                    excluded.len(),
                    e
                );
                if matches!(e, SelectError::Infra(_)) {
                    // Counter infrastructure down: deny, never admit.
                    sink.error(
                        429,
                        "rate_limit_error",
                        "Concurrency limit exceeded for account, please retry later",
                    )
                    .await;
                } else if excluded.is_empty() {
                    sink.error(503, "api_error", "Service temporarily unavailable").await;
                } else if let Some(failover) = &last_failover {
                    handle_failover_exhausted(&state, &sink, failover).await;
                } else {
                    let (status, err_type, message) = map_upstream_error(502);
                    sink.error(status, err_type, message).await;
                }
                return;
            }
        };
        let mut account = selection.account;
        let account_key = account_slot_key(account.id);
        debug!("account_selected account_id={} name={}", account.id, account.name);

        let account_guard: SlotGuard = match selection.guard {
            Some(guard) => guard,
            None => {
                let plan = match selection.wait_plan {
                    Some(plan) => plan,
                    None => {
                        sink.error(503, "api_error", "No available accounts").await;
                        return;
                    }
                };
                // One more fast attempt before paying for wait bookkeeping.
                match state
                    .arbiter
                    .try_acquire_slot(&account_key, plan.max_concurrency)
                {
                    Err(e) => {
                        warn!("account_slot_quick_acquire_failed account_id={}: {}", account.id, e);
                        sink.error(
                            429,
                            "rate_limit_error",
                            "Concurrency limit exceeded for account, please retry later",
                        )
                        .await;
                        return;
                    }
                    Ok(Some(guard)) => {
                        state
                            .selector
                            .bind_sticky_session(subject.group_id, &session_hash, account.id);
                        guard
                    }
                    Ok(None) => {
                        let mut wait_counted = false;
                        match state.arbiter.increment_wait_count(&account_key, plan.max_waiting) {
                            Err(e) => {
                                warn!(
                                    "account_wait_counter_increment_failed account_id={}: {}",
                                    account.id, e
                                );
                            }
                            Ok(false) => {
                                sink.error(
                                    429,
                                    "rate_limit_error",
                                    "Too many pending requests, please retry later",
                                )
                                .await;
                                return;
                            }
                            Ok(true) => wait_counted = true,
                        }

                        let ping = meta.stream.then(|| spawn_ping_forwarder(sink.clone()));
                        let result = state
                            .arbiter
                            .acquire_slot_with_wait(
                                &account_key,
                                plan.max_concurrency,
                                plan.timeout,
                                &cancel,
                                ping.as_ref(),
                            )
                            .await;
                        if wait_counted {
                            state.arbiter.decrement_wait_count(&account_key);
                        }
                        match result {
                            Ok(guard) => {
                                state.selector.bind_sticky_session(
                                    subject.group_id,
                                    &session_hash,
                                    account.id,
                                );
                                guard
                            }
                            Err(e) => {
                                warn!(
                                    "account_slot_acquire_failed account_id={}: {}",
                                    account.id, e
                                );
                                sink.error(
                                    429,
                                    "rate_limit_error",
                                    "Concurrency limit exceeded for account, please retry later",
                                )
                                .await;
                                return;
                            }
                        }
                    }
                }
            }
        };

        let forward_start = Instant::now();
        let result = state
            .forwarder
            .forward(&mut account, &headers, &body, &meta.model, meta.stream)
            .await;

        match result {
            Ok(success) => match success.payload {
                ForwardPayload::Json {
                    body: response_body,
                    usage,
                } => {
                    account_guard.release();
                    sink.json(success.status, response_body).await;
                    record_usage(
                        &state,
                        &subject,
                        account.id,
                        &meta,
                        usage,
                        None,
                        switch_count,
                        &user_agent,
                    );
                    return;
                }
                ForwardPayload::Stream(mut upstream) => {
                    if !sink.stream_start().await {
                        account_guard.release();
                        return;
                    }
                    let mut first_token_ms: Option<u64> = None;
                    while let Some(item) = upstream.next().await {
                        match item {
                            Ok(chunk) => {
                                if chunk.is_empty() {
                                    continue;
                                }
                                if first_token_ms.is_none() {
                                    first_token_ms =
                                        Some(forward_start.elapsed().as_millis() as u64);
                                }
                                if !sink.chunk(chunk).await {
                                    debug!("client_disconnected_mid_stream account_id={}", account.id);
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("upstream_stream_error account_id={}: {}", account.id, e);
                                sink.error(
                                    502,
                                    "upstream_error",
                                    "Stream transmission error, please retry later",
                                )
                                .await;
                                break;
                            }
                        }
                    }
                    account_guard.release();
                    record_usage(
                        &state,
                        &subject,
                        account.id,
                        &meta,
                        None,
                        first_token_ms,
                        switch_count,
                        &user_agent,
                    );
                    return;
                }
            },
            Err(ForwardError::Failover(failover)) => {
                account_guard.release();
                excluded.insert(account.id);
                let exhausted = switch_count >= max_switches;
                warn!(
                    "upstream_failover account_id={} upstream_status={} switch_count={} max_switches={} exhausted={}",
                    account.id, failover.status_code, switch_count, max_switches, exhausted
                );
                if exhausted {
                    handle_failover_exhausted(&state, &sink, &failover).await;
                    return;
                }
                last_failover = Some(failover);
                switch_count += 1;
                continue;
            }
            Err(ForwardError::ClientError {
                status,
                body: err_body,
                ..
            }) => {
                account_guard.release();
                if let Some(rule) =
                    state
                        .passthrough
                        .match_rule(account.platform.as_str(), status, &err_body)
                {
                    let response_code = if rule.passthrough_code {
                        status
                    } else {
                        rule.response_code.unwrap_or(status)
                    };
                    let message = if rule.passthrough_body {
                        extract_upstream_error_message(&err_body)
                            .unwrap_or_else(|| "Upstream request failed".to_string())
                    } else {
                        rule.custom_message.clone().unwrap_or_else(|| {
                            extract_upstream_error_message(&err_body)
                                .unwrap_or_else(|| "Upstream request failed".to_string())
                        })
                    };
                    sink.error(response_code, "upstream_error", &message).await;
                } else {
                    // No override: the provider's own 4xx reaches the client.
                    sink.json(status, err_body).await;
                }
                return;
            }
            Err(ForwardError::BodyTooLarge { limit }) => {
                account_guard.release();
                error!(
                    "upstream_response_body_too_large account_id={} limit={}",
                    account.id, limit
                );
                sink.error(502, "upstream_error", "Upstream response body too large").await;
                return;
            }
            Err(ForwardError::Internal(message)) => {
                account_guard.release();
                error!("forward_failed account_id={}: {}", account.id, message);
                sink.error(502, "upstream_error", "Upstream request failed").await;
                return;
            }
        }
    }
}

async fn handle_failover_exhausted(
    state: &AppState,
    sink: &ClientSink,
    failover: &UpstreamFailoverError,
) {
    if let Some(rule) = state
        .passthrough
        .match_rule("openai", failover.status_code, &failover.body)
    {
        let response_code = if rule.passthrough_code {
            failover.status_code
        } else {
            rule.response_code.unwrap_or(failover.status_code)
        };
        let message = if rule.passthrough_body {
            extract_upstream_error_message(&failover.body)
                .unwrap_or_else(|| "Upstream request failed".to_string())
        } else {
            rule.custom_message.clone().unwrap_or_else(|| {
                extract_upstream_error_message(&failover.body)
                    .unwrap_or_else(|| "Upstream request failed".to_string())
            })
        };
        sink.error(response_code, "upstream_error", &message).await;
        return;
    }

    let (status, err_type, canned) = map_upstream_error(failover.status_code);
    let message =
        extract_upstream_error_message(&failover.body).unwrap_or_else(|| canned.to_string());
    sink.error(status, err_type, &message).await;
}

#[allow(clippy::too_many_arguments)]
fn record_usage(
    state: &AppState,
    subject: &Subject,
    account_id: i64,
    meta: &RequestMeta,
    usage: Option<UsageTotals>,
    first_token_ms: Option<u64>,
    switch_count: usize,
    user_agent: &str,
) {
    let record = UsageRecord {
        user_id: subject.user_id,
        account_id,
        model: meta.model.clone(),
        stream: meta.stream,
        input_tokens: usage.map(|u| u.input_tokens).unwrap_or(0),
        output_tokens: usage.map(|u| u.output_tokens).unwrap_or(0),
        first_token_ms,
        switch_count,
        user_agent: user_agent.to_string(),
    };
    let recorder = state.usage.clone();
    // Detached from the request context so a slow sink never blocks replies.
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(USAGE_RECORD_TIMEOUT, recorder.record(record)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[E-USAGE-RECORD] record_usage_failed: {}", e),
            Err(_) => error!("[E-USAGE-RECORD] record_usage_timed_out"),
        }
    });
}
