//! HTTP surface: cron trigger endpoints and the inbound webhook
//!
//! Both cron endpoints require the shared bearer secret and reject at the
//! boundary with no side effects. The webhook validates the gateway
//! signature, persists the inbound row, acknowledges with an empty TwiML
//! document, and hands processing to a background task that stamps the
//! row's completion marker when done.

use crate::assistant::{DisabledGenerator, ReplyGenerator};
use crate::config::Config;
use crate::delivery::{self, DeliveryGateway};
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::reply::ReplyRouter;
use crate::scheduler::{with_retry, QueueScheduler, RetryPolicy};
use crate::store::Store;
use crate::sweeper::MissedCheckinSweeper;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

const TWIML_EMPTY: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;
const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Mutex<Store>>,
    pub gateway: Arc<dyn DeliveryGateway>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub limiter: Arc<Mutex<RateLimiter>>,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self> {
        if config.cron_secret.is_none() {
            return Err(Error::Config(
                "CRON_SECRET is required to serve".to_string(),
            ));
        }
        let store = Store::open(&config.db_path)?;
        let gateway = delivery::from_config(&config);
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window_secs);
        Ok(Self {
            config,
            store: Arc::new(Mutex::new(store)),
            gateway,
            generator: Arc::new(DisabledGenerator),
            limiter: Arc::new(Mutex::new(limiter)),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/cron/queue", get(cron_queue).post(cron_queue))
        .route("/cron/sweep", get(cron_sweep).post(cron_sweep))
        .route("/webhook/whatsapp", post(webhook))
        .with_state(state)
}

/// Bind and serve until shutdown
pub async fn serve(state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .map_err(Error::Io)?;
    info!(addr = %state.config.bind_addr, "listening");
    axum::serve(listener, router(state)).await.map_err(Error::Io)
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.as_bytes().ct_eq(secret.as_bytes()).into())
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": "unauthorized"})),
    )
        .into_response()
}

fn job_failure(err: &Error) -> Response {
    error!("cron job failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": err.to_string()})),
    )
        .into_response()
}

/// Counts + success + timestamp envelope for the cron endpoints
fn job_success(report: impl serde::Serialize) -> Response {
    let mut body = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
    if let Some(obj) = body.as_object_mut() {
        obj.insert("success".to_string(), json!(true));
        obj.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    }
    Json(body).into_response()
}

async fn cron_queue(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.config.cron_secret.as_deref()) {
        return unauthorized();
    }

    let policy = RetryPolicy::new(
        state.config.retry_max_attempts,
        state.config.retry_initial_delay_ms,
    );
    let store = state.store.clone();
    let gateway = state.gateway.clone();

    let result = tokio::task::spawn_blocking(move || {
        with_retry(policy, || {
            let store = store.lock().map_err(|_| Error::Config("store lock poisoned".into()))?;
            QueueScheduler::new(&store, gateway.as_ref()).run_pass(Utc::now())
        })
    })
    .await;

    match result {
        Ok(Ok(report)) => job_success(report),
        Ok(Err(e)) => job_failure(&e),
        Err(e) => job_failure(&Error::Config(format!("job panicked: {}", e))),
    }
}

async fn cron_sweep(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.config.cron_secret.as_deref()) {
        return unauthorized();
    }

    let store = state.store.clone();
    let gateway = state.gateway.clone();
    let stale = state.config.checkin_stale_hours;
    let window = state.config.reminder_window_hours;

    let result = tokio::task::spawn_blocking(move || {
        let store = store.lock().map_err(|_| Error::Config("store lock poisoned".into()))?;
        MissedCheckinSweeper::new(&store, gateway.as_ref(), stale, window).run(Utc::now())
    })
    .await;

    match result {
        Ok(Ok(report)) => job_success(report),
        Ok(Err(e)) => job_failure(&e),
        Err(e) => job_failure(&Error::Config(format!("job panicked: {}", e))),
    }
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if let Some(secret) = &state.config.webhook_secret {
        let header_value = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !delivery::verify_signature(secret, &state.config.webhook_url, &params, header_value) {
            warn!("webhook signature rejected");
            return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
        }
    }

    let field = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    let (from, body) = match (field("From"), field("Body")) {
        (Some(f), Some(b)) if !f.is_empty() && !b.is_empty() => (f, b),
        _ => return (StatusCode::BAD_REQUEST, "missing From or Body").into_response(),
    };
    let profile_name = field("ProfileName").unwrap_or_default();

    let now = Utc::now();

    // Best-effort throttle; over-limit messages are acked and dropped.
    {
        let mut limiter = match state.limiter.lock() {
            Ok(l) => l,
            Err(_) => return twiml_ack(),
        };
        limiter.prune(now);
        if !limiter.allow(&from, now) {
            warn!(from = %from, "rate limited, dropping inbound");
            return twiml_ack();
        }
    }

    // Persist the inbound row before acknowledging, so a restart between
    // ack and processing leaves a replayable record instead of silence.
    let recorded = {
        let store = state.store.clone();
        let gateway = state.gateway.clone();
        let generator = state.generator.clone();
        let weigh_day = state.config.weigh_day;
        let from = from.clone();
        let body = body.clone();
        tokio::task::spawn_blocking(move || {
            let store = store
                .lock()
                .map_err(|_| Error::Config("store lock poisoned".into()))?;
            let router = ReplyRouter::new(&store, gateway.as_ref(), generator.as_ref(), weigh_day);
            router.record_inbound(&from, &body, now)
        })
        .await
    };

    let (patient, message_id) = match recorded {
        Ok(Ok(Some(pair))) => pair,
        Ok(Ok(None)) => return twiml_ack(),
        Ok(Err(e)) => {
            error!("failed to persist inbound: {}", e);
            return twiml_ack();
        }
        Err(e) => {
            error!("inbound persist task panicked: {}", e);
            return twiml_ack();
        }
    };

    info!(
        patient = patient.id,
        profile = %profile_name,
        "inbound accepted, processing in background"
    );

    // Detached processing; the completion marker is the recovery contract.
    let store = state.store.clone();
    let gateway = state.gateway.clone();
    let generator = state.generator.clone();
    let weigh_day = state.config.weigh_day;
    tokio::task::spawn_blocking(move || {
        let store = match store.lock() {
            Ok(s) => s,
            Err(_) => {
                error!("store lock poisoned, inbound {} left for replay", message_id);
                return;
            }
        };
        let router = ReplyRouter::new(&store, gateway.as_ref(), generator.as_ref(), weigh_day);
        if let Err(e) = router.process(&patient, message_id, &body, now) {
            error!(message = message_id, "inbound processing failed: {}", e);
        }
    });

    twiml_ack()
}

fn twiml_ack() -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml")],
        TWIML_EMPTY,
    )
        .into_response()
}
