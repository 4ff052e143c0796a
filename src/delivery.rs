//! Delivery gateway - outbound WhatsApp messages and webhook signatures
//!
//! The transport is a capability: deliver(to, text) -> success/failure.
//! The HTTP implementation speaks the vendor's message API; the null
//! implementation logs and succeeds so local development and tests run
//! without credentials.

use crate::config::Config;
use crate::error::{Error, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Proof of an accepted outbound message
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub sid: String,
}

pub trait DeliveryGateway: Send + Sync {
    fn deliver(&self, to: &str, body: &str) -> Result<DeliveryReceipt>;
}

/// Pick a gateway from config: HTTP when credentials are present, the
/// log-only null gateway otherwise.
pub fn from_config(config: &Config) -> Arc<dyn DeliveryGateway> {
    match (&config.gateway_account, &config.gateway_token) {
        (Some(account), Some(token)) => Arc::new(HttpGateway::new(
            &config.gateway_url,
            account,
            token,
            &config.gateway_sender,
        )),
        _ => {
            warn!("gateway credentials not configured, using log-only delivery");
            Arc::new(NullGateway::default())
        }
    }
}

/// Twilio-shaped HTTP gateway
pub struct HttpGateway {
    client: reqwest::blocking::Client,
    messages_url: String,
    account: String,
    token: String,
    sender: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, account: &str, token: &str, sender: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            client,
            messages_url: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                base_url.trim_end_matches('/'),
                account
            ),
            account: account.to_string(),
            token: token.to_string(),
            sender: sender.to_string(),
        }
    }
}

impl DeliveryGateway for HttpGateway {
    fn deliver(&self, to: &str, body: &str) -> Result<DeliveryReceipt> {
        // Patient rows hold bare E.164 numbers; the vendor wants the
        // channel prefix.
        let to = if to.starts_with("whatsapp:") {
            to.to_string()
        } else {
            format!("whatsapp:{}", to)
        };
        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account, Some(&self.token))
            .form(&[("From", self.sender.as_str()), ("To", to.as_str()), ("Body", body)])
            .send()
            .map_err(|e| Error::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(Error::Delivery(format!(
                "gateway returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .map_err(|e| Error::Delivery(format!("bad gateway response: {}", e)))?;
        let sid = payload["sid"].as_str().unwrap_or("unknown").to_string();
        Ok(DeliveryReceipt { sid })
    }
}

/// Log-only gateway for environments without credentials
#[derive(Default)]
pub struct NullGateway;

impl DeliveryGateway for NullGateway {
    fn deliver(&self, to: &str, body: &str) -> Result<DeliveryReceipt> {
        info!(to = to, "delivery disabled, would send: {}", body.chars().take(80).collect::<String>());
        Ok(DeliveryReceipt {
            sid: "disabled".to_string(),
        })
    }
}

/// In-memory gateway that records every send; failures can be scripted.
/// Used by the test suites.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("gateway lock").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("gateway lock").len()
    }
}

impl DeliveryGateway for RecordingGateway {
    fn deliver(&self, to: &str, body: &str) -> Result<DeliveryReceipt> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Delivery("scripted failure".to_string()));
        }
        let mut sent = self.sent.lock().expect("gateway lock");
        sent.push((to.to_string(), body.to_string()));
        Ok(DeliveryReceipt {
            sid: format!("rec-{}", sent.len()),
        })
    }
}

// ----------------------------------------------------------------------
// Webhook signatures
// ----------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Signature base string: URL followed by form params sorted by key,
/// each appended as key then value.
fn signature_base(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut base = String::from(url);
    for (key, value) in sorted {
        base.push_str(key);
        base.push_str(value);
    }
    base
}

/// Compute the expected signature for an inbound webhook request
pub fn compute_signature(secret: &str, url: &str, params: &[(String, String)]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signature_base(url, params).as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time validation of the signature header
pub fn verify_signature(
    secret: &str,
    url: &str,
    params: &[(String, String)],
    header: &str,
) -> bool {
    let expected = compute_signature(secret, url, params);
    expected.as_bytes().ct_eq(header.as_bytes()).into()
}
