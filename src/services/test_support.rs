// Fakes shared by the service tests.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::services::mpesa_service::{StkPushGateway, StkPushRequest, StkPushResponse};
use crate::services::payment_service::PushSettings;
use crate::services::token_service::{AccessToken, TokenProvider};

pub fn settings() -> PushSettings {
    PushSettings {
        short_code: "174379".to_string(),
        passkey: "test-passkey".to_string(),
        callback_url: "https://example.com/api/mpesa/callback".to_string(),
    }
}

pub fn accepted(checkout_request_id: &str) -> StkPushResponse {
    StkPushResponse {
        merchant_request_id: format!("merchant-{}", checkout_request_id),
        checkout_request_id: checkout_request_id.to_string(),
        response_code: "0".to_string(),
        response_description: "Success. Request accepted for processing".to_string(),
        customer_message: "Success. Request accepted for processing".to_string(),
    }
}

pub fn rejected(description: &str) -> StkPushResponse {
    StkPushResponse {
        merchant_request_id: String::new(),
        checkout_request_id: String::new(),
        response_code: "1".to_string(),
        response_description: description.to_string(),
        customer_message: String::new(),
    }
}

/// Hands out `token-N`, bumping N on every invalidation.
#[derive(Default)]
pub struct StaticTokens {
    pub fail: bool,
    generation: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl StaticTokens {
    pub fn failing() -> Self {
        StaticTokens {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn get_token(&self) -> Result<AccessToken> {
        if self.fail {
            return Err(AppError::provider_auth("M-Pesa auth failed: 400 Bad Request"));
        }
        Ok(AccessToken {
            token: format!("token-{}", self.generation.load(Ordering::SeqCst)),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn invalidate(&self, _token: &str) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Replays scripted results in order and records what it was sent.
/// Once the script runs out every push is accepted with a fresh checkout id.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<StkPushResponse>>>,
    pub requests: Mutex<Vec<(String, StkPushRequest)>>,
    pub delay: Duration,
}

impl ScriptedGateway {
    pub fn with_script(script: Vec<Result<StkPushResponse>>) -> Self {
        ScriptedGateway {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        ScriptedGateway {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl StkPushGateway for ScriptedGateway {
    async fn stk_push(
        &self,
        access_token: &str,
        request: &StkPushRequest,
    ) -> Result<StkPushResponse> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((access_token.to_string(), request.clone()));
            requests.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(accepted(&format!("ws_CO_{}", n))))
    }
}
