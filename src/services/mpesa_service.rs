// services/mpesa_service.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::services::token_service::{AccessToken, TokenFetcher};

pub const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

// Daraja tokens live for an hour; anything past a day is a malformed response
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(deserialize_with = "seconds_from_string_or_number")]
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

impl StkPushResponse {
    pub fn is_accepted(&self) -> bool {
        self.response_code == "0"
    }
}

/// Error body Daraja returns with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub struct ProviderErrorResponse {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

/// The push half of the provider API.
#[async_trait]
pub trait StkPushGateway: Send + Sync {
    /// Sends one STK push. A 401 comes back as `ProviderAuthError` so the caller can refresh
    /// its token; every other failure is a `ProviderRequestError`.
    async fn stk_push(&self, access_token: &str, request: &StkPushRequest)
        -> Result<StkPushResponse>;
}

/// `YYYYMMDDHHMMSS`, second precision.
pub fn stk_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// base64(short code ‖ passkey ‖ timestamp). Bound to the timestamp, so built per request.
pub fn generate_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

/// HTTP client for the Daraja identity and STK push endpoints.
#[derive(Debug, Clone)]
pub struct MpesaService {
    consumer_key: String,
    consumer_secret: String,
    auth_url: String,
    stk_url: String,
    client: Client,
}

impl MpesaService {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let (auth_url, stk_url) = config.get_mpesa_urls();

        Ok(MpesaService {
            consumer_key: config.mpesa_consumer_key.clone(),
            consumer_secret: config.mpesa_consumer_secret.clone(),
            auth_url,
            stk_url,
            client,
        })
    }
}

#[async_trait]
impl TokenFetcher for MpesaService {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let auth_string = format!("{}:{}", self.consumer_key, self.consumer_secret);
        let encoded_auth = base64.encode(auth_string);

        let response = self
            .client
            .get(&self.auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await
            .map_err(|e| AppError::provider_auth(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get access token: {} - {}", status, body);
            return Err(AppError::provider_auth(format!("M-Pesa auth failed: {}", status)));
        }

        let auth_response: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::provider_auth(format!("malformed token response: {}", e)))?;

        Ok(AccessToken {
            token: auth_response.access_token,
            expires_at: token_expiry(Utc::now(), auth_response.expires_in)?,
        })
    }
}

pub fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&expires_in) {
        return Err(AppError::provider_auth(format!(
            "token expires_in out of range: {}",
            expires_in
        )));
    }
    Ok(now + chrono::Duration::seconds(expires_in))
}

#[async_trait]
impl StkPushGateway for MpesaService {
    async fn stk_push(
        &self,
        access_token: &str,
        request: &StkPushRequest,
    ) -> Result<StkPushResponse> {
        let response = self
            .client
            .post(&self.stk_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("STK push timed out: {}", e);
                    AppError::provider_request("M-Pesa did not respond in time, please retry")
                } else {
                    error!("STK push transport error: {}", e);
                    AppError::provider_request(format!("Could not reach M-Pesa: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::provider_auth("access token rejected"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::provider_request(format!("Failed to read M-Pesa response: {}", e)))?;

        if !status.is_success() {
            error!("STK push failed: {} - {}", status, body);
            let message = serde_json::from_str::<ProviderErrorResponse>(&body)
                .ok()
                .and_then(|err| err.error_message)
                .unwrap_or_else(|| format!("M-Pesa returned {}", status));
            return Err(AppError::provider_request(message));
        }

        let stk_response: StkPushResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Malformed STK push response: {} - {}", e, body);
            AppError::provider_request("Malformed response from M-Pesa")
        })?;

        info!(
            "STK push answered {}: {}",
            stk_response.response_code, stk_response.response_description
        );
        Ok(stk_response)
    }
}

fn seconds_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(i64),
        Text(String),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expires_in is not numeric: {}", s))),
    }
}
