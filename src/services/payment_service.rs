// services/payment_service.rs
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::database::TransactionStore;
use crate::errors::{AppError, Result};
use crate::models::transaction::Transaction;
use crate::services::mpesa_service::{
    generate_password, stk_timestamp, StkPushGateway, StkPushRequest, StkPushResponse,
    TRANSACTION_TYPE,
};
use crate::services::phone;
use crate::services::token_service::TokenProvider;

// Daraja field limits
const MAX_ACCOUNT_REFERENCE_LEN: usize = 12;
const MAX_DESCRIPTION_LEN: usize = 13;

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
}

impl From<&AppConfig> for PushSettings {
    fn from(config: &AppConfig) -> Self {
        PushSettings {
            short_code: config.mpesa_short_code.clone(),
            passkey: config.mpesa_passkey.clone(),
            callback_url: config.mpesa_callback_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedPayment {
    pub transaction_id: String,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    /// True when an open transaction for the same account reference was returned instead of
    /// pushing a new prompt.
    pub reused: bool,
}

impl InitiatedPayment {
    fn from_transaction(txn: &Transaction, reused: bool) -> Self {
        InitiatedPayment {
            transaction_id: txn.id.clone(),
            checkout_request_id: txn.checkout_request_id.clone(),
            merchant_request_id: txn.merchant_request_id.clone(),
            reused,
        }
    }
}

type ReferenceLockTable = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Per-account-reference async locks. Entries are dropped when their last holder leaves.
#[derive(Default, Clone)]
struct ReferenceLocks {
    locks: Arc<Mutex<ReferenceLockTable>>,
}

struct ReferenceGuard {
    table: ReferenceLocks,
    key: String,
    entry: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl ReferenceLocks {
    async fn acquire(&self, key: &str) -> ReferenceGuard {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = entry.clone().lock_owned().await;

        ReferenceGuard {
            table: self.clone(),
            key: key.to_string(),
            entry,
            guard: Some(guard),
        }
    }
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.table.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // table + this guard; anyone else waiting holds another clone
        if Arc::strong_count(&self.entry) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Starts STK pushes and records the accepted ones.
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn TransactionStore>,
    tokens: Arc<dyn TokenProvider>,
    gateway: Arc<dyn StkPushGateway>,
    settings: PushSettings,
    reference_locks: ReferenceLocks,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        tokens: Arc<dyn TokenProvider>,
        gateway: Arc<dyn StkPushGateway>,
        settings: PushSettings,
    ) -> Self {
        PaymentService {
            store,
            tokens,
            gateway,
            settings,
            reference_locks: ReferenceLocks::default(),
        }
    }

    pub async fn initiate(
        &self,
        phone_raw: &str,
        amount: i64,
        account_reference: &str,
        description: &str,
    ) -> Result<InitiatedPayment> {
        if amount <= 0 {
            return Err(AppError::invalid_data("Amount must be greater than 0"));
        }
        let account_reference = account_reference.trim();
        let description = description.trim();
        check_length("accountReference", account_reference, MAX_ACCOUNT_REFERENCE_LEN)?;
        check_length("transactionDesc", description, MAX_DESCRIPTION_LEN)?;

        let phone_number = phone::normalize(phone_raw)?;

        info!("C2B: STK push for {} - KSh {} ({})", phone_number, amount, account_reference);

        // Detached from the caller: once a push is sent, dropping the request must not skip
        // the `create` that records it.
        let service = self.clone();
        let account_reference = account_reference.to_string();
        let description = description.to_string();
        tokio::spawn(async move {
            service
                .push_and_record(phone_number, amount, &account_reference, &description)
                .await
        })
        .await
        .map_err(|e| AppError::service(format!("STK push task failed: {}", e)))?
    }

    async fn push_and_record(
        &self,
        phone_number: String,
        amount: i64,
        account_reference: &str,
        description: &str,
    ) -> Result<InitiatedPayment> {
        let _reference_guard = self.reference_locks.acquire(account_reference).await;

        if let Some(existing) = self
            .store
            .find_open_by_account_reference(account_reference)
            .await?
        {
            info!(
                "Reusing open transaction {} for {}",
                existing.checkout_request_id, account_reference
            );
            return Ok(InitiatedPayment::from_transaction(&existing, true));
        }

        let mut txn = Transaction::initiated(phone_number, amount, account_reference, description);

        let response = self.push_with_refresh(&txn).await?;
        if !response.is_accepted() {
            warn!(
                "STK push rejected for {}: {} {}",
                account_reference, response.response_code, response.response_description
            );
            let reason = if response.response_description.is_empty() {
                "Failed to initiate payment".to_string()
            } else {
                response.response_description
            };
            return Err(AppError::provider_request(reason));
        }
        if response.checkout_request_id.is_empty() {
            error!("STK push accepted without a CheckoutRequestID");
            return Err(AppError::provider_request(
                "M-Pesa accepted the request without a CheckoutRequestID",
            ));
        }

        txn.accept(response.checkout_request_id, response.merchant_request_id)?;

        // Must be visible before the id leaves this process; the callback may be close behind
        match self.store.create(txn.clone()).await {
            Ok(()) => {}
            Err(AppError::DuplicateTransaction(reason)) => {
                error!(
                    "Push {} accepted but {} already has an open transaction: {}",
                    txn.checkout_request_id, account_reference, reason
                );
                if let Some(existing) = self
                    .store
                    .find_open_by_account_reference(account_reference)
                    .await?
                {
                    return Ok(InitiatedPayment::from_transaction(&existing, true));
                }
                return Err(AppError::DuplicateTransaction(reason));
            }
            Err(e) => return Err(e),
        }

        info!("C2B initiated: {} ({})", txn.checkout_request_id, txn.id);
        Ok(InitiatedPayment::from_transaction(&txn, false))
    }

    async fn push_with_refresh(&self, txn: &Transaction) -> Result<StkPushResponse> {
        let token = self.tokens.get_token().await?;

        match self.send_push(&token.token, txn).await {
            Err(AppError::ProviderAuthError(reason)) => {
                // A 401 means nothing was accepted, so one retry cannot double-charge
                warn!("Access token rejected ({}), refreshing and retrying once", reason);
                self.tokens.invalidate(&token.token).await;
                let fresh = self.tokens.get_token().await?;
                self.send_push(&fresh.token, txn).await
            }
            other => other,
        }
    }

    async fn send_push(&self, access_token: &str, txn: &Transaction) -> Result<StkPushResponse> {
        let request = self.build_request(txn);
        self.gateway.stk_push(access_token, &request).await
    }

    fn build_request(&self, txn: &Transaction) -> StkPushRequest {
        let timestamp = stk_timestamp(Utc::now());
        let password =
            generate_password(&self.settings.short_code, &self.settings.passkey, &timestamp);

        StkPushRequest {
            business_short_code: self.settings.short_code.clone(),
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE.to_string(),
            amount: txn.amount,
            party_a: txn.phone_number.clone(),
            party_b: self.settings.short_code.clone(),
            phone_number: txn.phone_number.clone(),
            callback_url: self.settings.callback_url.clone(),
            account_reference: txn.account_reference.clone(),
            transaction_desc: txn.description.clone(),
        }
    }
}

fn check_length(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(AppError::invalid_data(format!(
            "{} must be between 1 and {} characters",
            field, max
        )));
    }
    Ok(())
}
