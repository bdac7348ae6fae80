// models/transaction.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, Result};

/// Lifecycle of one STK push attempt.
///
/// `Initiated` only exists in memory between building the record and the provider
/// acknowledging the push. Everything persisted starts at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Initiated,
    Pending,
    Success,
    Failed,
    TimedOut,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "initiated",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success | TransactionStatus::Failed | TransactionStatus::TimedOut
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Initiated, TransactionStatus::Pending)
                | (TransactionStatus::Pending, TransactionStatus::Success)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
                | (TransactionStatus::Pending, TransactionStatus::TimedOut)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,

    // M-Pesa correlation ids, set once when the push is accepted
    pub checkout_request_id: String,
    pub merchant_request_id: String,

    pub phone_number: String,
    pub amount: i64,
    pub account_reference: String,
    pub description: String,

    pub status: TransactionStatus,

    // Filled on terminal resolution
    pub result_code: Option<i64>,
    pub result_description: Option<String>,
    pub receipt_number: Option<String>,
    pub provider_transaction_time: Option<String>,
    pub paid_amount: Option<i64>,
    pub payer_phone: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn initiated(
        phone_number: impl Into<String>,
        amount: i64,
        account_reference: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4().to_string(),
            checkout_request_id: String::new(),
            merchant_request_id: String::new(),
            phone_number: phone_number.into(),
            amount,
            account_reference: account_reference.into(),
            description: description.into(),
            status: TransactionStatus::Initiated,
            result_code: None,
            result_description: None,
            receipt_number: None,
            provider_transaction_time: None,
            paid_amount: None,
            payer_phone: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the provider's acknowledgment. Only valid once, from `Initiated`.
    pub fn accept(
        &mut self,
        checkout_request_id: impl Into<String>,
        merchant_request_id: impl Into<String>,
    ) -> Result<()> {
        if !self.status.can_transition_to(TransactionStatus::Pending) {
            return Err(AppError::invalid_data(format!(
                "transaction {} cannot be accepted from status {}",
                self.id, self.status
            )));
        }

        self.checkout_request_id = checkout_request_id.into();
        self.merchant_request_id = merchant_request_id.into();
        self.status = TransactionStatus::Pending;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Fields written by a single compare-and-set on a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpdate {
    pub status: TransactionStatus,
    pub result_code: Option<i64>,
    pub result_description: Option<String>,
    pub receipt_number: Option<String>,
    pub provider_transaction_time: Option<String>,
    pub paid_amount: Option<i64>,
    pub payer_phone: Option<String>,
}

impl TransactionUpdate {
    pub fn success(
        result_code: i64,
        result_description: impl Into<String>,
        receipt_number: Option<String>,
        provider_transaction_time: Option<String>,
        paid_amount: Option<i64>,
        payer_phone: Option<String>,
    ) -> Self {
        TransactionUpdate {
            status: TransactionStatus::Success,
            result_code: Some(result_code),
            result_description: Some(result_description.into()),
            receipt_number,
            provider_transaction_time,
            paid_amount,
            payer_phone,
        }
    }

    pub fn failed(result_code: i64, result_description: impl Into<String>) -> Self {
        TransactionUpdate {
            status: TransactionStatus::Failed,
            result_code: Some(result_code),
            result_description: Some(result_description.into()),
            receipt_number: None,
            provider_transaction_time: None,
            paid_amount: None,
            payer_phone: None,
        }
    }

    pub fn timed_out(result_description: impl Into<String>) -> Self {
        TransactionUpdate {
            status: TransactionStatus::TimedOut,
            result_code: None,
            result_description: Some(result_description.into()),
            receipt_number: None,
            provider_transaction_time: None,
            paid_amount: None,
            payer_phone: None,
        }
    }

    pub fn apply_to(&self, txn: &mut Transaction, now: DateTime<Utc>) {
        txn.status = self.status;
        txn.result_code = self.result_code;
        txn.result_description = self.result_description.clone();
        txn.receipt_number = self.receipt_number.clone();
        txn.provider_transaction_time = self.provider_transaction_time.clone();
        txn.paid_amount = self.paid_amount;
        txn.payer_phone = self.payer_phone.clone();
        txn.updated_at = now;
    }
}
