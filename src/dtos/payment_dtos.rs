use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::models::transaction::{Transaction, TransactionStatus};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1, message = "phoneNumber is required"))]
    pub phone_number: String,

    /// Integer amount, either as a JSON number or a numeric string.
    pub amount: Value,

    #[validate(length(min = 1, max = 12, message = "accountReference must be 1-12 characters"))]
    pub account_reference: String,

    #[validate(length(min = 1, max = 13, message = "transactionDesc must be 1-13 characters"))]
    pub transaction_desc: String,
}

impl InitiatePaymentRequest {
    pub fn amount(&self) -> Result<i64> {
        let amount = match &self.amount {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| AppError::invalid_data("Amount must be a whole number"))?;

        if amount <= 0 {
            return Err(AppError::invalid_data("Amount must be greater than 0"));
        }
        Ok(amount)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub success: bool,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    #[serde(alias = "checkout_request_id")]
    pub checkout_request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub success: bool,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub account_reference: String,
    pub amount: i64,
    pub status: TransactionStatus,
    pub result_code: Option<i64>,
    pub result_description: Option<String>,
    pub receipt_number: Option<String>,
    pub updated_at: String,
}

impl From<Transaction> for TransactionStatusResponse {
    fn from(txn: Transaction) -> Self {
        TransactionStatusResponse {
            success: true,
            checkout_request_id: txn.checkout_request_id,
            merchant_request_id: txn.merchant_request_id,
            account_reference: txn.account_reference,
            amount: txn.amount,
            status: txn.status,
            result_code: txn.result_code,
            result_description: txn.result_description,
            receipt_number: txn.receipt_number,
            updated_at: txn.updated_at.to_rfc3339(),
        }
    }
}
