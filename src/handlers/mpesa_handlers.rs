// handlers/mpesa_handlers.rs
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info};
use validator::Validate;

use crate::dtos::payment_dtos::{
    InitiatePaymentRequest, InitiatePaymentResponse, StatusQuery, TransactionStatusResponse,
};
use crate::errors::{AppError, Result};
use crate::state::AppState;

const CUSTOMER_MESSAGE: &str =
    "Payment request sent. Please check your phone to complete the payment.";

pub async fn initiate_stk_push(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InitiatePaymentRequest>, JsonRejection>,
) -> Result<Json<InitiatePaymentResponse>> {
    let Json(request) =
        payload.map_err(|e| AppError::invalid_data(format!("Invalid request body: {}", e)))?;

    info!(
        "Received STK push request for {} ({})",
        request.account_reference, request.transaction_desc
    );

    request.validate()?;
    let amount = request.amount()?;

    let payment = state
        .payments
        .initiate(
            &request.phone_number,
            amount,
            &request.account_reference,
            &request.transaction_desc,
        )
        .await
        .map_err(|e| {
            error!("Failed to initiate STK push: {}", e);
            e
        })?;

    Ok(Json(InitiatePaymentResponse {
        success: true,
        checkout_request_id: payment.checkout_request_id,
        merchant_request_id: payment.merchant_request_id,
        message: CUSTOMER_MESSAGE.to_string(),
    }))
}

/// Always 200 for a payload we could parse, whatever happened to the transaction.
pub async fn mpesa_callback(State(state): State<AppState>, body: Bytes) -> Response {
    match state.reconciler.handle_callback(&body).await {
        Ok(outcome) => {
            info!("Callback handled: {:?}", outcome);
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        Err(e) => {
            error!("Error processing M-Pesa callback: {}", e);
            e.into_response()
        }
    }
}

pub async fn check_transaction_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<TransactionStatusResponse>> {
    info!("Checking transaction status: {}", query.checkout_request_id);

    let txn = state
        .store
        .find_by_checkout_request_id(&query.checkout_request_id)
        .await?
        .ok_or_else(|| AppError::TransactionNotFound(query.checkout_request_id.clone()))?;

    Ok(Json(TransactionStatusResponse::from(txn)))
}
